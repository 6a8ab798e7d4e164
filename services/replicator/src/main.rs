// replicator: cross-site logical replication controller.

use tracing::info;

use replicator::config;
use replicator::controller::Controller;
use replicator::db::DbGateway;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "replicator starting");

    let cfg = match config::load_config() {
        Ok(cfg) => {
            info!(
                mode = ?cfg.replication.mode,
                source = %cfg.replication.source,
                server = %cfg.replication.server,
                "config loaded"
            );
            cfg
        }
        Err(e) => {
            eprintln!("FATAL: failed to load config: {e}");
            std::process::exit(1);
        }
    };

    let credentials = match config::load_oauth2_credentials(&cfg.replication.oauth2) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("FATAL: failed to load oauth2 credentials: {e}");
            std::process::exit(1);
        }
    };

    let db = match DbGateway::connect(&cfg.database.url, cfg.database.pool_min).await {
        Ok(db) => db,
        Err(e) => {
            eprintln!("FATAL: failed to connect to database: {e}");
            std::process::exit(1);
        }
    };

    let controller = Controller::new(&cfg, credentials, db);
    controller.run().await;

    info!("replicator stopped");
}
