//! Worker process: runs a pool of queue workers until Ctrl-C.
//!
//! Configuration comes from the environment, see `RunnerConfig::from_env`
//! and `DbConfig::from_env`.

use std::sync::Arc;

use actors::{Queue, QueueWorkerFactory, RunnerConfig, start_runner};
use db::{DbConfig, SurrealStore};

mod handlers;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let config = RunnerConfig::from_env()?;
    let store = SurrealStore::connect(&DbConfig::from_env()).await?;
    let queue = Queue::new(Arc::new(store), config.queue_path.clone());

    let processor = Arc::new(handlers::demo_handlers());
    let factory =
        QueueWorkerFactory::new(queue.clone(), processor).with_config(config.worker.clone());
    let runner = start_runner(factory).await?;
    runner.set_number_of_workers(config.workers).await?;
    tracing::info!("Running {} workers on {}", config.workers, queue.base());

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down...");
    runner.shutdown().await;

    Ok(())
}
