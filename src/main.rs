//! Minimal runnable entry point (§AMBIENT.5): wires configuration, logging,
//! the store connection, and the engine together, then drives the
//! demonstration stdin ingress until a termination signal arrives.

use delayecho::logging::{setup_logging, LoggingConfig};
use delayecho::{Component, DispatchEngine, EngineConfig, RedisGateway};
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = EngineConfig::load()?;
    setup_logging(LoggingConfig::from(&config))?;

    let store = RedisGateway::connect(&config.store_url).await?;
    let mut engine = DispatchEngine::new(store, config);

    engine.init().await?;
    engine.start().await?;
    info!("dispatch engine running");

    let mut fatal_signal = engine.fatal_signal();
    let engine = Arc::new(engine);
    let ingress_engine = Arc::clone(&engine);
    let mut ingress_task = tokio::spawn(async move {
        delayecho::ingress::run_stdin_ingress(ingress_engine, tokio::io::stdin()).await;
    });
    let ingress_abort = ingress_task.abort_handle();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("termination signal received, shutting down");
            ingress_abort.abort();
            let _ = (&mut ingress_task).await;
        }
        _ = &mut ingress_task => {
            info!("stdin ingress closed, shutting down");
        }
        // §7's fatal-exit hook: a background task gave up on an
        // unrecoverable condition after startup (e.g. the freshness
        // subscription could not be restored). Tear down rather than keep
        // serving with a replica that can no longer learn new minima.
        Ok(()) = fatal_signal.changed() => {
            error!("engine reported a fatal condition, shutting down");
            ingress_abort.abort();
            let _ = (&mut ingress_task).await;
        }
    }

    // The ingress task (and its clone of `engine`) has now fully exited in
    // both branches above, so exactly one strong reference remains here.
    match Arc::try_unwrap(engine) {
        Ok(mut engine) => {
            if let Err(e) = engine.shutdown().await {
                error!(error = %e, "error during shutdown");
            }
        }
        Err(engine) => {
            error!(
                healthy = engine.health_check().await.is_ok(),
                "engine handle still shared at shutdown, skipping graceful teardown"
            );
        }
    }

    Ok(())
}
