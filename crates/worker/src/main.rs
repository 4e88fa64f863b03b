//! Runs one consumer loop against the AMQP broker until SIGINT/SIGTERM.

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use orpheon_infra::{ConsumerConfig, HttpProcessor, JobConsumer, PipelineConfig};
use orpheon_messaging::{AmqpBroker, Broker, Topology};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    orpheon_observability::init();

    let config = PipelineConfig::from_env().context("invalid pipeline configuration")?;

    let broker = AmqpBroker::connect(&config.amqp_url)
        .await
        .context("failed to connect to broker")?;
    broker
        .declare(&Topology::with_retry_delay(config.retry_delay))
        .await
        .context("failed to declare broker topology")?;
    let broker: Arc<dyn Broker> = Arc::new(broker);

    let processor = HttpProcessor::new(&config.processor_url, config.processor_timeout)
        .context("failed to build processor client")?;
    info!(
        worker = %config.worker_name,
        processor = %processor.endpoint(),
        max_retries = config.retry.max_retries,
        retry_delay_ms = config.retry_delay.as_millis() as u64,
        "worker starting"
    );

    let handle = JobConsumer::new(
        broker.clone(),
        Arc::new(processor),
        ConsumerConfig::from(&config),
    )
    .spawn();

    let token = handle.shutdown_token();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received; draining in-flight delivery");
        token.cancel();
    });

    let result = handle.join().await;

    if let Err(e) = broker.close().await {
        warn!(error = %e, "broker close failed");
    }

    let stats = result.context("consumer loop failed")?;
    info!(
        received = stats.received,
        succeeded = stats.succeeded,
        retried = stats.retried,
        dead_lettered = stats.dead_lettered,
        "worker stopped"
    );
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
