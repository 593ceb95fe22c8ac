//! Long-running worker scenario with graceful shutdown.

use async_trait::async_trait;
use broker::{
    Broker, ConsumeOptions, ConsumerWorker, Delivery, ExchangeKind, ProcessingError, Processor,
    PublishOptions, QueueOptions,
};
use eyre::{Result, WrapErr};
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

/// Fails every seventh message once, and anything marked as poison for good.
struct DemoProcessor;

#[async_trait]
impl Processor for DemoProcessor {
    async fn process(&self, delivery: &Delivery) -> Result<(), ProcessingError> {
        let body = delivery.message.body_str().unwrap_or_default();
        if body.starts_with("poison") {
            return Err(ProcessingError::permanent(format!("cannot handle '{body}'")));
        }
        let index: usize = body
            .rsplit(' ')
            .next()
            .and_then(|n| n.parse().ok())
            .unwrap_or(0);
        if index % 7 == 0 && !delivery.redelivered {
            return Err(ProcessingError::transient("simulated timeout"));
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
        info!(tag = delivery.tag, body = %body, "Processed");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "demo"
    }
}

pub async fn run(broker: &Broker, messages: usize) -> Result<()> {
    broker.declare_exchange("jobs.dlx", ExchangeKind::Fanout, None)?;
    broker.declare_queue(
        "jobs",
        QueueOptions::new().durable(true).with_dead_letter("jobs.dlx", None),
    )?;
    broker.declare_queue("jobs.dead", QueueOptions::new().durable(true))?;
    broker.bind("jobs.dead", "jobs.dlx", "")?;

    for i in 1..=messages {
        broker.publish("", "jobs", format!("job {i}"), PublishOptions::new().persistent(true))?;
    }
    broker.publish("", "jobs", "poison pill", PublishOptions::new())?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = shutdown_signal().await {
            error!("Error waiting for shutdown signal: {}", e);
        }
        let _ = shutdown_tx.send(true);
    });

    let sweeper = broker.spawn_retention_sweeper(shutdown_rx.clone());

    let subscription = broker
        .subscribe("jobs", ConsumeOptions::new().with_tag("demo-worker").with_prefetch(4))
        .wrap_err("Failed to subscribe worker")?;
    let worker = ConsumerWorker::new(subscription, DemoProcessor)
        .with_max_backoff(Duration::from_millis(500));

    info!("Worker running, press Ctrl+C to stop");
    let stats = worker.run(shutdown_rx).await;
    sweeper.await.wrap_err("Retention sweeper panicked")?;

    info!(
        processed = stats.processed,
        requeued = stats.requeued,
        rejected = stats.rejected,
        dead_lettered = broker.queue_info("jobs.dead")?.messages_ready,
        "Worker stopped"
    );
    Ok(())
}

/// Wait for a shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() -> Result<()> {
    let ctrl_c = signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())
            .wrap_err("Failed to install SIGTERM handler")?;
        tokio::select! {
            result = ctrl_c => {
                result.wrap_err("Failed to listen for Ctrl+C")?;
                info!("Received Ctrl+C, initiating shutdown...");
            }
            _ = terminate.recv() => {
                info!("Received SIGTERM, initiating shutdown...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.wrap_err("Failed to listen for Ctrl+C")?;
        info!("Received Ctrl+C, initiating shutdown...");
    }

    Ok(())
}
