//! The short, self-checking demonstrations.

use broker::{
    Broker, ConsumeOptions, Delivery, ExchangeKind, Headers, PublishOptions, QueueOptions,
    RetryOutcome, RetryPolicy, RetryPublisher, StreamOffset, Subscription,
};
use eyre::{OptionExt, Result, WrapErr, ensure};
use serde_json::json;
use std::time::Duration;
use tracing::{info, warn};

const RECEIVE_TIMEOUT: Duration = Duration::from_secs(2);

async fn receive(subscription: &mut Subscription) -> Result<Delivery> {
    tokio::time::timeout(RECEIVE_TIMEOUT, subscription.recv())
        .await
        .wrap_err_with(|| format!("No delivery on '{}'", subscription.queue()))?
        .ok_or_eyre("Subscription closed")
}

fn text(delivery: &Delivery) -> &str {
    delivery.message.body_str().unwrap_or("<binary>")
}

pub async fn basics(broker: &Broker) -> Result<()> {
    broker.declare_exchange("emails", ExchangeKind::Direct, None)?;
    for (queue, key) in [
        ("email.notifications", "notification"),
        ("password.notifications", "resetpassword"),
    ] {
        broker.declare_queue(queue, QueueOptions::new().durable(true))?;
        broker.bind(queue, "emails", key)?;
    }

    for (key, body) in [
        ("notification", "Your order has shipped"),
        ("resetpassword", "Reset link: https://example.invalid/reset"),
    ] {
        let route = broker.publish("emails", key, body, PublishOptions::new().persistent(true))?;
        info!(routing_key = %key, outcome = route.outcome(), queues = ?route.queues(), "Published");
    }

    for queue in ["email.notifications", "password.notifications"] {
        let mut subscription = broker.subscribe(queue, ConsumeOptions::new().with_prefetch(1))?;
        let delivery = receive(&mut subscription).await?;
        info!(queue = %queue, body = %text(&delivery), "Received");
        subscription.ack(&delivery)?;
    }
    Ok(())
}

pub async fn alternate_exchange(broker: &Broker) -> Result<()> {
    broker.declare_exchange("alternate_exchange", ExchangeKind::Fanout, None)?;
    broker.declare_exchange("main_exchange", ExchangeKind::Direct, Some("alternate_exchange"))?;
    broker.declare_queue("main_queue", QueueOptions::new().durable(true))?;
    broker.declare_queue("unrouted_queue", QueueOptions::new().durable(true))?;
    broker.bind("main_queue", "main_exchange", "valid_key")?;
    broker.bind("unrouted_queue", "alternate_exchange", "")?;

    for key in ["valid_key", "invalid_key"] {
        let options = PublishOptions::new()
            .mandatory(true)
            .with_headers(Headers::new().with_original_routing_key(key));
        let route = broker.publish("main_exchange", key, format!("sent with {key}"), options)?;
        info!(routing_key = %key, outcome = route.outcome(), queues = ?route.queues(), "Published");
    }

    let mut unrouted = broker.subscribe("unrouted_queue", ConsumeOptions::new().with_prefetch(1))?;
    let delivery = receive(&mut unrouted).await?;
    info!(
        body = %text(&delivery),
        original_routing_key = ?delivery.message.headers.original_routing_key,
        "Unroutable message caught by alternate exchange"
    );
    unrouted.ack(&delivery)?;

    broker.declare_exchange("strict_exchange", ExchangeKind::Direct, None)?;
    let mandatory = PublishOptions::new().mandatory(true);
    let returned = broker.publish("strict_exchange", "nobody", "lost", mandatory)?;
    if let Err(e) = returned.require_routed("strict_exchange", "nobody") {
        warn!(error = %e, "Mandatory publish returned");
    }
    Ok(())
}

pub async fn dead_letter(broker: &Broker) -> Result<()> {
    broker.declare_exchange("main_exchange", ExchangeKind::Direct, None)?;
    broker.declare_exchange("dlx_exchange", ExchangeKind::Direct, None)?;
    let arguments = json!({
        "x-dead-letter-exchange": "dlx_exchange",
        "x-dead-letter-routing-key": "main_queue",
    });
    let arguments = arguments.as_object().ok_or_eyre("arguments must be a table")?;
    broker.declare_queue_with_arguments("main_queue", true, arguments)?;
    broker.declare_queue("dlx_queue", QueueOptions::new().durable(true))?;
    broker.bind("main_queue", "main_exchange", "main_queue")?;
    broker.bind("dlx_queue", "dlx_exchange", "main_queue")?;

    broker.publish("main_exchange", "main_queue", "This will be rejected", PublishOptions::new())?;

    let mut main = broker.subscribe("main_queue", ConsumeOptions::new().with_prefetch(1))?;
    let delivery = receive(&mut main).await?;
    info!(body = %text(&delivery), "Rejecting without requeue");
    main.reject(&delivery, false)?;

    let mut dead = broker.subscribe("dlx_queue", ConsumeOptions::new().with_prefetch(1))?;
    let delivery = receive(&mut dead).await?;
    ensure!(
        delivery.message.headers.death.len() == 1,
        "expected exactly one x-death entry"
    );
    info!(
        body = %text(&delivery),
        headers = %delivery.message.headers.to_table(),
        "Dead-lettered message received"
    );
    dead.ack(&delivery)?;
    Ok(())
}

pub async fn prefetch(broker: &Broker) -> Result<()> {
    const PREFETCH: u16 = 2;
    broker.declare_queue("work", QueueOptions::new().durable(true))?;
    for i in 1..=5 {
        broker.publish("", "work", format!("Message {i}"), PublishOptions::new())?;
    }

    let mut subscription = broker.subscribe("work", ConsumeOptions::new().with_prefetch(PREFETCH))?;
    for _ in 0..5 {
        let delivery = receive(&mut subscription).await?;
        let info = broker.queue_info("work")?;
        ensure!(
            info.messages_unacked <= usize::from(PREFETCH),
            "prefetch window exceeded: {} unacked",
            info.messages_unacked
        );
        info!(
            body = %text(&delivery),
            unacked = info.messages_unacked,
            ready = info.messages_ready,
            "Processing"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        subscription.ack(&delivery)?;
    }
    Ok(())
}

pub async fn stream(broker: &Broker) -> Result<()> {
    let arguments = json!({
        "x-queue-type": "stream",
        "x-max-length-bytes": 524_288_000u64,
        "x-max-age": "7D",
        "x-stream-max-segment-size-bytes": 52_428_800u64,
        "x-initial-cluster-size": 3,
    });
    let arguments = arguments.as_object().ok_or_eyre("arguments must be a table")?;
    broker.declare_queue_with_arguments("my_stream", true, arguments)?;

    for i in 0..10 {
        broker.publish("", "my_stream", format!("Event {i}"), PublishOptions::new())?;
    }

    for (label, offset, expected) in [
        ("first", StreamOffset::First, 10),
        ("offset 5", StreamOffset::Offset(5), 5),
        ("last", StreamOffset::Last, 1),
    ] {
        let mut reader = broker.subscribe(
            "my_stream",
            ConsumeOptions::new().with_prefetch(10).with_offset(offset),
        )?;
        let mut offsets = Vec::with_capacity(expected);
        for _ in 0..expected {
            let delivery = receive(&mut reader).await?;
            offsets.push(delivery.offset);
            reader.ack(&delivery)?;
        }
        info!(from = %label, offsets = ?offsets, "Replayed stream");
    }

    let mut tail = broker.subscribe("my_stream", ConsumeOptions::new().with_prefetch(10))?;
    broker.publish("", "my_stream", "Event 10", PublishOptions::new())?;
    let delivery = receive(&mut tail).await?;
    info!(offset = delivery.offset, body = %text(&delivery), "Tail reader saw only the new event");
    tail.ack(&delivery)?;

    let info = broker.queue_info("my_stream")?;
    info!(
        first_offset = ?info.first_offset,
        next_offset = info.next_offset,
        bytes = info.total_bytes,
        "Stream retained"
    );
    Ok(())
}

pub async fn retry(broker: &Broker) -> Result<()> {
    broker.declare_exchange("retry_exchange", ExchangeKind::Direct, None)?;
    broker.declare_exchange("dlx_exchange", ExchangeKind::Fanout, None)?;
    broker.declare_queue(
        "main_queue",
        QueueOptions::new().durable(true).with_dead_letter("dlx_exchange", None),
    )?;
    broker.declare_queue("dlx_queue", QueueOptions::new().durable(true))?;
    broker.bind("main_queue", "retry_exchange", "main_queue")?;
    broker.bind("dlx_queue", "dlx_exchange", "")?;

    broker.publish("", "main_queue", "Always fails", PublishOptions::new())?;

    let publisher = RetryPublisher::new(broker.clone(), "retry_exchange", RetryPolicy::default());
    let mut main = broker.subscribe("main_queue", ConsumeOptions::new().with_prefetch(1))?;
    let mut dead = broker.subscribe("dlx_queue", ConsumeOptions::new().with_prefetch(1))?;

    loop {
        let delivery = receive(&mut main).await?;
        info!(
            retry_count = ?delivery.message.headers.retry_count,
            "Processing failed, rejecting"
        );
        main.reject(&delivery, false)?;

        let failed = receive(&mut dead).await?;
        let outcome = publisher.retry(&failed.message, None)?;
        dead.ack(&failed)?;
        match outcome {
            RetryOutcome::Republished { attempt, .. } => info!(attempt, "Retrying"),
            RetryOutcome::Exhausted { attempts } => {
                info!(attempts, deaths = failed.message.headers.death.len(), "Giving up");
                break;
            }
        }
    }
    Ok(())
}
