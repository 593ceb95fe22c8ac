//! Periodic retention sweep over stream queues.
//!
//! Size limits are also enforced on every append; the sweep is what evicts
//! segments that age out while no one is publishing.

use crate::broker::Broker;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

impl Broker {
    /// Apply retention to every stream queue now. Returns evicted message count.
    pub fn sweep_retention(&self) -> usize {
        self.sweep_retention_at(Utc::now())
    }

    /// Apply retention as if the current time were `now`.
    pub fn sweep_retention_at(&self, now: DateTime<Utc>) -> usize {
        self.inner()
            .queues()
            .iter()
            .filter(|queue| queue.options().is_stream())
            .map(|queue| {
                let evicted = queue.sweep(now);
                if evicted > 0 {
                    info!(queue = %queue.name(), evicted, "Retention evicted stream segments");
                }
                evicted
            })
            .sum()
    }

    /// Run [`Broker::sweep_retention`] every `retention_sweep_interval` until
    /// `shutdown` flips to `true` or its sender is dropped.
    pub fn spawn_retention_sweeper(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let broker = self.clone();
        let period = self.config().retention_sweep_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_ms = period.as_millis() as u64, "Starting retention sweeper");

            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        let evicted = broker.sweep_retention();
                        debug!(evicted, "Retention sweep finished");
                    }
                }
            }

            info!("Retention sweeper stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::broker::Broker;
    use crate::message::PublishOptions;
    use crate::queue::QueueOptions;
    use crate::stream::StreamRetention;
    use chrono::{TimeDelta, Utc};
    use core_config::broker::BrokerConfig;
    use std::time::Duration;
    use tokio::sync::watch;

    fn stream_broker(config: BrokerConfig) -> Broker {
        let broker = Broker::new(config);
        let retention = StreamRetention::new()
            .with_segment_size_bytes(1)
            .with_max_age(TimeDelta::hours(1));
        broker
            .declare_queue("events", QueueOptions::new().durable(true).stream(retention))
            .unwrap();
        broker.declare_queue("jobs", QueueOptions::new()).unwrap();
        for body in ["a", "b", "c"] {
            broker.publish("", "events", body, PublishOptions::new()).unwrap();
            broker.publish("", "jobs", body, PublishOptions::new()).unwrap();
        }
        broker
    }

    #[test]
    fn test_sweep_only_touches_aged_streams() {
        let broker = stream_broker(BrokerConfig::default());
        assert_eq!(broker.sweep_retention(), 0);

        let later = Utc::now() + TimeDelta::hours(2);
        assert_eq!(broker.sweep_retention_at(later), 2);

        let events = broker.queue_info("events").unwrap();
        assert_eq!(events.first_offset, Some(2));
        assert_eq!(events.segments, 1);
        assert_eq!(broker.queue_info("jobs").unwrap().messages_ready, 3);
    }

    #[tokio::test]
    async fn test_sweeper_stops_on_shutdown() {
        let config =
            BrokerConfig::default().with_retention_sweep_interval(Duration::from_millis(10));
        let broker = stream_broker(config);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = broker.spawn_retention_sweeper(shutdown_rx);
        tokio::time::sleep(Duration::from_millis(30)).await;
        shutdown_tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sweeper should stop")
            .unwrap();
    }
}
