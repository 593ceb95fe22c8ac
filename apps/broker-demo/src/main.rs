//! Broker Demo - Entry Point
//!
//! Replays the classic routing, dead-letter, prefetch and stream demonstrations
//! against an in-process broker.

#[tokio::main]
async fn main() -> eyre::Result<()> {
    broker_demo::run().await
}
