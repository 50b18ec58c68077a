use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use pump_core::config::{LoadSettings, load_config};
use pump_core::errors::{HandlerError, PumpError};
use pump_core::handler::EventHandler;
use pump_core::pump::ReceivePump;
use pump_core::source::channel::ChannelSource;
use pump_core::source::{MessageBatch, SourceMessage};
use pump_core::telemetry::init_tracing;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// This is the entry point for running receive pumps as a long-running
/// process on container hosting services like AWS EKS, ECS, etc.
///
/// What it does at a high-level:
///     Load config from the path given as the first argument, or PUMP_CONFIG.
///     Start one pump per configured partition, each fed by a synthetic load generator.
///     Run until Ctrl-C, then stop every pump and print its metrics as JSON.
#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config_path = std::env::args().nth(1);
    let config = load_config(config_path.as_deref())
        .await
        .context("Failed to load pump configuration")?;
    config.validate()?;

    let mut pumps = Vec::with_capacity(config.source.partitions.len());
    let mut generators = Vec::with_capacity(config.source.partitions.len());

    for partition in &config.source.partitions {
        let (source, tx) = ChannelSource::new(partition.clone(), config.receive_timeout());
        let pump = ReceivePump::new(config.source.name.clone(), source, config.pump_options());
        let handler = Arc::new(CountingHandler::new(
            partition.clone(),
            config.pump.max_event_count,
        ));
        pump.start(handler)
            .with_context(|| format!("Failed to start pump for partition {}", partition))?;

        generators.push(tokio::spawn(generate_load(
            partition.clone(),
            tx,
            config.load.clone(),
        )));
        pumps.push(pump);
    }

    info!(
        "Pumping {} partitions of {}, press Ctrl-C to stop",
        pumps.len(),
        config.source.name
    );
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received, stopping pumps");

    // stop pumps before their feeds close so a closed channel is not reported as a failure
    let mut report = serde_json::Map::new();
    for pump in &pumps {
        pump.stop().await;
        report.insert(
            pump.partition_id().to_string(),
            serde_json::to_value(pump.metrics())?,
        );
    }
    for generator in &generators {
        generator.abort();
    }

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Counts what it sees and logs failures for the owner to act on.
struct CountingHandler {
    partition_id: String,
    max_event_count: usize,
    messages: AtomicU64,
}

impl CountingHandler {
    fn new(partition_id: String, max_event_count: usize) -> Self {
        Self {
            partition_id,
            max_event_count,
            messages: AtomicU64::new(0),
        }
    }
}

impl EventHandler for CountingHandler {
    fn max_event_count(&self) -> usize {
        self.max_event_count
    }

    async fn on_receive(&self, batch: MessageBatch) -> Result<(), HandlerError> {
        if batch.is_empty() {
            debug!("Partition {} is idle", self.partition_id);
            return Ok(());
        }

        let total = self
            .messages
            .fetch_add(batch.len() as u64, Ordering::Relaxed)
            + batch.len() as u64;
        debug!(
            "Partition {} handled {} messages ({} total)",
            self.partition_id,
            batch.len(),
            total
        );
        Ok(())
    }

    fn on_error(&self, error: PumpError) {
        if error.is_retryable() {
            warn!(
                "Pump for partition {} stopped with a retryable error: {}",
                self.partition_id, error
            );
        } else {
            error!(
                "Pump for partition {} stopped with a fatal error: {}",
                self.partition_id, error
            );
        }
    }
}

async fn generate_load(partition_id: String, tx: mpsc::Sender<SourceMessage>, load: LoadSettings) {
    let period = Duration::from_secs(1) / load.messages_per_second;
    let mut ticker = tokio::time::interval(period);
    let payload = vec![b'x'; load.payload_bytes];
    let mut sequence_number = 0i64;

    loop {
        ticker.tick().await;
        let message = SourceMessage::new(partition_id.as_str(), sequence_number, payload.clone())
            .with_header("generator", "runner-container");
        if tx.send(message).await.is_err() {
            break;
        }
        sequence_number += 1;
    }
}
