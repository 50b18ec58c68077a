use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pump_core=info,runner_container=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct PumpMetrics {
    pub batches_received: u64,
    pub messages_received: u64,
    pub bytes_received: u64,
    pub empty_receives: u64,
    pub handler_invocations: u64,
    pub errors: u64,
}

/// Counters a pump updates from its loop task.
#[derive(Debug, Default)]
pub(crate) struct PumpCounters {
    batches_received: AtomicU64,
    messages_received: AtomicU64,
    bytes_received: AtomicU64,
    empty_receives: AtomicU64,
    handler_invocations: AtomicU64,
    errors: AtomicU64,
}

impl PumpCounters {
    pub(crate) fn record_batch(&self, messages: usize, bytes: u64) {
        self.batches_received.fetch_add(1, Ordering::Relaxed);
        self.messages_received
            .fetch_add(messages as u64, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_empty(&self) {
        self.empty_receives.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_invocation(&self) {
        self.handler_invocations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> PumpMetrics {
        PumpMetrics {
            batches_received: self.batches_received.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            empty_receives: self.empty_receives.load(Ordering::Relaxed),
            handler_invocations: self.handler_invocations.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}
