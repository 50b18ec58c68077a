use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::FutureExt;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{MAXIMUM_PREFETCH_COUNT, MINIMUM_PREFETCH_COUNT, PumpOptions};
use crate::errors::{self, HandlerError, PumpError, SourceError};
use crate::handler::EventHandler;
use crate::source::{MessageBatch, PartitionSource};
use crate::telemetry::{PumpCounters, PumpMetrics};

const IDLE: u8 = 0;
const ACTIVE: u8 = 1;
const STOPPING: u8 = 2;

/// Lifecycle of the handler registration on a pump.
///
/// A pump stays `Active` after its loop ends on an error; the handler has to
/// be cleared with [`ReceivePump::stop`] (or `set_handler(None)`) before a new
/// one can be registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpState {
    Idle,
    Active,
    Stopping,
}

struct Run<H> {
    id: u64,
    handler: Arc<H>,
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
    task: JoinHandle<()>,
}

/// Drives the receive -> dispatch cycle for one partition.
///
/// At most one receive is outstanding at a time and the handler is never
/// invoked concurrently with itself. The loop runs as a task on a tokio
/// runtime and ends when [`ReceivePump::stop`] is called or on the first
/// receive or handler error, which is reported once via
/// [`EventHandler::on_error`]. The pump never retries.
pub struct ReceivePump<S, H> {
    source_name: String,
    partition_id: String,
    source: Arc<S>,
    options: PumpOptions,
    executor: Option<Handle>,
    state: AtomicU8,
    run: Mutex<Option<Run<H>>>,
    next_run_id: AtomicU64,
    counters: Arc<PumpCounters>,
}

impl<S, H> ReceivePump<S, H>
where
    S: PartitionSource,
    H: EventHandler,
{
    pub fn new(source_name: impl Into<String>, source: S, options: PumpOptions) -> Self {
        let partition_id = source.source_id().to_string();
        Self {
            source_name: source_name.into(),
            partition_id,
            source: Arc::new(source),
            options,
            executor: None,
            state: AtomicU8::new(IDLE),
            run: Mutex::new(None),
            next_run_id: AtomicU64::new(0),
            counters: Arc::new(PumpCounters::default()),
        }
    }

    /// Runs the loop on `executor` instead of the runtime current at `start`.
    pub fn with_executor(mut self, executor: Handle) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn source_name(&self) -> &str {
        &self.source_name
    }

    pub fn partition_id(&self) -> &str {
        &self.partition_id
    }

    pub fn options(&self) -> PumpOptions {
        self.options
    }

    pub fn state(&self) -> PumpState {
        match self.state.load(Ordering::Acquire) {
            ACTIVE => PumpState::Active,
            STOPPING => PumpState::Stopping,
            _ => PumpState::Idle,
        }
    }

    /// Whether the loop task is still alive.
    pub fn is_running(&self) -> bool {
        self.lock_run()
            .as_ref()
            .is_some_and(|run| !run.task.is_finished())
    }

    /// The currently registered handler, if any.
    pub fn handler(&self) -> Option<Arc<H>> {
        self.lock_run().as_ref().map(|run| run.handler.clone())
    }

    pub fn metrics(&self) -> PumpMetrics {
        self.counters.snapshot()
    }

    /// Registers `handler` and starts the loop. Returns once the loop task is
    /// spawned.
    ///
    /// Fails with [`PumpError::InvalidArgument`] when the handler's max event
    /// count is zero or above the prefetch count, or when the prefetch count
    /// lies outside the system range, and with
    /// [`PumpError::InvalidState`] when another handler is still registered.
    /// No receive is issued in either case.
    pub fn start(&self, handler: Arc<H>) -> errors::Result<()> {
        let max_event_count = handler.max_event_count();
        if max_event_count == 0 {
            return Err(PumpError::invalid_argument(
                "max event count should be greater than 0",
            ));
        }
        let prefetch_count = self.options.prefetch_count;
        if !(MINIMUM_PREFETCH_COUNT..=MAXIMUM_PREFETCH_COUNT).contains(&prefetch_count) {
            return Err(PumpError::invalid_argument(format!(
                "prefetch count {} should be between {} and {}",
                prefetch_count, MINIMUM_PREFETCH_COUNT, MAXIMUM_PREFETCH_COUNT
            )));
        }
        if max_event_count > prefetch_count {
            return Err(PumpError::invalid_argument(format!(
                "max event count {} should be less than or equal to the prefetch count {}",
                max_event_count, self.options.prefetch_count
            )));
        }

        let executor = match &self.executor {
            Some(executor) => executor.clone(),
            None => Handle::try_current().map_err(|_| {
                PumpError::invalid_state("no tokio runtime is available to run the pump")
            })?,
        };

        let mut slot = self.lock_run();
        if self
            .state
            .compare_exchange(IDLE, ACTIVE, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(PumpError::invalid_state(format!(
                "partition {} of {} already has a registered handler; clear it before registering another",
                self.partition_id, self.source_name
            )));
        }

        let id = self.next_run_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(false);

        let pump_loop = PumpLoop {
            source_name: self.source_name.clone(),
            partition_id: self.partition_id.clone(),
            source: self.source.clone(),
            handler: handler.clone(),
            batch_size: max_event_count.min(self.options.prefetch_count),
            invoke_on_timeout: self.options.invoke_on_timeout,
            cancel: cancel.clone(),
            counters: self.counters.clone(),
        };

        info!(
            source = %self.source_name,
            partition = %self.partition_id,
            batch_size = pump_loop.batch_size,
            invoke_on_timeout = self.options.invoke_on_timeout,
            "Starting receive pump"
        );

        let task = executor.spawn(async move {
            pump_loop.run().await;
            let _ = done_tx.send(true);
        });

        *slot = Some(Run {
            id,
            handler,
            cancel,
            done: done_rx,
            task,
        });
        Ok(())
    }

    /// Asks the loop to finish after the in-flight cycle and waits until it
    /// has. An in-flight receive is not aborted. Clears the registered
    /// handler. Does nothing when no handler is registered.
    pub async fn stop(&self) {
        let (id, cancel, mut done) = {
            let slot = self.lock_run();
            let Some(run) = slot.as_ref() else {
                return;
            };
            let _ = self.state.compare_exchange(
                ACTIVE,
                STOPPING,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
            (run.id, run.cancel.clone(), run.done.clone())
        };

        debug!(
            source = %self.source_name,
            partition = %self.partition_id,
            "Stop requested"
        );
        cancel.cancel();
        // an Err means the loop task is gone without signalling, which also
        // means it has quiesced
        let _ = done.wait_for(|finished| *finished).await;

        let mut slot = self.lock_run();
        if slot.as_ref().is_some_and(|run| run.id == id) {
            *slot = None;
            self.state.store(IDLE, Ordering::Release);
            info!(
                source = %self.source_name,
                partition = %self.partition_id,
                "Receive pump stopped"
            );
        }
    }

    /// `Some` registers and starts a handler, `None` clears the current one
    /// and waits for the loop to quiesce.
    pub async fn set_handler(&self, handler: Option<Arc<H>>) -> errors::Result<()> {
        match handler {
            Some(handler) => self.start(handler),
            None => {
                self.stop().await;
                Ok(())
            }
        }
    }

    fn lock_run(&self) -> MutexGuard<'_, Option<Run<H>>> {
        self.run.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<S, H> Drop for ReceivePump<S, H> {
    fn drop(&mut self) {
        let slot = self.run.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(run) = slot.as_ref() {
            run.cancel.cancel();
        }
    }
}

/// State owned by one run of the loop task.
struct PumpLoop<S, H> {
    source_name: String,
    partition_id: String,
    source: Arc<S>,
    handler: Arc<H>,
    batch_size: usize,
    invoke_on_timeout: bool,
    cancel: CancellationToken,
    counters: Arc<PumpCounters>,
}

impl<S, H> PumpLoop<S, H>
where
    S: PartitionSource,
    H: EventHandler,
{
    async fn run(self) {
        loop {
            if self.cancel.is_cancelled() {
                debug!(
                    source = %self.source_name,
                    partition = %self.partition_id,
                    "Receive pump observed stop"
                );
                break;
            }

            let received = AssertUnwindSafe(self.source.receive(self.batch_size))
                .catch_unwind()
                .await;
            let received = match received {
                Ok(Ok(received)) => received,
                Ok(Err(e)) => {
                    self.fail(PumpError::Receive(e));
                    break;
                }
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    self.fail(PumpError::Receive(SourceError::unrecoverable(format!(
                        "receive panicked: {}",
                        message
                    ))));
                    break;
                }
            };

            let batch = match received {
                Some(batch) if !batch.is_empty() => {
                    self.counters
                        .record_batch(batch.len(), batch.payload_bytes());
                    debug!(
                        source = %self.source_name,
                        partition = %self.partition_id,
                        last_sequence_number = ?batch.last_sequence_number(),
                        "Received {} messages",
                        batch.len()
                    );
                    Some(batch)
                }
                _ => {
                    self.counters.record_empty();
                    self.invoke_on_timeout.then(MessageBatch::empty)
                }
            };

            if let Some(batch) = batch {
                if let Err(e) = self.dispatch(batch).await {
                    self.fail(PumpError::Handler(e));
                    break;
                }
            }

            // hand the worker back to the runtime between cycles
            tokio::task::yield_now().await;
        }
    }

    async fn dispatch(&self, batch: MessageBatch) -> Result<(), HandlerError> {
        self.counters.record_invocation();
        match AssertUnwindSafe(self.handler.on_receive(batch))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => Err(HandlerError::Panicked {
                message: panic_message(panic.as_ref()),
            }),
        }
    }

    fn fail(&self, error: PumpError) {
        self.counters.record_error();
        error!(
            source = %self.source_name,
            partition = %self.partition_id,
            stage = ?error.stage(),
            "Receive pump stopping after error: {}",
            error
        );

        let handler = &self.handler;
        if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(|| handler.on_error(error))) {
            warn!(
                source = %self.source_name,
                partition = %self.partition_id,
                "Error callback panicked: {}",
                panic_message(panic.as_ref())
            );
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::handler_fn;
    use crate::source::channel::ChannelSource;
    use crate::source::SourceMessage;
    use std::time::Duration;

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }

    #[test]
    fn test_start_without_runtime_is_invalid_state() {
        let (source, _tx) = ChannelSource::new("0", Duration::from_millis(10));
        let pump = ReceivePump::new("hub", source, PumpOptions::default());
        let handler = Arc::new(handler_fn(10, |_| async { Ok::<(), HandlerError>(()) }, |_| {}));

        let result = pump.start(handler);
        assert!(matches!(result, Err(PumpError::InvalidState { .. })));
        assert_eq!(pump.state(), PumpState::Idle);
    }

    #[test]
    fn test_start_on_explicit_executor_from_outside_runtime() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();

        let (source, tx) = ChannelSource::new("5", Duration::from_millis(10));
        let pump = ReceivePump::new("hub", source, PumpOptions::default())
            .with_executor(runtime.handle().clone());

        let (seen_tx, seen_rx) = std::sync::mpsc::channel();
        let handler = Arc::new(handler_fn(
            10,
            move |batch: MessageBatch| {
                let _ = seen_tx.send(batch.last_sequence_number());
                async { Ok::<(), HandlerError>(()) }
            },
            |_| {},
        ));

        assert!(Handle::try_current().is_err());
        pump.start(handler).unwrap();
        tx.blocking_send(SourceMessage::new("5", 11, b"x".to_vec()))
            .unwrap();

        let seen = seen_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(seen, Some(11));

        runtime.block_on(pump.stop());
        assert_eq!(pump.state(), PumpState::Idle);
        assert!(!pump.is_running());
        assert_eq!(pump.metrics().messages_received, 1);
    }

    #[tokio::test]
    async fn test_prefetch_outside_system_range_rejected() {
        let out_of_range = [
            0,
            MINIMUM_PREFETCH_COUNT - 1,
            MAXIMUM_PREFETCH_COUNT + 1,
            100_000,
        ];
        for prefetch_count in out_of_range {
            let (source, _tx) = ChannelSource::new("6", Duration::from_millis(10));
            let options = PumpOptions::default().with_prefetch_count(prefetch_count);
            let pump = ReceivePump::new("hub", source, options);
            let handler = Arc::new(handler_fn(
                5,
                |_| async { Ok::<(), HandlerError>(()) },
                |_| {},
            ));

            match pump.start(handler) {
                Err(PumpError::InvalidArgument { message }) => {
                    assert!(message.contains("prefetch count"), "message was {}", message)
                }
                other => panic!("expected invalid argument, got {:?}", other),
            }
            assert_eq!(pump.state(), PumpState::Idle);
            assert!(!pump.is_running());
        }
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_stop_logs_carry_source_and_partition_fields() {
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            runtime.block_on(async {
                let (source, _tx) = ChannelSource::new("7", Duration::from_millis(5));
                let pump = ReceivePump::new("hub", source, PumpOptions::default());
                let handler = Arc::new(handler_fn(
                    10,
                    |_| async { Ok::<(), HandlerError>(()) },
                    |_| {},
                ));
                pump.start(handler).unwrap();
                pump.stop().await;
            });
        });

        let output = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
        for line in output
            .lines()
            .filter(|l| l.contains("Stop requested") || l.contains("observed stop"))
        {
            assert!(line.contains("source=hub"), "line was {}", line);
            assert!(line.contains("partition=7"), "line was {}", line);
        }
        assert!(output.contains("Stop requested"));
        assert!(output.contains("Receive pump observed stop"));
    }

    #[tokio::test]
    async fn test_stop_clears_state_and_handler() {
        let (source, tx) = ChannelSource::new("4", Duration::from_millis(10));
        let pump = ReceivePump::new("hub", source, PumpOptions::default());
        assert_eq!(pump.partition_id(), "4");

        let handler = Arc::new(handler_fn(10, |_| async { Ok::<(), HandlerError>(()) }, |_| {}));
        pump.start(handler).unwrap();
        assert_eq!(pump.state(), PumpState::Active);
        assert!(pump.handler().is_some());

        tx.send(SourceMessage::new("4", 0, b"x".to_vec())).await.unwrap();
        pump.stop().await;

        assert_eq!(pump.state(), PumpState::Idle);
        assert!(pump.handler().is_none());
        assert!(!pump.is_running());
    }
}
