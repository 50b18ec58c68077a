use std::future::Future;
use std::marker::PhantomData;

use crate::errors::{HandlerError, PumpError};
use crate::source::MessageBatch;

/// The `EventHandler` trait is the destination a pump dispatches batches to.
///
/// Calls for one pump are serialized: `on_receive` is never invoked again
/// before the previous invocation's future has resolved.
pub trait EventHandler: Send + Sync + 'static {
    /// Largest batch this handler accepts per invocation.
    fn max_event_count(&self) -> usize;

    /// Processes one batch. An error (or a panic) ends the pump run and is
    /// reported back through [`EventHandler::on_error`].
    fn on_receive(
        &self,
        batch: MessageBatch,
    ) -> impl Future<Output = Result<(), HandlerError>> + Send;

    /// Called at most once per run with the error that ended it.
    fn on_error(&self, error: PumpError);
}

/// An [`EventHandler`] made of plain closures.
pub struct FnHandler<R, E, Fut> {
    max_event_count: usize,
    on_receive: R,
    on_error: E,
    _future: PhantomData<fn() -> Fut>,
}

/// Builds a handler from a batch closure and an error closure.
///
/// ```no_run
/// use pump_core::errors::HandlerError;
/// use pump_core::handler::handler_fn;
///
/// let handler = handler_fn(
///     100,
///     |batch| async move {
///         println!("got {} messages", batch.len());
///         Ok::<(), HandlerError>(())
///     },
///     |error| eprintln!("pump stopped: {error}"),
/// );
/// ```
pub fn handler_fn<R, Fut, E>(
    max_event_count: usize,
    on_receive: R,
    on_error: E,
) -> FnHandler<R, E, Fut>
where
    R: Fn(MessageBatch) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    E: Fn(PumpError) + Send + Sync + 'static,
{
    FnHandler {
        max_event_count,
        on_receive,
        on_error,
        _future: PhantomData,
    }
}

impl<R, Fut, E> EventHandler for FnHandler<R, E, Fut>
where
    R: Fn(MessageBatch) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    E: Fn(PumpError) + Send + Sync + 'static,
{
    fn max_event_count(&self) -> usize {
        self.max_event_count
    }

    fn on_receive(
        &self,
        batch: MessageBatch,
    ) -> impl Future<Output = Result<(), HandlerError>> + Send {
        (self.on_receive)(batch)
    }

    fn on_error(&self, error: PumpError) {
        (self.on_error)(error)
    }
}
