use alloc::{boxed::Box, sync::Arc};
use bytes::Bytes;
use core::mem;
use spin::Mutex;

use crate::{
    error::BridgeError,
    pending::{Buffered, BridgeResult, Completion, Continuation, Payload, PendingWrite},
    transport::{RawTransport, WriteListener},
};

enum State<T: RawTransport> {
    /// Async mode not started.
    Blocking,
    Idle,
    Buffered(Buffered<T>),
    Closed,
}

impl<T: RawTransport> State<T> {
    #[cfg(feature = "tracing")]
    fn name(&self) -> &'static str {
        match self {
            Self::Blocking => "blocking",
            Self::Idle => "idle",
            Self::Buffered(_) => "buffered",
            Self::Closed => "closed",
        }
    }
}

struct Inner<T: RawTransport> {
    transport: T,
    state: State<T>,
}

impl<T: RawTransport> Drop for Inner<T> {
    /// The last handle is gone. A buffered write keeps the bridge alive, so
    /// the only open state left to settle here is idle.
    fn drop(&mut self) {
        if !matches!(self.state, State::Idle) {
            return;
        }

        #[cfg(feature = "tracing")]
        tracing::debug!("Bridge dropped while open. Closing transport");

        if self.transport.close().is_err() {
            #[cfg(feature = "tracing")]
            tracing::warn!("Failed to close transport");
        }
    }
}

pub(crate) struct Shared<T: RawTransport> {
    inner: Mutex<Inner<T>>,
}

#[derive(Clone, Copy)]
enum Slot {
    Flush,
    Complete,
}

/// Non-blocking write bridge over a [`RawTransport`].
///
/// Accepts one write at a time. A write issued while the transport is ready
/// goes straight through and its completion runs before `write_async`
/// returns. Otherwise the bytes are parked until the transport raises
/// [`WriteListener::on_write_possible`].
///
/// The handle is cheap to clone; every clone drives the same state.
/// Continuations always run without the internal lock held and may call back
/// into the bridge, e.g. to chain the next write.
///
/// Dropping every handle does not abandon a buffered write: it still drains
/// (or fails) on the next notification, its continuations run, and the
/// transport is closed afterwards. Dropping an idle bridge in async mode
/// closes the transport right away.
pub struct AsyncWriteBridge<T: RawTransport> {
    shared: Arc<Shared<T>>,
}

impl<T: RawTransport> Clone for AsyncWriteBridge<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: RawTransport> AsyncWriteBridge<T> {
    pub fn new(transport: T) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    transport,
                    state: State::Blocking,
                }),
            }),
        }
    }

    pub(crate) fn from_shared(shared: Arc<Shared<T>>) -> Self {
        Self { shared }
    }

    /// Switches the bridge to asynchronous operation and registers the
    /// notification listener with the transport.
    ///
    /// Fails with [`BridgeError::Unsupported`] on every call while the
    /// transport cannot do non-blocking writes. Calling it again after a
    /// successful start does nothing.
    pub fn start_async_mode(&self) -> BridgeResult<T> {
        let mut guard = self.shared.inner.lock();
        let inner = &mut *guard;

        if !matches!(inner.state, State::Blocking) {
            return Ok(());
        }

        if !inner.transport.supports_non_blocking() {
            #[cfg(feature = "tracing")]
            tracing::warn!("Transport does not support non-blocking writes");

            return Err(BridgeError::Unsupported);
        }

        inner
            .transport
            .set_write_listener(WriteListener::new(Arc::downgrade(&self.shared)));
        inner.state = State::Idle;

        #[cfg(feature = "tracing")]
        tracing::debug!("Async mode started");

        Ok(())
    }

    pub fn is_async_started(&self) -> bool {
        !matches!(self.shared.inner.lock().state, State::Blocking)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.shared.inner.lock().state, State::Closed)
    }

    /// Whether a write is parked waiting for the transport.
    pub fn has_buffered_write(&self) -> bool {
        matches!(self.shared.inner.lock().state, State::Buffered(_))
    }

    /// Writes `buf` without blocking and reports the outcome to `completion`
    /// exactly once.
    ///
    /// `buf` is copied only if it has to be buffered. Protocol violations
    /// (not started, closed, a write already buffered) are reported to
    /// `completion` right away and leave the bridge untouched.
    pub fn write_async<F>(&self, buf: &[u8], completion: F)
    where
        F: FnOnce(&Self, BridgeResult<T>) + Send + 'static,
    {
        self.submit(Payload::Borrowed(buf), completion)
    }

    /// Like [`write_async`](Self::write_async) but takes ownership of the
    /// bytes, so buffering never copies.
    pub fn write_bytes_async<F>(&self, bytes: Bytes, completion: F)
    where
        F: FnOnce(&Self, BridgeResult<T>) + Send + 'static,
    {
        self.submit(Payload::Owned(bytes), completion)
    }

    fn submit<F>(&self, payload: Payload<'_>, completion: F)
    where
        F: FnOnce(&Self, BridgeResult<T>) + Send + 'static,
    {
        let mut guard = self.shared.inner.lock();
        let inner = &mut *guard;

        let rejected = match &inner.state {
            State::Blocking => Some(BridgeError::NotStarted),
            State::Closed => Some(BridgeError::Closed),
            State::Buffered(_) => Some(BridgeError::WriteContention),
            State::Idle => None,
        };

        if let Some(error) = rejected {
            #[cfg(feature = "tracing")]
            tracing::debug!(state = inner.state.name(), "Rejecting write");

            drop(guard);
            completion(self, Err(error));

            return;
        }

        if !inner.transport.is_ready() {
            #[cfg(feature = "tracing")]
            tracing::trace!(
                len = payload.as_slice().len(),
                "Transport not ready. Buffering write"
            );

            let completion: Completion<T> = Box::new(completion);
            inner.state = State::Buffered(Buffered::new(
                PendingWrite::new(payload, completion),
                Arc::clone(&self.shared),
            ));

            return;
        }

        match inner.transport.write(payload.as_slice()) {
            Ok(()) => {
                #[cfg(feature = "tracing")]
                tracing::trace!(len = payload.as_slice().len(), "Wrote directly");

                drop(guard);
                completion(self, Ok(()));
            }
            Err(error) => {
                #[cfg(feature = "tracing")]
                tracing::debug!("Direct write failed. Closing");

                inner.state = State::Closed;
                drop(guard);

                completion(self, Err(BridgeError::transport(error)));
                self.force_close();
            }
        }
    }

    /// Readiness notification. Drains the buffered write if the transport
    /// really is ready; otherwise waits for the next notification.
    pub(crate) fn on_write_possible(&self) {
        let mut guard = self.shared.inner.lock();
        let inner = &mut *guard;

        if !matches!(inner.state, State::Buffered(_)) {
            #[cfg(feature = "tracing")]
            tracing::trace!(state = inner.state.name(), "Nothing buffered");

            return;
        }

        if !inner.transport.is_ready() {
            #[cfg(feature = "tracing")]
            tracing::trace!("Notified but transport not ready. Waiting");

            return;
        }

        let State::Buffered(buffered) = mem::replace(&mut inner.state, State::Idle) else {
            return;
        };

        // `self` is a live handle, so releasing the keep-alive here never
        // drops the bridge under the lock.
        let Buffered {
            write,
            flush,
            complete,
            close_queued,
            keep_alive: _keep_alive,
        } = buffered;
        let (bytes, completion) = write.into_parts();

        if let Err(error) = inner.transport.write(&bytes) {
            #[cfg(feature = "tracing")]
            tracing::debug!(len = bytes.len(), "Buffered write failed. Closing");

            inner.state = State::Closed;
            drop(guard);

            self.fail(flush, complete, Some(completion), BridgeError::transport(error));
            self.force_close();

            return;
        }

        #[cfg(feature = "tracing")]
        tracing::trace!(len = bytes.len(), close_queued, "Drained buffered write");

        if close_queued {
            inner.state = State::Closed;
        }

        drop(guard);

        if let Some(flush) = flush {
            flush(Ok(()));
        }

        if let Some(complete) = complete {
            complete(Ok(()));
        }

        // The close has to land before a chained write from `completion`.
        if close_queued {
            self.force_close();
        }

        completion(self, Ok(()));
    }

    /// Error notification. Fails every outstanding continuation, most specific
    /// first, then closes the transport.
    pub(crate) fn on_error(&self, error: T::Error) {
        let previous = mem::replace(&mut self.shared.inner.lock().state, State::Closed);

        #[cfg(feature = "tracing")]
        tracing::debug!(state = previous.name(), "Transport reported an error");

        if let State::Buffered(buffered) = previous {
            let Buffered {
                write,
                flush,
                complete,
                ..
            } = buffered;
            let (_, completion) = write.into_parts();

            self.fail(flush, complete, Some(completion), BridgeError::transport(error));
        }

        self.force_close();
    }

    fn fail(
        &self,
        flush: Option<Continuation<T>>,
        complete: Option<Continuation<T>>,
        completion: Option<Completion<T>>,
        error: BridgeError<T::Error>,
    ) {
        if let Some(flush) = flush {
            flush(Err(error.clone()));
        }

        if let Some(complete) = complete {
            complete(Err(error.clone()));
        }

        if let Some(completion) = completion {
            completion(self, Err(error));
        }
    }

    /// Best-effort close on an error path or after a queued close. Failures
    /// here never surface.
    fn force_close(&self) {
        let result = self.shared.inner.lock().transport.close();

        if result.is_err() {
            #[cfg(feature = "tracing")]
            tracing::warn!("Failed to close transport");
        }
    }

    /// Closes the transport now if nothing is buffered, otherwise once the
    /// buffered write has drained. Either way no further write is accepted.
    pub fn request_close(&self) -> BridgeResult<T> {
        let mut guard = self.shared.inner.lock();
        let inner = &mut *guard;

        match &mut inner.state {
            State::Blocking => return Err(BridgeError::NotStarted),
            State::Closed => return Ok(()),
            State::Buffered(buffered) => {
                #[cfg(feature = "tracing")]
                tracing::trace!("Write buffered. Queuing close");

                buffered.close_queued = true;

                return Ok(());
            }
            State::Idle => {}
        }

        #[cfg(feature = "tracing")]
        tracing::debug!("Closing transport");

        inner.state = State::Closed;
        inner.transport.close().map_err(BridgeError::transport)
    }

    /// Resolves `continuation` once nothing is left in the bridge's buffer:
    /// synchronously if nothing is buffered, otherwise when the buffered write
    /// drains or fails.
    pub fn request_flush<F>(&self, continuation: F)
    where
        F: FnOnce(BridgeResult<T>) + Send + 'static,
    {
        self.park(Slot::Flush, Box::new(continuation))
    }

    /// Signals that the producer is done. Resolved like a flush, right after
    /// it, so the owner of the exchange can complete it once every byte has
    /// left the bridge.
    pub fn request_complete<F>(&self, continuation: F)
    where
        F: FnOnce(BridgeResult<T>) + Send + 'static,
    {
        self.park(Slot::Complete, Box::new(continuation))
    }

    fn park(&self, slot: Slot, continuation: Continuation<T>) {
        let mut guard = self.shared.inner.lock();

        let outcome = match &mut guard.state {
            State::Blocking => Err(BridgeError::NotStarted),
            State::Idle | State::Closed => Ok(()),
            State::Buffered(buffered) => {
                let (pending, contention) = match slot {
                    Slot::Flush => (&mut buffered.flush, BridgeError::FlushContention),
                    Slot::Complete => (&mut buffered.complete, BridgeError::CompleteContention),
                };

                if pending.is_none() {
                    *pending = Some(continuation);

                    return;
                }

                Err(contention)
            }
        };

        drop(guard);
        continuation(outcome);
    }
}

impl<T: RawTransport> core::fmt::Debug for AsyncWriteBridge<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let inner = self.shared.inner.lock();
        let mut debug = f.debug_struct("AsyncWriteBridge");

        match &inner.state {
            State::Blocking => debug.field("state", &"blocking"),
            State::Idle => debug.field("state", &"idle"),
            State::Closed => debug.field("state", &"closed"),
            State::Buffered(buffered) => debug
                .field("state", &"buffered")
                .field("buffered_len", &buffered.write.len())
                .field("close_queued", &buffered.close_queued),
        };

        debug.finish()
    }
}
