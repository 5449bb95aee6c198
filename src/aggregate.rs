use alloc::{boxed::Box, sync::Arc};
use bytes::BytesMut;
use spin::Mutex;

use crate::{
    bridge::AsyncWriteBridge,
    error::BridgeError,
    pending::BridgeResult,
    transport::RawTransport,
};

#[derive(Clone, Debug)]
pub struct AggregatingOptions {
    /// Capacity reserved for the accumulator up front. It grows past this as
    /// needed.
    pub initial_capacity: usize,
}

impl Default for AggregatingOptions {
    fn default() -> Self {
        Self {
            initial_capacity: 8 * 1024,
        }
    }
}

type Waiter<E> = Box<dyn FnOnce(Result<(), BridgeError<E>>) + Send>;

/// Accumulator shared with the completion of the hand-off in flight.
struct Outbox<E> {
    buf: BytesMut,
    /// Leading bytes of `buf` already asked to leave.
    requested: usize,
    in_flight: bool,
    close_queued: bool,
    flush: Option<Waiter<E>>,
    complete: Option<Waiter<E>>,
    failed: Option<BridgeError<E>>,
}

impl<E> Outbox<E> {
    fn fail(&mut self, error: BridgeError<E>) {
        self.buf.clear();
        self.requested = 0;
        self.failed = Some(error);
    }
}

/// Collects many small synchronous writes and hands them to an
/// [`AsyncWriteBridge`] as a single asynchronous write.
///
/// Nothing is sent until [`async_flush`](Self::async_flush),
/// [`flush_async`](Self::flush_async), [`close`](Self::close) or
/// [`done`](Self::done). At most one hand-off is in the bridge at a time:
/// bytes flushed while one is still buffered leave when it completes, in
/// order, and a close waits for all of them. The accumulator is unbounded;
/// keeping it small is up to the producer.
///
/// Once a hand-off fails, the accumulated bytes are discarded and every
/// further [`write`](Self::write) returns the failure.
pub struct AggregatingBufferedStream<T: RawTransport> {
    bridge: AsyncWriteBridge<T>,
    outbox: Arc<Mutex<Outbox<T::Error>>>,
    closed: bool,
}

impl<T> AggregatingBufferedStream<T>
where
    T: RawTransport,
    T::Error: Send + Sync + 'static,
{
    pub fn new(bridge: AsyncWriteBridge<T>) -> Self {
        Self::with_options(bridge, AggregatingOptions::default())
    }

    pub fn with_options(bridge: AsyncWriteBridge<T>, options: AggregatingOptions) -> Self {
        Self {
            bridge,
            outbox: Arc::new(Mutex::new(Outbox {
                buf: BytesMut::with_capacity(options.initial_capacity),
                requested: 0,
                in_flight: false,
                close_queued: false,
                flush: None,
                complete: None,
                failed: None,
            })),
            closed: false,
        }
    }

    pub fn bridge(&self) -> &AsyncWriteBridge<T> {
        &self.bridge
    }

    /// Bytes accumulated but not yet handed to the bridge.
    pub fn buffered(&self) -> usize {
        self.outbox.lock().buf.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// The failure that ended the stream, if a hand-off failed.
    pub fn error(&self) -> Option<BridgeError<T::Error>> {
        self.outbox.lock().failed.clone()
    }

    pub fn write(&mut self, buf: &[u8]) -> BridgeResult<T> {
        if self.closed {
            return Err(BridgeError::Closed);
        }

        let mut outbox = self.outbox.lock();

        if let Some(error) = &outbox.failed {
            return Err(error.clone());
        }

        outbox.buf.extend_from_slice(buf);

        Ok(())
    }

    /// Does nothing. Bytes only leave through
    /// [`async_flush`](Self::async_flush) or [`close`](Self::close).
    pub fn flush(&mut self) -> BridgeResult<T> {
        Ok(())
    }

    /// Hands everything accumulated so far to the bridge as one write. If a
    /// previous hand-off is still buffered, the bytes follow it once it
    /// completes.
    pub fn async_flush(&mut self) {
        self.request_all();
        pump(&self.bridge, &self.outbox);
    }

    /// [`async_flush`](Self::async_flush), then resolves `continuation` once
    /// every flushed byte has left the bridge, or with the failure that
    /// stopped them.
    pub fn flush_async<F>(&mut self, continuation: F)
    where
        F: FnOnce(BridgeResult<T>) + Send + 'static,
    {
        let rejected = {
            let mut outbox = self.outbox.lock();
            outbox.requested = outbox.buf.len();

            match outbox.flush {
                Some(_) => Some(continuation),
                None => {
                    outbox.flush = Some(Box::new(continuation));
                    None
                }
            }
        };

        if let Some(continuation) = rejected {
            continuation(Err(BridgeError::FlushContention));
        }

        pump(&self.bridge, &self.outbox);
    }

    /// Hands the remaining bytes to the bridge and closes the transport once
    /// they have been written. A second call does nothing.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }

        self.closed = true;
        self.outbox.lock().close_queued = true;
        self.async_flush();
    }

    /// [`close`](Self::close), then resolves `continuation` once the final
    /// bytes have left the bridge.
    pub fn done<F>(&mut self, continuation: F)
    where
        F: FnOnce(BridgeResult<T>) + Send + 'static,
    {
        let rejected = {
            let mut outbox = self.outbox.lock();

            match outbox.complete {
                Some(_) => Some(continuation),
                None => {
                    outbox.complete = Some(Box::new(continuation));
                    None
                }
            }
        };

        if let Some(continuation) = rejected {
            continuation(Err(BridgeError::CompleteContention));
        }

        if self.closed {
            pump(&self.bridge, &self.outbox);
        } else {
            self.close();
        }
    }

    fn request_all(&self) {
        let mut outbox = self.outbox.lock();
        outbox.requested = outbox.buf.len();
    }
}

/// Hands the requested bytes to the bridge unless a hand-off is in flight,
/// then attaches whatever waits on them. The in-flight hand-off pumps again
/// from its completion.
fn pump<T>(bridge: &AsyncWriteBridge<T>, outbox: &Arc<Mutex<Outbox<T::Error>>>)
where
    T: RawTransport,
    T::Error: Send + Sync + 'static,
{
    let bytes = {
        let mut guard = outbox.lock();

        if guard.in_flight {
            return;
        }

        if guard.requested == 0 || guard.failed.is_some() {
            None
        } else {
            let requested = core::mem::take(&mut guard.requested);
            guard.in_flight = true;

            Some(guard.buf.split_to(requested).freeze())
        }
    };

    if let Some(bytes) = bytes {
        #[cfg(feature = "tracing")]
        tracing::trace!(len = bytes.len(), "Handing aggregated bytes to bridge");

        let chained = Arc::clone(outbox);

        bridge.write_bytes_async(bytes, move |bridge, result| {
            {
                let mut guard = chained.lock();
                guard.in_flight = false;

                if let Err(error) = result {
                    #[cfg(feature = "tracing")]
                    tracing::debug!("Aggregated write failed");

                    guard.fail(error);
                }
            }

            pump(bridge, &chained);
        });
    }

    let (flush, complete, close, failed) = {
        let mut guard = outbox.lock();

        // Either a synchronous completion already pumped, or more bytes wait
        // behind the hand-off in flight.
        if guard.requested > 0 && guard.failed.is_none() {
            return;
        }

        (
            guard.flush.take(),
            guard.complete.take(),
            core::mem::take(&mut guard.close_queued),
            guard.failed.clone(),
        )
    };

    match failed {
        Some(error) => {
            if let Some(flush) = flush {
                flush(Err(error.clone()));
            }

            if let Some(complete) = complete {
                complete(Err(error));
            }
        }
        None => {
            if let Some(flush) = flush {
                bridge.request_flush(flush);
            }

            if let Some(complete) = complete {
                bridge.request_complete(complete);
            }
        }
    }

    // After a failure the bridge is usually closed already; this is then a
    // no-op.
    if close {
        if let Err(_error) = bridge.request_close() {
            #[cfg(feature = "tracing")]
            tracing::debug!("Failed to close bridge");
        }
    }
}

#[cfg(feature = "std")]
const _: () = {
    impl<T> std::io::Write for AggregatingBufferedStream<T>
    where
        T: RawTransport,
        T::Error: Send + Sync + 'static,
    {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            AggregatingBufferedStream::write(self, buf)
                .map(|()| buf.len())
                .map_err(|_| {
                    std::io::Error::new(std::io::ErrorKind::BrokenPipe, "Stream is closed")
                })
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }
};
