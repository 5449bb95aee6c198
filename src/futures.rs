use core::{
    future::Future,
    pin::Pin,
    task::{ready, Context, Poll},
};

use bytes::Bytes;
use futures::{channel::oneshot, Sink};

use crate::{
    bridge::AsyncWriteBridge, error::BridgeError, pending::BridgeResult, transport::RawTransport,
};

/// The bridge always runs its continuations, so a cancelled channel only
/// follows a panic on the notifying side.
fn settle<T: RawTransport>(
    received: Result<BridgeResult<T>, oneshot::Canceled>,
) -> BridgeResult<T> {
    received.unwrap_or(Err(BridgeError::Closed))
}

impl<T> AsyncWriteBridge<T>
where
    T: RawTransport + 'static,
    T::Error: Send + Sync + 'static,
{
    pub fn write(&self, buf: &[u8]) -> impl Future<Output = BridgeResult<T>> + 'static {
        let (tx, rx) = oneshot::channel();

        self.write_async(buf, move |_, result| {
            let _ = tx.send(result);
        });

        async move { settle::<T>(rx.await) }
    }

    pub fn write_bytes(&self, bytes: Bytes) -> impl Future<Output = BridgeResult<T>> + 'static {
        let (tx, rx) = oneshot::channel();

        self.write_bytes_async(bytes, move |_, result| {
            let _ = tx.send(result);
        });

        async move { settle::<T>(rx.await) }
    }

    /// Resolves once nothing is left in the bridge's buffer.
    pub fn flush(&self) -> impl Future<Output = BridgeResult<T>> + 'static {
        let (tx, rx) = oneshot::channel();

        self.request_flush(move |result| {
            let _ = tx.send(result);
        });

        async move { settle::<T>(rx.await) }
    }

    /// Requests the close and resolves once the buffered write, if any, has
    /// left the bridge. The transport close follows right after.
    pub fn close(&self) -> impl Future<Output = BridgeResult<T>> + 'static {
        let (tx, rx) = oneshot::channel();

        self.request_flush(move |result| {
            let _ = tx.send(result);
        });
        let requested = self.request_close();

        async move {
            if let Err(error) = requested {
                return Err(error);
            }

            settle::<T>(rx.await)
        }
    }

    pub fn sink(&self) -> BridgeSink<T> {
        BridgeSink::new(self.clone())
    }
}

/// [`Sink`] of byte chunks over an [`AsyncWriteBridge`].
///
/// Keeps at most one chunk in flight; `poll_ready` waits for its completion.
pub struct BridgeSink<T: RawTransport> {
    bridge: AsyncWriteBridge<T>,
    in_flight: Option<oneshot::Receiver<BridgeResult<T>>>,
    close_requested: bool,
}

impl<T: RawTransport> BridgeSink<T> {
    pub fn new(bridge: AsyncWriteBridge<T>) -> Self {
        Self {
            bridge,
            in_flight: None,
            close_requested: false,
        }
    }

    pub fn into_inner(self) -> AsyncWriteBridge<T> {
        self.bridge
    }

    fn poll_in_flight(&mut self, cx: &mut Context<'_>) -> Poll<BridgeResult<T>> {
        if let Some(rx) = self.in_flight.as_mut() {
            let received = ready!(Pin::new(rx).poll(cx));
            self.in_flight = None;

            return Poll::Ready(settle::<T>(received));
        }

        Poll::Ready(Ok(()))
    }
}

impl<T> Sink<Bytes> for BridgeSink<T>
where
    T: RawTransport,
    T::Error: Send + Sync + 'static,
{
    type Error = BridgeError<T::Error>;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.get_mut().poll_in_flight(cx)
    }

    fn start_send(self: Pin<&mut Self>, item: Bytes) -> Result<(), Self::Error> {
        let this = self.get_mut();
        let (tx, rx) = oneshot::channel();

        this.bridge.write_bytes_async(item, move |_, result| {
            let _ = tx.send(result);
        });
        this.in_flight = Some(rx);

        Ok(())
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.get_mut().poll_in_flight(cx)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        let this = self.get_mut();

        ready!(this.poll_in_flight(cx))?;

        if !this.close_requested {
            this.close_requested = true;
            this.bridge.request_close()?;
        }

        Poll::Ready(Ok(()))
    }
}
