use alloc::sync::Weak;

use crate::bridge::{AsyncWriteBridge, Shared};

/// A byte transport that reports write readiness asynchronously instead of
/// blocking.
///
/// The bridge calls every method with its internal lock held, so an
/// implementation must never call back into its [`WriteListener`] from inside
/// `write`, `close` or `is_ready`. Notifications come from the transport's
/// own execution context.
pub trait RawTransport: Sized {
    type Error;

    /// Hands `buf` to the transport. Only called while [`is_ready`](Self::is_ready)
    /// returns `true`.
    fn write(&mut self, buf: &[u8]) -> Result<(), Self::Error>;

    fn is_ready(&self) -> bool;

    /// Must be idempotent.
    fn close(&mut self) -> Result<(), Self::Error>;

    /// Whether the transport can raise readiness notifications at all.
    fn supports_non_blocking(&self) -> bool {
        true
    }

    /// Registers the listener that receives readiness and error
    /// notifications. Called once, when async mode starts.
    fn set_write_listener(&mut self, listener: WriteListener<Self>);
}

/// Notification handle handed to the transport on
/// [`start_async_mode`](AsyncWriteBridge::start_async_mode).
///
/// Keeps only a weak reference to the bridge. A buffered write holds the
/// bridge alive until the transport notifies, so a transport that buffers
/// must eventually raise either notification. Once the bridge is gone,
/// notifications are ignored.
pub struct WriteListener<T: RawTransport> {
    shared: Weak<Shared<T>>,
}

impl<T: RawTransport> WriteListener<T> {
    pub(crate) fn new(shared: Weak<Shared<T>>) -> Self {
        Self { shared }
    }

    fn bridge(&self) -> Option<AsyncWriteBridge<T>> {
        self.shared.upgrade().map(AsyncWriteBridge::from_shared)
    }

    /// The transport may accept another write.
    pub fn on_write_possible(&self) {
        match self.bridge() {
            Some(bridge) => bridge.on_write_possible(),
            None => {
                #[cfg(feature = "tracing")]
                tracing::trace!("Bridge dropped. Ignoring write possible notification");
            }
        }
    }

    /// The transport failed. The error goes to whatever continuation is
    /// outstanding.
    pub fn on_error(&self, error: T::Error) {
        match self.bridge() {
            Some(bridge) => bridge.on_error(error),
            None => {
                #[cfg(feature = "tracing")]
                tracing::trace!("Bridge dropped. Ignoring transport error notification");
            }
        }
    }
}

impl<T: RawTransport> Clone for WriteListener<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Weak::clone(&self.shared),
        }
    }
}

impl<T: RawTransport> core::fmt::Debug for WriteListener<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WriteListener")
            .field("attached", &(self.shared.strong_count() > 0))
            .finish()
    }
}
