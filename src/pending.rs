use alloc::{boxed::Box, sync::Arc};
use bytes::Bytes;

use crate::{
    bridge::{AsyncWriteBridge, Shared},
    error::BridgeError,
    transport::RawTransport,
};

pub type BridgeResult<T> = Result<(), BridgeError<<T as RawTransport>::Error>>;

/// Boxed write completion, stored while its bytes wait for the transport.
pub type Completion<T> = Box<dyn FnOnce(&AsyncWriteBridge<T>, BridgeResult<T>) + Send>;

/// Boxed flush or complete continuation.
pub type Continuation<T> = Box<dyn FnOnce(BridgeResult<T>) + Send>;

/// Bytes submitted by the producer. Borrowed bytes are copied only when they
/// have to be buffered.
pub(crate) enum Payload<'a> {
    Borrowed(&'a [u8]),
    Owned(Bytes),
}

impl Payload<'_> {
    pub(crate) fn as_slice(&self) -> &[u8] {
        match self {
            Self::Borrowed(buf) => buf,
            Self::Owned(bytes) => bytes,
        }
    }

    pub(crate) fn into_bytes(self) -> Bytes {
        match self {
            Self::Borrowed(buf) => Bytes::copy_from_slice(buf),
            Self::Owned(bytes) => bytes,
        }
    }
}

/// The single write slot of the bridge.
pub(crate) struct PendingWrite<T: RawTransport> {
    bytes: Bytes,
    completion: Completion<T>,
}

impl<T: RawTransport> PendingWrite<T> {
    pub(crate) fn new(payload: Payload<'_>, completion: Completion<T>) -> Self {
        Self {
            bytes: payload.into_bytes(),
            completion,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.bytes.len()
    }

    pub(crate) fn into_parts(self) -> (Bytes, Completion<T>) {
        (self.bytes, self.completion)
    }
}

/// Everything that waits on the buffered write to leave the bridge.
pub(crate) struct Buffered<T: RawTransport> {
    pub(crate) write: PendingWrite<T>,
    pub(crate) flush: Option<Continuation<T>>,
    pub(crate) complete: Option<Continuation<T>>,
    pub(crate) close_queued: bool,
    /// Holds the bridge alive until the write drains or fails, even if the
    /// producer drops every handle.
    pub(crate) keep_alive: Arc<Shared<T>>,
}

impl<T: RawTransport> Buffered<T> {
    pub(crate) fn new(write: PendingWrite<T>, keep_alive: Arc<Shared<T>>) -> Self {
        Self {
            write,
            flush: None,
            complete: None,
            close_queued: false,
            keep_alive,
        }
    }
}
