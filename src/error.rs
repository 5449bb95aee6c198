use alloc::sync::Arc;

/// Failure reported to a write, flush or complete continuation.
///
/// The transport payload sits behind an [`Arc`] because a single transport
/// failure is delivered to every outstanding continuation.
#[derive(Debug)]
pub enum BridgeError<E> {
    /// The transport cannot do non-blocking writes.
    Unsupported,
    /// `start_async_mode` has not been called yet.
    NotStarted,
    /// The bridge was closed.
    Closed,
    /// A write was submitted while another one is still buffered.
    WriteContention,
    /// A flush was requested while another one is still pending.
    FlushContention,
    /// A completion was requested while another one is still pending.
    CompleteContention,
    /// The transport failed to write or to close.
    Transport(Arc<E>),
}

impl<E> BridgeError<E> {
    pub(crate) fn transport(error: E) -> Self {
        Self::Transport(Arc::new(error))
    }

    /// Caller broke the single-writer, single-flush discipline or used the
    /// bridge outside of its lifecycle.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Self::NotStarted
                | Self::Closed
                | Self::WriteContention
                | Self::FlushContention
                | Self::CompleteContention
        )
    }

    pub fn as_transport(&self) -> Option<&E> {
        match self {
            Self::Transport(error) => Some(error),
            _ => None,
        }
    }
}

impl<E> Clone for BridgeError<E> {
    fn clone(&self) -> Self {
        match self {
            Self::Unsupported => Self::Unsupported,
            Self::NotStarted => Self::NotStarted,
            Self::Closed => Self::Closed,
            Self::WriteContention => Self::WriteContention,
            Self::FlushContention => Self::FlushContention,
            Self::CompleteContention => Self::CompleteContention,
            Self::Transport(error) => Self::Transport(Arc::clone(error)),
        }
    }
}

#[cfg(feature = "std")]
const _: () = {
    impl<E: std::fmt::Display> std::fmt::Display for BridgeError<E> {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                Self::Unsupported => write!(f, "Transport does not support non-blocking writes"),
                Self::NotStarted => write!(f, "Async mode was not started"),
                Self::Closed => write!(f, "Bridge is closed"),
                Self::WriteContention => write!(f, "A write is already buffered"),
                Self::FlushContention => write!(f, "A flush is already pending"),
                Self::CompleteContention => write!(f, "A completion is already pending"),
                Self::Transport(error) => write!(f, "Transport error: {}", error),
            }
        }
    }

    impl<E: std::error::Error + 'static> std::error::Error for BridgeError<E> {
        fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
            match self {
                Self::Transport(error) => Some(&**error),
                _ => None,
            }
        }
    }
};
