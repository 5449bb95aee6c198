#![no_std]

extern crate alloc;

#[cfg(any(feature = "std", test))]
extern crate std;

pub mod aggregate;
pub mod bridge;
pub mod error;
pub mod pending;
pub mod transport;

#[cfg(feature = "futures")]
pub mod futures;

#[cfg(feature = "tokio")]
pub mod tokio;

pub use aggregate::{AggregatingBufferedStream, AggregatingOptions};
pub use bridge::AsyncWriteBridge;
pub use error::BridgeError;
pub use pending::{BridgeResult, Completion, Continuation};
pub use transport::{RawTransport, WriteListener};
