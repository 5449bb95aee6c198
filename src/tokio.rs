use std::{
    io::{Error as IoError, ErrorKind},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use futures::SinkExt;
use spin::Mutex;
use tokio::{io::AsyncWrite as TokioAsyncWrite, sync::mpsc};
use tokio_util::{
    bytes::Bytes,
    codec::{BytesCodec, FramedWrite},
};

use crate::transport::{RawTransport, WriteListener};

#[derive(Clone, Debug)]
pub struct TokioTransportOptions {
    /// Capacity of the command channel to the driver task. Never below 2:
    /// one chunk plus the close.
    pub channel_capacity: usize,
}

impl Default for TokioTransportOptions {
    fn default() -> Self {
        Self {
            channel_capacity: 2,
        }
    }
}

enum Command {
    Write(Bytes),
    Close,
}

struct DriverState {
    busy: AtomicBool,
    listener: Mutex<Option<WriteListener<TokioTransport>>>,
}

impl DriverState {
    fn listener(&self) -> Option<WriteListener<TokioTransport>> {
        self.listener.lock().clone()
    }
}

/// [`RawTransport`] over any tokio [`AsyncWrite`](TokioAsyncWrite).
///
/// A spawned driver task owns the writer. [`write`](RawTransport::write)
/// hands one chunk to the task and the transport stays not ready until the
/// task has written it, then raises
/// [`on_write_possible`](WriteListener::on_write_possible). An I/O failure is
/// raised as [`on_error`](WriteListener::on_error) and stops the task.
pub struct TokioTransport {
    tx: mpsc::Sender<Command>,
    state: Arc<DriverState>,
    closed: bool,
}

impl TokioTransport {
    /// Must be called from within a tokio runtime.
    pub fn spawn<W>(writer: W) -> Self
    where
        W: TokioAsyncWrite + Unpin + Send + 'static,
    {
        Self::spawn_with_options(writer, TokioTransportOptions::default())
    }

    pub fn spawn_with_options<W>(writer: W, options: TokioTransportOptions) -> Self
    where
        W: TokioAsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(options.channel_capacity.max(2));
        let state = Arc::new(DriverState {
            busy: AtomicBool::new(false),
            listener: Mutex::new(None),
        });

        tokio::spawn(drive(writer, rx, Arc::clone(&state)));

        Self {
            tx,
            state,
            closed: false,
        }
    }
}

impl RawTransport for TokioTransport {
    type Error = IoError;

    fn write(&mut self, buf: &[u8]) -> Result<(), Self::Error> {
        if self.closed {
            return Err(IoError::new(ErrorKind::BrokenPipe, "Transport is closed"));
        }

        self.state.busy.store(true, Ordering::SeqCst);

        if self
            .tx
            .try_send(Command::Write(Bytes::copy_from_slice(buf)))
            .is_err()
        {
            self.state.busy.store(false, Ordering::SeqCst);

            return Err(IoError::new(ErrorKind::BrokenPipe, "Driver task stopped"));
        }

        Ok(())
    }

    fn is_ready(&self) -> bool {
        !self.state.busy.load(Ordering::SeqCst)
    }

    fn close(&mut self) -> Result<(), Self::Error> {
        if self.closed {
            return Ok(());
        }

        self.closed = true;

        // A stopped driver has already dropped the writer.
        let _ = self.tx.try_send(Command::Close);

        Ok(())
    }

    fn set_write_listener(&mut self, listener: WriteListener<Self>) {
        *self.state.listener.lock() = Some(listener);
    }
}

async fn drive<W>(writer: W, mut rx: mpsc::Receiver<Command>, state: Arc<DriverState>)
where
    W: TokioAsyncWrite + Unpin,
{
    let mut framed = FramedWrite::new(writer, BytesCodec::new());

    while let Some(command) = rx.recv().await {
        match command {
            Command::Write(bytes) => {
                #[cfg(feature = "tracing")]
                let len = bytes.len();

                match framed.send(bytes).await {
                    Ok(()) => {
                        #[cfg(feature = "tracing")]
                        tracing::trace!(%len, "Chunk written");

                        state.busy.store(false, Ordering::SeqCst);

                        if let Some(listener) = state.listener() {
                            listener.on_write_possible();
                        }
                    }
                    Err(error) => {
                        #[cfg(feature = "tracing")]
                        tracing::debug!(%error, "Failed to write chunk");

                        if let Some(listener) = state.listener() {
                            listener.on_error(error);
                        }

                        break;
                    }
                }
            }
            Command::Close => {
                if let Err(_error) = SinkExt::<Bytes>::close(&mut framed).await {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(error = %_error, "Failed to shut down writer");
                }

                break;
            }
        }
    }

    #[cfg(feature = "tracing")]
    tracing::trace!("Driver stopped");
}
