//! Message transports between an engine and its controller.
//!
//! A [`Channel`] moves whole JSON messages. The engine polls it with a short
//! timeout so it can keep checking its parent process between messages.

use std::io::{Read, Write};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::thread;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{Error, Result};

use super::protocol::{read_frame, write_frame};

/// Bidirectional message channel.
pub trait Channel: Send {
    /// Wait up to `timeout` for the next raw message.
    ///
    /// Returns `Ok(None)` when nothing usable arrived in time and
    /// `Err(Error::ChannelClosed)` once the peer is gone.
    fn receive(&mut self, timeout: Duration) -> Result<Option<String>>;

    /// Send one raw message.
    fn send(&mut self, message: &str) -> Result<()>;
}

/// Serialize `message` and send it.
pub fn send_json<T: Serialize + ?Sized>(channel: &mut dyn Channel, message: &T) -> Result<()> {
    let text = serde_json::to_string(message)?;
    channel.send(&text)
}

/// Receive and decode the next message.
pub fn receive_json<T: DeserializeOwned>(
    channel: &mut dyn Channel,
    timeout: Duration,
) -> Result<Option<T>> {
    match channel.receive(timeout)? {
        Some(text) => Ok(Some(serde_json::from_str(&text)?)),
        None => Ok(None),
    }
}

/// Length-prefixed frames over a byte stream pair, usually stdin/stdout.
///
/// Reads happen on a background thread so `receive` can time out.
pub struct StdioChannel<W: Write + Send> {
    incoming: Receiver<Result<Vec<u8>>>,
    writer: W,
}

impl<W: Write + Send> StdioChannel<W> {
    /// Create a channel reading frames from `reader` and writing to `writer`.
    pub fn new<R: Read + Send + 'static>(mut reader: R, writer: W) -> Self {
        let (tx, incoming) = mpsc::channel();

        let spawned = thread::Builder::new()
            .name("sable-channel-reader".to_string())
            .spawn(move || {
                loop {
                    match read_frame(&mut reader) {
                        Ok(Some(frame)) => {
                            if tx.send(Ok(frame)).is_err() {
                                break;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            let _ = tx.send(Err(e));
                            break;
                        }
                    }
                }
                tracing::debug!("Channel reader finished");
            });
        if let Err(e) = spawned {
            tracing::error!("Failed to start channel reader: {}", e);
        }

        Self { incoming, writer }
    }
}

impl StdioChannel<std::io::BufWriter<std::io::Stdout>> {
    /// Channel over the process's own stdin and stdout.
    pub fn from_stdio() -> Self {
        Self::new(std::io::stdin(), std::io::BufWriter::new(std::io::stdout()))
    }
}

impl<W: Write + Send> Channel for StdioChannel<W> {
    fn receive(&mut self, timeout: Duration) -> Result<Option<String>> {
        let frame = if timeout.is_zero() {
            match self.incoming.try_recv() {
                Ok(frame) => frame,
                Err(TryRecvError::Empty) => return Ok(None),
                Err(TryRecvError::Disconnected) => return Err(Error::ChannelClosed),
            }
        } else {
            match self.incoming.recv_timeout(timeout) {
                Ok(frame) => frame,
                Err(RecvTimeoutError::Timeout) => return Ok(None),
                Err(RecvTimeoutError::Disconnected) => return Err(Error::ChannelClosed),
            }
        }?;

        match String::from_utf8(frame) {
            Ok(text) => Ok(Some(text)),
            Err(e) => {
                tracing::warn!(
                    len = e.as_bytes().len(),
                    error = %e.utf8_error(),
                    "Dropping frame that is not valid UTF-8"
                );
                Ok(None)
            }
        }
    }

    fn send(&mut self, message: &str) -> Result<()> {
        write_frame(&mut self.writer, message.as_bytes())
    }
}

/// In-process channel endpoint.
pub struct MemoryChannel {
    tx: Sender<String>,
    rx: Receiver<String>,
}

impl MemoryChannel {
    /// Two connected endpoints.
    pub fn pair() -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::channel();
        let (b_tx, a_rx) = mpsc::channel();
        (Self { tx: a_tx, rx: a_rx }, Self { tx: b_tx, rx: b_rx })
    }
}

impl Channel for MemoryChannel {
    fn receive(&mut self, timeout: Duration) -> Result<Option<String>> {
        match self.rx.recv_timeout(timeout) {
            Ok(message) => Ok(Some(message)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(Error::ChannelClosed),
        }
    }

    fn send(&mut self, message: &str) -> Result<()> {
        self.tx
            .send(message.to_string())
            .map_err(|_| Error::ChannelClosed)
    }
}
