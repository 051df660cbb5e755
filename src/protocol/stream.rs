//! Stream layer
//!
//! A [`TorStream`] is a TCP-like byte stream multiplexed over a circuit.
//! Writes are chunked into RELAY DATA cells and block while either the
//! stream or circuit window is closed; reads pull from the buffer the
//! circuit engine fills on inbound DATA.
//!
//! A stream never outlives its circuit: once the circuit closes, reads see
//! EOF and writes fail with `CircuitClosed`.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::error::{Result, TorError};
use crate::protocol::cell::RelayCell;
use crate::protocol::circuit::{CircuitHandle, StreamEvent, StreamTarget};

/// END reason sent on orderly local close
pub const END_REASON_DONE: u8 = 6;

/// A stream attached to a circuit.
pub struct TorStream {
    stream_id: u16,
    circuit: CircuitHandle,
    events: mpsc::Receiver<StreamEvent>,
    read_buf: VecDeque<u8>,
    eof: bool,
    closed: bool,
}

impl TorStream {
    /// Open a stream to `host:port` through the circuit's exit.
    pub async fn open(
        circuit: &CircuitHandle,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<TorStream> {
        let attachment = circuit
            .open_stream(
                StreamTarget::Exit {
                    host: host.to_string(),
                    port,
                },
                timeout,
            )
            .await?;
        log::debug!(
            "stream {} open on circuit {} to {}:{}",
            attachment.stream_id,
            circuit.circ_id,
            host,
            port
        );
        Ok(TorStream {
            stream_id: attachment.stream_id,
            circuit: circuit.clone(),
            events: attachment.events,
            read_buf: VecDeque::new(),
            eof: false,
            closed: false,
        })
    }

    /// Open a directory stream (BEGIN_DIR) to the circuit's last hop.
    pub async fn open_dir(circuit: &CircuitHandle, timeout: Duration) -> Result<TorStream> {
        let attachment = circuit.open_stream(StreamTarget::Dir, timeout).await?;
        Ok(TorStream {
            stream_id: attachment.stream_id,
            circuit: circuit.clone(),
            events: attachment.events,
            read_buf: VecDeque::new(),
            eof: false,
            closed: false,
        })
    }

    pub fn stream_id(&self) -> u16 {
        self.stream_id
    }

    pub fn circuit(&self) -> &CircuitHandle {
        &self.circuit
    }

    /// Write all bytes, chunked into DATA cells. Blocks while flow-control
    /// windows are exhausted; data is never dropped.
    pub async fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        if self.closed {
            return Err(TorError::Stream("stream closed".into()));
        }
        if !self.circuit.is_open() {
            return Err(TorError::CircuitClosed);
        }
        for chunk in bytes.chunks(RelayCell::MAX_DATA_SIZE) {
            self.circuit
                .stream_send(self.stream_id, chunk.to_vec())
                .await?;
        }
        Ok(())
    }

    /// Read some bytes into `buf`, waiting for data if none is buffered.
    /// Returns 0 at end of stream.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.closed {
            return Err(TorError::Stream("stream closed".into()));
        }

        while self.read_buf.is_empty() {
            if self.eof {
                return Ok(0);
            }
            match self.events.recv().await {
                Some(StreamEvent::Data(data)) => {
                    self.read_buf.extend(data);
                }
                Some(StreamEvent::End(reason)) => {
                    log::debug!("stream {} ended, reason {}", self.stream_id, reason);
                    self.eof = true;
                }
                None => {
                    // Engine dropped the channel: circuit went away.
                    self.eof = true;
                    if !self.circuit.is_open() {
                        return Err(TorError::CircuitClosed);
                    }
                }
            }
        }

        let n = buf.len().min(self.read_buf.len());
        for slot in buf.iter_mut().take(n) {
            *slot = self.read_buf.pop_front().expect("buffer nonempty");
        }
        Ok(n)
    }

    /// Read until EOF, up to `limit` bytes.
    pub async fn read_to_end(&mut self, limit: usize) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = self.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            out.extend_from_slice(&chunk[..n]);
            if out.len() >= limit {
                return Err(TorError::ResourceExhausted(format!(
                    "stream response exceeds {} bytes",
                    limit
                )));
            }
        }
        Ok(out)
    }

    /// Send END and mark the stream closed. Idempotent.
    pub async fn close(&mut self, reason: u8) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.circuit.close_stream(self.stream_id, reason).await;
    }
}

impl Drop for TorStream {
    fn drop(&mut self) {
        if !self.closed && self.circuit.is_open() {
            // Orderly close without awaiting: hand off to the reactor.
            let circuit = self.circuit.clone();
            let stream_id = self.stream_id;
            tokio::spawn(async move {
                circuit.close_stream(stream_id, END_REASON_DONE).await;
            });
        }
    }
}
