//! SENDME flow control
//!
//! Window-based flow control at circuit and stream scope.
//!
//! Windows (tor-spec §7.3/7.4):
//! - circuit: initial 1000, increment 100 per SENDME
//! - stream: initial 500, increment 50 per SENDME
//!
//! The send window must stay positive to transmit DATA; it is replenished
//! when a SENDME arrives. The deliver window counts inbound DATA; every
//! time it drops by a full increment we owe the far end a SENDME. The
//! engine may withhold that SENDME to apply backpressure when a stream's
//! incoming buffer is full.

use crate::error::{Result, TorError};

/// Circuit-level flow control.
#[derive(Debug, Clone)]
pub struct CircuitFlowControl {
    /// DATA cells we may still send before a SENDME must arrive
    pub send_window: i32,

    /// DATA cells the far end may still send us
    pub deliver_window: i32,
}

impl CircuitFlowControl {
    /// Initial circuit window (1000 cells)
    pub const INITIAL_WINDOW: i32 = 1000;

    /// Window increment per SENDME (100 cells)
    pub const WINDOW_INCREMENT: i32 = 100;

    pub fn new() -> Self {
        Self {
            send_window: Self::INITIAL_WINDOW,
            deliver_window: Self::INITIAL_WINDOW,
        }
    }

    /// Whether a DATA cell may be sent now.
    pub fn can_send(&self) -> bool {
        self.send_window > 0
    }

    /// Account for one outbound DATA cell.
    pub fn note_sent(&mut self) -> Result<()> {
        if self.send_window <= 0 {
            return Err(TorError::Stream("circuit send window exhausted".into()));
        }
        self.send_window -= 1;
        Ok(())
    }

    /// A circuit-level SENDME arrived.
    pub fn note_sendme_received(&mut self) {
        self.send_window += Self::WINDOW_INCREMENT;
        log::trace!("circuit send window now {}", self.send_window);
    }

    /// Account for one inbound DATA cell. Returns true when a circuit
    /// SENDME is now owed (window hit a multiple of the increment below
    /// the initial value).
    pub fn note_received(&mut self) -> Result<bool> {
        self.deliver_window -= 1;
        if self.deliver_window < 0 {
            return Err(TorError::Protocol(
                "peer overflowed circuit deliver window".into(),
            ));
        }
        Ok(self.deliver_window % Self::WINDOW_INCREMENT == 0
            && self.deliver_window < Self::INITIAL_WINDOW)
    }

    /// Account for a circuit SENDME we actually sent.
    pub fn note_sendme_sent(&mut self) {
        self.deliver_window += Self::WINDOW_INCREMENT;
    }
}

impl Default for CircuitFlowControl {
    fn default() -> Self {
        Self::new()
    }
}

/// Stream-level flow control.
#[derive(Debug, Clone)]
pub struct StreamFlowControl {
    pub send_window: i32,
    pub deliver_window: i32,
    pub stream_id: u16,
}

impl StreamFlowControl {
    /// Initial stream window (500 cells)
    pub const INITIAL_WINDOW: i32 = 500;

    /// Window increment per SENDME (50 cells)
    pub const WINDOW_INCREMENT: i32 = 50;

    pub fn new(stream_id: u16) -> Self {
        Self {
            send_window: Self::INITIAL_WINDOW,
            deliver_window: Self::INITIAL_WINDOW,
            stream_id,
        }
    }

    pub fn can_send(&self) -> bool {
        self.send_window > 0
    }

    pub fn note_sent(&mut self) -> Result<()> {
        if self.send_window <= 0 {
            return Err(TorError::Stream(format!(
                "stream {} send window exhausted",
                self.stream_id
            )));
        }
        self.send_window -= 1;
        Ok(())
    }

    pub fn note_sendme_received(&mut self) {
        self.send_window += Self::WINDOW_INCREMENT;
        log::trace!(
            "stream {} send window now {}",
            self.stream_id,
            self.send_window
        );
    }

    /// Returns true when a stream SENDME is owed.
    pub fn note_received(&mut self) -> Result<bool> {
        self.deliver_window -= 1;
        if self.deliver_window < 0 {
            return Err(TorError::Protocol(format!(
                "peer overflowed stream {} deliver window",
                self.stream_id
            )));
        }
        Ok(self.deliver_window % Self::WINDOW_INCREMENT == 0
            && self.deliver_window < Self::INITIAL_WINDOW)
    }

    pub fn note_sendme_sent(&mut self) {
        self.deliver_window += Self::WINDOW_INCREMENT;
    }
}
