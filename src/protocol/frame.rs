//! Reassembly of notification fragments into messages.

use tracing::{trace, warn};

use crate::protocol::message::{self, ParseOutcome, ProtocolMessage};

/// Accumulates text fragments of one connection into whole messages.
///
/// A fragment that starts with a message prefix replaces whatever was
/// buffered; an unfinished message interrupted by a new one is lost.
#[derive(Debug, Clone)]
pub struct FrameAssembler {
    buffer: String,
    max_len: usize,
}

impl FrameAssembler {
    /// Create an assembler that abandons buffers longer than `max_len` bytes.
    pub fn new(max_len: usize) -> Self {
        Self {
            buffer: String::new(),
            max_len,
        }
    }

    /// Feed one fragment and return the message it completes, if any.
    pub fn push(&mut self, fragment: &str) -> Option<ProtocolMessage> {
        if message::starts_message(fragment) {
            if !self.buffer.is_empty() {
                trace!("Discarding unfinished frame {:?}", self.buffer);
            }
            self.buffer.clear();
        }
        self.buffer.push_str(fragment);

        match message::parse(&self.buffer) {
            ParseOutcome::Complete(msg) => {
                trace!("Frame complete: {:?}", self.buffer);
                self.buffer.clear();
                Some(msg)
            }
            ParseOutcome::Incomplete => {
                if self.buffer.len() > self.max_len {
                    warn!(
                        "Frame buffer exceeded {} bytes without completing, discarding",
                        self.max_len
                    );
                    self.buffer.clear();
                }
                None
            }
        }
    }

    /// Characters received since the last message boundary.
    pub fn pending(&self) -> &str {
        &self.buffer
    }

    /// Drop any buffered content.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new(512)
    }
}
