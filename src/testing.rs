//! A scripted `Port` used as the fixture for every Bus/Calibration/Teleop
//! test in this crate and in `tests/`. Records written bytes and returns
//! pre-programmed replies; an empty reply simulates a silent servo, which
//! the Bus must treat as a timeout.

use std::collections::VecDeque;
use std::time::Duration;

use crate::error::BusError;
use crate::port::Port;

/// A fake half-duplex port driven entirely by a queue of scripted replies.
pub struct FakePort {
    pub written: Vec<Vec<u8>>,
    pub replies: VecDeque<Vec<u8>>,
    pub closed: bool,
}

impl FakePort {
    pub fn new() -> FakePort {
        FakePort {
            written: Vec::new(),
            replies: VecDeque::new(),
            closed: false,
        }
    }

    /// Queue a reply to be returned by the next `read` call.
    pub fn queue_reply(&mut self, bytes: Vec<u8>) {
        self.replies.push_back(bytes);
    }

    /// Queue an empty reply (simulates a silent/non-responding servo).
    pub fn queue_timeout(&mut self) {
        self.replies.push_back(Vec::new());
    }
}

impl Default for FakePort {
    fn default() -> Self {
        Self::new()
    }
}

impl Port for FakePort {
    fn write(&mut self, bytes: &[u8]) -> Result<(), BusError> {
        self.written.push(bytes.to_vec());
        Ok(())
    }

    fn read(&mut self, _deadline: Duration) -> Result<Vec<u8>, BusError> {
        Ok(self.replies.pop_front().unwrap_or_default())
    }

    fn flush_rx(&mut self) {
        // A real flush only drains bytes already sitting in the OS buffer
        // before this call; it has no effect on replies that arrive later
        // in response to a request we haven't sent yet. The scripted reply
        // queue here represents exactly that "not yet arrived" state, so
        // there is nothing stale to discard.
    }

    fn close(&mut self) {
        self.closed = true;
    }
}
