//! Byte-oriented channel between two registries.
//!
//! The transport is opaque: it moves encoded [`Frame`]s and nothing else.
//! [`MemoryChannel`] is the in-process implementation used when both sides
//! share an address space and by the tests.

use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use dmreg_core::error::{ErrorKind, Result};

use crate::frame::Frame;

pub trait Channel: Send + Sync {
    fn send(&self, bytes: Vec<u8>) -> Result<()>;

    /// Wait up to `timeout` for the next message. `Ok(None)` on timeout.
    fn recv_timeout(&self, timeout: Duration) -> Result<Option<Vec<u8>>>;

    fn send_frame(&self, frame: &Frame) -> Result<()> {
        self.send(frame.encode())
    }
}

/// One end of an in-memory duplex channel.
#[derive(Debug, Clone)]
pub struct MemoryChannel {
    tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
}

impl MemoryChannel {
    /// Two connected ends: what one sends, the other receives.
    pub fn pair() -> (MemoryChannel, MemoryChannel) {
        let (a_tx, b_rx) = crossbeam_channel::unbounded();
        let (b_tx, a_rx) = crossbeam_channel::unbounded();
        (
            MemoryChannel { tx: a_tx, rx: a_rx },
            MemoryChannel { tx: b_tx, rx: b_rx },
        )
    }
}

impl Channel for MemoryChannel {
    fn send(&self, bytes: Vec<u8>) -> Result<()> {
        self.tx.send(bytes).map_err(|_| ErrorKind::ChannelClosed.into())
    }

    fn recv_timeout(&self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        match self.rx.recv_timeout(timeout) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(ErrorKind::ChannelClosed.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dropped_peer_reports_closed() {
        let (a, b) = MemoryChannel::pair();
        a.send(vec![7]).unwrap();
        assert_eq!(b.recv_timeout(Duration::from_millis(10)).unwrap(), Some(vec![7]));
        assert_eq!(b.recv_timeout(Duration::from_millis(1)).unwrap(), None);
        drop(a);
        let err = b.recv_timeout(Duration::from_millis(1)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ChannelClosed);
    }
}
