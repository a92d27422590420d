//! Host-side API: connect to a port the guest is listening on, exchange
//! byte frames, close. Wraps the device's outbound queue and the worker's
//! per-port inbound demux.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};

use super::protocol::{VsockHeader, OP_REQUEST, OP_RW, OP_SHUTDOWN};
use super::device::{VsockSignalChannel, VsockSignalMask};

#[derive(Debug, thiserror::Error)]
pub enum VsockError {
    #[error("guest reset the connection")]
    Reset,
    #[error("timed out waiting for the guest")]
    Timeout,
    #[error("connection already closed")]
    Closed,
}

pub(super) enum ConnEvent {
    Connected,
    Data(Vec<u8>),
    Closed,
}

pub(super) struct PendingConn {
    pub src_port: u32,
    pub events: Sender<ConnEvent>,
}

#[derive(Default)]
pub(super) struct Connections {
    pub by_src_port: HashMap<u32, PendingConn>,
}

/// Shared state reachable from both the host-facing [`VsockChannel`] API
/// and the worker thread parsing the guest's tx queue.
pub struct VsockShared {
    pub(super) signals: Arc<VsockSignalChannel>,
    pub(super) outbound: Mutex<Vec<Vec<u8>>>,
    pub(super) conns: Mutex<Connections>,
    next_port: AtomicU32,
}

impl VsockShared {
    pub(super) fn new(signals: Arc<VsockSignalChannel>) -> Self {
        VsockShared {
            signals,
            outbound: Mutex::new(Vec::new()),
            conns: Mutex::new(Connections::default()),
            next_port: AtomicU32::new(0x8000_0000),
        }
    }

    fn enqueue(&self, header: VsockHeader, payload: &[u8]) {
        let mut frame = header.as_slice().to_vec();
        frame.extend_from_slice(payload);
        self.outbound.lock().unwrap().push(frame);
        self.signals.assert(VsockSignalMask::OUTBOUND);
    }
}

/// A connection the host opened to a port the guest is listening on.
pub struct VsockChannel {
    shared: Arc<VsockShared>,
    src_port: u32,
    dst_port: u32,
    events: Receiver<ConnEvent>,
}

impl VsockChannel {
    /// Sends a `VIRTIO_VSOCK_OP_REQUEST` and blocks until the guest accepts
    /// it with `OP_RESPONSE` or the timeout elapses.
    pub fn connect(shared: Arc<VsockShared>, dst_port: u32, timeout: Duration) -> Result<Self, VsockError> {
        let src_port = shared.next_port.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = bounded(16);
        shared
            .conns
            .lock()
            .unwrap()
            .by_src_port
            .insert(src_port, PendingConn { src_port, events: tx });

        shared.enqueue(VsockHeader::new(src_port, dst_port, OP_REQUEST, 0), &[]);

        let channel = VsockChannel { shared, src_port, dst_port, events: rx };
        match channel.events.recv_timeout(timeout) {
            Ok(ConnEvent::Connected) => Ok(channel),
            Ok(ConnEvent::Closed) | Err(RecvTimeoutError::Disconnected) => Err(VsockError::Reset),
            Ok(ConnEvent::Data(_)) => Ok(channel),
            Err(RecvTimeoutError::Timeout) => Err(VsockError::Timeout),
        }
    }

    pub fn send(&self, data: &[u8]) {
        self.shared
            .enqueue(VsockHeader::new(self.src_port, self.dst_port, OP_RW, data.len() as u32), data);
    }

    /// Collects `OP_RW` payloads until the guest shuts the connection down
    /// or the timeout elapses, returning the concatenated bytes.
    pub fn recv_until_closed(&self, timeout: Duration) -> Result<Vec<u8>, VsockError> {
        let mut buf = Vec::new();
        loop {
            match self.events.recv_timeout(timeout) {
                Ok(ConnEvent::Data(chunk)) => buf.extend_from_slice(&chunk),
                Ok(ConnEvent::Closed) => return Ok(buf),
                Ok(ConnEvent::Connected) => continue,
                Err(RecvTimeoutError::Disconnected) => return Ok(buf),
                Err(RecvTimeoutError::Timeout) => return Err(VsockError::Timeout),
            }
        }
    }
}

impl Drop for VsockChannel {
    fn drop(&mut self) {
        self.shared.conns.lock().unwrap().by_src_port.remove(&self.src_port);
        self.shared
            .enqueue(VsockHeader::new(self.src_port, self.dst_port, OP_SHUTDOWN, 0), &[]);
    }
}

pub(super) fn reset_all(conns: &Mutex<Connections>) {
    for (_, conn) in conns.lock().unwrap().by_src_port.drain() {
        let _ = conn.events.send(ConnEvent::Closed);
    }
}
