use gruel::ParkSignalChannelExt;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use utils::qos::{set_thread_qos, QosClass};
use utils::Mutex;

use vm_memory::GuestMemoryMmap;

use super::super::descriptor_utils::{Reader, Writer};
use super::super::{Queue, VIRTIO_MMIO_INT_VRING};
use super::device::{VsockSignalChannel, VsockSignalMask, RX_INDEX, TX_INDEX, VSOCK_QUEUE_SIGS};
use super::host::{reset_all, ConnEvent, VsockShared};
use super::protocol::{VsockHeader, OP_CREDIT_REQUEST, OP_RESPONSE, OP_RST, OP_RW, OP_SHUTDOWN};
use crate::legacy::Gic;

pub struct VsockWorker {
    signals: Arc<VsockSignalChannel>,
    queues: Vec<Queue>,
    interrupt_status: Arc<AtomicUsize>,
    intc: Option<Arc<Mutex<Gic>>>,
    irq_line: Option<u32>,

    mem: GuestMemoryMmap,
    shared: Arc<VsockShared>,
}

impl VsockWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        signals: Arc<VsockSignalChannel>,
        queues: Vec<Queue>,
        interrupt_status: Arc<AtomicUsize>,
        intc: Option<Arc<Mutex<Gic>>>,
        irq_line: Option<u32>,
        mem: GuestMemoryMmap,
        shared: Arc<VsockShared>,
    ) -> Self {
        VsockWorker {
            signals,
            queues,
            interrupt_status,
            intc,
            irq_line,
            mem,
            shared,
        }
    }

    pub fn run(self) -> thread::JoinHandle<()> {
        thread::Builder::new()
            .name("virtio-vsock worker".to_string())
            .spawn(move || {
                set_thread_qos(QosClass::Background, None).unwrap();
                self.work()
            })
            .expect("failed to spawn thread")
    }

    fn work(mut self) {
        let rx_ev = VSOCK_QUEUE_SIGS.get(RX_INDEX);
        let tx_ev = VSOCK_QUEUE_SIGS.get(TX_INDEX);
        let stop_ev = VsockSignalMask::SHUTDOWN_WORKER;
        let handled = rx_ev | tx_ev | VsockSignalMask::OUTBOUND | stop_ev;

        loop {
            self.signals.wait_on_park(handled);
            let taken = self.signals.take(handled);

            if taken.intersects(stop_ev) {
                reset_all(&self.shared.conns);
                return;
            }

            if taken.intersects(tx_ev) {
                self.drain_tx();
            }

            if taken.intersects(rx_ev | VsockSignalMask::OUTBOUND) {
                self.drain_outbound();
            }
        }
    }

    fn drain_tx(&mut self) {
        loop {
            self.queues[TX_INDEX].disable_notification(&self.mem).unwrap();
            self.process_tx();
            if !self.queues[TX_INDEX].enable_notification(&self.mem).unwrap() {
                break;
            }
        }
    }

    fn process_tx(&mut self) {
        let queue = &mut self.queues[TX_INDEX];
        while let Some(head) = queue.pop(&self.mem) {
            let mut reader = Reader::new(&self.mem, head.clone()).expect("vsock tx reader");

            let header = reader.read_obj::<VsockHeader>().ok();
            if let Some(header) = header {
                let payload_len = header.len as usize;
                let mut payload = vec![0u8; payload_len];
                let _ = reader.read_exact(&mut payload);
                self.handle_packet(header, payload);
            }

            // Pure driver->device queue: nothing for us to write back.
            if let Err(e) = queue.add_used(&self.mem, head.index, 0) {
                tracing::error!("vsock: failed to add used tx element: {:?}", e);
            }
        }
    }

    fn handle_packet(&self, header: VsockHeader, payload: Vec<u8>) {
        let mut conns = self.shared.conns.lock().unwrap();
        let Some(conn) = conns.by_src_port.get(&header.dst_port) else {
            return;
        };
        match header.op {
            OP_RESPONSE => {
                let _ = conn.events.send(ConnEvent::Connected);
            }
            OP_RW => {
                let _ = conn.events.send(ConnEvent::Data(payload));
            }
            OP_SHUTDOWN | OP_RST => {
                let _ = conn.events.send(ConnEvent::Closed);
                conns.by_src_port.remove(&header.dst_port);
            }
            OP_CREDIT_REQUEST => {}
            _ => {}
        }
    }

    fn drain_outbound(&mut self) {
        loop {
            let next = {
                let mut outbound = self.shared.outbound.lock().unwrap();
                if outbound.is_empty() {
                    return;
                }
                outbound.remove(0)
            };

            let Some(head) = self.queues[RX_INDEX].pop(&self.mem) else {
                // No rx buffer posted yet; put it back and wait for the
                // driver to post one or for another outbound kick.
                self.shared.outbound.lock().unwrap().insert(0, next);
                return;
            };

            let mut writer = Writer::new(&self.mem, head.clone()).expect("vsock rx writer");
            let written = writer.write(&next).unwrap_or(0);

            if let Err(e) = self.queues[RX_INDEX].add_used(&self.mem, head.index, written as u32) {
                tracing::error!("vsock: failed to add used rx element: {:?}", e);
            }

            if self.queues[RX_INDEX].needs_notification(&self.mem).unwrap() {
                self.interrupt_status.fetch_or(VIRTIO_MMIO_INT_VRING as usize, Ordering::SeqCst);
                if let Some(intc) = &self.intc {
                    if let Some(irq_line) = self.irq_line {
                        intc.lock().unwrap().set_irq(irq_line);
                    }
                }
            }
        }
    }
}
