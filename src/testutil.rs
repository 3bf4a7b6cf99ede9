//! Shared test plumbing: a software controller and helpers that play the
//! hardware's role by retiring qTDs directly.

use crate::ehci::qtd::token;
use crate::ehci::HcOps;
use crate::error::Result;
use crate::host::{HostCore, UsbHost};
use crate::pool::{DeviceId, PipeId, TransferId};
use crate::transfer::MAX_CHAIN;
use core::sync::atomic::Ordering;

/// Controller stand-in with a software frame counter.
pub(crate) struct MockHc {
    pub frame: u32,
    /// Async-advance doorbell rings observed
    pub doorbell_rings: u32,
    /// Schedule head addresses handed over at start
    pub async_head_addr: u32,
    pub periodic_head_addr: u32,
}

impl MockHc {
    pub fn new() -> Self {
        Self {
            frame: 0,
            doorbell_rings: 0,
            async_head_addr: 0,
            periodic_head_addr: 0,
        }
    }
}

impl HcOps for MockHc {
    fn frame_number(&self) -> u32 {
        self.frame & 0x7FF
    }

    fn async_advance(&mut self) -> Result<()> {
        self.doorbell_rings += 1;
        Ok(())
    }

    fn enable_async_schedule(&mut self, head_addr: u32) -> Result<()> {
        self.async_head_addr = head_addr;
        Ok(())
    }

    fn enable_periodic_schedule(&mut self, head_addr: u32) -> Result<()> {
        self.periodic_head_addr = head_addr;
        Ok(())
    }

    fn wait_frame_boundary(&mut self) -> Result<()> {
        self.frame += 1;
        Ok(())
    }
}

/// Records of the oldest chain queued on a pipe.
pub(crate) fn chain_ids(
    core: &HostCore<MockHc>,
    pipe: PipeId,
) -> heapless::Vec<TransferId, MAX_CHAIN> {
    let mut out = heapless::Vec::new();
    let mut cursor = core.pipes.get(pipe.index()).followup_head;
    while let Some(id) = cursor {
        let transfer = core.transfers.get(id.index());
        let _ = out.push(id);
        if transfer.chain_final {
            break;
        }
        cursor = transfer.next_followup;
    }
    out
}

/// Records of the oldest chain whose final segment is still active.
/// Repeated retire calls walk forward through the followup list the way
/// the controller would.
fn pending_chain(
    core: &HostCore<MockHc>,
    pipe: PipeId,
) -> heapless::Vec<TransferId, MAX_CHAIN> {
    let mut start = core.pipes.get(pipe.index()).followup_head;
    loop {
        let mut ids: heapless::Vec<TransferId, MAX_CHAIN> = heapless::Vec::new();
        let mut cursor = start;
        while let Some(id) = cursor {
            let transfer = core.transfers.get(id.index());
            let _ = ids.push(id);
            cursor = transfer.next_followup;
            if transfer.chain_final {
                break;
            }
        }
        let Some(&last) = ids.last() else {
            return ids;
        };
        if core.transfers.get(last.index()).qtd.is_active() {
            return ids;
        }
        start = cursor;
    }
}

/// Retire the oldest still-active chain on a pipe as fully successful.
/// The controller counts Total Bytes down as it moves data, so a full
/// transfer retires with the field at zero.
pub(crate) fn complete_chain(core: &HostCore<MockHc>, pipe: PipeId) {
    for id in pending_chain(core, pipe) {
        let qtd = &core.transfers.get(id.index()).qtd;
        let tok = qtd.token.load(Ordering::Relaxed)
            & !token::STATUS_ACTIVE
            & !(token::TOTAL_BYTES_MASK << token::TOTAL_BYTES_SHIFT);
        qtd.token.store(tok, Ordering::Relaxed);
    }
}

/// Retire the oldest chain with a short final data segment.
pub(crate) fn complete_chain_short(core: &HostCore<MockHc>, pipe: PipeId, remaining: u32) {
    let ids = pending_chain(core, pipe);
    let last_data = ids
        .iter()
        .rev()
        .find(|id| core.transfers.get(id.index()).counts_bytes)
        .copied();
    for id in ids {
        let qtd = &core.transfers.get(id.index()).qtd;
        let mut tok = qtd.token.load(Ordering::Relaxed)
            & !token::STATUS_ACTIVE
            & !(token::TOTAL_BYTES_MASK << token::TOTAL_BYTES_SHIFT);
        if Some(id) == last_data {
            tok |= remaining << token::TOTAL_BYTES_SHIFT;
        }
        qtd.token.store(tok, Ordering::Relaxed);
    }
}

/// Halt the oldest chain at its first segment with an error condition.
pub(crate) fn fail_chain(core: &HostCore<MockHc>, pipe: PipeId, error_bit: u32) {
    let ids = pending_chain(core, pipe);
    let qtd = &core.transfers.get(ids[0].index()).qtd;
    let tok = qtd.token.load(Ordering::Relaxed);
    qtd.token.store(
        (tok & !token::STATUS_ACTIVE) | token::STATUS_HALTED | error_bit,
        Ordering::Relaxed,
    );
}

/// A plausible full-speed device descriptor.
pub(crate) fn device_descriptor(class: u8, max_packet0: u8, vid: u16, pid: u16) -> [u8; 18] {
    let v = vid.to_le_bytes();
    let p = pid.to_le_bytes();
    [
        18, 1, 0x00, 0x02, class, 0, 0, max_packet0, v[0], v[1], p[0], p[1], 0x00, 0x01, 1, 2,
        0, 1,
    ]
}

/// Configuration with one interface of the given class and one
/// interrupt IN endpoint. `total_length` is self-consistent.
pub(crate) fn single_interface_config(iface_class: u8, ep_addr: u8, ep_max_packet: u8) -> [u8; 25] {
    let mut buf = [0u8; 25];
    buf[..9].copy_from_slice(&[9, 2, 25, 0, 1, 1, 0, 0xA0, 50]);
    buf[9..18].copy_from_slice(&[9, 4, 0, 0, 1, iface_class, 0, 0, 0]);
    buf[18..25].copy_from_slice(&[7, 5, ep_addr, 3, ep_max_packet, 0, 12]);
    buf
}

/// Inject descriptor bytes where the controller would have DMAed them.
pub(crate) fn put_enum_data(core: &mut HostCore<MockHc>, device: DeviceId, bytes: &[u8]) {
    core.devices.get_mut(device.index()).enum_buf[..bytes.len()].copy_from_slice(bytes);
}

/// Complete the in-flight enumeration step, optionally planting IN data
/// first, then run the dispatcher.
pub(crate) fn enum_step<const N: usize>(
    host: &mut UsbHost<MockHc, N>,
    device: DeviceId,
    data: Option<&[u8]>,
) {
    let pipe = host
        .core
        .devices
        .get(device.index())
        .control_pipe
        .expect("enumerating device has a control pipe");
    if let Some(bytes) = data {
        put_enum_data(&mut host.core, device, bytes);
    }
    complete_chain(&host.core, pipe);
    host.on_interrupt();
}

/// Drive a device through all five enumeration steps.
pub(crate) fn enumerate<const N: usize>(
    host: &mut UsbHost<MockHc, N>,
    device: DeviceId,
    descriptor: &[u8; 18],
    config: &[u8],
) {
    enum_step(host, device, Some(&descriptor[..8]));
    enum_step(host, device, None); // SET_ADDRESS status stage
    enum_step(host, device, Some(descriptor));
    enum_step(host, device, Some(&config[..9]));
    enum_step(host, device, Some(config));
}
