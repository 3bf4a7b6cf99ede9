//! Transfer records and chain construction
//!
//! One [`Transfer`] owns one qTD and carries the bookkeeping the hardware
//! descriptor cannot: followup links, the owning pipe, and completion
//! metadata. A logical transfer larger than one bus transaction becomes a
//! chain of records linked both in hardware (qTD next pointers) and in
//! software (the pipe's followup list).

use crate::ehci::qtd::{token, QueueTD};
use crate::ehci::HcOps;
use crate::error::{Result, UsbError};
use crate::host::HostCore;
use crate::pool::{DeviceId, PipeId, TransferId};

/// Transfer direction relative to the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Direction {
    /// Host to device
    Out,
    /// Device to host
    In,
}

impl Direction {
    fn pid(self) -> u32 {
        match self {
            Direction::Out => token::PID_OUT,
            Direction::In => token::PID_IN,
        }
    }

    fn opposite(self) -> Direction {
        match self {
            Direction::Out => Direction::In,
            Direction::In => Direction::Out,
        }
    }
}

/// Standard request types (bmRequestType values)
#[allow(missing_docs)]
pub mod request_type {
    pub const DIR_IN: u8 = 0x80;

    pub const STANDARD_DEVICE_OUT: u8 = 0x00;
    pub const STANDARD_DEVICE_IN: u8 = 0x80;
    pub const CLASS_DEVICE_OUT: u8 = 0x20;
    pub const CLASS_DEVICE_IN: u8 = 0xA0;
    pub const CLASS_OTHER_OUT: u8 = 0x23;
    pub const CLASS_OTHER_IN: u8 = 0xA3;
}

/// Standard request codes
#[allow(missing_docs)]
pub mod request {
    pub const GET_STATUS: u8 = 0;
    pub const CLEAR_FEATURE: u8 = 1;
    pub const SET_FEATURE: u8 = 3;
    pub const SET_ADDRESS: u8 = 5;
    pub const GET_DESCRIPTOR: u8 = 6;
    pub const SET_CONFIGURATION: u8 = 9;
}

/// An eight-byte SETUP stage payload.
///
/// Field order matches the wire format, so a record in memory can be
/// handed to the controller directly on little-endian targets.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct SetupPacket {
    /// bmRequestType
    pub request_type: u8,
    /// bRequest
    pub request: u8,
    /// wValue
    pub value: u16,
    /// wIndex
    pub index: u16,
    /// wLength
    pub length: u16,
}

impl SetupPacket {
    /// GET_DESCRIPTOR for a standard descriptor type
    pub fn get_descriptor(descriptor_type: u8, descriptor_index: u8, length: u16) -> Self {
        Self {
            request_type: request_type::STANDARD_DEVICE_IN,
            request: request::GET_DESCRIPTOR,
            value: ((descriptor_type as u16) << 8) | descriptor_index as u16,
            index: 0,
            length,
        }
    }

    /// SET_ADDRESS (no data stage)
    pub fn set_address(address: u8) -> Self {
        Self {
            request_type: request_type::STANDARD_DEVICE_OUT,
            request: request::SET_ADDRESS,
            value: address as u16,
            index: 0,
            length: 0,
        }
    }

    /// SET_CONFIGURATION (no data stage)
    pub fn set_configuration(config_value: u8) -> Self {
        Self {
            request_type: request_type::STANDARD_DEVICE_OUT,
            request: request::SET_CONFIGURATION,
            value: config_value as u16,
            index: 0,
            length: 0,
        }
    }

    /// Data stage runs device-to-host
    pub fn is_in(&self) -> bool {
        self.request_type & request_type::DIR_IN != 0
    }
}

const _: () = assert!(core::mem::size_of::<SetupPacket>() == 8);

/// One transaction segment and its software bookkeeping.
///
/// The qTD must stay first so the record address doubles as the DMA
/// descriptor address.
#[repr(C)]
pub struct Transfer {
    pub(crate) qtd: QueueTD,
    /// Next entry in the owning pipe's followup list
    pub(crate) next_followup: Option<TransferId>,
    /// Previous entry in the owning pipe's followup list
    pub(crate) prev_followup: Option<TransferId>,
    /// Owning pipe
    pub(crate) pipe: PipeId,
    /// Final element of its chain; carries IOC and produces the callback
    pub(crate) chain_final: bool,
    /// Counts toward the completion's transferred-byte total (data
    /// segments only; SETUP and status stages do not)
    pub(crate) counts_bytes: bool,
    /// Bytes programmed into this segment
    pub(crate) programmed: u16,
}

impl Transfer {
    pub(crate) fn new(pipe: PipeId) -> Self {
        Self {
            qtd: QueueTD::new(),
            next_followup: None,
            prev_followup: None,
            pipe,
            chain_final: false,
            counts_bytes: false,
            programmed: 0,
        }
    }
}

const _: () = assert!(core::mem::align_of::<Transfer>() == 32);

/// Outcome of one completed chain, handed to the owning pipe's callback.
#[derive(Debug, Clone, Copy)]
pub struct Completion {
    /// Pipe the chain ran on
    pub pipe: PipeId,
    /// Device the pipe belongs to
    pub device: DeviceId,
    /// Success, or the first error the controller reported in the chain
    pub status: core::result::Result<(), UsbError>,
    /// Data bytes actually moved (short packets reduce this)
    pub bytes_transferred: usize,
}

/// One planned transaction segment, before records are allocated.
#[derive(Clone, Copy)]
pub(crate) struct Segment {
    pub pid: u32,
    pub data_toggle: bool,
    pub buf: *const u8,
    pub len: usize,
    pub counts_bytes: bool,
}

pub(crate) const MAX_CHAIN: usize = 34;

impl<C: HcOps> HostCore<C> {
    /// Queue a bulk or interrupt transfer.
    ///
    /// The transfer is split at the pipe's max packet size into a chain of
    /// records; the completion callback fires once, when the final segment
    /// retires. A zero-length transfer still queues one (empty) segment.
    ///
    /// # Safety
    ///
    /// `buf..buf+len` must stay valid, and for IN pipes writable, until
    /// the completion callback for this chain runs or the pipe is
    /// destroyed. The controller DMAs to it outside the borrow checker's
    /// view.
    pub unsafe fn submit(&mut self, pipe_id: PipeId, buf: *mut u8, len: usize) -> Result<()> {
        let pipe = self.pipe(pipe_id)?;
        let pid = pipe.direction.pid();
        let max_packet = pipe.max_packet as usize;

        let mut segments: heapless::Vec<Segment, MAX_CHAIN> = heapless::Vec::new();
        let mut offset = 0;
        loop {
            let seg_len = (len - offset).min(max_packet);
            segments
                .push(Segment {
                    pid,
                    // Non-control queue heads track the toggle themselves
                    data_toggle: false,
                    buf: unsafe { buf.add(offset) },
                    len: seg_len,
                    counts_bytes: true,
                })
                .map_err(|_| UsbError::InvalidParameter)?;
            offset += seg_len;
            if offset >= len {
                break;
            }
        }

        self.queue_chain(pipe_id, &segments)
    }

    /// Queue a control transfer: SETUP stage, optional data stage, and a
    /// zero-length status stage in the opposite direction.
    ///
    /// The setup packet is copied into the owning device's setup scratch
    /// so it stays at a stable, DMA-visible address for the duration.
    ///
    /// # Safety
    ///
    /// When `len > 0`, `data..data+len` must stay valid (writable for IN
    /// requests) until the completion callback runs or the pipe is
    /// destroyed.
    pub unsafe fn control_transfer(
        &mut self,
        pipe_id: PipeId,
        setup: SetupPacket,
        data: *mut u8,
        len: usize,
    ) -> Result<()> {
        if len != 0 && data.is_null() {
            return Err(UsbError::InvalidParameter);
        }
        let device_id = self.pipe(pipe_id)?.device;

        let device = self.device_mut(device_id)?;
        device.setup = setup;
        let setup_ptr = &device.setup as *const SetupPacket as *const u8;

        let data_dir = if setup.is_in() {
            Direction::In
        } else {
            Direction::Out
        };

        let mut segments: heapless::Vec<Segment, MAX_CHAIN> = heapless::Vec::new();
        let _ = segments.push(Segment {
            pid: token::PID_SETUP,
            data_toggle: false,
            buf: setup_ptr,
            len: core::mem::size_of::<SetupPacket>(),
            counts_bytes: false,
        });
        if len > 0 {
            // One qTD carries the whole data stage; the controller
            // packetizes and advances the toggle within it.
            let _ = segments.push(Segment {
                pid: data_dir.pid(),
                data_toggle: true,
                buf: data as *const u8,
                len,
                counts_bytes: true,
            });
        }
        let _ = segments.push(Segment {
            pid: data_dir.opposite().pid(),
            data_toggle: true,
            buf: core::ptr::null(),
            len: 0,
            counts_bytes: false,
        });

        self.queue_chain(pipe_id, &segments)
    }

    /// Allocate, link, and hand a chain of segments to the controller.
    ///
    /// Allocation is all-or-nothing: if the transfer pool runs out
    /// mid-chain, every record already taken is returned and the pool is
    /// exactly as it was before the call.
    pub(crate) fn queue_chain(&mut self, pipe_id: PipeId, segments: &[Segment]) -> Result<()> {
        debug_assert!(!segments.is_empty());

        let mut ids: heapless::Vec<TransferId, MAX_CHAIN> = heapless::Vec::new();
        for _ in segments {
            match self.transfers.alloc_with(|| Transfer::new(pipe_id)) {
                Ok(index) => {
                    let _ = ids.push(TransferId(index as u8));
                }
                Err(e) => {
                    for id in &ids {
                        self.transfers.free(id.index());
                    }
                    return Err(e);
                }
            }
        }

        let last = segments.len() - 1;
        for (i, (id, seg)) in ids.iter().zip(segments).enumerate() {
            let transfer = self.transfers.get_mut(id.index());
            transfer.chain_final = i == last;
            transfer.counts_bytes = seg.counts_bytes;
            transfer.programmed = seg.len as u16;
            // IOC only on the chain-final segment: one interrupt, one
            // callback per logical transfer
            transfer
                .qtd
                .fill(seg.pid, seg.data_toggle, seg.buf, seg.len, i == last);
        }
        for window in ids.windows(2) {
            let next_addr = self.transfer_addr(window[1]);
            self.transfers
                .get(window[0].index())
                .qtd
                .next
                .store(next_addr, core::sync::atomic::Ordering::Release);
        }

        self.append_followups(pipe_id, &ids);
        Ok(())
    }

    /// Hardware descriptor address of a transfer record (the qTD is the
    /// first field). Opaque to software; only the controller follows it.
    pub(crate) fn transfer_addr(&self, id: TransferId) -> u32 {
        self.transfers.get(id.index()) as *const Transfer as usize as u32
    }

    /// Append a freshly built chain to the pipe's followup list and make
    /// it reachable by the controller.
    fn append_followups(&mut self, pipe_id: PipeId, ids: &[TransferId]) {
        let first = ids[0];
        let first_addr = self.transfer_addr(first);

        // Thread the software links
        let mut prev = self.pipes.get(pipe_id.index()).followup_tail;
        for &id in ids {
            let transfer = self.transfers.get_mut(id.index());
            transfer.prev_followup = prev;
            transfer.next_followup = None;
            if let Some(p) = prev {
                self.transfers.get_mut(p.index()).next_followup = Some(id);
            }
            prev = Some(id);
        }

        let old_tail = self.pipes.get(pipe_id.index()).followup_tail;
        let pipe = self.pipes.get_mut(pipe_id.index());
        if pipe.followup_head.is_none() {
            pipe.followup_head = Some(first);
        }
        pipe.followup_tail = prev;

        match old_tail {
            // Idle pipe: point the queue head overlay at the new chain
            None => self.pipes.get(pipe_id.index()).qh.push_chain(first_addr),
            // Busy pipe: extend the hardware list behind the old tail
            Some(tail) => {
                self.transfers
                    .get(tail.index())
                    .qtd
                    .next
                    .store(first_addr, core::sync::atomic::Ordering::Release);
            }
        }
    }
}
