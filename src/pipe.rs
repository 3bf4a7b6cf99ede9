//! Endpoint pipes
//!
//! A pipe binds one device endpoint to one EHCI queue head. Control and
//! bulk pipes live on the asynchronous schedule ring; interrupt pipes
//! hang off the periodic schedule head.

use crate::device::Speed;
use crate::ehci::qh::QueueHead;
use crate::ehci::HcOps;
use crate::error::{Result, UsbError};
use crate::host::HostCore;
use crate::pool::{DeviceId, PipeId, TransferId};
use crate::transfer::Direction;

/// Endpoint transfer type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PipeType {
    /// Bidirectional message pipe (endpoint 0 and class requests)
    Control,
    /// Large aperiodic data
    Bulk,
    /// Small periodic data with bounded latency
    Interrupt,
    /// Isochronous streams use a different descriptor format and are not
    /// scheduled by this core
    Isochronous,
}

/// Where a pipe's completions are routed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PipeCallback {
    /// The enumeration state machine owns this pipe
    Enumeration,
    /// Completions go to the drivers bound to the owning device
    Driver,
}

/// One open endpoint pipe.
///
/// The queue head must stay first so the record address doubles as the
/// DMA descriptor address.
#[repr(C)]
pub struct Pipe {
    pub(crate) qh: QueueHead,
    /// Owning device
    pub(crate) device: DeviceId,
    pub(crate) kind: PipeType,
    pub(crate) direction: Direction,
    pub(crate) endpoint: u8,
    pub(crate) max_packet: u16,
    pub(crate) callback: PipeCallback,
    /// Oldest in-flight transfer record
    pub(crate) followup_head: Option<TransferId>,
    /// Newest in-flight transfer record
    pub(crate) followup_tail: Option<TransferId>,
    /// Next pipe on the same schedule (software shadow of the hardware
    /// ring, used to find the unlink predecessor)
    pub(crate) sched_next: Option<PipeId>,
}

impl Pipe {
    fn new(device: DeviceId, kind: PipeType, direction: Direction, endpoint: u8, max_packet: u16) -> Self {
        Self {
            qh: QueueHead::new(),
            device,
            kind,
            direction,
            endpoint,
            max_packet,
            // Pipes are almost always opened by a bound driver; the
            // enumerator retags the pipes it owns
            callback: PipeCallback::Driver,
            followup_head: None,
            followup_tail: None,
            sched_next: None,
        }
    }

    /// Owning device
    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// Endpoint number (0-15)
    pub fn endpoint(&self) -> u8 {
        self.endpoint
    }

    /// Max packet size the queue head is programmed with
    pub fn max_packet(&self) -> u16 {
        self.max_packet
    }
}

const _: () = assert!(core::mem::align_of::<Pipe>() == 32);

impl<C: HcOps> HostCore<C> {
    /// Open a pipe on a device endpoint and link its queue head into the
    /// appropriate schedule.
    ///
    /// Full- and low-speed devices behind a high-speed hub get
    /// split-transaction routing programmed from the device's hub
    /// address and port.
    pub fn create_pipe(
        &mut self,
        device_id: DeviceId,
        kind: PipeType,
        direction: Direction,
        endpoint: u8,
        max_packet: u16,
    ) -> Result<PipeId> {
        if matches!(kind, PipeType::Isochronous) {
            // Isochronous endpoints use iTD descriptors, not queue heads
            return Err(UsbError::InvalidParameter);
        }
        let device = self.device(device_id)?;
        let (address, speed, hub_address, hub_port) =
            (device.address, device.speed, device.hub_address, device.hub_port);

        let index = self
            .pipes
            .alloc_with(|| Pipe::new(device_id, kind, direction, endpoint, max_packet))?;
        let pipe_id = PipeId(index as u8);

        if let Err(e) = self.pipes.get(index).qh.init_endpoint(
            address,
            endpoint,
            max_packet,
            speed.qh_encoding(),
            matches!(kind, PipeType::Control),
        ) {
            self.pipes.free(index);
            return Err(e);
        }
        if speed != Speed::High && hub_address != 0 {
            if let Err(e) = self.pipes.get(index).qh.set_split_target(hub_address, hub_port) {
                self.pipes.free(index);
                return Err(e);
            }
        }

        let qh_addr = self.pipes.get(index).qh.addr();
        match kind {
            PipeType::Control | PipeType::Bulk => {
                self.async_head.insert_after(&self.pipes.get(index).qh, qh_addr);
                self.pipes.get_mut(index).sched_next = self.async_first;
                self.async_first = Some(pipe_id);
            }
            PipeType::Interrupt => {
                self.periodic_head.insert_after(&self.pipes.get(index).qh, qh_addr);
                self.pipes.get_mut(index).sched_next = self.periodic_first;
                self.periodic_first = Some(pipe_id);
            }
            PipeType::Isochronous => unreachable!(),
        }
        Ok(pipe_id)
    }

    /// Close a pipe: unlink its queue head, wait until the controller can
    /// no longer reach it, cancel every queued transfer without running
    /// callbacks, and free the records.
    pub fn destroy_pipe(&mut self, pipe_id: PipeId) -> Result<()> {
        let kind = self.pipe(pipe_id)?.kind;

        self.unlink_qh(pipe_id, kind)?;
        // Memory behind the queue head must not be reused until the
        // controller acknowledges it dropped any cached reference
        match kind {
            PipeType::Control | PipeType::Bulk => self.hc.async_advance()?,
            PipeType::Interrupt => self.hc.wait_frame_boundary()?,
            PipeType::Isochronous => unreachable!(),
        }

        // Cancel outstanding chains; cancelled transfers produce no
        // callbacks
        let mut cursor = self.pipes.get(pipe_id.index()).followup_head;
        while let Some(id) = cursor {
            cursor = self.transfers.get(id.index()).next_followup;
            self.transfers.free(id.index());
        }

        self.pipes.free(pipe_id.index());
        Ok(())
    }

    /// Take a pipe's queue head out of its schedule's hardware list.
    fn unlink_qh(&mut self, pipe_id: PipeId, kind: PipeType) -> Result<()> {
        let (list_head, head_qh): (&mut Option<PipeId>, &QueueHead) = match kind {
            PipeType::Control | PipeType::Bulk => (&mut self.async_first, &self.async_head),
            PipeType::Interrupt => (&mut self.periodic_first, &self.periodic_head),
            PipeType::Isochronous => unreachable!(),
        };

        let first = list_head.ok_or(UsbError::InvalidState)?;
        if first == pipe_id {
            *list_head = self.pipes.get(pipe_id.index()).sched_next;
            head_qh.remove_next(&self.pipes.get(pipe_id.index()).qh);
            return Ok(());
        }

        let mut prev = first;
        loop {
            let next = self
                .pipes
                .get(prev.index())
                .sched_next
                .ok_or(UsbError::InvalidState)?;
            if next == pipe_id {
                let after = self.pipes.get(pipe_id.index()).sched_next;
                self.pipes.get_mut(prev.index()).sched_next = after;
                self.pipes
                    .get(prev.index())
                    .qh
                    .remove_next(&self.pipes.get(pipe_id.index()).qh);
                return Ok(());
            }
            prev = next;
        }
    }

    /// Tear down every pipe a device owns. Used on disconnect and on
    /// enumeration failure.
    pub(crate) fn destroy_device_pipes(&mut self, device_id: DeviceId) {
        for index in 0..self.pipes.capacity() {
            if self.pipes.is_allocated(index) && self.pipes.get(index).device == device_id {
                // Pipe state was consistent when created; unlink cannot fail
                // except on a stuck controller, which leaks the records
                // rather than corrupting the schedule
                let _ = self.destroy_pipe(PipeId(index as u8));
            }
        }
    }
}
