//! Queue Head (QH)
//!
//! EHCI Specification Section 3.6. One queue head represents one
//! endpoint's transfer queue, linked into the controller's asynchronous or
//! periodic schedule.

use crate::error::{Result, UsbError};
use core::sync::atomic::{AtomicU32, Ordering};

/// Endpoint characteristics field bits (first capabilities dword)
#[allow(missing_docs)]
pub mod endpoint {
    pub const DEVICE_ADDRESS_SHIFT: u32 = 0;
    pub const DEVICE_ADDRESS_MASK: u32 = 0x7F;

    pub const ENDPOINT_NUMBER_SHIFT: u32 = 8;
    pub const ENDPOINT_NUMBER_MASK: u32 = 0xF;

    pub const ENDPOINT_SPEED_SHIFT: u32 = 12;
    pub const ENDPOINT_SPEED_MASK: u32 = 0x3;
    pub const SPEED_FULL: u32 = 0;
    pub const SPEED_LOW: u32 = 1;
    pub const SPEED_HIGH: u32 = 2;

    pub const DATA_TOGGLE_CONTROL: u32 = 1 << 14;
    pub const HEAD_OF_LIST: u32 = 1 << 15;

    pub const MAX_PACKET_LENGTH_SHIFT: u32 = 16;
    pub const MAX_PACKET_LENGTH_MASK: u32 = 0x7FF;

    pub const CONTROL_ENDPOINT: u32 = 1 << 27;

    pub const NAK_COUNT_RELOAD_SHIFT: u32 = 28;
}

/// Endpoint capabilities field bits (second capabilities dword)
#[allow(missing_docs)]
pub mod capabilities {
    pub const INTERRUPT_SCHEDULE_MASK_SHIFT: u32 = 0;
    pub const SPLIT_COMPLETION_MASK_SHIFT: u32 = 8;

    pub const HUB_ADDRESS_SHIFT: u32 = 16;
    pub const HUB_ADDRESS_MASK: u32 = 0x7F;

    pub const PORT_NUMBER_SHIFT: u32 = 23;
    pub const PORT_NUMBER_MASK: u32 = 0x7F;

    pub const MULT_SHIFT: u32 = 30;
}

/// Queue Head
///
/// Must be 32-byte aligned for DMA and must not move while linked into a
/// hardware schedule. The overlay area (current qTD onward) mirrors a qTD
/// and is written by the controller.
#[repr(C, align(32))]
pub struct QueueHead {
    /// Horizontal link to the next schedule entry (bit 0 = terminate,
    /// bits 2:1 = entry type)
    pub horizontal_link: AtomicU32,

    /// Endpoint characteristics
    pub endpoint_chars: AtomicU32,

    /// Endpoint capabilities (split transaction, multiplier)
    pub endpoint_caps: AtomicU32,

    /// Current qTD pointer (overlay area begins here)
    pub current_qtd: AtomicU32,

    /// Overlay: next qTD pointer
    pub next_qtd: AtomicU32,

    /// Overlay: alternate next qTD pointer
    pub alt_next_qtd: AtomicU32,

    /// Overlay: token
    pub token: AtomicU32,

    /// Overlay: buffer pointer pages
    pub buffer: [AtomicU32; 5],
}

impl QueueHead {
    /// Horizontal link entry type for a queue head
    pub const TYPE_QH: u32 = 1 << 1;

    /// Link terminator bit
    pub const TERMINATE: u32 = 1;

    /// Create a new unlinked, inactive queue head
    pub const fn new() -> Self {
        Self {
            horizontal_link: AtomicU32::new(Self::TERMINATE),
            endpoint_chars: AtomicU32::new(0),
            endpoint_caps: AtomicU32::new(0),
            current_qtd: AtomicU32::new(0),
            next_qtd: AtomicU32::new(Self::TERMINATE),
            alt_next_qtd: AtomicU32::new(Self::TERMINATE),
            token: AtomicU32::new(0),
            buffer: [
                AtomicU32::new(0),
                AtomicU32::new(0),
                AtomicU32::new(0),
                AtomicU32::new(0),
                AtomicU32::new(0),
            ],
        }
    }

    /// Program endpoint characteristics for this queue head.
    ///
    /// `speed` is one of the `endpoint::SPEED_*` encodings.
    pub fn init_endpoint(
        &self,
        device_addr: u8,
        endpoint_num: u8,
        max_packet: u16,
        speed: u32,
        is_control: bool,
    ) -> Result<()> {
        if device_addr > 127 || endpoint_num > 15 || max_packet == 0 || max_packet > 1024 {
            return Err(UsbError::InvalidParameter);
        }

        let mut chars = (device_addr as u32) << endpoint::DEVICE_ADDRESS_SHIFT;
        chars |= (endpoint_num as u32) << endpoint::ENDPOINT_NUMBER_SHIFT;
        chars |= speed << endpoint::ENDPOINT_SPEED_SHIFT;
        chars |= (max_packet as u32) << endpoint::MAX_PACKET_LENGTH_SHIFT;

        if is_control {
            // Data toggle comes from the qTD for control endpoints
            chars |= endpoint::DATA_TOGGLE_CONTROL;
            if speed != endpoint::SPEED_HIGH {
                chars |= endpoint::CONTROL_ENDPOINT;
            }
        }
        if speed != endpoint::SPEED_HIGH {
            chars |= 4 << endpoint::NAK_COUNT_RELOAD_SHIFT;
        }

        self.endpoint_chars.store(chars, Ordering::Release);
        self.endpoint_caps
            .store(1 << capabilities::MULT_SHIFT, Ordering::Release);
        Ok(())
    }

    /// Record the transaction-translator hub address and port for a
    /// full/low-speed endpoint reached through a high-speed hub.
    pub fn set_split_target(&self, hub_addr: u8, hub_port: u8) -> Result<()> {
        if hub_addr > 127 || hub_port > 127 {
            return Err(UsbError::InvalidParameter);
        }
        let mut caps = self.endpoint_caps.load(Ordering::Acquire);
        caps &= !(capabilities::HUB_ADDRESS_MASK << capabilities::HUB_ADDRESS_SHIFT);
        caps &= !(capabilities::PORT_NUMBER_MASK << capabilities::PORT_NUMBER_SHIFT);
        caps |= (hub_addr as u32) << capabilities::HUB_ADDRESS_SHIFT;
        caps |= (hub_port as u32) << capabilities::PORT_NUMBER_SHIFT;
        // Start-split in microframe 0, complete-split in 2..4
        caps |= 0x01 << capabilities::INTERRUPT_SCHEDULE_MASK_SHIFT;
        caps |= 0x1C << capabilities::SPLIT_COMPLETION_MASK_SHIFT;
        self.endpoint_caps.store(caps, Ordering::Release);
        Ok(())
    }

    /// Rewrite the device address field after SET_ADDRESS completes
    pub fn set_device_address(&self, address: u8) {
        let mut chars = self.endpoint_chars.load(Ordering::Acquire);
        chars &= !(endpoint::DEVICE_ADDRESS_MASK << endpoint::DEVICE_ADDRESS_SHIFT);
        chars |= (address as u32) << endpoint::DEVICE_ADDRESS_SHIFT;
        self.endpoint_chars.store(chars, Ordering::Release);
    }

    /// Rewrite the max packet length field once the real bMaxPacketSize0
    /// is known
    pub fn set_max_packet(&self, max_packet: u16) {
        let mut chars = self.endpoint_chars.load(Ordering::Acquire);
        chars &= !(endpoint::MAX_PACKET_LENGTH_MASK << endpoint::MAX_PACKET_LENGTH_SHIFT);
        chars |= (max_packet as u32) << endpoint::MAX_PACKET_LENGTH_SHIFT;
        self.endpoint_chars.store(chars, Ordering::Release);
    }

    /// Hardware address of this queue head. Opaque to software; only the
    /// controller follows it (the link pointers never get dereferenced
    /// by this crate).
    pub fn addr(&self) -> u32 {
        self as *const Self as usize as u32
    }

    /// Mark as the static head of the asynchronous schedule ring
    pub fn set_head_of_list(&self) {
        self.endpoint_chars
            .fetch_or(endpoint::HEAD_OF_LIST, Ordering::SeqCst);
    }

    /// Hand a qTD chain to the overlay for execution.
    ///
    /// Ordering: the chain's own links must already be fully initialized;
    /// this store is what makes it reachable by the controller.
    pub fn push_chain(&self, first_qtd_addr: u32) {
        self.next_qtd.store(first_qtd_addr, Ordering::Release);
    }

    /// Insert `new` into the schedule ring immediately after `self`.
    ///
    /// `new` must be fully initialized; its horizontal link is written
    /// before `self`'s link makes it reachable, so the controller never
    /// observes a half-built entry.
    pub fn insert_after(&self, new: &QueueHead, new_addr: u32) {
        let next = self.horizontal_link.load(Ordering::Acquire);
        new.horizontal_link.store(next, Ordering::Release);
        self.horizontal_link
            .store((new_addr & !0x1F) | Self::TYPE_QH, Ordering::Release);
    }

    /// Remove `target` from the ring, given that `self` currently links to
    /// it. The caller must still perform the doorbell handshake before the
    /// target's memory is reused.
    pub fn remove_next(&self, target: &QueueHead) {
        let after = target.horizontal_link.load(Ordering::Acquire);
        self.horizontal_link.store(after, Ordering::Release);
    }

    /// Clear the overlay back to idle
    pub fn reset_overlay(&self) {
        self.current_qtd.store(0, Ordering::Relaxed);
        self.next_qtd.store(Self::TERMINATE, Ordering::Relaxed);
        self.alt_next_qtd.store(Self::TERMINATE, Ordering::Relaxed);
        self.token.store(0, Ordering::Release);
        for page in &self.buffer {
            page.store(0, Ordering::Relaxed);
        }
    }
}

const _: () = assert!(core::mem::size_of::<QueueHead>() == 64);
const _: () = assert!(core::mem::align_of::<QueueHead>() == 32);
