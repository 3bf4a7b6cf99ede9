//! Queue Element Transfer Descriptor (qTD)
//!
//! EHCI Specification Section 3.5. One qTD carries one DMA transaction
//! segment; chains of qTDs carry one logical transfer.

use crate::error::UsbError;
use core::sync::atomic::{AtomicU32, Ordering};

/// qTD token field bit definitions
#[allow(missing_docs)]
pub mod token {
    pub const STATUS_ACTIVE: u32 = 1 << 7;
    pub const STATUS_HALTED: u32 = 1 << 6;
    pub const STATUS_DATA_BUFFER_ERROR: u32 = 1 << 5;
    pub const STATUS_BABBLE: u32 = 1 << 4;
    pub const STATUS_TRANSACTION_ERROR: u32 = 1 << 3;
    pub const STATUS_MISSED_MICROFRAME: u32 = 1 << 2;

    pub const PID_OUT: u32 = 0x0 << 8;
    pub const PID_IN: u32 = 0x1 << 8;
    pub const PID_SETUP: u32 = 0x2 << 8;

    pub const ERROR_COUNTER_SHIFT: u32 = 10;

    pub const INTERRUPT_ON_COMPLETE: u32 = 1 << 15;

    pub const TOTAL_BYTES_SHIFT: u32 = 16;
    pub const TOTAL_BYTES_MASK: u32 = 0x7FFF;

    pub const DATA_TOGGLE: u32 = 1 << 31;
}

/// Queue Element Transfer Descriptor
///
/// Must be 32-byte aligned for DMA. The controller walks these while they
/// are linked from a queue head; all fields the hardware reads are stored
/// with release ordering before the descriptor becomes reachable.
#[repr(C, align(32))]
pub struct QueueTD {
    /// Next qTD pointer (bit 0 = terminate)
    pub next: AtomicU32,

    /// Alternate next qTD pointer (short-packet path)
    pub alt_next: AtomicU32,

    /// Status, PID, error counter, total bytes, IOC, data toggle
    pub token: AtomicU32,

    /// Buffer pointer pages (one per 4 KiB page crossed)
    pub buffer: [AtomicU32; 5],
}

impl QueueTD {
    /// Link terminator bit
    pub const TERMINATE: u32 = 1;

    /// Create a new inactive qTD
    pub const fn new() -> Self {
        Self {
            next: AtomicU32::new(Self::TERMINATE),
            alt_next: AtomicU32::new(Self::TERMINATE),
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

    /// Program this qTD for one transaction segment.
    ///
    /// A zero-length segment (status stage, zero-length packet) passes
    /// `len == 0`. The buffer address must stay valid and DMA-visible
    /// until the segment completes; addresses are stored as opaque 32-bit
    /// values for the controller and never dereferenced by software.
    pub fn fill(
        &self,
        pid: u32,
        data_toggle: bool,
        buf: *const u8,
        len: usize,
        interrupt_on_complete: bool,
    ) {
        let mut remaining = len as u32;
        let mut addr = buf as usize as u32;

        for page in &self.buffer {
            if remaining == 0 {
                page.store(0, Ordering::Relaxed);
            } else {
                page.store(addr, Ordering::Relaxed);
                let in_page = (0x1000 - (addr & 0xFFF)).min(remaining);
                addr = (addr & !0xFFF) + 0x1000;
                remaining -= in_page;
            }
        }

        let mut token = token::STATUS_ACTIVE | pid;
        token |= 3 << token::ERROR_COUNTER_SHIFT;
        token |= (len as u32) << token::TOTAL_BYTES_SHIFT;
        if data_toggle {
            token |= token::DATA_TOGGLE;
        }
        if interrupt_on_complete {
            token |= token::INTERRUPT_ON_COMPLETE;
        }

        self.next.store(Self::TERMINATE, Ordering::Relaxed);
        self.alt_next.store(Self::TERMINATE, Ordering::Relaxed);
        self.token.store(token, Ordering::Release);
    }

    /// Still owned by the hardware
    pub fn is_active(&self) -> bool {
        self.token.load(Ordering::Acquire) & token::STATUS_ACTIVE != 0
    }

    /// Controller-reported error for this segment, if any
    pub fn error(&self) -> Option<UsbError> {
        let token = self.token.load(Ordering::Acquire);
        if token & token::STATUS_HALTED == 0 {
            return None;
        }
        if token & token::STATUS_BABBLE != 0 {
            Some(UsbError::Babble)
        } else if token & token::STATUS_DATA_BUFFER_ERROR != 0 {
            Some(UsbError::BufferError)
        } else if token & (token::STATUS_TRANSACTION_ERROR | token::STATUS_MISSED_MICROFRAME) != 0 {
            Some(UsbError::TransactionError)
        } else {
            Some(UsbError::Stall)
        }
    }

    /// Bytes the controller did not transfer (counts down from the
    /// programmed length; nonzero after a short packet)
    pub fn bytes_remaining(&self) -> usize {
        let token = self.token.load(Ordering::Acquire);
        ((token >> token::TOTAL_BYTES_SHIFT) & token::TOTAL_BYTES_MASK) as usize
    }

    /// Clear all fields back to the inactive state
    pub fn reset(&self) {
        self.next.store(Self::TERMINATE, Ordering::Relaxed);
        self.alt_next.store(Self::TERMINATE, Ordering::Relaxed);
        self.token.store(0, Ordering::Release);
        for page in &self.buffer {
            page.store(0, Ordering::Relaxed);
        }
    }
}

const _: () = assert!(core::mem::size_of::<QueueTD>() == 32);
const _: () = assert!(core::mem::align_of::<QueueTD>() == 32);
