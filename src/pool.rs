//! Fixed-capacity descriptor pools
//!
//! Device, pipe and transfer records live in statically sized arenas with
//! stable indices. The free list is a pair of atomic bitmap words, so
//! allocate and free are lock-free and callable from both thread and
//! interrupt context. Records embedding DMA descriptors start each slot at
//! a 32-byte boundary because the element types carry that alignment
//! themselves; the arena adds no runtime padding.

use crate::error::{Result, UsbError};
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicU32, Ordering};

/// Number of device slots
pub const DEVICE_SLOTS: usize = 8;

/// Number of pipe slots
pub const PIPE_SLOTS: usize = 16;

/// Number of transfer slots
pub const TRANSFER_SLOTS: usize = 64;

/// Handle to a slot in the device pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DeviceId(pub(crate) u8);

/// Handle to a slot in the pipe pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PipeId(pub(crate) u8);

/// Handle to a slot in the transfer pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TransferId(pub(crate) u8);

impl DeviceId {
    #[inline(always)]
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

impl PipeId {
    #[inline(always)]
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

impl TransferId {
    #[inline(always)]
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// Fixed-capacity arena with a lock-free bitmap free list.
///
/// `N` must not exceed 64 (two bitmap words; Cortex-M7 has no 64-bit
/// atomics).
pub struct Pool<T, const N: usize> {
    slots: [MaybeUninit<T>; N],
    bitmap: [AtomicU32; 2],
}

impl<T, const N: usize> Pool<T, N> {
    const FITS: () = assert!(N <= 64);

    /// Create an empty pool
    pub const fn new() -> Self {
        #[allow(clippy::let_unit_value)]
        let _ = Self::FITS;
        Self {
            slots: [const { MaybeUninit::uninit() }; N],
            bitmap: [AtomicU32::new(0), AtomicU32::new(0)],
        }
    }

    /// Claim a free slot and initialize it with `init`.
    ///
    /// Fails with [`UsbError::PoolExhausted`] when every slot is in use;
    /// the caller must fail its operation rather than truncate.
    pub fn alloc_with(&mut self, init: impl FnOnce() -> T) -> Result<usize> {
        for (word_idx, word) in self.bitmap.iter().enumerate() {
            let base = word_idx * 32;
            if base >= N {
                break;
            }
            let word_slots = (N - base).min(32) as u32;
            loop {
                let current = word.load(Ordering::Acquire);
                let free_bit = (!current).trailing_zeros();
                if free_bit >= word_slots {
                    break; // this word is full
                }
                let claimed = current | (1 << free_bit);
                if word
                    .compare_exchange(current, claimed, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    let index = base + free_bit as usize;
                    self.slots[index].write(init());
                    return Ok(index);
                }
            }
        }
        #[cfg(feature = "defmt")]
        defmt::warn!("pool exhausted ({} slots)", N);
        Err(UsbError::PoolExhausted)
    }

    /// Return a slot to the free list.
    ///
    /// # Panics
    ///
    /// Panics if the slot is already free. That is a use-after-free in the
    /// making and indicates a programming defect; halting beats corrupting
    /// descriptor memory the hardware may still walk.
    pub fn free(&mut self, index: usize) {
        assert!(index < N, "pool index out of range");
        let word = &self.bitmap[index / 32];
        let bit = 1u32 << (index % 32);
        let prev = word.fetch_and(!bit, Ordering::AcqRel);
        assert!(prev & bit != 0, "double free of pool slot {}", index);
        unsafe { self.slots[index].assume_init_drop() };
    }

    /// Whether a slot is currently allocated
    pub fn is_allocated(&self, index: usize) -> bool {
        index < N && self.bitmap[index / 32].load(Ordering::Acquire) & (1 << (index % 32)) != 0
    }

    /// Shared access to an allocated slot
    pub fn get(&self, index: usize) -> &T {
        debug_assert!(self.is_allocated(index), "access to free pool slot");
        unsafe { self.slots[index].assume_init_ref() }
    }

    /// Exclusive access to an allocated slot
    pub fn get_mut(&mut self, index: usize) -> &mut T {
        debug_assert!(self.is_allocated(index), "access to free pool slot");
        unsafe { self.slots[index].assume_init_mut() }
    }

    /// Number of slots currently allocated
    pub fn in_use(&self) -> usize {
        self.bitmap
            .iter()
            .map(|w| w.load(Ordering::Relaxed).count_ones() as usize)
            .sum()
    }

    /// Total capacity
    pub const fn capacity(&self) -> usize {
        N
    }
}
