//! EHCI controller interface
//!
//! Hardware descriptor types ([`QueueHead`], [`QueueTD`]) and the narrow
//! register surface this core needs from an already-initialized
//! EHCI-compatible controller: the frame counter, schedule list base
//! registers and the async-advance doorbell. Register bring-up, PHY and
//! interrupt vectoring live outside this crate; the platform layer hands
//! the core a [`HcOps`] implementation and calls
//! [`crate::UsbHost::on_interrupt`] from its ISR.

pub mod qh;
pub mod qtd;

pub use qh::QueueHead;
pub use qtd::QueueTD;

use crate::error::{Result, UsbError};
use bitflags::bitflags;
use core::cell::UnsafeCell;
use core::ptr::{read_volatile, write_volatile};

/// USBHS controller base address on Kinetis K66 (Teensy 3.6)
pub const K66_USBHS_BASE: usize = 0x400A_1000;

bitflags! {
    /// USB Command Register (USBCMD) bits used by this core
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UsbCmd: u32 {
        /// Run/Stop
        const RUN_STOP = 1 << 0;
        /// Periodic Schedule Enable
        const PERIODIC_SCHEDULE_ENABLE = 1 << 4;
        /// Asynchronous Schedule Enable
        const ASYNC_SCHEDULE_ENABLE = 1 << 5;
        /// Interrupt on Async Advance Doorbell
        const ASYNC_ADVANCE_DOORBELL = 1 << 6;
    }
}

bitflags! {
    /// USB Status Register (USBSTS) bits used by this core
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UsbSts: u32 {
        /// Transaction completed with IOC set
        const USB_INTERRUPT = 1 << 0;
        /// Transaction error
        const USB_ERROR_INTERRUPT = 1 << 1;
        /// Port change detect
        const PORT_CHANGE_DETECT = 1 << 2;
        /// Async advance doorbell acknowledged
        const ASYNC_ADVANCE = 1 << 5;
        /// Async schedule running
        const ASYNC_SCHEDULE_STATUS = 1 << 15;
    }
}

/// Barriered MMIO register for the Cortex-M weakly-ordered memory model
#[repr(transparent)]
pub struct Register<T> {
    value: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for Register<T> {}
unsafe impl<T: Sync> Sync for Register<T> {}

impl Register<u32> {
    /// Read with barriers on both sides
    #[inline(always)]
    pub fn read(&self) -> u32 {
        unsafe {
            cortex_m::asm::dmb();
            let value = read_volatile(self.value.get());
            cortex_m::asm::dmb();
            value
        }
    }

    /// Write, then ensure completion before continuing
    #[inline(always)]
    pub fn write(&self, value: u32) {
        unsafe {
            cortex_m::asm::dmb();
            write_volatile(self.value.get(), value);
            cortex_m::asm::dsb();
        }
    }

    /// Read-modify-write with full barriers
    #[inline(always)]
    pub fn modify<F: FnOnce(u32) -> u32>(&self, f: F) {
        self.write(f(self.read()));
    }
}

/// Controller operations this core consumes from the bring-up layer.
///
/// The real implementation is [`EhciHc`]; tests substitute a mock with a
/// software frame counter. Implementations are owned, `'static` types:
/// the host stack and its drivers live in static storage.
pub trait HcOps: 'static {
    /// Current bus frame number (FRINDEX, frame resolution). Wraps; only
    /// differences are meaningful.
    fn frame_number(&self) -> u32;

    /// Ring the async-advance doorbell and wait for the controller to
    /// acknowledge that it no longer references any unlinked queue head.
    fn async_advance(&mut self) -> Result<()>;

    /// Point the controller at the asynchronous schedule ring and enable
    /// it. Called once, when the schedule head is created.
    fn enable_async_schedule(&mut self, head_addr: u32) -> Result<()>;

    /// Point every periodic frame-list entry at the interrupt schedule
    /// head and enable the schedule. Called once, when the schedule head
    /// is created.
    fn enable_periodic_schedule(&mut self, head_addr: u32) -> Result<()>;

    /// Block until the controller crosses a frame boundary. Used after
    /// unlinking a periodic queue head, which has no doorbell equivalent.
    fn wait_frame_boundary(&mut self) -> Result<()>;
}

/// Operational registers of a running EHCI controller.
///
/// Offsets per EHCI Specification Section 2.3 (USBCMD at the operational
/// base; Kinetis USBHS uses the standard layout).
struct OpRegs {
    base: usize,
}

impl OpRegs {
    const USBCMD: usize = 0x00;
    const USBSTS: usize = 0x04;
    const FRINDEX: usize = 0x0C;
    const PERIODICLISTBASE: usize = 0x14;
    const ASYNCLISTADDR: usize = 0x18;

    fn reg(&self, offset: usize) -> &Register<u32> {
        // Operational registers are device memory mapped at base; the
        // bring-up layer guarantees the address is valid for this part.
        unsafe { &*((self.base + offset) as *const Register<u32>) }
    }
}

/// MMIO-backed [`HcOps`] implementation for a real controller.
pub struct EhciHc {
    op: OpRegs,
}

impl EhciHc {
    /// Bounded spin iterations for register handshakes (~ms scale at
    /// 180 MHz with the delay in the loop body)
    const HANDSHAKE_SPINS: u32 = 100_000;

    /// Wrap an already-initialized, running controller.
    ///
    /// # Safety
    ///
    /// `base` must be the capability register base of an EHCI controller
    /// that has been reset, configured and started by the bring-up layer,
    /// and this must be the only handle to it.
    pub unsafe fn new(base: usize) -> Self {
        let cap = unsafe { read_volatile(base as *const u32) };
        let cap_length = (cap & 0xFF) as usize;
        Self {
            op: OpRegs { base: base + cap_length },
        }
    }

    fn wait_sts(&self, mask: UsbSts) -> Result<()> {
        for _ in 0..Self::HANDSHAKE_SPINS {
            if self.op.reg(OpRegs::USBSTS).read() & mask.bits() != 0 {
                return Ok(());
            }
            cortex_m::asm::delay(16);
        }
        Err(UsbError::Timeout)
    }
}

impl HcOps for EhciHc {
    fn frame_number(&self) -> u32 {
        self.op.reg(OpRegs::FRINDEX).read() >> 3
    }

    fn async_advance(&mut self) -> Result<()> {
        let cmd = self.op.reg(OpRegs::USBCMD);
        cmd.modify(|v| v | UsbCmd::ASYNC_ADVANCE_DOORBELL.bits());
        self.wait_sts(UsbSts::ASYNC_ADVANCE)?;
        // Acknowledge: USBSTS is write-1-to-clear
        self.op.reg(OpRegs::USBSTS).write(UsbSts::ASYNC_ADVANCE.bits());
        Ok(())
    }

    fn enable_async_schedule(&mut self, head_addr: u32) -> Result<()> {
        self.op.reg(OpRegs::ASYNCLISTADDR).write(head_addr & !0x1F);
        self.op
            .reg(OpRegs::USBCMD)
            .modify(|v| v | UsbCmd::ASYNC_SCHEDULE_ENABLE.bits());
        self.wait_sts(UsbSts::ASYNC_SCHEDULE_STATUS)
    }

    fn enable_periodic_schedule(&mut self, head_addr: u32) -> Result<()> {
        // Flat periodic ring: every frame-list entry links to the same
        // interrupt queue head. The bring-up layer allocated the list
        // and programmed PERIODICLISTBASE before handing us the part.
        let base = (self.op.reg(OpRegs::PERIODICLISTBASE).read() & !0xFFF) as usize;
        let entry = (head_addr & !0x1F) | QueueHead::TYPE_QH;
        for index in 0..1024 {
            unsafe { write_volatile((base + index * 4) as *mut u32, entry) };
        }
        cortex_m::asm::dsb();
        self.op
            .reg(OpRegs::USBCMD)
            .modify(|v| v | UsbCmd::PERIODIC_SCHEDULE_ENABLE.bits());
        Ok(())
    }

    fn wait_frame_boundary(&mut self) -> Result<()> {
        let frindex = self.op.reg(OpRegs::FRINDEX);
        let start = frindex.read() >> 3;
        for _ in 0..Self::HANDSHAKE_SPINS {
            if frindex.read() >> 3 != start {
                return Ok(());
            }
        }
        Err(UsbError::Timeout)
    }
}
