//! Class driver interface and registry
//!
//! Drivers register once, at startup, into the unbound set. When a
//! device finishes enumerating it is offered around: first whole-device,
//! then per interface association, then per interface, each time in
//! registration order. A driver that claims moves to the bound set for
//! that device and gets the device's completions and its disconnect.

use crate::descriptor;
use crate::ehci::HcOps;
use crate::error::{Result, UsbError};
use crate::host::HostCore;
use crate::pool::DeviceId;
use crate::transfer::Completion;

/// Granularity at which a driver may claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ClaimScope {
    /// The whole device; no further offers happen if claimed
    Device,
    /// One interface-association group (IAD)
    InterfaceAssociation,
    /// One interface and its trailing class/endpoint descriptors
    Interface,
}

/// A USB class driver.
///
/// Implementations are registered as `&'static mut` so the stack never
/// owns or moves them; their buffers stay DMA-stable.
pub trait DeviceDriver<C: HcOps> {
    /// Offered a device (or a slice of its configuration, per `scope`).
    ///
    /// `descriptors` is the configuration descriptor block: the whole
    /// block at device scope, the group beginning with the offered
    /// interface/IAD descriptor otherwise. Return `true` to claim;
    /// claiming usually opens pipes and queues the first transfers
    /// through `core`.
    fn claim(
        &mut self,
        core: &mut HostCore<C>,
        device: DeviceId,
        scope: ClaimScope,
        descriptors: &[u8],
    ) -> bool;

    /// A chain on one of the claimed device's driver pipes retired.
    ///
    /// Return `true` if this completion was yours; dispatch stops there.
    fn control(&mut self, core: &mut HostCore<C>, completion: &Completion) -> bool;

    /// The claimed device is going away. Pipes the driver opened are
    /// destroyed by the core afterwards; release any driver-side state
    /// here.
    fn disconnect(&mut self, core: &mut HostCore<C>, device: DeviceId);
}

struct DriverSlot<C: HcOps> {
    driver: &'static mut dyn DeviceDriver<C>,
    /// Device this driver is bound to; `None` = in the unbound set
    bound_to: Option<DeviceId>,
}

/// Registered drivers and their bindings.
pub struct DriverRegistry<C: HcOps, const MAX_DRIVERS: usize> {
    slots: heapless::Vec<DriverSlot<C>, MAX_DRIVERS>,
}

impl<C: HcOps, const MAX_DRIVERS: usize> DriverRegistry<C, MAX_DRIVERS> {
    pub(crate) fn new() -> Self {
        Self {
            slots: heapless::Vec::new(),
        }
    }

    pub(crate) fn register(&mut self, driver: &'static mut dyn DeviceDriver<C>) -> Result<()> {
        self.slots
            .push(DriverSlot {
                driver,
                bound_to: None,
            })
            .map_err(|_| UsbError::PoolExhausted)
    }

    /// Walk the claim protocol for a freshly enumerated device.
    ///
    /// Device scope first: a whole-device claim ends the walk. Otherwise
    /// each interface association, then each remaining interface, is
    /// offered to every unbound driver in registration order. The device
    /// ends up `Bound` if anyone claimed, or parked in `DriverOffering`
    /// for a driver registered later.
    pub(crate) fn offer_device(&mut self, core: &mut HostCore<C>, device: DeviceId) {
        // Copy the configuration block out so driver callbacks may reuse
        // the device's descriptor buffer for their own requests
        let mut config = [0u8; descriptor::CONFIG_BUFFER];
        let config_len = match core.device(device) {
            Ok(d) => {
                let len = (d.config_total as usize).min(config.len());
                config[..len].copy_from_slice(&d.enum_buf[..len]);
                len
            }
            Err(_) => return,
        };
        let config = &config[..config_len];

        if self.offer_scope(core, device, ClaimScope::Device, config) {
            self.finish_offering(core, device);
            return;
        }

        // Interfaces covered by a claimed association drop out of the
        // per-interface pass
        let mut iad_claimed: u32 = 0;
        for group in descriptor::groups(config, descriptor::DESC_IAD) {
            let window = &config[group.start..group.end];
            // The leading descriptor must be whole before its interface
            // fields are read
            if window.len() < 8 || window[0] < 8 {
                continue;
            }
            if self.offer_scope(core, device, ClaimScope::InterfaceAssociation, window) {
                let first = window[2] as u32;
                let count = window[3] as u32;
                for iface in first..(first + count).min(32) {
                    iad_claimed |= 1 << iface;
                }
            }
        }
        for group in descriptor::groups(config, descriptor::DESC_INTERFACE) {
            let window = &config[group.start..group.end];
            if window.len() < 9 || window[0] < 9 {
                continue;
            }
            let iface_num = window[2] as u32;
            if iface_num < 32 && iad_claimed & (1 << iface_num) != 0 {
                continue;
            }
            self.offer_scope(core, device, ClaimScope::Interface, window);
        }

        self.finish_offering(core, device);
    }

    /// Offer one descriptor window to every unbound driver; returns
    /// whether someone claimed it.
    fn offer_scope(
        &mut self,
        core: &mut HostCore<C>,
        device: DeviceId,
        scope: ClaimScope,
        window: &[u8],
    ) -> bool {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.bound_to.is_some() {
                continue;
            }
            if slot.driver.claim(core, device, scope, window) {
                slot.bound_to = Some(device);
                if let Ok(record) = core.device_mut(device) {
                    let _ = record.bound_drivers.push(index);
                }
                return true;
            }
        }
        false
    }

    fn finish_offering(&mut self, core: &mut HostCore<C>, device: DeviceId) {
        if let Ok(record) = core.device_mut(device) {
            record.enum_state = if record.bound_drivers.is_empty() {
                crate::enumeration::EnumState::DriverOffering
            } else {
                crate::enumeration::EnumState::Bound
            };
        }
    }

    /// Route a driver-pipe completion to the owning device's bound
    /// drivers, stopping at the first taker.
    pub(crate) fn dispatch_control(&mut self, core: &mut HostCore<C>, completion: &Completion) {
        let bound: heapless::Vec<usize, { crate::device::MAX_BOUND_DRIVERS }> =
            match core.device(completion.device) {
                Ok(d) => d.bound_drivers.clone(),
                Err(_) => return,
            };
        for index in bound {
            if let Some(slot) = self.slots.get_mut(index) {
                if slot.bound_to == Some(completion.device)
                    && slot.driver.control(core, completion)
                {
                    return;
                }
            }
        }
    }

    /// Tell every driver bound to a disappearing device, then return
    /// them to the unbound set (registration order is preserved, so
    /// claim precedence is unchanged).
    pub(crate) fn handle_disconnect(&mut self, core: &mut HostCore<C>, device: DeviceId) {
        for slot in self.slots.iter_mut() {
            if slot.bound_to == Some(device) {
                slot.driver.disconnect(core, device);
                slot.bound_to = None;
            }
        }
    }
}
