//! Hub class driver
//!
//! Claims hub-class devices at device scope and runs the usual port
//! lifecycle: select the configuration, read the hub descriptor, power
//! the ports, then watch the status-change interrupt endpoint. A connect change triggers a port
//! reset and, once the reset clears, a downstream
//! [`attach_device`](crate::host::HostCore::attach_device) at the speed
//! the port reports. Downstream devices enumerate independently of
//! anything else on the bus.
//!
//! Everything here is interrupt-driven continuation of control
//! transfers; no step blocks.

use crate::device::Speed;
use crate::driver::{ClaimScope, DeviceDriver};
use crate::ehci::HcOps;
use crate::error::Result;
use crate::host::HostCore;
use crate::pipe::PipeType;
use crate::pool::{DeviceId, PipeId};
use crate::transfer::{request, request_type, Completion, Direction, SetupPacket};

/// Hub class code (bDeviceClass)
pub const HUB_CLASS: u8 = 9;

/// Hub class feature selectors
#[allow(missing_docs)]
mod feature {
    pub const PORT_RESET: u16 = 4;
    pub const PORT_POWER: u16 = 8;
    pub const C_PORT_CONNECTION: u16 = 16;
    pub const C_PORT_ENABLE: u16 = 17;
    pub const C_PORT_RESET: u16 = 20;
}

/// wPortStatus bits
#[allow(missing_docs)]
mod port_status {
    pub const CONNECTION: u16 = 1 << 0;
    pub const RESET: u16 = 1 << 4;
    pub const LOW_SPEED: u16 = 1 << 9;
    pub const HIGH_SPEED: u16 = 1 << 10;
}

/// wPortChange bits
#[allow(missing_docs)]
mod port_change {
    pub const CONNECTION: u16 = 1 << 0;
    pub const ENABLE: u16 = 1 << 1;
    pub const RESET: u16 = 1 << 4;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HubState {
    Idle,
    /// SET_CONFIGURATION status stage in flight
    Configuring,
    /// Hub descriptor read in flight
    ReadDescriptor,
    /// Powering ports one by one; holds the port just commanded
    PowerPorts(u8),
    /// Waiting on the status-change interrupt endpoint
    Monitoring,
    /// GET_PORT_STATUS in flight for a reported change
    PortStatus(u8),
    /// Clearing the connect change; remembers whether the port is now
    /// occupied
    ClearConnect(u8, bool),
    /// PORT_RESET commanded, acknowledgement pending
    Resetting(u8),
    /// Polling port status until the reset completes
    PostResetStatus(u8),
    /// Clearing the reset change; holds the negotiated speed
    ClearReset(u8, Speed),
}

/// One hub instance. Register one per hub you expect to service
/// concurrently; an unbound instance claims the next hub that
/// enumerates.
pub struct HubDriver {
    state: HubState,
    device: Option<DeviceId>,
    control_pipe: Option<PipeId>,
    int_pipe: Option<PipeId>,
    num_ports: u8,
    /// Interrupt endpoint learned from the interface descriptors
    int_endpoint: u8,
    int_max_packet: u16,
    /// Ports with changes not yet serviced (bit N = port N)
    pending: u32,
    /// Control-request data stage target; DMA-stable because instances
    /// are registered as `&'static mut`
    ctrl_buf: [u8; 16],
    /// Status-change bitmap target (hubs up to 15 ports)
    change_buf: [u8; 2],
}

impl HubDriver {
    /// A fresh, unbound hub driver.
    pub const fn new() -> Self {
        Self {
            state: HubState::Idle,
            device: None,
            control_pipe: None,
            int_pipe: None,
            num_ports: 0,
            int_endpoint: 1,
            int_max_packet: 1,
            pending: 0,
            ctrl_buf: [0; 16],
            change_buf: [0; 2],
        }
    }

    /// Port count reported by the hub descriptor.
    pub fn num_ports(&self) -> u8 {
        self.num_ports
    }

    fn class_request<C: HcOps>(
        &mut self,
        core: &mut HostCore<C>,
        setup: SetupPacket,
    ) -> Result<()> {
        let pipe = self.control_pipe.ok_or(crate::error::UsbError::InvalidState)?;
        let len = setup.length as usize;
        let data = if len == 0 {
            core::ptr::null_mut()
        } else {
            self.ctrl_buf.as_mut_ptr()
        };
        // Safety: ctrl_buf lives in this 'static instance and requests
        // are strictly sequential per state machine step
        unsafe { core.control_transfer(pipe, setup, data, len) }
    }

    fn get_port_status<C: HcOps>(&mut self, core: &mut HostCore<C>, port: u8) -> Result<()> {
        self.state = HubState::PortStatus(port);
        self.class_request(
            core,
            SetupPacket {
                request_type: request_type::CLASS_OTHER_IN,
                request: request::GET_STATUS,
                value: 0,
                index: port as u16,
                length: 4,
            },
        )
    }

    fn port_feature<C: HcOps>(
        &mut self,
        core: &mut HostCore<C>,
        set: bool,
        feature: u16,
        port: u8,
    ) -> Result<()> {
        self.class_request(
            core,
            SetupPacket {
                request_type: request_type::CLASS_OTHER_OUT,
                request: if set {
                    request::SET_FEATURE
                } else {
                    request::CLEAR_FEATURE
                },
                value: feature,
                index: port as u16,
                length: 0,
            },
        )
    }

    fn read_port_words(&self) -> (u16, u16) {
        let status = u16::from_le_bytes([self.ctrl_buf[0], self.ctrl_buf[1]]);
        let change = u16::from_le_bytes([self.ctrl_buf[2], self.ctrl_buf[3]]);
        (status, change)
    }

    /// Next pending port, or back to watching the change endpoint.
    fn service_next<C: HcOps>(&mut self, core: &mut HostCore<C>) {
        if self.pending != 0 {
            let port = self.pending.trailing_zeros() as u8;
            self.pending &= self.pending - 1;
            let _ = self.get_port_status(core, port);
            return;
        }
        self.state = HubState::Monitoring;
        if let Some(pipe) = self.int_pipe {
            // Safety: change_buf lives in this 'static instance; only
            // one interrupt read is in flight at a time
            let _ = unsafe {
                core.submit(pipe, self.change_buf.as_mut_ptr(), self.change_buf.len())
            };
        }
    }

    fn handle_control_step<C: HcOps>(&mut self, core: &mut HostCore<C>) -> Result<()> {
        match self.state {
            HubState::Configuring => {
                self.state = HubState::ReadDescriptor;
                self.class_request(
                    core,
                    SetupPacket {
                        request_type: request_type::CLASS_DEVICE_IN,
                        request: request::GET_DESCRIPTOR,
                        value: (crate::descriptor::types::HUB as u16) << 8,
                        index: 0,
                        length: 9,
                    },
                )
            }
            HubState::ReadDescriptor => {
                // Hub descriptor: bNbrPorts at offset 2
                self.num_ports = self.ctrl_buf[2].min(15);
                self.state = HubState::PowerPorts(1);
                self.port_feature(core, true, feature::PORT_POWER, 1)
            }
            HubState::PowerPorts(port) if port < self.num_ports => {
                self.state = HubState::PowerPorts(port + 1);
                self.port_feature(core, true, feature::PORT_POWER, port + 1)
            }
            HubState::PowerPorts(_) => {
                let device = self.device.ok_or(crate::error::UsbError::InvalidState)?;
                let pipe = core.create_pipe(
                    device,
                    PipeType::Interrupt,
                    Direction::In,
                    self.int_endpoint,
                    self.int_max_packet,
                )?;
                self.int_pipe = Some(pipe);
                self.service_next(core);
                Ok(())
            }
            HubState::PortStatus(port) => {
                let (status, change) = self.read_port_words();
                if change & port_change::CONNECTION != 0 {
                    let connected = status & port_status::CONNECTION != 0;
                    self.state = HubState::ClearConnect(port, connected);
                    self.port_feature(core, false, feature::C_PORT_CONNECTION, port)
                } else if change & port_change::RESET != 0 {
                    self.state = HubState::ClearReset(port, port_speed(status));
                    self.port_feature(core, false, feature::C_PORT_RESET, port)
                } else if change & port_change::ENABLE != 0 {
                    self.state = HubState::ClearConnect(port, false);
                    self.port_feature(core, false, feature::C_PORT_ENABLE, port)
                } else {
                    self.service_next(core);
                    Ok(())
                }
            }
            HubState::ClearConnect(port, connected) => {
                if connected {
                    self.state = HubState::Resetting(port);
                    self.port_feature(core, true, feature::PORT_RESET, port)
                } else {
                    self.disconnect_downstream(core, port);
                    self.service_next(core);
                    Ok(())
                }
            }
            HubState::Resetting(port) => {
                self.state = HubState::PostResetStatus(port);
                self.get_port_status(core, port)
            }
            HubState::PostResetStatus(port) => {
                let (status, change) = self.read_port_words();
                if change & port_change::RESET != 0 {
                    self.state = HubState::ClearReset(port, port_speed(status));
                    self.port_feature(core, false, feature::C_PORT_RESET, port)
                } else if status & port_status::RESET != 0 {
                    // Still resetting; poll again
                    self.state = HubState::PostResetStatus(port);
                    self.get_port_status(core, port)
                } else {
                    self.service_next(core);
                    Ok(())
                }
            }
            HubState::ClearReset(port, speed) => {
                let hub = self.device.ok_or(crate::error::UsbError::InvalidState)?;
                let hub_address = core.device(hub)?.address();
                #[cfg(feature = "defmt")]
                defmt::info!(
                    "New {:?} speed device on hub {} port {}",
                    speed,
                    hub_address,
                    port
                );
                core.attach_device(speed, hub_address, port)?;
                self.service_next(core);
                Ok(())
            }
            HubState::Idle | HubState::Monitoring => Ok(()),
        }
    }

    fn disconnect_downstream<C: HcOps>(&mut self, core: &mut HostCore<C>, port: u8) {
        let Some(hub) = self.device else { return };
        let Ok(hub_address) = core.device(hub).map(|d| d.address()) else {
            return;
        };
        for index in 0..crate::pool::DEVICE_SLOTS {
            if core.devices.is_allocated(index) {
                let record = core.devices.get(index);
                if record.hub_address() == hub_address && record.hub_port() == port {
                    #[cfg(feature = "defmt")]
                    defmt::info!("Device disconnected from hub port {}", port);
                    core.request_disconnect(crate::pool::DeviceId(index as u8));
                }
            }
        }
    }

    /// Wait again after a failed step rather than wedging the machine.
    fn recover<C: HcOps>(&mut self, core: &mut HostCore<C>) {
        self.pending = 0;
        self.service_next(core);
    }
}

impl Default for HubDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: HcOps> DeviceDriver<C> for HubDriver {
    fn claim(
        &mut self,
        core: &mut HostCore<C>,
        device: DeviceId,
        scope: ClaimScope,
        descriptors: &[u8],
    ) -> bool {
        if scope != ClaimScope::Device || self.device.is_some() {
            return false;
        }
        let record = match core.device(device) {
            Ok(d) => d,
            Err(_) => return false,
        };
        if record.device_class() != HUB_CLASS {
            return false;
        }

        self.device = Some(device);
        self.control_pipe = record.control_pipe();

        // Status-change endpoint from the configuration block
        for group in crate::descriptor::groups(descriptors, crate::descriptor::types::ENDPOINT) {
            let ep = &descriptors[group.start..];
            if ep.len() >= 7 && ep[2] & 0x80 != 0 {
                self.int_endpoint = ep[2] & 0x0F;
                self.int_max_packet = u16::from_le_bytes([ep[4], ep[5]]).max(1);
                break;
            }
        }

        // Select the configuration before any class request; the hub
        // descriptor and port registers only exist in the configured
        // state
        let config_value = if descriptors.len() >= 9 { descriptors[5] } else { 1 };
        self.state = HubState::Configuring;
        let claimed = self
            .class_request(core, SetupPacket::set_configuration(config_value))
            .is_ok();
        if !claimed {
            self.device = None;
            self.state = HubState::Idle;
        }
        claimed
    }

    fn control(&mut self, core: &mut HostCore<C>, completion: &Completion) -> bool {
        if Some(completion.device) != self.device {
            return false;
        }
        if Some(completion.pipe) == self.int_pipe {
            if completion.status.is_ok() {
                let bitmap =
                    u16::from_le_bytes([self.change_buf[0], self.change_buf[1]]) as u32;
                // Bit 0 is the hub itself; ports are bits 1..=N
                self.pending |= bitmap & !1;
            }
            self.service_next(core);
            return true;
        }
        if Some(completion.pipe) == self.control_pipe {
            if completion.status.is_err() || self.handle_control_step(core).is_err() {
                self.recover(core);
            }
            return true;
        }
        false
    }

    fn disconnect(&mut self, _core: &mut HostCore<C>, device: DeviceId) {
        if Some(device) == self.device {
            *self = Self::new();
        }
    }
}

fn port_speed(status: u16) -> Speed {
    if status & port_status::LOW_SPEED != 0 {
        Speed::Low
    } else if status & port_status::HIGH_SPEED != 0 {
        Speed::High
    } else {
        Speed::Full
    }
}
