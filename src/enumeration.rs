//! Device enumeration
//!
//! Interrupt-driven: each step queues one control transfer and returns;
//! the completion callback on the device's control pipe advances the
//! machine. No step blocks, and every step carries a frame deadline so a
//! wedged device cannot park the machine forever.
//!
//! The sequence is the usual bring-up dance: read the first 8 descriptor
//! bytes (learning bMaxPacketSize0), assign an address, read the full
//! device descriptor, then the configuration header, then the whole
//! configuration block. After that the device is handed to the driver
//! registry.

use crate::descriptor::{self, ConfigDescriptor, DeviceDescriptor};
use crate::ehci::HcOps;
use crate::error::{Result, UsbError};
use crate::host::HostCore;
use crate::pipe::PipeCallback;
use crate::pool::DeviceId;
use crate::transfer::{Completion, SetupPacket};

/// Descriptor scratch size per device (also bounds readable
/// configuration blocks)
pub(crate) const ENUM_BUF_LEN: usize = descriptor::CONFIG_BUFFER;

/// Where a device stands in the enumeration sequence.
///
/// States name the step currently in flight; `DriverOffering` and
/// `Bound` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EnumState {
    /// Reading the first 8 descriptor bytes at address zero
    Attached,
    /// SET_ADDRESS in flight
    AddressSet,
    /// Reading the full 18-byte device descriptor
    DescriptorRead,
    /// Reading the configuration header, then the full block
    ConfigRead,
    /// Enumerated; no driver has claimed it (yet)
    DriverOffering,
    /// Enumerated and claimed by at least one driver
    Bound,
}

impl<C: HcOps> HostCore<C> {
    /// Kick off enumeration for a freshly attached device.
    pub(crate) fn enum_start(&mut self, device_id: DeviceId) -> Result<()> {
        self.enum_control(
            device_id,
            SetupPacket::get_descriptor(descriptor::types::DEVICE, 0, 8),
            8,
        )
    }

    /// Advance the machine after a control-pipe completion.
    pub(crate) fn enum_continue(&mut self, completion: Completion) {
        let device_id = completion.device;
        if let Err(e) = completion.status {
            self.abort_enumeration(device_id, e);
            return;
        }
        if let Err(e) = self.enum_step(device_id, &completion) {
            self.abort_enumeration(device_id, e);
        }
    }

    fn enum_step(&mut self, device_id: DeviceId, completion: &Completion) -> Result<()> {
        let state = self.device(device_id)?.enum_state;
        match state {
            EnumState::Attached => {
                let max_packet0 = {
                    let device = self.device(device_id)?;
                    if completion.bytes_transferred < 8 {
                        return Err(UsbError::ProtocolViolation);
                    }
                    DeviceDescriptor::parse_max_packet0(&device.enum_buf[..8])?
                };
                let address = self.alloc_address()?;
                #[cfg(feature = "defmt")]
                defmt::info!("Assigning address {}, max packet {}", address, max_packet0);
                {
                    let device = self.device_mut(device_id)?;
                    device.max_packet0 = max_packet0 as u16;
                    // Takes effect on the queue head only after the
                    // device acknowledges SET_ADDRESS
                    device.address = address;
                }
                self.control_qh(device_id)?.set_max_packet(max_packet0 as u16);

                self.device_mut(device_id)?.enum_state = EnumState::AddressSet;
                self.enum_control(device_id, SetupPacket::set_address(address), 0)
            }
            EnumState::AddressSet => {
                let address = self.device(device_id)?.address;
                self.control_qh(device_id)?.set_device_address(address);

                self.device_mut(device_id)?.enum_state = EnumState::DescriptorRead;
                self.enum_control(
                    device_id,
                    SetupPacket::get_descriptor(descriptor::types::DEVICE, 0, 18),
                    18,
                )
            }
            EnumState::DescriptorRead => {
                if completion.bytes_transferred < 18 {
                    return Err(UsbError::ProtocolViolation);
                }
                let desc = DeviceDescriptor::parse(&self.device(device_id)?.enum_buf[..18])?;
                {
                    let device = self.device_mut(device_id)?;
                    device.device_class = desc.device_class;
                    device.device_subclass = desc.device_subclass;
                    device.device_protocol = desc.device_protocol;
                    device.vendor_id = desc.vendor_id;
                    device.product_id = desc.product_id;
                    device.max_packet0 = desc.max_packet0 as u16;
                    device.config_total = 0;
                    device.enum_state = EnumState::ConfigRead;
                }
                self.control_qh(device_id)?.set_max_packet(desc.max_packet0 as u16);
                self.enum_control(
                    device_id,
                    SetupPacket::get_descriptor(descriptor::types::CONFIGURATION, 0, 9),
                    9,
                )
            }
            EnumState::ConfigRead => {
                let total = self.device(device_id)?.config_total;
                if total == 0 {
                    // Header just arrived; now fetch the whole block
                    if completion.bytes_transferred < 9 {
                        return Err(UsbError::ProtocolViolation);
                    }
                    let header = ConfigDescriptor::parse(&self.device(device_id)?.enum_buf[..9])?;
                    let total = header.total_length.min(ENUM_BUF_LEN as u16);
                    {
                        let device = self.device_mut(device_id)?;
                        device.config_total = total;
                        device.bm_attributes = header.attributes;
                        device.b_max_power = header.max_power;
                    }
                    self.enum_control(
                        device_id,
                        SetupPacket::get_descriptor(
                            descriptor::types::CONFIGURATION,
                            0,
                            total,
                        ),
                        total as usize,
                    )
                } else {
                    if completion.bytes_transferred < total as usize {
                        return Err(UsbError::ProtocolViolation);
                    }
                    // Enumeration is done with the control pipe; further
                    // completions on it belong to whoever binds
                    let pipe = self
                        .device(device_id)?
                        .control_pipe
                        .ok_or(UsbError::InvalidState)?;
                    self.pipes.get_mut(pipe.index()).callback = PipeCallback::Driver;

                    {
                        let device = self.device_mut(device_id)?;
                        device.enum_state = EnumState::DriverOffering;
                        #[cfg(feature = "defmt")]
                        defmt::info!(
                            "Enumerated: VID={:#06x} PID={:#06x} class {}",
                            device.vendor_id,
                            device.product_id,
                            device.device_class
                        );
                    }
                    let _ = self.pending_offers.push(device_id);
                    Ok(())
                }
            }
            // Terminal states get no more enumeration completions
            EnumState::DriverOffering | EnumState::Bound => Ok(()),
        }
    }

    /// Queue one enumeration control transfer, reading `len` bytes into
    /// the device's descriptor scratch, and arm the step deadline.
    fn enum_control(&mut self, device_id: DeviceId, setup: SetupPacket, len: usize) -> Result<()> {
        let deadline = self.step_deadline();
        let (pipe, data) = {
            let device = self.device_mut(device_id)?;
            device.enum_deadline = deadline;
            let pipe = device.control_pipe.ok_or(UsbError::InvalidState)?;
            let data = if len == 0 {
                core::ptr::null_mut()
            } else {
                device.enum_buf.as_mut_ptr()
            };
            (pipe, data)
        };
        // Safety: the scratch buffer lives in the device's pool slot,
        // which stays put until the device is freed; abort and disconnect
        // both cancel the pipe's chains before freeing it
        unsafe { self.control_transfer(pipe, setup, data, len) }
    }

    /// Give up on a device: cancel its transfers, free its record, tell
    /// the application.
    pub(crate) fn abort_enumeration(&mut self, device_id: DeviceId, error: UsbError) {
        if !self.devices.is_allocated(device_id.index()) {
            return;
        }
        #[cfg(feature = "defmt")]
        defmt::warn!("Enumeration failed: {:?}", error);
        self.destroy_device_pipes(device_id);
        self.remove_attached(device_id);
        self.pending_offers.retain(|d| *d != device_id);
        self.devices.free(device_id.index());
        self.push_event(crate::host::HostEvent::EnumerationFailed { error });
    }

    /// Queue head of the device's default control pipe.
    fn control_qh(&mut self, device_id: DeviceId) -> Result<&crate::ehci::qh::QueueHead> {
        let pipe = self
            .device(device_id)?
            .control_pipe
            .ok_or(UsbError::InvalidState)?;
        Ok(&self.pipes.get(pipe.index()).qh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Speed;
    use crate::ehci::qh::endpoint;
    use crate::host::{HostEvent, UsbHost};
    use crate::testutil::*;
    use core::sync::atomic::Ordering;

    fn host() -> UsbHost<MockHc, 4> {
        UsbHost::new(MockHc::new())
    }

    fn control_qh_chars(host: &UsbHost<MockHc, 4>, device: crate::pool::DeviceId) -> u32 {
        let pipe = host.core.devices.get(device.index()).control_pipe.unwrap();
        host.core
            .pipes
            .get(pipe.index())
            .qh
            .endpoint_chars
            .load(Ordering::Relaxed)
    }

    #[test]
    fn attach_starts_with_an_eight_byte_read() {
        let mut host = host();
        let device = host.device_attached(Speed::Full).unwrap();

        let record = host.core.devices.get(device.index());
        assert_eq!(record.enum_state, EnumState::Attached);
        assert_eq!(record.setup.request, crate::transfer::request::GET_DESCRIPTOR);
        assert_eq!(record.setup.length, 8);
        // SETUP + data + status
        let pipe = record.control_pipe.unwrap();
        assert_eq!(chain_ids(&host.core, pipe).len(), 3);
    }

    #[test]
    fn full_sequence_reaches_driver_offering() {
        let mut host = host();
        let device = host.device_attached(Speed::Full).unwrap();
        let descriptor = device_descriptor(0, 32, 0x16C0, 0x0486);

        enum_step(&mut host, device, Some(&descriptor[..8]));
        {
            let record = host.core.devices.get(device.index());
            assert_eq!(record.enum_state, EnumState::AddressSet);
            assert_eq!(record.max_packet0, 32);
            assert_eq!(record.setup.request, crate::transfer::request::SET_ADDRESS);
        }
        // bMaxPacketSize0 reached the queue head before the next request
        let chars = control_qh_chars(&host, device);
        assert_eq!(
            (chars >> endpoint::MAX_PACKET_LENGTH_SHIFT) & endpoint::MAX_PACKET_LENGTH_MASK,
            32
        );

        enum_step(&mut host, device, None);
        {
            let record = host.core.devices.get(device.index());
            assert_eq!(record.enum_state, EnumState::DescriptorRead);
            assert_eq!(record.address, 1);
        }
        // The assigned address reached the queue head only after the
        // status stage acknowledged SET_ADDRESS
        assert_eq!(control_qh_chars(&host, device) & endpoint::DEVICE_ADDRESS_MASK, 1);

        enum_step(&mut host, device, Some(&descriptor));
        assert_eq!(
            host.core.devices.get(device.index()).enum_state,
            EnumState::ConfigRead
        );

        let config = single_interface_config(3, 0x81, 8);
        enum_step(&mut host, device, Some(&config[..9]));
        enum_step(&mut host, device, Some(&config));

        let record = host.core.devices.get(device.index());
        assert_eq!(record.enum_state, EnumState::DriverOffering);
        assert_eq!(record.vendor_id, 0x16C0);
        assert_eq!(record.product_id, 0x0486);
        assert_eq!(record.config_total, 25);
        assert_eq!(record.bm_attributes, 0xA0);
        // No string descriptor has been read yet
        assert_eq!(record.language_id(), 0);
        match host.next_event() {
            Some(HostEvent::DeviceConnected {
                address: 1,
                class: 0,
                ..
            }) => {}
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn malformed_descriptor_aborts() {
        let mut host = host();
        let device = host.device_attached(Speed::Full).unwrap();

        let mut bad = device_descriptor(0, 64, 1, 1);
        bad[1] = 0xFF;
        enum_step(&mut host, device, Some(&bad[..8]));

        assert_eq!(host.core.devices.in_use(), 0);
        assert_eq!(host.core.pipes.in_use(), 0);
        assert_eq!(host.core.transfers.in_use(), 0);
        match host.next_event() {
            Some(HostEvent::EnumerationFailed {
                error: UsbError::ProtocolViolation,
            }) => {}
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn stalled_step_aborts() {
        let mut host = host();
        let device = host.device_attached(Speed::Full).unwrap();
        let pipe = host.core.devices.get(device.index()).control_pipe.unwrap();

        fail_chain(&host.core, pipe, 0);
        host.on_interrupt();

        assert_eq!(host.core.devices.in_use(), 0);
        match host.next_event() {
            Some(HostEvent::EnumerationFailed {
                error: UsbError::Stall,
            }) => {}
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn wedged_step_times_out() {
        let mut host = host();
        let _device = host.device_attached(Speed::Full).unwrap();

        host.core.hc.frame = crate::host::ENUM_TIMEOUT_FRAMES + 1;
        host.on_interrupt();

        assert_eq!(host.core.devices.in_use(), 0);
        assert_eq!(host.core.transfers.in_use(), 0);
        match host.next_event() {
            Some(HostEvent::EnumerationFailed {
                error: UsbError::Timeout,
            }) => {}
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn deadline_survives_frame_counter_wrap() {
        let mut host = host();
        host.core.hc.frame = 0x7F0;
        let device = host.device_attached(Speed::Full).unwrap();

        // Well within budget even though the counter wrapped
        host.core.hc.frame = 0x7F0 + 40;
        host.on_interrupt();
        assert_eq!(host.core.devices.in_use(), 1);

        enum_step(&mut host, device, Some(&device_descriptor(0, 64, 1, 1)[..8]));
        assert_eq!(
            host.core.devices.get(device.index()).enum_state,
            EnumState::AddressSet
        );
    }

    #[test]
    fn oversized_configuration_is_truncated() {
        let mut host = host();
        let device = host.device_attached(Speed::Full).unwrap();
        let descriptor = device_descriptor(0, 64, 1, 1);

        enum_step(&mut host, device, Some(&descriptor[..8]));
        enum_step(&mut host, device, None);
        enum_step(&mut host, device, Some(&descriptor));

        // Header claims more than the scratch buffer holds
        let mut header = [9u8, 2, 0, 0, 1, 1, 0, 0x80, 50];
        header[2..4].copy_from_slice(&2048u16.to_le_bytes());
        enum_step(&mut host, device, Some(&header));

        let record = host.core.devices.get(device.index());
        assert_eq!(record.config_total as usize, ENUM_BUF_LEN);
        assert_eq!(record.setup.length as usize, ENUM_BUF_LEN);
    }
}
