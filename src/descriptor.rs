//! Standard descriptor parsing
//!
//! Just enough of chapter 9 for enumeration and driver offering: the
//! device descriptor, the configuration header, and splitting a
//! configuration block into interface / interface-association groups.

use crate::error::{Result, UsbError};

/// bDescriptorType values
#[allow(missing_docs)]
pub mod types {
    pub const DEVICE: u8 = 1;
    pub const CONFIGURATION: u8 = 2;
    pub const STRING: u8 = 3;
    pub const INTERFACE: u8 = 4;
    pub const ENDPOINT: u8 = 5;
    pub const HUB: u8 = 0x29;
}

pub(crate) const DESC_INTERFACE: u8 = types::INTERFACE;
pub(crate) const DESC_IAD: u8 = 0x0B;

/// Largest configuration block the enumerator reads. Longer
/// configurations are truncated; constrained hosts cannot buffer
/// arbitrary descriptor sets.
pub const CONFIG_BUFFER: usize = 256;

const MAX_GROUPS: usize = 16;

/// The standard device descriptor, decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DeviceDescriptor {
    /// bDeviceClass
    pub device_class: u8,
    /// bDeviceSubClass
    pub device_subclass: u8,
    /// bDeviceProtocol
    pub device_protocol: u8,
    /// bMaxPacketSize0
    pub max_packet0: u8,
    /// idVendor
    pub vendor_id: u16,
    /// idProduct
    pub product_id: u16,
    /// bNumConfigurations
    pub num_configurations: u8,
}

impl DeviceDescriptor {
    /// Decode a full 18-byte device descriptor.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < 18 || buf[0] < 18 || buf[1] != types::DEVICE {
            return Err(UsbError::ProtocolViolation);
        }
        let desc = Self {
            device_class: buf[4],
            device_subclass: buf[5],
            device_protocol: buf[6],
            max_packet0: buf[7],
            vendor_id: u16::from_le_bytes([buf[8], buf[9]]),
            product_id: u16::from_le_bytes([buf[10], buf[11]]),
            num_configurations: buf[17],
        };
        if !matches!(desc.max_packet0, 8 | 16 | 32 | 64) {
            return Err(UsbError::ProtocolViolation);
        }
        Ok(desc)
    }

    /// Endpoint-zero max packet size from just the first 8 bytes, the
    /// only part readable before it is known.
    pub fn parse_max_packet0(buf: &[u8]) -> Result<u8> {
        if buf.len() < 8 || buf[0] < 18 || buf[1] != types::DEVICE {
            return Err(UsbError::ProtocolViolation);
        }
        match buf[7] {
            mp @ (8 | 16 | 32 | 64) => Ok(mp),
            _ => Err(UsbError::ProtocolViolation),
        }
    }
}

/// The configuration descriptor header, decoded.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConfigDescriptor {
    /// wTotalLength of the whole block
    pub total_length: u16,
    /// bNumInterfaces
    pub num_interfaces: u8,
    /// bConfigurationValue, as handed to SET_CONFIGURATION
    pub config_value: u8,
    /// bmAttributes (power flags)
    pub attributes: u8,
    /// bMaxPower in 2 mA units
    pub max_power: u8,
}

impl ConfigDescriptor {
    /// Decode the 9-byte configuration header.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < 9 || buf[0] < 9 || buf[1] != types::CONFIGURATION {
            return Err(UsbError::ProtocolViolation);
        }
        let total_length = u16::from_le_bytes([buf[2], buf[3]]);
        if total_length < 9 {
            return Err(UsbError::ProtocolViolation);
        }
        Ok(Self {
            total_length,
            num_interfaces: buf[4],
            config_value: buf[5],
            attributes: buf[7],
            max_power: buf[8],
        })
    }
}

/// Byte range of one offerable group within a configuration block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Group {
    pub start: usize,
    pub end: usize,
}

/// Walk the descriptors in a configuration block, skipping malformed
/// tails (a zero bLength would otherwise never advance).
fn descriptor_offsets(config: &[u8]) -> impl Iterator<Item = (usize, u8)> + '_ {
    let mut pos = 0;
    core::iter::from_fn(move || {
        if pos + 2 > config.len() || config[pos] < 2 {
            return None;
        }
        let here = (pos, config[pos + 1]);
        pos += config[pos] as usize;
        Some(here)
    })
}

/// Split a configuration block into groups starting at each descriptor
/// of `target` type.
///
/// An interface group runs to the next interface or IAD descriptor; an
/// IAD group also swallows the interfaces the association names.
pub(crate) fn groups(config: &[u8], target: u8) -> heapless::Vec<Group, MAX_GROUPS> {
    let mut out: heapless::Vec<Group, MAX_GROUPS> = heapless::Vec::new();
    for (start, dtype) in descriptor_offsets(config) {
        if dtype != target {
            continue;
        }
        // A descriptor whose claimed length runs past the block is
        // device garbage; skip the group rather than index past the end
        if start + config[start] as usize > config.len() {
            continue;
        }
        let end = match target {
            DESC_IAD => iad_group_end(config, start),
            _ => descriptor_offsets(config)
                .find(|&(pos, t)| pos > start && (t == DESC_INTERFACE || t == DESC_IAD))
                .map(|(pos, _)| pos)
                .unwrap_or(config.len()),
        };
        if out.push(Group { start, end }).is_err() {
            break;
        }
    }
    out
}

/// End of an IAD group: the first descriptor past the interfaces the
/// association covers.
fn iad_group_end(config: &[u8], start: usize) -> usize {
    let (first, count) = match (config.get(start + 2), config.get(start + 3)) {
        (Some(&f), Some(&c)) => (f, c),
        _ => return config.len(),
    };
    let past = first as u16 + count as u16;
    descriptor_offsets(config)
        .find(|&(pos, t)| {
            pos > start
                && (t == DESC_IAD
                    || (t == DESC_INTERFACE
                        && config.get(pos + 2).map_or(true, |&n| n as u16 >= past)))
        })
        .map(|(pos, _)| pos)
        .unwrap_or(config.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device_descriptor() -> [u8; 18] {
        [
            18, 1, 0x00, 0x02, // bcdUSB 2.00
            9, 0, 1, // class 9 (hub)
            64,   // bMaxPacketSize0
            0x6A, 0x04, 0x12, 0x20, // VID 0x046A PID 0x2012
            0x00, 0x01, 0, 0, 0, 1,
        ]
    }

    #[test]
    fn device_descriptor_decodes() {
        let desc = DeviceDescriptor::parse(&device_descriptor()).unwrap();
        assert_eq!(desc.device_class, 9);
        assert_eq!(desc.max_packet0, 64);
        assert_eq!(desc.vendor_id, 0x046A);
        assert_eq!(desc.product_id, 0x2012);
    }

    #[test]
    fn device_descriptor_rejects_wrong_type() {
        let mut bad = device_descriptor();
        bad[1] = 2;
        assert_eq!(
            DeviceDescriptor::parse(&bad),
            Err(UsbError::ProtocolViolation)
        );
    }

    #[test]
    fn max_packet0_from_first_eight_bytes() {
        let desc = device_descriptor();
        assert_eq!(DeviceDescriptor::parse_max_packet0(&desc[..8]), Ok(64));

        let mut bad = desc;
        bad[7] = 13;
        assert_eq!(
            DeviceDescriptor::parse_max_packet0(&bad[..8]),
            Err(UsbError::ProtocolViolation)
        );
    }

    #[test]
    fn config_header_decodes() {
        let buf = [9u8, 2, 25, 0, 1, 1, 0, 0xA0, 50];
        let cfg = ConfigDescriptor::parse(&buf).unwrap();
        assert_eq!(cfg.total_length, 25);
        assert_eq!(cfg.num_interfaces, 1);
        assert_eq!(cfg.config_value, 1);
        assert_eq!(cfg.attributes, 0xA0);
        assert_eq!(cfg.max_power, 50);
    }

    /// Config with two interfaces, the second carrying one endpoint.
    fn two_interface_config() -> [u8; 9 + 9 + 9 + 7] {
        let mut buf = [0u8; 34];
        buf[..9].copy_from_slice(&[9, 2, 34, 0, 2, 1, 0, 0x80, 25]);
        buf[9..18].copy_from_slice(&[9, 4, 0, 0, 0, 3, 0, 0, 0]);
        buf[18..27].copy_from_slice(&[9, 4, 1, 0, 1, 8, 6, 0x50, 0]);
        buf[27..34].copy_from_slice(&[7, 5, 0x81, 2, 64, 0, 1]);
        buf
    }

    #[test]
    fn interface_groups_split_at_interface_boundaries() {
        let config = two_interface_config();
        let groups = groups(&config, DESC_INTERFACE);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0], Group { start: 9, end: 18 });
        // Second group keeps its trailing endpoint descriptor
        assert_eq!(groups[1], Group { start: 18, end: 34 });
    }

    #[test]
    fn iad_group_spans_its_member_interfaces() {
        // IAD covering interfaces 0 and 1, then a third interface
        let mut buf = [0u8; 9 + 8 + 9 + 9 + 9] ;
        buf[..9].copy_from_slice(&[9, 2, 44, 0, 3, 1, 0, 0x80, 25]);
        buf[9..17].copy_from_slice(&[8, 0x0B, 0, 2, 2, 2, 0, 0]);
        buf[17..26].copy_from_slice(&[9, 4, 0, 0, 0, 2, 2, 0, 0]);
        buf[26..35].copy_from_slice(&[9, 4, 1, 0, 0, 10, 0, 0, 0]);
        buf[35..44].copy_from_slice(&[9, 4, 2, 0, 0, 3, 0, 0, 0]);

        let iads = groups(&buf, DESC_IAD);
        assert_eq!(iads.len(), 1);
        assert_eq!(iads[0], Group { start: 9, end: 35 });
    }

    #[test]
    fn truncated_trailing_descriptor_is_skipped() {
        // An interface descriptor claiming 9 bytes with only 2 present
        let mut config = [0u8; 11];
        config[..9].copy_from_slice(&[9, 2, 11, 0, 1, 1, 0, 0x80, 25]);
        config[9..].copy_from_slice(&[9, 4]);
        assert!(groups(&config, DESC_INTERFACE).is_empty());

        // Same shape for an association descriptor
        let mut config = [0u8; 11];
        config[..9].copy_from_slice(&[9, 2, 11, 0, 1, 1, 0, 0x80, 25]);
        config[9..].copy_from_slice(&[8, 0x0B]);
        assert!(groups(&config, DESC_IAD).is_empty());
    }

    #[test]
    fn zero_length_descriptor_stops_the_walk() {
        let mut config = two_interface_config();
        config[18] = 0;
        let groups = groups(&config, DESC_INTERFACE);
        // The malformed tail ends the walk; the surviving group swallows
        // the remaining bytes
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0], Group { start: 9, end: 34 });
    }
}
