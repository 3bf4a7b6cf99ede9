//! Attached USB device records

use crate::enumeration::{EnumState, ENUM_BUF_LEN};
use crate::pool::{DeviceId, PipeId};
use crate::transfer::SetupPacket;

/// Bound drivers per device
pub const MAX_BOUND_DRIVERS: usize = 4;

/// Negotiated bus speed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Speed {
    /// 1.5 Mbit/s
    Low,
    /// 12 Mbit/s
    Full,
    /// 480 Mbit/s
    High,
}

impl Speed {
    /// EHCI queue-head endpoint speed encoding
    pub(crate) fn qh_encoding(self) -> u32 {
        use crate::ehci::qh::endpoint;
        match self {
            Speed::Full => endpoint::SPEED_FULL,
            Speed::Low => endpoint::SPEED_LOW,
            Speed::High => endpoint::SPEED_HIGH,
        }
    }
}

/// One USB-attached node.
///
/// Allocated on attach detection, addressed during enumeration, freed on
/// disconnect. The attached-device set is a singly-linked list threaded
/// through `next` (pool indices, never raw pointers).
pub struct Device {
    /// Bootstrap/default control pipe
    pub(crate) control_pipe: Option<PipeId>,
    /// Next device in the attached set
    pub(crate) next: Option<DeviceId>,
    /// Setup packet scratch area used by enumeration and class requests
    pub(crate) setup: SetupPacket,
    /// Drivers bound to this device (registry indices)
    pub(crate) bound_drivers: heapless::Vec<usize, MAX_BOUND_DRIVERS>,
    /// Enumeration progress
    pub(crate) enum_state: EnumState,
    /// Frame number after which the current enumeration step is failed
    pub(crate) enum_deadline: u32,
    /// Descriptor read target during enumeration (DMA destination; pool
    /// slots never move, so this stays at a stable address)
    pub(crate) enum_buf: [u8; ENUM_BUF_LEN],
    /// wTotalLength of the active configuration, once the header is read
    pub(crate) config_total: u16,

    pub(crate) speed: Speed,
    pub(crate) address: u8,
    pub(crate) hub_address: u8,
    pub(crate) hub_port: u8,

    pub(crate) device_class: u8,
    pub(crate) device_subclass: u8,
    pub(crate) device_protocol: u8,
    pub(crate) max_packet0: u16,
    pub(crate) vendor_id: u16,
    pub(crate) product_id: u16,
    pub(crate) bm_attributes: u8,
    pub(crate) b_max_power: u8,
    /// First LANGID from string descriptor zero; 0 until a string read
    /// populates it
    pub(crate) language_id: u16,
}

impl Device {
    pub(crate) fn new(speed: Speed, hub_address: u8, hub_port: u8) -> Self {
        Self {
            control_pipe: None,
            next: None,
            setup: SetupPacket::default(),
            bound_drivers: heapless::Vec::new(),
            enum_state: EnumState::Attached,
            enum_deadline: 0,
            enum_buf: [0; ENUM_BUF_LEN],
            config_total: 0,
            speed,
            address: 0,
            hub_address,
            hub_port,
            device_class: 0,
            device_subclass: 0,
            device_protocol: 0,
            max_packet0: 8,
            vendor_id: 0,
            product_id: 0,
            bm_attributes: 0,
            b_max_power: 0,
            language_id: 0,
        }
    }

    /// Bus address (0 only while enumeration is still assigning one)
    pub fn address(&self) -> u8 {
        self.address
    }

    /// Negotiated speed
    pub fn speed(&self) -> Speed {
        self.speed
    }

    /// Upstream hub address (0 = root port)
    pub fn hub_address(&self) -> u8 {
        self.hub_address
    }

    /// Upstream hub port (0 = root port)
    pub fn hub_port(&self) -> u8 {
        self.hub_port
    }

    /// bDeviceClass from the device descriptor
    pub fn device_class(&self) -> u8 {
        self.device_class
    }

    /// bDeviceSubClass from the device descriptor
    pub fn device_subclass(&self) -> u8 {
        self.device_subclass
    }

    /// bDeviceProtocol from the device descriptor
    pub fn device_protocol(&self) -> u8 {
        self.device_protocol
    }

    /// idVendor
    pub fn vendor_id(&self) -> u16 {
        self.vendor_id
    }

    /// idProduct
    pub fn product_id(&self) -> u16 {
        self.product_id
    }

    /// Default control endpoint max packet size
    pub fn max_packet0(&self) -> u16 {
        self.max_packet0
    }

    /// Configuration bmAttributes (power flags)
    pub fn power_attributes(&self) -> u8 {
        self.bm_attributes
    }

    /// Configuration bMaxPower, in 2 mA units
    pub fn max_power(&self) -> u8 {
        self.b_max_power
    }

    /// First supported string-descriptor language ID, or 0 while no
    /// string descriptor has been read
    pub fn language_id(&self) -> u16 {
        self.language_id
    }

    /// Default control pipe, once created
    pub fn control_pipe(&self) -> Option<PipeId> {
        self.control_pipe
    }

    /// Enumeration finished (drivers were offered the device)
    pub fn is_enumerated(&self) -> bool {
        matches!(
            self.enum_state,
            EnumState::DriverOffering | EnumState::Bound
        )
    }
}
