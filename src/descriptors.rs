// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! USB descriptor definitions and the once-per-boot descriptor selection.
//!
//! Two identities can appear on the bus: the bootloader's own, compiled in
//! below as [`BOOT_DESCRIPTORS`], and the application's, reached through the
//! addresses stored in the Application Record. Exactly one of the two is
//! selected per boot, before the USB engine is initialized, and the
//! selection is never changed afterward -- re-enumerating mid-session is not
//! supported by this design. The selection itself is [`ActiveDescriptors`].
//!
//! The descriptor structs are plain `#[repr(C)]` byte layouts deriving
//! `zerocopy::AsBytes`, so the engine can hand them to the host with
//! `.as_bytes()` and no marshalling step.

use byteorder::LittleEndian;
use zerocopy::{AsBytes, U16};

use num_derive::FromPrimitive;

/// USB deals in two transfer directions, called OUT (host-to-device) and IN
/// (device-to-host). OUT is represented by a 0 byte, IN by `0x80`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
pub enum UsbDir {
    Out = 0,
    In = 0x80,
}

impl UsbDir {
    pub const fn endpoint(self, num: u8) -> u8 {
        num | self as u8
    }

    pub const fn of_endpoint_addr(addr: u8) -> Self {
        if addr & Self::In as u8 != 0 {
            Self::In
        } else {
            Self::Out
        }
    }
}

/// Types of USB descriptor.
#[derive(Copy, Clone, Debug, FromPrimitive, AsBytes)]
#[repr(u8)]
pub enum UsbDescType {
    Device = 0x01,
    Config = 0x02,
    String = 0x03,
    Interface = 0x04,
    Endpoint = 0x05,
}

/// Types of transfer that can be indicated by the `attributes` field on
/// `UsbEndpointDescriptor`.
#[derive(Copy, Clone, Debug, FromPrimitive, AsBytes)]
#[repr(u8)]
pub enum UsbTransferType {
    Control = 0,
    Bulk = 2,
}

/// Describes a device. This is the most broad description in USB and is
/// typically the first thing the host asks for.
#[repr(C)]
#[derive(Debug, AsBytes)]
pub struct UsbDeviceDescriptor {
    /// Length of this structure, must be 18.
    pub length: u8,
    /// Type of this descriptor, must be `Device`.
    pub descriptor_type: UsbDescType,
    /// Version of the device descriptor / USB protocol, in binary-coded
    /// decimal. This is typically `0x01_10` for USB 1.1.
    pub bcd_usb: U16<LittleEndian>,
    /// Class of device, giving a broad functional area.
    pub device_class: u8,
    /// Subclass of device, refining the class.
    pub device_subclass: u8,
    /// Protocol within the subclass.
    pub device_protocol: u8,
    /// Maximum unit of data this device can move on EP0.
    pub max_packet_size0: u8,
    /// ID of product vendor.
    pub vendor: U16<LittleEndian>,
    /// ID of product.
    pub product: U16<LittleEndian>,
    /// Device version number, as BCD again.
    pub bcd_device: U16<LittleEndian>,
    /// Index of manufacturer name in string descriptor table.
    pub manufacturer_s: u8,
    /// Index of product name in string descriptor table.
    pub product_s: u8,
    /// Index of serial number in string descriptor table.
    pub serial_s: u8,
    /// Number of configurations supported by this device.
    pub num_configurations: u8,
}

/// Description of a single available device configuration.
#[repr(C)]
#[derive(Debug, AsBytes)]
pub struct UsbConfigurationDescriptor {
    /// Length of this structure, must be 9.
    pub length: u8,
    /// Type of this descriptor, must be `Config`.
    pub descriptor_type: UsbDescType,
    /// Total length of all descriptors in this configuration, concatenated.
    /// This will include this descriptor, plus at least one interface
    /// descriptor, plus each interface descriptor's endpoint descriptors.
    pub total_length: U16<LittleEndian>,
    /// Number of interface descriptors in this configuration.
    pub num_interfaces: u8,
    /// Number to use when requesting this configuration via a
    /// `SetConfiguration` request.
    pub configuration_value: u8,
    /// Index of this configuration's name in the string descriptor table.
    pub configuration_s: u8,
    /// Bit set of device attributes:
    ///
    /// - Bit 7 should be set (indicates that device can be bus powered in
    /// USB 1.0).
    /// - Bit 6 indicates that the device can be self-powered.
    /// - Bit 5 indicates that the device can signal remote wakeup of the
    /// host (like a keyboard).
    /// - The rest are reserved and should be zero.
    pub attributes: u8,
    /// Maximum device power consumption in units of 2mA.
    pub max_power: u8,
}

/// Description of an interface within a configuration.
#[repr(C)]
#[derive(Debug, AsBytes)]
pub struct UsbInterfaceDescriptor {
    /// Length of this structure, must be 9.
    pub length: u8,
    /// Type of this descriptor, must be `Interface`.
    pub descriptor_type: UsbDescType,
    /// ID of this interface.
    pub interface_number: u8,
    /// Allows a single `interface_number` to have several alternate
    /// interface settings, where each alternate increments this field.
    /// Normally there's only one, and `alternate_setting` is zero.
    pub alternate_setting: u8,
    /// Number of endpoint descriptors in this interface.
    pub num_endpoints: u8,
    /// Interface class code, distinguishing the type of interface.
    pub interface_class: u8,
    /// Interface subclass code, refining the class of interface.
    pub interface_subclass: u8,
    /// Protocol within the interface class/subclass.
    pub interface_protocol: u8,
    /// Index of interface name within string descriptor table.
    pub interface_s: u8,
}

/// Describes an endpoint within an interface.
#[repr(C)]
#[derive(Debug, AsBytes)]
pub struct UsbEndpointDescriptor {
    /// Length of this struct, must be 7.
    pub length: u8,
    /// Type of this descriptor, must be `Endpoint`.
    pub descriptor_type: UsbDescType,
    /// Address of this endpoint, where the bottom 4 bits give the endpoint
    /// number (0..15) and the top bit distinguishes IN (1) from OUT (0).
    pub endpoint_address: u8,
    /// Endpoint attributes; the most relevant part is the bottom 2 bits,
    /// which control the transfer type using the values from
    /// `UsbTransferType`.
    pub attributes: u8,
    /// Maximum packet size this endpoint can accept/produce.
    pub max_packet_size: U16<LittleEndian>,
    /// Interval for polling interrupt/isochronous endpoints (not used here)
    /// in milliseconds.
    pub interval: u8,
}

/// The bootloader's compiled-in identity: everything the USB engine needs to
/// enumerate the device in boot mode.
#[derive(Debug)]
pub struct BootDescriptorSet {
    pub device_descriptor: &'static UsbDeviceDescriptor,
    pub interface_descriptor: &'static UsbInterfaceDescriptor,
    pub config_descriptor: &'static UsbConfigurationDescriptor,
    pub lang_descriptor: &'static [u8],
    pub descriptor_strings: &'static [&'static [u8]],

    /// The flash-protocol endpoints, EP1 OUT and EP2 IN.
    pub endpoints: [&'static UsbEndpointDescriptor; 2],
}

// Handy constants for the endpoints the flashing protocol uses.
pub const EP1_OUT_ADDR: u8 = UsbDir::Out.endpoint(1);
pub const EP2_IN_ADDR: u8 = UsbDir::In.endpoint(2);

/// Boot-mode identity presented to the host while no application descriptors
/// have been selected.
///
/// The boot configuration deliberately uses `configuration_value` 1:
/// application images declare values of 2 and up, which is what the deferred
/// endpoint-handler rebind in [`crate::machine`] keys on.
pub static BOOT_DESCRIPTORS: BootDescriptorSet = BootDescriptorSet {
    device_descriptor: &UsbDeviceDescriptor {
        length: core::mem::size_of::<UsbDeviceDescriptor>() as u8,
        descriptor_type: UsbDescType::Device,
        bcd_usb: U16::from_bytes(u16::to_le_bytes(0x0110)),
        device_class: 0,
        device_subclass: 0,
        device_protocol: 0,
        max_packet_size0: 8,
        vendor: U16::from_bytes(u16::to_le_bytes(0x04D8)),
        product: U16::from_bytes(u16::to_le_bytes(0xFEAA)),
        bcd_device: U16::from_bytes(u16::to_le_bytes(0x0200)),
        manufacturer_s: 1,
        product_s: 2,
        serial_s: 0,
        num_configurations: 1,
    },
    interface_descriptor: &UsbInterfaceDescriptor {
        length: core::mem::size_of::<UsbInterfaceDescriptor>() as u8,
        descriptor_type: UsbDescType::Interface,
        interface_number: 0,
        alternate_setting: 0,
        num_endpoints: 2,
        interface_class: 0xFF,
        interface_subclass: 0,
        interface_protocol: 0,
        interface_s: 0,
    },
    config_descriptor: &UsbConfigurationDescriptor {
        length: core::mem::size_of::<UsbConfigurationDescriptor>() as u8,
        descriptor_type: UsbDescType::Config,
        total_length: U16::from_bytes(u16::to_le_bytes(
            core::mem::size_of::<UsbConfigurationDescriptor>() as u16
            + core::mem::size_of::<UsbInterfaceDescriptor>() as u16
            + core::mem::size_of::<UsbEndpointDescriptor>() as u16
            + core::mem::size_of::<UsbEndpointDescriptor>() as u16
        )),
        num_interfaces: 1,
        configuration_value: 1,
        configuration_s: 0,
        attributes: 0xC0,
        max_power: 0x32,
    },
    lang_descriptor: &[4, 0x03, 0x09, 0x04],
    descriptor_strings: &[
        // Look at these gross UTF-16 strings!
        b"V\0a\0s\0c\0o\0",
        b"U\0S\0B\0 \0B\0o\0o\0t\0l\0o\0a\0d\0e\0r\0",
    ],
    endpoints: [&EP1_OUT_DESC, &EP2_IN_DESC],
};

static EP1_OUT_DESC: UsbEndpointDescriptor = UsbEndpointDescriptor {
    length: core::mem::size_of::<UsbEndpointDescriptor>() as u8,
    descriptor_type: UsbDescType::Endpoint,
    endpoint_address: EP1_OUT_ADDR,
    attributes: UsbTransferType::Bulk as u8,
    max_packet_size: U16::from_bytes(u16::to_le_bytes(64)),
    interval: 0,
};

static EP2_IN_DESC: UsbEndpointDescriptor = UsbEndpointDescriptor {
    length: core::mem::size_of::<UsbEndpointDescriptor>() as u8,
    descriptor_type: UsbDescType::Endpoint,
    endpoint_address: EP2_IN_ADDR,
    attributes: UsbTransferType::Bulk as u8,
    max_packet_size: U16::from_bytes(u16::to_le_bytes(64)),
    interval: 0,
};

/// Which of the two identities is on the bus this boot cycle.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DescriptorSource {
    Boot,
    Application,
}

/// The application's descriptor addresses, lifted out of the Application
/// Record. Opaque here; the USB engine dereferences them during enumeration.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct AppDescriptors {
    /// Flash address of the device descriptor.
    pub device: u32,
    /// Flash address of the configuration descriptor.
    pub configuration: u32,
    /// Flash address of the string descriptor table.
    pub strings: u32,
}

/// The descriptor selection the USB engine reads during enumeration. Bound
/// exactly once, before USB initialization, by the state machine; never
/// reassigned within a boot cycle.
#[derive(Copy, Clone, Debug)]
pub enum ActiveDescriptors {
    /// Boot-mode identity.
    Boot(&'static BootDescriptorSet),
    /// The identity named by the Application Record.
    Application(AppDescriptors),
}

impl ActiveDescriptors {
    pub fn source(&self) -> DescriptorSource {
        match self {
            ActiveDescriptors::Boot(_) => DescriptorSource::Boot,
            ActiveDescriptors::Application(_) => DescriptorSource::Application,
        }
    }

    /// The application descriptor addresses, if that's what was selected.
    pub fn application(&self) -> Option<AppDescriptors> {
        match self {
            ActiveDescriptors::Boot(_) => None,
            ActiveDescriptors::Application(app) => Some(*app),
        }
    }

    /// The compiled-in boot set, if that's what was selected.
    pub fn boot(&self) -> Option<&'static BootDescriptorSet> {
        match self {
            ActiveDescriptors::Boot(set) => Some(set),
            ActiveDescriptors::Application(_) => None,
        }
    }
}
