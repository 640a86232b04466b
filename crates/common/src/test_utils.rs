//! Test utilities for the host stack
//!
//! Builders for the descriptors that simulated devices hand out during
//! enumeration.
//!
//! # Example
//!
//! ```
//! use common::test_utils::{create_mock_device_descriptor, create_keyboard_configuration};
//!
//! let device = create_mock_device_descriptor(0x1234, 0x5678);
//! assert_eq!(device.vendor_id, 0x1234);
//!
//! let config = create_keyboard_configuration(1);
//! assert_eq!(config.interfaces.len(), 1);
//! ```

use protocol::types::CLASS_HUB;
use protocol::{
    AlternateSetting, Configuration, ConfigurationDescriptor, DeviceDescriptor,
    EndpointDescriptor, ExtraDescriptor, Interface, InterfaceDescriptor,
};

/// A plain full-speed function with one configuration and no strings
pub fn create_mock_device_descriptor(vendor_id: u16, product_id: u16) -> DeviceDescriptor {
    DeviceDescriptor {
        usb_version: 0x0200,
        class: 0x00,
        subclass: 0x00,
        protocol: 0x00,
        max_packet_size0: 64,
        vendor_id,
        product_id,
        device_version: 0x0100,
        manufacturer_index: 0,
        product_index: 0,
        serial_index: 0,
        num_configurations: 1,
    }
}

/// A device descriptor for a hub
pub fn create_hub_device_descriptor() -> DeviceDescriptor {
    DeviceDescriptor {
        class: CLASS_HUB,
        max_packet_size0: 64,
        ..create_mock_device_descriptor(0x05e3, 0x0608)
    }
}

/// Build an interface descriptor with the given endpoints
pub fn create_alternate(
    number: u8,
    alternate_setting: u8,
    class: u8,
    endpoints: Vec<EndpointDescriptor>,
) -> AlternateSetting {
    AlternateSetting {
        descriptor: InterfaceDescriptor {
            number,
            alternate_setting,
            num_endpoints: endpoints.len() as u8,
            class,
            subclass: 0,
            protocol: 0,
            string_index: 0,
        },
        endpoints,
        extra: Vec::new(),
    }
}

/// Wrap interfaces into a configuration with the given bConfigurationValue
pub fn create_configuration(value: u8, interfaces: Vec<Interface>) -> Configuration {
    let config = Configuration {
        descriptor: ConfigurationDescriptor {
            total_length: 0,
            num_interfaces: interfaces.len() as u8,
            value,
            string_index: 0,
            attributes: 0x80,
            max_power: 50,
        },
        interfaces,
        extra: Vec::new(),
    };
    // Round-trip so total_length is filled in
    Configuration::parse(&config.to_bytes()).unwrap_or(config)
}

/// Boot keyboard: HID interface with one interrupt IN endpoint
pub fn create_keyboard_configuration(value: u8) -> Configuration {
    let mut alternate = create_alternate(
        0,
        0,
        0x03,
        vec![EndpointDescriptor {
            address: 0x81,
            attributes: 0x03,
            max_packet_size: 8,
            interval: 10,
        }],
    );
    alternate.extra.push(ExtraDescriptor {
        descriptor_type: 0x21,
        data: vec![9, 0x21, 0x11, 0x01, 0, 1, 0x22, 63, 0],
    });
    create_configuration(
        value,
        vec![Interface {
            number: 0,
            alternates: vec![alternate],
        }],
    )
}

/// Vendor device whose interface 0 has a bulk pair only in alternate 1
pub fn create_alternate_setting_configuration(value: u8) -> Configuration {
    create_configuration(
        value,
        vec![Interface {
            number: 0,
            alternates: vec![
                create_alternate(0, 0, 0xff, Vec::new()),
                create_alternate(
                    0,
                    1,
                    0xff,
                    vec![
                        EndpointDescriptor {
                            address: 0x82,
                            attributes: 0x02,
                            max_packet_size: 64,
                            interval: 0,
                        },
                        EndpointDescriptor {
                            address: 0x02,
                            attributes: 0x02,
                            max_packet_size: 64,
                            interval: 0,
                        },
                    ],
                ),
            ],
        }],
    )
}

/// Configuration large enough that a 64-byte probe cannot hold it
pub fn create_large_configuration(value: u8, interfaces: u8) -> Configuration {
    create_configuration(
        value,
        (0..interfaces)
            .map(|number| Interface {
                number,
                alternates: vec![create_alternate(
                    number,
                    0,
                    0xff,
                    vec![EndpointDescriptor {
                        address: 0x81 + number,
                        attributes: 0x02,
                        max_packet_size: 64,
                        interval: 0,
                    }],
                )],
            })
            .collect(),
    )
}

/// Hub configuration with its status change interrupt endpoint
pub fn create_hub_configuration() -> Configuration {
    create_configuration(
        1,
        vec![Interface {
            number: 0,
            alternates: vec![create_alternate(
                0,
                0,
                CLASS_HUB,
                vec![EndpointDescriptor {
                    address: 0x81,
                    attributes: 0x03,
                    max_packet_size: 1,
                    interval: 12,
                }],
            )],
        }],
    )
}
