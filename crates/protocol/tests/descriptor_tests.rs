//! Integration tests for descriptor parsing against captured device traffic
//!
//! Covers the byte sequences real devices return on the default pipe:
//! - Device descriptors, including the 8-byte probe read
//! - Configuration blobs with class-specific and association descriptors
//! - Interleaved alternate settings
//! - Hub descriptors with more than seven ports
//! - SETUP packets as they appear on the wire

use protocol::hub::{HUB_DESC_MAX_LEN, parse_status_words};
use protocol::{
    Configuration, DescriptorToken, DescriptorWalker, DeviceDescriptor, DeviceSpeed, Direction,
    HubDescriptor, PortChange, PortStatus, ProtocolError, SetupPacket, TransferKind,
    decode_string,
};

/// Device descriptor of a low-speed USB boot keyboard
const KEYBOARD_DEVICE: [u8; 18] = [
    0x12, 0x01, 0x10, 0x01, 0x00, 0x00, 0x00, 0x08, 0x6d, 0x04, 0x1c, 0xc3, 0x00, 0x49, 0x01,
    0x02, 0x00, 0x01,
];

/// Configuration of the same keyboard: one HID interface with an 8-byte
/// interrupt IN endpoint polled every 10 frames
const KEYBOARD_CONFIG: [u8; 34] = [
    0x09, 0x02, 0x22, 0x00, 0x01, 0x01, 0x00, 0xa0, 0x31, // configuration
    0x09, 0x04, 0x00, 0x00, 0x01, 0x03, 0x01, 0x01, 0x00, // interface 0
    0x09, 0x21, 0x10, 0x01, 0x00, 0x01, 0x22, 0x41, 0x00, // HID
    0x07, 0x05, 0x81, 0x03, 0x08, 0x00, 0x0a, // endpoint 0x81
];

/// Audio-class style configuration: an interface association up front and
/// streaming alternates listed after the control interface's descriptors
fn composite_config() -> Vec<u8> {
    let body: [&[u8]; 7] = [
        &[0x08, 0x0b, 0x00, 0x02, 0x01, 0x00, 0x00, 0x00], // IAD
        &[0x09, 0x04, 0x00, 0x00, 0x00, 0x01, 0x01, 0x00, 0x00], // control, alt 0
        &[0x09, 0x24, 0x01, 0x00, 0x01, 0x09, 0x00, 0x01, 0x01], // class header
        &[0x09, 0x04, 0x01, 0x00, 0x00, 0x01, 0x02, 0x00, 0x00], // streaming, alt 0
        &[0x09, 0x04, 0x01, 0x01, 0x01, 0x01, 0x02, 0x00, 0x00], // streaming, alt 1
        &[0x07, 0x24, 0x01, 0x01, 0x01, 0x01, 0x00], // class general
        &[0x07, 0x05, 0x01, 0x09, 0xc0, 0x00, 0x01], // iso OUT
    ];
    let body = body.concat();
    let total = 9 + body.len() as u16;
    let mut blob = vec![0x09, 0x02, total as u8, (total >> 8) as u8, 0x02, 0x01, 0x00, 0x80, 0x32];
    blob.extend_from_slice(&body);
    blob
}

mod device_descriptors {
    use super::*;

    #[test]
    fn test_keyboard_device_descriptor() {
        let desc = DeviceDescriptor::parse(&KEYBOARD_DEVICE).unwrap();
        assert_eq!(desc.usb_version, 0x0110);
        assert_eq!(desc.max_packet_size0, 8);
        assert_eq!(desc.vendor_id, 0x046d);
        assert_eq!(desc.product_id, 0xc31c);
        assert_eq!(desc.manufacturer_index, 1);
        assert_eq!(desc.product_index, 2);
        assert_eq!(desc.num_configurations, 1);
        assert_eq!(desc.to_bytes(), KEYBOARD_DEVICE.to_vec());
    }

    #[test]
    fn test_probe_read_yields_packet_size() {
        assert_eq!(DeviceDescriptor::parse_max_packet_size0(&KEYBOARD_DEVICE[..8]), Ok(8));
        assert!(matches!(
            DeviceDescriptor::parse(&KEYBOARD_DEVICE[..8]),
            Err(ProtocolError::Truncated { needed: 18, available: 8 })
        ));
    }

    #[test]
    fn test_configuration_bytes_are_not_a_device_descriptor() {
        assert_eq!(
            DeviceDescriptor::parse_max_packet_size0(&KEYBOARD_CONFIG),
            Err(ProtocolError::UnexpectedType {
                expected: 0x01,
                found: 0x02
            })
        );
    }
}

mod configuration_blobs {
    use super::*;

    #[test]
    fn test_keyboard_configuration() {
        let config = Configuration::parse(&KEYBOARD_CONFIG).unwrap();
        assert_eq!(config.value(), 1);
        assert_eq!(config.descriptor.total_length, 34);
        assert_eq!(config.descriptor.max_power, 0x31);

        let alt = config.interface(0).unwrap().alternate(0).unwrap();
        assert_eq!(alt.descriptor.class, 0x03);
        assert_eq!(alt.extra.len(), 1);
        assert_eq!(alt.extra[0].descriptor_type, 0x21);

        let ep = alt.endpoints[0];
        assert_eq!(ep.direction(), Direction::In);
        assert_eq!(ep.kind(), TransferKind::Interrupt);
        assert_eq!(ep.max_packet_size, 8);
        assert_eq!(ep.interval, 10);
        assert_eq!(config.to_bytes(), KEYBOARD_CONFIG.to_vec());
    }

    #[test]
    fn test_probe_header_carries_total_length() {
        // The 9-byte header alone is enough to size the full read
        let mut walker = DescriptorWalker::new(&KEYBOARD_CONFIG[..9]);
        match walker.next() {
            Some(Ok(DescriptorToken::Configuration(header))) => {
                assert_eq!(header.total_length, 34);
            }
            other => panic!("expected configuration header, got {:?}", other),
        }
        assert!(walker.next().is_none());
    }

    #[test]
    fn test_association_descriptor_stays_on_configuration() {
        let config = Configuration::parse(&composite_config()).unwrap();
        assert_eq!(config.extra.len(), 1);
        assert_eq!(config.extra[0].descriptor_type, 0x0b);
        assert_eq!(config.interfaces.len(), 2);
    }

    #[test]
    fn test_streaming_alternates() {
        let config = Configuration::parse(&composite_config()).unwrap();

        let control = config.interface(0).unwrap();
        assert_eq!(control.alternates.len(), 1);
        assert_eq!(control.alternates[0].extra.len(), 1);

        let streaming = config.interface(1).unwrap();
        assert_eq!(streaming.alternates.len(), 2);
        assert!(streaming.alternate(0).unwrap().endpoints.is_empty());
        let active = streaming.alternate(1).unwrap();
        assert_eq!(active.extra.len(), 1);
        assert_eq!(active.endpoints.len(), 1);
        assert_eq!(active.endpoints[0].kind(), TransferKind::Isochronous);
        assert_eq!(active.endpoints[0].max_packet_size, 192);
    }

    #[test]
    fn test_interleaved_alternates_keep_their_endpoints() {
        // interface 0 alt 0, interface 1 alt 0, then interface 0 alt 1
        let blob: Vec<u8> = [
            &[0x09u8, 0x02, 0x32, 0x00, 0x02, 0x01, 0x00, 0x80, 0x32][..],
            &[0x09, 0x04, 0x00, 0x00, 0x00, 0xff, 0x00, 0x00, 0x00],
            &[0x09, 0x04, 0x01, 0x00, 0x01, 0xff, 0x00, 0x00, 0x00],
            &[0x07, 0x05, 0x83, 0x03, 0x10, 0x00, 0x01],
            &[0x09, 0x04, 0x00, 0x01, 0x01, 0xff, 0x00, 0x00, 0x00],
            &[0x07, 0x05, 0x02, 0x02, 0x40, 0x00, 0x00],
        ]
        .concat();
        let config = Configuration::parse(&blob).unwrap();

        let first = config.interface(0).unwrap();
        assert_eq!(first.alternate(1).unwrap().endpoints[0].address, 0x02);
        assert!(first.alternate(0).unwrap().endpoints.is_empty());
        let second = config.interface(1).unwrap();
        assert_eq!(second.alternates[0].endpoints.len(), 1);
        assert_eq!(second.alternates[0].endpoints[0].address, 0x83);
    }

    #[test]
    fn test_cut_off_blob_is_rejected() {
        let blob = &KEYBOARD_CONFIG[..30];
        assert!(matches!(
            Configuration::parse(blob),
            Err(ProtocolError::Truncated { .. })
        ));
    }

    #[test]
    fn test_configuration_serializes_to_json() {
        let config = Configuration::parse(&KEYBOARD_CONFIG).unwrap();
        let json = serde_json::to_string(&config).unwrap();
        let back: Configuration = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}

mod hub_structures {
    use super::*;

    #[test]
    fn test_ten_port_hub_descriptor() {
        // Two bytes of DeviceRemovable and two of PortPwrCtrlMask
        let bytes = [
            0x0b, 0x29, 0x0a, 0x09, 0x00, 0x32, 0x64, 0x00, 0x00, 0xff, 0xff,
        ];
        let desc = HubDescriptor::parse(&bytes).unwrap();
        assert_eq!(desc.num_ports, 10);
        assert_eq!(desc.characteristics, 0x0009);
        assert_eq!(desc.power_good_ms(), 100);
        assert_eq!(desc.removable, vec![0, 0]);
        assert_eq!(desc.to_bytes(), bytes.to_vec());
        assert!(bytes.len() <= HUB_DESC_MAX_LEN as usize);
    }

    #[test]
    fn test_low_speed_attach_status() {
        // Connected, enabled, powered, low speed; connection changed
        let (status, change) = parse_status_words(&[0x03, 0x03, 0x01, 0x00]).unwrap();
        let status = PortStatus(status);
        assert!(status.connected() && status.enabled() && status.powered());
        assert_eq!(status.speed(), DeviceSpeed::Low);

        let mut change = PortChange(change);
        assert_eq!(change.next_pending(), Some((PortChange::CONNECTION, 16)));
        change.clear(PortChange::CONNECTION);
        assert!(change.is_empty());
    }

    #[test]
    fn test_reset_and_connection_change_ack_order() {
        let change = PortChange(PortChange::RESET | PortChange::CONNECTION);
        assert_eq!(change.next_pending(), Some((PortChange::CONNECTION, 16)));
        let change = PortChange(PortChange::RESET | PortChange::OVER_CURRENT);
        assert_eq!(change.next_pending(), Some((PortChange::OVER_CURRENT, 19)));
    }
}

mod wire_requests {
    use super::*;

    #[test]
    fn test_enumeration_requests_on_the_wire() {
        assert_eq!(
            SetupPacket::get_device_descriptor(18).to_bytes(),
            [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00]
        );
        assert_eq!(
            SetupPacket::set_address(5).to_bytes(),
            [0x00, 0x05, 0x05, 0x00, 0x00, 0x00, 0x00, 0x00]
        );
        assert_eq!(
            SetupPacket::get_string_descriptor(2, 0x0409, 255).to_bytes(),
            [0x80, 0x06, 0x02, 0x03, 0x09, 0x04, 0xff, 0x00]
        );
        assert_eq!(
            SetupPacket::set_port_feature(3, 4).to_bytes(),
            [0x23, 0x03, 0x04, 0x00, 0x03, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn test_captured_setup_decodes() {
        let setup = SetupPacket::from_bytes(&[0x80, 0x06, 0x00, 0x02, 0x00, 0x00, 0x40, 0x00]).unwrap();
        assert_eq!(setup, SetupPacket::get_configuration_descriptor(0, 64));
        assert!(setup.has_data_stage());
        assert_eq!(setup.direction(), Direction::In);
    }

    #[test]
    fn test_product_string() {
        let bytes = [
            0x12, 0x03, b'K', 0, b'e', 0, b'y', 0, b'b', 0, b'o', 0, b'a', 0, b'r', 0, b'd', 0,
        ];
        assert_eq!(decode_string(&bytes).unwrap(), "Keyboard");
    }
}
