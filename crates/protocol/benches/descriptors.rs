//! Benchmarks for descriptor parsing
//!
//! Measures the cost of the descriptor walks done during enumeration:
//! - Device descriptor decode
//! - Configuration tree parsing for small and composite devices
//! - String descriptor decode

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use protocol::{
    AlternateSetting, Configuration, ConfigurationDescriptor, DeviceDescriptor,
    EndpointDescriptor, Interface, InterfaceDescriptor, decode_string, encode_string,
};

fn composite_configuration(interfaces: u8) -> Vec<u8> {
    let config = Configuration {
        descriptor: ConfigurationDescriptor {
            total_length: 0,
            num_interfaces: interfaces,
            value: 1,
            string_index: 0,
            attributes: 0x80,
            max_power: 250,
        },
        interfaces: (0..interfaces)
            .map(|number| Interface {
                number,
                alternates: vec![AlternateSetting {
                    descriptor: InterfaceDescriptor {
                        number,
                        alternate_setting: 0,
                        num_endpoints: 2,
                        class: 0xff,
                        subclass: 0,
                        protocol: 0,
                        string_index: 0,
                    },
                    endpoints: vec![
                        EndpointDescriptor {
                            address: 0x81 + number,
                            attributes: 2,
                            max_packet_size: 64,
                            interval: 0,
                        },
                        EndpointDescriptor {
                            address: 0x01 + number,
                            attributes: 2,
                            max_packet_size: 64,
                            interval: 0,
                        },
                    ],
                    extra: Vec::new(),
                }],
            })
            .collect(),
        extra: Vec::new(),
    };
    config.to_bytes()
}

fn benchmark_device_descriptor(c: &mut Criterion) {
    let bytes = DeviceDescriptor {
        usb_version: 0x0200,
        class: 0,
        subclass: 0,
        protocol: 0,
        max_packet_size0: 64,
        vendor_id: 0x1234,
        product_id: 0x5678,
        device_version: 0x0100,
        manufacturer_index: 1,
        product_index: 2,
        serial_index: 3,
        num_configurations: 1,
    }
    .to_bytes();

    c.bench_function("parse_device_descriptor", |b| {
        b.iter(|| DeviceDescriptor::parse(black_box(&bytes)))
    });
}

fn benchmark_configuration_tree(c: &mut Criterion) {
    let mut group = c.benchmark_group("configuration_tree");

    for interfaces in [1u8, 4, 16] {
        let blob = composite_configuration(interfaces);
        group.throughput(Throughput::Bytes(blob.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(interfaces), &blob, |b, blob| {
            b.iter(|| Configuration::parse(black_box(blob)))
        });
    }

    group.finish();
}

fn benchmark_strings(c: &mut Criterion) {
    let bytes = encode_string("Composite Test Device");
    c.bench_function("decode_string", |b| {
        b.iter(|| decode_string(black_box(&bytes)))
    });
}

criterion_group!(
    benches,
    benchmark_device_descriptor,
    benchmark_configuration_tree,
    benchmark_strings
);
criterion_main!(benches);
