//! Integration tests for the shared statistics and descriptor builders
//!
//! Tests:
//! - Counters updated from several threads at once
//! - Snapshot serialization for reports
//! - Built descriptors surviving the protocol parser
//!
//! Run with: `cargo test -p common --test stats_tests`

use common::test_utils::{
    create_alternate_setting_configuration, create_hub_configuration,
    create_large_configuration,
};
use common::{Error, StatsSnapshot, TransferStats};
use protocol::{Configuration, TransferKind};
use std::sync::Arc;
use std::thread;

mod transfer_stats {
    use super::*;

    #[test]
    fn test_concurrent_recording() {
        let stats = Arc::new(TransferStats::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let stats = Arc::clone(&stats);
                thread::spawn(move || {
                    for _ in 0..250 {
                        stats.record_submit();
                        stats.record_completion(true, 8);
                        stats.record_nak();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let snap = stats.snapshot();
        assert_eq!(snap.urbs_submitted, 1000);
        assert_eq!(snap.urbs_completed, 1000);
        assert_eq!(snap.urbs_failed, 0);
        assert_eq!(snap.naks, 1000);
        assert_eq!(snap.bytes_transferred, 8000);
    }

    #[test]
    fn test_failed_completion_moves_no_bytes() {
        let stats = TransferStats::new();
        stats.record_completion(false, 64);
        stats.record_stall();
        let snap = stats.snapshot();
        assert_eq!(snap.urbs_failed, 1);
        assert_eq!(snap.stalls, 1);
        assert_eq!(snap.bytes_transferred, 0);
    }

    #[test]
    fn test_snapshot_json_field_names() {
        let stats = TransferStats::new();
        stats.record_enumeration();
        stats.record_sof();
        let json = serde_json::to_value(stats.snapshot()).unwrap();
        assert_eq!(json["enumerations"], 1);
        assert_eq!(json["start_of_frames"], 1);

        let back: StatsSnapshot = serde_json::from_value(json).unwrap();
        assert_eq!(back, stats.snapshot());
    }
}

mod descriptor_builders {
    use super::*;

    #[test]
    fn test_large_configuration_parses_back() {
        let config = create_large_configuration(2, 6);
        let parsed = Configuration::parse(&config.to_bytes()).unwrap();
        assert_eq!(parsed.value(), 2);
        assert_eq!(parsed.interfaces.len(), 6);
        let last = parsed.interface(5).unwrap().alternate(0).unwrap();
        assert_eq!(last.endpoints[0].address, 0x86);
    }

    #[test]
    fn test_alternate_setting_endpoints_only_in_alt_one() {
        let config = create_alternate_setting_configuration(1);
        let interface = config.interface(0).unwrap();
        assert!(interface.alternate(0).unwrap().endpoints.is_empty());
        let kinds: Vec<TransferKind> = interface
            .alternate(1)
            .unwrap()
            .endpoints
            .iter()
            .map(|ep| ep.kind())
            .collect();
        assert_eq!(kinds, vec![TransferKind::Bulk, TransferKind::Bulk]);
    }

    #[test]
    fn test_hub_status_endpoint_is_interrupt_in() {
        let config = create_hub_configuration();
        let ep = config.interfaces[0].alternates[0].endpoints[0];
        assert!(ep.direction().is_in());
        assert_eq!(ep.kind(), TransferKind::Interrupt);
    }
}

mod errors {
    use super::*;

    #[test]
    fn test_io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "sim.toml");
        let err: Error = io.into();
        assert!(err.to_string().contains("sim.toml"));
    }
}
