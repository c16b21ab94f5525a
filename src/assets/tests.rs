use proptest::prelude::*;

use super::*;
use crate::bus::{Event, EventQueue};
use crate::errors::{CmdOk, Error};
use crate::types::{AssetId, MacAddress, ScannedDevice};

// ===== Helpers =====

fn upload_whole(
    store: &mut AssetFilterStore,
    bus: &mut EventQueue,
    filter_id: u8,
    payload: &[u8],
) -> Result<CmdOk, Error> {
    store.handle_upload_command(
        &UploadFilterCommand {
            protocol: FILTER_PROTOCOL_VERSION,
            filter_id,
            chunk_offset: 0,
            total_size: payload.len() as u16,
            data: payload,
        },
        bus,
    )
}

fn commit(
    store: &mut AssetFilterStore,
    bus: &mut EventQueue,
    master_version: u16,
    master_crc: u32,
) -> Result<CmdOk, Error> {
    store.handle_commit_command(
        &CommitFilterChangesCommand {
            protocol: FILTER_PROTOCOL_VERSION,
            master_version,
            master_crc,
        },
        bus,
    )
}

/// Master CRC as clients compute it: CRC-32 over (filterId, filterCrc)
/// pairs in ascending id order, each filter CRC being the CRC-32 of the
/// uploaded payload.
fn expected_master_crc(filters: &[(u8, &[u8])]) -> u32 {
    let mut sorted: Vec<_> = filters.to_vec();
    sorted.sort_by_key(|(id, _)| *id);
    let mut hasher = crc32fast::Hasher::new();
    for (filter_id, payload) in sorted {
        hasher.update(&[filter_id]);
        hasher.update(&crc32fast::hash(payload).to_le_bytes());
    }
    hasher.finalize()
}

fn mac_filter_payload(exclude: bool, output: OutputFormat, macs: &[[u8; 6]]) -> Vec<u8> {
    let items: Vec<&[u8]> = macs.iter().map(|mac| &mac[..]).collect();
    let body = encode_exact_match_body(&items).unwrap();
    filter::encode_filter_payload(
        FilterType::ExactMatch,
        exclude,
        InputSelector::MacAddress,
        output,
        InputSelector::MacAddress,
        &body,
    )
}

fn committed_store(filters: &[(u8, &[u8])]) -> (AssetFilterStore, EventQueue) {
    let mut store = AssetFilterStore::new();
    let mut bus = EventQueue::new();
    for (filter_id, payload) in filters {
        upload_whole(&mut store, &mut bus, *filter_id, payload).unwrap();
    }
    commit(&mut store, &mut bus, 1, expected_master_crc(filters)).unwrap();
    bus.drain().count();
    (store, bus)
}

fn device_with_mac(mac: [u8; 6]) -> ScannedDevice {
    ScannedDevice::new(MacAddress::from_bytes(mac), -42, Vec::new())
}

/// Forwarder test double counting calls.
#[derive(Default)]
struct RecordingForwarder {
    mac_calls: usize,
    asset_id_calls: usize,
    nearest_calls: usize,
    bump_ms: u16,
}

impl AssetForwarder for RecordingForwarder {
    fn forward_mac(&mut self, _bus: &mut EventQueue, _device: &ScannedDevice) -> u16 {
        self.mac_calls += 1;
        self.bump_ms
    }

    fn forward_asset_id(
        &mut self,
        _bus: &mut EventQueue,
        _device: &ScannedDevice,
        _asset_id: AssetId,
        _filter_bitmask: u8,
    ) -> u16 {
        self.asset_id_calls += 1;
        self.bump_ms
    }

    fn forward_nearest_asset_id(
        &mut self,
        _bus: &mut EventQueue,
        _device: &ScannedDevice,
        _asset_id: AssetId,
        _filter_bitmask: u8,
    ) -> u16 {
        self.nearest_calls += 1;
        self.bump_ms
    }
}

const MAC: [u8; 6] = [0xFF, 0xEE, 0xDD, 0xCC, 0xBB, 0xAA];

// ===== Store: upload / remove =====

#[test]
fn test_upload_allocates_and_opens_transaction() {
    let mut store = AssetFilterStore::new();
    let mut bus = EventQueue::new();
    let payload = mac_filter_payload(false, OutputFormat::Mac, &[MAC]);

    assert_eq!(
        upload_whole(&mut store, &mut bus, 3, &payload),
        Ok(CmdOk::Success)
    );
    assert_eq!(store.filter_count(), 1);
    assert_eq!(store.find_filter_index(3), Some(0));
    assert_eq!(store.master_version(), 0);
    assert!(store.is_in_progress());
    assert!(matches!(
        bus.pop(),
        Some(Event::FilterModificationInProgress(true))
    ));
}

#[test]
fn test_upload_chunked() {
    let mut store = AssetFilterStore::new();
    let mut bus = EventQueue::new();
    let payload = mac_filter_payload(false, OutputFormat::Mac, &[MAC]);
    let (first, second) = payload.split_at(4);

    store
        .handle_upload_command(
            &UploadFilterCommand {
                protocol: FILTER_PROTOCOL_VERSION,
                filter_id: 1,
                chunk_offset: 0,
                total_size: payload.len() as u16,
                data: first,
            },
            &mut bus,
        )
        .unwrap();
    store
        .handle_upload_command(
            &UploadFilterCommand {
                protocol: FILTER_PROTOCOL_VERSION,
                filter_id: 1,
                chunk_offset: first.len() as u16,
                total_size: payload.len() as u16,
                data: second,
            },
            &mut bus,
        )
        .unwrap();

    assert_eq!(store.filter(0).unwrap().data(), &payload[..]);
}

#[test]
fn test_upload_rejects_bad_protocol_and_bounds() {
    let mut store = AssetFilterStore::new();
    let mut bus = EventQueue::new();
    let payload = mac_filter_payload(false, OutputFormat::Mac, &[MAC]);

    let bad_protocol = UploadFilterCommand {
        protocol: 99,
        filter_id: 1,
        chunk_offset: 0,
        total_size: payload.len() as u16,
        data: &payload,
    };
    assert_eq!(
        store.handle_upload_command(&bad_protocol, &mut bus),
        Err(Error::ProtocolUnsupported(99))
    );

    let out_of_bounds = UploadFilterCommand {
        protocol: FILTER_PROTOCOL_VERSION,
        filter_id: 1,
        chunk_offset: 10,
        total_size: 8,
        data: &payload,
    };
    assert_eq!(
        store.handle_upload_command(&out_of_bounds, &mut bus),
        Err(Error::InvalidMessage)
    );
    assert_eq!(store.filter_count(), 0);
}

#[test]
fn test_upload_size_disagreement_is_wrong_state() {
    let mut store = AssetFilterStore::new();
    let mut bus = EventQueue::new();
    let payload = mac_filter_payload(false, OutputFormat::Mac, &[MAC]);
    upload_whole(&mut store, &mut bus, 1, &payload).unwrap();

    let disagreeing = UploadFilterCommand {
        protocol: FILTER_PROTOCOL_VERSION,
        filter_id: 1,
        chunk_offset: 0,
        total_size: payload.len() as u16 + 4,
        data: &payload[..2],
    };
    assert_eq!(
        store.handle_upload_command(&disagreeing, &mut bus),
        Err(Error::WrongState)
    );
}

#[test]
fn test_upload_count_and_budget_limits() {
    let mut store = AssetFilterStore::new();
    let mut bus = EventQueue::new();
    let payload = mac_filter_payload(false, OutputFormat::Mac, &[MAC]);

    for filter_id in 0..MAX_FILTER_IDS as u8 {
        upload_whole(&mut store, &mut bus, filter_id, &payload).unwrap();
    }
    assert_eq!(
        upload_whole(&mut store, &mut bus, 200, &payload),
        Err(Error::NoSpace)
    );

    // A single filter larger than the byte budget is also refused.
    let mut store = AssetFilterStore::new();
    let huge = vec![0u8; FILTER_BUFFER_SIZE];
    assert_eq!(
        upload_whole(&mut store, &mut bus, 1, &huge),
        Err(Error::NoSpace)
    );
}

#[test]
fn test_remove_and_no_change() {
    let mut store = AssetFilterStore::new();
    let mut bus = EventQueue::new();
    let payload = mac_filter_payload(false, OutputFormat::Mac, &[MAC]);
    upload_whole(&mut store, &mut bus, 7, &payload).unwrap();

    let remove = RemoveFilterCommand {
        protocol: FILTER_PROTOCOL_VERSION,
        filter_id: 7,
    };
    assert_eq!(
        store.handle_remove_command(&remove, &mut bus),
        Ok(CmdOk::Success)
    );
    assert_eq!(store.filter_count(), 0);
    assert_eq!(
        store.handle_remove_command(&remove, &mut bus),
        Ok(CmdOk::NoChange)
    );
}

#[test]
fn test_command_wire_parsing() {
    let mut upload_bytes = vec![0u8, 3];
    upload_bytes.extend_from_slice(&8u16.to_le_bytes());
    upload_bytes.extend_from_slice(&16u16.to_le_bytes());
    upload_bytes.extend_from_slice(&[0xAA, 0xBB]);
    let upload = UploadFilterCommand::parse(&upload_bytes).unwrap();
    assert_eq!(upload.protocol, 0);
    assert_eq!(upload.filter_id, 3);
    assert_eq!(upload.chunk_offset, 8);
    assert_eq!(upload.total_size, 16);
    assert_eq!(upload.data, &[0xAA, 0xBB]);
    assert!(UploadFilterCommand::parse(&[0; 5]).is_err());

    let remove = RemoveFilterCommand::parse(&[0, 9]).unwrap();
    assert_eq!(remove.filter_id, 9);
    assert!(RemoveFilterCommand::parse(&[0]).is_err());

    let mut commit_bytes = vec![0u8];
    commit_bytes.extend_from_slice(&7u16.to_le_bytes());
    commit_bytes.extend_from_slice(&0xDEAD_BEEFu32.to_le_bytes());
    let commit = CommitFilterChangesCommand::parse(&commit_bytes).unwrap();
    assert_eq!(commit.master_version, 7);
    assert_eq!(commit.master_crc, 0xDEAD_BEEF);
    assert!(CommitFilterChangesCommand::parse(&commit_bytes[..6]).is_err());
}

// ===== Store: commit =====

#[test]
fn test_commit_mismatch_is_rejected_and_retryable() {
    let mut store = AssetFilterStore::new();
    let mut bus = EventQueue::new();
    let payload = mac_filter_payload(false, OutputFormat::Mac, &[MAC]);
    upload_whole(&mut store, &mut bus, 3, &payload).unwrap();
    let snapshot = store.filter(0).unwrap().data().to_vec();

    // Commit with a bogus CRC: rejected, nothing becomes valid.
    assert_eq!(commit(&mut store, &mut bus, 7, 0xDEAD), Err(Error::Mismatch));
    assert_eq!(store.master_version(), 0);
    assert!(store.find_filter_index(3).is_some());
    assert!(store.is_in_progress());
    assert_eq!(store.filter(0).unwrap().data(), &snapshot[..]);

    // Retry with the correct CRC: accepted.
    let master_crc = expected_master_crc(&[(3, &payload)]);
    assert_eq!(commit(&mut store, &mut bus, 7, master_crc), Ok(CmdOk::Success));
    assert_eq!(store.master_version(), 7);
    assert_eq!(store.master_crc(), master_crc);
    assert!(!store.is_in_progress());
    assert!(store.is_ready());

    let committed_event = bus
        .drain()
        .any(|event| matches!(event, Event::FiltersCommitted { master_version: 7, .. }));
    assert!(committed_event);
}

#[test]
fn test_commit_rejects_structurally_broken_filter() {
    let mut store = AssetFilterStore::new();
    let mut bus = EventQueue::new();
    let good = mac_filter_payload(false, OutputFormat::Mac, &[MAC]);
    let mut broken = good.clone();
    broken.push(0); // allocated size no longer matches the declared size

    upload_whole(&mut store, &mut bus, 1, &good).unwrap();
    upload_whole(&mut store, &mut bus, 2, &broken).unwrap();

    assert_eq!(
        commit(&mut store, &mut bus, 1, 0xFFFF_FFFF),
        Err(Error::WrongState)
    );
    // The broken filter was deallocated, the good one kept.
    assert_eq!(store.filter_count(), 1);
    assert_eq!(store.filter(0).unwrap().filter_id(), 1);
}

#[test]
fn test_failed_replacement_of_committed_filter_invalidates_set() {
    let payload = mac_filter_payload(false, OutputFormat::Mac, &[MAC]);
    let (mut store, mut bus) = committed_store(&[(1, &payload)]);
    assert!(store.is_ready());

    // Replacement too large for the buffer: the allocation fails after the
    // committed filter is removed, so the set must not stay valid.
    let result = store.handle_upload_command(
        &UploadFilterCommand {
            protocol: FILTER_PROTOCOL_VERSION,
            filter_id: 1,
            chunk_offset: 0,
            total_size: FILTER_BUFFER_SIZE as u16,
            data: &[],
        },
        &mut bus,
    );
    assert_eq!(result, Err(Error::NoSpace));
    assert_eq!(store.find_filter_index(1), None);
    assert_eq!(store.master_version(), 0);
    assert!(store.is_in_progress());
    assert!(!store.is_ready());
}

#[test]
fn test_mismatched_commit_leaves_filters_overwritable() {
    let mut store = AssetFilterStore::new();
    let mut bus = EventQueue::new();
    let payload = mac_filter_payload(false, OutputFormat::Mac, &[MAC]);
    upload_whole(&mut store, &mut bus, 3, &payload).unwrap();
    assert_eq!(commit(&mut store, &mut bus, 7, 0xDEAD), Err(Error::Mismatch));
    assert!(!store.filter(0).unwrap().is_committed());

    // The failed commit must not flag the filter committed: a corrective
    // chunk overwrites in place instead of restarting from a zeroed
    // buffer.
    let patch = UploadFilterCommand {
        protocol: FILTER_PROTOCOL_VERSION,
        filter_id: 3,
        chunk_offset: 2,
        total_size: payload.len() as u16,
        data: &payload[2..4],
    };
    store.handle_upload_command(&patch, &mut bus).unwrap();
    assert_eq!(store.filter(0).unwrap().data(), &payload[..]);

    let master_crc = expected_master_crc(&[(3, &payload)]);
    assert_eq!(commit(&mut store, &mut bus, 7, master_crc), Ok(CmdOk::Success));
    assert_eq!(store.master_version(), 7);
    assert!(store.filter(0).unwrap().is_committed());
}

#[test]
fn test_modification_timeout() {
    let mut store = AssetFilterStore::new();
    let mut bus = EventQueue::new();
    let payload = mac_filter_payload(false, OutputFormat::Mac, &[MAC]);
    upload_whole(&mut store, &mut bus, 1, &payload).unwrap();
    bus.drain().count();

    assert!(store.is_in_progress());
    let countdown_ticks =
        store::MODIFICATION_IN_PROGRESS_TIMEOUT_SECONDS as usize * crate::TICKS_PER_SECOND;
    for _ in 0..countdown_ticks - 1 {
        store.tick(&mut bus);
    }
    assert!(store.is_in_progress());
    store.tick(&mut bus);
    assert!(!store.is_in_progress());
    assert!(matches!(
        bus.pop(),
        Some(Event::FilterModificationInProgress(false))
    ));
    // The timeout ends the transaction but never validates the set.
    assert_eq!(store.master_version(), 0);
    assert!(!store.is_ready());
}

#[test]
fn test_filter_summaries_layout() {
    let payload_a = mac_filter_payload(false, OutputFormat::Mac, &[MAC]);
    let payload_b = mac_filter_payload(false, OutputFormat::AssetId, &[MAC]);
    let (mut store, _) = committed_store(&[(2, &payload_a), (5, &payload_b)]);

    let summaries = store.filter_summaries();
    assert_eq!(summaries.summaries.len(), 2);
    assert_eq!(summaries.summaries[0].filter_id, 2);
    assert_eq!(summaries.summaries[0].filter_crc, crc32fast::hash(&payload_a));
    assert_eq!(summaries.summaries[1].filter_id, 5);
    assert_eq!(summaries.master_version, 1);

    let bytes = summaries.to_bytes();
    assert_eq!(bytes.len(), 2 * 5 + 6);
    assert_eq!(bytes[0], 2);
    assert_eq!(bytes[5], 5);
}

// ===== Store: ordering property =====

proptest! {
    /// After any sequence of uploads and removals the filters array is
    /// strictly ascending by filter id.
    #[test]
    fn prop_store_sorted_by_filter_id(ops in proptest::collection::vec((0u8..20, any::<bool>()), 0..40)) {
        let mut store = AssetFilterStore::new();
        let mut bus = EventQueue::new();
        let payload = mac_filter_payload(false, OutputFormat::Mac, &[MAC]);
        for (filter_id, is_upload) in ops {
            if is_upload {
                let _ = upload_whole(&mut store, &mut bus, filter_id, &payload);
            } else {
                let _ = store.handle_remove_command(
                    &RemoveFilterCommand { protocol: FILTER_PROTOCOL_VERSION, filter_id },
                    &mut bus,
                );
            }
            let ids: Vec<u8> = (0..store.filter_count())
                .map(|index| store.filter(index).unwrap().filter_id())
                .collect();
            let mut sorted = ids.clone();
            sorted.sort_unstable();
            sorted.dedup();
            prop_assert_eq!(ids, sorted);
        }
    }
}

// ===== Engine =====

#[test]
fn test_engine_requires_ready_store() {
    let engine = AssetFilterEngine::new().unwrap();
    let mut store = AssetFilterStore::new();
    let mut bus = EventQueue::new();
    let mut records = AssetRecords::default();
    let mut forwarder = RecordingForwarder::default();
    let payload = mac_filter_payload(false, OutputFormat::Mac, &[MAC]);
    upload_whole(&mut store, &mut bus, 1, &payload).unwrap();
    bus.drain().count();

    // Uncommitted filters are never applied.
    engine.handle_scanned_device(
        &store,
        &mut records,
        &mut forwarder,
        &mut bus,
        &device_with_mac(MAC),
    );
    assert_eq!(forwarder.mac_calls, 0);
    assert!(bus.is_empty());
}

#[test]
fn test_engine_accepts_and_emits_event() {
    let engine = AssetFilterEngine::new().unwrap();
    let payload = mac_filter_payload(false, OutputFormat::Mac, &[MAC]);
    let (store, mut bus) = committed_store(&[(1, &payload)]);
    let mut records = AssetRecords::default();
    let mut forwarder = RecordingForwarder::default();

    engine.handle_scanned_device(
        &store,
        &mut records,
        &mut forwarder,
        &mut bus,
        &device_with_mac(MAC),
    );
    assert_eq!(forwarder.mac_calls, 1);
    let accepted = bus.drain().find_map(|event| match event {
        Event::AssetAccepted {
            filter_id,
            accepted_bitmask,
            ..
        } => Some((filter_id, accepted_bitmask)),
        _ => None,
    });
    assert_eq!(accepted, Some((1, 0b1)));
}

#[test]
fn test_engine_ignores_non_matching_device() {
    let engine = AssetFilterEngine::new().unwrap();
    let payload = mac_filter_payload(false, OutputFormat::Mac, &[MAC]);
    let (store, mut bus) = committed_store(&[(1, &payload)]);
    let mut records = AssetRecords::default();
    let mut forwarder = RecordingForwarder::default();

    engine.handle_scanned_device(
        &store,
        &mut records,
        &mut forwarder,
        &mut bus,
        &device_with_mac([0; 6]),
    );
    assert_eq!(forwarder.mac_calls, 0);
    assert!(bus.is_empty());
}

#[test]
fn test_exclude_filter_rejects_for_everyone() {
    let engine = AssetFilterEngine::new().unwrap();
    let exclude = mac_filter_payload(true, OutputFormat::Mac, &[MAC]);
    let accept = mac_filter_payload(false, OutputFormat::Mac, &[MAC]);
    let (store, mut bus) = committed_store(&[(1, &exclude), (2, &accept)]);
    let mut records = AssetRecords::default();
    let mut forwarder = RecordingForwarder::default();

    engine.handle_scanned_device(
        &store,
        &mut records,
        &mut forwarder,
        &mut bus,
        &device_with_mac(MAC),
    );

    assert_eq!(forwarder.mac_calls, 0);
    let accepted_events = bus
        .drain()
        .filter(|event| matches!(event, Event::AssetAccepted { .. }))
        .count();
    assert_eq!(accepted_events, 0);
}

#[test]
fn test_combined_bitmask_spans_output_formats() {
    let engine = AssetFilterEngine::new().unwrap();
    let mac_out = mac_filter_payload(false, OutputFormat::Mac, &[MAC]);
    let id_out = mac_filter_payload(false, OutputFormat::AssetId, &[MAC]);
    let (store, mut bus) = committed_store(&[(1, &mac_out), (2, &id_out)]);
    let mut records = AssetRecords::default();
    let mut forwarder = RecordingForwarder::default();

    engine.handle_scanned_device(
        &store,
        &mut records,
        &mut forwarder,
        &mut bus,
        &device_with_mac(MAC),
    );

    assert_eq!(forwarder.mac_calls, 1);
    assert_eq!(forwarder.asset_id_calls, 1);
    let masks: Vec<u32> = bus
        .drain()
        .filter_map(|event| match event {
            Event::AssetAccepted {
                accepted_bitmask, ..
            } => Some(accepted_bitmask),
            _ => None,
        })
        .collect();
    assert_eq!(masks, vec![0b11, 0b11]);
}

#[test]
fn test_masked_ad_type_extraction_accepts() {
    let engine = AssetFilterEngine::new().unwrap();

    // Mask 0b10101 selects bytes 0, 2, 4 of the field (LSB-first).
    let body = encode_exact_match_body(&[&[0x01u8, 0x03, 0x05][..]]).unwrap();
    let payload = filter::encode_filter_payload(
        FilterType::ExactMatch,
        false,
        InputSelector::MaskedAdDataType {
            ad_type: 0xFF,
            mask: 0b10101,
        },
        OutputFormat::AssetId,
        InputSelector::MacAddress,
        &body,
    );
    let (store, mut bus) = committed_store(&[(1, &payload)]);
    let mut records = AssetRecords::default();
    let mut forwarder = RecordingForwarder::default();

    let mut adv = vec![7u8, 0xFF];
    adv.extend_from_slice(&[0x01, 0x02, 0x03, 0x04, 0x05, 0x06]);
    let device = ScannedDevice::new(MacAddress::from_bytes(MAC), -42, adv);

    engine.handle_scanned_device(&store, &mut records, &mut forwarder, &mut bus, &device);
    assert_eq!(forwarder.asset_id_calls, 1);

    // A device whose field bytes differ at a masked position is not
    // accepted.
    let mut other_adv = vec![7u8, 0xFF];
    other_adv.extend_from_slice(&[0x01, 0x02, 0x09, 0x04, 0x05, 0x06]);
    let other = ScannedDevice::new(MacAddress::from_bytes(MAC), -42, other_adv);
    engine.handle_scanned_device(&store, &mut records, &mut forwarder, &mut bus, &other);
    assert_eq!(forwarder.asset_id_calls, 1);
}

#[test]
fn test_ad_type_filter_ignores_device_without_field() {
    let engine = AssetFilterEngine::new().unwrap();
    let body = encode_exact_match_body(&[&[0x11u8, 0x22][..]]).unwrap();
    let payload = filter::encode_filter_payload(
        FilterType::ExactMatch,
        false,
        InputSelector::AdDataType { ad_type: 0x16 },
        OutputFormat::AssetId,
        InputSelector::MacAddress,
        &body,
    );
    let (store, mut bus) = committed_store(&[(1, &payload)]);
    let mut records = AssetRecords::default();
    let mut forwarder = RecordingForwarder::default();

    engine.handle_scanned_device(
        &store,
        &mut records,
        &mut forwarder,
        &mut bus,
        &device_with_mac(MAC),
    );
    assert_eq!(forwarder.asset_id_calls, 0);
}

#[test]
fn test_cuckoo_bodied_filter_end_to_end() {
    let engine = AssetFilterEngine::new().unwrap();

    let mut cuckoo = crate::cuckoo::CuckooFilter::new(16, 4).unwrap();
    assert!(cuckoo.add(&MAC));
    let payload = filter::encode_filter_payload(
        FilterType::Cuckoo,
        false,
        InputSelector::MacAddress,
        OutputFormat::AssetId,
        InputSelector::MacAddress,
        &cuckoo.to_bytes(),
    );
    let (store, mut bus) = committed_store(&[(1, &payload)]);
    let mut records = AssetRecords::default();
    let mut forwarder = RecordingForwarder::default();

    engine.handle_scanned_device(
        &store,
        &mut records,
        &mut forwarder,
        &mut bus,
        &device_with_mac(MAC),
    );
    assert_eq!(forwarder.asset_id_calls, 1);

    engine.handle_scanned_device(
        &store,
        &mut records,
        &mut forwarder,
        &mut bus,
        &device_with_mac([9; 6]),
    );
    assert_eq!(forwarder.asset_id_calls, 1);
}

// ===== Throttling =====

#[test]
fn test_throttling_suppresses_repeat_forwarding() {
    let engine = AssetFilterEngine::new().unwrap();
    let payload = mac_filter_payload(false, OutputFormat::AssetId, &[MAC]);
    let (store, mut bus) = committed_store(&[(1, &payload)]);
    let mut records = AssetRecords::default();
    let mut forwarder = RecordingForwarder {
        bump_ms: 300,
        ..Default::default()
    };
    let device = device_with_mac(MAC);

    engine.handle_scanned_device(&store, &mut records, &mut forwarder, &mut bus, &device);
    assert_eq!(forwarder.asset_id_calls, 1);

    // While the bump runs down, repeat acceptances are suppressed.
    engine.handle_scanned_device(&store, &mut records, &mut forwarder, &mut bus, &device);
    engine.handle_scanned_device(&store, &mut records, &mut forwarder, &mut bus, &device);
    assert_eq!(forwarder.asset_id_calls, 1);

    // 300 ms at 100 ms per tick: free again after three ticks.
    records.tick();
    records.tick();
    records.tick();
    engine.handle_scanned_device(&store, &mut records, &mut forwarder, &mut bus, &device);
    assert_eq!(forwarder.asset_id_calls, 2);
}

#[test]
fn test_throttled_accept_still_sets_bitmask() {
    let engine = AssetFilterEngine::new().unwrap();
    let payload = mac_filter_payload(false, OutputFormat::AssetId, &[MAC]);
    let (store, mut bus) = committed_store(&[(1, &payload)]);
    let mut records = AssetRecords::default();
    let mut forwarder = RecordingForwarder {
        bump_ms: 1000,
        ..Default::default()
    };
    let device = device_with_mac(MAC);

    engine.handle_scanned_device(&store, &mut records, &mut forwarder, &mut bus, &device);
    bus.drain().count();

    // Throttled: no forwarding, but the acceptance is still reported.
    engine.handle_scanned_device(&store, &mut records, &mut forwarder, &mut bus, &device);
    assert_eq!(forwarder.asset_id_calls, 1);
    let accepted = bus
        .drain()
        .filter(|event| matches!(event, Event::AssetAccepted { .. }))
        .count();
    assert_eq!(accepted, 1);
}
