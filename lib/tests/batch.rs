// Copyright (c) 2023-2024 The calypso-tx Authors

//! Batcher behavior over the wire: capacity-driven splitting, exchange
//! grouping, binary file pinning and counter handling

use calypso_tx::apdu::select::{SelectFile, GetDataTag};
use calypso_tx::{CardOperation, CardTransactionManager, Error, StateError};

mod helpers;
use helpers::*;

#[test]
fn update_binary_splits_into_capacity_chunks() -> anyhow::Result<()> {
    setup_logging();
    let log = new_log();
    let transport = MockTransport::new(log.clone());
    let sent = transport.sent();
    transport.script(vec![sw(0x9000)]);
    transport.script(vec![sw(0x9000)]);
    transport.script(vec![sw(0x9000)]);

    let mut tm = CardTransactionManager::new(transport, rev3_cap(2));
    tm.prepare(CardOperation::UpdateBinary {
        sfi: 0x01,
        offset: 0,
        data: hex::decode("1122334455").unwrap(),
    })?;
    tm.process_commands()?;

    // Three exchanges at offsets 0, 2, 4 carrying <= 2 bytes each
    assert_eq!(group_hex(&sent, 0), ["00d68100021122"]);
    assert_eq!(group_hex(&sent, 1), ["00d60002023344"]);
    assert_eq!(group_hex(&sent, 2), ["00d600040155"]);

    // The image converges on the full written content
    assert_eq!(
        tm.card().file_by_sfi(0x01).unwrap().record(1).unwrap(),
        hex::decode("1122334455").unwrap().as_slice()
    );
    Ok(())
}

#[test]
fn oversized_record_read_splits_minimally() -> anyhow::Result<()> {
    let log = new_log();
    let transport = MockTransport::new(log.clone());
    let sent = transport.sent();
    transport.script(vec![ok("aabbccdd11223344")]);
    transport.script(vec![ok("55667788")]);

    // 3 records of 4 bytes under an 8-byte capacity: 2 + 1
    let mut tm = CardTransactionManager::new(transport, rev3_cap(8));
    tm.prepare(CardOperation::ReadRecords {
        sfi: 0x04,
        from_record: 1,
        count: 3,
        record_size: 4,
    })?;
    tm.process_commands()?;

    assert_eq!(sent.borrow().len(), 2);
    assert_eq!(group_hex(&sent, 0), ["00b2012508"]);
    assert_eq!(group_hex(&sent, 1), ["00b2032404"]);

    // Reassembled content equals one hypothetical unsplit read
    let file = tm.card().file_by_sfi(0x04).unwrap();
    let combined: Vec<u8> = (1..=3).flat_map(|n| file.record(n).unwrap().to_vec()).collect();
    assert_eq!(combined, hex::decode("aabbccdd1122334455667788").unwrap());
    Ok(())
}

#[test]
fn binary_read_reassembles_across_chunks() -> anyhow::Result<()> {
    use rand::RngCore;

    let log = new_log();
    let transport = MockTransport::new(log.clone());
    let sent = transport.sent();
    let mut rng = rand::thread_rng();
    let mut part1 = vec![0u8; 100];
    let mut part2 = vec![0u8; 100];
    let mut part3 = vec![0u8; 50];
    rng.fill_bytes(&mut part1);
    rng.fill_bytes(&mut part2);
    rng.fill_bytes(&mut part3);
    transport.script(vec![ok(&hex::encode(&part1))]);
    transport.script(vec![ok(&hex::encode(&part2))]);
    transport.script(vec![ok(&hex::encode(&part3))]);

    let mut tm = CardTransactionManager::new(transport, rev3_cap(100));
    tm.prepare(CardOperation::ReadBinary {
        sfi: 0x02,
        offset: 0,
        length: 250,
    })?;
    tm.process_commands()?;

    // ceil(250 / 100) exchanges at strictly increasing offsets
    assert_eq!(group_hex(&sent, 0), ["00b0820064"]);
    assert_eq!(group_hex(&sent, 1), ["00b0006464"]);
    assert_eq!(group_hex(&sent, 2), ["00b000c832"]);

    let mut expected = part1;
    expected.extend(part2);
    expected.extend(part3);
    assert_eq!(
        tm.card().file_by_sfi(0x02).unwrap().record(1).unwrap(),
        expected.as_slice()
    );
    Ok(())
}

#[test]
fn small_commands_share_one_exchange_group() -> anyhow::Result<()> {
    let log = new_log();
    let transport = MockTransport::new(log.clone());
    let sent = transport.sent();
    transport.script(vec![ok("a1a1a1a1"), ok("b2b2b2b2"), sw(0x9000)]);

    let mut tm = CardTransactionManager::new(transport, rev3());
    tm.prepare(CardOperation::ReadRecords {
        sfi: 0x04,
        from_record: 1,
        count: 1,
        record_size: 4,
    })?;
    tm.prepare(CardOperation::ReadRecords {
        sfi: 0x05,
        from_record: 1,
        count: 1,
        record_size: 4,
    })?;
    tm.prepare(CardOperation::UpdateRecord {
        sfi: 0x05,
        record: 2,
        data: vec![0xC3; 4],
    })?;
    tm.process_commands()?;

    // One transport call carried all three commands
    assert_eq!(sent.borrow().len(), 1);
    assert_eq!(sent.borrow()[0].len(), 3);
    Ok(())
}

#[test]
fn long_offset_binary_is_pinned_first() -> anyhow::Result<()> {
    let log = new_log();
    let transport = MockTransport::new(log.clone());
    let sent = transport.sent();
    transport.script(vec![ok("00"), ok("a1a2")]);

    let mut tm = CardTransactionManager::new(transport, rev3());
    tm.prepare(CardOperation::ReadBinary {
        sfi: 0x01,
        offset: 0x0123,
        length: 2,
    })?;
    tm.process_commands()?;

    // Zero-offset read on the real SFI pins the file, then SFI 0
    assert_eq!(
        group_hex(&sent, 0),
        ["00b0810001", "00b0012302"]
    );

    let file = tm.card().file_by_sfi(0x01).unwrap();
    assert_eq!(&file.record(1).unwrap()[0x0123..0x0125], &[0xA1, 0xA2]);
    Ok(())
}

#[test]
fn set_counter_becomes_a_delta_adjustment() -> anyhow::Result<()> {
    let log = new_log();
    let transport = MockTransport::new(log.clone());
    let sent = transport.sent();
    // Counters file header, then its content: counter 0 at 100
    transport.script(vec![
        ok("85082000080909010000"),
        ok("000064000000000000"),
    ]);
    transport.script(vec![ok("000028")]);

    let mut tm = CardTransactionManager::new(transport, rev3());
    tm.prepare(CardOperation::SelectFile(SelectFile::ByLid(0x2000)))?;
    tm.prepare(CardOperation::ReadRecords {
        sfi: 0x08,
        from_record: 1,
        count: 1,
        record_size: 9,
    })?;
    tm.process_commands()?;
    assert_eq!(tm.card().counter(0x08, 0), Some(100));

    // Target below the current value decreases by the difference
    tm.prepare(CardOperation::SetCounter {
        sfi: 0x08,
        counter: 0,
        target: 40,
    })?;
    tm.process_commands()?;

    assert_eq!(group_hex(&sent, 1), ["003000400300003c"]);
    assert_eq!(tm.card().counter(0x08, 0), Some(40));
    Ok(())
}

#[test]
fn set_counter_requires_a_prior_read() {
    let log = new_log();
    let transport = MockTransport::new(log.clone());

    let mut tm = CardTransactionManager::new(transport, rev3());
    let err = tm
        .prepare(CardOperation::SetCounter {
            sfi: 0x08,
            counter: 0,
            target: 40,
        })
        .unwrap_err();

    assert!(matches!(
        err,
        Error::State(StateError::CounterNotRead { sfi: 0x08, counter: 0 })
    ));
}

#[test]
fn counter_batch_uses_multiple_command_when_supported() -> anyhow::Result<()> {
    let log = new_log();
    let transport = MockTransport::new(log.clone());
    let sent = transport.sent();
    transport.script(vec![
        ok("85082000080909010000"),
        ok("000000000000000000"),
    ]);
    transport.script(vec![ok("0000006501000067")]);

    let mut tm = CardTransactionManager::new(transport, rev3());
    tm.prepare(CardOperation::SelectFile(SelectFile::ByLid(0x2000)))?;
    tm.prepare(CardOperation::ReadRecords {
        sfi: 0x08,
        from_record: 1,
        count: 1,
        record_size: 9,
    })?;
    tm.process_commands()?;

    tm.prepare(CardOperation::IncreaseCounters {
        sfi: 0x08,
        items: vec![(0, 0x65), (1, 0x67)],
    })?;
    tm.process_commands()?;

    assert_eq!(group_hex(&sent, 1), ["003a0040080000006501000067"]);
    assert_eq!(tm.card().counter(0x08, 0), Some(0x65));
    assert_eq!(tm.card().counter(0x08, 1), Some(0x67));
    Ok(())
}

#[test]
fn counter_batch_expands_on_legacy_products() -> anyhow::Result<()> {
    let log = new_log();
    let transport = MockTransport::new(log.clone());
    let sent = transport.sent();
    transport.script(vec![ok("000010")]);
    transport.script(vec![ok("000020")]);

    let mut tm = CardTransactionManager::new(transport, rev2());
    tm.prepare(CardOperation::IncreaseCounters {
        sfi: 0x08,
        items: vec![(0, 1), (1, 2)],
    })?;
    tm.process_commands()?;

    // One single-counter exchange per entry, legacy class byte
    assert_eq!(sent.borrow().len(), 2);
    assert_eq!(group_hex(&sent, 0), ["9432004003000001"]);
    assert_eq!(group_hex(&sent, 1), ["9432014003000002"]);
    Ok(())
}

#[test]
fn search_stores_matches_and_fetched_record() -> anyhow::Result<()> {
    let log = new_log();
    let transport = MockTransport::new(log.clone());
    let sent = transport.sent();
    transport.script(vec![ok("020307aabb")]);

    let mut tm = CardTransactionManager::new(transport, rev3());
    tm.prepare(CardOperation::SearchRecords {
        sfi: 0x02,
        from_record: 1,
        offset: 0,
        repeated_offset: false,
        fetch_first: true,
        data: vec![0x12, 0x34],
        mask: Some(vec![0xF0]),
    })?;
    tm.process_commands()?;

    // Short mask rides right-padded with FF
    assert_eq!(group_hex(&sent, 0), ["00a201170600021234f0ff00"]);
    assert_eq!(tm.card().search_matches().unwrap(), &[3, 7]);
    assert_eq!(
        tm.card().file_by_sfi(0x02).unwrap().record(3).unwrap(),
        &[0xAA, 0xBB]
    );
    Ok(())
}

#[test]
fn search_rejected_without_the_feature() {
    let log = new_log();
    let transport = MockTransport::new(log.clone());

    let mut tm = CardTransactionManager::new(transport, rev2());
    let err = tm
        .prepare(CardOperation::SearchRecords {
            sfi: 0x02,
            from_record: 1,
            offset: 0,
            repeated_offset: false,
            fetch_first: false,
            data: vec![0x12],
            mask: None,
        })
        .unwrap_err();

    assert!(matches!(
        err,
        Error::State(StateError::UnsupportedFeature(_))
    ));
}

#[test]
fn validity_toggles_guard_their_current_state() -> anyhow::Result<()> {
    let log = new_log();
    let transport = MockTransport::new(log.clone());
    let sent = transport.sent();
    transport.script(vec![sw(0x9000)]);
    transport.script(vec![sw(0x9000)]);

    let mut tm = CardTransactionManager::new(transport, rev3());

    // Rehabilitating a valid card never reaches the wire
    let err = tm.prepare(CardOperation::Rehabilitate).unwrap_err();
    assert!(matches!(err, Error::State(StateError::NotInvalidated)));

    tm.prepare(CardOperation::Invalidate)?;
    tm.process_commands()?;
    assert!(tm.card().is_invalidated());
    assert_eq!(group_hex(&sent, 0), ["00040000"]);

    let err = tm.prepare(CardOperation::Invalidate).unwrap_err();
    assert!(matches!(err, Error::State(StateError::AlreadyInvalidated)));

    tm.prepare(CardOperation::Rehabilitate)?;
    tm.process_commands()?;
    assert!(!tm.card().is_invalidated());
    assert_eq!(group_hex(&sent, 1), ["00440000"]);
    Ok(())
}

#[test]
fn failed_exchange_keeps_unsent_operations_queued() -> anyhow::Result<()> {
    let log = new_log();
    let transport = MockTransport::new(log.clone());
    transport.script(vec![sw(0x6A82)]);

    let mut tm = CardTransactionManager::new(transport, rev3_cap(100));
    tm.prepare(CardOperation::UpdateRecord {
        sfi: 0x04,
        record: 1,
        data: vec![0x11; 80],
    })?;
    tm.prepare(CardOperation::UpdateRecord {
        sfi: 0x04,
        record: 2,
        data: vec![0x22; 80],
    })?;

    let err = tm.process_commands().unwrap_err();
    assert!(matches!(err, Error::UnexpectedStatus { sw, .. } if sw.0 == 0x6A82));

    // The second update never reached the wire and stays prepared
    assert_eq!(tm.prepared_count(), 1);
    tm.discard_prepared();
    assert_eq!(tm.prepared_count(), 0);
    Ok(())
}

#[test]
fn ef_list_resolves_files_under_both_indices() -> anyhow::Result<()> {
    let log = new_log();
    let transport = MockTransport::new(log.clone());
    transport.script(vec![ok("c0102000080917010000201007021d0a0000")]);

    let mut tm = CardTransactionManager::new(transport, rev3());
    tm.prepare(CardOperation::GetData(GetDataTag::EfList))?;
    tm.process_commands()?;

    assert_eq!(tm.card().file_by_sfi(0x08).unwrap().header().lid, 0x2000);
    assert_eq!(tm.card().file_by_lid(0x2010).unwrap().header().sfi, 0x07);
    Ok(())
}

#[test]
fn traceability_blob_is_kept_opaque() -> anyhow::Result<()> {
    let log = new_log();
    let transport = MockTransport::new(log.clone());
    transport.script(vec![ok("0a0b0c0d0e")]);

    let mut tm = CardTransactionManager::new(transport, rev3());
    tm.prepare(CardOperation::GetData(GetDataTag::TraceabilityInformation))?;
    tm.process_commands()?;

    assert_eq!(
        tm.card().traceability().unwrap(),
        hex::decode("0a0b0c0d0e").unwrap().as_slice()
    );
    Ok(())
}
