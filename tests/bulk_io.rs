//! Bulk message engine: framing, chunking, reply validation and the
//! auto-abort path, exercised over the scripted transport.

mod common;

use common::*;
use usbtmc_host::Error;

#[test]
fn short_read_with_eom() {
    let rig = rig(RigOpts::default());
    let handle = rig.device.open().unwrap();

    assert_eq!(handle.write(b"*IDN?\n").unwrap(), 6);

    // single reply packet, whole message, EOM set
    rig.bulk_in
        .send(Ok(msg_in_packet(2, 12, true, b"ACME,SCOPE,1")))
        .unwrap();

    let mut buf = [0u8; 64];
    let n = handle.read(&mut buf).unwrap();
    assert_eq!(n, 12);
    assert_eq!(&buf[..n], b"ACME,SCOPE,1");

    let frames = rig.mock.bulk_out_frames.lock().unwrap();
    assert_eq!(frames.len(), 2);

    let write_frame = parse_out_frame(&frames[0]);
    assert_eq!(write_frame.msg_id, 1);
    assert_eq!(write_frame.tag, 1);
    assert_eq!(write_frame.transfer_size, 6);
    assert_eq!(write_frame.attributes, 0x01);
    assert_eq!(&write_frame.payload[..6], b"*IDN?\n");
    assert_eq!(frames[0].len(), 20); // header + 6 bytes + 2 bytes of padding

    let request = parse_out_frame(&frames[1]);
    assert_eq!(request.msg_id, 2);
    assert_eq!(request.tag, 2);
    assert_eq!(request.transfer_size, 64);
    assert_eq!(request.attributes, 0); // termination character disabled
}

#[test]
fn multi_packet_read_without_eom_on_first() {
    let rig = rig(RigOpts {
        io_buffer_size: 2060,
        ..RigOpts::default()
    });
    let handle = rig.device.open().unwrap();

    // header announces 4096 characters, EOM clear; continuation is raw
    rig.bulk_in
        .send(Ok(msg_in_packet(1, 4096, false, &[0xAA; 2048])))
        .unwrap();
    rig.bulk_in.send(Ok(vec![0xBB; 2048])).unwrap();

    let mut buf = [0u8; 4096];
    let n = handle.read(&mut buf).unwrap();
    assert_eq!(n, 4096);
    assert!(buf[..2048].iter().all(|&b| b == 0xAA));
    assert!(buf[2048..].iter().all(|&b| b == 0xBB));

    let frames = rig.mock.bulk_out_frames.lock().unwrap();
    let request = parse_out_frame(&frames[0]);
    assert_eq!(request.tag, 1);
    assert_eq!(request.transfer_size, 4096);
}

#[test]
fn header_mismatch_runs_abort_bulk_in() {
    let rig = rig(RigOpts::default());
    let mut handle = rig.device.open().unwrap();
    handle.set_auto_abort(true);

    // reply tagged with something other than the request tag
    rig.bulk_in
        .send(Ok(msg_in_packet(9, 4, true, b"nope")))
        .unwrap();
    // short packet ending the drain the abort machine performs
    rig.bulk_in.send(Ok(Vec::new())).unwrap();

    let mut buf = [0u8; 16];
    let err = handle.read(&mut buf).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<Error>(),
        Some(Error::TagMismatch)
    ));

    let requests = rig.mock.control_requests();
    let abort_at = requests
        .iter()
        .position(|&r| r == INITIATE_ABORT_BULK_IN)
        .expect("abort was initiated");
    assert!(requests[abort_at..].contains(&CHECK_ABORT_BULK_IN_STATUS));

    // the initiate names the tag of the failed read request
    let log = rig.mock.control_log.lock().unwrap();
    let initiate = log
        .iter()
        .find(|c| c.request == INITIATE_ABORT_BULK_IN)
        .unwrap();
    assert_eq!(initiate.value, 1);

    // abort-in leaves the halt alone
    assert!(rig.mock.halts_cleared.lock().unwrap().is_empty());
}

#[test]
fn write_read_round_trip() {
    let rig = rig(RigOpts::default());
    let handle = rig.device.open().unwrap();

    let data: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
    assert_eq!(handle.write(&data).unwrap(), data.len());

    {
        let frames = rig.mock.bulk_out_frames.lock().unwrap();
        // 2048-byte scratch buffer leaves 2036 bytes of payload per chunk
        assert_eq!(frames.len(), 3);

        let mut sent = Vec::new();
        for (i, frame) in frames.iter().enumerate() {
            let parsed = parse_out_frame(frame);
            assert_eq!(parsed.msg_id, 1);
            assert_eq!(parsed.tag, (i + 1) as u8);
            let eom = parsed.attributes & 0x01 != 0;
            assert_eq!(eom, i == 2, "EOM must sit on the final chunk only");
            sent.extend_from_slice(&parsed.payload[..parsed.transfer_size as usize]);
        }
        assert_eq!(sent, data);
    }

    // device echoes the message back across three packets
    rig.bulk_in
        .send(Ok(msg_in_packet(4, 5000, true, &data[..2036])))
        .unwrap();
    rig.bulk_in.send(Ok(data[2036..4084].to_vec())).unwrap();
    rig.bulk_in.send(Ok(data[4084..].to_vec())).unwrap();

    let mut buf = vec![0u8; 5000];
    let n = handle.read(&mut buf).unwrap();
    assert_eq!(n, 5000);
    assert_eq!(buf, data);

    // wire invariants over everything that went out
    let frames = rig.mock.bulk_out_frames.lock().unwrap();
    for frame in frames.iter() {
        assert_eq!(frame.len() % 4, 0);
        assert_eq!(frame[2], (!frame[1]) & 0xFF);
        assert_eq!(frame[3], 0);
        assert_eq!(frame[10], 0);
        assert_eq!(frame[11], 0);
    }
}

#[test]
fn empty_transfers_are_no_ops() {
    let rig = rig(RigOpts::default());
    let handle = rig.device.open().unwrap();

    assert_eq!(handle.write(&[]).unwrap(), 0);
    assert_eq!(handle.read(&mut []).unwrap(), 0);
    assert!(rig.mock.bulk_out_frames.lock().unwrap().is_empty());
}

#[test]
fn reply_announcing_too_much_data_is_rejected() {
    let rig = rig(RigOpts::default());
    let handle = rig.device.open().unwrap();

    // device claims 100 characters against a 16-byte request
    rig.bulk_in
        .send(Ok(msg_in_packet(1, 100, false, &[0u8; 16])))
        .unwrap();

    let mut buf = [0u8; 16];
    let err = handle.read(&mut buf).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<Error>(),
        Some(Error::TransferTooLarge)
    ));
}
