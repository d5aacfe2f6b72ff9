//! Command-level behavior of the runtime service over a hosted platform.

use sideload_protocol::{
    decode_alloc_response, decode_exec_response, decode_heap_info, decode_status,
    decode_write_mem_response, encode_alloc_request, encode_exec_request, encode_free_request,
    encode_packet, encode_read_mem_request, encode_write_mem_request, AllocRequest, CommandId,
    MemCaps, Packet, ParseEvent, Status, StreamParser, FLAGS_ERROR, FLAGS_OK,
};
use sideload_runtime::hosted::{CacheOpKind, HostedPlatform};
use sideload_runtime::{RuntimeConfig, Service};

fn service() -> Service<HostedPlatform> {
    Service::new(HostedPlatform::new(), RuntimeConfig::default())
}

fn decode_stream(bytes: &[u8]) -> Vec<Packet> {
    let mut parser = StreamParser::new();
    parser
        .push(bytes)
        .into_iter()
        .map(|event| match event {
            ParseEvent::Packet(packet) => packet,
            other => panic!("unexpected event in response stream: {other:?}"),
        })
        .collect()
}

fn round_trip(service: &mut Service<HostedPlatform>, packet: &Packet) -> Packet {
    let out = service.feed(&encode_packet(packet).unwrap());
    let mut responses = decode_stream(&out);
    assert_eq!(responses.len(), 1, "expected exactly one response");
    responses.remove(0)
}

fn alloc(service: &mut Service<HostedPlatform>, size: u32, caps: MemCaps, align: u32) -> u32 {
    let request = Packet::request(
        CommandId::Alloc,
        encode_alloc_request(&AllocRequest { size, caps, align }),
    );
    let response = round_trip(service, &request);
    assert_eq!(response.flags, FLAGS_OK);
    let body = decode_alloc_response(&response.payload).unwrap();
    assert_eq!(body.status, Status::Ok.code());
    body.address
}

fn expect_alloc_fail(service: &mut Service<HostedPlatform>, payload: Vec<u8>) {
    let response = round_trip(service, &Packet::request(CommandId::Alloc, payload));
    assert_eq!(response.flags, FLAGS_ERROR);
    let body = decode_alloc_response(&response.payload).unwrap();
    assert_eq!(body.address, 0);
    assert_eq!(body.status, Status::AllocFailed.code());
}

#[test]
fn ping_echoes_any_payload() {
    let mut service = service();
    for payload in [vec![], vec![0x00], vec![0xA5, 0x5A], (0..=255).collect::<Vec<u8>>()] {
        let response = round_trip(
            &mut service,
            &Packet::request(CommandId::Ping, payload.clone()),
        );
        assert_eq!(response.flags, FLAGS_OK);
        assert_eq!(response.command, CommandId::Ping as u8);
        assert_eq!(response.payload, payload);
    }
}

#[test]
fn unknown_command_is_rejected_at_dispatch() {
    let mut service = service();
    let response = round_trip(
        &mut service,
        &Packet {
            command: 0x7F,
            flags: 0x00,
            payload: vec![1, 2, 3],
        },
    );
    assert_eq!(response.flags, FLAGS_ERROR);
    assert_eq!(response.command, 0x7F);
    assert_eq!(
        decode_status(&response.payload).unwrap(),
        Status::UnknownCommand.code()
    );
}

#[test]
fn alloc_write_read_round_trip() {
    let mut service = service();
    let addr = alloc(&mut service, 128, MemCaps::EXTERNAL, 8);

    let data: Vec<u8> = (0..64).collect();
    let response = round_trip(
        &mut service,
        &Packet::request(CommandId::WriteMem, encode_write_mem_request(addr, &data)),
    );
    assert_eq!(response.flags, FLAGS_OK);
    let body = decode_write_mem_response(&response.payload).unwrap();
    assert_eq!(body.bytes_written, 64);
    assert_eq!(body.status, Status::Ok.code());

    let response = round_trip(
        &mut service,
        &Packet::request(CommandId::ReadMem, encode_read_mem_request(addr, 64)),
    );
    assert_eq!(response.flags, FLAGS_OK);
    assert_eq!(response.payload, data);
}

#[test]
fn out_of_bounds_write_leaves_memory_untouched() {
    let mut service = service();
    let addr = alloc(
        &mut service,
        4096,
        MemCaps::EXECUTABLE | MemCaps::EXTERNAL,
        16,
    );

    let response = round_trip(
        &mut service,
        &Packet::request(
            CommandId::WriteMem,
            encode_write_mem_request(addr, &[0xAB; 256]),
        ),
    );
    assert_eq!(response.flags, FLAGS_OK);
    assert_eq!(
        decode_write_mem_response(&response.payload).unwrap().bytes_written,
        256
    );

    // Straddles the allocation end by 10 bytes.
    let response = round_trip(
        &mut service,
        &Packet::request(
            CommandId::WriteMem,
            encode_write_mem_request(addr + 4096 - 10, &[0xCD; 20]),
        ),
    );
    assert_eq!(response.flags, FLAGS_ERROR);
    let body = decode_write_mem_response(&response.payload).unwrap();
    assert_eq!(body.bytes_written, 0);
    assert_eq!(body.status, Status::OutOfBounds.code());

    // Nothing moved: not even the in-bounds head of the rejected write.
    let platform = service.dispatcher().platform();
    let tail = platform.peek(addr + 4096 - 10, 10).unwrap();
    assert_eq!(tail, vec![0u8; 10]);
    // And the bytes just past the allocation are untouched too.
    let outside = platform.peek(addr + 4096, 16).unwrap();
    assert_eq!(outside, vec![0u8; 16]);
}

#[test]
fn free_then_read_is_invalid_address() {
    let mut service = service();
    let addr = alloc(&mut service, 64, MemCaps::INTERNAL, 4);

    let response = round_trip(
        &mut service,
        &Packet::request(CommandId::Free, encode_free_request(addr)),
    );
    assert_eq!(response.flags, FLAGS_OK);
    assert_eq!(decode_status(&response.payload).unwrap(), Status::Ok.code());

    let response = round_trip(
        &mut service,
        &Packet::request(CommandId::ReadMem, encode_read_mem_request(addr, 4)),
    );
    assert_eq!(response.flags, FLAGS_ERROR);
    assert_eq!(
        decode_status(&response.payload).unwrap(),
        Status::InvalidAddress.code()
    );
}

#[test]
fn free_of_interior_address_is_rejected() {
    let mut service = service();
    let addr = alloc(&mut service, 64, MemCaps::INTERNAL, 4);

    let response = round_trip(
        &mut service,
        &Packet::request(CommandId::Free, encode_free_request(addr + 8)),
    );
    assert_eq!(response.flags, FLAGS_ERROR);
    assert_eq!(
        decode_status(&response.payload).unwrap(),
        Status::InvalidAddress.code()
    );

    // The allocation is still live and readable.
    let response = round_trip(
        &mut service,
        &Packet::request(CommandId::ReadMem, encode_read_mem_request(addr, 4)),
    );
    assert_eq!(response.flags, FLAGS_OK);
}

#[test]
fn exec_requires_executable_capability() {
    let mut service = service();
    let addr = alloc(&mut service, 64, MemCaps::EXTERNAL, 4);

    let response = round_trip(
        &mut service,
        &Packet::request(CommandId::Exec, encode_exec_request(addr)),
    );
    assert_eq!(response.flags, FLAGS_ERROR);
    assert_eq!(
        decode_status(&response.payload).unwrap(),
        Status::NotExecutable.code()
    );

    let response = round_trip(
        &mut service,
        &Packet::request(CommandId::Exec, encode_exec_request(0xDEAD_BEEF)),
    );
    assert_eq!(response.flags, FLAGS_ERROR);
    assert_eq!(
        decode_status(&response.payload).unwrap(),
        Status::InvalidAddress.code()
    );
}

#[test]
fn exec_runs_freshly_written_code() {
    let mut service = service();
    let addr = alloc(
        &mut service,
        256,
        MemCaps::EXECUTABLE | MemCaps::EXTERNAL,
        16,
    );

    // The hosted loopback convention executes "return the word at the
    // entry"; write 42 there.
    let response = round_trip(
        &mut service,
        &Packet::request(
            CommandId::WriteMem,
            encode_write_mem_request(addr, &42i32.to_le_bytes()),
        ),
    );
    assert_eq!(response.flags, FLAGS_OK);

    let response = round_trip(
        &mut service,
        &Packet::request(CommandId::Exec, encode_exec_request(addr)),
    );
    assert_eq!(response.flags, FLAGS_OK);
    assert_eq!(decode_exec_response(&response.payload).unwrap(), 42);

    // Rewriting the same address must execute the new bytes, not a stale
    // cached copy.
    service.dispatcher_mut().platform_mut().clear_cache_ops();
    round_trip(
        &mut service,
        &Packet::request(
            CommandId::WriteMem,
            encode_write_mem_request(addr, &(-7i32).to_le_bytes()),
        ),
    );
    let response = round_trip(
        &mut service,
        &Packet::request(CommandId::Exec, encode_exec_request(addr)),
    );
    assert_eq!(decode_exec_response(&response.payload).unwrap(), -7);

    // The journal shows the rewrite was written back and invalidated, then
    // EXEC synced the whole allocation again before the call.
    let ops = service.dispatcher().platform().cache_ops();
    let kinds: Vec<_> = ops.iter().map(|op| op.kind).collect();
    assert_eq!(
        kinds,
        vec![
            CacheOpKind::WriteBack,
            CacheOpKind::Invalidate,
            CacheOpKind::WriteBack,
            CacheOpKind::Invalidate,
        ]
    );
    // WRITE_MEM syncs the touched lines; EXEC syncs the full record.
    assert_eq!(ops[2].addr, addr);
    assert_eq!(ops[2].len, 256);
}

#[test]
fn plain_data_writes_skip_cache_maintenance() {
    let mut service = service();
    let addr = alloc(&mut service, 128, MemCaps::EXTERNAL, 4);

    round_trip(
        &mut service,
        &Packet::request(CommandId::WriteMem, encode_write_mem_request(addr, &[1; 32])),
    );
    assert!(service.dispatcher().platform().cache_ops().is_empty());

    // DMA-capable memory is maintained like code.
    let dma = alloc(&mut service, 128, MemCaps::DMA | MemCaps::INTERNAL, 4);
    round_trip(
        &mut service,
        &Packet::request(CommandId::WriteMem, encode_write_mem_request(dma, &[2; 32])),
    );
    let ops = service.dispatcher().platform().cache_ops();
    assert_eq!(ops.len(), 2);
    assert_eq!(ops[0].kind, CacheOpKind::WriteBack);
    assert_eq!(ops[1].kind, CacheOpKind::Invalidate);
}

#[test]
fn cache_fault_fails_the_request() {
    let mut service = service();
    let addr = alloc(
        &mut service,
        128,
        MemCaps::EXECUTABLE | MemCaps::INTERNAL,
        4,
    );

    service
        .dispatcher_mut()
        .platform_mut()
        .fail_cache_maintenance(true);

    let response = round_trip(
        &mut service,
        &Packet::request(CommandId::WriteMem, encode_write_mem_request(addr, &[9; 8])),
    );
    assert_eq!(response.flags, FLAGS_ERROR);
    assert_eq!(
        decode_write_mem_response(&response.payload).unwrap().status,
        Status::CacheSync.code()
    );

    let response = round_trip(
        &mut service,
        &Packet::request(CommandId::Exec, encode_exec_request(addr)),
    );
    assert_eq!(response.flags, FLAGS_ERROR);
    assert_eq!(
        decode_status(&response.payload).unwrap(),
        Status::CacheSync.code()
    );
}

#[test]
fn heap_info_tracks_allocations() {
    let mut service = service();

    let response = round_trip(&mut service, &Packet::request(CommandId::HeapInfo, vec![]));
    assert_eq!(response.flags, FLAGS_OK);
    let before = decode_heap_info(&response.payload).unwrap();
    assert_eq!(before.free_external, before.total_external);

    alloc(&mut service, 4096, MemCaps::EXTERNAL, 4);

    let response = round_trip(&mut service, &Packet::request(CommandId::HeapInfo, vec![]));
    let after = decode_heap_info(&response.payload).unwrap();
    assert_eq!(after.total_external, before.total_external);
    assert_eq!(after.free_external, before.free_external - 4096);
    assert_eq!(after.free_internal, before.free_internal);
}

#[test]
fn alloc_failures_collapse_to_alloc_fail() {
    let mut service = service();

    // Zero size.
    expect_alloc_fail(
        &mut service,
        encode_alloc_request(&AllocRequest {
            size: 0,
            caps: MemCaps::INTERNAL,
            align: 4,
        }),
    );
    // Non-power-of-two alignment.
    expect_alloc_fail(
        &mut service,
        encode_alloc_request(&AllocRequest {
            size: 64,
            caps: MemCaps::INTERNAL,
            align: 12,
        }),
    );
    // Contradictory memory classes.
    expect_alloc_fail(
        &mut service,
        encode_alloc_request(&AllocRequest {
            size: 64,
            caps: MemCaps::INTERNAL | MemCaps::EXTERNAL,
            align: 4,
        }),
    );
    // Larger than the whole pool.
    expect_alloc_fail(
        &mut service,
        encode_alloc_request(&AllocRequest {
            size: u32::MAX,
            caps: MemCaps::EXTERNAL,
            align: 4,
        }),
    );
    // Undefined capability bit.
    let mut payload = encode_alloc_request(&AllocRequest {
        size: 64,
        caps: MemCaps::INTERNAL,
        align: 4,
    });
    payload[7] |= 0x80;
    expect_alloc_fail(&mut service, payload);
    // Truncated payload.
    expect_alloc_fail(&mut service, vec![0u8; 11]);
}

#[test]
fn malformed_payloads_get_command_specific_codes() {
    let mut service = service();

    let response = round_trip(&mut service, &Packet::request(CommandId::Free, vec![0; 3]));
    assert_eq!(response.flags, FLAGS_ERROR);
    assert_eq!(
        decode_status(&response.payload).unwrap(),
        Status::InvalidAddress.code()
    );

    let response = round_trip(&mut service, &Packet::request(CommandId::Exec, vec![]));
    assert_eq!(response.flags, FLAGS_ERROR);
    assert_eq!(
        decode_status(&response.payload).unwrap(),
        Status::InvalidAddress.code()
    );

    let response = round_trip(&mut service, &Packet::request(CommandId::WriteMem, vec![0; 2]));
    assert_eq!(response.flags, FLAGS_ERROR);
    assert_eq!(
        decode_write_mem_response(&response.payload).unwrap().status,
        Status::InvalidAddress.code()
    );
}

#[test]
fn oversized_read_is_rejected() {
    let mut service = service();
    let addr = alloc(&mut service, 64, MemCaps::EXTERNAL, 4);

    let limit = RuntimeConfig::default().limits.max_payload_len as u32;
    let response = round_trip(
        &mut service,
        &Packet::request(
            CommandId::ReadMem,
            encode_read_mem_request(addr, limit + 1),
        ),
    );
    assert_eq!(response.flags, FLAGS_ERROR);
    assert_eq!(
        decode_status(&response.payload).unwrap(),
        Status::OutOfBounds.code()
    );
}

#[test]
fn responses_preserve_request_order_through_noise() {
    let mut service = service();

    let mut stream = Vec::new();
    stream.extend(encode_packet(&Packet::request(CommandId::Ping, vec![1])).unwrap());
    stream.extend_from_slice(&[0xFF, 0x00, 0xA5, 0x42, 0x5A]); // line noise
    stream.extend(encode_packet(&Packet::request(CommandId::Ping, vec![2])).unwrap());
    stream.extend(encode_packet(&Packet::request(CommandId::HeapInfo, vec![])).unwrap());

    let responses = decode_stream(&service.feed(&stream));
    assert_eq!(responses.len(), 3);
    assert_eq!(responses[0].payload, vec![1]);
    assert_eq!(responses[1].payload, vec![2]);
    assert_eq!(responses[2].command, CommandId::HeapInfo as u8);
}

#[test]
fn checksum_error_is_answered_and_stream_recovers() {
    let mut service = service();

    let mut corrupt =
        encode_packet(&Packet::request(CommandId::Free, vec![0, 0, 0, 0x60])).unwrap();
    let last = corrupt.len() - 1;
    corrupt[last] ^= 0x01;

    let mut stream = corrupt;
    stream.extend(encode_packet(&Packet::request(CommandId::Ping, vec![7])).unwrap());

    let responses = decode_stream(&service.feed(&stream));
    assert_eq!(responses.len(), 2);

    assert_eq!(responses[0].command, CommandId::Free as u8);
    assert_eq!(responses[0].flags, FLAGS_ERROR);
    assert_eq!(
        decode_status(&responses[0].payload).unwrap(),
        Status::Checksum.code()
    );

    assert_eq!(responses[1].flags, FLAGS_OK);
    assert_eq!(responses[1].payload, vec![7]);
}

#[test]
fn byte_at_a_time_delivery_works_end_to_end() {
    let mut service = service();
    let wire = encode_packet(&Packet::request(CommandId::Ping, vec![0xAA, 0xBB])).unwrap();

    let mut out = Vec::new();
    for &b in &wire {
        out.extend(service.feed(&[b]));
    }
    let responses = decode_stream(&out);
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].payload, vec![0xAA, 0xBB]);
}
