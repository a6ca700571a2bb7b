// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Loopback mock ADS device for integration tests.
//!
//! Each test spawns a listener on an ephemeral port and drives it with a
//! script closure speaking raw AMS/TCP. Keep the peer declared before the
//! connection under test so teardown closes the socket first and the
//! script sees EOF.

#![allow(dead_code)]

use amslink::proto::{AmsAddr, AmsNetId, AmsTcpHeader, AoeHeader, CommandId, STATE_FLAGS_RESPONSE};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::thread::JoinHandle;

pub const DEVICE_NET_ID: AmsNetId = AmsNetId([192, 168, 0, 1, 1, 1]);
pub const DEVICE_PORT: u16 = 851;

pub fn device_addr() -> AmsAddr {
    AmsAddr::new(DEVICE_NET_ID, DEVICE_PORT)
}

pub struct MockPeer {
    addr: SocketAddr,
    thread: Option<JoinHandle<()>>,
}

impl MockPeer {
    /// Bind an ephemeral loopback port and run `script` on the first
    /// accepted connection.
    pub fn spawn<F>(script: F) -> Self
    where
        F: FnOnce(TcpStream) + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock peer");
        let addr = listener.local_addr().expect("mock peer addr");
        let thread = std::thread::spawn(move || {
            if let Ok((stream, _)) = listener.accept() {
                stream.set_nodelay(true).ok();
                script(stream);
            }
        });
        Self {
            addr,
            thread: Some(thread),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

impl Drop for MockPeer {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            thread.join().expect("mock peer script panicked");
        }
    }
}

/// Read one request frame off the wire. Returns None on clean EOF at a
/// frame boundary.
pub fn read_request(stream: &mut TcpStream) -> Option<(AoeHeader, Vec<u8>)> {
    let mut tcp_raw = [0u8; AmsTcpHeader::SIZE];
    if let Err(e) = stream.read_exact(&mut tcp_raw) {
        assert!(
            matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof | std::io::ErrorKind::ConnectionReset
            ),
            "unexpected read error: {e}"
        );
        return None;
    }
    let frame_length = AmsTcpHeader::decode(tcp_raw).length as usize;
    assert!(frame_length >= AoeHeader::SIZE, "runt request frame");

    let mut aoe_raw = [0u8; AoeHeader::SIZE];
    stream.read_exact(&mut aoe_raw).expect("request AoE header");
    let header = AoeHeader::decode(&aoe_raw);

    let mut payload = vec![0u8; frame_length - AoeHeader::SIZE];
    stream.read_exact(&mut payload).expect("request payload");
    Some((header, payload))
}

/// Answer a request: addresses swapped, invoke id echoed.
pub fn send_reply(stream: &mut TcpStream, request: &AoeHeader, payload: &[u8]) {
    send_reply_raw(stream, request, request.cmd_id, request.invoke_id, payload);
}

/// Reply with full control over cmd id and invoke id (fault injection).
pub fn send_reply_raw(
    stream: &mut TcpStream,
    request: &AoeHeader,
    cmd_id: u16,
    invoke_id: u32,
    payload: &[u8],
) {
    let reply = AoeHeader {
        target: request.source,
        source: request.target,
        cmd_id,
        state_flags: STATE_FLAGS_RESPONSE,
        length: payload.len() as u32,
        error_code: 0,
        invoke_id,
    };
    let mut out = Vec::new();
    out.extend_from_slice(&AmsTcpHeader::new((AoeHeader::SIZE + payload.len()) as u32).encode());
    out.extend_from_slice(&reply.encode());
    out.extend_from_slice(payload);
    stream.write_all(&out).expect("send reply");
}

/// Push a DEVICE_NOTIFICATION carrying one stamp with the given samples at
/// the local port `target`.
pub fn send_notification(
    stream: &mut TcpStream,
    target: AmsAddr,
    timestamp: u64,
    samples: &[(u32, &[u8])],
) {
    let mut ads_stream = Vec::new();
    ads_stream.extend_from_slice(&1u32.to_le_bytes());
    ads_stream.extend_from_slice(&timestamp.to_le_bytes());
    ads_stream.extend_from_slice(&(samples.len() as u32).to_le_bytes());
    for (handle, payload) in samples {
        ads_stream.extend_from_slice(&handle.to_le_bytes());
        ads_stream.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        ads_stream.extend_from_slice(payload);
    }

    let mut payload = Vec::new();
    payload.extend_from_slice(&(ads_stream.len() as u32).to_le_bytes());
    payload.extend_from_slice(&ads_stream);

    let header = AoeHeader {
        target,
        source: device_addr(),
        cmd_id: CommandId::DeviceNotification.as_u16(),
        state_flags: STATE_FLAGS_RESPONSE,
        length: payload.len() as u32,
        error_code: 0,
        invoke_id: 0,
    };
    let mut out = Vec::new();
    out.extend_from_slice(&AmsTcpHeader::new((AoeHeader::SIZE + payload.len()) as u32).encode());
    out.extend_from_slice(&header.encode());
    out.extend_from_slice(&payload);
    stream.write_all(&out).expect("send notification");
}
