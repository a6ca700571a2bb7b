// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Blocking stream abstraction for the AMS connection.
//!
//! One socket is shared by the reader thread (reads) and arbitrary caller
//! threads (serialized writes), so the trait takes `&self` everywhere and
//! implementations must be safe for that split. Unit tests substitute a
//! scriptable mock; production uses `TcpStream`.

use std::io;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};

/// Shared blocking byte stream.
///
/// `read` blocks until at least one byte arrives, EOF (`Ok(0)`) or error;
/// `shutdown` must unblock a concurrent `read` (teardown relies on it).
pub trait AmsStream: Send + Sync {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;
    fn write_all(&self, buf: &[u8]) -> io::Result<()>;
    fn shutdown(&self) -> io::Result<()>;
}

impl AmsStream for TcpStream {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        io::Read::read(&mut &*self, buf)
    }

    fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        io::Write::write_all(&mut &*self, buf)
    }

    fn shutdown(&self) -> io::Result<()> {
        match TcpStream::shutdown(self, Shutdown::Both) {
            // Already closed by the peer: teardown proceeds normally.
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }
}

/// Keepalive probing interval for idle AMS connections.
const KEEPALIVE_TIME: Duration = Duration::from_secs(5);

/// Connect to the device with a bounded timeout and configure the socket
/// for request/reply traffic (no Nagle delay, keepalive probing).
pub fn connect(addr: SocketAddr, timeout: Duration) -> io::Result<TcpStream> {
    let stream = TcpStream::connect_timeout(&addr, timeout)?;
    stream.set_nodelay(true)?;
    SockRef::from(&stream).set_tcp_keepalive(&TcpKeepalive::new().with_time(KEEPALIVE_TIME))?;
    Ok(stream)
}

/// Read exactly `buf.len()` bytes; EOF mid-read is `UnexpectedEof`.
pub fn read_exact(stream: &dyn AmsStream, buf: &mut [u8]) -> io::Result<()> {
    let mut pos = 0;
    while pos < buf.len() {
        match stream.read(&mut buf[pos..]) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed",
                ))
            }
            Ok(n) => pos += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Read and discard `n` bytes (skipping frames nobody wants).
pub fn drain(stream: &dyn AmsStream, mut n: usize) -> io::Result<()> {
    let mut junk = [0u8; 1024];
    while n > 0 {
        let take = n.min(junk.len());
        read_exact(stream, &mut junk[..take])?;
        n -= take;
    }
    Ok(())
}

// ============================================================================
// Test mock stream
// ============================================================================


// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::mock::MockStream;
    use super::*;
    use std::thread;

    #[test]
    fn test_read_exact_assembles_partial_reads() {
        let stream = MockStream::new();
        stream.feed_read_data(b"he");
        stream.feed_read_data(b"llo");

        let mut buf = [0u8; 5];
        read_exact(&stream, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn test_read_exact_eof() {
        let stream = MockStream::new();
        stream.feed_read_data(b"ab");
        stream.shutdown().unwrap();

        let mut buf = [0u8; 4];
        let err = read_exact(&stream, &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_drain_discards_exactly() {
        let stream = MockStream::new();
        stream.feed_read_data(&vec![0xAAu8; 2000]);
        stream.feed_read_data(b"keep");

        drain(&stream, 2000).unwrap();
        let mut buf = [0u8; 4];
        read_exact(&stream, &mut buf).unwrap();
        assert_eq!(&buf, b"keep");
    }

    #[test]
    fn test_shutdown_unblocks_reader() {
        let stream = MockStream::new();
        let reader_stream = stream.clone();

        let reader = thread::spawn(move || {
            let mut buf = [0u8; 16];
            reader_stream.read(&mut buf)
        });

        thread::sleep(Duration::from_millis(20));
        stream.shutdown().unwrap();

        let result = reader.join().unwrap().unwrap();
        assert_eq!(result, 0, "shutdown must surface as EOF");
    }

    #[test]
    fn test_write_capture_and_failure() {
        let stream = MockStream::new();
        stream.write_all(b"request").unwrap();
        assert_eq!(stream.written(), b"request");

        stream.fail_writes();
        assert!(stream.write_all(b"more").is_err());
        assert_eq!(stream.written(), b"request");
    }
}
