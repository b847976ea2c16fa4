use std::io::{ErrorKind, Read, Write};

use bytes::BytesMut;
use mio::net::TcpStream;

use crate::resp::RespValue;
use crate::Result;

/// One inbound byte stream plus the bytes received so far but not yet
/// consumed as complete frames. The buffer survives across readiness
/// events, so a frame split over several TCP segments is reassembled here.
pub struct Connection {
    pub stream: TcpStream,
    pub buffer: BytesMut,
    pub closed: bool,
}

impl Connection {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            buffer: BytesMut::with_capacity(4096),
            closed: false,
        }
    }

    /// Drains everything the socket currently holds into the buffer.
    /// Returns the number of bytes appended; marks the connection closed
    /// when the peer has shut down its end.
    pub fn receive(&mut self) -> Result<usize> {
        let mut chunk = [0u8; 512];
        let mut appended = 0;
        loop {
            match self.stream.read(&mut chunk) {
                // Reading 0 bytes means the other side is done writing.
                Ok(0) => {
                    self.closed = true;
                    break;
                }
                Ok(n) => {
                    self.buffer.extend_from_slice(&chunk[..n]);
                    appended += n;
                }
                // The OS's way of saying the socket holds nothing more.
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(appended)
    }

    pub fn write_value(&mut self, value: &RespValue) -> Result<()> {
        self.write_bytes(value.to_string().as_bytes())
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream.write_all(bytes)?;
        Ok(())
    }
}
