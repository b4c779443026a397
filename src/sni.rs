//! SNI extraction from a TLS ClientHello
//!
//! The TLS listener reads the first handshake record before any handshake
//! takes place, pulls the server name out of it and keeps the raw bytes so
//! they can be replayed to the backend (passthrough) or to the local TLS
//! acceptor (termination). Reads are bounded in size and time.

use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::timeout;

/// Upper bound on bytes read while looking for the server name
pub const MAX_CLIENT_HELLO_BYTES: usize = 16 * 1024;

const RECORD_HEADER_LEN: usize = 5;
const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
const EXTENSION_SERVER_NAME: u16 = 0x0000;
const NAME_TYPE_HOST_NAME: u8 = 0x00;

/// Outcome of inspecting the start of a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SniResult {
    /// Server name, lower-cased with any trailing dot removed
    Found(String),
    /// Well-formed ClientHello without a server_name extension
    NoSni,
    /// First bytes are not a TLS handshake record
    NotTls,
    /// Truncated, inconsistent or over the byte budget
    Malformed,
    /// ClientHello did not arrive before the deadline
    Timeout,
    Io(String),
}

#[derive(Debug, Clone)]
pub struct SniConfig {
    pub timeout: Duration,
    pub max_bytes: usize,
}

impl Default for SniConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            max_bytes: MAX_CLIENT_HELLO_BYTES,
        }
    }
}

/// Reads and parses the ClientHello at the start of a stream
#[derive(Debug, Clone, Default)]
pub struct SniInspector {
    config: SniConfig,
}

impl SniInspector {
    pub fn with_config(config: SniConfig) -> Self {
        Self { config }
    }

    /// Read the first TLS record from `stream` and extract the server name.
    ///
    /// Returns the result together with every byte consumed from the stream.
    /// The caller owns those bytes and must replay them.
    pub async fn inspect<R: AsyncRead + Unpin>(&self, stream: &mut R) -> (SniResult, Vec<u8>) {
        let mut buffer = Vec::with_capacity(1024);

        match timeout(self.config.timeout, self.read_record(stream, &mut buffer)).await {
            Ok(Ok(ReadOutcome::Complete)) => {
                let result = parse_client_hello(&buffer);
                (result, buffer)
            }
            Ok(Ok(ReadOutcome::NotTls)) => (SniResult::NotTls, buffer),
            Ok(Ok(ReadOutcome::Truncated)) => (SniResult::Malformed, buffer),
            Ok(Err(e)) => (SniResult::Io(e.to_string()), buffer),
            Err(_) => (SniResult::Timeout, buffer),
        }
    }

    async fn read_record<R: AsyncRead + Unpin>(
        &self,
        stream: &mut R,
        buffer: &mut Vec<u8>,
    ) -> io::Result<ReadOutcome> {
        if !read_until(stream, buffer, RECORD_HEADER_LEN).await? {
            return Ok(ReadOutcome::Truncated);
        }
        if buffer[0] != CONTENT_TYPE_HANDSHAKE {
            return Ok(ReadOutcome::NotTls);
        }

        let record_len = u16::from_be_bytes([buffer[3], buffer[4]]) as usize;
        let total = RECORD_HEADER_LEN + record_len;
        if total > self.config.max_bytes {
            return Ok(ReadOutcome::Truncated);
        }

        if !read_until(stream, buffer, total).await? {
            return Ok(ReadOutcome::Truncated);
        }
        Ok(ReadOutcome::Complete)
    }
}

enum ReadOutcome {
    Complete,
    NotTls,
    Truncated,
}

/// Read until `buffer` holds at least `len` bytes. False on early EOF.
async fn read_until<R: AsyncRead + Unpin>(
    stream: &mut R,
    buffer: &mut Vec<u8>,
    len: usize,
) -> io::Result<bool> {
    let mut chunk = [0u8; 4096];
    while buffer.len() < len {
        let want = (len - buffer.len()).min(chunk.len());
        let n = stream.read(&mut chunk[..want]).await?;
        if n == 0 {
            return Ok(false);
        }
        buffer.extend_from_slice(&chunk[..n]);
    }
    Ok(true)
}

/// Bounds-checked reader over a byte slice
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn u8(&mut self) -> Option<u8> {
        let b = *self.data.get(self.pos)?;
        self.pos += 1;
        Some(b)
    }

    fn u16(&mut self) -> Option<u16> {
        let bytes = self.bytes(2)?;
        Some(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn u24(&mut self) -> Option<usize> {
        let bytes = self.bytes(3)?;
        Some(((bytes[0] as usize) << 16) | ((bytes[1] as usize) << 8) | bytes[2] as usize)
    }

    fn bytes(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.remaining() < n {
            return None;
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Some(slice)
    }

    /// Sub-cursor over a length-prefixed block
    fn block_u8(&mut self) -> Option<Cursor<'a>> {
        let len = self.u8()? as usize;
        self.bytes(len).map(Cursor::new)
    }

    fn block_u16(&mut self) -> Option<Cursor<'a>> {
        let len = self.u16()? as usize;
        self.bytes(len).map(Cursor::new)
    }
}

/// Parse a complete TLS handshake record carrying a ClientHello.
///
/// Record layout: type(1) version(2) length(2), then the handshake message:
/// type(1) length(3) client_version(2) random(32) session_id<0..32>
/// cipher_suites<2..2^16-2> compression_methods<1..2^8-1> extensions<0..2^16-1>
pub fn parse_client_hello(data: &[u8]) -> SniResult {
    parse_record(data).unwrap_or(SniResult::Malformed)
}

fn parse_record(data: &[u8]) -> Option<SniResult> {
    let mut record = Cursor::new(data);
    if record.u8()? != CONTENT_TYPE_HANDSHAKE {
        return Some(SniResult::NotTls);
    }
    record.u16()?;
    let mut handshake = record.block_u16()?;

    if handshake.u8()? != HANDSHAKE_CLIENT_HELLO {
        return Some(SniResult::NotTls);
    }
    let hello_len = handshake.u24()?;
    let mut hello = Cursor::new(handshake.bytes(hello_len)?);

    hello.u16()?; // client_version
    hello.bytes(32)?; // random
    hello.block_u8()?; // session_id
    hello.block_u16()?; // cipher_suites
    hello.block_u8()?; // compression_methods

    if hello.remaining() == 0 {
        return Some(SniResult::NoSni);
    }

    let mut extensions = hello.block_u16()?;
    while extensions.remaining() > 0 {
        let ext_type = extensions.u16()?;
        let body = extensions.block_u16()?;
        if ext_type == EXTENSION_SERVER_NAME {
            return parse_server_name(body);
        }
    }

    Some(SniResult::NoSni)
}

fn parse_server_name(mut ext: Cursor<'_>) -> Option<SniResult> {
    let mut list = ext.block_u16()?;
    while list.remaining() > 0 {
        let name_type = list.u8()?;
        let name = list.block_u16()?;
        if name_type != NAME_TYPE_HOST_NAME {
            continue;
        }

        let name = std::str::from_utf8(name.data).ok()?;
        if name.is_empty() || !name.is_ascii() {
            return None;
        }
        let name = name.strip_suffix('.').unwrap_or(name).to_ascii_lowercase();
        return Some(SniResult::Found(name));
    }
    Some(SniResult::NoSni)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_u16_len(body: &[u8]) -> Vec<u8> {
        let mut out = (body.len() as u16).to_be_bytes().to_vec();
        out.extend_from_slice(body);
        out
    }

    /// Build a TLS 1.2 style ClientHello record, optionally with a server_name
    fn client_hello(server_name: Option<&str>) -> Vec<u8> {
        let mut extensions = Vec::new();

        // supported_groups, to make sure SNI is found past other extensions
        extensions.extend_from_slice(&[0x00, 0x0a]);
        extensions.extend_from_slice(&with_u16_len(&with_u16_len(&[0x00, 0x1d])));

        if let Some(name) = server_name {
            let mut entry = vec![NAME_TYPE_HOST_NAME];
            entry.extend_from_slice(&with_u16_len(name.as_bytes()));
            extensions.extend_from_slice(&[0x00, 0x00]);
            extensions.extend_from_slice(&with_u16_len(&with_u16_len(&entry)));
        }

        let mut hello = vec![0x03, 0x03];
        hello.extend_from_slice(&[0x42; 32]);
        hello.push(0x00); // empty session id
        hello.extend_from_slice(&with_u16_len(&[0x13, 0x01, 0x00, 0x2f]));
        hello.extend_from_slice(&[0x01, 0x00]);
        hello.extend_from_slice(&with_u16_len(&extensions));

        let mut handshake = vec![HANDSHAKE_CLIENT_HELLO];
        handshake.extend_from_slice(&(hello.len() as u32).to_be_bytes()[1..]);
        handshake.extend_from_slice(&hello);

        let mut record = vec![CONTENT_TYPE_HANDSHAKE, 0x03, 0x01];
        record.extend_from_slice(&with_u16_len(&handshake));
        record
    }

    #[test]
    fn test_parse_sni_found() {
        let hello = client_hello(Some("Example.COM."));
        assert_eq!(
            parse_client_hello(&hello),
            SniResult::Found("example.com".to_string())
        );
    }

    #[test]
    fn test_parse_no_sni() {
        assert_eq!(parse_client_hello(&client_hello(None)), SniResult::NoSni);
    }

    #[test]
    fn test_parse_not_tls() {
        let http_request = b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n";
        assert_eq!(parse_client_hello(http_request), SniResult::NotTls);
    }

    #[test]
    fn test_parse_truncated() {
        let hello = client_hello(Some("example.com"));
        for len in [3, 9, 40, hello.len() - 1] {
            assert_eq!(parse_client_hello(&hello[..len]), SniResult::Malformed, "len {len}");
        }
    }

    #[test]
    fn test_parse_inconsistent_lengths() {
        let mut hello = client_hello(Some("example.com"));
        // Inflate the handshake length past the record
        hello[8] = hello[8].wrapping_add(10);
        assert_eq!(parse_client_hello(&hello), SniResult::Malformed);
    }

    #[tokio::test]
    async fn test_inspect_returns_consumed_bytes() {
        let hello = client_hello(Some("api.example.com"));
        let mut input = hello.clone();
        input.extend_from_slice(b"trailing application data");

        let mut stream = std::io::Cursor::new(input);
        let (result, consumed) = SniInspector::default().inspect(&mut stream).await;

        assert_eq!(result, SniResult::Found("api.example.com".to_string()));
        assert_eq!(consumed, hello);
    }

    #[tokio::test]
    async fn test_inspect_byte_budget() {
        let hello = client_hello(Some("api.example.com"));
        let inspector = SniInspector::with_config(SniConfig {
            timeout: Duration::from_secs(1),
            max_bytes: 32,
        });
        let mut stream = std::io::Cursor::new(hello);
        let (result, _) = inspector.inspect(&mut stream).await;
        assert_eq!(result, SniResult::Malformed);
    }

    #[tokio::test]
    async fn test_inspect_timeout() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let inspector = SniInspector::with_config(SniConfig {
            timeout: Duration::from_millis(50),
            max_bytes: MAX_CLIENT_HELLO_BYTES,
        });

        tokio::io::AsyncWriteExt::write_all(&mut client, &[0x16, 0x03]).await.unwrap();
        let (result, consumed) = inspector.inspect(&mut server).await;
        assert_eq!(result, SniResult::Timeout);
        assert_eq!(consumed, vec![0x16, 0x03]);
    }

    #[tokio::test]
    async fn test_inspect_early_eof() {
        let mut stream = std::io::Cursor::new(vec![0x16, 0x03, 0x01]);
        let (result, _) = SniInspector::default().inspect(&mut stream).await;
        assert_eq!(result, SniResult::Malformed);
    }
}
