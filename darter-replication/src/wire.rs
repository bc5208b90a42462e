//! Replication client plumbing: command serializer, RESP reply reader, and
//! the chained snapshot-body reader.

use darter_common::error::{DarterError, DarterResult};
use darter_core::db_slice::SliceRecord;
use darter_storage::rdb::{BodyEvent, try_decode_body_event, try_decode_header};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const READ_CHUNK_BYTES: usize = 16 * 1024;

/// Sends one inline command terminated by CRLF.
///
/// Masters accept the inline form for handshake traffic, which keeps the
/// client side trivially debuggable on the wire.
///
/// # Errors
///
/// Returns `DarterError::Io` on socket failure.
pub async fn send_command<S: AsyncWrite + Unpin>(stream: &mut S, command: &str) -> DarterResult<()> {
    let mut line = Vec::with_capacity(command.len() + 2);
    line.extend_from_slice(command.as_bytes());
    line.extend_from_slice(b"\r\n");
    stream
        .write_all(&line)
        .await
        .map_err(|error| DarterError::io(&error))
}

/// One decoded RESP reply value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// `+...` simple string.
    Simple(String),
    /// `-...` error string.
    Error(String),
    /// `:<n>` integer.
    Integer(i64),
    /// `$<len>` bulk payload.
    Bulk(Vec<u8>),
    /// `$-1` null bulk.
    Null,
    /// `*<n>` array.
    Array(Vec<RespValue>),
}

impl RespValue {
    /// Returns the textual content of simple or bulk strings.
    #[must_use]
    pub fn as_text(&self) -> Option<String> {
        match self {
            Self::Simple(text) => Some(text.clone()),
            Self::Bulk(bytes) => String::from_utf8(bytes.clone()).ok(),
            _ => None,
        }
    }
}

fn bad_reply(detail: impl Into<String>) -> DarterError {
    DarterError::bad_message(format!("unexpected master reply: {}", detail.into()))
}

/// Buffered reader decoding RESP replies from a master connection.
///
/// Bytes received past a decoded reply stay buffered; full-sync paths hand
/// them to the snapshot reader as the unconsumed prefix.
#[derive(Debug, Default)]
pub struct ReplyReader {
    buffer: Vec<u8>,
}

impl ReplyReader {
    /// Creates an empty reader.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Hands over the unconsumed tail.
    #[must_use]
    pub fn take_buffered(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buffer)
    }

    async fn fill<S: AsyncRead + Unpin>(&mut self, stream: &mut S) -> DarterResult<()> {
        let mut chunk = [0_u8; READ_CHUNK_BYTES];
        let read_len = stream
            .read(&mut chunk)
            .await
            .map_err(|error| DarterError::io(&error))?;
        if read_len == 0 {
            return Err(DarterError::Io("master connection closed".to_owned()));
        }
        self.buffer.extend_from_slice(&chunk[..read_len]);
        Ok(())
    }

    /// Reads one complete RESP reply.
    ///
    /// # Errors
    ///
    /// Returns `DarterError::Protocol` for malformed replies and
    /// `DarterError::Io` for socket failures.
    pub async fn read_reply<S: AsyncRead + Unpin>(
        &mut self,
        stream: &mut S,
    ) -> DarterResult<RespValue> {
        loop {
            if let Some((value, consumed)) = try_parse_reply(&self.buffer)? {
                let _ = self.buffer.drain(..consumed);
                return Ok(value);
            }
            self.fill(stream).await?;
        }
    }

    /// Reads one CRLF-terminated line, skipping leading whitespace.
    ///
    /// Replication headers (`+FULLRESYNC ...`, `$EOF:...`) are read this way
    /// because their `$` line is not a RESP bulk payload.
    ///
    /// # Errors
    ///
    /// Returns `DarterError::Protocol` for a bare-LF line and
    /// `DarterError::Io` for socket failures.
    pub async fn read_line<S: AsyncRead + Unpin>(
        &mut self,
        stream: &mut S,
    ) -> DarterResult<String> {
        loop {
            while self
                .buffer
                .first()
                .is_some_and(|byte| byte.is_ascii_whitespace())
            {
                let _ = self.buffer.remove(0);
            }
            if let Some(newline_pos) = self.buffer.iter().position(|byte| *byte == b'\n') {
                if newline_pos == 0 || self.buffer[newline_pos - 1] != b'\r' {
                    return Err(bad_reply("replication header line lacks CRLF"));
                }
                let line = String::from_utf8(self.buffer[..newline_pos - 1].to_vec())
                    .map_err(|_| bad_reply("replication header is not valid UTF-8"))?;
                let _ = self.buffer.drain(..=newline_pos);
                return Ok(line);
            }
            self.fill(stream).await?;
        }
    }
}

/// Attempts to parse one reply at the start of `input`.
///
/// Returns the value and consumed byte count, or `None` when incomplete.
fn try_parse_reply(input: &[u8]) -> DarterResult<Option<(RespValue, usize)>> {
    let Some(type_byte) = input.first() else {
        return Ok(None);
    };
    let Some(newline_pos) = input.iter().position(|byte| *byte == b'\n') else {
        return Ok(None);
    };
    if newline_pos < 1 || input[newline_pos - 1] != b'\r' {
        return Err(bad_reply("reply line lacks CRLF"));
    }
    let line = std::str::from_utf8(&input[1..newline_pos - 1])
        .map_err(|_| bad_reply("reply line is not valid UTF-8"))?;
    let after_line = newline_pos + 1;

    match type_byte {
        b'+' => Ok(Some((RespValue::Simple(line.to_owned()), after_line))),
        b'-' => Ok(Some((RespValue::Error(line.to_owned()), after_line))),
        b':' => {
            let value = line
                .parse::<i64>()
                .map_err(|_| bad_reply("integer reply is not a number"))?;
            Ok(Some((RespValue::Integer(value), after_line)))
        }
        b'$' => {
            if line == "-1" {
                return Ok(Some((RespValue::Null, after_line)));
            }
            let len = line
                .parse::<usize>()
                .map_err(|_| bad_reply("bulk length is not a number"))?;
            let payload_end = after_line + len;
            if input.len() < payload_end + 2 {
                return Ok(None);
            }
            if &input[payload_end..payload_end + 2] != b"\r\n" {
                return Err(bad_reply("bulk payload lacks CRLF"));
            }
            Ok(Some((
                RespValue::Bulk(input[after_line..payload_end].to_vec()),
                payload_end + 2,
            )))
        }
        b'*' => {
            let count = line
                .parse::<usize>()
                .map_err(|_| bad_reply("array length is not a number"))?;
            let mut members = Vec::with_capacity(count);
            let mut cursor = after_line;
            for _ in 0..count {
                let Some((member, consumed)) = try_parse_reply(&input[cursor..])? else {
                    return Ok(None);
                };
                members.push(member);
                cursor += consumed;
            }
            Ok(Some((RespValue::Array(members), cursor)))
        }
        other => Err(bad_reply(format!(
            "unknown reply type byte '{}'",
            char::from(*other)
        ))),
    }
}

/// Streaming decoder for one snapshot body arriving over a socket.
///
/// The reader is seeded with the reply buffer's unconsumed tail and chains
/// onto the socket, mirroring a prefix source feeding the loader. Bytes past
/// the end-of-body opcode stay available as leftover for EOF-token checks and
/// subsequent stream traffic.
#[derive(Debug)]
pub struct SnapshotStreamReader {
    buffer: Vec<u8>,
    total_fed: u64,
    limit: Option<u64>,
    header_done: bool,
    body_done: bool,
    scripts: Vec<String>,
    keys_loaded: u64,
}

impl SnapshotStreamReader {
    /// Creates a reader seeded with already-received bytes.
    #[must_use]
    pub fn new(prefix: Vec<u8>) -> Self {
        let total_fed = u64::try_from(prefix.len()).unwrap_or(u64::MAX);
        Self {
            buffer: prefix,
            total_fed,
            limit: None,
            header_done: false,
            body_done: false,
            scripts: Vec::new(),
            keys_loaded: 0,
        }
    }

    /// Declares the exact wire size of the snapshot (disk-based full sync).
    pub fn set_limit(&mut self, limit: u64) {
        self.limit = Some(limit);
    }

    /// Script corpus decoded from the header.
    #[must_use]
    pub fn scripts(&self) -> &[String] {
        &self.scripts
    }

    /// Entries decoded so far.
    #[must_use]
    pub fn keys_loaded(&self) -> u64 {
        self.keys_loaded
    }

    /// Bytes consumed by header and body decoding so far.
    #[must_use]
    pub fn bytes_consumed(&self) -> u64 {
        self.total_fed
            .saturating_sub(u64::try_from(self.buffer.len()).unwrap_or(0))
    }

    /// Unconsumed bytes after the end of body.
    #[must_use]
    pub fn leftover(&self) -> &[u8] {
        &self.buffer
    }

    async fn fill<S: AsyncRead + Unpin>(&mut self, stream: &mut S) -> DarterResult<()> {
        let mut want = READ_CHUNK_BYTES;
        if let Some(limit) = self.limit {
            let remaining = limit.saturating_sub(self.total_fed);
            if remaining == 0 {
                return Err(DarterError::bad_message(
                    "snapshot body exceeds its declared size",
                ));
            }
            want = want.min(usize::try_from(remaining).unwrap_or(want));
        }

        let mut chunk = vec![0_u8; want];
        let read_len = stream
            .read(&mut chunk)
            .await
            .map_err(|error| DarterError::io(&error))?;
        if read_len == 0 {
            return Err(DarterError::Io(
                "master connection closed during full sync".to_owned(),
            ));
        }
        self.total_fed += read_len as u64;
        self.buffer.extend_from_slice(&chunk[..read_len]);
        Ok(())
    }

    /// Decodes the next entry, or `None` once the end of body is reached.
    ///
    /// For size-limited bodies, reaching the end verifies the consumed byte
    /// count equals the declared size exactly.
    ///
    /// # Errors
    ///
    /// Returns `DarterError::Protocol` for malformed streams or size
    /// mismatches, `DarterError::Io` for socket failures.
    pub async fn next_record<S: AsyncRead + Unpin>(
        &mut self,
        stream: &mut S,
    ) -> DarterResult<Option<SliceRecord>> {
        if self.body_done {
            return Ok(None);
        }
        loop {
            if !self.header_done {
                match try_decode_header(&self.buffer)? {
                    Some((scripts, consumed)) => {
                        self.scripts = scripts;
                        let _ = self.buffer.drain(..consumed);
                        self.header_done = true;
                    }
                    None => {
                        self.fill(stream).await?;
                        continue;
                    }
                }
            }
            match try_decode_body_event(&self.buffer)? {
                Some((BodyEvent::Entry(record), consumed)) => {
                    let _ = self.buffer.drain(..consumed);
                    self.keys_loaded += 1;
                    return Ok(Some(record));
                }
                Some((BodyEvent::Eof, consumed)) => {
                    let _ = self.buffer.drain(..consumed);
                    self.body_done = true;
                    if let Some(limit) = self.limit {
                        if self.bytes_consumed() != limit {
                            return Err(DarterError::bad_message(format!(
                                "snapshot consumed {} bytes, master declared {limit}",
                                self.bytes_consumed()
                            )));
                        }
                    }
                    return Ok(None);
                }
                None => self.fill(stream).await?,
            }
        }
    }

    /// Reads exactly `len` bytes from the leftover chained with the socket.
    ///
    /// Used to pull the 40-byte EOF token that diskless masters append after
    /// the body.
    ///
    /// # Errors
    ///
    /// Returns `DarterError::Io` when the stream ends early.
    pub async fn read_exact_chained<S: AsyncRead + Unpin>(
        &mut self,
        stream: &mut S,
        len: usize,
    ) -> DarterResult<Vec<u8>> {
        while self.buffer.len() < len {
            let mut chunk = [0_u8; READ_CHUNK_BYTES];
            let read_len = stream
                .read(&mut chunk)
                .await
                .map_err(|error| DarterError::io(&error))?;
            if read_len == 0 {
                return Err(DarterError::Io(
                    "master connection closed before eof token".to_owned(),
                ));
            }
            self.total_fed += read_len as u64;
            self.buffer.extend_from_slice(&chunk[..read_len]);
        }
        Ok(self.buffer.drain(..len).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::{ReplyReader, RespValue, SnapshotStreamReader, send_command};
    use darter_core::db_slice::SliceRecord;
    use darter_storage::rdb::{encode_entry, encode_eof, encode_header};
    use googletest::prelude::*;
    use rstest::rstest;
    use tokio::io::AsyncReadExt;

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .expect("runtime must build")
    }

    fn record(db: u16, key: &[u8], value: &[u8]) -> SliceRecord {
        SliceRecord {
            db,
            key: key.to_vec(),
            value: value.to_vec(),
            expire_at_ms: None,
        }
    }

    #[rstest]
    fn send_command_appends_crlf() {
        runtime().block_on(async {
            let (mut client, mut server) = tokio::io::duplex(64);
            send_command(&mut client, "PING").await.expect("send must pass");
            let mut received = [0_u8; 6];
            server
                .read_exact(&mut received)
                .await
                .expect("peer must receive");
            assert_that!(&received[..], eq(b"PING\r\n".as_slice()));
        });
    }

    #[rstest]
    fn reply_reader_decodes_simple_bulk_and_arrays() {
        runtime().block_on(async {
            let (mut client, server) = tokio::io::duplex(256);
            tokio::io::AsyncWriteExt::write_all(
                &mut client,
                b"+PONG\r\n*3\r\n$5\r\nabcde\r\n$5\r\nSYNC7\r\n:3\r\n",
            )
            .await
            .expect("write must pass");
            drop(client);

            let mut server = server;
            let mut reader = ReplyReader::new();
            let pong = reader.read_reply(&mut server).await.expect("reply must parse");
            assert_that!(&pong, eq(&RespValue::Simple("PONG".to_owned())));

            let greeting = reader.read_reply(&mut server).await.expect("reply must parse");
            let RespValue::Array(members) = greeting else {
                panic!("expected array reply");
            };
            assert_that!(members.len(), eq(3_usize));
            assert_that!(&members[2], eq(&RespValue::Integer(3)));
        });
    }

    #[rstest]
    fn reply_reader_keeps_trailing_bytes_for_prefix_chaining() {
        runtime().block_on(async {
            let (mut client, server) = tokio::io::duplex(256);
            tokio::io::AsyncWriteExt::write_all(&mut client, b"+OK\r\nTRAILER")
                .await
                .expect("write must pass");
            drop(client);

            let mut server = server;
            let mut reader = ReplyReader::new();
            let _ = reader.read_reply(&mut server).await.expect("reply must parse");
            assert_that!(reader.take_buffered(), eq(b"TRAILER".to_vec()));
        });
    }

    #[rstest]
    fn snapshot_reader_decodes_body_from_prefix_and_socket() {
        runtime().block_on(async {
            let mut stream_bytes = encode_header(&[]);
            stream_bytes.extend_from_slice(&encode_entry(&record(0, b"k1", b"v1")));
            stream_bytes.extend_from_slice(&encode_entry(&record(1, b"k2", b"v2")));
            stream_bytes.extend_from_slice(&encode_eof());
            stream_bytes.extend_from_slice(b"tail-bytes");

            // Split the wire bytes between the parsed prefix and the socket.
            let (prefix, socket_bytes) = stream_bytes.split_at(10);
            let (mut client, server) = tokio::io::duplex(1024);
            tokio::io::AsyncWriteExt::write_all(&mut client, socket_bytes)
                .await
                .expect("write must pass");
            drop(client);

            let mut server = server;
            let mut reader = SnapshotStreamReader::new(prefix.to_vec());
            let mut keys = Vec::new();
            while let Some(decoded) = reader
                .next_record(&mut server)
                .await
                .expect("stream must decode")
            {
                keys.push(decoded.key);
            }
            assert_that!(keys.len(), eq(2_usize));
            assert_that!(reader.keys_loaded(), eq(2_u64));
            assert_that!(reader.leftover(), eq(b"tail-bytes".as_slice()));
        });
    }

    #[rstest]
    fn snapshot_reader_enforces_declared_size() {
        runtime().block_on(async {
            let mut stream_bytes = encode_header(&[]);
            stream_bytes.extend_from_slice(&encode_entry(&record(0, b"k", b"v")));
            stream_bytes.extend_from_slice(&encode_eof());
            let body_len = u64::try_from(stream_bytes.len()).expect("length fits");

            let (mut client, server) = tokio::io::duplex(1024);
            tokio::io::AsyncWriteExt::write_all(&mut client, &stream_bytes)
                .await
                .expect("write must pass");
            drop(client);

            let mut server = server;
            let mut reader = SnapshotStreamReader::new(Vec::new());
            reader.set_limit(body_len);
            while reader
                .next_record(&mut server)
                .await
                .expect("stream must decode")
                .is_some()
            {}
            assert_that!(reader.bytes_consumed(), eq(body_len));
        });
    }

    #[rstest]
    fn read_exact_chained_pulls_token_across_leftover_and_socket() {
        runtime().block_on(async {
            let mut stream_bytes = encode_header(&[]);
            stream_bytes.extend_from_slice(&encode_eof());
            stream_bytes.extend_from_slice(b"0123");

            let (mut client, server) = tokio::io::duplex(1024);
            tokio::io::AsyncWriteExt::write_all(&mut client, &stream_bytes)
                .await
                .expect("write must pass");
            tokio::io::AsyncWriteExt::write_all(&mut client, b"456789")
                .await
                .expect("write must pass");
            drop(client);

            let mut server = server;
            let mut reader = SnapshotStreamReader::new(Vec::new());
            let end = reader
                .next_record(&mut server)
                .await
                .expect("stream must decode");
            assert_that!(end, eq(None));

            let token = reader
                .read_exact_chained(&mut server, 10)
                .await
                .expect("token must arrive");
            assert_that!(&token, eq(&b"0123456789".to_vec()));
        });
    }
}
