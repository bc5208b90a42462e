//! Binary RDB stream codec, saver, and loader.
//!
//! One stream is: header (magic, version, script corpus), a sequence of entry
//! records, and an end-of-body opcode. A legacy snapshot holds every shard's
//! entries in one stream; a per-shard (`.dfs`) snapshot holds one shard's
//! entries and an identical header. Replication reuses the record codec over
//! sockets, so the incremental decode helpers are exposed alongside the
//! file-oriented saver/loader.

use std::collections::HashMap;
use std::io::{Read, Write};

use darter_common::error::{DarterError, DarterResult};
use darter_core::db_slice::{DbSlice, SliceRecord};

/// Fixed magic marker at the beginning of every snapshot stream.
pub const RDB_MAGIC: &[u8; 8] = b"DARTRDB1";
/// Current stream format version.
pub const RDB_VERSION: u16 = 2;

/// Record opcode introducing one keyspace entry.
const OPCODE_ENTRY: u8 = 0x01;
/// Record opcode terminating the body.
const OPCODE_EOF: u8 = 0xFF;

/// Value-type histogram accumulated while serializing one snapshot body.
pub type RdbTypeFreqMap = HashMap<String, u64>;

/// Events produced by incremental body decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BodyEvent {
    /// One decoded keyspace entry.
    Entry(SliceRecord),
    /// End of body reached.
    Eof,
}

fn stream_error(message: impl Into<String>) -> DarterError {
    DarterError::Protocol(format!("rdb stream error: {}", message.into()))
}

/// Encodes the stream header including the script corpus.
#[must_use]
pub fn encode_header(scripts: &[String]) -> Vec<u8> {
    let mut output = Vec::new();
    output.extend_from_slice(RDB_MAGIC);
    output.extend_from_slice(&RDB_VERSION.to_le_bytes());
    output.extend_from_slice(&u32::try_from(scripts.len()).unwrap_or(u32::MAX).to_le_bytes());
    for script in scripts {
        let bytes = script.as_bytes();
        output.extend_from_slice(&u32::try_from(bytes.len()).unwrap_or(u32::MAX).to_le_bytes());
        output.extend_from_slice(bytes);
    }
    output
}

/// Encodes one entry record.
#[must_use]
pub fn encode_entry(record: &SliceRecord) -> Vec<u8> {
    let mut output = Vec::with_capacity(16 + record.key.len() + record.value.len());
    output.push(OPCODE_ENTRY);
    output.extend_from_slice(&record.db.to_le_bytes());
    match record.expire_at_ms {
        Some(deadline) => {
            output.push(1);
            output.extend_from_slice(&deadline.to_le_bytes());
        }
        None => output.push(0),
    }
    output.extend_from_slice(&u32::try_from(record.key.len()).unwrap_or(u32::MAX).to_le_bytes());
    output.extend_from_slice(&record.key);
    output.extend_from_slice(
        &u32::try_from(record.value.len())
            .unwrap_or(u32::MAX)
            .to_le_bytes(),
    );
    output.extend_from_slice(&record.value);
    output
}

/// Encodes the end-of-body opcode.
#[must_use]
pub fn encode_eof() -> Vec<u8> {
    vec![OPCODE_EOF]
}

/// Attempts to decode the header at the start of `input`.
///
/// Returns the script corpus and consumed byte count, or `None` when more
/// bytes are needed.
///
/// # Errors
///
/// Returns `DarterError::Protocol` on magic or version mismatch.
#[allow(clippy::type_complexity)]
pub fn try_decode_header(input: &[u8]) -> DarterResult<Option<(Vec<String>, usize)>> {
    let mut cursor = Cursor::new(input);
    let Some(magic) = cursor.try_read_slice(RDB_MAGIC.len()) else {
        return Ok(None);
    };
    if magic != RDB_MAGIC {
        return Err(stream_error("invalid magic"));
    }
    let Some(version) = cursor.try_read_u16() else {
        return Ok(None);
    };
    if version != RDB_VERSION {
        return Err(stream_error(format!("unsupported version {version}")));
    }
    let Some(script_count) = cursor.try_read_u32() else {
        return Ok(None);
    };

    let mut scripts = Vec::with_capacity(script_count as usize);
    for _ in 0..script_count {
        let Some(len) = cursor.try_read_u32() else {
            return Ok(None);
        };
        let Some(bytes) = cursor.try_read_slice(len as usize) else {
            return Ok(None);
        };
        let script = String::from_utf8(bytes.to_vec())
            .map_err(|_| stream_error("script body is not valid UTF-8"))?;
        scripts.push(script);
    }
    Ok(Some((scripts, cursor.consumed())))
}

/// Attempts to decode one body record at the start of `input`.
///
/// Returns the event and consumed byte count, or `None` when more bytes are
/// needed.
///
/// # Errors
///
/// Returns `DarterError::Protocol` on an unknown opcode or malformed record.
pub fn try_decode_body_event(input: &[u8]) -> DarterResult<Option<(BodyEvent, usize)>> {
    let mut cursor = Cursor::new(input);
    let Some(opcode) = cursor.try_read_u8() else {
        return Ok(None);
    };
    match opcode {
        OPCODE_EOF => Ok(Some((BodyEvent::Eof, cursor.consumed()))),
        OPCODE_ENTRY => {
            let Some(db) = cursor.try_read_u16() else {
                return Ok(None);
            };
            let Some(expire_flag) = cursor.try_read_u8() else {
                return Ok(None);
            };
            let expire_at_ms = match expire_flag {
                0 => None,
                1 => {
                    let Some(deadline) = cursor.try_read_u64() else {
                        return Ok(None);
                    };
                    Some(deadline)
                }
                other => return Err(stream_error(format!("invalid expire flag {other}"))),
            };
            let Some(key_len) = cursor.try_read_u32() else {
                return Ok(None);
            };
            let Some(key) = cursor.try_read_slice(key_len as usize) else {
                return Ok(None);
            };
            let key = key.to_vec();
            let Some(value_len) = cursor.try_read_u32() else {
                return Ok(None);
            };
            let Some(value) = cursor.try_read_slice(value_len as usize) else {
                return Ok(None);
            };
            let record = SliceRecord {
                db,
                key,
                value: value.to_vec(),
                expire_at_ms,
            };
            Ok(Some((BodyEvent::Entry(record), cursor.consumed())))
        }
        other => Err(stream_error(format!("unknown record opcode {other:#04x}"))),
    }
}

/// Serializes one snapshot stream into a byte sink.
///
/// `single_shard` marks per-shard (`.dfs`) streams; a legacy stream instead
/// accumulates captures from every shard before the body is written.
#[derive(Debug)]
pub struct RdbSaver<W: Write> {
    sink: W,
    single_shard: bool,
    captured: Vec<SliceRecord>,
    header_written: bool,
}

impl<W: Write> RdbSaver<W> {
    /// Creates a saver over one sink.
    #[must_use]
    pub fn new(sink: W, single_shard: bool) -> Self {
        Self {
            sink,
            single_shard,
            captured: Vec::new(),
            header_written: false,
        }
    }

    /// Whether this saver serializes exactly one shard's entries.
    #[must_use]
    pub fn is_single_shard(&self) -> bool {
        self.single_shard
    }

    /// Writes the stream header with the script corpus.
    ///
    /// # Errors
    ///
    /// Returns `DarterError::Io` on sink failure.
    pub fn save_header(&mut self, scripts: &[String]) -> DarterResult<()> {
        self.sink
            .write_all(&encode_header(scripts))
            .map_err(|error| DarterError::io(&error))?;
        self.header_written = true;
        Ok(())
    }

    /// Captures one shard's consistent cut.
    ///
    /// Runs inside that shard's hop, so the capture is exactly the entries
    /// committed before the snapshot transaction on that shard. Entries
    /// already past their deadline are excluded.
    pub fn start_snapshot_in_shard(&mut self, slice: &DbSlice, now_ms: u64) {
        self.captured.extend(slice.capture_records(now_ms));
    }

    /// Adds already-captured records to the pending body.
    ///
    /// Replication streaming captures shard cuts on their owning threads and
    /// hands the records to the flow socket's saver through this.
    pub fn capture(&mut self, records: Vec<SliceRecord>) {
        self.captured.extend(records);
    }

    /// Number of captured entries awaiting serialization.
    #[must_use]
    pub fn captured_len(&self) -> usize {
        self.captured.len()
    }

    /// Serializes the captured entries and the end-of-body opcode, updating
    /// the value-type histogram.
    ///
    /// # Errors
    ///
    /// Returns `DarterError::InvalidState` when the header was not written,
    /// or `DarterError::Io` on sink failure.
    pub fn save_body(&mut self, freq_map: &mut RdbTypeFreqMap) -> DarterResult<()> {
        if !self.header_written {
            return Err(DarterError::InvalidState(
                "rdb body cannot precede its header",
            ));
        }
        for record in self.captured.drain(..) {
            let encoded = encode_entry(&record);
            *freq_map.entry("string".to_owned()).or_insert(0) += 1;
            if let Err(error) = self.sink.write_all(&encoded) {
                return Err(DarterError::io(&error));
            }
        }
        self.sink
            .write_all(&encode_eof())
            .map_err(|error| DarterError::io(&error))?;
        self.sink.flush().map_err(|error| DarterError::io(&error))
    }

    /// Consumes the saver and returns its sink.
    pub fn into_sink(self) -> W {
        self.sink
    }
}

/// Statistics reported by one load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadStats {
    /// Entries decoded from the body.
    pub keys_loaded: u64,
    /// Total bytes consumed from the source.
    pub bytes_read: u64,
}

/// Streaming snapshot reader.
///
/// Used for boot-time file loads and for legacy full-sync bodies, where the
/// stream continues past the snapshot; bytes read beyond the end-of-body
/// opcode stay available through [`RdbLoader::leftover`].
#[derive(Debug)]
pub struct RdbLoader {
    source_limit: u64,
    scripts: Vec<String>,
    leftover: Vec<u8>,
    stats: LoadStats,
}

impl Default for RdbLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl RdbLoader {
    /// Creates a loader with no source limit.
    #[must_use]
    pub fn new() -> Self {
        Self {
            source_limit: u64::MAX,
            scripts: Vec::new(),
            leftover: Vec::new(),
            stats: LoadStats::default(),
        }
    }

    /// Caps the number of bytes the loader may consume from the source.
    ///
    /// Disk-based replication declares the exact snapshot size up front; the
    /// loader then refuses to read past it.
    pub fn set_source_limit(&mut self, limit: u64) {
        self.source_limit = limit;
    }

    /// Script corpus recovered from the header.
    #[must_use]
    pub fn scripts(&self) -> &[String] {
        &self.scripts
    }

    /// Bytes read from the source but not consumed by the snapshot.
    #[must_use]
    pub fn leftover(&self) -> &[u8] {
        &self.leftover
    }

    /// Load statistics.
    #[must_use]
    pub fn stats(&self) -> LoadStats {
        self.stats
    }

    /// Decodes one snapshot stream, handing each entry to `sink`.
    ///
    /// # Errors
    ///
    /// Returns `DarterError::Protocol` for malformed streams and truncation,
    /// `DarterError::Io` for source failures.
    pub fn load<R: Read, F: FnMut(SliceRecord)>(
        &mut self,
        mut reader: R,
        mut sink: F,
    ) -> DarterResult<()> {
        let mut buffer: Vec<u8> = Vec::with_capacity(16 * 1024);
        let mut header_done = false;
        let mut chunk = [0_u8; 16 * 1024];

        loop {
            if !header_done {
                if let Some((scripts, consumed)) = try_decode_header(&buffer)? {
                    self.scripts = scripts;
                    let _ = buffer.drain(..consumed);
                    header_done = true;
                }
            }
            if header_done {
                loop {
                    match try_decode_body_event(&buffer)? {
                        Some((BodyEvent::Entry(record), consumed)) => {
                            let _ = buffer.drain(..consumed);
                            self.stats.keys_loaded += 1;
                            sink(record);
                        }
                        Some((BodyEvent::Eof, consumed)) => {
                            let _ = buffer.drain(..consumed);
                            self.leftover = buffer;
                            return Ok(());
                        }
                        None => break,
                    }
                }
            }

            let budget = self.source_limit.saturating_sub(self.stats.bytes_read);
            if budget == 0 {
                return Err(stream_error("source limit reached before end of body"));
            }
            let want = usize::try_from(budget.min(chunk.len() as u64)).unwrap_or(chunk.len());
            let read_len = reader
                .read(&mut chunk[..want])
                .map_err(|error| DarterError::io(&error))?;
            if read_len == 0 {
                return Err(stream_error("unexpected end of stream"));
            }
            self.stats.bytes_read += read_len as u64;
            buffer.extend_from_slice(&chunk[..read_len]);
        }
    }
}

/// Forward-only reader over a borrowed byte slice.
#[derive(Debug)]
struct Cursor<'a> {
    input: &'a [u8],
    offset: usize,
}

impl<'a> Cursor<'a> {
    fn new(input: &'a [u8]) -> Self {
        Self { input, offset: 0 }
    }

    fn consumed(&self) -> usize {
        self.offset
    }

    fn try_read_slice(&mut self, len: usize) -> Option<&'a [u8]> {
        let end = self.offset.checked_add(len)?;
        if end > self.input.len() {
            return None;
        }
        let bytes = &self.input[self.offset..end];
        self.offset = end;
        Some(bytes)
    }

    fn try_read_u8(&mut self) -> Option<u8> {
        self.try_read_slice(1).map(|bytes| bytes[0])
    }

    fn try_read_u16(&mut self) -> Option<u16> {
        self.try_read_slice(2).map(|bytes| {
            let mut array = [0_u8; 2];
            array.copy_from_slice(bytes);
            u16::from_le_bytes(array)
        })
    }

    fn try_read_u32(&mut self) -> Option<u32> {
        self.try_read_slice(4).map(|bytes| {
            let mut array = [0_u8; 4];
            array.copy_from_slice(bytes);
            u32::from_le_bytes(array)
        })
    }

    fn try_read_u64(&mut self) -> Option<u64> {
        self.try_read_slice(8).map(|bytes| {
            let mut array = [0_u8; 8];
            array.copy_from_slice(bytes);
            u64::from_le_bytes(array)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{RdbLoader, RdbSaver, RdbTypeFreqMap};
    use darter_core::db_slice::{DbSlice, SliceEntry};
    use googletest::prelude::*;
    use rstest::rstest;

    fn populated_slice() -> DbSlice {
        let mut slice = DbSlice::default();
        slice.set(
            0,
            b"user:1".to_vec(),
            SliceEntry {
                value: b"alice".to_vec(),
                expire_at_ms: None,
            },
        );
        slice.set(
            2,
            b"cache:item".to_vec(),
            SliceEntry {
                value: b"payload".to_vec(),
                expire_at_ms: Some(1_700_000_123_000),
            },
        );
        slice
    }

    #[rstest]
    fn save_then_load_round_trips_entries_and_scripts() {
        let scripts = vec!["return 1".to_owned()];
        let mut saver = RdbSaver::new(Vec::new(), false);
        saver.save_header(&scripts).expect("header must write");
        saver.start_snapshot_in_shard(&populated_slice(), 0);
        let mut freq_map = RdbTypeFreqMap::new();
        saver.save_body(&mut freq_map).expect("body must write");
        assert_that!(freq_map.get("string"), eq(Some(&2_u64)));

        let stream = saver.into_sink();
        let mut loader = RdbLoader::new();
        let mut restored = DbSlice::default();
        loader
            .load(stream.as_slice(), |record| restored.import_record(record))
            .expect("stream must load");

        assert_that!(loader.scripts(), eq(&scripts[..]));
        assert_that!(loader.stats().keys_loaded, eq(2_u64));
        assert_that!(restored.db_size(0), eq(1_u64));
        assert_that!(restored.db_size(2), eq(1_u64));
        let entry = restored
            .get(2, b"cache:item", 0)
            .expect("entry must be restored");
        assert_that!(entry.expire_at_ms, eq(Some(1_700_000_123_000_u64)));
    }

    #[rstest]
    fn loader_preserves_bytes_after_end_of_body() {
        let mut saver = RdbSaver::new(Vec::new(), true);
        saver.save_header(&[]).expect("header must write");
        saver.start_snapshot_in_shard(&populated_slice(), 0);
        let mut freq_map = RdbTypeFreqMap::new();
        saver.save_body(&mut freq_map).expect("body must write");

        let mut stream = saver.into_sink();
        stream.extend_from_slice(b"0123456789");

        let mut loader = RdbLoader::new();
        loader
            .load(stream.as_slice(), |_| {})
            .expect("stream must load");
        assert_that!(loader.leftover(), eq(b"0123456789".as_slice()));
    }

    #[rstest]
    fn truncated_stream_is_rejected() {
        let mut saver = RdbSaver::new(Vec::new(), true);
        saver.save_header(&[]).expect("header must write");
        saver.start_snapshot_in_shard(&populated_slice(), 0);
        let mut freq_map = RdbTypeFreqMap::new();
        saver.save_body(&mut freq_map).expect("body must write");
        let mut stream = saver.into_sink();
        let _ = stream.pop();
        stream.truncate(stream.len().saturating_sub(4));

        let mut loader = RdbLoader::new();
        let result = loader.load(stream.as_slice(), |_| {});
        assert_that!(result.is_err(), eq(true));
    }

    #[rstest]
    fn source_limit_stops_runaway_reads() {
        let mut saver = RdbSaver::new(Vec::new(), true);
        saver.save_header(&[]).expect("header must write");
        saver.start_snapshot_in_shard(&populated_slice(), 0);
        let mut freq_map = RdbTypeFreqMap::new();
        saver.save_body(&mut freq_map).expect("body must write");
        let stream = saver.into_sink();

        let mut strict = RdbLoader::new();
        strict.set_source_limit(u64::try_from(stream.len()).unwrap_or(u64::MAX));
        strict
            .load(stream.as_slice(), |_| {})
            .expect("exact limit must load");

        let mut starved = RdbLoader::new();
        starved.set_source_limit(8);
        assert_that!(starved.load(stream.as_slice(), |_| {}).is_err(), eq(true));
    }

    #[rstest]
    fn body_before_header_is_an_invalid_state() {
        let mut saver = RdbSaver::new(Vec::new(), true);
        let mut freq_map = RdbTypeFreqMap::new();
        assert_that!(saver.save_body(&mut freq_map).is_err(), eq(true));
    }
}
