//! Incremental RESP request parser.
//!
//! Accepts both `*`-framed multi-bulk requests and inline commands; the latter
//! is how replication peers issue handshake commands (`PING`, `PSYNC ...`)
//! over a fresh connection.

use darter_common::error::{DarterError, DarterResult};

/// Hard cap on one request's element count and bulk sizes.
const MAX_ARRAY_LEN: usize = 1_048_576;
const MAX_BULK_LEN: usize = 512 * 1024 * 1024;

/// Protocol-decoded command representation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCommand {
    /// Command name in canonical uppercase form.
    pub name: String,
    /// Raw argument payload.
    pub args: Vec<Vec<u8>>,
}

/// Streaming parser state for one connection's request byte stream.
#[derive(Debug, Default)]
pub struct RespParser {
    buffer: Vec<u8>,
}

impl RespParser {
    /// Creates an empty parser.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one received chunk to the parse buffer.
    pub fn feed_bytes(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Number of buffered bytes not yet consumed by a complete command.
    #[must_use]
    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }

    /// Attempts to pop one complete command from the buffer.
    ///
    /// Returns `Ok(None)` when more bytes are needed.
    ///
    /// # Errors
    ///
    /// Returns `DarterError::Protocol` when the buffered payload is malformed.
    pub fn try_pop_command(&mut self) -> DarterResult<Option<ParsedCommand>> {
        loop {
            // Skip bare newlines some clients send as keepalive padding.
            while self
                .buffer
                .first()
                .is_some_and(|byte| *byte == b'\r' || *byte == b'\n')
            {
                let _ = self.buffer.remove(0);
            }
            let Some(first) = self.buffer.first() else {
                return Ok(None);
            };

            let parsed = if *first == b'*' {
                self.try_pop_multibulk()?
            } else {
                self.try_pop_inline()?
            };

            let Some((tokens, consumed)) = parsed else {
                return Ok(None);
            };
            let _ = self.buffer.drain(..consumed);

            let mut tokens = tokens.into_iter();
            let Some(name_raw) = tokens.next() else {
                // Whitespace-only inline line; keep scanning.
                continue;
            };
            let name = String::from_utf8(name_raw)
                .map_err(|_| DarterError::Protocol("command name is not valid UTF-8".to_owned()))?
                .to_ascii_uppercase();
            return Ok(Some(ParsedCommand {
                name,
                args: tokens.collect(),
            }));
        }
    }

    #[allow(clippy::type_complexity)]
    fn try_pop_multibulk(&self) -> DarterResult<Option<(Vec<Vec<u8>>, usize)>> {
        let Some((element_count, mut cursor)) = parse_length_line(&self.buffer, b'*')? else {
            return Ok(None);
        };
        if element_count > MAX_ARRAY_LEN {
            return Err(DarterError::Protocol(format!(
                "multibulk length {element_count} exceeds limit"
            )));
        }

        let mut tokens = Vec::with_capacity(element_count);
        for _ in 0..element_count {
            let Some((bulk_len, after_header)) = parse_length_line(&self.buffer[cursor..], b'$')?
            else {
                return Ok(None);
            };
            if bulk_len > MAX_BULK_LEN {
                return Err(DarterError::Protocol(format!(
                    "bulk length {bulk_len} exceeds limit"
                )));
            }
            let payload_start = cursor + after_header;
            let payload_end = payload_start + bulk_len;
            if self.buffer.len() < payload_end + 2 {
                return Ok(None);
            }
            if &self.buffer[payload_end..payload_end + 2] != b"\r\n" {
                return Err(DarterError::Protocol(
                    "bulk payload is missing CRLF terminator".to_owned(),
                ));
            }
            tokens.push(self.buffer[payload_start..payload_end].to_vec());
            cursor = payload_end + 2;
        }
        Ok(Some((tokens, cursor)))
    }

    #[allow(clippy::type_complexity)]
    fn try_pop_inline(&self) -> DarterResult<Option<(Vec<Vec<u8>>, usize)>> {
        let Some(newline_pos) = self.buffer.iter().position(|byte| *byte == b'\n') else {
            return Ok(None);
        };
        let line_end = if newline_pos > 0 && self.buffer[newline_pos - 1] == b'\r' {
            newline_pos - 1
        } else {
            newline_pos
        };
        let tokens = self.buffer[..line_end]
            .split(|byte| byte.is_ascii_whitespace())
            .filter(|token| !token.is_empty())
            .map(<[u8]>::to_vec)
            .collect();
        Ok(Some((tokens, newline_pos + 1)))
    }
}

/// Parses `<prefix><decimal>\r\n` at the start of `input`.
///
/// Returns the decoded length and the number of bytes consumed, or `None`
/// when the line is still incomplete.
fn parse_length_line(input: &[u8], prefix: u8) -> DarterResult<Option<(usize, usize)>> {
    let Some(first) = input.first() else {
        return Ok(None);
    };
    if *first != prefix {
        return Err(DarterError::Protocol(format!(
            "expected '{}' framing byte, found '{}'",
            char::from(prefix),
            char::from(*first)
        )));
    }
    let Some(newline_pos) = input.iter().position(|byte| *byte == b'\n') else {
        return Ok(None);
    };
    if newline_pos < 2 || input[newline_pos - 1] != b'\r' {
        return Err(DarterError::Protocol(
            "length line is missing CRLF terminator".to_owned(),
        ));
    }
    let digits = &input[1..newline_pos - 1];
    let length = std::str::from_utf8(digits)
        .ok()
        .and_then(|text| text.parse::<usize>().ok())
        .ok_or_else(|| DarterError::Protocol("length line is not a decimal integer".to_owned()))?;
    Ok(Some((length, newline_pos + 1)))
}

#[cfg(test)]
mod tests {
    use super::RespParser;
    use darter_common::error::DarterError;
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    fn multibulk_command_parses_across_chunks() {
        let mut parser = RespParser::new();
        parser.feed_bytes(b"*2\r\n$4\r\nECHO\r\n$5\r\nhe");
        assert_that!(
            parser.try_pop_command().expect("prefix must be valid"),
            eq(None)
        );

        parser.feed_bytes(b"llo\r\n");
        let command = parser
            .try_pop_command()
            .expect("complete frame must parse")
            .expect("command must be ready");
        assert_that!(command.name.as_str(), eq("ECHO"));
        assert_that!(&command.args, eq(&vec![b"hello".to_vec()]));
        assert_that!(parser.pending_bytes(), eq(0_usize));
    }

    #[rstest]
    fn inline_command_parses_whitespace_separated_tokens() {
        let mut parser = RespParser::new();
        parser.feed_bytes(b"REPLCONF capa dragonfly\r\n");
        let command = parser
            .try_pop_command()
            .expect("inline line must parse")
            .expect("command must be ready");
        assert_that!(command.name.as_str(), eq("REPLCONF"));
        assert_that!(
            &command.args,
            eq(&vec![b"capa".to_vec(), b"dragonfly".to_vec()])
        );
    }

    #[rstest]
    fn pipelined_commands_pop_in_order() {
        let mut parser = RespParser::new();
        parser.feed_bytes(b"*1\r\n$4\r\nPING\r\n*1\r\n$4\r\nPING\r\n");
        for _ in 0..2 {
            let command = parser
                .try_pop_command()
                .expect("frames must parse")
                .expect("command must be ready");
            assert_that!(command.name.as_str(), eq("PING"));
        }
        assert_that!(parser.try_pop_command().expect("empty is fine"), eq(None));
    }

    #[rstest]
    fn malformed_bulk_length_is_a_protocol_error() {
        let mut parser = RespParser::new();
        parser.feed_bytes(b"*1\r\n$A\r\nPING\r\n");
        let error = parser
            .try_pop_command()
            .expect_err("malformed length must fail");
        let DarterError::Protocol(message) = error else {
            panic!("expected protocol error");
        };
        assert_that!(message.contains("not a decimal integer"), eq(true));
    }

    #[rstest]
    fn name_is_uppercased_and_payload_preserved() {
        let mut parser = RespParser::new();
        parser.feed_bytes(b"*3\r\n$3\r\nset\r\n$1\r\nk\r\n$1\r\nv\r\n");
        let command = parser
            .try_pop_command()
            .expect("frame must parse")
            .expect("command must be ready");
        assert_that!(command.name.as_str(), eq("SET"));
        assert_that!(command.args.len(), eq(2_usize));
    }
}
