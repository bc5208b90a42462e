//! Canonical command frame types.

/// Command payload representation used between facade and coordinator/runtime layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFrame {
    /// Command name in uppercase canonical form (e.g. `SET`, `REPLCONF`).
    pub name: String,
    /// Raw byte arguments preserving wire-level payload.
    pub args: Vec<Vec<u8>>,
}

impl CommandFrame {
    /// Creates a command frame from a command name and argument list.
    #[must_use]
    pub fn new(name: impl Into<String>, args: Vec<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }

    /// Returns one argument decoded as UTF-8 when present and valid.
    #[must_use]
    pub fn arg_str(&self, index: usize) -> Option<&str> {
        self.args
            .get(index)
            .and_then(|raw| std::str::from_utf8(raw).ok())
    }
}

/// Canonical command reply representation.
///
/// The reply enum is kept protocol-neutral. Encoding to RESP happens at the
/// facade boundary, so coordinator/runtime logic stays independent from wire
/// format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandReply {
    /// `+OK` style replies.
    SimpleString(String),
    /// `$<len> ...` style binary-safe payload.
    BulkString(Vec<u8>),
    /// RESP null bulk string (`$-1`).
    Null,
    /// RESP integer reply (`:<n>`).
    Integer(i64),
    /// RESP array reply (`*<n> ...`).
    Array(Vec<CommandReply>),
    /// `-ERR ...` style error.
    Error(String),
}

impl CommandReply {
    /// Builds the ubiquitous `+OK` reply.
    #[must_use]
    pub fn ok() -> Self {
        Self::SimpleString("OK".to_owned())
    }

    /// Builds the standard wrong-arity error for one command.
    #[must_use]
    pub fn wrong_arity(command_name: &str) -> Self {
        Self::Error(format!(
            "wrong number of arguments for '{command_name}' command"
        ))
    }

    /// Encodes the reply into RESP bytes for Redis-compatible clients.
    #[must_use]
    pub fn to_resp_bytes(&self) -> Vec<u8> {
        match self {
            Self::SimpleString(value) => {
                let mut output = Vec::with_capacity(value.len() + 3);
                output.extend_from_slice(b"+");
                output.extend_from_slice(value.as_bytes());
                output.extend_from_slice(b"\r\n");
                output
            }
            Self::BulkString(value) => {
                let mut output = Vec::new();
                output.extend_from_slice(format!("${}\r\n", value.len()).as_bytes());
                output.extend_from_slice(value);
                output.extend_from_slice(b"\r\n");
                output
            }
            Self::Null => b"$-1\r\n".to_vec(),
            Self::Integer(value) => format!(":{value}\r\n").into_bytes(),
            Self::Array(items) => {
                let mut output = format!("*{}\r\n", items.len()).into_bytes();
                for item in items {
                    output.extend_from_slice(&item.to_resp_bytes());
                }
                output
            }
            Self::Error(message) => {
                let mut output = Vec::with_capacity(message.len() + 7);
                output.extend_from_slice(b"-ERR ");
                output.extend_from_slice(message.as_bytes());
                output.extend_from_slice(b"\r\n");
                output
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::CommandReply;
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    fn resp_encoding_covers_reply_shapes() {
        assert_that!(CommandReply::ok().to_resp_bytes(), eq(b"+OK\r\n".to_vec()));
        assert_that!(
            CommandReply::Integer(-3).to_resp_bytes(),
            eq(b":-3\r\n".to_vec())
        );
        assert_that!(CommandReply::Null.to_resp_bytes(), eq(b"$-1\r\n".to_vec()));
        assert_that!(
            CommandReply::BulkString(b"hi".to_vec()).to_resp_bytes(),
            eq(b"$2\r\nhi\r\n".to_vec())
        );
        assert_that!(
            CommandReply::Error("syntax error".to_owned()).to_resp_bytes(),
            eq(b"-ERR syntax error\r\n".to_vec())
        );
    }

    #[rstest]
    fn array_encoding_nests_members() {
        let reply = CommandReply::Array(vec![
            CommandReply::SimpleString("FULL".to_owned()),
            CommandReply::BulkString(b"tok".to_vec()),
        ]);
        assert_that!(
            reply.to_resp_bytes(),
            eq(b"*2\r\n+FULL\r\n$3\r\ntok\r\n".to_vec())
        );
    }
}
