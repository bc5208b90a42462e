//! Shard-local execution of data-plane commands against one `DbSlice`.
//!
//! Everything here runs inside a shard hop: single-threaded, no suspension.

use darter_common::ids::DbIndex;

use crate::command::{CommandFrame, CommandReply};
use crate::db_slice::{DbSlice, SliceEntry};

/// Result of executing one command fragment on a shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardExecution {
    /// Protocol-neutral reply for this fragment.
    pub reply: CommandReply,
    /// Whether keyspace state changed (drives journaling).
    pub mutated: bool,
}

impl ShardExecution {
    fn read(reply: CommandReply) -> Self {
        Self {
            reply,
            mutated: false,
        }
    }

    fn write(reply: CommandReply) -> Self {
        Self {
            reply,
            mutated: true,
        }
    }
}

const INTEGER_ERR: &str = "value is not an integer or out of range";
const SYNTAX_ERR: &str = "syntax error";

/// Executes one data command fragment against a slice.
///
/// Unknown names yield an `unknown command` error reply; the registry gates
/// names before scheduling, so reaching that path indicates a routing bug
/// rather than a client mistake.
#[must_use]
pub fn execute_on_slice(
    slice: &mut DbSlice,
    db: DbIndex,
    frame: &CommandFrame,
    now_ms: u64,
) -> ShardExecution {
    match frame.name.as_str() {
        "GET" => execute_get(slice, db, frame, now_ms),
        "SET" => execute_set(slice, db, frame, now_ms),
        "SETEX" => execute_setex(slice, db, frame, now_ms),
        "GETSET" => execute_getset(slice, db, frame, now_ms),
        "APPEND" => execute_append(slice, db, frame, now_ms),
        "STRLEN" => execute_strlen(slice, db, frame, now_ms),
        "TYPE" => execute_type(slice, db, frame, now_ms),
        "DEL" => execute_del(slice, db, frame, now_ms),
        "EXISTS" => execute_exists(slice, db, frame, now_ms),
        "EXPIRE" => execute_expire(slice, db, frame, now_ms, 1_000),
        "PEXPIRE" => execute_expire(slice, db, frame, now_ms, 1),
        "TTL" => execute_ttl(slice, db, frame, now_ms, 1_000),
        "PTTL" => execute_ttl(slice, db, frame, now_ms, 1),
        "PERSIST" => execute_persist(slice, db, frame, now_ms),
        "INCR" => execute_incr_by(slice, db, frame, now_ms, 1),
        "DECR" => execute_incr_by(slice, db, frame, now_ms, -1),
        "INCRBY" => execute_incr_by_arg(slice, db, frame, now_ms, false),
        "DECRBY" => execute_incr_by_arg(slice, db, frame, now_ms, true),
        "MGET" => execute_mget(slice, db, frame, now_ms),
        "MSET" => execute_mset(slice, db, frame),
        _ => ShardExecution::read(CommandReply::Error(format!(
            "unknown command '{}'",
            frame.name
        ))),
    }
}

fn execute_get(
    slice: &mut DbSlice,
    db: DbIndex,
    frame: &CommandFrame,
    now_ms: u64,
) -> ShardExecution {
    let Some(key) = frame.args.first() else {
        return ShardExecution::read(CommandReply::wrong_arity("GET"));
    };
    let reply = slice
        .get(db, key, now_ms)
        .map_or(CommandReply::Null, |entry| {
            CommandReply::BulkString(entry.value.clone())
        });
    ShardExecution::read(reply)
}

fn execute_set(
    slice: &mut DbSlice,
    db: DbIndex,
    frame: &CommandFrame,
    now_ms: u64,
) -> ShardExecution {
    if frame.args.len() < 2 {
        return ShardExecution::read(CommandReply::wrong_arity("SET"));
    }
    let key = frame.args[0].clone();
    let value = frame.args[1].clone();

    let mut expire_at_ms = None;
    let mut if_missing = false;
    let mut if_exists = false;
    let mut option_index = 2;
    while option_index < frame.args.len() {
        let option = frame.args[option_index].as_slice();
        if option.eq_ignore_ascii_case(b"NX") {
            if_missing = true;
            option_index += 1;
        } else if option.eq_ignore_ascii_case(b"XX") {
            if_exists = true;
            option_index += 1;
        } else if option.eq_ignore_ascii_case(b"EX") || option.eq_ignore_ascii_case(b"PX") {
            let unit_ms: u64 = if option.eq_ignore_ascii_case(b"EX") {
                1_000
            } else {
                1
            };
            let Some(amount) = frame
                .args
                .get(option_index + 1)
                .and_then(|raw| std::str::from_utf8(raw).ok())
                .and_then(|text| text.parse::<u64>().ok())
                .filter(|amount| *amount > 0)
            else {
                return ShardExecution::read(CommandReply::Error(INTEGER_ERR.to_owned()));
            };
            expire_at_ms = Some(now_ms.saturating_add(amount.saturating_mul(unit_ms)));
            option_index += 2;
        } else {
            return ShardExecution::read(CommandReply::Error(SYNTAX_ERR.to_owned()));
        }
    }
    if if_missing && if_exists {
        return ShardExecution::read(CommandReply::Error(SYNTAX_ERR.to_owned()));
    }

    let exists = slice.get(db, &key, now_ms).is_some();
    if (if_missing && exists) || (if_exists && !exists) {
        return ShardExecution::read(CommandReply::Null);
    }

    slice.set(
        db,
        key,
        SliceEntry {
            value,
            expire_at_ms,
        },
    );
    ShardExecution::write(CommandReply::ok())
}

fn execute_setex(
    slice: &mut DbSlice,
    db: DbIndex,
    frame: &CommandFrame,
    now_ms: u64,
) -> ShardExecution {
    if frame.args.len() != 3 {
        return ShardExecution::read(CommandReply::wrong_arity("SETEX"));
    }
    let Some(seconds) = frame
        .arg_str(1)
        .and_then(|text| text.parse::<u64>().ok())
        .filter(|seconds| *seconds > 0)
    else {
        return ShardExecution::read(CommandReply::Error(INTEGER_ERR.to_owned()));
    };

    slice.set(
        db,
        frame.args[0].clone(),
        SliceEntry {
            value: frame.args[2].clone(),
            expire_at_ms: Some(now_ms.saturating_add(seconds.saturating_mul(1_000))),
        },
    );
    ShardExecution::write(CommandReply::ok())
}

fn execute_getset(
    slice: &mut DbSlice,
    db: DbIndex,
    frame: &CommandFrame,
    now_ms: u64,
) -> ShardExecution {
    if frame.args.len() != 2 {
        return ShardExecution::read(CommandReply::wrong_arity("GETSET"));
    }
    let previous = slice
        .get(db, &frame.args[0], now_ms)
        .map(|entry| entry.value.clone());
    slice.set(
        db,
        frame.args[0].clone(),
        SliceEntry {
            value: frame.args[1].clone(),
            expire_at_ms: None,
        },
    );
    ShardExecution::write(previous.map_or(CommandReply::Null, CommandReply::BulkString))
}

fn execute_append(
    slice: &mut DbSlice,
    db: DbIndex,
    frame: &CommandFrame,
    now_ms: u64,
) -> ShardExecution {
    if frame.args.len() != 2 {
        return ShardExecution::read(CommandReply::wrong_arity("APPEND"));
    }
    if let Some(entry) = slice.get_mut(db, &frame.args[0], now_ms) {
        entry.value.extend_from_slice(&frame.args[1]);
        let len = i64::try_from(entry.value.len()).unwrap_or(i64::MAX);
        return ShardExecution::write(CommandReply::Integer(len));
    }

    let len = i64::try_from(frame.args[1].len()).unwrap_or(i64::MAX);
    slice.set(
        db,
        frame.args[0].clone(),
        SliceEntry {
            value: frame.args[1].clone(),
            expire_at_ms: None,
        },
    );
    ShardExecution::write(CommandReply::Integer(len))
}

fn execute_strlen(
    slice: &mut DbSlice,
    db: DbIndex,
    frame: &CommandFrame,
    now_ms: u64,
) -> ShardExecution {
    let Some(key) = frame.args.first() else {
        return ShardExecution::read(CommandReply::wrong_arity("STRLEN"));
    };
    let len = slice.get(db, key, now_ms).map_or(0, |entry| {
        i64::try_from(entry.value.len()).unwrap_or(i64::MAX)
    });
    ShardExecution::read(CommandReply::Integer(len))
}

fn execute_type(
    slice: &mut DbSlice,
    db: DbIndex,
    frame: &CommandFrame,
    now_ms: u64,
) -> ShardExecution {
    let Some(key) = frame.args.first() else {
        return ShardExecution::read(CommandReply::wrong_arity("TYPE"));
    };
    let label = if slice.get(db, key, now_ms).is_some() {
        "string"
    } else {
        "none"
    };
    ShardExecution::read(CommandReply::SimpleString(label.to_owned()))
}

fn execute_del(
    slice: &mut DbSlice,
    db: DbIndex,
    frame: &CommandFrame,
    now_ms: u64,
) -> ShardExecution {
    if frame.args.is_empty() {
        return ShardExecution::read(CommandReply::wrong_arity("DEL"));
    }
    let mut removed = 0_i64;
    for key in &frame.args {
        if slice.remove(db, key, now_ms) {
            removed += 1;
        }
    }
    ShardExecution {
        reply: CommandReply::Integer(removed),
        mutated: removed > 0,
    }
}

fn execute_exists(
    slice: &mut DbSlice,
    db: DbIndex,
    frame: &CommandFrame,
    now_ms: u64,
) -> ShardExecution {
    if frame.args.is_empty() {
        return ShardExecution::read(CommandReply::wrong_arity("EXISTS"));
    }
    let mut present = 0_i64;
    for key in &frame.args {
        if slice.get(db, key, now_ms).is_some() {
            present += 1;
        }
    }
    ShardExecution::read(CommandReply::Integer(present))
}

fn execute_expire(
    slice: &mut DbSlice,
    db: DbIndex,
    frame: &CommandFrame,
    now_ms: u64,
    unit_ms: i64,
) -> ShardExecution {
    if frame.args.len() != 2 {
        return ShardExecution::read(CommandReply::wrong_arity(frame.name.as_str()));
    }
    let Some(amount) = frame.arg_str(1).and_then(|text| text.parse::<i64>().ok()) else {
        return ShardExecution::read(CommandReply::Error(INTEGER_ERR.to_owned()));
    };

    if amount <= 0 {
        // Non-positive relative deadlines delete immediately.
        let removed = slice.remove(db, &frame.args[0], now_ms);
        return ShardExecution {
            reply: CommandReply::Integer(i64::from(removed)),
            mutated: removed,
        };
    }

    let deadline =
        now_ms.saturating_add(u64::try_from(amount.saturating_mul(unit_ms)).unwrap_or(u64::MAX));
    match slice.get_mut(db, &frame.args[0], now_ms) {
        Some(entry) => {
            entry.expire_at_ms = Some(deadline);
            ShardExecution::write(CommandReply::Integer(1))
        }
        None => ShardExecution::read(CommandReply::Integer(0)),
    }
}

fn execute_ttl(
    slice: &mut DbSlice,
    db: DbIndex,
    frame: &CommandFrame,
    now_ms: u64,
    unit_ms: u64,
) -> ShardExecution {
    let Some(key) = frame.args.first() else {
        return ShardExecution::read(CommandReply::wrong_arity(frame.name.as_str()));
    };
    let reply = match slice.get(db, key, now_ms) {
        None => CommandReply::Integer(-2),
        Some(entry) => match entry.expire_at_ms {
            None => CommandReply::Integer(-1),
            Some(deadline) => {
                let remaining = deadline.saturating_sub(now_ms) / unit_ms.max(1);
                CommandReply::Integer(i64::try_from(remaining).unwrap_or(i64::MAX))
            }
        },
    };
    ShardExecution::read(reply)
}

fn execute_persist(
    slice: &mut DbSlice,
    db: DbIndex,
    frame: &CommandFrame,
    now_ms: u64,
) -> ShardExecution {
    let Some(key) = frame.args.first() else {
        return ShardExecution::read(CommandReply::wrong_arity("PERSIST"));
    };
    match slice.get_mut(db, key, now_ms) {
        Some(entry) if entry.expire_at_ms.is_some() => {
            entry.expire_at_ms = None;
            ShardExecution::write(CommandReply::Integer(1))
        }
        _ => ShardExecution::read(CommandReply::Integer(0)),
    }
}

fn execute_incr_by_arg(
    slice: &mut DbSlice,
    db: DbIndex,
    frame: &CommandFrame,
    now_ms: u64,
    negate: bool,
) -> ShardExecution {
    if frame.args.len() != 2 {
        return ShardExecution::read(CommandReply::wrong_arity(frame.name.as_str()));
    }
    let Some(amount) = frame.arg_str(1).and_then(|text| text.parse::<i64>().ok()) else {
        return ShardExecution::read(CommandReply::Error(INTEGER_ERR.to_owned()));
    };
    let delta = if negate { amount.wrapping_neg() } else { amount };
    execute_incr_by(slice, db, frame, now_ms, delta)
}

fn execute_incr_by(
    slice: &mut DbSlice,
    db: DbIndex,
    frame: &CommandFrame,
    now_ms: u64,
    delta: i64,
) -> ShardExecution {
    let Some(key) = frame.args.first() else {
        return ShardExecution::read(CommandReply::wrong_arity(frame.name.as_str()));
    };

    let current = match slice.get(db, key, now_ms) {
        None => 0,
        Some(entry) => {
            let Some(value) = std::str::from_utf8(&entry.value)
                .ok()
                .and_then(|text| text.parse::<i64>().ok())
            else {
                return ShardExecution::read(CommandReply::Error(INTEGER_ERR.to_owned()));
            };
            value
        }
    };
    let Some(next) = current.checked_add(delta) else {
        return ShardExecution::read(CommandReply::Error(
            "increment or decrement would overflow".to_owned(),
        ));
    };

    let expire_at_ms = slice
        .get(db, key, now_ms)
        .and_then(|entry| entry.expire_at_ms);
    slice.set(
        db,
        key.clone(),
        SliceEntry {
            value: next.to_string().into_bytes(),
            expire_at_ms,
        },
    );
    ShardExecution::write(CommandReply::Integer(next))
}

fn execute_mget(
    slice: &mut DbSlice,
    db: DbIndex,
    frame: &CommandFrame,
    now_ms: u64,
) -> ShardExecution {
    if frame.args.is_empty() {
        return ShardExecution::read(CommandReply::wrong_arity("MGET"));
    }
    let replies = frame
        .args
        .iter()
        .map(|key| {
            slice
                .get(db, key, now_ms)
                .map_or(CommandReply::Null, |entry| {
                    CommandReply::BulkString(entry.value.clone())
                })
        })
        .collect();
    ShardExecution::read(CommandReply::Array(replies))
}

fn execute_mset(slice: &mut DbSlice, db: DbIndex, frame: &CommandFrame) -> ShardExecution {
    if frame.args.is_empty() || frame.args.len() % 2 != 0 {
        return ShardExecution::read(CommandReply::wrong_arity("MSET"));
    }
    for pair in frame.args.chunks_exact(2) {
        slice.set(
            db,
            pair[0].clone(),
            SliceEntry {
                value: pair[1].clone(),
                expire_at_ms: None,
            },
        );
    }
    ShardExecution::write(CommandReply::ok())
}
