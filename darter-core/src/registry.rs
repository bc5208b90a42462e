//! Command metadata registry and execution-flag bitmask.

use hashbrown::HashMap;

/// Bitmask of execution attributes attached to one command descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandFlags(u32);

impl CommandFlags {
    /// No attributes.
    pub const NONE: Self = Self(0);
    /// Administrative command.
    pub const ADMIN: Self = Self(1);
    /// Mutates keyspace state.
    pub const WRITE: Self = Self(1 << 1);
    /// Reads keyspace state only.
    pub const READONLY: Self = Self(1 << 2);
    /// Allowed while the global state is `Loading`.
    pub const LOADING: Self = Self(1 << 3);
    /// Constant-time command, safe on latency-sensitive paths.
    pub const FAST: Self = Self(1 << 4);
    /// Not callable from scripts.
    pub const NOSCRIPT: Self = Self(1 << 5);
    /// Participates on every shard and serializes with all transactions.
    pub const GLOBAL_TRANS: Self = Self(1 << 6);

    /// Returns whether all bits of `other` are present.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for CommandFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Static descriptor for one command accepted by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandId {
    /// Canonical uppercase command name.
    pub name: &'static str,
    /// Execution attributes.
    pub flags: CommandFlags,
    /// Redis-style arity: positive is exact token count (name included),
    /// negative is the minimum token count.
    pub arity: i16,
}

impl CommandId {
    /// Creates a command descriptor.
    #[must_use]
    pub const fn new(name: &'static str, flags: CommandFlags, arity: i16) -> Self {
        Self { name, flags, arity }
    }

    /// Returns whether `argc` tokens (command name included) satisfy arity.
    #[must_use]
    pub fn accepts_argc(&self, argc: usize) -> bool {
        let argc = i64::try_from(argc).unwrap_or(i64::MAX);
        if self.arity >= 0 {
            argc == i64::from(self.arity)
        } else {
            argc >= i64::from(-self.arity)
        }
    }

    /// Returns whether the command may run while the instance is loading.
    #[must_use]
    pub fn allowed_during_loading(&self) -> bool {
        self.flags.contains(CommandFlags::LOADING)
    }

    /// Returns whether the command requires a global transaction barrier.
    #[must_use]
    pub fn is_global_trans(&self) -> bool {
        self.flags.contains(CommandFlags::GLOBAL_TRANS)
    }
}

/// Name-indexed command table assembled by the server families at startup.
#[derive(Debug, Default)]
pub struct CommandRegistry {
    commands: HashMap<&'static str, CommandId>,
}

impl CommandRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one command descriptor, replacing any previous registration.
    pub fn register(&mut self, id: CommandId) {
        let _ = self.commands.insert(id.name, id);
    }

    /// Looks up one descriptor by canonical uppercase name.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<&CommandId> {
        self.commands.get(name)
    }

    /// Number of registered commands.
    #[must_use]
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

/// Registers the data-plane commands served by shard dispatch.
pub fn register_data_commands(registry: &mut CommandRegistry) {
    let write = CommandFlags::WRITE;
    let fast_write = CommandFlags::WRITE | CommandFlags::FAST;
    let fast_read = CommandFlags::READONLY | CommandFlags::FAST;

    for id in [
        CommandId::new("GET", fast_read, 2),
        CommandId::new("SET", fast_write, -3),
        CommandId::new("SETEX", write, 4),
        CommandId::new("GETSET", fast_write, 3),
        CommandId::new("APPEND", write, 3),
        CommandId::new("STRLEN", fast_read, 2),
        CommandId::new("TYPE", fast_read, 2),
        CommandId::new("DEL", write, -2),
        CommandId::new("EXISTS", fast_read, -2),
        CommandId::new("EXPIRE", fast_write, 3),
        CommandId::new("PEXPIRE", fast_write, 3),
        CommandId::new("TTL", fast_read, 2),
        CommandId::new("PTTL", fast_read, 2),
        CommandId::new("PERSIST", fast_write, 2),
        CommandId::new("INCR", fast_write, 2),
        CommandId::new("DECR", fast_write, 2),
        CommandId::new("INCRBY", fast_write, 3),
        CommandId::new("DECRBY", fast_write, 3),
        CommandId::new("MGET", fast_read, -2),
        CommandId::new("MSET", write, -3),
        CommandId::new("PING", fast_read | CommandFlags::LOADING, -1),
        CommandId::new("ECHO", fast_read, 2),
        CommandId::new("SELECT", fast_read | CommandFlags::LOADING, 2),
    ] {
        registry.register(id);
    }
}

#[cfg(test)]
mod tests {
    use super::{CommandFlags, CommandId, CommandRegistry, register_data_commands};
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    fn flags_bitmask_composes_and_queries() {
        let flags = CommandFlags::ADMIN | CommandFlags::GLOBAL_TRANS;
        assert_that!(flags.contains(CommandFlags::ADMIN), eq(true));
        assert_that!(flags.contains(CommandFlags::GLOBAL_TRANS), eq(true));
        assert_that!(flags.contains(CommandFlags::WRITE), eq(false));
    }

    #[rstest]
    #[case(2, true)]
    #[case(3, false)]
    fn exact_arity_requires_exact_token_count(#[case] argc: usize, #[case] accepted: bool) {
        let id = CommandId::new("GET", CommandFlags::READONLY, 2);
        assert_that!(id.accepts_argc(argc), eq(accepted));
    }

    #[rstest]
    #[case(2, false)]
    #[case(3, true)]
    #[case(7, true)]
    fn negative_arity_is_a_minimum(#[case] argc: usize, #[case] accepted: bool) {
        let id = CommandId::new("SET", CommandFlags::WRITE, -3);
        assert_that!(id.accepts_argc(argc), eq(accepted));
    }

    #[rstest]
    fn data_command_table_registers_core_verbs() {
        let mut registry = CommandRegistry::new();
        register_data_commands(&mut registry);

        let set = registry.find("SET").expect("SET must be registered");
        assert_that!(set.flags.contains(CommandFlags::WRITE), eq(true));
        assert_that!(registry.find("GET").is_some(), eq(true));
        assert_that!(registry.find("NOSUCH").is_none(), eq(true));
    }
}
