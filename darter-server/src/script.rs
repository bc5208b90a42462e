//! Script corpus store.
//!
//! The scripting runtime itself lives elsewhere; the server only needs the
//! corpus for snapshot headers and the `SCRIPT LOAD/EXISTS` bookkeeping.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Mutex, PoisonError};

/// Named script bodies keyed by their 40-hex digest.
#[derive(Debug, Default)]
pub struct ScriptMgr {
    scripts: Mutex<HashMap<String, String>>,
}

/// Digests one script body into a stable 40-hex id.
#[must_use]
pub fn script_id(body: &str) -> String {
    let mut front = DefaultHasher::new();
    body.hash(&mut front);
    let mut back = DefaultHasher::new();
    (body, body.len()).hash(&mut back);
    format!("{:016x}{:016x}{:08x}", front.finish(), back.finish(), body.len() as u32)
}

impl ScriptMgr {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.scripts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores one script body and returns its id.
    pub fn load(&self, body: &str) -> String {
        let id = script_id(body);
        let _ = self.lock().insert(id.clone(), body.to_owned());
        id
    }

    /// Whether one id is known.
    #[must_use]
    pub fn exists(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    /// The full corpus, embedded into snapshot headers.
    #[must_use]
    pub fn scripts(&self) -> Vec<String> {
        let mut bodies = self.lock().values().cloned().collect::<Vec<_>>();
        bodies.sort();
        bodies
    }

    /// Restores one body recovered from a snapshot header.
    pub fn restore(&self, body: String) {
        let id = script_id(&body);
        let _ = self.lock().insert(id, body);
    }
}

#[cfg(test)]
mod tests {
    use super::{ScriptMgr, script_id};
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    fn ids_have_replid_shape_and_are_stable() {
        let first = script_id("return 1");
        let second = script_id("return 1");
        assert_that!(first.len(), eq(40_usize));
        assert_that!(&first, eq(&second));
        assert_that!(first == script_id("return 2"), eq(false));
    }

    #[rstest]
    fn load_exists_and_corpus_round_trip() {
        let mgr = ScriptMgr::new();
        let id = mgr.load("return redis.call('GET', KEYS[1])");
        assert_that!(mgr.exists(&id), eq(true));
        assert_that!(mgr.exists("0000000000000000000000000000000000000000"), eq(false));

        let _ = mgr.load("return 1");
        assert_that!(mgr.scripts().len(), eq(2_usize));
    }
}
