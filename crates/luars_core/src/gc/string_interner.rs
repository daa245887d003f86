use ahash::RandomState;
use std::collections::HashMap;

use crate::gc::gc_id::StringId;
use crate::gc::gc_object::StringSource;

/// Interning table for short strings.
/// - Same content always maps to the same `StringId`
/// - Buckets are keyed by the Lua string hash, so a lookup never rehashes
/// - The collector removes entries for strings it frees
pub struct StringInterner {
    map: HashMap<u32, Vec<StringId>, RandomState>,
    count: usize,
}

impl StringInterner {
    pub fn new() -> Self {
        Self {
            map: HashMap::with_capacity_and_hasher(256, RandomState::new()),
            count: 0,
        }
    }

    /// Look up an interned string by content.
    #[inline]
    pub fn find<S: StringSource>(&self, hash: u32, bytes: &[u8], strings: &S) -> Option<StringId> {
        let ids = self.map.get(&hash)?;
        ids.iter().copied().find(|&id| {
            strings
                .lua_string(id)
                .is_some_and(|s| s.as_bytes() == bytes)
        })
    }

    pub fn insert(&mut self, hash: u32, id: StringId) {
        self.map.entry(hash).or_default().push(id);
        self.count += 1;
    }

    /// Remove a dead string (called by the sweeper)
    pub fn remove(&mut self, hash: u32, id: StringId) {
        if let Some(ids) = self.map.get_mut(&hash) {
            let before = ids.len();
            ids.retain(|&i| i != id);
            self.count -= before - ids.len();
            if ids.is_empty() {
                self.map.remove(&hash);
            }
        }
    }

    /// Number of interned strings
    #[inline]
    pub fn len(&self) -> usize {
        self.count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Release spare bucket capacity after a collection.
    pub fn shrink(&mut self) {
        if self.map.capacity() > 4 * self.map.len().max(64) {
            self.map.shrink_to_fit();
        }
    }
}

impl Default for StringInterner {
    fn default() -> Self {
        Self::new()
    }
}
