use std::cell::Cell;

use crate::lua_vm::lua_limits::LUAI_MAXSHORTLEN;

/// Immutable Lua string.
///
/// Short strings (up to `LUAI_MAXSHORTLEN` bytes) are interned and hashed at
/// creation. Long strings keep the state seed in `hash` until the first
/// lookup needs the real hash.
pub struct LuaString {
    bytes: Box<[u8]>,
    hash: Cell<u32>,
    hashed: Cell<bool>,
    short: bool,
}

/// String hash of the reference implementation (`luaS_hash`).
#[inline]
pub fn lua_hash(bytes: &[u8], seed: u32) -> u32 {
    let mut h = seed ^ (bytes.len() as u32);
    for &b in bytes.iter().rev() {
        h ^= (h << 5).wrapping_add(h >> 2).wrapping_add(b as u32);
    }
    h
}

impl LuaString {
    pub fn new(bytes: &[u8], seed: u32) -> Self {
        let short = bytes.len() <= LUAI_MAXSHORTLEN;
        let hash = if short { lua_hash(bytes, seed) } else { seed };
        LuaString {
            bytes: bytes.into(),
            hash: Cell::new(hash),
            hashed: Cell::new(short),
            short,
        }
    }

    #[inline(always)]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// UTF-8 view, if the bytes happen to be valid UTF-8.
    #[inline]
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.bytes).ok()
    }

    /// Lossy text rendering for messages.
    pub fn to_str_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.bytes)
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    #[inline(always)]
    pub fn is_short(&self) -> bool {
        self.short
    }

    /// Hash of the contents, computed on first use for long strings.
    #[inline]
    pub fn hash(&self) -> u32 {
        if !self.hashed.get() {
            let seed = self.hash.get();
            self.hash.set(lua_hash(&self.bytes, seed));
            self.hashed.set(true);
        }
        self.hash.get()
    }

    pub fn mem_size(&self) -> usize {
        std::mem::size_of::<LuaString>() + self.bytes.len()
    }
}

impl std::fmt::Debug for LuaString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.to_str_lossy())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_string_hashed_eagerly() {
        let s = LuaString::new(b"hello", 7);
        assert!(s.is_short());
        assert_eq!(s.hash(), lua_hash(b"hello", 7));
    }

    #[test]
    fn test_long_string_hash_is_lazy() {
        let text = vec![b'x'; LUAI_MAXSHORTLEN + 1];
        let s = LuaString::new(&text, 99);
        assert!(!s.is_short());
        assert!(!s.hashed.get());
        let h = s.hash();
        assert!(s.hashed.get());
        assert_eq!(h, lua_hash(&text, 99));
        assert_eq!(s.hash(), h);
    }

    #[test]
    fn test_hash_depends_on_seed() {
        assert_ne!(lua_hash(b"abc", 1), lua_hash(b"abc", 2));
        assert_eq!(lua_hash(b"", 5), 5);
    }
}
