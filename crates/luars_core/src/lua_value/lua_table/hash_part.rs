// Hash part of a table: a power-of-two node vector with chaining through
// relative `next` offsets (ltable.c). Collisions place the newcomer in a free
// node found by a cursor that only moves backwards.

use crate::gc::{StringId, StringSource};
use crate::lua_value::LuaValue;

/// Key slot of a node
#[derive(Debug, Clone, Copy)]
pub enum NodeKey {
    /// Never used since the last rehash; free for insertion
    Empty,
    Live(LuaValue),
    /// Collectable key whose entry was removed and then cleared by the
    /// collector. It stays in its chain so `next` can still continue from it.
    Dead(LuaValue),
}

#[derive(Debug, Clone, Copy)]
pub struct Node {
    pub key: NodeKey,
    pub value: LuaValue,
    /// Offset of the next node in the collision chain (0 = end)
    pub next: i32,
}

impl Node {
    const EMPTY: Node = Node {
        key: NodeKey::Empty,
        value: LuaValue::Nil,
        next: 0,
    };

    #[inline(always)]
    pub fn live_key(&self) -> Option<&LuaValue> {
        match &self.key {
            NodeKey::Live(k) => Some(k),
            _ => None,
        }
    }
}

#[derive(Default)]
pub struct HashPart {
    pub(crate) nodes: Vec<Node>,
    last_free: usize,
}

#[inline(always)]
fn hash_float(n: f64) -> u64 {
    let bits = n.to_bits();
    bits ^ (bits >> 32)
}

#[inline(always)]
fn str_hash<S: StringSource + ?Sized>(id: StringId, strings: &S) -> u32 {
    match strings.lua_string(id) {
        Some(s) => s.hash(),
        None => id.0.addr_hash(),
    }
}

impl HashPart {
    /// New hash part with room for `size` entries (rounded up to a power of
    /// two; 0 means no hash part).
    pub fn with_size(size: usize) -> Self {
        if size == 0 {
            return HashPart::default();
        }
        let size = size.next_power_of_two();
        HashPart {
            nodes: vec![Node::EMPTY; size],
            last_free: size,
        }
    }

    #[inline(always)]
    pub fn size(&self) -> usize {
        self.nodes.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    #[inline(always)]
    fn hash_mod(&self, n: u64) -> usize {
        (n % (((self.nodes.len() - 1) | 1) as u64)) as usize
    }

    #[inline(always)]
    fn hash_pow2(&self, h: u32) -> usize {
        (h as usize) & (self.nodes.len() - 1)
    }

    /// Main position of a key. The hash part must not be empty.
    pub fn main_position<S: StringSource + ?Sized>(&self, key: &LuaValue, strings: &S) -> usize {
        match key {
            LuaValue::Integer(i) => self.hash_mod(*i as u64),
            LuaValue::Float(n) => self.hash_mod(hash_float(*n)),
            LuaValue::Boolean(b) => self.hash_pow2(*b as u32),
            LuaValue::String(id) => self.hash_pow2(str_hash(*id, strings)),
            LuaValue::LightUserdata(p) => self.hash_mod(*p as u64),
            LuaValue::CFunction(f) => self.hash_mod(*f as usize as u64),
            LuaValue::Table(id) => self.hash_mod(id.0.addr_hash() as u64),
            LuaValue::Function(id) => self.hash_mod(id.0.addr_hash() as u64),
            LuaValue::Userdata(id) => self.hash_mod(id.0.addr_hash() as u64),
            LuaValue::Thread(id) => self.hash_mod(id.0.addr_hash() as u64),
            LuaValue::Nil => 0,
        }
    }

    /// Raw key equality. Short strings are interned, so handle equality
    /// decides; long strings compare contents.
    #[inline]
    pub fn keys_equal<S: StringSource + ?Sized>(a: &LuaValue, b: &LuaValue, strings: &S) -> bool {
        match (a, b) {
            (LuaValue::String(x), LuaValue::String(y)) => {
                if x == y {
                    return true;
                }
                match (strings.lua_string(*x), strings.lua_string(*y)) {
                    (Some(sx), Some(sy)) => {
                        !sx.is_short() && !sy.is_short() && sx.as_bytes() == sy.as_bytes()
                    }
                    _ => false,
                }
            }
            // numeric keys are normalized, so int/float never meet here
            (LuaValue::Integer(x), LuaValue::Integer(y)) => x == y,
            (LuaValue::Float(x), LuaValue::Float(y)) => x == y,
            (LuaValue::Integer(_), LuaValue::Float(_)) | (LuaValue::Float(_), LuaValue::Integer(_)) => {
                false
            }
            _ => a.raw_identity_eq(b),
        }
    }

    /// Index of the node holding `key`, following the collision chain.
    pub fn find<S: StringSource + ?Sized>(&self, key: &LuaValue, strings: &S) -> Option<usize> {
        if self.nodes.is_empty() {
            return None;
        }
        let mut i = self.main_position(key, strings);
        loop {
            let node = &self.nodes[i];
            if let NodeKey::Live(k) = &node.key {
                if Self::keys_equal(key, k, strings) {
                    return Some(i);
                }
            }
            if node.next == 0 {
                return None;
            }
            i = (i as i64 + node.next as i64) as usize;
        }
    }

    /// Integer lookup without string access
    #[inline]
    pub fn find_int(&self, key: i64) -> Option<usize> {
        if self.nodes.is_empty() {
            return None;
        }
        let mut i = self.hash_mod(key as u64);
        loop {
            let node = &self.nodes[i];
            if let NodeKey::Live(LuaValue::Integer(k)) = node.key {
                if k == key {
                    return Some(i);
                }
            }
            if node.next == 0 {
                return None;
            }
            i = (i as i64 + node.next as i64) as usize;
        }
    }

    /// Lookup that also matches dead keys by identity (used by `next`).
    pub fn find_for_traversal<S: StringSource + ?Sized>(
        &self,
        key: &LuaValue,
        strings: &S,
    ) -> Option<usize> {
        if let Some(i) = self.find(key, strings) {
            return Some(i);
        }
        let id = key.gc_id()?;
        // dead keys may sit anywhere in a chain; scan linearly
        self.nodes.iter().position(|n| match &n.key {
            NodeKey::Dead(k) => k.gc_id() == Some(id),
            _ => false,
        })
    }

    fn get_free_pos(&mut self) -> Option<usize> {
        while self.last_free > 0 {
            self.last_free -= 1;
            if matches!(self.nodes[self.last_free].key, NodeKey::Empty) {
                return Some(self.last_free);
            }
        }
        None
    }

    /// Inserts a key known to be absent (`luaH_newkey` without the rehash).
    /// Returns false when no free node is left; the caller must rehash.
    pub fn insert_new<S: StringSource + ?Sized>(
        &mut self,
        key: LuaValue,
        value: LuaValue,
        strings: &S,
    ) -> bool {
        if self.nodes.is_empty() {
            return false;
        }
        let mut mp = self.main_position(&key, strings);
        let taken = !self.nodes[mp].value.is_nil();
        if taken {
            let Some(f) = self.get_free_pos() else {
                return false;
            };
            // a taken node always carries a live key
            let colliding_mp = match self.nodes[mp].key {
                NodeKey::Live(k) => self.main_position(&k, strings),
                _ => mp,
            };
            if colliding_mp != mp {
                // colliding node is out of its main position: move it
                let mut other = colliding_mp;
                while (other as i64 + self.nodes[other].next as i64) as usize != mp {
                    other = (other as i64 + self.nodes[other].next as i64) as usize;
                }
                self.nodes[other].next = (f as i64 - other as i64) as i32;
                self.nodes[f] = self.nodes[mp];
                if self.nodes[mp].next != 0 {
                    self.nodes[f].next += (mp as i64 - f as i64) as i32;
                    self.nodes[mp].next = 0;
                }
                self.nodes[mp].value = LuaValue::Nil;
            } else {
                // new node goes into the free position
                if self.nodes[mp].next != 0 {
                    self.nodes[f].next =
                        ((mp as i64 + self.nodes[mp].next as i64) - f as i64) as i32;
                }
                self.nodes[mp].next = (f as i64 - mp as i64) as i32;
                mp = f;
            }
        }
        self.nodes[mp].key = NodeKey::Live(key);
        self.nodes[mp].value = value;
        true
    }

    /// Number of entries with a non-nil value
    pub fn count(&self) -> usize {
        self.nodes.iter().filter(|n| !n.value.is_nil()).count()
    }
}
