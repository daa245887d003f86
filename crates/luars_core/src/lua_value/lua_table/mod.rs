// Lua table: dense array part for keys 1..n plus a chained hash part.
// Layout and rehash policy follow ltable.c.

mod hash_part;

use std::cell::Cell;

pub use hash_part::{HashPart, Node, NodeKey};

use crate::gc::{StringId, StringSource, TableId};
use crate::lua_value::lua_number::{F2I, float_to_integer};
use crate::lua_value::LuaValue;

/// Largest power of two for the array part
const MAXABITS: usize = 31;
const MAXASIZE: usize = 1 << MAXABITS;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableError {
    NilIndex,
    NaNIndex,
    InvalidNextKey,
}

impl TableError {
    pub fn message(self) -> &'static str {
        match self {
            TableError::NilIndex => "index is nil",
            TableError::NaNIndex => "index is NaN",
            TableError::InvalidNextKey => "invalid key to 'next'",
        }
    }
}

pub struct LuaTable {
    array: Vec<LuaValue>,
    hash: HashPart,
    pub metatable: Option<TableId>,
    /// Bit i set: metamethod i is known to be absent (fasttm cache)
    pub flags: Cell<u8>,
}

/// Turns integral float keys into integers; rejects nil and NaN.
#[inline]
pub fn normalize_key(key: LuaValue) -> Result<LuaValue, TableError> {
    match key {
        LuaValue::Nil => Err(TableError::NilIndex),
        LuaValue::Float(f) => {
            if f.is_nan() {
                Err(TableError::NaNIndex)
            } else if let Some(i) = float_to_integer(f, F2I::Eq) {
                Ok(LuaValue::Integer(i))
            } else {
                Ok(key)
            }
        }
        _ => Ok(key),
    }
}

/// ceil(log2(x)) for x >= 1
#[inline]
fn ceil_log2(x: usize) -> usize {
    debug_assert!(x > 0);
    (usize::BITS - (x - 1).leading_zeros()) as usize
}

/// Array index for a key in 1..=MAXASIZE, else 0
#[inline]
fn array_index(k: i64) -> usize {
    if k >= 1 && (k as u64) <= MAXASIZE as u64 {
        k as usize
    } else {
        0
    }
}

fn count_int(key: i64, nums: &mut [usize; MAXABITS + 1]) -> usize {
    let k = array_index(key);
    if k != 0 {
        nums[ceil_log2(k)] += 1;
        1
    } else {
        0
    }
}

/// Picks the largest power of two `n` such that more than half of the
/// slots 1..n would be in use; `na` returns how many keys go there.
fn compute_sizes(nums: &[usize; MAXABITS + 1], na: &mut usize) -> usize {
    let mut a = 0;
    let mut nna = 0;
    let mut optimal = 0;
    let mut i = 0;
    let mut twotoi: usize = 1;
    while twotoi > 0 && i <= MAXABITS && *na > twotoi / 2 {
        a += nums[i];
        if a > twotoi / 2 {
            optimal = twotoi;
            nna = a;
        }
        i += 1;
        twotoi = twotoi.wrapping_mul(2);
    }
    *na = nna;
    optimal
}

impl LuaTable {
    pub fn new(array_size: usize, hash_size: usize) -> Self {
        LuaTable {
            array: vec![LuaValue::Nil; array_size],
            hash: HashPart::with_size(hash_size),
            metatable: None,
            flags: Cell::new(0),
        }
    }

    #[inline(always)]
    pub fn array_len(&self) -> usize {
        self.array.len()
    }

    /// Number of nodes in the hash part
    #[inline(always)]
    pub fn hash_len(&self) -> usize {
        self.hash.size()
    }

    #[inline(always)]
    pub fn array(&self) -> &[LuaValue] {
        &self.array
    }

    #[inline(always)]
    pub fn array_mut(&mut self) -> &mut [LuaValue] {
        &mut self.array
    }

    #[inline(always)]
    pub fn nodes(&self) -> &[Node] {
        &self.hash.nodes
    }

    #[inline(always)]
    pub fn nodes_mut(&mut self) -> &mut [Node] {
        &mut self.hash.nodes
    }

    /// Number of non-nil entries
    pub fn count(&self) -> usize {
        self.array.iter().filter(|v| !v.is_nil()).count() + self.hash.count()
    }

    pub fn mem_size(&self) -> usize {
        std::mem::size_of::<LuaTable>()
            + self.array.len() * std::mem::size_of::<LuaValue>()
            + self.hash.size() * std::mem::size_of::<Node>()
    }

    #[inline(always)]
    pub fn invalidate_tm_cache(&self) {
        self.flags.set(0);
    }

    // ============ Lookup ============

    #[inline]
    pub fn get_int(&self, key: i64) -> LuaValue {
        let k = key.wrapping_sub(1) as u64;
        if k < self.array.len() as u64 {
            return self.array[k as usize];
        }
        match self.hash.find_int(key) {
            Some(i) => self.hash.nodes[i].value,
            None => LuaValue::Nil,
        }
    }

    /// Lookup by string key
    #[inline]
    pub fn get_str<S: StringSource + ?Sized>(&self, key: StringId, strings: &S) -> LuaValue {
        match self.hash.find(&LuaValue::String(key), strings) {
            Some(i) => self.hash.nodes[i].value,
            None => LuaValue::Nil,
        }
    }

    /// Raw get; absent keys (including nil and NaN) read as nil.
    pub fn get<S: StringSource + ?Sized>(&self, key: &LuaValue, strings: &S) -> LuaValue {
        match key {
            LuaValue::Nil => LuaValue::Nil,
            LuaValue::Integer(i) => self.get_int(*i),
            LuaValue::Float(f) => match float_to_integer(*f, F2I::Eq) {
                Some(i) => self.get_int(i),
                None => self.get_hash(key, strings),
            },
            _ => self.get_hash(key, strings),
        }
    }

    #[inline]
    fn get_hash<S: StringSource + ?Sized>(&self, key: &LuaValue, strings: &S) -> LuaValue {
        match self.hash.find(key, strings) {
            Some(i) => self.hash.nodes[i].value,
            None => LuaValue::Nil,
        }
    }

    // ============ Update ============

    /// Raw set. A nil value removes the entry (the node stays in its chain
    /// with a nil value).
    pub fn set<S: StringSource + ?Sized>(
        &mut self,
        key: LuaValue,
        value: LuaValue,
        strings: &S,
    ) -> Result<(), TableError> {
        let key = normalize_key(key)?;
        if let LuaValue::Integer(i) = key {
            self.set_int(i, value, strings);
            return Ok(());
        }
        if key.is_string() {
            self.invalidate_tm_cache();
        }
        match self.hash.find(&key, strings) {
            Some(i) => self.hash.nodes[i].value = value,
            None => self.new_key(key, value, strings),
        }
        Ok(())
    }

    pub fn set_int<S: StringSource + ?Sized>(&mut self, key: i64, value: LuaValue, strings: &S) {
        let k = key.wrapping_sub(1) as u64;
        if k < self.array.len() as u64 {
            self.array[k as usize] = value;
            return;
        }
        match self.hash.find_int(key) {
            Some(i) => self.hash.nodes[i].value = value,
            None => self.new_key(LuaValue::Integer(key), value, strings),
        }
    }

    /// Inserts an absent key, growing the table when no node is free.
    fn new_key<S: StringSource + ?Sized>(&mut self, key: LuaValue, value: LuaValue, strings: &S) {
        if value.is_nil() {
            return;
        }
        if !self.hash.insert_new(key, value, strings) {
            self.rehash(&key, strings);
            // after a rehash the key may belong to the array part
            if let LuaValue::Integer(i) = key {
                let k = i.wrapping_sub(1) as u64;
                if k < self.array.len() as u64 {
                    self.array[k as usize] = value;
                    return;
                }
            }
            let inserted = self.hash.insert_new(key, value, strings);
            debug_assert!(inserted);
        }
    }

    // ============ Rehash ============

    /// Counts non-nil array slots per power-of-two slice (`numusearray`)
    fn num_use_array(&self, nums: &mut [usize; MAXABITS + 1]) -> usize {
        let mut ause = 0;
        let mut i = 1;
        let mut ttlg: usize = 1;
        for lg in 0..=MAXABITS {
            let mut lc = 0;
            let mut lim = ttlg;
            if lim > self.array.len() {
                lim = self.array.len();
                if i > lim {
                    break;
                }
            }
            while i <= lim {
                if !self.array[i - 1].is_nil() {
                    lc += 1;
                }
                i += 1;
            }
            nums[lg] += lc;
            ause += lc;
            ttlg = ttlg.saturating_mul(2);
        }
        ause
    }

    /// Counts hash entries, recording integer keys in `nums` (`numusehash`)
    fn num_use_hash(&self, nums: &mut [usize; MAXABITS + 1], na: &mut usize) -> usize {
        let mut total = 0;
        for node in self.hash.nodes.iter().rev() {
            if node.value.is_nil() {
                continue;
            }
            if let Some(LuaValue::Integer(k)) = node.live_key() {
                *na += count_int(*k, nums);
            }
            total += 1;
        }
        total
    }

    fn rehash<S: StringSource + ?Sized>(&mut self, extra_key: &LuaValue, strings: &S) {
        let mut nums = [0usize; MAXABITS + 1];
        let mut na = self.num_use_array(&mut nums);
        let mut total = na;
        total += self.num_use_hash(&mut nums, &mut na);
        if let LuaValue::Integer(k) = extra_key {
            na += count_int(*k, &mut nums);
        }
        total += 1;
        let asize = compute_sizes(&nums, &mut na);
        self.resize(asize, total - na, strings);
    }

    /// Resizes both parts, moving entries as needed (`luaH_resize`).
    pub fn resize<S: StringSource + ?Sized>(&mut self, new_asize: usize, nhsize: usize, strings: &S) {
        let old_hash = std::mem::replace(&mut self.hash, HashPart::with_size(nhsize));
        let old_asize = self.array.len();
        if new_asize < old_asize {
            // vanishing slice of the array goes to the hash part
            let vanishing: Vec<LuaValue> = self.array.drain(new_asize..).collect();
            for (j, v) in vanishing.into_iter().enumerate() {
                if !v.is_nil() {
                    let key = (new_asize + j + 1) as i64;
                    self.hash.insert_new(LuaValue::Integer(key), v, strings);
                }
            }
        } else {
            self.array.resize(new_asize, LuaValue::Nil);
        }
        // re-insert elements from the old hash part
        for node in old_hash.nodes.iter().rev() {
            if node.value.is_nil() {
                continue;
            }
            if let NodeKey::Live(k) = node.key {
                if let LuaValue::Integer(i) = k {
                    let idx = i.wrapping_sub(1) as u64;
                    if idx < self.array.len() as u64 {
                        self.array[idx as usize] = node.value;
                        continue;
                    }
                }
                self.hash.insert_new(k, node.value, strings);
            }
        }
    }

    // ============ Length ============

    /// Border of the table (`luaH_getn`): some `n` with t[n] non-nil and
    /// t[n+1] nil, or 0 if t[1] is nil.
    pub fn len(&self) -> u64 {
        let limit = self.array.len();
        if limit > 0 && self.array[limit - 1].is_nil() {
            // binary search for a border inside the array
            let mut i = 0usize;
            let mut j = limit;
            while j - i > 1 {
                let m = (i + j) / 2;
                if self.array[m - 1].is_nil() {
                    j = m;
                } else {
                    i = m;
                }
            }
            return i as u64;
        }
        // the array part is full (or empty)
        if self.hash.is_empty() || self.get_int(limit as i64 + 1).is_nil() {
            return limit as u64;
        }
        self.hash_search(limit as u64)
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Unbounded search for a border past `j`, knowing t[j+1] is present.
    fn hash_search(&self, mut j: u64) -> u64 {
        let mut i;
        if j == 0 {
            j += 1;
        }
        loop {
            i = j;
            if j <= (i64::MAX as u64) / 2 {
                j *= 2;
            } else {
                j = i64::MAX as u64;
                if self.get_int(j as i64).is_nil() {
                    break;
                }
                return j;
            }
            if self.get_int(j as i64).is_nil() {
                break;
            }
        }
        while j - i > 1 {
            let m = (i + j) / 2;
            if self.get_int(m as i64).is_nil() {
                j = m;
            } else {
                i = m;
            }
        }
        i
    }

    // ============ Traversal ============

    /// Traversal index of `key`: 0 for nil, 1..=asize for array keys,
    /// asize+1+node for hash keys.
    fn find_index<S: StringSource + ?Sized>(&self, key: &LuaValue, strings: &S) -> Result<usize, TableError> {
        let key = match key {
            LuaValue::Nil => return Ok(0),
            LuaValue::Float(f) => match float_to_integer(*f, F2I::Eq) {
                Some(i) => LuaValue::Integer(i),
                None => *key,
            },
            _ => *key,
        };
        if let LuaValue::Integer(i) = key {
            let k = i.wrapping_sub(1) as u64;
            if k < self.array.len() as u64 {
                return Ok(i as usize);
            }
        }
        match self.hash.find_for_traversal(&key, strings) {
            Some(n) => Ok(self.array.len() + 1 + n),
            None => Err(TableError::InvalidNextKey),
        }
    }

    /// Entry following `key` in traversal order (`luaH_next`). Removing
    /// entries during a traversal is allowed; adding new keys is not.
    pub fn next<S: StringSource + ?Sized>(
        &self,
        key: &LuaValue,
        strings: &S,
    ) -> Result<Option<(LuaValue, LuaValue)>, TableError> {
        let asize = self.array.len();
        let mut i = self.find_index(key, strings)?;
        while i < asize {
            if !self.array[i].is_nil() {
                return Ok(Some((LuaValue::Integer(i as i64 + 1), self.array[i])));
            }
            i += 1;
        }
        i -= asize;
        while i < self.hash.size() {
            let node = &self.hash.nodes[i];
            if !node.value.is_nil() {
                if let NodeKey::Live(k) = node.key {
                    return Ok(Some((k, node.value)));
                }
            }
            i += 1;
        }
        Ok(None)
    }
}

impl Default for LuaTable {
    fn default() -> Self {
        LuaTable::new(0, 0)
    }
}
