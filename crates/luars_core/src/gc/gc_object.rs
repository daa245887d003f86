// ============ GC Header ============

use crate::gc::gc_id::{FunctionId, GcId, GcRef, StringId, TableId, ThreadId, UpvalueId, UserdataId};
use crate::lua_value::{FunctionBody, LuaString, LuaTable, LuaThread, LuaUpvalue, LuaUserdata};

// ============ GC Constants (lgc.h) ============
// Object ages for generational GC, stored in bits 0-2 of `marked`
pub const G_NEW: u8 = 0; // Created in current cycle
pub const G_SURVIVAL: u8 = 1; // Created in previous cycle
pub const G_OLD0: u8 = 2; // Marked old by forward barrier in this cycle
pub const G_OLD1: u8 = 3; // First full cycle as old
pub const G_OLD: u8 = 4; // Really old object (not to be visited in minor)
pub const G_TOUCHED1: u8 = 5; // Old object touched this cycle
pub const G_TOUCHED2: u8 = 6; // Old object touched in previous cycle

// Color bit positions in marked field
pub const WHITE0BIT: u8 = 3;
pub const WHITE1BIT: u8 = 4;
pub const BLACKBIT: u8 = 5;
pub const FINALIZEDBIT: u8 = 6; // Object has a finalizer and sits in `finobj`/`tobefnz`
pub const FIXEDBIT: u8 = 7; // Object is never collected

pub const WHITEBITS: u8 = (1 << WHITE0BIT) | (1 << WHITE1BIT);
pub const AGEBITS: u8 = 0x07;
pub const MASKCOLORS: u8 = (1 << BLACKBIT) | WHITEBITS;

/// GC object header, embedded in every arena slot.
///
/// Bit layout of `marked`:
/// - Bits 0-2: age (G_NEW .. G_TOUCHED2)
/// - Bit 3/4: WHITE0/WHITE1
/// - Bit 5: BLACK
/// - Bit 6: FINALIZEDBIT
/// - Bit 7: FIXEDBIT
///
/// Gray is implicit: an object is gray iff it has no white bits and no black bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcHeader {
    pub marked: u8,
    /// Estimated footprint in bytes, used for debt accounting
    pub size: u32,
}

impl GcHeader {
    /// New objects are always created with the current white and age G_NEW.
    #[inline(always)]
    pub fn with_white(current_white: u8, size: u32) -> Self {
        debug_assert!(current_white == 0 || current_white == 1);
        GcHeader {
            marked: (1 << (WHITE0BIT + current_white)) | G_NEW,
            size,
        }
    }

    // ============ Age Operations ============

    #[inline(always)]
    pub fn age(&self) -> u8 {
        self.marked & AGEBITS
    }

    #[inline(always)]
    pub fn set_age(&mut self, age: u8) {
        debug_assert!(age <= G_TOUCHED2);
        self.marked = (self.marked & !AGEBITS) | (age & AGEBITS);
    }

    #[inline(always)]
    pub fn is_old(&self) -> bool {
        self.age() > G_SURVIVAL
    }

    // ============ Color Operations ============

    #[inline(always)]
    pub fn is_white(&self) -> bool {
        (self.marked & WHITEBITS) != 0
    }

    #[inline(always)]
    pub fn is_black(&self) -> bool {
        (self.marked & (1 << BLACKBIT)) != 0
    }

    #[inline(always)]
    pub fn is_gray(&self) -> bool {
        (self.marked & MASKCOLORS) == 0
    }

    /// Sets the current white, preserving age and flags
    #[inline(always)]
    pub fn make_white(&mut self, current_white: u8) {
        self.marked = (self.marked & !MASKCOLORS) | (1 << (WHITE0BIT + current_white));
    }

    #[inline(always)]
    pub fn make_gray(&mut self) {
        self.marked &= !MASKCOLORS;
    }

    #[inline(always)]
    pub fn make_black(&mut self) {
        self.marked = (self.marked & !WHITEBITS) | (1 << BLACKBIT);
    }

    #[inline(always)]
    pub fn nw2black(&mut self) {
        debug_assert!(!self.is_white());
        self.marked |= 1 << BLACKBIT;
    }

    /// An object carrying the "other" white during sweep is garbage.
    #[inline(always)]
    pub fn is_dead(&self, other_white: u8) -> bool {
        (self.marked & (1 << (WHITE0BIT + other_white))) != 0
    }

    #[inline(always)]
    pub fn otherwhite(current_white: u8) -> u8 {
        current_white ^ 1
    }

    #[inline(always)]
    pub fn change_white(&mut self) {
        self.marked ^= WHITEBITS;
    }

    // ============ Special Flags ============

    #[inline(always)]
    pub fn to_finalize(&self) -> bool {
        (self.marked & (1 << FINALIZEDBIT)) != 0
    }

    #[inline(always)]
    pub fn set_finalized(&mut self) {
        self.marked |= 1 << FINALIZEDBIT;
    }

    #[inline(always)]
    pub fn clear_finalized(&mut self) {
        self.marked &= !(1 << FINALIZEDBIT);
    }

    #[inline(always)]
    pub fn is_fixed(&self) -> bool {
        (self.marked & (1 << FIXEDBIT)) != 0
    }

    /// Fixed objects are old and gray forever.
    #[inline(always)]
    pub fn set_fixed(&mut self) {
        self.marked |= 1 << FIXEDBIT;
        self.make_gray();
        self.set_age(G_OLD);
    }
}

// ============ GC-managed Objects ============

/// Closed set of heap object kinds; downcast by `match`.
pub enum GcBody {
    String(LuaString),
    Table(Box<LuaTable>),
    Function(FunctionBody),
    Upvalue(LuaUpvalue),
    Userdata(LuaUserdata),
    Thread(LuaThread),
}

pub struct GcObject {
    pub header: GcHeader,
    pub body: GcBody,
}

impl GcObject {
    pub fn with_white(body: GcBody, current_white: u8, size: u32) -> Self {
        GcObject {
            header: GcHeader::with_white(current_white, size),
            body,
        }
    }

    #[inline(always)]
    pub fn size(&self) -> usize {
        self.header.size as usize
    }

    pub fn to_gc_id(&self, r: GcRef) -> GcId {
        match &self.body {
            GcBody::String(_) => GcId::StringId(StringId(r)),
            GcBody::Table(_) => GcId::TableId(TableId(r)),
            GcBody::Function(_) => GcId::FunctionId(FunctionId(r)),
            GcBody::Upvalue(_) => GcId::UpvalueId(UpvalueId(r)),
            GcBody::Userdata(_) => GcId::UserdataId(UserdataId(r)),
            GcBody::Thread(_) => GcId::ThreadId(ThreadId(r)),
        }
    }
}

/// Read access to interned and long strings by handle. Table operations
/// take this to hash and compare string keys without borrowing the whole
/// arena.
pub trait StringSource {
    fn lua_string(&self, id: StringId) -> Option<&LuaString>;
}

pub struct Slot {
    pub generation: u32,
    pub object: Option<GcObject>,
}

impl Slot {
    #[inline(always)]
    fn get(&self, r: GcRef) -> Option<&GcObject> {
        if self.generation == r.generation {
            self.object.as_ref()
        } else {
            None
        }
    }

    #[inline(always)]
    fn get_mut(&mut self, r: GcRef) -> Option<&mut GcObject> {
        if self.generation == r.generation {
            self.object.as_mut()
        } else {
            None
        }
    }
}

/// Arena of heap objects addressed by generational handles.
/// - Freed slots bump their generation, so stale handles resolve to `None`
/// - Free indices are recycled LIFO
pub struct GcPool {
    slots: Vec<Slot>,
    free_list: Vec<u32>,
    live: usize,
}

macro_rules! typed_access {
    ($get:ident, $get_mut:ident, $id:ty, $variant:ident, $ty:ty) => {
        #[inline]
        pub fn $get(&self, id: $id) -> Option<&$ty> {
            match &self.get(id.0)?.body {
                GcBody::$variant(v) => Some(v),
                _ => None,
            }
        }

        #[inline]
        pub fn $get_mut(&mut self, id: $id) -> Option<&mut $ty> {
            match &mut self.get_mut(id.0)?.body {
                GcBody::$variant(v) => Some(v),
                _ => None,
            }
        }
    };
}

impl GcPool {
    pub fn new() -> Self {
        Self {
            slots: Vec::with_capacity(256),
            free_list: Vec::new(),
            live: 0,
        }
    }

    /// Allocate a new object and return its handle
    pub fn alloc(&mut self, object: GcObject) -> GcRef {
        self.live += 1;
        if let Some(index) = self.free_list.pop() {
            let slot = &mut self.slots[index as usize];
            slot.object = Some(object);
            GcRef::new(index, slot.generation)
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot {
                generation: 0,
                object: Some(object),
            });
            GcRef::new(index, 0)
        }
    }

    /// Release a slot. The slot generation advances so existing handles die.
    pub fn free(&mut self, r: GcRef) -> Option<GcObject> {
        let slot = self.slots.get_mut(r.index as usize)?;
        if slot.generation != r.generation {
            return None;
        }
        let object = slot.object.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free_list.push(r.index);
        self.live -= 1;
        Some(object)
    }

    #[inline(always)]
    pub fn get(&self, r: GcRef) -> Option<&GcObject> {
        self.slots.get(r.index as usize)?.get(r)
    }

    #[inline(always)]
    pub fn get_mut(&mut self, r: GcRef) -> Option<&mut GcObject> {
        self.slots.get_mut(r.index as usize)?.get_mut(r)
    }

    #[inline(always)]
    pub fn header(&self, r: GcRef) -> Option<&GcHeader> {
        self.get(r).map(|o| &o.header)
    }

    #[inline(always)]
    pub fn header_mut(&mut self, r: GcRef) -> Option<&mut GcHeader> {
        self.get_mut(r).map(|o| &mut o.header)
    }

    #[inline(always)]
    pub fn is_valid(&self, r: GcRef) -> bool {
        self.get(r).is_some()
    }

    typed_access!(string, string_mut, StringId, String, LuaString);
    typed_access!(table_box, table_box_mut, TableId, Table, Box<LuaTable>);
    typed_access!(function, function_mut, FunctionId, Function, FunctionBody);
    typed_access!(upvalue, upvalue_mut, UpvalueId, Upvalue, LuaUpvalue);
    typed_access!(userdata, userdata_mut, UserdataId, Userdata, LuaUserdata);
    typed_access!(thread, thread_mut, ThreadId, Thread, LuaThread);

    #[inline]
    pub fn table(&self, id: TableId) -> Option<&LuaTable> {
        self.table_box(id).map(|t| &**t)
    }

    #[inline]
    pub fn table_mut(&mut self, id: TableId) -> Option<&mut LuaTable> {
        self.table_box_mut(id).map(|t| &mut **t)
    }

    /// Handle of the live object at `index`, if the slot is occupied.
    #[inline]
    pub fn ref_at(&self, index: usize) -> Option<GcRef> {
        let slot = self.slots.get(index)?;
        slot.object
            .as_ref()
            .map(|_| GcRef::new(index as u32, slot.generation))
    }

    /// Number of slots (live or free); sweep walks indices below this.
    #[inline]
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Current number of live objects
    #[inline]
    pub fn len(&self) -> usize {
        self.live
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Iterate over all live objects
    pub fn iter(&self) -> impl Iterator<Item = (GcRef, &GcObject)> + '_ {
        self.slots.iter().enumerate().filter_map(|(i, s)| {
            s.object
                .as_ref()
                .map(|o| (GcRef::new(i as u32, s.generation), o))
        })
    }

    /// Mutable access to one object together with every other slot.
    pub fn split_mut(&mut self, r: GcRef) -> Option<(&mut GcObject, SlotsMut<'_>)> {
        let index = r.index as usize;
        if index >= self.slots.len() {
            return None;
        }
        let (left, rest) = self.slots.split_at_mut(index);
        let (mid, right) = rest.split_first_mut()?;
        let object = mid.get_mut(r)?;
        Some((
            object,
            SlotsMut {
                left,
                right,
                hole: index,
            },
        ))
    }

    /// Split-borrow a table together with the rest of the arena.
    pub fn table_split_mut(&mut self, id: TableId) -> Option<(&mut LuaTable, SlotsMut<'_>)> {
        let (object, rest) = self.split_mut(id.0)?;
        match &mut object.body {
            GcBody::Table(t) => Some((&mut **t, rest)),
            _ => None,
        }
    }

    pub fn shrink_to_fit(&mut self) {
        while let Some(last) = self.slots.last() {
            if last.object.is_some() {
                break;
            }
            self.slots.pop();
        }
        let len = self.slots.len() as u32;
        self.free_list.retain(|&i| i < len);
        self.slots.shrink_to_fit();
    }
}

impl Default for GcPool {
    fn default() -> Self {
        Self::new()
    }
}

impl StringSource for GcPool {
    #[inline]
    fn lua_string(&self, id: StringId) -> Option<&LuaString> {
        self.string(id)
    }
}

/// Every slot except one that is mutably borrowed elsewhere.
pub struct SlotsMut<'a> {
    left: &'a mut [Slot],
    right: &'a mut [Slot],
    hole: usize,
}

impl SlotsMut<'_> {
    #[inline]
    pub fn get(&self, r: GcRef) -> Option<&GcObject> {
        let i = r.index as usize;
        if i < self.hole {
            self.left.get(i)?.get(r)
        } else if i > self.hole {
            self.right.get(i - self.hole - 1)?.get(r)
        } else {
            None
        }
    }

    #[inline]
    pub fn get_mut(&mut self, r: GcRef) -> Option<&mut GcObject> {
        let i = r.index as usize;
        if i < self.hole {
            self.left.get_mut(i)?.get_mut(r)
        } else if i > self.hole {
            self.right.get_mut(i - self.hole - 1)?.get_mut(r)
        } else {
            None
        }
    }

    #[inline]
    pub fn header(&self, r: GcRef) -> Option<&GcHeader> {
        self.get(r).map(|o| &o.header)
    }

    #[inline]
    pub fn header_mut(&mut self, r: GcRef) -> Option<&mut GcHeader> {
        self.get_mut(r).map(|o| &mut o.header)
    }
}

impl StringSource for SlotsMut<'_> {
    #[inline]
    fn lua_string(&self, id: StringId) -> Option<&LuaString> {
        match &self.get(id.0)?.body {
            GcBody::String(s) => Some(s),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn string_object(s: &str) -> GcObject {
        GcObject::with_white(GcBody::String(LuaString::new(s.as_bytes(), 0)), 0, 32)
    }

    #[test]
    fn test_header_colors() {
        let mut h = GcHeader::with_white(0, 0);
        assert!(h.is_white());
        assert!(h.is_dead(0));
        assert!(!h.is_dead(1));
        h.make_gray();
        assert!(h.is_gray());
        h.nw2black();
        assert!(h.is_black());
        h.make_white(1);
        assert!(h.is_dead(1));
        h.change_white();
        assert!(h.is_dead(0));
    }

    #[test]
    fn test_header_ages() {
        let mut h = GcHeader::with_white(1, 0);
        assert_eq!(h.age(), G_NEW);
        h.set_age(G_OLD1);
        assert!(h.is_old());
        assert!(h.is_white());
        h.set_fixed();
        assert!(h.is_fixed());
        assert!(h.is_gray());
        assert_eq!(h.age(), G_OLD);
    }

    #[test]
    fn test_stale_handle() {
        let mut pool = GcPool::new();
        let a = pool.alloc(string_object("a"));
        assert!(pool.is_valid(a));
        assert!(pool.free(a).is_some());
        assert!(!pool.is_valid(a));
        let b = pool.alloc(string_object("b"));
        assert_eq!(a.index, b.index);
        assert_ne!(a.generation, b.generation);
        assert!(pool.get(a).is_none());
        assert!(pool.free(a).is_none());
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_split_mut() {
        let mut pool = GcPool::new();
        let a = pool.alloc(string_object("a"));
        let b = pool.alloc(string_object("b"));
        let c = pool.alloc(string_object("c"));
        let (obj, mut rest) = pool.split_mut(b).unwrap();
        obj.header.make_gray();
        assert!(rest.get(b).is_none());
        assert!(rest.get(a).is_some());
        rest.header_mut(c).unwrap().make_black();
        assert_eq!(rest.lua_string(StringId(a)).unwrap().as_bytes(), b"a");
        assert!(pool.header(c).unwrap().is_black());
    }
}
