// Tagged value representation (Lua 5.4 TValue)
//
// Type tags follow lobject.h / lua.h so that binary chunks and type queries
// speak the same numbers as the reference implementation:
//   bits 0-3: base type (LUA_T*)
//   bits 4-5: variant
//   bit 6: collectable

use crate::gc::{FunctionId, GcId, StringId, TableId, ThreadId, UserdataId};
use crate::lua_value::lua_number::{F2I, float_to_integer};
use crate::lua_vm::CFunction;

// ============ Basic types ============
pub const LUA_TNONE: i32 = -1;
pub const LUA_TNIL: u8 = 0;
pub const LUA_TBOOLEAN: u8 = 1;
pub const LUA_TLIGHTUSERDATA: u8 = 2;
pub const LUA_TNUMBER: u8 = 3;
pub const LUA_TSTRING: u8 = 4;
pub const LUA_TTABLE: u8 = 5;
pub const LUA_TFUNCTION: u8 = 6;
pub const LUA_TUSERDATA: u8 = 7;
pub const LUA_TTHREAD: u8 = 8;
pub const LUA_NUMTYPES: usize = 9;

// ============ Variant tags ============
#[inline(always)]
pub const fn makevariant(t: u8, v: u8) -> u8 {
    t | (v << 4)
}

pub const LUA_VNIL: u8 = makevariant(LUA_TNIL, 0);
pub const LUA_VFALSE: u8 = makevariant(LUA_TBOOLEAN, 0);
pub const LUA_VTRUE: u8 = makevariant(LUA_TBOOLEAN, 1);
pub const LUA_VNUMINT: u8 = makevariant(LUA_TNUMBER, 0);
pub const LUA_VNUMFLT: u8 = makevariant(LUA_TNUMBER, 1);
pub const LUA_VSHRSTR: u8 = makevariant(LUA_TSTRING, 0);
pub const LUA_VLNGSTR: u8 = makevariant(LUA_TSTRING, 1);
pub const LUA_VTABLE: u8 = makevariant(LUA_TTABLE, 0);
pub const LUA_VLCL: u8 = makevariant(LUA_TFUNCTION, 0);
pub const LUA_VLCF: u8 = makevariant(LUA_TFUNCTION, 1);
pub const LUA_VCCL: u8 = makevariant(LUA_TFUNCTION, 2);
pub const LUA_VLIGHTUSERDATA: u8 = makevariant(LUA_TLIGHTUSERDATA, 0);
pub const LUA_VUSERDATA: u8 = makevariant(LUA_TUSERDATA, 0);
pub const LUA_VTHREAD: u8 = makevariant(LUA_TTHREAD, 0);

pub const BIT_ISCOLLECTABLE: u8 = 1 << 6;

const TYPE_NAMES: [&str; LUA_NUMTYPES] = [
    "nil", "boolean", "userdata", "number", "string", "table", "function", "userdata", "thread",
];

/// Name of a base type tag, "no value" for `LUA_TNONE`.
pub fn type_name_of(tag: i32) -> &'static str {
    if tag < 0 || tag as usize >= LUA_NUMTYPES {
        "no value"
    } else {
        TYPE_NAMES[tag as usize]
    }
}

/// A Lua value: type discriminant plus payload.
///
/// Collectable payloads are generational handles into the object arena, so a
/// `LuaValue` is `Copy` and never owns heap memory.
#[derive(Clone, Copy, Default)]
pub enum LuaValue {
    #[default]
    Nil,
    Boolean(bool),
    LightUserdata(usize),
    Integer(i64),
    Float(f64),
    String(StringId),
    Table(TableId),
    /// Light native function (no upvalues, not collectable)
    CFunction(CFunction),
    /// Lua closure or native closure
    Function(FunctionId),
    Userdata(UserdataId),
    Thread(ThreadId),
}

impl LuaValue {
    // ============ Constructors ============

    #[inline(always)]
    pub const fn nil() -> Self {
        LuaValue::Nil
    }

    #[inline(always)]
    pub const fn boolean(b: bool) -> Self {
        LuaValue::Boolean(b)
    }

    #[inline(always)]
    pub const fn integer(i: i64) -> Self {
        LuaValue::Integer(i)
    }

    #[inline(always)]
    pub const fn float(n: f64) -> Self {
        LuaValue::Float(n)
    }

    #[inline(always)]
    pub fn cfunction(f: CFunction) -> Self {
        LuaValue::CFunction(f)
    }

    // ============ Tags ============

    /// Base type (LUA_T*)
    #[inline]
    pub fn base_type(&self) -> u8 {
        match self {
            LuaValue::Nil => LUA_TNIL,
            LuaValue::Boolean(_) => LUA_TBOOLEAN,
            LuaValue::LightUserdata(_) => LUA_TLIGHTUSERDATA,
            LuaValue::Integer(_) | LuaValue::Float(_) => LUA_TNUMBER,
            LuaValue::String(_) => LUA_TSTRING,
            LuaValue::Table(_) => LUA_TTABLE,
            LuaValue::CFunction(_) | LuaValue::Function(_) => LUA_TFUNCTION,
            LuaValue::Userdata(_) => LUA_TUSERDATA,
            LuaValue::Thread(_) => LUA_TTHREAD,
        }
    }

    /// Variant tag without the string length distinction (strings report
    /// `LUA_VSHRSTR`; the pool knows whether a string is long).
    #[inline]
    pub fn variant_tag(&self) -> u8 {
        match self {
            LuaValue::Nil => LUA_VNIL,
            LuaValue::Boolean(false) => LUA_VFALSE,
            LuaValue::Boolean(true) => LUA_VTRUE,
            LuaValue::LightUserdata(_) => LUA_VLIGHTUSERDATA,
            LuaValue::Integer(_) => LUA_VNUMINT,
            LuaValue::Float(_) => LUA_VNUMFLT,
            LuaValue::String(_) => LUA_VSHRSTR | BIT_ISCOLLECTABLE,
            LuaValue::Table(_) => LUA_VTABLE | BIT_ISCOLLECTABLE,
            LuaValue::CFunction(_) => LUA_VLCF,
            LuaValue::Function(_) => LUA_VLCL | BIT_ISCOLLECTABLE,
            LuaValue::Userdata(_) => LUA_VUSERDATA | BIT_ISCOLLECTABLE,
            LuaValue::Thread(_) => LUA_VTHREAD | BIT_ISCOLLECTABLE,
        }
    }

    #[inline]
    pub fn type_name(&self) -> &'static str {
        TYPE_NAMES[self.base_type() as usize]
    }

    // ============ Type checks ============

    #[inline(always)]
    pub fn is_nil(&self) -> bool {
        matches!(self, LuaValue::Nil)
    }

    #[inline(always)]
    pub fn is_boolean(&self) -> bool {
        matches!(self, LuaValue::Boolean(_))
    }

    #[inline(always)]
    pub fn is_integer(&self) -> bool {
        matches!(self, LuaValue::Integer(_))
    }

    #[inline(always)]
    pub fn is_float(&self) -> bool {
        matches!(self, LuaValue::Float(_))
    }

    #[inline(always)]
    pub fn is_number(&self) -> bool {
        matches!(self, LuaValue::Integer(_) | LuaValue::Float(_))
    }

    #[inline(always)]
    pub fn is_string(&self) -> bool {
        matches!(self, LuaValue::String(_))
    }

    #[inline(always)]
    pub fn is_table(&self) -> bool {
        matches!(self, LuaValue::Table(_))
    }

    #[inline(always)]
    pub fn is_function(&self) -> bool {
        matches!(self, LuaValue::CFunction(_) | LuaValue::Function(_))
    }

    #[inline(always)]
    pub fn is_userdata(&self) -> bool {
        matches!(self, LuaValue::Userdata(_) | LuaValue::LightUserdata(_))
    }

    #[inline(always)]
    pub fn is_thread(&self) -> bool {
        matches!(self, LuaValue::Thread(_))
    }

    /// `nil` and `false` are falsy, everything else is truthy
    #[inline(always)]
    pub fn is_falsy(&self) -> bool {
        matches!(self, LuaValue::Nil | LuaValue::Boolean(false))
    }

    #[inline(always)]
    pub fn is_collectable(&self) -> bool {
        self.gc_id().is_some()
    }

    // ============ Accessors ============

    #[inline(always)]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            LuaValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Integer value; floats convert only when exactly integral.
    #[inline]
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            LuaValue::Integer(i) => Some(*i),
            LuaValue::Float(f) => float_to_integer(*f, F2I::Eq),
            _ => None,
        }
    }

    /// Integer value with an explicit float rounding mode.
    #[inline]
    pub fn to_integer_mode(&self, mode: F2I) -> Option<i64> {
        match self {
            LuaValue::Integer(i) => Some(*i),
            LuaValue::Float(f) => float_to_integer(*f, mode),
            _ => None,
        }
    }

    /// Numeric value widened to float.
    #[inline]
    pub fn as_float(&self) -> Option<f64> {
        match self {
            LuaValue::Integer(i) => Some(*i as f64),
            LuaValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    #[inline(always)]
    pub fn as_string_id(&self) -> Option<StringId> {
        match self {
            LuaValue::String(id) => Some(*id),
            _ => None,
        }
    }

    #[inline(always)]
    pub fn as_table_id(&self) -> Option<TableId> {
        match self {
            LuaValue::Table(id) => Some(*id),
            _ => None,
        }
    }

    #[inline(always)]
    pub fn as_function_id(&self) -> Option<FunctionId> {
        match self {
            LuaValue::Function(id) => Some(*id),
            _ => None,
        }
    }

    #[inline(always)]
    pub fn as_cfunction(&self) -> Option<CFunction> {
        match self {
            LuaValue::CFunction(f) => Some(*f),
            _ => None,
        }
    }

    #[inline(always)]
    pub fn as_userdata_id(&self) -> Option<UserdataId> {
        match self {
            LuaValue::Userdata(id) => Some(*id),
            _ => None,
        }
    }

    #[inline(always)]
    pub fn as_thread_id(&self) -> Option<ThreadId> {
        match self {
            LuaValue::Thread(id) => Some(*id),
            _ => None,
        }
    }

    /// Handle of the heap object referenced by this value, if any.
    #[inline]
    pub fn gc_id(&self) -> Option<GcId> {
        match self {
            LuaValue::String(id) => Some(GcId::StringId(*id)),
            LuaValue::Table(id) => Some(GcId::TableId(*id)),
            LuaValue::Function(id) => Some(GcId::FunctionId(*id)),
            LuaValue::Userdata(id) => Some(GcId::UserdataId(*id)),
            LuaValue::Thread(id) => Some(GcId::ThreadId(*id)),
            _ => None,
        }
    }

    /// Value referring to the heap object `id`
    #[inline]
    pub fn from_gc_id(id: GcId) -> LuaValue {
        match id {
            GcId::StringId(s) => LuaValue::String(s),
            GcId::TableId(t) => LuaValue::Table(t),
            GcId::FunctionId(f) => LuaValue::Function(f),
            GcId::UserdataId(u) => LuaValue::Userdata(u),
            GcId::ThreadId(t) => LuaValue::Thread(t),
            // upvalues are never values
            GcId::UpvalueId(_) => LuaValue::Nil,
        }
    }

    /// Raw identity: same variant and same payload. Numbers compare by value
    /// across integer/float; strings compare by handle (exact for short
    /// strings, which are interned).
    #[inline]
    pub fn raw_identity_eq(&self, other: &LuaValue) -> bool {
        match (self, other) {
            (LuaValue::Nil, LuaValue::Nil) => true,
            (LuaValue::Boolean(a), LuaValue::Boolean(b)) => a == b,
            (LuaValue::LightUserdata(a), LuaValue::LightUserdata(b)) => a == b,
            (LuaValue::Integer(a), LuaValue::Integer(b)) => a == b,
            (LuaValue::Float(a), LuaValue::Float(b)) => a == b,
            (LuaValue::Integer(i), LuaValue::Float(f)) | (LuaValue::Float(f), LuaValue::Integer(i)) => {
                float_to_integer(*f, F2I::Eq) == Some(*i)
            }
            (LuaValue::String(a), LuaValue::String(b)) => a == b,
            (LuaValue::Table(a), LuaValue::Table(b)) => a == b,
            (LuaValue::CFunction(a), LuaValue::CFunction(b)) => std::ptr::fn_addr_eq(*a, *b),
            (LuaValue::Function(a), LuaValue::Function(b)) => a == b,
            (LuaValue::Userdata(a), LuaValue::Userdata(b)) => a == b,
            (LuaValue::Thread(a), LuaValue::Thread(b)) => a == b,
            _ => false,
        }
    }
}

impl PartialEq for LuaValue {
    fn eq(&self, other: &Self) -> bool {
        self.raw_identity_eq(other)
    }
}

impl std::fmt::Debug for LuaValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LuaValue::Nil => write!(f, "nil"),
            LuaValue::Boolean(b) => write!(f, "{}", b),
            LuaValue::LightUserdata(p) => write!(f, "userdata: 0x{:x}", p),
            LuaValue::Integer(i) => write!(f, "{}", i),
            LuaValue::Float(n) => write!(f, "{:?}", n),
            LuaValue::String(id) => write!(f, "string#{}", id.0.index),
            LuaValue::Table(id) => write!(f, "table#{}", id.0.index),
            LuaValue::CFunction(func) => write!(f, "cfunction: {:p}", *func as *const ()),
            LuaValue::Function(id) => write!(f, "function#{}", id.0.index),
            LuaValue::Userdata(id) => write!(f, "userdata#{}", id.0.index),
            LuaValue::Thread(id) => write!(f, "thread#{}", id.0.index),
        }
    }
}

impl From<bool> for LuaValue {
    fn from(b: bool) -> Self {
        LuaValue::Boolean(b)
    }
}

impl From<i64> for LuaValue {
    fn from(i: i64) -> Self {
        LuaValue::Integer(i)
    }
}

impl From<f64> for LuaValue {
    fn from(n: f64) -> Self {
        LuaValue::Float(n)
    }
}

impl From<StringId> for LuaValue {
    fn from(id: StringId) -> Self {
        LuaValue::String(id)
    }
}

impl From<TableId> for LuaValue {
    fn from(id: TableId) -> Self {
        LuaValue::Table(id)
    }
}

impl From<FunctionId> for LuaValue {
    fn from(id: FunctionId) -> Self {
        LuaValue::Function(id)
    }
}

impl From<UserdataId> for LuaValue {
    fn from(id: UserdataId) -> Self {
        LuaValue::Userdata(id)
    }
}

impl From<ThreadId> for LuaValue {
    fn from(id: ThreadId) -> Self {
        LuaValue::Thread(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::GcRef;

    #[test]
    fn test_type_tags() {
        assert_eq!(LuaValue::nil().base_type(), LUA_TNIL);
        assert_eq!(LuaValue::integer(1).variant_tag(), LUA_VNUMINT);
        assert_eq!(LuaValue::float(1.5).variant_tag(), LUA_VNUMFLT);
        assert_eq!(LuaValue::boolean(true).variant_tag(), LUA_VTRUE);
        assert_eq!(LuaValue::integer(3).type_name(), "number");
        assert_eq!(type_name_of(LUA_TNONE), "no value");
    }

    #[test]
    fn test_falsy() {
        assert!(LuaValue::nil().is_falsy());
        assert!(LuaValue::boolean(false).is_falsy());
        assert!(!LuaValue::integer(0).is_falsy());
        assert!(!LuaValue::float(0.0).is_falsy());
    }

    #[test]
    fn test_numeric_identity() {
        assert_eq!(LuaValue::integer(3), LuaValue::float(3.0));
        assert_ne!(LuaValue::integer(3), LuaValue::float(3.5));
        assert_ne!(LuaValue::float(f64::NAN), LuaValue::float(f64::NAN));
        // 2^63 is not representable as i64
        assert_ne!(LuaValue::integer(i64::MAX), LuaValue::float(9223372036854775808.0));
    }

    #[test]
    fn test_integer_conversion() {
        assert_eq!(LuaValue::float(42.0).as_integer(), Some(42));
        assert_eq!(LuaValue::float(42.5).as_integer(), None);
        assert_eq!(LuaValue::float(42.5).to_integer_mode(F2I::Floor), Some(42));
        assert_eq!(LuaValue::float(42.5).to_integer_mode(F2I::Ceil), Some(43));
        assert_eq!(LuaValue::float(f64::INFINITY).as_integer(), None);
    }

    #[test]
    fn test_handles_compare_by_generation() {
        let a = LuaValue::Table(TableId(GcRef::new(1, 0)));
        let b = LuaValue::Table(TableId(GcRef::new(1, 1)));
        assert_ne!(a, b);
        assert!(a.gc_id().is_some());
        assert!(LuaValue::integer(1).gc_id().is_none());
    }
}
