use std::rc::Rc;

use crate::gc::gc_id::{FunctionId, GcId, StringId, TableId, ThreadId, UpvalueId, UserdataId};
use crate::gc::gc_object::{GcBody, GcObject, GcPool};
use crate::gc::string_interner::StringInterner;
use crate::gc::GC;
use crate::lua_value::lua_string::lua_hash;
use crate::lua_value::{
    CClosure, Chunk, FunctionBody, LuaClosure, LuaString, LuaTable, LuaThread, LuaUpvalue,
    LuaUserdata,
};
use crate::lua_vm::execute::metamethod::{TM_NAMES, TmKind};
use crate::lua_vm::lua_limits::LUAI_MAXSHORTLEN;
use crate::lua_vm::CFunction;

/// Message of the pre-allocated out-of-memory error
pub const MEMERRMSG: &str = "not enough memory";

/// All heap objects of one VM plus the string table and the fixed strings
/// every thread shares.
pub struct ObjectPool {
    pub gc_pool: GcPool,
    pub interner: StringInterner,
    /// Metamethod names, indexed by `TmKind`
    pub tm_names: Vec<StringId>,
    /// Pre-allocated "not enough memory"
    pub mem_err_msg: StringId,
    /// All live thread objects (for re-marking open upvalues)
    pub threads: Vec<ThreadId>,
    /// Seed for string hashes
    pub seed: u32,
}

impl ObjectPool {
    pub fn new(gc: &mut GC, seed: u32) -> Self {
        let mut pool = ObjectPool {
            gc_pool: GcPool::new(),
            interner: StringInterner::new(),
            tm_names: Vec::with_capacity(TmKind::N as usize),
            mem_err_msg: StringId::default(),
            threads: Vec::new(),
            seed,
        };
        pool.mem_err_msg = pool.create_string(gc, MEMERRMSG.as_bytes());
        pool.fix(pool.mem_err_msg.into());
        for name in TM_NAMES {
            let id = pool.create_string(gc, name.as_bytes());
            pool.fix(id.into());
            pool.tm_names.push(id);
        }
        pool
    }

    #[inline(always)]
    pub fn tm_name(&self, tm: TmKind) -> StringId {
        self.tm_names[tm as usize]
    }

    /// Objects that must never be collected (fixed strings)
    pub fn fix(&mut self, id: GcId) {
        if let Some(h) = self.gc_pool.header_mut(id.gc_ref()) {
            h.set_fixed();
        }
    }

    fn alloc(&mut self, gc: &mut GC, body: GcBody, size: usize) -> crate::gc::GcRef {
        gc.track_alloc(size);
        self.gc_pool
            .alloc(GcObject::with_white(body, gc.current_white, size as u32))
    }

    // ============ Strings ============

    /// Creates (or finds the interned copy of) a string.
    pub fn create_string(&mut self, gc: &mut GC, bytes: &[u8]) -> StringId {
        if bytes.len() > LUAI_MAXSHORTLEN {
            let s = LuaString::new(bytes, self.seed);
            let size = s.mem_size();
            return StringId(self.alloc(gc, GcBody::String(s), size));
        }
        let hash = lua_hash(bytes, self.seed);
        if let Some(id) = self.interner.find(hash, bytes, &self.gc_pool) {
            // a dead string found during sweep is resurrected
            let other_white = crate::gc::GcHeader::otherwhite(gc.current_white);
            if let Some(h) = self.gc_pool.header_mut(id.0) {
                if h.is_dead(other_white) {
                    h.change_white();
                }
            }
            return id;
        }
        let s = LuaString::new(bytes, self.seed);
        let size = s.mem_size();
        let id = StringId(self.alloc(gc, GcBody::String(s), size));
        self.interner.insert(hash, id);
        id
    }

    #[inline]
    pub fn create_str(&mut self, gc: &mut GC, s: &str) -> StringId {
        self.create_string(gc, s.as_bytes())
    }

    #[inline]
    pub fn string(&self, id: StringId) -> Option<&LuaString> {
        self.gc_pool.string(id)
    }

    /// Byte view of a string; empty for stale handles
    #[inline]
    pub fn str_bytes(&self, id: StringId) -> &[u8] {
        self.gc_pool.string(id).map_or(&[], |s| s.as_bytes())
    }

    // ============ Tables ============

    pub fn create_table(&mut self, gc: &mut GC, narr: usize, nhash: usize) -> TableId {
        let t = LuaTable::new(narr, nhash);
        let size = t.mem_size();
        TableId(self.alloc(gc, GcBody::Table(Box::new(t)), size))
    }

    // ============ Functions ============

    pub fn create_lua_closure(
        &mut self,
        gc: &mut GC,
        chunk: Rc<Chunk>,
        upvalues: Vec<UpvalueId>,
    ) -> FunctionId {
        let body = FunctionBody::Lua(LuaClosure { chunk, upvalues });
        let size = body.mem_size();
        FunctionId(self.alloc(gc, GcBody::Function(body), size))
    }

    pub fn create_c_closure(
        &mut self,
        gc: &mut GC,
        func: CFunction,
        upvalues: Vec<crate::lua_value::LuaValue>,
    ) -> FunctionId {
        let body = FunctionBody::C(CClosure { func, upvalues });
        let size = body.mem_size();
        FunctionId(self.alloc(gc, GcBody::Function(body), size))
    }

    pub fn create_upvalue(&mut self, gc: &mut GC, upvalue: LuaUpvalue) -> UpvalueId {
        let size = std::mem::size_of::<GcObject>();
        UpvalueId(self.alloc(gc, GcBody::Upvalue(upvalue), size))
    }

    // ============ Userdata & threads ============

    pub fn create_userdata(&mut self, gc: &mut GC, userdata: LuaUserdata) -> UserdataId {
        let size = userdata.mem_size();
        UserdataId(self.alloc(gc, GcBody::Userdata(userdata), size))
    }

    pub fn create_thread(&mut self, gc: &mut GC, thread: LuaThread) -> ThreadId {
        let size = std::mem::size_of::<GcObject>()
            + thread.state.as_ref().map_or(0, |s| s.mem_size());
        let id = ThreadId(self.alloc(gc, GcBody::Thread(thread), size));
        self.threads.push(id);
        id
    }

    pub fn shrink_to_fit(&mut self) {
        self.gc_pool.shrink_to_fit();
        self.interner.shrink();
        self.threads.shrink_to_fit();
    }
}
