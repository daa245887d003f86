// Mark phase: root marking, gray-list propagation, weak tables and the
// atomic phase (lgc.c: reallymarkobject, propagatemark, traverse*, atomic).

use crate::gc::gc_id::{FunctionId, GcId, GcRef, TableId, ThreadId, UserdataId};
use crate::gc::gc_object::{
    G_OLD, G_OLD1, G_TOUCHED1, G_TOUCHED2, GcBody, GcHeader, GcObject, GcPool, SlotsMut,
};
use crate::gc::{GC, GcRoots, GcState, ObjectPool};
use crate::lua_value::lua_table::{Node, NodeKey};
use crate::lua_value::{Chunk, FunctionBody, LuaTable, LuaUpvalue, LuaValue};
use crate::lua_vm::LuaState;
use crate::lua_vm::execute::metamethod::TmKind;

/// Mutable object access for marking: the whole arena, or the arena minus
/// the object being traversed.
pub trait Heap {
    fn object_mut(&mut self, r: GcRef) -> Option<&mut GcObject>;
}

impl Heap for GcPool {
    #[inline(always)]
    fn object_mut(&mut self, r: GcRef) -> Option<&mut GcObject> {
        self.get_mut(r)
    }
}

impl Heap for SlotsMut<'_> {
    #[inline(always)]
    fn object_mut(&mut self, r: GcRef) -> Option<&mut GcObject> {
        self.get_mut(r)
    }
}

#[inline]
fn is_white_value<H: Heap + ?Sized>(heap: &mut H, v: &LuaValue) -> bool {
    match v.gc_id() {
        Some(id) => heap
            .object_mut(id.gc_ref())
            .is_some_and(|o| o.header.is_white()),
        None => false,
    }
}

/// Whether a weak entry holding `v` must be removed (`iscleared`). Strings
/// are values, never cleared, so they get marked here.
fn is_cleared<H: Heap + ?Sized>(heap: &mut H, v: &LuaValue) -> bool {
    let Some(id) = v.gc_id() else {
        return false;
    };
    let Some(obj) = heap.object_mut(id.gc_ref()) else {
        return false;
    };
    if matches!(obj.body, GcBody::String(_)) {
        if obj.header.is_white() {
            obj.header.make_black();
        }
        return false;
    }
    obj.header.is_white()
}

/// Removed entries with collectable keys get a dead key (`clearkey`).
#[inline]
fn clear_key(node: &mut Node) {
    if let NodeKey::Live(k) = node.key {
        if k.is_collectable() {
            node.key = NodeKey::Dead(k);
        }
    }
}

fn split_table(gc_pool: &mut GcPool, id: TableId) -> Option<(&mut GcHeader, &mut LuaTable, SlotsMut<'_>)> {
    let (obj, rest) = gc_pool.split_mut(id.0)?;
    let GcObject { header, body } = obj;
    match body {
        GcBody::Table(t) => Some((header, &mut **t, rest)),
        _ => None,
    }
}

/// `__mode` of a table's metatable as (weak keys, weak values)
fn weak_mode(pool: &ObjectPool, id: TableId) -> (bool, bool) {
    let gc_pool = &pool.gc_pool;
    let Some(mt) = gc_pool.table(id).and_then(|t| t.metatable) else {
        return (false, false);
    };
    let Some(mt) = gc_pool.table(mt) else {
        return (false, false);
    };
    match mt.get_str(pool.tm_name(TmKind::Mode), gc_pool) {
        LuaValue::String(s) => {
            let mode = pool.str_bytes(s);
            (mode.contains(&b'k'), mode.contains(&b'v'))
        }
        _ => (false, false),
    }
}

impl GC {
    #[inline]
    pub(crate) fn mark_value<H: Heap + ?Sized>(&mut self, heap: &mut H, v: &LuaValue) {
        if let Some(id) = v.gc_id() {
            self.mark_object(heap, id);
        }
    }

    /// Marks a white object (`reallymarkobject`). Leaves go straight to
    /// black; objects with references are queued gray.
    pub(crate) fn mark_object<H: Heap + ?Sized>(&mut self, heap: &mut H, id: GcId) {
        let Some(obj) = heap.object_mut(id.gc_ref()) else {
            return;
        };
        if !obj.header.is_white() {
            return;
        }
        let GcObject { header, body } = obj;
        let mut follow_value = None;
        let mut follow_mt = None;
        match body {
            GcBody::String(_) => header.make_black(),
            GcBody::Upvalue(LuaUpvalue::Open { .. }) => {
                // open upvalues stay gray; their thread marks the slot
                header.make_gray();
            }
            GcBody::Upvalue(LuaUpvalue::Closed(v)) => {
                header.make_black();
                follow_value = Some(*v);
            }
            GcBody::Userdata(ud) if ud.user_values.is_empty() => {
                header.make_black();
                follow_mt = ud.metatable;
            }
            _ => {
                header.make_gray();
                self.gray.push(id);
            }
        }
        if let Some(v) = follow_value {
            self.mark_value(heap, &v);
        }
        if let Some(mt) = follow_mt {
            self.mark_object(heap, mt.into());
        }
    }

    /// Marks the root set: main and running threads, resumers, registry and
    /// per-type metatables.
    pub(crate) fn mark_roots(&mut self, pool: &mut ObjectPool, roots: &mut GcRoots) {
        let heap = &mut pool.gc_pool;
        self.mark_object(heap, roots.main_thread.into());
        self.mark_object(heap, roots.state.thread_id.into());
        for resumer in roots.resumers.iter() {
            self.mark_object(heap, resumer.thread_id.into());
        }
        self.mark_value(heap, &roots.registry);
        for mt in roots.type_metatables.iter().flatten() {
            self.mark_object(heap, (*mt).into());
        }
    }

    /// Marks every object whose finalizer is pending (`markbeingfnz`).
    pub(crate) fn mark_being_fnz(&mut self, gc_pool: &mut GcPool) -> usize {
        let pending: Vec<GcId> = self.tobefnz.iter().copied().collect();
        for id in &pending {
            self.mark_object(gc_pool, *id);
        }
        pending.len()
    }

    /// Traverses one gray object (`propagatemark`); returns work done.
    pub(crate) fn propagate_mark(&mut self, pool: &mut ObjectPool, roots: &mut GcRoots) -> usize {
        let Some(id) = self.gray.pop() else {
            return 0;
        };
        match id {
            GcId::TableId(t) => self.traverse_table(pool, t),
            GcId::FunctionId(f) => self.traverse_function(&mut pool.gc_pool, f),
            GcId::UserdataId(u) => self.traverse_userdata(&mut pool.gc_pool, u),
            GcId::ThreadId(t) => self.traverse_thread(pool, roots, t),
            GcId::StringId(_) | GcId::UpvalueId(_) => {
                if let Some(h) = pool.gc_pool.header_mut(id.gc_ref()) {
                    h.nw2black();
                }
                1
            }
        }
    }

    pub(crate) fn propagate_all(&mut self, pool: &mut ObjectPool, roots: &mut GcRoots) -> usize {
        let mut work = 0;
        while !self.gray.is_empty() {
            work += self.propagate_mark(pool, roots);
        }
        work
    }

    /// Keeps touched objects in `grayagain` for the next minor collection
    /// (`genlink`).
    fn gen_link(&mut self, header: &mut GcHeader, id: GcId) {
        if header.age() == G_TOUCHED1 {
            header.make_gray();
            self.grayagain.push(id);
        } else if header.age() == G_TOUCHED2 {
            header.set_age(G_OLD);
        }
    }

    // ============ Tables ============

    fn traverse_table(&mut self, pool: &mut ObjectPool, id: TableId) -> usize {
        let (weak_keys, weak_values) = weak_mode(pool, id);
        let Some((header, table, mut rest)) = split_table(&mut pool.gc_pool, id) else {
            return 0;
        };
        header.nw2black();
        if let Some(mt) = table.metatable {
            self.mark_object(&mut rest, mt.into());
        }
        match (weak_keys, weak_values) {
            (false, false) => self.traverse_strong_table(header, table, &mut rest, id),
            (false, true) => self.traverse_weak_value(header, table, &mut rest, id),
            (true, false) => {
                self.traverse_ephemeron(header, table, &mut rest, id, false);
            }
            (true, true) => {
                // nothing to traverse now
                header.make_gray();
                self.allweak.push(id);
            }
        }
        1 + table.array_len() + 2 * table.hash_len()
    }

    fn traverse_strong_table(
        &mut self,
        header: &mut GcHeader,
        table: &mut LuaTable,
        rest: &mut SlotsMut<'_>,
        id: TableId,
    ) {
        for v in table.array() {
            self.mark_value(rest, v);
        }
        for node in table.nodes_mut() {
            if node.value.is_nil() {
                clear_key(node);
            } else {
                if let NodeKey::Live(k) = node.key {
                    self.mark_value(rest, &k);
                }
                self.mark_value(rest, &node.value);
            }
        }
        self.gen_link(header, id.into());
    }

    /// Strong keys, weak values (`traverseweakvalue`)
    fn traverse_weak_value(
        &mut self,
        header: &mut GcHeader,
        table: &mut LuaTable,
        rest: &mut SlotsMut<'_>,
        id: TableId,
    ) {
        // a non-empty array part may hold white values; not worth checking
        let mut has_clears = table.array_len() > 0;
        for node in table.nodes_mut() {
            if node.value.is_nil() {
                clear_key(node);
            } else {
                if let NodeKey::Live(k) = node.key {
                    self.mark_value(rest, &k);
                }
                if !has_clears && is_cleared(rest, &node.value) {
                    has_clears = true;
                }
            }
        }
        header.make_gray();
        if self.gc_state == GcState::Atomic && has_clears {
            self.weak.push(id);
        } else {
            // revisit in the atomic phase
            self.grayagain.push(id.into());
        }
    }

    /// Weak keys, strong values (`traverseephemeron`). A value is marked
    /// only once its key is known to be reachable. Returns whether anything
    /// was marked.
    fn traverse_ephemeron(
        &mut self,
        header: &mut GcHeader,
        table: &mut LuaTable,
        rest: &mut SlotsMut<'_>,
        id: TableId,
        inv: bool,
    ) -> bool {
        let mut marked = false;
        let mut has_clears = false;
        let mut has_ww = false;
        for v in table.array() {
            if is_white_value(rest, v) {
                marked = true;
                self.mark_value(rest, v);
            }
        }
        let nodes = table.nodes_mut();
        let n = nodes.len();
        for i in 0..n {
            let node = if inv { &mut nodes[n - 1 - i] } else { &mut nodes[i] };
            if node.value.is_nil() {
                clear_key(node);
                continue;
            }
            let key_cleared = match node.key {
                NodeKey::Live(k) => is_cleared(rest, &k),
                _ => false,
            };
            if key_cleared {
                has_clears = true;
                if is_white_value(rest, &node.value) {
                    has_ww = true;
                }
            } else if is_white_value(rest, &node.value) {
                marked = true;
                self.mark_value(rest, &node.value);
            }
        }
        if self.gc_state == GcState::Propagate {
            header.make_gray();
            self.grayagain.push(id.into());
        } else if has_ww {
            header.make_gray();
            self.ephemeron.push(id);
        } else if has_clears {
            header.make_gray();
            self.allweak.push(id);
        } else {
            self.gen_link(header, id.into());
        }
        marked
    }

    /// Re-traverses ephemeron tables until no more values get marked,
    /// alternating direction to converge faster on chains
    /// (`convergeephemerons`).
    fn converge_ephemerons(&mut self, pool: &mut ObjectPool, roots: &mut GcRoots) {
        let mut inv = false;
        loop {
            let tables = std::mem::take(&mut self.ephemeron);
            let mut changed = false;
            for id in tables {
                let Some((header, table, mut rest)) = split_table(&mut pool.gc_pool, id) else {
                    continue;
                };
                header.nw2black();
                if self.traverse_ephemeron(header, table, &mut rest, id, inv) {
                    self.propagate_all(pool, roots);
                    changed = true;
                }
            }
            inv = !inv;
            if !changed {
                break;
            }
        }
    }

    /// Removes entries whose key was collected (`clearbykeys`).
    fn clear_by_keys(gc_pool: &mut GcPool, tables: &[TableId]) {
        for &id in tables {
            let Some((_, table, mut rest)) = split_table(gc_pool, id) else {
                continue;
            };
            for node in table.nodes_mut() {
                if let NodeKey::Live(k) = node.key {
                    if is_cleared(&mut rest, &k) {
                        node.value = LuaValue::Nil;
                    }
                }
                if node.value.is_nil() {
                    clear_key(node);
                }
            }
        }
    }

    /// Removes entries whose value was collected (`clearbyvalues`).
    fn clear_by_values(gc_pool: &mut GcPool, tables: &[TableId]) {
        for &id in tables {
            let Some((_, table, mut rest)) = split_table(gc_pool, id) else {
                continue;
            };
            for v in table.array_mut() {
                if is_cleared(&mut rest, v) {
                    *v = LuaValue::Nil;
                }
            }
            for node in table.nodes_mut() {
                if is_cleared(&mut rest, &node.value) {
                    node.value = LuaValue::Nil;
                }
                if node.value.is_nil() {
                    clear_key(node);
                }
            }
        }
    }

    // ============ Functions, userdata ============

    fn traverse_function(&mut self, gc_pool: &mut GcPool, id: FunctionId) -> usize {
        let Some((obj, mut rest)) = gc_pool.split_mut(id.0) else {
            return 0;
        };
        let GcObject { header, body } = obj;
        header.nw2black();
        match body {
            GcBody::Function(FunctionBody::Lua(cl)) => {
                for uv in &cl.upvalues {
                    self.mark_object(&mut rest, (*uv).into());
                }
                1 + cl.upvalues.len() + self.mark_chunk(&mut rest, &cl.chunk)
            }
            GcBody::Function(FunctionBody::C(cl)) => {
                for v in &cl.upvalues {
                    self.mark_value(&mut rest, v);
                }
                1 + cl.upvalues.len()
            }
            _ => 0,
        }
    }

    /// Constants of a prototype and its nested prototypes (`traverseproto`)
    fn mark_chunk<H: Heap + ?Sized>(&mut self, heap: &mut H, chunk: &Chunk) -> usize {
        let mut work = chunk.constants.len();
        for k in &chunk.constants {
            self.mark_value(heap, k);
        }
        for child in &chunk.child_protos {
            work += self.mark_chunk(heap, child);
        }
        work
    }

    fn traverse_userdata(&mut self, gc_pool: &mut GcPool, id: UserdataId) -> usize {
        let Some((obj, mut rest)) = gc_pool.split_mut(id.0) else {
            return 0;
        };
        let GcObject { header, body } = obj;
        header.nw2black();
        let GcBody::Userdata(ud) = body else {
            return 0;
        };
        if let Some(mt) = ud.metatable {
            self.mark_object(&mut rest, mt.into());
        }
        for v in &ud.user_values {
            self.mark_value(&mut rest, v);
        }
        self.gen_link(header, id.into());
        1 + ud.user_values.len()
    }

    // ============ Threads ============

    fn traverse_thread(&mut self, pool: &mut ObjectPool, roots: &mut GcRoots, id: ThreadId) -> usize {
        let Some(header) = pool.gc_pool.header_mut(id.0) else {
            return 0;
        };
        header.nw2black();
        // threads are always revisited: their stacks change without barriers
        if header.is_old() || self.gc_state == GcState::Propagate {
            header.make_gray();
            self.grayagain.push(id.into());
        }
        let gc_pool = &mut pool.gc_pool;
        if roots.state.thread_id == id {
            return self.traverse_state(gc_pool, roots.state);
        }
        if let Some(state) = roots.resumers.iter_mut().find(|s| s.thread_id == id) {
            return self.traverse_state(gc_pool, state);
        }
        // a parked thread: check its state out while marking through the arena
        let Some(mut state) = gc_pool.thread_mut(id).and_then(|t| t.state.take()) else {
            return 1;
        };
        let work = self.traverse_state(gc_pool, &mut state);
        if let Some(thread) = gc_pool.thread_mut(id) {
            thread.state = Some(state);
        }
        work
    }

    fn traverse_state(&mut self, gc_pool: &mut GcPool, state: &mut LuaState) -> usize {
        let top = state.gc_mark_top();
        for v in &state.stack[..top] {
            self.mark_value(gc_pool, v);
        }
        self.mark_value(gc_pool, &state.error_value);
        for uv in &state.open_upvalues {
            self.mark_object(gc_pool, (*uv).into());
        }
        if self.gc_state == GcState::Atomic {
            // final traversal: clear the dead part of the stack
            for v in &mut state.stack[top..] {
                *v = LuaValue::Nil;
            }
        } else if !self.gc_emergency {
            state.shrink_stack();
        }
        1 + state.stack.len()
    }

    /// Marks values of visited open upvalues whose thread is not marked,
    /// since nobody else will (`remarkupvals`).
    fn remark_upvalues(&mut self, pool: &mut ObjectPool) -> usize {
        let mut work = 0;
        let mut values = Vec::new();
        for &tid in &pool.threads {
            work += 1;
            let gc_pool = &pool.gc_pool;
            if !gc_pool.header(tid.0).is_some_and(|h| h.is_white()) {
                continue;
            }
            let Some(state) = gc_pool.thread(tid).and_then(|t| t.state.as_ref()) else {
                continue;
            };
            for uv in &state.open_upvalues {
                work += 1;
                if gc_pool.header(uv.0).is_some_and(|h| h.is_white()) {
                    continue;
                }
                if let Some(index) = gc_pool.upvalue(*uv).and_then(|u| u.stack_index()) {
                    if let Some(v) = state.stack.get(index) {
                        values.push(*v);
                    }
                }
            }
        }
        for v in &values {
            self.mark_value(&mut pool.gc_pool, v);
        }
        work
    }

    // ============ Finalizers ============

    /// Moves unreachable finalizable objects (or all of them, when closing)
    /// to `tobefnz`, newest first (`separatetobefnz`).
    pub(crate) fn separate_tobefnz(&mut self, gc_pool: &GcPool, all: bool) {
        let mut kept = Vec::with_capacity(self.finobj.len());
        for &id in self.finobj.iter().rev() {
            let Some(h) = gc_pool.header(id.gc_ref()) else {
                continue;
            };
            if all || h.is_white() {
                self.tobefnz.push_back(id);
            } else {
                kept.push(id);
            }
        }
        kept.reverse();
        self.finobj = kept;
    }

    // ============ Atomic phase ============

    /// Finishes marking in one go and clears weak tables (`atomic`).
    pub(crate) fn atomic(&mut self, pool: &mut ObjectPool, roots: &mut GcRoots) -> usize {
        let mut work = 0;
        let grayagain = std::mem::take(&mut self.grayagain);
        self.gc_state = GcState::Atomic;
        // registry, metatables and running threads may have changed
        self.mark_roots(pool, roots);
        work += self.propagate_all(pool, roots);
        work += self.remark_upvalues(pool);
        work += self.propagate_all(pool, roots);
        self.gray.extend(grayagain);
        work += self.propagate_all(pool, roots);
        self.converge_ephemerons(pool, roots);
        // all strongly reachable objects are marked; clear weak values
        // before resurrecting finalizable objects
        Self::clear_by_values(&mut pool.gc_pool, &self.weak);
        Self::clear_by_values(&mut pool.gc_pool, &self.allweak);
        let orig_weak = self.weak.len();
        let orig_all = self.allweak.len();
        self.separate_tobefnz(&pool.gc_pool, false);
        work += self.mark_being_fnz(&mut pool.gc_pool);
        work += self.propagate_all(pool, roots);
        self.converge_ephemerons(pool, roots);
        // resurrected objects are marked; drop dead entries
        Self::clear_by_keys(&mut pool.gc_pool, &self.ephemeron);
        Self::clear_by_keys(&mut pool.gc_pool, &self.allweak);
        // and values from tables that became weak during resurrection
        Self::clear_by_values(&mut pool.gc_pool, &self.weak[orig_weak..]);
        Self::clear_by_values(&mut pool.gc_pool, &self.allweak[orig_all..]);
        self.current_white = GcHeader::otherwhite(self.current_white);
        debug_assert!(self.gray.is_empty());
        work
    }

    // ============ Generational helpers ============

    /// Re-marks objects that just turned old so their young references get
    /// visited by this minor collection (`markold`).
    pub(crate) fn mark_old(&mut self, pool: &mut ObjectPool) {
        let old1 = std::mem::take(&mut self.old1);
        let current_white = self.current_white;
        for id in old1 {
            let Some(h) = pool.gc_pool.header_mut(id.gc_ref()) else {
                continue;
            };
            if h.age() != G_OLD1 {
                continue;
            }
            h.set_age(G_OLD);
            if h.is_black() {
                h.make_white(current_white);
                self.mark_object(&mut pool.gc_pool, id);
            }
        }
    }

    /// Trims gray lists after a generational cycle (`correctgraylists`):
    /// touched objects stay for the next cycle, threads always stay,
    /// everything else leaves black.
    pub(crate) fn correct_gray_lists(&mut self, pool: &mut ObjectPool) {
        let mut pending: Vec<GcId> = std::mem::take(&mut self.grayagain);
        pending.extend(self.weak.drain(..).map(GcId::from));
        pending.extend(self.allweak.drain(..).map(GcId::from));
        pending.extend(self.ephemeron.drain(..).map(GcId::from));
        for id in pending {
            let Some(h) = pool.gc_pool.header_mut(id.gc_ref()) else {
                continue;
            };
            if h.is_white() {
                continue;
            }
            if h.age() == G_TOUCHED1 {
                h.nw2black();
                h.set_age(G_TOUCHED2);
                self.grayagain.push(id);
            } else if matches!(id, GcId::ThreadId(_)) {
                self.grayagain.push(id);
            } else {
                if h.age() == G_TOUCHED2 {
                    h.set_age(G_OLD);
                }
                h.nw2black();
            }
        }
    }
}
