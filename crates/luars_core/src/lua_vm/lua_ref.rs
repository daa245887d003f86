// Registry references (lauxlib.c luaL_ref / luaL_unref)
//
// A reference is an integer key of the registry. Released keys form a
// linked free list threaded through the registry itself: slot
// `LUA_RIDX_FREELIST` holds the most recently released key, and every free
// slot holds the next one (0 ends the list).

use crate::lua_value::LuaValue;
use crate::lua_vm::lua_limits::{LUA_NOREF, LUA_REFNIL, LUA_RIDX_FREELIST};
use crate::lua_vm::LuaVM;

/// Registry key returned by `LuaVM::reference`
pub type RefId = i64;

impl LuaVM {
    /// Pops the value on top of the stack into the registry and returns a
    /// fresh key for it. `nil` is not stored and yields `LUA_REFNIL`.
    pub fn reference(&mut self) -> RefId {
        let v = self.state.pop();
        if v.is_nil() {
            return LUA_REFNIL;
        }
        let registry = self.registry;
        let head = self.table_raw_get_int(registry, LUA_RIDX_FREELIST);
        let id = match head {
            LuaValue::Integer(next) if next != 0 => {
                let following = self.table_raw_get_int(registry, next);
                self.table_raw_set_int(registry, LUA_RIDX_FREELIST, following);
                next
            }
            LuaValue::Integer(_) => self.registry_len() + 1,
            _ => {
                // first use: start an empty list
                self.table_raw_set_int(registry, LUA_RIDX_FREELIST, LuaValue::Integer(0));
                self.registry_len() + 1
            }
        };
        self.table_raw_set_int(registry, id, v);
        log::trace!("registry reference {} created", id);
        id
    }

    /// Releases `id`; the value becomes collectable and the key is reused
    /// by a later `reference`.
    pub fn unreference(&mut self, id: RefId) {
        if id < 0 || id == LUA_RIDX_FREELIST {
            return;
        }
        let registry = self.registry;
        let head = self.table_raw_get_int(registry, LUA_RIDX_FREELIST);
        let head = if head.is_nil() { LuaValue::Integer(0) } else { head };
        self.table_raw_set_int(registry, id, head);
        self.table_raw_set_int(registry, LUA_RIDX_FREELIST, LuaValue::Integer(id));
    }

    /// Value stored under `id`; `nil` for `LUA_REFNIL` and `LUA_NOREF`
    pub fn ref_value(&self, id: RefId) -> LuaValue {
        if id == LUA_REFNIL || id == LUA_NOREF || id <= 0 {
            return LuaValue::Nil;
        }
        self.table_raw_get_int(self.registry, id)
    }

    /// Pushes the value stored under `id`
    pub fn push_ref(&mut self, id: RefId) {
        let v = self.ref_value(id);
        self.state.push(v);
    }

    fn registry_len(&self) -> i64 {
        self.pool
            .gc_pool
            .table(self.registry)
            .map_or(0, |t| t.len() as i64)
    }
}

#[cfg(test)]
mod tests {
    use crate::lua_value::LuaValue;
    use crate::lua_vm::lua_limits::{LUA_REFNIL, LUA_RIDX_FREELIST};
    use crate::lua_vm::{LuaVM, SafeOption};

    #[test]
    fn test_nil_is_not_stored() {
        let mut vm = LuaVM::new(SafeOption::default());
        vm.state.push(LuaValue::Nil);
        assert_eq!(vm.reference(), LUA_REFNIL);
        assert!(vm.ref_value(LUA_REFNIL).is_nil());
    }

    #[test]
    fn test_released_ids_are_reused() {
        let mut vm = LuaVM::new(SafeOption::default());
        vm.state.push(LuaValue::Integer(10));
        let a = vm.reference();
        vm.state.push(LuaValue::Integer(20));
        let b = vm.reference();
        assert!(a > LUA_RIDX_FREELIST);
        assert_eq!(b, a + 1);
        assert!(matches!(vm.ref_value(a), LuaValue::Integer(10)));
        assert!(matches!(vm.ref_value(b), LuaValue::Integer(20)));

        vm.unreference(a);
        vm.state.push(LuaValue::Boolean(true));
        let c = vm.reference();
        assert_eq!(c, a);
        assert!(matches!(vm.ref_value(c), LuaValue::Boolean(true)));
        assert!(matches!(vm.ref_value(b), LuaValue::Integer(20)));
    }
}
