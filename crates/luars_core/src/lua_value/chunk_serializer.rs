// Binary chunks in the Lua 5.4 layout (ldump.c / lundump.c)
//
// Header: signature, version, format, LUAC_DATA, sizes of Instruction /
// lua_Integer / lua_Number, then LUAC_INT and LUAC_NUM in native byte order
// so loading on a platform with another representation fails early.
// Body: the number of upvalues of the main function and the prototype tree.
// Sizes and counts are MSB-first 7-bit varints whose last byte has bit 7 set.

use std::rc::Rc;

use smol_str::SmolStr;

use super::{AbsLineInfo, Chunk, LocVar, LuaValue, UpvalueDesc};
use super::lua_value::{LUA_VFALSE, LUA_VLNGSTR, LUA_VNIL, LUA_VNUMFLT, LUA_VNUMINT, LUA_VSHRSTR, LUA_VTRUE};
use crate::gc::{GC, ObjectPool};
use crate::lua_vm::Instruction;
use crate::lua_vm::lua_limits::LUAI_MAXSHORTLEN;

pub const LUA_SIGNATURE: &[u8] = b"\x1bLua";
pub const LUAC_VERSION: u8 = 0x54;
pub const LUAC_FORMAT: u8 = 0;
pub const LUAC_DATA: &[u8] = b"\x19\x93\r\n\x1a\n";
pub const LUAC_INT: i64 = 0x5678;
pub const LUAC_NUM: f64 = 370.5;

const SIZE_INSTRUCTION: u8 = 4;
const SIZE_INTEGER: u8 = 8;
const SIZE_NUMBER: u8 = 8;

// ============ Dump ============

struct DumpState<'a> {
    buf: Vec<u8>,
    pool: &'a ObjectPool,
    strip: bool,
}

impl DumpState<'_> {
    #[inline]
    fn byte(&mut self, b: u8) {
        self.buf.push(b);
    }

    fn size(&mut self, mut x: usize) {
        let mut tmp = [0u8; 10];
        let mut n = 0;
        loop {
            tmp[tmp.len() - 1 - n] = (x & 0x7f) as u8;
            n += 1;
            x >>= 7;
            if x == 0 {
                break;
            }
        }
        let last = tmp.len() - 1;
        tmp[last] |= 0x80;
        self.buf.extend_from_slice(&tmp[tmp.len() - n..]);
    }

    #[inline]
    fn int(&mut self, x: i64) {
        self.size(x.max(0) as usize);
    }

    #[inline]
    fn integer(&mut self, i: i64) {
        self.buf.extend_from_slice(&i.to_ne_bytes());
    }

    #[inline]
    fn number(&mut self, n: f64) {
        self.buf.extend_from_slice(&n.to_ne_bytes());
    }

    fn string(&mut self, s: Option<&[u8]>) {
        match s {
            None => self.size(0),
            Some(bytes) => {
                self.size(bytes.len() + 1);
                self.buf.extend_from_slice(bytes);
            }
        }
    }

    fn header(&mut self) {
        self.buf.extend_from_slice(LUA_SIGNATURE);
        self.byte(LUAC_VERSION);
        self.byte(LUAC_FORMAT);
        self.buf.extend_from_slice(LUAC_DATA);
        self.byte(SIZE_INSTRUCTION);
        self.byte(SIZE_INTEGER);
        self.byte(SIZE_NUMBER);
        self.integer(LUAC_INT);
        self.number(LUAC_NUM);
    }

    fn constants(&mut self, chunk: &Chunk) {
        self.int(chunk.constants.len() as i64);
        for k in &chunk.constants {
            match k {
                LuaValue::Nil => self.byte(LUA_VNIL),
                LuaValue::Boolean(false) => self.byte(LUA_VFALSE),
                LuaValue::Boolean(true) => self.byte(LUA_VTRUE),
                LuaValue::Integer(i) => {
                    self.byte(LUA_VNUMINT);
                    self.integer(*i);
                }
                LuaValue::Float(n) => {
                    self.byte(LUA_VNUMFLT);
                    self.number(*n);
                }
                LuaValue::String(id) => {
                    let pool = self.pool;
                    let bytes = pool.str_bytes(*id);
                    let tag = if bytes.len() <= LUAI_MAXSHORTLEN {
                        LUA_VSHRSTR
                    } else {
                        LUA_VLNGSTR
                    };
                    self.byte(tag);
                    self.string(Some(bytes));
                }
                // constant pools only ever hold the types above
                _ => self.byte(LUA_VNIL),
            }
        }
    }

    fn upvalues(&mut self, chunk: &Chunk) {
        self.int(chunk.upvalue_descs.len() as i64);
        for up in &chunk.upvalue_descs {
            self.byte(up.in_stack as u8);
            self.byte(up.index);
            self.byte(up.kind);
        }
    }

    fn debug(&mut self, chunk: &Chunk) {
        let strip = self.strip;
        let line_info: &[i8] = if strip { &[] } else { &chunk.line_info };
        self.int(line_info.len() as i64);
        self.buf.extend(line_info.iter().map(|d| *d as u8));
        let abs: &[AbsLineInfo] = if strip { &[] } else { &chunk.abs_line_info };
        self.int(abs.len() as i64);
        for a in abs {
            self.int(a.pc as i64);
            self.int(a.line as i64);
        }
        let locals: &[LocVar] = if strip { &[] } else { &chunk.locals };
        self.int(locals.len() as i64);
        for local in locals {
            self.string(Some(local.name.as_bytes()));
            self.int(local.start_pc as i64);
            self.int(local.end_pc as i64);
        }
        let nup = if strip { 0 } else { chunk.upvalue_descs.len() };
        self.int(nup as i64);
        for up in &chunk.upvalue_descs[..nup] {
            self.string(Some(up.name.as_bytes()));
        }
    }

    fn function(&mut self, chunk: &Chunk, parent_source: Option<&SmolStr>) {
        if self.strip || chunk.source.as_ref() == parent_source {
            self.string(None);
        } else {
            self.string(chunk.source.as_ref().map(|s| s.as_bytes()));
        }
        self.int(chunk.linedefined as i64);
        self.int(chunk.lastlinedefined as i64);
        self.byte(chunk.param_count as u8);
        self.byte(chunk.is_vararg as u8);
        self.byte(chunk.max_stack_size as u8);
        self.int(chunk.code.len() as i64);
        for instr in &chunk.code {
            self.buf.extend_from_slice(&instr.as_u32().to_ne_bytes());
        }
        self.constants(chunk);
        self.upvalues(chunk);
        self.int(chunk.child_protos.len() as i64);
        for child in &chunk.child_protos {
            self.function(child, chunk.source.as_ref());
        }
        self.debug(chunk);
    }
}

/// Serializes a main prototype (`luaU_dump`). With `strip` set, debug
/// information is left out.
pub fn dump_chunk(chunk: &Chunk, pool: &ObjectPool, strip: bool) -> Vec<u8> {
    let mut d = DumpState {
        buf: Vec::with_capacity(64 + chunk.code.len() * 4),
        pool,
        strip,
    };
    d.header();
    d.byte(chunk.upvalue_descs.len() as u8);
    d.function(chunk, None);
    d.buf
}

// ============ Undump ============

struct LoadState<'a> {
    data: &'a [u8],
    pos: usize,
    name: &'a str,
    pool: &'a mut ObjectPool,
    gc: &'a mut GC,
}

impl LoadState<'_> {
    fn error(&self, why: &str) -> String {
        format!("{}: bad binary format ({})", self.name, why)
    }

    fn block(&mut self, n: usize) -> Result<&[u8], String> {
        if self.data.len() - self.pos < n {
            return Err(self.error("truncated chunk"));
        }
        let bytes = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }

    fn byte(&mut self) -> Result<u8, String> {
        Ok(self.block(1)?[0])
    }

    fn size_limited(&mut self, limit: usize) -> Result<usize, String> {
        let limit = limit >> 7;
        let mut x: usize = 0;
        loop {
            let b = self.byte()?;
            if x >= limit {
                return Err(self.error("integer overflow"));
            }
            x = (x << 7) | (b & 0x7f) as usize;
            if b & 0x80 != 0 {
                return Ok(x);
            }
        }
    }

    #[inline]
    fn size(&mut self) -> Result<usize, String> {
        self.size_limited(usize::MAX)
    }

    #[inline]
    fn int(&mut self) -> Result<i64, String> {
        Ok(self.size_limited(i32::MAX as usize)? as i64)
    }

    fn integer(&mut self) -> Result<i64, String> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.block(8)?);
        Ok(i64::from_ne_bytes(raw))
    }

    fn number(&mut self) -> Result<f64, String> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.block(8)?);
        Ok(f64::from_ne_bytes(raw))
    }

    /// Size-prefixed string; `None` for the empty marker.
    fn raw_string(&mut self) -> Result<Option<Vec<u8>>, String> {
        let size = self.size()?;
        if size == 0 {
            return Ok(None);
        }
        Ok(Some(self.block(size - 1)?.to_vec()))
    }

    fn name_string(&mut self) -> Result<SmolStr, String> {
        Ok(self
            .raw_string()?
            .map(|b| SmolStr::new(String::from_utf8_lossy(&b)))
            .unwrap_or_default())
    }

    fn literal(&mut self, lit: &[u8], why: &str) -> Result<(), String> {
        if self.block(lit.len())? != lit {
            return Err(self.error(why));
        }
        Ok(())
    }

    fn check_size(&mut self, expected: u8, tname: &str) -> Result<(), String> {
        if self.byte()? != expected {
            return Err(self.error(&format!("{} size mismatch", tname)));
        }
        Ok(())
    }

    fn header(&mut self) -> Result<(), String> {
        self.literal(LUA_SIGNATURE, "not a binary chunk")?;
        if self.byte()? != LUAC_VERSION {
            return Err(self.error("version mismatch"));
        }
        if self.byte()? != LUAC_FORMAT {
            return Err(self.error("format mismatch"));
        }
        self.literal(LUAC_DATA, "corrupted chunk")?;
        self.check_size(SIZE_INSTRUCTION, "Instruction")?;
        self.check_size(SIZE_INTEGER, "lua_Integer")?;
        self.check_size(SIZE_NUMBER, "lua_Number")?;
        if self.integer()? != LUAC_INT {
            return Err(self.error("integer format mismatch"));
        }
        if self.number()? != LUAC_NUM {
            return Err(self.error("float format mismatch"));
        }
        Ok(())
    }

    fn code(&mut self, chunk: &mut Chunk) -> Result<(), String> {
        let n = self.int()? as usize;
        let raw = self.block(n * 4)?;
        let mut code = Vec::with_capacity(n);
        for word in raw.chunks_exact(4) {
            let instr = Instruction::from_u32(u32::from_ne_bytes([word[0], word[1], word[2], word[3]]));
            code.push(instr);
        }
        if code.iter().any(|i| i.get_opcode().is_none()) {
            return Err(self.error("invalid opcode"));
        }
        chunk.code = code;
        Ok(())
    }

    fn constants(&mut self, chunk: &mut Chunk) -> Result<(), String> {
        let n = self.int()? as usize;
        let mut constants = Vec::with_capacity(n.min(self.data.len()));
        for _ in 0..n {
            let tag = self.byte()?;
            let k = match tag {
                LUA_VNIL => LuaValue::Nil,
                LUA_VFALSE => LuaValue::Boolean(false),
                LUA_VTRUE => LuaValue::Boolean(true),
                LUA_VNUMFLT => LuaValue::Float(self.number()?),
                LUA_VNUMINT => LuaValue::Integer(self.integer()?),
                LUA_VSHRSTR | LUA_VLNGSTR => {
                    let Some(bytes) = self.raw_string()? else {
                        return Err(self.error("bad format for constant string"));
                    };
                    LuaValue::String(self.pool.create_string(self.gc, &bytes))
                }
                _ => return Err(self.error("invalid constant")),
            };
            constants.push(k);
        }
        chunk.constants = constants;
        Ok(())
    }

    fn upvalues(&mut self, chunk: &mut Chunk) -> Result<(), String> {
        let n = self.int()? as usize;
        let mut descs = Vec::with_capacity(n.min(256));
        for _ in 0..n {
            let in_stack = self.byte()? != 0;
            let index = self.byte()?;
            let kind = self.byte()?;
            descs.push(UpvalueDesc {
                name: SmolStr::default(),
                in_stack,
                index,
                kind,
            });
        }
        chunk.upvalue_descs = descs;
        Ok(())
    }

    fn debug(&mut self, chunk: &mut Chunk) -> Result<(), String> {
        let n = self.int()? as usize;
        chunk.line_info = self.block(n)?.iter().map(|b| *b as i8).collect();
        let n = self.int()? as usize;
        let mut abs = Vec::with_capacity(n.min(self.data.len()));
        for _ in 0..n {
            let pc = self.int()? as u32;
            let line = self.int()? as i32;
            abs.push(AbsLineInfo { pc, line });
        }
        chunk.abs_line_info = abs;
        let n = self.int()? as usize;
        let mut locals = Vec::with_capacity(n.min(self.data.len()));
        for _ in 0..n {
            let name = self.name_string()?;
            let start_pc = self.int()? as u32;
            let end_pc = self.int()? as u32;
            locals.push(LocVar {
                name,
                start_pc,
                end_pc,
            });
        }
        chunk.locals = locals;
        let n = self.int()? as usize;
        if n != 0 && n != chunk.upvalue_descs.len() {
            return Err(self.error("bad upvalue names"));
        }
        for i in 0..n {
            chunk.upvalue_descs[i].name = self.name_string()?;
        }
        Ok(())
    }

    fn function(&mut self, parent_source: Option<&SmolStr>) -> Result<Chunk, String> {
        let mut chunk = Chunk::new();
        chunk.source = match self.raw_string()? {
            Some(b) => Some(SmolStr::new(String::from_utf8_lossy(&b))),
            None => parent_source.cloned(),
        };
        chunk.linedefined = self.int()? as u32;
        chunk.lastlinedefined = self.int()? as u32;
        chunk.param_count = self.byte()? as usize;
        chunk.is_vararg = self.byte()? != 0;
        chunk.max_stack_size = self.byte()? as usize;
        self.code(&mut chunk)?;
        self.constants(&mut chunk)?;
        self.upvalues(&mut chunk)?;
        let nprotos = self.int()? as usize;
        let mut children = Vec::with_capacity(nprotos.min(self.data.len()));
        for _ in 0..nprotos {
            let child = self.function(chunk.source.as_ref())?;
            children.push(Rc::new(child));
        }
        chunk.child_protos = children;
        self.debug(&mut chunk)?;
        Ok(chunk)
    }
}

/// Display name used in load errors (`luaU_undump`)
fn chunk_display_name(name: &str) -> &str {
    if let Some(rest) = name.strip_prefix('@').or_else(|| name.strip_prefix('=')) {
        rest
    } else if name.as_bytes().first() == Some(&LUA_SIGNATURE[0]) {
        "binary string"
    } else {
        name
    }
}

/// Loads a binary chunk. Returns the main prototype; string constants are
/// created in `pool`. Errors carry the full message
/// ("<name>: bad binary format (...)").
pub fn undump_chunk(
    data: &[u8],
    pool: &mut ObjectPool,
    gc: &mut GC,
    name: &str,
) -> Result<Chunk, String> {
    let mut s = LoadState {
        data,
        pos: 0,
        name: chunk_display_name(name),
        pool,
        gc,
    };
    s.header()?;
    let nupvalues = s.byte()? as usize;
    let chunk = s.function(None)?;
    if chunk.upvalue_descs.len() != nupvalues {
        return Err(s.error("bad upvalue count"));
    }
    Ok(chunk)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lua_vm::OpCode;

    fn state() -> (GC, ObjectPool) {
        let mut gc = GC::new();
        let pool = ObjectPool::new(&mut gc, 0);
        (gc, pool)
    }

    #[test]
    fn test_varint_layout() {
        let (_gc, pool) = state();
        let mut d = DumpState {
            buf: Vec::new(),
            pool: &pool,
            strip: false,
        };
        d.size(0);
        d.size(127);
        d.size(128);
        assert_eq!(d.buf, vec![0x80, 0xff, 0x01, 0x80]);
    }

    #[test]
    fn test_header_errors() {
        let (mut gc, mut pool) = state();
        let chunk = Chunk::new();
        let good = dump_chunk(&chunk, &pool, false);
        assert!(undump_chunk(&good, &mut pool, &mut gc, "=t").is_ok());

        let mut bad = good.clone();
        bad[4] = 0x53;
        let err = undump_chunk(&bad, &mut pool, &mut gc, "=t").unwrap_err();
        assert_eq!(err, "t: bad binary format (version mismatch)");

        let mut bad = good.clone();
        bad[5] = 1;
        let err = undump_chunk(&bad, &mut pool, &mut gc, "@f.luac").unwrap_err();
        assert_eq!(err, "f.luac: bad binary format (format mismatch)");

        // LUAC_INT starts after signature(4) version format data(6) sizes(3)
        let mut bad = good.clone();
        bad[15] ^= 0xff;
        let err = undump_chunk(&bad, &mut pool, &mut gc, "\x1bLua").unwrap_err();
        assert_eq!(err, "binary string: bad binary format (integer format mismatch)");

        let mut bad = good.clone();
        bad[23] ^= 0x01;
        let err = undump_chunk(&bad, &mut pool, &mut gc, "=t").unwrap_err();
        assert!(err.ends_with("(float format mismatch)"));

        let err = undump_chunk(&good[..good.len() - 1], &mut pool, &mut gc, "=t").unwrap_err();
        assert!(err.ends_with("(truncated chunk)"));
    }

    #[test]
    fn test_source_elided_for_children() {
        let (mut gc, mut pool) = state();
        let mut child = Chunk::new();
        child.source = Some("@x.lua".into());
        let mut main = Chunk::new();
        main.source = Some("@x.lua".into());
        main.child_protos.push(Rc::new(child));
        let bytes = dump_chunk(&main, &pool, false);
        let loaded = undump_chunk(&bytes, &mut pool, &mut gc, "=x").unwrap();
        assert_eq!(loaded.child_protos[0].source.as_deref(), Some("@x.lua"));

        let stripped = dump_chunk(&main, &pool, true);
        assert!(stripped.len() < bytes.len());
        let loaded = undump_chunk(&stripped, &mut pool, &mut gc, "=x").unwrap();
        assert_eq!(loaded.source, None);
    }

    #[test]
    fn test_round_trip_is_exact() {
        let (mut gc, mut pool) = state();
        let mut chunk = Chunk::new();
        chunk.source = Some("@round.lua".into());
        chunk.linedefined = 3;
        chunk.max_stack_size = 4;
        let short = pool.create_string(&mut gc, b"short");
        let long = pool.create_string(&mut gc, &[b'z'; 100]);
        chunk.constants = vec![
            LuaValue::Nil,
            LuaValue::Boolean(true),
            LuaValue::Integer(i64::MIN),
            LuaValue::Float(-0.0),
            LuaValue::Float(f64::INFINITY),
            LuaValue::Float(0.1),
            LuaValue::String(short),
            LuaValue::String(long),
        ];
        // far line jumps and long runs both force absolute entries
        let mut line = 3;
        for pc in 0..310u32 {
            line += match pc % 50 {
                0 => 200,
                25 => -150,
                _ => 1,
            };
            let i = Instruction::create_abx(OpCode::LoadK, pc % 4, pc % 8);
            chunk.push_instruction(i, line);
        }
        chunk.lastlinedefined = line as u32;
        assert!(chunk.abs_line_info.len() >= 7);

        let bytes = dump_chunk(&chunk, &pool, false);
        let loaded = undump_chunk(&bytes, &mut pool, &mut gc, "=round").unwrap();

        assert_eq!(loaded.code, chunk.code);
        assert_eq!(loaded.line_info, chunk.line_info);
        assert_eq!(loaded.abs_line_info, chunk.abs_line_info);
        for pc in 0..chunk.code.len() {
            assert_eq!(loaded.line_at(pc), chunk.line_at(pc), "pc {}", pc);
        }
        assert_eq!(loaded.linedefined, 3);
        assert_eq!(loaded.lastlinedefined, chunk.lastlinedefined);

        assert_eq!(loaded.constants.len(), chunk.constants.len());
        for (a, b) in loaded.constants.iter().zip(&chunk.constants) {
            match (a, b) {
                (LuaValue::Float(x), LuaValue::Float(y)) => assert_eq!(x.to_bits(), y.to_bits()),
                (LuaValue::String(x), LuaValue::String(y)) => assert_eq!(
                    pool.string(*x).unwrap().as_bytes(),
                    pool.string(*y).unwrap().as_bytes()
                ),
                _ => assert_eq!(a, b),
            }
        }
    }
}
