//! Streaming pickle reader, protocols 0 through 5.
//!
//! The dispatcher is a single flat `match` over the opcode byte; each arm
//! is one opcode.  Only the value lattice in [`Value`] is materialised;
//! object construction, persistent IDs, the extension registry, and
//! out-of-band buffers are refused with a clean error instead of being
//! half-implemented.
//!
//! Memoized values are duplicated eagerly.  The index lattice is acyclic,
//! so structural equality is preserved even though sharing is not.

use std::collections::HashMap;
use std::io::{Cursor, Read};

use byteorder::{BigEndian, LittleEndian, ReadBytesExt};

use super::value::Value;
use super::PickleError;

// Protocol 0 (text) opcodes.
const MARK: u8 = b'(';
const STOP: u8 = b'.';
const POP: u8 = b'0';
const POP_MARK: u8 = b'1';
const DUP: u8 = b'2';
const FLOAT: u8 = b'F';
const INT: u8 = b'I';
const LONG: u8 = b'L';
const NONE: u8 = b'N';
const PERSID: u8 = b'P';
const REDUCE: u8 = b'R';
const STRING: u8 = b'S';
const UNICODE: u8 = b'V';
const APPEND: u8 = b'a';
const BUILD: u8 = b'b';
const GLOBAL: u8 = b'c';
const DICT: u8 = b'd';
const EMPTY_DICT: u8 = b'}';
const APPENDS: u8 = b'e';
const GET: u8 = b'g';
const INST: u8 = b'i';
const LIST: u8 = b'l';
const EMPTY_LIST: u8 = b']';
const OBJ: u8 = b'o';
const PUT: u8 = b'p';
const SETITEM: u8 = b's';
const TUPLE: u8 = b't';
const EMPTY_TUPLE: u8 = b')';
const SETITEMS: u8 = b'u';

// Protocol 1 (binary) opcodes.
const BINPERSID: u8 = b'Q';
const BININT: u8 = b'J';
const BININT1: u8 = b'K';
const BININT2: u8 = b'M';
const BINFLOAT: u8 = b'G';
const BINSTRING: u8 = b'T';
const SHORT_BINSTRING: u8 = b'U';
const BINUNICODE: u8 = b'X';
const BINGET: u8 = b'h';
const LONG_BINGET: u8 = b'j';
const BINPUT: u8 = b'q';
const LONG_BINPUT: u8 = b'r';

// Protocol 2.
const PROTO: u8 = 0x80;
const NEWOBJ: u8 = 0x81;
const EXT1: u8 = 0x82;
const EXT2: u8 = 0x83;
const EXT4: u8 = 0x84;
const TUPLE1: u8 = 0x85;
const TUPLE2: u8 = 0x86;
const TUPLE3: u8 = 0x87;
const NEWTRUE: u8 = 0x88;
const NEWFALSE: u8 = 0x89;
const LONG1: u8 = 0x8a;
const LONG4: u8 = 0x8b;

// Protocol 3.
const BINBYTES: u8 = b'B';
const SHORT_BINBYTES: u8 = b'C';

// Protocol 4.
const SHORT_BINUNICODE: u8 = 0x8c;
const BINUNICODE8: u8 = 0x8d;
const BINBYTES8: u8 = 0x8e;
const EMPTY_SET: u8 = 0x8f;
const ADDITEMS: u8 = 0x90;
const FROZENSET: u8 = 0x91;
const NEWOBJ_EX: u8 = 0x92;
const STACK_GLOBAL: u8 = 0x93;
const MEMOIZE: u8 = 0x94;
const FRAME: u8 = 0x95;

// Protocol 5.
const BYTEARRAY8: u8 = 0x96;
const NEXT_BUFFER: u8 = 0x97;
const READONLY_BUFFER: u8 = 0x98;

/// Highest protocol this reader understands.
pub const HIGHEST_PROTOCOL: u8 = 5;

/// Decode one pickled value from `data`.
pub fn loads(data: &[u8]) -> Result<Value, PickleError> {
    Unpickler::new(data).run()
}

struct Unpickler<'a> {
    cur: Cursor<&'a [u8]>,
    stack: Vec<Value>,
    marks: Vec<usize>,
    memo: HashMap<u32, Value>,
}

impl<'a> Unpickler<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self {
            cur: Cursor::new(data),
            stack: Vec::new(),
            marks: Vec::new(),
            memo: HashMap::new(),
        }
    }

    fn run(&mut self) -> Result<Value, PickleError> {
        loop {
            let pos = self.cur.position();
            let op = self.read_u8()?;
            match op {
                STOP => return self.pop(pos),

                // ── Scalars ─────────────────────────────────────────────
                NONE => self.stack.push(Value::None),
                NEWTRUE => self.stack.push(Value::Bool(true)),
                NEWFALSE => self.stack.push(Value::Bool(false)),
                INT => {
                    let line = self.read_line()?;
                    // Protocol 0 spells booleans as INT 01 / INT 00.
                    let v = match line.as_slice() {
                        b"01" => Value::Bool(true),
                        b"00" => Value::Bool(false),
                        text => Value::Int(parse_int_line(text)?),
                    };
                    self.stack.push(v);
                }
                LONG => {
                    let mut line = self.read_line()?;
                    if line.last().map(|c| *c == b'L' || *c == b'l').unwrap_or(false) {
                        line.pop();
                    }
                    self.stack.push(Value::Int(parse_int_line(&line)?));
                }
                BININT => {
                    let v = self.cur.read_i32::<LittleEndian>().map_err(eof)?;
                    self.stack.push(Value::Int(v as i64));
                }
                BININT1 => {
                    let v = self.read_u8()?;
                    self.stack.push(Value::Int(v as i64));
                }
                BININT2 => {
                    let v = self.cur.read_u16::<LittleEndian>().map_err(eof)?;
                    self.stack.push(Value::Int(v as i64));
                }
                LONG1 => {
                    let n = self.read_u8()? as usize;
                    let bytes = self.read_bytes(n)?;
                    self.stack.push(Value::Int(decode_long_le(&bytes)?));
                }
                LONG4 => {
                    let n = self.cur.read_u32::<LittleEndian>().map_err(eof)? as usize;
                    let bytes = self.read_bytes(n)?;
                    self.stack.push(Value::Int(decode_long_le(&bytes)?));
                }
                FLOAT => {
                    let line = self.read_line()?;
                    let text = String::from_utf8_lossy(&line).into_owned();
                    let v: f64 = text.parse().map_err(|_| PickleError::BadArgument {
                        what: "FLOAT",
                        detail: text,
                    })?;
                    self.stack.push(Value::Float(v));
                }
                BINFLOAT => {
                    let v = self.cur.read_f64::<BigEndian>().map_err(eof)?;
                    self.stack.push(Value::Float(v));
                }

                // ── Strings and bytes ───────────────────────────────────
                STRING => {
                    let line = self.read_line()?;
                    self.stack.push(Value::Str(unescape_repr(&line)?));
                }
                BINSTRING => {
                    let n = self.cur.read_u32::<LittleEndian>().map_err(eof)? as usize;
                    let bytes = self.read_bytes(n)?;
                    self.stack.push(Value::Str(latin1(&bytes)));
                }
                SHORT_BINSTRING => {
                    let n = self.read_u8()? as usize;
                    let bytes = self.read_bytes(n)?;
                    self.stack.push(Value::Str(latin1(&bytes)));
                }
                UNICODE => {
                    let line = self.read_line()?;
                    self.stack.push(Value::Str(decode_raw_unicode_escape(&line)?));
                }
                BINUNICODE => {
                    let n = self.cur.read_u32::<LittleEndian>().map_err(eof)? as usize;
                    let bytes = self.read_bytes(n)?;
                    self.stack.push(Value::Str(utf8(bytes)?));
                }
                SHORT_BINUNICODE => {
                    let n = self.read_u8()? as usize;
                    let bytes = self.read_bytes(n)?;
                    self.stack.push(Value::Str(utf8(bytes)?));
                }
                BINUNICODE8 => {
                    let n = self.read_len64()?;
                    let bytes = self.read_bytes(n)?;
                    self.stack.push(Value::Str(utf8(bytes)?));
                }
                BINBYTES => {
                    let n = self.cur.read_u32::<LittleEndian>().map_err(eof)? as usize;
                    let bytes = self.read_bytes(n)?;
                    self.stack.push(Value::Bytes(bytes));
                }
                SHORT_BINBYTES => {
                    let n = self.read_u8()? as usize;
                    let bytes = self.read_bytes(n)?;
                    self.stack.push(Value::Bytes(bytes));
                }
                BINBYTES8 | BYTEARRAY8 => {
                    let n = self.read_len64()?;
                    let bytes = self.read_bytes(n)?;
                    self.stack.push(Value::Bytes(bytes));
                }

                // ── Containers ──────────────────────────────────────────
                MARK => self.marks.push(self.stack.len()),
                EMPTY_TUPLE => self.stack.push(Value::Tuple(Vec::new())),
                EMPTY_LIST => self.stack.push(Value::List(Vec::new())),
                EMPTY_DICT => self.stack.push(Value::Dict(Vec::new())),
                EMPTY_SET => self.stack.push(Value::Set(Vec::new())),
                TUPLE => {
                    let items = self.pop_to_mark(pos)?;
                    self.stack.push(Value::Tuple(items));
                }
                TUPLE1 | TUPLE2 | TUPLE3 => {
                    let arity = (op - TUPLE1 + 1) as usize;
                    if self.stack.len() < arity {
                        return Err(PickleError::StackUnderflow(pos));
                    }
                    let items = self.stack.split_off(self.stack.len() - arity);
                    self.stack.push(Value::Tuple(items));
                }
                LIST => {
                    let items = self.pop_to_mark(pos)?;
                    self.stack.push(Value::List(items));
                }
                DICT => {
                    let items = self.pop_to_mark(pos)?;
                    if items.len() % 2 != 0 {
                        return Err(PickleError::BadArgument {
                            what: "DICT",
                            detail: "odd number of stack items".into(),
                        });
                    }
                    let mut pairs = Vec::with_capacity(items.len() / 2);
                    let mut it = items.into_iter();
                    while let (Some(k), Some(v)) = (it.next(), it.next()) {
                        dict_insert(&mut pairs, k, v);
                    }
                    self.stack.push(Value::Dict(pairs));
                }
                FROZENSET => {
                    let items = self.pop_to_mark(pos)?;
                    self.stack.push(Value::Set(items));
                }
                APPEND => {
                    let v = self.pop(pos)?;
                    match self.stack.last_mut() {
                        Some(Value::List(items)) => items.push(v),
                        Some(_) => return Err(PickleError::TypeMismatch("APPEND")),
                        None => return Err(PickleError::StackUnderflow(pos)),
                    }
                }
                APPENDS => {
                    let items = self.pop_to_mark(pos)?;
                    match self.stack.last_mut() {
                        Some(Value::List(list)) => list.extend(items),
                        Some(_) => return Err(PickleError::TypeMismatch("APPENDS")),
                        None => return Err(PickleError::StackUnderflow(pos)),
                    }
                }
                SETITEM => {
                    let v = self.pop(pos)?;
                    let k = self.pop(pos)?;
                    match self.stack.last_mut() {
                        Some(Value::Dict(pairs)) => dict_insert(pairs, k, v),
                        Some(_) => return Err(PickleError::TypeMismatch("SETITEM")),
                        None => return Err(PickleError::StackUnderflow(pos)),
                    }
                }
                SETITEMS => {
                    let items = self.pop_to_mark(pos)?;
                    if items.len() % 2 != 0 {
                        return Err(PickleError::BadArgument {
                            what: "SETITEMS",
                            detail: "odd number of stack items".into(),
                        });
                    }
                    match self.stack.last_mut() {
                        Some(Value::Dict(pairs)) => {
                            let mut it = items.into_iter();
                            while let (Some(k), Some(v)) = (it.next(), it.next()) {
                                dict_insert(pairs, k, v);
                            }
                        }
                        Some(_) => return Err(PickleError::TypeMismatch("SETITEMS")),
                        None => return Err(PickleError::StackUnderflow(pos)),
                    }
                }
                ADDITEMS => {
                    let items = self.pop_to_mark(pos)?;
                    match self.stack.last_mut() {
                        Some(Value::Set(set)) => set.extend(items),
                        Some(_) => return Err(PickleError::TypeMismatch("ADDITEMS")),
                        None => return Err(PickleError::StackUnderflow(pos)),
                    }
                }

                // ── Globals ─────────────────────────────────────────────
                GLOBAL => {
                    let module = latin1(&self.read_line()?);
                    let name = latin1(&self.read_line()?);
                    self.stack.push(Value::Global { module, name });
                }
                STACK_GLOBAL => {
                    let name = self.pop(pos)?;
                    let module = self.pop(pos)?;
                    match (module, name) {
                        (Value::Str(module), Value::Str(name)) => {
                            self.stack.push(Value::Global { module, name });
                        }
                        _ => return Err(PickleError::TypeMismatch("STACK_GLOBAL")),
                    }
                }
                REDUCE => {
                    let args = self.pop(pos)?;
                    let callable = self.pop(pos)?;
                    self.stack.push(apply_reduce(callable, args)?);
                }

                // ── Memo and stack bookkeeping ──────────────────────────
                PUT => {
                    let line = self.read_line()?;
                    let slot = parse_memo_line(&line)?;
                    self.memo_put(slot, pos)?;
                }
                BINPUT => {
                    let slot = self.read_u8()? as u32;
                    self.memo_put(slot, pos)?;
                }
                LONG_BINPUT => {
                    let slot = self.cur.read_u32::<LittleEndian>().map_err(eof)?;
                    self.memo_put(slot, pos)?;
                }
                MEMOIZE => {
                    let slot = self.memo.len() as u32;
                    self.memo_put(slot, pos)?;
                }
                GET => {
                    let line = self.read_line()?;
                    let slot = parse_memo_line(&line)?;
                    self.memo_get(slot)?;
                }
                BINGET => {
                    let slot = self.read_u8()? as u32;
                    self.memo_get(slot)?;
                }
                LONG_BINGET => {
                    let slot = self.cur.read_u32::<LittleEndian>().map_err(eof)?;
                    self.memo_get(slot)?;
                }
                POP => {
                    if self.stack.pop().is_none() {
                        // A bare mark can be popped too.
                        self.marks.pop().ok_or(PickleError::StackUnderflow(pos))?;
                    }
                }
                POP_MARK => {
                    self.pop_to_mark(pos)?;
                }
                DUP => {
                    let top = self.stack.last().cloned().ok_or(PickleError::StackUnderflow(pos))?;
                    self.stack.push(top);
                }

                // ── Framing and protocol markers ────────────────────────
                PROTO => {
                    let version = self.read_u8()?;
                    if version > HIGHEST_PROTOCOL {
                        return Err(PickleError::Unsupported(format!(
                            "pickle protocol {version}"
                        )));
                    }
                }
                FRAME => {
                    // Frame length is advisory; the opcodes carry their own
                    // sizes, so the frame header is skipped.
                    self.cur.read_u64::<LittleEndian>().map_err(eof)?;
                }

                // ── Explicitly refused features ─────────────────────────
                PERSID => {
                    self.read_line()?;
                    return Err(PickleError::Unsupported("persistent id".into()));
                }
                BINPERSID => return Err(PickleError::Unsupported("persistent id".into())),
                EXT1 | EXT2 | EXT4 => {
                    return Err(PickleError::Unsupported("extension registry".into()))
                }
                NEWOBJ | NEWOBJ_EX | INST | OBJ | BUILD => {
                    return Err(PickleError::Unsupported("object construction".into()))
                }
                NEXT_BUFFER | READONLY_BUFFER => {
                    return Err(PickleError::Unsupported("out-of-band buffer".into()))
                }

                other => return Err(PickleError::UnknownOpcode(other, pos)),
            }
        }
    }

    // ── Cursor helpers ──────────────────────────────────────────────────

    fn read_u8(&mut self) -> Result<u8, PickleError> {
        self.cur.read_u8().map_err(eof)
    }

    fn read_len64(&mut self) -> Result<usize, PickleError> {
        let n = self.cur.read_u64::<LittleEndian>().map_err(eof)?;
        usize::try_from(n).map_err(|_| PickleError::Truncated)
    }

    fn read_bytes(&mut self, n: usize) -> Result<Vec<u8>, PickleError> {
        let remaining = self.cur.get_ref().len() as u64 - self.cur.position();
        if (n as u64) > remaining {
            return Err(PickleError::Truncated);
        }
        let mut buf = vec![0u8; n];
        self.cur.read_exact(&mut buf).map_err(eof)?;
        Ok(buf)
    }

    /// Read up to (and consuming) the next newline.
    fn read_line(&mut self) -> Result<Vec<u8>, PickleError> {
        let data = *self.cur.get_ref();
        let start = self.cur.position() as usize;
        let rel = data[start..]
            .iter()
            .position(|&b| b == b'\n')
            .ok_or(PickleError::Truncated)?;
        self.cur.set_position((start + rel + 1) as u64);
        Ok(data[start..start + rel].to_vec())
    }

    // ── Stack helpers ───────────────────────────────────────────────────

    fn pop(&mut self, pos: u64) -> Result<Value, PickleError> {
        self.stack.pop().ok_or(PickleError::StackUnderflow(pos))
    }

    fn pop_to_mark(&mut self, pos: u64) -> Result<Vec<Value>, PickleError> {
        let mark = self.marks.pop().ok_or(PickleError::NoMark(pos))?;
        if mark > self.stack.len() {
            return Err(PickleError::StackUnderflow(pos));
        }
        Ok(self.stack.split_off(mark))
    }

    fn memo_put(&mut self, slot: u32, pos: u64) -> Result<(), PickleError> {
        let top = self.stack.last().cloned().ok_or(PickleError::StackUnderflow(pos))?;
        self.memo.insert(slot, top);
        Ok(())
    }

    fn memo_get(&mut self, slot: u32) -> Result<(), PickleError> {
        let v = self.memo.get(&slot).cloned().ok_or(PickleError::MemoMissing(slot))?;
        self.stack.push(v);
        Ok(())
    }
}

fn eof(_: std::io::Error) -> PickleError {
    PickleError::Truncated
}

fn latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

fn utf8(bytes: Vec<u8>) -> Result<String, PickleError> {
    String::from_utf8(bytes).map_err(|_| PickleError::BadUtf8)
}

fn parse_int_line(text: &[u8]) -> Result<i64, PickleError> {
    let s = std::str::from_utf8(text).map_err(|_| PickleError::BadUtf8)?;
    s.trim().parse().map_err(|_| PickleError::IntRange)
}

fn parse_memo_line(text: &[u8]) -> Result<u32, PickleError> {
    let s = std::str::from_utf8(text).map_err(|_| PickleError::BadUtf8)?;
    s.trim().parse().map_err(|_| PickleError::BadArgument {
        what: "memo slot",
        detail: s.to_owned(),
    })
}

/// Decode a little-endian two's-complement integer of arbitrary length
/// into an `i64`.  Values outside 64 bits are refused; this application
/// never produces them.
fn decode_long_le(bytes: &[u8]) -> Result<i64, PickleError> {
    if bytes.is_empty() {
        return Ok(0);
    }
    let negative = bytes[bytes.len() - 1] & 0x80 != 0;
    let fill = if negative { 0xFFu8 } else { 0x00u8 };
    let mut buf = [fill; 8];
    if bytes.len() > 8 {
        if bytes[8..].iter().any(|&b| b != fill) {
            return Err(PickleError::IntRange);
        }
        if ((bytes[7] & 0x80) != 0) != negative {
            return Err(PickleError::IntRange);
        }
        buf.copy_from_slice(&bytes[..8]);
    } else {
        buf[..bytes.len()].copy_from_slice(bytes);
    }
    Ok(i64::from_le_bytes(buf))
}

/// The only callables this application ever sees under REDUCE are the
/// set constructors emitted by protocols below 4.
fn apply_reduce(callable: Value, args: Value) -> Result<Value, PickleError> {
    if let Value::Global { ref module, ref name } = callable {
        let is_builtin = module == "builtins" || module == "__builtin__";
        if is_builtin && (name == "set" || name == "frozenset") {
            let items = match args.as_tuple() {
                Some([seq]) => seq
                    .as_sequence()
                    .ok_or(PickleError::TypeMismatch("REDUCE set argument"))?
                    .to_vec(),
                Some([]) | None => Vec::new(),
                Some(_) => return Err(PickleError::TypeMismatch("REDUCE set argument")),
            };
            return Ok(Value::Set(items));
        }
        return Err(PickleError::Unsupported(format!(
            "REDUCE of {module}.{name}"
        )));
    }
    Err(PickleError::TypeMismatch("REDUCE callable"))
}

fn dict_insert(pairs: &mut Vec<(Value, Value)>, k: Value, v: Value) {
    if let Some(slot) = pairs.iter_mut().find(|(existing, _)| *existing == k) {
        slot.1 = v;
    } else {
        pairs.push((k, v));
    }
}

/// Undo Python's `repr` quoting for protocol-0 STRING lines.  The byte
/// values are Latin-1.
fn unescape_repr(line: &[u8]) -> Result<String, PickleError> {
    let bad = |detail: &str| PickleError::BadArgument {
        what: "STRING",
        detail: detail.to_owned(),
    };

    if line.len() < 2 {
        return Err(bad("missing quotes"));
    }
    let quote = line[0];
    if (quote != b'\'' && quote != b'"') || line[line.len() - 1] != quote {
        return Err(bad("mismatched quotes"));
    }

    let body = &line[1..line.len() - 1];
    let mut out = String::with_capacity(body.len());
    let mut i = 0;
    while i < body.len() {
        let b = body[i];
        if b != b'\\' {
            out.push(b as char);
            i += 1;
            continue;
        }
        let esc = *body.get(i + 1).ok_or_else(|| bad("dangling backslash"))?;
        match esc {
            b'\\' => out.push('\\'),
            b'\'' => out.push('\''),
            b'"' => out.push('"'),
            b'n' => out.push('\n'),
            b'r' => out.push('\r'),
            b't' => out.push('\t'),
            b'x' => {
                let hex = body.get(i + 2..i + 4).ok_or_else(|| bad("short \\x escape"))?;
                let s = std::str::from_utf8(hex).map_err(|_| bad("bad \\x escape"))?;
                let v = u8::from_str_radix(s, 16).map_err(|_| bad("bad \\x escape"))?;
                out.push(v as char);
                i += 4;
                continue;
            }
            other => return Err(bad(&format!("unknown escape \\{}", other as char))),
        }
        i += 2;
    }
    Ok(out)
}

/// Decode a raw-unicode-escape line (protocol-0 UNICODE opcode).
fn decode_raw_unicode_escape(line: &[u8]) -> Result<String, PickleError> {
    let bad = |detail: &str| PickleError::BadArgument {
        what: "UNICODE",
        detail: detail.to_owned(),
    };

    let mut out = String::with_capacity(line.len());
    let mut i = 0;
    while i < line.len() {
        let b = line[i];
        if b != b'\\' {
            out.push(b as char);
            i += 1;
            continue;
        }
        match line.get(i + 1) {
            Some(b'u') => {
                let hex = line.get(i + 2..i + 6).ok_or_else(|| bad("short \\u escape"))?;
                let s = std::str::from_utf8(hex).map_err(|_| bad("bad \\u escape"))?;
                let v = u32::from_str_radix(s, 16).map_err(|_| bad("bad \\u escape"))?;
                out.push(char::from_u32(v).ok_or_else(|| bad("invalid code point"))?);
                i += 6;
            }
            Some(b'U') => {
                let hex = line.get(i + 2..i + 10).ok_or_else(|| bad("short \\U escape"))?;
                let s = std::str::from_utf8(hex).map_err(|_| bad("bad \\U escape"))?;
                let v = u32::from_str_radix(s, 16).map_err(|_| bad("bad \\U escape"))?;
                out.push(char::from_u32(v).ok_or_else(|| bad("invalid code point"))?);
                i += 10;
            }
            // Raw escape: the backslash is literal for anything else.
            Some(_) | None => {
                out.push('\\');
                i += 1;
            }
        }
    }
    Ok(out)
}
