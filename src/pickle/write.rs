//! Native pickle writer.
//!
//! Targets protocols 2 and 4: protocol 2 is what the older archive
//! families carry, protocol 4 the newest.  The value domain is narrow
//! (the index mapping plus its scalar leaves), so a native emitter is
//! preferred over driving an external serializer process.

use byteorder::{BigEndian, ByteOrder, LittleEndian};

use super::value::Value;
use super::PickleError;

/// Python batches container fills in groups of this size; matching it
/// keeps output byte-comparable with reference pickles.
const BATCH: usize = 1000;

/// Serialize `value` at the given pickle protocol (2 or 4).
pub fn dumps(value: &Value, protocol: u8) -> Result<Vec<u8>, PickleError> {
    if protocol != 2 && protocol != 4 {
        return Err(PickleError::Unsupported(format!(
            "pickle writer protocol {protocol}"
        )));
    }

    let mut body = Vec::new();
    let mut p = Pickler { out: &mut body, protocol };
    p.emit(value)?;
    body.push(b'.');

    let mut out = Vec::with_capacity(body.len() + 11);
    out.push(0x80);
    out.push(protocol);
    if protocol >= 4 {
        out.push(0x95);
        let mut len = [0u8; 8];
        LittleEndian::write_u64(&mut len, body.len() as u64);
        out.extend_from_slice(&len);
    }
    out.extend_from_slice(&body);
    Ok(out)
}

struct Pickler<'a> {
    out: &'a mut Vec<u8>,
    protocol: u8,
}

impl Pickler<'_> {
    fn emit(&mut self, value: &Value) -> Result<(), PickleError> {
        match value {
            Value::None => self.out.push(b'N'),
            Value::Bool(true) => self.out.push(0x88),
            Value::Bool(false) => self.out.push(0x89),
            Value::Int(v) => self.emit_int(*v),
            Value::Float(v) => {
                self.out.push(b'G');
                let mut buf = [0u8; 8];
                BigEndian::write_f64(&mut buf, *v);
                self.out.extend_from_slice(&buf);
            }
            Value::Str(s) => self.emit_str(s),
            Value::Bytes(b) => self.emit_bytes(b),
            Value::Tuple(items) => self.emit_tuple(items)?,
            Value::List(items) => {
                self.out.push(b']');
                self.emit_batched(items, b'e')?;
            }
            Value::Dict(pairs) => {
                self.out.push(b'}');
                for chunk in pairs.chunks(BATCH) {
                    self.out.push(b'(');
                    for (k, v) in chunk {
                        self.emit(k)?;
                        self.emit(v)?;
                    }
                    self.out.push(b'u');
                }
            }
            Value::Set(items) => self.emit_set(items)?,
            Value::Global { module, name } => self.emit_global(module, name)?,
        }
        Ok(())
    }

    fn emit_int(&mut self, v: i64) {
        if (0..=0xFF).contains(&v) {
            self.out.push(b'K');
            self.out.push(v as u8);
        } else if (0x100..=0xFFFF).contains(&v) {
            self.out.push(b'M');
            let mut buf = [0u8; 2];
            LittleEndian::write_u16(&mut buf, v as u16);
            self.out.extend_from_slice(&buf);
        } else if i32::try_from(v).is_ok() {
            self.out.push(b'J');
            let mut buf = [0u8; 4];
            LittleEndian::write_i32(&mut buf, v as i32);
            self.out.extend_from_slice(&buf);
        } else {
            let bytes = encode_long_le(v);
            self.out.push(0x8a);
            self.out.push(bytes.len() as u8);
            self.out.extend_from_slice(&bytes);
        }
    }

    fn emit_str(&mut self, s: &str) {
        let bytes = s.as_bytes();
        if self.protocol >= 4 && bytes.len() < 0x100 {
            self.out.push(0x8c);
            self.out.push(bytes.len() as u8);
        } else {
            self.out.push(b'X');
            let mut buf = [0u8; 4];
            LittleEndian::write_u32(&mut buf, bytes.len() as u32);
            self.out.extend_from_slice(&buf);
        }
        self.out.extend_from_slice(bytes);
    }

    fn emit_bytes(&mut self, b: &[u8]) {
        if self.protocol >= 3 {
            if b.len() < 0x100 {
                self.out.push(b'C');
                self.out.push(b.len() as u8);
            } else {
                self.out.push(b'B');
                let mut buf = [0u8; 4];
                LittleEndian::write_u32(&mut buf, b.len() as u32);
                self.out.extend_from_slice(&buf);
            }
        } else {
            // Protocol 2 spells byte strings as Latin-1 STRING values,
            // exactly as a Python 2 writer would.
            if b.len() < 0x100 {
                self.out.push(b'U');
                self.out.push(b.len() as u8);
            } else {
                self.out.push(b'T');
                let mut buf = [0u8; 4];
                LittleEndian::write_u32(&mut buf, b.len() as u32);
                self.out.extend_from_slice(&buf);
            }
        }
        self.out.extend_from_slice(b);
    }

    fn emit_tuple(&mut self, items: &[Value]) -> Result<(), PickleError> {
        match items.len() {
            0 => self.out.push(b')'),
            n @ 1..=3 => {
                for item in items {
                    self.emit(item)?;
                }
                self.out.push(0x85 + (n as u8 - 1));
            }
            _ => {
                self.out.push(b'(');
                for item in items {
                    self.emit(item)?;
                }
                self.out.push(b't');
            }
        }
        Ok(())
    }

    fn emit_set(&mut self, items: &[Value]) -> Result<(), PickleError> {
        if self.protocol >= 4 {
            self.out.push(0x8f);
            self.emit_batched(items, 0x90)?;
        } else {
            // set([...]) through REDUCE, as protocol 2 has no set opcode.
            self.emit_global("__builtin__", "set")?;
            self.out.push(b']');
            self.emit_batched(items, b'e')?;
            self.out.push(0x85);
            self.out.push(b'R');
        }
        Ok(())
    }

    fn emit_global(&mut self, module: &str, name: &str) -> Result<(), PickleError> {
        if module.contains('\n') || name.contains('\n') {
            return Err(PickleError::BadArgument {
                what: "GLOBAL",
                detail: "newline in module or name".into(),
            });
        }
        self.out.push(b'c');
        self.out.extend_from_slice(module.as_bytes());
        self.out.push(b'\n');
        self.out.extend_from_slice(name.as_bytes());
        self.out.push(b'\n');
        Ok(())
    }

    fn emit_batched(&mut self, items: &[Value], terminator: u8) -> Result<(), PickleError> {
        for chunk in items.chunks(BATCH) {
            self.out.push(b'(');
            for item in chunk {
                self.emit(item)?;
            }
            self.out.push(terminator);
        }
        Ok(())
    }
}

/// Minimal little-endian two's-complement encoding, as LONG1 expects.
fn encode_long_le(v: i64) -> Vec<u8> {
    if v == 0 {
        return Vec::new();
    }
    let mut bytes = v.to_le_bytes().to_vec();
    let fill = if v < 0 { 0xFF } else { 0x00 };
    while bytes.len() > 1 {
        let last = bytes[bytes.len() - 1];
        let prev_sign = bytes[bytes.len() - 2] & 0x80 != 0;
        if last == fill && prev_sign == (v < 0) {
            bytes.pop();
        } else {
            break;
        }
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::super::read::loads;
    use super::*;

    fn index_like() -> Value {
        Value::Dict(vec![
            (
                Value::Str("a.txt".into()),
                Value::List(vec![Value::Tuple(vec![
                    Value::Int(0x2A),
                    Value::Int(5),
                ])]),
            ),
            (
                Value::Str("b/c.bin".into()),
                Value::List(vec![Value::Tuple(vec![
                    Value::Int(0xDEAD_BEEF),
                    Value::Int(3),
                ])]),
            ),
        ])
    }

    #[test]
    fn roundtrip_protocol_2() {
        let v = index_like();
        assert_eq!(loads(&dumps(&v, 2).unwrap()).unwrap(), v);
    }

    #[test]
    fn roundtrip_protocol_4() {
        let v = index_like();
        assert_eq!(loads(&dumps(&v, 4).unwrap()).unwrap(), v);
    }

    #[test]
    fn roundtrip_scalars() {
        let v = Value::Tuple(vec![
            Value::None,
            Value::Bool(true),
            Value::Int(-7),
            Value::Int(i64::MAX),
            Value::Float(1.5),
            Value::Str("päth/ünïcode".into()),
        ]);
        for proto in [2u8, 4u8] {
            assert_eq!(loads(&dumps(&v, proto).unwrap()).unwrap(), v, "proto {proto}");
        }
    }

    #[test]
    fn roundtrip_bytes_protocol_4() {
        let v = Value::Bytes(vec![0x00, 0xFF, 0x7F]);
        assert_eq!(loads(&dumps(&v, 4).unwrap()).unwrap(), v);
    }

    #[test]
    fn protocol_2_bytes_surface_as_latin1_string() {
        let v = Value::Bytes(vec![0x00, 0xFF]);
        let back = loads(&dumps(&v, 2).unwrap()).unwrap();
        assert_eq!(back.to_byte_string().unwrap(), vec![0x00, 0xFF]);
    }

    #[test]
    fn roundtrip_set() {
        let v = Value::Set(vec![Value::Int(1), Value::Int(2)]);
        for proto in [2u8, 4u8] {
            assert_eq!(loads(&dumps(&v, proto).unwrap()).unwrap(), v, "proto {proto}");
        }
    }

    #[test]
    fn large_dict_batches() {
        let pairs: Vec<(Value, Value)> = (0..2500)
            .map(|i| {
                (
                    Value::Str(format!("file_{i:04}")),
                    Value::List(vec![Value::Tuple(vec![
                        Value::Int(i * 16),
                        Value::Int(16),
                    ])]),
                )
            })
            .collect();
        let v = Value::Dict(pairs);
        for proto in [2u8, 4u8] {
            assert_eq!(loads(&dumps(&v, proto).unwrap()).unwrap(), v, "proto {proto}");
        }
    }

    #[test]
    fn unsupported_protocol_refused() {
        assert!(matches!(
            dumps(&Value::None, 3),
            Err(PickleError::Unsupported(_))
        ));
    }

    #[test]
    fn long1_encoding_is_minimal() {
        // 0xDEADBEEF needs five bytes: the sign bit of 0xDE forces a pad.
        let out = dumps(&Value::Int(0xDEAD_BEEF), 2).unwrap();
        assert!(out
            .windows(7)
            .any(|w| w == [0x8a, 0x05, 0xEF, 0xBE, 0xAD, 0xDE, 0x00]));
    }
}
