//! The value lattice the index serialization can carry.

/// A decoded pickle value.
///
/// Mappings keep insertion order; member iteration order is defined as
/// the order paths were pickled in.  Class references are carried as
/// opaque module/name pairs and never instantiated.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Tuple(Vec<Value>),
    List(Vec<Value>),
    Dict(Vec<(Value, Value)>),
    Set(Vec<Value>),
    Global { module: String, name: String },
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Non-negative integers only; offsets and lengths are unsigned.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Int(v) if *v >= 0 => Some(*v as u64),
            _ => None,
        }
    }

    pub fn as_tuple(&self) -> Option<&[Value]> {
        match self {
            Value::Tuple(items) => Some(items),
            _ => None,
        }
    }

    /// A sequence in the index sense: list or tuple.
    pub fn as_sequence(&self) -> Option<&[Value]> {
        match self {
            Value::Tuple(items) | Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&[(Value, Value)]> {
        match self {
            Value::Dict(pairs) => Some(pairs),
            _ => None,
        }
    }

    /// Byte-string view.  Legacy protocol-0/2 pickles spell short byte
    /// strings as Latin-1 `str`; both forms are accepted.
    pub fn to_byte_string(&self) -> Option<Vec<u8>> {
        match self {
            Value::Bytes(b) => Some(b.clone()),
            Value::Str(s) => {
                let mut out = Vec::with_capacity(s.len());
                for ch in s.chars() {
                    let code = ch as u32;
                    if code > 0xFF {
                        return None;
                    }
                    out.push(code as u8);
                }
                Some(out)
            }
            _ => None,
        }
    }

    /// Look up a string key in a dict value.
    pub fn dict_get(&self, key: &str) -> Option<&Value> {
        self.as_dict()?
            .iter()
            .find(|(k, _)| k.as_str() == Some(key))
            .map(|(_, v)| v)
    }
}
