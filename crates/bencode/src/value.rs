use std::collections::BTreeMap;

use crate::{parse, Context, Error, Handler};

/// An owned bencode tree. Dict keys are kept sorted, so encoding a
/// parsed value reproduces canonical bencoding byte for byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Dict(BTreeMap<Vec<u8>, Value>),
}

impl Value {
    pub fn parse(buf: &[u8]) -> Result<Value, Error> {
        let (value, _) = Self::parse_with_rest(buf)?;
        Ok(value)
    }

    /// Parse one value, returning it together with the unconsumed tail.
    pub fn parse_with_rest(buf: &[u8]) -> Result<(Value, &[u8]), Error> {
        let mut builder = TreeBuilder::default();
        let consumed = parse(buf, &mut builder)?;
        let value = builder.finish().ok_or(Error::Truncated)?;
        Ok((value, &buf[consumed..]))
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Value::Int(v) => {
                out.push(b'i');
                out.extend_from_slice(itoa_buf(*v).as_bytes());
                out.push(b'e');
            }
            Value::Bytes(b) => {
                out.extend_from_slice(itoa_buf(b.len() as i64).as_bytes());
                out.push(b':');
                out.extend_from_slice(b);
            }
            Value::List(items) => {
                out.push(b'l');
                for item in items {
                    item.encode_into(out);
                }
                out.push(b'e');
            }
            Value::Dict(map) => {
                out.push(b'd');
                for (k, v) in map {
                    out.extend_from_slice(itoa_buf(k.len() as i64).as_bytes());
                    out.push(b':');
                    out.extend_from_slice(k);
                    v.encode_into(out);
                }
                out.push(b'e');
            }
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(self.as_bytes()?).ok()
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, Value>> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Dict member lookup; None for non-dicts and missing keys.
    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        self.as_dict()?.get(key)
    }

    pub fn from_str(s: &str) -> Value {
        Value::Bytes(s.as_bytes().to_vec())
    }
}

fn itoa_buf(v: i64) -> String {
    v.to_string()
}

#[derive(Default)]
struct TreeBuilder {
    // Finished containers awaiting their parent, innermost last.
    stack: Vec<Partial>,
    root: Option<Value>,
}

enum Partial {
    List(Vec<Value>),
    Dict {
        map: BTreeMap<Vec<u8>, Value>,
        pending_key: Option<Vec<u8>>,
    },
}

impl TreeBuilder {
    fn finish(self) -> Option<Value> {
        self.root
    }

    fn place(&mut self, value: Value) {
        match self.stack.last_mut() {
            None => self.root = Some(value),
            Some(Partial::List(items)) => items.push(value),
            Some(Partial::Dict { map, pending_key }) => {
                // parser guarantees a key was seen first
                if let Some(key) = pending_key.take() {
                    map.insert(key, value);
                }
            }
        }
    }
}

impl Handler for TreeBuilder {
    fn int(&mut self, value: i64, _ctx: &Context) -> bool {
        self.place(Value::Int(value));
        true
    }

    fn string(&mut self, value: &[u8], _ctx: &Context) -> bool {
        self.place(Value::Bytes(value.to_vec()));
        true
    }

    fn key(&mut self, key: &[u8], _ctx: &Context) -> bool {
        if let Some(Partial::Dict { pending_key, .. }) = self.stack.last_mut() {
            *pending_key = Some(key.to_vec());
        }
        true
    }

    fn dict_begin(&mut self, _ctx: &Context) -> bool {
        self.stack.push(Partial::Dict {
            map: BTreeMap::new(),
            pending_key: None,
        });
        true
    }

    fn dict_end(&mut self, _ctx: &Context) -> bool {
        if let Some(Partial::Dict { map, .. }) = self.stack.pop() {
            self.place(Value::Dict(map));
        }
        true
    }

    fn list_begin(&mut self, _ctx: &Context) -> bool {
        self.stack.push(Partial::List(Vec::new()));
        true
    }

    fn list_end(&mut self, _ctx: &Context) -> bool {
        if let Some(Partial::List(items)) = self.stack.pop() {
            self.place(Value::List(items));
        }
        true
    }
}
