//! A pickle interpreter covering the subset of opcodes emitted by
//! `torch.save` for state dicts.
//!
//! Tensors are not materialized here: each `_rebuild_tensor_v2` call becomes
//! a [`TensorInfo`] describing which storage record to read and how to view
//! it.
use crate::error::{Error, Result};
use std::collections::HashMap;
use tch::Kind;

#[derive(Debug, Clone, PartialEq)]
pub struct TensorInfo {
    pub storage_key: String,
    pub kind: Kind,
    pub offset: i64,
    pub shape: Vec<i64>,
    pub stride: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Object {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Tuple(Vec<Object>),
    List(Vec<Object>),
    Dict(Vec<(Object, Object)>),
    Class { module: String, name: String },
    PersistentLoad(Box<Object>),
    Reduce { callable: Box<Object>, args: Box<Object> },
    Tensor(TensorInfo),
}

impl Object {
    fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::Bool(b) => Some(*b as i64),
            _ => None,
        }
    }

    fn int_tuple(&self) -> Option<Vec<i64>> {
        match self {
            Self::Tuple(vs) | Self::List(vs) => vs.iter().map(Self::as_int).collect(),
            _ => None,
        }
    }
}

fn err<T>(msg: impl Into<String>) -> Result<T> {
    Err(Error::Checkpoint(msg.into()))
}

fn storage_kind(name: &str) -> Option<Kind> {
    let kind = match name {
        "FloatStorage" => Kind::Float,
        "HalfStorage" => Kind::Half,
        "BFloat16Storage" => Kind::BFloat16,
        "DoubleStorage" => Kind::Double,
        "LongStorage" => Kind::Int64,
        "IntStorage" => Kind::Int,
        "ShortStorage" => Kind::Int16,
        "CharStorage" => Kind::Int8,
        "ByteStorage" => Kind::Uint8,
        "BoolStorage" => Kind::Bool,
        _ => return None,
    };
    Some(kind)
}

// ('storage', torch.FloatStorage, key, location, numel)
fn rebuild_tensor(args: Vec<Object>) -> Result<Object> {
    let mut args = args.into_iter();
    let (storage, offset, shape, stride) = match (args.next(), args.next(), args.next(), args.next())
    {
        (Some(storage), Some(offset), Some(shape), Some(stride)) => (storage, offset, shape, stride),
        _ => return err("_rebuild_tensor_v2 expects at least four arguments"),
    };
    let pid = match storage {
        Object::PersistentLoad(pid) => *pid,
        other => return err(format!("unexpected tensor storage {other:?}")),
    };
    let (kind, storage_key) = match pid {
        Object::Tuple(pid) => match pid.as_slice() {
            [Object::Str(tag), Object::Class { name, .. }, Object::Str(key), ..] if tag == "storage" => {
                match storage_kind(name) {
                    Some(kind) => (kind, key.clone()),
                    None => return err(format!("unsupported storage type {name}")),
                }
            }
            _ => return err(format!("unexpected persistent id {pid:?}")),
        },
        other => return err(format!("unexpected persistent id {other:?}")),
    };
    let offset = offset.as_int().ok_or_else(|| Error::Checkpoint("bad storage offset".into()))?;
    let shape = shape.int_tuple().ok_or_else(|| Error::Checkpoint("bad tensor shape".into()))?;
    let stride = stride.int_tuple().ok_or_else(|| Error::Checkpoint("bad tensor stride".into()))?;
    Ok(Object::Tensor(TensorInfo { storage_key, kind, offset, shape, stride }))
}

fn reduce(callable: Object, args: Object) -> Result<Object> {
    if let (Object::Class { module, name }, Object::Tuple(args)) = (&callable, &args) {
        match (module.as_str(), name.as_str()) {
            ("collections", "OrderedDict") => return Ok(Object::Dict(vec![])),
            ("torch._utils", "_rebuild_tensor_v2") => return rebuild_tensor(args.clone()),
            ("torch._utils", "_rebuild_parameter") => match args.first() {
                Some(data) => return Ok(data.clone()),
                None => return err("_rebuild_parameter without data"),
            },
            _ => {}
        }
    }
    Ok(Object::Reduce { callable: Box::new(callable), args: Box::new(args) })
}

struct Stack<'a> {
    data: &'a [u8],
    pos: usize,
    stack: Vec<Object>,
    marks: Vec<usize>,
    memo: HashMap<u32, Object>,
}

impl<'a> Stack<'a> {
    fn read(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.data.len() {
            return err("unexpected end of pickle data");
        }
        let bytes = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.read(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.read(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.read(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn line(&mut self) -> Result<String> {
        let rest = &self.data[self.pos..];
        match rest.iter().position(|&c| c == b'\n') {
            Some(len) => {
                let line = String::from_utf8_lossy(&rest[..len]).to_string();
                self.pos += len + 1;
                Ok(line)
            }
            None => err("unterminated line in pickle data"),
        }
    }

    fn string(&mut self, len: usize) -> Result<Object> {
        let bytes = self.read(len)?;
        match std::str::from_utf8(bytes) {
            Ok(s) => Ok(Object::Str(s.to_string())),
            Err(_) => err("invalid utf-8 in pickle string"),
        }
    }

    fn pop(&mut self) -> Result<Object> {
        match self.stack.pop() {
            Some(obj) => Ok(obj),
            None => err("pickle stack underflow"),
        }
    }

    fn top(&mut self) -> Result<&mut Object> {
        match self.stack.last_mut() {
            Some(obj) => Ok(obj),
            None => err("pickle stack underflow"),
        }
    }

    fn pop_mark(&mut self) -> Result<Vec<Object>> {
        let mark = match self.marks.pop() {
            Some(mark) => mark,
            None => return err("pickle mark not found"),
        };
        if mark > self.stack.len() {
            return err("pickle mark past the end of the stack");
        }
        Ok(self.stack.split_off(mark))
    }

    fn memoize(&mut self, idx: u32) -> Result<()> {
        let obj = self.top()?.clone();
        self.memo.insert(idx, obj);
        Ok(())
    }

    fn memo_get(&mut self, idx: u32) -> Result<()> {
        match self.memo.get(&idx) {
            Some(obj) => {
                let obj = obj.clone();
                self.stack.push(obj);
                Ok(())
            }
            None => err(format!("pickle memo {idx} not found")),
        }
    }

    fn set_items(&mut self, items: Vec<Object>) -> Result<()> {
        if items.len() % 2 != 0 {
            return err("odd number of dict items");
        }
        match self.top()? {
            Object::Dict(entries) => {
                let mut items = items.into_iter();
                while let (Some(k), Some(v)) = (items.next(), items.next()) {
                    entries.push((k, v));
                }
                Ok(())
            }
            other => err(format!("SETITEMS on {other:?}")),
        }
    }

    fn append(&mut self, items: Vec<Object>) -> Result<()> {
        match self.top()? {
            Object::List(list) => {
                list.extend(items);
                Ok(())
            }
            other => err(format!("APPENDS on {other:?}")),
        }
    }

    /// Runs a single opcode, returns false on STOP.
    fn step(&mut self) -> Result<bool> {
        let op = self.u8()?;
        match op {
            0x80 => {
                // PROTO
                self.u8()?;
            }
            0x95 => {
                // FRAME
                self.read(8)?;
            }
            b'.' => return Ok(false),
            b'(' => self.marks.push(self.stack.len()),
            b'N' => self.stack.push(Object::None),
            0x88 => self.stack.push(Object::Bool(true)),
            0x89 => self.stack.push(Object::Bool(false)),
            b'J' => {
                let v = self.u32()? as i32;
                self.stack.push(Object::Int(v as i64))
            }
            b'K' => {
                let v = self.u8()?;
                self.stack.push(Object::Int(v as i64))
            }
            b'M' => {
                let v = self.u16()?;
                self.stack.push(Object::Int(v as i64))
            }
            0x8a => {
                // LONG1
                let len = self.u8()? as usize;
                let bytes = self.read(len)?;
                if len > 8 {
                    return err("LONG1 value does not fit in 64 bits");
                }
                let mut buf = [0u8; 8];
                buf[..len].copy_from_slice(bytes);
                if len > 0 && bytes[len - 1] & 0x80 != 0 {
                    buf[len..].iter_mut().for_each(|b| *b = 0xff);
                }
                self.stack.push(Object::Int(i64::from_le_bytes(buf)))
            }
            b'G' => {
                let b = self.read(8)?;
                let mut buf = [0u8; 8];
                buf.copy_from_slice(b);
                self.stack.push(Object::Float(f64::from_be_bytes(buf)))
            }
            b'X' => {
                let len = self.u32()? as usize;
                let s = self.string(len)?;
                self.stack.push(s)
            }
            0x8c => {
                // SHORT_BINUNICODE
                let len = self.u8()? as usize;
                let s = self.string(len)?;
                self.stack.push(s)
            }
            b'U' => {
                let len = self.u8()? as usize;
                let s = self.string(len)?;
                self.stack.push(s)
            }
            b'T' => {
                let len = self.u32()? as usize;
                let s = self.string(len)?;
                self.stack.push(s)
            }
            b'C' => {
                let len = self.u8()? as usize;
                let bytes = self.read(len)?.to_vec();
                self.stack.push(Object::Bytes(bytes))
            }
            b'B' => {
                let len = self.u32()? as usize;
                let bytes = self.read(len)?.to_vec();
                self.stack.push(Object::Bytes(bytes))
            }
            b'c' => {
                let module = self.line()?;
                let name = self.line()?;
                self.stack.push(Object::Class { module, name })
            }
            0x93 => {
                // STACK_GLOBAL
                let name = self.pop()?;
                let module = self.pop()?;
                match (module, name) {
                    (Object::Str(module), Object::Str(name)) => {
                        self.stack.push(Object::Class { module, name })
                    }
                    _ => return err("STACK_GLOBAL expects two strings"),
                }
            }
            b')' => self.stack.push(Object::Tuple(vec![])),
            b']' => self.stack.push(Object::List(vec![])),
            b'}' => self.stack.push(Object::Dict(vec![])),
            b't' => {
                let items = self.pop_mark()?;
                self.stack.push(Object::Tuple(items))
            }
            b'l' => {
                let items = self.pop_mark()?;
                self.stack.push(Object::List(items))
            }
            0x85 => {
                let a = self.pop()?;
                self.stack.push(Object::Tuple(vec![a]))
            }
            0x86 => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.stack.push(Object::Tuple(vec![a, b]))
            }
            0x87 => {
                let c = self.pop()?;
                let b = self.pop()?;
                let a = self.pop()?;
                self.stack.push(Object::Tuple(vec![a, b, c]))
            }
            b'q' => {
                let idx = self.u8()? as u32;
                self.memoize(idx)?
            }
            b'r' => {
                let idx = self.u32()?;
                self.memoize(idx)?
            }
            0x94 => {
                // MEMOIZE
                let idx = self.memo.len() as u32;
                self.memoize(idx)?
            }
            b'h' => {
                let idx = self.u8()? as u32;
                self.memo_get(idx)?
            }
            b'j' => {
                let idx = self.u32()?;
                self.memo_get(idx)?
            }
            b's' => {
                let v = self.pop()?;
                let k = self.pop()?;
                self.set_items(vec![k, v])?
            }
            b'u' => {
                let items = self.pop_mark()?;
                self.set_items(items)?
            }
            b'a' => {
                let v = self.pop()?;
                self.append(vec![v])?
            }
            b'e' => {
                let items = self.pop_mark()?;
                self.append(items)?
            }
            b'Q' => {
                let pid = self.pop()?;
                self.stack.push(Object::PersistentLoad(Box::new(pid)))
            }
            b'R' => {
                let args = self.pop()?;
                let callable = self.pop()?;
                let obj = reduce(callable, args)?;
                self.stack.push(obj)
            }
            0x81 => {
                // NEWOBJ
                let args = self.pop()?;
                let cls = self.pop()?;
                let obj = reduce(cls, args)?;
                self.stack.push(obj)
            }
            b'b' => {
                // BUILD, the state of the objects found in state dicts is not
                // needed.
                self.pop()?;
            }
            op => return err(format!("unsupported pickle opcode 0x{op:02x}")),
        }
        Ok(true)
    }
}

/// Evaluates a pickle stream and returns the resulting object.
pub fn parse(data: &[u8]) -> Result<Object> {
    let mut stack = Stack { data, pos: 0, stack: vec![], marks: vec![], memo: HashMap::new() };
    while stack.step()? {}
    stack.pop()
}

/// Flattens a state dict into `(name, tensor)` pairs. Checkpoints that wrap
/// their weights in a `state_dict` entry are unwrapped first.
pub fn tensor_infos(obj: Object) -> Result<Vec<(String, TensorInfo)>> {
    let mut entries = match obj {
        Object::Dict(entries) => entries,
        other => return err(format!("expected a dict at the checkpoint root, got {other:?}")),
    };
    let nested = entries.iter().position(|(k, v)| {
        matches!((k, v), (Object::Str(k), Object::Dict(_)) if k == "state_dict")
    });
    if let Some(idx) = nested {
        let (_, state_dict) = entries.swap_remove(idx);
        return tensor_infos(state_dict);
    }
    let mut tensors = Vec::with_capacity(entries.len());
    for (k, v) in entries {
        match (k, v) {
            (Object::Str(name), Object::Tensor(info)) => tensors.push((name, info)),
            (k, _) => log::debug!("skipping non-tensor checkpoint entry {k:?}"),
        }
    }
    Ok(tensors)
}
