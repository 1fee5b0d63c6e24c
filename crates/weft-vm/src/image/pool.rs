//! Class-image constant pool

use super::codec::{DecodeError, ImageReader, ImageWriter};

const TAG_UTF8: u8 = 1;
const TAG_INT: u8 = 2;
const TAG_CLASS: u8 = 3;
const TAG_FIELD_REF: u8 = 4;
const TAG_METHOD_REF: u8 = 5;
const TAG_HANDLE: u8 = 6;

/// Member kind selector inside a [`PoolEntry::Handle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleTag {
    /// Static method handle
    Static,
    /// Constructor handle
    Ctor,
}

/// One constant-pool entry. Cross-references are u16 pool indices.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PoolEntry {
    /// UTF-8 text (names, type names)
    Utf8(String),
    /// 32-bit integer constant
    Int(i32),
    /// Class reference: `name` points at a Utf8 binary name
    Class {
        /// Utf8 index of the binary name
        name: u16,
    },
    /// Field reference
    FieldRef {
        /// Class index of the declaring class
        class: u16,
        /// Utf8 index of the field name
        name: u16,
        /// Utf8 index of the field type name
        ty: u16,
    },
    /// Method or constructor reference
    MethodRef {
        /// Class index of the declaring class
        class: u16,
        /// Utf8 index of the method name (`<init>` for constructors)
        name: u16,
        /// Utf8 indices of parameter type names, in order
        params: Vec<u16>,
        /// Utf8 index of the return type name (`void` allowed)
        ret: u16,
    },
    /// Direct member handle
    Handle {
        /// Member kind
        tag: HandleTag,
        /// Class index of the declaring class
        class: u16,
        /// Utf8 index of the member name
        name: u16,
        /// Utf8 indices of parameter type names, in order
        params: Vec<u16>,
    },
}

/// A decoded constant pool.
#[derive(Debug, Clone, Default)]
pub struct ConstantPool {
    /// Entries, indexed from zero
    pub entries: Vec<PoolEntry>,
}

impl ConstantPool {
    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the pool is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entry at `index`, if present.
    pub fn get(&self, index: u16) -> Option<&PoolEntry> {
        self.entries.get(index as usize)
    }

    /// Resolve a Utf8 entry.
    pub fn utf8(&self, index: u16) -> Option<&str> {
        match self.get(index)? {
            PoolEntry::Utf8(s) => Some(s),
            _ => None,
        }
    }

    /// Resolve a Class entry to its binary name.
    pub fn class_name(&self, index: u16) -> Option<&str> {
        match self.get(index)? {
            PoolEntry::Class { name } => self.utf8(*name),
            _ => None,
        }
    }

    /// Encode all entries.
    pub fn encode(&self, w: &mut ImageWriter) {
        w.emit_u16(self.entries.len() as u16);
        for entry in &self.entries {
            match entry {
                PoolEntry::Utf8(s) => {
                    w.emit_u8(TAG_UTF8);
                    w.emit_string(s);
                }
                PoolEntry::Int(i) => {
                    w.emit_u8(TAG_INT);
                    w.emit_i32(*i);
                }
                PoolEntry::Class { name } => {
                    w.emit_u8(TAG_CLASS);
                    w.emit_u16(*name);
                }
                PoolEntry::FieldRef { class, name, ty } => {
                    w.emit_u8(TAG_FIELD_REF);
                    w.emit_u16(*class);
                    w.emit_u16(*name);
                    w.emit_u16(*ty);
                }
                PoolEntry::MethodRef {
                    class,
                    name,
                    params,
                    ret,
                } => {
                    w.emit_u8(TAG_METHOD_REF);
                    w.emit_u16(*class);
                    w.emit_u16(*name);
                    w.emit_u8(params.len() as u8);
                    for p in params {
                        w.emit_u16(*p);
                    }
                    w.emit_u16(*ret);
                }
                PoolEntry::Handle {
                    tag,
                    class,
                    name,
                    params,
                } => {
                    w.emit_u8(TAG_HANDLE);
                    w.emit_u8(match tag {
                        HandleTag::Static => 0,
                        HandleTag::Ctor => 1,
                    });
                    w.emit_u16(*class);
                    w.emit_u16(*name);
                    w.emit_u8(params.len() as u8);
                    for p in params {
                        w.emit_u16(*p);
                    }
                }
            }
        }
    }

    /// Decode a pool written by [`ConstantPool::encode`].
    pub fn decode(r: &mut ImageReader<'_>) -> Result<Self, DecodeError> {
        let count = r.read_u16()? as usize;
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let offset = r.position();
            let tag = r.read_u8()?;
            let entry = match tag {
                TAG_UTF8 => PoolEntry::Utf8(r.read_string()?),
                TAG_INT => PoolEntry::Int(r.read_i32()?),
                TAG_CLASS => PoolEntry::Class { name: r.read_u16()? },
                TAG_FIELD_REF => PoolEntry::FieldRef {
                    class: r.read_u16()?,
                    name: r.read_u16()?,
                    ty: r.read_u16()?,
                },
                TAG_METHOD_REF => {
                    let class = r.read_u16()?;
                    let name = r.read_u16()?;
                    let n = r.read_u8()? as usize;
                    let mut params = Vec::with_capacity(n);
                    for _ in 0..n {
                        params.push(r.read_u16()?);
                    }
                    let ret = r.read_u16()?;
                    PoolEntry::MethodRef {
                        class,
                        name,
                        params,
                        ret,
                    }
                }
                TAG_HANDLE => {
                    let tag = match r.read_u8()? {
                        0 => HandleTag::Static,
                        1 => HandleTag::Ctor,
                        _ => return Err(DecodeError::UnexpectedEof(offset)),
                    };
                    let class = r.read_u16()?;
                    let name = r.read_u16()?;
                    let n = r.read_u8()? as usize;
                    let mut params = Vec::with_capacity(n);
                    for _ in 0..n {
                        params.push(r.read_u16()?);
                    }
                    PoolEntry::Handle {
                        tag,
                        class,
                        name,
                        params,
                    }
                }
                _ => return Err(DecodeError::UnexpectedEof(offset)),
            };
            entries.push(entry);
        }
        Ok(ConstantPool { entries })
    }
}
