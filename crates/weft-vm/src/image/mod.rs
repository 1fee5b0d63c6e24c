//! Class-image format
//!
//! A class image is the byte artefact a glue generator hands to the class
//! definer: a constant pool, a class header, fields, and methods whose code
//! uses the closed instruction set in [`op`]. Images are verified before
//! installation; see [`verify`].

pub mod codec;
pub mod op;
pub mod pool;
pub mod verify;

pub use codec::{DecodeError, ImageReader, ImageWriter};
pub use op::{CodeBody, Op};
pub use pool::{ConstantPool, HandleTag, PoolEntry};
pub use verify::{verify_image, VerifyError};

/// Magic number for Weft class images
pub const MAGIC: [u8; 4] = *b"WCLS";

/// Lowest class-file major version the platform accepts
pub const MAJOR_VERSION: u16 = 52;

/// Minor version emitted by this release
pub const MINOR_VERSION: u16 = 0;

/// Image encoding/decoding errors
#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    /// Byte-level decode failure
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Wrong magic number
    #[error("invalid magic number: expected WCLS, got {0:?}")]
    InvalidMagic([u8; 4]),

    /// Major version below the accepted floor
    #[error("unsupported class-image version {0} (minimum: {MAJOR_VERSION})")]
    UnsupportedVersion(u16),
}

/// A declared field in an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageField {
    /// Access flags
    pub flags: u16,
    /// Utf8 index of the field name
    pub name: u16,
    /// Utf8 index of the field type name
    pub ty: u16,
}

/// A declared method in an image.
///
/// Constructors are methods named `<init>`; the static initialiser is the
/// static method named `<clinit>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageMethod {
    /// Access flags
    pub flags: u16,
    /// Utf8 index of the method name
    pub name: u16,
    /// Utf8 indices of parameter type names
    pub params: Vec<u16>,
    /// Utf8 index of the return type name
    pub ret: u16,
    /// Operand stack bound
    pub max_stack: u16,
    /// Local table size
    pub max_locals: u16,
    /// Encoded code attribute
    pub code: Vec<u8>,
}

/// A decoded class image.
#[derive(Debug, Clone)]
pub struct Image {
    /// Minor format version
    pub minor: u16,
    /// Major format version (≥ 52)
    pub major: u16,
    /// Constant pool
    pub pool: ConstantPool,
    /// Class access flags
    pub flags: u16,
    /// Class index of this class (self-reference)
    pub this_class: u16,
    /// Class index of the super-class
    pub super_class: u16,
    /// Class indices of implemented interfaces
    pub interfaces: Vec<u16>,
    /// Declared fields (instance and static, by flags)
    pub fields: Vec<ImageField>,
    /// Declared methods
    pub methods: Vec<ImageMethod>,
}

impl Image {
    /// Binary name of this class.
    pub fn this_name(&self) -> Option<&str> {
        self.pool.class_name(self.this_class)
    }

    /// Binary name of the super-class.
    pub fn super_name(&self) -> Option<&str> {
        self.pool.class_name(self.super_class)
    }

    /// Serialise the image.
    pub fn encode(&self) -> Vec<u8> {
        let mut w = ImageWriter::new();
        w.buffer.extend_from_slice(&MAGIC);
        w.emit_u16(self.minor);
        w.emit_u16(self.major);
        self.pool.encode(&mut w);
        w.emit_u16(self.flags);
        w.emit_u16(self.this_class);
        w.emit_u16(self.super_class);
        w.emit_u16(self.interfaces.len() as u16);
        for i in &self.interfaces {
            w.emit_u16(*i);
        }
        w.emit_u16(self.fields.len() as u16);
        for f in &self.fields {
            w.emit_u16(f.flags);
            w.emit_u16(f.name);
            w.emit_u16(f.ty);
        }
        w.emit_u16(self.methods.len() as u16);
        for m in &self.methods {
            w.emit_u16(m.flags);
            w.emit_u16(m.name);
            w.emit_u8(m.params.len() as u8);
            for p in &m.params {
                w.emit_u16(*p);
            }
            w.emit_u16(m.ret);
            w.emit_u16(m.max_stack);
            w.emit_u16(m.max_locals);
            w.emit_bytes(&m.code);
        }
        w.buffer
    }

    /// Deserialise an image.
    pub fn decode(bytes: &[u8]) -> Result<Image, ImageError> {
        let mut r = ImageReader::new(bytes);
        let mut magic = [0u8; 4];
        for b in &mut magic {
            *b = r.read_u8()?;
        }
        if magic != MAGIC {
            return Err(ImageError::InvalidMagic(magic));
        }
        let minor = r.read_u16()?;
        let major = r.read_u16()?;
        if major < MAJOR_VERSION {
            return Err(ImageError::UnsupportedVersion(major));
        }
        let pool = ConstantPool::decode(&mut r)?;
        let flags = r.read_u16()?;
        let this_class = r.read_u16()?;
        let super_class = r.read_u16()?;
        let if_count = r.read_u16()? as usize;
        let mut interfaces = Vec::with_capacity(if_count);
        for _ in 0..if_count {
            interfaces.push(r.read_u16()?);
        }
        let field_count = r.read_u16()? as usize;
        let mut fields = Vec::with_capacity(field_count);
        for _ in 0..field_count {
            fields.push(ImageField {
                flags: r.read_u16()?,
                name: r.read_u16()?,
                ty: r.read_u16()?,
            });
        }
        let method_count = r.read_u16()? as usize;
        let mut methods = Vec::with_capacity(method_count);
        for _ in 0..method_count {
            let flags = r.read_u16()?;
            let name = r.read_u16()?;
            let n = r.read_u8()? as usize;
            let mut params = Vec::with_capacity(n);
            for _ in 0..n {
                params.push(r.read_u16()?);
            }
            let ret = r.read_u16()?;
            let max_stack = r.read_u16()?;
            let max_locals = r.read_u16()?;
            let code = r.read_bytes()?;
            methods.push(ImageMethod {
                flags,
                name,
                params,
                ret,
                max_stack,
                max_locals,
                code,
            });
        }
        Ok(Image {
            minor,
            major,
            pool,
            flags,
            this_class,
            super_class,
            interfaces,
            fields,
            methods,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_image() -> Image {
        let pool = ConstantPool {
            entries: vec![
                PoolEntry::Utf8("demo.Glue".to_string()),   // 0
                PoolEntry::Class { name: 0 },               // 1
                PoolEntry::Utf8("java.lang.Object".to_string()), // 2
                PoolEntry::Class { name: 2 },               // 3
                PoolEntry::Utf8("apply".to_string()),       // 4
            ],
        };
        let mut code = ImageWriter::new();
        Op::ConstNull.encode(&mut code);
        Op::Ret.encode(&mut code);
        Image {
            minor: MINOR_VERSION,
            major: MAJOR_VERSION,
            pool,
            flags: 0x0001,
            this_class: 1,
            super_class: 3,
            interfaces: vec![],
            fields: vec![],
            methods: vec![ImageMethod {
                flags: 0x0001,
                name: 4,
                params: vec![2, 2],
                ret: 2,
                max_stack: 1,
                max_locals: 3,
                code: code.buffer,
            }],
        }
    }

    #[test]
    fn test_image_round_trip() {
        let image = sample_image();
        let bytes = image.encode();
        let decoded = Image::decode(&bytes).unwrap();
        assert_eq!(decoded.this_name(), Some("demo.Glue"));
        assert_eq!(decoded.super_name(), Some("java.lang.Object"));
        assert_eq!(decoded.methods, image.methods);
        assert_eq!(decoded.major, MAJOR_VERSION);
    }

    #[test]
    fn test_bad_magic() {
        let mut bytes = sample_image().encode();
        bytes[0] = b'X';
        assert!(matches!(
            Image::decode(&bytes),
            Err(ImageError::InvalidMagic(_))
        ));
    }

    #[test]
    fn test_version_floor() {
        let mut image = sample_image();
        image.major = 51;
        let bytes = image.encode();
        assert!(matches!(
            Image::decode(&bytes),
            Err(ImageError::UnsupportedVersion(51))
        ));
    }
}
