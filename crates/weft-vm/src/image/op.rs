//! The closed instruction set of glue code
//!
//! Generated classes use a small, fixed repertoire: constant pushes (in
//! shortest form), local access, object/array plumbing, the four invoke
//! shapes, a dense table-switch, and returns. Every instruction encodes as
//! an opcode byte followed by little-endian operands.

use super::codec::{DecodeError, ImageReader, ImageWriter};
use rustc_hash::FxHashMap;

/// Opcode byte values.
pub mod opcode {
    /// No operation
    pub const NOP: u8 = 0x00;
    /// Discard top of stack
    pub const POP: u8 = 0x01;
    /// Duplicate top of stack
    pub const DUP: u8 = 0x02;
    /// Push null
    pub const CONST_NULL: u8 = 0x03;

    /// Push int -1
    pub const ICONST_M1: u8 = 0x10;
    /// Push int 0 (..5 follow contiguously)
    pub const ICONST_0: u8 = 0x11;
    /// Push int 5 (upper bound of the iconst range)
    pub const ICONST_5: u8 = 0x16;
    /// Push sign-extended i8
    pub const BIPUSH: u8 = 0x17;
    /// Push sign-extended i16
    pub const SIPUSH: u8 = 0x18;
    /// Push pool constant (int)
    pub const LDC: u8 = 0x19;
    /// Push pool method handle
    pub const LDC_HANDLE: u8 = 0x1A;

    /// Load local variable
    pub const LOAD: u8 = 0x20;
    /// Store local variable
    pub const STORE: u8 = 0x21;

    /// Allocate instance of a pool class
    pub const NEW: u8 = 0x30;
    /// Checked cast to a pool class
    pub const CHECKCAST: u8 = 0x31;
    /// Read instance field
    pub const GETFIELD: u8 = 0x32;
    /// Write instance field
    pub const PUTFIELD: u8 = 0x33;
    /// Read static field
    pub const GETSTATIC: u8 = 0x34;
    /// Write static field
    pub const PUTSTATIC: u8 = 0x35;

    /// Allocate reference array
    pub const ANEWARRAY: u8 = 0x40;
    /// Read array element
    pub const AALOAD: u8 = 0x41;
    /// Write array element
    pub const AASTORE: u8 = 0x42;
    /// Array length
    pub const ARRAYLENGTH: u8 = 0x43;

    /// Virtual dispatch
    pub const INVOKEVIRTUAL: u8 = 0x50;
    /// Exact dispatch (constructors, super-calls)
    pub const INVOKESPECIAL: u8 = 0x51;
    /// Static dispatch
    pub const INVOKESTATIC: u8 = 0x52;
    /// Interface dispatch
    pub const INVOKEINTERFACE: u8 = 0x53;

    /// Dense integer dispatch
    pub const TABLESWITCH: u8 = 0x60;

    /// Return top of stack
    pub const RET: u8 = 0x70;
    /// Return void
    pub const RET_VOID: u8 = 0x71;
}

/// A decoded instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    /// No operation
    Nop,
    /// Discard top of stack
    Pop,
    /// Duplicate top of stack
    Dup,
    /// Push null
    ConstNull,
    /// Push a small int (-1..=5), single-byte form
    Iconst(i8),
    /// Push a sign-extended i8
    Bipush(i8),
    /// Push a sign-extended i16
    Sipush(i16),
    /// Push an int from the constant pool
    Ldc(u16),
    /// Push a method handle from the constant pool
    LdcHandle(u16),
    /// Load a local variable
    Load(u16),
    /// Store a local variable
    Store(u16),
    /// Allocate an instance of a pool class
    New(u16),
    /// Checked cast to a pool class
    CheckCast(u16),
    /// Read an instance field (pool field ref)
    GetField(u16),
    /// Write an instance field (pool field ref)
    PutField(u16),
    /// Read a static field (pool field ref)
    GetStatic(u16),
    /// Write a static field (pool field ref)
    PutStatic(u16),
    /// Allocate a reference array of a pool element class
    AnewArray(u16),
    /// Read an array element
    Aaload,
    /// Write an array element
    Aastore,
    /// Array length
    ArrayLength,
    /// Virtual dispatch through a pool method ref
    InvokeVirtual(u16),
    /// Exact dispatch through a pool method ref
    InvokeSpecial(u16),
    /// Static dispatch through a pool method ref
    InvokeStatic(u16),
    /// Interface dispatch through a pool method ref
    InvokeInterface(u16),
    /// Dense integer dispatch: `targets[i - low]`, else `default`
    TableSwitch {
        /// Lowest covered case value
        low: i32,
        /// Absolute code offset of the default target
        default: u32,
        /// Absolute code offsets of case targets
        targets: Vec<u32>,
    },
    /// Return top of stack
    Ret,
    /// Return void
    RetVoid,
}

impl Op {
    /// Encode this instruction onto a writer.
    pub fn encode(&self, w: &mut ImageWriter) {
        match self {
            Op::Nop => w.emit_u8(opcode::NOP),
            Op::Pop => w.emit_u8(opcode::POP),
            Op::Dup => w.emit_u8(opcode::DUP),
            Op::ConstNull => w.emit_u8(opcode::CONST_NULL),
            Op::Iconst(v) => {
                debug_assert!((-1..=5).contains(v), "iconst out of range: {v}");
                w.emit_u8((opcode::ICONST_0 as i16 + *v as i16) as u8);
            }
            Op::Bipush(v) => {
                w.emit_u8(opcode::BIPUSH);
                w.emit_u8(*v as u8);
            }
            Op::Sipush(v) => {
                w.emit_u8(opcode::SIPUSH);
                w.emit_u16(*v as u16);
            }
            Op::Ldc(idx) => {
                w.emit_u8(opcode::LDC);
                w.emit_u16(*idx);
            }
            Op::LdcHandle(idx) => {
                w.emit_u8(opcode::LDC_HANDLE);
                w.emit_u16(*idx);
            }
            Op::Load(slot) => {
                w.emit_u8(opcode::LOAD);
                w.emit_u16(*slot);
            }
            Op::Store(slot) => {
                w.emit_u8(opcode::STORE);
                w.emit_u16(*slot);
            }
            Op::New(idx) => {
                w.emit_u8(opcode::NEW);
                w.emit_u16(*idx);
            }
            Op::CheckCast(idx) => {
                w.emit_u8(opcode::CHECKCAST);
                w.emit_u16(*idx);
            }
            Op::GetField(idx) => {
                w.emit_u8(opcode::GETFIELD);
                w.emit_u16(*idx);
            }
            Op::PutField(idx) => {
                w.emit_u8(opcode::PUTFIELD);
                w.emit_u16(*idx);
            }
            Op::GetStatic(idx) => {
                w.emit_u8(opcode::GETSTATIC);
                w.emit_u16(*idx);
            }
            Op::PutStatic(idx) => {
                w.emit_u8(opcode::PUTSTATIC);
                w.emit_u16(*idx);
            }
            Op::AnewArray(idx) => {
                w.emit_u8(opcode::ANEWARRAY);
                w.emit_u16(*idx);
            }
            Op::Aaload => w.emit_u8(opcode::AALOAD),
            Op::Aastore => w.emit_u8(opcode::AASTORE),
            Op::ArrayLength => w.emit_u8(opcode::ARRAYLENGTH),
            Op::InvokeVirtual(idx) => {
                w.emit_u8(opcode::INVOKEVIRTUAL);
                w.emit_u16(*idx);
            }
            Op::InvokeSpecial(idx) => {
                w.emit_u8(opcode::INVOKESPECIAL);
                w.emit_u16(*idx);
            }
            Op::InvokeStatic(idx) => {
                w.emit_u8(opcode::INVOKESTATIC);
                w.emit_u16(*idx);
            }
            Op::InvokeInterface(idx) => {
                w.emit_u8(opcode::INVOKEINTERFACE);
                w.emit_u16(*idx);
            }
            Op::TableSwitch {
                low,
                default,
                targets,
            } => {
                w.emit_u8(opcode::TABLESWITCH);
                w.emit_i32(*low);
                w.emit_u32(*default);
                w.emit_u32(targets.len() as u32);
                for t in targets {
                    w.emit_u32(*t);
                }
            }
            Op::Ret => w.emit_u8(opcode::RET),
            Op::RetVoid => w.emit_u8(opcode::RET_VOID),
        }
    }

    /// Decode one instruction.
    pub fn decode(r: &mut ImageReader<'_>) -> Result<Op, DecodeError> {
        let offset = r.position();
        let byte = r.read_u8()?;
        let op = match byte {
            opcode::NOP => Op::Nop,
            opcode::POP => Op::Pop,
            opcode::DUP => Op::Dup,
            opcode::CONST_NULL => Op::ConstNull,
            opcode::ICONST_M1..=opcode::ICONST_5 => {
                Op::Iconst((byte as i16 - opcode::ICONST_0 as i16) as i8)
            }
            opcode::BIPUSH => Op::Bipush(r.read_u8()? as i8),
            opcode::SIPUSH => Op::Sipush(r.read_u16()? as i16),
            opcode::LDC => Op::Ldc(r.read_u16()?),
            opcode::LDC_HANDLE => Op::LdcHandle(r.read_u16()?),
            opcode::LOAD => Op::Load(r.read_u16()?),
            opcode::STORE => Op::Store(r.read_u16()?),
            opcode::NEW => Op::New(r.read_u16()?),
            opcode::CHECKCAST => Op::CheckCast(r.read_u16()?),
            opcode::GETFIELD => Op::GetField(r.read_u16()?),
            opcode::PUTFIELD => Op::PutField(r.read_u16()?),
            opcode::GETSTATIC => Op::GetStatic(r.read_u16()?),
            opcode::PUTSTATIC => Op::PutStatic(r.read_u16()?),
            opcode::ANEWARRAY => Op::AnewArray(r.read_u16()?),
            opcode::AALOAD => Op::Aaload,
            opcode::AASTORE => Op::Aastore,
            opcode::ARRAYLENGTH => Op::ArrayLength,
            opcode::INVOKEVIRTUAL => Op::InvokeVirtual(r.read_u16()?),
            opcode::INVOKESPECIAL => Op::InvokeSpecial(r.read_u16()?),
            opcode::INVOKESTATIC => Op::InvokeStatic(r.read_u16()?),
            opcode::INVOKEINTERFACE => Op::InvokeInterface(r.read_u16()?),
            opcode::TABLESWITCH => {
                let low = r.read_i32()?;
                let default = r.read_u32()?;
                let count = r.read_u32()? as usize;
                let mut targets = Vec::with_capacity(count);
                for _ in 0..count {
                    targets.push(r.read_u32()?);
                }
                Op::TableSwitch {
                    low,
                    default,
                    targets,
                }
            }
            opcode::RET => Op::Ret,
            opcode::RET_VOID => Op::RetVoid,
            _ => return Err(DecodeError::UnexpectedEof(offset)),
        };
        Ok(op)
    }

    /// Whether execution never falls through to the next instruction.
    pub fn is_terminator(&self) -> bool {
        matches!(self, Op::Ret | Op::RetVoid | Op::TableSwitch { .. })
    }
}

/// A decoded method body.
#[derive(Debug, Clone)]
pub struct CodeBody {
    /// Operand stack bound declared by the emitter
    pub max_stack: u16,
    /// Local variable table size
    pub max_locals: u16,
    /// Decoded instructions
    pub ops: Vec<Op>,
    /// Byte offset of each instruction
    pub offsets: Vec<u32>,
    index_by_offset: FxHashMap<u32, usize>,
}

impl CodeBody {
    /// Decode a raw code attribute.
    pub fn decode(code: &[u8], max_stack: u16, max_locals: u16) -> Result<CodeBody, DecodeError> {
        let mut r = ImageReader::new(code);
        let mut ops = Vec::new();
        let mut offsets = Vec::new();
        let mut index_by_offset = FxHashMap::default();
        while r.has_more() {
            let offset = r.position() as u32;
            let op = Op::decode(&mut r)?;
            index_by_offset.insert(offset, ops.len());
            offsets.push(offset);
            ops.push(op);
        }
        Ok(CodeBody {
            max_stack,
            max_locals,
            ops,
            offsets,
            index_by_offset,
        })
    }

    /// Instruction index at a byte offset, when the offset is a boundary.
    pub fn index_at(&self, offset: u32) -> Option<usize> {
        self.index_by_offset.get(&offset).copied()
    }
}
