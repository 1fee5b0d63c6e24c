//! Class-image verification
//!
//! Run by the class definer before a class is installed. Checks constant
//! pool references, local-variable bounds, jump targets, and operand stack
//! depths against each method's declared maxima. Glue generators emit
//! straight-line code plus table-switches, so a worklist over instruction
//! indices with a single depth per index is a complete check.

use super::op::{CodeBody, Op};
use super::pool::{ConstantPool, PoolEntry};
use super::{Image, ImageMethod};

/// Image verification errors
#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    /// Code bytes could not be decoded
    #[error("method {method}: undecodable code: {source}")]
    BadCode {
        /// Method name
        method: String,
        /// Underlying decode failure
        source: super::codec::DecodeError,
    },

    /// A method other than an abstract one has no code
    #[error("method {0}: missing code")]
    MissingCode(String),

    /// Constant-pool index out of range or of the wrong kind
    #[error("invalid constant reference {index} at offset {offset} (expected {expected})")]
    InvalidConstantRef {
        /// Referenced pool index
        index: u16,
        /// Code offset of the instruction
        offset: u32,
        /// Expected entry kind
        expected: &'static str,
    },

    /// Local variable index out of bounds
    #[error("invalid local {index} at offset {offset} (max {max})")]
    InvalidLocalRef {
        /// Referenced local slot
        index: u16,
        /// Code offset
        offset: u32,
        /// Declared local table size
        max: u16,
    },

    /// Branch target not on an instruction boundary
    #[error("invalid jump target {target} at offset {offset}")]
    InvalidJumpTarget {
        /// Branch target offset
        target: u32,
        /// Code offset of the branch
        offset: u32,
    },

    /// Operand stack underflow
    #[error("stack underflow at offset {0}")]
    StackUnderflow(u32),

    /// Operand stack exceeds the declared maximum
    #[error("stack overflow at offset {offset} (depth {depth}, max {max})")]
    StackOverflow {
        /// Code offset
        offset: u32,
        /// Simulated depth
        depth: i32,
        /// Declared maximum
        max: u16,
    },

    /// Two paths reach an instruction with different stack depths
    #[error("inconsistent stack depth at offset {offset} ({first} vs {second})")]
    DepthMismatch {
        /// Code offset
        offset: u32,
        /// Depth recorded first
        first: i32,
        /// Conflicting depth
        second: i32,
    },

    /// Execution can fall off the end of the method
    #[error("execution falls off end of method at offset {0}")]
    FallOffEnd(u32),

    /// Malformed class header reference
    #[error("invalid class header: {0}")]
    BadHeader(&'static str),
}

/// Verify a whole image.
pub fn verify_image(image: &Image) -> Result<(), VerifyError> {
    if image.pool.class_name(image.this_class).is_none() {
        return Err(VerifyError::BadHeader("this_class"));
    }
    if image.pool.class_name(image.super_class).is_none() {
        return Err(VerifyError::BadHeader("super_class"));
    }
    for i in &image.interfaces {
        if image.pool.class_name(*i).is_none() {
            return Err(VerifyError::BadHeader("interface"));
        }
    }
    for f in &image.fields {
        if image.pool.utf8(f.name).is_none() || image.pool.utf8(f.ty).is_none() {
            return Err(VerifyError::BadHeader("field"));
        }
    }
    for m in &image.methods {
        verify_method(&image.pool, m)?;
    }
    Ok(())
}

fn method_name(pool: &ConstantPool, m: &ImageMethod) -> String {
    pool.utf8(m.name).unwrap_or("<unnamed>").to_string()
}

fn verify_method(pool: &ConstantPool, m: &ImageMethod) -> Result<(), VerifyError> {
    if pool.utf8(m.name).is_none() || pool.utf8(m.ret).is_none() {
        return Err(VerifyError::BadHeader("method"));
    }
    for p in &m.params {
        if pool.utf8(*p).is_none() {
            return Err(VerifyError::BadHeader("method parameter"));
        }
    }
    if m.code.is_empty() {
        return Err(VerifyError::MissingCode(method_name(pool, m)));
    }
    let body = CodeBody::decode(&m.code, m.max_stack, m.max_locals).map_err(|source| {
        VerifyError::BadCode {
            method: method_name(pool, m),
            source,
        }
    })?;

    // Worklist over instruction indices, one stack depth per instruction.
    let mut depths: Vec<Option<i32>> = vec![None; body.ops.len()];
    let mut work = vec![(0usize, 0i32)];
    while let Some((idx, depth)) = work.pop() {
        let offset = body.offsets[idx];
        match depths[idx] {
            Some(seen) if seen != depth => {
                return Err(VerifyError::DepthMismatch {
                    offset,
                    first: seen,
                    second: depth,
                })
            }
            Some(_) => continue,
            None => depths[idx] = Some(depth),
        }

        let op = &body.ops[idx];
        let (pops, pushes) = stack_effect(pool, op, offset)?;
        check_locals(op, m.max_locals, offset)?;
        if depth < pops {
            return Err(VerifyError::StackUnderflow(offset));
        }
        let next_depth = depth - pops + pushes;
        if next_depth > m.max_stack as i32 {
            return Err(VerifyError::StackOverflow {
                offset,
                depth: next_depth,
                max: m.max_stack,
            });
        }

        match op {
            Op::TableSwitch {
                default, targets, ..
            } => {
                for target in targets.iter().chain(std::iter::once(default)) {
                    let t_idx = body.index_at(*target).ok_or(VerifyError::InvalidJumpTarget {
                        target: *target,
                        offset,
                    })?;
                    work.push((t_idx, next_depth));
                }
            }
            Op::Ret | Op::RetVoid => {}
            _ => {
                if idx + 1 >= body.ops.len() {
                    return Err(VerifyError::FallOffEnd(offset));
                }
                work.push((idx + 1, next_depth));
            }
        }
    }
    Ok(())
}

fn check_locals(op: &Op, max_locals: u16, offset: u32) -> Result<(), VerifyError> {
    let slot = match op {
        Op::Load(s) | Op::Store(s) => *s,
        _ => return Ok(()),
    };
    if slot >= max_locals {
        return Err(VerifyError::InvalidLocalRef {
            index: slot,
            offset,
            max: max_locals,
        });
    }
    Ok(())
}

fn expect(
    pool: &ConstantPool,
    index: u16,
    offset: u32,
    expected: &'static str,
    ok: bool,
) -> Result<(), VerifyError> {
    if pool.get(index).is_some() && ok {
        Ok(())
    } else {
        Err(VerifyError::InvalidConstantRef {
            index,
            offset,
            expected,
        })
    }
}

/// (pops, pushes) of one instruction, validating its pool reference.
fn stack_effect(pool: &ConstantPool, op: &Op, offset: u32) -> Result<(i32, i32), VerifyError> {
    let effect = match *op {
        Op::Nop => (0, 0),
        Op::Pop => (1, 0),
        Op::Dup => (1, 2),
        Op::ConstNull | Op::Iconst(_) | Op::Bipush(_) | Op::Sipush(_) => (0, 1),
        Op::Ldc(idx) => {
            let ok = matches!(pool.get(idx), Some(PoolEntry::Int(_)) | Some(PoolEntry::Utf8(_)));
            expect(pool, idx, offset, "Int or Utf8", ok)?;
            (0, 1)
        }
        Op::LdcHandle(idx) => {
            let ok = matches!(pool.get(idx), Some(PoolEntry::Handle { .. }));
            expect(pool, idx, offset, "Handle", ok)?;
            (0, 1)
        }
        Op::Load(_) => (0, 1),
        Op::Store(_) => (1, 0),
        Op::New(idx) | Op::CheckCast(idx) | Op::AnewArray(idx) => {
            let ok = matches!(pool.get(idx), Some(PoolEntry::Class { .. }));
            expect(pool, idx, offset, "Class", ok)?;
            match op {
                Op::New(_) => (0, 1),
                _ => (1, 1),
            }
        }
        Op::GetField(idx) | Op::PutField(idx) | Op::GetStatic(idx) | Op::PutStatic(idx) => {
            let ok = matches!(pool.get(idx), Some(PoolEntry::FieldRef { .. }));
            expect(pool, idx, offset, "FieldRef", ok)?;
            match op {
                Op::GetField(_) => (1, 1),
                Op::PutField(_) => (2, 0),
                Op::GetStatic(_) => (0, 1),
                _ => (1, 0),
            }
        }
        Op::Aaload => (2, 1),
        Op::Aastore => (3, 0),
        Op::ArrayLength => (1, 1),
        Op::InvokeVirtual(idx)
        | Op::InvokeSpecial(idx)
        | Op::InvokeStatic(idx)
        | Op::InvokeInterface(idx) => {
            let Some(PoolEntry::MethodRef { params, ret, .. }) = pool.get(idx) else {
                return Err(VerifyError::InvalidConstantRef {
                    index: idx,
                    offset,
                    expected: "MethodRef",
                });
            };
            let receiver = if matches!(op, Op::InvokeStatic(_)) { 0 } else { 1 };
            let returns = match pool.utf8(*ret) {
                Some("void") => 0,
                Some(_) => 1,
                None => {
                    return Err(VerifyError::InvalidConstantRef {
                        index: *ret,
                        offset,
                        expected: "Utf8",
                    })
                }
            };
            (receiver + params.len() as i32, returns)
        }
        Op::TableSwitch { .. } => (1, 0),
        Op::Ret => (1, 0),
        Op::RetVoid => (0, 0),
    };
    Ok(effect)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::codec::ImageWriter;
    use crate::image::{ImageMethod, MAJOR_VERSION, MINOR_VERSION};

    fn code(ops: &[Op]) -> Vec<u8> {
        let mut w = ImageWriter::new();
        for op in ops {
            op.encode(&mut w);
        }
        w.buffer
    }

    fn image_with(methods: Vec<ImageMethod>) -> Image {
        Image {
            minor: MINOR_VERSION,
            major: MAJOR_VERSION,
            pool: ConstantPool {
                entries: vec![
                    PoolEntry::Utf8("demo.G".to_string()),
                    PoolEntry::Class { name: 0 },
                    PoolEntry::Utf8("java.lang.Object".to_string()),
                    PoolEntry::Class { name: 2 },
                    PoolEntry::Utf8("m".to_string()),
                    PoolEntry::Int(9),
                ],
            },
            flags: 0x0001,
            this_class: 1,
            super_class: 3,
            interfaces: vec![],
            fields: vec![],
            methods,
        }
    }

    fn method(max_stack: u16, max_locals: u16, ops: &[Op]) -> ImageMethod {
        ImageMethod {
            flags: 0x0001,
            name: 4,
            params: vec![],
            ret: 2,
            max_stack,
            max_locals,
            code: code(ops),
        }
    }

    #[test]
    fn test_accepts_simple_method() {
        let image = image_with(vec![method(1, 1, &[Op::ConstNull, Op::Ret])]);
        verify_image(&image).unwrap();
    }

    #[test]
    fn test_rejects_fall_off_end() {
        let image = image_with(vec![method(1, 1, &[Op::ConstNull])]);
        assert!(matches!(
            verify_image(&image),
            Err(VerifyError::FallOffEnd(_))
        ));
    }

    #[test]
    fn test_rejects_stack_underflow() {
        let image = image_with(vec![method(1, 1, &[Op::Pop, Op::ConstNull, Op::Ret])]);
        assert!(matches!(
            verify_image(&image),
            Err(VerifyError::StackUnderflow(0))
        ));
    }

    #[test]
    fn test_rejects_stack_overflow() {
        let image = image_with(vec![method(
            1,
            1,
            &[Op::ConstNull, Op::ConstNull, Op::Ret],
        )]);
        assert!(matches!(
            verify_image(&image),
            Err(VerifyError::StackOverflow { .. })
        ));
    }

    #[test]
    fn test_rejects_bad_local() {
        let image = image_with(vec![method(1, 1, &[Op::Load(4), Op::Ret])]);
        assert!(matches!(
            verify_image(&image),
            Err(VerifyError::InvalidLocalRef { index: 4, .. })
        ));
    }

    #[test]
    fn test_rejects_bad_jump_target() {
        let image = image_with(vec![method(
            1,
            1,
            &[
                Op::Iconst(0),
                Op::TableSwitch {
                    low: 0,
                    default: 999,
                    targets: vec![],
                },
            ],
        )]);
        assert!(matches!(
            verify_image(&image),
            Err(VerifyError::InvalidJumpTarget { target: 999, .. })
        ));
    }

    #[test]
    fn test_rejects_wrong_pool_kind() {
        // CheckCast pointing at an Int entry
        let image = image_with(vec![method(1, 1, &[Op::ConstNull, Op::CheckCast(5), Op::Ret])]);
        assert!(matches!(
            verify_image(&image),
            Err(VerifyError::InvalidConstantRef { .. })
        ));
    }

    #[test]
    fn test_accepts_table_switch() {
        // Offsets: iconst_0 at 0 (1 byte), tableswitch at 1 (17 bytes),
        // const_null at 18, ret at 19.
        let ops = [
            Op::Iconst(0),
            Op::TableSwitch {
                low: 0,
                default: 18,
                targets: vec![18],
            },
            Op::ConstNull,
            Op::Ret,
        ];
        let image = image_with(vec![method(1, 1, &ops)]);
        verify_image(&image).unwrap();
    }
}
