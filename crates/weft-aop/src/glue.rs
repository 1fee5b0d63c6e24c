//! Shared glue-emission helpers
//!
//! Argument unpacking and result boxing conventions used by both glue
//! generators: incoming `Object[]` slots are checked-cast (references) or
//! cast-to-boxed-then-accessor'd (primitives); primitive results go back
//! through the standard `valueOf` pairs; `void` surfaces as null.

use crate::emit::{ConstPoolBuilder, MethodAsm};
use weft_vm::builtins;
use weft_vm::{Prim, TypeRef};

/// Load `args[j]` from the array local and convert it to `ty`.
pub(crate) fn unpack_arg(
    m: &mut MethodAsm,
    pool: &mut ConstPoolBuilder,
    args_slot: u16,
    j: usize,
    ty: &TypeRef,
) {
    m.load(args_slot);
    m.push_int(pool, j as i32);
    m.aaload();
    convert_in(m, pool, ty);
}

/// Convert the boxed value on the stack to `ty`.
pub(crate) fn convert_in(m: &mut MethodAsm, pool: &mut ConstPoolBuilder, ty: &TypeRef) {
    match ty {
        TypeRef::Prim(p) => {
            let boxed = pool.class(p.boxed_class());
            m.checkcast(boxed);
            let accessor = pool.method(p.boxed_class(), p.accessor(), &[], ty);
            m.invoke_virtual(accessor, 0, true);
        }
        TypeRef::Object(name) if name == builtins::OBJECT => {}
        TypeRef::Object(name) => {
            let target = pool.class(name);
            m.checkcast(target);
        }
        TypeRef::Array(_) => {
            let target = pool.class(&ty.to_string());
            m.checkcast(target);
        }
        TypeRef::Void => {}
    }
}

/// Box the raw result on the stack per the declared return type. For
/// `void` the caller invoked with no pushed result; push null instead.
pub(crate) fn box_result(m: &mut MethodAsm, pool: &mut ConstPoolBuilder, ret: &TypeRef) {
    match ret {
        TypeRef::Prim(p) => emit_value_of(m, pool, *p),
        TypeRef::Void => m.const_null(),
        _ => {}
    }
}

/// Emit the standard `Boxed.valueOf(prim)` call for the value on the stack.
pub(crate) fn emit_value_of(m: &mut MethodAsm, pool: &mut ConstPoolBuilder, prim: Prim) {
    let value_of = pool.method(
        prim.boxed_class(),
        "valueOf",
        &[TypeRef::Prim(prim)],
        &TypeRef::object(prim.boxed_class()),
    );
    m.invoke_static(value_of, 1, true);
}
