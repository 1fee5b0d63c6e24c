//! Built-in platform classes
//!
//! Registered under the bootstrap loader when a machine starts:
//! - the top type and core references (`java.lang.Object`, `String`, `Class`)
//! - the boxed primitive classes with their `valueOf` / accessor pairs
//! - the glue plumbing consumed by generated classes: the handler
//!   interface, the two-argument invoker interface, method handles, and
//!   the lambda-factory intrinsic that wraps a trampoline handle into an
//!   `int -> BiFunction` invoker table.

use crate::class::{native, ClassBuilder, Modifiers, TypeBinding};
use crate::machine::Machine;
use crate::object::{HandleKind, Payload};
use crate::value::{Prim, TypeRef, Value};
use crate::VmError;
use std::sync::Arc;

/// `java.lang.Object`
pub const OBJECT: &str = "java.lang.Object";
/// `java.lang.String`
pub const STRING: &str = "java.lang.String";
/// `java.lang.Class`
pub const CLASS: &str = "java.lang.Class";
/// The interception callback interface
pub const HANDLER: &str = "weft.aop.Handler";
/// Built-in wrapper class carrying a host callback
pub const HANDLER_IMPL: &str = "weft.aop.HandlerImpl";
/// The two-argument invoker interface `(context, args[]) -> result`
pub const BIFUNCTION: &str = "weft.function.BiFunction";
/// Direct member handle
pub const METHOD_HANDLE: &str = "weft.invoke.MethodHandle";
/// `int -> BiFunction` invoker table
pub const INT_FUNCTION: &str = "weft.invoke.IntFunction";
/// A `BiFunction` bound to one trampoline index
pub const BOUND_INVOKER: &str = "weft.invoke.BoundInvoker";
/// The lambda-factory intrinsic
pub const LAMBDA_FACTORY: &str = "weft.invoke.LambdaFactory";

fn obj() -> TypeRef {
    TypeRef::object(OBJECT)
}

fn obj_array() -> TypeRef {
    TypeRef::array(TypeRef::object(OBJECT))
}

/// Register all built-in classes. Called once from [`Machine::new`].
pub(crate) fn bootstrap(machine: &Arc<Machine>) {
    let loader = machine.boot_loader();
    let public = Modifiers::PUBLIC;
    let public_final = Modifiers::PUBLIC.with(Modifiers::FINAL);
    let protected = Modifiers::PROTECTED;

    ClassBuilder::root(OBJECT)
        .ctor(&[], public, native(|_, _, _| Ok(Value::Null)))
        .method(
            "equals",
            &[obj()],
            TypeRef::Prim(Prim::Bool),
            public,
            native(|_, receiver, args| Ok(Value::Bool(receiver == args[0]))),
        )
        .method(
            "hashCode",
            &[],
            TypeRef::int(),
            public,
            native(|m, receiver, _| {
                Ok(Value::Int(m.object_id(receiver).unwrap_or(0) as i32))
            }),
        )
        .method(
            "toString",
            &[],
            TypeRef::object(STRING),
            public,
            native(|m, receiver, _| {
                let class = m
                    .instance_class(receiver)
                    .map(|id| m.class(id).name.clone())
                    .unwrap_or_else(|| "null".to_string());
                let id = m.object_id(receiver).unwrap_or(0);
                Ok(m.new_string(format!("{class}@{id:x}")))
            }),
        )
        .method(
            "clone",
            &[],
            obj(),
            protected,
            native(|m, receiver, _| m.clone_object(receiver)),
        )
        .method(
            "finalize",
            &[],
            TypeRef::Void,
            protected,
            native(|_, _, _| Ok(Value::Null)),
        )
        .method(
            "getClass",
            &[],
            TypeRef::object(CLASS),
            public_final,
            native(|m, receiver, _| {
                let class = m.instance_class(receiver).ok_or(VmError::NullPointer)?;
                Ok(m.class_mirror(class))
            }),
        )
        .method(
            "notifyAll",
            &[],
            TypeRef::Void,
            public_final,
            native(|_, _, _| Ok(Value::Null)),
        )
        .register(machine, loader)
        .expect("builtin registration: Object");

    ClassBuilder::new(STRING)
        .modifiers(public_final)
        .method(
            "length",
            &[],
            TypeRef::int(),
            public,
            native(|m, receiver, _| {
                let s = m
                    .get_string(receiver)
                    .ok_or_else(|| VmError::TypeError("not a string".to_string()))?;
                Ok(Value::Int(s.len() as i32))
            }),
        )
        .method(
            "equals",
            &[obj()],
            TypeRef::Prim(Prim::Bool),
            public,
            native(|m, receiver, args| {
                let a = m.get_string(receiver);
                let b = m.get_string(args[0]);
                Ok(Value::Bool(a.is_some() && a == b))
            }),
        )
        .method(
            "toString",
            &[],
            TypeRef::object(STRING),
            public,
            native(|_, receiver, _| Ok(receiver)),
        )
        .register(machine, loader)
        .expect("builtin registration: String");

    ClassBuilder::new(CLASS)
        .modifiers(public_final)
        .method(
            "getName",
            &[],
            TypeRef::object(STRING),
            public,
            native(|m, receiver, _| {
                let name = m
                    .with_payload(receiver, |p| match p {
                        Payload::Mirror(id) => Some(*id),
                        _ => None,
                    })
                    .flatten()
                    .ok_or_else(|| VmError::TypeError("not a class mirror".to_string()))?;
                Ok(m.new_string(m.class(name).name.clone()))
            }),
        )
        .register(machine, loader)
        .expect("builtin registration: Class");

    for prim in Prim::ALL {
        register_boxed(machine, prim);
    }

    // Handler interface and the wrapper that carries host callbacks.
    ClassBuilder::interface(HANDLER)
        .abstract_method(
            "invoke",
            &[obj(), obj(), obj_array()],
            obj(),
            Modifiers::PUBLIC,
        )
        .register(machine, loader)
        .expect("builtin registration: Handler");

    ClassBuilder::new(HANDLER_IMPL)
        .modifiers(public_final)
        .implements(TypeBinding::of(HANDLER))
        .method(
            "invoke",
            &[obj(), obj(), obj_array()],
            obj(),
            public,
            native(|m, receiver, args| {
                let handler = m
                    .with_payload(receiver, |p| match p {
                        Payload::Handler(h) => Some(h.clone()),
                        _ => None,
                    })
                    .flatten()
                    .ok_or_else(|| VmError::TypeError("not a handler".to_string()))?;
                let unpacked = if args[2].is_null() {
                    Vec::new()
                } else {
                    m.array_values(args[2])
                        .ok_or_else(|| VmError::TypeError("handler args not an array".to_string()))?
                };
                handler.invoke(m, args[0], args[1], &unpacked)
            }),
        )
        .register(machine, loader)
        .expect("builtin registration: HandlerImpl");

    ClassBuilder::interface(BIFUNCTION)
        .abstract_method("apply", &[obj(), obj_array()], obj(), Modifiers::PUBLIC)
        .register(machine, loader)
        .expect("builtin registration: BiFunction");

    ClassBuilder::new(METHOD_HANDLE)
        .modifiers(public_final)
        .register(machine, loader)
        .expect("builtin registration: MethodHandle");

    // int -> BiFunction table. For a static trampoline handle, apply(i)
    // binds the index; for a constructor handle it constructs directly.
    ClassBuilder::new(INT_FUNCTION)
        .modifiers(public_final)
        .method(
            "apply",
            &[TypeRef::int()],
            obj(),
            public,
            native(|m, receiver, args| {
                let handle = m
                    .with_payload(receiver, |p| match p {
                        Payload::Table(h) => Some(*h),
                        _ => None,
                    })
                    .flatten()
                    .ok_or_else(|| VmError::TypeError("not an invoker table".to_string()))?;
                let index = args[0]
                    .as_int()
                    .ok_or_else(|| VmError::TypeError("table index must be int".to_string()))?;
                match handle.kind {
                    HandleKind::Static(_) => Ok(m.alloc_builtin(
                        BOUND_INVOKER,
                        Payload::Bound { handle, index },
                    )),
                    HandleKind::Ctor(idx) => {
                        m.instantiate_by_index(handle.class, idx, &[Value::Int(index)])
                    }
                }
            }),
        )
        .register(machine, loader)
        .expect("builtin registration: IntFunction");

    ClassBuilder::new(BOUND_INVOKER)
        .modifiers(public_final)
        .implements(TypeBinding::of(BIFUNCTION))
        .method(
            "apply",
            &[obj(), obj_array()],
            obj(),
            public,
            native(|m, receiver, args| {
                let (handle, index) = m
                    .with_payload(receiver, |p| match p {
                        Payload::Bound { handle, index } => Some((*handle, *index)),
                        _ => None,
                    })
                    .flatten()
                    .ok_or_else(|| VmError::TypeError("not a bound invoker".to_string()))?;
                let HandleKind::Static(method) = handle.kind else {
                    return Err(VmError::TypeError(
                        "bound invoker requires a static handle".to_string(),
                    ));
                };
                m.invoke_declared(
                    handle.class,
                    method,
                    Value::Null,
                    &[Value::Int(index), args[0], args[1]],
                )
            }),
        )
        .register(machine, loader)
        .expect("builtin registration: BoundInvoker");

    ClassBuilder::new(LAMBDA_FACTORY)
        .modifiers(public_final)
        .method(
            "table",
            &[TypeRef::object(METHOD_HANDLE)],
            TypeRef::object(INT_FUNCTION),
            Modifiers::PUBLIC.with(Modifiers::STATIC),
            native(|m, _, args| {
                let handle = m
                    .with_payload(args[0], |p| match p {
                        Payload::Handle(h) => Some(*h),
                        _ => None,
                    })
                    .flatten()
                    .ok_or_else(|| VmError::TypeError("not a method handle".to_string()))?;
                Ok(m.alloc_builtin(INT_FUNCTION, Payload::Table(handle)))
            }),
        )
        .register(machine, loader)
        .expect("builtin registration: LambdaFactory");
}

fn register_boxed(machine: &Arc<Machine>, prim: Prim) {
    let loader = machine.boot_loader();
    let boxed = prim.boxed_class();
    ClassBuilder::new(boxed)
        .modifiers(Modifiers::PUBLIC.with(Modifiers::FINAL))
        .method(
            "valueOf",
            &[TypeRef::Prim(prim)],
            TypeRef::object(boxed),
            Modifiers::PUBLIC.with(Modifiers::STATIC),
            native(move |m, _, args| {
                match args[0].prim_kind() {
                    Some(kind) if kind == prim => Ok(m.box_value(args[0])),
                    _ => Err(VmError::TypeError(format!(
                        "{}.valueOf expects {}",
                        prim.boxed_class(),
                        prim.name()
                    ))),
                }
            }),
        )
        .method(
            prim.accessor(),
            &[],
            TypeRef::Prim(prim),
            Modifiers::PUBLIC,
            native(move |m, receiver, _| {
                m.unbox_value(receiver).ok_or_else(|| {
                    VmError::TypeError(format!("receiver is not a boxed {}", prim.name()))
                })
            }),
        )
        .register(machine, loader)
        .unwrap_or_else(|_| panic!("builtin registration: {boxed}"));
}
