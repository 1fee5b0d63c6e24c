//! Shared host-class harness for the glue integration suites.

#![allow(dead_code)]

use std::sync::Arc;
use weft_vm::builtins;
use weft_vm::{
    native, ClassBuilder, ClassId, GenericType, Machine, MethodBody, Modifiers, TypeBinding,
    TypeRef, Value, VmError,
};

/// Fresh machine with test logging wired up.
pub fn machine() -> Arc<Machine> {
    let _ = env_logger::builder().is_test(true).try_init();
    Machine::new()
}

pub fn int() -> TypeRef {
    TypeRef::int()
}

pub fn obj() -> TypeRef {
    TypeRef::top()
}

pub fn string() -> TypeRef {
    TypeRef::object(builtins::STRING)
}

pub fn nop() -> weft_vm::NativeFn {
    native(|_, _, _| Ok(Value::Null))
}

fn int_arg(args: &[Value], i: usize) -> Result<i32, VmError> {
    args[i]
        .as_int()
        .ok_or_else(|| VmError::TypeError(format!("argument {i} is not an int")))
}

/// `demo.Calculator` with `add`, `sub`, and a package-private `scale`.
pub fn register_calculator(machine: &Machine) -> ClassId {
    let loader = machine.boot_loader();
    ClassBuilder::new("demo.Calculator")
        .ctor(&[], Modifiers::PUBLIC, nop())
        .method(
            "add",
            &[int(), int()],
            int(),
            Modifiers::PUBLIC,
            native(|_, _, args| Ok(Value::Int(int_arg(args, 0)? + int_arg(args, 1)?))),
        )
        .method(
            "sub",
            &[int(), int()],
            int(),
            Modifiers::PUBLIC,
            native(|_, _, args| Ok(Value::Int(int_arg(args, 0)? - int_arg(args, 1)?))),
        )
        .method(
            "scale",
            &[int()],
            int(),
            Modifiers::default(), // package-private
            native(|_, _, args| Ok(Value::Int(int_arg(args, 0)? * 10))),
        )
        .register(machine, loader)
        .expect("register demo.Calculator")
}

/// `java.util.Comparator<T>` with a generic `compare(T, T)`.
pub fn register_comparator(machine: &Machine) -> ClassId {
    let loader = machine.boot_loader();
    ClassBuilder::interface("java.util.Comparator")
        .type_params(&["T"])
        .generic_method(
            "compare",
            &[obj(), obj()],
            &[GenericType::var("T"), GenericType::var("T")],
            int(),
            None,
            Modifiers::PUBLIC.with(Modifiers::ABSTRACT),
            MethodBody::Abstract,
        )
        .register(machine, loader)
        .expect("register java.util.Comparator")
}

/// `demo.StringComparator implements Comparator<String>`: the specialised
/// `compare(String, String)` plus its compiler-style bridge. The bridge is
/// declared first, the way the resolver encounters erased members.
pub fn register_string_comparator(machine: &Machine) -> ClassId {
    register_comparator(machine);
    let loader = machine.boot_loader();
    ClassBuilder::new("demo.StringComparator")
        .implements(
            TypeBinding::of("java.util.Comparator")
                .arg(GenericType::of(string())),
        )
        .ctor(&[], Modifiers::PUBLIC, nop())
        .bridge_method(
            "compare",
            &[obj(), obj()],
            int(),
            native(|m, recv, args| {
                // Erasure bridge: cast and re-dispatch to the specialised
                // method, as a compiler-synthesised bridge does.
                m.call_virtual(
                    recv,
                    "compare",
                    &[
                        TypeRef::object(builtins::STRING),
                        TypeRef::object(builtins::STRING),
                    ],
                    None,
                    args,
                )
            }),
        )
        .method(
            "compare",
            &[string(), string()],
            int(),
            Modifiers::PUBLIC,
            native(|m, _, args| {
                let a = m.get_string(args[0]).unwrap_or_default();
                let b = m.get_string(args[1]).unwrap_or_default();
                Ok(Value::Int(a.len() as i32 - b.len() as i32))
            }),
        )
        .register(machine, loader)
        .expect("register demo.StringComparator")
}

/// `demo.A` with a covariant-cloneable subclass `demo.B`:
/// `A.clone(): A`, `B.clone(): B` plus the bridge `B.clone(): A`.
pub fn register_covariant_pair(machine: &Machine) -> (ClassId, ClassId) {
    let loader = machine.boot_loader();
    let a = ClassBuilder::new("demo.A")
        .ctor(&[], Modifiers::PUBLIC, nop())
        .method(
            "clone",
            &[],
            TypeRef::object("demo.A"),
            Modifiers::PUBLIC,
            native(|m, recv, _| {
                let class = m.instance_class(recv).ok_or(VmError::NullPointer)?;
                Ok(m.alloc_instance(class))
            }),
        )
        .register(machine, loader)
        .expect("register demo.A");
    let b = ClassBuilder::new("demo.B")
        .extends(TypeBinding::of("demo.A"))
        .ctor(&[], Modifiers::PUBLIC, nop())
        .bridge_method(
            "clone",
            &[],
            TypeRef::object("demo.A"),
            native(|m, recv, _| {
                m.call_virtual(recv, "clone", &[], Some(&TypeRef::object("demo.B")), &[])
            }),
        )
        .method(
            "clone",
            &[],
            TypeRef::object("demo.B"),
            Modifiers::PUBLIC,
            native(|m, recv, _| {
                let class = m.instance_class(recv).ok_or(VmError::NullPointer)?;
                Ok(m.alloc_instance(class))
            }),
        )
        .register(machine, loader)
        .expect("register demo.B");
    (a, b)
}

/// `demo.Foo` with `new Foo(String, int)` and accessors, for fast-class
/// construction tests.
pub fn register_foo(machine: &Machine) -> ClassId {
    let loader = machine.boot_loader();
    ClassBuilder::new("demo.Foo")
        .field("name", string(), Modifiers::PRIVATE)
        .field("count", int(), Modifiers::PRIVATE)
        .ctor(
            &[string(), int()],
            Modifiers::PUBLIC,
            native(|m, recv, args| {
                m.set_field_by_name(recv, "name", args[0])?;
                m.set_field_by_name(recv, "count", args[1])?;
                Ok(Value::Null)
            }),
        )
        .method(
            "name",
            &[],
            string(),
            Modifiers::PUBLIC,
            native(|m, recv, _| m.get_field_by_name(recv, "name")),
        )
        .method(
            "count",
            &[],
            int(),
            Modifiers::PUBLIC,
            native(|m, recv, _| m.get_field_by_name(recv, "count")),
        )
        .method(
            "describe",
            &[int()],
            string(),
            Modifiers::PUBLIC,
            native(|m, recv, args| {
                let name = m
                    .get_string(m.get_field_by_name(recv, "name")?)
                    .unwrap_or_default();
                Ok(m.new_string(format!("{name}:{}", int_arg(args, 0)?)))
            }),
        )
        .method(
            "statics",
            &[int()],
            int(),
            Modifiers::PUBLIC.with(Modifiers::STATIC),
            native(|_, _, args| Ok(Value::Int(int_arg(args, 0)? + 100))),
        )
        .register(machine, loader)
        .expect("register demo.Foo")
}

/// A host declaring `finalize` and a final method, for exclusion tests.
pub fn register_awkward(machine: &Machine) -> ClassId {
    let loader = machine.boot_loader();
    ClassBuilder::new("demo.Awkward")
        .ctor(&[], Modifiers::PUBLIC, nop())
        .method(
            "finalize",
            &[],
            TypeRef::Void,
            Modifiers::PROTECTED,
            nop(),
        )
        .method(
            "sealed",
            &[],
            int(),
            Modifiers::PUBLIC.with(Modifiers::FINAL),
            native(|_, _, _| Ok(Value::Int(7))),
        )
        .method(
            "open",
            &[],
            int(),
            Modifiers::PUBLIC,
            native(|_, _, _| Ok(Value::Int(8))),
        )
        .register(machine, loader)
        .expect("register demo.Awkward")
}
