//! Fast-class scenarios

mod common;

use common::*;
use weft_aop::{Aop, AopError, DefinerPolicy};
use weft_vm::{Value, VmError};

#[test]
fn test_constructor_invoker_builds_instances() {
    let machine = machine();
    let host = register_foo(&machine);
    let aop = Aop::new(machine.clone(), DefinerPolicy::TryUnsafeOrChild);
    let fast = aop.fast_class(host).unwrap();

    let ctor = fast.invoker("<init>;java.lang.String;int").unwrap();
    let name = machine.new_string("hi");
    let foo = ctor(Value::Null, &[name, machine.box_value(Value::Int(7))]).unwrap();

    assert!(machine.is_instance(foo, "demo.Foo"));
    assert_eq!(
        machine.get_string(machine.get_field_by_name(foo, "name").unwrap()),
        Some("hi".to_string())
    );
    assert_eq!(
        machine.get_field_by_name(foo, "count").unwrap(),
        Value::Int(7)
    );
}

#[test]
fn test_constructor_rejects_wrong_argument_type() {
    let machine = machine();
    let host = register_foo(&machine);
    let aop = Aop::new(machine.clone(), DefinerPolicy::TryUnsafeOrChild);
    let fast = aop.fast_class(host).unwrap();

    let ctor = fast.invoker("<init>;java.lang.String;int").unwrap();
    // An Integer where a String is declared fails the checked cast.
    let err = ctor(
        Value::Null,
        &[machine.box_value(Value::Int(1)), machine.box_value(Value::Int(7))],
    );
    assert!(matches!(err, Err(VmError::ClassCast { .. })), "{err:?}");
}

#[test]
fn test_invokers_match_direct_calls() {
    let machine = machine();
    let host = register_foo(&machine);
    let aop = Aop::new(machine.clone(), DefinerPolicy::TryUnsafeOrChild);
    let fast = aop.fast_class(host).unwrap();

    let name = machine.new_string("x");
    let foo = machine
        .instantiate(
            host,
            &[string(), int()],
            &[name, Value::Int(2)],
        )
        .unwrap();

    // Instance method with a primitive argument and reference result.
    let describe = fast.invoker("describe;int").unwrap();
    let via_glue = describe(foo, &[machine.box_value(Value::Int(3))]).unwrap();
    let direct = machine
        .call_virtual(foo, "describe", &[int()], None, &[Value::Int(3)])
        .unwrap();
    assert_eq!(machine.get_string(via_glue), machine.get_string(direct));

    // Primitive result comes back boxed from the glue.
    let count = fast.invoker("count;").unwrap();
    let boxed = count(foo, &[]).unwrap();
    assert_eq!(machine.unbox_value(boxed), Some(Value::Int(2)));
    assert_eq!(
        machine.call_virtual(foo, "count", &[], None, &[]).unwrap(),
        Value::Int(2)
    );
}

#[test]
fn test_static_method_takes_null_context() {
    let machine = machine();
    let host = register_foo(&machine);
    let aop = Aop::new(machine.clone(), DefinerPolicy::TryUnsafeOrChild);
    let fast = aop.fast_class(host).unwrap();

    let invoker = fast.invoker("statics;int").unwrap();
    let out = invoker(Value::Null, &[machine.box_value(Value::Int(1))]).unwrap();
    assert_eq!(machine.unbox_value(out), Some(Value::Int(101)));
}

#[test]
fn test_unknown_signature_yields_no_invoker() {
    let machine = machine();
    let host = register_foo(&machine);
    let aop = Aop::new(machine.clone(), DefinerPolicy::TryUnsafeOrChild);
    let fast = aop.fast_class(host).unwrap();

    assert!(fast.invoker("nope;").is_none());
    assert!(fast.invoker("describe;long").is_none());
}

#[test]
fn test_fast_class_is_cached_per_host() {
    let machine = machine();
    let host = register_foo(&machine);
    let aop = Aop::new(machine.clone(), DefinerPolicy::TryUnsafeOrChild);

    let first = aop.fast_class(host).unwrap();
    let count_after_first = machine.class_count();
    let second = aop.fast_class(host).unwrap();
    assert_eq!(machine.class_count(), count_after_first);
    assert_eq!(first.glue_class(), second.glue_class());
}

#[test]
fn test_off_policy_fails_builds() {
    let machine = machine();
    let host = register_foo(&machine);
    let aop = Aop::new(machine.clone(), DefinerPolicy::Off);
    assert!(matches!(
        aop.fast_class(host),
        Err(AopError::ClassDefiningUnavailable)
    ));
}
