//! Method-resolution scenarios

mod common;

use common::*;
use weft_aop::resolve::resolve_enhanceable;
use weft_vm::builtins;
use weft_vm::{ClassBuilder, GenericType, MethodBody, Modifiers, TypeBinding, TypeRef};

#[test]
fn test_resolution_is_idempotent() {
    let machine = machine();
    let host = register_calculator(&machine);

    let first = resolve_enhanceable(&machine, host, true).unwrap();
    let second = resolve_enhanceable(&machine, host, true).unwrap();

    let tuples = |t: &weft_aop::EnhancerTarget| {
        t.enhanceable
            .iter()
            .map(|e| {
                (
                    e.method.name.clone(),
                    e.method.params.clone(),
                    e.method.declaring.clone(),
                )
            })
            .collect::<Vec<_>>()
    };
    assert_eq!(tuples(&first), tuples(&second));
    assert!(!first.enhanceable.is_empty());
}

#[test]
fn test_top_type_methods_without_terminal_ones() {
    let machine = machine();
    let host = register_calculator(&machine);
    let target = resolve_enhanceable(&machine, host, true).unwrap();

    let names: Vec<&str> = target
        .enhanceable
        .iter()
        .map(|e| e.method.name.as_str())
        .collect();
    for expected in ["add", "sub", "scale", "equals", "hashCode", "toString", "clone"] {
        assert!(names.contains(&expected), "missing {expected}: {names:?}");
    }
    // Terminal and final top-type members never appear.
    assert!(!names.contains(&"finalize"));
    assert!(!names.contains(&"getClass"));
    assert!(!names.contains(&"notifyAll"));
}

#[test]
fn test_package_private_requires_package_access() {
    let machine = machine();
    let host = register_calculator(&machine);

    let with_access = resolve_enhanceable(&machine, host, true).unwrap();
    assert!(with_access
        .enhanceable
        .iter()
        .any(|e| e.method.name == "scale"));

    let without_access = resolve_enhanceable(&machine, host, false).unwrap();
    assert!(!without_access
        .enhanceable
        .iter()
        .any(|e| e.method.name == "scale"));
}

#[test]
fn test_host_declared_finalize_is_excluded() {
    let machine = machine();
    let host = register_awkward(&machine);
    let target = resolve_enhanceable(&machine, host, true).unwrap();

    let names: Vec<&str> = target
        .enhanceable
        .iter()
        .map(|e| e.method.name.as_str())
        .collect();
    assert!(!names.contains(&"finalize"));
    assert!(!names.contains(&"sealed"), "final methods are suppressed");
    assert!(names.contains(&"open"));
}

#[test]
fn test_bridge_delegate_matching() {
    let machine = machine();
    let host = register_string_comparator(&machine);
    let target = resolve_enhanceable(&machine, host, true).unwrap();

    // The specialised method is reported; point-cut matchers that skip
    // synthetic members see exactly one compare.
    let real: Vec<_> = target
        .enhanceable
        .iter()
        .filter(|e| e.method.name == "compare" && !e.method.modifiers.is_synthetic())
        .collect();
    assert_eq!(real.len(), 1);
    assert_eq!(real[0].method.params, vec![string(), string()]);

    // The bridge maps to it.
    let plans: Vec<_> = target.bridge_delegates().collect();
    assert_eq!(plans.len(), 1);
    let plan = &plans[0];
    assert!(plan.bridge.modifiers.is_bridge());
    assert_eq!(plan.bridge.params, vec![obj(), obj()]);
    assert_eq!(plan.delegate.params, vec![string(), string()]);
    assert!(!plan.delegate.modifiers.is_bridge());

    // Post-erasure compatibility: every delegate parameter narrows the
    // bridge's.
    for (bridge_param, delegate_param) in plan.bridge.params.iter().zip(&plan.delegate.params) {
        assert!(
            bridge_param == delegate_param
                || bridge_param.object_name() == Some(builtins::OBJECT),
            "{delegate_param} does not narrow {bridge_param}"
        );
    }
}

#[test]
fn test_covariant_return_reports_specialised_method() {
    let machine = machine();
    let (_, b) = register_covariant_pair(&machine);
    let target = resolve_enhanceable(&machine, b, true).unwrap();

    let clones: Vec<_> = target
        .enhanceable
        .iter()
        .filter(|e| e.method.name == "clone")
        .collect();
    assert_eq!(clones.len(), 1);
    let slot = clones[0];
    assert_eq!(slot.method.ret, TypeRef::object("demo.B"));
    assert_eq!(slot.method.declaring, "demo.B");
    assert!(!slot.method.modifiers.is_synthetic());

    let plan = slot.bridge.as_ref().expect("bridge plan for clone");
    assert_eq!(plan.bridge.ret, TypeRef::object("demo.A"));
    assert_eq!(plan.delegate.ret, TypeRef::object("demo.B"));
}

#[test]
fn test_interface_merge_handles_diamonds() {
    let machine = machine();
    let loader = machine.boot_loader();
    let abstract_int = |builder: ClassBuilder, name: &str| {
        builder.abstract_method(name, &[], TypeRef::int(), Modifiers::PUBLIC)
    };

    abstract_int(ClassBuilder::interface("demo.I"), "fromI")
        .register(&machine, loader)
        .unwrap();
    abstract_int(
        ClassBuilder::interface("demo.J").implements(TypeBinding::of("demo.I")),
        "fromJ",
    )
    .register(&machine, loader)
    .unwrap();
    abstract_int(
        ClassBuilder::interface("demo.K").implements(TypeBinding::of("demo.I")),
        "fromK",
    )
    .register(&machine, loader)
    .unwrap();
    let host = ClassBuilder::new("demo.Diamond")
        .implements(TypeBinding::of("demo.J"))
        .implements(TypeBinding::of("demo.K"))
        .ctor(&[], Modifiers::PUBLIC, nop())
        .register(&machine, loader)
        .unwrap();

    let target = resolve_enhanceable(&machine, host, true).unwrap();
    let names: Vec<&str> = target
        .enhanceable
        .iter()
        .map(|e| e.method.name.as_str())
        .collect();
    // Each interface contributes once, diamond notwithstanding.
    assert_eq!(names.iter().filter(|n| **n == "fromI").count(), 1);
    assert_eq!(names.iter().filter(|n| **n == "fromJ").count(), 1);
    assert_eq!(names.iter().filter(|n| **n == "fromK").count(), 1);
}

#[test]
fn test_generic_superclass_bridge() {
    let machine = machine();
    let loader = machine.boot_loader();

    // class Box<T> { void set(T) } / class StringBox extends Box<String>
    ClassBuilder::new("demo.Box")
        .type_params(&["T"])
        .ctor(&[], Modifiers::PUBLIC, nop())
        .generic_method(
            "set",
            &[obj()],
            &[GenericType::var("T")],
            TypeRef::Void,
            None,
            Modifiers::PUBLIC,
            MethodBody::Native(nop()),
        )
        .register(&machine, loader)
        .unwrap();
    let host = ClassBuilder::new("demo.StringBox")
        .extends(TypeBinding::of("demo.Box").arg(GenericType::of(string())))
        .ctor(&[], Modifiers::PUBLIC, nop())
        .bridge_method(
            "set",
            &[obj()],
            TypeRef::Void,
            nop(),
        )
        .method("set", &[string()], TypeRef::Void, Modifiers::PUBLIC, nop())
        .register(&machine, loader)
        .unwrap();

    let target = resolve_enhanceable(&machine, host, true).unwrap();
    let plans: Vec<_> = target.bridge_delegates().collect();
    assert_eq!(plans.len(), 1);
    assert_eq!(plans[0].bridge.params, vec![obj()]);
    assert_eq!(plans[0].delegate.params, vec![string()]);
    assert_eq!(plans[0].delegate.declaring, "demo.StringBox");
}
