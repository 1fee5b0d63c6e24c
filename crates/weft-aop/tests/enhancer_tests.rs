//! Enhancer scenarios

mod common;

use common::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use weft_aop::{signature, Aop, AopError, BitSet, DefinerPolicy, NotEnhanceableReason};
use weft_vm::image::{Image, Op};
use weft_vm::{ClassBuilder, Machine, Modifiers, TypeRef, Value, VmError};

fn boxed(machine: &Machine, v: i32) -> Value {
    machine.box_value(Value::Int(v))
}

fn constant_handler(v: i32) -> weft_vm::HandlerRef {
    Arc::new(move |m: &Machine, _recv: Value, _method: Value, _args: &[Value]| {
        Ok(m.box_value(Value::Int(v)))
    })
}

#[test]
fn test_minimal_enhancer_intercepts_selected_method_only() {
    let machine = machine();
    let host = register_calculator(&machine);
    let aop = Aop::new(machine.clone(), DefinerPolicy::TryUnsafeOrChild);

    let builder = aop.enhancer_builder(host).unwrap();
    let add = builder.index_of("add").unwrap();
    let factory = builder.build(&BitSet::of(&[add])).unwrap();

    let enhanced = factory
        .construct(&[], vec![constant_handler(42)], &[])
        .unwrap();

    // Selected method routes through the handler.
    let got = machine
        .call_virtual(enhanced, "add", &[int(), int()], None, &[Value::Int(1), Value::Int(2)])
        .unwrap();
    assert_eq!(got, Value::Int(42));

    // Non-selected method reaches the original implementation unchanged.
    let sub = machine
        .call_virtual(enhanced, "sub", &[int(), int()], None, &[Value::Int(9), Value::Int(4)])
        .unwrap();
    assert_eq!(sub, Value::Int(5));
}

#[test]
fn test_interception_round_trip() {
    let machine = machine();
    let host = register_calculator(&machine);
    let aop = Aop::new(machine.clone(), DefinerPolicy::TryUnsafeOrChild);
    let builder = aop.enhancer_builder(host).unwrap();
    let add = builder.index_of("add").unwrap();
    let factory = builder.build(&BitSet::of(&[add])).unwrap();

    let seen = Arc::new(AtomicUsize::new(0));
    let seen_in_handler = seen.clone();
    let handler: weft_vm::HandlerRef = Arc::new(
        move |m: &Machine, recv: Value, method: Value, args: &[Value]| {
            seen_in_handler.fetch_add(1, Ordering::SeqCst);
            // The receiver is the enhanced instance, the method slot is
            // null, and the arguments arrive boxed in order.
            assert!(m.is_instance(recv, "demo.Calculator"));
            assert!(method.is_null());
            assert_eq!(args.len(), 2);
            assert_eq!(m.unbox_value(args[0]), Some(Value::Int(5)));
            assert_eq!(m.unbox_value(args[1]), Some(Value::Int(6)));
            Ok(m.box_value(Value::Int(-1)))
        },
    );
    let enhanced = factory.construct(&[], vec![handler], &[]).unwrap();
    let receiver_id = machine.object_id(enhanced);

    let got = machine
        .call_virtual(enhanced, "add", &[int(), int()], None, &[Value::Int(5), Value::Int(6)])
        .unwrap();
    assert_eq!(got, Value::Int(-1));
    assert_eq!(seen.load(Ordering::SeqCst), 1);
    assert!(receiver_id.is_some());
}

#[test]
fn test_handler_errors_propagate_unchanged() {
    let machine = machine();
    let host = register_calculator(&machine);
    let aop = Aop::new(machine.clone(), DefinerPolicy::TryUnsafeOrChild);
    let builder = aop.enhancer_builder(host).unwrap();
    let add = builder.index_of("add").unwrap();
    let factory = builder.build(&BitSet::of(&[add])).unwrap();

    let thrower: weft_vm::HandlerRef =
        Arc::new(|_: &Machine, _: Value, _: Value, _: &[Value]| {
            Err(VmError::Thrown {
                class_name: "demo.Boom".to_string(),
                message: "intercepted".to_string(),
            })
        });
    let enhanced = factory.construct(&[], vec![thrower], &[]).unwrap();
    let err = machine.call_virtual(
        enhanced,
        "add",
        &[int(), int()],
        None,
        &[Value::Int(1), Value::Int(1)],
    );
    match err {
        Err(VmError::Thrown {
            class_name,
            message,
        }) => {
            assert_eq!(class_name, "demo.Boom");
            assert_eq!(message, "intercepted");
        }
        other => panic!("expected thrown error, got {other:?}"),
    }
}

#[test]
fn test_super_call_isolation() {
    let machine = machine();
    let host = register_calculator(&machine);
    let aop = Aop::new(machine.clone(), DefinerPolicy::TryUnsafeOrChild);
    let builder = aop.enhancer_builder(host).unwrap();
    let add = builder.index_of("add").unwrap();
    let factory = builder.build(&BitSet::of(&[add])).unwrap();

    let enhanced = factory
        .construct(&[], vec![constant_handler(42)], &[])
        .unwrap();

    // The trampoline invoker bypasses interception and reaches the host's
    // original implementation with the supplied arguments.
    let super_add = factory.invoker("add;int;int").unwrap();
    let got = super_add(enhanced, &[boxed(&machine, 1), boxed(&machine, 2)]).unwrap();
    assert_eq!(machine.unbox_value(got), Some(Value::Int(3)));

    // While virtual calls stay intercepted.
    let virt = machine
        .call_virtual(enhanced, "add", &[int(), int()], None, &[Value::Int(1), Value::Int(2)])
        .unwrap();
    assert_eq!(virt, Value::Int(42));
}

#[test]
fn test_bridge_interception_covers_raw_signature() {
    let machine = machine();
    let host = register_string_comparator(&machine);
    let aop = Aop::new(machine.clone(), DefinerPolicy::TryUnsafeOrChild);
    let builder = aop.enhancer_builder(host).unwrap();

    // Select the specialised (String, String) method only.
    let idx = builder
        .enhanceable_methods()
        .iter()
        .position(|e| e.method.name == "compare" && e.method.params == vec![string(), string()])
        .unwrap();
    let factory = builder.build(&BitSet::of(&[idx])).unwrap();
    let enhanced = factory
        .construct(&[], vec![constant_handler(99)], &[])
        .unwrap();

    let a = machine.new_string("aaa");
    let b = machine.new_string("b");

    // Through the specialised signature.
    let direct = machine
        .call_virtual(enhanced, "compare", &[string(), string()], None, &[a, b])
        .unwrap();
    assert_eq!(direct, Value::Int(99));

    // Through the raw interface signature: the bridge override dispatches
    // virtually to the delegate, which is intercepted.
    let raw = machine
        .call_virtual(enhanced, "compare", &[obj(), obj()], None, &[a, b])
        .unwrap();
    assert_eq!(raw, Value::Int(99));
}

#[test]
fn test_covariant_bridge_dispatches_to_specialised_clone() {
    let machine = machine();
    let (_, host) = register_covariant_pair(&machine);
    let aop = Aop::new(machine.clone(), DefinerPolicy::TryUnsafeOrChild);
    let builder = aop.enhancer_builder(host).unwrap();

    let idx = builder
        .enhanceable_methods()
        .iter()
        .position(|e| e.method.name == "clone" && e.method.ret == TypeRef::object("demo.B"))
        .unwrap();
    let factory = builder.build(&BitSet::of(&[idx])).unwrap();

    let marker = machine.instantiate(host, &[], &[]).unwrap();
    let marker_for_handler = marker;
    let handler: weft_vm::HandlerRef = Arc::new(
        move |_: &Machine, _: Value, _: Value, _: &[Value]| Ok(marker_for_handler),
    );
    let enhanced = factory.construct(&[], vec![handler], &[]).unwrap();

    // Calling through the bridge's raw signature reaches the intercepted
    // specialised method.
    let via_bridge = machine
        .call_virtual(
            enhanced,
            "clone",
            &[],
            Some(&TypeRef::object("demo.A")),
            &[],
        )
        .unwrap();
    assert_eq!(via_bridge, marker);
}

#[test]
fn test_builds_are_cached_per_selection() {
    let machine = machine();
    let host = register_calculator(&machine);
    let aop = Aop::new(machine.clone(), DefinerPolicy::TryUnsafeOrChild);
    let builder = aop.enhancer_builder(host).unwrap();
    let add = builder.index_of("add").unwrap();
    let sub = builder.index_of("sub").unwrap();

    let first = builder.build(&BitSet::of(&[add])).unwrap();
    let again = builder.build(&BitSet::of(&[add])).unwrap();
    assert_eq!(first.proxy_class(), again.proxy_class());

    // Different selections deliberately produce different classes.
    let other = builder.build(&BitSet::of(&[add, sub])).unwrap();
    assert_ne!(first.proxy_class(), other.proxy_class());
}

#[test]
fn test_concurrent_identical_builds_define_one_class() {
    let machine = machine();
    let host = register_calculator(&machine);
    let aop = Arc::new(Aop::new(machine.clone(), DefinerPolicy::TryUnsafeOrChild));
    let builder = aop.enhancer_builder(host).unwrap();
    let add = builder.index_of("add").unwrap();
    let picked = BitSet::of(&[add]);

    let before = machine.class_count();
    let mut handles = Vec::new();
    for _ in 0..8 {
        let builder = builder.clone();
        let picked = picked.clone();
        handles.push(std::thread::spawn(move || {
            builder.build(&picked).unwrap().proxy_class()
        }));
    }
    let classes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(machine.class_count(), before + 1);
    assert!(classes.windows(2).all(|w| w[0] == w[1]));
}

#[test]
fn test_final_host_is_rejected() {
    let machine = machine();
    let loader = machine.boot_loader();
    let host = ClassBuilder::new("demo.Sealed")
        .modifiers(Modifiers::PUBLIC.with(Modifiers::FINAL))
        .ctor(&[], Modifiers::PUBLIC, nop())
        .register(&machine, loader)
        .unwrap();
    let aop = Aop::new(machine.clone(), DefinerPolicy::TryUnsafeOrChild);
    match aop.enhancer_builder(host) {
        Err(AopError::HostNotEnhanceable { reason, .. }) => {
            assert_eq!(reason, NotEnhanceableReason::Final);
        }
        other => panic!("expected HostNotEnhanceable, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn test_handler_array_slots_follow_signature_order() {
    let machine = machine();
    let host = register_calculator(&machine);
    let aop = Aop::new(machine.clone(), DefinerPolicy::TryUnsafeOrChild);
    let builder = aop.enhancer_builder(host).unwrap();
    let add = builder.index_of("add").unwrap();
    let sub = builder.index_of("sub").unwrap();
    let factory = builder.build(&BitSet::of(&[add, sub])).unwrap();

    let add_slot = factory.handler_slot("add;int;int").unwrap();
    let sub_slot = factory.handler_slot("sub;int;int").unwrap();
    assert_ne!(add_slot, sub_slot);

    let mut handlers: Vec<weft_vm::HandlerRef> = vec![constant_handler(0), constant_handler(0)];
    handlers[add_slot] = constant_handler(10);
    handlers[sub_slot] = constant_handler(20);
    let enhanced = factory.construct(&[], handlers, &[]).unwrap();

    let add_got = machine
        .call_virtual(enhanced, "add", &[int(), int()], None, &[Value::Int(0), Value::Int(0)])
        .unwrap();
    let sub_got = machine
        .call_virtual(enhanced, "sub", &[int(), int()], None, &[Value::Int(0), Value::Int(0)])
        .unwrap();
    assert_eq!(add_got, Value::Int(10));
    assert_eq!(sub_got, Value::Int(20));
}

#[test]
fn test_anonymous_hosting_casts_through_host_name() {
    let machine = machine();
    let host = register_calculator(&machine);
    let aop = Aop::new(machine.clone(), DefinerPolicy::TryUnsafeAnonymous);
    let builder = aop.enhancer_builder(host).unwrap();
    let add = builder.index_of("add").unwrap();
    let factory = builder.build(&BitSet::of(&[add])).unwrap();

    // Emitted checked casts never target the proxy's own name.
    let image = Image::decode(factory.image()).unwrap();
    let proxy_name = image.this_name().unwrap().to_string();
    for method in &image.methods {
        let body =
            weft_vm::image::CodeBody::decode(&method.code, method.max_stack, method.max_locals)
                .unwrap();
        for op in &body.ops {
            if let Op::CheckCast(idx) = op {
                let target = image.pool.class_name(*idx).unwrap();
                assert_ne!(target, proxy_name, "self-cast under anonymous hosting");
            }
        }
    }
    // The trampoline receiver cast goes through the host's name instead.
    let casts: Vec<&str> = image
        .methods
        .iter()
        .flat_map(|m| {
            weft_vm::image::CodeBody::decode(&m.code, m.max_stack, m.max_locals)
                .unwrap()
                .ops
                .into_iter()
                .filter_map(|op| match op {
                    Op::CheckCast(idx) => Some(idx),
                    _ => None,
                })
                .collect::<Vec<_>>()
        })
        .filter_map(|idx| image.pool.class_name(idx))
        .collect();
    assert!(casts.contains(&"demo.Calculator"));

    // The proxy is not resolvable by name from the host's loader.
    let host_loader = machine.class(host).loader;
    assert!(machine.find_class(host_loader, &proxy_name).is_none());

    // Enhanced instances still interact correctly with handlers.
    let enhanced = factory
        .construct(&[], vec![constant_handler(42)], &[])
        .unwrap();
    let got = machine
        .call_virtual(enhanced, "add", &[int(), int()], None, &[Value::Int(1), Value::Int(2)])
        .unwrap();
    assert_eq!(got, Value::Int(42));

    // And the trampoline table is the direct handle shape.
    let sup = factory.invoker("add;int;int").unwrap();
    let raw = sup(enhanced, &[boxed(&machine, 2), boxed(&machine, 3)]).unwrap();
    assert_eq!(machine.unbox_value(raw), Some(Value::Int(5)));
}

#[test]
fn test_package_private_enhancement_depends_on_definer() {
    let machine = machine();
    let host = register_calculator(&machine);

    // Hidden definer shares the host's runtime package.
    let aop = Aop::new(machine.clone(), DefinerPolicy::TryUnsafeOrChild);
    let builder = aop.enhancer_builder(host).unwrap();
    assert!(builder.index_of("scale").is_some());

    // A child loader does not.
    let machine2 = common::machine();
    let host2 = register_calculator(&machine2);
    let aop2 = Aop::new(machine2.clone(), DefinerPolicy::ChildLoader);
    let builder2 = aop2.enhancer_builder(host2).unwrap();
    assert!(builder2.index_of("scale").is_none());

    // Public interception still works across the loader boundary.
    let add = builder2.index_of("add").unwrap();
    let factory = builder2.build(&BitSet::of(&[add])).unwrap();
    let enhanced = factory
        .construct(&[], vec![constant_handler(7)], &[])
        .unwrap();
    let got = machine2
        .call_virtual(enhanced, "add", &[int(), int()], None, &[Value::Int(3), Value::Int(4)])
        .unwrap();
    assert_eq!(got, Value::Int(7));
}

#[test]
fn test_clinit_publishes_table_before_class_handle_returns() {
    let machine = machine();
    let host = register_calculator(&machine);
    let aop = Aop::new(machine.clone(), DefinerPolicy::TryUnsafeOrChild);
    let builder = aop.enhancer_builder(host).unwrap();
    let factory = builder.build(&BitSet::new()).unwrap();

    // Even an empty selection carries the constructor table.
    assert!(factory
        .signatures()
        .iter()
        .any(|s| s == &signature::ctor_signature(&[])));
    let invokers = machine.read_static(factory.proxy_class(), "WEFT$INVOKERS");
    assert!(matches!(invokers, Some(v) if !v.is_null()));
}
