//! Enhancer glue generation
//!
//! Emits a subclass of the host in which the selected virtual methods are
//! overridden with stubs routing through per-instance handlers. Every
//! constructor gains a leading `Handler[]` parameter stored before the
//! super-constructor runs; bridges with known delegates receive virtual
//! dispatch overrides so interception cannot be bypassed through the raw
//! signature; a static trampoline provides genuine super-calls and
//! construction of the enhanced class, published through the class
//! initialiser as the invoker table.
//!
//! Under anonymous hosting the proxy is not name-addressable: every cast
//! that would target the proxy's own name targets the host's name instead.

use crate::emit::{ClassAsm, MethodAsm};
use crate::glue::{box_result, convert_in, emit_value_of, unpack_arg};
use crate::resolve::{BridgePlan, CtorInfo, MethodInfo};
use weft_vm::builtins;
use weft_vm::{ClassDef, Modifiers, TypeRef};

/// One trampoline slot, in table order.
#[derive(Debug, Clone)]
pub(crate) enum TableEntry {
    /// Super-call into the host's original implementation
    Super(MethodInfo),
    /// Construction of the enhanced class through one host constructor
    Construct(Vec<TypeRef>),
}

/// Everything the generator needs for one build.
pub(crate) struct EnhancerPlan<'a> {
    /// Host class definition
    pub host: &'a ClassDef,
    /// Name of the emitted subclass
    pub proxy_name: String,
    /// Visible host constructors
    pub ctors: &'a [CtorInfo],
    /// Selected methods with their handler-array slots
    pub selected: Vec<(MethodInfo, usize)>,
    /// Bridge dispatch plans for the whole enhanceable set
    pub bridges: Vec<BridgePlan>,
    /// Trampoline table, sorted by signature
    pub table: Vec<TableEntry>,
    /// Anonymous-hosting cast discipline
    pub anonymous: bool,
}

const HANDLERS_FIELD: &str = "WEFT$HANDLERS";
const INVOKERS_FIELD: &str = "WEFT$INVOKERS";
const TRAMPOLINE: &str = "WEFT$TRAMPOLINE";

fn visibility_of(m: Modifiers) -> Modifiers {
    if m.is_public() {
        Modifiers::PUBLIC
    } else if m.is_protected() {
        Modifiers::PROTECTED
    } else {
        Modifiers::default()
    }
}

/// Emit the enhancer image.
pub(crate) fn generate(plan: &EnhancerPlan<'_>) -> Vec<u8> {
    let object = TypeRef::top();
    let object_array = TypeRef::array(TypeRef::top());
    let int = TypeRef::int();
    let handler_ty = TypeRef::object(builtins::HANDLER);
    let handler_array = TypeRef::array(handler_ty.clone());
    let host_name = &plan.host.name;
    let proxy_name = &plan.proxy_name;

    let mut cls = ClassAsm::new(proxy_name, host_name, Modifiers::PUBLIC);
    cls.field(
        HANDLERS_FIELD,
        handler_array.clone(),
        Modifiers::PRIVATE.with(Modifiers::FINAL),
    );
    cls.field(
        INVOKERS_FIELD,
        object.clone(),
        Modifiers::PUBLIC.with(Modifiers::STATIC).with(Modifiers::FINAL),
    );

    let handlers_field = cls.pool.field(proxy_name, HANDLERS_FIELD, &handler_array);
    let invokers_field = cls.pool.field(proxy_name, INVOKERS_FIELD, &object);
    let handler_invoke = cls.pool.method(
        builtins::HANDLER,
        "invoke",
        &[object.clone(), object.clone(), object_array.clone()],
        &object,
    );

    // Enhanced constructors: store the handler array before the
    // super-constructor call, then forward the remaining arguments.
    for ctor in plan.ctors {
        let mut params = vec![handler_array.clone()];
        params.extend(ctor.params.iter().cloned());
        let mut init = MethodAsm::new("<init>", &params, TypeRef::Void, Modifiers::PUBLIC);
        init.load(0);
        init.load(1);
        init.put_field(handlers_field);
        init.load(0);
        for j in 0..ctor.params.len() {
            init.load(2 + j as u16);
        }
        let super_ctor = cls
            .pool
            .method(host_name, "<init>", &ctor.params, &TypeRef::Void);
        init.invoke_special(super_ctor, ctor.params.len(), false);
        init.ret_void();
        cls.method(init);
    }

    // Interception stubs for the selected methods.
    for (info, handler_slot) in &plan.selected {
        let flags = visibility_of(info.modifiers).with(Modifiers::FINAL);
        let mut stub = MethodAsm::new(&info.name, &info.params, info.ret.clone(), flags);
        stub.load(0);
        stub.get_field(handlers_field);
        stub.push_int(&mut cls.pool, *handler_slot as i32);
        stub.aaload();
        stub.load(0);
        stub.const_null();
        stub.push_int(&mut cls.pool, info.params.len() as i32);
        let object_class = cls.pool.class(builtins::OBJECT);
        stub.anew_array(object_class);
        for (j, ty) in info.params.iter().enumerate() {
            stub.dup();
            stub.push_int(&mut cls.pool, j as i32);
            stub.load(1 + j as u16);
            if let TypeRef::Prim(p) = ty {
                emit_value_of(&mut stub, &mut cls.pool, *p);
            }
            stub.aastore();
        }
        stub.invoke_interface(handler_invoke, 3, true);
        match &info.ret {
            TypeRef::Void => {
                stub.pop();
                stub.ret_void();
            }
            ret => {
                convert_in(&mut stub, &mut cls.pool, ret);
                stub.ret();
            }
        }
        cls.method(stub);
    }

    // Virtual-dispatch overrides for bridges, so interceptors installed on
    // a delegate cannot be bypassed through the raw signature. A bridge
    // whose own signature was selected already has an interception stub.
    for bridge_plan in &plan.bridges {
        let bridge = &bridge_plan.bridge;
        let delegate = &bridge_plan.delegate;
        let covered = plan.selected.iter().any(|(m, _)| {
            m.name == bridge.name && m.params == bridge.params && m.ret == bridge.ret
        });
        if covered {
            continue;
        }
        let flags = visibility_of(bridge.modifiers)
            .with(Modifiers::FINAL)
            .with(Modifiers::BRIDGE)
            .with(Modifiers::SYNTHETIC);
        let mut stub = MethodAsm::new(&bridge.name, &bridge.params, bridge.ret.clone(), flags);
        stub.load(0);
        for (j, target) in delegate.params.iter().enumerate() {
            stub.load(1 + j as u16);
            if bridge.params.get(j) != Some(target) && !target.is_prim() {
                let cast = cls.pool.class(&target.to_string());
                stub.checkcast(cast);
            }
        }
        let delegate_ref =
            cls.pool
                .method(&delegate.declaring, &delegate.name, &delegate.params, &delegate.ret);
        let returns = delegate.ret != TypeRef::Void;
        stub.invoke_virtual(delegate_ref, delegate.params.len(), returns);
        match &bridge.ret {
            TypeRef::Void => stub.ret_void(),
            ret => {
                if ret != &delegate.ret && !ret.is_prim() && ret.object_name() != Some(builtins::OBJECT)
                {
                    let cast = cls.pool.class(&ret.to_string());
                    stub.checkcast(cast);
                }
                stub.ret();
            }
        }
        cls.method(stub);
    }

    // Static trampoline: super-calls for methods, construction of the
    // enhanced class for constructors.
    let receiver_cast = if plan.anonymous { host_name } else { proxy_name };
    let mut tr = MethodAsm::new(
        TRAMPOLINE,
        &[int.clone(), object.clone(), object_array.clone()],
        object.clone(),
        Modifiers::PUBLIC.with(Modifiers::STATIC),
    );
    let default = tr.new_label();
    let cases: Vec<_> = plan.table.iter().map(|_| tr.new_label()).collect();
    tr.load(0);
    tr.table_switch(0, default, cases.clone());
    for (entry, case) in plan.table.iter().zip(&cases) {
        tr.reset_stack();
        tr.mark(*case);
        match entry {
            TableEntry::Super(m) => {
                tr.load(1);
                let cast = cls.pool.class(receiver_cast);
                tr.checkcast(cast);
                for (j, ty) in m.params.iter().enumerate() {
                    unpack_arg(&mut tr, &mut cls.pool, 2, j, ty);
                }
                let super_ref = cls.pool.method(host_name, &m.name, &m.params, &m.ret);
                let returns = m.ret != TypeRef::Void;
                tr.invoke_special(super_ref, m.params.len(), returns);
                box_result(&mut tr, &mut cls.pool, &m.ret);
                tr.ret();
            }
            TableEntry::Construct(ctor_params) => {
                let self_class = cls.pool.class(proxy_name);
                tr.new_instance(self_class);
                tr.dup();
                tr.load(2);
                tr.push_int(&mut cls.pool, 0);
                tr.aaload();
                let handler_array_class = cls.pool.class(&handler_array.to_string());
                tr.checkcast(handler_array_class);
                for (j, ty) in ctor_params.iter().enumerate() {
                    unpack_arg(&mut tr, &mut cls.pool, 2, j + 1, ty);
                }
                let mut enhanced_params = vec![handler_array.clone()];
                enhanced_params.extend(ctor_params.iter().cloned());
                let init_ref =
                    cls.pool
                        .method(proxy_name, "<init>", &enhanced_params, &TypeRef::Void);
                tr.invoke_special(init_ref, enhanced_params.len(), false);
                tr.ret();
            }
        }
    }
    tr.reset_stack();
    tr.mark(default);
    tr.const_null();
    tr.ret();
    cls.method(tr);

    // <clinit>: publish the invoker table. Anonymous hosting stores the
    // trampoline handle directly; named hosting wraps it through the
    // lambda factory into an int -> BiFunction table.
    let mut clinit = MethodAsm::new("<clinit>", &[], TypeRef::Void, Modifiers::STATIC);
    let trampoline_handle = cls.pool.handle_static(
        proxy_name,
        TRAMPOLINE,
        &[int.clone(), object.clone(), object_array.clone()],
    );
    clinit.ldc_handle(trampoline_handle);
    if !plan.anonymous {
        let table_ref = cls.pool.method(
            builtins::LAMBDA_FACTORY,
            "table",
            &[TypeRef::object(builtins::METHOD_HANDLE)],
            &TypeRef::object(builtins::INT_FUNCTION),
        );
        clinit.invoke_static(table_ref, 1, true);
    }
    clinit.put_static(invokers_field);
    clinit.ret_void();
    cls.method(clinit);

    cls.finish()
}
