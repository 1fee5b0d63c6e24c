//! Fast-class glue generation
//!
//! Emits, for one host, a final invoker class that replaces reflective
//! construction and dispatch: a static trampoline table-switching over the
//! host's indexed members with direct calls, an instance `apply` bound to
//! one index, and a class initialiser publishing the constructor-bound
//! `int -> BiFunction` invoker table.

use crate::emit::{ClassAsm, MethodAsm};
use crate::glue::{box_result, convert_in, unpack_arg};
use crate::resolve::{self, CtorInfo, MethodInfo};
use crate::signature;
use weft_vm::builtins;
use weft_vm::{ClassDef, ClassId, Machine, Modifiers, TypeRef};

/// One indexed member of a fast-class.
#[derive(Debug, Clone)]
pub enum MemberEntry {
    /// A host constructor
    Ctor(CtorInfo),
    /// A declared host method (instance or static)
    Method(MethodInfo),
}

impl MemberEntry {
    /// Canonical signature of this member.
    pub fn signature(&self) -> String {
        match self {
            MemberEntry::Ctor(c) => signature::ctor_signature(&c.params),
            MemberEntry::Method(m) => signature::signature(&m.name, &m.params),
        }
    }
}

/// Collect the host's declared members admitted under the visibility
/// regime: constructors first, then methods, both in declaration order.
/// Synthetic members are not directly invokable through a fast-class.
pub(crate) fn collect_members(
    machine: &Machine,
    host: ClassId,
    has_package_access: bool,
) -> Vec<MemberEntry> {
    let def = machine.class(host);
    let host_package = (def.package().to_string(), def.loader);
    let mut members = Vec::new();
    for ctor in resolve::visible_ctors(machine, host, has_package_access) {
        members.push(MemberEntry::Ctor(ctor));
    }
    for (i, m) in def.methods.iter().enumerate() {
        if m.modifiers.is_synthetic() || m.modifiers.is_abstract() {
            continue;
        }
        if !resolve::visible(m.modifiers, has_package_access, &host_package, &def) {
            continue;
        }
        members.push(MemberEntry::Method(MethodInfo {
            id: weft_vm::MethodId {
                class: host,
                index: i as u16,
            },
            name: m.name.clone(),
            params: m.params.clone(),
            ret: m.ret.clone(),
            modifiers: m.modifiers,
            declaring: def.name.clone(),
        }));
    }
    members
}

/// Emit the fast-class image for `members`, whose positions are the
/// trampoline indices.
pub(crate) fn generate(host: &ClassDef, proxy_name: &str, members: &[MemberEntry]) -> Vec<u8> {
    let object = TypeRef::top();
    let object_array = TypeRef::array(TypeRef::top());
    let int = TypeRef::int();
    let host_is_interface = host.modifiers.is_interface();

    let mut cls = ClassAsm::new(
        proxy_name,
        builtins::OBJECT,
        Modifiers::PUBLIC.with(Modifiers::FINAL),
    );
    cls.implement(builtins::BIFUNCTION);
    cls.field(
        "WEFT$IDX",
        int.clone(),
        Modifiers::PRIVATE.with(Modifiers::FINAL),
    );
    cls.field(
        "WEFT$INVOKERS",
        object.clone(),
        Modifiers::PUBLIC.with(Modifiers::STATIC).with(Modifiers::FINAL),
    );

    let idx_field = cls.pool.field(proxy_name, "WEFT$IDX", &int);
    let invokers_field = cls.pool.field(proxy_name, "WEFT$INVOKERS", &object);
    let object_ctor = cls.pool.method(builtins::OBJECT, "<init>", &[], &TypeRef::Void);
    let trampoline_ref = cls.pool.method(
        proxy_name,
        "WEFT$TRAMPOLINE",
        &[int.clone(), object.clone(), object_array.clone()],
        &object,
    );

    // Constructor binding one dispatch index.
    let mut init = MethodAsm::new("<init>", &[int.clone()], TypeRef::Void, Modifiers::PUBLIC);
    init.load(0);
    init.invoke_special(object_ctor, 0, false);
    init.load(0);
    init.load(1);
    init.put_field(idx_field);
    init.ret_void();
    cls.method(init);

    // apply(context, args) forwards to the trampoline with the bound index.
    let mut apply = MethodAsm::new(
        "apply",
        &[object.clone(), object_array.clone()],
        object.clone(),
        Modifiers::PUBLIC,
    );
    apply.load(0);
    apply.get_field(idx_field);
    apply.load(1);
    apply.load(2);
    apply.invoke_static(trampoline_ref, 3, true);
    apply.ret();
    cls.method(apply);

    // Static trampoline: dense switch over member indices.
    let mut tr = MethodAsm::new(
        "WEFT$TRAMPOLINE",
        &[int.clone(), object.clone(), object_array.clone()],
        object.clone(),
        Modifiers::PUBLIC.with(Modifiers::STATIC),
    );
    let default = tr.new_label();
    let cases: Vec<_> = members.iter().map(|_| tr.new_label()).collect();
    tr.load(0);
    tr.table_switch(0, default, cases.clone());
    for (member, case) in members.iter().zip(&cases) {
        tr.reset_stack();
        tr.mark(*case);
        match member {
            MemberEntry::Ctor(ctor) => {
                let host_class = cls.pool.class(&host.name);
                tr.new_instance(host_class);
                tr.dup();
                for (j, ty) in ctor.params.iter().enumerate() {
                    unpack_arg(&mut tr, &mut cls.pool, 2, j, ty);
                }
                let ctor_ref =
                    cls.pool
                        .method(&host.name, "<init>", &ctor.params, &TypeRef::Void);
                tr.invoke_special(ctor_ref, ctor.params.len(), false);
                tr.ret();
            }
            MemberEntry::Method(m) => {
                let is_static = m.modifiers.is_static();
                if !is_static {
                    tr.load(1);
                    convert_in(&mut tr, &mut cls.pool, &TypeRef::object(&host.name));
                }
                for (j, ty) in m.params.iter().enumerate() {
                    unpack_arg(&mut tr, &mut cls.pool, 2, j, ty);
                }
                let method_ref = cls.pool.method(&host.name, &m.name, &m.params, &m.ret);
                let returns = m.ret != TypeRef::Void;
                if is_static {
                    tr.invoke_static(method_ref, m.params.len(), returns);
                } else if host_is_interface {
                    tr.invoke_interface(method_ref, m.params.len(), returns);
                } else {
                    tr.invoke_virtual(method_ref, m.params.len(), returns);
                }
                box_result(&mut tr, &mut cls.pool, &m.ret);
                tr.ret();
            }
        }
    }
    tr.reset_stack();
    tr.mark(default);
    tr.const_null();
    tr.ret();
    cls.method(tr);

    // <clinit>: publish the constructor-bound invoker table.
    let mut clinit = MethodAsm::new("<clinit>", &[], TypeRef::Void, Modifiers::STATIC);
    let ctor_handle = cls.pool.handle_ctor(proxy_name, &[int.clone()]);
    clinit.ldc_handle(ctor_handle);
    let table_ref = cls.pool.method(
        builtins::LAMBDA_FACTORY,
        "table",
        &[TypeRef::object(builtins::METHOD_HANDLE)],
        &TypeRef::object(builtins::INT_FUNCTION),
    );
    clinit.invoke_static(table_ref, 1, true);
    clinit.put_static(invokers_field);
    clinit.ret_void();
    cls.method(clinit);

    cls.finish()
}
