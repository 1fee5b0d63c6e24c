//! Class-image assembly
//!
//! The glue generators build images through two small layers: a
//! deduplicating constant-pool builder, and a per-method assembler that
//! records instructions against abstract labels in one pass, then lays out
//! byte offsets and resolves branches in a second. Stack depth is tracked
//! per emission so the assembled method declares exact maxima for the
//! verifier.

use rustc_hash::FxHashMap;
use weft_vm::image::{self, HandleTag, Image, ImageField, ImageMethod, ImageWriter, Op, PoolEntry};
use weft_vm::{Modifiers, TypeRef};

/// Deduplicating constant-pool builder.
#[derive(Debug, Default)]
pub struct ConstPoolBuilder {
    entries: Vec<PoolEntry>,
    index: FxHashMap<PoolEntry, u16>,
}

impl ConstPoolBuilder {
    /// Empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    fn intern(&mut self, entry: PoolEntry) -> u16 {
        if let Some(idx) = self.index.get(&entry) {
            return *idx;
        }
        let idx = self.entries.len() as u16;
        self.entries.push(entry.clone());
        self.index.insert(entry, idx);
        idx
    }

    /// Intern a Utf8 entry.
    pub fn utf8(&mut self, text: &str) -> u16 {
        self.intern(PoolEntry::Utf8(text.to_string()))
    }

    /// Intern an integer constant.
    pub fn int(&mut self, value: i32) -> u16 {
        self.intern(PoolEntry::Int(value))
    }

    /// Intern a class reference.
    pub fn class(&mut self, name: &str) -> u16 {
        let name_idx = self.utf8(name);
        self.intern(PoolEntry::Class { name: name_idx })
    }

    /// Intern a field reference.
    pub fn field(&mut self, class: &str, name: &str, ty: &TypeRef) -> u16 {
        let class_idx = self.class(class);
        let name_idx = self.utf8(name);
        let ty_idx = self.utf8(&ty.to_string());
        self.intern(PoolEntry::FieldRef {
            class: class_idx,
            name: name_idx,
            ty: ty_idx,
        })
    }

    /// Intern a method reference.
    pub fn method(&mut self, class: &str, name: &str, params: &[TypeRef], ret: &TypeRef) -> u16 {
        let class_idx = self.class(class);
        let name_idx = self.utf8(name);
        let param_idxs: Vec<u16> = params.iter().map(|p| self.utf8(&p.to_string())).collect();
        let ret_idx = self.utf8(&ret.to_string());
        self.intern(PoolEntry::MethodRef {
            class: class_idx,
            name: name_idx,
            params: param_idxs,
            ret: ret_idx,
        })
    }

    /// Intern a static-method handle.
    pub fn handle_static(&mut self, class: &str, name: &str, params: &[TypeRef]) -> u16 {
        let class_idx = self.class(class);
        let name_idx = self.utf8(name);
        let param_idxs: Vec<u16> = params.iter().map(|p| self.utf8(&p.to_string())).collect();
        self.intern(PoolEntry::Handle {
            tag: HandleTag::Static,
            class: class_idx,
            name: name_idx,
            params: param_idxs,
        })
    }

    /// Intern a constructor handle.
    pub fn handle_ctor(&mut self, class: &str, params: &[TypeRef]) -> u16 {
        let class_idx = self.class(class);
        let name_idx = self.utf8("<init>");
        let param_idxs: Vec<u16> = params.iter().map(|p| self.utf8(&p.to_string())).collect();
        self.intern(PoolEntry::Handle {
            tag: HandleTag::Ctor,
            class: class_idx,
            name: name_idx,
            params: param_idxs,
        })
    }
}

/// Branch target placeholder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AsmLabel(usize);

enum AsmItem {
    Op(Op),
    Switch {
        low: i32,
        default: AsmLabel,
        targets: Vec<AsmLabel>,
    },
    Mark(AsmLabel),
}

/// Single-method assembler.
pub struct MethodAsm {
    name: String,
    params: Vec<TypeRef>,
    ret: TypeRef,
    flags: Modifiers,
    items: Vec<AsmItem>,
    next_label: usize,
    stack: i32,
    max_stack: i32,
    max_locals: u16,
}

impl MethodAsm {
    /// Start a method. Locals are pre-sized for the receiver (instance
    /// methods) and declared parameters.
    pub fn new(name: &str, params: &[TypeRef], ret: TypeRef, flags: Modifiers) -> MethodAsm {
        let receiver = if flags.is_static() { 0 } else { 1 };
        MethodAsm {
            name: name.to_string(),
            params: params.to_vec(),
            ret,
            flags,
            items: Vec::new(),
            next_label: 0,
            stack: 0,
            max_stack: 0,
            max_locals: (receiver + params.len()) as u16,
        }
    }

    /// Allocate a fresh label.
    pub fn new_label(&mut self) -> AsmLabel {
        let label = AsmLabel(self.next_label);
        self.next_label += 1;
        label
    }

    /// Mark a label at the current position.
    pub fn mark(&mut self, label: AsmLabel) {
        self.items.push(AsmItem::Mark(label));
    }

    fn track(&mut self, pops: i32, pushes: i32) {
        self.stack -= pops;
        self.stack += pushes;
        if self.stack > self.max_stack {
            self.max_stack = self.stack;
        }
    }

    fn op(&mut self, op: Op, pops: i32, pushes: i32) {
        self.track(pops, pushes);
        self.items.push(AsmItem::Op(op));
    }

    /// Push an int constant in the shortest instruction form.
    pub fn push_int(&mut self, pool: &mut ConstPoolBuilder, value: i32) {
        let op = if (-1..=5).contains(&value) {
            Op::Iconst(value as i8)
        } else if i8::try_from(value).is_ok() {
            Op::Bipush(value as i8)
        } else if i16::try_from(value).is_ok() {
            Op::Sipush(value as i16)
        } else {
            Op::Ldc(pool.int(value))
        };
        self.op(op, 0, 1);
    }

    /// Push null.
    pub fn const_null(&mut self) {
        self.op(Op::ConstNull, 0, 1);
    }

    /// Load a local.
    pub fn load(&mut self, slot: u16) {
        if slot + 1 > self.max_locals {
            self.max_locals = slot + 1;
        }
        self.op(Op::Load(slot), 0, 1);
    }

    /// Store a local.
    pub fn store(&mut self, slot: u16) {
        if slot + 1 > self.max_locals {
            self.max_locals = slot + 1;
        }
        self.op(Op::Store(slot), 1, 0);
    }

    /// Duplicate top of stack.
    pub fn dup(&mut self) {
        self.op(Op::Dup, 1, 2);
    }

    /// Discard top of stack.
    pub fn pop(&mut self) {
        self.op(Op::Pop, 1, 0);
    }

    /// Allocate an instance.
    pub fn new_instance(&mut self, class_idx: u16) {
        self.op(Op::New(class_idx), 0, 1);
    }

    /// Checked cast.
    pub fn checkcast(&mut self, class_idx: u16) {
        self.op(Op::CheckCast(class_idx), 1, 1);
    }

    /// Read an instance field.
    pub fn get_field(&mut self, field_idx: u16) {
        self.op(Op::GetField(field_idx), 1, 1);
    }

    /// Write an instance field.
    pub fn put_field(&mut self, field_idx: u16) {
        self.op(Op::PutField(field_idx), 2, 0);
    }

    /// Read a static field.
    pub fn get_static(&mut self, field_idx: u16) {
        self.op(Op::GetStatic(field_idx), 0, 1);
    }

    /// Write a static field.
    pub fn put_static(&mut self, field_idx: u16) {
        self.op(Op::PutStatic(field_idx), 1, 0);
    }

    /// Allocate a reference array (length on stack).
    pub fn anew_array(&mut self, class_idx: u16) {
        self.op(Op::AnewArray(class_idx), 1, 1);
    }

    /// Read an array element.
    pub fn aaload(&mut self) {
        self.op(Op::Aaload, 2, 1);
    }

    /// Write an array element.
    pub fn aastore(&mut self) {
        self.op(Op::Aastore, 3, 0);
    }

    /// Push a method handle.
    pub fn ldc_handle(&mut self, handle_idx: u16) {
        self.op(Op::LdcHandle(handle_idx), 0, 1);
    }

    /// Virtual dispatch. `argc` counts declared parameters.
    pub fn invoke_virtual(&mut self, method_idx: u16, argc: usize, returns: bool) {
        self.op(
            Op::InvokeVirtual(method_idx),
            1 + argc as i32,
            returns as i32,
        );
    }

    /// Interface dispatch.
    pub fn invoke_interface(&mut self, method_idx: u16, argc: usize, returns: bool) {
        self.op(
            Op::InvokeInterface(method_idx),
            1 + argc as i32,
            returns as i32,
        );
    }

    /// Exact dispatch (constructors, super-calls).
    pub fn invoke_special(&mut self, method_idx: u16, argc: usize, returns: bool) {
        self.op(
            Op::InvokeSpecial(method_idx),
            1 + argc as i32,
            returns as i32,
        );
    }

    /// Static dispatch.
    pub fn invoke_static(&mut self, method_idx: u16, argc: usize, returns: bool) {
        self.op(Op::InvokeStatic(method_idx), argc as i32, returns as i32);
    }

    /// Dense integer dispatch over labels.
    pub fn table_switch(&mut self, low: i32, default: AsmLabel, targets: Vec<AsmLabel>) {
        self.track(1, 0);
        self.items.push(AsmItem::Switch {
            low,
            default,
            targets,
        });
    }

    /// Return top of stack.
    pub fn ret(&mut self) {
        self.op(Op::Ret, 1, 0);
    }

    /// Return void.
    pub fn ret_void(&mut self) {
        self.op(Op::RetVoid, 0, 0);
    }

    /// Reset tracked depth at a join point (each switch case starts clean).
    pub fn reset_stack(&mut self) {
        self.stack = 0;
    }

    fn encoded_size(op: &Op) -> u32 {
        match op {
            Op::Nop
            | Op::Pop
            | Op::Dup
            | Op::ConstNull
            | Op::Iconst(_)
            | Op::Aaload
            | Op::Aastore
            | Op::ArrayLength
            | Op::Ret
            | Op::RetVoid => 1,
            Op::Bipush(_) => 2,
            Op::TableSwitch { targets, .. } => 1 + 4 + 4 + 4 + 4 * targets.len() as u32,
            _ => 3,
        }
    }

    /// Lay out labels, resolve branches, and produce the image method.
    pub fn assemble(self, pool: &mut ConstPoolBuilder) -> ImageMethod {
        // First pass: byte offsets for every item and label.
        let mut offsets: FxHashMap<usize, u32> = FxHashMap::default();
        let mut at = 0u32;
        for item in &self.items {
            match item {
                AsmItem::Mark(label) => {
                    offsets.insert(label.0, at);
                }
                AsmItem::Op(op) => at += Self::encoded_size(op),
                AsmItem::Switch { targets, .. } => {
                    at += 1 + 4 + 4 + 4 + 4 * targets.len() as u32;
                }
            }
        }

        // Second pass: encode with resolved targets.
        let mut w = ImageWriter::new();
        for item in &self.items {
            match item {
                AsmItem::Mark(_) => {}
                AsmItem::Op(op) => op.encode(&mut w),
                AsmItem::Switch {
                    low,
                    default,
                    targets,
                } => {
                    let resolve = |l: &AsmLabel| offsets.get(&l.0).copied().unwrap_or(0);
                    Op::TableSwitch {
                        low: *low,
                        default: resolve(default),
                        targets: targets.iter().map(resolve).collect(),
                    }
                    .encode(&mut w);
                }
            }
        }

        let name = pool.utf8(&self.name);
        let params = self
            .params
            .iter()
            .map(|p| pool.utf8(&p.to_string()))
            .collect();
        let ret = pool.utf8(&self.ret.to_string());
        ImageMethod {
            flags: self.flags.0,
            name,
            params,
            ret,
            max_stack: self.max_stack.max(0) as u16,
            max_locals: self.max_locals,
            code: w.buffer,
        }
    }
}

/// Whole-class assembler.
pub struct ClassAsm {
    /// Shared constant pool
    pub pool: ConstPoolBuilder,
    name: String,
    super_name: String,
    flags: Modifiers,
    interfaces: Vec<String>,
    fields: Vec<(Modifiers, String, TypeRef)>,
    methods: Vec<ImageMethod>,
}

impl ClassAsm {
    /// Start a class extending `super_name`.
    pub fn new(name: &str, super_name: &str, flags: Modifiers) -> ClassAsm {
        ClassAsm {
            pool: ConstPoolBuilder::new(),
            name: name.to_string(),
            super_name: super_name.to_string(),
            flags,
            interfaces: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
        }
    }

    /// Declare an implemented interface.
    pub fn implement(&mut self, name: &str) {
        self.interfaces.push(name.to_string());
    }

    /// Declare a field.
    pub fn field(&mut self, name: &str, ty: TypeRef, flags: Modifiers) {
        self.fields.push((flags, name.to_string(), ty));
    }

    /// Assemble and attach a finished method.
    pub fn method(&mut self, asm: MethodAsm) {
        let assembled = asm.assemble(&mut self.pool);
        self.methods.push(assembled);
    }

    /// Serialise the class image.
    pub fn finish(mut self) -> Vec<u8> {
        let this_class = self.pool.class(&self.name);
        let super_class = self.pool.class(&self.super_name);
        let interface_names = std::mem::take(&mut self.interfaces);
        let interfaces = interface_names
            .iter()
            .map(|i| self.pool.class(i))
            .collect();
        let field_defs = std::mem::take(&mut self.fields);
        let fields = field_defs
            .iter()
            .map(|(flags, name, ty)| ImageField {
                flags: flags.0,
                name: self.pool.utf8(name),
                ty: self.pool.utf8(&ty.to_string()),
            })
            .collect();
        Image {
            minor: image::MINOR_VERSION,
            major: image::MAJOR_VERSION,
            pool: weft_vm::image::ConstantPool {
                entries: self.pool.entries,
            },
            flags: self.flags.0,
            this_class,
            super_class,
            interfaces,
            fields,
            methods: self.methods,
        }
        .encode()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_vm::image::verify_image;

    #[test]
    fn test_pool_dedup() {
        let mut pool = ConstPoolBuilder::new();
        let a = pool.class("java.lang.Object");
        let b = pool.class("java.lang.Object");
        assert_eq!(a, b);
        let m1 = pool.method("demo.A", "m", &[TypeRef::int()], &TypeRef::Void);
        let m2 = pool.method("demo.A", "m", &[TypeRef::int()], &TypeRef::Void);
        assert_eq!(m1, m2);
    }

    #[test]
    fn test_push_int_shortest_form() {
        let mut pool = ConstPoolBuilder::new();
        let mut m = MethodAsm::new("m", &[], TypeRef::Void, Modifiers::PUBLIC);
        m.push_int(&mut pool, 3); // iconst
        m.pop();
        m.push_int(&mut pool, -100); // bipush
        m.pop();
        m.push_int(&mut pool, 2000); // sipush
        m.pop();
        m.push_int(&mut pool, 1 << 20); // ldc
        m.pop();
        m.ret_void();
        let assembled = m.assemble(&mut pool);
        // iconst(1) pop(1) bipush(2) pop(1) sipush(3) pop(1) ldc(3) pop(1) ret(1)
        assert_eq!(assembled.code.len(), 14);
        assert_eq!(assembled.max_stack, 1);
    }

    #[test]
    fn test_switch_labels_resolve_and_verify() {
        let mut cls = ClassAsm::new("demo.Glue", "java.lang.Object", Modifiers::PUBLIC);
        let object = TypeRef::object("java.lang.Object");

        let mut m = MethodAsm::new(
            "pick",
            &[TypeRef::int()],
            object.clone(),
            Modifiers::PUBLIC.with(Modifiers::STATIC),
        );
        let default = m.new_label();
        let case0 = m.new_label();
        let case1 = m.new_label();
        m.load(0);
        m.table_switch(0, default, vec![case0, case1]);
        m.reset_stack();
        m.mark(case0);
        m.const_null();
        m.ret();
        m.reset_stack();
        m.mark(case1);
        m.const_null();
        m.ret();
        m.reset_stack();
        m.mark(default);
        m.const_null();
        m.ret();
        cls.method(m);

        let bytes = cls.finish();
        let image = Image::decode(&bytes).unwrap();
        verify_image(&image).unwrap();
    }

    #[test]
    fn test_max_locals_tracks_slots() {
        let mut pool = ConstPoolBuilder::new();
        let mut m = MethodAsm::new("m", &[TypeRef::int()], TypeRef::Void, Modifiers::PUBLIC);
        assert_eq!(m.max_locals, 2); // this + 1 param
        m.push_int(&mut pool, 1);
        m.store(5);
        m.ret_void();
        let assembled = m.assemble(&mut pool);
        assert_eq!(assembled.max_locals, 6);
    }
}
