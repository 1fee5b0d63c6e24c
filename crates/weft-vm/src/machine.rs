//! The machine: class registry, loaders, heap, and dispatch
//!
//! A [`Machine`] owns every piece of mutable runtime state: registered
//! classes (immutable once in), the loader chain with per-loader name maps,
//! the object heap, and static-field storage. Class definitions arriving as
//! byte images are decoded, verified, registered, and initialised before
//! the new class handle is returned, so a caller that reads the class's
//! statics observes fully initialised state.

use crate::builtins;
use crate::class::{
    ClassDef, ClassId, CtorDef, FieldDef, LoaderId, MethodBody, MethodDef, Modifiers, TypeBinding,
};
use crate::handler::HandlerRef;
use crate::image::{verify_image, CodeBody, ConstantPool, Image, ImageError, VerifyError};
use crate::interpreter;
use crate::object::{HandleKind, ObjId, Object, Payload, RawHandle};
use crate::value::{Prim, TypeRef, Value};
use crate::{VmError, VmResult};
use dashmap::DashMap;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// Class-definition errors, as surfaced by the definition entry points.
#[derive(Debug, thiserror::Error)]
pub enum DefineError {
    /// The byte image could not be decoded
    #[error("malformed class image: {0}")]
    Malformed(#[from] ImageError),

    /// The verifier rejected the image
    #[error("class image rejected by verifier: {0}")]
    VerifierRejected(#[from] VerifyError),

    /// The image is well-formed but cannot be installed here
    #[error("cannot define class: {0}")]
    CannotDefine(String),

    /// The named host cannot accept definitions (final, sealed, missing)
    #[error("host class cannot be extended: {0}")]
    HostUnmodifiable(String),

    /// The class initialiser failed during linking
    #[error("class initialiser failed: {0}")]
    Initializer(#[source] VmError),
}

#[derive(Debug, Default)]
struct LoaderData {
    parent: Option<LoaderId>,
    names: FxHashMap<String, ClassId>,
    exposes_define: bool,
}

/// The managed platform runtime.
pub struct Machine {
    classes: RwLock<Vec<Arc<ClassDef>>>,
    loaders: RwLock<Vec<LoaderData>>,
    heap: DashMap<u64, Object>,
    statics: DashMap<(ClassId, u16), Value>,
    child_loaders: DashMap<LoaderId, LoaderId>,
}

impl std::fmt::Debug for Machine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Machine")
            .field("classes", &self.classes.read().len())
            .field("objects", &self.heap.len())
            .finish()
    }
}

impl Machine {
    /// Create a machine with the built-in classes registered under the
    /// bootstrap loader.
    pub fn new() -> Arc<Machine> {
        let machine = Arc::new(Machine {
            classes: RwLock::new(Vec::new()),
            loaders: RwLock::new(vec![LoaderData::default()]),
            heap: DashMap::new(),
            statics: DashMap::new(),
            child_loaders: DashMap::new(),
        });
        builtins::bootstrap(&machine);
        machine
    }

    // ========================================================================
    // Loaders
    // ========================================================================

    /// The bootstrap loader.
    pub fn boot_loader(&self) -> LoaderId {
        LoaderId(0)
    }

    /// Create a loader with the given parent.
    pub fn new_loader(&self, parent: Option<LoaderId>) -> LoaderId {
        let mut loaders = self.loaders.write();
        let id = LoaderId(loaders.len());
        loaders.push(LoaderData {
            parent,
            names: FxHashMap::default(),
            exposes_define: false,
        });
        id
    }

    /// Mark whether a loader exposes its define hook to callers.
    pub fn set_loader_defines(&self, loader: LoaderId, exposes: bool) {
        if let Some(data) = self.loaders.write().get_mut(loader.0) {
            data.exposes_define = exposes;
        }
    }

    /// Whether a loader exposes its define hook.
    pub fn loader_exposes_define(&self, loader: LoaderId) -> bool {
        self.loaders
            .read()
            .get(loader.0)
            .map(|d| d.exposes_define)
            .unwrap_or(false)
    }

    /// Get or create the cached child loader of a host loader.
    pub fn child_loader_for(&self, host_loader: LoaderId) -> LoaderId {
        *self
            .child_loaders
            .entry(host_loader)
            .or_insert_with(|| self.new_loader(Some(host_loader)))
    }

    /// Resolve a binary name through the loader chain.
    pub fn find_class(&self, loader: LoaderId, name: &str) -> Option<ClassId> {
        let loaders = self.loaders.read();
        let mut current = Some(loader);
        while let Some(id) = current {
            let data = loaders.get(id.0)?;
            if let Some(class) = data.names.get(name) {
                return Some(*class);
            }
            current = data.parent;
        }
        None
    }

    // ========================================================================
    // Registry
    // ========================================================================

    /// The class definition for an id minted by this machine.
    pub fn class(&self, id: ClassId) -> Arc<ClassDef> {
        self.classes.read()[id.0].clone()
    }

    /// Number of registered classes.
    pub fn class_count(&self) -> usize {
        self.classes.read().len()
    }

    /// Register a host class assembled by a [`crate::class::ClassBuilder`].
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn register_class(
        &self,
        name: String,
        loader: LoaderId,
        modifiers: Modifiers,
        type_params: Vec<String>,
        superclass: Option<TypeBinding>,
        interfaces: Vec<TypeBinding>,
        fields: Vec<FieldDef>,
        static_fields: Vec<FieldDef>,
        ctors: Vec<CtorDef>,
        methods: Vec<MethodDef>,
    ) -> VmResult<ClassId> {
        let super_id = match &superclass {
            Some(binding) => Some(
                self.find_class(loader, &binding.name)
                    .ok_or_else(|| VmError::ClassNotFound(binding.name.clone()))?,
            ),
            None => None,
        };
        let mut interface_ids = Vec::with_capacity(interfaces.len());
        for binding in &interfaces {
            interface_ids.push(
                self.find_class(loader, &binding.name)
                    .ok_or_else(|| VmError::ClassNotFound(binding.name.clone()))?,
            );
        }
        let field_base = match super_id {
            Some(id) => {
                let sup = self.class(id);
                sup.field_base + sup.fields.len()
            }
            None => 0,
        };
        self.insert_class(ClassParts {
            name,
            loader,
            named: true,
            anonymous: false,
            modifiers,
            type_params,
            superclass,
            interfaces,
            fields,
            static_fields,
            ctors,
            methods,
            clinit: None,
            nest_host: None,
            super_id,
            interface_ids,
            field_base,
            pool: None,
        })
        .map_err(|e| VmError::RuntimeError(e.to_string()))
    }

    fn insert_class(&self, parts: ClassParts) -> Result<ClassId, DefineError> {
        let mut classes = self.classes.write();
        let mut loaders = self.loaders.write();
        let loader_data = loaders
            .get_mut(parts.loader.0)
            .ok_or_else(|| DefineError::CannotDefine("unknown loader".to_string()))?;
        if parts.named && loader_data.names.contains_key(&parts.name) {
            return Err(DefineError::CannotDefine(format!(
                "duplicate class name {} in loader",
                parts.name
            )));
        }
        let id = ClassId(classes.len());
        if parts.named {
            loader_data.names.insert(parts.name.clone(), id);
        }
        classes.push(Arc::new(ClassDef {
            id,
            name: parts.name,
            loader: parts.loader,
            named: parts.named,
            anonymous: parts.anonymous,
            modifiers: parts.modifiers,
            type_params: parts.type_params,
            superclass: parts.superclass,
            interfaces: parts.interfaces,
            fields: parts.fields,
            static_fields: parts.static_fields,
            ctors: parts.ctors,
            methods: parts.methods,
            clinit: parts.clinit,
            nest_host: parts.nest_host,
            super_id: parts.super_id,
            interface_ids: parts.interface_ids,
            field_base: parts.field_base,
            pool: parts.pool,
        }));
        Ok(id)
    }

    // ========================================================================
    // Class definition from byte images
    // ========================================================================

    /// Define a named class into the given loader.
    pub fn define_named(&self, loader: LoaderId, bytes: &[u8]) -> Result<ClassId, DefineError> {
        self.install_image(bytes, loader, true, false, None)
    }

    /// Define a named class into the cached child loader of the host's loader.
    pub fn define_child(&self, host: ClassId, bytes: &[u8]) -> Result<ClassId, DefineError> {
        let host_loader = self.class(host).loader;
        let child = self.child_loader_for(host_loader);
        self.install_image(bytes, child, true, false, None)
    }

    /// Define an unnamed nest-mate class into the host's own loader.
    pub fn define_hidden(&self, host: ClassId, bytes: &[u8]) -> Result<ClassId, DefineError> {
        let loader = self.class(host).loader;
        self.install_image(bytes, loader, false, false, Some(host))
    }

    /// Define a legacy anonymous class: unnamed, self-casts unresolvable.
    pub fn define_anonymous(&self, host: ClassId, bytes: &[u8]) -> Result<ClassId, DefineError> {
        let loader = self.class(host).loader;
        self.install_image(bytes, loader, false, true, Some(host))
    }

    fn install_image(
        &self,
        bytes: &[u8],
        loader: LoaderId,
        named: bool,
        anonymous: bool,
        nest_host: Option<ClassId>,
    ) -> Result<ClassId, DefineError> {
        let image = Image::decode(bytes)?;
        verify_image(&image)?;

        let name = image
            .this_name()
            .ok_or_else(|| DefineError::CannotDefine("image has no class name".to_string()))?
            .to_string();
        let super_name = image
            .super_name()
            .ok_or_else(|| DefineError::CannotDefine("image has no super-class".to_string()))?
            .to_string();
        let super_id = self
            .find_class(loader, &super_name)
            .ok_or_else(|| DefineError::CannotDefine(format!("unresolved super {super_name}")))?;
        let super_def = self.class(super_id);
        if super_def.modifiers.is_final() {
            return Err(DefineError::HostUnmodifiable(super_name));
        }
        if super_def.modifiers.is_interface() {
            return Err(DefineError::CannotDefine(format!(
                "{super_name} is an interface"
            )));
        }

        let mut interfaces = Vec::new();
        let mut interface_ids = Vec::new();
        for idx in &image.interfaces {
            let if_name = image
                .pool
                .class_name(*idx)
                .ok_or_else(|| DefineError::CannotDefine("bad interface reference".to_string()))?;
            interfaces.push(TypeBinding::of(if_name));
            interface_ids.push(self.find_class(loader, if_name).ok_or_else(|| {
                DefineError::CannotDefine(format!("unresolved interface {if_name}"))
            })?);
        }

        let pool = Arc::new(image.pool.clone());
        let mut fields = Vec::new();
        let mut static_fields = Vec::new();
        for f in &image.fields {
            let def = FieldDef {
                name: image.pool.utf8(f.name).unwrap_or_default().to_string(),
                ty: TypeRef::parse(image.pool.utf8(f.ty).unwrap_or_default()),
                modifiers: Modifiers(f.flags),
            };
            if def.modifiers.is_static() {
                static_fields.push(def);
            } else {
                fields.push(def);
            }
        }

        let mut ctors = Vec::new();
        let mut methods = Vec::new();
        let mut clinit = None;
        for m in &image.methods {
            let m_name = image.pool.utf8(m.name).unwrap_or_default().to_string();
            let params: Vec<TypeRef> = m
                .params
                .iter()
                .map(|p| TypeRef::parse(image.pool.utf8(*p).unwrap_or_default()))
                .collect();
            let ret = TypeRef::parse(image.pool.utf8(m.ret).unwrap_or_default());
            let body = MethodBody::Code(Arc::new(
                CodeBody::decode(&m.code, m.max_stack, m.max_locals)
                    .map_err(|e| DefineError::Malformed(ImageError::Decode(e)))?,
            ));
            let modifiers = Modifiers(m.flags);
            if m_name == "<init>" {
                ctors.push(CtorDef {
                    params,
                    modifiers,
                    body,
                });
            } else if m_name == "<clinit>" {
                clinit = Some(body);
            } else {
                methods.push(MethodDef {
                    name: m_name,
                    params,
                    generic_params: None,
                    ret,
                    generic_ret: None,
                    modifiers,
                    body,
                });
            }
        }

        let field_base = super_def.field_base + super_def.fields.len();
        let id = self.insert_class(ClassParts {
            name: name.clone(),
            loader,
            named,
            anonymous,
            modifiers: Modifiers(image.flags),
            type_params: Vec::new(),
            superclass: Some(TypeBinding::of(super_name)),
            interfaces,
            fields,
            static_fields,
            ctors,
            methods,
            clinit,
            nest_host,
            super_id: Some(super_id),
            interface_ids,
            field_base,
            pool: Some(pool),
        })?;
        log::debug!("defined {} (loader {:?}, named {})", name, loader, named);

        // Linking completes with static initialisation; the class handle is
        // only handed out afterwards.
        let def = self.class(id);
        if let Some(body) = def.clinit.clone() {
            self.invoke_body(&def, &body, "<clinit>", None, &[])
                .map_err(DefineError::Initializer)?;
        }
        Ok(id)
    }

    // ========================================================================
    // Heap
    // ========================================================================

    fn insert_object(&self, object: Object) -> Value {
        let id = object.object_id;
        self.heap.insert(id, object);
        Value::Ref(ObjId(id))
    }

    /// Allocate a plain instance of `class` with the whole-hierarchy field
    /// layout, fields null-initialised.
    pub fn alloc_instance(&self, class: ClassId) -> Value {
        let def = self.class(class);
        self.insert_object(Object::new(class, def.field_base + def.fields.len()))
    }

    pub(crate) fn alloc_builtin(&self, name: &str, payload: Payload) -> Value {
        let id = self
            .find_class(self.boot_loader(), name)
            .unwrap_or(ClassId(0));
        self.insert_object(Object::with_payload(id, payload))
    }

    /// Allocate a string object.
    pub fn new_string(&self, text: impl Into<String>) -> Value {
        self.alloc_builtin(builtins::STRING, Payload::Str(text.into()))
    }

    /// Read a string object's contents.
    pub fn get_string(&self, value: Value) -> Option<String> {
        let obj = self.heap.get(&value.as_ref()?.0)?;
        match &obj.payload {
            Payload::Str(s) => Some(s.clone()),
            _ => None,
        }
    }

    /// Allocate a reference array.
    pub fn new_array(&self, elem: TypeRef, values: Vec<Value>) -> Value {
        self.alloc_builtin(builtins::OBJECT, Payload::Array { elem, values })
    }

    /// Clone out an array's elements.
    pub fn array_values(&self, value: Value) -> Option<Vec<Value>> {
        let obj = self.heap.get(&value.as_ref()?.0)?;
        match &obj.payload {
            Payload::Array { values, .. } => Some(values.clone()),
            _ => None,
        }
    }

    /// Wrap a host callback as a platform handler object.
    pub fn handler_value(&self, handler: HandlerRef) -> Value {
        self.alloc_builtin(builtins::HANDLER_IMPL, Payload::Handler(handler))
    }

    /// Build a `Handler[]` array from host callbacks.
    pub fn handler_array(&self, handlers: Vec<HandlerRef>) -> Value {
        let values = handlers
            .into_iter()
            .map(|h| self.handler_value(h))
            .collect();
        self.new_array(TypeRef::object(builtins::HANDLER), values)
    }

    /// Allocate a method-handle object.
    pub fn handle_value(&self, handle: RawHandle) -> Value {
        self.alloc_builtin(builtins::METHOD_HANDLE, Payload::Handle(handle))
    }

    /// Box a primitive value; references pass through.
    pub fn box_value(&self, value: Value) -> Value {
        match value.prim_kind() {
            Some(prim) => self.alloc_builtin(prim.boxed_class(), Payload::Boxed(value)),
            None => value,
        }
    }

    /// Unbox a boxed primitive object.
    pub fn unbox_value(&self, value: Value) -> Option<Value> {
        let obj = self.heap.get(&value.as_ref()?.0)?;
        match &obj.payload {
            Payload::Boxed(v) => Some(*v),
            _ => None,
        }
    }

    /// Read an object's payload through a closure.
    pub fn with_payload<R>(&self, value: Value, f: impl FnOnce(&Payload) -> R) -> Option<R> {
        let obj = self.heap.get(&value.as_ref()?.0)?;
        Some(f(&obj.payload))
    }

    /// Allocate a `java.lang.Class` mirror object.
    pub fn class_mirror(&self, class: ClassId) -> Value {
        self.alloc_builtin(builtins::CLASS, Payload::Mirror(class))
    }

    /// Shallow-copy an object, assigning a fresh identity.
    pub(crate) fn clone_object(&self, value: Value) -> VmResult<Value> {
        let id = value.as_ref().ok_or(VmError::NullPointer)?;
        let copy = {
            let obj = self
                .heap
                .get(&id.0)
                .ok_or_else(|| VmError::RuntimeError("dangling reference".to_string()))?;
            let mut copy = Object::new(obj.class, obj.fields.len());
            copy.fields = obj.fields.clone();
            copy.payload = obj.payload.clone();
            copy
        };
        Ok(self.insert_object(copy))
    }

    /// The runtime class of a reference value.
    pub fn instance_class(&self, value: Value) -> Option<ClassId> {
        let obj = self.heap.get(&value.as_ref()?.0)?;
        Some(obj.class)
    }

    /// The identity of a reference value.
    pub fn object_id(&self, value: Value) -> Option<u64> {
        value.as_ref().map(|id| id.0)
    }

    pub(crate) fn field_get(&self, value: Value, slot: usize) -> VmResult<Value> {
        let id = value.as_ref().ok_or(VmError::NullPointer)?;
        let obj = self
            .heap
            .get(&id.0)
            .ok_or_else(|| VmError::RuntimeError("dangling reference".to_string()))?;
        obj.get_field(slot)
            .ok_or_else(|| VmError::RuntimeError(format!("bad field slot {slot}")))
    }

    pub(crate) fn field_set(&self, value: Value, slot: usize, new: Value) -> VmResult<()> {
        let id = value.as_ref().ok_or(VmError::NullPointer)?;
        let mut obj = self
            .heap
            .get_mut(&id.0)
            .ok_or_else(|| VmError::RuntimeError("dangling reference".to_string()))?;
        obj.set_field(slot, new).map_err(VmError::RuntimeError)
    }

    /// Read an instance field by name, searching the class chain.
    pub fn get_field_by_name(&self, receiver: Value, name: &str) -> VmResult<Value> {
        let slot = self.field_slot_by_name(receiver, name)?;
        self.field_get(receiver, slot)
    }

    /// Write an instance field by name, searching the class chain.
    pub fn set_field_by_name(&self, receiver: Value, name: &str, value: Value) -> VmResult<()> {
        let slot = self.field_slot_by_name(receiver, name)?;
        self.field_set(receiver, slot, value)
    }

    fn field_slot_by_name(&self, receiver: Value, name: &str) -> VmResult<usize> {
        let class = self
            .instance_class(receiver)
            .ok_or(VmError::NullPointer)?;
        let mut current = Some(class);
        while let Some(id) = current {
            let def = self.class(id);
            if let Some(idx) = def.fields.iter().position(|f| f.name == name) {
                return Ok(def.field_base + idx);
            }
            current = def.super_id;
        }
        Err(VmError::NoSuchField {
            class: self.class(class).name.clone(),
            name: name.to_string(),
        })
    }

    pub(crate) fn array_get(&self, array: Value, index: i32) -> VmResult<Value> {
        let id = array.as_ref().ok_or(VmError::NullPointer)?;
        let obj = self
            .heap
            .get(&id.0)
            .ok_or_else(|| VmError::RuntimeError("dangling reference".to_string()))?;
        match &obj.payload {
            Payload::Array { values, .. } => {
                if index < 0 || index as usize >= values.len() {
                    Err(VmError::IndexOutOfBounds {
                        index,
                        len: values.len(),
                    })
                } else {
                    Ok(values[index as usize])
                }
            }
            _ => Err(VmError::TypeError("not an array".to_string())),
        }
    }

    pub(crate) fn array_set(&self, array: Value, index: i32, value: Value) -> VmResult<()> {
        let id = array.as_ref().ok_or(VmError::NullPointer)?;
        let mut obj = self
            .heap
            .get_mut(&id.0)
            .ok_or_else(|| VmError::RuntimeError("dangling reference".to_string()))?;
        match &mut obj.payload {
            Payload::Array { values, .. } => {
                if index < 0 || index as usize >= values.len() {
                    Err(VmError::IndexOutOfBounds {
                        index,
                        len: values.len(),
                    })
                } else {
                    values[index as usize] = value;
                    Ok(())
                }
            }
            _ => Err(VmError::TypeError("not an array".to_string())),
        }
    }

    pub(crate) fn array_len(&self, array: Value) -> VmResult<i32> {
        let id = array.as_ref().ok_or(VmError::NullPointer)?;
        let obj = self
            .heap
            .get(&id.0)
            .ok_or_else(|| VmError::RuntimeError("dangling reference".to_string()))?;
        match &obj.payload {
            Payload::Array { values, .. } => Ok(values.len() as i32),
            _ => Err(VmError::TypeError("not an array".to_string())),
        }
    }

    // ========================================================================
    // Statics
    // ========================================================================

    /// Read a static field by name.
    pub fn read_static(&self, class: ClassId, name: &str) -> Option<Value> {
        let def = self.class(class);
        let idx = def.static_fields.iter().position(|f| f.name == name)? as u16;
        Some(
            self.statics
                .get(&(class, idx))
                .map(|v| *v)
                .unwrap_or(Value::Null),
        )
    }

    pub(crate) fn static_get(&self, class: ClassId, idx: u16) -> Value {
        self.statics
            .get(&(class, idx))
            .map(|v| *v)
            .unwrap_or(Value::Null)
    }

    pub(crate) fn static_set(&self, class: ClassId, idx: u16, value: Value) {
        self.statics.insert((class, idx), value);
    }

    // ========================================================================
    // Type tests
    // ========================================================================

    /// Runtime `instanceof` against a type name (`Foo`, `Foo[]`).
    pub fn is_instance(&self, value: Value, target: &str) -> bool {
        let Some(class) = self.instance_class(value) else {
            return false;
        };
        if target == builtins::OBJECT {
            return true;
        }
        if let Some(elem_name) = target.strip_suffix("[]") {
            return self
                .with_payload(value, |p| match p {
                    Payload::Array { elem, .. } => {
                        elem_name == builtins::OBJECT || elem.to_string() == elem_name
                    }
                    _ => false,
                })
                .unwrap_or(false);
        }
        self.class_extends(class, target)
    }

    fn class_extends(&self, class: ClassId, target: &str) -> bool {
        let mut current = Some(class);
        while let Some(id) = current {
            let def = self.class(id);
            if def.name == target {
                return true;
            }
            for iface in &def.interface_ids {
                if self.class_extends(*iface, target) {
                    return true;
                }
            }
            current = def.super_id;
        }
        false
    }

    // ========================================================================
    // Invocation
    // ========================================================================

    /// Select the most-derived method matching the signature, walking the
    /// class chain from `class` upwards.
    pub fn select_method(
        &self,
        class: ClassId,
        name: &str,
        params: &[TypeRef],
        ret: Option<&TypeRef>,
    ) -> Option<(ClassId, u16)> {
        let mut current = Some(class);
        while let Some(id) = current {
            let def = self.class(id);
            if let Some((idx, _)) = def.find_method(name, params, ret) {
                return Some((id, idx));
            }
            current = def.super_id;
        }
        None
    }

    /// Virtual dispatch on the receiver's runtime class.
    pub fn call_virtual(
        &self,
        receiver: Value,
        name: &str,
        params: &[TypeRef],
        ret: Option<&TypeRef>,
        args: &[Value],
    ) -> VmResult<Value> {
        let class = self.instance_class(receiver).ok_or(VmError::NullPointer)?;
        let (declaring, idx) =
            self.select_method(class, name, params, ret)
                .ok_or_else(|| VmError::NoSuchMethod {
                    class: self.class(class).name.clone(),
                    name: name.to_string(),
                })?;
        self.invoke_declared(declaring, idx, receiver, args)
    }

    /// Exact (non-virtual) dispatch starting at a specific class.
    pub fn call_special(
        &self,
        class: ClassId,
        name: &str,
        params: &[TypeRef],
        ret: Option<&TypeRef>,
        receiver: Value,
        args: &[Value],
    ) -> VmResult<Value> {
        let (declaring, idx) =
            self.select_method(class, name, params, ret)
                .ok_or_else(|| VmError::NoSuchMethod {
                    class: self.class(class).name.clone(),
                    name: name.to_string(),
                })?;
        self.invoke_declared(declaring, idx, receiver, args)
    }

    /// Static dispatch.
    pub fn call_static(
        &self,
        class: ClassId,
        name: &str,
        params: &[TypeRef],
        args: &[Value],
    ) -> VmResult<Value> {
        let (declaring, idx) =
            self.select_method(class, name, params, None)
                .ok_or_else(|| VmError::NoSuchMethod {
                    class: self.class(class).name.clone(),
                    name: name.to_string(),
                })?;
        self.invoke_declared(declaring, idx, Value::Null, args)
    }

    /// Invoke a declared method by position.
    pub fn invoke_declared(
        &self,
        class: ClassId,
        index: u16,
        receiver: Value,
        args: &[Value],
    ) -> VmResult<Value> {
        let def = self.class(class);
        let method = def
            .methods
            .get(index as usize)
            .ok_or_else(|| VmError::NoSuchMethod {
                class: def.name.clone(),
                name: format!("#{index}"),
            })?;
        let body = method.body.clone();
        let name = method.name.clone();
        let receiver = if method.modifiers.is_static() {
            None
        } else {
            Some(receiver)
        };
        self.invoke_body(&def, &body, &name, receiver, args)
    }

    /// Construct an instance through a matching constructor.
    pub fn instantiate(
        &self,
        class: ClassId,
        params: &[TypeRef],
        args: &[Value],
    ) -> VmResult<Value> {
        let def = self.class(class);
        let (idx, _) = def.find_ctor(params).ok_or_else(|| VmError::NoSuchMethod {
            class: def.name.clone(),
            name: "<init>".to_string(),
        })?;
        self.instantiate_by_index(class, idx, args)
    }

    /// Construct an instance through a constructor by declared index.
    pub fn instantiate_by_index(
        &self,
        class: ClassId,
        ctor: u16,
        args: &[Value],
    ) -> VmResult<Value> {
        let receiver = self.alloc_instance(class);
        self.invoke_ctor(class, ctor, receiver, args)?;
        Ok(receiver)
    }

    /// Run a constructor body against an allocated receiver.
    pub fn invoke_ctor(
        &self,
        class: ClassId,
        ctor: u16,
        receiver: Value,
        args: &[Value],
    ) -> VmResult<Value> {
        let def = self.class(class);
        let body = def
            .ctors
            .get(ctor as usize)
            .ok_or_else(|| VmError::NoSuchMethod {
                class: def.name.clone(),
                name: "<init>".to_string(),
            })?
            .body
            .clone();
        self.invoke_body(&def, &body, "<init>", Some(receiver), args)
    }

    /// Invoke a member through a raw handle.
    pub fn invoke_by_handle(&self, handle: RawHandle, args: &[Value]) -> VmResult<Value> {
        match handle.kind {
            HandleKind::Static(idx) => self.invoke_declared(handle.class, idx, Value::Null, args),
            HandleKind::Ctor(idx) => self.instantiate_by_index(handle.class, idx, args),
        }
    }

    /// Call `apply(int)` on an invoker-table object.
    pub fn apply_table(&self, table: Value, index: i32) -> VmResult<Value> {
        self.call_virtual(
            table,
            "apply",
            &[TypeRef::Prim(Prim::Int)],
            None,
            &[Value::Int(index)],
        )
    }

    /// Call `apply(Object, Object[])` on a two-argument invoker object.
    pub fn apply_bifunction(&self, f: Value, context: Value, args: &[Value]) -> VmResult<Value> {
        let packed = self.new_array(TypeRef::top(), args.to_vec());
        self.call_virtual(
            f,
            "apply",
            &[TypeRef::top(), TypeRef::array(TypeRef::top())],
            None,
            &[context, packed],
        )
    }

    pub(crate) fn invoke_body(
        &self,
        class: &Arc<ClassDef>,
        body: &MethodBody,
        name: &str,
        receiver: Option<Value>,
        args: &[Value],
    ) -> VmResult<Value> {
        match body {
            MethodBody::Abstract => Err(VmError::AbstractCall {
                class: class.name.clone(),
                name: name.to_string(),
            }),
            MethodBody::Native(f) => f(self, receiver.unwrap_or(Value::Null), args),
            MethodBody::Code(code) => {
                let pool = class
                    .pool
                    .clone()
                    .unwrap_or_else(|| Arc::new(ConstantPool::default()));
                interpreter::execute(self, class, &pool, code, receiver, args)
            }
        }
    }
}

struct ClassParts {
    name: String,
    loader: LoaderId,
    named: bool,
    anonymous: bool,
    modifiers: Modifiers,
    type_params: Vec<String>,
    superclass: Option<TypeBinding>,
    interfaces: Vec<TypeBinding>,
    fields: Vec<FieldDef>,
    static_fields: Vec<FieldDef>,
    ctors: Vec<CtorDef>,
    methods: Vec<MethodDef>,
    clinit: Option<MethodBody>,
    nest_host: Option<ClassId>,
    super_id: Option<ClassId>,
    interface_ids: Vec<ClassId>,
    field_base: usize,
    pool: Option<Arc<ConstantPool>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::{native, ClassBuilder};

    #[test]
    fn test_loader_chain_resolution() {
        let machine = Machine::new();
        let parent = machine.boot_loader();
        let child = machine.new_loader(Some(parent));

        // Built-ins resolve through the chain.
        assert!(machine.find_class(child, builtins::OBJECT).is_some());
        // Unknown names do not.
        assert!(machine.find_class(child, "no.such.Class").is_none());
    }

    #[test]
    fn test_child_loader_cached_per_host_loader() {
        let machine = Machine::new();
        let host_loader = machine.boot_loader();
        let a = machine.child_loader_for(host_loader);
        let b = machine.child_loader_for(host_loader);
        assert_eq!(a, b);
    }

    #[test]
    fn test_register_and_dispatch() {
        let machine = Machine::new();
        let loader = machine.boot_loader();
        let calc = ClassBuilder::new("demo.Calc")
            .ctor(&[], Modifiers::PUBLIC, native(|_, _, _| Ok(Value::Null)))
            .method(
                "add",
                &[TypeRef::int(), TypeRef::int()],
                TypeRef::int(),
                Modifiers::PUBLIC,
                native(|_, _, args| {
                    let a = args[0].as_int().unwrap_or(0);
                    let b = args[1].as_int().unwrap_or(0);
                    Ok(Value::Int(a + b))
                }),
            )
            .register(&machine, loader)
            .unwrap();

        let instance = machine.instantiate(calc, &[], &[]).unwrap();
        let sum = machine
            .call_virtual(
                instance,
                "add",
                &[TypeRef::int(), TypeRef::int()],
                None,
                &[Value::Int(2), Value::Int(3)],
            )
            .unwrap();
        assert_eq!(sum, Value::Int(5));
    }

    #[test]
    fn test_override_dispatches_to_most_derived() {
        let machine = Machine::new();
        let loader = machine.boot_loader();
        let nop = || native(|_, _, _| Ok(Value::Null));
        let _base = ClassBuilder::new("demo.Base")
            .ctor(&[], Modifiers::PUBLIC, nop())
            .method(
                "id",
                &[],
                TypeRef::int(),
                Modifiers::PUBLIC,
                native(|_, _, _| Ok(Value::Int(1))),
            )
            .register(&machine, loader)
            .unwrap();
        let sub = ClassBuilder::new("demo.Sub")
            .extends(TypeBinding::of("demo.Base"))
            .ctor(&[], Modifiers::PUBLIC, nop())
            .method(
                "id",
                &[],
                TypeRef::int(),
                Modifiers::PUBLIC,
                native(|_, _, _| Ok(Value::Int(2))),
            )
            .register(&machine, loader)
            .unwrap();

        let instance = machine.instantiate(sub, &[], &[]).unwrap();
        let got = machine
            .call_virtual(instance, "id", &[], None, &[])
            .unwrap();
        assert_eq!(got, Value::Int(2));
    }

    #[test]
    fn test_boxing_round_trip() {
        let machine = Machine::new();
        let boxed = machine.box_value(Value::Int(41));
        assert!(machine.is_instance(boxed, "java.lang.Integer"));
        assert_eq!(machine.unbox_value(boxed), Some(Value::Int(41)));
        // References pass through unboxed.
        let s = machine.new_string("x");
        assert_eq!(machine.box_value(s), s);
    }

    #[test]
    fn test_is_instance_arrays() {
        let machine = Machine::new();
        let arr = machine.new_array(TypeRef::object(builtins::HANDLER), vec![]);
        assert!(machine.is_instance(arr, "weft.aop.Handler[]"));
        assert!(machine.is_instance(arr, "java.lang.Object[]"));
        assert!(!machine.is_instance(arr, "java.lang.String[]"));
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let machine = Machine::new();
        let loader = machine.boot_loader();
        ClassBuilder::new("demo.Dup")
            .register(&machine, loader)
            .unwrap();
        assert!(ClassBuilder::new("demo.Dup")
            .register(&machine, loader)
            .is_err());
    }
}
