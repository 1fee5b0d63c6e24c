//! Class definitions, loaders, and modifiers

use crate::generics::GenericType;
use crate::image::CodeBody;
use crate::machine::Machine;
use crate::value::{TypeRef, Value};
use crate::VmError;
use std::fmt;
use std::sync::Arc;

/// Identity of a registered class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassId(pub usize);

/// Identity of a class loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LoaderId(pub usize);

/// Identity of a declared method within its class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MethodId {
    /// Declaring class
    pub class: ClassId,
    /// Index into the class's declared method list
    pub index: u16,
}

/// Member and class access/property flags.
///
/// Flag values follow the platform class-file encoding so they serialize
/// into image access-flag words unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Modifiers(pub u16);

impl Modifiers {
    /// Publicly accessible
    pub const PUBLIC: Modifiers = Modifiers(0x0001);
    /// Accessible only within the declaring class
    pub const PRIVATE: Modifiers = Modifiers(0x0002);
    /// Accessible within the package and subclasses
    pub const PROTECTED: Modifiers = Modifiers(0x0004);
    /// Class-level member
    pub const STATIC: Modifiers = Modifiers(0x0008);
    /// Not overridable / not subclassable
    pub const FINAL: Modifiers = Modifiers(0x0010);
    /// Bridge method synthesised to preserve a pre-erasure signature
    pub const BRIDGE: Modifiers = Modifiers(0x0040);
    /// Native (host-provided) implementation
    pub const NATIVE: Modifiers = Modifiers(0x0100);
    /// Interface type
    pub const INTERFACE: Modifiers = Modifiers(0x0200);
    /// Abstract member or class
    pub const ABSTRACT: Modifiers = Modifiers(0x0400);
    /// Compiler-synthesised member
    pub const SYNTHETIC: Modifiers = Modifiers(0x1000);

    /// Union of two flag sets.
    pub const fn with(self, other: Modifiers) -> Modifiers {
        Modifiers(self.0 | other.0)
    }

    fn has(self, flag: Modifiers) -> bool {
        self.0 & flag.0 != 0
    }

    /// Whether the `public` flag is set.
    pub fn is_public(self) -> bool {
        self.has(Self::PUBLIC)
    }

    /// Whether the `private` flag is set.
    pub fn is_private(self) -> bool {
        self.has(Self::PRIVATE)
    }

    /// Whether the `protected` flag is set.
    pub fn is_protected(self) -> bool {
        self.has(Self::PROTECTED)
    }

    /// Package-private: none of public/private/protected.
    pub fn is_package_private(self) -> bool {
        !self.has(Self::PUBLIC) && !self.has(Self::PRIVATE) && !self.has(Self::PROTECTED)
    }

    /// Whether the `static` flag is set.
    pub fn is_static(self) -> bool {
        self.has(Self::STATIC)
    }

    /// Whether the `final` flag is set.
    pub fn is_final(self) -> bool {
        self.has(Self::FINAL)
    }

    /// Whether the `bridge` flag is set.
    pub fn is_bridge(self) -> bool {
        self.has(Self::BRIDGE)
    }

    /// Whether the `interface` flag is set.
    pub fn is_interface(self) -> bool {
        self.has(Self::INTERFACE)
    }

    /// Whether the `abstract` flag is set.
    pub fn is_abstract(self) -> bool {
        self.has(Self::ABSTRACT)
    }

    /// Whether the `synthetic` flag is set.
    pub fn is_synthetic(self) -> bool {
        self.has(Self::SYNTHETIC)
    }
}

/// A reference to a super-class or super-interface, with the generic type
/// arguments the subtype binds it with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeBinding {
    /// Binary name of the referenced class
    pub name: String,
    /// Type arguments for the referenced class's type variables
    pub args: Vec<GenericType>,
}

impl TypeBinding {
    /// Raw (unparameterised) reference.
    pub fn of(name: impl Into<String>) -> TypeBinding {
        TypeBinding {
            name: name.into(),
            args: Vec::new(),
        }
    }

    /// Add one type argument.
    pub fn arg(mut self, arg: GenericType) -> TypeBinding {
        self.args.push(arg);
        self
    }
}

/// A declared field.
#[derive(Debug, Clone)]
pub struct FieldDef {
    /// Field name
    pub name: String,
    /// Field type
    pub ty: TypeRef,
    /// Access flags
    pub modifiers: Modifiers,
}

/// Host-provided method implementation.
pub type NativeFn = Arc<dyn Fn(&Machine, Value, &[Value]) -> Result<Value, VmError> + Send + Sync>;

/// Executable body of a method or constructor.
#[derive(Clone)]
pub enum MethodBody {
    /// No body (interface / abstract method)
    Abstract,
    /// Host-provided Rust implementation
    Native(NativeFn),
    /// Verified image code
    Code(Arc<CodeBody>),
}

impl fmt::Debug for MethodBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MethodBody::Abstract => f.write_str("Abstract"),
            MethodBody::Native(_) => f.write_str("Native(..)"),
            MethodBody::Code(c) => write!(f, "Code({} ops)", c.ops.len()),
        }
    }
}

/// A declared method.
#[derive(Debug, Clone)]
pub struct MethodDef {
    /// Simple name
    pub name: String,
    /// Raw (erased) parameter types, in order
    pub params: Vec<TypeRef>,
    /// Declared generic parameter types, when the declaration is generic
    pub generic_params: Option<Vec<GenericType>>,
    /// Raw return type (`TypeRef::Void` for void)
    pub ret: TypeRef,
    /// Declared generic return type, when the declaration is generic
    pub generic_ret: Option<GenericType>,
    /// Access and property flags
    pub modifiers: Modifiers,
    /// Implementation
    pub body: MethodBody,
}

/// A declared constructor.
#[derive(Debug, Clone)]
pub struct CtorDef {
    /// Parameter types, in order
    pub params: Vec<TypeRef>,
    /// Access flags
    pub modifiers: Modifiers,
    /// Implementation
    pub body: MethodBody,
}

/// An immutable class definition.
///
/// Definitions never change after registration; the registry hands out
/// `Arc<ClassDef>` and all mutable runtime state (instance fields, statics)
/// lives in the machine.
#[derive(Debug)]
pub struct ClassDef {
    /// Registry identity
    pub id: ClassId,
    /// Binary name
    pub name: String,
    /// Defining loader
    pub loader: LoaderId,
    /// Whether the class is resolvable by name from its loader
    pub named: bool,
    /// Legacy anonymous hosting: self-referential casts do not resolve
    pub anonymous: bool,
    /// Class access flags
    pub modifiers: Modifiers,
    /// Declared type variables, in order
    pub type_params: Vec<String>,
    /// Super-class binding (`None` only for the top type)
    pub superclass: Option<TypeBinding>,
    /// Implemented interface bindings
    pub interfaces: Vec<TypeBinding>,
    /// Declared instance fields
    pub fields: Vec<FieldDef>,
    /// Declared static fields
    pub static_fields: Vec<FieldDef>,
    /// Declared constructors
    pub ctors: Vec<CtorDef>,
    /// Declared methods
    pub methods: Vec<MethodDef>,
    /// Static initialiser
    pub clinit: Option<MethodBody>,
    /// Nest host for hidden/anonymous classes
    pub nest_host: Option<ClassId>,
    /// Resolved super-class (registration-time link)
    pub super_id: Option<ClassId>,
    /// Resolved interfaces (registration-time links)
    pub interface_ids: Vec<ClassId>,
    /// First instance-field slot declared by this class
    pub field_base: usize,
    /// Constant pool, for image-defined classes
    pub pool: Option<Arc<crate::image::ConstantPool>>,
}

impl ClassDef {
    /// The package portion of the binary name (empty for the default package).
    pub fn package(&self) -> &str {
        match self.name.rfind('.') {
            Some(dot) => &self.name[..dot],
            None => "",
        }
    }

    /// Find a declared method by name and raw parameter types.
    ///
    /// Methods are identified by name, parameters, *and* return type (a
    /// covariant override and its bridge share everything but the return);
    /// pass `None` to accept the first parameter match.
    pub fn find_method(
        &self,
        name: &str,
        params: &[TypeRef],
        ret: Option<&TypeRef>,
    ) -> Option<(u16, &MethodDef)> {
        self.methods
            .iter()
            .enumerate()
            .find(|(_, m)| {
                m.name == name && m.params == params && ret.map_or(true, |r| &m.ret == r)
            })
            .map(|(i, m)| (i as u16, m))
    }

    /// Find a declared constructor by parameter types.
    pub fn find_ctor(&self, params: &[TypeRef]) -> Option<(u16, &CtorDef)> {
        self.ctors
            .iter()
            .enumerate()
            .find(|(_, c)| c.params == params)
            .map(|(i, c)| (i as u16, c))
    }
}

/// Fluent builder for registering host classes.
///
/// Used by embedders and tests to stand up class hierarchies with
/// native-bodied members; generated glue arrives through the image
/// definition path instead.
pub struct ClassBuilder {
    name: String,
    modifiers: Modifiers,
    type_params: Vec<String>,
    superclass: Option<TypeBinding>,
    interfaces: Vec<TypeBinding>,
    fields: Vec<FieldDef>,
    static_fields: Vec<FieldDef>,
    ctors: Vec<CtorDef>,
    methods: Vec<MethodDef>,
}

impl ClassBuilder {
    /// Start a builder for a class extending the top type.
    pub fn new(name: impl Into<String>) -> ClassBuilder {
        ClassBuilder {
            name: name.into(),
            modifiers: Modifiers::PUBLIC,
            type_params: Vec::new(),
            superclass: Some(TypeBinding::of(crate::builtins::OBJECT)),
            interfaces: Vec::new(),
            fields: Vec::new(),
            static_fields: Vec::new(),
            ctors: Vec::new(),
            methods: Vec::new(),
        }
    }

    /// Start a builder for the root of the hierarchy (no super-class).
    pub(crate) fn root(name: impl Into<String>) -> ClassBuilder {
        let mut b = ClassBuilder::new(name);
        b.superclass = None;
        b
    }

    /// Start a builder for an interface.
    pub fn interface(name: impl Into<String>) -> ClassBuilder {
        let mut b = ClassBuilder::new(name);
        b.modifiers = Modifiers::PUBLIC
            .with(Modifiers::INTERFACE)
            .with(Modifiers::ABSTRACT);
        b.superclass = None;
        b
    }

    /// Replace the class access flags.
    pub fn modifiers(mut self, modifiers: Modifiers) -> Self {
        self.modifiers = modifiers;
        self
    }

    /// Declare type variables.
    pub fn type_params(mut self, params: &[&str]) -> Self {
        self.type_params = params.iter().map(|p| p.to_string()).collect();
        self
    }

    /// Set the super-class binding.
    pub fn extends(mut self, binding: TypeBinding) -> Self {
        self.superclass = Some(binding);
        self
    }

    /// Add an implemented interface binding.
    pub fn implements(mut self, binding: TypeBinding) -> Self {
        self.interfaces.push(binding);
        self
    }

    /// Declare an instance field.
    pub fn field(mut self, name: &str, ty: TypeRef, modifiers: Modifiers) -> Self {
        self.fields.push(FieldDef {
            name: name.to_string(),
            ty,
            modifiers,
        });
        self
    }

    /// Declare a constructor with a native body.
    pub fn ctor(mut self, params: &[TypeRef], modifiers: Modifiers, body: NativeFn) -> Self {
        self.ctors.push(CtorDef {
            params: params.to_vec(),
            modifiers,
            body: MethodBody::Native(body),
        });
        self
    }

    /// Declare a method with a native body.
    pub fn method(
        mut self,
        name: &str,
        params: &[TypeRef],
        ret: TypeRef,
        modifiers: Modifiers,
        body: NativeFn,
    ) -> Self {
        self.methods.push(MethodDef {
            name: name.to_string(),
            params: params.to_vec(),
            generic_params: None,
            ret,
            generic_ret: None,
            modifiers,
            body: MethodBody::Native(body),
        });
        self
    }

    /// Declare a method whose declaration site is generic.
    #[allow(clippy::too_many_arguments)]
    pub fn generic_method(
        mut self,
        name: &str,
        params: &[TypeRef],
        generic_params: &[GenericType],
        ret: TypeRef,
        generic_ret: Option<GenericType>,
        modifiers: Modifiers,
        body: MethodBody,
    ) -> Self {
        self.methods.push(MethodDef {
            name: name.to_string(),
            params: params.to_vec(),
            generic_params: Some(generic_params.to_vec()),
            ret,
            generic_ret,
            modifiers,
            body,
        });
        self
    }

    /// Declare an abstract method (interface member).
    pub fn abstract_method(
        mut self,
        name: &str,
        params: &[TypeRef],
        ret: TypeRef,
        modifiers: Modifiers,
    ) -> Self {
        self.methods.push(MethodDef {
            name: name.to_string(),
            params: params.to_vec(),
            generic_params: None,
            ret,
            generic_ret: None,
            modifiers: modifiers.with(Modifiers::ABSTRACT),
            body: MethodBody::Abstract,
        });
        self
    }

    /// Declare a compiler-style bridge method.
    ///
    /// The body is expected to re-dispatch virtually to the specialised
    /// delegate, the way a compiler-synthesised bridge does.
    pub fn bridge_method(
        mut self,
        name: &str,
        params: &[TypeRef],
        ret: TypeRef,
        body: NativeFn,
    ) -> Self {
        self.methods.push(MethodDef {
            name: name.to_string(),
            params: params.to_vec(),
            generic_params: None,
            ret,
            generic_ret: None,
            modifiers: Modifiers::PUBLIC
                .with(Modifiers::BRIDGE)
                .with(Modifiers::SYNTHETIC),
            body: MethodBody::Native(body),
        });
        self
    }

    /// Register the class into the machine under the given loader.
    pub fn register(self, machine: &Machine, loader: LoaderId) -> Result<ClassId, VmError> {
        machine.register_class(
            self.name,
            loader,
            self.modifiers,
            self.type_params,
            self.superclass,
            self.interfaces,
            self.fields,
            self.static_fields,
            self.ctors,
            self.methods,
        )
    }
}

/// Wrap a closure as a [`NativeFn`].
pub fn native<F>(f: F) -> NativeFn
where
    F: Fn(&Machine, Value, &[Value]) -> Result<Value, VmError> + Send + Sync + 'static,
{
    Arc::new(f)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_modifier_predicates() {
        let m = Modifiers::PUBLIC.with(Modifiers::BRIDGE).with(Modifiers::SYNTHETIC);
        assert!(m.is_public());
        assert!(m.is_bridge());
        assert!(m.is_synthetic());
        assert!(!m.is_final());
        assert!(!m.is_package_private());
        assert!(Modifiers::default().is_package_private());
    }

    #[test]
    fn test_package_name() {
        let def = ClassDef {
            id: ClassId(0),
            name: "demo.calc.Calculator".to_string(),
            loader: LoaderId(0),
            named: true,
            anonymous: false,
            modifiers: Modifiers::PUBLIC,
            type_params: Vec::new(),
            superclass: None,
            interfaces: Vec::new(),
            fields: Vec::new(),
            static_fields: Vec::new(),
            ctors: Vec::new(),
            methods: Vec::new(),
            clinit: None,
            nest_host: None,
            super_id: None,
            interface_ids: Vec::new(),
            field_base: 0,
            pool: None,
        };
        assert_eq!(def.package(), "demo.calc");
    }
}
