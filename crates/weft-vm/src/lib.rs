//! Weft Managed Platform
//!
//! This crate provides the runtime that Weft's bytecode glue is defined
//! into:
//! - **Value model**: tagged primitive and reference values (`value` module)
//! - **Object model**: heap objects, arrays, boxed primitives (`object` module)
//! - **Class system**: immutable class definitions, loaders, modifiers (`class` module)
//! - **Class images**: the class-file format, codec, and verifier (`image` module)
//! - **Interpreter**: executes verified image code (`interpreter` module)
//! - **Machine**: registry, definition entry points, dispatch (`machine` module)
//!
//! The platform is deliberately small: it exists to host generated glue
//! classes and to expose the reflective metadata view (hierarchy walk,
//! declared members, generic-parameter resolution) that `weft-aop` consumes.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod builtins;
pub mod class;
pub mod generics;
pub mod handler;
pub mod image;
pub mod interpreter;
pub mod machine;
pub mod object;
pub mod value;

pub use class::{
    native, ClassBuilder, ClassDef, ClassId, CtorDef, FieldDef, LoaderId, MethodBody, MethodDef,
    MethodId, Modifiers, NativeFn, TypeBinding,
};
pub use generics::{resolve_parameter_types, resolve_return_type, GenericType};
pub use handler::{Handler, HandlerRef};
pub use image::{Image, ImageError, VerifyError};
pub use machine::{DefineError, Machine};
pub use object::{HandleKind, ObjId, Object, Payload, RawHandle};
pub use value::{Prim, TypeRef, Value};

/// Platform execution errors.
///
/// Everything the interpreter, dispatcher, or a native method body can fail
/// with. Unchecked platform exceptions raised by user handlers travel as
/// [`VmError::Thrown`] and propagate unchanged through generated glue.
#[derive(Debug, thiserror::Error)]
pub enum VmError {
    /// Operand stack underflow (unreachable for verified code)
    #[error("operand stack underflow at offset {0}")]
    StackUnderflow(u32),

    /// Branch to an offset that is not an instruction boundary
    #[error("invalid jump target {0}")]
    InvalidJump(u32),

    /// Null receiver or null array reference
    #[error("null pointer dereference")]
    NullPointer,

    /// Failed checked cast
    #[error("class cast: {from} cannot be cast to {to}")]
    ClassCast {
        /// Runtime type of the value
        from: String,
        /// Requested target type
        to: String,
    },

    /// Named class not resolvable from the executing loader
    #[error("class not found: {0}")]
    ClassNotFound(String),

    /// Method resolution failure
    #[error("no such method: {class}.{name}")]
    NoSuchMethod {
        /// Class searched
        class: String,
        /// Method name (with parameter types where known)
        name: String,
    },

    /// Field resolution failure
    #[error("no such field: {class}.{name}")]
    NoSuchField {
        /// Class searched
        class: String,
        /// Field name
        name: String,
    },

    /// Array access out of bounds
    #[error("array index {index} out of bounds (length {len})")]
    IndexOutOfBounds {
        /// Requested index
        index: i32,
        /// Array length
        len: usize,
    },

    /// Invocation of an abstract method
    #[error("abstract method invoked: {class}.{name}")]
    AbstractCall {
        /// Declaring class
        class: String,
        /// Method name
        name: String,
    },

    /// Operand of the wrong kind for an instruction or native body
    #[error("type error: {0}")]
    TypeError(String),

    /// Platform-unchecked exception raised by a handler or native body
    #[error("{class_name}: {message}")]
    Thrown {
        /// Exception class name
        class_name: String,
        /// Exception message
        message: String,
    },

    /// Generic runtime error
    #[error("runtime error: {0}")]
    RuntimeError(String),
}

/// Platform execution result
pub type VmResult<T> = Result<T, VmError>;
