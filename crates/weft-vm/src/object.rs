//! Heap object model

use crate::class::ClassId;
use crate::handler::HandlerRef;
use crate::value::{TypeRef, Value};
use std::sync::atomic::{AtomicU64, Ordering};

/// Global counter for generating unique object IDs
static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

/// Generate a new unique object ID
fn generate_object_id() -> u64 {
    NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Identity of a heap object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjId(pub u64);

/// Kind of member a raw method handle points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    /// A static method, by declared index
    Static(u16),
    /// A constructor, by declared index
    Ctor(u16),
}

/// A direct, unreflective pointer to one executable member of a class.
///
/// Produced by the `ldc_handle` instruction; consumed by the lambda-factory
/// intrinsics and by drivers reading a glue class's invoker-table field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawHandle {
    /// Declaring class of the member
    pub class: ClassId,
    /// Member selector
    pub kind: HandleKind,
}

/// Built-in native state carried by platform objects.
///
/// Plain user objects carry `None`; the built-in classes (strings, arrays,
/// boxed primitives, handler wrappers, method handles, and lambda-factory
/// products) each store their state in a dedicated variant.
#[derive(Debug, Clone)]
pub enum Payload {
    /// No native state (ordinary instance)
    None,
    /// `java.lang.String` contents
    Str(String),
    /// Reference array contents
    Array {
        /// Element type
        elem: TypeRef,
        /// Element values
        values: Vec<Value>,
    },
    /// Boxed primitive contents
    Boxed(Value),
    /// Handler wrapper around a host callback
    Handler(HandlerRef),
    /// `weft.invoke.MethodHandle` target
    Handle(RawHandle),
    /// Lambda-factory product: `int -> BiFunction` invoker table
    Table(RawHandle),
    /// A `BiFunction` bound to a trampoline index
    Bound {
        /// Static trampoline handle
        handle: RawHandle,
        /// Bound dispatch index
        index: i32,
    },
    /// `java.lang.Class` mirror
    Mirror(ClassId),
}

/// Object instance (heap-allocated).
#[derive(Debug, Clone)]
pub struct Object {
    /// Unique object ID (identity hash)
    pub object_id: u64,
    /// Runtime class
    pub class: ClassId,
    /// Instance field values, whole-hierarchy layout
    pub fields: Vec<Value>,
    /// Built-in native state
    pub payload: Payload,
}

impl Object {
    /// Create a plain instance with null-initialised fields.
    pub fn new(class: ClassId, field_count: usize) -> Self {
        Self {
            object_id: generate_object_id(),
            class,
            fields: vec![Value::Null; field_count],
            payload: Payload::None,
        }
    }

    /// Create an instance carrying built-in native state.
    pub fn with_payload(class: ClassId, payload: Payload) -> Self {
        Self {
            object_id: generate_object_id(),
            class,
            fields: Vec::new(),
            payload,
        }
    }

    /// Get a field value by whole-hierarchy slot.
    pub fn get_field(&self, slot: usize) -> Option<Value> {
        self.fields.get(slot).copied()
    }

    /// Set a field value by whole-hierarchy slot.
    pub fn set_field(&mut self, slot: usize, value: Value) -> Result<(), String> {
        if slot < self.fields.len() {
            self.fields[slot] = value;
            Ok(())
        } else {
            Err(format!(
                "field slot {} out of bounds (object has {} fields)",
                slot,
                self.fields.len()
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_ids_unique() {
        let a = Object::new(ClassId(0), 1);
        let b = Object::new(ClassId(0), 1);
        assert_ne!(a.object_id, b.object_id);
    }

    #[test]
    fn test_field_bounds() {
        let mut obj = Object::new(ClassId(0), 2);
        assert!(obj.set_field(1, Value::Int(7)).is_ok());
        assert_eq!(obj.get_field(1), Some(Value::Int(7)));
        assert!(obj.set_field(2, Value::Null).is_err());
        assert_eq!(obj.get_field(5), None);
    }
}
