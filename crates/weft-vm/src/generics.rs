//! Generic-parameter resolution
//!
//! Resolves the declared (pre-erasure) parameter and return types of a
//! method against a host type, by composing the type-argument bindings on
//! the inheritance path from the host down to the declaring class.
//! Variables left unbound by the path erase to the top type, matching the
//! platform's raw-type semantics.

use crate::class::{ClassDef, ClassId, MethodId, TypeBinding};
use crate::machine::Machine;
use crate::value::TypeRef;
use crate::{VmError, VmResult};
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// A type as written at a generic declaration site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenericType {
    /// A type variable (`T`)
    Var(String),
    /// A concrete type
    Of(TypeRef),
}

impl GenericType {
    /// Variable shorthand.
    pub fn var(name: impl Into<String>) -> GenericType {
        GenericType::Var(name.into())
    }

    /// Concrete shorthand.
    pub fn of(ty: TypeRef) -> GenericType {
        GenericType::Of(ty)
    }

    fn substitute(&self, subst: &FxHashMap<String, TypeRef>) -> TypeRef {
        match self {
            GenericType::Var(v) => subst.get(v).cloned().unwrap_or_else(TypeRef::top),
            GenericType::Of(t) => t.clone(),
        }
    }
}

/// Resolve the parameter types of `method` as seen through `host`.
///
/// When the declaration is not generic this is the raw parameter list.
pub fn resolve_parameter_types(
    machine: &Machine,
    host: ClassId,
    method: MethodId,
) -> VmResult<Vec<TypeRef>> {
    let declaring = machine.class(method.class);
    let def = declaring
        .methods
        .get(method.index as usize)
        .ok_or_else(|| VmError::NoSuchMethod {
            class: declaring.name.clone(),
            name: format!("#{}", method.index),
        })?;
    match &def.generic_params {
        None => Ok(def.params.clone()),
        Some(generic) => {
            let subst = substitution_for(machine, host, &declaring.name)?;
            Ok(generic.iter().map(|g| g.substitute(&subst)).collect())
        }
    }
}

/// Resolve the return type of `method` as seen through `host`.
pub fn resolve_return_type(machine: &Machine, host: ClassId, method: MethodId) -> VmResult<TypeRef> {
    let declaring = machine.class(method.class);
    let def = declaring
        .methods
        .get(method.index as usize)
        .ok_or_else(|| VmError::NoSuchMethod {
            class: declaring.name.clone(),
            name: format!("#{}", method.index),
        })?;
    match &def.generic_ret {
        None => Ok(def.ret.clone()),
        Some(generic) => {
            let subst = substitution_for(machine, host, &declaring.name)?;
            Ok(generic.substitute(&subst))
        }
    }
}

/// Compose the variable substitution active at `target` when the hierarchy
/// is entered at `host`.
fn substitution_for(
    machine: &Machine,
    host: ClassId,
    target: &str,
) -> VmResult<FxHashMap<String, TypeRef>> {
    let host_def = machine.class(host);
    let mut chain = Vec::new();
    if !binding_path(machine, &host_def, target, &mut chain) {
        return Err(VmError::ClassNotFound(target.to_string()));
    }

    // The host itself is raw: its own variables erase to the top type, so
    // the initial substitution is empty and lookups default accordingly.
    let mut subst: FxHashMap<String, TypeRef> = FxHashMap::default();
    for (declaring, binding) in chain {
        let bound = machine
            .find_class(declaring.loader, &binding.name)
            .map(|id| machine.class(id))
            .ok_or_else(|| VmError::ClassNotFound(binding.name.clone()))?;
        let mut next: FxHashMap<String, TypeRef> = FxHashMap::default();
        for (i, param) in bound.type_params.iter().enumerate() {
            let resolved = match binding.args.get(i) {
                Some(arg) => arg.substitute(&subst),
                None => TypeRef::top(),
            };
            next.insert(param.clone(), resolved);
        }
        subst = next;
    }
    Ok(subst)
}

/// Depth-first search for the binding path `from` -> ... -> `target`,
/// following the super-class edge and interface edges. Pushes the
/// `(declaring class, binding)` steps in order when found.
fn binding_path(
    machine: &Machine,
    from: &Arc<ClassDef>,
    target: &str,
    out: &mut Vec<(Arc<ClassDef>, TypeBinding)>,
) -> bool {
    if from.name == target {
        return true;
    }
    let edges = from.superclass.iter().chain(from.interfaces.iter());
    for binding in edges {
        let Some(next_id) = machine.find_class(from.loader, &binding.name) else {
            continue;
        };
        let next = machine.class(next_id);
        out.push((Arc::clone(from), binding.clone()));
        if binding_path(machine, &next, target, out) {
            return true;
        }
        out.pop();
    }
    false
}
