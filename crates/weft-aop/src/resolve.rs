//! Method resolution
//!
//! Reproduces the platform's virtual-resolution rules for a host class:
//! walk the strict ancestors (excluding the top type), admit declared
//! methods under the active visibility regime, fold in the overridable
//! top-type methods and the merged interface closure, partition by
//! `(name, arity)`, then collapse each partition to its leaf methods,
//! pairing compiler-synthesised bridges with their real delegates via
//! generic-parameter resolution.

use rustc_hash::FxHashMap;
use std::collections::hash_map::Entry;
use weft_vm::builtins;
use weft_vm::{
    resolve_parameter_types, ClassDef, ClassId, LoaderId, Machine, MethodDef, MethodId, Modifiers,
    TypeRef, VmResult,
};

/// Snapshot of one resolvable method.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodInfo {
    /// Declared position
    pub id: MethodId,
    /// Simple name
    pub name: String,
    /// Raw (erased) parameter types
    pub params: Vec<TypeRef>,
    /// Raw return type
    pub ret: TypeRef,
    /// Modifier flags
    pub modifiers: Modifiers,
    /// Declaring class name
    pub declaring: String,
}

impl MethodInfo {
    fn of(class: &ClassDef, index: usize, def: &MethodDef) -> MethodInfo {
        MethodInfo {
            id: MethodId {
                class: class.id,
                index: index as u16,
            },
            name: def.name.clone(),
            params: def.params.clone(),
            ret: def.ret.clone(),
            modifiers: def.modifiers,
            declaring: class.name.clone(),
        }
    }
}

/// A bridge method paired with the non-bridge delegate it erases to.
#[derive(Debug, Clone)]
pub struct BridgePlan {
    /// The synthetic bridge's own signature
    pub bridge: MethodInfo,
    /// Delegate receiving virtual dispatch from the bridge
    pub delegate: MethodInfo,
}

/// One reportable slot of the enhanceable array.
#[derive(Debug, Clone)]
pub struct Enhanceable {
    /// The reported method (what point-cut matchers see)
    pub method: MethodInfo,
    /// Bridge coverage for this slot, when the leaf was a bridge
    pub bridge: Option<BridgePlan>,
}

/// Visible constructor snapshot.
#[derive(Debug, Clone)]
pub struct CtorInfo {
    /// Declared position
    pub index: u16,
    /// Parameter types
    pub params: Vec<TypeRef>,
    /// Modifier flags
    pub modifiers: Modifiers,
}

/// Immutable resolution result for one host.
#[derive(Debug, Clone)]
pub struct EnhancerTarget {
    /// The host class
    pub host: ClassId,
    /// Reportable methods, in resolution order
    pub enhanceable: Vec<Enhanceable>,
}

impl EnhancerTarget {
    /// Bridge-to-delegate pairs across all slots.
    pub fn bridge_delegates(&self) -> impl Iterator<Item = &BridgePlan> {
        self.enhanceable.iter().filter_map(|e| e.bridge.as_ref())
    }
}

/// Resolve the enhanceable methods of `host` under the given visibility
/// regime.
pub fn resolve_enhanceable(
    machine: &Machine,
    host: ClassId,
    has_package_access: bool,
) -> VmResult<EnhancerTarget> {
    let host_def = machine.class(host);
    let host_package = (host_def.package().to_string(), host_def.loader);
    let object_id = machine.find_class(host_def.loader, builtins::OBJECT);

    // Class chain, host upwards, excluding the top type. Interfaces are
    // queued for the merge that follows.
    let mut collected: Vec<MethodInfo> = Vec::new();
    let mut chain_interfaces: Vec<ClassId> = Vec::new();
    let mut current = Some(host);
    while let Some(id) = current {
        if Some(id) == object_id {
            break;
        }
        let def = machine.class(id);
        for (i, m) in def.methods.iter().enumerate() {
            if admits(m, &def, has_package_access, &host_package) {
                collected.push(MethodInfo::of(&def, i, m));
            }
        }
        chain_interfaces.extend(def.interface_ids.iter().copied());
        current = def.super_id;
    }

    // Overridable top-type methods: the fixed set, excluding terminal and
    // finalisation-oriented members.
    if let Some(obj) = object_id {
        let def = machine.class(obj);
        for (i, m) in def.methods.iter().enumerate() {
            if m.modifiers.is_final()
                || m.modifiers.is_static()
                || m.name == "finalize"
                || !(m.modifiers.is_public() || m.modifiers.is_protected())
            {
                continue;
            }
            collected.push(MethodInfo::of(&def, i, m));
        }
    }

    // Merged interface closure, sub before super even across diamonds.
    for iface in merge_interfaces(machine, chain_interfaces) {
        let def = machine.class(iface);
        for (i, m) in def.methods.iter().enumerate() {
            if admits(m, &def, has_package_access, &host_package) {
                collected.push(MethodInfo::of(&def, i, m));
            }
        }
    }

    // Partition by (name, arity). A first arrival stays a single; a second
    // inflates the slot into a shared partition.
    let mut order: Vec<(String, usize)> = Vec::new();
    let mut partitions: FxHashMap<(String, usize), Partition> = FxHashMap::default();
    for info in collected {
        let key = (info.name.clone(), info.params.len());
        match partitions.entry(key.clone()) {
            Entry::Vacant(slot) => {
                order.push(key);
                slot.insert(Partition::One(info));
            }
            Entry::Occupied(mut slot) => slot.get_mut().push(info),
        }
    }

    let mut enhanceable = Vec::new();
    for key in &order {
        match partitions.remove(key) {
            Some(Partition::One(info)) => {
                resolve_partition(machine, host, std::slice::from_ref(&info), &mut enhanceable)?;
            }
            Some(Partition::Many(infos)) => {
                resolve_partition(machine, host, &infos, &mut enhanceable)?;
            }
            None => {}
        }
    }

    Ok(EnhancerTarget { host, enhanceable })
}

/// Visible constructors of the host under the active regime.
pub fn visible_ctors(machine: &Machine, host: ClassId, has_package_access: bool) -> Vec<CtorInfo> {
    let def = machine.class(host);
    let host_package = (def.package().to_string(), def.loader);
    def.ctors
        .iter()
        .enumerate()
        .filter(|(_, c)| visible(c.modifiers, has_package_access, &host_package, &def))
        .map(|(i, c)| CtorInfo {
            index: i as u16,
            params: c.params.clone(),
            modifiers: c.modifiers,
        })
        .collect()
}

enum Partition {
    One(MethodInfo),
    Many(Vec<MethodInfo>),
}

impl Partition {
    fn push(&mut self, info: MethodInfo) {
        match self {
            Partition::One(first) => {
                *self = Partition::Many(vec![first.clone(), info]);
            }
            Partition::Many(list) => list.push(info),
        }
    }
}

pub(crate) fn visible(
    modifiers: Modifiers,
    has_package_access: bool,
    host_package: &(String, LoaderId),
    declaring: &ClassDef,
) -> bool {
    if modifiers.is_private() {
        return false;
    }
    if modifiers.is_public() || modifiers.is_protected() {
        return true;
    }
    // Package-private: only under a package-access definer, and only when
    // the declaring class shares the host's runtime package.
    has_package_access
        && declaring.package() == host_package.0
        && declaring.loader == host_package.1
}

fn admits(
    method: &MethodDef,
    declaring: &ClassDef,
    has_package_access: bool,
    host_package: &(String, LoaderId),
) -> bool {
    if method.modifiers.is_static() {
        return false;
    }
    if method.modifiers.is_synthetic() && !method.modifiers.is_bridge() {
        return false;
    }
    // Finalisation is terminal: never resolved, wherever declared.
    if method.name == "finalize" && method.params.is_empty() {
        return false;
    }
    visible(method.modifiers, has_package_access, host_package, declaring)
}

/// Flatten queued interfaces, keeping every interface before its
/// super-interfaces even across diamond inheritance.
fn merge_interfaces(machine: &Machine, chain: Vec<ClassId>) -> Vec<ClassId> {
    // The chain was gathered host-first; popping must observe the same
    // ordering, so seed the stack reversed.
    let mut stack: Vec<ClassId> = chain.into_iter().rev().collect();
    let mut flat: Vec<ClassId> = Vec::new();
    while let Some(iface) = stack.pop() {
        if flat.contains(&iface) {
            // Already merged, along with its super-interfaces.
            continue;
        }
        match flat
            .iter()
            .position(|existing| interface_extends(machine, *existing, iface))
        {
            // Some existing J extends I: insert I just before J.
            Some(pos) => flat.insert(pos, iface),
            None => flat.push(iface),
        }
        let supers = machine.class(iface).interface_ids.clone();
        for sup in supers.into_iter().rev() {
            stack.push(sup);
        }
    }
    flat
}

/// Whether interface `sub` extends `sup`.
fn interface_extends(machine: &Machine, sub: ClassId, sup: ClassId) -> bool {
    if sub == sup {
        return false;
    }
    let def = machine.class(sub);
    def.interface_ids
        .iter()
        .any(|i| *i == sup || interface_extends(machine, *i, sup))
}

/// Collapse one partition: find leaves per raw-parameter fingerprint, then
/// report, matching bridges to delegates.
fn resolve_partition(
    machine: &Machine,
    host: ClassId,
    candidates: &[MethodInfo],
    out: &mut Vec<Enhanceable>,
) -> VmResult<()> {
    type Fingerprint = Vec<TypeRef>;
    let mut leaf_order: Vec<Fingerprint> = Vec::new();
    let mut leaves: FxHashMap<Fingerprint, MethodInfo> = FxHashMap::default();
    let mut bridge_targets: FxHashMap<Fingerprint, Option<MethodInfo>> = FxHashMap::default();

    for candidate in candidates {
        let fingerprint = candidate.params.clone();
        match leaves.entry(fingerprint.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(candidate.clone());
                leaf_order.push(fingerprint.clone());
                if candidate.modifiers.is_bridge() {
                    bridge_targets.insert(fingerprint, None);
                }
            }
            Entry::Occupied(leaf) => {
                if leaf.get().modifiers.is_bridge() && !candidate.modifiers.is_bridge() {
                    if let Some(slot) = bridge_targets.get_mut(&fingerprint) {
                        if slot.is_none() {
                            *slot = Some(candidate.clone());
                        }
                    }
                }
            }
        }
    }

    for fingerprint in &leaf_order {
        let leaf = &leaves[fingerprint];
        if leaf.modifiers.is_final() {
            // Not enhanceable; any open bridge target is dropped with it.
            continue;
        }
        if !leaf.modifiers.is_bridge() {
            out.push(Enhanceable {
                method: leaf.clone(),
                bridge: None,
            });
            continue;
        }

        let super_target = bridge_targets.get(fingerprint).cloned().flatten();
        if let Some(st) = &super_target {
            if st.modifiers.is_final() {
                continue;
            }
        }

        // Delegate search over the partition's non-bridge candidates. With
        // a recorded super-target, the delegate is the candidate whose raw
        // parameters equal the super-target's host-resolved parameters;
        // without one, the candidate whose host-resolved parameters equal
        // the bridge's raw parameters.
        let mut delegate = None;
        for candidate in candidates {
            if candidate.modifiers.is_bridge() {
                continue;
            }
            let matched = match &super_target {
                None => {
                    let resolved = resolve_parameter_types(machine, host, candidate.id)?;
                    leaf.params == resolved
                }
                Some(st) => {
                    let resolved = resolve_parameter_types(machine, host, st.id)?;
                    candidate.params == resolved
                }
            };
            if matched {
                delegate = Some(candidate.clone());
                break;
            }
        }

        // Point-cut matchers ignore synthetic methods, so a concrete
        // class-declared super-target with identical raw parameters is
        // reported in the bridge's place.
        let reported = match &super_target {
            Some(st)
                if !machine.class(st.id.class).modifiers.is_interface()
                    && !st.modifiers.is_abstract()
                    && st.params == leaf.params =>
            {
                st.clone()
            }
            _ => leaf.clone(),
        };
        if reported.modifiers.is_final() {
            continue;
        }
        out.push(Enhanceable {
            method: reported,
            bridge: delegate.map(|d| BridgePlan {
                bridge: leaf.clone(),
                delegate: d,
            }),
        });
    }
    Ok(())
}
