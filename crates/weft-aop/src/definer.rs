//! Class-definition strategies
//!
//! A [`ClassDefiner`] installs an emitted class image "close to" a host
//! class and advertises two capabilities the rest of the glue layer
//! branches on: whether definitions land in the host's runtime package
//! (package-private enhancement), and whether hosting is anonymous (the
//! proxy is not name-addressable, so self-casts must go through the host's
//! name).
//!
//! Strategy order: the configured child-loader mode wins outright;
//! otherwise the hidden nest-mate facility is probed, then the legacy
//! anonymous facility, then a per-loader access shim; with nothing viable
//! every definition fails. A strategy that fails its probe demotes to the
//! next; a failure inside `define` is surfaced to the caller.

use crate::emit::ClassAsm;
use crate::error::{AopError, AopResult};
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use weft_vm::builtins;
use weft_vm::{ClassId, DefineError, LoaderId, Machine, Modifiers};

/// The configuration knob selecting the definition strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DefinerPolicy {
    /// Always define into a child loader of the host's loader
    ChildLoader,
    /// Prefer the hidden nest-mate facility, fall back to a child loader
    #[default]
    TryUnsafeOrChild,
    /// Prefer the legacy anonymous facility
    TryUnsafeAnonymous,
    /// Disable class definition entirely
    Off,
}

/// Installs class images relative to a host class.
pub trait ClassDefiner: Send + Sync {
    /// Install `bytes` as a class visible from `host`.
    fn define(&self, machine: &Machine, host: ClassId, bytes: &[u8])
        -> Result<ClassId, DefineError>;

    /// Whether definitions share the host's runtime package.
    fn has_package_access(&self) -> bool;

    /// Whether the new class is hosted anonymously (not name-addressable).
    fn is_anonymous_host(&self) -> bool;
}

static PROBE_SEQ: AtomicUsize = AtomicUsize::new(0);

/// Select a definer for the policy, probing facilities in strategy order.
pub fn select_definer(
    machine: &Machine,
    policy: DefinerPolicy,
) -> AopResult<Arc<dyn ClassDefiner>> {
    match policy {
        DefinerPolicy::Off => Err(AopError::ClassDefiningUnavailable),
        DefinerPolicy::ChildLoader => {
            log::debug!("class definer bound: child loader");
            Ok(Arc::new(ChildLoaderDefiner))
        }
        DefinerPolicy::TryUnsafeOrChild => {
            if probe(machine, &HiddenDefiner) {
                log::debug!("class definer bound: hidden nest-mate");
                Ok(Arc::new(HiddenDefiner))
            } else {
                log::debug!("class definer bound: child loader (hidden probe failed)");
                Ok(Arc::new(ChildLoaderDefiner))
            }
        }
        DefinerPolicy::TryUnsafeAnonymous => {
            if probe(machine, &AnonymousDefiner) {
                log::debug!("class definer bound: legacy anonymous");
                return Ok(Arc::new(AnonymousDefiner));
            }
            if probe(machine, &HiddenDefiner) {
                log::debug!("class definer bound: hidden nest-mate (anonymous probe failed)");
                return Ok(Arc::new(HiddenDefiner));
            }
            log::debug!("class definer bound: access shim (unsafe probes failed)");
            Ok(Arc::new(AccessShimDefiner::default()))
        }
    }
}

/// Try defining a trivial throwaway image against the top type.
fn probe(machine: &Machine, definer: &dyn ClassDefiner) -> bool {
    let Some(object) = machine.find_class(machine.boot_loader(), builtins::OBJECT) else {
        return false;
    };
    let seq = PROBE_SEQ.fetch_add(1, Ordering::Relaxed);
    let probe_name = format!("weft.probe.Probe$${seq:x}");
    let image = ClassAsm::new(&probe_name, builtins::OBJECT, Modifiers::PUBLIC).finish();
    definer.define(machine, object, &image).is_ok()
}

/// Strategy 1: a cached child loader per host loader. Definitions land in
/// a different runtime package, so package-private members stay out of
/// reach.
pub struct ChildLoaderDefiner;

impl ClassDefiner for ChildLoaderDefiner {
    fn define(
        &self,
        machine: &Machine,
        host: ClassId,
        bytes: &[u8],
    ) -> Result<ClassId, DefineError> {
        machine.define_child(host, bytes)
    }

    fn has_package_access(&self) -> bool {
        false
    }

    fn is_anonymous_host(&self) -> bool {
        false
    }
}

/// Strategy 2: hidden class with nest-mate linkage, sharing the host's
/// loader and access privileges.
pub struct HiddenDefiner;

impl ClassDefiner for HiddenDefiner {
    fn define(
        &self,
        machine: &Machine,
        host: ClassId,
        bytes: &[u8],
    ) -> Result<ClassId, DefineError> {
        machine.define_hidden(host, bytes)
    }

    fn has_package_access(&self) -> bool {
        true
    }

    fn is_anonymous_host(&self) -> bool {
        false
    }
}

/// Strategy 3: the legacy anonymous facility. Anonymous hosting makes the
/// proxy's own name invalid as a cast target.
pub struct AnonymousDefiner;

impl ClassDefiner for AnonymousDefiner {
    fn define(
        &self,
        machine: &Machine,
        host: ClassId,
        bytes: &[u8],
    ) -> Result<ClassId, DefineError> {
        machine.define_anonymous(host, bytes)
    }

    fn has_package_access(&self) -> bool {
        true
    }

    fn is_anonymous_host(&self) -> bool {
        true
    }
}

/// Strategy 4: forward through the host loader's exposed define hook,
/// generating (and caching) one access shim per loader.
#[derive(Default)]
pub struct AccessShimDefiner {
    shims: DashMap<LoaderId, ()>,
}

impl ClassDefiner for AccessShimDefiner {
    fn define(
        &self,
        machine: &Machine,
        host: ClassId,
        bytes: &[u8],
    ) -> Result<ClassId, DefineError> {
        let loader = machine.class(host).loader;
        if !machine.loader_exposes_define(loader) {
            return Err(DefineError::CannotDefine(
                "host loader does not expose a define hook".to_string(),
            ));
        }
        self.shims.entry(loader).or_insert_with(|| {
            log::debug!("generated access shim for loader {loader:?}");
        });
        machine.define_named(loader, bytes)
    }

    fn has_package_access(&self) -> bool {
        true
    }

    fn is_anonymous_host(&self) -> bool {
        false
    }
}
