//! Glue driver: caching and orchestration
//!
//! The [`Aop`] context binds a class-definition strategy once, then builds
//! and caches fast-classes and enhancers per host. Enhancer builds are
//! keyed by the bit-set of selected enhanceable indices; concurrent
//! requests with the same key block on the per-host lock and receive the
//! same linked factory. Failed builds never enter the cache.

use crate::bits::BitSet;
use crate::definer::{select_definer, ClassDefiner, DefinerPolicy};
use crate::enhancer::{self, EnhancerPlan, TableEntry};
use crate::error::{AopError, AopResult, GluePhase, NotEnhanceableReason};
use crate::fastclass::{self, MemberEntry};
use crate::resolve::{self, CtorInfo, Enhanceable, EnhancerTarget};
use crate::signature;
use crate::trie::SignatureIndexer;
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use weft_vm::{
    ClassDef, ClassId, DefineError, HandlerRef, Machine, Payload, RawHandle, TypeRef, Value,
    VmError,
};

static PROXY_SEQ: AtomicUsize = AtomicUsize::new(0);

/// A linked invoker: `(context, args) -> result`.
pub type Invoker = Arc<dyn Fn(Value, &[Value]) -> Result<Value, VmError> + Send + Sync>;

/// Context owning the definer binding and the per-host glue caches.
pub struct Aop {
    machine: Arc<Machine>,
    policy: DefinerPolicy,
    definer: OnceCell<Arc<dyn ClassDefiner>>,
    builders: DashMap<ClassId, HostEntry<EnhancerBuilder>>,
    fastclasses: DashMap<ClassId, HostEntry<FastClass>>,
}

struct HostEntry<T> {
    guard: Weak<ClassDef>,
    value: Arc<T>,
}

impl Aop {
    /// Create a context over a machine with the given definition policy.
    pub fn new(machine: Arc<Machine>, policy: DefinerPolicy) -> Aop {
        Aop {
            machine,
            policy,
            definer: OnceCell::new(),
            builders: DashMap::new(),
            fastclasses: DashMap::new(),
        }
    }

    /// The machine this context builds into.
    pub fn machine(&self) -> &Arc<Machine> {
        &self.machine
    }

    /// The bound definer; strategy selection happens once per context.
    pub fn definer(&self) -> AopResult<Arc<dyn ClassDefiner>> {
        self.definer
            .get_or_try_init(|| select_definer(&self.machine, self.policy))
            .cloned()
    }

    /// Build (or fetch) the fast-class for a host.
    pub fn fast_class(&self, host: ClassId) -> AopResult<Arc<FastClass>> {
        if let Some(entry) = self.fastclasses.get(&host) {
            if entry.guard.upgrade().is_some() {
                return Ok(entry.value.clone());
            }
        }
        let fast = Arc::new(self.build_fast_class(host)?);
        let host_def = self.machine.class(host);
        self.fastclasses.retain(|_, e| e.guard.upgrade().is_some());
        self.fastclasses.insert(
            host,
            HostEntry {
                guard: Arc::downgrade(&host_def),
                value: fast.clone(),
            },
        );
        Ok(fast)
    }

    fn build_fast_class(&self, host: ClassId) -> AopResult<FastClass> {
        let definer = self.definer()?;
        let host_def = self.machine.class(host);
        let seq = PROXY_SEQ.fetch_add(1, Ordering::Relaxed);
        let proxy_name = format!("{}$$WeftFastClass$${seq:x}", host_def.name);

        let mut members =
            fastclass::collect_members(&self.machine, host, definer.has_package_access());
        members.sort_by_key(MemberEntry::signature);
        let signatures: Vec<String> = members.iter().map(MemberEntry::signature).collect();
        let trie = SignatureIndexer::build(&signatures);

        let bytes = fastclass::generate(&host_def, &proxy_name, &members);
        let glue = definer
            .define(&self.machine, host, &bytes)
            .map_err(|e| define_failed(e, &host_def.name, &proxy_name))?;
        let table = self
            .machine
            .read_static(glue, "WEFT$INVOKERS")
            .filter(|v| !v.is_null())
            .ok_or_else(|| AopError::GlueGenerationFailed {
                phase: GluePhase::Verify,
                host: host_def.name.clone(),
                proxy: proxy_name.clone(),
                source: Box::new(VmError::RuntimeError(
                    "invoker table field not initialised".to_string(),
                )),
            })?;
        log::debug!(
            "fast-class {} built for {} ({} members)",
            proxy_name,
            host_def.name,
            members.len()
        );
        Ok(FastClass {
            machine: self.machine.clone(),
            trie,
            signatures,
            table,
            proxy: glue,
        })
    }

    /// Build (or fetch) the enhancer builder for a host.
    pub fn enhancer_builder(&self, host: ClassId) -> AopResult<Arc<EnhancerBuilder>> {
        if let Some(entry) = self.builders.get(&host) {
            if entry.guard.upgrade().is_some() {
                return Ok(entry.value.clone());
            }
        }

        let definer = self.definer()?;
        let host_def = self.machine.class(host);
        if host_def.modifiers.is_final() {
            return Err(AopError::HostNotEnhanceable {
                host: host_def.name.clone(),
                reason: NotEnhanceableReason::Final,
            });
        }
        if host_def.modifiers.is_interface() || !host_def.named {
            return Err(AopError::HostNotEnhanceable {
                host: host_def.name.clone(),
                reason: NotEnhanceableReason::Forbidden,
            });
        }
        let ctors = resolve::visible_ctors(&self.machine, host, definer.has_package_access());
        if ctors.is_empty() {
            return Err(AopError::HostNotEnhanceable {
                host: host_def.name.clone(),
                reason: NotEnhanceableReason::Forbidden,
            });
        }

        // Resolver anomalies surface verbatim.
        let target =
            resolve::resolve_enhanceable(&self.machine, host, definer.has_package_access())?;

        let builder = Arc::new(EnhancerBuilder {
            machine: self.machine.clone(),
            definer,
            host,
            target,
            ctors,
            builds: Mutex::new(FxHashMap::default()),
        });
        self.builders.retain(|_, e| e.guard.upgrade().is_some());
        self.builders.insert(
            host,
            HostEntry {
                guard: Arc::downgrade(&host_def),
                value: builder.clone(),
            },
        );
        Ok(builder)
    }
}

fn define_failed(e: DefineError, host: &str, proxy: &str) -> AopError {
    if matches!(
        e,
        DefineError::Malformed(_) | DefineError::VerifierRejected(_)
    ) {
        AopError::GlueGenerationFailed {
            phase: GluePhase::Verify,
            host: host.to_string(),
            proxy: proxy.to_string(),
            source: Box::new(e),
        }
    } else {
        AopError::ClassDefiningFailed(e)
    }
}

/// Per-host enhancer factory with a build cache keyed by selection.
pub struct EnhancerBuilder {
    machine: Arc<Machine>,
    definer: Arc<dyn ClassDefiner>,
    host: ClassId,
    target: EnhancerTarget,
    ctors: Vec<CtorInfo>,
    builds: Mutex<FxHashMap<BitSet, EnhancedFactory>>,
}

impl EnhancerBuilder {
    /// The flat enhanceable-method array, in resolution order.
    pub fn enhanceable_methods(&self) -> &[Enhanceable] {
        &self.target.enhanceable
    }

    /// The resolution snapshot.
    pub fn target(&self) -> &EnhancerTarget {
        &self.target
    }

    /// Index of the first enhanceable method with the given name, for
    /// selection convenience.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.target
            .enhanceable
            .iter()
            .position(|e| e.method.name == name)
    }

    /// Build (or fetch) the enhancer for a selection of enhanceable
    /// indices. Builds run under the per-host lock; identical concurrent
    /// requests observe a single class definition.
    pub fn build(&self, picked: &BitSet) -> AopResult<EnhancedFactory> {
        let mut builds = self.builds.lock();
        if let Some(found) = builds.get(picked) {
            return Ok(found.clone());
        }
        let factory = self.build_uncached(picked)?;
        builds.insert(picked.clone(), factory.clone());
        Ok(factory)
    }

    fn build_uncached(&self, picked: &BitSet) -> AopResult<EnhancedFactory> {
        let host_def = self.machine.class(self.host);
        let seq = PROXY_SEQ.fetch_add(1, Ordering::Relaxed);
        let proxy_name = format!("{}$$WeftEnhancer$${seq:x}", host_def.name);

        // Selected methods, handler slots assigned by signature order.
        let mut selected: Vec<&Enhanceable> = picked
            .iter()
            .filter_map(|i| self.target.enhanceable.get(i))
            .collect();
        selected.sort_by_key(|e| signature::signature(&e.method.name, &e.method.params));
        let selected: Vec<_> = selected
            .into_iter()
            .enumerate()
            .map(|(slot, e)| (e.method.clone(), slot))
            .collect();

        // Trampoline table: selected super-calls plus all constructors,
        // sorted together by signature.
        let mut table: Vec<(String, TableEntry)> = selected
            .iter()
            .map(|(m, _)| {
                (
                    signature::signature(&m.name, &m.params),
                    TableEntry::Super(m.clone()),
                )
            })
            .collect();
        for ctor in &self.ctors {
            table.push((
                signature::ctor_signature(&ctor.params),
                TableEntry::Construct(ctor.params.clone()),
            ));
        }
        table.sort_by(|a, b| a.0.cmp(&b.0));
        let signatures: Vec<String> = table.iter().map(|(s, _)| s.clone()).collect();
        let entries: Vec<TableEntry> = table.into_iter().map(|(_, e)| e).collect();
        let trie = SignatureIndexer::build(&signatures);

        let handler_slots: Vec<(String, usize)> = selected
            .iter()
            .map(|(m, slot)| (signature::signature(&m.name, &m.params), *slot))
            .collect();

        let plan = EnhancerPlan {
            host: &host_def,
            proxy_name: proxy_name.clone(),
            ctors: &self.ctors,
            selected,
            bridges: self.target.bridge_delegates().cloned().collect(),
            table: entries,
            anonymous: self.definer.is_anonymous_host(),
        };
        let bytes = enhancer::generate(&plan);

        let glue = self
            .definer
            .define(&self.machine, self.host, &bytes)
            .map_err(|e| define_failed(e, &host_def.name, &proxy_name))?;

        // Read the published invoker table; its payload decides the shape.
        let raw = self
            .machine
            .read_static(glue, "WEFT$INVOKERS")
            .filter(|v| !v.is_null())
            .ok_or_else(|| AopError::GlueGenerationFailed {
                phase: GluePhase::Verify,
                host: host_def.name.clone(),
                proxy: proxy_name.clone(),
                source: Box::new(VmError::RuntimeError(
                    "invoker table field not initialised".to_string(),
                )),
            })?;
        let shape = self
            .machine
            .with_payload(raw, |p| match p {
                Payload::Handle(h) => Some(TableShape::Direct(*h)),
                Payload::Table(_) => Some(TableShape::Indexed(raw)),
                _ => None,
            })
            .flatten()
            .ok_or_else(|| AopError::GlueGenerationFailed {
                phase: GluePhase::Verify,
                host: host_def.name.clone(),
                proxy: proxy_name.clone(),
                source: Box::new(VmError::TypeError(
                    "unexpected invoker table shape".to_string(),
                )),
            })?;
        log::debug!(
            "enhancer {} built for {} ({} selected)",
            proxy_name,
            host_def.name,
            picked.len()
        );

        Ok(EnhancedFactory {
            inner: Arc::new(FactoryInner {
                machine: self.machine.clone(),
                trie,
                signatures,
                handler_slots,
                shape,
                proxy: glue,
                image: bytes,
            }),
        })
    }
}

/// The two invoker-table shapes, decided per build by definer capability.
enum TableShape {
    /// The trampoline handle itself: `(int, Object, Object[]) -> Object`
    Direct(RawHandle),
    /// Lambda-factory product: `int -> BiFunction`
    Indexed(Value),
}

struct FactoryInner {
    machine: Arc<Machine>,
    trie: SignatureIndexer,
    signatures: Vec<String>,
    handler_slots: Vec<(String, usize)>,
    shape: TableShape,
    proxy: ClassId,
    image: Vec<u8>,
}

/// A linked enhancer: maps member signatures to invokers.
///
/// Method signatures invoke the host's original implementation through the
/// trampoline (the genuine super-call); constructor signatures construct
/// the enhanced class, taking the `Handler[]` as leading argument.
#[derive(Clone)]
pub struct EnhancedFactory {
    inner: Arc<FactoryInner>,
}

impl EnhancedFactory {
    /// The enhanced (proxy) class.
    pub fn proxy_class(&self) -> ClassId {
        self.inner.proxy
    }

    /// The emitted class image, for diagnostics.
    pub fn image(&self) -> &[u8] {
        &self.inner.image
    }

    /// Signatures known to this factory, in table order.
    pub fn signatures(&self) -> &[String] {
        &self.inner.signatures
    }

    /// Handler-array slot of a selected method signature.
    pub fn handler_slot(&self, sig: &str) -> Option<usize> {
        self.inner
            .handler_slots
            .iter()
            .find(|(s, _)| s == sig)
            .map(|(_, slot)| *slot)
    }

    /// Linked invoker for a known signature.
    pub fn invoker(&self, sig: &str) -> Option<Invoker> {
        let idx = self.inner.trie.apply(sig);
        if self.inner.signatures.get(idx).map(String::as_str) != Some(sig) {
            return None;
        }
        let inner = self.inner.clone();
        match &self.inner.shape {
            TableShape::Direct(handle) => {
                let handle = *handle;
                Some(Arc::new(move |ctx, args| {
                    let packed = inner.machine.new_array(TypeRef::top(), args.to_vec());
                    inner.machine.invoke_by_handle(
                        handle,
                        &[Value::Int(idx as i32), ctx, packed],
                    )
                }))
            }
            TableShape::Indexed(table) => {
                let bound = self.inner.machine.apply_table(*table, idx as i32).ok()?;
                Some(Arc::new(move |ctx, args| {
                    inner.machine.apply_bifunction(bound, ctx, args)
                }))
            }
        }
    }

    /// Construct an enhanced instance through a host constructor.
    pub fn construct(
        &self,
        ctor_params: &[TypeRef],
        handlers: Vec<HandlerRef>,
        args: &[Value],
    ) -> AopResult<Value> {
        let sig = signature::ctor_signature(ctor_params);
        let invoker = self
            .invoker(&sig)
            .ok_or_else(|| {
                AopError::Platform(VmError::NoSuchMethod {
                    class: format!("proxy #{}", self.inner.proxy.0),
                    name: sig.clone(),
                })
            })?;
        let handler_array = self.inner.machine.handler_array(handlers);
        let mut full = vec![handler_array];
        full.extend_from_slice(args);
        invoker(Value::Null, &full).map_err(AopError::Platform)
    }
}

/// A linked fast-class: maps member signatures to direct invokers.
pub struct FastClass {
    machine: Arc<Machine>,
    trie: SignatureIndexer,
    signatures: Vec<String>,
    table: Value,
    proxy: ClassId,
}

impl FastClass {
    /// The glue class backing this fast-class.
    pub fn glue_class(&self) -> ClassId {
        self.proxy
    }

    /// Signatures known to this fast-class, in index order.
    pub fn signatures(&self) -> &[String] {
        &self.signatures
    }

    /// Linked invoker for a known signature: `(context, args) -> result`.
    /// Context is the receiver for instance methods, null for statics and
    /// constructors.
    pub fn invoker(&self, sig: &str) -> Option<Invoker> {
        let idx = self.trie.apply(sig);
        if self.signatures.get(idx).map(String::as_str) != Some(sig) {
            return None;
        }
        let bound = self.machine.apply_table(self.table, idx as i32).ok()?;
        let machine = self.machine.clone();
        Some(Arc::new(move |ctx, args| {
            machine.apply_bifunction(bound, ctx, args)
        }))
    }
}
