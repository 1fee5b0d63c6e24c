//! Weft Bytecode Glue
//!
//! Runtime bytecode generation against the Weft managed platform:
//! - **Signature trie**: allocation-free signature-to-index lookup (`trie`)
//! - **Method resolver**: virtual-resolution semantics with bridge/delegate
//!   pairing (`resolve`)
//! - **Emitters**: constant-pool writer and two-pass method assembler
//!   (`emit`), fast-class (`fastclass`) and enhancer (`enhancer`) glue
//! - **Class definers**: installation strategies with capability flags
//!   (`definer`)
//! - **Driver**: caching orchestration from host class to linked invoker
//!   functions (`enhance`)
//!
//! # Example
//!
//! ```rust,ignore
//! use weft_aop::{Aop, BitSet, DefinerPolicy};
//!
//! let aop = Aop::new(machine, DefinerPolicy::TryUnsafeOrChild);
//! let builder = aop.enhancer_builder(host)?;
//! let add = builder.index_of("add").unwrap();
//! let enhanced = builder.build(&BitSet::of(&[add]))?;
//! let instance = enhanced.construct(&[], vec![handler], &[])?;
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod bits;
pub mod definer;
pub mod emit;
pub mod enhance;
mod enhancer;
pub mod error;
mod fastclass;
mod glue;
pub mod resolve;
pub mod signature;
pub mod trie;

pub use bits::BitSet;
pub use definer::{ClassDefiner, DefinerPolicy};
pub use enhance::{Aop, EnhancedFactory, EnhancerBuilder, FastClass, Invoker};
pub use error::{AopError, AopResult, GluePhase, NotEnhanceableReason};
pub use fastclass::MemberEntry;
pub use resolve::{BridgePlan, CtorInfo, Enhanceable, EnhancerTarget, MethodInfo};
pub use signature::{ctor_signature, signature};
pub use trie::{SignatureIndexer, MAX_ROWS_PER_TRIE};
