//! Host-side interception callbacks
//!
//! A [`Handler`] is the callback an embedder installs on an enhanced
//! instance. Generated method stubs route every intercepted call through
//! `invoke(receiver, method, args)`, passing the enhanced instance, a null
//! method slot (the platform reserves the slot for collaborators; the glue
//! never fills it), and the boxed arguments in declaration order.

use crate::machine::Machine;
use crate::value::Value;
use crate::VmError;
use std::sync::Arc;

/// An interception callback installed on enhanced instances.
pub trait Handler: Send + Sync {
    /// Intercept one call.
    ///
    /// `receiver` is the enhanced instance, `method` is the (always null)
    /// method slot, `args` are the call arguments with primitives boxed.
    /// The returned value is unboxed or cast back to the intercepted
    /// method's declared return type by the generated stub. Errors
    /// propagate to the original caller unchanged.
    fn invoke(
        &self,
        machine: &Machine,
        receiver: Value,
        method: Value,
        args: &[Value],
    ) -> Result<Value, VmError>;
}

impl<F> Handler for F
where
    F: Fn(&Machine, Value, Value, &[Value]) -> Result<Value, VmError> + Send + Sync,
{
    fn invoke(
        &self,
        machine: &Machine,
        receiver: Value,
        method: Value,
        args: &[Value],
    ) -> Result<Value, VmError> {
        self(machine, receiver, method, args)
    }
}

/// Shared handler reference.
pub type HandlerRef = Arc<dyn Handler>;

impl std::fmt::Debug for dyn Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Handler")
    }
}
