//! Transactional calls: memoize a participant's method per argument signature.
//!
//! ```ignore
//! let sum = Transaction::of(&agent, "add")
//!     .arg(&30)
//!     .arg("x")
//!     .call(|| agent.add(30, "x"))?;
//! ```
//!
//! Setters and other reentrant methods are simply not wrapped, so they never
//! reach the trace.

use crate::error::{ControlError, ControlResult};
use crate::participant::Participant;
use crate::registry::Control;
use crate::simulation::{Lookup, Simulation};
use encore_core::{CallArgs, CallKey, SimulationId, call_key, to_canonical};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error};

/// Builder for one intercepted call
pub struct Transaction {
    simulation: Option<Arc<Simulation>>,
    method: String,
    args: CallArgs,
}

impl Transaction {
    /// Intercept `method` of a participant.
    ///
    /// The method name is qualified with the participant's type label so that
    /// same-named methods on different types get different keys.
    #[must_use]
    pub fn of(participant: &dyn Participant, method: &str) -> Self {
        Self {
            simulation: participant.binding().simulation(),
            method: qualify(participant.type_label(), method),
            args: CallArgs::new(),
        }
    }

    /// Intercept a call in an explicit simulation; `method` is used verbatim
    #[must_use]
    pub fn within(simulation: &Arc<Simulation>, method: impl Into<String>) -> Self {
        Self {
            simulation: Some(Arc::clone(simulation)),
            method: method.into(),
            args: CallArgs::new(),
        }
    }

    /// Intercept a call in the default simulation of the process-wide context
    #[must_use]
    pub fn current(method: impl Into<String>) -> Self {
        Self {
            simulation: Control::global().current_simulation(&SimulationId::default()),
            method: method.into(),
            args: CallArgs::new(),
        }
    }

    /// Add a positional argument
    #[must_use]
    pub fn arg<T: Serialize + ?Sized>(mut self, value: &T) -> Self {
        self.args.push_arg(value);
        self
    }

    /// Add a keyword argument
    #[must_use]
    pub fn kwarg<T: Serialize + ?Sized>(mut self, name: impl Into<String>, value: &T) -> Self {
        self.args.push_kwarg(name, value);
        self
    }

    /// Replace the arguments
    #[must_use]
    pub fn with_args(mut self, args: CallArgs) -> Self {
        self.args = args;
        self
    }

    /// Qualified method name
    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Simulation the call will be resolved against
    #[must_use]
    pub fn simulation(&self) -> Option<&Arc<Simulation>> {
        self.simulation.as_ref()
    }

    /// Key the call is stored under
    #[must_use]
    pub fn key(&self) -> CallKey {
        call_key(&self.method, &self.args)
    }

    /// Run a fallible call through the cache.
    ///
    /// Replays a stored result when one exists; otherwise runs `f` and records
    /// its `Ok` value. Errors from `f` propagate and nothing is recorded, and
    /// neither is a result that holds NaN or an infinity, since JSON would
    /// replay it as `null`.
    /// Without a simulation, or once it has ended, `f` runs directly.
    ///
    /// # Errors
    ///
    /// Returns the error of `f`, or a [`ControlError`] converted into `E`
    pub fn run<R, E, F>(self, f: F) -> Result<R, E>
    where
        R: Serialize + DeserializeOwned,
        E: From<ControlError>,
        F: FnOnce() -> Result<R, E>,
    {
        let Some(simulation) = self.simulation.as_ref() else {
            return f();
        };

        if nesting::is_active(simulation) {
            simulation.record_bypass();
            debug!(method = %self.method, "Nested transaction runs directly");
            return f();
        }

        let key = self.key();
        match simulation.lookup::<R>(&key, &self.method)? {
            Lookup::Replayed(value) | Lookup::Reused(value) => Ok(value),
            Lookup::Bypass => f(),
            Lookup::Execute(guard) => {
                let result = {
                    let _scope = nesting::enter(simulation);
                    f()?
                };
                if let Some(value) = encode_result(&self.method, &result) {
                    guard.record(value);
                }
                Ok(result)
            }
        }
    }

    /// Run an infallible call through the cache
    ///
    /// # Errors
    ///
    /// Returns error if the simulation rejects the call
    pub fn call<R, F>(self, f: F) -> ControlResult<R>
    where
        R: Serialize + DeserializeOwned,
        F: FnOnce() -> R,
    {
        self.run(|| Ok::<R, ControlError>(f()))
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("method", &self.method)
            .field("args", &self.args)
            .field("simulation", &self.simulation.as_ref().map(|s| s.id().clone()))
            .finish()
    }
}

fn encode_result<R: Serialize>(method: &str, result: &R) -> Option<serde_json::Value> {
    if to_canonical(result).is_ok_and(|tree| tree.has_non_finite()) {
        error!(method, "Result holds a non-finite float; returning it uncached");
        return None;
    }
    match serde_json::to_value(result) {
        Ok(value) => Some(value),
        Err(err) => {
            error!(method, error = %err, "Result cannot be encoded; returning it uncached");
            None
        }
    }
}

fn qualify(type_label: &str, method: &str) -> String {
    if type_label.is_empty() {
        method.to_string()
    } else {
        format!("{}::{}", type_label, method)
    }
}

/// Per-thread stack of simulations with a transaction in progress
mod nesting {
    use crate::simulation::Simulation;
    use encore_core::RunId;
    use std::cell::RefCell;

    thread_local! {
        static ACTIVE: RefCell<Vec<RunId>> = const { RefCell::new(Vec::new()) };
    }

    pub(super) fn is_active(simulation: &Simulation) -> bool {
        let run = simulation.run_id();
        ACTIVE.with(|active| active.borrow().contains(&run))
    }

    pub(super) fn enter(simulation: &Simulation) -> Scope {
        let run = simulation.run_id();
        ACTIVE.with(|active| active.borrow_mut().push(run));
        Scope { run }
    }

    pub(super) struct Scope {
        run: RunId,
    }

    impl Drop for Scope {
        fn drop(&mut self) {
            ACTIVE.with(|active| {
                let mut active = active.borrow_mut();
                if let Some(pos) = active.iter().rposition(|r| *r == self.run) {
                    active.remove(pos);
                }
            });
        }
    }
}
