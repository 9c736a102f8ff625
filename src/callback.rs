//! Host callbacks
//!
//! A host function attached to a context is reachable from script under its
//! name. Calls are dispatched through a trampoline that converts arguments,
//! runs the host function and converts the result back. A host failure never
//! unwinds through the engine: errors and panics are recorded in the
//! context's [`FailureLog`] and re-thrown into script as an `Error` tagged
//! with the record id in a table script cannot reach, so the original cause
//! can be recovered if the evaluation ultimately fails.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use indexmap::IndexMap;
use parking_lot::Mutex;
use rquickjs::function::Rest;
use rquickjs::{Ctx, Exception, Function, Object, Value as JsValue};

use crate::bridge::Marshaller;
use crate::engine::{FailureTags, SharedHandles};
use crate::error::{Error, HostCause};
use crate::value::Value;

/// Error type host functions return
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A host function callable from script.
///
/// Implemented for every `Fn(&[Value]) -> Result<Value, BoxError>` closure
/// that is `Send + Sync`, so most callers never name this trait.
pub trait HostFunction: Send + Sync + 'static {
    fn call(&self, args: &[Value]) -> Result<Value, BoxError>;
}

impl<F> HostFunction for F
where
    F: Fn(&[Value]) -> Result<Value, BoxError> + Send + Sync + 'static,
{
    #[inline]
    fn call(&self, args: &[Value]) -> Result<Value, BoxError> {
        self(args)
    }
}

/// A host function panicked while handling a call from script
#[derive(Debug, Clone, thiserror::Error)]
#[error("host callback panicked: {message}")]
pub struct CallbackPanic {
    message: String,
}

impl CallbackPanic {
    fn from_payload(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        CallbackPanic { message }
    }

    /// The panic message
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// A named host function
#[derive(Clone)]
pub(crate) struct CallbackBinding {
    pub name: String,
    pub function: Arc<dyn HostFunction>,
}

impl CallbackBinding {
    /// Bind `function` under `name` (`plain` or `dotted.path`)
    pub fn new(name: &str, function: Arc<dyn HostFunction>) -> Result<Self, Error> {
        if name.is_empty() || name.split('.').any(str::is_empty) {
            return Err(Error::conversion(format!(
                "invalid callback name '{name}'"
            )));
        }
        Ok(CallbackBinding {
            name: name.to_string(),
            function,
        })
    }
}

impl std::fmt::Debug for CallbackBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackBinding")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Host failures raised during the current call, keyed by record id
#[derive(Debug, Default)]
pub(crate) struct FailureLog {
    next: AtomicU64,
    records: Mutex<HashMap<u64, (String, HostCause)>>,
}

impl FailureLog {
    /// Record a failure of `callback`; returns the id to tag the thrown error with
    pub fn record(&self, callback: &str, cause: HostCause) -> u64 {
        let id = self.next.fetch_add(1, Ordering::Relaxed) + 1;
        self.records.lock().insert(id, (callback.to_string(), cause));
        id
    }

    pub fn take(&self, id: u64) -> Option<(String, HostCause)> {
        self.records.lock().remove(&id)
    }

    /// Forget failures that script caught and never rethrew
    pub fn clear(&self) {
        self.records.lock().clear();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }
}

/// Attached callbacks of one context, in attach order
#[derive(Debug, Default)]
pub(crate) struct CallbackRegistry {
    bindings: IndexMap<String, CallbackBinding>,
    failures: Arc<FailureLog>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        CallbackRegistry::default()
    }

    /// Register `binding`, replacing any binding with the same name
    pub fn insert(&mut self, binding: CallbackBinding) -> Option<CallbackBinding> {
        self.bindings.insert(binding.name.clone(), binding)
    }

    pub fn names(&self) -> Vec<String> {
        self.bindings.keys().cloned().collect()
    }

    pub fn failures(&self) -> &Arc<FailureLog> {
        &self.failures
    }
}

/// Define `binding` as a function in the engine, creating intermediate
/// objects for dotted names.
pub(crate) fn install<'js>(
    ctx: &Ctx<'js>,
    binding: &CallbackBinding,
    failures: Arc<FailureLog>,
    handles: SharedHandles,
    context: u64,
    depth: usize,
) -> rquickjs::Result<()> {
    let mut segments: Vec<&str> = binding.name.split('.').collect();
    let leaf = segments.pop().unwrap_or_default();

    let mut target = ctx.globals();
    for segment in segments {
        let existing: JsValue<'js> = target.get(segment)?;
        target = match existing.into_object() {
            Some(object) => object,
            None => {
                let object = Object::new(ctx.clone())?;
                target.set(segment, object.clone())?;
                object
            }
        };
    }

    let bound = binding.clone();
    let function = Function::new(
        ctx.clone(),
        move |ctx: Ctx<'js>, args: Rest<JsValue<'js>>| {
            trampoline(&ctx, &bound, &failures, &handles, context, depth, args.0)
        },
    )?
    .with_name(leaf)?;
    target.set(leaf, function)
}

fn trampoline<'js>(
    ctx: &Ctx<'js>,
    binding: &CallbackBinding,
    failures: &FailureLog,
    handles: &SharedHandles,
    context: u64,
    depth: usize,
    args: Vec<JsValue<'js>>,
) -> rquickjs::Result<JsValue<'js>> {
    let mut marshaller = {
        let guard = handles.lock();
        let Some(handles) = guard.as_ref() else {
            return Err(Exception::throw_internal(ctx, &Error::disposed().to_string()));
        };
        Marshaller::new(ctx.clone(), handles, context, depth)?
    };
    let tags = marshaller.failure_tags().clone();

    let mut host_args = Vec::with_capacity(args.len());
    for arg in &args {
        match marshaller.to_host(arg) {
            Ok(value) => host_args.push(value),
            Err(err) => return raise(ctx, failures, &tags, &binding.name, Arc::new(err)),
        }
    }

    tracing::trace!(callback = %binding.name, argc = host_args.len(), "host callback");
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| binding.function.call(&host_args)));
    let cause: HostCause = match outcome {
        Ok(Ok(value)) => {
            return match marshaller.to_js(&value) {
                Ok(converted) => Ok(converted),
                Err(err) => raise(ctx, failures, &tags, &binding.name, Arc::new(err)),
            };
        }
        Ok(Err(err)) => Arc::from(err),
        Err(payload) => Arc::new(CallbackPanic::from_payload(payload)),
    };
    raise(ctx, failures, &tags, &binding.name, cause)
}

/// Record `cause` and throw a tagged `Error` into script
fn raise<'js>(
    ctx: &Ctx<'js>,
    failures: &FailureLog,
    tags: &FailureTags<'js>,
    callback: &str,
    cause: HostCause,
) -> rquickjs::Result<JsValue<'js>> {
    tracing::debug!(callback, error = %cause, "host callback failed");
    let message = format!("host callback '{callback}' failed: {cause}");
    let id = failures.record(callback, cause);
    let exception = Exception::from_message(ctx.clone(), &message)?.into_object();
    tags.tag(&exception, id)?;
    Err(ctx.throw(exception.into_value()))
}
