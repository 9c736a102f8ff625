//! QuickJS environment
//!
//! An [`Environment`] is one QuickJS runtime with a single full context: its
//! own heap, its own global scope. It is owned by exactly one
//! [`Context`](crate::Context), which guarantees that only one thread touches
//! it at a time. Everything here assumes that guarantee.

pub(crate) mod interrupt;
pub(crate) mod watchdog;

use std::borrow::Cow;
use std::sync::Arc;

use rquickjs::context::EvalOptions;
use rquickjs::function::{Rest, This};
use parking_lot::Mutex;
use rquickjs::{
    Array, Coerced, Ctx, FromJs, Function, Object, Persistent, Runtime, Value as JsValue,
};

use crate::bridge::{Marshaller, RefSlots};
use crate::callback::{self, CallbackBinding, FailureLog};
use crate::context::ContextOptions;
use crate::error::{Error, ErrorKind};
use crate::value::{FunctionRef, Value};

use interrupt::InterruptState;

/// Engine values an environment keeps between scopes: the function
/// reference table and the failure tags.
pub(crate) struct Handles {
    refs: Persistent<Array<'static>>,
    tags: Persistent<Array<'static>>,
    slots: Arc<RefSlots>,
}

// SAFETY: a `Persistent` is a reference-counted pointer into its runtime's
// heap with no synchronization of its own. `Handles` is only cloned, restored
// and dropped with the runtime lock held: inside `rquickjs::Context::with` in
// `Environment::enter` and `Environment::drop`, and in callback trampolines,
// which only run inside such a scope. That lock serializes every access.
unsafe impl Send for Handles {}
unsafe impl Sync for Handles {}

impl Handles {
    /// Must run before any script, while the `WeakMap` builtins are pristine
    pub fn new<'js>(ctx: &Ctx<'js>) -> rquickjs::Result<Handles> {
        let refs = Array::new(ctx.clone())?;
        let tags: Array<'js> =
            ctx.eval("[new WeakMap(), WeakMap.prototype.get, WeakMap.prototype.set]")?;
        Ok(Handles {
            refs: Persistent::save(ctx, refs),
            tags: Persistent::save(ctx, tags),
            slots: Arc::default(),
        })
    }

    /// Bring the reference table and failure tags into `ctx`'s scope
    pub fn restore<'js>(
        &self,
        ctx: &Ctx<'js>,
    ) -> rquickjs::Result<(Array<'js>, FailureTags<'js>)> {
        let tags = self.tags.clone().restore(ctx)?;
        Ok((
            self.refs.clone().restore(ctx)?,
            FailureTags {
                map: tags.get(0)?,
                get: tags.get(1)?,
                set: tags.get(2)?,
            },
        ))
    }

    pub fn slots(&self) -> &Arc<RefSlots> {
        &self.slots
    }
}

/// Associates errors raised for failed host callbacks with their
/// [`FailureLog`] record id.
///
/// The ids live in a `WeakMap` that no script can reach, read and written
/// through the builtin methods captured when the environment was created, so
/// script can neither forge a tag nor tamper with the lookup.
#[derive(Clone)]
pub(crate) struct FailureTags<'js> {
    map: Object<'js>,
    get: Function<'js>,
    set: Function<'js>,
}

impl<'js> FailureTags<'js> {
    pub fn tag(&self, error: &Object<'js>, id: u64) -> rquickjs::Result<()> {
        self.set
            .call::<_, JsValue<'js>>((This(self.map.clone()), error.clone(), id as f64))
            .map(drop)
    }

    pub fn lookup(&self, value: &JsValue<'js>) -> Option<u64> {
        if !value.is_object() {
            return None;
        }
        self.get
            .call::<_, Option<f64>>((This(self.map.clone()), value.clone()))
            .ok()
            .flatten()
            .map(|id| id as u64)
    }
}

/// [`Handles`] shared with callback trampolines. Emptied when the environment
/// drops so no handle outlives the runtime.
pub(crate) type SharedHandles = Arc<Mutex<Option<Handles>>>;

/// A value thrown out of script, captured before it leaves the engine scope
#[derive(Debug, Clone, Default)]
pub(crate) struct Thrown {
    /// `name` of an Error instance (`TypeError`, `SyntaxError`, ...)
    pub name: Option<String>,
    /// `message` of an Error instance, or the stringified thrown value
    pub message: String,
    /// Engine `stack` text
    pub stack: Option<String>,
    /// Id of the host callback failure that raised this error
    pub host_failure: Option<u64>,
}

impl Thrown {
    pub fn from_value<'js>(
        ctx: &Ctx<'js>,
        value: JsValue<'js>,
        tags: &FailureTags<'js>,
    ) -> Thrown {
        if let (Some(exception), Some(object)) = (value.as_exception(), value.as_object()) {
            return Thrown {
                name: object.get::<_, Option<String>>("name").ok().flatten(),
                message: exception.message().unwrap_or_default(),
                stack: exception.stack(),
                host_failure: tags.lookup(&value),
            };
        }
        let message = match Coerced::<String>::from_js(ctx, value) {
            Ok(coerced) => coerced.0,
            Err(err) => format!("(failed to stringify thrown value: {err})"),
        };
        Thrown {
            message,
            ..Thrown::default()
        }
    }

    /// `Name: message`, the way engines print uncaught errors
    pub fn describe(&self) -> String {
        match &self.name {
            Some(name) if self.message.is_empty() => name.clone(),
            Some(name) => format!("{name}: {}", self.message),
            None => self.message.clone(),
        }
    }
}

/// Why a call into the environment did not produce a value
#[derive(Debug)]
pub(crate) enum Failure {
    /// Script threw (or was interrupted, which QuickJS reports as a throw)
    Thrown(Thrown),
    /// The engine failed outside of script execution
    Engine(String),
    /// Already classified on the host side (conversion, bad call target)
    Host(Error),
}

impl Failure {
    fn capture<'js>(ctx: &Ctx<'js>, err: rquickjs::Error, tags: &FailureTags<'js>) -> Failure {
        if err.is_exception() {
            Failure::Thrown(Thrown::from_value(ctx, ctx.catch(), tags))
        } else {
            Failure::Engine(err.to_string())
        }
    }

    /// Id of the host callback failure behind this failure, if any
    pub fn host_failure(&self) -> Option<u64> {
        match self {
            Failure::Thrown(thrown) => thrown.host_failure,
            _ => None,
        }
    }
}

/// Engine memory statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Bytes currently allocated by the engine allocator
    pub malloc_size: i64,
    /// Allocation limit in bytes (-1 when unlimited)
    pub malloc_limit: i64,
    /// Bytes in use by engine objects
    pub memory_used_size: i64,
    /// Live objects
    pub object_count: i64,
    /// Live strings
    pub string_count: i64,
    /// Interned atoms
    pub atom_count: i64,
    /// Script functions
    pub function_count: i64,
}

/// One isolated QuickJS heap and global scope
pub(crate) struct Environment {
    handles: SharedHandles,
    context: rquickjs::Context,
    runtime: Runtime,
    id: u64,
    marshal_depth: usize,
}

impl Environment {
    /// Create the runtime and context and hook up interruption
    pub fn create(
        id: u64,
        options: &ContextOptions,
        interrupts: Arc<InterruptState>,
    ) -> Result<Environment, Error> {
        let runtime = Runtime::new()
            .map_err(|err| Error::engine(format!("failed to create QuickJS runtime: {err}")))?;
        if let Some(limit) = options.max_memory {
            runtime.set_memory_limit(limit);
        }
        if let Some(limit) = options.max_stack_size {
            runtime.set_max_stack_size(limit);
        }
        runtime.set_interrupt_handler(Some(Box::new(move || interrupts.should_interrupt())));

        let context = rquickjs::Context::full(&runtime)
            .map_err(|err| Error::engine(format!("failed to create QuickJS context: {err}")))?;
        let handles = context.with(|ctx| {
            Handles::new(&ctx)
                .map_err(|err| Error::engine(format!("failed to allocate engine handles: {err}")))
        })?;

        tracing::debug!(context = id, "environment created");
        Ok(Environment {
            handles: Arc::new(Mutex::new(Some(handles))),
            context,
            runtime,
            id,
            marshal_depth: options.marshal_depth,
        })
    }

    /// Run `f` inside the engine with a marshaller for this environment.
    /// Function references the host has dropped since the last scope are
    /// cleared first.
    fn enter<F, R>(&self, f: F) -> Result<R, Failure>
    where
        F: for<'js> FnOnce(&Ctx<'js>, &mut Marshaller<'js>) -> Result<R, Failure> + Send,
        R: Send,
    {
        let (handles, id, depth) = (&self.handles, self.id, self.marshal_depth);
        self.context.with(move |ctx| {
            let mut marshaller = {
                let guard = handles.lock();
                let handles = guard
                    .as_ref()
                    .ok_or_else(|| Failure::Host(Error::disposed()))?;
                Marshaller::new(ctx.clone(), handles, id, depth)
                    .map_err(|err| Failure::Engine(err.to_string()))?
            };
            marshaller
                .sweep()
                .map_err(|err| Failure::Engine(err.to_string()))?;
            f(&ctx, &mut marshaller)
        })
    }

    /// Compile and run `source` at global scope
    pub fn eval(&self, source: &str) -> Result<Value, Failure> {
        let source = escape_nul(source);
        self.enter(|ctx, marshaller| {
            let mut options = EvalOptions::default();
            options.strict = false;
            let result = ctx.eval_with_options::<JsValue, _>(source.as_bytes(), options);
            settle(ctx, marshaller, result)
        })
    }

    /// Call the function at `path` (`name` or `a.b.name`) with `this` bound to
    /// its parent object
    pub fn call(&self, path: &str, args: &[Value]) -> Result<Value, Failure> {
        self.enter(|ctx, marshaller| {
            let args = to_js_args(marshaller, args)?;
            let (this, target) = resolve_path(ctx, marshaller.failure_tags(), path)?;
            let Some(function) = target.as_function() else {
                return Err(Failure::Host(Error::new(
                    ErrorKind::RuntimeError,
                    format!("TypeError: {path} is not a function"),
                )));
            };
            let result = function.call::<_, JsValue>((This(this), Rest(args)));
            settle(ctx, marshaller, result)
        })
    }

    /// Call a function previously handed to the host
    pub fn call_ref(&self, func: &FunctionRef, args: &[Value]) -> Result<Value, Failure> {
        self.enter(|ctx, marshaller| {
            let target = marshaller
                .to_js(&Value::Function(func.clone()))
                .map_err(Failure::Host)?;
            let args = to_js_args(marshaller, args)?;
            let result = match target.as_function() {
                Some(function) => function.call::<_, JsValue>((Rest(args),)),
                None => {
                    return Err(Failure::Host(Error::conversion(format!(
                        "'{}' is not a function",
                        func.name()
                    ))));
                }
            };
            settle(ctx, marshaller, result)
        })
    }

    /// Expose `binding` to script under its (possibly dotted) name
    pub fn install(
        &self,
        binding: &CallbackBinding,
        failures: &Arc<FailureLog>,
    ) -> Result<(), Error> {
        let handles = Arc::clone(&self.handles);
        let (id, depth) = (self.id, self.marshal_depth);
        self.enter(|ctx, marshaller| {
            callback::install(ctx, binding, Arc::clone(failures), handles, id, depth)
                .map_err(|err| Failure::capture(ctx, err, marshaller.failure_tags()))
        })
        .map_err(|failure| match failure {
            Failure::Thrown(thrown) => crate::error::from_thrown(&thrown),
            Failure::Engine(message) => Error::engine(message),
            Failure::Host(error) => error,
        })
    }

    /// Engine memory statistics
    pub fn heap_stats(&self) -> HeapStats {
        let usage = self.runtime.memory_usage();
        HeapStats {
            malloc_size: usage.malloc_size as i64,
            malloc_limit: usage.malloc_limit as i64,
            memory_used_size: usage.memory_used_size as i64,
            object_count: usage.obj_count as i64,
            string_count: usage.str_count as i64,
            atom_count: usage.atom_count as i64,
            function_count: usage.js_func_count as i64,
        }
    }

    /// Release dropped function references, then run a full garbage
    /// collection
    pub fn collect_garbage(&self) {
        if let Err(Failure::Engine(message)) = self.enter(|_, _| Ok(())) {
            tracing::warn!(
                context = self.id,
                error = %message,
                "failed to sweep function references"
            );
        }
        self.runtime.run_gc();
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        let handles = self.handles.lock().take();
        self.context.with(move |_| drop(handles));
        tracing::debug!(context = self.id, "environment released");
    }
}

/// QuickJS reads source as a C string, so an embedded NUL would cut it
/// short. Each NUL becomes a `\u0000` escape, which denotes the same
/// character inside string, template and regex literals and is still a
/// syntax error in code position.
fn escape_nul(source: &str) -> Cow<'_, str> {
    if !source.contains('\0') {
        return Cow::Borrowed(source);
    }
    let mut escaped = String::with_capacity(source.len() + 8);
    let mut backslashes = 0usize;
    for ch in source.chars() {
        match ch {
            // Already escaped: `\<NUL>` becomes `\u0000`
            '\0' if backslashes % 2 == 1 => escaped.push_str("u0000"),
            '\0' => escaped.push_str("\\u0000"),
            _ => escaped.push(ch),
        }
        backslashes = if ch == '\\' { backslashes + 1 } else { 0 };
    }
    Cow::Owned(escaped)
}

fn to_js_args<'js>(
    marshaller: &mut Marshaller<'js>,
    args: &[Value],
) -> Result<Vec<JsValue<'js>>, Failure> {
    args.iter()
        .map(|arg| marshaller.to_js(arg))
        .collect::<Result<Vec<_>, _>>()
        .map_err(Failure::Host)
}

/// Walk `a.b.c` from the global object, returning `(parent, value)`
fn resolve_path<'js>(
    ctx: &Ctx<'js>,
    tags: &FailureTags<'js>,
    path: &str,
) -> Result<(Object<'js>, JsValue<'js>), Failure> {
    let mut parent = ctx.globals();
    let mut segments = path.split('.').peekable();
    while let Some(segment) = segments.next() {
        if segment.is_empty() {
            return Err(Failure::Host(Error::new(
                ErrorKind::RuntimeError,
                format!("invalid function path '{path}'"),
            )));
        }
        let value: JsValue<'js> = parent
            .get(segment)
            .map_err(|err| Failure::capture(ctx, err, tags))?;
        if segments.peek().is_none() {
            return Ok((parent, value));
        }
        parent = value.into_object().ok_or_else(|| {
            Failure::Host(Error::new(
                ErrorKind::RuntimeError,
                format!("TypeError: cannot read '{path}': '{segment}' is not an object"),
            ))
        })?;
    }
    Err(Failure::Host(Error::new(
        ErrorKind::RuntimeError,
        "empty function path",
    )))
}

fn settle<'js>(
    ctx: &Ctx<'js>,
    marshaller: &mut Marshaller<'js>,
    result: rquickjs::Result<JsValue<'js>>,
) -> Result<Value, Failure> {
    match result {
        Ok(value) => marshaller.to_host(&value).map_err(Failure::Host),
        Err(err) => Err(Failure::capture(ctx, err, marshaller.failure_tags())),
    }
}
