//! JavaScript execution context
//!
//! A [`Context`] owns one isolated engine environment and serializes access to
//! it: every operation that touches the environment takes the context's gate,
//! so concurrent callers queue up and evaluations never interleave. The gate
//! is released fairly, so a steady stream of callers cannot starve a waiter.
//!
//! [`Context::stop`] is the exception. It never takes the gate; it flags the
//! in-flight call through the shared interrupt state and the engine aborts at
//! its next safepoint. Deadlines go through the same path from a per-context
//! watchdog thread.

use std::cell::RefCell;
use std::fmt;
use std::panic::Location;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard};

use crate::bridge::DEFAULT_MARSHAL_DEPTH;
use crate::callback::{BoxError, CallbackBinding, CallbackRegistry, HostFunction};
use crate::engine::interrupt::{InterruptState, Reason};
use crate::engine::watchdog::Watchdog;
use crate::engine::{Environment, Failure, HeapStats};
use crate::error::{self, Error, ErrorKind, StackFrame};
use crate::value::{FunctionRef, Value};

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Ids of the contexts whose gate this thread currently holds
    static HELD_GATES: RefCell<Vec<u64>> = const { RefCell::new(Vec::new()) };
}

/// Context configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextOptions {
    /// Default deadline for every evaluation; `None` means no deadline
    pub timeout: Option<Duration>,
    /// Engine heap limit in bytes
    pub max_memory: Option<usize>,
    /// Engine native stack limit in bytes
    pub max_stack_size: Option<usize>,
    /// Maximum array/object nesting accepted by value conversion
    pub marshal_depth: usize,
}

impl Default for ContextOptions {
    fn default() -> Self {
        ContextOptions {
            timeout: None,
            max_memory: None,
            max_stack_size: None,
            marshal_depth: DEFAULT_MARSHAL_DEPTH,
        }
    }
}

impl ContextOptions {
    /// Set the default deadline; a zero duration disables it
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    pub fn with_max_memory(mut self, bytes: usize) -> Self {
        self.max_memory = Some(bytes);
        self
    }

    pub fn with_max_stack_size(mut self, bytes: usize) -> Self {
        self.max_stack_size = Some(bytes);
        self
    }

    pub fn with_marshal_depth(mut self, depth: usize) -> Self {
        self.marshal_depth = depth;
        self
    }
}

/// State that only exists until the context is disposed
struct Live {
    env: Environment,
    callbacks: CallbackRegistry,
    watchdog: Option<Watchdog>,
}

/// One evaluation in flight
#[derive(Debug, Clone, Copy)]
struct PendingCall {
    id: u64,
    started: Instant,
    timeout: Option<Duration>,
}

/// Exclusive access to a context's environment, released fairly on drop
struct GateGuard<'a> {
    context: u64,
    guard: Option<MutexGuard<'a, Option<Live>>>,
}

impl GateGuard<'_> {
    fn live(&mut self) -> Result<&mut Live, Error> {
        self.guard
            .as_mut()
            .and_then(|guard| guard.as_mut())
            .ok_or_else(Error::disposed)
    }

    fn take(&mut self) -> Option<Live> {
        self.guard.as_mut().and_then(|guard| guard.take())
    }
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        HELD_GATES.with(|held| {
            let mut held = held.borrow_mut();
            if let Some(pos) = held.iter().rposition(|&id| id == self.context) {
                held.remove(pos);
            }
        });
        if let Some(guard) = self.guard.take() {
            MutexGuard::unlock_fair(guard);
        }
    }
}

/// An isolated JavaScript environment that can be shared between threads.
///
/// ```no_run
/// use jsgate::{Context, Value};
///
/// let ctx = Context::new()?;
/// ctx.eval("var greeting = 'hello'")?;
/// assert_eq!(ctx.eval("greeting + ' world'")?, Value::from("hello world"));
/// # Ok::<(), jsgate::Error>(())
/// ```
pub struct Context {
    id: u64,
    options: ContextOptions,
    gate: Mutex<Option<Live>>,
    interrupts: Arc<InterruptState>,
    disposed: AtomicBool,
}

impl Context {
    /// Create a context with default options
    pub fn new() -> Result<Context, Error> {
        Context::with_options(ContextOptions::default())
    }

    /// Create a context
    pub fn with_options(options: ContextOptions) -> Result<Context, Error> {
        let id = NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed);
        let interrupts = Arc::new(InterruptState::new());
        let env = Environment::create(id, &options, Arc::clone(&interrupts))?;
        tracing::debug!(
            context = id,
            timeout_ms = options.timeout.map(|t| t.as_millis() as u64),
            "context created"
        );
        Ok(Context {
            id,
            options,
            gate: Mutex::new(Some(Live {
                env,
                callbacks: CallbackRegistry::new(),
                watchdog: None,
            })),
            interrupts,
            disposed: AtomicBool::new(false),
        })
    }

    /// Unique id of this context
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Options the context was created with
    pub fn options(&self) -> &ContextOptions {
        &self.options
    }

    /// Whether [`dispose`](Context::dispose) has run
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Evaluate `source` at global scope, subject to the default timeout
    #[track_caller]
    pub fn eval(&self, source: &str) -> Result<Value, Error> {
        self.run("eval", Location::caller(), self.options.timeout, |env| {
            env.eval(source)
        })
    }

    /// Evaluate `source` with a call-specific deadline that overrides the
    /// default; a zero duration runs without one
    #[track_caller]
    pub fn eval_with_timeout(&self, source: &str, timeout: Duration) -> Result<Value, Error> {
        let timeout = (!timeout.is_zero()).then_some(timeout);
        self.run("eval", Location::caller(), timeout, |env| env.eval(source))
    }

    /// Call the script function at `path` (`name` or `a.b.name`)
    #[track_caller]
    pub fn call(&self, path: &str, args: &[Value]) -> Result<Value, Error> {
        self.run("call", Location::caller(), self.options.timeout, |env| {
            env.call(path, args)
        })
    }

    /// Call a script function previously returned by this context
    #[track_caller]
    pub fn call_function(&self, func: &FunctionRef, args: &[Value]) -> Result<Value, Error> {
        self.run(
            "call_function",
            Location::caller(),
            self.options.timeout,
            |env| env.call_ref(func, args),
        )
    }

    /// Expose `function` to script as `name`, replacing any earlier binding
    #[track_caller]
    pub fn attach<F>(&self, name: &str, function: F) -> Result<(), Error>
    where
        F: Fn(&[Value]) -> Result<Value, BoxError> + Send + Sync + 'static,
    {
        self.attach_host(name, Arc::new(function))
    }

    /// Expose a shared [`HostFunction`] to script as `name`
    #[track_caller]
    pub fn attach_host(&self, name: &str, function: Arc<dyn HostFunction>) -> Result<(), Error> {
        let boundary = StackFrame::boundary("attach", Location::caller());
        let binding =
            CallbackBinding::new(name, function).map_err(|e| e.at_boundary(boundary.clone()))?;
        let mut gate = self.acquire().map_err(|e| e.at_boundary(boundary.clone()))?;
        let live = gate.live().map_err(|e| e.at_boundary(boundary.clone()))?;
        live.env
            .install(&binding, live.callbacks.failures())
            .map_err(|e| e.at_boundary(boundary))?;
        if live.callbacks.insert(binding).is_some() {
            tracing::debug!(context = self.id, callback = name, "callback replaced");
        } else {
            tracing::debug!(context = self.id, callback = name, "callback attached");
        }
        Ok(())
    }

    /// Names of the attached callbacks, in attach order
    #[track_caller]
    pub fn callbacks(&self) -> Result<Vec<String>, Error> {
        let boundary = StackFrame::boundary("callbacks", Location::caller());
        let mut gate = self.acquire().map_err(|e| e.at_boundary(boundary.clone()))?;
        let live = gate.live().map_err(|e| e.at_boundary(boundary))?;
        Ok(live.callbacks.names())
    }

    /// Interrupt the evaluation in flight, if any.
    ///
    /// Safe to call from any thread at any time; never blocks. The call in
    /// flight fails with [`ErrorKind::Termination`](crate::ErrorKind::Termination)
    /// once the engine reaches its next safepoint.
    pub fn stop(&self) {
        if self.interrupts.request(Reason::Terminated) {
            tracing::debug!(
                context = self.id,
                call = self.interrupts.active(),
                "stop requested"
            );
        }
    }

    /// Release the environment, waiting for any evaluation in flight.
    ///
    /// Every later operation fails with
    /// [`ErrorKind::Disposed`](crate::ErrorKind::Disposed); disposing again is
    /// a no-op. Fails with `Reentrant` when called from one of this context's
    /// own callbacks.
    #[track_caller]
    pub fn dispose(&self) -> Result<(), Error> {
        let boundary = StackFrame::boundary("dispose", Location::caller());
        let mut gate = self.acquire().map_err(|e| e.at_boundary(boundary))?;
        self.disposed.store(true, Ordering::Release);
        if let Some(live) = gate.take() {
            drop(live);
            tracing::debug!(context = self.id, "context disposed");
        }
        Ok(())
    }

    /// Engine memory statistics
    #[track_caller]
    pub fn heap_stats(&self) -> Result<HeapStats, Error> {
        let boundary = StackFrame::boundary("heap_stats", Location::caller());
        let mut gate = self.acquire().map_err(|e| e.at_boundary(boundary.clone()))?;
        let live = gate.live().map_err(|e| e.at_boundary(boundary))?;
        Ok(live.env.heap_stats())
    }

    /// Run a full garbage collection
    #[track_caller]
    pub fn low_memory_notification(&self) -> Result<(), Error> {
        let boundary = StackFrame::boundary("low_memory_notification", Location::caller());
        let mut gate = self.acquire().map_err(|e| e.at_boundary(boundary.clone()))?;
        let live = gate.live().map_err(|e| e.at_boundary(boundary))?;
        live.env.collect_garbage();
        tracing::trace!(context = self.id, "garbage collected");
        Ok(())
    }

    /// Take the gate, failing fast if this thread already holds it
    fn acquire(&self) -> Result<GateGuard<'_>, Error> {
        let held = HELD_GATES.with(|held| held.borrow().contains(&self.id));
        if held {
            tracing::debug!(context = self.id, "reentrant call rejected");
            return Err(Error::reentrant());
        }
        let guard = self.gate.lock();
        HELD_GATES.with(|held| held.borrow_mut().push(self.id));
        Ok(GateGuard {
            context: self.id,
            guard: Some(guard),
        })
    }

    /// Run one call against the environment: take the gate, arm the
    /// watchdog, run, then classify the outcome.
    fn run<F>(
        &self,
        op: &str,
        caller: &'static Location<'static>,
        timeout: Option<Duration>,
        f: F,
    ) -> Result<Value, Error>
    where
        F: FnOnce(&Environment) -> Result<Value, Failure>,
    {
        let boundary = StackFrame::boundary(op, caller);
        let mut gate = self.acquire().map_err(|e| e.at_boundary(boundary.clone()))?;
        let live = gate.live().map_err(|e| e.at_boundary(boundary.clone()))?;

        if timeout.is_some() && live.watchdog.is_none() {
            let watchdog = Watchdog::spawn(self.id, Arc::clone(&self.interrupts)).map_err(|err| {
                Error::engine(format!("failed to start watchdog: {err}"))
                    .at_boundary(boundary.clone())
            })?;
            live.watchdog = Some(watchdog);
        }

        let pending = PendingCall {
            id: self.interrupts.begin(),
            started: Instant::now(),
            timeout,
        };
        if let (Some(limit), Some(watchdog)) = (pending.timeout, &live.watchdog) {
            watchdog.arm(pending.id, pending.started + limit);
        }
        tracing::trace!(context = self.id, call = pending.id, op, "call started");

        let result = f(&live.env);

        if let Some(watchdog) = &live.watchdog {
            watchdog.disarm(pending.id);
        }
        let interrupted = self.interrupts.finish(pending.id);
        let failures = live.callbacks.failures();
        let outcome = result.map_err(|failure| {
            let host_failure = failure.host_failure().and_then(|id| failures.take(id));
            error::translate(failure, interrupted, pending.timeout, host_failure, boundary)
        });
        failures.clear();
        self.log_outcome(&pending, interrupted, &outcome);
        outcome
    }

    fn log_outcome(
        &self,
        pending: &PendingCall,
        interrupted: Option<Reason>,
        outcome: &Result<Value, Error>,
    ) {
        let elapsed_ms = pending.started.elapsed().as_millis() as u64;
        match outcome {
            Ok(_) => {
                tracing::trace!(context = self.id, call = pending.id, elapsed_ms, "call completed");
            }
            Err(err) if err.kind() == ErrorKind::Timeout => {
                tracing::warn!(
                    context = self.id,
                    call = pending.id,
                    elapsed_ms,
                    timeout_ms = pending.timeout.map(|t| t.as_millis() as u64),
                    "call exceeded its deadline"
                );
            }
            Err(err) if err.kind().is_interruption() => {
                tracing::debug!(
                    context = self.id,
                    call = pending.id,
                    elapsed_ms,
                    reason = ?interrupted,
                    "call interrupted"
                );
            }
            Err(err) => {
                tracing::debug!(
                    context = self.id,
                    call = pending.id,
                    elapsed_ms,
                    kind = %err.kind(),
                    "call failed"
                );
            }
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id)
            .field("options", &self.options)
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.disposed.store(true, Ordering::Release);
        if self.gate.get_mut().take().is_some() {
            tracing::debug!(context = self.id, "context dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::CallbackPanic;
    use std::sync::Weak;
    use std::thread;

    fn adder(args: &[Value]) -> Result<Value, BoxError> {
        let a = args.first().and_then(Value::to_i64).ok_or("adder: expected numbers")?;
        let b = args.get(1).and_then(Value::to_i64).ok_or("adder: expected numbers")?;
        Ok(Value::Integer(a + b))
    }

    #[test]
    fn test_context_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Context>();
    }

    #[test]
    fn test_eval_literals() {
        let ctx = Context::new().unwrap();
        assert_eq!(ctx.eval("1+1").unwrap(), Value::Integer(2));
        assert_eq!(ctx.eval("\"1+1\"").unwrap(), Value::from("1+1"));
        assert_eq!(ctx.eval("1.2").unwrap(), Value::Float(1.2));
        assert_eq!(ctx.eval("true").unwrap(), Value::Bool(true));
        assert_eq!(ctx.eval("undefined").unwrap(), Value::Nil);
    }

    #[test]
    fn test_state_persists_between_evals() {
        let ctx = Context::new().unwrap();
        ctx.eval("var x = 40; implicit = 2").unwrap();
        assert_eq!(ctx.eval("x + implicit").unwrap(), Value::Integer(42));
    }

    #[test]
    fn test_runtime_error() {
        let ctx = Context::new().unwrap();
        let err = ctx
            .eval("function foo() { return boom; }\nfoo()")
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RuntimeError);
        assert!(err.message().contains("boom"));
        assert_eq!(err.stack()[0].function, "foo");

        let last = err.stack().last().unwrap();
        assert!(last.is_boundary());
        assert_eq!(last.function, "jsgate::Context::eval");
        assert!(last.location.as_deref().unwrap().contains("context.rs"));

        assert_eq!(ctx.eval("1+1").unwrap(), Value::Integer(2));
    }

    #[test]
    fn test_syntax_error_has_no_side_effects() {
        let ctx = Context::new().unwrap();
        let err = ctx.eval("sideEffect = 1; function ( {").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SyntaxError);
        assert!(err.stack().last().unwrap().is_boundary());
        assert_eq!(ctx.eval("typeof sideEffect").unwrap(), Value::from("undefined"));
    }

    #[test]
    fn test_runtime_syntax_error_is_runtime() {
        let ctx = Context::new().unwrap();
        let err = ctx.eval("JSON.parse('{')").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RuntimeError);
        assert!(err.message().starts_with("SyntaxError"));
    }

    #[test]
    fn test_stop_terminates_infinite_loop() {
        let ctx = Arc::new(Context::new().unwrap());
        let done = Arc::new(AtomicBool::new(false));
        let stopper = {
            let ctx = Arc::clone(&ctx);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                while !done.load(Ordering::Acquire) {
                    ctx.stop();
                    thread::sleep(Duration::from_millis(1));
                }
            })
        };

        let err = ctx.eval("while (true) {}").unwrap_err();
        done.store(true, Ordering::Release);
        stopper.join().unwrap();

        assert_eq!(err.kind(), ErrorKind::Termination);
        assert!(err.message().contains("terminated"));
        assert_eq!(ctx.eval("1+1").unwrap(), Value::Integer(2));
    }

    #[test]
    fn test_stop_when_idle_is_noop() {
        let ctx = Context::new().unwrap();
        ctx.stop();
        ctx.stop();
        assert_eq!(ctx.eval("1+1").unwrap(), Value::Integer(2));
    }

    #[test]
    fn test_timeout() {
        let options = ContextOptions::default().with_timeout(Duration::from_millis(2));
        let ctx = Context::with_options(options).unwrap();
        let started = Instant::now();
        let err = ctx.eval("while (true) {}").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(started.elapsed() < Duration::from_secs(2));

        // Fast calls are unaffected by the armed watchdog
        for _ in 0..20 {
            assert_eq!(ctx.eval("1+1").unwrap(), Value::Integer(2));
        }
    }

    #[test]
    fn test_call_specific_timeout() {
        let ctx = Context::new().unwrap();
        let err = ctx
            .eval_with_timeout("for (;;) {}", Duration::from_millis(5))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(err.message().contains("5ms"));

        let options = ContextOptions::default().with_timeout(Duration::from_millis(1));
        let ctx = Context::with_options(options).unwrap();
        let slow = "var t = Date.now(); while (Date.now() - t < 20) {} 'finished'";
        let result = ctx.eval_with_timeout(slow, Duration::from_secs(5)).unwrap();
        assert_eq!(result, Value::from("finished"));
    }

    #[test]
    fn test_attach() {
        let ctx = Context::new().unwrap();
        ctx.attach("adder", adder).unwrap();
        assert_eq!(ctx.eval("adder(1,2)").unwrap(), Value::Integer(3));

        ctx.attach("arrow", |args: &[Value]| -> Result<Value, BoxError> {
            Ok(Value::Integer(args.iter().filter_map(Value::to_i64).sum()))
        })
        .unwrap();
        assert_eq!(ctx.eval("arrow(1,2)").unwrap(), Value::Integer(3));
        assert_eq!(ctx.callbacks().unwrap(), ["adder", "arrow"]);
    }

    #[test]
    fn test_attach_replaces_binding() {
        let ctx = Context::new().unwrap();
        ctx.attach("answer", |_: &[Value]| -> Result<Value, BoxError> { Ok(1.into()) })
            .unwrap();
        ctx.attach("answer", |_: &[Value]| -> Result<Value, BoxError> { Ok(42.into()) })
            .unwrap();
        assert_eq!(ctx.eval("answer()").unwrap(), Value::Integer(42));
        assert_eq!(ctx.callbacks().unwrap(), ["answer"]);
    }

    #[test]
    fn test_attach_dotted_name() {
        let ctx = Context::new().unwrap();
        ctx.eval("var host = { version: 3 }").unwrap();
        ctx.attach("host.math.add", adder).unwrap();
        assert_eq!(
            ctx.eval("host.math.add(host.version, 4)").unwrap(),
            Value::Integer(7)
        );
        let err = ctx.attach("host..add", adder).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conversion);
    }

    #[test]
    fn test_concurrent_evals_are_serialized() {
        let ctx = Arc::new(Context::new().unwrap());
        ctx.eval(
            "var counter = 0;
             function plus() {
                 var seen = counter;
                 for (var i = 0; i < 10000; i++) {}
                 counter = seen + 1;
             }",
        )
        .unwrap();

        let threads: Vec<_> = (0..10)
            .map(|_| {
                let ctx = Arc::clone(&ctx);
                thread::spawn(move || ctx.eval("plus()").unwrap())
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
        assert_eq!(ctx.eval("counter").unwrap(), Value::Integer(10));
    }

    #[test]
    fn test_callback_error_wraps_host_failure() {
        let ctx = Context::new().unwrap();
        ctx.attach("fail", |_: &[Value]| -> Result<Value, BoxError> {
            Err(std::io::Error::other("disk on fire").into())
        })
        .unwrap();

        let err = ctx.eval("function outer() { fail() }\nouter()").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CallbackError);
        assert!(err.message().contains("fail"));
        let cause = err.host_error().unwrap();
        assert_eq!(cause.to_string(), "disk on fire");
        assert!(cause.downcast_ref::<std::io::Error>().is_some());
        assert!(err.stack().iter().any(|frame| frame.function == "outer"));

        assert_eq!(ctx.eval("1+1").unwrap(), Value::Integer(2));
    }

    #[test]
    fn test_callback_panic_is_contained() {
        let ctx = Context::new().unwrap();
        ctx.attach("explode", |_: &[Value]| -> Result<Value, BoxError> {
            panic!("exploded")
        })
        .unwrap();
        let err = ctx.eval("explode()").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CallbackError);
        let panic = err.host_error().unwrap().downcast_ref::<CallbackPanic>().unwrap();
        assert_eq!(panic.message(), "exploded");
        assert_eq!(ctx.eval("1+1").unwrap(), Value::Integer(2));
    }

    #[test]
    fn test_caught_callback_error_is_forgotten() {
        let ctx = Context::new().unwrap();
        ctx.attach("adder", adder).unwrap();
        ctx.eval("try { adder('a') } catch (e) {}").unwrap();
        let err = ctx.eval("throw new Error('unrelated')").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RuntimeError);
        assert!(err.host_error().is_none());
    }

    #[test]
    fn test_reentrant_call_fails_fast() {
        let ctx = Arc::new(Context::new().unwrap());
        let weak: Weak<Context> = Arc::downgrade(&ctx);
        let observed = Arc::new(Mutex::new(None));
        let seen = Arc::clone(&observed);
        ctx.attach("reenter", move |_: &[Value]| -> Result<Value, BoxError> {
            let ctx = weak.upgrade().ok_or("context gone")?;
            match ctx.eval("1+1") {
                Ok(value) => Ok(value),
                Err(err) => {
                    *seen.lock() = Some(err.kind());
                    Err(err.into())
                }
            }
        })
        .unwrap();

        let err = ctx.eval("reenter()").unwrap_err();
        assert_eq!(*observed.lock(), Some(ErrorKind::Reentrant));
        assert_eq!(err.kind(), ErrorKind::CallbackError);
        let inner = err.host_error().unwrap().downcast_ref::<Error>().unwrap();
        assert_eq!(inner.kind(), ErrorKind::Reentrant);

        // The gate was released normally
        assert_eq!(ctx.eval("1+1").unwrap(), Value::Integer(2));
    }

    #[test]
    fn test_callback_may_use_another_context() {
        let other = Arc::new(Context::new().unwrap());
        other.eval("var secret = 'from other'").unwrap();
        let ctx = Context::new().unwrap();
        let peer = Arc::clone(&other);
        ctx.attach("peek", move |_: &[Value]| -> Result<Value, BoxError> {
            Ok(peer.eval("secret")?)
        })
        .unwrap();
        assert_eq!(ctx.eval("peek()").unwrap(), Value::from("from other"));
    }

    #[test]
    fn test_dispose() {
        let ctx = Context::new().unwrap();
        ctx.attach("adder", adder).unwrap();
        ctx.dispose().unwrap();
        assert!(ctx.is_disposed());

        assert_eq!(ctx.eval("1+1").unwrap_err().kind(), ErrorKind::Disposed);
        assert_eq!(ctx.attach("adder", adder).unwrap_err().kind(), ErrorKind::Disposed);
        assert_eq!(ctx.call("adder", &[]).unwrap_err().kind(), ErrorKind::Disposed);
        assert_eq!(ctx.heap_stats().unwrap_err().kind(), ErrorKind::Disposed);

        ctx.stop();
        ctx.dispose().unwrap();
    }

    #[test]
    fn test_dispose_waits_for_running_eval() {
        let ctx = Arc::new(Context::new().unwrap());
        let worker = {
            let ctx = Arc::clone(&ctx);
            thread::spawn(move || {
                ctx.eval("var t = Date.now(); while (Date.now() - t < 50) {} 'done'")
            })
        };
        thread::sleep(Duration::from_millis(10));
        ctx.dispose().unwrap();

        match worker.join().unwrap() {
            Ok(value) => assert_eq!(value, Value::from("done")),
            Err(err) => assert_eq!(err.kind(), ErrorKind::Disposed),
        }
        assert!(ctx.is_disposed());
    }

    #[test]
    fn test_dispose_from_callback_is_rejected() {
        let ctx = Arc::new(Context::new().unwrap());
        let weak = Arc::downgrade(&ctx);
        ctx.attach("selfdestruct", move |_: &[Value]| -> Result<Value, BoxError> {
            let ctx = weak.upgrade().ok_or("context gone")?;
            ctx.dispose()?;
            Ok(Value::Nil)
        })
        .unwrap();
        assert_eq!(
            ctx.eval("selfdestruct()").unwrap_err().kind(),
            ErrorKind::CallbackError
        );
        assert!(!ctx.is_disposed());
    }

    #[test]
    fn test_call_by_path() {
        let ctx = Context::new().unwrap();
        ctx.eval("var math = { base: 1, add: function (a, b) { return this.base + a + b } }")
            .unwrap();
        let result = ctx.call("math.add", &[2.into(), 3.into()]).unwrap();
        assert_eq!(result, Value::Integer(6));

        let err = ctx.call("missing", &[]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RuntimeError);
        assert_eq!(err.stack().last().unwrap().function, "jsgate::Context::call");
    }

    #[test]
    fn test_call_function_ref() {
        let ctx = Context::new().unwrap();
        let value = ctx.eval("(function twice(x) { return x * 2 })").unwrap();
        let func = value.as_function().unwrap();
        assert_eq!(func.name(), "twice");
        assert_eq!(func.context_id(), ctx.id());
        assert_eq!(
            ctx.call_function(func, &[21.into()]).unwrap(),
            Value::Integer(42)
        );

        ctx.eval("function apply(f, x) { return f(x) }").unwrap();
        let applied = ctx.call("apply", &[value.clone(), 5.into()]).unwrap();
        assert_eq!(applied, Value::Integer(10));

        let other = Context::new().unwrap();
        let err = other.call_function(func, &[1.into()]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conversion);
    }

    #[test]
    fn test_cyclic_result_is_conversion_error() {
        let ctx = Context::new().unwrap();
        let err = ctx.eval("var a = []; a.push(a); a").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conversion);
        assert!(err.stack().last().unwrap().is_boundary());
        assert_eq!(ctx.eval("a.length").unwrap(), Value::Integer(1));
    }

    #[test]
    fn test_marshal_depth_option() {
        let options = ContextOptions::default().with_marshal_depth(2);
        let ctx = Context::with_options(options).unwrap();
        assert!(ctx.eval("[[1]]").is_ok());
        assert_eq!(ctx.eval("[[[1]]]").unwrap_err().kind(), ErrorKind::Conversion);
    }

    #[test]
    fn test_error_returned_as_value() {
        let ctx = Context::new().unwrap();
        let value = ctx.eval("new RangeError('too far')").unwrap();
        let err = value.as_error().unwrap();
        assert_eq!(err.message(), "RangeError: too far");
    }

    #[test]
    fn test_heap_stats_and_gc() {
        let ctx = Context::new().unwrap();
        ctx.eval("var data = []; for (var i = 0; i < 100; i++) data.push({ i })")
            .unwrap();
        let stats = ctx.heap_stats().unwrap();
        assert!(stats.malloc_size > 0);
        assert!(stats.object_count > 100);
        ctx.low_memory_notification().unwrap();
    }

    #[test]
    fn test_dropped_function_refs_do_not_accumulate() {
        let ctx = Context::new().unwrap();
        ctx.eval("function mk() { return function () { return 1 } }").unwrap();
        ctx.low_memory_notification().unwrap();
        let baseline = ctx.heap_stats().unwrap().object_count;
        for _ in 0..2000 {
            ctx.eval("mk()").unwrap();
        }
        ctx.low_memory_notification().unwrap();
        assert!(ctx.heap_stats().unwrap().object_count < baseline + 50);

        // A reference the host still holds stays callable
        let kept = ctx.eval("mk()").unwrap();
        for _ in 0..100 {
            ctx.eval("mk()").unwrap();
        }
        ctx.low_memory_notification().unwrap();
        let func = kept.as_function().unwrap();
        assert_eq!(ctx.call_function(func, &[]).unwrap(), Value::Integer(1));
    }

    #[test]
    fn test_nul_in_source() {
        let ctx = Context::new().unwrap();
        assert_eq!(ctx.eval("'a\u{0}b'").unwrap(), Value::from("a\u{0}b"));
    }

    #[test]
    fn test_options() {
        let options = ContextOptions::default()
            .with_timeout(Duration::ZERO)
            .with_max_memory(32 << 20)
            .with_max_stack_size(512 << 10);
        assert_eq!(options.timeout, None);
        let ctx = Context::with_options(options.clone()).unwrap();
        assert_eq!(ctx.options(), &options);
        assert_ne!(ctx.id(), Context::new().unwrap().id());
    }
}
