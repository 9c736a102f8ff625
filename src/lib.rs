//! jsgate - safe, concurrent, cancellable JavaScript contexts
//!
//! jsgate embeds QuickJS and exposes it through a [`Context`]: an isolated
//! script environment that any number of host threads may share.
//!
//! # Features
//! - One isolated engine heap and global scope per [`Context`]
//! - Evaluations against a context are serialized; concurrent callers queue
//! - `stop()` and per-call timeouts interrupt running scripts at the next
//!   engine safepoint
//! - Host functions can be attached and called synchronously from script
//! - Failures surface as a structured [`Error`] with kind, message and stack
//!
//! # Example
//! ```no_run
//! use jsgate::{Context, Value};
//!
//! let ctx = Context::new().unwrap();
//! ctx.attach("adder", |args: &[Value]| {
//!     let a = args.first().and_then(Value::to_i64).unwrap_or(0);
//!     let b = args.get(1).and_then(Value::to_i64).unwrap_or(0);
//!     Ok(Value::Integer(a + b))
//! })
//! .unwrap();
//! assert_eq!(ctx.eval("adder(1, 2)").unwrap(), Value::Integer(3));
//! ```

// Host-facing context
pub mod context;

// Host values and the error taxonomy
pub mod error;
pub mod value;

// Host callbacks
pub mod callback;

// Engine binding
mod bridge;
mod engine;

// Re-export main types
pub use callback::{BoxError, CallbackPanic, HostFunction};
pub use context::{Context, ContextOptions};
pub use engine::HeapStats;
pub use error::{Error, ErrorKind, StackFrame};
pub use value::{FunctionRef, Value};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
        assert_eq!(VERSION.split('.').count(), 3);
    }
}
