//! Errors surfaced by a [`Context`](crate::Context)
//!
//! Every failure that crosses the engine boundary is normalized into an
//! [`Error`]: a kind, a message and an ordered stack trace. Script frames come
//! first (innermost first); the last frame is always a synthetic frame naming
//! the jsgate entry point and the host call site, so host-side traces are easy
//! to tell apart from pure script traces.

use std::fmt;
use std::panic::Location;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;

use crate::engine::interrupt::Reason;
use crate::engine::{Failure, Thrown};

/// Function name used for frames that carry a location but no function
pub const ANONYMOUS: &str = "<anonymous>";

/// Failure classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The source failed to compile; nothing was executed
    SyntaxError,
    /// A value was thrown while the script was running
    RuntimeError,
    /// The evaluation was interrupted by [`Context::stop`](crate::Context::stop)
    Termination,
    /// The evaluation was interrupted because its deadline expired
    Timeout,
    /// A host callback failed; the original failure is the error's source
    CallbackError,
    /// The calling thread already holds the context (callback re-entry)
    Reentrant,
    /// The context has been disposed
    Disposed,
    /// A value could not cross the boundary (cycles, nesting, foreign refs)
    Conversion,
    /// The engine itself failed outside of script execution
    Engine,
}

impl ErrorKind {
    /// Stable name of the kind
    pub const fn as_str(self) -> &'static str {
        match self {
            ErrorKind::SyntaxError => "SyntaxError",
            ErrorKind::RuntimeError => "RuntimeError",
            ErrorKind::Termination => "Termination",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::CallbackError => "CallbackError",
            ErrorKind::Reentrant => "Reentrant",
            ErrorKind::Disposed => "Disposed",
            ErrorKind::Conversion => "Conversion",
            ErrorKind::Engine => "Engine",
        }
    }

    /// Whether the failure came from an interrupt rather than the script
    #[inline]
    pub const fn is_interruption(self) -> bool {
        matches!(self, ErrorKind::Termination | ErrorKind::Timeout)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One frame of a script or boundary stack trace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    /// Function name, or [`ANONYMOUS`]
    pub function: String,
    /// `file:line[:column]` when the engine reported one
    pub location: Option<String>,
}

impl StackFrame {
    /// Create a frame
    pub fn new(function: impl Into<String>, location: Option<String>) -> Self {
        StackFrame {
            function: function.into(),
            location,
        }
    }

    /// Synthetic frame marking the host/engine boundary at `caller`
    pub(crate) fn boundary(op: &str, caller: &Location<'_>) -> Self {
        StackFrame {
            function: format!("jsgate::Context::{op}"),
            location: Some(format!(
                "{}:{}:{}",
                caller.file(),
                caller.line(),
                caller.column()
            )),
        }
    }

    /// Whether this is the synthetic boundary frame
    pub fn is_boundary(&self) -> bool {
        self.function.starts_with("jsgate::")
    }
}

impl fmt::Display for StackFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.location {
            Some(location) => write!(f, "at {} ({})", self.function, location),
            None => write!(f, "at {}", self.function),
        }
    }
}

/// Original host failure carried by a [`ErrorKind::CallbackError`]
pub type HostCause = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Structured failure returned by every fallible [`Context`](crate::Context) operation
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct Error {
    kind: ErrorKind,
    message: String,
    stack: Vec<StackFrame>,
    #[source]
    source: Option<HostCause>,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Error {
            kind,
            message: message.into(),
            stack: Vec::new(),
            source: None,
        }
    }

    pub(crate) fn disposed() -> Self {
        Error::new(ErrorKind::Disposed, "context has been disposed")
    }

    pub(crate) fn reentrant() -> Self {
        Error::new(
            ErrorKind::Reentrant,
            "context is already in use by this thread (called from a host callback?)",
        )
    }

    pub(crate) fn conversion(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::Conversion, message)
    }

    pub(crate) fn engine(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::Engine, message)
    }

    pub(crate) fn with_stack(mut self, stack: Vec<StackFrame>) -> Self {
        self.stack = stack;
        self
    }

    pub(crate) fn with_source(mut self, source: HostCause) -> Self {
        self.source = Some(source);
        self
    }

    /// Append the boundary frame; errors that already carry one are left alone
    pub(crate) fn at_boundary(mut self, frame: StackFrame) -> Self {
        if !self.stack.last().is_some_and(StackFrame::is_boundary) {
            self.stack.push(frame);
        }
        self
    }

    /// Failure classification
    #[inline]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Human readable message
    #[inline]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Stack frames, innermost script frame first, boundary frame last
    #[inline]
    pub fn stack(&self) -> &[StackFrame] {
        &self.stack
    }

    /// The host failure wrapped by a [`ErrorKind::CallbackError`]
    pub fn host_error(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        self.source.as_deref()
    }

    /// Stack rendered one frame per line, the way host backtraces read
    pub fn backtrace(&self) -> Vec<String> {
        self.stack.iter().map(ToString::to_string).collect()
    }
}

/// Build the error for a value thrown out of script, without any interrupt
/// or callback context.
pub(crate) fn from_thrown(thrown: &Thrown) -> Error {
    let stack = thrown.stack.as_deref().map(parse_stack).unwrap_or_default();
    let compile_time = thrown.name.as_deref() == Some("SyntaxError")
        && stack.iter().all(|frame| frame.function == ANONYMOUS);
    let kind = if compile_time {
        ErrorKind::SyntaxError
    } else {
        ErrorKind::RuntimeError
    };
    Error::new(kind, thrown.describe()).with_stack(stack)
}

/// Classify an engine failure into exactly one [`ErrorKind`].
///
/// An interrupt recorded against the call wins over whatever the engine
/// threw, since QuickJS reports interrupts as an ordinary internal error.
pub(crate) fn translate(
    failure: Failure,
    interrupted: Option<Reason>,
    timeout: Option<Duration>,
    host_failure: Option<(String, HostCause)>,
    boundary: StackFrame,
) -> Error {
    let error = match failure {
        Failure::Thrown(thrown) => {
            let stack = thrown.stack.as_deref().map(parse_stack).unwrap_or_default();
            match (interrupted, host_failure) {
                (Some(Reason::Terminated), _) => Error::new(
                    ErrorKind::Termination,
                    "JavaScript execution was terminated by stop()",
                )
                .with_stack(stack),
                (Some(Reason::Timeout), _) => {
                    let limit = timeout.map(|t| t.as_millis()).unwrap_or_default();
                    Error::new(
                        ErrorKind::Timeout,
                        format!("JavaScript execution was terminated after the {limit}ms timeout"),
                    )
                    .with_stack(stack)
                }
                (None, Some((callback, cause))) => Error::new(
                    ErrorKind::CallbackError,
                    format!("host callback '{callback}' failed: {cause}"),
                )
                .with_stack(stack)
                .with_source(cause),
                (None, None) => from_thrown(&thrown),
            }
        }
        Failure::Engine(message) => match interrupted {
            Some(Reason::Terminated) => Error::new(
                ErrorKind::Termination,
                "JavaScript execution was terminated by stop()",
            ),
            Some(Reason::Timeout) => Error::new(ErrorKind::Timeout, message),
            None => Error::engine(message),
        },
        Failure::Host(error) => error,
    };
    error.at_boundary(boundary)
}

/// `at fn (file:line:col)`, `at fn (native)` or `at file:line:col`
static FRAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*at\s+(?P<function>[^()]*?)\s*(?:\((?P<location>[^()]*)\))?\s*$")
        .expect("frame pattern is a valid regex")
});

/// Parse an engine `stack` string into frames, innermost first
pub(crate) fn parse_stack(stack: &str) -> Vec<StackFrame> {
    stack
        .lines()
        .filter_map(|line| {
            let caps = FRAME_RE.captures(line)?;
            let function = caps.name("function").map_or("", |m| m.as_str());
            let location = caps.name("location").map(|m| m.as_str().to_string());
            match location {
                Some(location) if function.is_empty() => {
                    Some(StackFrame::new(ANONYMOUS, Some(location)))
                }
                Some(location) => Some(StackFrame::new(function, Some(location))),
                // A bare location means there was no enclosing function
                None if function.contains(':') => {
                    Some(StackFrame::new(ANONYMOUS, Some(function.to_string())))
                }
                None if function.is_empty() => None,
                None => Some(StackFrame::new(function, None)),
            }
        })
        .collect()
}
