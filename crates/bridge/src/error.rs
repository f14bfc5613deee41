use std::fmt;

use crate::convert::IntoValue;
use crate::thread::ThreadStatus;
use crate::value::Value;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A value raised inside the engine, carried to the host without loss.
#[derive(Debug, Clone)]
pub struct Fault {
    /// The raised value, whatever its type.
    pub payload: Value,
    /// Engine traceback captured at the raise site, when enabled.
    pub traceback: Option<String>,
}

impl Fault {
    pub fn new(payload: Value) -> Self {
        Self { payload, traceback: None }
    }

    /// Text rendering of the payload for messages and logs.
    pub fn message(&self) -> String {
        match &self.payload {
            Value::String(s) => s.to_string_lossy().into_owned(),
            Value::Integer(i) => i.to_string(),
            Value::Number(n) => n.to_string(),
            Value::Boolean(b) => b.to_string(),
            Value::Nil => "nil".to_string(),
            other => format!("({} value)", other.type_name()),
        }
    }
}

/// Errors surfaced by bridge operations.
#[derive(Debug, Clone)]
pub enum Error {
    /// A value could not be converted between the host and the engine.
    UnconvertibleType {
        from: &'static str,
        to: &'static str,
        detail: Option<String>,
    },
    /// The engine raised a value and no script code caught it.
    ScriptFault(Box<Fault>),
    /// An instruction or time limit stopped the running script.
    LimitExceeded(String),
    /// The handle was released or its session was closed.
    StaleHandle,
    /// Resume was attempted on a coroutine that cannot be resumed.
    CoroutineError { status: ThreadStatus },
    /// The fault payload itself could not be materialized.
    FaultInFault(String),
    /// A chunk failed to compile.
    Syntax(String),
    /// The engine allocator refused a request.
    OutOfMemory(String),
    /// The engine hit an unprotected error; the session is unusable.
    Fatal(String),
    SessionClosed,
    /// The session cannot be closed while a call is running on it.
    SessionBusy,
    /// The engine stack could not grow to hold the values.
    StackExhausted,
    /// Raised by a host callable or hook.
    Host(String),
    Config(String),
    Io(String),
}

impl Error {
    /// Host failure with a plain message; scripts see the message text.
    pub fn host(message: impl Into<String>) -> Self {
        Error::Host(message.into())
    }

    /// Raise an arbitrary value into the engine from a host callable.
    pub fn raise(payload: impl IntoValue) -> Self {
        Error::ScriptFault(Box::new(Fault::new(payload.into_value())))
    }

    pub(crate) fn unconvertible(from: &'static str, to: &'static str) -> Self {
        Error::UnconvertibleType { from, to, detail: None }
    }

    pub(crate) fn unconvertible_with(
        from: &'static str,
        to: &'static str,
        detail: impl Into<String>,
    ) -> Self {
        Error::UnconvertibleType { from, to, detail: Some(detail.into()) }
    }

    /// The raised value, for script faults.
    pub fn fault(&self) -> Option<&Fault> {
        match self {
            Error::ScriptFault(fault) => Some(fault),
            _ => None,
        }
    }

    /// Text that scripts observe when this error is raised into the engine.
    pub(crate) fn script_message(&self) -> String {
        match self {
            Error::ScriptFault(fault) => fault.message(),
            Error::Host(message) => message.clone(),
            other => other.to_string(),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::UnconvertibleType { from, to, detail } => {
                write!(f, "cannot convert {} to {}", from, to)?;
                if let Some(detail) = detail {
                    write!(f, ": {}", detail)?;
                }
                Ok(())
            }
            Error::ScriptFault(fault) => write!(f, "script fault: {}", fault.message()),
            Error::LimitExceeded(msg) => write!(f, "{}", msg),
            Error::StaleHandle => write!(f, "handle is no longer valid"),
            Error::CoroutineError { status } => {
                write!(f, "cannot resume {} coroutine", status)
            }
            Error::FaultInFault(msg) => write!(f, "error while handling fault: {}", msg),
            Error::Syntax(msg) => write!(f, "syntax error: {}", msg),
            Error::OutOfMemory(msg) => write!(f, "out of memory: {}", msg),
            Error::Fatal(msg) => write!(f, "fatal engine error: {}", msg),
            Error::SessionClosed => write!(f, "session is closed"),
            Error::SessionBusy => write!(f, "session is busy"),
            Error::StackExhausted => write!(f, "engine stack exhausted"),
            Error::Host(msg) => write!(f, "{}", msg),
            Error::Config(msg) => write!(f, "config error: {}", msg),
            Error::Io(msg) => write!(f, "io error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}
