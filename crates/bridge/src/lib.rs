//! Bridge between Rust host values and an embedded Lua 5.4 engine.
//!
//! # Architecture
//!
//! - `session`  owns the engine state, limits, hooks and diagnostics
//! - `codec`    moves values between host `Value`s and the engine stack
//! - `registry` anchors engine objects behind counted handles
//! - `barrier`  runs every raising engine operation under `lua_pcall` and
//!   raises host failures back into the engine
//! - `function`, `table`, `thread`, `userdata` are the typed handles
//! - `hooks`    debug hooks plus the instruction and time limits
//! - `memory`   the instrumented allocator behind the memory limit
//!
//! ```no_run
//! use lunabridge::{Session, SessionConfig};
//!
//! let session = Session::open(SessionConfig::default().sandboxed())?;
//! let add = session.create_function(|_, (a, b): (i64, i64)| Ok(a + b))?;
//! session.globals()?.set("add", add)?;
//! let sum: i64 = session.exec("return add(2, 3)")?;
//! assert_eq!(sum, 5);
//! # Ok::<(), lunabridge::Error>(())
//! ```

mod barrier;
mod codec;
pub mod config;
mod convert;
mod error;
mod function;
mod hooks;
mod memory;
mod registry;
mod session;
mod table;
mod thread;
mod userdata;
mod value;

pub use config::{SessionConfig, UnrepresentablePolicy, DEFAULT_HOOK_INTERVAL};
pub use convert::{FromValue, FromValues, IntoValue, IntoValues};
pub use error::{Error, Fault, Result};
pub use function::Function;
pub use hooks::{HookEvent, HookEventKind, HookKind};
pub use session::{live_sessions, Session, SessionId, SessionRef, SessionSummary};
pub use table::Table;
pub use thread::{Thread, ThreadStatus};
pub use userdata::{HostLink, UserData};
pub use value::{HostObject, Kind, LuaString, Value};
