use std::fmt;
use std::os::raw::c_int;
use std::rc::Rc;

use mlua::ffi;

use crate::barrier::{self, CallFrame};
use crate::codec;
use crate::convert::{FromValues, IntoValues};
use crate::error::{Error, Result};
use crate::function::Function;
use crate::registry::Handle;
use crate::session::SessionInner;
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    /// Created or yielded; can be resumed.
    Suspended,
    /// Currently executing.
    Running,
    /// Resumed another coroutine and is waiting on it.
    Normal,
    /// Finished or failed.
    Dead,
}

impl fmt::Display for ThreadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThreadStatus::Suspended => write!(f, "suspended"),
            ThreadStatus::Running => write!(f, "running"),
            ThreadStatus::Normal => write!(f, "normal"),
            ThreadStatus::Dead => write!(f, "dead"),
        }
    }
}

/// Status of `co` as seen from `current`, following `coroutine.status`.
unsafe fn coroutine_status(current: *mut ffi::lua_State, co: *mut ffi::lua_State) -> ThreadStatus {
    if co == current {
        return ThreadStatus::Running;
    }
    match ffi::lua_status(co) {
        ffi::LUA_YIELD => ThreadStatus::Suspended,
        ffi::LUA_OK => {
            let mut ar: ffi::lua_Debug = std::mem::zeroed();
            if ffi::lua_getstack(co, 0, &mut ar) > 0 {
                ThreadStatus::Normal
            } else if ffi::lua_gettop(co) == 0 {
                ThreadStatus::Dead
            } else {
                ThreadStatus::Suspended
            }
        }
        _ => ThreadStatus::Dead,
    }
}

/// Handle to an engine coroutine.
#[derive(Clone, Debug, PartialEq)]
pub struct Thread(pub(crate) Handle);

impl Thread {
    pub fn status(&self) -> Result<ThreadStatus> {
        self.0.with_pushed(|_, state| unsafe {
            let co = ffi::lua_tothread(state, -1);
            Ok(coroutine_status(state, co))
        })
    }

    pub fn is_resumable(&self) -> Result<bool> {
        Ok(self.status()? == ThreadStatus::Suspended)
    }

    /// Resumes the coroutine with `args` and returns what it yields or
    /// returns.
    ///
    /// Resuming anything but a suspended coroutine fails with
    /// `Error::CoroutineError`. A fault inside the coroutine kills it and
    /// comes back as `Error::ScriptFault`.
    pub fn resume<A: IntoValues, R: FromValues>(&self, args: A) -> Result<R> {
        let results = self.resume_values(args.into_values())?;
        R::from_values(results)
    }

    pub fn resume_values(&self, args: Vec<Value>) -> Result<Vec<Value>> {
        self.0.with_pushed(|session, state| unsafe {
            let co = ffi::lua_tothread(state, -1);
            let status = coroutine_status(state, co);
            if status != ThreadStatus::Suspended {
                return Err(Error::CoroutineError { status });
            }

            let nargs = codec::push_values(session, state, &args)?;
            if ffi::lua_checkstack(co, nargs + 1) == 0 {
                return Err(Error::StackExhausted);
            }
            ffi::lua_xmove(state, co, nargs);

            let mut nresults: c_int = 0;
            let rc = ffi::lua_resume(co, state, nargs, &mut nresults);
            match rc {
                ffi::LUA_OK | ffi::LUA_YIELD => {
                    if ffi::lua_checkstack(state, nresults + 2) == 0 {
                        ffi::lua_pop(co, nresults);
                        return Err(Error::StackExhausted);
                    }
                    ffi::lua_xmove(co, state, nresults);
                    codec::read_values(session, state, nresults)
                }
                status => Err(take_coroutine_fault(session, state, co, status)),
            }
        })
    }

    /// Gives up this handle. Idempotent.
    pub fn release(&self) -> bool {
        self.0.release()
    }

    pub fn is_valid(&self) -> bool {
        self.0.is_valid()
    }
}

/// Moves the raised value from `co` to `state` and materializes it.
unsafe fn take_coroutine_fault(
    session: &Rc<SessionInner>,
    state: *mut ffi::lua_State,
    co: *mut ffi::lua_State,
    status: c_int,
) -> Error {
    if session.config().capture_traceback && status == ffi::LUA_ERRRUN {
        session.set_traceback(barrier::coroutine_traceback(state, co));
    }
    if ffi::lua_checkstack(state, 3) == 0 {
        ffi::lua_pop(co, 1);
        session.take_traceback();
        return Error::StackExhausted;
    }
    ffi::lua_xmove(co, state, 1);
    barrier::take_fault(session, state, status)
}

pub(crate) fn create_thread(session: &Rc<SessionInner>, body: &Function) -> Result<Thread> {
    body.0.id()?;
    session.enter(|state| unsafe {
        let _frame = CallFrame::enter(state);
        let co = barrier::protect_simple(state, 0, 1, |s| ffi::lua_newthread(s))?;
        if ffi::lua_checkstack(co, 1) == 0 {
            return Err(Error::StackExhausted);
        }
        body.0.push_into(session, state)?;
        ffi::lua_xmove(state, co, 1);
        Ok(Thread(Handle::acquire(session, state, -1)?))
    })
}
