//! Fault barrier.
//!
//! Engine errors are non-local jumps. Every host entry into the engine that
//! can raise runs under `lua_pcall`, so a raise never crosses a host frame
//! that owns resources. The other direction goes through [`raise_error`]:
//! host failures become engine errors only after every host value on the way
//! has been dropped.
//!
//! Two flavours of protection:
//! - [`protect_simple`] for bookkeeping steps (string pushes, registry
//!   anchoring) where the raised value is only ever a message.
//! - [`protect`] and [`protected_call`] which materialize the raised value
//!   into a [`Fault`] through the codec.

use std::any::Any;
use std::ffi::CStr;
use std::mem::MaybeUninit;
use std::os::raw::{c_char, c_int, c_void};
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::rc::Rc;

use mlua::ffi;

use crate::codec;
use crate::error::{Error, Fault, Result};
use crate::registry::Handle;
use crate::session::SessionInner;
use crate::value::{LuaString, Value};

// ============================================================================
// Stack discipline
// ============================================================================

/// Restores the stack top it saw on entry when dropped.
pub(crate) struct CallFrame {
    state: *mut ffi::lua_State,
    depth: c_int,
}

impl CallFrame {
    pub(crate) unsafe fn enter(state: *mut ffi::lua_State) -> Self {
        Self { state, depth: ffi::lua_gettop(state) }
    }
}

impl Drop for CallFrame {
    fn drop(&mut self) {
        unsafe { ffi::lua_settop(self.state, self.depth) }
    }
}

pub(crate) unsafe fn ensure_stack(state: *mut ffi::lua_State, extra: c_int) -> Result<()> {
    if extra < 0 || ffi::lua_checkstack(state, extra) == 0 {
        return Err(Error::StackExhausted);
    }
    Ok(())
}

// ============================================================================
// Protection
// ============================================================================

/// Runs `f` inside `lua_pcall`.
///
/// The top `nargs` values are handed to `f`'s frame; on success `nresults`
/// values (or all of them for `LUA_MULTRET`) replace them. On failure the
/// raised value is left on top and the status code is returned. The caller
/// reserves two extra stack slots.
///
/// `f` must only perform engine operations. It may not own anything with a
/// destructor across a call that can raise.
pub(crate) unsafe fn protect_raw<F, R>(
    state: *mut ffi::lua_State,
    nargs: c_int,
    nresults: c_int,
    f: F,
) -> std::result::Result<R, c_int>
where
    F: FnMut(*mut ffi::lua_State) -> R,
{
    struct Params<F, R> {
        function: F,
        result: MaybeUninit<R>,
        nresults: c_int,
    }

    unsafe extern "C-unwind" fn trampoline<F, R>(state: *mut ffi::lua_State) -> c_int
    where
        F: FnMut(*mut ffi::lua_State) -> R,
    {
        let params = ffi::lua_touserdata(state, -1) as *mut Params<F, R>;
        ffi::lua_pop(state, 1);
        let result = ((*params).function)(state);
        (*params).result.write(result);
        if (*params).nresults == ffi::LUA_MULTRET {
            ffi::lua_gettop(state)
        } else {
            (*params).nresults
        }
    }

    let base = ffi::lua_gettop(state) - nargs;
    ffi::lua_pushcfunction(state, trampoline::<F, R>);
    if nargs > 0 {
        ffi::lua_rotate(state, base + 1, 1);
    }
    let mut params = Params { function: f, result: MaybeUninit::uninit(), nresults };
    ffi::lua_pushlightuserdata(state, &mut params as *mut Params<F, R> as *mut c_void);

    let status = ffi::lua_pcall(state, nargs + 1, nresults, 0);
    if status == ffi::LUA_OK {
        Ok(params.result.assume_init())
    } else {
        Err(status)
    }
}

/// Protection for bookkeeping; a failure is summarized without the codec.
pub(crate) unsafe fn protect_simple<F, R>(
    state: *mut ffi::lua_State,
    nargs: c_int,
    nresults: c_int,
    f: F,
) -> Result<R>
where
    F: FnMut(*mut ffi::lua_State) -> R,
{
    ensure_stack(state, 2)?;
    protect_raw(state, nargs, nresults, f).map_err(|status| summarize_fault(state, status))
}

/// Protection for operations that may run script code (metamethods).
pub(crate) unsafe fn protect<F, R>(
    session: &Rc<SessionInner>,
    state: *mut ffi::lua_State,
    nargs: c_int,
    nresults: c_int,
    f: F,
) -> Result<R>
where
    F: FnMut(*mut ffi::lua_State) -> R,
{
    ensure_stack(state, 2)?;
    protect_raw(state, nargs, nresults, f).map_err(|status| take_fault(session, state, status))
}

/// Calls the referenced callable with `args` under the fault barrier.
///
/// The stack is back at its entry depth afterwards, on every path.
pub(crate) fn protected_call(callee: &Handle, args: &[Value]) -> Result<Vec<Value>> {
    let session = callee.session().clone();
    callee.id()?;
    session.enter(|state| unsafe {
        let _frame = CallFrame::enter(state);
        let nargs = c_int::try_from(args.len()).map_err(|_| Error::StackExhausted)?;
        ensure_stack(state, 2)?;

        ffi::lua_pushcfunction(state, traceback_handler);
        let handler = ffi::lua_gettop(state);
        callee.push(state)?;
        codec::push_values(&session, state, args)?;

        let status = ffi::lua_pcall(state, nargs, ffi::LUA_MULTRET, handler);
        if status != ffi::LUA_OK {
            return Err(take_fault(&session, state, status));
        }
        let count = ffi::lua_gettop(state) - handler;
        codec::read_values(&session, state, count)
    })
}

// ============================================================================
// Engine -> host
// ============================================================================

/// Text form of the value on top, without running conversions that could
/// raise.
pub(crate) unsafe fn describe_top(state: *mut ffi::lua_State) -> String {
    match ffi::lua_type(state, -1) {
        ffi::LUA_TSTRING => {
            let mut len = 0usize;
            let data = ffi::lua_tolstring(state, -1, &mut len);
            let bytes = std::slice::from_raw_parts(data as *const u8, len);
            String::from_utf8_lossy(bytes).into_owned()
        }
        ffi::LUA_TNUMBER => {
            if ffi::lua_isinteger(state, -1) != 0 {
                ffi::lua_tointeger(state, -1).to_string()
            } else {
                ffi::lua_tonumber(state, -1).to_string()
            }
        }
        tag => {
            let name = CStr::from_ptr(ffi::lua_typename(state, tag));
            format!("({} value)", name.to_string_lossy())
        }
    }
}

/// Pops the raised value and classifies it from its status and text only.
pub(crate) unsafe fn summarize_fault(state: *mut ffi::lua_State, status: c_int) -> Error {
    let message = describe_top(state);
    ffi::lua_pop(state, 1);
    match status {
        ffi::LUA_ERRMEM => {
            log::error!("engine allocation failed: {}", message);
            Error::OutOfMemory(message)
        }
        ffi::LUA_ERRSYNTAX => Error::Syntax(message),
        ffi::LUA_ERRERR => Error::FaultInFault(message),
        _ => Error::ScriptFault(Box::new(Fault::new(Value::String(LuaString::from(message))))),
    }
}

/// Pops the raised value and turns it into the host error it stands for.
pub(crate) unsafe fn take_fault(
    session: &Rc<SessionInner>,
    state: *mut ffi::lua_State,
    status: c_int,
) -> Error {
    if matches!(status, ffi::LUA_ERRMEM | ffi::LUA_ERRSYNTAX | ffi::LUA_ERRERR) {
        session.take_traceback();
        return summarize_fault(state, status);
    }
    let traceback = session.take_traceback();
    if let Some(message) = session.take_limit_trip() {
        ffi::lua_pop(state, 1);
        log::warn!("session {}: {}", session.id(), message);
        return Error::LimitExceeded(message);
    }

    let payload = codec::read_value(session, state, -1);
    ffi::lua_pop(state, 1);
    match payload {
        Ok(payload) => Error::ScriptFault(Box::new(Fault { payload, traceback })),
        Err(err) => {
            log::warn!("fault payload could not be converted: {}", err);
            Error::FaultInFault(err.to_string())
        }
    }
}

/// Message handler for host-initiated calls. Records a traceback and hands
/// the raised value back untouched.
pub(crate) unsafe extern "C-unwind" fn traceback_handler(state: *mut ffi::lua_State) -> c_int {
    if let Some(session) = SessionInner::raw_from_state(state) {
        if session.config().capture_traceback && ffi::lua_checkstack(state, 2) != 0 {
            ffi::luaL_traceback(state, state, ptr::null(), 1);
            let text = describe_top(state);
            ffi::lua_pop(state, 1);
            session.set_traceback(Some(text));
        }
    }
    1
}

/// Traceback of a failed coroutine, rendered on `state`.
pub(crate) unsafe fn coroutine_traceback(
    state: *mut ffi::lua_State,
    co: *mut ffi::lua_State,
) -> Option<String> {
    if ffi::lua_checkstack(state, 3) == 0 {
        return None;
    }
    let rendered = protect_raw(state, 0, 1, |s| ffi::luaL_traceback(s, co, ptr::null(), 0));
    // Either the traceback or the allocation error sits on top now.
    let text = rendered.ok().map(|()| describe_top(state));
    ffi::lua_pop(state, 1);
    text
}

// ============================================================================
// Host -> engine
// ============================================================================

/// Raises `err` in the engine. Never returns.
///
/// All host values are dropped before `lua_error` jumps.
pub(crate) unsafe fn raise_error(state: *mut ffi::lua_State, err: Error) -> c_int {
    push_error_value(state, err);
    ffi::lua_error(state)
}

unsafe fn push_error_value(state: *mut ffi::lua_State, err: Error) {
    if let Error::LimitExceeded(message) = &err {
        // An inner barrier consumed the trip; the outer one still needs it.
        if let Some(session) = SessionInner::raw_from_state(state) {
            session.rearm_limit_trip(message.clone());
        }
    }
    if let Error::ScriptFault(fault) = &err {
        if let Some(session) = SessionInner::from_state(state) {
            if codec::push_value(&session, state, &fault.payload).is_ok() {
                return;
            }
        }
    }
    let message = err.script_message();
    drop(err);
    if ffi::lua_checkstack(state, 3) == 0 {
        // No room for a message; the jump carries whatever is on top.
        return;
    }
    let bytes = message.as_bytes();
    // On failure the allocation error is on top and is raised instead.
    let _ = protect_raw(state, 0, 1, |s| {
        ffi::lua_pushlstring(s, bytes.as_ptr() as *const c_char, bytes.len());
    });
}

// ============================================================================
// Panics
// ============================================================================

/// Payload of the panic raised by the engine's panic handler.
pub(crate) struct EnginePanic(pub(crate) String);

/// Installed with `lua_atpanic`. Only unprotected engine errors reach it.
pub(crate) unsafe extern "C-unwind" fn engine_panic(state: *mut ffi::lua_State) -> c_int {
    let message = describe_top(state);
    panic::panic_any(EnginePanic(message))
}

/// Runs `f`, turning an engine panic into `Error::Fatal`. The session is
/// closed since the engine state can no longer be trusted.
pub(crate) fn guard_fatal<R>(session: &SessionInner, f: impl FnOnce() -> Result<R>) -> Result<R> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => match payload.downcast::<EnginePanic>() {
            Ok(fatal) => {
                log::error!("session {}: unprotected engine error: {}", session.id(), fatal.0);
                session.abandon();
                Err(Error::Fatal(fatal.0))
            }
            Err(other) => panic::resume_unwind(other),
        },
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SessionConfig, UnrepresentablePolicy};
    use crate::session::Session;
    use crate::value::Kind;

    #[test]
    fn test_protect_simple_summarizes_error() {
        let session = Session::open_default().unwrap();
        let inner = session.inner().clone();
        inner
            .enter(|state| unsafe {
                let _frame = CallFrame::enter(state);
                let err = protect_simple(state, 0, 0, |s| {
                    ffi::lua_pushstring(s, c"boom".as_ptr());
                    ffi::lua_error(s);
                })
                .unwrap_err();
                assert_eq!(err.script_message(), "boom");
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_call_frame_restores_top() {
        let session = Session::open_default().unwrap();
        let inner = session.inner().clone();
        inner
            .enter(|state| unsafe {
                let before = ffi::lua_gettop(state);
                {
                    let _frame = CallFrame::enter(state);
                    ffi::lua_pushinteger(state, 1);
                    ffi::lua_pushinteger(state, 2);
                }
                assert_eq!(ffi::lua_gettop(state), before);
                Ok(())
            })
            .unwrap();
    }

    fn raise_light_userdata(session: &Session) -> Error {
        let inner = session.inner().clone();
        inner
            .enter(|state| unsafe {
                let _frame = CallFrame::enter(state);
                protect(&inner, state, 0, 0, |s| {
                    ffi::lua_pushlightuserdata(s, ptr::null_mut());
                    ffi::lua_error(s);
                })
            })
            .unwrap_err()
    }

    #[test]
    fn test_unreadable_payload_is_fault_in_fault() {
        let config = SessionConfig {
            unrepresentable: UnrepresentablePolicy::Fail,
            ..SessionConfig::default()
        };
        let session = Session::open(config).unwrap();
        let err = raise_light_userdata(&session);
        assert!(matches!(err, Error::FaultInFault(ref msg) if msg.contains("light userdata")), "{err:?}");
        assert_eq!(session.stack_depth().unwrap(), 0);
        assert_eq!(session.exec::<i64>("return 1 + 1").unwrap(), 2);
    }

    #[test]
    fn test_unrepresentable_payload_is_marked() {
        let session = Session::open_default().unwrap();
        let err = raise_light_userdata(&session);
        let payload = &err.fault().unwrap().payload;
        assert_eq!(*payload, Value::Unrepresentable(Kind::LightUserData));
    }

    #[test]
    fn test_unprotected_error_is_fatal() {
        let session = Session::open_default().unwrap();
        let table = session.create_table().unwrap();
        let inner = session.inner().clone();

        let err = inner
            .enter(|state| unsafe {
                raise_error(state, Error::host("unprotected"));
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(err, Error::Fatal(ref msg) if msg == "unprotected"), "{err:?}");

        assert!(session.is_closed());
        assert!(matches!(table.raw_len(), Err(Error::StaleHandle)));
        assert!(matches!(session.exec::<()>("return"), Err(Error::SessionClosed)));
        assert!(!session.close().unwrap());
    }

    #[test]
    fn test_panic_message_variants() {
        assert_eq!(panic_message(&"static"), "static");
        assert_eq!(panic_message(&String::from("owned")), "owned");
        assert_eq!(panic_message(&17u8), "non-string panic payload");
    }
}
