//! Callables in both directions.
//!
//! Engine functions are called through the fault barrier. Host closures are
//! exposed as C closures whose only upvalue is a userdata cell owning the
//! boxed closure; the cell's `__gc` drops it.

use std::ffi::CStr;
use std::mem;
use std::os::raw::c_int;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::rc::Rc;

use mlua::ffi;

use crate::barrier::{self, CallFrame};
use crate::codec;
use crate::convert::{FromValues, IntoValues};
use crate::error::{Error, Result};
use crate::registry::Handle;
use crate::session::{registry_key, SessionInner, SessionRef};
use crate::table::Table;
use crate::value::Value;

pub(crate) type Callback = Box<dyn Fn(&SessionRef, Vec<Value>) -> Result<Vec<Value>>>;

static CALLBACK_META_KEY: u8 = 3;

struct CallbackCell {
    callback: Option<Callback>,
}

// ============================================================================
// Function
// ============================================================================

/// Handle to an engine function.
#[derive(Clone, Debug, PartialEq)]
pub struct Function(pub(crate) Handle);

impl Function {
    /// Calls the function under the fault barrier.
    ///
    /// Anything the callee raises comes back as `Error::ScriptFault` with
    /// the raised value intact.
    pub fn call<A: IntoValues, R: FromValues>(&self, args: A) -> Result<R> {
        let results = self.call_values(args.into_values())?;
        R::from_values(results)
    }

    pub fn call_values(&self, args: Vec<Value>) -> Result<Vec<Value>> {
        barrier::protected_call(&self.0, &args)
    }

    /// The table bound as `_ENV` for this function, if it has one.
    pub fn environment(&self) -> Result<Option<Table>> {
        self.0.with_pushed(|session, state| unsafe {
            barrier::ensure_stack(state, 1)?;
            if !env_upvalue(state, -1) {
                return Ok(None);
            }
            if ffi::lua_type(state, -1) != ffi::LUA_TTABLE {
                return Ok(None);
            }
            Ok(Some(Table(Handle::acquire(session, state, -1)?)))
        })
    }

    /// Rebinds `_ENV`. Returns false when the function has no `_ENV`
    /// upvalue (host callables, or chunks that never touch globals).
    pub fn set_environment(&self, env: &Table) -> Result<bool> {
        self.0.with_pushed(|session, state| unsafe {
            barrier::ensure_stack(state, 1)?;
            if !env_upvalue(state, -1) {
                return Ok(false);
            }
            ffi::lua_pop(state, 1);
            env.0.push_into(session, state)?;
            Ok(!ffi::lua_setupvalue(state, -2, 1).is_null())
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

/// Pushes upvalue 1 of the function at `index` when it is named `_ENV`.
unsafe fn env_upvalue(state: *mut ffi::lua_State, index: c_int) -> bool {
    let name = ffi::lua_getupvalue(state, index, 1);
    if name.is_null() {
        return false;
    }
    if CStr::from_ptr(name).to_bytes() != b"_ENV" {
        ffi::lua_pop(state, 1);
        return false;
    }
    true
}

// ============================================================================
// Host callables
// ============================================================================

/// Registers the metatable shared by callback cells.
pub(crate) unsafe fn install(state: *mut ffi::lua_State) {
    ffi::lua_createtable(state, 0, 3);
    ffi::lua_pushcfunction(state, callback_cell_gc);
    ffi::lua_setfield(state, -2, c"__gc".as_ptr());
    ffi::lua_pushstring(state, c"host callable".as_ptr());
    ffi::lua_setfield(state, -2, c"__name".as_ptr());
    ffi::lua_pushboolean(state, 0);
    ffi::lua_setfield(state, -2, c"__metatable".as_ptr());
    ffi::lua_rawsetp(state, ffi::LUA_REGISTRYINDEX, registry_key(&CALLBACK_META_KEY));
}

pub(crate) fn create_function(session: &Rc<SessionInner>, callback: Callback) -> Result<Function> {
    session.enter(|state| unsafe {
        let _frame = CallFrame::enter(state);
        barrier::ensure_stack(state, 4)?;
        let mut pending = Some(callback);
        barrier::protect_simple(state, 0, 1, |s| {
            let cell = ffi::lua_newuserdatauv(s, mem::size_of::<CallbackCell>(), 0) as *mut CallbackCell;
            ptr::write(cell, CallbackCell { callback: pending.take() });
            ffi::lua_rawgetp(s, ffi::LUA_REGISTRYINDEX, registry_key(&CALLBACK_META_KEY));
            ffi::lua_setmetatable(s, -2);
            ffi::lua_pushcclosure(s, call_host_function, 1);
        })?;
        Ok(Function(Handle::acquire(session, state, -1)?))
    })
}

unsafe extern "C-unwind" fn callback_cell_gc(state: *mut ffi::lua_State) -> c_int {
    let cell = ffi::lua_touserdata(state, 1) as *mut CallbackCell;
    if cell.is_null() {
        return 0;
    }
    let callback = (*cell).callback.take();
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(move || drop(callback))) {
        log::error!("host callable destructor panicked: {}", barrier::panic_message(&*payload));
    }
    0
}

/// Entry point for every host callable. Host failures and panics become
/// engine errors once the host frames have unwound.
unsafe extern "C-unwind" fn call_host_function(state: *mut ffi::lua_State) -> c_int {
    let err = match panic::catch_unwind(AssertUnwindSafe(|| invoke_callback(state))) {
        Ok(Ok(count)) => return count,
        Ok(Err(err)) => err,
        Err(payload) => Error::Host(format!(
            "host callable panicked: {}",
            barrier::panic_message(&*payload)
        )),
    };
    barrier::raise_error(state, err)
}

unsafe fn invoke_callback(state: *mut ffi::lua_State) -> Result<c_int> {
    let session = SessionInner::from_state(state).ok_or(Error::SessionClosed)?;
    let cell = ffi::lua_touserdata(state, ffi::lua_upvalueindex(1)) as *const CallbackCell;
    let callback = cell
        .as_ref()
        .and_then(|cell| cell.callback.as_ref())
        .ok_or_else(|| Error::host("host callable is no longer available"))?;

    let nargs = ffi::lua_gettop(state);
    let args = codec::read_values(&session, state, nargs)?;
    let results = {
        let _switch = session.switch_state(state);
        callback(&SessionRef::from_inner(session.clone()), args)?
    };
    codec::push_values(&session, state, &results)
}
