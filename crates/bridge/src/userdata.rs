//! Host objects inside the engine.
//!
//! A host object crosses as a full userdata whose block holds an `Rc` to the
//! object. All such userdata share one metatable whose `__gc` drops the
//! `Rc`, so the object lives exactly as long as the engine can reach it.
//! A weak-valued anchors table maps small integers to live userdata, which
//! lets a [`HostLink`] find its cell again without keeping it alive.

use std::any::Any;
use std::mem;
use std::os::raw::c_int;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::rc::{Rc, Weak};

use mlua::ffi;

use crate::barrier::{self, CallFrame};
use crate::error::{Error, Result};
use crate::registry::Handle;
use crate::session::{registry_key, SessionInner};
use crate::value::HostObject;

static HOST_META_KEY: u8 = 1;
static ANCHORS_KEY: u8 = 2;

struct HostCell {
    object: Option<Rc<dyn Any>>,
    anchor: u64,
}

/// Registers the shared host-object metatable and the anchors table.
/// Runs inside the session bootstrap, under protection.
pub(crate) unsafe fn install(state: *mut ffi::lua_State) {
    ffi::lua_createtable(state, 0, 3);
    ffi::lua_pushcfunction(state, host_cell_gc);
    ffi::lua_setfield(state, -2, c"__gc".as_ptr());
    ffi::lua_pushstring(state, c"host object".as_ptr());
    ffi::lua_setfield(state, -2, c"__name".as_ptr());
    ffi::lua_pushboolean(state, 0);
    ffi::lua_setfield(state, -2, c"__metatable".as_ptr());
    ffi::lua_rawsetp(state, ffi::LUA_REGISTRYINDEX, registry_key(&HOST_META_KEY));

    ffi::lua_createtable(state, 0, 0);
    ffi::lua_createtable(state, 0, 1);
    ffi::lua_pushstring(state, c"v".as_ptr());
    ffi::lua_setfield(state, -2, c"__mode".as_ptr());
    ffi::lua_setmetatable(state, -2);
    ffi::lua_rawsetp(state, ffi::LUA_REGISTRYINDEX, registry_key(&ANCHORS_KEY));
}

/// Wraps `object` in a new userdata on top of the stack.
pub(crate) unsafe fn push_host_object(
    session: &SessionInner,
    state: *mut ffi::lua_State,
    object: Rc<dyn Any>,
) -> Result<()> {
    barrier::ensure_stack(state, 4)?;
    let anchor = session.next_anchor();
    let mut pending = Some(object);
    barrier::protect_simple(state, 0, 1, |s| {
        let cell = ffi::lua_newuserdatauv(s, mem::size_of::<HostCell>(), 0) as *mut HostCell;
        ptr::write(cell, HostCell { object: pending.take(), anchor });
        session.host_object_created();
        ffi::lua_rawgetp(s, ffi::LUA_REGISTRYINDEX, registry_key(&HOST_META_KEY));
        ffi::lua_setmetatable(s, -2);

        ffi::lua_rawgetp(s, ffi::LUA_REGISTRYINDEX, registry_key(&ANCHORS_KEY));
        ffi::lua_pushvalue(s, -2);
        ffi::lua_rawseti(s, -2, anchor as ffi::lua_Integer);
        ffi::lua_pop(s, 1);
    })
}

unsafe extern "C-unwind" fn host_cell_gc(state: *mut ffi::lua_State) -> c_int {
    let cell = ffi::lua_touserdata(state, 1) as *mut HostCell;
    if cell.is_null() {
        return 0;
    }
    let object = (*cell).object.take();
    if object.is_some() {
        if let Some(session) = SessionInner::raw_from_state(state) {
            session.host_object_released();
        }
    }
    // A panicking destructor must not unwind into the collector.
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(move || drop(object))) {
        log::error!("host object destructor panicked: {}", barrier::panic_message(&*payload));
    }
    0
}

/// The cell behind the value at `index`, when it is one of our userdata.
unsafe fn host_cell(state: *mut ffi::lua_State, index: c_int) -> Option<*mut HostCell> {
    let index = ffi::lua_absindex(state, index);
    if ffi::lua_type(state, index) != ffi::LUA_TUSERDATA || ffi::lua_checkstack(state, 2) == 0 {
        return None;
    }
    if ffi::lua_getmetatable(state, index) == 0 {
        return None;
    }
    ffi::lua_rawgetp(state, ffi::LUA_REGISTRYINDEX, registry_key(&HOST_META_KEY));
    let ours = ffi::lua_rawequal(state, -1, -2) != 0;
    ffi::lua_pop(state, 2);
    if ours {
        Some(ffi::lua_touserdata(state, index) as *mut HostCell)
    } else {
        None
    }
}

/// Takes the object out of the cell at `index`. Returns false when there was
/// nothing to release.
unsafe fn release_cell(session: &SessionInner, state: *mut ffi::lua_State, index: c_int) -> bool {
    let Some(cell) = host_cell(state, index) else {
        return false;
    };
    match (*cell).object.take() {
        Some(object) => {
            session.host_object_released();
            drop(object);
            true
        }
        None => false,
    }
}

// ============================================================================
// UserData
// ============================================================================

/// Handle to a full userdata in the engine.
#[derive(Clone, Debug, PartialEq)]
pub struct UserData(pub(crate) Handle);

impl UserData {
    /// True when this userdata wraps a host object that is still held.
    pub fn is_host_object(&self) -> Result<bool> {
        Ok(self.host_object()?.is_some())
    }

    pub fn host_object(&self) -> Result<Option<HostObject>> {
        self.0.with_pushed(|_, state| unsafe {
            let object = host_cell(state, -1).and_then(|cell| (*cell).object.clone());
            Ok(object.map(HostObject::from_rc))
        })
    }

    /// The wrapped host object as `T`, if it is one.
    pub fn borrow<T: Any>(&self) -> Result<Option<Rc<T>>> {
        Ok(self.host_object()?.and_then(|object| object.downcast::<T>()))
    }

    /// Drops the engine's hold on the host object now instead of at
    /// collection. The userdata stays valid but empty.
    pub fn release_host(&self) -> Result<bool> {
        self.0.with_pushed(|session, state| unsafe { Ok(release_cell(session, state, -1)) })
    }

    /// A link that can release the host object after this handle is gone.
    pub fn link(&self) -> Result<Option<HostLink>> {
        self.0.with_pushed(|session, state| unsafe {
            Ok(host_cell(state, -1).map(|cell| HostLink {
                session: Rc::downgrade(session),
                anchor: (*cell).anchor,
            }))
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

/// Weak route back to a host object's userdata.
///
/// Holding a link keeps neither the userdata nor the session alive.
#[derive(Debug, Clone)]
pub struct HostLink {
    session: Weak<SessionInner>,
    anchor: u64,
}

impl HostLink {
    /// Releases the host object if its userdata is still alive.
    pub fn release(&self) -> Result<bool> {
        let session = self.session.upgrade().ok_or(Error::SessionClosed)?;
        session.enter(|state| unsafe {
            let _frame = CallFrame::enter(state);
            barrier::ensure_stack(state, 2)?;
            ffi::lua_rawgetp(state, ffi::LUA_REGISTRYINDEX, registry_key(&ANCHORS_KEY));
            ffi::lua_rawgeti(state, -1, self.anchor as ffi::lua_Integer);
            Ok(release_cell(&session, state, -1))
        })
    }

    pub fn is_alive(&self) -> bool {
        let Some(session) = self.session.upgrade() else {
            return false;
        };
        session
            .enter(|state| unsafe {
                let _frame = CallFrame::enter(state);
                barrier::ensure_stack(state, 2)?;
                ffi::lua_rawgetp(state, ffi::LUA_REGISTRYINDEX, registry_key(&ANCHORS_KEY));
                ffi::lua_rawgeti(state, -1, self.anchor as ffi::lua_Integer);
                Ok(host_cell(state, -1).is_some_and(|cell| (*cell).object.is_some()))
            })
            .unwrap_or(false)
    }
}
