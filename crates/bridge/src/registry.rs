//! Handles on engine-owned objects.
//!
//! A handle anchors its object in the engine registry so the collector keeps
//! it alive. Each anchor has a holder count: cloning a handle adds a holder,
//! releasing or dropping removes one, and the registry slot is freed when the
//! last holder lets go. Closing the session invalidates every anchor at once.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::os::raw::{c_int, c_void};
use std::rc::Rc;

use mlua::ffi;

use crate::barrier::{self, CallFrame};
use crate::error::{Error, Result};
use crate::session::SessionInner;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct HandleId(u64);

struct Slot {
    key: c_int,
    holders: usize,
}

/// Per-session map from handle ids to engine registry keys.
#[derive(Default)]
pub(crate) struct RefRegistry {
    slots: RefCell<HashMap<HandleId, Slot>>,
    next_id: Cell<u64>,
}

impl RefRegistry {
    /// Anchors the value at `index` and returns a fresh id with one holder.
    pub(crate) unsafe fn acquire(&self, state: *mut ffi::lua_State, index: c_int) -> Result<HandleId> {
        barrier::ensure_stack(state, 1)?;
        ffi::lua_pushvalue(state, index);
        let key = barrier::protect_simple(state, 1, 0, |s| ffi::luaL_ref(s, ffi::LUA_REGISTRYINDEX))?;
        let id = HandleId(self.next_id.get() + 1);
        self.next_id.set(id.0);
        self.slots.borrow_mut().insert(id, Slot { key, holders: 1 });
        Ok(id)
    }

    pub(crate) fn retain(&self, id: HandleId) -> bool {
        match self.slots.borrow_mut().get_mut(&id) {
            Some(slot) => {
                slot.holders += 1;
                true
            }
            None => false,
        }
    }

    /// Drops one holder. Returns true when the registry slot was freed.
    pub(crate) unsafe fn release(&self, state: *mut ffi::lua_State, id: HandleId) -> bool {
        let key = {
            let mut slots = self.slots.borrow_mut();
            let Some(slot) = slots.get_mut(&id) else {
                return false;
            };
            slot.holders -= 1;
            if slot.holders > 0 {
                return false;
            }
            let key = slot.key;
            slots.remove(&id);
            key
        };
        if !state.is_null() {
            ffi::luaL_unref(state, ffi::LUA_REGISTRYINDEX, key);
        }
        true
    }

    pub(crate) unsafe fn push(&self, state: *mut ffi::lua_State, id: HandleId) -> Result<()> {
        let key = self
            .slots
            .borrow()
            .get(&id)
            .map(|slot| slot.key)
            .ok_or(Error::StaleHandle)?;
        barrier::ensure_stack(state, 1)?;
        ffi::lua_rawgeti(state, ffi::LUA_REGISTRYINDEX, key as ffi::lua_Integer);
        Ok(())
    }

    /// Forgets every anchor. Used when the engine state goes away.
    pub(crate) fn invalidate_all(&self) -> usize {
        let mut slots = self.slots.borrow_mut();
        let count = slots.len();
        slots.clear();
        count
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.slots.borrow().len()
    }

    #[cfg(test)]
    pub(crate) fn holders(&self, id: HandleId) -> usize {
        self.slots.borrow().get(&id).map_or(0, |slot| slot.holders)
    }
}

// ============================================================================
// Handle
// ============================================================================

/// Counted reference to one engine object.
pub(crate) struct Handle {
    session: Rc<SessionInner>,
    id: Cell<Option<HandleId>>,
}

impl Handle {
    pub(crate) fn new(session: Rc<SessionInner>, id: HandleId) -> Self {
        Self { session, id: Cell::new(Some(id)) }
    }

    /// Anchors the value at `index` of `state` in `session`.
    pub(crate) unsafe fn acquire(
        session: &Rc<SessionInner>,
        state: *mut ffi::lua_State,
        index: c_int,
    ) -> Result<Self> {
        let id = session.refs().acquire(state, index)?;
        Ok(Self::new(session.clone(), id))
    }

    pub(crate) fn session(&self) -> &Rc<SessionInner> {
        &self.session
    }

    pub(crate) fn id(&self) -> Result<HandleId> {
        if self.session.is_closed() {
            return Err(Error::StaleHandle);
        }
        self.id.get().ok_or(Error::StaleHandle)
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.id().is_ok()
    }

    pub(crate) unsafe fn push(&self, state: *mut ffi::lua_State) -> Result<()> {
        let id = self.id()?;
        self.session.refs().push(state, id)
    }

    /// Pushes for `target`, rejecting handles that belong to another session.
    pub(crate) unsafe fn push_into(&self, target: &SessionInner, state: *mut ffi::lua_State) -> Result<()> {
        if !std::ptr::eq(Rc::as_ptr(&self.session), target) {
            return Err(Error::unconvertible_with(
                "handle",
                "engine value",
                format!(
                    "handle belongs to session {}, not session {}",
                    self.session.id(),
                    target.id()
                ),
            ));
        }
        self.push(state)
    }

    /// Gives up this handle's hold. Idempotent.
    pub(crate) fn release(&self) -> bool {
        match self.id.take() {
            Some(id) => unsafe { self.session.refs().release(self.session.current_state(), id) },
            None => false,
        }
    }

    /// Runs `f` with the referenced value on top of the current stack. The
    /// stack is restored afterwards.
    pub(crate) fn with_pushed<R>(
        &self,
        f: impl FnOnce(&Rc<SessionInner>, *mut ffi::lua_State) -> Result<R>,
    ) -> Result<R> {
        self.id()?;
        self.session.enter(|state| unsafe {
            let _frame = CallFrame::enter(state);
            self.push(state)?;
            f(&self.session, state)
        })
    }

    /// Address of the engine object, for identity comparison.
    pub(crate) fn to_pointer(&self) -> Result<*const c_void> {
        self.with_pushed(|_, state| unsafe { Ok(ffi::lua_topointer(state, -1)) })
    }

    #[cfg(test)]
    pub(crate) fn holders(&self) -> usize {
        self.id.get().map_or(0, |id| self.session.refs().holders(id))
    }
}

impl Clone for Handle {
    fn clone(&self) -> Self {
        let id = self.id.get().filter(|id| self.session.refs().retain(*id));
        Self { session: self.session.clone(), id: Cell::new(id) }
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.release();
    }
}

/// Two handles are equal when they reach the same engine object.
impl PartialEq for Handle {
    fn eq(&self, other: &Self) -> bool {
        if !Rc::ptr_eq(&self.session, &other.session) {
            return false;
        }
        match (self.to_pointer(), other.to_pointer()) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("session", &self.session.id())
            .field("id", &self.id.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Session;

    #[test]
    fn test_clone_and_release_count_holders() {
        let session = Session::open_default().unwrap();
        let table = session.create_table().unwrap();
        let before = session.outstanding_handles();

        let copy = table.clone();
        assert_eq!(table.0.holders(), 2);
        assert_eq!(session.outstanding_handles(), before);

        assert!(!copy.release());
        assert!(!copy.release());
        assert_eq!(table.0.holders(), 1);

        assert!(table.release());
        assert_eq!(session.outstanding_handles(), before - 1);
        assert!(matches!(table.raw_len(), Err(Error::StaleHandle)));
    }

    #[test]
    fn test_foreign_handle_rejected() {
        let a = Session::open_default().unwrap();
        let b = Session::open_default().unwrap();
        let table = a.create_table().unwrap();
        let globals = b.globals().unwrap();
        let err = globals.set("t", table).unwrap_err();
        assert!(matches!(err, Error::UnconvertibleType { .. }));
    }

    #[test]
    fn test_handles_invalidated_on_close() {
        let session = Session::open_default().unwrap();
        let table = session.create_table().unwrap();
        assert!(table.0.is_valid());
        session.close().unwrap();
        assert!(!table.0.is_valid());
        assert_eq!(session.outstanding_handles(), 0);
        assert!(matches!(table.get::<_, i64>(1), Err(Error::StaleHandle)));
    }
}
