//! Engine sessions.
//!
//! # Architecture
//!
//! - `Session` owns one engine state and closes it when dropped
//! - `SessionRef` is a cheap, cloneable view used by handles and callbacks
//! - `SessionInner` holds the state pointers, the handle registry, hooks,
//!   limits and allocator accounting
//! - The engine registry stores a light pointer back to `SessionInner`, so
//!   engine-side entry points (callables, hooks, finalizers) can find it
//!
//! A session is single-threaded. Re-entrant use from inside host callables
//! and hooks is allowed; closing is refused while any call is in flight.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::ffi::{CStr, CString};
use std::fmt;
use std::ops::Deref;
use std::os::raw::{c_char, c_void};
use std::path::Path;
use std::ptr;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use mlua::ffi;
use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::barrier::{self, CallFrame};
use crate::config::SessionConfig;
use crate::convert::{FromValues, IntoValues};
use crate::error::{Error, Result};
use crate::function::{self, Function};
use crate::hooks::{self, HookEvent, HookKind, HookTable};
use crate::memory::{self, MemoryState};
use crate::registry::{Handle, RefRegistry};
use crate::table::Table;
use crate::thread::{self, Thread};
use crate::userdata::{self, UserData};

// =============================================================================
// Identity
// =============================================================================

/// Unique identifier for a session within the process.
pub type SessionId = u64;

/// Monotonically increasing session ID counter.
static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Open sessions, for diagnostics.
static SESSIONS: Lazy<Mutex<BTreeMap<SessionId, String>>> =
    Lazy::new(|| Mutex::new(BTreeMap::new()));

static SESSION_KEY: u8 = 0;

/// Globals removed by `sandbox = true`.
const SANDBOXED_GLOBALS: [&CStr; 8] = [
    c"os",
    c"io",
    c"debug",
    c"package",
    c"require",
    c"loadfile",
    c"dofile",
    c"load",
];

/// Light-userdata key for a registry slot owned by this crate.
pub(crate) fn registry_key(tag: &'static u8) -> *const c_void {
    tag as *const u8 as *const c_void
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub id: SessionId,
    pub name: String,
}

/// Sessions currently open in this process, oldest first.
pub fn live_sessions() -> Vec<SessionSummary> {
    SESSIONS
        .lock()
        .iter()
        .map(|(id, name)| SessionSummary { id: *id, name: name.clone() })
        .collect()
}

// =============================================================================
// Inner state
// =============================================================================

pub(crate) struct SessionInner {
    id: SessionId,
    name: String,
    this: Weak<SessionInner>,
    config: SessionConfig,
    main: Cell<*mut ffi::lua_State>,
    /// State whose stack host operations use: the main state, or the
    /// coroutine that called into the host.
    current: Cell<*mut ffi::lua_State>,
    memory: Box<MemoryState>,
    refs: RefRegistry,
    hooks: RefCell<HookTable>,
    depth: Cell<u32>,
    call_started: Cell<Option<Instant>>,
    instructions: Cell<u64>,
    limit_trip: RefCell<Option<String>>,
    traceback: RefCell<Option<String>>,
    host_objects: Cell<usize>,
    next_anchor: Cell<u64>,
}

impl SessionInner {
    /// The session registered in `state`, borrowed without touching its
    /// reference count. Usable while the session is being dropped.
    pub(crate) unsafe fn raw_from_state<'a>(state: *mut ffi::lua_State) -> Option<&'a SessionInner> {
        if ffi::lua_checkstack(state, 1) == 0 {
            return None;
        }
        ffi::lua_rawgetp(state, ffi::LUA_REGISTRYINDEX, registry_key(&SESSION_KEY));
        let inner = ffi::lua_touserdata(state, -1) as *const SessionInner;
        ffi::lua_pop(state, 1);
        inner.as_ref()
    }

    pub(crate) unsafe fn from_state(state: *mut ffi::lua_State) -> Option<Rc<SessionInner>> {
        Self::raw_from_state(state)?.this.upgrade()
    }

    pub(crate) fn id(&self) -> SessionId {
        self.id
    }

    pub(crate) fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub(crate) fn refs(&self) -> &RefRegistry {
        &self.refs
    }

    pub(crate) fn hooks(&self) -> &RefCell<HookTable> {
        &self.hooks
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.main.get().is_null()
    }

    /// Null once the session is closed.
    pub(crate) fn current_state(&self) -> *mut ffi::lua_State {
        self.current.get()
    }

    /// Runs `f` against the current state, tracking call depth and turning
    /// engine panics into `Error::Fatal`.
    pub(crate) fn enter<R>(&self, f: impl FnOnce(*mut ffi::lua_State) -> Result<R>) -> Result<R> {
        let state = self.current.get();
        if state.is_null() {
            return Err(Error::SessionClosed);
        }
        let _depth = DepthGuard::new(self);
        barrier::guard_fatal(self, || f(state))
    }

    /// Makes `state` current until the guard drops.
    pub(crate) fn switch_state(&self, state: *mut ffi::lua_State) -> StateSwitch<'_> {
        let previous = self.current.replace(state);
        StateSwitch { session: self, previous }
    }

    pub(crate) fn take_traceback(&self) -> Option<String> {
        self.traceback.borrow_mut().take()
    }

    pub(crate) fn set_traceback(&self, traceback: Option<String>) {
        *self.traceback.borrow_mut() = traceback;
    }

    pub(crate) fn take_limit_trip(&self) -> Option<String> {
        self.limit_trip.borrow_mut().take()
    }

    /// Charges one hook tick against the running call and fails once a
    /// limit is crossed.
    pub(crate) fn check_limits(&self) -> Result<()> {
        let (tick, instruction_limit, time_limit) = {
            let hooks = self.hooks.borrow();
            (hooks.tick(), hooks.instruction_limit(), hooks.time_limit())
        };
        let executed = self.instructions.get() + u64::from(tick);
        self.instructions.set(executed);

        if let Some(limit) = instruction_limit {
            if executed > limit {
                return Err(self.trip(format!("instruction limit exceeded ({} instructions)", limit)));
            }
        }
        if let (Some(limit), Some(started)) = (time_limit, self.call_started.get()) {
            if started.elapsed() > limit {
                return Err(self.trip(format!("execution timeout ({} ms limit)", limit.as_millis())));
            }
        }
        Ok(())
    }

    fn trip(&self, message: String) -> Error {
        self.rearm_limit_trip(message.clone());
        Error::Host(message)
    }

    /// Marks the running call as stopped by a limit, so the outermost
    /// barrier reports `Error::LimitExceeded` whatever frames the error
    /// crosses on the way out.
    pub(crate) fn rearm_limit_trip(&self, message: String) {
        *self.limit_trip.borrow_mut() = Some(message);
    }

    pub(crate) fn next_anchor(&self) -> u64 {
        let anchor = self.next_anchor.get() + 1;
        self.next_anchor.set(anchor);
        anchor
    }

    pub(crate) fn host_object_created(&self) {
        self.host_objects.set(self.host_objects.get() + 1);
    }

    pub(crate) fn host_object_released(&self) {
        self.host_objects.set(self.host_objects.get().saturating_sub(1));
    }

    fn apply_hooks(&self) -> Result<()> {
        self.enter(|state| unsafe {
            let hooks = self.hooks.borrow();
            let main = self.main.get();
            hooks::apply(main, &hooks);
            if state != main {
                hooks::apply(state, &hooks);
            }
            Ok(())
        })
    }

    fn close(&self) -> Result<bool> {
        if self.is_closed() {
            return Ok(false);
        }
        if self.depth.get() > 0 {
            return Err(Error::SessionBusy);
        }
        Ok(self.shutdown())
    }

    /// Closes after an unprotected engine error.
    pub(crate) fn abandon(&self) {
        self.shutdown();
    }

    fn shutdown(&self) -> bool {
        let state = self.main.replace(ptr::null_mut());
        self.current.set(ptr::null_mut());
        if state.is_null() {
            return false;
        }
        let handles = self.refs.invalidate_all();
        let hooks = std::mem::replace(&mut *self.hooks.borrow_mut(), HookTable::new(&self.config));
        unsafe { ffi::lua_close(state) };
        drop(hooks);
        self.traceback.borrow_mut().take();
        SESSIONS.lock().remove(&self.id);
        log::debug!(
            "closed session {} ({}), invalidated {} handle(s), {} bytes still accounted",
            self.id,
            self.name,
            handles,
            self.memory.used()
        );
        true
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Tracks nesting of host entries. The outermost entry starts the clock for
/// the time and instruction limits.
struct DepthGuard<'a> {
    session: &'a SessionInner,
}

impl<'a> DepthGuard<'a> {
    fn new(session: &'a SessionInner) -> Self {
        if session.depth.get() == 0 {
            session.call_started.set(Some(Instant::now()));
            session.instructions.set(0);
            session.limit_trip.borrow_mut().take();
        }
        session.depth.set(session.depth.get() + 1);
        Self { session }
    }
}

impl Drop for DepthGuard<'_> {
    fn drop(&mut self) {
        let depth = self.session.depth.get().saturating_sub(1);
        self.session.depth.set(depth);
        if depth == 0 {
            self.session.call_started.set(None);
        }
    }
}

pub(crate) struct StateSwitch<'a> {
    session: &'a SessionInner,
    previous: *mut ffi::lua_State,
}

impl Drop for StateSwitch<'_> {
    fn drop(&mut self) {
        if !self.session.is_closed() {
            self.session.current.set(self.previous);
        }
    }
}

// =============================================================================
// Public API
// =============================================================================

/// Owning handle to an engine session. Dropping it closes the engine.
pub struct Session {
    session: SessionRef,
}

impl Session {
    pub fn open(config: SessionConfig) -> Result<Self> {
        config.validate()?;
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        let name = config.name.clone().unwrap_or_else(|| format!("session-{}", id));
        let inner = Rc::new_cyclic(|this| SessionInner {
            id,
            name: name.clone(),
            this: this.clone(),
            memory: Box::new(MemoryState::new(config.memory_limit)),
            hooks: RefCell::new(HookTable::new(&config)),
            config,
            main: Cell::new(ptr::null_mut()),
            current: Cell::new(ptr::null_mut()),
            refs: RefRegistry::default(),
            depth: Cell::new(0),
            call_started: Cell::new(None),
            instructions: Cell::new(0),
            limit_trip: RefCell::new(None),
            traceback: RefCell::new(None),
            host_objects: Cell::new(0),
            next_anchor: Cell::new(0),
        });

        unsafe {
            let ud = &*inner.memory as *const MemoryState as *mut c_void;
            let state = ffi::lua_newstate(memory::engine_alloc, ud);
            if state.is_null() {
                return Err(Error::OutOfMemory("could not allocate engine state".into()));
            }
            ffi::lua_atpanic(state, barrier::engine_panic);
            inner.main.set(state);
            inner.current.set(state);
            SESSIONS.lock().insert(id, name.clone());

            if let Err(err) = bootstrap(&inner, state) {
                inner.shutdown();
                return Err(err);
            }
            hooks::apply(state, &inner.hooks.borrow());
        }

        log::debug!(
            "opened session {} ({}), {} bytes after bootstrap",
            id,
            name,
            inner.memory.used()
        );
        Ok(Session { session: SessionRef { inner } })
    }

    pub fn open_default() -> Result<Self> {
        Self::open(SessionConfig::default())
    }

    /// A non-owning view that can outlive this borrow.
    pub fn handle(&self) -> SessionRef {
        self.session.clone()
    }
}

impl Deref for Session {
    type Target = SessionRef;

    fn deref(&self) -> &SessionRef {
        &self.session
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Err(err) = self.session.close() {
            log::warn!("session {} left open on drop: {}", self.session.id(), err);
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.session.fmt(f)
    }
}

unsafe fn bootstrap(inner: &SessionInner, state: *mut ffi::lua_State) -> Result<()> {
    let session_ptr = inner as *const SessionInner as *mut c_void;
    let open_libs = inner.config.open_libs;
    let sandbox = inner.config.sandbox;
    barrier::protect_simple(state, 0, 0, |s| {
        ffi::lua_pushlightuserdata(s, session_ptr);
        ffi::lua_rawsetp(s, ffi::LUA_REGISTRYINDEX, registry_key(&SESSION_KEY));
        userdata::install(s);
        function::install(s);
        if open_libs {
            ffi::luaL_openlibs(s);
            if sandbox {
                for name in SANDBOXED_GLOBALS {
                    ffi::lua_pushnil(s);
                    ffi::lua_setglobal(s, name.as_ptr());
                }
            }
        }
    })
}

/// Cloneable, non-owning view of a session.
///
/// Handles and host callables hold one of these. Every operation fails with
/// `Error::SessionClosed` once the owning `Session` has closed the engine.
#[derive(Clone)]
pub struct SessionRef {
    inner: Rc<SessionInner>,
}

impl SessionRef {
    pub(crate) fn from_inner(inner: Rc<SessionInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn inner(&self) -> &Rc<SessionInner> {
        &self.inner
    }

    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Closes the engine. Returns false if it was already closed; fails with
    /// `Error::SessionBusy` from inside a running call.
    pub fn close(&self) -> Result<bool> {
        self.inner.close()
    }

    // -------------------------------------------------------------------------
    // Code
    // -------------------------------------------------------------------------

    /// Compiles `source` into a function without running it.
    pub fn load(&self, source: impl AsRef<[u8]>, chunk_name: &str) -> Result<Function> {
        let source = source.as_ref();
        let chunk_name = CString::new(chunk_name)
            .map_err(|_| Error::unconvertible_with("string", "chunk name", "contains a NUL byte"))?;
        let mode: &CStr = if self.inner.config.binary_chunks { c"bt" } else { c"t" };
        self.inner.enter(|state| unsafe {
            let _frame = CallFrame::enter(state);
            barrier::ensure_stack(state, 1)?;
            let status = ffi::luaL_loadbufferx(
                state,
                source.as_ptr() as *const c_char,
                source.len(),
                chunk_name.as_ptr(),
                mode.as_ptr(),
            );
            if status != ffi::LUA_OK {
                return Err(barrier::summarize_fault(state, status));
            }
            Ok(Function(Handle::acquire(&self.inner, state, -1)?))
        })
    }

    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<Function> {
        let path = path.as_ref();
        let source = std::fs::read(path).map_err(|e| Error::Io(format!("{}: {}", path.display(), e)))?;
        self.load(source, &format!("@{}", path.display()))
    }

    /// Compiles and runs `source`, converting its results to `R`.
    pub fn exec<R: FromValues>(&self, source: &str) -> Result<R> {
        self.load(source, "=exec")?.call(())
    }

    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    pub fn globals(&self) -> Result<Table> {
        self.inner.enter(|state| unsafe {
            let _frame = CallFrame::enter(state);
            barrier::ensure_stack(state, 1)?;
            ffi::lua_rawgeti(state, ffi::LUA_REGISTRYINDEX, ffi::LUA_RIDX_GLOBALS as ffi::lua_Integer);
            Ok(Table(Handle::acquire(&self.inner, state, -1)?))
        })
    }

    pub fn create_table(&self) -> Result<Table> {
        self.inner.enter(|state| unsafe {
            let _frame = CallFrame::enter(state);
            barrier::protect_simple(state, 0, 1, |s| ffi::lua_createtable(s, 0, 0))?;
            Ok(Table(Handle::acquire(&self.inner, state, -1)?))
        })
    }

    /// Exposes `func` to scripts. Arguments are converted to `A` and the
    /// result from `R`; a conversion failure or an `Err` becomes a script
    /// error that `pcall` can catch.
    pub fn create_function<A, R, F>(&self, func: F) -> Result<Function>
    where
        A: FromValues,
        R: IntoValues,
        F: Fn(&SessionRef, A) -> Result<R> + 'static,
    {
        function::create_function(
            &self.inner,
            Box::new(move |session, args| {
                let args = A::from_values(args)?;
                func(session, args).map(IntoValues::into_values)
            }),
        )
    }

    /// A new coroutine whose body is `body`.
    pub fn create_thread(&self, body: &Function) -> Result<Thread> {
        thread::create_thread(&self.inner, body)
    }

    /// Moves `value` into the engine as a host-object userdata.
    pub fn create_userdata<T: Any>(&self, value: T) -> Result<UserData> {
        self.wrap_host(Rc::new(value))
    }

    pub fn wrap_host(&self, object: Rc<dyn Any>) -> Result<UserData> {
        self.inner.enter(|state| unsafe {
            let _frame = CallFrame::enter(state);
            userdata::push_host_object(&self.inner, state, object)?;
            Ok(UserData(Handle::acquire(&self.inner, state, -1)?))
        })
    }

    // -------------------------------------------------------------------------
    // Hooks + limits
    // -------------------------------------------------------------------------

    /// Installs `callback` for `kind`, replacing any previous one. Coroutines
    /// created afterwards inherit it.
    pub fn register_hook<F>(&self, kind: HookKind, callback: F) -> Result<()>
    where
        F: Fn(&SessionRef, &HookEvent) -> Result<()> + 'static,
    {
        if kind == HookKind::Count(0) {
            return Err(Error::Config("count hooks need a positive instruction count".into()));
        }
        self.inner.hooks.borrow_mut().set(kind, Some(Rc::new(callback)));
        self.inner.apply_hooks()
    }

    pub fn remove_hook(&self, kind: HookKind) -> Result<()> {
        self.inner.hooks.borrow_mut().set(kind, None);
        self.inner.apply_hooks()
    }

    pub fn set_time_limit(&self, limit: Option<Duration>) -> Result<()> {
        self.inner.hooks.borrow_mut().set_time_limit(limit);
        self.inner.apply_hooks()
    }

    pub fn set_instruction_limit(&self, limit: Option<u64>) -> Result<()> {
        self.inner.hooks.borrow_mut().set_instruction_limit(limit);
        self.inner.apply_hooks()
    }

    // -------------------------------------------------------------------------
    // Memory + diagnostics
    // -------------------------------------------------------------------------

    /// Runs a full collection cycle, running pending finalizers.
    pub fn collect_garbage(&self) -> Result<()> {
        self.inner.enter(|state| unsafe {
            barrier::protect_simple(state, 0, 0, |s| {
                ffi::lua_gc(s, ffi::LUA_GCCOLLECT, 0);
            })
        })
    }

    /// Engine heap bytes in use. Zero once closed.
    pub fn memory_used(&self) -> usize {
        self.inner.memory.used()
    }

    pub fn memory_peak(&self) -> usize {
        self.inner.memory.peak()
    }

    pub fn memory_limit(&self) -> Option<usize> {
        self.inner.memory.limit()
    }

    /// Changes the heap cap. Lowering it below current use only blocks
    /// further growth.
    pub fn set_memory_limit(&self, limit: Option<usize>) {
        self.inner.memory.set_limit(limit);
    }

    /// Values on the current stack. Stable across calls, including faulting
    /// ones.
    pub fn stack_depth(&self) -> Result<i32> {
        self.inner.enter(|state| unsafe { Ok(ffi::lua_gettop(state)) })
    }

    /// Registry anchors currently held by handles.
    pub fn outstanding_handles(&self) -> usize {
        self.inner.refs.outstanding()
    }

    /// Host objects the engine still keeps alive.
    pub fn live_host_objects(&self) -> usize {
        self.inner.host_objects.get()
    }
}

impl fmt::Debug for SessionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("closed", &self.inner.is_closed())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
