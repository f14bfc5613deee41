//! Debug hooks and execution limits.
//!
//! One engine hook serves both user hook callables and the instruction and
//! time limits. Limits piggyback on the instruction-count event; when a user
//! count hook is also registered the engine ticks at the greatest common
//! divisor of both periods and each consumer keeps its own accumulator.

use std::ffi::CStr;
use std::os::raw::c_int;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::time::Duration;

use mlua::ffi;

use crate::barrier;
use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::session::{SessionInner, SessionRef};

/// Which engine events a hook callable observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookKind {
    Call,
    Return,
    Line,
    /// Every `n` instructions; `n` must be positive.
    Count(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookEventKind {
    Call,
    TailCall,
    Return,
    Line,
    Count,
}

/// What a hook callable is told about the event that fired it.
#[derive(Debug, Clone)]
pub struct HookEvent {
    pub kind: HookEventKind,
    /// Current line, when the engine knows it.
    pub line: Option<u32>,
    /// Short source name of the running chunk.
    pub source: Option<String>,
    /// Name of the running function, when the engine can infer one.
    pub name: Option<String>,
}

pub(crate) type HookFn = Rc<dyn Fn(&SessionRef, &HookEvent) -> Result<()>>;

// ============================================================================
// Hook table
// ============================================================================

pub(crate) struct HookTable {
    call: Option<HookFn>,
    ret: Option<HookFn>,
    line: Option<HookFn>,
    count: Option<(u32, HookFn)>,
    count_pending: u32,
    instruction_limit: Option<u64>,
    time_limit: Option<Duration>,
    interval: u32,
    tick: u32,
}

impl HookTable {
    pub(crate) fn new(config: &SessionConfig) -> Self {
        let mut table = Self {
            call: None,
            ret: None,
            line: None,
            count: None,
            count_pending: 0,
            instruction_limit: config.instruction_limit,
            time_limit: config.time_limit(),
            interval: config.hook_interval.max(1),
            tick: 0,
        };
        table.tick = table.compute_tick();
        table
    }

    pub(crate) fn set(&mut self, kind: HookKind, callback: Option<HookFn>) {
        match kind {
            HookKind::Call => self.call = callback,
            HookKind::Return => self.ret = callback,
            HookKind::Line => self.line = callback,
            HookKind::Count(n) => {
                self.count = callback.map(|f| (n.max(1), f));
                self.count_pending = 0;
            }
        }
        self.tick = self.compute_tick();
    }

    pub(crate) fn set_instruction_limit(&mut self, limit: Option<u64>) {
        self.instruction_limit = limit;
        self.tick = self.compute_tick();
    }

    pub(crate) fn set_time_limit(&mut self, limit: Option<Duration>) {
        self.time_limit = limit;
        self.tick = self.compute_tick();
    }

    pub(crate) fn instruction_limit(&self) -> Option<u64> {
        self.instruction_limit
    }

    pub(crate) fn time_limit(&self) -> Option<Duration> {
        self.time_limit
    }

    pub(crate) fn tick(&self) -> u32 {
        self.tick
    }

    fn limited(&self) -> bool {
        self.instruction_limit.is_some() || self.time_limit.is_some()
    }

    fn compute_tick(&self) -> u32 {
        match (&self.count, self.limited()) {
            (Some((n, _)), true) => gcd(*n, self.interval),
            (Some((n, _)), false) => *n,
            (None, true) => self.interval,
            (None, false) => 0,
        }
    }

    /// Mask and instruction period for `lua_sethook`.
    pub(crate) fn mask(&self) -> (c_int, c_int) {
        let mut mask = 0;
        if self.call.is_some() {
            mask |= ffi::LUA_MASKCALL;
        }
        if self.ret.is_some() {
            mask |= ffi::LUA_MASKRET;
        }
        if self.line.is_some() {
            mask |= ffi::LUA_MASKLINE;
        }
        if self.tick > 0 {
            mask |= ffi::LUA_MASKCOUNT;
        }
        (mask, self.tick.min(c_int::MAX as u32) as c_int)
    }

    /// Advances the user count hook by one tick. Returns it when due.
    fn count_due(&mut self) -> Option<HookFn> {
        let (period, callback) = self.count.as_ref()?;
        self.count_pending += self.tick;
        if self.count_pending >= *period {
            self.count_pending -= *period;
            Some(callback.clone())
        } else {
            None
        }
    }

    fn callback_for(&self, event: c_int) -> Option<(HookEventKind, HookFn)> {
        let (kind, callback) = match event {
            ffi::LUA_HOOKCALL => (HookEventKind::Call, &self.call),
            ffi::LUA_HOOKTAILCALL => (HookEventKind::TailCall, &self.call),
            ffi::LUA_HOOKRET => (HookEventKind::Return, &self.ret),
            ffi::LUA_HOOKLINE => (HookEventKind::Line, &self.line),
            _ => return None,
        };
        callback.clone().map(|f| (kind, f))
    }
}

fn gcd(mut a: u32, mut b: u32) -> u32 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

/// Installs the hook described by `table` on `state`.
pub(crate) unsafe fn apply(state: *mut ffi::lua_State, table: &HookTable) {
    let (mask, count) = table.mask();
    if mask == 0 {
        ffi::lua_sethook(state, None, 0, 0);
    } else {
        ffi::lua_sethook(state, Some(hook_proc), mask, count);
    }
}

// ============================================================================
// Dispatch
// ============================================================================

unsafe extern "C-unwind" fn hook_proc(state: *mut ffi::lua_State, ar: *mut ffi::lua_Debug) {
    let err = match panic::catch_unwind(AssertUnwindSafe(|| dispatch(state, ar))) {
        Ok(Ok(())) => return,
        Ok(Err(err)) => err,
        Err(payload) => Error::Host(format!(
            "hook panicked: {}",
            barrier::panic_message(&*payload)
        )),
    };
    barrier::raise_error(state, err);
}

unsafe fn dispatch(state: *mut ffi::lua_State, ar: *mut ffi::lua_Debug) -> Result<()> {
    let Some(session) = SessionInner::from_state(state) else {
        return Ok(());
    };
    let event = (*ar).event;
    if event == ffi::LUA_HOOKCOUNT {
        session.check_limits()?;
        let due = session.hooks().borrow_mut().count_due();
        if let Some(callback) = due {
            run_hook(&session, state, ar, HookEventKind::Count, callback)?;
        }
        return Ok(());
    }
    let selected = session.hooks().borrow().callback_for(event);
    match selected {
        Some((kind, callback)) => run_hook(&session, state, ar, kind, callback),
        None => Ok(()),
    }
}

unsafe fn run_hook(
    session: &Rc<SessionInner>,
    state: *mut ffi::lua_State,
    ar: *mut ffi::lua_Debug,
    kind: HookEventKind,
    callback: HookFn,
) -> Result<()> {
    ffi::lua_getinfo(state, c"Sln".as_ptr(), ar);
    let event = HookEvent {
        kind,
        line: u32::try_from((*ar).currentline).ok().filter(|line| *line > 0),
        source: c_text((*ar).short_src.as_ptr()),
        name: c_text((*ar).name),
    };
    let _switch = session.switch_state(state);
    callback(&SessionRef::from_inner(session.clone()), &event)
}

unsafe fn c_text(text: *const std::os::raw::c_char) -> Option<String> {
    if text.is_null() {
        return None;
    }
    let text = CStr::from_ptr(text).to_string_lossy();
    if text.is_empty() {
        None
    } else {
        Some(text.into_owned())
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;
    use crate::session::Session;

    fn noop() -> HookFn {
        Rc::new(|_: &SessionRef, _: &HookEvent| -> Result<()> { Ok(()) })
    }

    #[test]
    fn test_tick_uses_gcd_with_limits() {
        let config = SessionConfig { instruction_limit: Some(1_000_000), ..SessionConfig::default() };
        let mut table = HookTable::new(&config);
        assert_eq!(table.tick(), 10_000);

        table.set(HookKind::Count(4_000), Some(noop()));
        assert_eq!(table.tick(), 2_000);
        assert_eq!(table.mask().0 & ffi::LUA_MASKCOUNT, ffi::LUA_MASKCOUNT);

        table.set(HookKind::Count(4_000), None);
        table.set_instruction_limit(None);
        assert_eq!(table.mask(), (0, 0));
    }

    #[test]
    fn test_count_due_accumulates() {
        let config = SessionConfig { instruction_limit: Some(1), hook_interval: 3, ..SessionConfig::default() };
        let mut table = HookTable::new(&config);
        table.set(HookKind::Count(2), Some(noop()));
        assert_eq!(table.tick(), 1);
        assert!(table.count_due().is_none());
        assert!(table.count_due().is_some());
        assert!(table.count_due().is_none());
    }

    #[test]
    fn test_line_hook_sees_lines() {
        let session = Session::open_default().unwrap();
        let lines = Rc::new(RefCell::new(Vec::new()));
        let sink = lines.clone();
        session
            .register_hook(HookKind::Line, move |_, event| {
                assert_eq!(event.kind, HookEventKind::Line);
                if let Some(line) = event.line {
                    sink.borrow_mut().push(line);
                }
                Ok(())
            })
            .unwrap();
        session.exec::<()>("local a = 1\nlocal b = 2\nlocal c = a + b").unwrap();
        session.remove_hook(HookKind::Line).unwrap();
        lines.borrow_mut().dedup();
        assert_eq!(*lines.borrow(), vec![1, 2, 3]);

        session.exec::<()>("local d = 4").unwrap();
        assert_eq!(lines.borrow().len(), 3);
    }

    #[test]
    fn test_hook_error_aborts_script() {
        let session = Session::open_default().unwrap();
        session
            .register_hook(HookKind::Call, |_, event| match event.name.as_deref() {
                Some("forbidden") => Err(Error::host("call blocked")),
                _ => Ok(()),
            })
            .unwrap();
        let err = session
            .exec::<()>("local function forbidden() end\nforbidden()")
            .unwrap_err();
        assert!(err.fault().unwrap().message().contains("call blocked"));
    }

    #[test]
    fn test_zero_count_rejected() {
        let session = Session::open_default().unwrap();
        let err = session.register_hook(HookKind::Count(0), |_, _| Ok(())).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
