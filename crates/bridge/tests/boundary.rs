// Integration tests for the guarantees that hold at the host/engine boundary:
// handle lifetimes, stack balance, fault containment, coroutine status and
// session teardown.

use std::cell::Cell;
use std::rc::Rc;

use lunabridge::{Error, Session, SessionConfig, ThreadStatus, UserData, Value};

struct DropFlag(Rc<Cell<u32>>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.set(self.0.get() + 1);
    }
}

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

#[test]
fn object_lives_while_any_handle_does() {
    let drops = Rc::new(Cell::new(0));
    let session = Session::open_default().unwrap();
    let first = session.create_userdata(DropFlag(drops.clone())).unwrap();
    let copies: Vec<_> = (0..7).map(|_| first.clone()).collect();

    for copy in &copies[..6] {
        copy.release();
    }
    first.release();
    session.collect_garbage().unwrap();
    assert_eq!(drops.get(), 0);
    assert!(copies[6].is_host_object().unwrap());

    copies[6].release();
    session.collect_garbage().unwrap();
    assert_eq!(drops.get(), 1);
    assert_eq!(session.live_host_objects(), 0);
}

#[test]
fn independent_handles_each_keep_object_alive() {
    let drops = Rc::new(Cell::new(0));
    let session = Session::open_default().unwrap();
    let globals = session.globals().unwrap();
    let ud = session.create_userdata(DropFlag(drops.clone())).unwrap();
    globals.set("ud", ud.clone()).unwrap();
    ud.release();

    let before = session.outstanding_handles();
    let handles: Vec<UserData> = (0..5).map(|_| globals.get("ud").unwrap()).collect();
    assert_eq!(session.outstanding_handles(), before + 5);
    globals.set("ud", Value::Nil).unwrap();

    for handle in &handles[..4] {
        handle.release();
    }
    session.collect_garbage().unwrap();
    assert_eq!(drops.get(), 0);
    assert!(handles[4].is_host_object().unwrap());

    handles[4].release();
    assert_eq!(session.outstanding_handles(), before);
    session.collect_garbage().unwrap();
    assert_eq!(drops.get(), 1);
}

#[test]
fn released_handle_is_stale() {
    let session = Session::open_default().unwrap();
    let table = session.create_table().unwrap();
    table.release();
    assert!(!table.is_valid());
    assert!(matches!(table.get::<_, Value>("x"), Err(Error::StaleHandle)));
}

// ---------------------------------------------------------------------------
// Stack balance + fault containment
// ---------------------------------------------------------------------------

#[test]
fn stack_depth_stable_across_faults() {
    let session = Session::open_default().unwrap();
    let fails = session.load("error({ code = 7 })", "=fails").unwrap();
    let works = session.load("return 1, 2, 3", "=works").unwrap();
    let baseline = session.stack_depth().unwrap();

    for _ in 0..128 {
        let err = fails.call::<_, ()>(()).unwrap_err();
        let payload = &err.fault().unwrap().payload;
        assert_eq!(payload.as_table().unwrap().get::<_, i64>("code").unwrap(), 7);

        let (a, b, c): (i64, i64, i64) = works.call(()).unwrap();
        assert_eq!((a, b, c), (1, 2, 3));
        assert_eq!(session.stack_depth().unwrap(), baseline);
    }
}

#[test]
fn host_error_caught_by_script_pcall() {
    let session = Session::open_default().unwrap();
    let fail = session
        .create_function(|_, ()| -> lunabridge::Result<()> { Err(Error::host("disk on fire")) })
        .unwrap();
    session.globals().unwrap().set("fail", fail).unwrap();

    let (ok, message): (bool, String) = session
        .exec("local ok, err = pcall(fail) return ok, tostring(err)")
        .unwrap();
    assert!(!ok);
    assert!(message.contains("disk on fire"));

    let after: i64 = session.exec("return 41 + 1").unwrap();
    assert_eq!(after, 42);
}

#[test]
fn add_callable_converts_arguments() {
    let session = Session::open_default().unwrap();
    let add = session.create_function(|_, (a, b): (i64, i64)| Ok(a + b)).unwrap();
    session.globals().unwrap().set("add", add).unwrap();

    let sum: i64 = session.exec("return add(2, 3)").unwrap();
    assert_eq!(sum, 5);

    let err = session.exec::<i64>("return add('two', 3)").unwrap_err();
    let message = err.fault().unwrap().message();
    assert!(message.contains("cannot convert string to integer"), "{}", message);
}

#[test]
fn limit_hit_in_nested_call_reaches_outer_caller() {
    let session = Session::open(SessionConfig::default().with_instruction_limit(50_000)).unwrap();
    let spin = session.load("while true do end", "=spin").unwrap();
    let nested = session.create_function(move |_, ()| spin.call::<_, ()>(())).unwrap();
    session.globals().unwrap().set("nested", nested).unwrap();

    let err = session.exec::<()>("nested()").unwrap_err();
    assert!(
        matches!(err, Error::LimitExceeded(ref msg) if msg == "instruction limit exceeded (50000 instructions)"),
        "{:?}",
        err
    );

    let err = session.exec::<()>("pcall(nested) while true do end").unwrap_err();
    assert!(matches!(err, Error::LimitExceeded(_)), "{:?}", err);

    assert_eq!(session.stack_depth().unwrap(), 0);
    assert_eq!(session.exec::<i64>("return 2 + 2").unwrap(), 4);
}

// ---------------------------------------------------------------------------
// Coroutines
// ---------------------------------------------------------------------------

#[test]
fn dead_coroutine_always_refuses_resume() {
    let session = Session::open_default().unwrap();
    let body = session.load("local x = ... coroutine.yield(x * 2) return x + 1", "=co").unwrap();
    let thread = session.create_thread(&body).unwrap();

    let yielded: i64 = thread.resume(10).unwrap();
    assert_eq!(yielded, 20);
    assert_eq!(thread.status().unwrap(), ThreadStatus::Suspended);
    let returned: i64 = thread.resume(()).unwrap();
    assert_eq!(returned, 11);
    assert_eq!(thread.status().unwrap(), ThreadStatus::Dead);

    for _ in 0..3 {
        let err = thread.resume::<_, ()>(()).unwrap_err();
        assert!(matches!(err, Error::CoroutineError { status: ThreadStatus::Dead }));
    }
}

// ---------------------------------------------------------------------------
// Teardown
// ---------------------------------------------------------------------------

#[test]
fn close_invalidates_everything() {
    let drops = Rc::new(Cell::new(0));
    let session = Session::open(SessionConfig::default().named("teardown")).unwrap();
    let table = session.create_table().unwrap();
    let ud = session.create_userdata(DropFlag(drops.clone())).unwrap();
    let func = session.load("return 1", "=one").unwrap();
    assert!(session.memory_used() > 0);

    assert!(session.close().unwrap());
    assert!(session.is_closed());
    assert_eq!(session.memory_used(), 0);
    assert_eq!(session.outstanding_handles(), 0);
    assert_eq!(drops.get(), 1);

    assert!(matches!(table.raw_len(), Err(Error::StaleHandle)));
    assert!(matches!(ud.is_host_object(), Err(Error::StaleHandle)));
    assert!(matches!(func.call::<_, i64>(()), Err(Error::StaleHandle)));
    assert!(matches!(session.exec::<()>("return"), Err(Error::SessionClosed)));
}

#[test]
fn memory_limit_faults_without_poisoning_session() {
    let config = SessionConfig::default().with_memory_limit(4 * 1024 * 1024);
    let session = Session::open(config).unwrap();
    let err = session
        .exec::<()>("local t = {} for i = 1, 1e8 do t[i] = string.rep('x', 64) .. i end")
        .unwrap_err();
    assert!(matches!(err, Error::OutOfMemory(_)), "{:?}", err);

    session.collect_garbage().unwrap();
    let ok: i64 = session.exec("return 1 + 1").unwrap();
    assert_eq!(ok, 2);
}
