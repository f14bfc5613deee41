//! Moves values between host `Value`s and the engine stack.
//!
//! Pushing either succeeds completely or leaves the stack where it was.
//! Reading copies scalars and strings and anchors everything else behind a
//! handle.

use std::os::raw::{c_char, c_int};
use std::rc::Rc;

use mlua::ffi;

use crate::barrier;
use crate::config::UnrepresentablePolicy;
use crate::error::{Error, Result};
use crate::function::Function;
use crate::registry::Handle;
use crate::session::SessionInner;
use crate::table::Table;
use crate::thread::Thread;
use crate::userdata::{self, UserData};
use crate::value::{Kind, LuaString, Value};

// ============================================================================
// Host -> engine
// ============================================================================

pub(crate) unsafe fn push_value(
    session: &Rc<SessionInner>,
    state: *mut ffi::lua_State,
    value: &Value,
) -> Result<()> {
    barrier::ensure_stack(state, 1)?;
    match value {
        Value::Nil => ffi::lua_pushnil(state),
        Value::Boolean(b) => ffi::lua_pushboolean(state, *b as c_int),
        Value::Integer(i) => ffi::lua_pushinteger(state, *i),
        Value::Number(n) => ffi::lua_pushnumber(state, *n),
        Value::String(s) => push_bytes(state, s.as_bytes())?,
        Value::Table(t) => t.0.push_into(session, state)?,
        Value::Function(f) => f.0.push_into(session, state)?,
        Value::Thread(t) => t.0.push_into(session, state)?,
        Value::UserData(u) => u.0.push_into(session, state)?,
        Value::Host(object) => userdata::push_host_object(session, state, object.as_rc().clone())?,
        Value::Unrepresentable(kind) => {
            return Err(Error::unconvertible_with(
                kind.name(),
                "engine value",
                "values read as unrepresentable cannot be pushed back",
            ))
        }
    }
    Ok(())
}

/// Interns `bytes` as an engine string on top of the stack.
pub(crate) unsafe fn push_bytes(state: *mut ffi::lua_State, bytes: &[u8]) -> Result<()> {
    barrier::protect_simple(state, 0, 1, |s| {
        ffi::lua_pushlstring(s, bytes.as_ptr() as *const c_char, bytes.len());
    })
}

/// Pushes `values` in order and returns how many were pushed. On failure
/// nothing stays pushed.
pub(crate) unsafe fn push_values(
    session: &Rc<SessionInner>,
    state: *mut ffi::lua_State,
    values: &[Value],
) -> Result<c_int> {
    let count = c_int::try_from(values.len()).map_err(|_| Error::StackExhausted)?;
    barrier::ensure_stack(state, count)?;
    let top = ffi::lua_gettop(state);
    for value in values {
        if let Err(err) = push_value(session, state, value) {
            ffi::lua_settop(state, top);
            return Err(err);
        }
    }
    Ok(count)
}

// ============================================================================
// Engine -> host
// ============================================================================

/// Reads the value at `index` without popping it.
pub(crate) unsafe fn read_value(
    session: &Rc<SessionInner>,
    state: *mut ffi::lua_State,
    index: c_int,
) -> Result<Value> {
    let index = ffi::lua_absindex(state, index);
    let kind = Kind::from_raw(ffi::lua_type(state, index));
    let value = match kind {
        Kind::None | Kind::Nil => Value::Nil,
        Kind::Boolean => Value::Boolean(ffi::lua_toboolean(state, index) != 0),
        Kind::Number => {
            if ffi::lua_isinteger(state, index) != 0 {
                Value::Integer(ffi::lua_tointeger(state, index))
            } else {
                Value::Number(ffi::lua_tonumber(state, index))
            }
        }
        Kind::String => Value::String(LuaString::from(read_bytes(state, index))),
        Kind::Table => Value::Table(Table(Handle::acquire(session, state, index)?)),
        Kind::Function => Value::Function(Function(Handle::acquire(session, state, index)?)),
        Kind::Thread => Value::Thread(Thread(Handle::acquire(session, state, index)?)),
        Kind::UserData => Value::UserData(UserData(Handle::acquire(session, state, index)?)),
        Kind::LightUserData => match session.config().unrepresentable {
            UnrepresentablePolicy::Marker => Value::Unrepresentable(kind),
            UnrepresentablePolicy::Fail => {
                return Err(Error::unconvertible(kind.name(), "host value"));
            }
        },
    };
    Ok(value)
}

/// Reads the top `count` values in stack order, then pops them.
pub(crate) unsafe fn read_values(
    session: &Rc<SessionInner>,
    state: *mut ffi::lua_State,
    count: c_int,
) -> Result<Vec<Value>> {
    let top = ffi::lua_gettop(state);
    let base = top - count;
    let mut values = Vec::with_capacity(count.max(0) as usize);
    let mut outcome = Ok(());
    for index in base + 1..=top {
        match read_value(session, state, index) {
            Ok(value) => values.push(value),
            Err(err) => {
                outcome = Err(err);
                break;
            }
        }
    }
    ffi::lua_settop(state, base);
    outcome.map(|()| values)
}

/// Copies the string at `index`. The value must be a string.
pub(crate) unsafe fn read_bytes(state: *mut ffi::lua_State, index: c_int) -> Vec<u8> {
    let mut len = 0usize;
    let data = ffi::lua_tolstring(state, index, &mut len);
    if data.is_null() {
        return Vec::new();
    }
    std::slice::from_raw_parts(data as *const u8, len).to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::session::Session;

    fn round_trip(session: &Session, value: &Value) -> Result<Value> {
        let inner = session.inner().clone();
        inner.enter(|state| unsafe {
            let before = ffi::lua_gettop(state);
            push_value(&inner, state, value)?;
            let back = read_values(&inner, state, 1)?;
            assert_eq!(ffi::lua_gettop(state), before);
            Ok(back.into_iter().next().unwrap_or(Value::Nil))
        })
    }

    #[test]
    fn test_scalars_round_trip() {
        let session = Session::open_default().unwrap();
        for value in [
            Value::Nil,
            Value::Boolean(true),
            Value::Integer(i64::MIN),
            Value::Number(0.5),
            Value::String(LuaString::from(vec![0u8, 0xfe, b'z'])),
        ] {
            assert_eq!(round_trip(&session, &value).unwrap(), value);
        }
    }

    #[test]
    fn test_integral_float_stays_float() {
        let session = Session::open_default().unwrap();
        assert_eq!(round_trip(&session, &Value::Number(3.0)).unwrap(), Value::Number(3.0));
    }

    #[test]
    fn test_unrepresentable_rejected_on_push() {
        let session = Session::open_default().unwrap();
        let err = round_trip(&session, &Value::Unrepresentable(Kind::LightUserData)).unwrap_err();
        assert!(matches!(err, Error::UnconvertibleType { from: "light userdata", .. }));
    }

    #[test]
    fn test_light_userdata_policy() {
        let marker = Session::open_default().unwrap();
        let fail = Session::open(SessionConfig {
            unrepresentable: UnrepresentablePolicy::Fail,
            ..SessionConfig::default()
        })
        .unwrap();

        for (session, expect_marker) in [(&marker, true), (&fail, false)] {
            let inner = session.inner().clone();
            let read = inner.enter(|state| unsafe {
                ffi::lua_pushlightuserdata(state, std::ptr::null_mut());
                read_values(&inner, state, 1)
            });
            if expect_marker {
                assert_eq!(read.unwrap(), vec![Value::Unrepresentable(Kind::LightUserData)]);
            } else {
                assert!(matches!(read, Err(Error::UnconvertibleType { .. })));
            }
        }
    }

    #[test]
    fn test_push_values_restores_on_failure() {
        let session = Session::open_default().unwrap();
        let inner = session.inner().clone();
        inner
            .enter(|state| unsafe {
                let before = ffi::lua_gettop(state);
                let values = vec![Value::Integer(1), Value::Unrepresentable(Kind::LightUserData)];
                assert!(push_values(&inner, state, &values).is_err());
                assert_eq!(ffi::lua_gettop(state), before);
                Ok(())
            })
            .unwrap();
    }
}
