use mlua::ffi;

use crate::barrier;
use crate::codec;
use crate::convert::{FromValue, IntoValue};
use crate::error::Result;
use crate::registry::Handle;
use crate::value::Value;

/// Handle to an engine table.
///
/// `get` and `set` honour metamethods and run under the fault barrier; the
/// `raw_*` variants bypass them.
#[derive(Clone, Debug, PartialEq)]
pub struct Table(pub(crate) Handle);

impl Table {
    pub fn get<K: IntoValue, V: FromValue>(&self, key: K) -> Result<V> {
        let key = key.into_value();
        self.0.with_pushed(|session, state| unsafe {
            codec::push_value(session, state, &key)?;
            barrier::protect(session, state, 2, 1, |s| {
                ffi::lua_gettable(s, -2);
            })?;
            V::from_value(codec::read_value(session, state, -1)?)
        })
    }

    pub fn set<K: IntoValue, V: IntoValue>(&self, key: K, value: V) -> Result<()> {
        let key = key.into_value();
        let value = value.into_value();
        self.0.with_pushed(|session, state| unsafe {
            codec::push_value(session, state, &key)?;
            codec::push_value(session, state, &value)?;
            barrier::protect(session, state, 3, 0, |s| ffi::lua_settable(s, -3))
        })
    }

    pub fn raw_get<K: IntoValue, V: FromValue>(&self, key: K) -> Result<V> {
        let key = key.into_value();
        self.0.with_pushed(|session, state| unsafe {
            codec::push_value(session, state, &key)?;
            ffi::lua_rawget(state, -2);
            V::from_value(codec::read_value(session, state, -1)?)
        })
    }

    /// Stores without metamethods. A nil or NaN key is a fault.
    pub fn raw_set<K: IntoValue, V: IntoValue>(&self, key: K, value: V) -> Result<()> {
        let key = key.into_value();
        let value = value.into_value();
        self.0.with_pushed(|session, state| unsafe {
            codec::push_value(session, state, &key)?;
            codec::push_value(session, state, &value)?;
            barrier::protect_simple(state, 3, 0, |s| ffi::lua_rawset(s, -3))
        })
    }

    /// Border of the array part, without `__len`.
    pub fn raw_len(&self) -> Result<usize> {
        self.0.with_pushed(|_, state| unsafe { Ok(ffi::lua_rawlen(state, -1) as usize) })
    }

    /// All key/value pairs in engine iteration order.
    pub fn pairs(&self) -> Result<Vec<(Value, Value)>> {
        self.0.with_pushed(|session, state| unsafe {
            let table = ffi::lua_gettop(state);
            barrier::ensure_stack(state, 6)?;
            ffi::lua_pushnil(state);
            let key = ffi::lua_gettop(state);
            let mut pairs = Vec::new();
            loop {
                ffi::lua_pushvalue(state, table);
                ffi::lua_pushvalue(state, key);
                // Leaves `table key' value` on success, only `table` at the end.
                let more = barrier::protect(session, state, 2, ffi::LUA_MULTRET, |s| {
                    ffi::lua_next(s, 1) != 0
                })?;
                if !more {
                    break;
                }
                let k = codec::read_value(session, state, -2)?;
                let v = codec::read_value(session, state, -1)?;
                ffi::lua_copy(state, -2, key);
                ffi::lua_settop(state, key);
                pairs.push((k, v));
            }
            Ok(pairs)
        })
    }

    /// Values at `1..=raw_len()`, in order.
    pub fn sequence_values(&self) -> Result<Vec<Value>> {
        self.0.with_pushed(|session, state| unsafe {
            let len = ffi::lua_rawlen(state, -1) as usize;
            barrier::ensure_stack(state, 1)?;
            let mut values = Vec::with_capacity(len);
            for i in 1..=len {
                ffi::lua_rawgeti(state, -1, i as ffi::lua_Integer);
                let value = codec::read_value(session, state, -1);
                ffi::lua_pop(state, 1);
                values.push(value?);
            }
            Ok(values)
        })
    }

    /// Number of pairs, counted by iteration.
    pub fn count(&self) -> Result<usize> {
        Ok(self.pairs()?.len())
    }

    /// Gives up this handle. Idempotent.
    pub fn release(&self) -> bool {
        self.0.release()
    }

    pub fn is_valid(&self) -> bool {
        self.0.is_valid()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::session::Session;

    #[test]
    fn test_get_set_and_missing() {
        let session = Session::open_default().unwrap();
        let t = session.create_table().unwrap();
        t.set("name", "lua").unwrap();
        t.set(1, 10).unwrap();
        assert_eq!(t.get::<_, String>("name").unwrap(), "lua");
        assert_eq!(t.get::<_, i64>(1).unwrap(), 10);
        assert_eq!(t.get::<_, Value>("missing").unwrap(), Value::Nil);
    }

    #[test]
    fn test_metamethods_vs_raw() {
        let session = Session::open_default().unwrap();
        let t: Table = session
            .exec("return setmetatable({}, { __index = function(_, k) return k .. '!' end })")
            .unwrap();
        assert_eq!(t.get::<_, String>("hi").unwrap(), "hi!");
        assert_eq!(t.raw_get::<_, Value>("hi").unwrap(), Value::Nil);
    }

    #[test]
    fn test_metamethod_fault_is_caught() {
        let session = Session::open_default().unwrap();
        let t: Table = session
            .exec("return setmetatable({}, { __newindex = function() error('read only') end })")
            .unwrap();
        let depth = session.stack_depth().unwrap();
        let err = t.set("k", 1).unwrap_err();
        assert!(err.fault().unwrap().message().contains("read only"));
        assert_eq!(session.stack_depth().unwrap(), depth);
        t.raw_set("k", 1).unwrap();
        assert_eq!(t.raw_get::<_, i64>("k").unwrap(), 1);
    }

    #[test]
    fn test_raw_set_nil_key_faults() {
        let session = Session::open_default().unwrap();
        let t = session.create_table().unwrap();
        let err = t.raw_set(Value::Nil, 1).unwrap_err();
        assert!(matches!(err, Error::ScriptFault(_)));
    }

    #[test]
    fn test_sequence_and_pairs() {
        let session = Session::open_default().unwrap();
        let t: Table = session.exec("return { 'a', 'b', 'c', x = 1 }").unwrap();
        assert_eq!(t.raw_len().unwrap(), 3);
        let seq: Vec<String> = t
            .sequence_values()
            .unwrap()
            .into_iter()
            .map(|v| v.as_str().unwrap().to_string())
            .collect();
        assert_eq!(seq, ["a", "b", "c"]);

        let pairs = t.pairs().unwrap();
        assert_eq!(pairs.len(), 4);
        assert!(pairs.contains(&(Value::String("x".into()), Value::Integer(1))));
        assert_eq!(t.count().unwrap(), 4);
    }
}
