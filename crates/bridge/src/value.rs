use std::any::Any;
use std::borrow::Cow;
use std::fmt;
use std::os::raw::c_int;
use std::rc::Rc;

use mlua::ffi;

use crate::error::{Error, Result};
use crate::function::Function;
use crate::table::Table;
use crate::thread::Thread;
use crate::userdata::UserData;

// ============================================================================
// Kind
// ============================================================================

/// Engine type tag of a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    None,
    Nil,
    Boolean,
    LightUserData,
    Number,
    String,
    Table,
    Function,
    UserData,
    Thread,
}

impl Kind {
    pub(crate) fn from_raw(tag: c_int) -> Self {
        match tag {
            ffi::LUA_TNIL => Kind::Nil,
            ffi::LUA_TBOOLEAN => Kind::Boolean,
            ffi::LUA_TLIGHTUSERDATA => Kind::LightUserData,
            ffi::LUA_TNUMBER => Kind::Number,
            ffi::LUA_TSTRING => Kind::String,
            ffi::LUA_TTABLE => Kind::Table,
            ffi::LUA_TFUNCTION => Kind::Function,
            ffi::LUA_TUSERDATA => Kind::UserData,
            ffi::LUA_TTHREAD => Kind::Thread,
            _ => Kind::None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Kind::None => "no value",
            Kind::Nil => "nil",
            Kind::Boolean => "boolean",
            Kind::LightUserData => "light userdata",
            Kind::Number => "number",
            Kind::String => "string",
            Kind::Table => "table",
            Kind::Function => "function",
            Kind::UserData => "userdata",
            Kind::Thread => "thread",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// LuaString
// ============================================================================

/// Byte string copied out of the engine. Engine strings need not be UTF-8.
#[derive(Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LuaString(Vec<u8>);

impl LuaString {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn to_str(&self) -> Result<&str> {
        std::str::from_utf8(&self.0)
            .map_err(|e| Error::unconvertible_with("string", "utf-8 string", e.to_string()))
    }

    pub fn to_string_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.0)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for LuaString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.to_string_lossy())
    }
}

impl From<&str> for LuaString {
    fn from(s: &str) -> Self {
        LuaString(s.as_bytes().to_vec())
    }
}

impl From<String> for LuaString {
    fn from(s: String) -> Self {
        LuaString(s.into_bytes())
    }
}

impl From<&[u8]> for LuaString {
    fn from(bytes: &[u8]) -> Self {
        LuaString(bytes.to_vec())
    }
}

impl From<Vec<u8>> for LuaString {
    fn from(bytes: Vec<u8>) -> Self {
        LuaString(bytes)
    }
}

// ============================================================================
// HostObject
// ============================================================================

/// Shared host value that crosses into the engine as userdata.
///
/// The engine keeps the object alive for as long as the userdata is
/// reachable; it is dropped when the userdata is collected.
#[derive(Clone)]
pub struct HostObject(Rc<dyn Any>);

impl HostObject {
    pub fn new<T: Any>(value: T) -> Self {
        HostObject(Rc::new(value))
    }

    pub fn from_rc(object: Rc<dyn Any>) -> Self {
        HostObject(object)
    }

    pub fn as_rc(&self) -> &Rc<dyn Any> {
        &self.0
    }

    pub fn downcast<T: Any>(&self) -> Option<Rc<T>> {
        self.0.clone().downcast::<T>().ok()
    }

    pub fn is<T: Any>(&self) -> bool {
        self.0.is::<T>()
    }

    pub fn ptr_eq(&self, other: &HostObject) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub fn strong_count(&self) -> usize {
        Rc::strong_count(&self.0)
    }
}

impl fmt::Debug for HostObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostObject({:p})", Rc::as_ptr(&self.0))
    }
}

// ============================================================================
// Value
// ============================================================================

/// A value on the host side of the bridge.
///
/// Scalars and strings are copied. Tables, functions, threads and userdata
/// stay in the engine and are held through handles.
#[derive(Debug, Clone)]
pub enum Value {
    Nil,
    Boolean(bool),
    Integer(i64),
    Number(f64),
    String(LuaString),
    Table(Table),
    Function(Function),
    Thread(Thread),
    UserData(UserData),
    /// Host object not yet pushed into the engine.
    Host(HostObject),
    /// Engine value with no host form, such as light userdata.
    Unrepresentable(Kind),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Boolean(_) => "boolean",
            Value::Integer(_) => "integer",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Table(_) => "table",
            Value::Function(_) => "function",
            Value::Thread(_) => "thread",
            Value::UserData(_) => "userdata",
            Value::Host(_) => "host object",
            Value::Unrepresentable(kind) => kind.name(),
        }
    }

    pub fn kind(&self) -> Kind {
        match self {
            Value::Nil => Kind::Nil,
            Value::Boolean(_) => Kind::Boolean,
            Value::Integer(_) | Value::Number(_) => Kind::Number,
            Value::String(_) => Kind::String,
            Value::Table(_) => Kind::Table,
            Value::Function(_) => Kind::Function,
            Value::Thread(_) => Kind::Thread,
            Value::UserData(_) | Value::Host(_) => Kind::UserData,
            Value::Unrepresentable(kind) => *kind,
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// String payload, if it is valid UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => s.to_str().ok(),
            _ => None,
        }
    }

    pub fn as_table(&self) -> Option<&Table> {
        match self {
            Value::Table(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&Function> {
        match self {
            Value::Function(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_thread(&self) -> Option<&Thread> {
        match self {
            Value::Thread(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_userdata(&self) -> Option<&UserData> {
        match self {
            Value::UserData(u) => Some(u),
            _ => None,
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::Nil
    }
}

/// Scalars compare by value. Handles compare by engine object identity.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Table(a), Value::Table(b)) => a == b,
            (Value::Function(a), Value::Function(b)) => a == b,
            (Value::Thread(a), Value::Thread(b)) => a == b,
            (Value::UserData(a), Value::UserData(b)) => a == b,
            (Value::Host(a), Value::Host(b)) => a.ptr_eq(b),
            (Value::Unrepresentable(a), Value::Unrepresentable(b)) => a == b,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names() {
        assert_eq!(Kind::from_raw(ffi::LUA_TTABLE), Kind::Table);
        assert_eq!(Kind::from_raw(ffi::LUA_TNONE), Kind::None);
        assert_eq!(Kind::LightUserData.to_string(), "light userdata");
    }

    #[test]
    fn test_string_bytes_survive() {
        let s = LuaString::from(vec![0xff, 0x00, b'a']);
        assert_eq!(s.len(), 3);
        assert!(s.to_str().is_err());
        assert_eq!(s.as_bytes(), &[0xff, 0x00, b'a']);
    }

    #[test]
    fn test_scalar_equality_is_strict() {
        assert_eq!(Value::Integer(1), Value::Integer(1));
        assert_ne!(Value::Integer(1), Value::Number(1.0));
        assert_ne!(Value::Number(f64::NAN), Value::Number(f64::NAN));
        assert_eq!(Value::String("a".into()), Value::String(LuaString::from("a")));
    }

    #[test]
    fn test_host_object_identity() {
        let a = HostObject::new(5u32);
        let b = a.clone();
        assert_eq!(Value::Host(a.clone()), Value::Host(b));
        assert_ne!(Value::Host(a.clone()), Value::Host(HostObject::new(5u32)));
        assert_eq!(*a.downcast::<u32>().unwrap(), 5);
        assert!(a.downcast::<String>().is_none());
    }
}
