//! Conversions between Rust types and [`Value`].
//!
//! Integer rules: host integers that fit in i64 stay integers, wider ones
//! become floats. A float read as an integer truncates toward zero and fails
//! when non-finite or out of range. Lossy conversions are logged at trace
//! level.

use crate::error::{Error, Result};
use crate::function::Function;
use crate::table::Table;
use crate::thread::Thread;
use crate::userdata::UserData;
use crate::value::{HostObject, LuaString, Value};

pub trait IntoValue {
    fn into_value(self) -> Value;
}

pub trait FromValue: Sized {
    fn from_value(value: Value) -> Result<Self>;
}

/// A list of values: arguments going in, results coming out.
pub trait IntoValues {
    fn into_values(self) -> Vec<Value>;
}

pub trait FromValues: Sized {
    fn from_values(values: Vec<Value>) -> Result<Self>;
}

// ============================================================================
// Into
// ============================================================================

impl IntoValue for Value {
    fn into_value(self) -> Value {
        self
    }
}

impl IntoValue for &Value {
    fn into_value(self) -> Value {
        self.clone()
    }
}

impl IntoValue for bool {
    fn into_value(self) -> Value {
        Value::Boolean(self)
    }
}

macro_rules! into_integer {
    ($($ty:ty),*) => {
        $(
            impl IntoValue for $ty {
                fn into_value(self) -> Value {
                    Value::Integer(self as i64)
                }
            }
        )*
    };
}

into_integer!(i8, i16, i32, i64, u8, u16, u32);

macro_rules! into_wide_integer {
    ($($ty:ty),*) => {
        $(
            impl IntoValue for $ty {
                fn into_value(self) -> Value {
                    match i64::try_from(self) {
                        Ok(i) => Value::Integer(i),
                        Err(_) => {
                            log::trace!("integer {} exceeds i64, passing as float", self);
                            Value::Number(self as f64)
                        }
                    }
                }
            }
        )*
    };
}

into_wide_integer!(isize, usize, u64, i128, u128);

impl IntoValue for f32 {
    fn into_value(self) -> Value {
        Value::Number(self as f64)
    }
}

impl IntoValue for f64 {
    fn into_value(self) -> Value {
        Value::Number(self)
    }
}

impl IntoValue for &str {
    fn into_value(self) -> Value {
        Value::String(LuaString::from(self))
    }
}

impl IntoValue for String {
    fn into_value(self) -> Value {
        Value::String(LuaString::from(self))
    }
}

impl IntoValue for &String {
    fn into_value(self) -> Value {
        Value::String(LuaString::from(self.as_str()))
    }
}

impl IntoValue for &[u8] {
    fn into_value(self) -> Value {
        Value::String(LuaString::from(self))
    }
}

impl IntoValue for Vec<u8> {
    fn into_value(self) -> Value {
        Value::String(LuaString::from(self))
    }
}

impl IntoValue for LuaString {
    fn into_value(self) -> Value {
        Value::String(self)
    }
}

impl IntoValue for Table {
    fn into_value(self) -> Value {
        Value::Table(self)
    }
}

impl IntoValue for &Table {
    fn into_value(self) -> Value {
        Value::Table(self.clone())
    }
}

impl IntoValue for Function {
    fn into_value(self) -> Value {
        Value::Function(self)
    }
}

impl IntoValue for &Function {
    fn into_value(self) -> Value {
        Value::Function(self.clone())
    }
}

impl IntoValue for Thread {
    fn into_value(self) -> Value {
        Value::Thread(self)
    }
}

impl IntoValue for UserData {
    fn into_value(self) -> Value {
        Value::UserData(self)
    }
}

impl IntoValue for HostObject {
    fn into_value(self) -> Value {
        Value::Host(self)
    }
}

impl<T: IntoValue> IntoValue for Option<T> {
    fn into_value(self) -> Value {
        match self {
            Some(value) => value.into_value(),
            None => Value::Nil,
        }
    }
}

// ============================================================================
// From
// ============================================================================

const TWO_POW_63: f64 = 9_223_372_036_854_775_808.0;
const MAX_EXACT_FLOAT_INT: i64 = 1 << 53;

/// Truncate a float toward zero, failing outside the i64 range.
pub(crate) fn float_to_integer(n: f64) -> Result<i64> {
    if !n.is_finite() || n >= TWO_POW_63 || n < -TWO_POW_63 {
        return Err(Error::unconvertible_with(
            "number",
            "integer",
            format!("{} has no integer representation", n),
        ));
    }
    let truncated = n.trunc();
    if truncated != n {
        log::trace!("float {} truncated to {}", n, truncated);
    }
    Ok(truncated as i64)
}

pub(crate) fn integer_to_float(i: i64) -> f64 {
    if !(-MAX_EXACT_FLOAT_INT..=MAX_EXACT_FLOAT_INT).contains(&i) {
        log::trace!("integer {} rounded to float", i);
    }
    i as f64
}

impl FromValue for Value {
    fn from_value(value: Value) -> Result<Self> {
        Ok(value)
    }
}

impl FromValue for bool {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Boolean(b) => Ok(b),
            other => Err(Error::unconvertible(other.type_name(), "boolean")),
        }
    }
}

impl FromValue for i64 {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Integer(i) => Ok(i),
            Value::Number(n) => float_to_integer(n),
            other => Err(Error::unconvertible(other.type_name(), "integer")),
        }
    }
}

macro_rules! from_integer {
    ($($ty:ty),*) => {
        $(
            impl FromValue for $ty {
                fn from_value(value: Value) -> Result<Self> {
                    let wide = i64::from_value(value)?;
                    <$ty>::try_from(wide).map_err(|_| {
                        Error::unconvertible_with(
                            "integer",
                            stringify!($ty),
                            format!("{} out of range", wide),
                        )
                    })
                }
            }
        )*
    };
}

from_integer!(i8, i16, i32, isize, u8, u16, u32, u64, usize);

impl FromValue for f64 {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Number(n) => Ok(n),
            Value::Integer(i) => Ok(integer_to_float(i)),
            other => Err(Error::unconvertible(other.type_name(), "number")),
        }
    }
}

impl FromValue for f32 {
    fn from_value(value: Value) -> Result<Self> {
        f64::from_value(value).map(|n| n as f32)
    }
}

impl FromValue for LuaString {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::String(s) => Ok(s),
            other => Err(Error::unconvertible(other.type_name(), "string")),
        }
    }
}

impl FromValue for String {
    fn from_value(value: Value) -> Result<Self> {
        let s = LuaString::from_value(value)?;
        String::from_utf8(s.into_bytes())
            .map_err(|e| Error::unconvertible_with("string", "utf-8 string", e.to_string()))
    }
}

impl FromValue for Vec<u8> {
    fn from_value(value: Value) -> Result<Self> {
        LuaString::from_value(value).map(LuaString::into_bytes)
    }
}

impl FromValue for Table {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Table(t) => Ok(t),
            other => Err(Error::unconvertible(other.type_name(), "table")),
        }
    }
}

impl FromValue for Function {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Function(f) => Ok(f),
            other => Err(Error::unconvertible(other.type_name(), "function")),
        }
    }
}

impl FromValue for Thread {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Thread(t) => Ok(t),
            other => Err(Error::unconvertible(other.type_name(), "thread")),
        }
    }
}

impl FromValue for UserData {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::UserData(u) => Ok(u),
            other => Err(Error::unconvertible(other.type_name(), "userdata")),
        }
    }
}

impl FromValue for HostObject {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Host(object) => Ok(object),
            Value::UserData(ud) => ud
                .host_object()?
                .ok_or_else(|| Error::unconvertible("userdata", "host object")),
            other => Err(Error::unconvertible(other.type_name(), "host object")),
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Nil => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}

// ============================================================================
// Multiple values
// ============================================================================

impl<T: IntoValue> IntoValues for T {
    fn into_values(self) -> Vec<Value> {
        vec![self.into_value()]
    }
}

impl IntoValues for Vec<Value> {
    fn into_values(self) -> Vec<Value> {
        self
    }
}

impl IntoValues for () {
    fn into_values(self) -> Vec<Value> {
        Vec::new()
    }
}

/// A single target takes the first value; missing values read as nil.
impl<T: FromValue> FromValues for T {
    fn from_values(values: Vec<Value>) -> Result<Self> {
        T::from_value(values.into_iter().next().unwrap_or(Value::Nil))
    }
}

impl FromValues for Vec<Value> {
    fn from_values(values: Vec<Value>) -> Result<Self> {
        Ok(values)
    }
}

impl FromValues for () {
    fn from_values(_values: Vec<Value>) -> Result<Self> {
        Ok(())
    }
}

macro_rules! impl_tuple {
    ($($name:ident),+) => {
        impl<$($name: IntoValue),+> IntoValues for ($($name,)+) {
            #[allow(non_snake_case)]
            fn into_values(self) -> Vec<Value> {
                let ($($name,)+) = self;
                vec![$($name.into_value()),+]
            }
        }

        impl<$($name: FromValue),+> FromValues for ($($name,)+) {
            fn from_values(values: Vec<Value>) -> Result<Self> {
                let mut values = values.into_iter();
                Ok(($($name::from_value(values.next().unwrap_or(Value::Nil))?,)+))
            }
        }
    };
}

impl_tuple!(A);
impl_tuple!(A, B);
impl_tuple!(A, B, C);
impl_tuple!(A, B, C, D);
impl_tuple!(A, B, C, D, E);
impl_tuple!(A, B, C, D, E, F);
impl_tuple!(A, B, C, D, E, F, G);
impl_tuple!(A, B, C, D, E, F, G, H);
