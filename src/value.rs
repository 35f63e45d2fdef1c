use std::fmt::{Display, Formatter};
use crate::signature::ValType;

/// Untyped operand stack slot. The validator guarantees every consumer reads
/// a slot with the type it was written with, so no tag is stored.
#[derive(Copy, Clone, Default, Debug, PartialEq, Eq)]
pub struct WasmValue(pub u64);

impl WasmValue {
    #[inline] pub fn from_i32(v: i32) -> Self { Self(v as u32 as u64) }
    #[inline] pub fn as_i32(self) -> i32 { self.0 as u32 as i32 }
    #[inline] pub fn from_u32(v: u32) -> Self { Self(v as u64) }
    #[inline] pub fn as_u32(self) -> u32 { self.0 as u32 }
    #[inline] pub fn from_i64(v: i64) -> Self { Self(v as u64) }
    #[inline] pub fn as_i64(self) -> i64 { self.0 as i64 }
    #[inline] pub fn from_u64(v: u64) -> Self { Self(v) }
    #[inline] pub fn as_u64(self) -> u64 { self.0 }
    #[inline] pub fn from_f32_bits(bits: u32) -> Self { Self(bits as u64) }
    #[inline] pub fn as_f32_bits(self) -> u32 { self.0 as u32 }
    #[inline] pub fn from_f64_bits(bits: u64) -> Self { Self(bits) }
    #[inline] pub fn as_f64_bits(self) -> u64 { self.0 }
    #[inline] pub fn from_f32(v: f32) -> Self { Self::from_f32_bits(v.to_bits()) }
    #[inline] pub fn as_f32(self) -> f32 { f32::from_bits(self.as_f32_bits()) }
    #[inline] pub fn from_f64(v: f64) -> Self { Self::from_f64_bits(v.to_bits()) }
    #[inline] pub fn as_f64(self) -> f64 { f64::from_bits(self.as_f64_bits()) }
}

/// A typed value crossing the embedder or host boundary.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Value {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
}

impl Value {
    pub fn ty(&self) -> ValType {
        match self {
            Value::I32(_) => ValType::I32,
            Value::I64(_) => ValType::I64,
            Value::F32(_) => ValType::F32,
            Value::F64(_) => ValType::F64,
        }
    }

    pub fn default_for(ty: ValType) -> Value {
        Value::from_raw(WasmValue::default(), ty)
    }

    #[inline]
    pub fn to_raw(self) -> WasmValue {
        match self {
            Value::I32(v) => WasmValue::from_i32(v),
            Value::I64(v) => WasmValue::from_i64(v),
            Value::F32(v) => WasmValue::from_f32(v),
            Value::F64(v) => WasmValue::from_f64(v),
        }
    }

    #[inline]
    pub fn from_raw(raw: WasmValue, ty: ValType) -> Value {
        match ty {
            ValType::I32 => Value::I32(raw.as_i32()),
            ValType::I64 => Value::I64(raw.as_i64()),
            ValType::F32 => Value::F32(raw.as_f32()),
            ValType::F64 => Value::F64(raw.as_f64()),
        }
    }

    pub fn as_i32(&self) -> Option<i32> { if let Value::I32(v) = self { Some(*v) } else { None } }
    pub fn as_i64(&self) -> Option<i64> { if let Value::I64(v) = self { Some(*v) } else { None } }
    pub fn as_f32(&self) -> Option<f32> { if let Value::F32(v) = self { Some(*v) } else { None } }
    pub fn as_f64(&self) -> Option<f64> { if let Value::F64(v) = self { Some(*v) } else { None } }
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::I32(v) => write!(f, "{}:i32", v),
            Value::I64(v) => write!(f, "{}:i64", v),
            Value::F32(v) => write!(f, "{}:f32", v),
            Value::F64(v) => write!(f, "{}:f64", v),
        }
    }
}

impl From<i32> for Value { fn from(v: i32) -> Self { Value::I32(v) } }
impl From<u32> for Value { fn from(v: u32) -> Self { Value::I32(v as i32) } }
impl From<i64> for Value { fn from(v: i64) -> Self { Value::I64(v) } }
impl From<u64> for Value { fn from(v: u64) -> Self { Value::I64(v as i64) } }
impl From<f32> for Value { fn from(v: f32) -> Self { Value::F32(v) } }
impl From<f64> for Value { fn from(v: f64) -> Self { Value::F64(v) } }
