use std::fmt::{Display, Formatter};
use crate::byte_iter::ByteIter;
use crate::error::*;

#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ValType {
    I32 = 0x7f,
    I64 = 0x7e,
    F32 = 0x7d,
    F64 = 0x7c,
}

impl ValType {
    #[inline]
    pub fn from_byte(byte: u8) -> Option<ValType> {
        match byte {
            0x7f => Some(ValType::I32),
            0x7e => Some(ValType::I64),
            0x7d => Some(ValType::F32),
            0x7c => Some(ValType::F64),
            _ => None,
        }
    }

    pub fn read(it: &mut ByteIter) -> Result<ValType, Error> {
        ValType::from_byte(it.read_u8()?).ok_or(Error::Malformed(INVALID_VALUE_TYPE))
    }
}

impl Display for ValType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ValType::I32 => "i32",
            ValType::I64 => "i64",
            ValType::F32 => "f32",
            ValType::F64 => "f64",
        })
    }
}

/// Function or block type. Blocks reuse it: a single-result block has no
/// params and one result.
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash)]
pub struct Signature {
    pub params: Vec<ValType>,
    pub results: Vec<ValType>,
}

impl Signature {
    pub fn new(params: impl Into<Vec<ValType>>, results: impl Into<Vec<ValType>>) -> Self {
        Self { params: params.into(), results: results.into() }
    }

    /// Reads a `functype` entry of the type section.
    pub fn read_func_type(it: &mut ByteIter) -> Result<Signature, Error> {
        if it.read_u8()? != 0x60 { return Err(Error::Malformed(INVALID_FUNC_TYPE)); }
        let n_params = it.read_u32()?;
        let params = (0..n_params).map(|_| ValType::read(it)).collect::<Result<Vec<_>, _>>()?;
        let n_results = it.read_u32()?;
        let results = (0..n_results).map(|_| ValType::read(it)).collect::<Result<Vec<_>, _>>()?;
        Ok(Signature { params, results })
    }

    /// Reads a `blocktype`: empty, a single value type, or a type index.
    pub fn read_block_type(types: &[Signature], it: &mut ByteIter) -> Result<Signature, Error> {
        const VOID: u8 = 0x40;
        let byte = it.peek_u8()?;
        if byte == VOID {
            it.advance(1);
            Ok(Signature::default())
        } else if let Some(vt) = ValType::from_byte(byte) {
            it.advance(1);
            Ok(Signature { params: vec![], results: vec![vt] })
        } else {
            let n: i64 = crate::leb128::safe_read_sleb128(it.bytes, &mut it.idx, 33)?;
            if n < 0 || (n as usize) >= types.len() {
                return Err(Error::validation(UNKNOWN_TYPE));
            }
            Ok(types[n as usize].clone())
        }
    }
}

impl Display for Signature {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let join = |v: &[ValType]| v.iter().map(ValType::to_string).collect::<Vec<_>>().join(", ");
        write!(f, "({}) -> ({})", join(&self.params), join(&self.results))
    }
}
