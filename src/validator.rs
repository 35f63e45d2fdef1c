use nohash_hasher::IntMap;

use crate::byte_iter::ByteIter;
use crate::debug_println;
use crate::error::*;
use crate::module::*;
use crate::signature::*;
use crate::signature::ValType::*;

// ---------------- Control Flow Structures ----------------
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlType {
    Function,
    Block,
    Loop,
    If,
    Else,
}

#[derive(Clone, Debug)]
pub struct ControlFrame {
    pub control_type: ControlType,
    pub sig: Signature,
    /// Operand stack height when the frame was entered.
    pub height: usize,
    pub unreachable: bool,
    pub opcode_pc: usize,
    pub body_pc: usize,
    pub else_pc: Option<usize>,
}

impl ControlFrame {
    /// Types a branch to this frame carries: params for loops, results otherwise.
    fn label_types(&self) -> &[ValType] {
        if self.control_type == ControlType::Loop { &self.sig.params } else { &self.sig.results }
    }
}

// ---------------- ValidatorStack for Type Checking ----------------

/// Abstract operand stack. `None` stands for the unknown type that appears
/// once the current frame became unreachable.
pub struct ValidatorStack {
    vals: Vec<Option<ValType>>,
    ctrls: Vec<ControlFrame>,
}

impl ValidatorStack {
    pub fn new() -> Self {
        Self { vals: Vec::with_capacity(64), ctrls: Vec::with_capacity(16) }
    }

    fn push(&mut self, ty: ValType) { self.vals.push(Some(ty)); }
    fn push_slice(&mut self, tys: &[ValType]) { self.vals.extend(tys.iter().copied().map(Some)); }

    fn pop(&mut self) -> Result<Option<ValType>, Error> {
        let frame = self.ctrls.last().ok_or(Error::validation(TYPE_MISMATCH))?;
        if self.vals.len() == frame.height {
            return if frame.unreachable { Ok(None) } else { Err(Error::validation(TYPE_MISMATCH)) };
        }
        self.vals.pop().ok_or(Error::validation(TYPE_MISMATCH))
    }

    fn pop_expect(&mut self, expected: ValType) -> Result<Option<ValType>, Error> {
        match self.pop()? {
            Some(actual) if actual != expected => Err(Error::validation(TYPE_MISMATCH)),
            actual => Ok(actual),
        }
    }

    fn pop_slice(&mut self, expected: &[ValType]) -> Result<Vec<Option<ValType>>, Error> {
        let mut popped = vec![None; expected.len()];
        for (slot, &ty) in popped.iter_mut().zip(expected).rev() {
            *slot = self.pop_expect(ty)?;
        }
        Ok(popped)
    }

    fn push_ctrl(&mut self, control_type: ControlType, sig: Signature, opcode_pc: usize, body_pc: usize, else_pc: Option<usize>) {
        let height = self.vals.len();
        self.push_slice(&sig.params);
        self.ctrls.push(ControlFrame { control_type, sig, height, unreachable: false, opcode_pc, body_pc, else_pc });
    }

    fn pop_ctrl(&mut self) -> Result<ControlFrame, Error> {
        let results = match self.ctrls.last() {
            Some(frame) => frame.sig.results.clone(),
            None => return Err(Error::validation(TYPE_MISMATCH)),
        };
        self.pop_slice(&results)?;
        let frame = self.ctrls.pop().ok_or(Error::validation(TYPE_MISMATCH))?;
        if self.vals.len() != frame.height {
            return Err(Error::validation(TYPE_MISMATCH));
        }
        Ok(frame)
    }

    fn unreachable(&mut self) {
        if let Some(frame) = self.ctrls.last_mut() {
            self.vals.truncate(frame.height);
            frame.unreachable = true;
        }
    }

    fn label(&self, depth: u32) -> Result<&ControlFrame, Error> {
        let depth = depth as usize;
        if depth >= self.ctrls.len() {
            return Err(Error::validation(UNKNOWN_LABEL));
        }
        Ok(&self.ctrls[self.ctrls.len() - 1 - depth])
    }
}

impl Default for ValidatorStack {
    fn default() -> Self { Self::new() }
}

// ---------------- Operator typing tables ----------------
const I32_1: &[ValType] = &[I32];
const I32_2: &[ValType] = &[I32, I32];
const I32_3: &[ValType] = &[I32, I32, I32];
const I64_1: &[ValType] = &[I64];
const I64_2: &[ValType] = &[I64, I64];
const F32_1: &[ValType] = &[F32];
const F32_2: &[ValType] = &[F32, F32];
const F64_1: &[ValType] = &[F64];
const F64_2: &[ValType] = &[F64, F64];

/// Operand and result types of the plain numeric operators 0x45..=0xc4.
fn numeric_sig(op: u8) -> Option<(&'static [ValType], ValType)> {
    let sig = match op {
        0x45 => (I32_1, I32),
        0x46..=0x4f => (I32_2, I32),
        0x50 => (I64_1, I32),
        0x51..=0x5a => (I64_2, I32),
        0x5b..=0x60 => (F32_2, I32),
        0x61..=0x66 => (F64_2, I32),
        0x67..=0x69 => (I32_1, I32),
        0x6a..=0x78 => (I32_2, I32),
        0x79..=0x7b => (I64_1, I64),
        0x7c..=0x8a => (I64_2, I64),
        0x8b..=0x91 => (F32_1, F32),
        0x92..=0x98 => (F32_2, F32),
        0x99..=0x9f => (F64_1, F64),
        0xa0..=0xa6 => (F64_2, F64),
        0xa7 => (I64_1, I32),
        0xa8 | 0xa9 => (F32_1, I32),
        0xaa | 0xab => (F64_1, I32),
        0xac | 0xad => (I32_1, I64),
        0xae | 0xaf => (F32_1, I64),
        0xb0 | 0xb1 => (F64_1, I64),
        0xb2 | 0xb3 => (I32_1, F32),
        0xb4 | 0xb5 => (I64_1, F32),
        0xb6 => (F64_1, F32),
        0xb7 | 0xb8 => (I32_1, F64),
        0xb9 | 0xba => (I64_1, F64),
        0xbb => (F32_1, F64),
        0xbc => (F32_1, I32),
        0xbd => (F64_1, I64),
        0xbe => (I32_1, F32),
        0xbf => (I64_1, F64),
        0xc0 | 0xc1 => (I32_1, I32),
        0xc2..=0xc4 => (I64_1, I64),
        _ => return None,
    };
    Some(sig)
}

/// Saturating truncations behind the 0xfc prefix.
fn trunc_sat_sig(sub: u32) -> Option<(&'static [ValType], ValType)> {
    let sig = match sub {
        0 | 1 => (F32_1, I32),
        2 | 3 => (F64_1, I32),
        4 | 5 => (F32_1, I64),
        6 | 7 => (F64_1, I64),
        _ => return None,
    };
    Some(sig)
}

/// Value type and log2 of the natural alignment of loads 0x28..=0x35.
fn load_type(op: u8) -> (ValType, u32) {
    match op {
        0x28 => (I32, 2),
        0x29 => (I64, 3),
        0x2a => (F32, 2),
        0x2b => (F64, 3),
        0x2c | 0x2d => (I32, 0),
        0x2e | 0x2f => (I32, 1),
        0x30 | 0x31 => (I64, 0),
        0x32 | 0x33 => (I64, 1),
        _ => (I64, 2),
    }
}

/// Same for stores 0x36..=0x3e.
fn store_type(op: u8) -> (ValType, u32) {
    match op {
        0x36 => (I32, 2),
        0x37 => (I64, 3),
        0x38 => (F32, 2),
        0x39 => (F64, 3),
        0x3a => (I32, 0),
        0x3b => (I32, 1),
        0x3c => (I64, 0),
        0x3d => (I64, 1),
        _ => (I64, 2),
    }
}

// ---------------- Function Validation ----------------
pub struct Validator<'a> {
    module: &'a Module,
    side_table: IntMap<usize, BlockJump>,
}

impl<'a> Validator<'a> {
    pub fn new(module: &'a Module) -> Self {
        Self { module, side_table: IntMap::default() }
    }

    /// Validates every function body and the start function, returning the
    /// block metadata collected along the way.
    pub fn validate_module(mut self) -> Result<IntMap<usize, BlockJump>, Error> {
        let m = self.module;
        for fn_index in m.n_imported_functions()..m.functions.len() {
            self.validate_function(fn_index)?;
        }
        if let Some(start) = m.start {
            let ty = &m.functions[start as usize].ty;
            if !ty.params.is_empty() || !ty.results.is_empty() {
                return Err(Error::validation(START_FUNC));
            }
        }
        debug_println!("validated {} functions, {} blocks", m.functions.len(), self.side_table.len());
        Ok(self.side_table)
    }

    pub fn validate_function(&mut self, fn_index: usize) -> Result<(), Error> {
        let mut op_pc = self.module.functions[fn_index].body.start;
        self.check_body(fn_index, &mut op_pc).map_err(|e| match e {
            Error::Validation { msg, .. } => Error::Validation { func: Some(fn_index as u32), offset: op_pc, msg },
            other => other,
        })
    }

    fn check_body(&mut self, fn_index: usize, op_pc: &mut usize) -> Result<(), Error> {
        let m = self.module;
        let f = &m.functions[fn_index];
        let bytes = &m.bytes[..f.body.end];
        let mut it = ByteIter::new(bytes, f.body.start);
        let mut vs = ValidatorStack::new();
        let entry = Signature { params: vec![], results: f.ty.results.clone() };
        vs.push_ctrl(ControlType::Function, entry, f.body.start, f.body.start, None);

        macro_rules! require_memory {
            () => { if m.memory.is_none() { return Err(Error::validation(UNKNOWN_MEMORY)); } };
        }
        macro_rules! zero_byte {
            () => { if it.read_u8()? != 0 { return Err(Error::Malformed(ZERO_FLAG_EXPECTED)); } };
        }
        macro_rules! memarg {
            ($max_align:expr) => {{
                let align = it.read_u32()?;
                let _offset = it.read_u32()?;
                if align > $max_align { return Err(Error::validation(ALIGNMENT_TOO_LARGE)); }
            }};
        }

        while !vs.ctrls.is_empty() {
            *op_pc = it.cur();
            let op = it.read_u8()?;
            match op {
                // ---------------- Control Flow ----------------
                0x00 => vs.unreachable(),
                0x01 => {}
                0x02 | 0x03 => {
                    let sig = Signature::read_block_type(&m.types, &mut it)?;
                    vs.pop_slice(&sig.params)?;
                    let ct = if op == 0x02 { ControlType::Block } else { ControlType::Loop };
                    vs.push_ctrl(ct, sig, *op_pc, it.cur(), None);
                }
                0x04 => {
                    let sig = Signature::read_block_type(&m.types, &mut it)?;
                    vs.pop_expect(I32)?;
                    vs.pop_slice(&sig.params)?;
                    vs.push_ctrl(ControlType::If, sig, *op_pc, it.cur(), None);
                }
                0x05 => {
                    if vs.ctrls.last().map(|c| c.control_type) != Some(ControlType::If) {
                        return Err(Error::validation(ELSE_MUST_CLOSE_IF));
                    }
                    let frame = vs.pop_ctrl()?;
                    vs.push_ctrl(ControlType::Else, frame.sig, frame.opcode_pc, frame.body_pc, Some(it.cur()));
                }
                0x0b => {
                    let frame = vs.pop_ctrl()?;
                    match frame.control_type {
                        ControlType::Function => break,
                        ControlType::If if frame.sig.params != frame.sig.results => {
                            return Err(Error::validation(TYPE_MISMATCH));
                        }
                        _ => {}
                    }
                    self.side_table.insert(frame.opcode_pc, BlockJump {
                        body_pc: frame.body_pc,
                        else_pc: frame.else_pc,
                        end_pc: it.cur(),
                        n_params: frame.sig.params.len() as u32,
                        n_results: frame.sig.results.len() as u32,
                    });
                    vs.push_slice(&frame.sig.results);
                }
                0x0c => {
                    let types = vs.label(it.read_u32()?)?.label_types().to_vec();
                    vs.pop_slice(&types)?;
                    vs.unreachable();
                }
                0x0d => {
                    let types = vs.label(it.read_u32()?)?.label_types().to_vec();
                    vs.pop_expect(I32)?;
                    vs.pop_slice(&types)?;
                    vs.push_slice(&types);
                }
                0x0e => {
                    let n_targets = it.read_u32()?;
                    let mut targets = Vec::with_capacity((n_targets as usize).min(bytes.len()));
                    for _ in 0..n_targets {
                        targets.push(it.read_u32()?);
                    }
                    let default = it.read_u32()?;
                    vs.pop_expect(I32)?;
                    let arity = vs.label(default)?.label_types().len();
                    for depth in targets {
                        let types = vs.label(depth)?.label_types().to_vec();
                        if types.len() != arity {
                            return Err(Error::validation(TYPE_MISMATCH));
                        }
                        let popped = vs.pop_slice(&types)?;
                        vs.vals.extend(popped);
                    }
                    let types = vs.label(default)?.label_types().to_vec();
                    vs.pop_slice(&types)?;
                    vs.unreachable();
                }
                0x0f => {
                    let types = vs.ctrls[0].label_types().to_vec();
                    vs.pop_slice(&types)?;
                    vs.unreachable();
                }
                0x10 => {
                    let callee = m.functions.get(it.read_u32()? as usize).ok_or(Error::validation(UNKNOWN_FUNC))?;
                    vs.pop_slice(&callee.ty.params)?;
                    vs.push_slice(&callee.ty.results);
                }
                0x11 => {
                    let type_idx = it.read_u32()?;
                    let table_idx = it.read_u32()?;
                    if m.table.is_none() || table_idx != 0 {
                        return Err(Error::validation(UNKNOWN_TABLE));
                    }
                    let sig = m.types.get(type_idx as usize).ok_or(Error::validation(UNKNOWN_TYPE))?;
                    vs.pop_expect(I32)?;
                    vs.pop_slice(&sig.params)?;
                    vs.push_slice(&sig.results);
                }

                // ---------------- Stack Manipulation ----------------
                0x1a => { vs.pop()?; }
                0x1b => {
                    vs.pop_expect(I32)?;
                    let t1 = vs.pop()?;
                    let t2 = vs.pop()?;
                    if let (Some(a), Some(b)) = (t1, t2) {
                        if a != b { return Err(Error::validation(TYPE_MISMATCH)); }
                    }
                    vs.vals.push(t1.or(t2));
                }
                0x1c => {
                    if it.read_u32()? != 1 {
                        return Err(Error::validation(INVALID_RESULT_ARITY));
                    }
                    let ty = ValType::read(&mut it)?;
                    vs.pop_expect(I32)?;
                    vs.pop_expect(ty)?;
                    vs.pop_expect(ty)?;
                    vs.push(ty);
                }

                // ---------------- Variable Instructions ----------------
                0x20..=0x22 => {
                    let ty = *f.locals.get(it.read_u32()? as usize).ok_or(Error::validation(UNKNOWN_LOCAL))?;
                    match op {
                        0x20 => vs.push(ty),
                        0x21 => { vs.pop_expect(ty)?; }
                        _ => { vs.pop_expect(ty)?; vs.push(ty); }
                    }
                }
                0x23 => {
                    let global = m.globals.get(it.read_u32()? as usize).ok_or(Error::validation(UNKNOWN_GLOBAL))?;
                    vs.push(global.ty);
                }
                0x24 => {
                    let global = m.globals.get(it.read_u32()? as usize).ok_or(Error::validation(UNKNOWN_GLOBAL))?;
                    if !global.is_mutable {
                        return Err(Error::validation(GLOBAL_IS_IMMUTABLE));
                    }
                    vs.pop_expect(global.ty)?;
                }

                // ---------------- Memory Instructions ----------------
                0x28..=0x35 => {
                    require_memory!();
                    let (ty, max_align) = load_type(op);
                    memarg!(max_align);
                    vs.pop_expect(I32)?;
                    vs.push(ty);
                }
                0x36..=0x3e => {
                    require_memory!();
                    let (ty, max_align) = store_type(op);
                    memarg!(max_align);
                    vs.pop_expect(ty)?;
                    vs.pop_expect(I32)?;
                }
                0x3f => {
                    require_memory!();
                    zero_byte!();
                    vs.push(I32);
                }
                0x40 => {
                    require_memory!();
                    zero_byte!();
                    vs.pop_expect(I32)?;
                    vs.push(I32);
                }

                // ---------------- Constants ----------------
                0x41 => { it.read_i32()?; vs.push(I32); }
                0x42 => { it.read_i64()?; vs.push(I64); }
                0x43 => { it.read_bytes(4)?; vs.push(F32); }
                0x44 => { it.read_bytes(8)?; vs.push(F64); }

                // ---------------- Numeric ----------------
                0x45..=0xc4 => {
                    let (params, result) = numeric_sig(op).ok_or(Error::Malformed(UNKNOWN_INSTRUCTION))?;
                    vs.pop_slice(params)?;
                    vs.push(result);
                }
                0xfc => {
                    let sub = it.read_u32()?;
                    match sub {
                        0..=7 => {
                            let (params, result) = trunc_sat_sig(sub).ok_or(Error::Malformed(UNKNOWN_INSTRUCTION))?;
                            vs.pop_slice(params)?;
                            vs.push(result);
                        }
                        10 => {
                            require_memory!();
                            zero_byte!();
                            zero_byte!();
                            vs.pop_slice(I32_3)?;
                        }
                        11 => {
                            require_memory!();
                            zero_byte!();
                            vs.pop_slice(I32_3)?;
                        }
                        _ => return Err(Error::Malformed(UNKNOWN_INSTRUCTION)),
                    }
                }
                _ => return Err(Error::Malformed(UNKNOWN_INSTRUCTION)),
            }
        }

        if it.cur() != f.body.end {
            return Err(Error::Malformed(SECTION_SIZE_MISMATCH));
        }
        Ok(())
    }
}
