use paste::paste;

use crate::error::*;
use crate::host::{Caller, ImportBinding};
use crate::instance::{Instance, RuntimeFunction, WasmFunction};
use crate::leb128::*;
use crate::value::{Value, WasmValue};

/// Active structured-control target. `dest_pc` is the block end, or the
/// `loop` opcode itself so a backward branch re-enters the loop.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Label {
    stack_len: usize,
    dest_pc: usize,
    arity: usize,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct Frame {
    locals_base: usize,
    label_base: usize,
    return_pc: usize,
    n_results: usize,
}

impl Instance {
    /// Runs function `idx` on a fresh operand stack holding `args` and returns
    /// the raw results. `depth` counts the wasm frames already live in outer
    /// invocations of the same instance.
    pub(crate) fn call_function(&self, idx: u32, args: &[WasmValue], depth: usize) -> Result<Vec<WasmValue>, Error> {
        let mut stack: Vec<WasmValue> = Vec::with_capacity(256);
        stack.extend_from_slice(args);
        match &self.functions[idx as usize] {
            RuntimeFunction::OwnedWasm(func) => {
                let mut labels: Vec<Label> = Vec::with_capacity(64);
                let mut frames: Vec<Frame> = Vec::with_capacity(64);
                let pc = self.push_frame(func, &mut stack, &labels, &mut frames, 0, depth)?;
                self.interpret(pc, &mut stack, &mut labels, &mut frames, depth)?;
            }
            RuntimeFunction::Host { .. } => self.call_host(idx as usize, &mut stack, depth)?,
        }
        Ok(stack)
    }

    #[inline(always)]
    fn push_frame(
        &self,
        func: &WasmFunction,
        stack: &mut Vec<WasmValue>,
        labels: &[Label],
        frames: &mut Vec<Frame>,
        return_pc: usize,
        depth: usize,
    ) -> Result<usize, Error> {
        if depth + frames.len() >= self.limits.max_call_depth {
            return Err(Error::trap(Trap::StackOverflow));
        }
        if stack.len() + func.locals_count > self.limits.max_value_stack {
            return Err(Error::trap(Trap::StackOverflow));
        }
        let locals_base = stack.len() - func.n_params;
        stack.resize(stack.len() + func.locals_count, WasmValue::default());
        frames.push(Frame { locals_base, label_base: labels.len(), return_pc, n_results: func.n_results });
        Ok(func.pc_start)
    }

    /// Calls an imported function. Arguments are popped from `stack` and the
    /// result, if any, is pushed back after a type check.
    pub(crate) fn call_host(&self, idx: usize, stack: &mut Vec<WasmValue>, depth: usize) -> Result<(), Error> {
        let RuntimeFunction::Host { type_idx, import, binding } = &self.functions[idx] else {
            return Err(Error::validation(UNKNOWN_FUNC));
        };
        let sig = &self.module.types[*type_idx as usize];
        let params_start = stack.len() - sig.params.len();
        let args: Vec<Value> = stack[params_start..].iter()
            .zip(&sig.params)
            .map(|(raw, ty)| Value::from_raw(*raw, *ty))
            .collect();
        stack.truncate(params_start);
        crate::debug_println!("host call {}.{}({:?})", import.module, import.name, args);

        let result = match binding {
            ImportBinding::Func(f) => {
                let host_depth = self.host_depth.get();
                if host_depth >= self.limits.max_host_depth {
                    return Err(Error::trap(Trap::StackOverflow));
                }
                self.host_depth.set(host_depth + 1);
                let outer = self.reentry_depth.replace(depth);
                let mut caller = Caller::new(self, depth);
                let result = f.call(&mut caller, &args);
                self.reentry_depth.set(outer);
                self.host_depth.set(host_depth);
                result?
            }
            ImportBinding::Memory(hook) => {
                let mem = self.memory.as_ref().ok_or(Error::link(UNKNOWN_MEMORY))?;
                let mut mem = mem.try_borrow_mut().map_err(|_| Error::MemoryBorrowed)?;
                let mut hook = hook.try_borrow_mut().map_err(|_| Error::host_abort("memory hook is already running"))?;
                hook.call(&mut mem, &args)?
            }
        };
        // A nested trap swallowed by the host still ends this call chain.
        if self.poisoned.get() {
            return Err(Error::Poisoned);
        }
        match (result, sig.results.first()) {
            (None, None) => Ok(()),
            (Some(v), Some(&ty)) if v.ty() == ty => {
                stack.push(v.to_raw());
                Ok(())
            }
            _ => Err(Error::SignatureMismatch { module: import.module.clone(), name: import.name.clone() }),
        }
    }

    fn interpret(
        &self,
        mut pc: usize,
        stack: &mut Vec<WasmValue>,
        labels: &mut Vec<Label>,
        frames: &mut Vec<Frame>,
        depth: usize,
    ) -> Result<(), Error> {
        let bytes: &[u8] = &self.module.bytes;
        let mem = self.memory.as_ref();

        macro_rules! pop_val { () => {{
            match stack.pop() { Some(v) => v, None => return Err(Error::validation(TYPE_MISMATCH)) }
        }} }
        macro_rules! locals_base { () => {{
            match frames.last() { Some(f) => f.locals_base, None => 0 }
        }} }
        macro_rules! memory { () => {{
            match mem { Some(m) => m, None => return Err(Error::validation(UNKNOWN_MEMORY)) }
        }} }
        macro_rules! memory_ref { () => {{
            match memory!().try_borrow() { Ok(m) => m, Err(_) => return Err(Error::MemoryBorrowed) }
        }} }
        macro_rules! memory_mut { () => {{
            match memory!().try_borrow_mut() { Ok(m) => m, Err(_) => return Err(Error::MemoryBorrowed) }
        }} }
        macro_rules! block_jump { ($op_pc:expr) => {{
            match self.module.side_table.get(&$op_pc) { Some(j) => *j, None => return Err(Error::Malformed(MISSING_BLOCK_META)) }
        }} }
        macro_rules! do_return { () => {{
            let Some(frame) = frames.pop() else { return Ok(()) };
            let results_start = stack.len() - frame.n_results;
            stack.copy_within(results_start.., frame.locals_base);
            stack.truncate(frame.locals_base + frame.n_results);
            labels.truncate(frame.label_base);
            if frames.is_empty() { return Ok(()); }
            pc = frame.return_pc;
        }} }
        macro_rules! branch { ($depth:expr) => {{
            let depth = $depth as usize;
            let label_base = match frames.last() { Some(f) => f.label_base, None => 0 };
            if depth >= labels.len() - label_base {
                do_return!();
            } else {
                let target_idx = labels.len() - 1 - depth;
                let Label { stack_len, dest_pc, arity } = labels[target_idx];
                let src = stack.len() - arity;
                if src != stack_len {
                    stack.copy_within(src.., stack_len);
                    stack.truncate(stack_len + arity);
                }
                labels.truncate(target_idx);
                pc = dest_pc;
            }
        }} }
        macro_rules! call { ($idx:expr) => {{
            let idx = $idx as usize;
            match &self.functions[idx] {
                RuntimeFunction::OwnedWasm(func) => {
                    pc = self.push_frame(func, stack, labels, frames, pc, depth)?;
                }
                RuntimeFunction::Host { .. } => {
                    self.call_host(idx, stack, depth + frames.len())?;
                }
            }
        }} }
        macro_rules! binary {
            ($type:ident, $op:tt) => {{
                paste! {
                    let b = pop_val!().[<as_ $type>]();
                    let a = pop_val!().[<as_ $type>]();
                    stack.push(WasmValue::[<from_ $type>](a $op b));
                }
            }};
            ($type:ident, .$method:ident) => {{
                paste! {
                    let b = pop_val!().[<as_ $type>]();
                    let a = pop_val!().[<as_ $type>]();
                    stack.push(WasmValue::[<from_ $type>](a.$method(b)));
                }
            }};
        }
        macro_rules! compare {
            ($type:ident, $op:tt) => {{
                paste! {
                    let b = pop_val!().[<as_ $type>]();
                    let a = pop_val!().[<as_ $type>]();
                    stack.push(WasmValue::from_u32((a $op b) as u32));
                }
            }};
        }
        macro_rules! shift {
            ($type:ident, $method:ident) => {{
                paste! {
                    let b = pop_val!().as_u32();
                    let a = pop_val!().[<as_ $type>]();
                    stack.push(WasmValue::[<from_ $type>](a.$method(b)));
                }
            }};
        }
        macro_rules! convert {
            ($src_type:ident -> $dst_type:ident, $f:expr) => {{
                paste! {
                    let v = pop_val!().[<as_ $src_type>]();
                    stack.push(WasmValue::[<from_ $dst_type>]($f(v)));
                }
            }};
            ($src_type:ident -> $dst_type:ident) => {{
                paste! {
                    let v = pop_val!().[<as_ $src_type>]();
                    stack.push(WasmValue::[<from_ $dst_type>](v as $dst_type));
                }
            }};
        }
        macro_rules! minmax {
            ($type:ident, min) => {{ minmax!(@impl $type, min, true) }};
            ($type:ident, max) => {{ minmax!(@impl $type, max, false) }};
            (@impl $type:ident, $op:ident, $want_negative:literal) => {{
                paste! {
                    let b = pop_val!().[<as_ $type>]();
                    let a = pop_val!().[<as_ $type>]();
                    let result = if a.is_nan() || b.is_nan() {
                        $type::NAN
                    } else if a == b && a == 0.0 {
                        if a.is_sign_negative() == $want_negative { a } else { b }
                    } else {
                        a.$op(b)
                    };
                    stack.push(WasmValue::[<from_ $type>](result));
                }
            }};
        }
        macro_rules! trunc {
            ($src_type:ident -> $dst_type:ident : $min:expr, $max:expr) => {{
                paste! {
                    let x = pop_val!().[<as_ $src_type>]();
                    if x.is_nan() { return Err(Error::trap(Trap::InvalidConversion)); }
                    let wide = x as f64;
                    if !(wide > $min && wide < $max) { return Err(Error::trap(Trap::IntegerOverflow)); }
                    stack.push(WasmValue::[<from_ $dst_type>](x as $dst_type));
                }
            }};
        }
        macro_rules! div {
            ($type:ident, signed) => {{
                paste! {
                    let b = pop_val!().[<as_ $type>]();
                    let a = pop_val!().[<as_ $type>]();
                    if b == 0 { return Err(Error::trap(Trap::IntegerDivideByZero)); }
                    if a == $type::MIN && b == -1 { return Err(Error::trap(Trap::IntegerOverflow)); }
                    stack.push(WasmValue::[<from_ $type>](a / b));
                }
            }};
            ($type:ident, $method:ident) => {{
                paste! {
                    let b = pop_val!().[<as_ $type>]();
                    let a = pop_val!().[<as_ $type>]();
                    if b == 0 { return Err(Error::trap(Trap::IntegerDivideByZero)); }
                    stack.push(WasmValue::[<from_ $type>](a.$method(b)));
                }
            }};
        }
        macro_rules! load { ($method:ident, $push:expr) => {{
            let _align = read_leb128(bytes, &mut pc);
            let offset = read_leb128(bytes, &mut pc);
            let addr = pop_val!().as_u32();
            let v = memory_ref!().$method(addr, offset)?;
            stack.push(($push)(v));
        }} }
        macro_rules! store { ($method:ident, $from:expr) => {{
            let _align = read_leb128(bytes, &mut pc);
            let offset = read_leb128(bytes, &mut pc);
            let raw = pop_val!();
            let addr = pop_val!().as_u32();
            memory_mut!().$method(addr, offset, ($from)(raw))?;
        }} }

        loop {
            if let Some(fuel) = self.fuel.get() {
                if fuel == 0 { return Err(Error::trap(Trap::OutOfFuel)); }
                self.fuel.set(Some(fuel - 1));
            }
            let op_pc = pc;
            let op = bytes[pc];
            pc += 1;
            match op {
                0x00 => return Err(Error::trap(Trap::Unreachable)),
                0x01 | 0xbc..=0xbf => {} // nop and reinterprets (no-op on raw bits)
                0x02 => {
                    let j = block_jump!(op_pc);
                    labels.push(Label { stack_len: stack.len() - j.n_params as usize, dest_pc: j.end_pc, arity: j.n_results as usize });
                    pc = j.body_pc;
                }
                0x03 => {
                    let j = block_jump!(op_pc);
                    labels.push(Label { stack_len: stack.len() - j.n_params as usize, dest_pc: op_pc, arity: j.n_params as usize });
                    pc = j.body_pc;
                }
                0x04 => {
                    let j = block_jump!(op_pc);
                    let cond = pop_val!().as_u32();
                    if cond != 0 || j.else_pc.is_some() {
                        labels.push(Label { stack_len: stack.len() - j.n_params as usize, dest_pc: j.end_pc, arity: j.n_results as usize });
                    }
                    pc = match (cond != 0, j.else_pc) {
                        (true, _) => j.body_pc,
                        (false, Some(else_pc)) => else_pc,
                        (false, None) => j.end_pc,
                    };
                }
                0x05 => branch!(0),
                0x0b => {
                    let label_base = match frames.last() { Some(f) => f.label_base, None => 0 };
                    if labels.len() == label_base {
                        do_return!();
                    } else {
                        labels.pop();
                    }
                }
                0x0c => {
                    let depth = read_leb128(bytes, &mut pc);
                    branch!(depth);
                }
                0x0d => {
                    let depth = read_leb128(bytes, &mut pc);
                    if pop_val!().as_u32() != 0 {
                        branch!(depth);
                    }
                }
                0x0e => {
                    let v = pop_val!().as_u32();
                    let n_targets = read_leb128(bytes, &mut pc);
                    let mut chosen = None;
                    for i in 0..n_targets {
                        let t = read_leb128(bytes, &mut pc);
                        if i == v { chosen = Some(t); }
                    }
                    let default = read_leb128(bytes, &mut pc);
                    branch!(chosen.unwrap_or(default));
                }
                0x0f => do_return!(),
                0x10 => {
                    let fi = read_leb128(bytes, &mut pc);
                    call!(fi);
                }
                0x11 => {
                    let type_idx = read_leb128(bytes, &mut pc);
                    let _table = read_leb128(bytes, &mut pc);
                    let elem = pop_val!().as_u32();
                    let fi = match self.table.get(elem as usize) {
                        None => return Err(Error::trap(Trap::UndefinedElement)),
                        Some(None) => return Err(Error::trap(Trap::UninitializedElement)),
                        Some(Some(fi)) => *fi,
                    };
                    if self.module.functions[fi as usize].ty != self.module.types[type_idx as usize] {
                        return Err(Error::trap(Trap::IndirectCallTypeMismatch));
                    }
                    call!(fi);
                }
                0x1a => { pop_val!(); }
                0x1b | 0x1c => {
                    if op == 0x1c {
                        let n = read_leb128(bytes, &mut pc);
                        pc += n as usize;
                    }
                    let c = pop_val!().as_u32();
                    let b = pop_val!();
                    let a = pop_val!();
                    stack.push(if c != 0 { a } else { b });
                }
                0x20 => {
                    let idx = read_leb128(bytes, &mut pc) as usize;
                    let v = stack[locals_base!() + idx];
                    stack.push(v);
                }
                0x21 => {
                    let idx = read_leb128(bytes, &mut pc) as usize;
                    let v = pop_val!();
                    let base = locals_base!();
                    stack[base + idx] = v;
                }
                0x22 => {
                    let idx = read_leb128(bytes, &mut pc) as usize;
                    let v = match stack.last() { Some(v) => *v, None => return Err(Error::validation(TYPE_MISMATCH)) };
                    let base = locals_base!();
                    stack[base + idx] = v;
                }
                0x23 => {
                    let idx = read_leb128(bytes, &mut pc) as usize;
                    stack.push(self.globals[idx].get());
                }
                0x24 => {
                    let idx = read_leb128(bytes, &mut pc) as usize;
                    let v = pop_val!();
                    self.globals[idx].set(v);
                }

                // Memory instructions
                0x28 => load!(load_u32, WasmValue::from_u32),
                0x29 => load!(load_u64, WasmValue::from_u64),
                0x2a => load!(load_u32, WasmValue::from_f32_bits),
                0x2b => load!(load_u64, WasmValue::from_f64_bits),
                0x2c => load!(load_i8,  |v: i8| WasmValue::from_i32(v as i32)),
                0x2d => load!(load_u8,  |v: u8| WasmValue::from_u32(v as u32)),
                0x2e => load!(load_i16, |v: i16| WasmValue::from_i32(v as i32)),
                0x2f => load!(load_u16, |v: u16| WasmValue::from_u32(v as u32)),
                0x30 => load!(load_i8,  |v: i8| WasmValue::from_i64(v as i64)),
                0x31 => load!(load_u8,  |v: u8| WasmValue::from_u64(v as u64)),
                0x32 => load!(load_i16, |v: i16| WasmValue::from_i64(v as i64)),
                0x33 => load!(load_u16, |v: u16| WasmValue::from_u64(v as u64)),
                0x34 => load!(load_i32, |v: i32| WasmValue::from_i64(v as i64)),
                0x35 => load!(load_u32, |v: u32| WasmValue::from_u64(v as u64)),
                0x36 => store!(store_u32, |v: WasmValue| v.as_u32()),
                0x37 => store!(store_u64, |v: WasmValue| v.as_u64()),
                0x38 => store!(store_u32, |v: WasmValue| v.as_f32_bits()),
                0x39 => store!(store_u64, |v: WasmValue| v.as_f64_bits()),
                0x3a => store!(store_u8,  |v: WasmValue| v.as_u32() as u8),
                0x3b => store!(store_u16, |v: WasmValue| v.as_u32() as u16),
                0x3c => store!(store_u8,  |v: WasmValue| v.as_u64() as u8),
                0x3d => store!(store_u16, |v: WasmValue| v.as_u64() as u16),
                0x3e => store!(store_u32, |v: WasmValue| v.as_u64() as u32),
                0x3f => {
                    pc += 1;
                    stack.push(WasmValue::from_u32(memory_ref!().size()));
                }
                0x40 => {
                    pc += 1;
                    let delta = pop_val!().as_u32();
                    stack.push(WasmValue::from_u32(memory_mut!().grow(delta)));
                }

                // Constants
                0x41 => stack.push(WasmValue::from_i32(read_sleb128_i32(bytes, &mut pc))),
                0x42 => stack.push(WasmValue::from_i64(read_sleb128_i64(bytes, &mut pc))),
                0x43 => stack.push(WasmValue::from_f32_bits(read_u32_le(bytes, &mut pc))),
                0x44 => stack.push(WasmValue::from_f64_bits(read_u64_le(bytes, &mut pc))),

                // i32 comparisons
                0x45 => { let a = pop_val!().as_u32(); stack.push(WasmValue::from_u32((a == 0) as u32)); }
                0x46 => compare!(u32, ==),
                0x47 => compare!(u32, !=),
                0x48 => compare!(i32, <),
                0x49 => compare!(u32, <),
                0x4a => compare!(i32, >),
                0x4b => compare!(u32, >),
                0x4c => compare!(i32, <=),
                0x4d => compare!(u32, <=),
                0x4e => compare!(i32, >=),
                0x4f => compare!(u32, >=),
                // i64 comparisons
                0x50 => { let a = pop_val!().as_u64(); stack.push(WasmValue::from_u32((a == 0) as u32)); }
                0x51 => compare!(u64, ==),
                0x52 => compare!(u64, !=),
                0x53 => compare!(i64, <),
                0x54 => compare!(u64, <),
                0x55 => compare!(i64, >),
                0x56 => compare!(u64, >),
                0x57 => compare!(i64, <=),
                0x58 => compare!(u64, <=),
                0x59 => compare!(i64, >=),
                0x5a => compare!(u64, >=),
                // float comparisons
                0x5b => compare!(f32, ==),
                0x5c => compare!(f32, !=),
                0x5d => compare!(f32, <),
                0x5e => compare!(f32, >),
                0x5f => compare!(f32, <=),
                0x60 => compare!(f32, >=),
                0x61 => compare!(f64, ==),
                0x62 => compare!(f64, !=),
                0x63 => compare!(f64, <),
                0x64 => compare!(f64, >),
                0x65 => compare!(f64, <=),
                0x66 => compare!(f64, >=),

                // i32 arithmetic
                0x67 => convert!(u32 -> u32, |a: u32| a.leading_zeros()),
                0x68 => convert!(u32 -> u32, |a: u32| a.trailing_zeros()),
                0x69 => convert!(u32 -> u32, |a: u32| a.count_ones()),
                0x6a => binary!(u32, .wrapping_add),
                0x6b => binary!(u32, .wrapping_sub),
                0x6c => binary!(u32, .wrapping_mul),
                0x6d => div!(i32, signed),
                0x6e => div!(u32, wrapping_div),
                0x6f => div!(i32, wrapping_rem),
                0x70 => div!(u32, wrapping_rem),
                0x71 => binary!(u32, &),
                0x72 => binary!(u32, |),
                0x73 => binary!(u32, ^),
                0x74 => shift!(u32, wrapping_shl),
                0x75 => shift!(i32, wrapping_shr),
                0x76 => shift!(u32, wrapping_shr),
                0x77 => shift!(u32, rotate_left),
                0x78 => shift!(u32, rotate_right),
                // i64 arithmetic
                0x79 => convert!(u64 -> u64, |a: u64| a.leading_zeros() as u64),
                0x7a => convert!(u64 -> u64, |a: u64| a.trailing_zeros() as u64),
                0x7b => convert!(u64 -> u64, |a: u64| a.count_ones() as u64),
                0x7c => binary!(u64, .wrapping_add),
                0x7d => binary!(u64, .wrapping_sub),
                0x7e => binary!(u64, .wrapping_mul),
                0x7f => div!(i64, signed),
                0x80 => div!(u64, wrapping_div),
                0x81 => div!(i64, wrapping_rem),
                0x82 => div!(u64, wrapping_rem),
                0x83 => binary!(u64, &),
                0x84 => binary!(u64, |),
                0x85 => binary!(u64, ^),
                0x86 => shift!(u64, wrapping_shl),
                0x87 => shift!(i64, wrapping_shr),
                0x88 => shift!(u64, wrapping_shr),
                0x89 => shift!(u64, rotate_left),
                0x8a => shift!(u64, rotate_right),
                // f32 arithmetic
                0x8b => convert!(f32 -> f32, f32::abs),
                0x8c => convert!(f32 -> f32, |a: f32| -a),
                0x8d => convert!(f32 -> f32, f32::ceil),
                0x8e => convert!(f32 -> f32, f32::floor),
                0x8f => convert!(f32 -> f32, f32::trunc),
                0x90 => convert!(f32 -> f32, f32::round_ties_even),
                0x91 => convert!(f32 -> f32, f32::sqrt),
                0x92 => binary!(f32, +),
                0x93 => binary!(f32, -),
                0x94 => binary!(f32, *),
                0x95 => binary!(f32, /),
                0x96 => minmax!(f32, min),
                0x97 => minmax!(f32, max),
                0x98 => binary!(f32, .copysign),
                // f64 arithmetic
                0x99 => convert!(f64 -> f64, f64::abs),
                0x9a => convert!(f64 -> f64, |a: f64| -a),
                0x9b => convert!(f64 -> f64, f64::ceil),
                0x9c => convert!(f64 -> f64, f64::floor),
                0x9d => convert!(f64 -> f64, f64::trunc),
                0x9e => convert!(f64 -> f64, f64::round_ties_even),
                0x9f => convert!(f64 -> f64, f64::sqrt),
                0xa0 => binary!(f64, +),
                0xa1 => binary!(f64, -),
                0xa2 => binary!(f64, *),
                0xa3 => binary!(f64, /),
                0xa4 => minmax!(f64, min),
                0xa5 => minmax!(f64, max),
                0xa6 => binary!(f64, .copysign),

                // Conversions
                0xa7 => convert!(u64 -> u32),
                0xa8 => trunc!(f32 -> i32 : -2147483649.0, 2147483648.0),
                0xa9 => trunc!(f32 -> u32 : -1.0, 4294967296.0),
                0xaa => trunc!(f64 -> i32 : -2147483649.0, 2147483648.0),
                0xab => trunc!(f64 -> u32 : -1.0, 4294967296.0),
                0xac => convert!(i32 -> i64),
                0xad => convert!(u32 -> u64),
                0xae => trunc!(f32 -> i64 : -9223372036854777856.0, 9223372036854775808.0),
                0xaf => trunc!(f32 -> u64 : -1.0, 18446744073709551616.0),
                0xb0 => trunc!(f64 -> i64 : -9223372036854777856.0, 9223372036854775808.0),
                0xb1 => trunc!(f64 -> u64 : -1.0, 18446744073709551616.0),
                0xb2 => convert!(i32 -> f32),
                0xb3 => convert!(u32 -> f32),
                0xb4 => convert!(i64 -> f32),
                0xb5 => convert!(u64 -> f32),
                0xb6 => convert!(f64 -> f32),
                0xb7 => convert!(i32 -> f64),
                0xb8 => convert!(u32 -> f64),
                0xb9 => convert!(i64 -> f64),
                0xba => convert!(u64 -> f64),
                0xbb => convert!(f32 -> f64),

                // Sign extension
                0xc0 => convert!(i32 -> i32, |a: i32| a as i8 as i32),
                0xc1 => convert!(i32 -> i32, |a: i32| a as i16 as i32),
                0xc2 => convert!(i64 -> i64, |a: i64| a as i8 as i64),
                0xc3 => convert!(i64 -> i64, |a: i64| a as i16 as i64),
                0xc4 => convert!(i64 -> i64, |a: i64| a as i32 as i64),

                0xfc => match read_leb128(bytes, &mut pc) {
                    0 => convert!(f32 -> i32),
                    1 => convert!(f32 -> u32),
                    2 => convert!(f64 -> i32),
                    3 => convert!(f64 -> u32),
                    4 => convert!(f32 -> i64),
                    5 => convert!(f32 -> u64),
                    6 => convert!(f64 -> i64),
                    7 => convert!(f64 -> u64),
                    10 => {
                        pc += 2;
                        let n = pop_val!().as_u32();
                        let src = pop_val!().as_u32();
                        let dst = pop_val!().as_u32();
                        memory_mut!().copy_within(dst, src, n)?;
                    }
                    11 => {
                        pc += 1;
                        let n = pop_val!().as_u32();
                        let val = pop_val!().as_u32();
                        let dst = pop_val!().as_u32();
                        memory_mut!().fill(dst, val as u8, n)?;
                    }
                    _ => return Err(Error::Malformed(UNKNOWN_INSTRUCTION)),
                },
                _ => return Err(Error::Malformed(UNKNOWN_INSTRUCTION)),
            }
        }
    }
}
