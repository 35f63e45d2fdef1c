use std::cell::{Cell, Ref, RefCell, RefMut};
use std::rc::Rc;

use crate::config::Limits;
use crate::debug_println;
use crate::error::*;
use crate::host::{ImportBinding, Imports};
use crate::leb128::*;
use crate::module::{ExternKind, ImportRef, Module, SegmentMode};
use crate::signature::Signature;
use crate::value::{Value, WasmValue};
use crate::wasm_memory::WasmMemory;

#[derive(Clone, Copy, Debug)]
pub(crate) struct WasmFunction {
    pub type_idx: u32,
    pub pc_start: usize,
    pub n_params: usize,
    /// Declared locals only; parameters already sit on the stack.
    pub locals_count: usize,
    pub n_results: usize,
}

/// Entry of the instance's function index space after import resolution.
#[derive(Clone)]
pub(crate) enum RuntimeFunction {
    OwnedWasm(WasmFunction),
    Host {
        type_idx: u32,
        import: ImportRef,
        binding: ImportBinding,
    },
}

impl RuntimeFunction {
    pub fn type_idx(&self) -> u32 {
        match self {
            RuntimeFunction::OwnedWasm(f) => f.type_idx,
            RuntimeFunction::Host { type_idx, .. } => *type_idx,
        }
    }
}

/// Terminal state of one invocation, for embedders that treat traps and
/// host aborts as ordinary results.
#[derive(Clone, Debug, PartialEq)]
pub enum Outcome {
    Returned(Vec<Value>),
    Trapped(Trap),
    HostAborted(String),
}

pub struct Instance {
    pub(crate) module: Rc<Module>,
    pub(crate) memory: Option<RefCell<WasmMemory>>,
    /// Function indices by table slot; `None` is an uninitialised element.
    pub(crate) table: Vec<Option<u32>>,
    pub(crate) globals: Vec<Cell<WasmValue>>,
    pub(crate) functions: Vec<RuntimeFunction>,
    pub(crate) limits: Limits,
    pub(crate) fuel: Cell<Option<u64>>,
    pub(crate) poisoned: Cell<bool>,
    /// Host calls currently on the native stack.
    pub(crate) host_depth: Cell<usize>,
    /// Call depth of the innermost host call, the floor for any re-entry.
    pub(crate) reentry_depth: Cell<usize>,
}

impl Instance {
    pub fn instantiate(module: Rc<Module>, imports: &Imports) -> Result<Self, Error> {
        Self::instantiate_with(module, imports, Limits::default())
    }

    pub fn instantiate_with(module: Rc<Module>, imports: &Imports, limits: Limits) -> Result<Self, Error> {
        if !module.is_validated() {
            return Err(Error::validation(NOT_VALIDATED));
        }
        let mut inst = Instance {
            module: module.clone(),
            memory: None,
            table: Vec::new(),
            globals: Vec::with_capacity(module.globals.len()),
            functions: Vec::with_capacity(module.functions.len()),
            limits,
            fuel: Cell::new(limits.fuel),
            poisoned: Cell::new(false),
            host_depth: Cell::new(0),
            reentry_depth: Cell::new(0),
        };

        // Functions
        for function in &module.functions {
            match &function.import {
                Some(import) => {
                    let binding = imports.get(&import.module, &import.name).ok_or_else(|| {
                        Error::UnresolvedImport { module: import.module.clone(), name: import.name.clone() }
                    })?;
                    if binding.signature() != function.ty {
                        return Err(Error::SignatureMismatch { module: import.module.clone(), name: import.name.clone() });
                    }
                    debug_println!("resolved import {}.{} : {}", import.module, import.name, function.ty);
                    inst.functions.push(RuntimeFunction::Host {
                        type_idx: function.type_idx,
                        import: import.clone(),
                        binding: binding.clone(),
                    });
                }
                None => {
                    let n_params = function.ty.params.len();
                    inst.functions.push(RuntimeFunction::OwnedWasm(WasmFunction {
                        type_idx: function.type_idx,
                        pc_start: function.body.start,
                        n_params,
                        locals_count: function.locals.len() - n_params,
                        n_results: function.ty.results.len(),
                    }));
                }
            }
        }

        // Memory
        if let Some(memory) = &module.memory {
            if memory.import.is_some() {
                return Err(Error::link(UNSUPPORTED_IMPORT));
            }
            if memory.min > limits.max_memory_pages {
                return Err(Error::link(MEMORY_LIMIT_EXCEEDED));
            }
            let maximum = memory.max.unwrap_or(WasmMemory::MAX_PAGES).min(limits.max_memory_pages);
            inst.memory = Some(RefCell::new(WasmMemory::new(memory.min, maximum)));
            debug_println!("allocated memory: {} pages, max {}", memory.min, maximum);
        }

        // Table
        if let Some(table) = &module.table {
            if table.import.is_some() {
                return Err(Error::link(UNSUPPORTED_IMPORT));
            }
            if table.min > limits.max_table_elements {
                return Err(Error::link(TABLE_LIMIT_EXCEEDED));
            }
            inst.table = vec![None; table.min as usize];
        }

        // Globals
        for global in &module.globals {
            if global.import.is_some() {
                return Err(Error::link(UNSUPPORTED_IMPORT));
            }
            let mut pc = global.initializer_offset;
            let value = Self::eval_const(&module, &mut pc, &inst.globals)?;
            inst.globals.push(Cell::new(value));
        }

        // Segments are all checked before the first write.
        let mut pending_elements = Vec::new();
        for segment in &module.elements {
            if let SegmentMode::Active { initializer_offset } = segment.mode {
                let mut pc = initializer_offset;
                let offset = Self::eval_const(&module, &mut pc, &inst.globals)?.as_u32();
                if offset as u64 + segment.func_indices.len() as u64 > inst.table.len() as u64 {
                    return Err(Error::link(ELEM_SEG_DNF));
                }
                pending_elements.push((offset as usize, &segment.func_indices));
            }
        }
        let mut pending_data = Vec::new();
        for segment in &module.data_segments {
            if let SegmentMode::Active { initializer_offset } = segment.mode {
                let mut pc = initializer_offset;
                let offset = Self::eval_const(&module, &mut pc, &inst.globals)?.as_u32();
                let size = inst.memory.as_ref().map_or(0, |m| m.borrow().size_bytes());
                if offset as usize + segment.data_range.len() > size {
                    return Err(Error::link(DATA_SEG_DNF));
                }
                pending_data.push((offset, &module.bytes[segment.data_range.clone()]));
            }
        }
        for (offset, indices) in pending_elements {
            inst.table[offset..offset + indices.len()].copy_from_slice(indices);
        }
        if let Some(mem) = &inst.memory {
            let mut mem = mem.borrow_mut();
            for (offset, bytes) in pending_data {
                mem.write(offset, bytes)?;
            }
        }

        if let Some(start) = module.start {
            debug_println!("running start function {}", start);
            inst.call_function(start, &[], 0)?;
        }
        Ok(inst)
    }

    /// Evaluates a constant expression starting at `pc`. The expression has
    /// already been checked, so only the supported opcodes can appear.
    pub(crate) fn eval_const(module: &Module, pc: &mut usize, globals: &[Cell<WasmValue>]) -> Result<WasmValue, Error> {
        let bytes: &[u8] = &module.bytes;
        let mut stack: Vec<WasmValue> = Vec::new();
        macro_rules! pop {
            () => { stack.pop().ok_or(Error::validation(TYPE_MISMATCH))? };
        }
        loop {
            let op = *bytes.get(*pc).ok_or(Error::Malformed(UNEXPECTED_END))?;
            *pc += 1;
            match op {
                0x41 => stack.push(WasmValue::from_i32(read_sleb128_i32(bytes, pc))),
                0x42 => stack.push(WasmValue::from_i64(read_sleb128_i64(bytes, pc))),
                0x43 => stack.push(WasmValue::from_f32_bits(read_u32_le(bytes, pc))),
                0x44 => stack.push(WasmValue::from_f64_bits(read_u64_le(bytes, pc))),
                0x23 => {
                    let idx = read_leb128(bytes, pc) as usize;
                    let global = globals.get(idx).ok_or(Error::validation(UNKNOWN_GLOBAL))?;
                    stack.push(global.get());
                }
                0x6a => { let b = pop!().as_u32(); let a = pop!().as_u32(); stack.push(WasmValue::from_u32(a.wrapping_add(b))); }
                0x6b => { let b = pop!().as_u32(); let a = pop!().as_u32(); stack.push(WasmValue::from_u32(a.wrapping_sub(b))); }
                0x6c => { let b = pop!().as_u32(); let a = pop!().as_u32(); stack.push(WasmValue::from_u32(a.wrapping_mul(b))); }
                0x7c => { let b = pop!().as_u64(); let a = pop!().as_u64(); stack.push(WasmValue::from_u64(a.wrapping_add(b))); }
                0x7d => { let b = pop!().as_u64(); let a = pop!().as_u64(); stack.push(WasmValue::from_u64(a.wrapping_sub(b))); }
                0x7e => { let b = pop!().as_u64(); let a = pop!().as_u64(); stack.push(WasmValue::from_u64(a.wrapping_mul(b))); }
                0x0b => break,
                _ => return Err(Error::validation(CONST_EXP_REQUIRED)),
            }
        }
        Ok(pop!())
    }

    pub fn module(&self) -> &Rc<Module> { &self.module }

    pub fn limits(&self) -> &Limits { &self.limits }

    /// View of linear memory. Invoking while a view is held fails with
    /// `Error::MemoryBorrowed` once the guest touches memory.
    pub fn memory(&self) -> Option<Ref<'_, WasmMemory>> {
        self.memory.as_ref().map(RefCell::borrow)
    }

    pub fn memory_mut(&self) -> Option<RefMut<'_, WasmMemory>> {
        self.memory.as_ref().map(RefCell::borrow_mut)
    }

    pub(crate) fn memory_cell(&self) -> Option<&RefCell<WasmMemory>> {
        self.memory.as_ref()
    }

    /// Index of the exported function `name`.
    pub fn export(&self, name: &str) -> Result<u32, Error> {
        match self.module.export(name) {
            Some(export) if export.kind == ExternKind::Func => Ok(export.idx),
            _ => Err(Error::UnknownExport(name.to_owned())),
        }
    }

    pub fn exported_functions(&self) -> impl Iterator<Item = (&str, &Signature)> + '_ {
        self.module.exports.iter()
            .filter(|e| e.kind == ExternKind::Func)
            .map(|e| (e.name.as_str(), self.func_type(e.idx)))
    }

    pub fn func_signature(&self, name: &str) -> Result<&Signature, Error> {
        Ok(self.func_type(self.export(name)?))
    }

    pub(crate) fn func_type(&self, idx: u32) -> &Signature {
        &self.module.types[self.functions[idx as usize].type_idx() as usize]
    }

    /// Current value of an exported global.
    pub fn global(&self, name: &str) -> Option<Value> {
        let export = self.module.export(name)?;
        if export.kind != ExternKind::Global {
            return None;
        }
        let ty = self.module.globals[export.idx as usize].ty;
        Some(Value::from_raw(self.globals[export.idx as usize].get(), ty))
    }

    pub fn set_fuel(&self, fuel: Option<u64>) { self.fuel.set(fuel) }

    pub fn fuel(&self) -> Option<u64> { self.fuel.get() }

    pub fn is_poisoned(&self) -> bool { self.poisoned.get() }

    pub fn invoke(&self, name: &str, args: &[Value]) -> Result<Vec<Value>, Error> {
        self.invoke_at_depth(name, args, 0)
    }

    /// Like `invoke`, but reports traps and host aborts as an `Outcome`.
    /// Embedder mistakes are still errors.
    pub fn execute(&self, name: &str, args: &[Value]) -> Result<Outcome, Error> {
        match self.invoke(name, args) {
            Ok(values) => Ok(Outcome::Returned(values)),
            Err(Error::Trap(trap)) => Ok(Outcome::Trapped(trap)),
            Err(Error::HostAbort(msg)) => Ok(Outcome::HostAborted(msg)),
            Err(e) => Err(e),
        }
    }

    pub(crate) fn invoke_at_depth(&self, name: &str, args: &[Value], depth: usize) -> Result<Vec<Value>, Error> {
        let idx = self.export(name)?;
        let sig = self.func_type(idx);
        if args.len() != sig.params.len() || args.iter().zip(&sig.params).any(|(a, ty)| a.ty() != *ty) {
            return Err(Error::ArgumentMismatch);
        }
        let raw: Vec<WasmValue> = args.iter().map(|a| a.to_raw()).collect();
        let results = self.invoke_index(idx, &raw, depth)?;
        Ok(results.into_iter().zip(&sig.results).map(|(raw, ty)| Value::from_raw(raw, *ty)).collect())
    }

    /// Runs function `idx` with already type-checked raw arguments. A call
    /// made while a host function is running never starts below that host
    /// call's depth.
    pub(crate) fn invoke_index(&self, idx: u32, args: &[WasmValue], depth: usize) -> Result<Vec<WasmValue>, Error> {
        if self.poisoned.get() {
            return Err(Error::Poisoned);
        }
        if idx as usize >= self.functions.len() {
            return Err(Error::validation(UNKNOWN_FUNC));
        }
        let depth = depth.max(self.reentry_depth.get());
        self.call_function(idx, args, depth).inspect_err(|e| {
            if e.is_fatal() {
                debug_println!("instance poisoned: {}", e);
                self.poisoned.set(true);
            }
        })
    }
}
