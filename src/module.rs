use std::collections::HashMap;
use std::ops::Range;
use std::rc::Rc;

use nohash_hasher::IntMap;

use crate::byte_iter::*;
use crate::debug_println;
use crate::error::*;
use crate::signature::*;
use crate::validator::Validator;
use crate::wasm_memory::WasmMemory;

const MAGIC_HEADER: &[u8; 4] = b"\0asm";

// ---------------- Import/Export related ----------------
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImportRef { pub module: String, pub name: String }

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExternKind {
    Func = 0,
    Table = 1,
    Mem = 2,
    Global = 3,
}

impl ExternKind {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(ExternKind::Func),
            1 => Some(ExternKind::Table),
            2 => Some(ExternKind::Mem),
            3 => Some(ExternKind::Global),
            _ => None,
        }
    }
}

/// One entry of the import section, in declaration order.
#[derive(Clone, Debug)]
pub struct Import { pub module: String, pub name: String, pub kind: ExternKind }

// ---------------- Structures ----------------
#[derive(Clone, Debug)]
pub struct Function {
    pub type_idx: u32,
    pub ty: Signature,
    /// Params followed by declared locals.
    pub locals: Vec<ValType>,
    pub body: Range<usize>,
    pub import: Option<ImportRef>,
}

impl Function {
    pub fn is_imported(&self) -> bool { self.import.is_some() }
}

#[derive(Clone, Debug)]
pub struct Table {
    pub min: u32,
    pub max: Option<u32>,
    pub import: Option<ImportRef>,
}

#[derive(Clone, Debug)]
pub struct Memory {
    pub min: u32,
    pub max: Option<u32>,
    pub import: Option<ImportRef>,
}

#[derive(Clone, Debug)]
pub struct Global {
    pub ty: ValType,
    pub is_mutable: bool,
    pub initializer_offset: usize,
    pub import: Option<ImportRef>,
}

#[derive(Clone, Debug)]
pub struct Export { pub name: String, pub kind: ExternKind, pub idx: u32 }

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SegmentMode {
    /// Copied at instantiation; the payload is the offset of the const expr.
    Active { initializer_offset: usize },
    Passive,
    Declarative,
}

#[derive(Clone, Debug)]
pub struct ElementSegment {
    pub mode: SegmentMode,
    /// `None` is a null reference.
    pub func_indices: Vec<Option<u32>>,
}

#[derive(Clone, Debug)]
pub struct DataSegment {
    pub mode: SegmentMode,
    pub data_range: Range<usize>,
}

/// Control-flow metadata for one `block`, `loop` or `if`, keyed by the byte
/// offset of its opcode. Offsets point just past the named instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockJump {
    pub body_pc: usize,
    pub else_pc: Option<usize>,
    pub end_pc: usize,
    pub n_params: u32,
    pub n_results: u32,
}

#[derive(Clone, Debug)]
pub struct CustomSection { pub name: String, pub data_range: Range<usize> }

// ---------------- Module Structure ----------------
pub struct Module {
    pub bytes: Rc<Vec<u8>>,
    pub types: Vec<Signature>,
    pub imports: Vec<Import>,
    pub table: Option<Table>,
    pub memory: Option<Memory>,
    pub globals: Vec<Global>,
    pub exports: Vec<Export>,
    export_index: HashMap<String, usize>,
    pub start: Option<u32>,
    pub elements: Vec<ElementSegment>,
    pub functions: Vec<Function>,
    pub data_count: Option<u32>,
    pub data_segments: Vec<DataSegment>,
    pub custom_sections: Vec<CustomSection>,
    pub side_table: IntMap<usize, BlockJump>,
    validated: bool,
}

macro_rules! assert_not_empty {
    ($it:expr) => { if $it.empty() { return Err(Error::Malformed(UNEXPECTED_END)); } };
}

impl Module {
    pub const MAX_LOCALS: usize = 50000;

    /// Decodes and validates `bytes`. The result is ready to instantiate.
    pub fn compile(bytes: Vec<u8>) -> Result<Self, Error> {
        let mut m = Self::decode(bytes)?;
        m.validate()?;
        Ok(m)
    }

    /// Decodes the binary into its sections without type checking function
    /// bodies.
    pub fn decode(bytes: Vec<u8>) -> Result<Self, Error> {
        let mut m = Module {
            bytes: Rc::new(bytes),
            types: Vec::new(),
            imports: Vec::new(),
            table: None,
            memory: None,
            globals: Vec::new(),
            exports: Vec::new(),
            export_index: HashMap::new(),
            start: None,
            elements: Vec::new(),
            functions: Vec::new(),
            data_count: None,
            data_segments: Vec::new(),
            custom_sections: Vec::new(),
            side_table: IntMap::default(),
            validated: false,
        };
        m.initialize()?;
        debug_println!(
            "decoded module: {} types, {} imports, {} functions, {} exports",
            m.types.len(), m.imports.len(), m.functions.len(), m.exports.len()
        );
        Ok(m)
    }

    /// Runs the validator over every locally defined function and the start
    /// function, filling the side table used by the interpreter.
    pub fn validate(&mut self) -> Result<(), Error> {
        if self.validated { return Ok(()); }
        let side_table = Validator::new(self).validate_module()?;
        self.side_table = side_table;
        self.validated = true;
        Ok(())
    }

    pub fn is_validated(&self) -> bool { self.validated }

    pub fn export(&self, name: &str) -> Option<&Export> {
        self.export_index.get(name).map(|&i| &self.exports[i])
    }

    pub fn n_imported_functions(&self) -> usize {
        self.functions.iter().take_while(|f| f.is_imported()).count()
    }

    fn initialize(&mut self) -> Result<(), Error> {
        let bytes_rc = self.bytes.clone();
        let bytes: &[u8] = &bytes_rc[..];

        if bytes.len() < 4 { return Err(Error::Malformed(UNEXPECTED_END)); }
        if &bytes[0..4] != MAGIC_HEADER {
            return Err(Error::Malformed(NO_MAGIC_HEADER));
        }
        if bytes.len() < 8 { return Err(Error::Malformed(UNEXPECTED_END)); }
        let mut it = ByteIter::new(bytes, 4);
        if u32::from_le_bytes(it.read_fixed::<4>()?) != 1 {
            return Err(Error::Malformed(UNKNOWN_BINARY_VERSION));
        }

        let mut n_declared = 0;
        let mut n_bodies = 0;
        self.skip_custom_sections(&mut it)?;
        self.section(&mut it, 1, |m, it| m.parse_type_section(it))?;
        self.section(&mut it, 2, |m, it| m.parse_import_section(it))?;
        self.section(&mut it, 3, |m, it| { n_declared = m.parse_function_section(it)?; Ok(()) })?;
        self.section(&mut it, 4, |m, it| m.parse_table_section(it))?;
        self.section(&mut it, 5, |m, it| m.parse_memory_section(it))?;
        self.section(&mut it, 6, |m, it| m.parse_global_section(it))?;
        self.section(&mut it, 7, |m, it| m.parse_export_section(it))?;
        self.section(&mut it, 8, |m, it| m.parse_start_section(it))?;
        self.section(&mut it, 9, |m, it| m.parse_element_section(it))?;
        self.section(&mut it, 12, |m, it| { m.data_count = Some(it.read_u32()?); Ok(()) })?;
        self.section(&mut it, 10, |m, it| { n_bodies = m.parse_code_section(it)?; Ok(()) })?;
        self.section(&mut it, 11, |m, it| m.parse_data_section(it))?;

        if !it.empty() {
            return match it.peek_u8()? {
                0..=12 => Err(Error::Malformed(SECTION_OUT_OF_ORDER)),
                _ => Err(Error::Malformed(INVALID_SECTION_ID)),
            };
        }
        if n_declared != n_bodies {
            return Err(Error::Malformed(FUNC_CODE_INCONSISTENT));
        }
        if let Some(count) = self.data_count {
            if count as usize != self.data_segments.len() {
                return Err(Error::Malformed(DATA_COUNT_MISMATCH));
            }
        }
        Ok(())
    }

    /// Parses section `id` if it is next, then skips any custom sections
    /// that follow it.
    fn section<F>(&mut self, it: &mut ByteIter, id: u8, mut reader: F) -> Result<(), Error>
    where
        F: FnMut(&mut Self, &mut ByteIter) -> Result<(), Error>
    {
        if !it.empty() && it.peek_u8()? == id {
            it.advance(1);
            let section_length = it.read_u32()? as usize;
            let section_start = it.cur();
            if !it.has_n_left(section_length) {
                return Err(Error::Malformed(UNEXPECTED_END));
            }
            let mut body = ByteIter::new(&it.bytes[..section_start + section_length], section_start);
            reader(self, &mut body)?;
            if body.cur() != section_start + section_length {
                return Err(Error::Malformed(SECTION_SIZE_MISMATCH));
            }
            it.idx = body.cur();
        }
        self.skip_custom_sections(it)
    }

    fn skip_custom_sections(&mut self, it: &mut ByteIter) -> Result<(), Error> {
        while !it.empty() && it.peek_u8()? == 0 {
            it.advance(1);
            let section_length = it.read_u32()? as usize;
            let section_end = it.cur().checked_add(section_length).ok_or(Error::Malformed(UNEXPECTED_END))?;
            if !it.has_n_left(section_length) {
                return Err(Error::Malformed(UNEXPECTED_END));
            }
            let mut body = ByteIter::new(&it.bytes[..section_end], it.cur());
            let name = body.read_name()?;
            debug_println!("skipping custom section {:?} ({} bytes)", name, section_length);
            self.custom_sections.push(CustomSection { name, data_range: body.cur()..section_end });
            it.idx = section_end;
        }
        Ok(())
    }

    fn parse_type_section(&mut self, it: &mut ByteIter) -> Result<(), Error> {
        let n_types = it.read_u32()?;
        self.types.reserve_exact((n_types as usize).min(it.bytes.len()));
        for _ in 0..n_types {
            assert_not_empty!(it);
            self.types.push(Signature::read_func_type(it)?);
        }
        Ok(())
    }

    fn type_at(&self, type_idx: u32) -> Result<Signature, Error> {
        self.types.get(type_idx as usize).cloned().ok_or(Error::validation(UNKNOWN_TYPE))
    }

    fn parse_import_section(&mut self, it: &mut ByteIter) -> Result<(), Error> {
        let n_imports = it.read_u32()?;

        for _ in 0..n_imports {
            assert_not_empty!(it);
            let module = it.read_name()?;
            let name = it.read_name()?;
            let kind = ExternKind::from_byte(it.read_u8()?).ok_or(Error::Malformed(MALFORMED_IMPORT_KIND))?;
            let import = Some(ImportRef { module: module.clone(), name: name.clone() });
            self.imports.push(Import { module, name, kind });

            match kind {
                ExternKind::Func => {
                    let type_idx = it.read_u32()?;
                    let ty = self.type_at(type_idx)?;
                    self.functions.push(Function { type_idx, ty, locals: vec![], body: 0..0, import });
                }
                ExternKind::Table => {
                    if self.table.is_some() {
                        return Err(Error::validation(MULTIPLE_TABLES));
                    }
                    if it.read_u8()? != 0x70 {
                        return Err(Error::Malformed(MALFORMED_REF_TYPE));
                    }
                    let (min, max) = get_limits(it)?;
                    self.table = Some(Table { min, max, import });
                }
                ExternKind::Mem => {
                    if self.memory.is_some() {
                        return Err(Error::validation(MULTIPLE_MEMORIES));
                    }
                    let (min, max) = get_memory_limits(it)?;
                    self.memory = Some(Memory { min, max, import });
                }
                ExternKind::Global => {
                    let ty = ValType::read(it)?;
                    let is_mutable = mutability_from_byte(it.read_u8()?)?;
                    self.globals.push(Global { ty, is_mutable, initializer_offset: 0, import });
                }
            }
        }
        Ok(())
    }

    fn parse_function_section(&mut self, it: &mut ByteIter) -> Result<u32, Error> {
        let n_functions = it.read_u32()?;
        for _ in 0..n_functions {
            assert_not_empty!(it);
            let type_idx = it.read_u32()?;
            let ty = self.type_at(type_idx)?;
            self.functions.push(Function { type_idx, ty, locals: vec![], body: 0..0, import: None });
        }
        Ok(n_functions)
    }

    fn parse_table_section(&mut self, it: &mut ByteIter) -> Result<(), Error> {
        let n_tables = it.read_u32()?;
        if n_tables > 1 || (n_tables == 1 && self.table.is_some()) {
            return Err(Error::validation(MULTIPLE_TABLES));
        }
        if n_tables == 1 {
            if it.read_u8()? != 0x70 {
                return Err(Error::Malformed(MALFORMED_REF_TYPE));
            }
            let (min, max) = get_limits(it)?;
            self.table = Some(Table { min, max, import: None });
        }
        Ok(())
    }

    fn parse_memory_section(&mut self, it: &mut ByteIter) -> Result<(), Error> {
        let n_memories = it.read_u32()?;
        if n_memories > 1 || (n_memories == 1 && self.memory.is_some()) {
            return Err(Error::validation(MULTIPLE_MEMORIES));
        }
        if n_memories == 1 {
            let (min, max) = get_memory_limits(it)?;
            self.memory = Some(Memory { min, max, import: None });
        }
        Ok(())
    }

    fn parse_global_section(&mut self, it: &mut ByteIter) -> Result<(), Error> {
        let n_globals = it.read_u32()?;
        for _ in 0..n_globals {
            assert_not_empty!(it);
            let ty = ValType::read(it)?;
            let is_mutable = mutability_from_byte(it.read_u8()?)?;
            let initializer_offset = it.cur();
            // Initializers may only read globals declared before this one.
            validate_const(it, ty, &self.globals)?;
            self.globals.push(Global { ty, is_mutable, initializer_offset, import: None });
        }
        Ok(())
    }

    fn parse_export_section(&mut self, it: &mut ByteIter) -> Result<(), Error> {
        let n_exports = it.read_u32()?;
        for _ in 0..n_exports {
            assert_not_empty!(it);
            let name = it.read_name()?;
            let kind = ExternKind::from_byte(it.read_u8()?).ok_or(Error::Malformed(MALFORMED_IMPORT_KIND))?;
            let idx = it.read_u32()?;

            if self.export_index.contains_key(&name) {
                return Err(Error::validation(DUP_EXPORT_NAME));
            }
            match kind {
                ExternKind::Func if idx as usize >= self.functions.len() => {
                    return Err(Error::validation(UNKNOWN_FUNC));
                }
                ExternKind::Table if idx != 0 || self.table.is_none() => {
                    return Err(Error::validation(UNKNOWN_TABLE));
                }
                ExternKind::Mem if idx != 0 || self.memory.is_none() => {
                    return Err(Error::validation(UNKNOWN_MEMORY));
                }
                ExternKind::Global if idx as usize >= self.globals.len() => {
                    return Err(Error::validation(UNKNOWN_GLOBAL));
                }
                _ => {}
            }
            self.export_index.insert(name.clone(), self.exports.len());
            self.exports.push(Export { name, kind, idx });
        }
        Ok(())
    }

    fn parse_start_section(&mut self, it: &mut ByteIter) -> Result<(), Error> {
        let start = it.read_u32()?;
        if start as usize >= self.functions.len() {
            return Err(Error::validation(UNKNOWN_FUNC));
        }
        self.start = Some(start);
        Ok(())
    }

    fn parse_element_section(&mut self, it: &mut ByteIter) -> Result<(), Error> {
        let n_segments = it.read_u32()?;
        for _ in 0..n_segments {
            assert_not_empty!(it);
            let flags = it.read_u32()?;
            if flags > 7 {
                return Err(Error::Malformed(MALFORMED_ELEM_KIND));
            }
            let uses_exprs = flags & 0b100 != 0;
            let mode = if flags & 0b001 == 0 {
                if flags & 0b010 != 0 && it.read_u32()? != 0 {
                    return Err(Error::validation(UNKNOWN_TABLE));
                }
                if self.table.is_none() {
                    return Err(Error::validation(UNKNOWN_TABLE));
                }
                let initializer_offset = it.cur();
                validate_const(it, ValType::I32, &self.globals)?;
                SegmentMode::Active { initializer_offset }
            } else if flags & 0b010 == 0 {
                SegmentMode::Passive
            } else {
                SegmentMode::Declarative
            };
            // Flags 0 and 4 imply funcref; the others spell out the kind.
            if flags & 0b011 != 0 {
                let kind = it.read_u8()?;
                match (uses_exprs, kind) {
                    (false, 0x00) | (true, 0x70) => {}
                    (false, _) => return Err(Error::Malformed(MALFORMED_ELEM_KIND)),
                    (true, _) => return Err(Error::Malformed(MALFORMED_REF_TYPE)),
                }
            }

            let n_elems = it.read_u32()?;
            let mut func_indices = Vec::with_capacity((n_elems as usize).min(it.bytes.len()));
            for _ in 0..n_elems {
                let func = if uses_exprs { read_elem_expr(it)? } else { Some(it.read_u32()?) };
                if let Some(idx) = func {
                    if idx as usize >= self.functions.len() {
                        return Err(Error::validation(UNKNOWN_FUNC));
                    }
                }
                func_indices.push(func);
            }
            self.elements.push(ElementSegment { mode, func_indices });
        }
        Ok(())
    }

    fn parse_code_section(&mut self, it: &mut ByteIter) -> Result<u32, Error> {
        let n_bodies = it.read_u32()?;
        let first = self.n_imported_functions();
        if first + n_bodies as usize != self.functions.len() {
            return Err(Error::Malformed(FUNC_CODE_INCONSISTENT));
        }

        for i in first..self.functions.len() {
            let function_length = it.read_u32()? as usize;
            let func_start = it.cur();
            let func_end = func_start.checked_add(function_length).ok_or(Error::Malformed(UNEXPECTED_END))?;
            if !it.has_n_left(function_length) {
                return Err(Error::Malformed(UNEXPECTED_END));
            }
            let mut body = ByteIter::new(&it.bytes[..func_end], func_start);

            let mut locals = self.functions[i].ty.params.clone();
            let n_local_decls = body.read_u32()?;
            for _ in 0..n_local_decls {
                let n_locals = body.read_u32()? as usize;
                let ty = ValType::read(&mut body)?;
                if locals.len() + n_locals > Module::MAX_LOCALS {
                    return Err(Error::Malformed(TOO_MANY_LOCALS));
                }
                locals.resize(locals.len() + n_locals, ty);
            }

            let function = &mut self.functions[i];
            function.locals = locals;
            function.body = body.cur()..func_end;
            it.idx = func_end;
        }
        Ok(n_bodies)
    }

    fn parse_data_section(&mut self, it: &mut ByteIter) -> Result<(), Error> {
        let n_data_segments = it.read_u32()?;
        for _ in 0..n_data_segments {
            assert_not_empty!(it);
            let mode = match it.read_u32()? {
                flag @ (0 | 2) => {
                    if flag == 2 && it.read_u32()? != 0 {
                        return Err(Error::validation(UNKNOWN_MEMORY));
                    }
                    if self.memory.is_none() {
                        return Err(Error::validation(UNKNOWN_MEMORY));
                    }
                    let initializer_offset = it.cur();
                    validate_const(it, ValType::I32, &self.globals)?;
                    SegmentMode::Active { initializer_offset }
                }
                1 => SegmentMode::Passive,
                _ => return Err(Error::validation(INVALID_DATA_SEG_FLAG)),
            };

            let data_length = it.read_u32()? as usize;
            if !it.has_n_left(data_length) {
                return Err(Error::Malformed(UNEXPECTED_END));
            }
            let data_start = it.cur();
            it.advance(data_length);
            self.data_segments.push(DataSegment { mode, data_range: data_start..it.cur() });
        }
        Ok(())
    }
}

// ---------------- Helper Functions ----------------

/// Checks a constant expression producing `expected`. Only constants,
/// `global.get` of an immutable global and integer add/sub/mul are allowed.
fn validate_const(it: &mut ByteIter, expected: ValType, globals: &[Global]) -> Result<(), Error> {
    let mut stack: Vec<ValType> = Vec::new();
    macro_rules! binary {
        ($ty:expr) => {{
            if stack.pop() != Some($ty) || stack.pop() != Some($ty) {
                return Err(Error::validation(TYPE_MISMATCH));
            }
            stack.push($ty);
        }};
    }
    loop {
        match it.read_u8()? {
            0x0b => break,
            0x41 => { it.read_i32()?; stack.push(ValType::I32); }
            0x42 => { it.read_i64()?; stack.push(ValType::I64); }
            0x43 => { it.read_bytes(4)?; stack.push(ValType::F32); }
            0x44 => { it.read_bytes(8)?; stack.push(ValType::F64); }
            0x23 => {
                let idx = it.read_u32()? as usize;
                let global = globals.get(idx).ok_or(Error::validation(UNKNOWN_GLOBAL))?;
                if global.is_mutable {
                    return Err(Error::validation(CONST_EXP_REQUIRED));
                }
                stack.push(global.ty);
            }
            0x6a..=0x6c => binary!(ValType::I32),
            0x7c..=0x7e => binary!(ValType::I64),
            _ => return Err(Error::validation(CONST_EXP_REQUIRED)),
        }
    }
    if stack.len() != 1 || stack[0] != expected {
        return Err(Error::validation(TYPE_MISMATCH));
    }
    Ok(())
}

/// `ref.func idx end` or `ref.null func end`.
fn read_elem_expr(it: &mut ByteIter) -> Result<Option<u32>, Error> {
    let func = match it.read_u8()? {
        0xd2 => Some(it.read_u32()?),
        0xd0 => {
            if it.read_u8()? != 0x70 {
                return Err(Error::Malformed(MALFORMED_REF_TYPE));
            }
            None
        }
        _ => return Err(Error::validation(CONST_EXP_REQUIRED)),
    };
    if it.read_u8()? != 0x0b {
        return Err(Error::Malformed(END_EXPECTED));
    }
    Ok(func)
}

fn mutability_from_byte(byte: u8) -> Result<bool, Error> {
    match byte {
        0 => Ok(false),
        1 => Ok(true),
        _ => Err(Error::Malformed(INVALID_MUTABILITY)),
    }
}

fn get_limits(it: &mut ByteIter) -> Result<(u32, Option<u32>), Error> {
    let flags: u32 = crate::leb128::safe_read_leb128(it.bytes, &mut it.idx, 1)?;
    let initial = it.read_u32()?;
    let max = if flags == 1 { Some(it.read_u32()?) } else { None };
    if max.is_some_and(|max| max < initial) {
        return Err(Error::validation(MIN_GREATER_THAN_MAX));
    }
    Ok((initial, max))
}

fn get_memory_limits(it: &mut ByteIter) -> Result<(u32, Option<u32>), Error> {
    let (initial, max) = get_limits(it)?;
    if initial > WasmMemory::MAX_PAGES || max.is_some_and(|max| max > WasmMemory::MAX_PAGES) {
        return Err(Error::validation(MEMORY_SIZE_LIMIT));
    }
    Ok((initial, max))
}
