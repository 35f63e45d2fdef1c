use std::fmt::{Display, Formatter};

/// Runtime faults detected by the engine while executing a function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Trap {
    Unreachable,
    MemoryOutOfBounds,
    IntegerDivideByZero,
    IntegerOverflow,
    InvalidConversion,
    StackOverflow,
    UndefinedElement,
    UninitializedElement,
    IndirectCallTypeMismatch,
    OutOfFuel,
}

impl Trap {
    pub fn message(self) -> &'static str {
        match self {
            Trap::Unreachable => UNREACHABLE,
            Trap::MemoryOutOfBounds => OOB_MEMORY_ACCESS,
            Trap::IntegerDivideByZero => DIVIDE_BY_ZERO,
            Trap::IntegerOverflow => INTEGER_OVERFLOW,
            Trap::InvalidConversion => INVALID_CONV_TO_INT,
            Trap::StackOverflow => STACK_EXHAUSTED,
            Trap::UndefinedElement => UNDEF_ELEM,
            Trap::UninitializedElement => UNINITIALIZED_ELEM,
            Trap::IndirectCallTypeMismatch => INDIRECT_CALL_MISMATCH,
            Trap::OutOfFuel => OUT_OF_FUEL,
        }
    }
}

impl Display for Trap {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.message())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The binary could not be decoded.
    Malformed(&'static str),
    /// A decoded module violates the typing or structural rules. `func` is the
    /// function index (in the unified index space) and `offset` the byte offset
    /// of the offending instruction, when the failure is inside a body.
    Validation { func: Option<u32>, offset: usize, msg: &'static str },
    UnresolvedImport { module: String, name: String },
    SignatureMismatch { module: String, name: String },
    Link(&'static str),
    Trap(Trap),
    /// A host binding terminated execution on purpose.
    HostAbort(String),
    UnknownExport(String),
    ArgumentMismatch,
    /// The instance trapped or was aborted earlier and cannot run again.
    Poisoned,
    /// Linear memory is still borrowed through a view the embedder holds.
    MemoryBorrowed,
    /// A host function ran outside any instance and asked for one.
    CallerNotWasm,
    Config(String),
}

impl Error {
    #[inline(always)]
    pub fn malformed(msg: &'static str) -> Self { Error::Malformed(msg) }
    #[inline(always)]
    pub fn validation(msg: &'static str) -> Self { Error::Validation { func: None, offset: 0, msg } }
    #[inline(always)]
    pub fn trap(kind: Trap) -> Self { Error::Trap(kind) }
    #[inline(always)]
    pub fn link(msg: &'static str) -> Self { Error::Link(msg) }
    pub fn host_abort(msg: impl Into<String>) -> Self { Error::HostAbort(msg.into()) }

    pub fn is_trap(&self) -> bool { matches!(self, Error::Trap(_)) }

    pub fn trap_kind(&self) -> Option<Trap> {
        match self {
            Error::Trap(t) => Some(*t),
            _ => None,
        }
    }

    /// Errors after which the instance must not be resumed.
    pub fn is_fatal(&self) -> bool { matches!(self, Error::Trap(_) | Error::HostAbort(_)) }
}

impl From<Trap> for Error {
    fn from(t: Trap) -> Self { Error::Trap(t) }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Malformed(s) | Error::Link(s) => f.write_str(s),
            Error::Validation { func: Some(func), offset, msg } => {
                write!(f, "{} (function {} at offset 0x{:x})", msg, func, offset)
            }
            Error::Validation { func: None, msg, .. } => f.write_str(msg),
            Error::UnresolvedImport { module, name } => write!(f, "{}: {}.{}", UNKNOWN_IMPORT, module, name),
            Error::SignatureMismatch { module, name } => write!(f, "{}: {}.{}", INCOMPATIBLE_IMPORT, module, name),
            Error::Trap(t) => f.write_str(t.message()),
            Error::HostAbort(msg) => write!(f, "host abort: {}", msg),
            Error::UnknownExport(name) => write!(f, "unknown export: {}", name),
            Error::ArgumentMismatch => f.write_str(INVALID_ARGS),
            Error::Poisoned => f.write_str(INSTANCE_POISONED),
            Error::MemoryBorrowed => f.write_str(MEMORY_BORROWED),
            Error::CallerNotWasm => f.write_str(CALLER_NOT_WASM),
            Error::Config(msg) => write!(f, "invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

// Malformed errors
pub const DATA_COUNT_MISMATCH: &str = "data count and data section have inconsistent lengths";
pub const END_EXPECTED: &str = "END opcode expected";
pub const FUNC_CODE_INCONSISTENT: &str = "function and code section have inconsistent lengths";
pub const INT_TOO_LARGE: &str = "integer too large";
pub const INT_TOO_LONG: &str = "integer representation too long";
pub const INVALID_FUNC_TYPE: &str = "invalid function type";
pub const INVALID_MUTABILITY: &str = "invalid mutability";
pub const INVALID_SECTION_ID: &str = "invalid section id";
pub const INVALID_UTF8: &str = "invalid UTF-8 encoding";
pub const INVALID_VALUE_TYPE: &str = "invalid value type";
pub const JUNK_AFTER_LAST: &str = "junk after last section";
pub const MALFORMED_ELEM_KIND: &str = "malformed elements segment kind";
pub const MALFORMED_IMPORT_KIND: &str = "malformed import kind";
pub const MALFORMED_REF_TYPE: &str = "malformed reference type";
pub const MISSING_BLOCK_META: &str = "missing block metadata";
pub const NO_MAGIC_HEADER: &str = "magic header not detected";
pub const SECTION_OUT_OF_ORDER: &str = "unexpected content after last section";
pub const SECTION_SIZE_MISMATCH: &str = "section size mismatch";
pub const TOO_MANY_LOCALS: &str = "too many locals";
pub const UNEXPECTED_END: &str = "unexpected end of section or function";
pub const UNEXPECTED_END_SHORT: &str = "unexpected end";
pub const UNKNOWN_BINARY_VERSION: &str = "unknown binary version";
pub const UNKNOWN_INSTRUCTION: &str = "unknown instruction";
pub const ZERO_FLAG_EXPECTED: &str = "zero byte expected";
// Validation errors
pub const ALIGNMENT_TOO_LARGE: &str = "alignment must not be larger than natural";
pub const CONST_EXP_REQUIRED: &str = "constant expression required";
pub const DUP_EXPORT_NAME: &str = "duplicate export name";
pub const ELSE_MUST_CLOSE_IF: &str = "else must close an if";
pub const GLOBAL_IS_IMMUTABLE: &str = "global is immutable";
pub const INVALID_DATA_SEG_FLAG: &str = "invalid data segment flag";
pub const INVALID_RESULT_ARITY: &str = "invalid result arity";
pub const MEMORY_SIZE_LIMIT: &str = "memory size must be at most 65536 pages (4GiB)";
pub const MIN_GREATER_THAN_MAX: &str = "size minimum must not be greater than maximum";
pub const MULTIPLE_MEMORIES: &str = "multiple memories";
pub const MULTIPLE_TABLES: &str = "multiple tables";
pub const NOT_VALIDATED: &str = "module has not been validated";
pub const START_FUNC: &str = "start function";
pub const TYPE_MISMATCH: &str = "type mismatch";
pub const UNKNOWN_FUNC: &str = "unknown function";
pub const UNKNOWN_GLOBAL: &str = "unknown global";
pub const UNKNOWN_LABEL: &str = "unknown label";
pub const UNKNOWN_LOCAL: &str = "unknown local";
pub const UNKNOWN_MEMORY: &str = "unknown memory";
pub const UNKNOWN_TABLE: &str = "unknown table";
pub const UNKNOWN_TYPE: &str = "unknown type";
// Trap errors
pub const DIVIDE_BY_ZERO: &str = "integer divide by zero";
pub const INDIRECT_CALL_MISMATCH: &str = "indirect call type mismatch";
pub const INTEGER_OVERFLOW: &str = "integer overflow";
pub const INVALID_CONV_TO_INT: &str = "invalid conversion to integer";
pub const OOB_MEMORY_ACCESS: &str = "out of bounds memory access";
pub const OUT_OF_FUEL: &str = "all fuel consumed";
pub const STACK_EXHAUSTED: &str = "call stack exhausted";
pub const UNDEF_ELEM: &str = "undefined element";
pub const UNINITIALIZED_ELEM: &str = "uninitialized element";
pub const UNREACHABLE: &str = "unreachable";
// Link errors
pub const DATA_SEG_DNF: &str = "data segment does not fit";
pub const ELEM_SEG_DNF: &str = "elements segment does not fit";
pub const INCOMPATIBLE_IMPORT: &str = "incompatible import type";
pub const MEMORY_LIMIT_EXCEEDED: &str = "initial memory exceeds the configured page limit";
pub const TABLE_LIMIT_EXCEEDED: &str = "initial table exceeds the configured element limit";
pub const UNKNOWN_IMPORT: &str = "unknown import";
pub const UNSUPPORTED_IMPORT: &str = "unsupported import kind";
// Embedder errors
pub const CALLER_NOT_WASM: &str = "host function was not called from a wasm instance";
pub const INSTANCE_POISONED: &str = "instance was poisoned by an earlier trap";
pub const MEMORY_BORROWED: &str = "linear memory is already borrowed";
pub const INVALID_ARGS: &str = "invalid number or type of arguments";
