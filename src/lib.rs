#![deny(unsafe_code)]

mod leb128;
mod byte_iter;
mod interpreter;

// Debug macro that only prints when wasm_debug feature is enabled
#[cfg(feature = "wasm_debug")]
macro_rules! debug_println {
    ($($arg:tt)*) => {
        eprintln!($($arg)*);
    };
}

#[cfg(not(feature = "wasm_debug"))]
macro_rules! debug_println {
    ($($arg:tt)*) => {};
}

pub(crate) use debug_println;

pub mod validator;

pub mod config;
pub mod ctype;
pub mod error;
pub mod heap;
pub mod host;
pub mod instance;
pub mod module;
pub mod signature;
pub mod typed;
pub mod value;
pub mod wasm_memory;

pub use config::Limits;
pub use ctype::{CType, WasmPtr, WasmSize};
pub use error::{Error, Trap};
pub use heap::{BlockHeader, HeapAllocator, HeapCell, HeapStats, HeapUsage};
pub use host::{Caller, HostFunc, ImportBinding, Imports, MemoryHook, SharedMemoryHook};
pub use instance::{Instance, Outcome};
pub use module::Module;
pub use signature::{Signature, ValType};
pub use typed::{TypedFunc, WasmType, WasmTypes};
pub use value::{Value, WasmValue};
pub use wasm_memory::WasmMemory;
