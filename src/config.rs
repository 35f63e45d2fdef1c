use serde::Deserialize;
use crate::error::Error;
use crate::wasm_memory::WasmMemory;

/// Resource limits applied to an instance. Every field has a default, so a
/// partial JSON object only overrides what it names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Limits {
    /// Maximum number of nested wasm call frames, host re-entry included.
    pub max_call_depth: usize,
    /// Maximum number of host calls live at once. Each host re-entry nests the
    /// interpreter on the native stack, so this stays well below
    /// `max_call_depth`.
    pub max_host_depth: usize,
    /// Maximum number of operand stack slots, locals included.
    pub max_value_stack: usize,
    /// Upper bound on linear memory pages, on top of the module's own maximum.
    pub max_memory_pages: u32,
    /// Upper bound on the initial size of the table.
    pub max_table_elements: u32,
    /// Instruction budget. `None` runs without metering.
    pub fuel: Option<u64>,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_call_depth: 1024,
            max_host_depth: 32,
            max_value_stack: 1 << 20,
            max_memory_pages: WasmMemory::MAX_PAGES,
            max_table_elements: 1 << 20,
            fuel: None,
        }
    }
}

impl Limits {
    pub fn from_json(text: &str) -> Result<Self, Error> {
        let limits: Limits = serde_json::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        if limits.max_memory_pages > WasmMemory::MAX_PAGES {
            return Err(Error::Config(format!("max_memory_pages {} exceeds {}", limits.max_memory_pages, WasmMemory::MAX_PAGES)));
        }
        if limits.max_call_depth == 0 {
            return Err(Error::Config("max_call_depth must be positive".into()));
        }
        if limits.max_host_depth > limits.max_call_depth {
            return Err(Error::Config(format!(
                "max_host_depth {} exceeds max_call_depth {}",
                limits.max_host_depth, limits.max_call_depth,
            )));
        }
        Ok(limits)
    }

    pub fn with_fuel(mut self, fuel: u64) -> Self {
        self.fuel = Some(fuel);
        self
    }
}
