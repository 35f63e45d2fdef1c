use std::cell::{Ref, RefCell, RefMut};
use std::collections::HashMap;
use std::rc::Rc;

use crate::ctype::WasmPtr;
use crate::error::*;
use crate::instance::Instance;
use crate::signature::{Signature, ValType};
use crate::typed::{TypedFunc, WasmTypes};
use crate::value::Value;
use crate::wasm_memory::WasmMemory;

/// Upper bound on the message a guest can pass to a `fail` style import.
pub const FAIL_MESSAGE_LIMIT: usize = 4096;

pub type HostCallback = dyn Fn(&mut Caller<'_>, &[Value]) -> Result<Option<Value>, Error>;

/// A host function bound to an import. Returning `Err` aborts the whole call
/// chain; `Error::HostAbort` is the way to stop execution on purpose.
#[derive(Clone)]
pub struct HostFunc {
    sig: Signature,
    callback: Rc<HostCallback>,
}

impl HostFunc {
    pub fn new(
        params: impl Into<Vec<ValType>>,
        result: Option<ValType>,
        callback: impl Fn(&mut Caller<'_>, &[Value]) -> Result<Option<Value>, Error> + 'static,
    ) -> Self {
        Self {
            sig: Signature { params: params.into(), results: result.into_iter().collect() },
            callback: Rc::new(callback),
        }
    }

    /// `(i32) -> ()` binding that reads a NUL-terminated message at the given
    /// pointer and aborts with it.
    pub fn abort_with_cstr() -> Self {
        HostFunc::new([ValType::I32], None, |caller, args| {
            let ptr = args.first().and_then(Value::as_i32).ok_or(Error::ArgumentMismatch)?;
            let msg = caller.memory()?.read_cstr(WasmPtr::new(ptr as u32), FAIL_MESSAGE_LIMIT)?;
            Err(Error::HostAbort(msg))
        })
    }

    pub fn signature(&self) -> &Signature { &self.sig }

    pub(crate) fn call(&self, caller: &mut Caller<'_>, args: &[Value]) -> Result<Option<Value>, Error> {
        (self.callback)(caller, args)
    }

    /// Runs the binding outside of any instance. Arguments are checked against
    /// the signature; memory access and re-entry fail with
    /// `Error::CallerNotWasm`.
    pub fn call_standalone(&self, args: &[Value]) -> Result<Option<Value>, Error> {
        if args.len() != self.sig.params.len() || args.iter().zip(&self.sig.params).any(|(a, ty)| a.ty() != *ty) {
            return Err(Error::ArgumentMismatch);
        }
        let mut caller = Caller { instance: None, depth: 0 };
        let result = (self.callback)(&mut caller, args)?;
        match (&result, self.sig.results.first()) {
            (None, None) => Ok(result),
            (Some(v), Some(&ty)) if v.ty() == ty => Ok(result),
            _ => Err(Error::ArgumentMismatch),
        }
    }
}

/// Host import with direct access to the caller's linear memory, such as an
/// allocator. It cannot re-enter the instance.
pub trait MemoryHook {
    fn signature(&self) -> Signature;
    fn call(&mut self, memory: &mut WasmMemory, args: &[Value]) -> Result<Option<Value>, Error>;
}

pub type SharedMemoryHook = Rc<RefCell<dyn MemoryHook>>;

#[derive(Clone)]
pub enum ImportBinding {
    Func(HostFunc),
    Memory(SharedMemoryHook),
}

impl ImportBinding {
    pub fn memory_hook<H: MemoryHook + 'static>(hook: H) -> Self {
        ImportBinding::Memory(Rc::new(RefCell::new(hook)))
    }

    pub fn signature(&self) -> Signature {
        match self {
            ImportBinding::Func(f) => f.sig.clone(),
            ImportBinding::Memory(hook) => hook.borrow().signature(),
        }
    }
}

impl From<HostFunc> for ImportBinding {
    fn from(f: HostFunc) -> Self { ImportBinding::Func(f) }
}

/// Bindings keyed by (module, name), consulted once per import during
/// instantiation.
#[derive(Clone, Default)]
pub struct Imports {
    modules: HashMap<String, HashMap<String, ImportBinding>>,
}

impl Imports {
    pub fn new() -> Self { Self::default() }

    pub fn define(&mut self, module: &str, name: &str, binding: impl Into<ImportBinding>) -> &mut Self {
        self.modules.entry(module.to_owned()).or_default().insert(name.to_owned(), binding.into());
        self
    }

    pub fn get(&self, module: &str, name: &str) -> Option<&ImportBinding> {
        self.modules.get(module).and_then(|m| m.get(name))
    }

    pub fn len(&self) -> usize { self.modules.values().map(HashMap::len).sum() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

/// Handle given to a host function for the duration of one call. A caller
/// made by `HostFunc::call_standalone` has no instance behind it.
pub struct Caller<'a> {
    instance: Option<&'a Instance>,
    depth: usize,
}

impl<'a> Caller<'a> {
    pub(crate) fn new(instance: &'a Instance, depth: usize) -> Self { Self { instance: Some(instance), depth } }

    fn instance(&self) -> Result<&'a Instance, Error> {
        self.instance.ok_or(Error::CallerNotWasm)
    }

    pub fn memory(&self) -> Result<Ref<'_, WasmMemory>, Error> {
        self.instance()?
            .memory_cell()
            .ok_or(Error::link(UNKNOWN_MEMORY))?
            .try_borrow()
            .map_err(|_| Error::MemoryBorrowed)
    }

    pub fn memory_mut(&mut self) -> Result<RefMut<'_, WasmMemory>, Error> {
        self.instance()?
            .memory_cell()
            .ok_or(Error::link(UNKNOWN_MEMORY))?
            .try_borrow_mut()
            .map_err(|_| Error::MemoryBorrowed)
    }

    /// Calls an export of the same instance. The nested call shares the call
    /// depth budget of the caller.
    pub fn invoke(&mut self, name: &str, args: &[Value]) -> Result<Vec<Value>, Error> {
        self.instance()?.invoke_at_depth(name, args, self.depth)
    }

    /// Typed counterpart of `invoke`.
    pub fn call_typed<P: WasmTypes, R: WasmTypes>(&mut self, func: &TypedFunc<P, R>, params: P) -> Result<R, Error> {
        func.call_at_depth(self.instance()?, params, self.depth)
    }

    pub fn depth(&self) -> usize { self.depth }

    pub fn is_standalone(&self) -> bool { self.instance.is_none() }
}
