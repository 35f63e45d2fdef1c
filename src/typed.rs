use std::marker::PhantomData;
use std::rc::Rc;

use paste::paste;

use crate::error::Error;
use crate::instance::Instance;
use crate::module::Module;
use crate::signature::ValType;
use crate::value::WasmValue;

/// A Rust scalar with a fixed wasm value type.
pub trait WasmType: Copy + 'static {
    const VAL_TYPE: ValType;

    fn to_raw(self) -> WasmValue;
    fn from_raw(raw: WasmValue) -> Self;
}

/// A parameter or result list: `()`, a single scalar or a tuple of scalars.
pub trait WasmTypes: Sized {
    fn val_types() -> Vec<ValType>;
    fn push_raw(self, out: &mut Vec<WasmValue>);
    fn from_raw_slice(raw: &[WasmValue]) -> Self;
}

macro_rules! impl_wasm_type {
    ($($type:ident => $val_type:ident),* $(,)?) => {
        paste! {
            $(
                impl WasmType for $type {
                    const VAL_TYPE: ValType = ValType::$val_type;

                    #[inline(always)]
                    fn to_raw(self) -> WasmValue { WasmValue::[<from_ $type>](self) }

                    #[inline(always)]
                    fn from_raw(raw: WasmValue) -> Self { raw.[<as_ $type>]() }
                }

                impl WasmTypes for $type {
                    fn val_types() -> Vec<ValType> { vec![ValType::$val_type] }

                    #[inline(always)]
                    fn push_raw(self, out: &mut Vec<WasmValue>) { out.push(self.to_raw()) }

                    #[inline(always)]
                    fn from_raw_slice(raw: &[WasmValue]) -> Self { <$type as WasmType>::from_raw(raw[0]) }
                }
            )*
        }
    };
}

impl_wasm_type! {
    i32 => I32,
    u32 => I32,
    i64 => I64,
    u64 => I64,
    f32 => F32,
    f64 => F64,
}

impl WasmTypes for () {
    fn val_types() -> Vec<ValType> { Vec::new() }
    fn push_raw(self, _out: &mut Vec<WasmValue>) {}
    fn from_raw_slice(_raw: &[WasmValue]) -> Self {}
}

macro_rules! impl_wasm_tuple {
    ($($name:ident $idx:tt),+) => {
        impl<$($name: WasmType),+> WasmTypes for ($($name,)+) {
            fn val_types() -> Vec<ValType> { vec![$($name::VAL_TYPE),+] }

            fn push_raw(self, out: &mut Vec<WasmValue>) {
                $(out.push(self.$idx.to_raw());)+
            }

            fn from_raw_slice(raw: &[WasmValue]) -> Self {
                ($($name::from_raw(raw[$idx]),)+)
            }
        }
    };
}

impl_wasm_tuple!(A 0);
impl_wasm_tuple!(A 0, B 1);
impl_wasm_tuple!(A 0, B 1, C 2);
impl_wasm_tuple!(A 0, B 1, C 2, D 3);

/// Handle to an exported function whose signature was checked against `P`
/// and `R` when it was looked up, so calls skip per-argument tagging. The
/// handle remembers its module and only runs on instances of that module.
pub struct TypedFunc<P, R> {
    index: u32,
    module: Rc<Module>,
    _marker: PhantomData<fn(P) -> R>,
}

impl<P, R> Clone for TypedFunc<P, R> {
    fn clone(&self) -> Self {
        Self { index: self.index, module: self.module.clone(), _marker: PhantomData }
    }
}

impl<P: WasmTypes, R: WasmTypes> TypedFunc<P, R> {
    pub fn index(&self) -> u32 { self.index }

    pub fn module(&self) -> &Rc<Module> { &self.module }

    /// Calls the function on `instance`, which must have been instantiated
    /// from the same module as the instance this handle was looked up on.
    pub fn call(&self, instance: &Instance, params: P) -> Result<R, Error> {
        self.call_at_depth(instance, params, 0)
    }

    pub(crate) fn call_at_depth(&self, instance: &Instance, params: P, depth: usize) -> Result<R, Error> {
        if !Rc::ptr_eq(&self.module, instance.module()) {
            return Err(Error::ArgumentMismatch);
        }
        let mut args = Vec::new();
        params.push_raw(&mut args);
        let results = instance.invoke_index(self.index, &args, depth)?;
        Ok(R::from_raw_slice(&results))
    }
}

impl Instance {
    pub fn typed_func<P: WasmTypes, R: WasmTypes>(&self, name: &str) -> Result<TypedFunc<P, R>, Error> {
        let index = self.export(name)?;
        let sig = self.func_type(index);
        if sig.params != P::val_types() || sig.results != R::val_types() {
            return Err(Error::ArgumentMismatch);
        }
        Ok(TypedFunc { index, module: self.module().clone(), _marker: PhantomData })
    }
}
