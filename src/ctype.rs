use std::fmt::{Debug, Formatter};
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

use crate::error::Trap;

/// A plain value with a fixed little-endian layout in linear memory, laid
/// out the way a C compiler targeting wasm32 would.
pub trait CType: Copy + 'static {
    const SIZE: u32;
    const ALIGN: u32;

    /// Decodes from exactly `SIZE` bytes.
    fn decode(bytes: &[u8]) -> Self;

    /// Encodes into exactly `SIZE` bytes. Padding bytes are zeroed.
    fn encode(&self, out: &mut [u8]);

    /// Zeroes the padding of an encoded value in place.
    fn clear_padding(bytes: &mut [u8]) {
        let value = Self::decode(bytes);
        value.encode(bytes);
    }
}

#[doc(hidden)]
pub const fn align_up(offset: u32, align: u32) -> u32 {
    (offset + align - 1) / align * align
}

macro_rules! impl_scalar {
    ($($type:ty => $size:literal),* $(,)?) => {
        $(
            impl CType for $type {
                const SIZE: u32 = $size;
                const ALIGN: u32 = $size;

                #[inline(always)]
                fn decode(bytes: &[u8]) -> Self {
                    let mut buf = [0u8; $size];
                    buf.copy_from_slice(&bytes[..$size]);
                    <$type>::from_le_bytes(buf)
                }

                #[inline(always)]
                fn encode(&self, out: &mut [u8]) {
                    out[..$size].copy_from_slice(&self.to_le_bytes());
                }
            }
        )*
    };
}

impl_scalar! {
    u8 => 1, i8 => 1,
    u16 => 2, i16 => 2,
    u32 => 4, i32 => 4,
    u64 => 8, i64 => 8,
    f32 => 4, f64 => 8,
}

impl<T: CType, const N: usize> CType for [T; N] {
    const SIZE: u32 = T::SIZE * N as u32;
    const ALIGN: u32 = T::ALIGN;

    fn decode(bytes: &[u8]) -> Self {
        let size = T::SIZE as usize;
        std::array::from_fn(|i| T::decode(&bytes[i * size..(i + 1) * size]))
    }

    fn encode(&self, out: &mut [u8]) {
        let size = T::SIZE as usize;
        for (i, value) in self.iter().enumerate() {
            value.encode(&mut out[i * size..(i + 1) * size]);
        }
    }
}

/// A guest `size_t`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WasmSize(pub u32);

impl CType for WasmSize {
    const SIZE: u32 = 4;
    const ALIGN: u32 = 4;

    fn decode(bytes: &[u8]) -> Self { WasmSize(u32::decode(bytes)) }
    fn encode(&self, out: &mut [u8]) { self.0.encode(out) }
}

/// A guest pointer to a `T`. Address 0 is null.
pub struct WasmPtr<T> {
    addr: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> WasmPtr<T> {
    pub const fn new(addr: u32) -> Self { Self { addr, _marker: PhantomData } }

    pub const fn null() -> Self { Self::new(0) }

    pub const fn addr(self) -> u32 { self.addr }

    pub const fn is_null(self) -> bool { self.addr == 0 }

    pub const fn cast<U>(self) -> WasmPtr<U> { WasmPtr::new(self.addr) }
}

impl<T: CType> WasmPtr<T> {
    /// Pointer to the element `count` places after this one.
    pub fn offset(self, count: u32) -> Result<Self, Trap> {
        count.checked_mul(T::SIZE)
            .and_then(|bytes| self.addr.checked_add(bytes))
            .map(Self::new)
            .ok_or(Trap::MemoryOutOfBounds)
    }
}

impl<T> Clone for WasmPtr<T> {
    fn clone(&self) -> Self { *self }
}

impl<T> Copy for WasmPtr<T> {}

impl<T> Default for WasmPtr<T> {
    fn default() -> Self { Self::null() }
}

impl<T> PartialEq for WasmPtr<T> {
    fn eq(&self, other: &Self) -> bool { self.addr == other.addr }
}

impl<T> Eq for WasmPtr<T> {}

impl<T> Hash for WasmPtr<T> {
    fn hash<H: Hasher>(&self, state: &mut H) { self.addr.hash(state) }
}

impl<T> Debug for WasmPtr<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "WasmPtr(0x{:x})", self.addr)
    }
}

impl<T: 'static> CType for WasmPtr<T> {
    const SIZE: u32 = 4;
    const ALIGN: u32 = 4;

    fn decode(bytes: &[u8]) -> Self { Self::new(u32::decode(bytes)) }
    fn encode(&self, out: &mut [u8]) { self.addr.encode(out) }
}

/// Declares a struct with C layout in linear memory and implements `CType`
/// for it. Fields are placed in order at their natural alignment and the
/// size is rounded up to the largest field alignment.
///
/// ```
/// wenjin::c_struct! {
///     pub struct Tree {
///         pub value: i32,
///         pub left: wenjin::WasmPtr<Tree>,
///         pub right: wenjin::WasmPtr<Tree>,
///     }
/// }
/// assert_eq!(<Tree as wenjin::CType>::SIZE, 12);
/// ```
#[macro_export]
macro_rules! c_struct {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident {
            $($(#[$field_meta:meta])* $field_vis:vis $field:ident : $ty:ty),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq)]
        $vis struct $name {
            $($(#[$field_meta])* $field_vis $field: $ty),+
        }

        impl $crate::ctype::CType for $name {
            const ALIGN: u32 = {
                let mut align = 1;
                $(
                    if <$ty as $crate::ctype::CType>::ALIGN > align {
                        align = <$ty as $crate::ctype::CType>::ALIGN;
                    }
                )+
                align
            };
            const SIZE: u32 = {
                let mut end = 0;
                $(
                    end = $crate::ctype::align_up(end, <$ty as $crate::ctype::CType>::ALIGN)
                        + <$ty as $crate::ctype::CType>::SIZE;
                )+
                $crate::ctype::align_up(end, <Self as $crate::ctype::CType>::ALIGN)
            };

            fn decode(bytes: &[u8]) -> Self {
                let mut offset = 0u32;
                $(
                    offset = $crate::ctype::align_up(offset, <$ty as $crate::ctype::CType>::ALIGN);
                    let end = offset + <$ty as $crate::ctype::CType>::SIZE;
                    let $field = <$ty as $crate::ctype::CType>::decode(&bytes[offset as usize..end as usize]);
                    offset = end;
                )+
                let _ = offset;
                Self { $($field),+ }
            }

            fn encode(&self, out: &mut [u8]) {
                out.fill(0);
                let mut offset = 0u32;
                $(
                    offset = $crate::ctype::align_up(offset, <$ty as $crate::ctype::CType>::ALIGN);
                    let end = offset + <$ty as $crate::ctype::CType>::SIZE;
                    <$ty as $crate::ctype::CType>::encode(&self.$field, &mut out[offset as usize..end as usize]);
                    offset = end;
                )+
                let _ = offset;
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wasm_memory::WasmMemory;

    crate::c_struct! {
        struct Foo {
            a: u8,
            b: u32,
        }
    }

    crate::c_struct! {
        struct Mixed {
            tag: u8,
            wide: f64,
            short: i16,
            ptr: WasmPtr<Mixed>,
        }
    }

    #[test]
    fn struct_layout_follows_natural_alignment() {
        assert_eq!((Foo::SIZE, Foo::ALIGN), (8, 4));
        assert_eq!((Mixed::SIZE, Mixed::ALIGN), (24, 8));
        assert_eq!(<[Foo; 2]>::SIZE, 16);
        assert_eq!(<WasmPtr<Foo>>::SIZE, 4);
    }

    #[test]
    fn write_typed_zeroes_padding() {
        let mut mem = WasmMemory::new(1, 1);
        let foos = [Foo { a: 1, b: 2 }, Foo { a: 3, b: 4 }];
        mem.fill(64, 0xaa, 16).unwrap();
        mem.write_typed(WasmPtr::new(64), foos).unwrap();
        assert_eq!(
            mem.read_typed(WasmPtr::<[u8; 16]>::new(64)).unwrap(),
            [1, 0, 0, 0, 2, 0, 0, 0, 3, 0, 0, 0, 4, 0, 0, 0],
        );
        assert_eq!(mem.read_typed(WasmPtr::<[Foo; 2]>::new(64)).unwrap(), foos);
    }

    #[test]
    fn clear_padding_in_place() {
        let mut bytes = [1, 0xff, 0xff, 0xff, 2, 0, 0, 0, 3, 0xee, 0xee, 0xee, 4, 0, 0, 0];
        <[Foo; 2]>::clear_padding(&mut bytes);
        assert_eq!(bytes, [1, 0, 0, 0, 2, 0, 0, 0, 3, 0, 0, 0, 4, 0, 0, 0]);
    }

    #[test]
    fn mixed_fields_round_trip_through_memory() {
        let mut mem = WasmMemory::new(1, 1);
        let value = Mixed { tag: 7, wide: -0.5, short: -3, ptr: WasmPtr::new(128) };
        mem.write_typed(WasmPtr::new(128), value).unwrap();
        assert_eq!(mem.load_u8(128, 0), Ok(7));
        assert_eq!(mem.load_f64(128, 8), Ok(-0.5));
        assert_eq!(mem.load_i16(128, 16), Ok(-3));
        assert_eq!(mem.load_u32(128, 20), Ok(128));
        assert_eq!(mem.read_typed(value.ptr).unwrap(), value);
    }

    #[test]
    fn pointer_arithmetic_is_checked() {
        let p = WasmPtr::<Foo>::new(16);
        assert_eq!(p.offset(3).unwrap().addr(), 40);
        assert_eq!(WasmPtr::<Foo>::new(u32::MAX - 4).offset(1), Err(Trap::MemoryOutOfBounds));
        assert!(WasmPtr::<Foo>::null().is_null());
        assert_eq!(p.cast::<u8>().addr(), 16);
    }

    #[test]
    fn typed_access_is_bounds_checked() {
        let mut mem = WasmMemory::new(1, 1);
        let last = WasmPtr::<u64>::new(WasmMemory::PAGE_SIZE - 4);
        assert_eq!(mem.write_typed(last, 1), Err(Trap::MemoryOutOfBounds));
        assert_eq!(mem.read_typed(last), Err(Trap::MemoryOutOfBounds));
        mem.write_typed(WasmPtr::new(0), [5u32, 6, 7]).unwrap();
        assert_eq!(mem.read_slice_to_vec(WasmPtr::<u32>::new(4), 2).unwrap(), vec![6, 7]);
    }
}
