use crate::ctype::{CType, WasmPtr};
use crate::error::Trap;

macro_rules! impl_unsigned {
    ($type:ty, $size:literal, $load_name:ident, $store_name:ident) => {
        #[inline(always)]
        pub fn $load_name(&self, ptr: u32, offset: u32) -> Result<$type, Trap> {
            let addr = self.effective(ptr, offset, $size)?;
            let mut buf = [0u8; $size];
            buf.copy_from_slice(&self.data[addr..addr + $size]);
            Ok(<$type>::from_le_bytes(buf))
        }
        #[inline(always)]
        pub fn $store_name(&mut self, ptr: u32, offset: u32, v: $type) -> Result<(), Trap> {
            let addr = self.effective(ptr, offset, $size)?;
            self.data[addr..addr + $size].copy_from_slice(&v.to_le_bytes());
            Ok(())
        }
    };
}

macro_rules! impl_signed_load {
    ($name:ident, $target:ty, $source:ident) => {
        #[inline(always)]
        pub fn $name(&self, ptr: u32, offset: u32) -> Result<$target, Trap> {
            Ok(self.$source(ptr, offset)? as $target)
        }
    };
}

/// Linear memory: a zero-initialised byte array sized in 64 KiB pages that only
/// grows. Every access is bounds checked against the current size and a
/// failing access leaves memory untouched.
#[derive(Debug, Clone)]
pub struct WasmMemory {
    data: Vec<u8>,
    current: u32,
    maximum: u32,
}

impl WasmMemory {
    pub const MAX_PAGES: u32 = 65536;
    pub const PAGE_SIZE: u32 = 65536;
    pub const GROW_FAILED: u32 = u32::MAX;

    pub fn new(initial: u32, maximum: u32) -> Self {
        let maximum = maximum.min(Self::MAX_PAGES);
        let data = vec![0; (initial as usize) * (Self::PAGE_SIZE as usize)];
        Self { data, current: initial, maximum }
    }

    /// Current size in pages.
    pub fn size(&self) -> u32 { self.current }
    pub fn size_bytes(&self) -> usize { self.data.len() }
    pub fn max(&self) -> u32 { self.maximum }
    pub fn data(&self) -> &[u8] { &self.data }

    /// Grows by `delta` pages and returns the previous size, or `GROW_FAILED`
    /// when the maximum would be exceeded. Memory is unchanged on failure.
    pub fn grow(&mut self, delta: u32) -> u32 {
        if delta == 0 { return self.current; }
        if delta > self.maximum.saturating_sub(self.current) { return Self::GROW_FAILED; }
        let old = self.current;
        self.current += delta;
        self.data.resize((self.current as usize) * (Self::PAGE_SIZE as usize), 0);
        crate::debug_println!("memory grown from {} to {} pages", old, self.current);
        old
    }

    #[inline(always)]
    fn effective(&self, ptr: u32, offset: u32, width: usize) -> Result<usize, Trap> {
        let addr = ptr as u64 + offset as u64;
        if addr + width as u64 > self.data.len() as u64 { return Err(Trap::MemoryOutOfBounds); }
        Ok(addr as usize)
    }

    impl_unsigned!(u8,  1, load_u8, store_u8);    impl_unsigned!(u16, 2, load_u16, store_u16);
    impl_unsigned!(u32, 4, load_u32, store_u32);  impl_unsigned!(u64, 8, load_u64, store_u64);
    impl_signed_load!(load_i8,  i8,  load_u8);    impl_signed_load!(load_i16, i16, load_u16);
    impl_signed_load!(load_i32, i32, load_u32);   impl_signed_load!(load_i64, i64, load_u64);

    #[inline(always)]
    pub fn load_f32(&self, ptr: u32, offset: u32) -> Result<f32, Trap> {
        Ok(f32::from_bits(self.load_u32(ptr, offset)?))
    }
    #[inline(always)]
    pub fn store_f32(&mut self, ptr: u32, offset: u32, v: f32) -> Result<(), Trap> {
        self.store_u32(ptr, offset, v.to_bits())
    }
    #[inline(always)]
    pub fn load_f64(&self, ptr: u32, offset: u32) -> Result<f64, Trap> {
        Ok(f64::from_bits(self.load_u64(ptr, offset)?))
    }
    #[inline(always)]
    pub fn store_f64(&mut self, ptr: u32, offset: u32, v: f64) -> Result<(), Trap> {
        self.store_u64(ptr, offset, v.to_bits())
    }

    /// Borrows `width` bytes starting at `offset`.
    pub fn read(&self, offset: u32, width: usize) -> Result<&[u8], Trap> {
        let start = self.effective(offset, 0, width)?;
        Ok(&self.data[start..start + width])
    }

    /// Copies `bytes` into memory at `offset`. Nothing is written when any
    /// part of the range is out of bounds.
    pub fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Trap> {
        let start = self.effective(offset, 0, bytes.len())?;
        self.data[start..start + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    pub fn fill(&mut self, offset: u32, value: u8, len: u32) -> Result<(), Trap> {
        let start = self.effective(offset, 0, len as usize)?;
        self.data[start..start + len as usize].fill(value);
        Ok(())
    }

    /// Overlap-safe copy within memory.
    pub fn copy_within(&mut self, dst: u32, src: u32, len: u32) -> Result<(), Trap> {
        let src = self.effective(src, 0, len as usize)?;
        let dst = self.effective(dst, 0, len as usize)?;
        self.data.copy_within(src..src + len as usize, dst);
        Ok(())
    }

    /// Reads a NUL-terminated string of at most `max_len` bytes. Reading stops
    /// at the terminator, at `max_len`, or at the end of memory. Invalid UTF-8
    /// is replaced rather than rejected.
    pub fn read_cstr(&self, ptr: WasmPtr<u8>, max_len: usize) -> Result<String, Trap> {
        let start = ptr.addr() as usize;
        if start > self.data.len() { return Err(Trap::MemoryOutOfBounds); }
        let end = start.saturating_add(max_len).min(self.data.len());
        let window = &self.data[start..end];
        let len = window.iter().position(|&b| b == 0).unwrap_or(window.len());
        Ok(String::from_utf8_lossy(&window[..len]).into_owned())
    }

    pub fn read_typed<T: CType>(&self, ptr: WasmPtr<T>) -> Result<T, Trap> {
        Ok(T::decode(self.read(ptr.addr(), T::SIZE as usize)?))
    }

    /// Stores `value` with its padding bytes zeroed.
    pub fn write_typed<T: CType>(&mut self, ptr: WasmPtr<T>, value: T) -> Result<(), Trap> {
        let start = self.effective(ptr.addr(), 0, T::SIZE as usize)?;
        value.encode(&mut self.data[start..start + T::SIZE as usize]);
        Ok(())
    }

    /// Reads `len` consecutive values starting at `ptr`.
    pub fn read_slice_to_vec<T: CType>(&self, ptr: WasmPtr<T>, len: u32) -> Result<Vec<T>, Trap> {
        if T::SIZE == 0 {
            return Ok(vec![T::decode(&[]); len as usize]);
        }
        let width = (T::SIZE as usize).checked_mul(len as usize).ok_or(Trap::MemoryOutOfBounds)?;
        let bytes = self.read(ptr.addr(), width)?;
        Ok(bytes.chunks_exact(T::SIZE as usize).map(T::decode).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grow_respects_maximum() {
        let mut mem = WasmMemory::new(1, 3);
        assert_eq!(mem.grow(1), 1);
        assert_eq!(mem.grow(2), WasmMemory::GROW_FAILED);
        assert_eq!(mem.size(), 2);
        assert_eq!(mem.grow(0), 2);
        assert_eq!(mem.size_bytes(), 2 * WasmMemory::PAGE_SIZE as usize);
    }

    #[test]
    fn straddling_store_leaves_memory_untouched() {
        let mut mem = WasmMemory::new(1, 1);
        let last = WasmMemory::PAGE_SIZE - 2;
        assert_eq!(mem.store_u32(last, 0, 0xdead_beef), Err(Trap::MemoryOutOfBounds));
        assert_eq!(mem.read(last, 2).unwrap(), &[0, 0]);
        assert_eq!(mem.write(last, &[1, 2, 3]), Err(Trap::MemoryOutOfBounds));
        assert_eq!(mem.load_u16(last, 0), Ok(0));
    }

    #[test]
    fn offset_does_not_wrap() {
        let mem = WasmMemory::new(1, 1);
        assert_eq!(mem.load_u8(u32::MAX, 1), Err(Trap::MemoryOutOfBounds));
    }

    #[test]
    fn little_endian_layout() {
        let mut mem = WasmMemory::new(1, 1);
        mem.store_u32(8, 0, 0x0403_0201).unwrap();
        assert_eq!(mem.read(8, 4).unwrap(), &[1, 2, 3, 4]);
        assert_eq!(mem.load_i8(8, 3), Ok(4));
        mem.store_f64(16, 0, -2.5).unwrap();
        assert_eq!(mem.load_f64(16, 0), Ok(-2.5));
    }

    #[test]
    fn cstr_stops_at_terminator_or_limit() {
        let mut mem = WasmMemory::new(1, 1);
        mem.write(100, b"hello\0world").unwrap();
        assert_eq!(mem.read_cstr(WasmPtr::new(100), 4096).unwrap(), "hello");
        assert_eq!(mem.read_cstr(WasmPtr::new(100), 3).unwrap(), "hel");
        assert_eq!(mem.read_cstr(WasmPtr::new(WasmMemory::PAGE_SIZE + 1), 8), Err(Trap::MemoryOutOfBounds));
    }

    #[test]
    fn copy_within_handles_overlap() {
        let mut mem = WasmMemory::new(1, 1);
        mem.write(0, &[1, 2, 3, 4]).unwrap();
        mem.copy_within(1, 0, 3).unwrap();
        assert_eq!(mem.read(0, 4).unwrap(), &[1, 1, 2, 3]);
        mem.fill(0, 9, 2).unwrap();
        assert_eq!(mem.read(0, 4).unwrap(), &[9, 9, 2, 3]);
    }
}
