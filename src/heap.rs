use crate::c_struct;
use crate::ctype::{CType, WasmPtr, WasmSize};
use crate::debug_println;
use crate::error::*;
use crate::host::MemoryHook;
use crate::signature::{Signature, ValType};
use crate::value::Value;
use crate::wasm_memory::WasmMemory;

pub const HEADER_SIZE: u32 = <BlockHeader as CType>::SIZE;
pub const ALIGN: u32 = 8;
/// Largest request served; bigger ones abort as out of memory.
pub const MAX_ALLOC: u32 = 0x7fff_0000;
const CHECK_SEED: u32 = 0x5745_4e4a;

/// Guest cell holding the head of the block list.
pub type HeapCell = WasmPtr<WasmPtr<BlockHeader>>;

c_struct! {
    /// Header in front of every payload. `size` counts the header too and
    /// `check` guards the other three fields.
    pub struct BlockHeader {
        pub size: WasmSize,
        pub next: WasmPtr<BlockHeader>,
        pub free: u32,
        pub check: u32,
    }
}

impl BlockHeader {
    fn new(size: u32, next: WasmPtr<BlockHeader>, free: bool) -> Self {
        let mut header = BlockHeader { size: WasmSize(size), next, free: free as u32, check: 0 };
        header.check = header.check_word();
        header
    }

    fn check_word(&self) -> u32 {
        self.size.0 ^ self.next.addr().rotate_left(7) ^ self.free ^ CHECK_SEED
    }

    pub fn is_free(&self) -> bool { self.free == 1 }

    fn payload_size(&self) -> u32 { self.size.0 - HEADER_SIZE }

    fn read(mem: &WasmMemory, at: WasmPtr<BlockHeader>) -> Result<Self, Error> {
        let header = mem.read_typed(at)?;
        if header.free > 1 || header.size.0 < HEADER_SIZE || header.check != header.check_word() {
            return Err(Error::host_abort(format!("heap corruption detected at 0x{:x}", at.addr())));
        }
        Ok(header)
    }

    fn write(self, mem: &mut WasmMemory, at: WasmPtr<BlockHeader>) -> Result<(), Error> {
        Ok(mem.write_typed(at, self)?)
    }
}

fn payload(at: WasmPtr<BlockHeader>) -> WasmPtr<u8> {
    WasmPtr::new(at.addr() + HEADER_SIZE)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    pub allocations: u64,
    pub bytes_requested: u64,
    pub pages_grown: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapUsage {
    pub blocks: u32,
    pub used_bytes: u64,
    pub free_bytes: u64,
}

/// First-fit free-list allocator that lives inside the guest's linear memory.
/// The guest owns a single pointer-sized cell holding the list head and
/// imports `alloc(heap_cell, size) -> ptr`. Storage comes from fresh pages
/// grown at the end of memory, so it never overlaps the guest's own data.
#[derive(Debug, Default)]
pub struct HeapAllocator {
    stats: HeapStats,
}

impl HeapAllocator {
    pub fn new() -> Self { Self::default() }

    pub fn stats(&self) -> HeapStats { self.stats }

    pub fn alloc(&mut self, mem: &mut WasmMemory, heap: HeapCell, size: WasmSize) -> Result<WasmPtr<u8>, Error> {
        if size.0 > MAX_ALLOC {
            return Err(Error::host_abort("out of memory"));
        }
        let size = (size.0 + ALIGN - 1) & !(ALIGN - 1);
        let head = mem.read_typed(heap)?;
        self.stats.allocations += 1;
        self.stats.bytes_requested += size as u64;

        if let Some(ptr) = self.take_free_block(mem, head, size)? {
            return Ok(ptr);
        }
        self.grow_and_carve(mem, heap, head, size)
    }

    fn take_free_block(
        &mut self,
        mem: &mut WasmMemory,
        head: WasmPtr<BlockHeader>,
        size: u32,
    ) -> Result<Option<WasmPtr<u8>>, Error> {
        let max_blocks = mem.size_bytes() / HEADER_SIZE as usize + 1;
        let mut at = head;
        let mut visited = 0;
        while !at.is_null() {
            visited += 1;
            if visited > max_blocks {
                return Err(Error::host_abort("heap free list contains a cycle"));
            }
            let h = BlockHeader::read(mem, at)?;
            if h.is_free() && h.payload_size() >= size {
                let remaining = h.payload_size() - size;
                if remaining >= HEADER_SIZE + ALIGN {
                    // Keep the front free and hand out the tail.
                    let used_size = HEADER_SIZE + size;
                    let used_at = at.addr().checked_add(h.size.0 - used_size)
                        .map(WasmPtr::new)
                        .ok_or_else(|| Error::host_abort(format!("heap corruption detected at 0x{:x}", at.addr())))?;
                    BlockHeader::new(h.size.0 - used_size, used_at, true).write(mem, at)?;
                    BlockHeader::new(used_size, h.next, false).write(mem, used_at)?;
                    return Ok(Some(payload(used_at)));
                }
                BlockHeader::new(h.size.0, h.next, false).write(mem, at)?;
                return Ok(Some(payload(at)));
            }
            at = h.next;
        }
        Ok(None)
    }

    fn grow_and_carve(
        &mut self,
        mem: &mut WasmMemory,
        heap: HeapCell,
        head: WasmPtr<BlockHeader>,
        size: u32,
    ) -> Result<WasmPtr<u8>, Error> {
        const PAGE: u64 = WasmMemory::PAGE_SIZE as u64;
        let needed = (HEADER_SIZE + ALIGN + size) as u64;
        let pages = needed.div_ceil(PAGE) as u32;
        let old = mem.grow(pages);
        if old == WasmMemory::GROW_FAILED {
            return Err(Error::host_abort("out of memory"));
        }
        self.stats.pages_grown += pages;
        debug_println!("heap grew by {} pages at page {}", pages, old);

        // Address 0 is the list terminator, so a heap starting at the very
        // bottom of memory skips one alignment unit.
        let used_at = (old as u64 * PAGE).max(ALIGN as u64);
        let region_end = ((old as u64 + pages as u64) * PAGE).min((u32::MAX & !(ALIGN - 1)) as u64);
        let used_size = (HEADER_SIZE + size) as u64;
        let free_at = used_at + used_size;
        let free_size = region_end - free_at;

        let used_at = WasmPtr::new(used_at as u32);
        if free_size >= (HEADER_SIZE + ALIGN) as u64 {
            let free_at = WasmPtr::new(free_at as u32);
            BlockHeader::new(used_size as u32, head, false).write(mem, used_at)?;
            BlockHeader::new(free_size as u32, used_at, true).write(mem, free_at)?;
            mem.write_typed(heap, free_at)?;
        } else {
            let whole = (region_end - used_at.addr() as u64) as u32;
            BlockHeader::new(whole, head, false).write(mem, used_at)?;
            mem.write_typed(heap, used_at)?;
        }
        Ok(payload(used_at))
    }

    /// Walks the block list starting at the head stored in `heap`, verifying
    /// every header.
    pub fn walk(mem: &WasmMemory, heap: HeapCell) -> Result<HeapUsage, Error> {
        let max_blocks = mem.size_bytes() / HEADER_SIZE as usize + 1;
        let mut usage = HeapUsage::default();
        let mut at = mem.read_typed(heap)?;
        while !at.is_null() {
            if usage.blocks as usize >= max_blocks {
                return Err(Error::host_abort("heap free list contains a cycle"));
            }
            let h = BlockHeader::read(mem, at)?;
            usage.blocks += 1;
            let bytes = h.payload_size() as u64;
            if h.is_free() { usage.free_bytes += bytes } else { usage.used_bytes += bytes }
            at = h.next;
        }
        Ok(usage)
    }
}

impl MemoryHook for HeapAllocator {
    fn signature(&self) -> Signature {
        Signature::new([ValType::I32, ValType::I32], [ValType::I32])
    }

    fn call(&mut self, memory: &mut WasmMemory, args: &[Value]) -> Result<Option<Value>, Error> {
        let (heap, size) = match args {
            [Value::I32(cell), Value::I32(size)] => (WasmPtr::new(*cell as u32), WasmSize(*size as u32)),
            _ => return Err(Error::ArgumentMismatch),
        };
        let ptr = self.alloc(memory, heap, size)?;
        Ok(Some(Value::I32(ptr.addr() as i32)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CELL: HeapCell = WasmPtr::new(1024);

    fn alloc(heap: &mut HeapAllocator, mem: &mut WasmMemory, size: u32) -> u32 {
        heap.alloc(mem, CELL, WasmSize(size)).unwrap().addr()
    }

    #[test]
    fn header_is_four_words() {
        assert_eq!(HEADER_SIZE, 16);
        assert_eq!(<BlockHeader as CType>::ALIGN, 4);
    }

    #[test]
    fn allocations_are_aligned_and_disjoint() {
        let mut mem = WasmMemory::new(1, 16);
        let mut heap = HeapAllocator::new();
        let a = alloc(&mut heap, &mut mem, 12);
        let b = alloc(&mut heap, &mut mem, 1);
        let c = alloc(&mut heap, &mut mem, 100);
        for p in [a, b, c] {
            assert_eq!(p % ALIGN, 0);
            assert!(p >= WasmMemory::PAGE_SIZE);
        }
        let disjoint = |p: u32, n: u32, q: u32, m: u32| p + n <= q || q + m <= p;
        assert!(disjoint(a, 16, b, 8));
        assert!(disjoint(c, 104, a, 16));
        assert!(disjoint(c, 104, b, 8));
        assert_eq!(heap.stats().pages_grown, 1);
        assert_eq!(heap.stats().allocations, 3);
    }

    #[test]
    fn walk_accounts_for_every_block() {
        let mut mem = WasmMemory::new(1, 16);
        let mut heap = HeapAllocator::new();
        alloc(&mut heap, &mut mem, 24);
        alloc(&mut heap, &mut mem, 40);
        let usage = HeapAllocator::walk(&mem, CELL).unwrap();
        assert_eq!(usage.used_bytes, 64);
        assert_eq!(usage.blocks, 3);
        assert_eq!(
            usage.used_bytes + usage.free_bytes + usage.blocks as u64 * HEADER_SIZE as u64,
            WasmMemory::PAGE_SIZE as u64,
        );
    }

    #[test]
    fn headers_are_readable_as_typed_values() {
        let mut mem = WasmMemory::new(1, 16);
        let mut heap = HeapAllocator::new();
        let p = alloc(&mut heap, &mut mem, 24);
        let header: BlockHeader = mem.read_typed(WasmPtr::new(p - HEADER_SIZE)).unwrap();
        assert_eq!(header.size, WasmSize(HEADER_SIZE + 24));
        assert!(!header.is_free());
        assert!(header.next.is_null());
        let head = mem.read_typed(CELL).unwrap();
        assert_eq!(mem.read_typed(head).unwrap().next.addr(), p - HEADER_SIZE);
    }

    #[test]
    fn large_request_grows_several_pages() {
        let mut mem = WasmMemory::new(1, 16);
        let mut heap = HeapAllocator::new();
        let p = alloc(&mut heap, &mut mem, 3 * WasmMemory::PAGE_SIZE);
        assert_eq!(p, WasmMemory::PAGE_SIZE + HEADER_SIZE);
        assert_eq!(mem.size(), 5);
    }

    #[test]
    fn exhausted_memory_aborts() {
        let mut mem = WasmMemory::new(1, 1);
        let mut heap = HeapAllocator::new();
        assert_eq!(heap.alloc(&mut mem, CELL, WasmSize(8)), Err(Error::host_abort("out of memory")));
    }

    #[test]
    fn corrupted_header_is_detected() {
        let mut mem = WasmMemory::new(1, 16);
        let mut heap = HeapAllocator::new();
        let p = alloc(&mut heap, &mut mem, 8);
        mem.store_u32(p - HEADER_SIZE, 0, 0xffff).unwrap();
        let head = mem.read_typed(CELL).unwrap();
        BlockHeader::new(32, WasmPtr::new(p - HEADER_SIZE), false).write(&mut mem, head).unwrap();
        assert!(matches!(heap.alloc(&mut mem, CELL, WasmSize(8)), Err(Error::HostAbort(_))));
    }
}
