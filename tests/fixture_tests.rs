use std::cell::RefCell;
use std::rc::Rc;

use wenjin::{
    c_struct, Error, HeapAllocator, HeapCell, HostFunc, ImportBinding, Imports, Instance, MemoryHook,
    Module, Outcome, SharedMemoryHook, Signature, Value, ValType, WasmMemory, WasmPtr,
};

const ARITH_WAT: &str = r#"
(module
  (func (export "add") (param i32 i32) (result i32)
    (i32.add (local.get 0) (local.get 1)))

  (func $fib (export "fib") (param $n i32) (result i32)
    (if (result i32) (i32.lt_s (local.get $n) (i32.const 2))
      (then (local.get $n))
      (else
        (i32.add
          (call $fib (i32.sub (local.get $n) (i32.const 1)))
          (call $fib (i32.sub (local.get $n) (i32.const 2)))))))

  (func (export "thing") (param $x f32) (param $n i32) (result f32)
    (local $i i32)
    (block $done
      (loop $next
        (br_if $done (i32.ge_s (local.get $i) (local.get $n)))
        (if (i32.and (local.get $i) (i32.const 1))
          (then (local.set $x (f32.add (local.get $x) (f32.const 1))))
          (else (local.set $x (f32.mul (local.get $x) (f32.const 2)))))
        (local.set $i (i32.add (local.get $i) (i32.const 1)))
        (br $next)))
    (local.get $x)))
"#;

const FIB_HOST_WAT: &str = r#"
(module
  (import "host" "fib_host" (func $fib_host (param i32) (result i32)))
  (func (export "fib") (param $n i32) (result i32)
    (if (result i32) (i32.lt_s (local.get $n) (i32.const 2))
      (then (local.get $n))
      (else
        (i32.add
          (call $fib_host (i32.sub (local.get $n) (i32.const 2)))
          (call $fib_host (i32.sub (local.get $n) (i32.const 1))))))))
"#;

const HEAP_CELL: HeapCell = WasmPtr::new(1024);
const HASH_CELL: u32 = 1028;
const ROOT_CELL: u32 = 1032;

// Nodes are { value: i32, left: Tree*, right: Tree* }.
const TREE_WAT: &str = r#"
(module
  (import "host" "malloc" (func $alloc (param i32 i32) (result i32)))
  (import "host" "fail" (func $fail (param i32)))
  (memory (export "memory") 1)
  (data (i32.const 16) "invalid tree hash 1-8\00")
  (global $heap i32 (i32.const 1024))
  (global $hash i32 (i32.const 1028))
  (global $root i32 (i32.const 1032))

  (func $new_tree (param $value i32) (result i32)
    (local $t i32)
    (local.set $t (call $alloc (global.get $heap) (i32.const 12)))
    (i32.store offset=0 (local.get $t) (local.get $value))
    (i32.store offset=4 (local.get $t) (i32.const 0))
    (i32.store offset=8 (local.get $t) (i32.const 0))
    (local.get $t))

  (func $tree_insert (param $slot i32) (param $value i32) (result i32)
    (local $at i32)
    (local.set $at (i32.load (local.get $slot)))
    (if (i32.eqz (local.get $at))
      (then
        (i32.store (local.get $slot) (call $new_tree (local.get $value)))
        (return (i32.load (local.get $slot)))))
    (if (i32.eq (i32.load (local.get $at)) (local.get $value))
      (then (return (local.get $at))))
    (if (result i32) (i32.lt_s (local.get $value) (i32.load (local.get $at)))
      (then (call $tree_insert (i32.add (local.get $at) (i32.const 4)) (local.get $value)))
      (else (call $tree_insert (i32.add (local.get $at) (i32.const 8)) (local.get $value)))))

  (func $tree_hash_core (param $tree i32) (param $hash i32)
    (if (local.get $tree)
      (then
        (call $tree_hash_core (i32.load offset=4 (local.get $tree)) (local.get $hash))
        (i32.store (local.get $hash)
          (i32.mul
            (i32.add (i32.load (local.get $hash)) (i32.load (local.get $tree)))
            (i32.const 2)))
        (call $tree_hash_core (i32.load offset=8 (local.get $tree)) (local.get $hash)))))

  (func $tree_hash (export "tree_hash") (param $tree i32) (result i32)
    (i32.store (global.get $hash) (i32.const 0))
    (call $tree_hash_core (local.get $tree) (global.get $hash))
    (i32.load (global.get $hash)))

  (func (export "run") (result i32)
    (i32.store (global.get $root) (i32.const 0))
    (drop (call $tree_insert (global.get $root) (i32.const 1)))
    (drop (call $tree_insert (global.get $root) (i32.const 8)))
    (drop (call $tree_insert (global.get $root) (i32.const 4)))
    (drop (call $tree_insert (global.get $root) (i32.const 7)))
    (drop (call $tree_insert (global.get $root) (i32.const 3)))
    (drop (call $tree_insert (global.get $root) (i32.const 5)))
    (drop (call $tree_insert (global.get $root) (i32.const 2)))
    (drop (call $tree_insert (global.get $root) (i32.const 6)))
    (if (i32.ne (call $tree_hash (i32.load (global.get $root))) (i32.const 1004))
      (then (call $fail (i32.const 16))))
    (i32.load (global.get $root))))
"#;

fn compile(wat: &str) -> Rc<Module> {
    let bytes = wat::parse_str(wat).expect("fixture should assemble");
    Rc::new(Module::compile(bytes).expect("fixture should compile"))
}

fn arith() -> Instance {
    Instance::instantiate(compile(ARITH_WAT), &Imports::new()).unwrap()
}

fn fib_reference(n: i32) -> i32 {
    let (mut a, mut b) = (0, 1);
    for _ in 0..n {
        (a, b) = (b, a + b);
    }
    a
}

#[test]
fn add_wraps() {
    let inst = arith();
    assert_eq!(inst.invoke("add", &[Value::I32(2), Value::I32(3)]).unwrap(), vec![Value::I32(5)]);
    assert_eq!(
        inst.invoke("add", &[Value::I32(i32::MAX), Value::I32(1)]).unwrap(),
        vec![Value::I32(i32::MIN)],
    );
}

#[test]
fn fib_matches_reference() {
    let inst = arith();
    let fib = inst.typed_func::<i32, i32>("fib").unwrap();
    for n in [0, 1, 2, 10, 20] {
        assert_eq!(fib.call(&inst, n).unwrap(), fib_reference(n), "fib({})", n);
    }
    assert_eq!(fib.call(&inst, 10).unwrap(), 55);
}

#[test]
fn fib_30_fits_default_limits() {
    let inst = arith();
    assert_eq!(inst.invoke("fib", &[Value::I32(30)]).unwrap(), vec![Value::I32(832040)]);
}

#[test]
fn thing_alternates_double_and_increment() {
    let inst = arith();
    let thing = inst.typed_func::<(f32, i32), f32>("thing").unwrap();
    assert_eq!(thing.call(&inst, (1.0, 4)).unwrap(), 7.0);
    assert_eq!(thing.call(&inst, (3.0, 3)).unwrap(), 14.0);
    assert_eq!(thing.call(&inst, (5.5, 0)).unwrap(), 5.5);
}

#[test]
fn exported_functions_lists_signatures() {
    let inst = arith();
    let exports: Vec<(&str, &Signature)> = inst.exported_functions().collect();
    assert_eq!(exports.len(), 3);
    assert_eq!(exports[0], ("add", &Signature::new([ValType::I32, ValType::I32], [ValType::I32])));
    assert_eq!(exports[2].1, &Signature::new([ValType::F32, ValType::I32], [ValType::F32]));
}

#[test]
fn fib_through_host_reentry() {
    let mut imports = Imports::new();
    imports.define("host", "fib_host", HostFunc::new([ValType::I32], Some(ValType::I32), |caller, args| {
        let n = args[0].as_i32().ok_or(Error::ArgumentMismatch)?;
        if n < 2 {
            return Ok(Some(Value::I32(n)));
        }
        let a = caller.invoke("fib", &[Value::I32(n - 2)])?;
        let b = caller.invoke("fib", &[Value::I32(n - 1)])?;
        match (a[0], b[0]) {
            (Value::I32(a), Value::I32(b)) => Ok(Some(Value::I32(a + b))),
            _ => Err(Error::ArgumentMismatch),
        }
    }));
    let inst = Instance::instantiate(compile(FIB_HOST_WAT), &imports).unwrap();
    let fib = inst.typed_func::<i32, i32>("fib").unwrap();
    for n in 0..15 {
        assert_eq!(fib.call(&inst, n).unwrap(), fib_reference(n));
    }
}

/// Hands out the previous pointer again on the eighth call.
struct CorruptingAllocator {
    inner: HeapAllocator,
    calls: u32,
    last: Option<Value>,
}

impl MemoryHook for CorruptingAllocator {
    fn signature(&self) -> Signature { self.inner.signature() }

    fn call(&mut self, memory: &mut WasmMemory, args: &[Value]) -> Result<Option<Value>, Error> {
        self.calls += 1;
        if self.calls == 8 {
            return Ok(self.last);
        }
        self.last = self.inner.call(memory, args)?;
        Ok(self.last)
    }
}

fn tree_imports(malloc: SharedMemoryHook) -> Imports {
    let mut imports = Imports::new();
    imports
        .define("host", "malloc", ImportBinding::Memory(malloc))
        .define("host", "fail", HostFunc::abort_with_cstr());
    imports
}

#[derive(Debug)]
struct Node {
    value: i32,
    left: Option<usize>,
    right: Option<usize>,
}

c_struct! {
    /// Guest node layout: `struct Tree { int value; Tree *left, *right; }`.
    struct Tree {
        value: i32,
        left: WasmPtr<Tree>,
        right: WasmPtr<Tree>,
    }
}

/// Copies the guest tree into an arena; returns the root's index.
fn decode_tree(mem: &WasmMemory, ptr: WasmPtr<Tree>, arena: &mut Vec<Node>) -> Option<usize> {
    if ptr.is_null() {
        return None;
    }
    let tree = mem.read_typed(ptr).unwrap();
    let left = decode_tree(mem, tree.left, arena);
    let right = decode_tree(mem, tree.right, arena);
    arena.push(Node { value: tree.value, left, right });
    Some(arena.len() - 1)
}

fn in_order(arena: &[Node], at: Option<usize>, out: &mut Vec<i32>) {
    if let Some(i) = at {
        in_order(arena, arena[i].left, out);
        out.push(arena[i].value);
        in_order(arena, arena[i].right, out);
    }
}

#[test]
fn tree_with_host_allocator() {
    let allocator = Rc::new(RefCell::new(HeapAllocator::new()));
    let inst = Instance::instantiate(compile(TREE_WAT), &tree_imports(allocator.clone())).unwrap();

    let root_addr = inst.typed_func::<(), i32>("run").unwrap().call(&inst, ()).unwrap() as u32;
    assert!(root_addr >= WasmMemory::PAGE_SIZE, "nodes live in grown pages");

    let mem = inst.memory().unwrap();
    let root_cell = WasmPtr::<WasmPtr<Tree>>::new(ROOT_CELL);
    assert_eq!(mem.read_typed(root_cell).unwrap().addr(), root_addr);
    let mut arena = Vec::new();
    let root = decode_tree(&mem, WasmPtr::new(root_addr), &mut arena);
    let mut values = Vec::new();
    in_order(&arena, root, &mut values);
    assert_eq!(values, (1..=8).collect::<Vec<_>>());
    assert_eq!(arena.len(), 8);

    assert_eq!(mem.load_u32(HASH_CELL, 0).unwrap(), 1004);
    let usage = HeapAllocator::walk(&mem, HEAP_CELL).unwrap();
    assert_eq!(usage.blocks, 9);
    assert_eq!(usage.used_bytes, 8 * 16);
    assert_eq!(allocator.borrow().stats().allocations, 8);
    assert_eq!(allocator.borrow().stats().pages_grown, 1);
}

#[test]
fn tree_with_corrupted_allocator_fails() {
    let allocator = CorruptingAllocator { inner: HeapAllocator::new(), calls: 0, last: None };
    let inst = Instance::instantiate(
        compile(TREE_WAT),
        &tree_imports(Rc::new(RefCell::new(allocator))),
    ).unwrap();

    assert_eq!(
        inst.execute("run", &[]).unwrap(),
        Outcome::HostAborted("invalid tree hash 1-8".into()),
    );
    assert_eq!(inst.memory().unwrap().load_u32(HASH_CELL, 0).unwrap(), 1516);
    assert!(inst.is_poisoned());
    assert_eq!(inst.invoke("run", &[]), Err(Error::Poisoned));
}
