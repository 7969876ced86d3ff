#![allow(clippy::missing_safety_doc)]

use core::{
  cell::UnsafeCell,
  mem::{align_of, size_of},
  ptr::{self, null_mut},
  sync::atomic::{AtomicBool, AtomicPtr, Ordering},
};
use std::{hint, sync::OnceLock};

pub mod page_index;

// =============================================================================
// Constants
// =============================================================================

/// Reserved virtual address range backing the arena.
const ARENA_SIZE: usize = 1 << 30; // 1GB

const SUPERBLOCK_SIZE_BITS: usize = 13;
/// Two OS pages per superblock.
const SUPERBLOCK_SIZE: usize = 1 << SUPERBLOCK_SIZE_BITS; // 8KB
const SUPERBLOCK_ALIGN_MASK: usize = !(SUPERBLOCK_SIZE - 1);
const PAGE_REF_SIZE: usize = size_of::<PageRef>();

const NSIZES: usize = 9;
/// Block sizes served from size-classed superblocks.
const SIZES: [usize; NSIZES] = [8, 16, 32, 64, 128, 256, 512, 1024, 2048];
/// Requests above this take the large path.
const LARGEST_BLOCK: usize = 2048;

/// `block_type` tag for a fully free superblock.
const BLOCK_TYPE_FREE: u32 = 10;
/// `block_type` tag for the head of a contiguous large run.
const BLOCK_TYPE_LARGE: u32 = 11;

/// Index of the shared global heap. Never selected by the front-end.
const GLOBAL_HEAP_ID: u32 = 0;

/// Free superblocks a local heap keeps for itself before handing one to the
/// global heap.
const FREE_PAGE_THRESHOLD: usize = 2;

// =============================================================================
// Compile-Time Assertions
// =============================================================================

const _: () = assert!(SUPERBLOCK_SIZE.is_power_of_two());
const _: () = assert!(SUPERBLOCK_SIZE == 2 * 4096);
const _: () = assert!(PAGE_REF_SIZE % 8 == 0); // user pointers stay 8-aligned
const _: () = assert!(PAGE_REF_SIZE < SUPERBLOCK_SIZE / 2);
const _: () = assert!(SIZES[0] >= size_of::<*mut FreeBlock>()); // intrusive links fit
const _: () = assert!(SIZES[NSIZES - 1] == LARGEST_BLOCK);
const _: () = assert!((NSIZES as u32) < BLOCK_TYPE_FREE);
const _: () = assert!(size_of::<Heap>() >= 3 * 64); // own cache-line group per heap
const _: () = assert!(align_of::<Heap>() == 64);

// =============================================================================
// Types
// =============================================================================

#[repr(C)]
struct FreeBlock {
  next: *mut FreeBlock,
}

/// Superblock metadata. Sits at offset 0 of each 8KB superblock, so any
/// interior block address masks down to it.
#[repr(C)]
pub struct PageRef {
  next: *mut PageRef,
  /// Unused (null) while on a `free_pages` stack.
  prev: *mut PageRef,
  /// Intrusive list of free blocks inside this superblock.
  flist: *mut FreeBlock,
  /// Size class index, `BLOCK_TYPE_FREE` or `BLOCK_TYPE_LARGE`.
  block_type: u32,
  /// Free blocks for a size-classed superblock; run length for a large one.
  count: u32,
  /// Heap that currently owns this superblock.
  heap_id: u32,
}

/// Number of blocks a superblock of class `class` holds.
const fn capacity(class: usize) -> u32 {
  ((SUPERBLOCK_SIZE - PAGE_REF_SIZE) / SIZES[class]) as u32
}

/// Header of the superblock holding `ptr`. Relies on 8KB superblock
/// alignment within the arena.
#[inline]
fn page_of(ptr: *mut u8) -> *mut PageRef {
  (ptr as usize & SUPERBLOCK_ALIGN_MASK) as *mut PageRef
}

/// Pop one block from `pr`'s free list. Caller must hold the lock of the
/// list `pr` is on.
#[inline]
unsafe fn pop_block(pr: *mut PageRef) -> *mut u8 {
  unsafe {
    let block = (*pr).flist;
    (*pr).flist = (*block).next;
    (*pr).count -= 1;
    block as *mut u8
  }
}

/// Smallest class whose blocks hold `size` bytes. Callers guard the upper
/// bound.
fn size_class(size: usize) -> usize {
  for (k, &s) in SIZES.iter().enumerate() {
    if size <= s {
      return k;
    }
  }
  // Dispatch routes anything above LARGEST_BLOCK to the large path.
  unreachable!("no size class holds {size} bytes");
}

// =============================================================================
// Spinlock
// =============================================================================

struct SpinLock {
  locked: AtomicBool,
}

impl SpinLock {
  const fn new() -> Self {
    Self {
      locked: AtomicBool::new(false),
    }
  }

  #[inline]
  fn lock(&self) {
    while self
      .locked
      .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
      .is_err()
    {
      while self.locked.load(Ordering::Relaxed) {
        hint::spin_loop();
      }
    }
  }

  #[inline]
  fn unlock(&self) {
    self.locked.store(false, Ordering::Release);
  }
}

/// Lock-protected list state.
struct Locked<T> {
  lock: SpinLock,
  list: UnsafeCell<T>,
}

impl<T> Locked<T> {
  const fn new(list: T) -> Self {
    Self {
      lock: SpinLock::new(),
      list: UnsafeCell::new(list),
    }
  }
}

// =============================================================================
// Superblock lists
// =============================================================================

/// LIFO stack of fully free superblocks, linked through `next` only.
struct FreeStack {
  head: *mut PageRef,
  len: usize,
}

impl FreeStack {
  const fn new() -> Self {
    Self {
      head: null_mut(),
      len: 0,
    }
  }

  /// Caller must hold the owning lock.
  unsafe fn push(&mut self, pr: *mut PageRef) {
    unsafe { (*pr).next = self.head };
    self.head = pr;
    self.len += 1;
  }

  /// Prepend the chain `head..=tail` of `n` superblocks. Caller must hold
  /// the owning lock.
  unsafe fn push_run(&mut self, head: *mut PageRef, tail: *mut PageRef, n: usize) {
    unsafe { (*tail).next = self.head };
    self.head = head;
    self.len += n;
  }

  /// Caller must hold the owning lock. Null when empty.
  unsafe fn pop(&mut self) -> *mut PageRef {
    let pr = self.head;
    if !pr.is_null() {
      self.head = unsafe { (*pr).next };
      self.len -= 1;
    }
    pr
  }
}

/// Doubly-linked list of superblocks. Membership only: prepend and detach.
struct PageList {
  head: *mut PageRef,
}

impl PageList {
  const fn new() -> Self {
    Self { head: null_mut() }
  }

  /// Caller must hold the owning lock.
  unsafe fn push_front(&mut self, pr: *mut PageRef) {
    unsafe {
      (*pr).prev = null_mut();
      (*pr).next = self.head;
      if !self.head.is_null() {
        (*self.head).prev = pr;
      }
    }
    self.head = pr;
  }

  /// Caller must hold the owning lock; `pr` must be a member.
  unsafe fn detach(&mut self, pr: *mut PageRef) {
    unsafe {
      if !(*pr).next.is_null() {
        (*(*pr).next).prev = (*pr).prev;
      }
      if (*pr).prev.is_null() {
        self.head = (*pr).next;
      } else {
        (*(*pr).prev).next = (*pr).next;
      }
      (*pr).next = null_mut();
      (*pr).prev = null_mut();
    }
  }
}

// =============================================================================
// Heap
// =============================================================================

/// Per-CPU (or global) heap. The alignment keeps each heap record on its own
/// cache-line group.
#[repr(align(64))]
struct Heap {
  free_pages: Locked<FreeStack>,
  complete_pages: Locked<PageList>,
  large_pages: Locked<PageList>,
  sizebases: [Locked<PageList>; NSIZES],
}

impl Heap {
  const fn new() -> Self {
    const SIZEBASE: Locked<PageList> = Locked::new(PageList::new());
    Self {
      free_pages: Locked::new(FreeStack::new()),
      complete_pages: Locked::new(PageList::new()),
      large_pages: Locked::new(PageList::new()),
      sizebases: [SIZEBASE; NSIZES],
    }
  }
}

// =============================================================================
// Platform
// =============================================================================

unsafe fn os_mmap(size: usize) -> *mut u8 {
  let ptr = unsafe {
    libc::mmap(
      null_mut(),
      size,
      libc::PROT_READ | libc::PROT_WRITE,
      libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
      -1,
      0,
    )
  };

  if ptr == libc::MAP_FAILED {
    null_mut()
  } else {
    ptr as *mut u8
  }
}

unsafe fn os_munmap(ptr: *mut u8, size: usize) {
  unsafe { libc::munmap(ptr.cast(), size) };
}

/// Number of online CPUs, at least 1.
fn cpu_count() -> usize {
  let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
  if n < 1 { 1 } else { n as usize }
}

// Only supported on recent x86 CPUs; the fastest way to read the CPU index.
#[cfg(all(target_arch = "x86_64", target_os = "linux", feature = "rdpid"))]
fn current_cpu() -> usize {
  let cpu: u64;
  unsafe {
    std::arch::asm!("rdpid {}", out(reg) cpu, options(nomem, nostack, preserves_flags));
  }
  (cpu & 0xFFF) as usize
}

#[cfg(all(target_os = "linux", not(feature = "rdpid")))]
fn current_cpu() -> usize {
  unsafe { libc::sched_getcpu() as usize }
}

#[cfg(not(target_os = "linux"))]
fn current_cpu() -> usize {
  use core::sync::atomic::AtomicUsize;
  // No cheap CPU index; spread threads over heaps by a per-thread counter.
  thread_local! {
    static SLOT: usize = {
      static CTR: AtomicUsize = AtomicUsize::new(0);
      CTR.fetch_add(1, Ordering::Relaxed)
    };
  }
  SLOT.with(|&s| s)
}

// =============================================================================
// Arena
// =============================================================================

/// Contiguous sbrk-style region. One process-wide lock serializes `grow`;
/// it is never held together with any other lock.
struct Arena {
  lock: SpinLock,
  lo: *mut u8,
  hi: AtomicPtr<u8>,
  limit: *mut u8,
}

impl Arena {
  /// Reserve the address range. `None` if the OS refuses.
  fn init() -> Option<Arena> {
    let base = unsafe { os_mmap(ARENA_SIZE) };
    if base.is_null() {
      return None;
    }
    Some(Arena {
      lock: SpinLock::new(),
      lo: base,
      hi: AtomicPtr::new(base),
      limit: unsafe { base.add(ARENA_SIZE) },
    })
  }

  /// Extend the arena by exactly `n` bytes and return the new region. Null
  /// once the reservation is spent.
  fn grow(&self, n: usize) -> *mut u8 {
    self.lock.lock();
    let old = self.hi.load(Ordering::Relaxed);
    let grown = if (self.limit as usize) - (old as usize) < n {
      null_mut()
    } else {
      self.hi.store(unsafe { old.add(n) }, Ordering::Release);
      old
    };
    self.lock.unlock();
    grown
  }

  #[inline]
  fn hi(&self) -> *mut u8 {
    self.hi.load(Ordering::Acquire)
  }

  #[inline]
  fn contains(&self, ptr: *mut u8) -> bool {
    let addr = ptr as usize;
    addr >= self.lo as usize && addr < self.hi() as usize
  }
}

impl Drop for Arena {
  fn drop(&mut self) {
    unsafe { os_munmap(self.lo, ARENA_SIZE) };
  }
}

// =============================================================================
// Allocator
// =============================================================================

/// The three process-wide items: arena, heap array, CPU count. Heap 0 is the
/// global heap; heaps 1..=nproc serve the CPUs.
pub struct Allocator {
  arena: Arena,
  heaps: *mut Heap,
  nproc: usize,
}

unsafe impl Send for Allocator {}
unsafe impl Sync for Allocator {}

impl Allocator {
  /// Set up the arena and one heap per CPU plus the global heap.
  pub fn new() -> Option<Allocator> {
    Self::with_cpus(cpu_count())
  }

  fn with_cpus(nproc: usize) -> Option<Allocator> {
    debug_assert!(nproc >= 1);
    let arena = Arena::init()?;

    // Superblock alignment is what makes headers recoverable by masking;
    // pad the arena forward until the next grow lands on an 8KB boundary.
    let pad = (arena.lo as usize).wrapping_neg() % SUPERBLOCK_SIZE;
    if pad > 0 && arena.grow(pad).is_null() {
      return None;
    }

    let heap_bytes = size_of::<Heap>() * (nproc + 1);
    let npages = heap_bytes.div_ceil(SUPERBLOCK_SIZE);
    let heaps = arena.grow(npages * SUPERBLOCK_SIZE) as *mut Heap;
    if heaps.is_null() {
      return None;
    }
    for i in 0..=nproc {
      unsafe { ptr::write(heaps.add(i), Heap::new()) };
    }

    Some(Allocator { arena, heaps, nproc })
  }

  #[inline]
  fn heap(&self, id: u32) -> &Heap {
    debug_assert!((id as usize) <= self.nproc);
    unsafe { &*self.heaps.add(id as usize) }
  }

  /// Allocate at least `size` bytes, aligned to 8. Null once the arena is
  /// spent.
  pub fn alloc(&self, size: usize) -> *mut u8 {
    let heap_id = (current_cpu() % self.nproc) as u32 + 1;
    if size > LARGEST_BLOCK {
      self.alloc_large(size, heap_id)
    } else {
      self.alloc_small(size, heap_id)
    }
  }

  fn alloc_small(&self, size: usize, heap_id: u32) -> *mut u8 {
    let h = self.heap(heap_id);
    let class = size_class(size);

    // A superblock of the right class with a free block, if there is one.
    h.sizebases[class].lock.lock();
    let sb = unsafe { &mut *h.sizebases[class].list.get() };
    let pr = sb.head;
    if !pr.is_null() {
      let block = unsafe { pop_block(pr) };
      if unsafe { (*pr).count } == 0 {
        // Last free block taken: the superblock is complete now.
        unsafe { sb.detach(pr) };
        h.complete_pages.lock.lock();
        unsafe { (*h.complete_pages.list.get()).push_front(pr) };
        h.complete_pages.lock.unlock();
      }
      h.sizebases[class].lock.unlock();
      return block;
    }
    h.sizebases[class].lock.unlock();

    // Repurpose a fully free superblock, local first, then global.
    h.free_pages.lock.lock();
    let mut pr = unsafe { (*h.free_pages.list.get()).pop() };
    h.free_pages.lock.unlock();

    if pr.is_null() {
      let global = self.heap(GLOBAL_HEAP_ID);
      global.free_pages.lock.lock();
      pr = unsafe { (*global.free_pages.list.get()).pop() };
      global.free_pages.lock.unlock();
    }

    if pr.is_null() {
      pr = self.arena.grow(SUPERBLOCK_SIZE) as *mut PageRef;
      if pr.is_null() {
        return null_mut();
      }
    }

    unsafe { self.format_superblock(pr, class, heap_id) }
  }

  /// Turn `pr` into a size-classed superblock, take one block out of it, and
  /// publish it on the owner's class list.
  unsafe fn format_superblock(&self, pr: *mut PageRef, class: usize, heap_id: u32) -> *mut u8 {
    let base = unsafe { (pr as *mut u8).add(PAGE_REF_SIZE) };
    let stride = SIZES[class];
    let cap = capacity(class);

    unsafe {
      (*pr).block_type = class as u32;
      (*pr).count = cap;
      (*pr).heap_id = heap_id;
      (*pr).prev = null_mut();

      // Link block i onto block i-1: block 0 is the tail and the highest
      // block the head. Pops come off the head, so reuse is LIFO.
      let mut fl = base as *mut FreeBlock;
      (*fl).next = null_mut();
      for i in 1..cap as usize {
        let next = base.add(i * stride) as *mut FreeBlock;
        (*next).next = fl;
        fl = next;
      }
      (*pr).flist = fl;

      let block = pop_block(pr);

      let h = self.heap(heap_id);
      h.sizebases[class].lock.lock();
      (*h.sizebases[class].list.get()).push_front(pr);
      h.sizebases[class].lock.unlock();

      block
    }
  }

  fn alloc_large(&self, size: usize, heap_id: u32) -> *mut u8 {
    let total = match size.checked_add(PAGE_REF_SIZE) {
      Some(v) => v,
      None => return null_mut(),
    };
    let npages = total.div_ceil(SUPERBLOCK_SIZE);
    let pr = match npages.checked_mul(SUPERBLOCK_SIZE) {
      Some(bytes) => self.arena.grow(bytes) as *mut PageRef,
      None => return null_mut(),
    };
    if pr.is_null() {
      return null_mut();
    }

    unsafe {
      (*pr).block_type = BLOCK_TYPE_LARGE;
      (*pr).count = npages as u32;
      (*pr).heap_id = heap_id;
      (*pr).flist = null_mut();

      let h = self.heap(heap_id);
      h.large_pages.lock.lock();
      (*h.large_pages.list.get()).push_front(pr);
      h.large_pages.lock.unlock();

      (pr as *mut u8).add(PAGE_REF_SIZE)
    }
  }

  /// Release a block returned by `alloc`. Null-safe; a superblock whose
  /// header already reads free is left alone.
  pub unsafe fn free(&self, ptr: *mut u8) {
    if ptr.is_null() {
      return;
    }
    debug_assert!(self.arena.contains(ptr));

    let pr = page_of(ptr);
    let block_type = unsafe { (*pr).block_type };

    if block_type == BLOCK_TYPE_FREE {
      // Double free of a fully released superblock.
      return;
    }
    if block_type == BLOCK_TYPE_LARGE {
      unsafe { self.free_large(pr) };
      return;
    }
    debug_assert!((block_type as usize) < NSIZES);
    unsafe { self.free_small(ptr, pr, block_type as usize) };
  }

  unsafe fn free_small(&self, ptr: *mut u8, pr: *mut PageRef, class: usize) {
    let h = self.heap(unsafe { (*pr).heap_id });

    // The superblock is on sizebases[class] or on complete_pages; which one
    // is unknowable until `count` is read. Take both locks up front so a
    // concurrent allocator cannot move it between the two lists in the gap.
    h.sizebases[class].lock.lock();
    h.complete_pages.lock.lock();

    unsafe {
      let block = ptr as *mut FreeBlock;
      (*block).next = (*pr).flist;
      (*pr).flist = block;
      (*pr).count += 1;

      if (*pr).count == capacity(class) {
        // Every block is free. The superblock had other free blocks before
        // this one, so it sits on sizebases[class], not complete_pages, and
        // nothing can move it there while the sizebases lock is held.
        h.complete_pages.lock.unlock();
        (*h.sizebases[class].list.get()).detach(pr);
        (*pr).block_type = BLOCK_TYPE_FREE;
        h.sizebases[class].lock.unlock();
        self.move_page_free(pr, h);
      } else if (*pr).count == 1 {
        // First free block: the superblock leaves complete_pages.
        (*h.complete_pages.list.get()).detach(pr);
        h.complete_pages.lock.unlock();
        (*h.sizebases[class].list.get()).push_front(pr);
        h.sizebases[class].lock.unlock();
      } else {
        h.complete_pages.lock.unlock();
        h.sizebases[class].lock.unlock();
      }
    }
  }

  /// Release a large run: detach it and carve it back into free superblocks.
  unsafe fn free_large(&self, pr: *mut PageRef) {
    let h = self.heap(unsafe { (*pr).heap_id });

    h.large_pages.lock.lock();
    unsafe { (*h.large_pages.list.get()).detach(pr) };
    h.large_pages.lock.unlock();

    unsafe {
      let npages = (*pr).count as usize;
      let heap_id = (*pr).heap_id;

      // One header per 8KB boundary of the run, chained through `next`.
      (*pr).block_type = BLOCK_TYPE_FREE;
      (*pr).prev = null_mut();
      (*pr).flist = null_mut();
      let mut tail = pr;
      for i in 1..npages {
        let next = (pr as *mut u8).add(i * SUPERBLOCK_SIZE) as *mut PageRef;
        (*next).block_type = BLOCK_TYPE_FREE;
        (*next).prev = null_mut();
        (*next).flist = null_mut();
        (*next).heap_id = heap_id;
        (*tail).next = next;
        tail = next;
      }
      (*tail).next = null_mut();

      h.free_pages.lock.lock();
      (*h.free_pages.list.get()).push_run(pr, tail, npages);
      h.free_pages.lock.unlock();
    }

    self.move_page_global(h);
  }

  /// Put a fully free superblock on `h`'s free stack, then rebalance.
  fn move_page_free(&self, pr: *mut PageRef, h: &Heap) {
    unsafe {
      (*pr).prev = null_mut();
      (*pr).block_type = BLOCK_TYPE_FREE;
    }
    h.free_pages.lock.lock();
    unsafe { (*h.free_pages.list.get()).push(pr) };
    h.free_pages.lock.unlock();
    self.move_page_global(h);
  }

  /// Hand one surplus free superblock to the global heap. `h` must be a
  /// local heap. On a single-CPU system every thread already shares one
  /// heap, so there is nothing to rebalance.
  fn move_page_global(&self, h: &Heap) {
    if self.nproc <= 1 {
      return;
    }

    h.free_pages.lock.lock();
    let fp = unsafe { &mut *h.free_pages.list.get() };
    let pr = if fp.len > FREE_PAGE_THRESHOLD {
      unsafe { fp.pop() }
    } else {
      null_mut()
    };
    h.free_pages.lock.unlock();

    if pr.is_null() {
      return;
    }

    // The local free_pages lock is already dropped; when both are ever
    // needed, local comes before global.
    unsafe {
      (*pr).prev = null_mut();
      (*pr).heap_id = GLOBAL_HEAP_ID;
    }
    let global = self.heap(GLOBAL_HEAP_ID);
    global.free_pages.lock.lock();
    unsafe { (*global.free_pages.list.get()).push(pr) };
    global.free_pages.lock.unlock();
  }

  /// Bytes usable behind `ptr`: the class size for small blocks, the run
  /// minus its header for large ones, zero for anything else.
  pub fn usable_size(&self, ptr: *mut u8) -> usize {
    if ptr.is_null() || !self.arena.contains(ptr) {
      return 0;
    }
    let pr = page_of(ptr);
    match unsafe { (*pr).block_type } {
      BLOCK_TYPE_FREE => 0,
      BLOCK_TYPE_LARGE => unsafe { (*pr).count as usize * SUPERBLOCK_SIZE - PAGE_REF_SIZE },
      class if (class as usize) < NSIZES => SIZES[class as usize],
      _ => 0,
    }
  }
}

// =============================================================================
// Process-wide API
// =============================================================================

static INSTANCE: OnceLock<Allocator> = OnceLock::new();

/// Set up the process allocator: 0 on success, -1 if the arena cannot be
/// reserved. Must run before `allocate`/`release`; later calls are no-ops.
pub fn init() -> i32 {
  if INSTANCE.get().is_some() {
    return 0;
  }
  match Allocator::new() {
    Some(a) => {
      // A racing second init loses the set and its arena is unmapped.
      let _ = INSTANCE.set(a);
      0
    }
    None => -1,
  }
}

/// Allocate at least `size` bytes, aligned to 8. Null before `init` or once
/// the arena is spent.
pub fn allocate(size: usize) -> *mut u8 {
  match INSTANCE.get() {
    Some(a) => a.alloc(size),
    None => null_mut(),
  }
}

/// Release a block returned by `allocate`. Null-safe.
pub unsafe fn release(ptr: *mut u8) {
  if let Some(a) = INSTANCE.get() {
    unsafe { a.free(ptr) };
  }
}

// =============================================================================
// C API (enabled with --features c_api)
// =============================================================================

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub extern "C" fn mm_init() -> i32 {
  init()
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn mm_malloc(size: usize) -> *mut u8 {
  allocate(size)
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn mm_free(ptr: *mut u8) {
  unsafe { release(ptr) }
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn mm_calloc(nmemb: usize, size: usize) -> *mut u8 {
  let total = nmemb.saturating_mul(size);
  let ptr = allocate(total);
  if !ptr.is_null() {
    unsafe { ptr::write_bytes(ptr, 0, total) };
  }
  ptr
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn mm_usable_size(ptr: *mut u8) -> usize {
  match INSTANCE.get() {
    Some(a) => a.usable_size(ptr),
    None => 0,
  }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
  use super::*;

  fn new_alloc(cpus: usize) -> Allocator {
    Allocator::with_cpus(cpus).expect("arena reservation failed")
  }

  fn flist_len(pr: *mut PageRef) -> u32 {
    let mut n = 0;
    let mut b = unsafe { (*pr).flist };
    while !b.is_null() {
      n += 1;
      b = unsafe { (*b).next };
    }
    n
  }

  fn free_len(h: &Heap) -> usize {
    unsafe { (*h.free_pages.list.get()).len }
  }

  #[test]
  fn class_for_size() {
    assert_eq!(size_class(0), 0);
    assert_eq!(size_class(1), 0);
    assert_eq!(size_class(8), 0);
    assert_eq!(size_class(9), 1);
    assert_eq!(size_class(24), 2);
    assert_eq!(size_class(1024), 7);
    assert_eq!(size_class(1025), 8);
    assert_eq!(size_class(2048), 8);
  }

  #[test]
  fn superblocks_are_aligned_and_heaps_padded() {
    let a = new_alloc(3);
    assert_eq!(a.heaps as usize % 64, 0);
    let p = a.alloc_small(8, 1);
    assert_eq!(page_of(p) as usize % SUPERBLOCK_SIZE, 0);
    assert_eq!(p as usize % 8, 0);
  }

  #[test]
  fn single_thread_round_trip() {
    let a = new_alloc(1);
    let before = a.arena.hi() as usize;

    let p = a.alloc_small(24, 1);
    assert!(!p.is_null());
    assert_eq!(p as usize % 8, 0);
    unsafe { ptr::write_bytes(p, 0xab, 24) };
    // One superblock for class 32, nothing more.
    assert_eq!(a.arena.hi() as usize - before, SUPERBLOCK_SIZE);

    unsafe { a.free(p) };
    let q = a.alloc_small(24, 1);
    assert_eq!(q, p);
    unsafe { a.free(q) };
    assert_eq!(a.arena.hi() as usize - before, SUPERBLOCK_SIZE);
  }

  #[test]
  fn exhausting_one_superblock_starts_another() {
    let a = new_alloc(1);
    let cap = capacity(0) as usize;

    let blocks: Vec<*mut u8> = (0..cap).map(|_| a.alloc_small(8, 1)).collect();
    assert!(blocks.iter().all(|p| !p.is_null()));

    let pr = page_of(blocks[0]);
    assert!(blocks.iter().all(|&p| page_of(p) == pr));
    let mut sorted = blocks.clone();
    sorted.sort();
    sorted.dedup();
    assert_eq!(sorted.len(), cap);

    // The drained superblock moved to complete_pages.
    assert_eq!(unsafe { (*pr).count }, 0);
    assert_eq!(unsafe { (*a.heap(1).complete_pages.list.get()).head }, pr);
    assert!(unsafe { (*a.heap(1).sizebases[0].list.get()).head.is_null() });

    // The next allocation opens a second superblock.
    let extra = a.alloc_small(8, 1);
    assert_ne!(page_of(extra), pr);

    // Freeing one block pulls the superblock back onto the class list, and
    // the freed address is the next one handed out.
    let last = blocks[cap - 1];
    unsafe { a.free(last) };
    assert_eq!(unsafe { (*a.heap(1).sizebases[0].list.get()).head }, pr);
    let again = a.alloc_small(8, 1);
    assert_eq!(again, last);
  }

  #[test]
  fn releasing_every_block_frees_the_superblock() {
    let a = new_alloc(1);
    let cap = capacity(3) as usize;

    let blocks: Vec<*mut u8> = (0..cap).map(|_| a.alloc_small(64, 1)).collect();
    let pr = page_of(blocks[0]);
    for &p in &blocks {
      unsafe { a.free(p) };
    }

    assert_eq!(unsafe { (*pr).block_type }, BLOCK_TYPE_FREE);
    assert_eq!(free_len(a.heap(1)), 1);
    assert!(unsafe { (*a.heap(1).sizebases[3].list.get()).head.is_null() });

    // Double free of an already released superblock is a no-op.
    unsafe { a.free(blocks[0]) };
    assert_eq!(free_len(a.heap(1)), 1);
  }

  #[test]
  fn surplus_free_superblocks_migrate_to_the_global_heap() {
    let a = new_alloc(2);
    let cap = capacity(0) as usize;

    let blocks: Vec<*mut u8> = (0..3 * cap).map(|_| a.alloc_small(8, 1)).collect();
    for &p in blocks.iter().rev() {
      unsafe { a.free(p) };
    }

    // The third fully freed superblock crossed the threshold and moved over.
    assert_eq!(free_len(a.heap(1)), FREE_PAGE_THRESHOLD);
    assert_eq!(free_len(a.heap(GLOBAL_HEAP_ID)), 1);
    let migrated = unsafe { (*a.heap(GLOBAL_HEAP_ID).free_pages.list.get()).head };
    assert_eq!(unsafe { (*migrated).heap_id }, GLOBAL_HEAP_ID);

    // The global free superblock is found again once local stocks run dry.
    let refill: Vec<*mut u8> = (0..3 * cap).map(|_| a.alloc_small(8, 1)).collect();
    assert!(refill.iter().all(|p| !p.is_null()));
    assert_eq!(free_len(a.heap(GLOBAL_HEAP_ID)), 0);
  }

  #[test]
  fn single_cpu_systems_never_migrate() {
    let a = new_alloc(1);
    let cap = capacity(0) as usize;

    let blocks: Vec<*mut u8> = (0..4 * cap).map(|_| a.alloc_small(8, 1)).collect();
    for &p in blocks.iter().rev() {
      unsafe { a.free(p) };
    }

    assert_eq!(free_len(a.heap(1)), 4);
    assert_eq!(free_len(a.heap(GLOBAL_HEAP_ID)), 0);
  }

  #[test]
  fn large_blocks_round_trip_through_free_pages() {
    let a = new_alloc(1);
    let before = a.arena.hi() as usize;

    let p = a.alloc(10_000);
    assert!(!p.is_null());
    assert_eq!(p as usize % 8, 0);
    assert_eq!(a.arena.hi() as usize - before, 2 * SUPERBLOCK_SIZE);

    let pr = page_of(p);
    assert_eq!(unsafe { (*pr).block_type }, BLOCK_TYPE_LARGE);
    assert_eq!(unsafe { (*pr).count }, 2);
    assert_eq!(a.usable_size(p), 2 * SUPERBLOCK_SIZE - PAGE_REF_SIZE);
    unsafe { ptr::write_bytes(p, 0x5a, 10_000) };

    unsafe { a.free(p) };
    assert_eq!(free_len(a.heap(1)), 2);
    assert!(unsafe { (*a.heap(1).large_pages.list.get()).head.is_null() });

    // Both carved superblocks carry a free header now.
    let second = (pr as usize + SUPERBLOCK_SIZE) as *mut PageRef;
    assert_eq!(unsafe { (*pr).block_type }, BLOCK_TYPE_FREE);
    assert_eq!(unsafe { (*second).block_type }, BLOCK_TYPE_FREE);

    // The carved superblocks feed later small allocations without growing.
    let grown = a.arena.hi() as usize;
    let q = a.alloc_small(128, 1);
    assert!(!q.is_null());
    assert_eq!(a.arena.hi() as usize, grown);
  }

  #[test]
  fn largest_class_boundary() {
    let a = new_alloc(1);
    let p = a.alloc_small(2048, 1);
    assert_eq!(unsafe { (*page_of(p)).block_type }, 8);
    assert_eq!(a.usable_size(p), 2048);

    let q = a.alloc(2049);
    assert_eq!(unsafe { (*page_of(q)).block_type }, BLOCK_TYPE_LARGE);
  }

  #[test]
  fn zero_size_gets_the_smallest_class() {
    let a = new_alloc(1);
    let p = a.alloc(0);
    assert!(!p.is_null());
    assert_eq!(p as usize % 8, 0);
    unsafe { ptr::write_bytes(p, 0xff, 8) };
    assert_eq!(a.usable_size(p), 8);
  }

  #[test]
  fn null_release_is_a_noop() {
    let a = new_alloc(1);
    let n = free_len(a.heap(1));
    unsafe { a.free(null_mut()) };
    assert_eq!(free_len(a.heap(1)), n);
  }

  #[test]
  fn frees_follow_the_owning_heap() {
    let a = new_alloc(4);
    let p = a.alloc_small(24, 1);
    let q = a.alloc_small(24, 1);
    let pr = page_of(p);
    assert_eq!(pr, page_of(q));

    // However the freeing thread is scheduled, the header routes the block
    // back to heap 1.
    unsafe { a.free(p) };
    assert_eq!(unsafe { (*pr).heap_id }, 1);
    assert_eq!(unsafe { (*a.heap(1).sizebases[2].list.get()).head }, pr);
    for id in 2..=4 {
      assert!(unsafe { (*a.heap(id).sizebases[2].list.get()).head.is_null() });
    }
    unsafe { a.free(q) };
  }

  #[test]
  fn flist_matches_count_and_stride() {
    let a = new_alloc(1);
    let blocks: Vec<*mut u8> = (0..37).map(|_| a.alloc_small(128, 1)).collect();
    for p in blocks.iter().step_by(3) {
      unsafe { a.free(*p) };
    }

    let pr = page_of(blocks[0]);
    assert_eq!(flist_len(pr), unsafe { (*pr).count });

    let base = pr as usize + PAGE_REF_SIZE;
    let mut b = unsafe { (*pr).flist };
    while !b.is_null() {
      let off = b as usize - base;
      assert_eq!(off % 128, 0);
      assert!(off < SUPERBLOCK_SIZE - PAGE_REF_SIZE);
      b = unsafe { (*b).next };
    }
  }

  #[test]
  fn usable_size_of_foreign_pointers_is_zero() {
    let a = new_alloc(1);
    let mut x = 0u64;
    assert_eq!(a.usable_size(&mut x as *mut u64 as *mut u8), 0);
    assert_eq!(a.usable_size(null_mut()), 0);
  }
}
