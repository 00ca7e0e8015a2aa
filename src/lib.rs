//! Arena-based memory allocator with free-list recycling.
//!
//! An [`ArenaHandler`] serves allocation requests by carving them out of large
//! contiguous blocks ("arenas") obtained from the system allocator. Released
//! regions are recycled through a sorted, coalescing free list, so workloads
//! with many short-to-medium-lived objects amortize to pointer arithmetic
//! instead of per-object `malloc`/`free` round trips.
//!
//! The handler is single-threaded; callers that share one must serialize
//! externally. Arena blocks are returned to the system only when the handler
//! is dropped.
//!
//! ```rust
//! use memarena::ArenaHandler;
//!
//! let mut handler = ArenaHandler::new();
//! unsafe {
//!   let ptr = handler.request_memory(256, 8, true).unwrap();
//!   ptr.as_ptr().write_bytes(0, 256);
//!   handler.free_memory(ptr.as_ptr(), 256).unwrap();
//! }
//! ```
//!
//! Failure paths report through the [`log`] facade; install a logger to see
//! them. No logger is installed by this crate.

use core::fmt;
use core::ptr::NonNull;

// =============================================================================
// Constants
// =============================================================================

/// Hard cap on the number of arenas a handler may own.
const ARENAS_MAX_CAPACITY: usize = (1 << 12) - 1;
/// Hard cap on the number of entries in the free list.
const FREE_BLOCKS_MAX_CAPACITY: usize = (1 << 20) - 1;

/// Size of a fresh arena when the request is small and the caller did not opt
/// out of default sizing.
const DEFAULT_MEMORY_ARENA_ALLOCATION: usize = 1 << 20; // 1MiB

const INITIAL_MEMORY_ARENAS_CAPACITY: usize = 3;
const INITIAL_FREE_BLOCKS_CAPACITY: usize = 50;

/// Carve remainders below this size are dropped from the free list instead of
/// being kept as tiny entries. The dropped bytes stay unreachable until the
/// handler dies.
const MIN_FREE_BLOCK_SIZE: usize = 256;

const _: () = assert!(INITIAL_MEMORY_ARENAS_CAPACITY < ARENAS_MAX_CAPACITY);
const _: () = assert!(INITIAL_FREE_BLOCKS_CAPACITY < FREE_BLOCKS_MAX_CAPACITY);
const _: () = assert!(MIN_FREE_BLOCK_SIZE < DEFAULT_MEMORY_ARENA_ALLOCATION);

// =============================================================================
// Platform
// =============================================================================

unsafe fn os_alloc(size: usize) -> *mut u8 {
  unsafe { libc::malloc(size) as *mut u8 }
}

unsafe fn os_free(ptr: *mut u8) {
  unsafe { libc::free(ptr.cast()) };
}

// =============================================================================
// Types
// =============================================================================

/// Why a request or release could not be satisfied.
///
/// Discriminants are shared with the C surface and must stay fixed.
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ArenaError {
  /// The system allocator refused a growth or new-arena allocation.
  OutOfMemory = 1,
  /// The arena pool or the free list is at its hard cap and cannot grow
  /// further even if memory is available.
  InsufficientResource = 2,
}

impl fmt::Display for ArenaError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ArenaError::OutOfMemory => f.write_str("system allocator is out of memory"),
      ArenaError::InsufficientResource => f.write_str("data structure hard cap reached"),
    }
  }
}

impl std::error::Error for ArenaError {}

/// A contiguous block carved linearly via a bump pointer.
#[derive(Debug)]
struct MemoryArena {
  /// Head of the block obtained from the system allocator.
  block: NonNull<u8>,
  /// First untouched byte. Always within `block..=block + size`.
  untouched: *mut u8,
  /// Total bytes in the block.
  size: usize,
}

impl Drop for MemoryArena {
  fn drop(&mut self) {
    unsafe { os_free(self.block.as_ptr()) };
  }
}

/// A released region available for reuse.
#[derive(Clone, Copy, Debug)]
struct FreeBlock {
  ptr: *mut u8,
  size: usize,
}

// =============================================================================
// Backing-array growth
// =============================================================================

/// Grows `vec` by one step: zero capacity jumps to `initial`, afterwards the
/// capacity doubles, clamped to `max_capacity`.
///
/// Called only when the vector is full; the vectors in this crate never grow
/// on their own.
fn grow_backing<T>(
  vec: &mut Vec<T>,
  initial: usize,
  max_capacity: usize,
) -> Result<(), ArenaError> {
  if vec.capacity() >= max_capacity {
    return Err(ArenaError::InsufficientResource);
  }

  let target = if vec.capacity() == 0 {
    initial
  } else {
    (vec.capacity() * 2).min(max_capacity)
  };

  vec
    .try_reserve_exact(target - vec.len())
    .map_err(|_| ArenaError::OutOfMemory)
}

fn report_growth_failure(pool: &str, err: ArenaError) -> ArenaError {
  match err {
    ArenaError::OutOfMemory => log::error!("failed to grow the {pool}"),
    ArenaError::InsufficientResource => log::warn!("{pool} is at its hard cap"),
  }
  err
}

// =============================================================================
// Handler
// =============================================================================

/// Owner of every arena block and of the free list.
///
/// Pointers handed out by [`request_memory`](ArenaHandler::request_memory)
/// refer into arena memory owned by this handler: they die with it.
#[derive(Debug, Default)]
pub struct ArenaHandler {
  /// Arenas in creation order. Not sorted by address.
  arenas: Vec<MemoryArena>,
  /// Reclaimed regions, sorted strictly ascending by address. Disjoint and
  /// never touching: adjacent regions are coalesced on release.
  free_blocks: Vec<FreeBlock>,
}

impl ArenaHandler {
  /// Creates an empty handler. Does not allocate.
  pub const fn new() -> Self {
    Self {
      arenas: Vec::new(),
      free_blocks: Vec::new(),
    }
  }

  /// Number of arenas currently owned.
  #[inline]
  pub fn arena_count(&self) -> usize {
    self.arenas.len()
  }

  /// Number of entries in the free list.
  #[inline]
  pub fn free_block_count(&self) -> usize {
    self.free_blocks.len()
  }

  /// Requests `size` bytes aligned to `alignment`.
  ///
  /// The free list is consulted first (first-fit), then existing arenas in
  /// creation order, and finally a new arena is created. A fresh arena spans
  /// `size * 3` bytes, raised to 1MiB unless `use_default_allocation` is
  /// false, and the request is always served from its head.
  ///
  /// `size == 0` is legal and yields an aligned pointer carrying a zero-byte
  /// region.
  ///
  /// # Errors
  ///
  /// [`ArenaError::OutOfMemory`] when the system allocator refuses a new
  /// arena block or a backing-array growth,
  /// [`ArenaError::InsufficientResource`] when the arena pool is at its hard
  /// cap.
  ///
  /// # Safety
  ///
  /// `alignment` must be a non-zero power of two. The returned region is
  /// valid until it is released through [`free_memory`](Self::free_memory) or
  /// the handler is dropped, whichever comes first.
  pub unsafe fn request_memory(
    &mut self,
    size: usize,
    alignment: u8,
    use_default_allocation: bool,
  ) -> Result<NonNull<u8>, ArenaError> {
    // First check if any free blocks have available memory.
    if let Some(ptr) = self.check_free_blocks(size, alignment) {
      return Ok(ptr);
    }

    // Then check if any arenas have untouched space left.
    if let Some(ptr) = self.check_arenas(size, alignment) {
      return Ok(ptr);
    }

    // A new arena is needed at this point.
    self.push_new_arena(size, alignment, use_default_allocation)
  }

  /// Returns a region previously obtained from
  /// [`request_memory`](Self::request_memory) to the free list.
  ///
  /// The region is merged with any free neighbor it touches, so the list
  /// stays sorted, disjoint and non-touching. On error the release is
  /// dropped: the region stays unreachable for the rest of the handler's
  /// lifetime, and the free list is left structurally unchanged.
  ///
  /// # Errors
  ///
  /// [`ArenaError::OutOfMemory`] when growing the free list fails,
  /// [`ArenaError::InsufficientResource`] when the free list is at its hard
  /// cap. Both can only occur when the release needs a fresh entry.
  ///
  /// # Safety
  ///
  /// `ptr` and `size` must denote a region handed out by this handler that is
  /// not already free, and the caller must not touch the region afterwards.
  /// Double frees and foreign pointers are not detected.
  pub unsafe fn free_memory(&mut self, ptr: *mut u8, size: usize) -> Result<(), ArenaError> {
    let addr = ptr as usize;

    // Lower bound on the sorted list: the index at which `ptr` keeps the
    // ascending order.
    let idx = self.free_blocks.partition_point(|block| (block.ptr as usize) < addr);

    let merge_left = idx > 0 && {
      let left_block = self.free_blocks[idx - 1];
      left_block.ptr as usize + left_block.size == addr
    };
    let merge_right =
      idx < self.free_blocks.len() && addr + size == self.free_blocks[idx].ptr as usize;

    match (merge_left, merge_right) {
      // [left .. new .. right] collapse into the left entry.
      (true, true) => {
        let right_size = self.free_blocks[idx].size;
        self.free_blocks[idx - 1].size += size + right_size;
        self.free_blocks.remove(idx);
      }

      // [left .. new] extend the left entry.
      (true, false) => {
        self.free_blocks[idx - 1].size += size;
      }

      // [new .. right] pull the right entry's start back.
      (false, true) => {
        let right_block = &mut self.free_blocks[idx];
        right_block.ptr = ptr;
        right_block.size += size;
      }

      // No neighbor touches: insert a fresh entry at `idx`.
      (false, false) => {
        if self.free_blocks.len() == self.free_blocks.capacity() {
          grow_backing(
            &mut self.free_blocks,
            INITIAL_FREE_BLOCKS_CAPACITY,
            FREE_BLOCKS_MAX_CAPACITY,
          )
          .map_err(|err| report_growth_failure("free list", err))?;
        }
        self.free_blocks.insert(idx, FreeBlock { ptr, size });
      }
    }

    Ok(())
  }

  /// First-fit scan of the free list.
  ///
  /// Carves from the front of the first region that still fits after
  /// alignment padding. The padding bytes ahead of the aligned address become
  /// unreachable; that loss is accepted to keep one entry per region.
  fn check_free_blocks(&mut self, size: usize, alignment: u8) -> Option<NonNull<u8>> {
    for ii in 0..self.free_blocks.len() {
      let free_block = self.free_blocks[ii];

      let aligned_addr = align_forward(free_block.ptr as usize, alignment);

      // If the needed end address is past what the block contains, move on.
      let needed_end_addr = aligned_addr + size;
      let actual_end_addr = free_block.ptr as usize + free_block.size;
      if needed_end_addr > actual_end_addr {
        continue;
      }

      // A tiny remainder is not worth an entry; dropping it keeps the list
      // short at the price of leaking a few bytes until the handler dies.
      if actual_end_addr - needed_end_addr < MIN_FREE_BLOCK_SIZE {
        self.free_blocks.remove(ii);
      } else {
        let free_block = &mut self.free_blocks[ii];
        free_block.ptr = needed_end_addr as *mut u8;
        free_block.size = actual_end_addr - needed_end_addr;
      }

      // Free blocks live inside arena blocks, which are never at address
      // zero.
      return Some(unsafe { NonNull::new_unchecked(aligned_addr as *mut u8) });
    }

    None
  }

  /// Bump-allocates from the first arena with enough untouched space.
  fn check_arenas(&mut self, size: usize, alignment: u8) -> Option<NonNull<u8>> {
    for arena in &mut self.arenas {
      let aligned_addr = align_forward(arena.untouched as usize, alignment);

      let needed_end_addr = aligned_addr + size;
      let actual_end_addr = arena.block.as_ptr() as usize + arena.size;
      if needed_end_addr > actual_end_addr {
        continue;
      }

      arena.untouched = needed_end_addr as *mut u8;
      return Some(unsafe { NonNull::new_unchecked(aligned_addr as *mut u8) });
    }

    None
  }

  /// Creates a new arena and serves the request from its head.
  #[inline(never)]
  fn push_new_arena(
    &mut self,
    size: usize,
    alignment: u8,
    use_default_allocation: bool,
  ) -> Result<NonNull<u8>, ArenaError> {
    if self.arenas.len() == self.arenas.capacity() {
      grow_backing(&mut self.arenas, INITIAL_MEMORY_ARENAS_CAPACITY, ARENAS_MAX_CAPACITY)
        .map_err(|err| report_growth_failure("arena pool", err))?;
    }

    // Arenas exist to amortize, so allocate more than requested. Small
    // requests are raised to the default arena size unless the caller opted
    // out.
    let mut mem_amount = size.checked_mul(3).ok_or(ArenaError::OutOfMemory)?;
    if use_default_allocation && mem_amount < DEFAULT_MEMORY_ARENA_ALLOCATION {
      mem_amount = DEFAULT_MEMORY_ARENA_ALLOCATION;
    }

    let Some(block) = NonNull::new(unsafe { os_alloc(mem_amount) }) else {
      log::error!("failed to allocate a new {mem_amount}-byte arena block");
      return Err(ArenaError::OutOfMemory);
    };

    let aligned_addr = align_forward(block.as_ptr() as usize, alignment);
    self.arenas.push(MemoryArena {
      block,
      untouched: (aligned_addr + size) as *mut u8,
      size: mem_amount,
    });

    Ok(unsafe { NonNull::new_unchecked(aligned_addr as *mut u8) })
  }
}

// =============================================================================
// C API (enabled with --features c_api)
// =============================================================================

/// Error codes observable across the C ABI. Values are fixed.
#[cfg(feature = "c_api")]
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ArenaErrorCode {
  Success = 0,
  OutOfMemory = 1,
  InsufficientResource = 2,
}

#[cfg(feature = "c_api")]
impl From<Result<(), ArenaError>> for ArenaErrorCode {
  fn from(result: Result<(), ArenaError>) -> Self {
    match result {
      Ok(()) => ArenaErrorCode::Success,
      Err(ArenaError::OutOfMemory) => ArenaErrorCode::OutOfMemory,
      Err(ArenaError::InsufficientResource) => ArenaErrorCode::InsufficientResource,
    }
  }
}

/// Allocates an empty handler behind an opaque pointer.
#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub extern "C" fn arena_create() -> *mut ArenaHandler {
  Box::into_raw(Box::new(ArenaHandler::new()))
}

/// Destroys a handler created by [`arena_create`], releasing every arena
/// block. Null handlers are a no-op.
///
/// # Safety
///
/// `handler` must be null or a pointer obtained from [`arena_create`] that
/// has not been destroyed yet. Every pointer the handler handed out is
/// invalid afterwards.
#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn arena_destroy(handler: *mut ArenaHandler) {
  if handler.is_null() {
    return;
  }
  drop(unsafe { Box::from_raw(handler) });
}

/// Requests memory from a handler. Returns null on failure.
///
/// # Safety
///
/// `handler` must be a live pointer obtained from [`arena_create`], and
/// `alignment` a non-zero power of two.
#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn arena_request_memory(
  handler: *mut ArenaHandler,
  size: usize,
  alignment: u8,
  use_default_allocation: bool,
) -> *mut u8 {
  let handler = unsafe { &mut *handler };
  match unsafe { handler.request_memory(size, alignment, use_default_allocation) } {
    Ok(ptr) => ptr.as_ptr(),
    Err(_) => core::ptr::null_mut(),
  }
}

/// Releases a region back to a handler.
///
/// # Safety
///
/// `handler` must be a live pointer obtained from [`arena_create`]; `ptr` and
/// `size` must denote a region handed out by it that is not already free.
#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn arena_free(
  handler: *mut ArenaHandler,
  ptr: *mut u8,
  size: usize,
) -> ArenaErrorCode {
  let handler = unsafe { &mut *handler };
  unsafe { handler.free_memory(ptr, size) }.into()
}

// =============================================================================
// Utils
// =============================================================================

/// First address at or above `addr` that is a multiple of `alignment`.
/// `alignment` must be a power of two.
#[inline(always)]
const fn align_forward(addr: usize, alignment: u8) -> usize {
  debug_assert!(alignment.is_power_of_two());
  let mask = alignment as usize - 1;
  (addr + mask) & !mask
}

// =============================================================================
// Tests
// =============================================================================
