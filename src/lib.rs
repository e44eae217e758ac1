#![cfg_attr(not(test), no_std)]

//! Quantum-based allocation: a lock-free, thread- and process-safe
//! alternative to `malloc`/`free` for 64-bit targets.
//!
//! A [`Quantal`] handle fronts a director laid out inside one large
//! virtual reservation. Requests of 8 bytes to 256 TiB are served in
//! amortized constant time; size, base and side-data queries from any
//! interior pointer are constant time; all bookkeeping is off-band, so a
//! heap can live in a named shared-memory object and be co-managed by
//! several processes.
//!
//! ```no_run
//! use quantal::{Config, Quantal};
//!
//! let heap = Quantal::create(&Config::new(false)).unwrap();
//! let block = heap.allocate(100);
//! assert!(heap.size(block) >= 100);
//! heap.deallocate(block);
//! heap.destroy(false);
//! ```

use core::ptr::NonNull;

pub use quantal_alloc::{
  STATS_SIZE,
  config::Config,
  director::{
    Director,
    DirectorError,
    DirectorResult,
  },
};

pub const VERSION_RELEASE: u32 = 0;
pub const VERSION_MAJOR: u32 = 1;
pub const VERSION_MINOR: u32 = 0;

/// Release, major and minor packed into bits 23-16, 15-8 and 7-0.
pub const fn version() -> u32 {
  (VERSION_RELEASE << 16) | (VERSION_MAJOR << 8) | VERSION_MINOR
}

pub const VERSION_STRING: &str = "quantal 0.1.0 experimental";

/// Handle to one allocator instance. Handles are plain references to the
/// director inside its reservation: clone-free, `Send`/`Sync`, and valid
/// until [`Quantal::destroy`]. There is no drop glue; destruction is
/// explicit because it may unlink a shared object other processes use.
pub struct Quantal {
  director: NonNull<Director>,
}

unsafe impl Send for Quantal {}
unsafe impl Sync for Quantal {}

impl Quantal {
  /// Create an allocator, or attach to a shared one already created
  /// under the same link name and configuration.
  pub fn create(config: &Config) -> DirectorResult<Self> {
    Director::create(config).map(|director| Self { director })
  }

  /// Bytes of address space `create` will reserve for `config`.
  pub fn create_size(config: &Config) -> DirectorResult<usize> {
    Director::create_size(config)
  }

  /// Release the entire reservation, optionally unlinking the shared
  /// name. All outstanding allocations die with it.
  pub fn destroy(self, unlink: bool) {
    unsafe { Director::destroy(self.director, unlink) };
  }

  /// Rebuild a handle from [`Quantal::into_raw`].
  ///
  /// # Safety
  ///
  /// `director` must come from `into_raw` of a live, undestroyed handle.
  pub unsafe fn from_raw(director: *mut Director) -> Option<Self> {
    NonNull::new(director).map(|director| Self { director })
  }

  pub fn into_raw(self) -> *mut Director {
    self.director.as_ptr()
  }

  #[inline(always)]
  fn director(&self) -> &Director {
    unsafe { self.director.as_ref() }
  }

  /// True when this heap lives in a named shared-memory object.
  pub fn is_shared(&self) -> bool {
    self.director().is_shared()
  }

  /// Current user reference.
  pub fn reference(&self) -> *mut u8 {
    self.director().reference() as *mut u8
  }

  /// Conditionally swap the user reference; true on success.
  pub fn set_reference(&self, old: *mut u8, new: *mut u8) -> bool {
    self.director().set_reference(old as usize, new as usize)
  }

  /// A block of at least `size` bytes, or null. Blocks are size-aligned
  /// up to the slab alignment and recycled by `deallocate`.
  pub fn allocate(&self, size: usize) -> *mut u8 {
    self.director().allocate(size).unwrap_or(0) as *mut u8
  }

  /// Recycle a block. Null or unmanaged addresses do nothing.
  pub fn deallocate(&self, address: *mut u8) {
    self.director().deallocate(address as usize);
  }

  /// Resize a block, preserving content. Returns null and leaves the old
  /// block intact when the new block cannot be allocated.
  pub fn reallocate(&self, address: *mut u8, size: usize) -> *mut u8 {
    self
      .director()
      .reallocate(address as usize, size)
      .unwrap_or(0) as *mut u8
  }

  /// Zero a block's full extent.
  pub fn clear(&self, address: *mut u8) {
    self.director().clear(address as usize);
  }

  /// Allocated size of the block, zero for null or unmanaged addresses.
  pub fn size(&self, address: *mut u8) -> usize {
    self.director().allocation_size(address as usize)
  }

  /// Block base from any interior pointer, or null.
  pub fn base(&self, address: *mut u8) -> *mut u8 {
    self.director().allocation_base(address as usize) as *mut u8
  }

  /// Per-allocation side data, or null when none is configured.
  pub fn side_data(&self, address: *mut u8) -> *mut u8 {
    self
      .director()
      .allocation_side_data(address as usize)
      .unwrap_or(0) as *mut u8
  }

  /// Walk live allocations: start from null, feed results back, null
  /// ends the walk. Results may be concurrently deallocated; use them
  /// for queries, not access.
  pub fn next(&self, address: *mut u8) -> *mut u8 {
    let previous = (!address.is_null()).then_some(address as usize);

    self.director().next_allocation(previous).unwrap_or(0) as *mut u8
  }

  /// Sample allocation counts and byte totals per size order.
  pub fn stats(&self, counts: &mut [u64; STATS_SIZE], sizes: &mut [u64; STATS_SIZE]) {
    self.director().stats(counts, sizes);
  }

  /// Fill `addresses` with blocks of `size` bytes; contiguous requests
  /// succeed whole or not at all. Returns the number allocated.
  pub fn allocate_bulk(&self, size: usize, addresses: &mut [*mut u8], contiguous: bool) -> usize {
    self
      .director()
      .allocate_bulk(size, as_address_slice(addresses), contiguous)
  }

  /// Recycle blocks en masse; cheaper than one-by-one deallocation.
  pub fn deallocate_bulk(&self, addresses: &[*mut u8]) {
    let addresses =
      unsafe { core::slice::from_raw_parts(addresses.as_ptr() as *const usize, addresses.len()) };

    self.director().deallocate_bulk(addresses);
  }

  /// `count` consecutive blocks of power-of-two `size`; the first block's
  /// address. Pair with `deallocate_count`.
  pub fn allocate_count(&self, size: usize, count: usize) -> *mut u8 {
    self
      .director()
      .allocate_count(size, count)
      .unwrap_or(0) as *mut u8
  }

  pub fn deallocate_count(&self, address: *mut u8, _size: usize, count: usize) {
    self.director().deallocate_count(address as usize, count);
  }

  /// Allocate with bounded interior fragmentation; `degree` 1 to 4 halves
  /// the expected waste per step. Pair with `deallocate_fit`.
  pub fn allocate_fit(&self, size: usize, degree: u32) -> *mut u8 {
    self.director().allocate_fit(size, degree).unwrap_or(0) as *mut u8
  }

  pub fn deallocate_fit(&self, address: *mut u8, size: usize, degree: u32) {
    self.director().deallocate_fit(address as usize, size, degree);
  }
}

#[inline(always)]
fn as_address_slice(addresses: &mut [*mut u8]) -> &mut [usize] {
  // Pointer and usize share layout; the buffer is only written.
  unsafe { core::slice::from_raw_parts_mut(addresses.as_mut_ptr() as *mut usize, addresses.len()) }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_version_packing() {
    assert_eq!(version(), (VERSION_MAJOR << 8) | VERSION_MINOR);
    assert_eq!(version() & 0xFF, VERSION_MINOR);
    assert_eq!((version() >> 8) & 0xFF, VERSION_MAJOR);
    assert_eq!((version() >> 16) & 0xFF, VERSION_RELEASE);
    assert!(VERSION_STRING.starts_with("quantal"));
  }
}
