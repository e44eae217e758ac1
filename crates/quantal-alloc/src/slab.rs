//! One-up reservations for requests above the largest quantum. Slab slots
//! keep their virtual extent across deallocate/allocate pairs so a busy
//! size class amortizes the reservation cost.

use core::ptr::NonNull;

use quantal_bits::{
  M,
  round_up,
  size_to_order,
};
use quantal_registry::Registry;
use quantal_sys::{
  GLOBAL_SYSTEM,
  prim::SLAB_ALIGNMENT,
  system::System,
};

use crate::{
  LARGEST_SIZE_ORDER,
  Space,
  roster::{
    Header,
    Kind,
  },
};

#[derive(Clone, Copy, Debug, Default)]
pub struct Slab {
  space: Space,
}

impl Slab {
  pub const fn new(base: usize, size: usize) -> Self {
    Self {
      space: Space::new(base, size),
    }
  }

  #[inline(always)]
  pub const fn base(&self) -> usize {
    self.space.base()
  }

  #[inline(always)]
  pub const fn size(&self) -> usize {
    self.space.size()
  }

  #[inline(always)]
  pub const fn contains(&self, address: usize) -> bool {
    self.space.contains(address)
  }
}

#[repr(C)]
pub struct SlabAllocator {
  header: Header,
  secure: bool,
  max_count: usize,
  slabs: NonNull<Slab>,
  side_data_size: usize,
  side_data: usize,
  registry: Registry,
}

unsafe impl Send for SlabAllocator {}
unsafe impl Sync for SlabAllocator {}

impl SlabAllocator {
  pub fn new(
    secure: bool,
    max_count: usize,
    slabs: NonNull<Slab>,
    side_data_size: usize,
    side_data: usize,
  ) -> Self {
    Self {
      header: Header::new(
        Kind::Slab,
        Space::new(0, usize::MAX),
        LARGEST_SIZE_ORDER + 1,
        quantal_bits::MAX_ALLOCATION_ORDER,
      ),
      secure,
      max_count,
      slabs,
      side_data_size,
      side_data,
      registry: Registry::new(max_count),
    }
  }

  #[inline(always)]
  fn slab_ptr(&self, index: usize) -> *mut Slab {
    debug_assert!(index < self.max_count, "slab index out of range");
    unsafe { self.slabs.as_ptr().add(index) }
  }

  #[inline(always)]
  fn slab(&self, index: usize) -> Slab {
    unsafe { *self.slab_ptr(index) }
  }

  /// Slot holding `address`, by table scan.
  fn find(&self, address: usize) -> Option<usize> {
    if address == 0 {
      return None;
    }

    (0..self.max_count)
      .find(|&index| self.registry.is_set(index) && self.slab(index).contains(address))
  }

  /// Register a live extent in a free slot.
  fn record(&self, base: usize, size: usize) -> Option<usize> {
    let index = self.registry.find_free()?;

    unsafe { self.slab_ptr(index).write(Slab::new(base, size)) };

    Some(index)
  }

  /// Claim a slot and produce a committed extent of exactly `size` bytes,
  /// recycling the slot's previous reservation when it is big enough.
  /// Recycled extents are recommitted in secure mode, which resets them
  /// to zero pages.
  fn reserve(&self, size: usize) -> Option<usize> {
    let index = self.registry.find_free()?;
    let slab = self.slab(index);

    if slab.size() >= size {
      let base = slab.base();

      if self.secure && unsafe { GLOBAL_SYSTEM.commit(base, size) }.is_err() {
        self.registry.free(index);
        return None;
      }

      if slab.size() > size {
        let _ = unsafe { GLOBAL_SYSTEM.release(base + size, slab.size() - size) };
      }

      unsafe { self.slab_ptr(index).write(Slab::new(base, size)) };

      return Some(base);
    }

    if slab.size() != 0 {
      let _ = unsafe { GLOBAL_SYSTEM.release(slab.base(), slab.size()) };
      unsafe { self.slab_ptr(index).write(Slab::default()) };
    }

    let Ok(base) = (unsafe { GLOBAL_SYSTEM.reserve_aligned(size, SLAB_ALIGNMENT) }) else {
      self.registry.free(index);
      return None;
    };

    if unsafe { GLOBAL_SYSTEM.commit(base, size) }.is_err() {
      let _ = unsafe { GLOBAL_SYSTEM.release(base, size) };
      self.registry.free(index);
      return None;
    }

    unsafe { self.slab_ptr(index).write(Slab::new(base, size)) };

    Some(base)
  }

  /// Allocate a block of at least `size` bytes, rounded up to the
  /// megabyte.
  pub fn allocate(&self, size: usize) -> Option<usize> {
    self.reserve(round_up(size, M))
  }

  /// Free the slot but keep its reservation for recycling.
  pub fn deallocate(&self, address: usize) {
    if let Some(index) = self.find(address) {
      self.registry.free(index);
    }
  }

  pub fn clear(&self, address: usize) {
    if let Some(index) = self.find(address) {
      let slab = self.slab(index);

      unsafe { GLOBAL_SYSTEM.zero(slab.base(), slab.size(), false) };
    }
  }

  /// `count` blocks as one aggregate extent in a single slot.
  pub fn allocate_count(&self, size: usize, count: usize) -> Option<usize> {
    self.reserve(round_up(size.checked_mul(count)?, SLAB_ALIGNMENT))
  }

  /// Counted allocations release their aggregate reservation outright.
  pub fn deallocate_count(&self, address: usize) {
    if let Some(index) = self.find(address) {
      let slab = self.slab(index);

      let _ = unsafe { GLOBAL_SYSTEM.release(slab.base(), slab.size()) };
      unsafe { self.slab_ptr(index).write(Slab::default()) };

      self.registry.free(index);
    }
  }

  /// Reserve the aggregate in one call and split it across the table.
  pub fn allocate_bulk(&self, size: usize, addresses: &mut [usize]) -> usize {
    let count = addresses.len();
    let rounded = round_up(size, SLAB_ALIGNMENT);
    let Some(total) = rounded.checked_mul(count) else {
      return 0;
    };

    let Ok(base) = (unsafe { GLOBAL_SYSTEM.reserve_aligned(total, SLAB_ALIGNMENT) }) else {
      return 0;
    };

    if unsafe { GLOBAL_SYSTEM.commit(base, total) }.is_err() {
      let _ = unsafe { GLOBAL_SYSTEM.release(base, total) };
      return 0;
    }

    for (i, slot) in addresses.iter_mut().enumerate() {
      let address = base + i * rounded;

      if self.record(address, rounded).is_none() {
        let _ = unsafe { GLOBAL_SYSTEM.release(address, total - i * rounded) };
        return i;
      }

      *slot = address;
    }

    count
  }

  pub fn allocation_size(&self, address: usize) -> usize {
    self.find(address).map_or(0, |index| self.slab(index).size())
  }

  pub fn allocation_base(&self, address: usize) -> usize {
    self.find(address).map_or(0, |index| self.slab(index).base())
  }

  pub fn allocation_side_data(&self, address: usize) -> Option<usize> {
    if self.side_data_size == 0 {
      return None;
    }

    let index = self.find(address)?;

    Some(self.side_data + index * self.side_data_size)
  }

  /// Walk live slabs in table order.
  pub fn next_allocation(&self, address: Option<usize>) -> Option<usize> {
    let start = match address {
      Some(address) => self.find(address)? + 1,
      None => 0,
    };

    let index = self.registry.iter_set(start).next()?;

    Some(self.slab(index).base())
  }

  /// Release every outstanding reservation, live or recycled. Only for
  /// teardown.
  pub fn release(&self) {
    for index in 0..self.max_count {
      let slab = self.slab(index);

      if slab.size() != 0 {
        let _ = unsafe { GLOBAL_SYSTEM.release(slab.base(), slab.size()) };
        unsafe { self.slab_ptr(index).write(Slab::default()) };
      }
    }
  }

  pub fn stats(&self, counts: &mut [u64], sizes: &mut [u64]) {
    sizes[1] +=
      (core::mem::size_of::<Self>() + self.max_count * core::mem::size_of::<Slab>()) as u64;

    for index in self.registry.iter_set(0) {
      let size = self.slab(index).size();
      let order = size_to_order(size) as usize;

      counts[order] += 1;
      sizes[order] += size as u64;
    }
  }
}
