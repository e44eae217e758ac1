//! A partition serves one quantum order within a size-aligned span. Every
//! quantum address is `base + (index << order)`, so allocation is a free
//! bit claim and every pointer query is a shift.

use core::ptr::NonNull;

use quantal_bits::{
  low_zero_bit,
  size_of_order,
  size_to_order,
};
use quantal_registry::{
  BulkFree,
  Registry,
  full_fence,
};
use quantal_sys::{
  GLOBAL_SYSTEM,
  system::System,
};

use crate::{
  quantum::QuantumAllocator,
  roster::{
    Header,
    Kind,
  },
  Space,
};

#[repr(C)]
pub struct Partition {
  header: Header,
  sharing: bool,
  quantum_order: u32,
  /// Index of this partition in its manager's arrays and registries.
  slot: usize,
  manager: NonNull<QuantumAllocator>,
  /// Order registry this partition is published through while online.
  online: NonNull<Registry>,
  side_data_size: usize,
  side_data: usize,
  registry: Registry,
}

// Constructed inside the shared reservation; coordination is the registry.
unsafe impl Send for Partition {}
unsafe impl Sync for Partition {}

impl Partition {
  #[allow(clippy::too_many_arguments)]
  pub fn new(
    sharing: bool,
    manager: NonNull<QuantumAllocator>,
    online: NonNull<Registry>,
    slot: usize,
    base: usize,
    partition_size: usize,
    quantum_size: usize,
    side_data_size: usize,
    side_data: usize,
  ) -> Self {
    debug_assert!(quantal_bits::is_pow2(partition_size));
    debug_assert!(quantal_bits::is_pow2(quantum_size));

    let order = size_to_order(quantum_size);

    Self {
      header: Header::new(Kind::Partition, Space::new(base, partition_size), order, order),
      sharing,
      quantum_order: order,
      slot,
      manager,
      online,
      side_data_size,
      side_data,
      registry: Registry::new(partition_size >> order),
    }
  }

  #[inline(always)]
  pub fn contains(&self, address: usize) -> bool {
    self.header.contains(address)
  }

  #[inline(always)]
  pub const fn quantum_order(&self) -> u32 {
    self.quantum_order
  }

  #[inline(always)]
  pub const fn quantum_size(&self) -> usize {
    size_of_order(self.quantum_order)
  }

  #[inline(always)]
  pub fn manager(&self) -> NonNull<QuantumAllocator> {
    self.manager
  }

  #[inline(always)]
  fn base(&self) -> usize {
    self.header.space().base()
  }

  #[inline(always)]
  fn quantum_index(&self, address: usize) -> usize {
    debug_assert!(self.contains(address), "address outside partition");
    (address - self.base()) >> self.quantum_order
  }

  #[inline(always)]
  fn quantum_address(&self, index: usize) -> usize {
    self.base() + (index << self.quantum_order)
  }

  /// Speculative; a partition that looks empty must be taken offline and
  /// probed again before its emptiness can be trusted.
  #[inline]
  pub fn is_empty(&self) -> bool {
    self.registry.is_empty()
  }

  /// Claims linearize against the offline protocol here: set the bit,
  /// full fence, then confirm the partition is still published for its
  /// order. The offliner clears the publication bit, fences, then probes
  /// for emptiness — one of the two is guaranteed to see the other.
  fn confirm_claim(&self, index: usize, count: usize) -> bool {
    full_fence();

    if unsafe { self.online.as_ref() }.is_set(self.slot) {
      return true;
    }

    if count == 1 {
      self.registry.free(index);
    } else {
      self.registry.free_run(index, count);
    }

    false
  }

  /// Claim one quantum. Sizes above the quantum size are refused so a
  /// caller racing a re-specialization can never be handed an undersized
  /// block.
  pub fn allocate(&self, size: usize) -> Option<usize> {
    if size > self.quantum_size() {
      return None;
    }

    let index = self.registry.find_free()?;

    if !self.confirm_claim(index, 1) {
      return None;
    }

    Some(self.quantum_address(index))
  }

  pub fn deallocate(&self, address: usize) {
    let index = self.quantum_index(address);

    debug_assert!(self.registry.is_set(index), "double free");
    self.registry.free(index);
  }

  /// Claim `count` consecutive quanta; the address of the first, or
  /// `None`.
  pub fn allocate_count(&self, size: usize, count: usize) -> Option<usize> {
    if size > self.quantum_size() || count > self.registry.maximum() {
      return None;
    }

    let index = self.registry.find_free_run(count)?;

    if !self.confirm_claim(index, count) {
      return None;
    }

    Some(self.quantum_address(index))
  }

  pub fn deallocate_count(&self, address: usize, secure: bool, count: usize) {
    if secure {
      unsafe {
        GLOBAL_SYSTEM.zero(address, count << self.quantum_order, self.sharing);
      }
    }

    let index = self.quantum_index(address);

    debug_assert!(self.registry.is_set(index), "double free");
    self.registry.free_run(index, count);
  }

  /// Sparse bulk claim: flip whole registry words to held and emit the
  /// addresses of the bits the snapshot proves were free, ascending.
  /// Bits claimed past the end of the buffer go straight back.
  pub fn allocate_bulk(&self, addresses: &mut [usize]) -> usize {
    if addresses.is_empty() {
      return 0;
    }

    full_fence();
    if !unsafe { self.online.as_ref() }.is_set(self.slot) {
      return 0;
    }

    let registry = &self.registry;
    let mut allocated = 0;

    for word in registry.lowest_word()..registry.words() {
      let mut value = registry.claim_word(word);

      while value != usize::MAX {
        let lowest = low_zero_bit(value);
        let index = Registry::index_of(word, lowest.trailing_zeros());

        if index >= registry.maximum() || allocated == addresses.len() {
          break;
        }

        addresses[allocated] = self.quantum_address(index);
        allocated += 1;
        value |= lowest;
      }

      if value != usize::MAX {
        registry.clear_mask(word, !value);
        registry.update_lowest_word(word);
      }

      if allocated == addresses.len() {
        break;
      }
    }

    allocated
  }

  /// Contiguous bulk claim: all of `addresses` or nothing.
  pub fn allocate_bulk_contiguous(&self, addresses: &mut [usize]) -> usize {
    let count = addresses.len();

    let Some(index) = self.registry.find_free_run(count) else {
      return 0;
    };

    if !self.confirm_claim(index, count) {
      return 0;
    }

    for (i, address) in addresses.iter_mut().enumerate() {
      *address = self.quantum_address(index + i);
    }

    count
  }

  /// Free a prefix of `addresses` that lies in this partition, one atomic
  /// write per registry word. Returns how many were consumed.
  pub fn deallocate_bulk(&self, addresses: &[usize], secure: bool) -> usize {
    let mut bulk = BulkFree::new(&self.registry);
    let mut deallocated = 0;

    for &address in addresses {
      if !self.contains(address) {
        break;
      }

      if secure {
        unsafe {
          GLOBAL_SYSTEM.zero(self.allocation_base(address), self.quantum_size(), self.sharing);
        }
      }

      let index = self.quantum_index(address);
      debug_assert!(self.registry.is_set(index), "double free");

      bulk.clear(index);
      deallocated += 1;
    }

    deallocated
  }

  /// Zero the whole quantum containing `address`.
  pub fn clear(&self, address: usize) {
    unsafe {
      GLOBAL_SYSTEM.zero(self.allocation_base(address), self.quantum_size(), self.sharing);
    }
  }

  #[inline(always)]
  pub fn allocation_size(&self, _address: usize) -> usize {
    self.quantum_size()
  }

  /// Quanta are size-aligned, so the base is a mask away.
  #[inline(always)]
  pub fn allocation_base(&self, address: usize) -> usize {
    address & !(self.quantum_size() - 1)
  }

  pub fn allocation_side_data(&self, address: usize) -> Option<usize> {
    if self.side_data_size == 0 {
      return None;
    }

    Some(self.side_data + self.quantum_index(address) * self.side_data_size)
  }

  /// Next live quantum after `address`, or the first when `address` is
  /// `None`.
  pub fn next_allocation(&self, address: Option<usize>) -> Option<usize> {
    let start = match address {
      Some(address) => self.quantum_index(address) + 1,
      None => 0,
    };

    let index = self.registry.iter_set(start).next()?;

    Some(self.quantum_address(index))
  }

  pub fn stats(&self, counts: &mut [u64], sizes: &mut [u64]) {
    let count = self.registry.count() as u64;
    let order = self.quantum_order as usize;

    counts[order] += count;
    sizes[order] += count << order;
  }
}
