//! A quantum allocator owns a span of equal-size partition slots and
//! brings them online lazily, one quantum order at a time. Eight order
//! registries track which slots currently serve which order; an empty
//! slot can be taken offline and re-specialized when its order runs dry.

use core::ptr::NonNull;

use quantal_bits::{
  size_of_order,
  size_to_order,
};
use quantal_registry::{
  Registry,
  full_fence,
};
use quantal_sys::{
  GLOBAL_SYSTEM,
  system::System,
};

use crate::{
  MAX_QUANTUM_ORDERS,
  Space,
  partition::Partition,
  roster::{
    Header,
    Kind,
    Roster,
  },
};

#[repr(C)]
pub struct QuantumAllocator {
  header: Header,
  sharing: bool,
  roster: NonNull<Roster>,
  partition_order: u32,
  partition_count: usize,
  partitions: NonNull<Partition>,
  side_data_size: usize,
  side_data: usize,
  partition_registry: Registry,
  order_registries: [Registry; MAX_QUANTUM_ORDERS as usize],
}

unsafe impl Send for QuantumAllocator {}
unsafe impl Sync for QuantumAllocator {}

impl QuantumAllocator {
  #[allow(clippy::too_many_arguments)]
  pub fn new(
    sharing: bool,
    roster: NonNull<Roster>,
    smallest_order: u32,
    largest_order: u32,
    partition_order: u32,
    partition_count: usize,
    base: usize,
    partitions: NonNull<Partition>,
    side_data_size: usize,
    side_data: usize,
  ) -> Self {
    Self {
      header: Header::new(
        Kind::Quantum,
        Space::new(base, partition_count << partition_order),
        smallest_order,
        largest_order,
      ),
      sharing,
      roster,
      partition_order,
      partition_count,
      partitions,
      side_data_size,
      side_data,
      partition_registry: Registry::new(partition_count),
      order_registries: core::array::from_fn(|_| Registry::new(partition_count)),
    }
  }

  #[inline(always)]
  pub fn contains(&self, address: usize) -> bool {
    self.header.contains(address)
  }

  #[inline(always)]
  pub const fn smallest_order(&self) -> u32 {
    self.header.smallest_order()
  }

  #[inline(always)]
  pub const fn largest_order(&self) -> u32 {
    self.header.largest_order()
  }

  #[inline(always)]
  const fn partition_size(&self) -> usize {
    1 << self.partition_order
  }

  #[inline(always)]
  fn base(&self) -> usize {
    self.header.space().base()
  }

  #[inline(always)]
  fn partition_base(&self, index: usize) -> usize {
    self.base() + (index << self.partition_order)
  }

  #[inline(always)]
  fn partition_index(&self, address: usize) -> usize {
    debug_assert!(self.contains(address), "address outside allocator");
    (address - self.base()) >> self.partition_order
  }

  #[inline(always)]
  fn partition(&self, index: usize) -> &Partition {
    debug_assert!(index < self.partition_count, "partition out of range");
    unsafe { &*self.partitions.as_ptr().add(index) }
  }

  /// Partition owning `address`, provided its slot is online. Addresses
  /// landing in a slot that was never specialized are not managed memory.
  fn partition_at(&self, address: usize) -> Option<&Partition> {
    let index = self.partition_index(address);

    if !self.partition_registry.is_set(index) {
      return None;
    }

    Some(self.partition(index))
  }

  #[inline(always)]
  fn order_index(&self, size: usize) -> usize {
    let order = size_to_order(size).max(self.smallest_order());
    debug_assert!(order <= self.largest_order(), "size outside allocator");

    (order - self.smallest_order()) as usize
  }

  /// Claim a free slot and commit its span. Shared reservations are
  /// file-backed and already writable.
  fn allocate_slot(&self) -> Option<usize> {
    let index = self.partition_registry.find_free()?;

    if !self.sharing {
      let committed =
        unsafe { GLOBAL_SYSTEM.commit(self.partition_base(index), self.partition_size()) };

      if committed.is_err() {
        self.partition_registry.free(index);
        return None;
      }
    }

    Some(index)
  }

  /// Construct the slot's partition in place for the order.
  fn new_partition(&self, index: usize, order_index: usize) -> &Partition {
    let quantum_size = size_of_order(self.smallest_order() + order_index as u32);

    let side_data = if self.side_data_size == 0 {
      0
    } else {
      self.side_data + self.side_data_size * index * crate::MAX_PARTITION_QUANTA
    };

    let partition = Partition::new(
      self.sharing,
      NonNull::from(self),
      NonNull::from(&self.order_registries[order_index]),
      index,
      self.partition_base(index),
      self.partition_size(),
      quantum_size,
      self.side_data_size,
      side_data,
    );

    unsafe { self.partitions.as_ptr().add(index).write(partition) };

    self.partition(index)
  }

  /// Publish a partition for its order: mark it online and short-circuit
  /// the roster so same-order requests skip this allocator.
  fn add_to_order(&self, order_index: usize, partition: &Partition, index: usize) {
    self.order_registries[order_index].set(index);

    unsafe { self.roster.as_ref() }.set(
      self.smallest_order() + order_index as u32,
      NonNull::from(partition).cast::<Header>(),
    );
  }

  /// Withdraw a slot from its order, restoring the roster to this
  /// allocator. True iff this caller won the offline transition.
  fn offline_partition(&self, index: usize, order_index: usize) -> bool {
    let cleared = self.order_registries[order_index].clear(index);

    unsafe { self.roster.as_ref() }.set(
      self.smallest_order() + order_index as u32,
      NonNull::from(self).cast::<Header>(),
    );

    cleared
  }

  /// Bring a fresh slot online for the order, or `None` when the slot
  /// pool is exhausted.
  fn new_order_partition(&self, order_index: usize) -> Option<&Partition> {
    let index = self.allocate_slot()?;
    let partition = self.new_partition(index, order_index);

    self.add_to_order(order_index, partition, index);

    Some(partition)
  }

  /// Scan high-to-low for an empty online partition, take it offline and
  /// re-specialize it for `order_index`. The emptiness re-probe after the
  /// offline transition pairs with the claim confirmation fence: a claim
  /// that slipped in is either visible to the probe (we put the partition
  /// back) or its claimer saw the offline bit and rolled back.
  fn free_up_partition(&self, order_index: usize) -> Option<&Partition> {
    for index in (0..self.partition_count).rev() {
      if !self.partition_registry.is_set(index) {
        continue;
      }

      let partition = self.partition(index);

      if !partition.is_empty() {
        continue;
      }

      // A slot claimed but not yet constructed reads as order zero; skip
      // anything outside this allocator's range.
      let order = partition.quantum_order();

      if order < self.smallest_order() || order > self.largest_order() {
        continue;
      }

      let current = (order - self.smallest_order()) as usize;

      if !self.offline_partition(index, current) {
        continue;
      }

      full_fence();

      if !partition.is_empty() {
        // Lost to an in-flight claim; put it back the way it was.
        self.order_registries[current].set(index);
        continue;
      }

      let partition = self.new_partition(index, order_index);
      self.add_to_order(order_index, partition, index);

      return Some(partition);
    }

    None
  }

  fn get_free_partition(&self, order_index: usize) -> Option<&Partition> {
    self
      .new_order_partition(order_index)
      .or_else(|| self.free_up_partition(order_index))
  }

  fn partitions_for(&self, size: usize, allocate_new: bool, continuous: bool) -> PartitionIter<'_> {
    let order_index = self.order_index(size);

    PartitionIter {
      allocator: self,
      order_index,
      indices: self.order_registries[order_index].iter_set(0),
      allocate_new,
      continuous,
    }
  }

  pub fn allocate(&self, size: usize) -> Option<usize> {
    let mut partitions = self.partitions_for(size, true, true);

    while let Some(partition) = partitions.next() {
      if let Some(address) = partition.allocate(size) {
        return Some(address);
      }
    }

    None
  }

  pub fn deallocate(&self, address: usize) {
    if let Some(partition) = self.partition_at(address) {
      partition.deallocate(address);
    }
  }

  pub fn allocate_count(&self, size: usize, count: usize) -> Option<usize> {
    if count > self.partition_size() >> size_to_order(size) {
      return None;
    }

    let mut partitions = self.partitions_for(size, true, true);

    while let Some(partition) = partitions.next() {
      if let Some(address) = partition.allocate_count(size, count) {
        return Some(address);
      }
    }

    None
  }

  pub fn deallocate_count(&self, address: usize, secure: bool, count: usize) {
    if let Some(partition) = self.partition_at(address) {
      partition.deallocate_count(address, secure, count);
    }
  }

  pub fn allocate_bulk(&self, size: usize, addresses: &mut [usize], contiguous: bool) -> usize {
    let count = addresses.len();
    let mut partitions = self.partitions_for(size, true, false);
    let mut allocated = 0;

    if contiguous {
      if count > self.partition_size() >> size_to_order(size) {
        return 0;
      }

      while allocated < count {
        let Some(partition) = partitions.next() else {
          break;
        };

        allocated += partition.allocate_bulk_contiguous(addresses);
      }
    } else {
      while allocated < count {
        let Some(partition) = partitions.next() else {
          break;
        };

        allocated += partition.allocate_bulk(&mut addresses[allocated..]);
      }
    }

    allocated
  }

  pub fn deallocate_bulk(&self, addresses: &[usize], secure: bool) -> usize {
    let mut deallocated = 0;

    while deallocated < addresses.len() {
      let address = addresses[deallocated];

      if !self.contains(address) {
        break;
      }

      let Some(partition) = self.partition_at(address) else {
        break;
      };

      let freed = partition.deallocate_bulk(&addresses[deallocated..], secure);

      if freed == 0 {
        break;
      }

      deallocated += freed;
    }

    deallocated
  }

  pub fn clear(&self, address: usize) {
    if let Some(partition) = self.partition_at(address) {
      partition.clear(address);
    }
  }

  pub fn allocation_size(&self, address: usize) -> usize {
    self
      .partition_at(address)
      .map_or(0, |partition| partition.allocation_size(address))
  }

  pub fn allocation_base(&self, address: usize) -> usize {
    self
      .partition_at(address)
      .map_or(0, |partition| partition.allocation_base(address))
  }

  pub fn allocation_side_data(&self, address: usize) -> Option<usize> {
    self.partition_at(address)?.allocation_side_data(address)
  }

  /// Walk live allocations partition by partition in address order.
  pub fn next_allocation(&self, address: Option<usize>) -> Option<usize> {
    let mut address = address.filter(|&address| self.contains(address));
    let start = address.map_or(0, |address| self.partition_index(address));

    for index in start..self.partition_count {
      if self.partition_registry.is_set(index) {
        if let Some(next) = self.partition(index).next_allocation(address) {
          return Some(next);
        }
      }

      address = None;
    }

    None
  }

  pub fn stats(&self, counts: &mut [u64], sizes: &mut [u64]) {
    sizes[1] += (core::mem::size_of::<Self>()
      + self.partition_count * core::mem::size_of::<Partition>()) as u64;

    for index in 0..self.partition_count {
      if self.partition_registry.is_set(index) {
        self.partition(index).stats(counts, sizes);
      }
    }
  }
}

/// Yields online partitions for one order, optionally extending the pool
/// when the registry runs out: once (`allocate_new`) or every time
/// (`continuous`).
struct PartitionIter<'a> {
  allocator: &'a QuantumAllocator,
  order_index: usize,
  indices: quantal_registry::SetIter<'a>,
  allocate_new: bool,
  continuous: bool,
}

impl<'a> PartitionIter<'a> {
  fn next(&mut self) -> Option<&'a Partition> {
    if let Some(index) = self.indices.next() {
      return Some(self.allocator.partition(index));
    }

    if self.allocate_new {
      if !self.continuous {
        self.allocate_new = false;
      }

      return self.allocator.get_free_partition(self.order_index);
    }

    None
  }
}
