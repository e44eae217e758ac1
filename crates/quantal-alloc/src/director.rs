//! Top-level coordination of a reserved region. The director owns the
//! roster, three quantum allocators and the slab allocator, lays them all
//! out inside its reservation with a two-pass arena walk, and dispatches
//! every request by size order or address range.

use core::{
  ptr::NonNull,
  sync::atomic::{
    AtomicUsize,
    Ordering,
  },
};

use quantal_bits::{
  MAX_ALLOCATION_ORDER,
  SMALLEST_SIZE_ORDER,
  round_up_pow2,
  size_of_order,
  size_to_order,
};
use quantal_fixed::{
  Arena,
  ArenaError,
};
use quantal_sys::{
  GLOBAL_SYSTEM,
  prim::page_align,
  shm,
  system::{
    self,
    SysError,
    System,
  },
};

use crate::{
  LARGEST_SIZE_ORDER,
  MAX_ALLOCATION_SIZE,
  MAX_FIT_DEGREE,
  MAX_ORDER,
  MAX_PARTITION_QUANTA,
  MAX_QUANTUM_ALLOCATORS,
  MAX_QUANTUM_ORDERS,
  MAX_SIDE_DATA,
  STATS_SIZE,
  Space,
  config::Config,
  fit::FitSize,
  partition::Partition,
  quantum::QuantumAllocator,
  roster::{
    AllocatorRef,
    Header,
    NullAllocator,
    Roster,
  },
  slab::{
    Slab,
    SlabAllocator,
  },
};

#[derive(Debug, PartialEq)]
pub enum DirectorError {
  InvalidConfiguration,
  OutOfAddressSpace,
}

pub type DirectorResult<T> = Result<T, DirectorError>;

impl From<SysError> for DirectorError {
  fn from(error: SysError) -> Self {
    match error {
      SysError::OutOfAddressSpace => DirectorError::OutOfAddressSpace,
      _ => DirectorError::InvalidConfiguration,
    }
  }
}

impl From<ArenaError> for DirectorError {
  fn from(_: ArenaError) -> Self {
    DirectorError::OutOfAddressSpace
  }
}

/// Fixed storage for the shared link name, NUL-padded.
struct LinkName {
  bytes: [u8; shm::MAX_LINK_NAME],
}

impl LinkName {
  fn new(name: Option<&str>) -> Self {
    let mut bytes = [0u8; shm::MAX_LINK_NAME];

    if let Some(name) = name {
      bytes[..name.len()].copy_from_slice(name.as_bytes());
    }

    Self { bytes }
  }

  fn get(&self) -> Option<&str> {
    let length = self.bytes.iter().position(|&b| b == 0).unwrap_or(0);

    if length == 0 {
      return None;
    }

    core::str::from_utf8(&self.bytes[..length]).ok()
  }
}

#[repr(C)]
pub struct Director {
  space: Space,
  sharing: bool,
  secure: bool,
  roster: NonNull<Roster>,
  quantum_allocators: [NonNull<QuantumAllocator>; MAX_QUANTUM_ALLOCATORS],
  slab_allocator: NonNull<SlabAllocator>,
  null_allocator: NullAllocator,
  reference: AtomicUsize,
  link_name: LinkName,
}

unsafe impl Send for Director {}
unsafe impl Sync for Director {}

#[inline(always)]
const fn smallest_order_of(allocator: usize) -> u32 {
  SMALLEST_SIZE_ORDER + allocator as u32 * MAX_QUANTUM_ORDERS
}

/// Partition size order: every allocator packs the maximum quantum count
/// per partition at its own smallest order.
#[inline(always)]
const fn partition_order_of(allocator: usize) -> u32 {
  size_to_order(MAX_PARTITION_QUANTA << smallest_order_of(allocator))
}

/// Lay the whole director out in `arena`. Run against a sizing arena the
/// walk only measures; run against the reservation with `creating` it
/// also constructs every component in place; run without `creating` it
/// re-derives the same addresses over an already-populated shared
/// mapping.
fn build(
  arena: &mut Arena,
  creating: bool,
  sharing: bool,
  config: &Config,
) -> DirectorResult<usize> {
  let counts = [
    config.small_partitions(),
    config.medium_partitions(),
    config.large_partitions(),
  ];

  // Quantum regions first, largest to smallest, so every region base is
  // aligned to its own partition size.
  let mut bases = [0usize; MAX_QUANTUM_ALLOCATORS];

  for i in (0..MAX_QUANTUM_ALLOCATORS).rev() {
    bases[i] = arena.alloc(counts[i] << partition_order_of(i))?;
  }

  // Everything after the regions is administrative and used immediately.
  if creating && !sharing {
    let admin = arena.alloc(0)?;
    unsafe { GLOBAL_SYSTEM.commit(admin, arena.size() - arena.allocated()) }?;
  }

  let roster = arena.place::<Roster>()?;

  if creating {
    unsafe { roster.write(Roster::new()) };
  }

  let mut quantum_allocators = [NonNull::<QuantumAllocator>::dangling(); MAX_QUANTUM_ALLOCATORS];

  for i in 0..MAX_QUANTUM_ALLOCATORS {
    let side_data = arena.alloc(counts[i] * config.side_data_size() * MAX_PARTITION_QUANTA)?;
    let partitions = arena.alloc(counts[i] * core::mem::size_of::<Partition>())? as *mut Partition;
    let allocator = arena.place::<QuantumAllocator>()?;

    if creating {
      let smallest = smallest_order_of(i);

      unsafe {
        allocator.write(QuantumAllocator::new(
          sharing,
          NonNull::new_unchecked(roster),
          smallest,
          smallest + MAX_QUANTUM_ORDERS - 1,
          partition_order_of(i),
          counts[i],
          bases[i],
          NonNull::new_unchecked(partitions),
          config.side_data_size(),
          side_data,
        ));
      }

      quantum_allocators[i] = unsafe { NonNull::new_unchecked(allocator) };
    }
  }

  let slabs = arena.alloc(config.max_slabs() * core::mem::size_of::<Slab>())? as *mut Slab;
  let slab_side_data = arena.alloc(config.max_slabs() * config.side_data_size())?;
  let slab_allocator = arena.place::<SlabAllocator>()?;

  if creating {
    unsafe {
      slab_allocator.write(SlabAllocator::new(
        config.secure(),
        config.max_slabs(),
        NonNull::new_unchecked(slabs),
        config.side_data_size(),
        slab_side_data,
      ));
    }
  }

  let director = arena.place::<Director>()?;

  if creating {
    unsafe {
      director.write(Director {
        space: Space::new(arena.base(), arena.size()),
        sharing,
        secure: config.secure(),
        roster: NonNull::new_unchecked(roster),
        quantum_allocators,
        slab_allocator: NonNull::new_unchecked(slab_allocator),
        null_allocator: NullAllocator::new(),
        reference: AtomicUsize::new(0),
        link_name: LinkName::new(config.link_name()),
      });

      (*director).install_roster();
    }
  }

  Ok(director as usize)
}

impl Director {
  /// Validate a configuration without touching the system.
  fn validate(config: &Config) -> DirectorResult<()> {
    let counts_valid = config.small_partitions() <= MAX_PARTITION_QUANTA
      && config.medium_partitions() <= MAX_PARTITION_QUANTA
      && config.large_partitions() <= MAX_PARTITION_QUANTA
      && config.max_slabs() <= MAX_PARTITION_QUANTA;

    let side_valid = config.side_data_size() <= MAX_SIDE_DATA;

    let address_valid = config.address() & (size_of_order(LARGEST_SIZE_ORDER) - 1) == 0;

    let link_valid = match config.link_name() {
      Some(name) => !name.is_empty() && name.len() < shm::MAX_LINK_NAME,
      None => true,
    };

    if counts_valid && side_valid && address_valid && link_valid {
      Ok(())
    } else {
      Err(DirectorError::InvalidConfiguration)
    }
  }

  /// Bytes required by `create` for this configuration, rounded to page
  /// size.
  pub fn create_size(config: &Config) -> DirectorResult<usize> {
    Self::validate(config)?;

    let mut sizing = Arena::sizing();
    build(&mut sizing, false, false, config)?;

    Ok(page_align(sizing.allocated()))
  }

  /// Create a director, or attach to one another process already created
  /// under the same link name and configuration.
  pub fn create(config: &Config) -> DirectorResult<NonNull<Director>> {
    Self::validate(config)?;

    let sharing = config.address() != 0 && config.link_name().is_some();

    // Slab reservations live outside the named object and cannot be
    // co-managed.
    if sharing && config.max_slabs() != 0 {
      return Err(DirectorError::InvalidConfiguration);
    }

    let mut sizing = Arena::sizing();
    build(&mut sizing, false, sharing, config)?;
    let size = page_align(sizing.allocated());

    if sharing {
      return Self::create_shared(config, size);
    }

    let base = if config.address() == 0 {
      unsafe { GLOBAL_SYSTEM.reserve_aligned(size, size_of_order(LARGEST_SIZE_ORDER)) }?
    } else {
      unsafe { GLOBAL_SYSTEM.reserve(size, config.address(), None) }?
    };

    let mut arena = Arena::new(base, size);
    let director = build(&mut arena, true, sharing, config)?;

    Ok(unsafe { NonNull::new_unchecked(director as *mut Director) })
  }

  fn create_shared(config: &Config, size: usize) -> DirectorResult<NonNull<Director>> {
    let name = config.link_name().ok_or(DirectorError::InvalidConfiguration)?;

    match shm::create(name) {
      Ok(fd) => {
        // Fresh object: size it, map it and lay out new metadata.
        if shm::truncate(fd, size).is_err() {
          shm::close(fd);
          let _ = shm::unlink(name);
          return Err(DirectorError::OutOfAddressSpace);
        }

        let reserved = unsafe { GLOBAL_SYSTEM.reserve(size, config.address(), Some(fd)) };
        shm::close(fd);

        let Ok(base) = reserved else {
          let _ = shm::unlink(name);
          return Err(DirectorError::OutOfAddressSpace);
        };

        let mut arena = Arena::new(base, size);
        let director = build(&mut arena, true, true, config)?;

        Ok(unsafe { NonNull::new_unchecked(director as *mut Director) })
      }
      Err(_) => {
        // Existing object: map at the identical address and re-derive
        // the component handles without reinitializing their state.
        let fd = shm::open(name)?;
        let mapped = unsafe { GLOBAL_SYSTEM.map_shared(size, config.address(), fd) };
        shm::close(fd);

        let mut arena = Arena::new(mapped?, size);
        let director = build(&mut arena, false, true, config)?;

        Ok(unsafe { NonNull::new_unchecked(director as *mut Director) })
      }
    }
  }

  /// Tear down unconditionally, releasing the entire reservation and any
  /// outstanding slab extents.
  ///
  /// # Safety
  ///
  /// `director` must come from `create` and must not be used afterwards
  /// by any thread.
  pub unsafe fn destroy(director: NonNull<Director>, unlink: bool) {
    let this = unsafe { director.as_ref() };

    this.slab_allocator().release();

    if unlink {
      if let Some(name) = this.link_name.get() {
        let _ = shm::unlink(name);
      }
    }

    let (base, size) = (this.space.base(), this.space.size());
    let _ = unsafe { GLOBAL_SYSTEM.release(base, size) };
  }

  fn install_roster(&self) {
    let roster = unsafe { self.roster.as_ref() };
    let null = NonNull::from(&self.null_allocator).cast::<Header>();

    roster.set_range(0, SMALLEST_SIZE_ORDER, null);

    for allocator in &self.quantum_allocators {
      let (smallest, largest) = unsafe {
        let allocator = allocator.as_ref();
        (allocator.smallest_order(), allocator.largest_order())
      };

      roster.set_range(smallest, largest + 1, allocator.cast::<Header>());
    }

    roster.set_range(
      LARGEST_SIZE_ORDER + 1,
      MAX_ALLOCATION_ORDER + 1,
      self.slab_allocator.cast::<Header>(),
    );
    roster.set_range(MAX_ALLOCATION_ORDER + 1, MAX_ORDER, null);
  }

  #[inline(always)]
  fn slab_allocator(&self) -> &SlabAllocator {
    unsafe { self.slab_allocator.as_ref() }
  }

  #[inline(always)]
  fn quantum_allocators(&self) -> impl Iterator<Item = &QuantumAllocator> {
    self
      .quantum_allocators
      .iter()
      .map(|allocator| unsafe { allocator.as_ref() })
  }

  #[inline(always)]
  fn component(&self, order: u32) -> AllocatorRef<'_> {
    unsafe { Header::classify(self.roster.as_ref().get(order)) }
  }

  /// True when the reservation is backed by a named shared object.
  pub const fn is_shared(&self) -> bool {
    self.sharing
  }

  pub fn reference(&self) -> usize {
    self.reference.load(Ordering::Acquire)
  }

  pub fn set_reference(&self, old: usize, new: usize) -> bool {
    self
      .reference
      .compare_exchange(old, new, Ordering::AcqRel, Ordering::Acquire)
      .is_ok()
  }

  /// Allocate at least `size` bytes, rounded up to a power of two. The
  /// roster names the component for the order; a published partition that
  /// comes up dry falls back to its managing quantum allocator.
  pub fn allocate(&self, size: usize) -> Option<usize> {
    if size > MAX_ALLOCATION_SIZE {
      return None;
    }

    let aligned = round_up_pow2(size);

    match self.component(size_to_order(aligned)) {
      AllocatorRef::Partition(partition) => partition.allocate(aligned).or_else(|| {
        unsafe { partition.manager().as_ref() }.allocate(aligned)
      }),
      AllocatorRef::Quantum(allocator) => allocator.allocate(aligned),
      AllocatorRef::Slab(slabs) => slabs.allocate(aligned),
      AllocatorRef::Null => None,
    }
  }

  /// Owner is found by address range; unmanaged addresses are a no-op.
  pub fn deallocate(&self, address: usize) {
    for allocator in self.quantum_allocators() {
      if allocator.contains(address) {
        if self.secure {
          allocator.clear(address);
        }

        allocator.deallocate(address);
        return;
      }
    }

    self.slab_allocator().deallocate(address);
  }

  /// Grow or shrink a block. The old block survives any failure; the
  /// address only changes when the content has been copied over.
  pub fn reallocate(&self, address: usize, size: usize) -> Option<usize> {
    if address == 0 {
      return self.allocate(size);
    }

    if size > MAX_ALLOCATION_SIZE {
      return None;
    }

    let old_size = self.allocation_size(address);
    let rounded = round_up_pow2(size);

    if old_size < rounded || size_to_order(size) < size_to_order(old_size) {
      let new_address = self.allocate(size)?;

      if old_size != 0 {
        unsafe { system::copy(address, new_address, old_size.min(rounded)) };
        self.deallocate(address);
      }

      return Some(new_address);
    }

    Some(address)
  }

  pub fn clear(&self, address: usize) {
    for allocator in self.quantum_allocators() {
      if allocator.contains(address) {
        allocator.clear(address);
        return;
      }
    }

    self.slab_allocator().clear(address);
  }

  /// `count` consecutive blocks of `size` bytes; the address of the
  /// first. Pairs with `deallocate_count`.
  pub fn allocate_count(&self, size: usize, count: usize) -> Option<usize> {
    if size > MAX_ALLOCATION_SIZE || count == 0 {
      return None;
    }

    let aligned = round_up_pow2(size);

    match self.component(size_to_order(aligned)) {
      AllocatorRef::Partition(partition) => {
        partition.allocate_count(aligned, count).or_else(|| {
          unsafe { partition.manager().as_ref() }.allocate_count(aligned, count)
        })
      }
      AllocatorRef::Quantum(allocator) => allocator.allocate_count(aligned, count),
      AllocatorRef::Slab(slabs) => slabs.allocate_count(aligned, count),
      AllocatorRef::Null => None,
    }
  }

  pub fn deallocate_count(&self, address: usize, count: usize) {
    for allocator in self.quantum_allocators() {
      if allocator.contains(address) {
        allocator.deallocate_count(address, self.secure, count);
        return;
      }
    }

    self.slab_allocator().deallocate_count(address);
  }

  /// Fill `addresses` with blocks of `size` bytes. Contiguous requests
  /// are all-or-nothing; sparse requests may fill a prefix. Returns the
  /// number allocated.
  pub fn allocate_bulk(&self, size: usize, addresses: &mut [usize], contiguous: bool) -> usize {
    if size > MAX_ALLOCATION_SIZE || addresses.is_empty() {
      return 0;
    }

    let order = size_to_order(size);

    for allocator in self.quantum_allocators() {
      if order <= allocator.largest_order() {
        return allocator.allocate_bulk(size, addresses, contiguous);
      }
    }

    if order <= MAX_ALLOCATION_ORDER {
      self.slab_allocator().allocate_bulk(size, addresses)
    } else {
      0
    }
  }

  /// Deallocate en masse, batching same-owner prefixes to amortize the
  /// registry writes. Null or unmanaged entries are skipped.
  pub fn deallocate_bulk(&self, addresses: &[usize]) {
    let mut deallocated = 0;

    while deallocated < addresses.len() {
      let first = addresses[deallocated];
      let rest = &addresses[deallocated..];
      let mut handled = 0;

      for allocator in self.quantum_allocators() {
        if allocator.contains(first) {
          handled = allocator.deallocate_bulk(rest, self.secure);
          break;
        }
      }

      if handled == 0 {
        self.slab_allocator().deallocate(first);
        handled = 1;
      }

      deallocated += handled;
    }
  }

  /// Fragmentation-bounded allocation; degree 1 matches `allocate`, each
  /// further degree halves the expected interior waste.
  pub fn allocate_fit(&self, size: usize, degree: u32) -> Option<usize> {
    if degree == 0 || degree > MAX_FIT_DEGREE || size > MAX_ALLOCATION_SIZE {
      return None;
    }

    let fit = FitSize::new(size, degree);

    self.allocate_count(fit.size(), fit.count())
  }

  pub fn deallocate_fit(&self, address: usize, size: usize, degree: u32) {
    if degree == 0 || degree > MAX_FIT_DEGREE {
      return;
    }

    let fit = FitSize::new(size, degree);

    self.deallocate_count(address, fit.count());
  }

  /// Allocated size of the block holding `address`, zero when unmanaged.
  pub fn allocation_size(&self, address: usize) -> usize {
    for allocator in self.quantum_allocators() {
      if allocator.contains(address) {
        return allocator.allocation_size(address);
      }
    }

    self.slab_allocator().allocation_size(address)
  }

  /// Block base from any interior address, zero when unmanaged.
  pub fn allocation_base(&self, address: usize) -> usize {
    for allocator in self.quantum_allocators() {
      if allocator.contains(address) {
        return allocator.allocation_base(address);
      }
    }

    self.slab_allocator().allocation_base(address)
  }

  pub fn allocation_side_data(&self, address: usize) -> Option<usize> {
    for allocator in self.quantum_allocators() {
      if allocator.contains(address) {
        return allocator.allocation_side_data(address);
      }
    }

    self.slab_allocator().allocation_side_data(address)
  }

  /// Walk every live allocation: start with `None`, feed each result
  /// back, stop at `None`. Results are stable handles for size and side
  /// data queries but may be concurrently deallocated.
  pub fn next_allocation(&self, address: Option<usize>) -> Option<usize> {
    let mut address = address;

    for allocator in self.quantum_allocators() {
      if address.is_none() || allocator.contains(address.unwrap()) {
        if let Some(next) = allocator.next_allocation(address) {
          return Some(next);
        }

        address = None;
      }
    }

    self.slab_allocator().next_allocation(address)
  }

  /// Sample the allocation census. Slot 0 sums slots 1 and up, slot 1 is
  /// administrative footprint, slots 3 through 48 count live allocations
  /// of that size order.
  pub fn stats(&self, counts: &mut [u64; STATS_SIZE], sizes: &mut [u64; STATS_SIZE]) {
    counts.fill(0);
    sizes.fill(0);

    counts[1] += 1;
    sizes[1] += core::mem::size_of::<Director>() as u64;

    for allocator in self.quantum_allocators() {
      allocator.stats(counts, sizes);
    }

    self.slab_allocator().stats(counts, sizes);

    counts[0] = counts[1..].iter().sum();
    sizes[0] = sizes[1..].iter().sum();
  }
}
