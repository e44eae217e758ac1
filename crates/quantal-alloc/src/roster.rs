//! Per-order dispatch. The roster maps a size order to the component
//! currently serving it: a quantum allocator by default, a partition once
//! one has been published for that order, the slab allocator above the
//! largest quantum, and the null allocator outside the honored range.
//!
//! The component family is closed, so dispatch is a type tag embedded at
//! the front of every component rather than open polymorphism. Roster
//! entries are atomic pointers to that common header.

use core::{
  ptr::NonNull,
  sync::atomic::{
    AtomicPtr,
    Ordering,
  },
};

use crate::{
  MAX_ORDER,
  Space,
  partition::Partition,
  quantum::QuantumAllocator,
  slab::SlabAllocator,
};

#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Kind {
  Null = 0,
  Partition = 1,
  Quantum = 2,
  Slab = 3,
}

/// Common prefix of every component reachable through the roster. All
/// components are `#[repr(C)]` with this header first.
#[repr(C)]
pub struct Header {
  kind: Kind,
  smallest_order: u32,
  largest_order: u32,
  space: Space,
}

impl Header {
  pub const fn new(kind: Kind, space: Space, smallest_order: u32, largest_order: u32) -> Self {
    Self {
      kind,
      smallest_order,
      largest_order,
      space,
    }
  }

  #[inline(always)]
  pub const fn kind(&self) -> Kind {
    self.kind
  }

  #[inline(always)]
  pub const fn space(&self) -> &Space {
    &self.space
  }

  #[inline(always)]
  pub const fn smallest_order(&self) -> u32 {
    self.smallest_order
  }

  #[inline(always)]
  pub const fn largest_order(&self) -> u32 {
    self.largest_order
  }

  #[inline(always)]
  pub const fn contains(&self, address: usize) -> bool {
    self.space.contains(address)
  }

  /// Resolve the tag into a typed reference.
  ///
  /// # Safety
  ///
  /// `header` must point at the header of a live component whose concrete
  /// type matches its tag, valid for `'a`.
  pub unsafe fn classify<'a>(header: NonNull<Header>) -> AllocatorRef<'a> {
    match unsafe { header.as_ref() }.kind {
      Kind::Null => AllocatorRef::Null,
      Kind::Partition => AllocatorRef::Partition(unsafe { header.cast::<Partition>().as_ref() }),
      Kind::Quantum => AllocatorRef::Quantum(unsafe { header.cast::<QuantumAllocator>().as_ref() }),
      Kind::Slab => AllocatorRef::Slab(unsafe { header.cast::<SlabAllocator>().as_ref() }),
    }
  }
}

/// Typed view of a roster entry.
pub enum AllocatorRef<'a> {
  Null,
  Partition(&'a Partition),
  Quantum(&'a QuantumAllocator),
  Slab(&'a SlabAllocator),
}

/// Sink for orders outside the honored allocation range.
#[repr(C)]
pub struct NullAllocator {
  header: Header,
}

impl NullAllocator {
  pub const fn new() -> Self {
    Self {
      header: Header::new(Kind::Null, Space::new(0, 0), 0, 0),
    }
  }
}

impl Default for NullAllocator {
  fn default() -> Self {
    Self::new()
  }
}

pub struct Roster {
  entries: [AtomicPtr<Header>; MAX_ORDER as usize],
}

impl Roster {
  pub fn new() -> Self {
    Self {
      entries: [const { AtomicPtr::new(core::ptr::null_mut()) }; MAX_ORDER as usize],
    }
  }

  /// Current component for `order`. Entries are installed before the
  /// director is handed out, so a roster in service has no null entries.
  #[inline(always)]
  pub fn get(&self, order: u32) -> NonNull<Header> {
    debug_assert!(order < MAX_ORDER, "order out of range");

    let entry = self.entries[order as usize].load(Ordering::Acquire);
    debug_assert!(!entry.is_null(), "roster entry not installed");

    unsafe { NonNull::new_unchecked(entry) }
  }

  #[inline(always)]
  pub fn set(&self, order: u32, header: NonNull<Header>) {
    debug_assert!(order < MAX_ORDER, "order out of range");
    self.entries[order as usize].store(header.as_ptr(), Ordering::Release);
  }

  /// Assign `[low, high)` to one component.
  pub fn set_range(&self, low: u32, high: u32, header: NonNull<Header>) {
    for order in low..high {
      self.set(order, header);
    }
  }
}

impl Default for Roster {
  fn default() -> Self {
    Self::new()
  }
}
