//! Construction parameters for a director.

use getset::CopyGetters;

/// Shape of a director: backing location, partition pool sizes, slab
/// table size and per-allocation side data. The defaults suit a general
/// purpose heap; partition counts trade address space for capacity at
/// each size class.
#[derive(Clone, Copy, CopyGetters)]
#[getset(get_copy = "pub")]
pub struct Config<'a> {
  /// Fixed base address, or zero to let the system place the reservation.
  address: usize,
  /// Shared link name; with a nonzero address this selects sharing mode.
  link_name: Option<&'a str>,
  /// Zero deallocated memory before reuse.
  secure: bool,
  small_partitions: usize,
  medium_partitions: usize,
  large_partitions: usize,
  max_slabs: usize,
  side_data_size: usize,
}

impl<'a> Config<'a> {
  pub const fn new(secure: bool) -> Self {
    Self {
      address: 0,
      link_name: None,
      secure,
      small_partitions: 32,
      medium_partitions: 16,
      large_partitions: 8,
      max_slabs: 2048,
      side_data_size: 0,
    }
  }

  pub const fn partitions(mut self, small: usize, medium: usize, large: usize) -> Self {
    self.small_partitions = small;
    self.medium_partitions = medium;
    self.large_partitions = large;
    self
  }

  pub const fn slabs(mut self, max_slabs: usize) -> Self {
    self.max_slabs = max_slabs;
    self
  }

  pub const fn side_data(mut self, side_data_size: usize) -> Self {
    self.side_data_size = side_data_size;
    self
  }

  pub const fn shared(mut self, address: usize, link_name: &'a str) -> Self {
    self.address = address;
    self.link_name = Some(link_name);
    self
  }

  pub const fn at(mut self, address: usize) -> Self {
    self.address = address;
    self
  }
}
