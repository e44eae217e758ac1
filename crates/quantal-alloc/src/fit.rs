//! Downsizing calculator for fragmentation-bounded allocation. Instead of
//! one power-of-two block averaging 25% interior waste, a request can be
//! served as several contiguous smaller quanta; each extra degree halves
//! the average waste, down to ~3.125% at degree 4.

use quantal_bits::{
  SMALLEST_SIZE_ORDER,
  size_of_order,
  size_to_order,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FitSize {
  size: usize,
  count: usize,
}

impl FitSize {
  pub fn new(size: usize, degree: u32) -> Self {
    let order = size_to_order(size);

    let low_order = order.saturating_sub(degree).max(SMALLEST_SIZE_ORDER);
    let scaled = (size + size_of_order(low_order) - 1) >> low_order;

    if scaled > 0 {
      let zeros = scaled.trailing_zeros();
      let count = scaled >> zeros;

      if count > 1 {
        return Self {
          size: size_of_order(low_order + zeros),
          count,
        };
      }
    }

    Self {
      size: size_of_order(order),
      count: 1,
    }
  }

  #[inline(always)]
  pub const fn size(&self) -> usize {
    self.size
  }

  #[inline(always)]
  pub const fn count(&self) -> usize {
    self.count
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_degree_one_is_plain_rounding() {
    assert_eq!(FitSize::new(48, 1), FitSize { size: 64, count: 1 });
    assert_eq!(FitSize::new(1024, 1), FitSize { size: 1024, count: 1 });
  }

  #[test]
  fn test_degree_four_eliminates_waste() {
    // 48 = 3 x 16 exactly, against 64 with 25% waste.
    assert_eq!(FitSize::new(48, 4), FitSize { size: 16, count: 3 });

    // 40 = 5 x 8 exactly.
    assert_eq!(FitSize::new(40, 4), FitSize { size: 8, count: 5 });
  }

  #[test]
  fn test_exact_powers_stay_single() {
    for order in 3..20 {
      let size = 1usize << order;

      for degree in 1..=4 {
        let fit = FitSize::new(size, degree);
        assert_eq!(fit.count(), 1, "size {size} degree {degree}");
        assert_eq!(fit.size(), size);
      }
    }
  }

  #[test]
  fn test_small_sizes_clip_to_smallest_order() {
    assert_eq!(FitSize::new(0, 4), FitSize { size: 8, count: 1 });
    assert_eq!(FitSize::new(7, 4), FitSize { size: 8, count: 1 });
    assert_eq!(FitSize::new(24, 4), FitSize { size: 8, count: 3 });
  }

  #[test]
  fn test_total_always_covers_request() {
    for size in 1..4096usize {
      for degree in 1..=4 {
        let fit = FitSize::new(size, degree);
        assert!(fit.size() * fit.count() >= size, "size {size} degree {degree}");

        let plain = quantal_bits::round_up_pow2(size.max(8));
        assert!(fit.size() * fit.count() <= plain, "size {size} degree {degree}");
      }
    }
  }
}
