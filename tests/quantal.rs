use quantal::{
  Config,
  Quantal,
  STATS_SIZE,
};

const M: usize = 1024 * 1024;

fn order_of(size: usize) -> usize {
  size.max(8).next_power_of_two().trailing_zeros() as usize
}

#[test]
fn test_create_and_destroy() {
  let quantal = Quantal::create(&Config::new(false)).unwrap();
  quantal.destroy(false);

  let quantal = Quantal::create(&Config::new(false).partitions(8, 8, 8).slabs(1024)).unwrap();
  quantal.destroy(false);
}

#[test]
fn test_create_size_accounts_for_regions() {
  let config = Config::new(false).partitions(8, 8, 8).slabs(1024);
  let needed = Quantal::create_size(&config).unwrap();

  // Eight partitions per allocator: 128K, 32M and 8G spans.
  let regions = 8 * 128 * 1024 + 8 * 32 * M + 8 * 8 * 1024 * M;

  assert!(needed >= regions);
  assert!(needed < regions + 16 * M, "administrative overhead too large");
}

#[test]
fn test_invalid_configurations_are_rejected() {
  assert!(Quantal::create(&Config::new(false).partitions(16 * 1024 + 1, 8, 8)).is_err());
  assert!(Quantal::create(&Config::new(false).side_data(65)).is_err());
  assert!(Quantal::create_size(&Config::new(false).slabs(16 * 1024 + 1)).is_err());

  // A fixed address must be aligned to the largest quantum size.
  assert!(Quantal::create(&Config::new(false).at(0x1000)).is_err());

  // Slabs cannot live in a shared object.
  let shared = Config::new(false).shared(0x6100_0000_0000, "/quantal-test-invalid");
  assert!(Quantal::create(&shared).is_err());
}

#[test]
fn test_allocate_recycles_zeroed_memory() {
  let quantal = Quantal::create(&Config::new(true)).unwrap();

  let first = quantal.allocate(8);
  assert!(!first.is_null());

  unsafe {
    assert_eq!((first as *const u64).read(), 0);
    first.write_bytes(0xFF, 8);
    assert_eq!((first as *const u64).read(), u64::MAX);
  }

  quantal.deallocate(first);

  let second = quantal.allocate(8);
  assert_eq!(second, first, "lowest address not recycled");

  unsafe {
    assert_eq!((second as *const u64).read(), 0, "recycled block not zeroed");
  }

  let third = quantal.allocate(8);
  assert_ne!(third, second);

  quantal.deallocate(second);
  quantal.deallocate(third);
  quantal.destroy(false);
}

#[test]
fn test_allocate_every_order() {
  let quantal = Quantal::create(&Config::new(false)).unwrap();

  for size in 0..64 {
    let address = quantal.allocate(size);
    assert!(!address.is_null(), "no allocation for {size}");
    quantal.deallocate(address);
  }

  let mut size = 1;
  while size <= 128 * M {
    let address = quantal.allocate(size);
    assert!(!address.is_null(), "no allocation for {size}");

    let allocated = quantal.size(address);
    assert!(allocated >= size.max(8));
    assert_eq!(allocated, size.max(8).next_power_of_two());

    // Blocks are size-aligned up to the slab alignment.
    assert_eq!(address as usize % allocated.min(64 * M), 0);

    quantal.deallocate(address);
    size <<= 1;
  }

  quantal.destroy(false);
}

#[test]
fn test_base_from_interior_pointers() {
  let quantal = Quantal::create(&Config::new(false)).unwrap();

  let address = quantal.allocate(1024);

  for offset in 0..1024 {
    assert_eq!(quantal.base(unsafe { address.add(offset) }), address);
  }

  quantal.deallocate(address);
  quantal.destroy(false);
}

#[test]
fn test_reallocate_shrink_in_place() {
  let quantal = Quantal::create(&Config::new(false)).unwrap();

  let address = quantal.allocate(8);
  assert_eq!(quantal.reallocate(address, 7), address);

  quantal.deallocate(address);
  quantal.destroy(false);
}

#[test]
fn test_reallocate_grow_preserves_content() {
  let quantal = Quantal::create(&Config::new(true)).unwrap();

  let address = quantal.allocate(8);
  unsafe { address.write_bytes(0xFF, 8) };

  let grown = quantal.reallocate(address, 9);
  assert_ne!(grown, address);
  assert!(quantal.size(grown) >= 9);

  unsafe {
    assert_eq!((grown as *const u64).read(), u64::MAX, "content not copied");
  }

  quantal.deallocate(grown);
  quantal.destroy(false);
}

#[test]
fn test_reallocate_order_shrink_moves() {
  let quantal = Quantal::create(&Config::new(true)).unwrap();

  let address = quantal.allocate(1024);
  unsafe { address.write_bytes(0xAB, 8) };

  let shrunk = quantal.reallocate(address, 8);
  assert_ne!(shrunk, address);
  assert_eq!(quantal.size(shrunk), 8);

  unsafe {
    assert_eq!((shrunk as *const u8).read(), 0xAB);
  }

  // The old block went back; its space is allocatable again.
  assert_eq!(quantal.allocate(1024), address);

  quantal.destroy(false);
}

#[test]
fn test_reallocate_null_allocates() {
  let quantal = Quantal::create(&Config::new(false)).unwrap();

  let address = quantal.reallocate(core::ptr::null_mut(), 100);
  assert!(!address.is_null());
  assert!(quantal.size(address) >= 100);

  quantal.deallocate(address);
  quantal.destroy(false);
}

#[test]
fn test_clear_zeroes_whole_block() {
  let quantal = Quantal::create(&Config::new(false)).unwrap();

  let size = 1024;
  let address = quantal.allocate(size);

  unsafe {
    address.write_bytes(0xFF, size);
    quantal.clear(address);
    assert_eq!((address as *const u64).read(), 0);
    assert_eq!((address.add(size - 8) as *const u64).read(), 0);
  }

  quantal.deallocate(address);
  quantal.destroy(false);
}

#[test]
fn test_invalid_addresses_are_no_ops() {
  let quantal = Quantal::create(&Config::new(false)).unwrap();

  quantal.deallocate(core::ptr::null_mut());
  quantal.clear(core::ptr::null_mut());

  assert_eq!(quantal.size(core::ptr::null_mut()), 0);
  assert!(quantal.base(core::ptr::null_mut()).is_null());
  assert!(quantal.side_data(core::ptr::null_mut()).is_null());
  assert!(quantal.next(core::ptr::null_mut()).is_null());

  // An address far outside the reservation.
  let outside = 0x10_0000 as *mut u8;
  quantal.deallocate(outside);
  assert_eq!(quantal.size(outside), 0);
  assert!(quantal.base(outside).is_null());

  quantal.destroy(false);
}

#[test]
fn test_side_data_round_trip() {
  let quantal = Quantal::create(&Config::new(false).partitions(8, 8, 8).side_data(8)).unwrap();

  let first = quantal.allocate(1024);
  let second = quantal.allocate(1024);

  let side = quantal.side_data(first);
  assert!(!side.is_null());

  unsafe { (side as *mut u64).write(0x12345678) };
  assert_eq!(unsafe { (quantal.side_data(first) as *const u64).read() }, 0x12345678);

  // Interior pointers resolve to the same slot; neighbors do not.
  assert_eq!(quantal.side_data(unsafe { first.add(100) }), side);
  assert_ne!(quantal.side_data(second), side);

  quantal.deallocate(first);
  quantal.deallocate(second);
  quantal.destroy(false);
}

#[test]
fn test_next_walks_every_allocation() {
  let quantal = Quantal::create(&Config::new(false)).unwrap();

  let mut expected = vec![
    quantal.allocate(8),
    quantal.allocate(1024),
    quantal.allocate(64 * 1024),
  ];

  let mut seen = Vec::new();
  let mut address = quantal.next(core::ptr::null_mut());

  while !address.is_null() {
    seen.push(address);
    address = quantal.next(address);
  }

  expected.sort();
  seen.sort();
  assert_eq!(seen, expected);

  for address in expected {
    quantal.deallocate(address);
  }

  assert!(quantal.next(core::ptr::null_mut()).is_null());
  quantal.destroy(false);
}

#[test]
fn test_stats_round_trip() {
  let quantal = Quantal::create(&Config::new(false)).unwrap();

  let first = quantal.allocate(1024);
  let second = quantal.allocate(1024);

  let mut counts = [0u64; STATS_SIZE];
  let mut sizes = [0u64; STATS_SIZE];
  quantal.stats(&mut counts, &mut sizes);

  assert_eq!(counts[order_of(1024)], 2);
  assert_eq!(sizes[order_of(1024)], 2048);
  assert!(sizes[1] > 0, "administrative slot empty");
  assert_eq!(counts[0], counts[1..].iter().sum::<u64>());

  quantal.deallocate(first);
  quantal.deallocate(second);

  quantal.stats(&mut counts, &mut sizes);
  assert_eq!(counts[order_of(1024)], 0);
  assert_eq!(sizes[order_of(1024)], 0);

  quantal.destroy(false);
}

#[test]
fn test_bulk_contiguous() {
  let quantal = Quantal::create(&Config::new(false)).unwrap();

  let mut addresses = [core::ptr::null_mut(); 8];
  let allocated = quantal.allocate_bulk(16, &mut addresses, true);

  assert_eq!(allocated, 8);

  for i in 1..8 {
    assert_eq!(addresses[i] as usize, addresses[i - 1] as usize + 16);
  }

  quantal.deallocate_bulk(&addresses);

  let mut counts = [0u64; STATS_SIZE];
  let mut sizes = [0u64; STATS_SIZE];
  quantal.stats(&mut counts, &mut sizes);
  assert_eq!(counts[order_of(16)], 0);

  quantal.destroy(false);
}

#[test]
fn test_bulk_sparse() {
  let quantal = Quantal::create(&Config::new(false)).unwrap();

  let mut addresses = [core::ptr::null_mut(); 16];
  let allocated = quantal.allocate_bulk(16, &mut addresses, false);
  assert_eq!(allocated, 16);

  // Ascending, distinct, properly sized.
  for i in 1..16 {
    assert!(addresses[i] > addresses[i - 1]);
  }
  for address in addresses {
    assert_eq!(quantal.size(address), 16);
  }

  quantal.deallocate_bulk(&addresses);

  let mut counts = [0u64; STATS_SIZE];
  let mut sizes = [0u64; STATS_SIZE];
  quantal.stats(&mut counts, &mut sizes);
  assert_eq!(counts[order_of(16)], 0);

  quantal.destroy(false);
}

#[test]
fn test_count_allocation_round_trip() {
  let quantal = Quantal::create(&Config::new(false)).unwrap();

  let address = quantal.allocate_count(16, 4);
  assert!(!address.is_null());

  quantal.deallocate_count(address, 16, 4);

  let mut counts = [0u64; STATS_SIZE];
  let mut sizes = [0u64; STATS_SIZE];
  quantal.stats(&mut counts, &mut sizes);
  assert_eq!(counts[order_of(16)], 0);

  quantal.destroy(false);
}

#[test]
fn test_fit_allocation_reduces_waste() {
  let quantal = Quantal::create(&Config::new(false)).unwrap();

  // 48 bytes at degree 4 becomes three contiguous 16-byte quanta.
  let address = quantal.allocate_fit(48, 4);
  assert!(!address.is_null());

  let mut counts = [0u64; STATS_SIZE];
  let mut sizes = [0u64; STATS_SIZE];
  quantal.stats(&mut counts, &mut sizes);
  assert_eq!(counts[order_of(16)], 3);

  quantal.deallocate_fit(address, 48, 4);

  quantal.stats(&mut counts, &mut sizes);
  assert_eq!(counts[order_of(16)], 0);

  // Degrees outside 1..=4 are rejected before any side effect.
  assert!(quantal.allocate_fit(48, 0).is_null());
  assert!(quantal.allocate_fit(48, 5).is_null());

  quantal.destroy(false);
}

#[test]
fn test_slab_allocation_and_recycling() {
  let quantal = Quantal::create(&Config::new(false)).unwrap();

  let size = 128 * M;
  let address = quantal.allocate(size);
  assert!(!address.is_null());
  assert_eq!(quantal.size(address), size);
  assert_eq!(address as usize % (64 * M), 0);
  assert_eq!(quantal.base(unsafe { address.add(size - 1) }), address);

  quantal.deallocate(address);

  // The reservation is kept and reused for an equal-size request.
  let again = quantal.allocate(size);
  assert_eq!(again, address);

  quantal.deallocate(again);
  quantal.destroy(false);
}

#[test]
fn test_user_reference_swaps_conditionally() {
  let quantal = Quantal::create(&Config::new(false)).unwrap();

  assert!(quantal.reference().is_null());

  let first = 0x1000 as *mut u8;
  let second = 0x2000 as *mut u8;

  assert!(quantal.set_reference(core::ptr::null_mut(), first));
  assert_eq!(quantal.reference(), first);

  assert!(!quantal.set_reference(core::ptr::null_mut(), second));
  assert!(quantal.set_reference(first, second));
  assert_eq!(quantal.reference(), second);

  quantal.destroy(false);
}

#[test]
fn test_version() {
  assert_eq!(quantal::version() & 0xFF, quantal::VERSION_MINOR);
  assert!(!quantal::VERSION_STRING.is_empty());
}

#[test]
fn test_concurrent_allocation_is_disjoint() {
  use std::collections::HashSet;

  let quantal = Quantal::create(&Config::new(false)).unwrap();
  let threads = 4;
  let per_thread = 2048;

  let all: Vec<Vec<usize>> = std::thread::scope(|scope| {
    let handles: Vec<_> = (0..threads)
      .map(|_| {
        scope.spawn(|| {
          let mut local = Vec::with_capacity(per_thread);

          for _ in 0..per_thread {
            let address = quantal.allocate(64);
            assert!(!address.is_null());
            local.push(address as usize);
          }

          // Churn: free half, allocate again.
          for chunk in local.chunks(2) {
            quantal.deallocate(chunk[0] as *mut u8);
          }
          for slot in local.iter_mut().step_by(2) {
            let address = quantal.allocate(64);
            assert!(!address.is_null());
            *slot = address as usize;
          }

          local
        })
      })
      .collect();

    handles.into_iter().map(|h| h.join().unwrap()).collect()
  });

  let mut seen = HashSet::new();
  for local in &all {
    for &address in local {
      assert!(seen.insert(address), "address {address:#x} handed out twice");
      assert_eq!(address % 64, 0);
    }
  }

  for local in &all {
    for &address in local {
      quantal.deallocate(address as *mut u8);
    }
  }

  let mut counts = [0u64; STATS_SIZE];
  let mut sizes = [0u64; STATS_SIZE];
  quantal.stats(&mut counts, &mut sizes);
  assert_eq!(counts[order_of(64)], 0);

  quantal.destroy(false);
}

#[cfg(any(target_os = "linux", target_os = "macos"))]
#[test]
fn test_shared_create_and_attach() {
  let name = format!("/quantal-test-{}", std::process::id());
  let address = 0x6100_0000_0000usize;

  let config = Config::new(false)
    .partitions(1, 0, 0)
    .slabs(0)
    .shared(address, &name);

  let creator = Quantal::create(&config).unwrap();
  assert!(creator.is_shared());

  let block = creator.allocate(8);
  assert!(!block.is_null());
  unsafe { (block as *mut u64).write(0xFEED) };

  // A second create under the same name attaches to the same heap.
  let attached = Quantal::create(&config).unwrap();

  assert_eq!(attached.size(block), 8);
  assert_eq!(unsafe { (block as *const u64).read() }, 0xFEED);

  let other = attached.allocate(8);
  assert_ne!(other, block, "attached instance reissued a live block");

  attached.deallocate(block);
  attached.deallocate(other);

  // One teardown releases the mapping and the name.
  core::mem::forget(creator);
  attached.destroy(true);
}
