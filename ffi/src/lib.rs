#![no_std]

//! C ABI over the allocator. Every function is a thin marshalling shim:
//! handles are raw director pointers, errors are null or zero, and no
//! call panics across the boundary.

use core::ffi::{
  CStr,
  c_char,
};

use quantal::{
  Config,
  Director,
  Quantal,
  STATS_SIZE,
  VERSION_STRING,
};

mod handler;

/// Opaque allocator handle for C callers.
#[allow(non_camel_case_types)]
pub type quantal_t = Director;

const VERSION_CSTRING: &[u8] = b"quantal 0.1.0 experimental\0";

const _: () = assert!(VERSION_CSTRING.len() == VERSION_STRING.len() + 1);

#[inline]
fn handle(qta: *mut quantal_t) -> Option<Quantal> {
  unsafe { Quantal::from_raw(qta) }
}

#[unsafe(no_mangle)]
pub extern "C" fn quantal_version() -> u32 {
  quantal::version()
}

#[unsafe(no_mangle)]
pub extern "C" fn quantal_version_string() -> *const c_char {
  VERSION_CSTRING.as_ptr() as *const c_char
}

fn config_for<'a>(
  address: usize,
  link_name: Option<&'a str>,
  secure: bool,
  small_partitions: i32,
  medium_partitions: i32,
  large_partitions: i32,
  max_slabs: i32,
  side_data_size: i32,
) -> Option<Config<'a>> {
  if small_partitions < 0
    || medium_partitions < 0
    || large_partitions < 0
    || max_slabs < 0
    || side_data_size < 0
  {
    return None;
  }

  let mut config = Config::new(secure)
    .partitions(
      small_partitions as usize,
      medium_partitions as usize,
      large_partitions as usize,
    )
    .slabs(max_slabs as usize)
    .side_data(side_data_size as usize);

  config = match link_name {
    Some(name) => config.shared(address, name),
    None => config.at(address),
  };

  Some(config)
}

#[unsafe(no_mangle)]
pub extern "C" fn quantal_create(
  address: usize,
  link_name: *const c_char,
  secure: bool,
  small_partitions: i32,
  medium_partitions: i32,
  large_partitions: i32,
  max_slabs: i32,
  side_data_size: i32,
) -> *mut quantal_t {
  let link_name = if link_name.is_null() {
    None
  } else {
    match unsafe { CStr::from_ptr(link_name) }.to_str() {
      Ok(name) if !name.is_empty() => Some(name),
      Ok(_) => None,
      Err(_) => return core::ptr::null_mut(),
    }
  };

  let Some(config) = config_for(
    address,
    link_name,
    secure,
    small_partitions,
    medium_partitions,
    large_partitions,
    max_slabs,
    side_data_size,
  ) else {
    return core::ptr::null_mut();
  };

  match Quantal::create(&config) {
    Ok(quantal) => quantal.into_raw(),
    Err(_) => core::ptr::null_mut(),
  }
}

#[unsafe(no_mangle)]
pub extern "C" fn quantal_create_size(
  secure: bool,
  small_partitions: i32,
  medium_partitions: i32,
  large_partitions: i32,
  max_slabs: i32,
  side_data_size: i32,
) -> usize {
  let Some(config) = config_for(
    0,
    None,
    secure,
    small_partitions,
    medium_partitions,
    large_partitions,
    max_slabs,
    side_data_size,
  ) else {
    return 0;
  };

  Quantal::create_size(&config).unwrap_or(0)
}

#[unsafe(no_mangle)]
pub extern "C" fn quantal_destroy(qta: *mut quantal_t, unlink: bool) {
  if let Some(quantal) = handle(qta) {
    quantal.destroy(unlink);
  }
}

#[unsafe(no_mangle)]
pub extern "C" fn quantal_get_reference(qta: *mut quantal_t) -> *mut u8 {
  handle(qta).map_or(core::ptr::null_mut(), |quantal| quantal.reference())
}

#[unsafe(no_mangle)]
pub extern "C" fn quantal_set_reference(
  qta: *mut quantal_t,
  old_value: *mut u8,
  new_value: *mut u8,
) -> bool {
  handle(qta).is_some_and(|quantal| quantal.set_reference(old_value, new_value))
}

#[unsafe(no_mangle)]
pub extern "C" fn quantal_allocate(qta: *mut quantal_t, size: u64) -> *mut u8 {
  handle(qta).map_or(core::ptr::null_mut(), |quantal| {
    quantal.allocate(size as usize)
  })
}

#[unsafe(no_mangle)]
pub extern "C" fn quantal_deallocate(qta: *mut quantal_t, address: *mut u8) {
  if let Some(quantal) = handle(qta) {
    quantal.deallocate(address);
  }
}

#[unsafe(no_mangle)]
pub extern "C" fn quantal_reallocate(
  qta: *mut quantal_t,
  address: *mut u8,
  size: u64,
) -> *mut u8 {
  handle(qta).map_or(core::ptr::null_mut(), |quantal| {
    quantal.reallocate(address, size as usize)
  })
}

#[unsafe(no_mangle)]
pub extern "C" fn quantal_clear(qta: *mut quantal_t, address: *mut u8) {
  if let Some(quantal) = handle(qta) {
    quantal.clear(address);
  }
}

#[unsafe(no_mangle)]
pub extern "C" fn quantal_size(qta: *mut quantal_t, address: *mut u8) -> usize {
  handle(qta).map_or(0, |quantal| quantal.size(address))
}

#[unsafe(no_mangle)]
pub extern "C" fn quantal_base(qta: *mut quantal_t, address: *mut u8) -> *mut u8 {
  handle(qta).map_or(core::ptr::null_mut(), |quantal| quantal.base(address))
}

#[unsafe(no_mangle)]
pub extern "C" fn quantal_side_data(qta: *mut quantal_t, address: *mut u8) -> *mut u8 {
  handle(qta).map_or(core::ptr::null_mut(), |quantal| quantal.side_data(address))
}

#[unsafe(no_mangle)]
pub extern "C" fn quantal_next(qta: *mut quantal_t, address: *mut u8) -> *mut u8 {
  handle(qta).map_or(core::ptr::null_mut(), |quantal| quantal.next(address))
}

#[unsafe(no_mangle)]
pub extern "C" fn quantal_stats(qta: *mut quantal_t, counts: *mut u64, sizes: *mut u64) {
  let Some(quantal) = handle(qta) else {
    return;
  };

  if counts.is_null() || sizes.is_null() {
    return;
  }

  let counts = unsafe { &mut *(counts as *mut [u64; STATS_SIZE]) };
  let sizes = unsafe { &mut *(sizes as *mut [u64; STATS_SIZE]) };

  quantal.stats(counts, sizes);
}

#[unsafe(no_mangle)]
pub extern "C" fn quantal_allocate_bulk(
  qta: *mut quantal_t,
  size: u64,
  count: i32,
  addresses: *mut *mut u8,
  contiguous: bool,
) -> i32 {
  let Some(quantal) = handle(qta) else {
    return 0;
  };

  if count <= 0 || addresses.is_null() {
    return 0;
  }

  let addresses = unsafe { core::slice::from_raw_parts_mut(addresses, count as usize) };

  quantal.allocate_bulk(size as usize, addresses, contiguous) as i32
}

#[unsafe(no_mangle)]
pub extern "C" fn quantal_deallocate_bulk(
  qta: *mut quantal_t,
  count: i32,
  addresses: *mut *mut u8,
) {
  let Some(quantal) = handle(qta) else {
    return;
  };

  if count <= 0 || addresses.is_null() {
    return;
  }

  let addresses = unsafe { core::slice::from_raw_parts(addresses, count as usize) };

  quantal.deallocate_bulk(addresses);
}

#[unsafe(no_mangle)]
pub extern "C" fn quantal_allocate_count(
  qta: *mut quantal_t,
  size: u64,
  count: i32,
) -> *mut u8 {
  let Some(quantal) = handle(qta) else {
    return core::ptr::null_mut();
  };

  if count <= 0 {
    return core::ptr::null_mut();
  }

  quantal.allocate_count(size as usize, count as usize)
}

#[unsafe(no_mangle)]
pub extern "C" fn quantal_deallocate_count(
  qta: *mut quantal_t,
  address: *mut u8,
  size: u64,
  count: i32,
) {
  let Some(quantal) = handle(qta) else {
    return;
  };

  if count <= 0 {
    return;
  }

  quantal.deallocate_count(address, size as usize, count as usize);
}

#[unsafe(no_mangle)]
pub extern "C" fn quantal_allocate_fit(
  qta: *mut quantal_t,
  size: u64,
  degree: i32,
) -> *mut u8 {
  let Some(quantal) = handle(qta) else {
    return core::ptr::null_mut();
  };

  if degree <= 0 {
    return core::ptr::null_mut();
  }

  quantal.allocate_fit(size as usize, degree as u32)
}

#[unsafe(no_mangle)]
pub extern "C" fn quantal_deallocate_fit(
  qta: *mut quantal_t,
  address: *mut u8,
  size: u64,
  degree: i32,
) {
  let Some(quantal) = handle(qta) else {
    return;
  };

  if degree <= 0 {
    return;
  }

  quantal.deallocate_fit(address, size as usize, degree as u32);
}
