#[cfg(any(target_os = "linux", target_os = "macos"))]
use crate::{
  prim::is_page_aligned,
  system::{
    SysError,
    SysResult,
    System,
  },
};

pub struct UnixSystem {}

#[cfg(any(target_os = "linux", target_os = "macos"))]
pub static UNIX_SYSTEM: UnixSystem = UnixSystem {};

#[cfg(any(target_os = "linux", target_os = "macos"))]
impl UnixSystem {
  #[cfg(target_os = "linux")]
  const fn noreserve() -> i32 {
    libc::MAP_NORESERVE
  }

  #[cfg(not(target_os = "linux"))]
  const fn noreserve() -> i32 {
    0
  }

  fn map(
    location: usize,
    size: usize,
    protection: i32,
    flags: i32,
    fd: i32,
  ) -> SysResult<usize> {
    let address = unsafe {
      libc::mmap(
        location as *mut libc::c_void,
        size,
        protection,
        flags,
        fd,
        0,
      )
    };

    if address == libc::MAP_FAILED {
      Err(SysError::OutOfAddressSpace)
    } else {
      Ok(address as usize)
    }
  }

  fn check(address: usize, size: usize) -> SysResult<()> {
    if address == 0 || !is_page_aligned(address) || !is_page_aligned(size) {
      return Err(SysError::InvalidArgument);
    }
    Ok(())
  }
}

#[cfg(any(target_os = "linux", target_os = "macos"))]
unsafe impl System for UnixSystem {
  unsafe fn reserve(&self, size: usize, location: usize, fd: Option<i32>) -> SysResult<usize> {
    if !is_page_aligned(size) || !is_page_aligned(location) {
      return Err(SysError::InvalidArgument);
    }

    let mut flags = if location != 0 { libc::MAP_FIXED } else { 0 };

    let protection = match fd {
      Some(_) => {
        flags |= libc::MAP_SHARED;
        libc::PROT_READ | libc::PROT_WRITE
      }
      None => {
        flags |= libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | Self::noreserve();
        libc::PROT_NONE
      }
    };

    Self::map(location, size, protection, flags, fd.unwrap_or(-1))
  }

  unsafe fn map_shared(&self, size: usize, location: usize, fd: i32) -> SysResult<usize> {
    Self::check(location, size)?;

    Self::map(
      location,
      size,
      libc::PROT_READ | libc::PROT_WRITE,
      libc::MAP_SHARED | libc::MAP_FIXED,
      fd,
    )
  }

  unsafe fn release(&self, address: usize, size: usize) -> SysResult<()> {
    Self::check(address, size)?;

    let result = unsafe { libc::munmap(address as *mut libc::c_void, size) };
    if result == 0 {
      Ok(())
    } else {
      Err(SysError::InvalidArgument)
    }
  }

  unsafe fn commit(&self, address: usize, size: usize) -> SysResult<()> {
    Self::check(address, size)?;

    // Partition spans are committed whole; accounting them against the
    // commit charge would refuse spans larger than physical memory.
    Self::map(
      address,
      size,
      libc::PROT_READ | libc::PROT_WRITE,
      libc::MAP_PRIVATE | libc::MAP_FIXED | libc::MAP_ANONYMOUS | Self::noreserve(),
      -1,
    )
    .map(|_| ())
  }

  unsafe fn uncommit(&self, address: usize, size: usize) -> SysResult<()> {
    Self::check(address, size)?;

    Self::map(
      address,
      size,
      libc::PROT_NONE,
      libc::MAP_PRIVATE | libc::MAP_FIXED | libc::MAP_ANONYMOUS | Self::noreserve(),
      -1,
    )
    .map(|_| ())
  }
}
