//! Named shared-memory objects backing cross-process allocators.

use crate::system::{
  SysError,
  SysResult,
};

/// Maximum link name length including the NUL terminator.
pub const MAX_LINK_NAME: usize = 256;

#[cfg(any(target_os = "linux", target_os = "macos"))]
fn with_c_name<R>(name: &str, f: impl FnOnce(*const libc::c_char) -> R) -> SysResult<R> {
  let bytes = name.as_bytes();

  if bytes.is_empty() || bytes.len() >= MAX_LINK_NAME || bytes.contains(&0) {
    return Err(SysError::InvalidArgument);
  }

  let mut buffer = [0u8; MAX_LINK_NAME];
  buffer[..bytes.len()].copy_from_slice(bytes);

  Ok(f(buffer.as_ptr() as *const libc::c_char))
}

/// Create a new named object, failing if it already exists.
#[cfg(any(target_os = "linux", target_os = "macos"))]
pub fn create(name: &str) -> SysResult<i32> {
  let fd = with_c_name(name, |c_name| unsafe {
    libc::shm_open(c_name, libc::O_EXCL | libc::O_CREAT | libc::O_RDWR, 0o600)
  })?;

  if fd == -1 {
    Err(SysError::InvalidArgument)
  } else {
    Ok(fd)
  }
}

/// Open an existing named object.
#[cfg(any(target_os = "linux", target_os = "macos"))]
pub fn open(name: &str) -> SysResult<i32> {
  let fd = with_c_name(name, |c_name| unsafe {
    libc::shm_open(c_name, libc::O_RDWR, 0o600)
  })?;

  if fd == -1 {
    Err(SysError::InvalidArgument)
  } else {
    Ok(fd)
  }
}

#[cfg(any(target_os = "linux", target_os = "macos"))]
pub fn truncate(fd: i32, size: usize) -> SysResult<()> {
  let result = unsafe { libc::ftruncate(fd, size as libc::off_t) };
  if result == 0 {
    Ok(())
  } else {
    Err(SysError::OutOfAddressSpace)
  }
}

/// The mapping stays valid after the descriptor is closed.
#[cfg(any(target_os = "linux", target_os = "macos"))]
pub fn close(fd: i32) {
  unsafe { libc::close(fd) };
}

#[cfg(any(target_os = "linux", target_os = "macos"))]
pub fn unlink(name: &str) -> SysResult<()> {
  let result = with_c_name(name, |c_name| unsafe { libc::shm_unlink(c_name) })?;
  if result == 0 {
    Ok(())
  } else {
    Err(SysError::InvalidArgument)
  }
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
mod unsupported {
  use super::*;

  pub fn create(_name: &str) -> SysResult<i32> {
    Err(SysError::Unsupported)
  }

  pub fn open(_name: &str) -> SysResult<i32> {
    Err(SysError::Unsupported)
  }

  pub fn truncate(_fd: i32, _size: usize) -> SysResult<()> {
    Err(SysError::Unsupported)
  }

  pub fn close(_fd: i32) {}

  pub fn unlink(_name: &str) -> SysResult<()> {
    Err(SysError::Unsupported)
  }
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
pub use unsupported::*;

#[cfg(all(test, any(target_os = "linux", target_os = "macos")))]
mod tests {
  use super::*;

  #[test]
  fn test_create_open_unlink() {
    let name = "/quantal-shm-test-create";
    let _ = unlink(name);

    let fd = create(name).unwrap();
    truncate(fd, 4096).unwrap();
    close(fd);

    // Exclusive create must now fail, plain open must succeed.
    assert!(create(name).is_err());
    let fd = open(name).unwrap();
    close(fd);

    unlink(name).unwrap();
    assert!(open(name).is_err());
  }

  #[test]
  fn test_name_validation() {
    assert!(create("").is_err());
    assert!(with_c_name("bad\0name", |_| ()).is_err());

    let long = "x".repeat(MAX_LINK_NAME);
    assert!(create(&long).is_err());
  }
}
