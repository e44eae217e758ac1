#![allow(dead_code)]

#[cfg(not(test))]
#[panic_handler]
fn panic_handler(info: &core::panic::PanicInfo) -> ! {
  // No unwinding across the C boundary; report and abort.
  unsafe {
    if let Some(message) = info.message().as_str() {
      libc::write(
        libc::STDERR_FILENO,
        message.as_ptr() as *const libc::c_void,
        message.len(),
      );
      libc::write(libc::STDERR_FILENO, b"\n".as_ptr() as *const libc::c_void, 1);
    }

    libc::abort();
  }
}
