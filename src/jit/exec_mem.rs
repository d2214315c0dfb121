//! The executable-memory provider (C4): an RAII read-write-executable
//! host allocation for the JIT's emitted code.
//!
//! Translation is single-pass and the buffer is only ever executed after
//! emission has finished, so there is no need for W^X toggling between
//! emit and run phases the way a tiering JIT would require.

use crate::error::TranslationError;

/// An anonymous RWX mapping. Unmapped on drop, so a translation error or
/// panic mid-emission cannot leak the mapping.
pub struct ExecBuffer {
    ptr: *mut u8,
    len: usize,
}

// Safety: the buffer is plain bytes with no interior aliasing concerns;
// it is only ever accessed through `&mut self` or, once frozen, invoked
// as a function pointer by the caller.
unsafe impl Send for ExecBuffer {}

impl ExecBuffer {
    /// Allocate `len` bytes of RWX memory, page-rounded by the OS.
    pub fn new(len: usize) -> Result<Self, TranslationError> {
        if len == 0 {
            return Err(TranslationError::AllocationFailed("zero-length allocation".into()));
        }
        #[cfg(unix)]
        {
            // Safety: mmap with MAP_ANONYMOUS | MAP_PRIVATE and no fd is a
            // well-defined way to obtain a fresh zeroed mapping.
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    len,
                    libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                    libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
                    -1,
                    0,
                )
            };
            if ptr == libc::MAP_FAILED {
                return Err(TranslationError::AllocationFailed(
                    std::io::Error::last_os_error().to_string(),
                ));
            }
            Ok(ExecBuffer { ptr: ptr as *mut u8, len })
        }
        #[cfg(not(unix))]
        {
            Err(TranslationError::AllocationFailed(
                "executable-memory allocation is only implemented for unix hosts".into(),
            ))
        }
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for ExecBuffer {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            // Safety: `ptr`/`len` are exactly the mapping returned by mmap.
            unsafe {
                libc::munmap(self.ptr as *mut libc::c_void, self.len);
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn allocates_and_releases() {
        let mut buf = ExecBuffer::new(4096).unwrap();
        assert_eq!(buf.len(), 4096);
        assert!(!buf.as_mut_ptr().is_null());
    }

    #[test]
    fn zero_length_is_rejected() {
        assert!(ExecBuffer::new(0).is_err());
    }
}
