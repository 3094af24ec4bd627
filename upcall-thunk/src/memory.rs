//! Memory that thunks are executed from.
//! It is mapped writable, filled in, and then switched to be executable, so it is never both at
//! once.

use std::ptr::NonNull;

use crate::{sig::round_up, ThunkError};

fn page_size() -> usize {
    // Safety: sysconf has no preconditions
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    usize::try_from(size).ok().filter(|size| *size > 0).unwrap_or(4096)
}

/// A mapping, which is unmapped when dropped
#[derive(Debug)]
struct Mapping {
    ptr: NonNull<u8>,
    len: usize,
}
impl Mapping {
    fn new(size: usize) -> Result<Mapping, ThunkError> {
        let len = round_up(size.max(1), page_size());
        // Safety: An anonymous private mapping with no address hint doesn't touch any existing
        // memory
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            tracing::warn!("Failed to map {} bytes for a thunk", len);
            return Err(ThunkError::MemoryAllocation);
        }
        let ptr = NonNull::new(ptr.cast::<u8>()).ok_or(ThunkError::MemoryAllocation)?;

        Ok(Mapping { ptr, len })
    }
}
impl Drop for Mapping {
    fn drop(&mut self) {
        // Safety: We own the mapping, and nothing refers to it once we are dropped
        unsafe {
            libc::munmap(self.ptr.as_ptr().cast(), self.len);
        }
    }
}

/// Memory which code is being written into
#[derive(Debug)]
pub struct WritableMemory {
    mapping: Mapping,
}
impl WritableMemory {
    /// Get writable memory of at least `size` bytes
    pub fn allocate(size: usize) -> Result<WritableMemory, ThunkError> {
        Ok(WritableMemory {
            mapping: Mapping::new(size)?,
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.mapping.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mapping.len == 0
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // Safety: The mapping is readable and writable for its whole length, and we have unique
        // access to it
        unsafe { std::slice::from_raw_parts_mut(self.mapping.ptr.as_ptr(), self.mapping.len) }
    }

    /// Make the memory executable, with the first `code_len` bytes being code.
    /// It can't be written to afterwards.
    pub fn seal(self, code_len: usize) -> Result<ExecutableMemory, ThunkError> {
        let mapping = self.mapping;
        flush_instruction_cache(mapping.ptr.as_ptr(), code_len);

        // Safety: The range is exactly our mapping
        let res = unsafe {
            libc::mprotect(
                mapping.ptr.as_ptr().cast(),
                mapping.len,
                libc::PROT_READ | libc::PROT_EXEC,
            )
        };
        if res != 0 {
            tracing::warn!("Failed to make thunk memory executable");
            return Err(ThunkError::MemoryAllocation);
        }

        Ok(ExecutableMemory { mapping, code_len })
    }
}

/// Memory holding finished code
#[derive(Debug)]
pub struct ExecutableMemory {
    mapping: Mapping,
    code_len: usize,
}
impl ExecutableMemory {
    #[must_use]
    pub fn as_ptr(&self) -> *const u8 {
        self.mapping.ptr.as_ptr()
    }

    #[must_use]
    pub fn code_len(&self) -> usize {
        self.code_len
    }

    #[must_use]
    pub fn code(&self) -> &[u8] {
        // Safety: The mapping is still readable and at least `code_len` long
        unsafe { std::slice::from_raw_parts(self.mapping.ptr.as_ptr(), self.code_len) }
    }
}

#[cfg(any(target_arch = "aarch64", target_arch = "powerpc64"))]
fn flush_instruction_cache(start: *mut u8, len: usize) {
    extern "C" {
        fn __clear_cache(start: *mut libc::c_char, end: *mut libc::c_char);
    }

    // Safety: The range is inside of a mapping we own
    unsafe {
        __clear_cache(start.cast(), start.wrapping_add(len).cast());
    }
}

/// The instruction cache is coherent with writes on x86
#[cfg(not(any(target_arch = "aarch64", target_arch = "powerpc64")))]
fn flush_instruction_cache(_start: *mut u8, _len: usize) {}

#[cfg(test)]
mod tests {
    use super::WritableMemory;

    #[test]
    fn test_write_then_seal() {
        let mut memory = WritableMemory::allocate(10).unwrap();
        assert!(memory.len() >= 10);
        memory.as_mut_slice()[..3].copy_from_slice(&[0xC3, 0xCC, 0xCC]);

        let code = memory.seal(3).unwrap();
        assert_eq!(code.code(), &[0xC3, 0xCC, 0xCC]);
        assert_eq!(code.code_len(), 3);
    }
}
