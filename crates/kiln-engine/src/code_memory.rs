//! Executable code memory
//!
//! One mmap'd region per module with bump allocation. Pages start
//! read/write; the schedulers flip them to read/execute (or leave them
//! writable for the stub area, which is patched while other threads run).

use crate::EngineError;

/// Page protection for a sub-range of the region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    ReadWrite,
    ReadExec,
    ReadWriteExec,
}

pub struct CodeMemory {
    base: *mut u8,
    size: usize,
    offset: usize,
}

// Safety: the region is owned by one module; interior pointers are handed
// out under the scheduler's own synchronization.
unsafe impl Send for CodeMemory {}
unsafe impl Sync for CodeMemory {}

pub const PAGE_SIZE: usize = 4096;

impl CodeMemory {
    /// Reserve a read/write region of at least `size` bytes.
    #[cfg(unix)]
    pub fn new(size: usize) -> Result<Self, EngineError> {
        let size = size.max(PAGE_SIZE).next_multiple_of(PAGE_SIZE);
        // Safety: anonymous private mapping, no fd
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(EngineError::MmapFailed(format!(
                "mmap of {} bytes failed: {}",
                size,
                std::io::Error::last_os_error()
            )));
        }
        Ok(CodeMemory {
            base: ptr as *mut u8,
            size,
            offset: 0,
        })
    }

    #[cfg(not(unix))]
    pub fn new(_size: usize) -> Result<Self, EngineError> {
        Err(EngineError::MmapFailed(
            "executable memory is only supported on unix".to_string(),
        ))
    }

    /// Bump-allocate `size` bytes at the given alignment.
    pub fn allocate(&mut self, size: usize, align: usize) -> Result<*mut u8, EngineError> {
        let aligned = self.offset.next_multiple_of(align.max(1));
        if aligned + size > self.size {
            return Err(EngineError::MmapFailed(format!(
                "code region exhausted: {} + {} > {}",
                aligned, size, self.size
            )));
        }
        self.offset = aligned + size;
        // Safety: aligned + size is within the mapping
        Ok(unsafe { self.base.add(aligned) })
    }

    pub fn base(&self) -> *mut u8 {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn used(&self) -> usize {
        self.offset
    }

    /// Change protection of the pages covering `[ptr, ptr+len)`.
    #[cfg(unix)]
    pub fn protect(&self, ptr: *mut u8, len: usize, prot: Protection) -> Result<(), EngineError> {
        let flags = match prot {
            Protection::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
            Protection::ReadExec => libc::PROT_READ | libc::PROT_EXEC,
            Protection::ReadWriteExec => libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
        };
        let addr = ptr as usize & !(PAGE_SIZE - 1);
        let end = (ptr as usize + len).next_multiple_of(PAGE_SIZE);
        // Safety: [addr, end) stays within this mapping
        let result = unsafe { libc::mprotect(addr as *mut libc::c_void, end - addr, flags) };
        if result != 0 {
            return Err(EngineError::MmapFailed(format!(
                "mprotect failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }

    #[cfg(not(unix))]
    pub fn protect(&self, _ptr: *mut u8, _len: usize, _prot: Protection) -> Result<(), EngineError> {
        Ok(())
    }
}

#[cfg(unix)]
impl Drop for CodeMemory {
    fn drop(&mut self) {
        if !self.base.is_null() {
            // Safety: base/size are the original mapping
            unsafe {
                libc::munmap(self.base as *mut libc::c_void, self.size);
            }
        }
    }
}
