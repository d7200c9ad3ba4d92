//! Executable memory, allocated with mmap.
//!
//! A block starts read-write, is filled with code, then sealed to
//! read-execute. Release is explicit and happens exactly once: the block
//! is owned by the file info that allocated it, and `destroy` may be
//! called again safely (the second call is a no-op). `Drop` is only a
//! backstop for early-exit paths.

use std::ptr::NonNull;

/// Error type for executable-memory operations.
#[derive(Debug)]
pub enum MemError {
    AllocationFailed,
    ProtectionFailed,
    InvalidSize,
    Sealed,
}

impl std::fmt::Display for MemError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemError::AllocationFailed => write!(f, "memory allocation failed"),
            MemError::ProtectionFailed => write!(f, "memory protection change failed"),
            MemError::InvalidSize => write!(f, "invalid memory size"),
            MemError::Sealed => write!(f, "memory already sealed executable"),
        }
    }
}

impl std::error::Error for MemError {}

/// A page-aligned block of code memory.
pub struct ExecMemory {
    ptr: NonNull<u8>,
    size: usize,
    sealed: bool,
    destroyed: bool,
}

impl ExecMemory {
    /// Allocate a writable, non-executable block of at least `size` bytes
    /// (rounded up to whole pages).
    pub fn new(size: usize) -> Result<Self, MemError> {
        if size == 0 {
            return Err(MemError::InvalidSize);
        }
        let page = Self::page_size();
        let aligned = (size + page - 1) & !(page - 1);
        let ptr = Self::map(aligned)?;
        Ok(Self {
            ptr,
            size: aligned,
            sealed: false,
            destroyed: false,
        })
    }

    fn page_size() -> usize {
        #[cfg(unix)]
        {
            unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
        }
        #[cfg(not(unix))]
        {
            4096
        }
    }

    #[cfg(unix)]
    fn map(size: usize) -> Result<NonNull<u8>, MemError> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(MemError::AllocationFailed);
        }
        NonNull::new(ptr as *mut u8).ok_or(MemError::AllocationFailed)
    }

    #[cfg(not(unix))]
    fn map(size: usize) -> Result<NonNull<u8>, MemError> {
        let layout = std::alloc::Layout::from_size_align(size, Self::page_size())
            .map_err(|_| MemError::InvalidSize)?;
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or(MemError::AllocationFailed)
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Copy `data` into the block at `offset`. Rejected once sealed.
    pub fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), MemError> {
        if self.sealed {
            return Err(MemError::Sealed);
        }
        if offset + data.len() > self.size {
            return Err(MemError::InvalidSize);
        }
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.as_ptr().add(offset), data.len());
        }
        Ok(())
    }

    /// Flip the block to read-execute. After sealing no write is accepted.
    #[cfg(unix)]
    pub fn seal(&mut self) -> Result<(), MemError> {
        if self.sealed {
            return Ok(());
        }
        let result = unsafe {
            libc::mprotect(
                self.ptr.as_ptr() as *mut libc::c_void,
                self.size,
                libc::PROT_READ | libc::PROT_EXEC,
            )
        };
        if result != 0 {
            return Err(MemError::ProtectionFailed);
        }
        self.sealed = true;
        Ok(())
    }

    #[cfg(not(unix))]
    pub fn seal(&mut self) -> Result<(), MemError> {
        self.sealed = true;
        Ok(())
    }

    /// Entry address of the code in this block.
    ///
    /// # Safety
    /// The block must contain valid machine code for the running
    /// architecture and must have been sealed.
    pub unsafe fn entry<F: Copy>(&self) -> Option<F> {
        if !self.sealed || self.destroyed {
            return None;
        }
        if std::mem::size_of::<F>() != std::mem::size_of::<fn()>() {
            return None;
        }
        let ptr = self.ptr.as_ptr();
        Some(unsafe { std::mem::transmute_copy(&ptr) })
    }

    /// Unmap the block. Idempotent: only the first call releases.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        self.unmap();
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    #[cfg(unix)]
    fn unmap(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.size);
        }
    }

    #[cfg(not(unix))]
    fn unmap(&mut self) {
        let layout = std::alloc::Layout::from_size_align(self.size, Self::page_size())
            .expect("invalid layout");
        unsafe {
            std::alloc::dealloc(self.ptr.as_ptr(), layout);
        }
    }
}

impl Drop for ExecMemory {
    fn drop(&mut self) {
        self.destroy();
    }
}

// The block owns its mapping; sealing is tracked through &mut self.
unsafe impl Send for ExecMemory {}
unsafe impl Sync for ExecMemory {}
