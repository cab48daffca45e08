use std::ptr::NonNull;

/// This trait provides an abstraction over the memory the pool is built on.
/// The pool itself has nothing to do with the concrete syscalls offered by
/// each kernel, it only asks for regions and gives them back.
///
/// # Safety
///
/// Implementors must return regions that are valid for reads and writes of
/// `len` bytes, aligned to at least [`crate::POOL_ALIGNMENT`], initialized
/// (for example zero filled) and not aliased by anything else until they are
/// handed back through [`SystemMemory::return_memory`].
pub unsafe trait SystemMemory {
    /// Request a memory region of size `len`. It returns a pointer to the
    /// region or `None` if the underlying call fails.
    fn request_memory(&mut self, len: usize) -> Option<NonNull<u8>>;

    /// Returns the memory of size `len` starting from `addr` back to the system.
    ///
    /// # Safety
    ///
    /// `addr` and `len` must describe a region obtained from `request_memory`
    /// on this same instance which has not been returned yet.
    unsafe fn return_memory(&mut self, addr: NonNull<u8>, len: usize);
}

/// Default [`SystemMemory`]: asks the operating system directly for
/// anonymous pages.
#[derive(Debug, Default, Clone, Copy)]
pub struct Kernel;

#[cfg(unix)]
mod unix {
    use super::{Kernel, SystemMemory};

    use libc::{mmap, munmap, off_t, size_t};

    use std::{
        os::raw::{c_int, c_void},
        ptr::NonNull,
    };

    unsafe impl SystemMemory for Kernel {
        fn request_memory(&mut self, len: usize) -> Option<NonNull<u8>> {
            // mmap parameters.
            const ADDR: *mut c_void = std::ptr::null_mut::<c_void>();
            // Read-Write only memory.
            const PROT: c_int = libc::PROT_READ | libc::PROT_WRITE;
            const FLAGS: c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
            const FD: c_int = -1;
            const OFFSET: off_t = 0;

            let addr = unsafe { mmap(ADDR, len as size_t, PROT, FLAGS, FD, OFFSET) };

            match addr {
                libc::MAP_FAILED => None,
                addr => NonNull::new(addr.cast::<u8>()),
            }
        }

        unsafe fn return_memory(&mut self, addr: NonNull<u8>, len: usize) {
            let result = unsafe { munmap(addr.as_ptr().cast::<c_void>(), len as size_t) };
            debug_assert_eq!(result, 0, "munmap rejected a pool region");
        }
    }
}

#[cfg(windows)]
mod windows {
    use std::{os::raw::c_void, ptr::NonNull};

    use super::{Kernel, SystemMemory};

    use windows::Win32::System::Memory;

    unsafe impl SystemMemory for Kernel {
        fn request_memory(&mut self, len: usize) -> Option<NonNull<u8>> {
            // Read-Write only.
            let protection = Memory::PAGE_READWRITE;

            let flags = Memory::MEM_RESERVE | Memory::MEM_COMMIT;

            unsafe {
                let addr = Memory::VirtualAlloc(None, len, flags, protection);

                NonNull::new(addr.cast())
            }
        }

        unsafe fn return_memory(&mut self, addr: NonNull<u8>, _len: usize) {
            let result = unsafe {
                Memory::VirtualFree(addr.as_ptr().cast::<c_void>(), 0, Memory::MEM_RELEASE)
            };
            debug_assert!(result.is_ok(), "VirtualFree rejected a pool region");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_regions_are_zeroed_and_writable() {
        let mut kernel = Kernel;
        let len = 8192;

        let addr = kernel.request_memory(len).unwrap();
        assert_eq!(addr.as_ptr() as usize % crate::POOL_ALIGNMENT, 0);

        unsafe {
            let bytes = std::slice::from_raw_parts_mut(addr.as_ptr(), len);
            assert!(bytes.iter().all(|&b| b == 0));

            bytes[0] = 0xAB;
            bytes[len - 1] = 0xCD;
            assert_eq!(bytes[0], 0xAB);
            assert_eq!(bytes[len - 1], 0xCD);

            kernel.return_memory(addr, len);
        }
    }
}
