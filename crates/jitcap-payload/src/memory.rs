//! Reading code bytes out of the instrumented process.
//!
//! The payload runs inside the process it captures, so reads target our own
//! address space. On Windows and Linux the read goes through the kernel
//! (`ReadProcessMemory` / `process_vm_readv`) so an unmapped page turns into
//! an error instead of an access violation.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemoryError {
    #[error("read of {len} bytes at 0x{address:X} failed: {reason}")]
    ReadFailed {
        address: u64,
        len: usize,
        reason: String,
    },

    #[error("short read at 0x{address:X}: wanted {expected} bytes, got {actual}")]
    ShortRead {
        address: u64,
        expected: usize,
        actual: usize,
    },
}

/// Read access to the instrumented process's memory.
pub trait ProcessMemory: Send + Sync {
    /// Copy `len` bytes starting at `address`.
    fn read(&self, address: u64, len: usize) -> Result<Vec<u8>, MemoryError>;
}

/// The current process.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalMemory;

impl ProcessMemory for LocalMemory {
    fn read(&self, address: u64, len: usize) -> Result<Vec<u8>, MemoryError> {
        if len == 0 {
            return Ok(Vec::new());
        }

        let mut buf = vec![0u8; len];
        let read = read_own_memory(address, &mut buf)?;
        if read != len {
            return Err(MemoryError::ShortRead {
                address,
                expected: len,
                actual: read,
            });
        }

        Ok(buf)
    }
}

#[cfg(windows)]
fn read_own_memory(address: u64, buf: &mut [u8]) -> Result<usize, MemoryError> {
    use std::ffi::c_void;
    use windows::Win32::System::Diagnostics::Debug::ReadProcessMemory;
    use windows::Win32::System::Threading::GetCurrentProcess;

    let mut bytes_read = 0usize;
    let result = unsafe {
        ReadProcessMemory(
            GetCurrentProcess(),
            address as usize as *const c_void,
            buf.as_mut_ptr() as *mut c_void,
            buf.len(),
            Some(&mut bytes_read),
        )
    };

    match result {
        Ok(()) => Ok(bytes_read),
        Err(e) => Err(MemoryError::ReadFailed {
            address,
            len: buf.len(),
            reason: e.to_string(),
        }),
    }
}

#[cfg(target_os = "linux")]
fn read_own_memory(address: u64, buf: &mut [u8]) -> Result<usize, MemoryError> {
    let local = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };
    let remote = libc::iovec {
        iov_base: address as usize as *mut libc::c_void,
        iov_len: buf.len(),
    };

    let read = unsafe { libc::process_vm_readv(libc::getpid(), &local, 1, &remote, 1, 0) };
    if read < 0 {
        return Err(MemoryError::ReadFailed {
            address,
            len: buf.len(),
            reason: std::io::Error::last_os_error().to_string(),
        });
    }

    Ok(read as usize)
}

#[cfg(not(any(windows, target_os = "linux")))]
fn read_own_memory(address: u64, buf: &mut [u8]) -> Result<usize, MemoryError> {
    if address == 0 {
        return Err(MemoryError::ReadFailed {
            address,
            len: buf.len(),
            reason: "null address".to_string(),
        });
    }

    // SAFETY: the caller got `address` from the runtime as the start of a live
    // code region of at least `buf.len()` bytes in this process.
    unsafe {
        std::ptr::copy_nonoverlapping(address as usize as *const u8, buf.as_mut_ptr(), buf.len());
    }
    Ok(buf.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_own_buffer() {
        let code: Vec<u8> = (0..200u8).collect();
        let address = code.as_ptr() as usize as u64;

        let copy = LocalMemory.read(address, code.len()).unwrap();
        assert_eq!(copy, code);

        let tail = LocalMemory.read(address + 100, 50).unwrap();
        assert_eq!(tail, &code[100..150]);

        assert!(LocalMemory.read(address, 0).unwrap().is_empty());
    }

    #[cfg(any(windows, target_os = "linux"))]
    #[test]
    fn test_unmapped_read_is_an_error() {
        assert!(LocalMemory.read(0, 16).is_err());
    }
}
