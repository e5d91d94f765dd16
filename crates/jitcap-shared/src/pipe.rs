//! Named pipe channel using overlapped I/O.
//!
//! Each direction owns a manual-reset event. An operation that returns
//! `ERROR_IO_PENDING` is waited on through that event and then reconciled with
//! `GetOverlappedResult`; a byte count that differs from the request fails
//! the whole call.

use crate::error::{Error, Result};
use crate::transport::Channel;
use log::debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use windows::Win32::Foundation::{
    CloseHandle, ERROR_IO_PENDING, ERROR_PIPE_CONNECTED, GENERIC_READ, GENERIC_WRITE, HANDLE,
    WAIT_OBJECT_0,
};
use windows::Win32::Storage::FileSystem::{
    CreateFileW, FILE_FLAG_OVERLAPPED, FILE_SHARE_READ, FILE_SHARE_WRITE, OPEN_EXISTING,
    PIPE_ACCESS_DUPLEX, ReadFile, WriteFile,
};
use windows::Win32::System::IO::{CancelIoEx, GetOverlappedResult, OVERLAPPED};
use windows::Win32::System::Pipes::{
    ConnectNamedPipe, CreateNamedPipeW, DisconnectNamedPipe, PIPE_READMODE_BYTE, PIPE_TYPE_BYTE,
    PIPE_WAIT,
};
use windows::Win32::System::Threading::{CreateEventW, INFINITE, WaitForSingleObject};
use windows::core::PCWSTR;

/// Pipe buffer size for the server end (64KB)
const PIPE_BUFFER_SIZE: u32 = 64 * 1024;

/// Full pipe path for endpoint `name`.
pub fn endpoint_path(name: &str) -> String {
    format!(r"\\.\pipe\{}", name)
}

fn to_wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

/// One end of a byte-mode named pipe opened for overlapped I/O.
pub struct PipeChannel {
    handle: HANDLE,
    read_event: HANDLE,
    write_event: HANDLE,
    server: bool,
    closed: AtomicBool,
}

// SAFETY: the handles are kernel objects usable from any thread; reads and
// writes use distinct events and OVERLAPPED structures.
unsafe impl Send for PipeChannel {}
unsafe impl Sync for PipeChannel {}

impl PipeChannel {
    /// Open the client end of the pipe `name`.
    pub fn connect(name: &str) -> Result<Self> {
        let path = to_wide(&endpoint_path(name));

        unsafe {
            let handle = CreateFileW(
                PCWSTR(path.as_ptr()),
                (GENERIC_READ | GENERIC_WRITE).0,
                FILE_SHARE_READ | FILE_SHARE_WRITE,
                None,
                OPEN_EXISTING,
                FILE_FLAG_OVERLAPPED,
                None,
            )?;

            Self::with_events(handle, false)
        }
    }

    /// Create the single-instance server end of `name` and wait for a client.
    pub fn accept_one(name: &str) -> Result<Self> {
        let path = to_wide(&endpoint_path(name));

        let channel = unsafe {
            let handle = CreateNamedPipeW(
                PCWSTR(path.as_ptr()),
                PIPE_ACCESS_DUPLEX | FILE_FLAG_OVERLAPPED,
                PIPE_TYPE_BYTE | PIPE_READMODE_BYTE | PIPE_WAIT,
                1,
                PIPE_BUFFER_SIZE,
                PIPE_BUFFER_SIZE,
                0,
                None,
            );
            if handle.is_invalid() {
                return Err(Error::from(windows::core::Error::from_win32()));
            }

            Self::with_events(handle, true)?
        };

        channel.wait_for_client()?;
        Ok(channel)
    }

    unsafe fn with_events(handle: HANDLE, server: bool) -> Result<Self> {
        unsafe {
            let read_event = match CreateEventW(None, true, true, PCWSTR::null()) {
                Ok(event) => event,
                Err(e) => {
                    let _ = CloseHandle(handle);
                    return Err(e.into());
                }
            };
            let write_event = match CreateEventW(None, true, true, PCWSTR::null()) {
                Ok(event) => event,
                Err(e) => {
                    let _ = CloseHandle(read_event);
                    let _ = CloseHandle(handle);
                    return Err(e.into());
                }
            };

            Ok(Self {
                handle,
                read_event,
                write_event,
                server,
                closed: AtomicBool::new(false),
            })
        }
    }

    fn wait_for_client(&self) -> Result<()> {
        let mut overlapped = OVERLAPPED {
            hEvent: self.read_event,
            ..Default::default()
        };

        unsafe {
            match ConnectNamedPipe(self.handle, Some(&mut overlapped as *mut _)) {
                Ok(()) => Ok(()),
                Err(e) if e.code() == ERROR_PIPE_CONNECTED.to_hresult() => Ok(()),
                Err(e) if e.code() == ERROR_IO_PENDING.to_hresult() => {
                    WaitForSingleObject(self.read_event, INFINITE);
                    let mut unused = 0u32;
                    GetOverlappedResult(self.handle, &overlapped, &mut unused, false)?;
                    Ok(())
                }
                Err(e) => Err(e.into()),
            }
        }
    }

    /// Issue one overlapped transfer of `requested` bytes and wait for it.
    fn transfer<F>(&self, event: HANDLE, requested: usize, timeout: Option<Duration>, start: F) -> Result<()>
    where
        F: FnOnce(*mut OVERLAPPED, *mut u32) -> windows::core::Result<()>,
    {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::NotConnected);
        }

        let mut overlapped = OVERLAPPED {
            hEvent: event,
            ..Default::default()
        };
        let mut transferred = 0u32;

        match start(&mut overlapped, &mut transferred) {
            Ok(()) => {}
            Err(e) if e.code() == ERROR_IO_PENDING.to_hresult() => unsafe {
                // A shutdown that ran between the check above and issuing this
                // operation found nothing to cancel.
                if self.closed.load(Ordering::SeqCst) {
                    let _ = CancelIoEx(self.handle, Some(&overlapped as *const _));
                    let _ = GetOverlappedResult(self.handle, &overlapped, &mut transferred, true);
                    return Err(Error::NotConnected);
                }

                let wait_ms = timeout
                    .map(|t| t.as_millis().min((INFINITE - 1) as u128) as u32)
                    .unwrap_or(INFINITE);

                if WaitForSingleObject(event, wait_ms) != WAIT_OBJECT_0 {
                    // The OVERLAPPED lives on this stack frame; let the
                    // cancellation finish before returning.
                    let _ = CancelIoEx(self.handle, Some(&overlapped as *const _));
                    let _ = GetOverlappedResult(self.handle, &overlapped, &mut transferred, true);
                    return Err(Error::Timeout);
                }

                GetOverlappedResult(self.handle, &overlapped, &mut transferred, false)?;
            },
            Err(e) => return Err(e.into()),
        }

        if transferred as usize != requested {
            return Err(Error::ShortTransfer {
                expected: requested,
                actual: transferred as usize,
            });
        }

        Ok(())
    }
}

impl Channel for PipeChannel {
    fn write_all(&self, data: &[u8], timeout: Option<Duration>) -> Result<()> {
        self.transfer(self.write_event, data.len(), timeout, |overlapped, written| unsafe {
            WriteFile(self.handle, Some(data), Some(written), Some(overlapped))
        })
    }

    fn read_exact(&self, buf: &mut [u8]) -> Result<()> {
        let requested = buf.len();
        self.transfer(self.read_event, requested, None, |overlapped, read| unsafe {
            ReadFile(self.handle, Some(buf), Some(read), Some(overlapped))
        })
    }

    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        unsafe {
            // Completes pending reads and writes from every thread with
            // ERROR_OPERATION_ABORTED, which signals their events.
            if let Err(e) = CancelIoEx(self.handle, None) {
                debug!("CancelIoEx: {}", e);
            }
            if self.server {
                let _ = DisconnectNamedPipe(self.handle);
            }
        }
    }
}

impl Drop for PipeChannel {
    fn drop(&mut self) {
        self.shutdown();
        unsafe {
            let _ = CloseHandle(self.handle);
            let _ = CloseHandle(self.read_event);
            let _ = CloseHandle(self.write_event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::mpsc;
    use std::thread;

    fn connected_pair(name: &str) -> (PipeChannel, PipeChannel) {
        let server_name = name.to_string();
        let server = thread::spawn(move || PipeChannel::accept_one(&server_name));

        // The server end may not exist yet.
        let client = loop {
            match PipeChannel::connect(name) {
                Ok(client) => break client,
                Err(_) => thread::sleep(Duration::from_millis(10)),
            }
        };

        (server.join().unwrap().unwrap(), client)
    }

    #[test]
    fn test_shutdown_unblocks_pending_read() {
        let name = format!("jitcap-test-{}", std::process::id());
        let (_server, client) = connected_pair(&name);
        let client = Arc::new(client);
        let (done_tx, done_rx) = mpsc::channel();

        let reader = {
            let client = Arc::clone(&client);
            thread::spawn(move || {
                let mut buf = [0u8; 8];
                done_tx.send(client.read_exact(&mut buf).is_err()).unwrap();
            })
        };

        thread::sleep(Duration::from_millis(50));
        client.shutdown();

        let failed = done_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("read did not return after shutdown");
        assert!(failed);
        reader.join().unwrap();

        // Anything issued after shutdown fails immediately.
        let mut buf = [0u8; 8];
        assert!(matches!(client.read_exact(&mut buf), Err(Error::NotConnected)));
        assert!(client.write_all(&[1, 2, 3], None).is_err());
    }

    #[test]
    fn test_pipe_round_trip() {
        let name = format!("jitcap-test-rt-{}", std::process::id());
        let (server, client) = connected_pair(&name);

        client.write_all(&[1, 2, 3, 4], Some(Duration::from_secs(5))).unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
    }
}
