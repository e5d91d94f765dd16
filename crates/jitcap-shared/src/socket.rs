//! Unix domain socket channel.
//!
//! The well-known endpoint name maps to `<temp dir>/<name>.sock`.

use crate::error::{Error, Result};
use crate::transport::Channel;
use log::debug;
use std::io::{ErrorKind, Read, Write};
use std::net::Shutdown;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::time::Duration;

/// Filesystem path of the socket for endpoint `name`.
pub fn endpoint_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("{}.sock", name))
}

/// A connected Unix stream socket.
pub struct SocketChannel {
    stream: UnixStream,
}

impl SocketChannel {
    /// Connect to the consumer listening on `name`.
    pub fn connect(name: &str) -> Result<Self> {
        let stream = UnixStream::connect(endpoint_path(name))?;
        Ok(Self::from_stream(stream))
    }

    /// Bind `name`, accept exactly one producer and stop listening.
    pub fn accept_one(name: &str) -> Result<Self> {
        let path = endpoint_path(name);
        if path.exists() {
            std::fs::remove_file(&path)?;
        }

        let listener = UnixListener::bind(&path)?;
        debug!("listening on {}", path.display());
        let accepted = listener.accept();
        drop(listener);
        let _ = std::fs::remove_file(&path);

        let (stream, _) = accepted?;
        Ok(Self::from_stream(stream))
    }

    /// Wrap an already connected stream.
    pub fn from_stream(stream: UnixStream) -> Self {
        Self { stream }
    }
}

impl Channel for SocketChannel {
    fn write_all(&self, data: &[u8], timeout: Option<Duration>) -> Result<()> {
        // A zero timeout is rejected by the socket layer.
        let timeout = timeout.filter(|t| !t.is_zero());
        self.stream.set_write_timeout(timeout)?;

        let mut written = 0;
        while written < data.len() {
            match (&self.stream).write(&data[written..]) {
                Ok(0) => {
                    return Err(Error::ShortTransfer {
                        expected: data.len(),
                        actual: written,
                    });
                }
                Ok(n) => written += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    return Err(Error::Timeout);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn read_exact(&self, buf: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            match (&self.stream).read(&mut buf[filled..]) {
                Ok(0) => {
                    return Err(Error::ShortTransfer {
                        expected: buf.len(),
                        actual: filled,
                    });
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn shutdown(&self) {
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            debug!("socket shutdown: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{Message, StartSession};
    use crate::transport::{self, MessageSink};
    use std::thread;

    #[test]
    fn test_connect_to_named_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        let name = dir
            .path()
            .join("jitcap-test")
            .to_string_lossy()
            .into_owned();
        // endpoint_path joins onto temp_dir; an absolute name replaces it.
        assert_eq!(endpoint_path(&name), PathBuf::from(format!("{}.sock", name)));

        let server = {
            let name = name.clone();
            thread::spawn(move || transport::accept_one(&name, None))
        };

        let producer = loop {
            match transport::connect(&name, None) {
                Ok(t) => break t,
                Err(_) => thread::sleep(Duration::from_millis(10)),
            }
        };
        let consumer = server.join().unwrap().unwrap();

        let hello = Message::StartSession(StartSession {
            process_kind: 0x8664,
            process_id: 12,
        });
        assert!(producer.send(&hello));

        let (header, body) = consumer.read_frame().unwrap();
        assert_eq!(Message::decode(&header, &body).unwrap(), hello);
    }

    #[test]
    fn test_short_read_is_an_error() {
        let (a, b) = UnixStream::pair().unwrap();
        let reader = SocketChannel::from_stream(a);
        (&b).write_all(&[1, 2, 3]).unwrap();
        drop(b);

        let mut buf = [0u8; 8];
        match reader.read_exact(&mut buf) {
            Err(Error::ShortTransfer { expected, actual }) => {
                assert_eq!(expected, 8);
                assert_eq!(actual, 3);
            }
            other => panic!("expected short transfer, got {:?}", other),
        }
    }
}
