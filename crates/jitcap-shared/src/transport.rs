//! Framed transport over a duplex byte channel.
//!
//! Every frame is written as header then body while holding the send lock,
//! so frames from concurrent senders never interleave. Reads happen on a
//! single receive thread and use their own completion signal, so a pending
//! read never blocks a send.

use crate::error::{Error, Result};
use crate::messages::{HEADER_SIZE, Message, MessageHeader, MessageKind};
use log::{debug, trace};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Default bound on a single send.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// A connected duplex byte channel.
///
/// Implementations take `&self` so one thread can read while others write.
/// A transfer that moves fewer bytes than requested is an error, never a
/// partial success.
pub trait Channel: Send + Sync {
    /// Write all of `data`, waiting at most `timeout` (`None` waits forever).
    fn write_all(&self, data: &[u8], timeout: Option<Duration>) -> Result<()>;

    /// Fill `buf` completely, waiting as long as it takes.
    fn read_exact(&self, buf: &mut [u8]) -> Result<()>;

    /// Release the connection and make any pending I/O complete with an error.
    fn shutdown(&self);
}

/// Anything a captured message can be pushed into.
pub trait MessageSink: Send + Sync {
    /// Send one message. Returns false on any failure.
    fn send(&self, message: &Message) -> bool;
}

/// Header/body framing over a [`Channel`].
pub struct FramedTransport<C: Channel> {
    channel: C,
    send_lock: Mutex<()>,
    send_timeout: Option<Duration>,
    connected: AtomicBool,
}

impl<C: Channel> FramedTransport<C> {
    /// Wrap an already connected channel.
    pub fn new(channel: C, send_timeout: Option<Duration>) -> Self {
        Self {
            channel,
            send_lock: Mutex::new(()),
            send_timeout,
            connected: AtomicBool::new(true),
        }
    }

    /// Check whether `disconnect` has been called.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Send one frame. Not connected, timeouts and I/O errors all return false.
    pub fn send_frame(&self, kind: MessageKind, payload: &[u8]) -> bool {
        match self.try_send_frame(kind, payload) {
            Ok(()) => true,
            Err(e) => {
                debug!("send {:?} ({} bytes) failed: {}", kind, payload.len(), e);
                false
            }
        }
    }

    fn try_send_frame(&self, kind: MessageKind, payload: &[u8]) -> Result<()> {
        let header = MessageHeader::new(kind, payload.len())?;

        let _guard = self.send_lock.lock();
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }

        let written = self
            .channel
            .write_all(&header.to_bytes(), self.send_timeout)
            .and_then(|()| {
                if payload.is_empty() {
                    Ok(())
                } else {
                    self.channel.write_all(payload, self.send_timeout)
                }
            });

        if let Err(e) = written {
            // The peer may hold part of this frame; the stream cannot be resynchronized.
            self.disconnect();
            return Err(e);
        }

        trace!("sent {:?}, size {}", kind, header.size);
        Ok(())
    }

    /// Read one frame, blocking until it arrives.
    pub fn read_frame(&self) -> Result<(MessageHeader, Vec<u8>)> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }

        let mut raw = [0u8; HEADER_SIZE];
        self.channel.read_exact(&mut raw)?;
        let header = MessageHeader::from_bytes(&raw);

        let mut body = vec![0u8; header.body_len()?];
        if !body.is_empty() {
            self.channel.read_exact(&mut body)?;
        }

        Ok((header, body))
    }

    /// Read frames until `is_canceled` returns true or the connection fails,
    /// handing each one to `on_message`.
    pub fn receive_loop<F, K>(&self, mut on_message: F, is_canceled: K)
    where
        F: FnMut(MessageHeader, Vec<u8>),
        K: Fn() -> bool,
    {
        while !is_canceled() {
            match self.read_frame() {
                Ok((header, body)) => {
                    trace!("received kind {}, size {}", header.kind, header.size);
                    on_message(header, body);
                }
                Err(e) => {
                    debug!("receive loop stopping: {}", e);
                    break;
                }
            }
        }
    }

    /// Drop the connection. Safe to call more than once; unblocks a pending read.
    pub fn disconnect(&self) {
        if self.connected.swap(false, Ordering::AcqRel) {
            self.channel.shutdown();
        }
    }
}

impl<C: Channel> MessageSink for FramedTransport<C> {
    fn send(&self, message: &Message) -> bool {
        match message.encode_body() {
            Ok(body) => self.send_frame(message.kind(), &body),
            Err(e) => {
                debug!("failed to encode {:?}: {}", message.kind(), e);
                false
            }
        }
    }
}

impl<C: Channel> Drop for FramedTransport<C> {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// The channel used on this platform.
#[cfg(windows)]
pub type PlatformChannel = crate::pipe::PipeChannel;

/// The channel used on this platform.
#[cfg(unix)]
pub type PlatformChannel = crate::socket::SocketChannel;

/// Connect to the consumer listening on the well-known endpoint `name`.
#[cfg(any(windows, unix))]
pub fn connect(name: &str, send_timeout: Option<Duration>) -> Result<FramedTransport<PlatformChannel>> {
    let channel = PlatformChannel::connect(name)?;
    Ok(FramedTransport::new(channel, send_timeout))
}

/// Create the endpoint `name` and wait for a single producer to connect.
#[cfg(any(windows, unix))]
pub fn accept_one(name: &str, send_timeout: Option<Duration>) -> Result<FramedTransport<PlatformChannel>> {
    let channel = PlatformChannel::accept_one(name)?;
    Ok(FramedTransport::new(channel, send_timeout))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::messages::FunctionCode;
    use crate::socket::SocketChannel;
    use std::os::unix::net::UnixStream;
    use std::sync::Arc;
    use std::sync::mpsc;
    use std::thread;

    fn pair() -> (
        FramedTransport<SocketChannel>,
        FramedTransport<SocketChannel>,
    ) {
        let (a, b) = UnixStream::pair().unwrap();
        (
            FramedTransport::new(SocketChannel::from_stream(a), Some(DEFAULT_SEND_TIMEOUT)),
            FramedTransport::new(SocketChannel::from_stream(b), Some(DEFAULT_SEND_TIMEOUT)),
        )
    }

    #[test]
    fn test_function_code_round_trip() {
        let (producer, consumer) = pair();
        let code: Vec<u8> = (0..=255u8).cycle().take(5000).collect();
        let message = Message::FunctionCode(FunctionCode {
            function_id: 0x51,
            address: 0x1000,
            rejit_id: 1,
            process_id: 77,
            code: code.clone(),
        });

        assert!(producer.send(&message));

        let (header, body) = consumer.read_frame().unwrap();
        assert_eq!(header.kind, MessageKind::FunctionCode as i32);
        match Message::decode(&header, &body).unwrap() {
            Message::FunctionCode(received) => {
                assert_eq!(received.code, code);
                assert_eq!(received.function_id, 0x51);
                assert_eq!(received.address, 0x1000);
                assert_eq!(received.rejit_id, 1);
                assert_eq!(received.process_id, 77);
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_concurrent_senders_do_not_interleave() {
        let (producer, consumer) = pair();
        let producer = Arc::new(producer);

        let senders: Vec<_> = (0..4u8)
            .map(|n| {
                let producer = Arc::clone(&producer);
                thread::spawn(move || {
                    for i in 0..25i64 {
                        let message = Message::FunctionCode(FunctionCode {
                            function_id: n as i64,
                            address: i,
                            rejit_id: 0,
                            process_id: 1,
                            code: vec![n; 700 + n as usize * 31],
                        });
                        assert!(producer.send(&message));
                    }
                })
            })
            .collect();

        for _ in 0..100 {
            let (header, body) = consumer.read_frame().unwrap();
            match Message::decode(&header, &body).unwrap() {
                Message::FunctionCode(code) => {
                    let n = code.function_id as u8;
                    assert_eq!(code.code.len(), 700 + n as usize * 31);
                    assert!(code.code.iter().all(|&b| b == n));
                }
                other => panic!("unexpected message {:?}", other),
            }
        }

        for sender in senders {
            sender.join().unwrap();
        }
    }

    #[test]
    fn test_failed_send_drops_connection() {
        let (a, b) = UnixStream::pair().unwrap();
        let producer = FramedTransport::new(
            SocketChannel::from_stream(a),
            Some(Duration::from_millis(100)),
        );
        let consumer = FramedTransport::new(SocketChannel::from_stream(b), None);

        // Nobody reads, so the socket buffer fills and the write times out mid-frame.
        let big = Message::FunctionCode(FunctionCode {
            function_id: 1,
            address: 0x1000,
            rejit_id: 0,
            process_id: 1,
            code: vec![0xCC; 1 << 20],
        });
        assert!(!producer.send(&big));
        assert!(!producer.is_connected());

        let small = Message::FunctionCode(FunctionCode {
            function_id: 2,
            address: 0x2000,
            rejit_id: 0,
            process_id: 1,
            code: vec![0x90; 64],
        });
        for _ in 0..3 {
            assert!(!producer.send(&small));
        }

        // The consumer sees a truncated frame and then the end of the stream.
        assert!(consumer.read_frame().is_err());
    }

    #[test]
    fn test_disconnect_unblocks_receive_loop() {
        let (producer, _consumer) = pair();
        let producer = Arc::new(producer);
        let (done_tx, done_rx) = mpsc::channel();

        let receiver = {
            let producer = Arc::clone(&producer);
            thread::spawn(move || {
                producer.receive_loop(|_, _| {}, || false);
                done_tx.send(()).unwrap();
            })
        };

        thread::sleep(Duration::from_millis(50));
        producer.disconnect();

        done_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("receive loop did not return after disconnect");
        receiver.join().unwrap();

        // Idempotent, and sends now fail.
        producer.disconnect();
        assert!(!producer.send_frame(MessageKind::EndSession, &[]));
    }

    #[test]
    fn test_receive_loop_stops_when_canceled() {
        let (producer, consumer) = pair();
        assert!(producer.send(&Message::EndSession));
        assert!(producer.send(&Message::EndSession));

        let canceled = AtomicBool::new(false);
        let mut seen = 0;
        consumer.receive_loop(
            |header, _| {
                assert_eq!(header.kind, MessageKind::EndSession as i32);
                seen += 1;
                canceled.store(true, Ordering::SeqCst);
            },
            || canceled.load(Ordering::SeqCst),
        );

        assert_eq!(seen, 1);
    }

    #[test]
    fn test_peer_close_ends_receive_loop() {
        let (producer, consumer) = pair();
        assert!(producer.send(&Message::EndSession));
        drop(producer);

        let mut seen = 0;
        consumer.receive_loop(|_, _| seen += 1, || false);
        assert_eq!(seen, 1);
    }
}
