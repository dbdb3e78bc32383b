//! Framing channel: whole protocol messages over a byte stream.
//!
//! Every frame is a big-endian length prefix followed by the encoded body:
//!
//! ```text
//! [u32 BE length N] [N bytes: encoded {id, type, body} tree]
//! ```
//!
//! The length counts body bytes only. Bodies are capped at
//! [`MAX_FRAME_SIZE`](crate::constants::MAX_FRAME_SIZE); exceeding the cap on
//! either side is a fatal framing error, never a truncation.
//!
//! A channel owns one reusable scratch buffer for outbound bodies, the
//! outbound bytes the stream has not accepted yet, and one accumulation
//! buffer for inbound bytes. Callers that share a channel between threads
//! wrap it in a mutex so only one read or write touches the buffers at a
//! time.
//!
//! Writing never waits on a non-blocking stream. A frame the stream only
//! partly accepts stays pending and resumes on the next
//! [`FramingChannel::flush_pending`], so frames are never abandoned halfway.

use std::io::{self, Read, Write};

use crate::constants::{LENGTH_PREFIX_SIZE, MAX_FRAME_SIZE, READ_CHUNK_SIZE};
use crate::error::{Error, Result};
use crate::protocol::{Encoding, Message};

/// Transceiver of whole protocol messages over a duplex byte stream.
///
/// Works over blocking and non-blocking streams alike. On a non-blocking
/// stream [`FramingChannel::receive`] returns `Ok(None)` once no complete
/// frame can be assembled without waiting; partial frames stay buffered
/// for the next call.
pub struct FramingChannel<S> {
    stream: S,
    encoding: Box<dyn Encoding>,
    /// Outbound body buffer, reused across writes.
    scratch: Vec<u8>,
    /// Encoded frames not yet accepted by the stream.
    outbound: Vec<u8>,
    /// Bytes of `outbound` already written.
    written: usize,
    /// Inbound bytes not yet consumed as frames.
    inbound: Vec<u8>,
    max_frame_size: usize,
}

impl<S: Read + Write> std::fmt::Debug for FramingChannel<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramingChannel")
            .field("encoding", &self.encoding)
            .field("buffered", &self.inbound.len())
            .field("pending", &self.pending())
            .field("max_frame_size", &self.max_frame_size)
            .finish_non_exhaustive()
    }
}

impl<S: Read + Write> FramingChannel<S> {
    /// Wrap `stream`, encoding bodies with `encoding`.
    pub fn new(stream: S, encoding: Box<dyn Encoding>) -> Self {
        Self {
            stream,
            encoding,
            scratch: Vec::new(),
            outbound: Vec::new(),
            written: 0,
            inbound: Vec::new(),
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    /// Override the body size limit (tests and constrained peers).
    pub fn with_max_frame_size(mut self, limit: usize) -> Self {
        self.max_frame_size = limit.min(u32::MAX as usize);
        self
    }

    /// Serialize `message` and write it as one frame.
    ///
    /// On a blocking stream the whole frame is written on return. On a
    /// non-blocking stream the bytes the stream cannot take yet stay pending;
    /// see [`FramingChannel::flush_pending`].
    ///
    /// # Errors
    ///
    /// [`Error::FrameTooLarge`] if the encoded body exceeds the limit (nothing
    /// is written in that case), [`Error::Encoding`] if the tree cannot be
    /// encoded, [`Error::Io`] if the stream fails.
    pub fn write<M: Message>(&mut self, message: &M) -> Result<()> {
        self.enqueue(message)?;
        self.flush_pending()?;
        Ok(())
    }

    /// Serialize `message` and append it to the pending outbound frames
    /// without touching the stream.
    ///
    /// # Errors
    ///
    /// [`Error::FrameTooLarge`] or [`Error::Encoding`]; nothing is queued in
    /// either case.
    pub fn enqueue<M: Message>(&mut self, message: &M) -> Result<()> {
        self.scratch.clear();
        let tree = message.to_tree();

        let mut bounded = BoundedWriter::new(&mut self.scratch, self.max_frame_size);
        let encoded = self.encoding.encode(&tree, &mut bounded);
        if let Some(size) = bounded.overflow() {
            self.scratch.clear();
            return Err(Error::FrameTooLarge {
                size,
                limit: self.max_frame_size,
            });
        }
        encoded?;

        // The limit is clamped to u32::MAX, so the length always fits.
        let length = self.scratch.len() as u32;
        self.outbound.extend_from_slice(&length.to_be_bytes());
        self.outbound.extend_from_slice(&self.scratch);

        log::trace!(
            "[Framing] queued message id={} type={} ({} bytes)",
            message.id(),
            message.tag(),
            self.scratch.len()
        );
        Ok(())
    }

    /// Write as many pending bytes as the stream accepts without blocking.
    ///
    /// Returns `true` once nothing is pending. On `WouldBlock` returns
    /// `false`; the unwritten rest, possibly the tail of a frame, is kept for
    /// the next call.
    ///
    /// # Errors
    ///
    /// [`Error::Io`] if the stream fails. The pending bytes are then
    /// unusable and the channel should be dropped.
    pub fn flush_pending(&mut self) -> Result<bool> {
        while self.written < self.outbound.len() {
            match self.stream.write(&self.outbound[self.written..]) {
                Ok(0) => return Err(Error::Io(io::Error::from(io::ErrorKind::WriteZero))),
                Ok(n) => self.written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(Error::Io(e)),
            }
        }
        self.outbound.clear();
        self.written = 0;
        self.stream.flush()?;
        Ok(true)
    }

    /// Outbound bytes not yet accepted by the stream.
    pub fn pending(&self) -> usize {
        self.outbound.len() - self.written
    }

    /// Receive the next message, if one can be assembled without blocking.
    ///
    /// A frame whose body fails to decode or validate is consumed in full
    /// before the error is returned, so the stream stays aligned and the
    /// caller may keep receiving.
    ///
    /// # Errors
    ///
    /// Fatal: [`Error::FrameTooLarge`] for an oversized length prefix,
    /// [`Error::PeerClosed`] on end of stream, [`Error::Io`] on stream failure.
    /// Per-message: [`Error::Encoding`] and [`Error::Schema`].
    pub fn receive<M: Message>(&mut self) -> Result<Option<M>> {
        loop {
            if let Some(body_len) = self.buffered_frame()? {
                let end = LENGTH_PREFIX_SIZE + body_len;
                let decoded = self.decode::<M>(LENGTH_PREFIX_SIZE..end);
                self.inbound.drain(..end);
                return decoded.map(Some);
            }

            let start = self.inbound.len();
            self.inbound.resize(start + READ_CHUNK_SIZE, 0);
            let read = self.stream.read(&mut self.inbound[start..]);
            match read {
                Ok(0) => {
                    self.inbound.truncate(start);
                    return Err(Error::PeerClosed);
                }
                Ok(n) => self.inbound.truncate(start + n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.inbound.truncate(start);
                    return Ok(None);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                    self.inbound.truncate(start);
                }
                Err(e) => {
                    self.inbound.truncate(start);
                    return Err(Error::Io(e));
                }
            }
        }
    }

    /// Block until the next message arrives.
    ///
    /// Only meaningful on blocking streams; on a non-blocking stream this
    /// spins until data arrives.
    pub fn read<M: Message>(&mut self) -> Result<M> {
        loop {
            if let Some(message) = self.receive()? {
                return Ok(message);
            }
            std::thread::yield_now();
        }
    }

    /// Length of the first buffered frame's body, if the whole frame is here.
    fn buffered_frame(&self) -> Result<Option<usize>> {
        let Some(prefix) = self.inbound.get(..LENGTH_PREFIX_SIZE) else {
            return Ok(None);
        };
        let mut bytes = [0u8; LENGTH_PREFIX_SIZE];
        bytes.copy_from_slice(prefix);
        let body_len = u32::from_be_bytes(bytes) as usize;
        if body_len > self.max_frame_size {
            return Err(Error::FrameTooLarge {
                size: body_len,
                limit: self.max_frame_size,
            });
        }
        if self.inbound.len() < LENGTH_PREFIX_SIZE + body_len {
            return Ok(None);
        }
        Ok(Some(body_len))
    }

    fn decode<M: Message>(&self, range: std::ops::Range<usize>) -> Result<M> {
        let tree = self.encoding.decode(&self.inbound[range])?;
        let message = M::from_tree(&tree)?;
        log::trace!("[Framing] read message id={} type={}", message.id(), message.tag());
        Ok(message)
    }

    /// Bytes buffered but not yet consumed as frames.
    pub fn buffered(&self) -> usize {
        self.inbound.len()
    }

    /// Shared access to the underlying stream.
    pub fn stream(&self) -> &S {
        &self.stream
    }

    /// Exclusive access to the underlying stream.
    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Unwrap the channel, discarding buffered bytes.
    pub fn into_inner(self) -> S {
        self.stream
    }
}

/// Writer that refuses to grow its buffer past a limit.
struct BoundedWriter<'a> {
    buf: &'a mut Vec<u8>,
    limit: usize,
    overflow: Option<usize>,
}

impl<'a> BoundedWriter<'a> {
    fn new(buf: &'a mut Vec<u8>, limit: usize) -> Self {
        Self {
            buf,
            limit,
            overflow: None,
        }
    }

    /// Size the body would have reached when the limit was hit.
    fn overflow(&self) -> Option<usize> {
        self.overflow
    }
}

impl Write for BoundedWriter<'_> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let wanted = self.buf.len() + data.len();
        if wanted > self.limit {
            self.overflow = Some(wanted);
            return Err(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "frame size limit exceeded",
            ));
        }
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::{Batch, ComputeError, Lambda, LogEntry};
    use crate::protocol::{CborEncoding, ClientMessage, JsonEncoding, ServiceMessage};
    use std::io::Cursor;

    fn json_channel() -> FramingChannel<Cursor<Vec<u8>>> {
        FramingChannel::new(Cursor::new(Vec::new()), Box::new(JsonEncoding))
    }

    fn rewind(channel: &mut FramingChannel<Cursor<Vec<u8>>>) {
        channel.stream_mut().set_position(0);
    }

    #[test]
    fn test_client_messages_round_trip() {
        let messages = vec![
            ClientMessage::Batch { id: 1, batch: Batch::new(1, 100, vec![0, 1, 2, 254, 255]) },
            ClientMessage::Error { id: 2, error: ComputeError::new(12345, "bad") },
            ClientMessage::LogEntry { id: 3, entry: LogEntry::new(1, 100, "world!") },
            ClientMessage::Exit { id: 4 },
            ClientMessage::Heartbeat { id: 5 },
        ];
        let mut channel = json_channel();
        for message in &messages {
            channel.write(message).unwrap();
        }
        rewind(&mut channel);
        for message in &messages {
            let read: ClientMessage = channel.read().unwrap();
            assert_eq!(&read, message);
        }
    }

    #[test]
    fn test_service_messages_round_trip_cbor() {
        let messages = vec![
            ServiceMessage::Lambda { id: 10, lambda: Lambda::new(1, "return batch:upper()") },
            ServiceMessage::Batch { id: 11, batch: Batch::new(1, 100, b"hello".to_vec()) },
            ServiceMessage::Heartbeat { id: 12 },
            ServiceMessage::Exit { id: 13 },
        ];
        let mut channel = FramingChannel::new(Cursor::new(Vec::new()), Box::new(CborEncoding));
        for message in &messages {
            channel.write(message).unwrap();
        }
        rewind(&mut channel);
        for message in &messages {
            let read: ServiceMessage = channel.read().unwrap();
            assert_eq!(&read, message);
        }
    }

    #[test]
    fn test_length_prefix_is_big_endian_body_length() {
        let mut channel = json_channel();
        channel.write(&ClientMessage::Exit { id: 1 }).unwrap();
        let bytes = channel.stream().get_ref().clone();
        let length = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        assert_eq!(length, bytes.len() - LENGTH_PREFIX_SIZE);
        let body: serde_json::Value = serde_json::from_slice(&bytes[4..]).unwrap();
        assert_eq!(body["id"], 1);
        assert_eq!(body["type"], 3);
    }

    #[test]
    fn test_oversized_body_fails_without_writing() {
        let mut channel = json_channel().with_max_frame_size(64);
        let message = ServiceMessage::Batch { id: 1, batch: Batch::new(1, 1, vec![7u8; 256]) };
        let err = channel.write(&message).unwrap_err();
        assert!(matches!(err, Error::FrameTooLarge { limit: 64, .. }));
        assert!(err.is_fatal());
        assert!(channel.stream().get_ref().is_empty());
    }

    #[test]
    fn test_body_over_32_mib_is_rejected() {
        let mut channel = json_channel();
        let data = vec![0u8; MAX_FRAME_SIZE + 1];
        let message = ServiceMessage::Batch { id: 1, batch: Batch::new(1, 1, data) };
        let err = channel.write(&message).unwrap_err();
        match err {
            Error::FrameTooLarge { size, limit } => {
                assert_eq!(limit, MAX_FRAME_SIZE);
                assert!(size > MAX_FRAME_SIZE);
            }
            other => panic!("Expected FrameTooLarge, got: {other:?}"),
        }
        assert!(channel.stream().get_ref().is_empty());
    }

    #[test]
    fn test_oversized_length_prefix_is_fatal() {
        let bytes = u32::MAX.to_be_bytes().to_vec();
        let mut channel = FramingChannel::new(Cursor::new(bytes), Box::new(JsonEncoding));
        let err = channel.receive::<ClientMessage>().unwrap_err();
        assert!(matches!(err, Error::FrameTooLarge { .. }));
    }

    #[test]
    fn test_schema_violation_consumes_frame() {
        let mut raw = Vec::new();
        for body in [r#"{"id":1,"type":99}"#, r#"{"id":2,"type":3}"#] {
            raw.extend_from_slice(&(body.len() as u32).to_be_bytes());
            raw.extend_from_slice(body.as_bytes());
        }
        let mut channel = FramingChannel::new(Cursor::new(raw), Box::new(JsonEncoding));

        let err = channel.receive::<ClientMessage>().unwrap_err();
        match &err {
            Error::Schema(violation) => assert_eq!(violation.violations[0].entity, "type"),
            other => panic!("Expected Schema, got: {other:?}"),
        }
        assert!(!err.is_fatal());

        let next = channel.receive::<ClientMessage>().unwrap();
        assert_eq!(next, Some(ClientMessage::Exit { id: 2 }));
    }

    #[test]
    fn test_end_of_stream_is_peer_closed() {
        let mut channel = json_channel();
        let err = channel.receive::<ClientMessage>().unwrap_err();
        assert!(matches!(err, Error::PeerClosed));
    }

    #[test]
    fn test_partial_frame_stays_buffered() {
        let mut channel = json_channel();
        channel.write(&ClientMessage::Heartbeat { id: 1 }).unwrap();
        let full = channel.stream().get_ref().clone();

        // Feed only part of the frame through a non-blocking pipe stand-in.
        let mut partial = PartialStream { data: full[..5].to_vec(), pos: 0 };
        let mut reader = FramingChannel::new(&mut partial, Box::new(JsonEncoding));
        assert_eq!(reader.receive::<ClientMessage>().unwrap(), None);
        assert_eq!(reader.buffered(), 5);

        reader.stream_mut().data.extend_from_slice(&full[5..]);
        assert_eq!(
            reader.receive::<ClientMessage>().unwrap(),
            Some(ClientMessage::Heartbeat { id: 1 })
        );
        assert_eq!(reader.buffered(), 0);
    }

    #[test]
    fn test_round_trip_over_tcp() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let writer = std::thread::spawn(move || {
            let stream = std::net::TcpStream::connect(addr).unwrap();
            let mut channel = FramingChannel::new(stream, Box::new(JsonEncoding));
            channel
                .write(&ServiceMessage::Batch { id: 1, batch: Batch::new(1, 100, b"hello".to_vec()) })
                .unwrap();
        });
        let (stream, _) = listener.accept().unwrap();
        let mut channel = FramingChannel::new(stream, Box::new(JsonEncoding));
        let message: ServiceMessage = channel.read().unwrap();
        assert_eq!(
            message,
            ServiceMessage::Batch { id: 1, batch: Batch::new(1, 100, b"hello".to_vec()) }
        );
        writer.join().unwrap();
    }

    #[test]
    fn test_would_block_keeps_frame_pending() {
        let mut sink = ThrottledStream { accepted: Vec::new(), budget: 6 };
        let mut channel = FramingChannel::new(&mut sink, Box::new(JsonEncoding));

        channel.write(&ClientMessage::Heartbeat { id: 1 }).unwrap();
        channel.enqueue(&ClientMessage::Exit { id: 2 }).unwrap();
        assert!(channel.pending() > 0);
        assert!(!channel.flush_pending().unwrap());
        assert_eq!(channel.stream().accepted.len(), 6);

        channel.stream_mut().budget = usize::MAX;
        assert!(channel.flush_pending().unwrap());
        assert_eq!(channel.pending(), 0);

        let bytes = sink.accepted.clone();
        let mut reader = FramingChannel::new(Cursor::new(bytes), Box::new(JsonEncoding));
        assert_eq!(reader.read::<ClientMessage>().unwrap(), ClientMessage::Heartbeat { id: 1 });
        assert_eq!(reader.read::<ClientMessage>().unwrap(), ClientMessage::Exit { id: 2 });
    }

    #[test]
    fn test_failed_stream_write_is_fatal() {
        let mut channel = FramingChannel::new(BrokenStream, Box::new(JsonEncoding));
        let err = channel.write(&ClientMessage::Exit { id: 1 }).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
        assert!(err.is_fatal());
    }

    /// Stream that accepts `budget` bytes, then reports `WouldBlock`.
    struct ThrottledStream {
        accepted: Vec<u8>,
        budget: usize,
    }

    impl Read for ThrottledStream {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::from(io::ErrorKind::WouldBlock))
        }
    }

    impl Write for ThrottledStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.budget == 0 {
                return Err(io::Error::from(io::ErrorKind::WouldBlock));
            }
            let n = buf.len().min(self.budget);
            self.accepted.extend_from_slice(&buf[..n]);
            self.budget -= n;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Stream whose peer is gone.
    struct BrokenStream;

    impl Read for BrokenStream {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Ok(0)
        }
    }

    impl Write for BrokenStream {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::from(io::ErrorKind::BrokenPipe))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Stream that reports `WouldBlock` once its data is exhausted.
    struct PartialStream {
        data: Vec<u8>,
        pos: usize,
    }

    impl Read for PartialStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let remaining = &self.data[self.pos..];
            if remaining.is_empty() {
                return Err(io::Error::from(io::ErrorKind::WouldBlock));
            }
            let n = remaining.len().min(buf.len());
            buf[..n].copy_from_slice(&remaining[..n]);
            self.pos += n;
            Ok(n)
        }
    }

    impl Write for PartialStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }
}
