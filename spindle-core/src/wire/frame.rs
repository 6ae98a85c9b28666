//! Blocking frame reader and writer over `std::io` streams.
//!
//! A frame is a 4-byte big-endian length `N` followed by exactly `N` payload
//! bytes. `N = 0` is a valid, empty frame; data streams use it as their
//! end-of-stream sentinel. Fixed-width values are written without a prefix.
//!
//! No timeouts are applied here: reads block the calling thread until they
//! are satisfied or the stream fails.
use std::{
    io::{ErrorKind, Read, Write},
    sync::Arc,
};

use bytes::{Bytes, BytesMut};
use tracing::trace;

use super::{
    codec::{self, WirePrimitive},
    error::{Result, WireError},
    observer::{ProtocolAnomaly, ProtocolObserver, TracingObserver},
};

/// Tag byte of a null object reference.
pub const NULL_REFERENCE_TAG: u8 = b'n';
/// Tag byte of an object reference followed by its identifier.
pub const REFERENCE_TAG: u8 = b'j';

const LENGTH_PREFIX: usize = 4;
/// Payloads are buffered at most this many bytes ahead of what has arrived.
const READ_CHUNK: usize = 64 * 1024;

/// Reads primitives and frames from a blocking byte stream.
pub struct FrameReader<R> {
    inner: R,
    observer: Arc<dyn ProtocolObserver>,
}

impl<R: Read> FrameReader<R> {
    /// Create a reader that reports anomalies to [`TracingObserver`].
    pub fn new(inner: R) -> Self {
        Self::with_observer(inner, Arc::new(TracingObserver))
    }

    pub fn with_observer(inner: R, observer: Arc<dyn ProtocolObserver>) -> Self {
        Self { inner, observer }
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Fill `buf` completely, retrying short reads.
    ///
    /// Returns the number of bytes read before the stream closed, which is
    /// less than `buf.len()` only if the peer closed early.
    fn fill(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.inner.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(filled)
    }

    /// Read exactly `n` bytes, blocking until they arrive.
    ///
    /// Fails with [`WireError::UnexpectedEof`] if the stream closes first.
    /// The buffer grows with the data actually received, so a bogus length
    /// from the peer does not reserve memory up front.
    pub fn read_exact(&mut self, n: usize) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(n.min(READ_CHUNK));
        while buf.len() < n {
            let start = buf.len();
            let end = n.min(start + READ_CHUNK);
            buf.resize(end, 0);
            let received = self.fill(&mut buf[start..])?;
            if received < end - start {
                return Err(WireError::UnexpectedEof {
                    expected: n,
                    received: start + received,
                });
            }
        }
        Ok(buf.freeze())
    }

    fn read_fixed<T: WirePrimitive>(&mut self) -> Result<T> {
        let width = T::WIDTH.unwrap_or(LENGTH_PREFIX);
        let bytes = self.read_exact(width)?;
        codec::from_bytes(&bytes)
    }

    pub fn read_byte(&mut self) -> Result<u8> {
        Ok(self.read_exact(1)?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        self.read_fixed()
    }

    pub fn read_int(&mut self) -> Result<i32> {
        self.read_fixed()
    }

    pub fn read_long(&mut self) -> Result<i64> {
        self.read_fixed()
    }

    pub fn read_double(&mut self) -> Result<f64> {
        self.read_fixed()
    }

    fn payload_len(len: i32) -> Result<usize> {
        usize::try_from(len).map_err(|_| WireError::NegativeLength(len))
    }

    /// Read one length-prefixed frame.
    ///
    /// A zero length yields an empty payload, which callers may treat as a
    /// normal value or as an end-of-stream sentinel.
    pub fn read_frame(&mut self) -> Result<Bytes> {
        let len = Self::payload_len(self.read_int()?)?;
        trace!(len, "reading frame");
        if len == 0 {
            return Ok(Bytes::new());
        }
        self.read_exact(len)
    }

    /// Read one frame, or `None` if the stream closed cleanly before the
    /// first byte of its length prefix.
    ///
    /// A stream that closes part-way through a frame is still an error.
    pub fn try_read_frame(&mut self) -> Result<Option<Bytes>> {
        let mut prefix = [0u8; LENGTH_PREFIX];
        match self.fill(&mut prefix)? {
            0 => return Ok(None),
            LENGTH_PREFIX => {}
            received => {
                return Err(WireError::UnexpectedEof {
                    expected: LENGTH_PREFIX,
                    received,
                })
            }
        }
        let len = Self::payload_len(i32::from_be_bytes(prefix))?;
        if len == 0 {
            return Ok(Some(Bytes::new()));
        }
        self.read_exact(len).map(Some)
    }

    /// Read a length-prefixed UTF-8 string.
    pub fn read_string(&mut self) -> Result<String> {
        let payload = self.read_frame()?;
        codec::decode_str(&payload)
    }

    /// Read an object reference: a tag byte, then an identifier for `'j'`.
    ///
    /// An unrecognised tag is reported to the observer and decoded as null
    /// rather than failing, so a protocol mismatch surfaces as an observed
    /// anomaly instead of an error.
    pub fn read_object_reference(&mut self) -> Result<Option<String>> {
        match self.read_byte()? {
            NULL_REFERENCE_TAG => Ok(None),
            REFERENCE_TAG => self.read_string().map(Some),
            tag => {
                self.observer
                    .on_anomaly(&ProtocolAnomaly::UnexpectedReferenceTag { tag });
                Ok(None)
            }
        }
    }
}

/// Writes primitives and frames to a blocking byte stream.
///
/// Mirrors [`FrameReader`]: strings and frames carry a length prefix,
/// fixed-width values do not.
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    fn write_value<T: WirePrimitive>(&mut self, value: &T) -> Result<()> {
        self.inner.write_all(&codec::to_bytes(value))?;
        Ok(())
    }

    pub fn write_byte(&mut self, value: u8) -> Result<()> {
        self.inner.write_all(&[value])?;
        Ok(())
    }

    pub fn write_bool(&mut self, value: bool) -> Result<()> {
        self.write_value(&value)
    }

    pub fn write_int(&mut self, value: i32) -> Result<()> {
        self.write_value(&value)
    }

    pub fn write_long(&mut self, value: i64) -> Result<()> {
        self.write_value(&value)
    }

    pub fn write_double(&mut self, value: f64) -> Result<()> {
        self.write_value(&value)
    }

    fn write_len(&mut self, len: usize) -> Result<()> {
        let len = i32::try_from(len).map_err(|_| WireError::FrameTooLarge(len))?;
        self.write_int(len)
    }

    /// Write one length-prefixed frame.
    pub fn write_frame(&mut self, payload: &[u8]) -> Result<()> {
        self.write_len(payload.len())?;
        self.inner.write_all(payload)?;
        Ok(())
    }

    /// Write the zero-length frame that terminates a data stream.
    pub fn write_end_of_stream(&mut self) -> Result<()> {
        self.write_int(0)
    }

    /// Write a string, always with its length prefix.
    pub fn write_string(&mut self, value: &str) -> Result<()> {
        self.write_frame(value.as_bytes())
    }

    pub fn write_object_reference(&mut self, id: Option<&str>) -> Result<()> {
        match id {
            None => self.write_byte(NULL_REFERENCE_TAG),
            Some(id) => {
                self.write_byte(REFERENCE_TAG)?;
                self.write_string(id)
            }
        }
    }

    pub fn flush(&mut self) -> Result<()> {
        self.inner.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::wire::CountingObserver;

    /// A reader that hands out at most `chunk` bytes per call and is
    /// interrupted every other call.
    struct Trickle {
        data: Cursor<Vec<u8>>,
        chunk: usize,
        calls: usize,
    }

    impl Trickle {
        fn new(data: Vec<u8>, chunk: usize) -> Self {
            Self {
                data: Cursor::new(data),
                chunk,
                calls: 0,
            }
        }
    }

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.calls += 1;
            if self.calls % 2 == 0 {
                return Err(ErrorKind::Interrupted.into());
            }
            let n = buf.len().min(self.chunk);
            self.data.read(&mut buf[..n])
        }
    }

    fn written(f: impl FnOnce(&mut FrameWriter<Vec<u8>>) -> Result<()>) -> Vec<u8> {
        let mut writer = FrameWriter::new(Vec::new());
        f(&mut writer).unwrap();
        writer.into_inner()
    }

    #[test]
    fn frames_survive_arbitrary_chunking() {
        let payloads: Vec<Vec<u8>> = vec![
            vec![],
            vec![7],
            (0..4096).map(|i| (i % 251) as u8).collect(),
            b"tail".to_vec(),
        ];
        let bytes = written(|w| payloads.iter().try_for_each(|p| w.write_frame(p)));

        for chunk in [1, 3, 7, 4096] {
            let mut reader = FrameReader::new(Trickle::new(bytes.clone(), chunk));
            for expected in &payloads {
                let frame = reader.read_frame().unwrap();
                assert_eq!(frame.len(), expected.len());
                assert_eq!(&frame[..], &expected[..]);
            }
            assert!(reader.try_read_frame().unwrap().is_none());
        }
    }

    #[test]
    fn empty_frame_is_distinct_from_absent_frame() {
        let bytes = written(|w| w.write_end_of_stream());
        let mut reader = FrameReader::new(Cursor::new(bytes));
        assert_eq!(reader.try_read_frame().unwrap(), Some(Bytes::new()));
        assert_eq!(reader.try_read_frame().unwrap(), None);
    }

    #[test]
    fn closed_stream_is_premature_end() {
        let mut reader = FrameReader::new(Cursor::new(vec![0, 0, 0, 10, 1, 2, 3]));
        assert!(matches!(
            reader.read_frame().unwrap_err(),
            WireError::UnexpectedEof {
                expected: 10,
                received: 3
            }
        ));

        let mut reader = FrameReader::new(Cursor::new(vec![0, 0]));
        assert!(matches!(
            reader.try_read_frame().unwrap_err(),
            WireError::UnexpectedEof {
                expected: 4,
                received: 2
            }
        ));

        let mut reader = FrameReader::new(Cursor::new(Vec::new()));
        assert!(matches!(
            reader.read_int().unwrap_err(),
            WireError::UnexpectedEof { .. }
        ));
    }

    #[test]
    fn large_frames_span_several_chunks() {
        let payload: Vec<u8> = (0..200_000u32).map(|i| i as u8).collect();
        let bytes = written(|w| w.write_frame(&payload));
        let mut reader = FrameReader::new(Cursor::new(bytes));
        assert_eq!(reader.read_frame().unwrap(), payload);
    }

    #[test]
    fn oversized_length_fails_on_the_data_received() {
        let mut bytes = i32::MAX.to_be_bytes().to_vec();
        bytes.extend_from_slice(&[7; 100_000]);
        let mut reader = FrameReader::new(Cursor::new(bytes));
        assert!(matches!(
            reader.read_frame().unwrap_err(),
            WireError::UnexpectedEof {
                expected,
                received: 100_000
            } if expected == i32::MAX as usize
        ));
    }

    #[test]
    fn negative_frame_length_is_rejected() {
        let bytes = written(|w| w.write_int(-3));
        let mut reader = FrameReader::new(Cursor::new(bytes));
        assert!(matches!(
            reader.read_frame().unwrap_err(),
            WireError::NegativeLength(-3)
        ));
    }

    #[test]
    fn primitives_are_written_without_prefix() {
        let bytes = written(|w| {
            w.write_int(1)?;
            w.write_long(-1)?;
            w.write_double(2.5)?;
            w.write_bool(true)?;
            w.write_string("hé")
        });
        assert_eq!(bytes.len(), 4 + 8 + 8 + 1 + 4 + 3);
        assert_eq!(&bytes[..4], &[0, 0, 0, 1]);
        assert_eq!(&bytes[21..25], &[0, 0, 0, 3]);

        let mut reader = FrameReader::new(Trickle::new(bytes, 2));
        assert_eq!(reader.read_int().unwrap(), 1);
        assert_eq!(reader.read_long().unwrap(), -1);
        assert_eq!(reader.read_double().unwrap(), 2.5);
        assert!(reader.read_bool().unwrap());
        assert_eq!(reader.read_string().unwrap(), "hé");
    }

    #[test]
    fn object_references_decode() {
        let bytes = written(|w| {
            w.write_object_reference(None)?;
            w.write_object_reference(Some("rdd-17"))
        });
        let observer = Arc::new(CountingObserver::new());
        let mut reader = FrameReader::with_observer(Cursor::new(bytes), observer.clone());
        assert_eq!(reader.read_object_reference().unwrap(), None);
        assert_eq!(
            reader.read_object_reference().unwrap().as_deref(),
            Some("rdd-17")
        );
        assert_eq!(observer.count(), 0);
    }

    #[test]
    fn unknown_reference_tag_is_null_and_observed() {
        let observer = Arc::new(CountingObserver::new());
        let mut reader =
            FrameReader::with_observer(Cursor::new(vec![b'x', b'n']), observer.clone());

        assert_eq!(reader.read_object_reference().unwrap(), None);
        assert_eq!(observer.count(), 1);
        assert_eq!(
            observer.last(),
            Some(ProtocolAnomaly::UnexpectedReferenceTag { tag: b'x' })
        );

        // The stream stays aligned on the following byte.
        assert_eq!(reader.read_object_reference().unwrap(), None);
        assert_eq!(observer.count(), 1);
    }
}
