use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use uuid::Uuid;

pub const ID_SIZE: usize = 16;
pub const MAX_DATA_SIZE: usize = 1024;
pub const MAX_FRAME_SIZE: usize = 2 * ID_SIZE + MAX_DATA_SIZE;

#[derive(Debug, Error)]
pub enum FrameError {
    /// Clean end of stream at a frame boundary. Link-fatal for tunnel readers.
    #[error("end of stream")]
    Eof,
    #[error("could not read frame identifier")]
    MalformedId,
    #[error("stream ended before the frame delimiter")]
    Truncated,
    #[error("no delimiter within {MAX_DATA_SIZE} data bytes")]
    Oversized,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// One correlated chunk of bytes on the tunnel wire.
///
/// Serialized as `id ‖ data ‖ id`: the identifier doubles as the frame
/// delimiter, so there is no length prefix. An empty-data frame on the
/// client→relay path tells the relay to close the matching public socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub id: Uuid,
    pub data: Bytes,
}

impl Frame {
    pub fn new(id: Uuid, data: impl Into<Bytes>) -> Self {
        Self {
            id,
            data: data.into(),
        }
    }

    /// Session-close signal for `id`.
    pub fn close(id: Uuid) -> Self {
        Self::new(id, Bytes::new())
    }

    pub fn is_close(&self) -> bool {
        self.data.is_empty()
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(2 * ID_SIZE + self.data.len());
        buf.extend_from_slice(self.id.as_bytes());
        buf.extend_from_slice(&self.data);
        buf.extend_from_slice(self.id.as_bytes());
        buf.freeze()
    }
}

/// Incremental frame decoder over a raw byte stream.
///
/// Known limitation of the wire format: the identifier bytes are the only
/// delimiter, so `data` that happens to contain the identifier's own 16-byte
/// pattern is truncated at the first occurrence. Senders chunk at
/// `MAX_DATA_SIZE`, which lets the decoder bound its delimiter scan.
///
/// There is no resync point in this framing, so every decode error other
/// than an `Io` timeout is terminal for the stream: the decoder makes no
/// further progress and repeated calls return the same error. Readers must
/// treat `Eof`, `MalformedId`, `Truncated`, and `Oversized` as the end of
/// the link.
pub struct FrameDecoder<R> {
    reader: R,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> FrameDecoder<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: BytesMut::with_capacity(2 * MAX_FRAME_SIZE),
        }
    }

    /// Read the next frame.
    ///
    /// Cancel safe: parsing works over the owned buffer and the only await
    /// point is `read_buf`, so callers may wrap this in `tokio::time::timeout`
    /// to keep their loop responsive to cancellation. A timed-out call leaves
    /// the decoder mid-frame and the next call resumes where it left off.
    pub async fn read_frame(&mut self) -> Result<Frame, FrameError> {
        loop {
            if let Some(frame) = self.parse()? {
                return Ok(frame);
            }

            let n = self.reader.read_buf(&mut self.buf).await?;
            if n == 0 {
                return Err(if self.buf.is_empty() {
                    FrameError::Eof
                } else if self.buf.len() < ID_SIZE {
                    FrameError::MalformedId
                } else {
                    FrameError::Truncated
                });
            }
        }
    }

    fn parse(&mut self) -> Result<Option<Frame>, FrameError> {
        if self.buf.len() < ID_SIZE {
            return Ok(None);
        }

        let mut id_bytes = [0u8; ID_SIZE];
        id_bytes.copy_from_slice(&self.buf[..ID_SIZE]);
        let rest = &self.buf[ID_SIZE..];

        match find_delimiter(rest, &id_bytes) {
            Some(pos) if pos > MAX_DATA_SIZE => Err(FrameError::Oversized),
            Some(pos) => {
                let mut frame = self.buf.split_to(2 * ID_SIZE + pos);
                frame.advance(ID_SIZE);
                frame.truncate(pos);
                Ok(Some(Frame {
                    id: Uuid::from_bytes(id_bytes),
                    data: frame.freeze(),
                }))
            }
            None => {
                // A conforming sender never exceeds MAX_DATA_SIZE of data, so
                // a missing delimiter past that point cannot resolve later.
                if rest.len() >= MAX_DATA_SIZE + ID_SIZE {
                    return Err(FrameError::Oversized);
                }
                Ok(None)
            }
        }
    }
}

fn find_delimiter(haystack: &[u8], needle: &[u8; ID_SIZE]) -> Option<usize> {
    if haystack.len() < ID_SIZE {
        return None;
    }
    haystack.windows(ID_SIZE).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn roundtrip() {
        let (mut a, b) = tokio::io::duplex(MAX_FRAME_SIZE);
        let id = Uuid::new_v4();
        let frame = Frame::new(id, &b"GET /x"[..]);

        let encoded = frame.encode();
        assert_eq!(encoded.len(), 2 * ID_SIZE + 6);
        a.write_all(&encoded).await.unwrap();
        drop(a);

        let mut dec = FrameDecoder::new(b);
        let got = dec.read_frame().await.unwrap();
        assert_eq!(got.id, id);
        assert_eq!(&got.data[..], b"GET /x");
    }

    #[tokio::test]
    async fn back_to_back_frames_decode_in_order() {
        let (mut a, b) = tokio::io::duplex(8 * MAX_FRAME_SIZE);
        let id1 = Uuid::new_v4();
        let id2 = Uuid::new_v4();

        for frame in [
            Frame::new(id1, &b"first"[..]),
            Frame::new(id1, &b"second"[..]),
            Frame::new(id2, &b"other"[..]),
        ] {
            a.write_all(&frame.encode()).await.unwrap();
        }
        drop(a);

        let mut dec = FrameDecoder::new(b);
        let f1 = dec.read_frame().await.unwrap();
        let f2 = dec.read_frame().await.unwrap();
        let f3 = dec.read_frame().await.unwrap();
        assert_eq!((f1.id, &f1.data[..]), (id1, &b"first"[..]));
        assert_eq!((f2.id, &f2.data[..]), (id1, &b"second"[..]));
        assert_eq!((f3.id, &f3.data[..]), (id2, &b"other"[..]));

        assert!(matches!(dec.read_frame().await, Err(FrameError::Eof)));
    }

    #[tokio::test]
    async fn empty_data_frame_is_close_signal() {
        let (mut a, b) = tokio::io::duplex(MAX_FRAME_SIZE);
        let id = Uuid::new_v4();
        a.write_all(&Frame::close(id).encode()).await.unwrap();
        drop(a);

        let mut dec = FrameDecoder::new(b);
        let got = dec.read_frame().await.unwrap();
        assert_eq!(got.id, id);
        assert!(got.is_close());
    }

    #[tokio::test]
    async fn data_containing_id_truncates_at_first_occurrence() {
        // The delimiter hazard of the wire format: id bytes inside the
        // data terminate the frame early.
        let (mut a, b) = tokio::io::duplex(MAX_FRAME_SIZE);
        let id = Uuid::new_v4();
        let mut data = Vec::new();
        data.extend_from_slice(b"head");
        data.extend_from_slice(id.as_bytes());
        data.extend_from_slice(b"tail");
        a.write_all(&Frame::new(id, data).encode()).await.unwrap();
        drop(a);

        let mut dec = FrameDecoder::new(b);
        let got = dec.read_frame().await.unwrap();
        assert_eq!(got.id, id);
        assert_eq!(&got.data[..], b"head");
    }

    #[tokio::test]
    async fn short_identifier_fails_malformed() {
        let (mut a, b) = tokio::io::duplex(MAX_FRAME_SIZE);
        a.write_all(&[0xAB; ID_SIZE - 1]).await.unwrap();
        drop(a);

        let mut dec = FrameDecoder::new(b);
        assert!(matches!(
            dec.read_frame().await,
            Err(FrameError::MalformedId)
        ));
    }

    #[tokio::test]
    async fn missing_delimiter_fails_truncated() {
        let (mut a, b) = tokio::io::duplex(MAX_FRAME_SIZE);
        let id = Uuid::new_v4();
        a.write_all(id.as_bytes()).await.unwrap();
        a.write_all(b"no trailing delimiter").await.unwrap();
        drop(a);

        let mut dec = FrameDecoder::new(b);
        assert!(matches!(dec.read_frame().await, Err(FrameError::Truncated)));
    }

    #[tokio::test]
    async fn decode_errors_are_terminal_for_the_stream() {
        let (mut a, b) = tokio::io::duplex(MAX_FRAME_SIZE);
        let id = Uuid::new_v4();
        a.write_all(id.as_bytes()).await.unwrap();
        a.write_all(b"half a frame").await.unwrap();
        drop(a);

        let mut dec = FrameDecoder::new(b);
        // No resync point exists: the same error repeats on every call, so
        // readers must drop the link instead of retrying.
        for _ in 0..3 {
            assert!(matches!(dec.read_frame().await, Err(FrameError::Truncated)));
        }
    }

    #[tokio::test]
    async fn clean_eof_is_distinguished() {
        let (a, b) = tokio::io::duplex(16);
        drop(a);

        let mut dec = FrameDecoder::new(b);
        assert!(matches!(dec.read_frame().await, Err(FrameError::Eof)));
    }

    #[tokio::test]
    async fn delimiter_beyond_data_cap_fails_oversized() {
        let (mut a, b) = tokio::io::duplex(2 * MAX_FRAME_SIZE);
        let id = Uuid::new_v4();
        a.write_all(id.as_bytes()).await.unwrap();
        // v4 ids are never all zero, so this cannot contain the delimiter.
        a.write_all(&vec![0u8; MAX_DATA_SIZE + ID_SIZE])
            .await
            .unwrap();
        drop(a);

        let mut dec = FrameDecoder::new(b);
        assert!(matches!(dec.read_frame().await, Err(FrameError::Oversized)));
    }
}
