use super::wire::WireError;

pub const FRAME_HEADER_LEN: usize = 4;
/// Largest payload a single frame can describe with its u16 length field.
pub const MAX_FRAME_PAYLOAD: usize = u16::MAX as usize;
/// The logical payload continues in the next frame of the same type.
pub const FLAG_MORE: u8 = 0x80;
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 8 * 1024 * 1024;

/// One reassembled logical frame. `frame_type` stays raw so unknown types survive decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: u8,
    pub flags: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(frame_type: u8, payload: Vec<u8>) -> Self {
        Self {
            frame_type,
            flags: 0,
            payload,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        encode_frames(self.frame_type, self.flags, &self.payload)
    }
}

/// Serializes a logical payload, splitting it into a `FLAG_MORE` chain when it does not
/// fit a single frame.
pub fn encode_frames(frame_type: u8, flags: u8, payload: &[u8]) -> Vec<u8> {
    let flags = flags & !FLAG_MORE;
    if payload.len() <= MAX_FRAME_PAYLOAD {
        let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
        write_frame(&mut buf, frame_type, flags, payload);
        return buf;
    }

    let chunks = payload.len().div_ceil(MAX_FRAME_PAYLOAD);
    let mut buf = Vec::with_capacity(payload.len() + chunks * FRAME_HEADER_LEN);
    let mut iter = payload.chunks(MAX_FRAME_PAYLOAD).peekable();
    while let Some(chunk) = iter.next() {
        let chunk_flags = if iter.peek().is_some() {
            flags | FLAG_MORE
        } else {
            flags
        };
        write_frame(&mut buf, frame_type, chunk_flags, chunk);
    }
    buf
}

fn write_frame(buf: &mut Vec<u8>, frame_type: u8, flags: u8, chunk: &[u8]) {
    buf.push(frame_type);
    buf.push(flags);
    buf.extend_from_slice(&(chunk.len() as u16).to_be_bytes());
    buf.extend_from_slice(chunk);
}

struct PartialFrame {
    frame_type: u8,
    flags: u8,
    payload: Vec<u8>,
}

impl PartialFrame {
    fn new(frame_type: u8, flags: u8) -> Self {
        Self {
            frame_type,
            flags: flags & !FLAG_MORE,
            payload: Vec::new(),
        }
    }
}

/// Splits transport messages into frames and reassembles `FLAG_MORE` chains.
///
/// A chain may span several transport messages, so the reader keeps the partial payload
/// between calls to [`FrameReader::feed`].
pub struct FrameReader {
    max_message_bytes: usize,
    partial: Option<PartialFrame>,
    /// Type of an oversized chain whose remaining chunks are dropped.
    skipping: Option<u8>,
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_BYTES)
    }
}

impl FrameReader {
    pub fn new(max_message_bytes: usize) -> Self {
        Self {
            max_message_bytes,
            partial: None,
            skipping: None,
        }
    }

    pub fn has_partial(&self) -> bool {
        self.partial.is_some()
    }

    /// Consumes one transport message. Each complete logical frame or framing error is
    /// reported in order; a truncated trailing frame ends the message.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Result<Frame, WireError>> {
        let mut out = Vec::new();
        let mut pos = 0;
        while pos < bytes.len() {
            let Some(header) = bytes.get(pos..pos + FRAME_HEADER_LEN) else {
                out.push(Err(WireError::UnexpectedEof));
                break;
            };
            let frame_type = header[0];
            let flags = header[1];
            let len = u16::from_be_bytes([header[2], header[3]]) as usize;
            let start = pos + FRAME_HEADER_LEN;
            let Some(chunk) = bytes.get(start..start + len) else {
                out.push(Err(WireError::LengthMismatch {
                    declared: len,
                    available: bytes.len() - start,
                }));
                break;
            };
            pos = start + len;
            self.absorb(frame_type, flags, chunk, &mut out);
        }
        out
    }

    fn absorb(
        &mut self,
        frame_type: u8,
        flags: u8,
        chunk: &[u8],
        out: &mut Vec<Result<Frame, WireError>>,
    ) {
        let more = flags & FLAG_MORE != 0;

        if let Some(skipped) = self.skipping {
            if skipped == frame_type {
                if !more {
                    self.skipping = None;
                }
                return;
            }
            self.skipping = None;
        }

        let mut partial = match self.partial.take() {
            Some(partial) if partial.frame_type == frame_type => partial,
            Some(_) => {
                out.push(Err(WireError::InvalidData("interrupted frame chain")));
                PartialFrame::new(frame_type, flags)
            }
            None => PartialFrame::new(frame_type, flags),
        };

        if partial.payload.len() + chunk.len() > self.max_message_bytes {
            out.push(Err(WireError::PayloadTooLarge {
                limit: self.max_message_bytes,
            }));
            if more {
                self.skipping = Some(frame_type);
            }
            return;
        }
        partial.payload.extend_from_slice(chunk);

        if more {
            self.partial = Some(partial);
        } else {
            out.push(Ok(Frame {
                frame_type: partial.frame_type,
                flags: partial.flags,
                payload: partial.payload,
            }));
        }
    }
}

/// Decodes exactly one complete logical frame from `bytes`.
pub fn decode_single_frame(bytes: &[u8]) -> Result<Frame, WireError> {
    let mut reader = FrameReader::default();
    let mut results = reader.feed(bytes).into_iter();
    match results.next() {
        Some(result) if !reader.has_partial() => result,
        Some(Err(err)) => Err(err),
        _ => Err(WireError::UnexpectedEof),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn header_is_big_endian_length() {
        let bytes = Frame::new(2, vec![1, 2, 3]).encode();
        assert_eq!(bytes, vec![2, 0, 0, 3, 1, 2, 3]);
    }

    #[test_timeout::timeout]
    fn reader_splits_concatenated_frames() {
        let mut bytes = Frame::new(1, vec![9]).encode();
        bytes.extend(Frame::new(4, vec![7, 7]).encode());
        let frames: Vec<_> = FrameReader::default()
            .feed(&bytes)
            .into_iter()
            .collect::<Result<_, _>>()
            .expect("frames");
        assert_eq!(frames, vec![Frame::new(1, vec![9]), Frame::new(4, vec![7, 7])]);
    }

    #[test_timeout::timeout]
    fn large_payload_is_chained_and_reassembled() {
        let payload: Vec<u8> = (0..(MAX_FRAME_PAYLOAD * 2 + 10)).map(|i| i as u8).collect();
        let bytes = encode_frames(2, 0, &payload);
        assert_eq!(bytes[1] & FLAG_MORE, FLAG_MORE);
        let frame = decode_single_frame(&bytes).expect("reassembled");
        assert_eq!(frame.payload, payload);
        assert_eq!(frame.flags, 0);
    }

    #[test_timeout::timeout]
    fn chain_spans_transport_messages() {
        let mut reader = FrameReader::default();
        let first = {
            let mut buf = Vec::new();
            write_frame(&mut buf, 2, FLAG_MORE, &[1, 2]);
            buf
        };
        assert!(reader.feed(&first).is_empty());
        assert!(reader.has_partial());
        let second = Frame::new(2, vec![3]).encode();
        let frames = reader.feed(&second);
        assert_eq!(frames, vec![Ok(Frame::new(2, vec![1, 2, 3]))]);
    }

    #[test_timeout::timeout]
    fn truncated_frame_reports_length_mismatch() {
        let mut bytes = Frame::new(2, vec![1, 2, 3, 4]).encode();
        bytes.truncate(6);
        let results = FrameReader::default().feed(&bytes);
        assert_eq!(
            results,
            vec![Err(WireError::LengthMismatch {
                declared: 4,
                available: 2
            })]
        );
    }

    #[test_timeout::timeout]
    fn interrupted_chain_is_rejected() {
        let mut bytes = Vec::new();
        write_frame(&mut bytes, 2, FLAG_MORE, &[1]);
        write_frame(&mut bytes, 3, 0, &[5]);
        let results = FrameReader::default().feed(&bytes);
        assert_eq!(results.len(), 2);
        assert!(results[0].is_err());
        assert_eq!(results[1], Ok(Frame::new(3, vec![5])));
    }

    #[test_timeout::timeout]
    fn reassembly_is_bounded() {
        let mut reader = FrameReader::new(4);
        let mut bytes = Vec::new();
        write_frame(&mut bytes, 2, FLAG_MORE, &[1, 2, 3]);
        write_frame(&mut bytes, 2, FLAG_MORE, &[4, 5]);
        write_frame(&mut bytes, 2, 0, &[6]);
        write_frame(&mut bytes, 4, 0, &[1]);
        let results = reader.feed(&bytes);
        assert_eq!(
            results,
            vec![
                Err(WireError::PayloadTooLarge { limit: 4 }),
                Ok(Frame::new(4, vec![1]))
            ]
        );
    }
}
