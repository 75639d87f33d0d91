//! # COBS/R frame codec
//!
//! Every message on the serial link is stuffed with COBS/R ("reduced" consistent
//! overhead byte stuffing) so that `0x00` never appears inside a frame and can be
//! used as the frame terminator.
//!
//! COBS/R differs from plain COBS only in how the last run is written: when the
//! final data byte is greater than or equal to the length code that would be
//! written for the last run, the final data byte replaces the length code and is
//! removed from the end of the frame. The decoder recognises this case because the
//! length code then points past the end of the frame.

use thiserror::Error;

/// Byte value that ends a frame on the wire
pub const TERMINATOR: u8 = 0x00;

// Longest run of non-zero bytes a single length code can describe
const MAX_RUN_CODE: u8 = 0xFF;

/// Errors reported while decoding frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    /// A zero byte was found inside the frame body
    #[error("zero byte inside frame at offset {0}")]
    ZeroInFrame(usize),
    /// More bytes than the frame limit were received without a terminator
    #[error("frame exceeds {limit} bytes without terminator")]
    Oversized {
        /// The accumulation limit that was exceeded
        limit: usize,
    },
}

/// Worst-case length of the encoded form of `len` bytes, terminator excluded
pub const fn max_encoded_len(len: usize) -> usize {
    len + len / 254 + 1
}

/// Encode `src` into a new frame, including the trailing terminator
pub fn encode(src: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(max_encoded_len(src.len()) + 1);
    encode_into(src.iter().copied(), &mut frame);
    frame
}

/// Append the encoded form of `src` followed by the terminator to `dst`
///
/// Taking an iterator lets callers stuff a header and a payload in one pass
/// without first copying them into a contiguous buffer.
pub fn encode_into<I>(src: I, dst: &mut Vec<u8>)
where
    I: IntoIterator<Item = u8>,
{
    let mut code_index = dst.len();
    dst.push(0);
    let mut code: u8 = 1;
    let mut last: u8 = 0;

    for byte in src {
        last = byte;
        if byte == 0 {
            dst[code_index] = code;
            code_index = dst.len();
            dst.push(0);
            code = 1;
        } else {
            dst.push(byte);
            code += 1;
            if code == MAX_RUN_CODE {
                dst[code_index] = code;
                code_index = dst.len();
                dst.push(0);
                code = 1;
            }
        }
    }

    if last < code {
        dst[code_index] = code;
    } else {
        // The final data byte doubles as the length code of the last run
        dst[code_index] = last;
        dst.pop();
    }

    dst.push(TERMINATOR);
}

/// Decode one frame
///
/// A single trailing terminator is accepted and ignored.
///
/// # Errors
///
/// Returns [`FrameError::ZeroInFrame`] if the frame body contains a zero byte.
pub fn decode(frame: &[u8]) -> Result<Vec<u8>, FrameError> {
    let frame = frame.strip_suffix(&[TERMINATOR]).unwrap_or(frame);
    let mut out = Vec::with_capacity(frame.len());
    let mut pos = 0;

    while pos < frame.len() {
        let code = frame[pos];
        if code == 0 {
            return Err(FrameError::ZeroInFrame(pos));
        }
        pos += 1;

        let run = (code - 1) as usize;
        let remaining = frame.len() - pos;
        if run > remaining {
            // Reduced final run: the length code is the last data byte
            copy_run(&frame[pos..], pos, &mut out)?;
            out.push(code);
            break;
        }

        copy_run(&frame[pos..pos + run], pos, &mut out)?;
        pos += run;

        if pos >= frame.len() {
            break;
        }
        if code != MAX_RUN_CODE {
            out.push(0);
        }
    }

    Ok(out)
}

fn copy_run(run: &[u8], base: usize, out: &mut Vec<u8>) -> Result<(), FrameError> {
    if let Some(i) = run.iter().position(|&b| b == 0) {
        return Err(FrameError::ZeroInFrame(base + i));
    }
    out.extend_from_slice(run);
    Ok(())
}

/// Incremental frame splitter for a byte stream
///
/// Bytes are pushed one at a time; a decoded frame is returned whenever a
/// terminator completes one. Empty frames, such as the resynchronisation zero
/// sent ahead of every frame, are skipped.
///
/// When more than `max_len` bytes arrive without a terminator the partial frame
/// is dropped, an [`FrameError::Oversized`] error is reported once and every byte
/// up to and including the next terminator is discarded.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    max_len: usize,
    discarding: bool,
}

impl FrameDecoder {
    /// Create a decoder accepting encoded frames of up to `max_len` bytes
    pub fn new(max_len: usize) -> Self {
        FrameDecoder {
            buf: Vec::with_capacity(max_len),
            max_len,
            discarding: false,
        }
    }

    /// Feed one byte from the stream
    pub fn push(&mut self, byte: u8) -> Option<Result<Vec<u8>, FrameError>> {
        if byte == TERMINATOR {
            if self.discarding {
                self.discarding = false;
                return None;
            }
            if self.buf.is_empty() {
                return None;
            }
            let frame = decode(&self.buf);
            self.buf.clear();
            return Some(frame);
        }

        if self.discarding {
            return None;
        }

        if self.buf.len() >= self.max_len {
            self.buf.clear();
            self.discarding = true;
            return Some(Err(FrameError::Oversized { limit: self.max_len }));
        }

        self.buf.push(byte);
        None
    }

    /// Number of bytes buffered for the frame in progress
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const MAX_LEN: usize = 4 + 256;

    fn patterns(len: usize) -> Vec<Vec<u8>> {
        let mut lcg: u32 = 0x1234_5678 ^ len as u32;
        let random = (0..len)
            .map(|_| {
                lcg = lcg.wrapping_mul(1_103_515_245).wrapping_add(12_345);
                (lcg >> 16) as u8
            })
            .collect();
        vec![
            (0..len).map(|i| i as u8).collect(),
            (0..len).map(|i| 255 - i as u8).collect(),
            vec![0; len],
            vec![0xFF; len],
            (0..len).map(|i| if i % 7 == 0 { 0 } else { 0x80 }).collect(),
            random,
        ]
    }

    #[test]
    fn known_frames() {
        assert_eq!(encode(&[]), vec![0x01, 0x00]);
        assert_eq!(encode(&[0x00]), vec![0x01, 0x01, 0x00]);
        assert_eq!(encode(&[0x00, 0x01]), vec![0x01, 0x02, 0x01, 0x00]);
        assert_eq!(encode(&[0x01]), vec![0x02, 0x01, 0x00]);
        assert_eq!(encode(&[0x02]), vec![0x02, 0x00]);
        assert_eq!(encode(b"12345"), vec![b'5', b'1', b'2', b'3', b'4', 0x00]);
        assert_eq!(encode(&[0x11, 0x00, 0x05]), vec![0x02, 0x11, 0x05, 0x00]);
    }

    #[test]
    fn long_runs_use_full_length_code() {
        let data = vec![0x01; 253];
        let frame = encode(&data);
        assert_eq!(frame[0], 0xFE);
        assert_eq!(frame.len(), 1 + 253 + 1);
        assert_eq!(decode(&frame).unwrap(), data);

        let data = vec![0x42; 254];
        let frame = encode(&data);
        assert_eq!(frame[0], 0xFF);
        assert_eq!(frame.len(), 1 + 254 + 1);
        assert_eq!(decode(&frame).unwrap(), data);

        let mut data = vec![0x42; 254];
        data.push(0);
        assert_eq!(decode(&encode(&data)).unwrap(), data);
    }

    #[test]
    fn round_trip_every_length() {
        for len in 0..=MAX_LEN {
            for data in patterns(len) {
                let frame = encode(&data);
                assert!(frame.len() <= max_encoded_len(len) + 1, "len {len}");
                assert_eq!(frame.last(), Some(&TERMINATOR));
                assert!(!frame[..frame.len() - 1].contains(&TERMINATOR), "len {len}");
                assert_eq!(decode(&frame).unwrap(), data, "len {len}");
            }
        }
    }

    #[test]
    fn round_trip_every_final_byte() {
        for last in 0..=255u8 {
            for prefix in [0usize, 1, 3, 253] {
                let mut data = vec![0x33; prefix];
                data.push(last);
                assert_eq!(decode(&encode(&data)).unwrap(), data);
            }
        }
    }

    #[test]
    fn decode_rejects_embedded_zero() {
        assert_eq!(decode(&[0x03, 0x11, 0x00, 0x22]), Err(FrameError::ZeroInFrame(2)));
        assert_eq!(decode(&[0x00, 0x01]), Err(FrameError::ZeroInFrame(0)));
    }

    #[test]
    fn stream_decoder_splits_frames() {
        let mut stream = vec![0x00];
        stream.extend(encode(b"first"));
        stream.push(0x00);
        stream.extend(encode(&[0x00, 0x00]));

        let mut decoder = FrameDecoder::new(MAX_LEN);
        let frames: Vec<_> = stream.iter().filter_map(|&b| decoder.push(b)).collect();
        assert_eq!(frames, vec![Ok(b"first".to_vec()), Ok(vec![0x00, 0x00])]);
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn stream_decoder_resyncs_after_overflow() {
        let mut decoder = FrameDecoder::new(8);
        let mut results = Vec::new();
        for &b in [0x55u8; 20].iter().chain(encode(b"ok").iter()) {
            if let Some(r) = decoder.push(b) {
                results.push(r);
            }
        }
        // The oversized run swallows the next terminator, so "ok" is lost too
        assert_eq!(results, vec![Err(FrameError::Oversized { limit: 8 })]);

        let next: Vec<_> = encode(b"ok").iter().filter_map(|&b| decoder.push(b)).collect();
        assert_eq!(next, vec![Ok(b"ok".to_vec())]);
    }
}
