/*
 * Copyright 2025 Security Union LLC
 *
 * Licensed under either of
 *
 * * Apache License, Version 2.0
 *   (http://www.apache.org/licenses/LICENSE-2.0)
 * * MIT license
 *   (http://opensource.org/licenses/MIT)
 *
 * at your option.
 *
 * Unless you explicitly state otherwise, any contribution intentionally
 * submitted for inclusion in the work by you, as defined in the Apache-2.0
 * license, shall be dual licensed as above, without any additional terms or
 * conditions.
 */

//! Reassembly of whole JPEG frames from an unframed byte stream.
//!
//! Pure and deterministic: no timers, no I/O. Feed it chunks in order and it
//! yields every complete SOI..EOI slice that passes the size filter.

use bytes::Bytes;

use crate::config::FramerConfig;

const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];

#[derive(Debug)]
pub struct MjpegFramer {
    config: FramerConfig,
    buf: Vec<u8>,
    emitted: u64,
    rejected: u64,
    desyncs: u64,
}

impl MjpegFramer {
    pub fn new(config: FramerConfig) -> Self {
        Self {
            config,
            buf: Vec::with_capacity(64 * 1024),
            emitted: 0,
            rejected: 0,
            desyncs: 0,
        }
    }

    /// Consume one chunk, returning every complete frame it unlocked.
    ///
    /// Frames outside `[min_bytes, max_bytes]` are counted in `rejected` and
    /// withheld. When the rolling buffer exceeds `buffer_max` without
    /// producing a frame the buffer is discarded and `desyncs` increments;
    /// the stream recovers at the next intact SOI.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();

        loop {
            let Some(soi) = find_marker(&self.buf, SOI) else {
                // Nothing but garbage; keep a trailing 0xFF in case the SOI
                // marker itself straddles the chunk boundary.
                let keep = usize::from(self.buf.last() == Some(&0xFF));
                let len = self.buf.len();
                self.buf.drain(..len - keep);
                break;
            };
            // Garbage before the first SOI is dropped.
            if soi > 0 {
                self.buf.drain(..soi);
            }

            let Some(eoi_rel) = find_marker(&self.buf[SOI.len()..], EOI) else {
                if self.buf.len() > self.config.buffer_max {
                    self.buf.clear();
                    self.desyncs += 1;
                }
                break;
            };
            let end = SOI.len() + eoi_rel + EOI.len();

            let len = end;
            if (self.config.min_bytes..=self.config.max_bytes).contains(&len) {
                frames.push(Bytes::copy_from_slice(&self.buf[..end]));
                self.emitted += 1;
            } else {
                self.rejected += 1;
            }
            self.buf.drain(..end);
        }

        frames
    }

    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    pub fn rejected(&self) -> u64 {
        self.rejected
    }

    pub fn desyncs(&self) -> u64 {
        self.desyncs
    }

    /// Bytes currently held waiting for the rest of a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

fn find_marker(haystack: &[u8], marker: [u8; 2]) -> Option<usize> {
    haystack
        .windows(2)
        .position(|window| window == marker)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> FramerConfig {
        FramerConfig {
            min_bytes: 8,
            max_bytes: 1024,
            buffer_max: 4096,
        }
    }

    /// A well-formed SOI..EOI blob of exactly `len` bytes.
    fn jpeg(len: usize) -> Vec<u8> {
        assert!(len >= 4);
        let mut frame = vec![0xFF, 0xD8];
        frame.resize(len - 2, 0xAA);
        frame.extend_from_slice(&[0xFF, 0xD9]);
        frame
    }

    #[test]
    fn emits_frames_in_order_with_prefix_and_suffix() {
        let mut framer = MjpegFramer::new(small_config());
        let frames = [jpeg(16), jpeg(32), jpeg(24)];

        let mut stream = vec![0x00, 0x01, 0x02];
        for frame in &frames {
            stream.extend_from_slice(frame);
        }
        stream.extend_from_slice(&[0xFF, 0xD8, 0xAA]); // trailing partial frame

        let out = framer.push(&stream);
        assert_eq!(out.len(), 3);
        for (got, want) in out.iter().zip(frames.iter()) {
            assert_eq!(got.as_ref(), want.as_slice());
        }
        assert_eq!(framer.emitted(), 3);
        assert_eq!(framer.buffered(), 3); // partial frame retained
    }

    #[test]
    fn reassembles_across_arbitrary_chunk_boundaries() {
        let frames = [jpeg(100), jpeg(57), jpeg(200)];
        let mut stream = Vec::new();
        for frame in &frames {
            stream.extend_from_slice(frame);
        }

        for chunk_size in [1usize, 2, 3, 7, 64] {
            let mut framer = MjpegFramer::new(small_config());
            let mut out = Vec::new();
            for chunk in stream.chunks(chunk_size) {
                out.extend(framer.push(chunk));
            }
            assert_eq!(out.len(), 3, "chunk size {chunk_size}");
            for (got, want) in out.iter().zip(frames.iter()) {
                assert_eq!(got.as_ref(), want.as_slice());
            }
        }
    }

    #[test]
    fn size_filter_counts_but_does_not_emit() {
        let mut framer = MjpegFramer::new(small_config());
        let mut stream = jpeg(4); // below min
        stream.extend_from_slice(&jpeg(16));
        stream.extend_from_slice(&jpeg(2000)); // above max
        let out = framer.push(&stream);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].len(), 16);
        assert_eq!(framer.rejected(), 2);
        assert_eq!(framer.emitted(), 1);
    }

    #[test]
    fn buffer_overflow_resets_and_recovers() {
        let mut framer = MjpegFramer::new(small_config());
        // SOI then endless payload with no EOI.
        let mut garbage = vec![0xFF, 0xD8];
        garbage.resize(5000, 0xAA);
        assert!(framer.push(&garbage).is_empty());
        assert_eq!(framer.desyncs(), 1);
        assert_eq!(framer.buffered(), 0);

        // A clean frame right after the reset still comes through.
        let out = framer.push(&jpeg(20));
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn garbage_only_input_is_dropped() {
        let mut framer = MjpegFramer::new(small_config());
        assert!(framer.push(&[0x00; 128]).is_empty());
        assert_eq!(framer.buffered(), 0);

        // A split SOI across the garbage boundary survives.
        assert!(framer.push(&[0x00, 0x00, 0xFF]).is_empty());
        assert_eq!(framer.buffered(), 1);
        let mut rest = vec![0xD8];
        rest.resize(13, 0xAA);
        rest.extend_from_slice(&[0xFF, 0xD9]);
        let out = framer.push(&rest);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].len(), 16);
    }
}
