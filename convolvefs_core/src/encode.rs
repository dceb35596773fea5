//! Streaming container writers over the conversion buffer.
//!
//! Both writers emit through [`ByteLog::snd_append`], so everything they
//! produce — headers included — is subject to the buffer's write gate.
//! That is what lets the convolving handler suppress a writer's header
//! while splicing a richer one from the source file.
//!
//! The FLAC path produces fixed-blocksize frames with verbatim
//! subframes: no compression, but valid for every decoder and emittable
//! strictly in stream order, which the conversion buffer requires.

use std::sync::Arc;

use crate::buffer::ByteLog;
use crate::EngineError;

/// Block size of generated FLAC frames. Also patched into spliced
/// STREAMINFO headers so they agree with the payload.
pub const FLAC_BLOCK_SIZE: usize = 4096;

/// Sequential sink for interleaved `f32` frames.
pub trait SampleSink: Send {
    /// Emit the container header (through the write gate).
    fn write_header(&mut self);

    /// Append interleaved frames to the payload.
    fn write_frames(&mut self, interleaved: &[f32]);

    /// Flush whatever the writer is still holding; the stream is complete
    /// after this.
    fn finish(&mut self);
}

/// Scale a float sample to a signed integer of the given bit depth.
fn quantize(x: f32, bits: u32) -> i32 {
    let scale = (1i64 << (bits - 1)) as f32;
    let v = (x * scale).round() as i64;
    v.clamp(-(1i64 << (bits - 1)), (1i64 << (bits - 1)) - 1) as i32
}

/// Payload variants the WAV writer can produce.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WavSample {
    Pcm16,
    Float32,
}

/// Streaming RIFF/WAVE writer.
pub struct WavWriter {
    sink: Arc<ByteLog>,
    sample: WavSample,
    channels: u16,
    sample_rate: u32,
    total_frames: Option<u64>,
    tags: Vec<(String, String)>,
}

impl WavWriter {
    pub fn new(
        sink: Arc<ByteLog>,
        sample: WavSample,
        channels: usize,
        sample_rate: u32,
        total_frames: Option<u64>,
        tags: Vec<(String, String)>,
    ) -> Result<Self, EngineError> {
        let channels = u16::try_from(channels)
            .ok()
            .filter(|&c| c > 0)
            .ok_or_else(|| EngineError::EncoderFailed("unsupported channel count".into()))?;
        Ok(Self {
            sink,
            sample,
            channels,
            sample_rate,
            total_frames,
            tags,
        })
    }

    fn bytes_per_sample(&self) -> u32 {
        match self.sample {
            WavSample::Pcm16 => 2,
            WavSample::Float32 => 4,
        }
    }

    /// Source tags rendered as a RIFF `LIST/INFO` chunk. Tags with no
    /// INFO equivalent are dropped; empty when nothing maps.
    fn info_list_chunk(&self) -> Vec<u8> {
        let mut entries = Vec::new();
        for (key, value) in &self.tags {
            let Some(id) = riff_info_id(key) else {
                continue;
            };
            let text = value.as_bytes();
            let ck_size = text.len() + 1; // trailing NUL
            entries.extend_from_slice(id);
            entries.extend_from_slice(&(ck_size as u32).to_le_bytes());
            entries.extend_from_slice(text);
            entries.push(0);
            if ck_size % 2 == 1 {
                entries.push(0); // chunks are word aligned
            }
        }
        if entries.is_empty() {
            return Vec::new();
        }
        let mut out = Vec::with_capacity(12 + entries.len());
        out.extend_from_slice(b"LIST");
        out.extend_from_slice(&((4 + entries.len()) as u32).to_le_bytes());
        out.extend_from_slice(b"INFO");
        out.extend_from_slice(&entries);
        out
    }
}

fn riff_info_id(key: &str) -> Option<&'static [u8; 4]> {
    match key.to_ascii_uppercase().as_str() {
        "TITLE" => Some(b"INAM"),
        "ARTIST" => Some(b"IART"),
        "ALBUM" => Some(b"IPRD"),
        "DATE" | "YEAR" => Some(b"ICRD"),
        "GENRE" => Some(b"IGNR"),
        "COMMENT" => Some(b"ICMT"),
        "COPYRIGHT" => Some(b"ICOP"),
        "SOFTWARE" | "ENCODER" => Some(b"ISFT"),
        "TRACKNUMBER" => Some(b"ITRK"),
        _ => None,
    }
}

impl SampleSink for WavWriter {
    fn write_header(&mut self) {
        let block_align = self.channels as u32 * self.bytes_per_sample();
        let byte_rate = self.sample_rate * block_align;
        // Float payloads get a fact chunk; its 12 bytes count into RIFF.
        let fact_len: u32 = match self.sample {
            WavSample::Pcm16 => 0,
            WavSample::Float32 => 12,
        };
        let info_list = self.info_list_chunk();

        // When the frame count is unknown the sizes are the streaming
        // placeholder; readers treat it as "until end of file".
        let (riff_size, data_len, fact_frames) = match self.total_frames {
            Some(total) => {
                let data = total.saturating_mul(block_align as u64);
                let data32 = u32::try_from(data).unwrap_or(u32::MAX);
                let riff = data32.saturating_add(36 + fact_len + info_list.len() as u32);
                (riff, data32, u32::try_from(total).unwrap_or(u32::MAX))
            }
            None => (u32::MAX, u32::MAX, u32::MAX),
        };

        let format_code: u16 = match self.sample {
            WavSample::Pcm16 => 1,
            WavSample::Float32 => 3,
        };
        let bits_per_sample = (self.bytes_per_sample() * 8) as u16;

        let mut out = Vec::with_capacity(44 + fact_len as usize);
        out.extend_from_slice(b"RIFF");
        out.extend_from_slice(&riff_size.to_le_bytes());
        out.extend_from_slice(b"WAVE");
        out.extend_from_slice(b"fmt ");
        out.extend_from_slice(&16u32.to_le_bytes());
        out.extend_from_slice(&format_code.to_le_bytes());
        out.extend_from_slice(&self.channels.to_le_bytes());
        out.extend_from_slice(&self.sample_rate.to_le_bytes());
        out.extend_from_slice(&byte_rate.to_le_bytes());
        out.extend_from_slice(&(block_align as u16).to_le_bytes());
        out.extend_from_slice(&bits_per_sample.to_le_bytes());
        if self.sample == WavSample::Float32 {
            out.extend_from_slice(b"fact");
            out.extend_from_slice(&4u32.to_le_bytes());
            out.extend_from_slice(&fact_frames.to_le_bytes());
        }
        out.extend_from_slice(&info_list);
        out.extend_from_slice(b"data");
        out.extend_from_slice(&data_len.to_le_bytes());
        self.sink.snd_append(&out);
    }

    fn write_frames(&mut self, interleaved: &[f32]) {
        let mut out = Vec::with_capacity(interleaved.len() * self.bytes_per_sample() as usize);
        match self.sample {
            WavSample::Pcm16 => {
                for &x in interleaved {
                    out.extend_from_slice(&(quantize(x, 16) as i16).to_le_bytes());
                }
            }
            WavSample::Float32 => {
                for &x in interleaved {
                    out.extend_from_slice(&x.to_le_bytes());
                }
            }
        }
        self.sink.snd_append(&out);
    }

    fn finish(&mut self) {}
}

/// Streaming FLAC writer: fixed block size, verbatim subframes.
pub struct FlacWriter {
    sink: Arc<ByteLog>,
    sample_rate: u32,
    channels: usize,
    bits: u32,
    total_frames: Option<u64>,
    tags: Vec<(String, String)>,
    pending: Vec<i32>,
    frame_index: u64,
}

impl FlacWriter {
    pub fn new(
        sink: Arc<ByteLog>,
        sample_rate: u32,
        channels: usize,
        bits: u32,
        total_frames: Option<u64>,
        tags: Vec<(String, String)>,
    ) -> Result<Self, EngineError> {
        if channels == 0 || channels > 8 {
            return Err(EngineError::EncoderFailed(format!(
                "FLAC cannot carry {channels} channels"
            )));
        }
        if bits != 16 && bits != 24 {
            return Err(EngineError::EncoderFailed(format!(
                "unsupported FLAC bit depth {bits}"
            )));
        }
        if sample_rate >= 1 << 20 {
            return Err(EngineError::EncoderFailed(format!(
                "sample rate {sample_rate} does not fit STREAMINFO"
            )));
        }
        Ok(Self {
            sink,
            sample_rate,
            channels,
            bits,
            total_frames,
            tags,
            pending: Vec::new(),
            frame_index: 0,
        })
    }

    fn emit_frame(&mut self, frames: usize) {
        debug_assert!(frames > 0 && frames <= FLAC_BLOCK_SIZE);
        let mut out = Vec::with_capacity(frames * self.channels * 3 + 16);

        // Sync code, mandatory zero, fixed blocking strategy.
        out.push(0xFF);
        out.push(0xF8);
        // Block size from the trailing 16-bit field, rate from STREAMINFO.
        out.push(0x70);
        let size_code: u8 = match self.bits {
            16 => 0b100,
            _ => 0b110,
        };
        out.push(((self.channels as u8 - 1) << 4) | (size_code << 1));
        encode_utf8_number(self.frame_index, &mut out);
        out.extend_from_slice(&((frames as u16) - 1).to_be_bytes());
        out.push(crc8(&out));

        for ch in 0..self.channels {
            // Verbatim subframe, no wasted bits.
            out.push(0x02);
            for frame in 0..frames {
                let sample = self.pending[frame * self.channels + ch];
                let be = sample.to_be_bytes();
                match self.bits {
                    16 => out.extend_from_slice(&be[2..4]),
                    _ => out.extend_from_slice(&be[1..4]),
                }
            }
        }

        let crc = crc16(&out);
        out.extend_from_slice(&crc.to_be_bytes());
        self.sink.snd_append(&out);

        self.pending.drain(..frames * self.channels);
        self.frame_index += 1;
    }
}

impl SampleSink for FlacWriter {
    fn write_header(&mut self) {
        let mut out = Vec::with_capacity(64);
        out.extend_from_slice(b"fLaC");

        let last_flag: u8 = if self.tags.is_empty() { 0x80 } else { 0x00 };
        out.push(last_flag); // STREAMINFO, type 0
        out.extend_from_slice(&[0, 0, 34]);
        out.extend_from_slice(&(FLAC_BLOCK_SIZE as u16).to_be_bytes());
        out.extend_from_slice(&(FLAC_BLOCK_SIZE as u16).to_be_bytes());
        out.extend_from_slice(&[0, 0, 0, 0, 0, 0]); // min/max frame size unknown
        let total = self.total_frames.unwrap_or(0) & ((1u64 << 36) - 1);
        let packed: u64 = ((self.sample_rate as u64) << 44)
            | (((self.channels as u64) - 1) << 41)
            | (((self.bits as u64) - 1) << 36)
            | total;
        out.extend_from_slice(&packed.to_be_bytes());
        // The MD5 of the convolved stream cannot be known up front;
        // all-zero means "not computed".
        out.extend_from_slice(&[0u8; 16]);

        if !self.tags.is_empty() {
            let vendor = concat!(env!("CARGO_PKG_NAME"), " ", env!("CARGO_PKG_VERSION"));
            let mut payload = Vec::new();
            payload.extend_from_slice(&(vendor.len() as u32).to_le_bytes());
            payload.extend_from_slice(vendor.as_bytes());
            payload.extend_from_slice(&(self.tags.len() as u32).to_le_bytes());
            for (key, value) in &self.tags {
                let entry = format!("{key}={value}");
                payload.extend_from_slice(&(entry.len() as u32).to_le_bytes());
                payload.extend_from_slice(entry.as_bytes());
            }
            out.push(0x80 | 4); // VORBIS_COMMENT, last block
            let len = (payload.len() as u32).to_be_bytes();
            out.extend_from_slice(&len[1..4]);
            out.extend_from_slice(&payload);
        }

        self.sink.snd_append(&out);
    }

    fn write_frames(&mut self, interleaved: &[f32]) {
        self.pending
            .extend(interleaved.iter().map(|&x| quantize(x, self.bits)));
        while self.pending.len() >= FLAC_BLOCK_SIZE * self.channels {
            self.emit_frame(FLAC_BLOCK_SIZE);
        }
    }

    fn finish(&mut self) {
        let frames = self.pending.len() / self.channels;
        if frames > 0 {
            self.emit_frame(frames);
        }
    }
}

/// The UTF-8-style variable length number used for FLAC frame indices.
fn encode_utf8_number(value: u64, out: &mut Vec<u8>) {
    let continuations: u32 = match value {
        0..=0x7F => {
            out.push(value as u8);
            return;
        }
        0x80..=0x7FF => 1,
        0x800..=0xFFFF => 2,
        0x1_0000..=0x1F_FFFF => 3,
        0x20_0000..=0x3FF_FFFF => 4,
        0x400_0000..=0x7FFF_FFFF => 5,
        _ => 6,
    };
    out.push(((0xFFu16 << (7 - continuations)) as u8) | (value >> (6 * continuations)) as u8);
    for i in (0..continuations).rev() {
        out.push(0x80 | ((value >> (6 * i)) & 0x3F) as u8);
    }
}

fn crc8(data: &[u8]) -> u8 {
    let mut crc: u8 = 0;
    for &byte in data {
        crc ^= byte;
        for _ in 0..8 {
            crc = if crc & 0x80 != 0 {
                (crc << 1) ^ 0x07
            } else {
                crc << 1
            };
        }
    }
    crc
}

fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x8005
            } else {
                crc << 1
            };
        }
    }
    crc
}
