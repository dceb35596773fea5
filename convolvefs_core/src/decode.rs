//! Sequential sound-file decoding on top of Symphonia.
//!
//! [`SoundReader`] wraps the probe/format-reader/decoder triple behind a
//! single sequential interface: interleaved `f32` frames, pulled in
//! whatever granularity the caller needs. The container envelope is
//! sniffed from magic bytes up front because the convolving handler
//! chooses its output container from it before any packet is decoded.

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;

use log::debug;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{
    Decoder, DecoderOptions, CODEC_TYPE_NULL, CODEC_TYPE_PCM_F32BE, CODEC_TYPE_PCM_F32LE,
    CODEC_TYPE_PCM_F64BE, CODEC_TYPE_PCM_F64LE,
};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use crate::EngineError;

/// Container envelope of a sound file, detected from its magic bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Envelope {
    Wav,
    Flac,
    Ogg,
    Other,
}

/// Sample representation inside the container.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SampleKind {
    Pcm16,
    Pcm24,
    Pcm32,
    Float32,
}

impl SampleKind {
    /// Bit depth used for filter-config selection.
    pub fn bits(self) -> u32 {
        match self {
            SampleKind::Pcm16 => 16,
            SampleKind::Pcm24 => 24,
            SampleKind::Pcm32 | SampleKind::Float32 => 32,
        }
    }
}

/// The (rate, channels, sample kind, envelope) tuple describing a stream.
#[derive(Clone, Copy, Debug)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: usize,
    pub kind: SampleKind,
    pub envelope: Envelope,
}

/// Detect the container envelope from the file's first bytes.
///
/// FLAC detection deliberately checks the file itself rather than the
/// decoded stream: some containers carry FLAC-encoded audio without being
/// FLAC files, and those must not get the verbatim-header treatment.
pub fn sniff_envelope(file: &File) -> Envelope {
    let mut magic = [0u8; 12];
    let n = match file.read_at(&mut magic, 0) {
        Ok(n) => n,
        Err(_) => return Envelope::Other,
    };
    if n >= 4 && &magic[0..4] == b"fLaC" {
        Envelope::Flac
    } else if n >= 4 && &magic[0..4] == b"OggS" {
        Envelope::Ogg
    } else if n >= 12 && &magic[0..4] == b"RIFF" && &magic[8..12] == b"WAVE" {
        Envelope::Wav
    } else {
        Envelope::Other
    }
}

/// Sequential decoder for one sound file.
pub struct SoundReader {
    reader: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    format: AudioFormat,
    total_frames: Option<u64>,
    tags: Vec<(String, String)>,
    sample_buf: Option<SampleBuffer<f32>>,
    pending: Vec<f32>,
    pending_pos: usize,
    finished: bool,
}

impl std::fmt::Debug for SoundReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoundReader")
            .field("track_id", &self.track_id)
            .field("format", &self.format)
            .field("total_frames", &self.total_frames)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl SoundReader {
    /// Open `file` as a sound file. `hint_ext` is the file-name extension,
    /// if the caller knows one, and only speeds up probing.
    ///
    /// Anything the probe rejects comes back as
    /// [`EngineError::NotASoundFile`] so callers can fall back to serving
    /// the raw bytes.
    pub fn open(file: File, hint_ext: Option<&str>) -> Result<Self, EngineError> {
        let envelope = sniff_envelope(&file);

        let mut hint = Hint::new();
        if let Some(ext) = hint_ext {
            hint.with_extension(ext);
        }
        let mss = MediaSourceStream::new(Box::new(file), Default::default());
        let mut probed = match symphonia::default::get_probe().format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        ) {
            Ok(probed) => probed,
            Err(err) => {
                debug!("probe rejected input: {err}");
                return Err(EngineError::NotASoundFile);
            }
        };

        let mut tags = Vec::new();
        if let Some(metadata) = probed.metadata.get() {
            if let Some(rev) = metadata.current() {
                collect_tags(rev.tags(), &mut tags);
            }
        }
        let mut reader = probed.format;
        if let Some(rev) = reader.metadata().current() {
            collect_tags(rev.tags(), &mut tags);
        }

        let track = reader
            .default_track()
            .ok_or(EngineError::NotASoundFile)?;
        if track.codec_params.codec == CODEC_TYPE_NULL {
            return Err(EngineError::NotASoundFile);
        }
        let track_id = track.id;

        let sample_rate = track
            .codec_params
            .sample_rate
            .ok_or(EngineError::NotASoundFile)?;
        let channels = track
            .codec_params
            .channels
            .map(|c| c.count())
            .ok_or(EngineError::NotASoundFile)?;
        if channels == 0 {
            return Err(EngineError::NotASoundFile);
        }
        let total_frames = track.codec_params.n_frames;
        let kind = sample_kind(&track.codec_params);

        let decoder = match symphonia::default::get_codecs()
            .make(&track.codec_params, &DecoderOptions::default())
        {
            Ok(decoder) => decoder,
            Err(err) => {
                debug!("no decoder for input: {err}");
                return Err(EngineError::NotASoundFile);
            }
        };

        Ok(Self {
            reader,
            decoder,
            track_id,
            format: AudioFormat {
                sample_rate,
                channels,
                kind,
                envelope,
            },
            total_frames,
            tags,
            sample_buf: None,
            pending: Vec::new(),
            pending_pos: 0,
            finished: false,
        })
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    /// Total frame count as declared by the container, when it declares
    /// one (OGG streams frequently do not).
    pub fn total_frames(&self) -> Option<u64> {
        self.total_frames
    }

    /// String tags found in the container metadata, in encounter order.
    pub fn tags(&self) -> &[(String, String)] {
        &self.tags
    }

    /// Read up to `dst.len() / channels` interleaved frames into `dst`.
    ///
    /// Returns the number of whole frames read; 0 means end of stream.
    /// `dst.len()` must be a multiple of the channel count.
    pub fn read_frames(&mut self, dst: &mut [f32]) -> Result<usize, EngineError> {
        debug_assert_eq!(dst.len() % self.format.channels, 0);
        let mut filled = 0;

        while filled < dst.len() {
            if self.pending_pos < self.pending.len() {
                let n = (dst.len() - filled).min(self.pending.len() - self.pending_pos);
                dst[filled..filled + n]
                    .copy_from_slice(&self.pending[self.pending_pos..self.pending_pos + n]);
                self.pending_pos += n;
                filled += n;
                continue;
            }
            if self.finished {
                break;
            }

            let packet = match self.reader.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(ref err))
                    if err.kind() == io::ErrorKind::UnexpectedEof =>
                {
                    self.finished = true;
                    continue;
                }
                Err(SymphoniaError::ResetRequired) => {
                    self.finished = true;
                    continue;
                }
                Err(err) => return Err(err.into()),
            };
            if packet.track_id() != self.track_id {
                continue;
            }

            match self.decoder.decode(&packet) {
                Ok(decoded) => {
                    let needed = decoded.frames() * self.format.channels;
                    let realloc = match &self.sample_buf {
                        Some(buf) => (buf.capacity() as usize) < needed,
                        None => true,
                    };
                    if realloc {
                        self.sample_buf =
                            Some(SampleBuffer::new(decoded.capacity() as u64, *decoded.spec()));
                    }
                    let buf = self.sample_buf.as_mut().expect("just allocated");
                    buf.copy_interleaved_ref(decoded);
                    self.pending.clear();
                    self.pending.extend_from_slice(buf.samples());
                    self.pending_pos = 0;
                }
                // A corrupt packet is skipped, not fatal.
                Err(SymphoniaError::DecodeError(err)) => {
                    debug!("skipping undecodable packet: {err}");
                    continue;
                }
                Err(err) => return Err(err.into()),
            }
        }

        Ok(filled / self.format.channels)
    }
}

fn collect_tags(tags: &[symphonia::core::meta::Tag], out: &mut Vec<(String, String)>) {
    for tag in tags {
        out.push((tag.key.clone(), tag.value.to_string()));
    }
}

fn sample_kind(params: &symphonia::core::codecs::CodecParameters) -> SampleKind {
    match params.codec {
        CODEC_TYPE_PCM_F32LE | CODEC_TYPE_PCM_F32BE | CODEC_TYPE_PCM_F64LE
        | CODEC_TYPE_PCM_F64BE => SampleKind::Float32,
        _ => match params.bits_per_sample {
            Some(24) => SampleKind::Pcm24,
            Some(32) => SampleKind::Pcm32,
            _ => SampleKind::Pcm16,
        },
    }
}

/// Decode a whole sound file into interleaved `f32` samples. Used for
/// impulse-response files, which are small by construction.
pub(crate) fn read_sound_file(path: &Path) -> Result<(AudioFormat, Vec<f32>), EngineError> {
    let file = File::open(path)?;
    let ext = path.extension().and_then(|e| e.to_str()).map(str::to_owned);
    let mut reader = SoundReader::open(file, ext.as_deref())?;
    let format = reader.format();

    let mut samples = Vec::new();
    let mut chunk = vec![0.0f32; 4096 * format.channels];
    loop {
        let frames = reader.read_frames(&mut chunk)?;
        if frames == 0 {
            break;
        }
        samples.extend_from_slice(&chunk[..frames * format.channels]);
    }
    Ok((format, samples))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    fn write_pcm16_wav(path: &Path, sample_rate: u32, channels: u16, samples: &[i16]) {
        let mut file = File::create(path).expect("create wav");
        let data_len = (samples.len() * 2) as u32;
        let chunk_size = 36u32 + data_len;
        file.write_all(b"RIFF").unwrap();
        file.write_all(&chunk_size.to_le_bytes()).unwrap();
        file.write_all(b"WAVE").unwrap();
        file.write_all(b"fmt ").unwrap();
        file.write_all(&16u32.to_le_bytes()).unwrap();
        file.write_all(&1u16.to_le_bytes()).unwrap();
        file.write_all(&channels.to_le_bytes()).unwrap();
        file.write_all(&sample_rate.to_le_bytes()).unwrap();
        let byte_rate = sample_rate * channels as u32 * 2;
        file.write_all(&byte_rate.to_le_bytes()).unwrap();
        file.write_all(&(channels * 2).to_le_bytes()).unwrap();
        file.write_all(&16u16.to_le_bytes()).unwrap();
        file.write_all(b"data").unwrap();
        file.write_all(&data_len.to_le_bytes()).unwrap();
        for sample in samples {
            file.write_all(&sample.to_le_bytes()).unwrap();
        }
    }

    #[test]
    fn sniffs_wav_envelope() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        write_pcm16_wav(&path, 8_000, 1, &[0, 100, -100, 200]);
        let file = File::open(&path).unwrap();
        assert_eq!(sniff_envelope(&file), Envelope::Wav);
    }

    #[test]
    fn sniffs_other_for_plain_text() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("note.txt");
        std::fs::write(&path, "hello world, definitely not audio").unwrap();
        let file = File::open(&path).unwrap();
        assert_eq!(sniff_envelope(&file), Envelope::Other);
    }

    #[test]
    fn reads_wav_frames_sequentially() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        let samples: Vec<i16> = (0..512).map(|n| (n * 50) as i16).collect();
        write_pcm16_wav(&path, 8_000, 1, &samples);

        let mut reader = SoundReader::open(File::open(&path).unwrap(), Some("wav")).unwrap();
        let format = reader.format();
        assert_eq!(format.sample_rate, 8_000);
        assert_eq!(format.channels, 1);
        assert_eq!(format.kind, SampleKind::Pcm16);
        assert_eq!(format.envelope, Envelope::Wav);
        assert_eq!(reader.total_frames(), Some(512));

        let mut collected = Vec::new();
        let mut chunk = [0.0f32; 100];
        loop {
            let frames = reader.read_frames(&mut chunk).unwrap();
            if frames == 0 {
                break;
            }
            collected.extend_from_slice(&chunk[..frames]);
        }
        assert_eq!(collected.len(), 512);
        for (n, value) in collected.iter().enumerate() {
            let expected = (n as i32 * 50) as f32 / 32768.0;
            assert!(
                (value - expected).abs() < 1e-4,
                "frame {n}: expected {expected}, got {value}"
            );
        }
    }

    #[test]
    fn rejects_non_audio_input() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("note.txt");
        std::fs::write(&path, "just some text that is long enough to probe").unwrap();
        let err = SoundReader::open(File::open(&path).unwrap(), Some("txt")).unwrap_err();
        assert!(matches!(err, EngineError::NotASoundFile));
    }

    #[test]
    fn read_sound_file_collects_everything() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("imp.wav");
        write_pcm16_wav(&path, 44_100, 2, &[16384, -16384, 8192, -8192]);
        let (format, samples) = read_sound_file(&path).unwrap();
        assert_eq!(format.channels, 2);
        assert_eq!(samples.len(), 4);
        assert!((samples[0] - 0.5).abs() < 1e-3);
        assert!((samples[1] + 0.5).abs() < 1e-3);
    }
}
