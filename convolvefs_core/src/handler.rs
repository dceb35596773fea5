//! Per-open file handlers.
//!
//! A handler serves positional reads and stat for one open virtual file.
//! [`PassThroughHandler`] hands the underlying bytes through unchanged;
//! [`SndFileHandler`] runs decode → convolve → encode on demand and
//! serves the produced container from its conversion buffer. Which one a
//! path gets is decided at open time: anything that is not a sound file,
//! or has no filter configured, falls back to pass-through.

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use log::{debug, error, warn};

use crate::buffer::{ByteLog, ConversionBuffer, SoundSource};
use crate::config;
use crate::decode::{Envelope, SampleKind, SoundReader};
use crate::encode::{FlacWriter, SampleSink, WavSample, WavWriter, FLAC_BLOCK_SIZE};
use crate::processor::SoundProcessor;
use crate::EngineError;

/// Start estimating the final size once this fraction of the original
/// file size has been produced. Empirical.
const SIZE_ESTIMATE_THRESHOLD: f64 = 0.4;

/// Padding added to every size estimate. Over-reporting is less harmful
/// than under-reporting: clients reading short give up early, clients
/// reading long just get zeros.
const SIZE_ESTIMATE_PAD: u64 = 16 * 1024;

/// Players probing for end-of-file don't always hit the reported size
/// exactly; skips landing within this many bytes of it still count.
const EOF_SKIP_OVERHANG: u64 = 512;

const FLAC_BLOCK_STREAMINFO: u8 = 0;
const FLAC_BLOCK_PADDING: u8 = 1;
const FLAC_BLOCK_SEEKTABLE: u8 = 3;

/// What a handler reports for stat.
#[derive(Clone, Copy, Debug)]
pub struct FileStat {
    pub size: u64,
    pub modified: Option<SystemTime>,
}

/// Positional read/stat surface of one open virtual file.
///
/// Handlers are shared between concurrent readers. `close` runs when the
/// cache drops the last reference; remaining resources go with the
/// handler itself.
pub trait FileHandler: Send + Sync {
    fn read(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;
    fn stat(&self) -> io::Result<FileStat>;

    /// Release conversion resources: disable further encoder writes,
    /// close decoder and encoder. A read racing the close either
    /// completes against already-produced bytes or comes back short.
    fn close(&self) {}
}

/// Serves the underlying file's bytes unchanged.
pub struct PassThroughHandler {
    file: File,
}

impl PassThroughHandler {
    pub fn new(file: File) -> Self {
        Self { file }
    }
}

impl FileHandler for PassThroughHandler {
    fn read(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        self.file.read_at(buf, offset)
    }

    fn stat(&self) -> io::Result<FileStat> {
        let metadata = self.file.metadata()?;
        Ok(FileStat {
            size: metadata.len(),
            modified: metadata.modified().ok(),
        })
    }
}

/// Decode → convolve → encode handler for one sound file.
pub struct SndFileHandler {
    buffer: ConversionBuffer,
    /// Size reported by stat; only ever grows.
    reported_size: AtomicU64,
    size_estimate_threshold: u64,
    total_frames: Option<u64>,
    frames_left: Arc<AtomicU64>,
    error: Arc<AtomicBool>,
    modified: Option<SystemTime>,
    /// Keeps the underlying descriptor alive for the handler's lifetime.
    _file: File,
}

impl SndFileHandler {
    /// Try to build a convolving handler for `file`.
    ///
    /// On failure the descriptor is handed back together with the reason,
    /// so the caller can serve the file pass-through instead.
    pub fn create(
        file: File,
        fs_path: &str,
        filter_dir: &Path,
    ) -> Result<Self, (File, EngineError)> {
        let metadata = match file.metadata() {
            Ok(metadata) => metadata,
            Err(err) => return Err((file, err.into())),
        };
        let decoder_file = match file.try_clone() {
            Ok(clone) => clone,
            Err(err) => return Err((file, err.into())),
        };
        let ext = Path::new(fs_path).extension().and_then(|e| e.to_str());
        let reader = match SoundReader::open(decoder_file, ext) {
            Ok(reader) => reader,
            Err(err) => return Err((file, err)),
        };
        let format = reader.format();

        let config_path = match config::find_filter_config(
            filter_dir,
            format.sample_rate,
            format.kind.bits(),
            format.channels,
        ) {
            Some(path) => path,
            None => {
                return Err((
                    file,
                    EngineError::NoFilterConfigured {
                        sample_rate: format.sample_rate,
                        bits: format.kind.bits(),
                        channels: format.channels,
                    },
                ))
            }
        };
        debug!(
            "{fs_path}: {} Hz, {} bit, {} ch; filter {}",
            format.sample_rate,
            format.kind.bits(),
            format.channels,
            config_path.display()
        );

        let total_frames = reader.total_frames();
        let original_size = metadata.len();
        let modified = metadata.modified().ok();
        let tags = reader.tags().to_vec();

        // The FLAC header from the source is richer than anything our
        // encoder produces, so for real FLAC files it is spliced over
        // verbatim and the encoder's own header is suppressed.
        let copy_flac_header = format.envelope == Envelope::Flac;

        let log = ByteLog::new();
        let error = Arc::new(AtomicBool::new(false));

        let encoder_result: Result<Box<dyn SampleSink>, EngineError> =
            match (format.envelope, format.kind) {
                // OGG cannot be re-encoded in stream order; FLAC can.
                (Envelope::Ogg, _) => FlacWriter::new(
                    Arc::clone(&log),
                    format.sample_rate,
                    format.channels,
                    16,
                    total_frames,
                    tags,
                )
                .map(|w| Box::new(w) as Box<dyn SampleSink>),
                (Envelope::Wav, SampleKind::Pcm16) => WavWriter::new(
                    Arc::clone(&log),
                    WavSample::Pcm16,
                    format.channels,
                    format.sample_rate,
                    total_frames,
                    tags,
                )
                .map(|w| Box::new(w) as Box<dyn SampleSink>),
                // 24-bit WAV output misbehaves in practice; anything that
                // is not plain PCM 16 goes out as float.
                (Envelope::Wav, _) => WavWriter::new(
                    Arc::clone(&log),
                    WavSample::Float32,
                    format.channels,
                    format.sample_rate,
                    total_frames,
                    tags,
                )
                .map(|w| Box::new(w) as Box<dyn SampleSink>),
                (Envelope::Flac, kind) => FlacWriter::new(
                    Arc::clone(&log),
                    format.sample_rate,
                    format.channels,
                    flac_bits(kind),
                    total_frames,
                    tags,
                )
                .map(|w| Box::new(w) as Box<dyn SampleSink>),
                (Envelope::Other, _) => Err(EngineError::EncoderFailed(
                    "no streamable output container for this input".into(),
                )),
            };

        let mut encoder = match encoder_result {
            Ok(encoder) => Some(encoder),
            Err(err) => {
                error!("{fs_path}: {err}");
                error.store(true, Ordering::Relaxed);
                None
            }
        };

        if let Some(encoder) = encoder.as_mut() {
            if copy_flac_header {
                log.set_snd_writes_enabled(false);
                splice_flac_header(&file, &log, fs_path);
                // Flush the encoder's own header into the disabled gate so
                // the writer believes its header is out.
                encoder.write_header();
                if log.file_size() >= 18 {
                    // The spliced STREAMINFO still advertises the source
                    // encoder's block and frame sizes; redact them to ours.
                    let block = FLAC_BLOCK_SIZE as u16;
                    let [hi, lo] = block.to_be_bytes();
                    log.patch_at(8, &[hi, lo, hi, lo]);
                    log.patch_at(12, &[0u8; 6]);
                }
                log.set_snd_writes_enabled(true);
            } else {
                log.set_snd_writes_enabled(true);
                encoder.write_header();
            }
            log.header_finished();
        }

        let frames_left = Arc::new(AtomicU64::new(total_frames.unwrap_or(u64::MAX)));
        let stream = SndStream {
            reader: Some(reader),
            encoder,
            processor: None,
            config_path,
            sample_rate: format.sample_rate,
            channels: format.channels,
            total_frames,
            frames_left: Arc::clone(&frames_left),
            log: Arc::clone(&log),
            fs_path: fs_path.to_owned(),
        };

        Ok(Self {
            buffer: ConversionBuffer::new(Arc::clone(&log), Box::new(stream)),
            reported_size: AtomicU64::new(original_size),
            size_estimate_threshold: (SIZE_ESTIMATE_THRESHOLD * original_size as f64) as u64,
            total_frames,
            frames_left,
            error,
            modified,
            _file: file,
        })
    }
}

impl FileHandler for SndFileHandler {
    fn read(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        if self.error.load(Ordering::Relaxed) {
            return Err(io::Error::other("sound conversion failed for this file"));
        }

        // A skip probing at the very end of the reported size is an
        // indexer confirming end-of-file; serving zeros avoids convolving
        // the whole stream just for that.
        let produced = self.buffer.file_size();
        let reported = self.reported_size.load(Ordering::Relaxed);
        let end = offset.saturating_add(buf.len() as u64);
        if produced < offset && end.saturating_add(EOF_SKIP_OVERHANG) >= reported {
            let pretended = reported.saturating_sub(offset).min(buf.len() as u64) as usize;
            buf[..pretended].fill(0);
            return Ok(pretended);
        }

        // May block while the producer convolves up to the requested
        // range.
        Ok(self.buffer.read(buf, offset))
    }

    fn stat(&self) -> io::Result<FileStat> {
        let produced = self.buffer.file_size();
        if produced > self.size_estimate_threshold {
            if let Some(total) = self.total_frames {
                let left = self.frames_left.load(Ordering::Relaxed);
                let done = total.saturating_sub(left);
                if done > 0 {
                    // Extrapolates output bytes from input-frame progress;
                    // optimistic for variable-bitrate output, which the
                    // padding absorbs in practice.
                    let estimate = (total as f64 / done as f64) * produced as f64;
                    let candidate = estimate as u64 + SIZE_ESTIMATE_PAD;
                    self.reported_size.fetch_max(candidate, Ordering::Relaxed);
                }
            }
        }
        Ok(FileStat {
            size: self.reported_size.load(Ordering::Relaxed),
            modified: self.modified,
        })
    }

    fn close(&self) {
        self.buffer.close_producer();
    }
}

impl Drop for SndFileHandler {
    fn drop(&mut self) {
        // Handlers dropped without going through the cache still release
        // their stream deterministically.
        self.buffer.close_producer();
    }
}

fn flac_bits(kind: SampleKind) -> u32 {
    match kind {
        SampleKind::Pcm16 => 16,
        SampleKind::Pcm24 => 24,
        // Depths FLAC frames cannot carry are narrowed to 24 bit.
        SampleKind::Pcm32 | SampleKind::Float32 => 24,
    }
}

/// The producer side of a [`SndFileHandler`], driven by reads through the
/// conversion buffer. One fragment per call.
struct SndStream {
    reader: Option<SoundReader>,
    encoder: Option<Box<dyn SampleSink>>,
    processor: Option<SoundProcessor>,
    config_path: PathBuf,
    sample_rate: u32,
    channels: usize,
    total_frames: Option<u64>,
    /// Shared with the handler so stat can see progress. `u64::MAX`
    /// stands in while the container does not declare a frame count.
    frames_left: Arc<AtomicU64>,
    log: Arc<ByteLog>,
    fs_path: String,
}

impl SndStream {
    fn close_stream(&mut self) {
        if self.reader.is_none() && self.encoder.is_none() {
            return;
        }
        if let Some(processor) = &self.processor {
            let peak = processor.max_output_value();
            if peak > 1.0 {
                warn!(
                    "{}: output clipping (peak {peak:.3}); multiply gain with <= {:.5} in {}",
                    self.fs_path,
                    1.0 / peak,
                    self.config_path.display()
                );
            }
        }
        if let Some(mut encoder) = self.encoder.take() {
            encoder.finish();
        }
        self.reader = None;
        // Nothing may append once the stream is complete.
        self.log.set_snd_writes_enabled(false);
        debug!("{}: conversion finished", self.fs_path);
    }
}

impl SoundSource for SndStream {
    fn add_more_sound_data(&mut self) -> bool {
        if self.frames_left.load(Ordering::Relaxed) == 0 {
            return false;
        }
        let Some(reader) = self.reader.as_mut() else {
            return false;
        };

        if self.processor.is_none() {
            match SoundProcessor::create(&self.config_path, self.sample_rate, self.channels) {
                Ok(processor) => self.processor = Some(processor),
                Err(err) => {
                    error!(
                        "{}: filter config {} is broken ({err}); serving an empty stream",
                        self.fs_path,
                        self.config_path.display()
                    );
                    self.frames_left.store(0, Ordering::Relaxed);
                    self.close_stream();
                    return false;
                }
            }
        }
        let processor = self.processor.as_mut().expect("created above");

        let frames = match processor.fill_buffer(reader) {
            Ok(frames) => frames,
            Err(err) => {
                error!("{}: decoding failed mid-stream: {err}", self.fs_path);
                self.frames_left.store(0, Ordering::Relaxed);
                self.close_stream();
                return false;
            }
        };
        if frames == 0 {
            if self.total_frames.is_some() {
                error!(
                    "{}: expected {} more frames but hit end of stream; corrupt file?",
                    self.fs_path,
                    self.frames_left.load(Ordering::Relaxed)
                );
            }
            self.frames_left.store(0, Ordering::Relaxed);
            self.close_stream();
            return false;
        }

        let left = self
            .frames_left
            .load(Ordering::Relaxed)
            .saturating_sub(frames as u64);
        self.frames_left.store(left, Ordering::Relaxed);

        if let Some(encoder) = self.encoder.as_mut() {
            processor.write_processed(encoder.as_mut(), frames);
        }

        if left == 0 {
            self.close_stream();
        }
        left != 0
    }

    fn close(&mut self) {
        self.frames_left.store(0, Ordering::Relaxed);
        self.close_stream();
    }
}

/// Copy the source FLAC metadata chain into the buffer, with the
/// adjustments re-encoding forces: the STREAMINFO MD5 signature no longer
/// matches and is zeroed, and SEEKTABLE offsets would all be wrong, so
/// the block is dropped. If the dropped SEEKTABLE was the last block, a
/// trailing empty PADDING block keeps the chain well-formed.
fn splice_flac_header(file: &File, log: &ByteLog, fs_path: &str) {
    debug!("{fs_path}: splicing FLAC header from the source file");
    log.append(b"fLaC");
    let mut pos: u64 = 4;
    let mut header = [0u8; 4];
    let mut need_finish_padding = false;

    loop {
        match file.read_at(&mut header, pos) {
            Ok(4) => {}
            _ => break,
        }
        pos += 4;
        let is_last = header[0] & 0x80 != 0;
        let block_type = header[0] & 0x7F;
        let byte_len =
            ((header[1] as u64) << 16) | ((header[2] as u64) << 8) | header[3] as u64;
        need_finish_padding = false;

        if block_type == FLAC_BLOCK_STREAMINFO && byte_len == 34 {
            log.append(&header);
            // Everything except the MD5 signature at the end, which is
            // zeroed: it no longer matches the convolved stream.
            copy_file_bytes(file, pos, log, byte_len - 16);
            log.append(&[0u8; 16]);
        } else if block_type == FLAC_BLOCK_SEEKTABLE {
            debug!("{fs_path}: dropping SEEKTABLE ({byte_len} bytes)");
            need_finish_padding = is_last;
        } else {
            log.append(&header);
            copy_file_bytes(file, pos, log, byte_len);
        }

        pos += byte_len;
        if is_last {
            break;
        }
    }

    if need_finish_padding {
        log.append(&[0x80 | FLAC_BLOCK_PADDING, 0, 0, 0]);
    }
}

fn copy_file_bytes(file: &File, mut pos: u64, log: &ByteLog, mut len: u64) {
    let mut chunk = [0u8; 4096];
    while len > 0 {
        let want = chunk.len().min(len as usize);
        let read = match file.read_at(&mut chunk[..want], pos) {
            Ok(0) | Err(_) => return,
            Ok(read) => read,
        };
        log.append(&chunk[..read]);
        pos += read as u64;
        len -= read as u64;
    }
}
