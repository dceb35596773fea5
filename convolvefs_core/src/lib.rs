//! On-demand audio convolution behind a filesystem-style read interface.
//!
//! The crate bridges three contracts that do not naturally fit together:
//! filesystem clients expect random-access byte reads and stable sizes,
//! audio codecs are strictly sequential, and several threads may read one
//! open file at once. [`ConvolveFs`] is the entry point: it hands out a
//! [`FileHandler`] per open virtual path — a convolving
//! [`SndFileHandler`] when the file is recognised audio with a filter
//! configured for its `(rate, bits, channels)` triple, a
//! [`PassThroughHandler`] otherwise — and deduplicates concurrent opens
//! through a refcounting cache.
//!
//! The convolving path decodes with Symphonia, runs fragments through a
//! partitioned FFT convolver configured from
//! `filter-<rate>-<bits>-<channels>.conf` files, re-encodes into a
//! streamable container (WAV or FLAC) and serves the bytes from an
//! append-only conversion buffer that produces more audio on demand when
//! a read overshoots what exists so far.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub mod buffer;
pub mod cache;
pub mod config;
pub mod convolver;
pub mod decode;
pub mod encode;
pub mod engine;
pub mod handler;
pub mod processor;

pub use buffer::{ByteLog, ConversionBuffer, SoundSource};
pub use cache::FileHandlerCache;
pub use config::{find_filter_config, FilterConfig};
pub use convolver::{Convolver, MAX_FRAGMENT, MIN_FRAGMENT};
pub use decode::{AudioFormat, Envelope, SampleKind, SoundReader};
pub use encode::{FlacWriter, SampleSink, WavSample, WavWriter, FLAC_BLOCK_SIZE};
pub use engine::ConvolveFs;
pub use handler::{FileHandler, FileStat, PassThroughHandler, SndFileHandler};
pub use processor::SoundProcessor;

/// Errors produced while building or driving the conversion machinery.
///
/// Construction failures are recoverable by design: a handler that
/// cannot convolve ([`EngineError::NotASoundFile`],
/// [`EngineError::NoFilterConfigured`]) falls back to pass-through.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Wrapper around IO errors from the underlying files.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// Wrapper around errors produced by the Symphonia decoding library.
    #[error(transparent)]
    Decode(#[from] symphonia::core::errors::Error),

    /// The open file is not recognised as decodable audio.
    #[error("not a recognised sound file")]
    NotASoundFile,

    /// No filter config exists for this stream's parameters.
    #[error("no filter configured for {sample_rate} Hz / {bits} bit / {channels} channel audio")]
    NoFilterConfigured {
        sample_rate: u32,
        bits: u32,
        channels: usize,
    },

    /// The output encoder could not be set up; the handler stays in
    /// error state and reads fail.
    #[error("cannot open output encoder: {0}")]
    EncoderFailed(String),

    /// A filter config file failed to parse or load.
    #[error("{path}:{line}: {reason}")]
    BadFilterConfig {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    /// An impulse response does not fit the declared convolver size.
    #[error("impulse response of {len} samples exceeds the configured capacity of {capacity}")]
    ImpulseTooLong { len: usize, capacity: usize },

    /// The configured filter directory does not exist.
    #[error("filter directory {0} is not a directory")]
    BadFilterDirectory(PathBuf),
}
