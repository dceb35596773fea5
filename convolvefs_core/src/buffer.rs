//! Bridging a sequential encoder to positional reads.
//!
//! Encoders write strictly in order; filesystem clients read at arbitrary
//! offsets. [`ByteLog`] is the append-only byte log both sides share, and
//! [`ConversionBuffer`] adds the pull model on top: a read past the end of
//! the log drives the owning handler's [`SoundSource`] until enough bytes
//! exist or the stream is exhausted.

use std::sync::{Arc, Mutex};

struct LogInner {
    data: Vec<u8>,
    snd_writes_enabled: bool,
    header_end: u64,
}

/// Append-only in-memory byte log with a write gate for encoder output.
///
/// The gate exists so an encoder's own header emission can be suppressed
/// while a hand-crafted header is spliced in via [`ByteLog::append`],
/// which is never gated.
pub struct ByteLog {
    inner: Mutex<LogInner>,
}

impl ByteLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(LogInner {
                data: Vec::new(),
                snd_writes_enabled: true,
                header_end: 0,
            }),
        })
    }

    /// Append unconditionally.
    pub fn append(&self, bytes: &[u8]) {
        let mut inner = self.inner.lock().expect("byte log poisoned");
        inner.data.extend_from_slice(bytes);
    }

    /// Append on behalf of the encoder; dropped silently while encoder
    /// writes are disabled.
    pub fn snd_append(&self, bytes: &[u8]) {
        let mut inner = self.inner.lock().expect("byte log poisoned");
        if inner.snd_writes_enabled {
            inner.data.extend_from_slice(bytes);
        }
    }

    /// Overwrite bytes inside the already-written region. Only legal
    /// during header construction, before readers can observe the range.
    pub fn patch_at(&self, offset: u64, bytes: &[u8]) {
        let mut inner = self.inner.lock().expect("byte log poisoned");
        let start = offset as usize;
        let end = start + bytes.len();
        assert!(end <= inner.data.len(), "patch outside written region");
        inner.data[start..end].copy_from_slice(bytes);
    }

    pub fn set_snd_writes_enabled(&self, enabled: bool) {
        let mut inner = self.inner.lock().expect("byte log poisoned");
        inner.snd_writes_enabled = enabled;
    }

    pub fn snd_writes_enabled(&self) -> bool {
        self.inner.lock().expect("byte log poisoned").snd_writes_enabled
    }

    /// Mark the current size as the end of the header area; bytes from
    /// here on are audio payload.
    pub fn header_finished(&self) {
        let mut inner = self.inner.lock().expect("byte log poisoned");
        inner.header_end = inner.data.len() as u64;
    }

    pub fn header_end(&self) -> u64 {
        self.inner.lock().expect("byte log poisoned").header_end
    }

    /// Number of bytes written so far. Monotonically non-decreasing.
    pub fn file_size(&self) -> u64 {
        self.inner.lock().expect("byte log poisoned").data.len() as u64
    }

    /// Copy bytes at `offset` into `buf`, returning how many were
    /// available. Never blocks and never drives the producer.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> usize {
        let inner = self.inner.lock().expect("byte log poisoned");
        let len = inner.data.len() as u64;
        if offset >= len {
            return 0;
        }
        let n = buf.len().min((len - offset) as usize);
        let start = offset as usize;
        buf[..n].copy_from_slice(&inner.data[start..start + n]);
        n
    }
}

/// Supplier of more encoded bytes, owned by the conversion buffer.
///
/// `add_more_sound_data` advances the decode → convolve → encode pipeline
/// by one fragment and returns whether more input remains.
pub trait SoundSource: Send {
    fn add_more_sound_data(&mut self) -> bool;

    /// Shut the pipeline down: release decoder and encoder, stop
    /// producing. Called when the owning handler is closed before the
    /// stream ran dry.
    fn close(&mut self) {}
}

/// Positional-read façade over a [`ByteLog`] fed by a pull-driven
/// producer.
pub struct ConversionBuffer {
    log: Arc<ByteLog>,
    producer: Mutex<Box<dyn SoundSource>>,
}

impl ConversionBuffer {
    pub fn new(log: Arc<ByteLog>, source: Box<dyn SoundSource>) -> Self {
        Self {
            log,
            producer: Mutex::new(source),
        }
    }

    pub fn log(&self) -> &Arc<ByteLog> {
        &self.log
    }

    pub fn file_size(&self) -> u64 {
        self.log.file_size()
    }

    /// Serve bytes from the log, producing more on demand.
    ///
    /// Within the header area short reads are allowed (one byte suffices),
    /// so clients that only inspect metadata never start the convolver.
    /// Past the header the full requested range is produced before
    /// returning, because some players mishandle short reads mid-stream.
    /// Reads beyond end-of-stream return what is available.
    ///
    /// At most one thread advances the producer at a time; threads reading
    /// already-produced bytes are not blocked by it.
    pub fn read(&self, buf: &mut [u8], offset: u64) -> usize {
        let header_end = self.log.header_end();
        let wanted = if offset >= header_end {
            buf.len() as u64
        } else {
            1
        };
        let required_min = offset.saturating_add(wanted);

        {
            let mut source = self.producer.lock().expect("producer poisoned");
            while self.log.file_size() < required_min {
                if !source.add_more_sound_data() {
                    break;
                }
            }
        }

        self.log.read_at(buf, offset)
    }

    /// Close the producer. Waits for an in-flight producer advance to
    /// finish; already-produced bytes stay readable.
    pub fn close_producer(&self) {
        let mut source = self.producer.lock().expect("producer poisoned");
        source.close();
    }
}
