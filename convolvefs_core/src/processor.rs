//! The per-stream DSP workhorse.
//!
//! A [`SoundProcessor`] pairs a loaded [`FilterConfig`] with the
//! interleaved scratch buffer the fragment protocol runs through:
//! [`SoundProcessor::fill_buffer`] pulls decoder frames in,
//! [`SoundProcessor::write_processed`] convolves on demand and hands
//! frames to the encoder. The two alternate; a fragment is convolved
//! exactly once.

use std::path::Path;

use crate::config::FilterConfig;
use crate::convolver::fft_planner;
use crate::decode::SoundReader;
use crate::encode::SampleSink;
use crate::EngineError;

pub struct SoundProcessor {
    config: FilterConfig,
    /// Interleaved scratch, `fragment * channels` samples. Holds decoder
    /// input before [`SoundProcessor::process`] and convolved output
    /// after.
    buffer: Vec<f32>,
    channels: usize,
    input_pos: usize,
    /// Read position in the processed output; `None` means the staged
    /// input has not been convolved yet.
    output_pos: Option<usize>,
    max_out_value_observed: f32,
}

impl SoundProcessor {
    /// Load the filter config and build a processor for a stream of the
    /// given sample rate and channel count.
    ///
    /// FFT planning shares mutable state across the whole process, so the
    /// entire load step runs under the planner lock; concurrently created
    /// handlers serialise here, never in `process()`.
    pub fn create(
        config_path: &Path,
        sample_rate: u32,
        channels: usize,
    ) -> Result<Self, EngineError> {
        let config = {
            let mut planner = fft_planner().lock().expect("fft planner poisoned");
            FilterConfig::load(config_path, sample_rate, channels, &mut planner)?
        };
        let fragment = config.fragment();
        let mut processor = Self {
            config,
            buffer: vec![0.0; fragment * channels],
            channels,
            input_pos: 0,
            output_pos: None,
            max_out_value_observed: 0.0,
        };
        processor.reset();
        Ok(processor)
    }

    pub fn fragment(&self) -> usize {
        self.config.fragment()
    }

    /// Whether the staged input holds a full fragment.
    pub fn is_input_buffer_complete(&self) -> bool {
        self.input_pos == self.fragment()
    }

    /// Pull up to a fragment's worth of frames from the decoder into the
    /// scratch. Returns the number of frames read; the staged input is
    /// marked unprocessed.
    pub fn fill_buffer(&mut self, input: &mut SoundReader) -> Result<usize, EngineError> {
        let fragment = self.fragment();
        let frames_needed = fragment - self.input_pos;
        assert!(frames_needed > 0, "write_processed() must drain first");
        self.output_pos = None;
        let start = self.input_pos * self.channels;
        let end = start + frames_needed * self.channels;
        let frames = input.read_frames(&mut self.buffer[start..end])?;
        self.input_pos += frames;
        Ok(frames)
    }

    /// Write `frames` convolved frames to the encoder, running the
    /// convolver first if the staged input has not been processed yet.
    /// Once a full fragment has been drained the input cursor resets for
    /// the next fill cycle.
    pub fn write_processed(&mut self, out: &mut dyn SampleSink, frames: usize) {
        if self.output_pos.is_none() {
            self.process();
        }
        let pos = self.output_pos.expect("just processed");
        let fragment = self.fragment();
        assert!(frames <= fragment - pos);
        out.write_frames(&self.buffer[pos * self.channels..(pos + frames) * self.channels]);
        let pos = pos + frames;
        self.output_pos = Some(pos);
        if pos == fragment {
            self.input_pos = 0;
        }
    }

    fn process(&mut self) {
        let fragment = self.config.fragment();
        let channels = self.channels;
        let filled = self.input_pos;

        // Anything the decoder did not fill convolves as silence.
        self.buffer[filled * channels..fragment * channels].fill(0.0);

        // Flatten LRLRLR into per-channel planes. The convolver zeroes
        // its planes after every run, so the tail past `filled` is
        // already silent.
        let convolver = self.config.convolver_mut();
        for ch in 0..channels {
            let plane = convolver.input_plane_mut(ch);
            for j in 0..filled {
                plane[j] = self.buffer[j * channels + ch];
            }
        }

        convolver.process();

        // Join the channels again, watching the output peak.
        for ch in 0..channels {
            let plane = convolver.output_plane(ch);
            for j in 0..filled {
                let value = plane[j];
                self.buffer[j * channels + ch] = value;
                let magnitude = value.abs();
                if magnitude > self.max_out_value_observed {
                    self.max_out_value_observed = magnitude;
                }
            }
        }
        self.output_pos = Some(0);
    }

    /// Reset for re-use on a fresh stream.
    pub fn reset(&mut self) {
        self.config.convolver_mut().reset();
        self.input_pos = 0;
        self.output_pos = None;
        self.reset_max_values();
    }

    /// Largest absolute output sample observed since the last reset.
    pub fn max_output_value(&self) -> f32 {
        self.max_out_value_observed
    }

    pub fn reset_max_values(&mut self) {
        self.max_out_value_observed = 0.0;
    }

    pub fn config_path(&self) -> &Path {
        self.config.path()
    }

    /// Whether the config file on disk is unchanged since this processor
    /// was built. Hook for recycling processors across streams; the
    /// handler path does not use it yet.
    pub fn config_still_up_to_date(&self) -> bool {
        self.config.still_up_to_date()
    }
}
