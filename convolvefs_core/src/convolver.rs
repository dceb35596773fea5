//! Uniformly partitioned FFT convolution.
//!
//! The engine consumes and produces per-channel float planes of a fixed
//! fragment size. Callers stage one fragment of input per channel via
//! [`Convolver::input_plane_mut`], call [`Convolver::process`], and pick up
//! the convolved fragment from [`Convolver::output_plane`]. Impulse
//! responses longer than one fragment are split into partitions whose
//! spectra are multiplied against a per-input frequency delay line, so the
//! cost per fragment stays bounded regardless of filter length.

use std::sync::{Mutex, OnceLock};

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::sync::Arc;

use crate::EngineError;

/// Smallest fragment size the engine will run at.
pub const MIN_FRAGMENT: usize = 64;
/// Largest fragment size; filter configs derive their fragment by halving
/// down from here.
pub const MAX_FRAGMENT: usize = 8192;

static FFT_PLANNER: OnceLock<Mutex<FftPlanner<f32>>> = OnceLock::new();

/// The process-wide FFT planner.
///
/// Planning is stateful and shared between every convolver instance, so
/// construction of a convolver must hold this lock for the entire
/// configuration step. Steady-state `process()` calls never touch it.
pub(crate) fn fft_planner() -> &'static Mutex<FftPlanner<f32>> {
    FFT_PLANNER.get_or_init(|| Mutex::new(FftPlanner::new()))
}

struct InputLine {
    /// Input fragment staged by the caller, `fragment` samples.
    plane: Vec<f32>,
    /// The previous fragment, kept as the overlap half of the FFT window.
    prev: Vec<f32>,
    /// Ring of the most recent input spectra, one per partition slot.
    spectra: Vec<Vec<Complex<f32>>>,
    /// Ring position of the most recent spectrum.
    head: usize,
}

struct Route {
    input: usize,
    output: usize,
    /// Partition spectra of the impulse response, oldest-lag last. The
    /// forward/inverse scaling factor is folded in at load time.
    partitions: Vec<Vec<Complex<f32>>>,
}

/// A configured multi-channel partitioned convolver.
pub struct Convolver {
    fragment: usize,
    partition_slots: usize,
    fft: Arc<dyn Fft<f32>>,
    ifft: Arc<dyn Fft<f32>>,
    fft_scratch: Vec<Complex<f32>>,
    work: Vec<Complex<f32>>,
    acc: Vec<Complex<f32>>,
    inputs: Vec<InputLine>,
    outputs: Vec<Vec<f32>>,
    routes: Vec<Route>,
}

impl Convolver {
    /// Build an engine for `inputs` × `outputs` channels at the given
    /// fragment size, able to hold impulse responses of up to
    /// `max_impulse_len` samples (delay included).
    ///
    /// The caller must hold the [`fft_planner`] lock and pass the guarded
    /// planner in; both FFT directions are planned here.
    pub fn new(
        planner: &mut FftPlanner<f32>,
        inputs: usize,
        outputs: usize,
        fragment: usize,
        max_impulse_len: usize,
    ) -> Self {
        debug_assert!(fragment.is_power_of_two());
        debug_assert!(inputs > 0 && outputs > 0);
        let n = 2 * fragment;
        let fft = planner.plan_fft_forward(n);
        let ifft = planner.plan_fft_inverse(n);
        let scratch_len = fft
            .get_inplace_scratch_len()
            .max(ifft.get_inplace_scratch_len());
        let partition_slots = max_impulse_len.div_ceil(fragment).max(1);

        let inputs = (0..inputs)
            .map(|_| InputLine {
                plane: vec![0.0; fragment],
                prev: vec![0.0; fragment],
                spectra: vec![vec![Complex::default(); n]; partition_slots],
                head: 0,
            })
            .collect();

        Self {
            fragment,
            partition_slots,
            fft,
            ifft,
            fft_scratch: vec![Complex::default(); scratch_len],
            work: vec![Complex::default(); n],
            acc: vec![Complex::default(); n],
            inputs,
            outputs: (0..outputs).map(|_| vec![0.0; fragment]).collect(),
            routes: Vec::new(),
        }
    }

    pub fn fragment(&self) -> usize {
        self.fragment
    }

    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    pub fn output_count(&self) -> usize {
        self.outputs.len()
    }

    /// Register an impulse response on the `input` → `output` route,
    /// shifted right by `delay` samples. Responses registered on the same
    /// route accumulate.
    pub fn add_impulse(
        &mut self,
        input: usize,
        output: usize,
        delay: usize,
        samples: &[f32],
    ) -> Result<(), EngineError> {
        debug_assert!(input < self.inputs.len());
        debug_assert!(output < self.outputs.len());
        let total = delay + samples.len();
        let capacity = self.partition_slots * self.fragment;
        if total > capacity {
            return Err(EngineError::ImpulseTooLong {
                len: total,
                capacity,
            });
        }

        let mut padded = vec![0.0f32; capacity];
        padded[delay..total].copy_from_slice(samples);
        let used_partitions = total.div_ceil(self.fragment).max(1);

        let route_idx = match self
            .routes
            .iter()
            .position(|r| r.input == input && r.output == output)
        {
            Some(idx) => idx,
            None => {
                self.routes.push(Route {
                    input,
                    output,
                    partitions: Vec::new(),
                });
                self.routes.len() - 1
            }
        };

        let n = 2 * self.fragment;
        // Unnormalised forward and inverse transforms pick up a factor of
        // n between them; fold the compensation into the filter spectra.
        let scale = 1.0 / n as f32;
        for k in 0..used_partitions {
            let chunk = &padded[k * self.fragment..(k + 1) * self.fragment];
            for (j, w) in self.work.iter_mut().enumerate() {
                *w = Complex::new(if j < self.fragment { chunk[j] * scale } else { 0.0 }, 0.0);
            }
            self.fft
                .process_with_scratch(&mut self.work, &mut self.fft_scratch);

            let route = &mut self.routes[route_idx];
            while route.partitions.len() <= k {
                route.partitions.push(vec![Complex::default(); n]);
            }
            for (dst, src) in route.partitions[k].iter_mut().zip(self.work.iter()) {
                *dst += *src;
            }
        }
        Ok(())
    }

    /// The staging plane for one input channel; callers write exactly one
    /// fragment of samples before the next [`Convolver::process`].
    pub fn input_plane_mut(&mut self, channel: usize) -> &mut [f32] {
        &mut self.inputs[channel].plane
    }

    /// The convolved fragment for one output channel, valid after
    /// [`Convolver::process`] until the next call.
    pub fn output_plane(&self, channel: usize) -> &[f32] {
        &self.outputs[channel]
    }

    /// Convolve the staged input fragment into the output planes.
    pub fn process(&mut self) {
        let Self {
            fragment,
            partition_slots,
            fft,
            ifft,
            fft_scratch,
            work,
            acc,
            inputs,
            outputs,
            routes,
        } = self;
        let f = *fragment;
        let slots = *partition_slots;
        let n = 2 * f;

        for line in inputs.iter_mut() {
            for j in 0..f {
                work[j] = Complex::new(line.prev[j], 0.0);
                work[f + j] = Complex::new(line.plane[j], 0.0);
            }
            fft.process_with_scratch(work, fft_scratch);
            line.head = (line.head + 1) % slots;
            line.spectra[line.head].copy_from_slice(work);
            line.prev.copy_from_slice(&line.plane);
            line.plane.fill(0.0);
        }

        for (out_ch, out_plane) in outputs.iter_mut().enumerate() {
            acc.fill(Complex::default());
            let mut active = false;
            for route in routes.iter().filter(|r| r.output == out_ch) {
                let line = &inputs[route.input];
                for (k, part) in route.partitions.iter().enumerate() {
                    let idx = (line.head + slots - k) % slots;
                    let spectrum = &line.spectra[idx];
                    for j in 0..n {
                        acc[j] += spectrum[j] * part[j];
                    }
                }
                active = true;
            }
            if active {
                ifft.process_with_scratch(acc, fft_scratch);
                for (j, out) in out_plane.iter_mut().enumerate() {
                    *out = acc[f + j].re;
                }
            } else {
                out_plane.fill(0.0);
            }
        }
    }

    /// Drop all signal history; filter routes stay configured.
    pub fn reset(&mut self) {
        for line in &mut self.inputs {
            line.plane.fill(0.0);
            line.prev.fill(0.0);
            for spectrum in &mut line.spectra {
                spectrum.fill(Complex::default());
            }
            line.head = 0;
        }
        for out in &mut self.outputs {
            out.fill(0.0);
        }
    }
}
