//! Convolution filter configuration.
//!
//! One config file exists per `(sample_rate, bits, channels)` triple,
//! named `filter-<rate>-<bits>-<channels>.conf`, with progressively less
//! specific fallbacks. The grammar is a line-oriented command format:
//!
//! ```text
//! # comment
//! /cd            <dir>
//! /convolver/new <inputs> <outputs> <maxsize> [density]
//! /impulse/read  <input> <output> <gain> <delay> <offset> <length> <channel> <file>
//! ```
//!
//! `/impulse/read` channel and input/output indices are 1-based;
//! `length` 0 means "rest of the file". Impulse files are ordinary sound
//! files decoded through the same stack as the streams they filter.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use log::debug;
use rustfft::FftPlanner;

use crate::convolver::{Convolver, MAX_FRAGMENT, MIN_FRAGMENT};
use crate::decode;
use crate::EngineError;

/// Upper bound on `/convolver/new` maxsize, samples.
const MAX_IMPULSE_SAMPLES: usize = 0x0010_0000;

/// Probe for the filter config matching a stream, most specific name
/// first: `filter-<rate>-<bits>-<channels>.conf`,
/// `filter-<rate>-<channels>.conf`, `filter-<rate>.conf`.
pub fn find_filter_config(
    dir: &Path,
    sample_rate: u32,
    bits: u32,
    channels: usize,
) -> Option<PathBuf> {
    let candidates = [
        dir.join(format!("filter-{sample_rate}-{bits}-{channels}.conf")),
        dir.join(format!("filter-{sample_rate}-{channels}.conf")),
        dir.join(format!("filter-{sample_rate}.conf")),
    ];
    candidates
        .into_iter()
        .find(|path| fs::metadata(path).map(|m| m.is_file()).unwrap_or(false))
}

/// Fragment size for a filter of `max_impulse` samples: start at the
/// largest quantum and halve while a smaller one still holds the whole
/// response in two partitions.
pub(crate) fn derive_fragment(max_impulse: usize) -> usize {
    let mut fragment = MAX_FRAGMENT;
    while fragment > MIN_FRAGMENT && fragment >= 2 * max_impulse {
        fragment /= 2;
    }
    fragment
}

/// A loaded filter configuration: the configured convolver plus the
/// config file identity used to detect on-disk changes.
pub struct FilterConfig {
    path: PathBuf,
    mtime: Option<SystemTime>,
    convolver: Convolver,
}

impl std::fmt::Debug for FilterConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterConfig")
            .field("path", &self.path)
            .field("mtime", &self.mtime)
            .finish_non_exhaustive()
    }
}

impl FilterConfig {
    /// Load `path` for a stream of the given sample rate and channel
    /// count. The caller must hold the process-wide FFT planner lock and
    /// pass the planner in; every FFT plan of the new convolver is built
    /// under it.
    pub fn load(
        path: &Path,
        sample_rate: u32,
        channels: usize,
        planner: &mut FftPlanner<f32>,
    ) -> Result<Self, EngineError> {
        let mtime = fs::metadata(path).and_then(|m| m.modified()).ok();
        let text = fs::read_to_string(path)?;
        let bad = |line: usize, reason: String| EngineError::BadFilterConfig {
            path: path.to_path_buf(),
            line,
            reason,
        };

        let mut base = path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();
        let mut convolver: Option<Convolver> = None;

        for (idx, raw) in text.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let mut parts = line.split_whitespace();
            let command = parts.next().unwrap_or("");
            let args: Vec<&str> = parts.collect();

            match command {
                "/cd" => {
                    if args.len() != 1 {
                        return Err(bad(line_no, "/cd takes one directory".into()));
                    }
                    let dir = Path::new(args[0]);
                    base = if dir.is_absolute() {
                        dir.to_path_buf()
                    } else {
                        base.join(dir)
                    };
                }
                "/convolver/new" => {
                    if convolver.is_some() {
                        return Err(bad(line_no, "convolver declared twice".into()));
                    }
                    if args.len() < 3 || args.len() > 4 {
                        return Err(bad(
                            line_no,
                            "/convolver/new takes <inputs> <outputs> <maxsize> [density]".into(),
                        ));
                    }
                    let ninp: usize = args[0]
                        .parse()
                        .map_err(|_| bad(line_no, "invalid input count".into()))?;
                    let nout: usize = args[1]
                        .parse()
                        .map_err(|_| bad(line_no, "invalid output count".into()))?;
                    let maxsize: usize = args[2]
                        .parse()
                        .map_err(|_| bad(line_no, "invalid maxsize".into()))?;
                    if ninp == 0 || nout == 0 {
                        return Err(bad(line_no, "channel counts must be positive".into()));
                    }
                    if ninp != channels || nout != channels {
                        return Err(bad(
                            line_no,
                            format!(
                                "config is {ninp} in / {nout} out but the stream has \
                                 {channels} channels"
                            ),
                        ));
                    }
                    if maxsize == 0 || maxsize > MAX_IMPULSE_SAMPLES {
                        return Err(bad(line_no, format!("maxsize {maxsize} out of range")));
                    }
                    if let Some(arg) = args.get(3) {
                        let density: f32 = arg
                            .parse()
                            .map_err(|_| bad(line_no, "invalid density".into()))?;
                        if !(0.0..=1.0).contains(&density) {
                            return Err(bad(line_no, "density out of range".into()));
                        }
                        // The uniform-partition engine has no density
                        // knob; the parameter is validated and ignored.
                        debug!("{}: ignoring density {density}", path.display());
                    }
                    let fragment = derive_fragment(maxsize);
                    convolver = Some(Convolver::new(planner, ninp, nout, fragment, maxsize));
                }
                "/impulse/read" => {
                    let conv = convolver
                        .as_mut()
                        .ok_or_else(|| bad(line_no, "/impulse/read before /convolver/new".into()))?;
                    if args.len() != 8 {
                        return Err(bad(
                            line_no,
                            "/impulse/read takes <input> <output> <gain> <delay> <offset> \
                             <length> <channel> <file>"
                                .into(),
                        ));
                    }
                    let input: usize = args[0]
                        .parse()
                        .map_err(|_| bad(line_no, "invalid input".into()))?;
                    let output: usize = args[1]
                        .parse()
                        .map_err(|_| bad(line_no, "invalid output".into()))?;
                    let gain: f32 = args[2]
                        .parse()
                        .map_err(|_| bad(line_no, "invalid gain".into()))?;
                    let delay: usize = args[3]
                        .parse()
                        .map_err(|_| bad(line_no, "invalid delay".into()))?;
                    let offset: usize = args[4]
                        .parse()
                        .map_err(|_| bad(line_no, "invalid offset".into()))?;
                    let length: usize = args[5]
                        .parse()
                        .map_err(|_| bad(line_no, "invalid length".into()))?;
                    let channel: usize = args[6]
                        .parse()
                        .map_err(|_| bad(line_no, "invalid channel".into()))?;
                    if input == 0 || input > conv.input_count() {
                        return Err(bad(line_no, format!("input {input} out of range")));
                    }
                    if output == 0 || output > conv.output_count() {
                        return Err(bad(line_no, format!("output {output} out of range")));
                    }

                    let impulse_path = base.join(args[7]);
                    let (format, samples) =
                        decode::read_sound_file(&impulse_path).map_err(|err| {
                            bad(
                                line_no,
                                format!("impulse {}: {err}", impulse_path.display()),
                            )
                        })?;
                    if format.sample_rate != sample_rate {
                        return Err(bad(
                            line_no,
                            format!(
                                "impulse rate {} does not match stream rate {sample_rate}",
                                format.sample_rate
                            ),
                        ));
                    }
                    if channel == 0 || channel > format.channels {
                        return Err(bad(line_no, format!("impulse channel {channel} missing")));
                    }

                    let total = samples.len() / format.channels;
                    if offset >= total {
                        return Err(bad(line_no, format!("offset {offset} past impulse end")));
                    }
                    let take = if length == 0 {
                        total - offset
                    } else {
                        length.min(total - offset)
                    };
                    let mut response = Vec::with_capacity(take);
                    for j in 0..take {
                        response.push(samples[(offset + j) * format.channels + (channel - 1)] * gain);
                    }
                    conv.add_impulse(input - 1, output - 1, delay, &response)
                        .map_err(|err| bad(line_no, err.to_string()))?;
                }
                // Port naming only matters for live JACK graphs; accepted
                // for config compatibility.
                "/input/name" | "/output/name" => {}
                other => {
                    return Err(bad(line_no, format!("unknown directive {other}")));
                }
            }
        }

        let convolver =
            convolver.ok_or_else(|| bad(0, "config never declares /convolver/new".into()))?;
        debug!(
            "{}: loaded, fragment {} samples",
            path.display(),
            convolver.fragment()
        );
        Ok(Self {
            path: path.to_path_buf(),
            mtime,
            convolver,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn fragment(&self) -> usize {
        self.convolver.fragment()
    }

    pub fn convolver(&self) -> &Convolver {
        &self.convolver
    }

    pub fn convolver_mut(&mut self) -> &mut Convolver {
        &mut self.convolver
    }

    /// Whether the file on disk still has the modification time observed
    /// at load.
    pub fn still_up_to_date(&self) -> bool {
        self.mtime == fs::metadata(&self.path).and_then(|m| m.modified()).ok()
    }
}
