use assert_cmd::Command;
use std::error::Error;
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use tempfile::tempdir;

/// Generate a small stereo WAV file for testing.
///
/// The fixtures are produced on the fly by emitting a PCM RIFF header
/// followed by procedurally generated sine-wave samples, so the
/// repository stays free of committed binary assets.
fn write_test_tone<P: AsRef<Path>>(
    path: P,
    sample_rate: u32,
    frames: usize,
) -> Result<(), Box<dyn Error>> {
    let channels: u16 = 2;
    let mut samples = Vec::with_capacity(frames * channels as usize * 2);
    for n in 0..frames {
        let theta = (n as f32 / sample_rate as f32) * 2.0 * std::f32::consts::PI * 440.0;
        let sample = (theta.sin() * 0.5 * i16::MAX as f32) as i16;
        for _ in 0..channels {
            samples.extend_from_slice(&sample.to_le_bytes());
        }
    }

    let mut file = File::create(path)?;
    let data_len = samples.len() as u32;
    file.write_all(b"RIFF")?;
    file.write_all(&(36 + data_len).to_le_bytes())?;
    file.write_all(b"WAVE")?;
    file.write_all(b"fmt ")?;
    file.write_all(&16u32.to_le_bytes())?;
    file.write_all(&1u16.to_le_bytes())?;
    file.write_all(&channels.to_le_bytes())?;
    file.write_all(&sample_rate.to_le_bytes())?;
    file.write_all(&(sample_rate * channels as u32 * 2).to_le_bytes())?;
    file.write_all(&(channels * 2).to_le_bytes())?;
    file.write_all(&16u16.to_le_bytes())?;
    file.write_all(b"data")?;
    file.write_all(&data_len.to_le_bytes())?;
    file.write_all(&samples)?;
    Ok(())
}

/// Install a single-impulse identity filter for 8 kHz / 16 bit / stereo.
fn install_identity_filter(filter_dir: &Path) -> Result<(), Box<dyn Error>> {
    let mut impulse = File::create(filter_dir.join("impulse.wav"))?;
    impulse.write_all(b"RIFF")?;
    impulse.write_all(&38u32.to_le_bytes())?;
    impulse.write_all(b"WAVE")?;
    impulse.write_all(b"fmt ")?;
    impulse.write_all(&16u32.to_le_bytes())?;
    impulse.write_all(&1u16.to_le_bytes())?;
    impulse.write_all(&1u16.to_le_bytes())?;
    impulse.write_all(&8_000u32.to_le_bytes())?;
    impulse.write_all(&16_000u32.to_le_bytes())?;
    impulse.write_all(&2u16.to_le_bytes())?;
    impulse.write_all(&16u16.to_le_bytes())?;
    impulse.write_all(b"data")?;
    impulse.write_all(&2u32.to_le_bytes())?;
    impulse.write_all(&i16::MAX.to_le_bytes())?;

    fs::write(
        filter_dir.join("filter-8000-16-2.conf"),
        "/convolver/new 2 2 64\n\
         /impulse/read 1 1 1.0 0 0 0 1 impulse.wav\n\
         /impulse/read 2 2 1.0 0 0 0 1 impulse.wav\n",
    )?;
    Ok(())
}

#[test]
fn cli_renders_a_convolved_wav() -> Result<(), Box<dyn Error>> {
    let input_dir = tempdir()?;
    let filter_dir = tempdir()?;
    let output_dir = tempdir()?;
    let input_path = input_dir.path().join("tone.wav");
    write_test_tone(&input_path, 8_000, 4_000)?;
    install_identity_filter(filter_dir.path())?;

    let output_path = output_dir.path().join("rendered.wav");
    let mut cmd = Command::cargo_bin("convolvefs")?;
    cmd.arg("--filter-dir")
        .arg(filter_dir.path())
        .arg(&input_path)
        .arg(&output_path);
    cmd.assert().success();

    let rendered = fs::read(&output_path)?;
    assert_eq!(&rendered[0..4], b"RIFF");
    assert_eq!(&rendered[8..12], b"WAVE");
    // 44-byte header plus 4000 stereo 16-bit frames.
    assert_eq!(rendered.len(), 44 + 4_000 * 2 * 2);

    output_dir.close()?;
    filter_dir.close()?;
    input_dir.close()?;
    Ok(())
}

#[test]
fn cli_passes_unfiltered_files_through_unchanged() -> Result<(), Box<dyn Error>> {
    let input_dir = tempdir()?;
    let filter_dir = tempdir()?;
    let output_dir = tempdir()?;
    let input_path = input_dir.path().join("tone.wav");
    write_test_tone(&input_path, 8_000, 1_000)?;

    let output_path = output_dir.path().join("copy.wav");
    let mut cmd = Command::cargo_bin("convolvefs")?;
    cmd.arg("--filter-dir")
        .arg(filter_dir.path())
        .arg(&input_path)
        .arg(&output_path);
    cmd.assert().success();

    assert_eq!(fs::read(&input_path)?, fs::read(&output_path)?);
    Ok(())
}

#[test]
fn cli_reports_missing_input_file() -> Result<(), Box<dyn Error>> {
    let filter_dir = tempdir()?;
    let output_dir = tempdir()?;

    let mut cmd = Command::cargo_bin("convolvefs")?;
    cmd.arg("--filter-dir")
        .arg(filter_dir.path())
        .arg("missing.wav")
        .arg(output_dir.path().join("out.wav"));
    cmd.assert().failure();
    Ok(())
}
