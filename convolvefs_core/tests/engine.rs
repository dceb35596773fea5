use convolvefs_core::{
    ByteLog, ConvolveFs, Envelope, FlacWriter, SampleSink, SoundReader,
};
use std::error::Error;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tempfile::tempdir;

/// Generate lightweight audio fixtures for the tests at runtime.
///
/// WAV data is synthesised procedurally so no binary test assets need to
/// be stored in the repository; a sine tone is enough to exercise the
/// decode → convolve → encode pipeline end-to-end.
fn write_test_tone<P: AsRef<Path>>(
    path: P,
    sample_rate: u32,
    channels: u16,
    frames: usize,
) -> Result<(), Box<dyn Error>> {
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

/// Install an identity filter (single full-scale impulse per channel) for
/// the given stream parameters.
fn install_identity_filter(
    filter_dir: &Path,
    sample_rate: u32,
    bits: u32,
    channels: usize,
) -> Result<(), Box<dyn Error>> {
    write_test_impulse(&filter_dir.join("impulse.wav"), sample_rate)?;
    let mut config = format!("/convolver/new {channels} {channels} 64\n");
    for ch in 1..=channels {
        config.push_str(&format!("/impulse/read {ch} {ch} 1.0 0 0 0 1 impulse.wav\n"));
    }
    std::fs::write(
        filter_dir.join(format!("filter-{sample_rate}-{bits}-{channels}.conf")),
        config,
    )?;
    Ok(())
}

fn write_test_impulse(path: &Path, sample_rate: u32) -> Result<(), Box<dyn Error>> {
    let mut file = File::create(path)?;
    file.write_all(b"RIFF")?;
    file.write_all(&38u32.to_le_bytes())?;
    file.write_all(b"WAVE")?;
    file.write_all(b"fmt ")?;
    file.write_all(&16u32.to_le_bytes())?;
    file.write_all(&1u16.to_le_bytes())?;
    file.write_all(&1u16.to_le_bytes())?;
    file.write_all(&sample_rate.to_le_bytes())?;
    file.write_all(&(sample_rate * 2).to_le_bytes())?;
    file.write_all(&2u16.to_le_bytes())?;
    file.write_all(&16u16.to_le_bytes())?;
    file.write_all(b"data")?;
    file.write_all(&2u32.to_le_bytes())?;
    file.write_all(&i16::MAX.to_le_bytes())?;
    Ok(())
}

/// Produce a complete FLAC byte stream for a mono test tone.
fn flac_tone_bytes(sample_rate: u32, frames: usize) -> Vec<u8> {
    let tone: Vec<f32> = (0..frames)
        .map(|n| {
            ((n as f32 / sample_rate as f32) * 2.0 * std::f32::consts::PI * 330.0).sin() * 0.4
        })
        .collect();
    let log = ByteLog::new();
    let mut writer = FlacWriter::new(
        Arc::clone(&log),
        sample_rate,
        1,
        16,
        Some(frames as u64),
        Vec::new(),
    )
    .expect("flac writer");
    writer.write_header();
    writer.write_frames(&tone);
    writer.finish();

    let mut bytes = vec![0u8; log.file_size() as usize];
    let n = log.read_at(&mut bytes, 0);
    bytes.truncate(n);
    bytes
}

fn metadata_block(last: bool, block_type: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + payload.len());
    out.push(if last { 0x80 | block_type } else { block_type });
    let len = (payload.len() as u32).to_be_bytes();
    out.extend_from_slice(&len[1..4]);
    out.extend_from_slice(payload);
    out
}

fn vorbis_comment_payload() -> Vec<u8> {
    let vendor = b"fixture";
    let entry = b"TITLE=spliced tone";
    let mut payload = Vec::new();
    payload.extend_from_slice(&(vendor.len() as u32).to_le_bytes());
    payload.extend_from_slice(vendor);
    payload.extend_from_slice(&1u32.to_le_bytes());
    payload.extend_from_slice(&(entry.len() as u32).to_le_bytes());
    payload.extend_from_slice(entry);
    payload
}

/// Rebuild a FLAC stream with a custom metadata chain between the
/// STREAMINFO and the audio frames. `flac` must come from
/// [`flac_tone_bytes`], whose layout is fLaC + STREAMINFO(last) + frames.
fn flac_with_chain(flac: &[u8], extra_blocks: &[(bool, u8, Vec<u8>)]) -> Vec<u8> {
    let streaminfo = &flac[8..42];
    let frames = &flac[42..];

    let mut out = Vec::new();
    out.extend_from_slice(b"fLaC");
    let streaminfo_last = extra_blocks.is_empty();
    out.extend_from_slice(&metadata_block(streaminfo_last, 0, streaminfo));
    for (last, block_type, payload) in extra_blocks {
        out.extend_from_slice(&metadata_block(*last, *block_type, payload));
    }
    out.extend_from_slice(frames);
    out
}

fn walk_metadata(bytes: &[u8]) -> Vec<(bool, u8, Vec<u8>)> {
    assert_eq!(&bytes[0..4], b"fLaC", "output must start with the magic");
    let mut blocks = Vec::new();
    let mut pos = 4;
    loop {
        let header = &bytes[pos..pos + 4];
        let is_last = header[0] & 0x80 != 0;
        let block_type = header[0] & 0x7F;
        let len = ((header[1] as usize) << 16) | ((header[2] as usize) << 8) | header[3] as usize;
        blocks.push((is_last, block_type, bytes[pos + 4..pos + 4 + len].to_vec()));
        pos += 4 + len;
        if is_last {
            break;
        }
    }
    blocks
}

/// Read the virtual file sequentially to exhaustion.
fn read_to_end(handler: &dyn convolvefs_core::FileHandler) -> Vec<u8> {
    let mut out = Vec::new();
    let mut chunk = vec![0u8; 64 * 1024];
    loop {
        let n = handler
            .read(&mut chunk, out.len() as u64)
            .expect("read failed");
        if n == 0 {
            break;
        }
        out.extend_from_slice(&chunk[..n]);
    }
    out
}

#[test]
fn non_audio_files_pass_through() -> Result<(), Box<dyn Error>> {
    let source_dir = tempdir()?;
    let filter_dir = tempdir()?;
    let path = source_dir.path().join("note.txt");
    let mut content = b"hello".to_vec();
    content.resize(1024, 0);
    std::fs::write(&path, &content)?;

    let engine = ConvolveFs::new(filter_dir.path())?;
    let handler = engine.create_handler("/note.txt", &path)?;

    let mut buf = [0u8; 5];
    assert_eq!(handler.read(&mut buf, 0)?, 5);
    assert_eq!(&buf, b"hello");
    assert_eq!(handler.stat()?.size, 1024);

    engine.close("/note.txt");
    assert_eq!(engine.open_handler_count(), 0);
    Ok(())
}

#[test]
fn missing_filter_config_falls_back_to_pass_through() -> Result<(), Box<dyn Error>> {
    let source_dir = tempdir()?;
    let filter_dir = tempdir()?;
    let path = source_dir.path().join("tone.wav");
    write_test_tone(&path, 44_100, 2, 2_000)?;
    let original = std::fs::read(&path)?;

    let engine = ConvolveFs::new(filter_dir.path())?;
    let handler = engine.create_handler("/tone.wav", &path)?;

    let served = read_to_end(handler.as_ref());
    assert_eq!(served, original, "pass-through must be byte-identical");

    engine.close("/tone.wav");
    Ok(())
}

#[test]
fn wav_with_filter_serves_a_convolved_wav() -> Result<(), Box<dyn Error>> {
    let source_dir = tempdir()?;
    let filter_dir = tempdir()?;
    install_identity_filter(filter_dir.path(), 8_000, 16, 2)?;
    let path = source_dir.path().join("tone.wav");
    write_test_tone(&path, 8_000, 2, 4_000)?;

    let engine = ConvolveFs::new(filter_dir.path())?;
    let handler = engine.create_handler("/tone.wav", &path)?;

    // The header alone must already be a valid RIFF/WAVE prefix.
    let mut header = [0u8; 44];
    assert_eq!(handler.read(&mut header, 0)?, 44);
    assert_eq!(&header[0..4], b"RIFF");
    assert_eq!(&header[8..12], b"WAVE");
    assert_eq!(u16::from_le_bytes([header[22], header[23]]), 2);
    assert_eq!(
        u32::from_le_bytes([header[24], header[25], header[26], header[27]]),
        8_000
    );

    // A probe at the reported end of file is served as zeros without
    // convolving anything.
    let reported = handler.stat()?.size;
    let mut tail = vec![1u8; 32];
    let n = handler.read(&mut tail, reported - 32)?;
    assert_eq!(n, 32);
    assert!(tail.iter().all(|&b| b == 0));

    // The full stream decodes back to the (identity-convolved) tone.
    let served = read_to_end(handler.as_ref());
    let out_path = source_dir.path().join("served.wav");
    std::fs::write(&out_path, &served)?;

    let mut reader = SoundReader::open(File::open(&out_path)?, Some("wav"))?;
    assert_eq!(reader.format().channels, 2);
    assert_eq!(reader.total_frames(), Some(4_000));

    let mut original = SoundReader::open(File::open(&path)?, Some("wav"))?;
    let mut got = vec![0.0f32; 4_000 * 2];
    let mut expected = vec![0.0f32; 4_000 * 2];
    assert_eq!(reader.read_frames(&mut got)?, 4_000);
    assert_eq!(original.read_frames(&mut expected)?, 4_000);
    for (n, (a, b)) in got.iter().zip(&expected).enumerate() {
        assert!(
            (a - b).abs() < 2e-3,
            "sample {n} diverged: {a} vs {b}"
        );
    }

    engine.close("/tone.wav");
    Ok(())
}

#[test]
fn flac_header_splice_drops_the_seektable() -> Result<(), Box<dyn Error>> {
    let source_dir = tempdir()?;
    let filter_dir = tempdir()?;
    install_identity_filter(filter_dir.path(), 8_000, 16, 1)?;

    let flac = flac_tone_bytes(8_000, 5_000);
    let seekpoint = [0xFFu8; 8]
        .iter()
        .chain([0u8; 10].iter())
        .copied()
        .collect::<Vec<u8>>();
    let input = flac_with_chain(
        &flac,
        &[
            (false, 3, seekpoint),
            (true, 4, vorbis_comment_payload()),
        ],
    );
    let path = source_dir.path().join("tone.flac");
    std::fs::write(&path, &input)?;

    let engine = ConvolveFs::new(filter_dir.path())?;
    let handler = engine.create_handler("/tone.flac", &path)?;
    let served = read_to_end(handler.as_ref());

    let blocks = walk_metadata(&served);
    let types: Vec<u8> = blocks.iter().map(|(_, t, _)| *t).collect();
    assert!(!types.contains(&3), "SEEKTABLE must be dropped");
    assert_eq!(types[0], 0, "STREAMINFO stays first");
    assert!(types.contains(&4), "VORBIS_COMMENT is copied verbatim");
    assert_eq!(
        blocks.iter().filter(|(last, _, _)| *last).count(),
        1,
        "exactly one block carries the last-block flag"
    );
    let streaminfo = &blocks[0].2;
    assert!(
        streaminfo[18..34].iter().all(|&b| b == 0),
        "MD5 signature must be zeroed"
    );

    // The spliced stream still decodes, frame for frame.
    let out_path = source_dir.path().join("served.flac");
    std::fs::write(&out_path, &served)?;
    let mut reader = SoundReader::open(File::open(&out_path)?, Some("flac"))?;
    assert_eq!(reader.format().envelope, Envelope::Flac);
    let mut frames = vec![0.0f32; 5_000 + 64];
    assert_eq!(reader.read_frames(&mut frames)?, 5_000);

    engine.close("/tone.flac");
    Ok(())
}

#[test]
fn flac_seektable_in_last_position_is_replaced_by_padding() -> Result<(), Box<dyn Error>> {
    let source_dir = tempdir()?;
    let filter_dir = tempdir()?;
    install_identity_filter(filter_dir.path(), 8_000, 16, 1)?;

    let flac = flac_tone_bytes(8_000, 1_000);
    let input = flac_with_chain(&flac, &[(true, 3, vec![0u8; 18])]);
    let path = source_dir.path().join("tone.flac");
    std::fs::write(&path, &input)?;

    let engine = ConvolveFs::new(filter_dir.path())?;
    let handler = engine.create_handler("/tone.flac", &path)?;
    let served = read_to_end(handler.as_ref());

    let blocks = walk_metadata(&served);
    assert_eq!(blocks.len(), 2);
    assert_eq!(blocks[0].1, 0);
    assert!(!blocks[0].0);
    assert_eq!(blocks[1].1, 1, "chain must end in a PADDING block");
    assert!(blocks[1].0);
    assert!(blocks[1].2.is_empty());

    engine.close("/tone.flac");
    Ok(())
}

#[test]
fn reported_size_grows_monotonically_to_the_final_size() -> Result<(), Box<dyn Error>> {
    let source_dir = tempdir()?;
    let filter_dir = tempdir()?;
    install_identity_filter(filter_dir.path(), 44_100, 16, 1)?;

    // Ten seconds at 44.1 kHz.
    let input = flac_tone_bytes(44_100, 441_000);
    let path = source_dir.path().join("long.flac");
    std::fs::write(&path, &input)?;

    let engine = ConvolveFs::new(filter_dir.path())?;
    let handler = engine.create_handler("/long.flac", &path)?;

    let mut last_reported = 0u64;
    let mut offset = 0u64;
    let mut chunk = vec![0u8; 64 * 1024];
    loop {
        let n = handler.read(&mut chunk, offset)?;
        if n == 0 {
            break;
        }
        offset += n as u64;

        let reported = handler.stat()?.size;
        assert!(
            reported >= last_reported,
            "reported size shrank: {last_reported} -> {reported}"
        );
        last_reported = reported;
    }

    let final_size = offset;
    let reported = handler.stat()?.size;
    assert!(reported >= final_size, "must never under-report at the end");
    assert!(
        reported - final_size <= 32 * 1024,
        "reported {reported} strays more than 32 KiB from {final_size}"
    );

    engine.close("/long.flac");
    Ok(())
}

#[test]
fn concurrent_opens_share_one_handler() -> Result<(), Box<dyn Error>> {
    let source_dir = tempdir()?;
    let filter_dir = tempdir()?;
    let path = source_dir.path().join("note.txt");
    std::fs::write(&path, b"shared bytes")?;

    let engine = ConvolveFs::new(filter_dir.path())?;
    let first = engine.create_handler("/note.txt", &path)?;
    let second = engine.create_handler("/note.txt", &path)?;
    let third = engine.create_handler("/note.txt", &path)?;
    assert!(Arc::ptr_eq(&first, &second));
    assert!(Arc::ptr_eq(&second, &third));
    assert_eq!(engine.total_openings(), 1);
    assert_eq!(engine.total_reopens(), 2);
    assert_eq!(engine.open_handler_count(), 1);

    engine.close("/note.txt");
    engine.close("/note.txt");
    assert_eq!(engine.open_handler_count(), 1);
    engine.close("/note.txt");
    assert_eq!(engine.open_handler_count(), 0);
    Ok(())
}

#[test]
fn early_close_quiesces_the_producer() -> Result<(), Box<dyn Error>> {
    let source_dir = tempdir()?;
    let filter_dir = tempdir()?;
    install_identity_filter(filter_dir.path(), 8_000, 16, 1)?;
    let input = flac_tone_bytes(8_000, 20_000);
    let path = source_dir.path().join("tone.flac");
    std::fs::write(&path, &input)?;

    let engine = ConvolveFs::new(filter_dir.path())?;
    let handler = engine.create_handler("/tone.flac", &path)?;

    // Touch only the header, then release while most of the stream is
    // still unconverted.
    let mut probe = [0u8; 16];
    assert!(handler.read(&mut probe, 0)? > 0);
    engine.close("/tone.flac");
    assert_eq!(engine.open_handler_count(), 0);

    // The close shut the pipeline down: a payload read through the
    // still-held reference cannot produce new data any more.
    let mut chunk = vec![0u8; 4096];
    let n = handler.read(&mut chunk, 42)?;
    assert_eq!(n, 0, "closed handler must not convolve further");

    // The header bytes produced before the close stay readable.
    let n = handler.read(&mut chunk, 0)?;
    assert_eq!(n, 42);
    assert_eq!(&chunk[..4], b"fLaC");
    Ok(())
}

#[test]
fn stat_by_filename_only_answers_for_open_paths() -> Result<(), Box<dyn Error>> {
    let source_dir = tempdir()?;
    let filter_dir = tempdir()?;
    let path = source_dir.path().join("note.txt");
    std::fs::write(&path, b"0123456789")?;

    let engine = ConvolveFs::new(filter_dir.path())?;
    assert!(engine.stat_by_filename("/note.txt").is_none());

    let _handler = engine.create_handler("/note.txt", &path)?;
    let stat = engine
        .stat_by_filename("/note.txt")
        .expect("path is open now")?;
    assert_eq!(stat.size, 10);

    engine.close("/note.txt");
    assert!(engine.stat_by_filename("/note.txt").is_none());
    Ok(())
}

#[test]
fn concurrent_readers_make_progress_on_one_handler() -> Result<(), Box<dyn Error>> {
    let source_dir = tempdir()?;
    let filter_dir = tempdir()?;
    install_identity_filter(filter_dir.path(), 8_000, 16, 1)?;
    let input = flac_tone_bytes(8_000, 20_000);
    let path = source_dir.path().join("tone.flac");
    std::fs::write(&path, &input)?;

    let engine = ConvolveFs::new(filter_dir.path())?;
    let handler = engine.create_handler("/tone.flac", &path)?;

    std::thread::scope(|scope| {
        for reader in 0..4 {
            let handler = Arc::clone(&handler);
            scope.spawn(move || {
                let mut chunk = vec![0u8; 4096];
                let mut offset = (reader * 1000) as u64;
                for _ in 0..8 {
                    let n = handler.read(&mut chunk, offset).expect("read failed");
                    if n == 0 {
                        break;
                    }
                    offset += n as u64;
                }
            });
        }
    });

    engine.close("/tone.flac");
    Ok(())
}
