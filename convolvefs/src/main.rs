use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

use anyhow::{anyhow, Context};
use convolvefs_core::ConvolveFs;
use log::info;

mod cli;

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let matches = cli::build_cli().get_matches();
    let filter_dir = matches
        .get_one::<PathBuf>("filter-dir")
        .expect("required argument");
    let input = matches
        .get_one::<PathBuf>("input")
        .expect("required argument");
    let output = matches
        .get_one::<PathBuf>("output")
        .expect("required argument");

    if !input.is_file() {
        return Err(anyhow!("input file does not exist: {}", input.display()));
    }

    let engine = ConvolveFs::new(filter_dir)
        .with_context(|| format!("failed to initialise with filters from '{}'", filter_dir.display()))?;

    let file_name = input
        .file_name()
        .ok_or_else(|| anyhow!("input path has no file name: {}", input.display()))?;
    let fs_path = format!("/{}", file_name.to_string_lossy());

    let handler = engine
        .create_handler(&fs_path, input)
        .with_context(|| format!("failed to open '{}'", input.display()))?;

    let mut out = File::create(output)
        .with_context(|| format!("failed to create '{}'", output.display()))?;

    // Sequential reads through the handler drive the conversion exactly
    // as a filesystem client would.
    let mut chunk = vec![0u8; 64 * 1024];
    let mut offset: u64 = 0;
    loop {
        let read = handler
            .read(&mut chunk, offset)
            .with_context(|| format!("read at offset {offset} failed"))?;
        if read == 0 {
            break;
        }
        out.write_all(&chunk[..read])?;
        offset += read as u64;
    }
    engine.close(&fs_path);

    info!("rendered {} bytes to {}", offset, output.display());
    Ok(())
}
