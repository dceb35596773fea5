use clap::{value_parser, Arg, Command};
use std::path::PathBuf;

pub fn build_cli() -> Command {
    Command::new(env!("CARGO_PKG_NAME"))
        .author(env!("CARGO_PKG_AUTHORS"))
        .about("Render sound files through convolution filters")
        .version(env!("CARGO_PKG_VERSION"))
        .arg(
            Arg::new("filter-dir")
                .short('f')
                .long("filter-dir")
                .value_name("DIR")
                .help("Directory holding filter-<rate>-<bits>-<channels>.conf files")
                .required(true)
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("input")
                .value_name("INPUT")
                .help("Path to the sound file to render")
                .required(true)
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("output")
                .value_name("OUTPUT")
                .help("File the rendered stream is written to")
                .required(true)
                .value_parser(value_parser!(PathBuf)),
        )
}
