use clap::Parser;

mod cli;
mod commands;

use cli::SfsCli;

/// A command line front end over a sectorfs disk image: format it, create
/// files and directories, copy host files in and list or dump what is there.
fn main() -> anyhow::Result<()> {
    let args = SfsCli::parse();
    env_logger::builder()
        .filter_level(args.log_level())
        .parse_default_env()
        .format_timestamp_nanos()
        .init();

    let stdout = std::io::stdout();
    commands::run(&args, &mut stdout.lock())
}
