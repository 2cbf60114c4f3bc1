use std::fs::OpenOptions;
use std::io::Write;

use anyhow::Context;
use log::info;
use sectorfs::io::{FileSectorEmulator, FileSectorEmulatorBuilder, SectorStorage};
use sectorfs::FileSystem;

use crate::cli::{Command, ImageCommand, SfsCli};

/// Runs one command against the disk image named in `args`, writing any
/// listing or file contents to `out`.
pub fn run(args: &SfsCli, out: &mut dyn Write) -> anyhow::Result<()> {
    match &args.command {
        Command::Format => format(args, out),
        Command::Image(command) => edit(args, command, out),
    }
}

fn edit(args: &SfsCli, command: &ImageCommand, out: &mut dyn Write) -> anyhow::Result<()> {
    let dev = FileSectorEmulator::open_disk(&args.disk, args.sectors)
        .with_context(|| format!("cannot open {}", args.disk.display()))?;
    let mut fs = FileSystem::mount(dev)
        .with_context(|| format!("cannot mount {}", args.disk.display()))?;

    match command {
        ImageCommand::Mkdir { path } => {
            fs.mkdir(path)?;
        }
        ImageCommand::Create { path, size } => {
            fs.create(path, *size)?;
        }
        ImageCommand::Cp { source, path } => {
            let data = std::fs::read(source)
                .with_context(|| format!("cannot read {}", source.display()))?;
            fs.create(path, data.len())?;
            fs.write_file(path, 0, &data)?;
            info!("copied {} bytes into {}", data.len(), path);
        }
        ImageCommand::Cat { path } => {
            out.write_all(&fs.read_file(path)?)?;
        }
        ImageCommand::Ls { path } => {
            for name in fs.list(path)? {
                writeln!(out, "{}", name)?;
            }
        }
        ImageCommand::Lsr { path } => fs.recursive_list(path, out)?,
        ImageCommand::Rm { recursive, path } => fs.remove(path, *recursive)?,
        ImageCommand::Dump { path } => fs.print_file(path, out)?,
        ImageCommand::Stat => fs.print(out)?,
    }
    fs.sync()?;
    Ok(())
}

fn format(args: &SfsCli, out: &mut dyn Write) -> anyhow::Result<()> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(&args.disk)
        .with_context(|| format!("cannot open {}", args.disk.display()))?;
    let dev = FileSectorEmulatorBuilder::from(file)
        .with_sector_count(args.sectors)
        .build()?;
    let mut fs = FileSystem::format(dev)?;
    info!("formatted {}", args.disk.display());
    writeln!(out, "formatted {} sectors, {} free", args.sectors, fs.free_sectors()?)?;
    Ok(())
}
