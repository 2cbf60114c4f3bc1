use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};

/// Inspect and edit sectorfs disk images.
#[derive(Parser, Debug, PartialEq)]
#[command(author, version, about, long_about = None)]
pub struct SfsCli {
    /// the path of the disk image file
    #[clap(short, long)]
    pub disk: PathBuf,
    /// the number of sectors in the disk image
    #[clap(short, long, default_value_t = sectorfs::NUM_SECTORS)]
    pub sectors: usize,
    /// log more, repeat for even more
    #[clap(short, long, action = ArgAction::Count)]
    pub verbose: u8,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Command {
    /// create the image if needed and write an empty file system to it
    Format,
    #[command(flatten)]
    Image(ImageCommand),
}

/// Commands that work on an existing, formatted image.
#[derive(Subcommand, Debug, PartialEq)]
pub enum ImageCommand {
    /// create an empty directory
    Mkdir { path: String },
    /// create a zero filled file of a fixed size
    Create { path: String, size: usize },
    /// copy a host file into the image
    Cp { source: PathBuf, path: String },
    /// print the contents of a file
    Cat { path: String },
    /// list a directory
    Ls {
        #[arg(default_value = "/")]
        path: String,
    },
    /// list a directory and everything below it
    Lsr {
        #[arg(default_value = "/")]
        path: String,
    },
    /// remove a file or directory
    Rm {
        /// remove non-empty directories and their contents
        #[clap(short, long)]
        recursive: bool,
        path: String,
    },
    /// print the header and contents of a file
    Dump { path: String },
    /// print the free map, the root directory and its files
    Stat,
}

impl SfsCli {
    pub fn log_level(&self) -> log::LevelFilter {
        match self.verbose {
            0 => log::LevelFilter::Warn,
            1 => log::LevelFilter::Info,
            2 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        }
    }
}
