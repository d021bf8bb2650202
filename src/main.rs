//! Command-line front end for the recovery engine.

use std::path::PathBuf;
use std::process;

use clap::{Parser, ValueEnum};

use salvage::detect::Filesystem;
use salvage::engine::RunOptions;

#[derive(Parser, Debug)]
#[command(name = "salvage", version)]
#[command(about = "Recover deleted files from FAT32/NTFS volumes and disk images")]
#[command(after_help = "Examples:
  salvage --device /dev/sdb1 --output ./recovered
  salvage --device disk.img --fs ntfs --scan
  salvage --device /dev/sdb1 --carve")]
struct Cli {
    /// Device or image file to read (e.g. /dev/sdb1, disk.img)
    #[arg(short, long)]
    device: String,

    /// Output directory for recovered files
    #[arg(short, long, default_value = "./recovered")]
    output: PathBuf,

    /// Filesystem type, or auto to detect from the boot sector
    #[arg(long, value_enum, default_value_t = FsArg::Auto)]
    fs: FsArg,

    /// List recoverable files without writing them
    #[arg(long)]
    scan: bool,

    /// Carve by file signature instead of parsing filesystem metadata
    #[arg(long)]
    carve: bool,

    /// Print the scan listing as JSON
    #[arg(long)]
    json: bool,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum FsArg {
    Auto,
    Fat32,
    Ntfs,
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let opts = RunOptions {
        device: cli.device,
        output_dir: cli.output,
        fs_override: match cli.fs {
            FsArg::Auto => None,
            FsArg::Fat32 => Some(Filesystem::Fat32),
            FsArg::Ntfs => Some(Filesystem::Ntfs),
        },
        scan_only: cli.scan,
        carve: cli.carve,
        json: cli.json,
    };

    match salvage::run(&opts) {
        Ok(count) => {
            println!("\nRecovery complete. Found {} deleted files.", count);
        }
        Err(e) => {
            eprintln!("Recovery error: {}", e);
            process::exit(1);
        }
    }
}
