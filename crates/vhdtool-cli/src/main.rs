//! VHDTool CLI - Convert raw disk images to VHD format.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::EnvFilter;
use vhdtool_core::convert::blank_disk_size;
use vhdtool_core::{
    convert, create_blank, ConvertOptions, ConvertPhase, ConvertProgress, ConvertSummary,
    DiskType, ImageReader, ProgressCallback, RawImage, VhdFile, DEFAULT_BLOCK_SIZE,
};

/// Fast, multithreaded tool for converting raw disk images to VHD format.
#[derive(Parser)]
#[command(name = "vhdtool")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace). RUST_LOG overrides.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert a raw disk image to VHD format.
    Convert {
        /// Path to the raw image.
        input: PathBuf,

        /// Output VHD file path. Defaults to the input name with .vhd extension.
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Block size in KiB for dynamic disks (power of two).
        #[arg(long, default_value_t = DEFAULT_BLOCK_SIZE / 1024)]
        block_size_kib: u32,

        /// Write a fixed (fully allocated) disk instead of a dynamic one.
        #[arg(long)]
        fixed: bool,

        /// Reject sources whose size is not a multiple of 512 bytes.
        #[arg(long)]
        no_pad: bool,

        /// Number of threads to use (0 = auto-detect).
        #[arg(short, long, default_value = "0")]
        threads: usize,

        /// Suppress progress output.
        #[arg(short, long)]
        quiet: bool,
    },

    /// Create a blank VHD of the given size.
    Create {
        /// Output VHD file path.
        output: PathBuf,

        /// Virtual disk size in MiB (rounded up to whole 2 MiB blocks).
        #[arg(long)]
        size_mib: u64,

        /// Write a fixed (fully allocated) disk instead of a dynamic one.
        #[arg(long)]
        fixed: bool,

        /// Suppress progress output.
        #[arg(short, long)]
        quiet: bool,
    },

    /// Display information about a VHD file.
    Info {
        /// Path to the VHD file.
        vhd_file: PathBuf,
    },

    /// Write the virtual disk of a VHD file out as a raw image.
    Extract {
        /// Path to the VHD file.
        vhd_file: PathBuf,

        /// Output raw image path.
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Convert {
            input,
            output,
            block_size_kib,
            fixed,
            no_pad,
            threads,
            quiet,
        } => {
            let options = ConvertOptions {
                block_size: block_size_kib
                    .checked_mul(1024)
                    .context("block size is too large")?,
                disk_type: if fixed { DiskType::Fixed } else { DiskType::Dynamic },
                pad_unaligned: !no_pad,
                num_threads: threads,
                ..ConvertOptions::default()
            };
            run_convert(&input, output.as_deref(), &options, quiet)?;
        }
        Commands::Create {
            output,
            size_mib,
            fixed,
            quiet,
        } => {
            let options = if fixed {
                ConvertOptions::fixed()
            } else {
                ConvertOptions::default()
            };
            run_create(&output, size_mib, &options, quiet)?;
        }
        Commands::Info { vhd_file } => {
            show_info(&vhd_file)?;
        }
        Commands::Extract { vhd_file, output } => {
            run_extract(&vhd_file, &output)?;
        }
    }

    Ok(())
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn default_output(input: &Path) -> PathBuf {
    input.with_extension("vhd")
}

fn run_convert(
    input: &Path,
    output: Option<&Path>,
    options: &ConvertOptions,
    quiet: bool,
) -> Result<()> {
    let output_path = match output {
        Some(path) => path.to_path_buf(),
        None => default_output(input),
    };
    if output_path == input {
        bail!("output path {} is the same as the input", output_path.display());
    }

    tracing::debug!(?options, output = %output_path.display(), "convert options");
    let source = RawImage::open(input)
        .with_context(|| format!("failed to open {}", input.display()))?;

    if !quiet {
        println!("VHD Conversion");
        println!("--------------");
        println!("Input:     {}", input.display());
        println!("Size:      {}", format_bytes(source.size()));
        println!("Output:    {}", output_path.display());
        println!("Type:      {}", options.disk_type);
        if options.disk_type == DiskType::Dynamic {
            println!("Block:     {}", format_bytes(options.block_size as u64));
        }
        println!();
    }

    let progress_bar = (!quiet).then(|| new_progress_bar(source.size())).transpose()?;
    let result = convert(&source, &output_path, options, progress_callback(progress_bar.as_ref()));
    finish_progress_bar(progress_bar, result.is_ok());

    let summary = result.with_context(|| format!("failed to convert {}", input.display()))?;

    if !quiet {
        println!();
        println!("Conversion completed successfully: {}", output_path.display());
        print_summary(&summary);
    }

    Ok(())
}

fn run_create(output: &Path, size_mib: u64, options: &ConvertOptions, quiet: bool) -> Result<()> {
    let size = blank_disk_size(size_mib)?;
    tracing::debug!(?options, size, output = %output.display(), "create options");

    if !quiet {
        println!("VHD Creation");
        println!("------------");
        println!("Output:    {}", output.display());
        println!("Size:      {}", format_bytes(size));
        println!("Type:      {}", options.disk_type);
        println!();
    }

    let progress_bar = (!quiet).then(|| new_progress_bar(size)).transpose()?;
    let result = create_blank(output, size, options, progress_callback(progress_bar.as_ref()));
    finish_progress_bar(progress_bar, result.is_ok());

    let summary = result.with_context(|| format!("failed to create {}", output.display()))?;

    if !quiet {
        println!();
        println!("Created {}", output.display());
        print_summary(&summary);
    }

    Ok(())
}

fn new_progress_bar(len: u64) -> Result<Arc<Mutex<ProgressBar>>> {
    let pb = ProgressBar::new(len);
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta}) {msg}")?
        .progress_chars("#>-");
    pb.set_style(style);
    Ok(Arc::new(Mutex::new(pb)))
}

fn progress_callback(progress_bar: Option<&Arc<Mutex<ProgressBar>>>) -> Option<ProgressCallback> {
    progress_bar.map(|pb| {
        let pb_arc = Arc::clone(pb);
        Box::new(move |progress: ConvertProgress| {
            let Ok(pb) = pb_arc.lock() else {
                return;
            };
            pb.set_length(progress.bytes_total);
            pb.set_position(progress.bytes_processed);

            let phase_msg = match progress.phase {
                ConvertPhase::BlocksWritten | ConvertPhase::HeaderWritten
                    if progress.blocks_total > 0 =>
                {
                    format!(
                        "{}/{} blocks allocated",
                        progress.blocks_allocated, progress.blocks_total
                    )
                }
                phase => phase.to_string(),
            };
            pb.set_message(phase_msg);
        }) as ProgressCallback
    })
}

fn finish_progress_bar(progress_bar: Option<Arc<Mutex<ProgressBar>>>, ok: bool) {
    if let Some(pb_arc) = progress_bar {
        if let Ok(pb) = pb_arc.lock() {
            if ok {
                pb.finish_with_message("Complete!");
            } else {
                pb.abandon_with_message("Failed");
            }
        }
    }
}

fn print_summary(summary: &ConvertSummary) {
    println!("Disk id:     {}", summary.disk_id);
    println!("Geometry:    {}", summary.geometry);
    if summary.disk_type == DiskType::Dynamic {
        println!(
            "Blocks:      {} of {} allocated",
            summary.blocks_allocated, summary.blocks_total
        );
    }
    if summary.disk_size > 0 {
        println!(
            "Output size: {} ({:.1}% of disk size)",
            format_bytes(summary.output_size),
            (summary.output_size as f64 / summary.disk_size as f64) * 100.0
        );
    }
}

fn show_info(vhd_file: &Path) -> Result<()> {
    let vhd = VhdFile::open(vhd_file)
        .with_context(|| format!("failed to open {}", vhd_file.display()))?;

    println!("VHD Information");
    println!("===============");
    println!();
    println!("File:      {}", vhd_file.display());
    println!("File size: {}", format_bytes(vhd.file_size()));
    println!("Capacity:  {}", format_bytes(vhd.capacity()));
    println!();
    println!("{}", vhd.footer());

    if let Some(header) = vhd.header() {
        println!();
        println!("{}", header);
        println!();
        let total = vhd.block_count();
        let allocated = vhd.allocated_blocks();
        let percent = if total == 0 {
            0.0
        } else {
            allocated as f64 / total as f64 * 100.0
        };
        println!(
            "Allocation: {} of {} blocks ({:.1}%)",
            allocated, total, percent
        );
    }

    Ok(())
}

fn run_extract(vhd_file: &Path, output: &Path) -> Result<()> {
    let mut vhd = VhdFile::open(vhd_file)
        .with_context(|| format!("failed to open {}", vhd_file.display()))?;

    let file = File::create(output)
        .with_context(|| format!("failed to create {}", output.display()))?;
    let mut writer = BufWriter::new(file);
    let written = vhd.write_raw(&mut writer)?;
    writer
        .flush()
        .with_context(|| format!("failed to write {}", output.display()))?;

    println!("Extracted {} to {}", format_bytes(written), output.display());
    Ok(())
}

/// Format bytes as human-readable string.
fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    const TB: u64 = GB * 1024;

    if bytes >= TB {
        format!("{:.2} TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.00 KB");
        assert_eq!(format_bytes(10 * 1024 * 1024), "10.00 MB");
    }

    #[test]
    fn test_default_output() {
        assert_eq!(default_output(Path::new("/tmp/disk.img")), PathBuf::from("/tmp/disk.vhd"));
        assert_eq!(default_output(Path::new("disk")), PathBuf::from("disk.vhd"));
    }

    #[test]
    fn test_cli_parses_convert() {
        let cli = Cli::try_parse_from([
            "vhdtool",
            "-v",
            "convert",
            "disk.img",
            "--fixed",
            "--no-pad",
            "--block-size-kib",
            "512",
        ])
        .expect("arguments should parse");
        assert_eq!(cli.verbose, 1);
        match cli.command {
            Commands::Convert {
                block_size_kib,
                fixed,
                no_pad,
                ..
            } => {
                assert_eq!(block_size_kib, 512);
                assert!(fixed);
                assert!(no_pad);
            }
            _ => panic!("expected convert command"),
        }
    }

    #[test]
    fn test_cli_parses_create() {
        let cli = Cli::try_parse_from(["vhdtool", "create", "blank.vhd", "--size-mib", "100"])
            .expect("arguments should parse");
        match cli.command {
            Commands::Create {
                output,
                size_mib,
                fixed,
                quiet,
            } => {
                assert_eq!(output, PathBuf::from("blank.vhd"));
                assert_eq!(size_mib, 100);
                assert!(!fixed);
                assert!(!quiet);
            }
            _ => panic!("expected create command"),
        }
        assert!(Cli::try_parse_from(["vhdtool", "create", "blank.vhd"]).is_err());
    }

    #[test]
    fn test_run_create_writes_blank_disk() {
        let dir = tempfile::TempDir::new().expect("Failed to create temp dir");
        let output = dir.path().join("blank.vhd");
        run_create(&output, 4, &ConvertOptions::default(), true).expect("create should succeed");

        let vhd = VhdFile::open(&output).expect("Failed to open VHD");
        assert_eq!(vhd.capacity(), 4 * 1024 * 1024);
        assert_eq!(vhd.allocated_blocks(), 0);
    }

    #[test]
    fn test_cli_default_block_size() {
        let cli = Cli::try_parse_from(["vhdtool", "convert", "disk.img"]).expect("should parse");
        match cli.command {
            Commands::Convert { block_size_kib, .. } => assert_eq!(block_size_kib, 2048),
            _ => panic!("expected convert command"),
        }
    }
}
