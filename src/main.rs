//! Perun CLI - Command-line tool for reading CryEngine PAK/P4K archives.

use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};

use perun_pak::{OpenOptions, PakArchive, PakFlavor, SignaturePolicy, TestStrategy};

/// Perun - CryEngine PAK/P4K archive reader
#[derive(Parser)]
#[command(name = "perun")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List contents of an archive
    List {
        /// Path to the archive
        #[arg(short, long, env = "INPUT_PAK")]
        archive: PathBuf,

        /// Archive key ("aes:<hex>")
        #[arg(short, long)]
        key: Option<String>,

        /// Filter pattern (substring match)
        #[arg(short, long)]
        filter: Option<String>,

        /// Show detailed information
        #[arg(short, long)]
        detailed: bool,
    },

    /// Extract files from an archive
    Extract {
        /// Path to the archive
        #[arg(short, long, env = "INPUT_PAK")]
        archive: PathBuf,

        /// Output directory
        #[arg(short, long, env = "OUTPUT_FOLDER")]
        output: PathBuf,

        /// Archive key ("aes:<hex>")
        #[arg(short, long)]
        key: Option<String>,

        /// Filter pattern (substring match)
        #[arg(short, long)]
        filter: Option<String>,
    },

    /// Write one entry to stdout
    Cat {
        /// Path to the archive
        #[arg(short, long, env = "INPUT_PAK")]
        archive: PathBuf,

        /// Entry path inside the archive
        entry: String,

        /// Archive key ("aes:<hex>")
        #[arg(short, long)]
        key: Option<String>,
    },

    /// Test an archive for integrity
    Test {
        /// Path to the archive
        #[arg(short, long, env = "INPUT_PAK")]
        archive: PathBuf,

        /// Archive key ("aes:<hex>")
        #[arg(short, long)]
        key: Option<String>,

        /// Also decode entry data and verify checksums
        #[arg(short, long)]
        data: bool,

        /// Report every error instead of stopping at the first
        #[arg(long)]
        keep_going: bool,

        /// Reject archives whose directory signature does not verify
        #[arg(long)]
        strict_signatures: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::List {
            archive,
            key,
            filter,
            detailed,
        } => cmd_list(&archive, key.as_deref(), filter.as_deref(), detailed),
        Commands::Extract {
            archive,
            output,
            key,
            filter,
        } => cmd_extract(&archive, &output, key.as_deref(), filter.as_deref()),
        Commands::Cat { archive, entry, key } => cmd_cat(&archive, &entry, key.as_deref()),
        Commands::Test {
            archive,
            key,
            data,
            keep_going,
            strict_signatures,
        } => cmd_test(&archive, key.as_deref(), data, keep_going, strict_signatures),
    }
}

/// Parse a textual archive key: "aes:<hex>", or "aes:" followed by
/// "/xx"-separated byte pairs.
fn parse_key(text: &str) -> Result<Vec<u8>> {
    let Some(body) = text
        .strip_prefix("aes:")
        .or_else(|| text.strip_prefix("AES:"))
    else {
        bail!("key must start with \"aes:\": {text}");
    };
    if let Some(pairs) = body.strip_prefix('/') {
        return pairs
            .split('/')
            .map(|pair| u8::from_str_radix(pair, 16).context("bad hex byte in key"))
            .collect();
    }
    hex::decode(body).context("bad hex in key")
}

fn open_archive(path: &PathBuf, key: Option<&str>) -> Result<PakArchive> {
    open_archive_with_policy(path, key, SignaturePolicy::Permissive)
}

fn open_archive_with_policy(
    path: &PathBuf,
    key: Option<&str>,
    policy: SignaturePolicy,
) -> Result<PakArchive> {
    let mut options = match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("p4k") => OpenOptions::p4k(),
        _ => OpenOptions::pak(),
    }
    .signature_policy(policy);
    if let Some(key) = key {
        options = options.with_key(parse_key(key)?);
    }
    PakArchive::open_with(path, options)
        .with_context(|| format!("failed to open {}", path.display()))
}

fn matches_filter(name: &str, filter: Option<&str>) -> bool {
    filter.map_or(true, |f| name.contains(f))
}

fn cmd_list(path: &PathBuf, key: Option<&str>, filter: Option<&str>, detailed: bool) -> Result<()> {
    let archive = open_archive(path, key)?;

    let mut shown = 0usize;
    let mut total_bytes = 0u64;
    for entry in archive.entries() {
        if !matches_filter(entry.name(), filter) {
            continue;
        }
        shown += 1;
        total_bytes += entry.uncompressed_size();
        if detailed {
            println!(
                "{:>12}  {:>12}  m{:<3}  {:08x}  {}",
                entry.uncompressed_size(),
                entry.compressed_size(),
                entry.method(),
                entry.crc32(),
                entry.name()
            );
        } else {
            println!("{}", entry.name());
        }
    }

    if detailed {
        println!(
            "\n{} of {} entries, {} bytes, scheme {:?}",
            shown,
            archive.entry_count(),
            total_bytes,
            archive.encryption_scheme()
        );
    }
    Ok(())
}

fn cmd_extract(
    path: &PathBuf,
    output: &PathBuf,
    key: Option<&str>,
    filter: Option<&str>,
) -> Result<()> {
    let archive = open_archive(path, key)?;
    let start = Instant::now();

    let selected: Vec<usize> = archive
        .entries()
        .iter()
        .filter(|e| e.is_file() && matches_filter(e.name(), filter))
        .map(|e| e.index())
        .collect();

    let progress = ProgressBar::new(selected.len() as u64);
    progress.set_style(
        ProgressStyle::with_template("{bar:40} {pos}/{len} {msg}")
            .expect("static progress template"),
    );

    let mut extracted = 0usize;
    for index in selected {
        let entry = &archive.entries()[index];
        let target = output.join(entry.output_path());
        progress.set_message(entry.name().to_string());

        let data = archive
            .read(index)
            .with_context(|| format!("failed to extract {}", entry.name()))?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&target, data)?;
        extracted += 1;
        progress.inc(1);
    }

    progress.finish_and_clear();
    println!(
        "extracted {extracted} entries in {:.2}s",
        start.elapsed().as_secs_f64()
    );
    Ok(())
}

fn cmd_cat(path: &PathBuf, entry_path: &str, key: Option<&str>) -> Result<()> {
    let archive = open_archive(path, key)?;
    let entry = archive
        .find(entry_path)
        .with_context(|| format!("entry not found: {entry_path}"))?;
    let data = archive.read(entry.index())?;
    std::io::stdout().write_all(&data)?;
    Ok(())
}

fn cmd_test(
    path: &PathBuf,
    key: Option<&str>,
    data: bool,
    keep_going: bool,
    strict_signatures: bool,
) -> Result<()> {
    let policy = if strict_signatures {
        SignaturePolicy::Strict
    } else {
        SignaturePolicy::Permissive
    };
    let archive = open_archive_with_policy(path, key, policy)?;
    if archive.flavor() == PakFlavor::Pak {
        println!(
            "scheme: {:?}, signature: {:?}",
            archive.encryption_scheme(),
            archive.signature_scheme()
        );
    }

    let strategy = if keep_going {
        TestStrategy::FindAllErrors
    } else {
        TestStrategy::FindFirstError
    };

    let progress = ProgressBar::new(archive.entry_count() as u64);
    progress.set_style(
        ProgressStyle::with_template("{bar:40} {pos}/{len} {msg}")
            .expect("static progress template"),
    );

    let mut last_index = usize::MAX;
    let passed = archive.test_archive_with(data, strategy, |status, message| {
        if let Some(entry) = status.entry {
            if entry.index() != last_index {
                last_index = entry.index();
                progress.set_position(entry.index() as u64);
                progress.set_message(entry.name().to_string());
            }
        }
        if let Some(message) = message {
            let name = status.entry.map(|e| e.name()).unwrap_or("<archive>");
            progress.println(format!("{name}: {message}"));
        }
    });

    progress.finish_and_clear();
    if passed {
        println!("archive ok: {} entries", archive.entry_count());
        Ok(())
    } else {
        bail!("archive failed integrity test");
    }
}
