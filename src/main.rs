use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;

use renpak::reader::{Progress, RpaReader, Stage};
use renpak::writer::{pack_dir, PackOptions};
use renpak::{classify_script, ArchiveError, Version};

#[derive(Parser)]
#[command(name = "renpak")]
#[command(about = "Pack, inspect, and extract RPA archives", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Package a directory (or single file) into an archive.
    Pack {
        input: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        /// Archive family: 1.0, 2.0, 3.0, 3.2 or 4.0.
        #[arg(short, long, default_value = "3.0", value_parser = parse_version)]
        version: Version,
        /// XOR key override (hex), for the keyed families.
        #[arg(short, long, value_parser = parse_key)]
        key: Option<u32>,
        /// Pickle protocol override (2 or 4).
        #[arg(long)]
        protocol: Option<u8>,
        /// Write "Made with Ren'Py." padding before each payload.
        #[arg(long)]
        marker: bool,
        /// Include dot-files and dot-directories.
        #[arg(long)]
        include_hidden: bool,
        /// Overwrite an existing output file.
        #[arg(short, long)]
        force: bool,
    },
    /// Extract every member of an archive.
    Unpack {
        input: PathBuf,
        #[arg(short = 'C', long, default_value = ".")]
        output_dir: PathBuf,
    },
    /// List member paths.
    List {
        input: PathBuf,
        #[arg(short, long)]
        verbose: bool,
    },
    /// Show header and index summary.
    Info {
        input: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Classify a compiled script file (or every .rpyc under a directory).
    Classify {
        input: PathBuf,
        #[arg(long)]
        json: bool,
    },
}

fn parse_version(s: &str) -> Result<Version, String> {
    match s {
        "1" | "1.0" => Ok(Version::V1),
        "2" | "2.0" => Ok(Version::V2),
        "3" | "3.0" => Ok(Version::V3),
        "3.2" => Ok(Version::V3_2),
        "4" | "4.0" => Ok(Version::V4),
        other => Err(format!("unknown archive family {other:?}")),
    }
}

fn parse_key(s: &str) -> Result<u32, String> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    u32::from_str_radix(s, 16).map_err(|e| format!("bad hex key: {e}"))
}

#[derive(Serialize)]
struct InfoReport {
    family: &'static str,
    index_offset: u64,
    key: Option<String>,
    members: usize,
    archive_len: u64,
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();
    match run(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(command: Commands) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Commands::Pack { input, output, version, key, protocol, marker, include_hidden, force } => {
            let opts = PackOptions {
                version,
                key,
                pickle_protocol: protocol,
                marker,
                include_hidden,
                force,
            };
            let summary = pack_dir(&input, &output, &opts)?;
            println!(
                "packed {} members ({} payload bytes, {} index bytes) into {}",
                summary.members,
                summary.payload_bytes,
                summary.index_bytes,
                output.display()
            );
        }
        Commands::Unpack { input, output_dir } => {
            let mut reader = RpaReader::open(&input)?;
            let report = reader.extract_all(&output_dir, None, |p: Progress| {
                if p.stage == Stage::Extract && !p.message.is_empty() {
                    println!("unpacked: {}", p.message);
                }
            })?;
            println!("{} members extracted", report.extracted);
            for refused in &report.refused {
                eprintln!("skipped: {refused}");
            }
        }
        Commands::List { input, verbose } => {
            let mut reader = RpaReader::open(&input)?;
            if verbose {
                for e in reader.entries()? {
                    println!(
                        "{}  off={} len={} prefix={}",
                        e.path, e.offset, e.length, e.prefix_len
                    );
                }
            } else {
                for path in reader.list_paths()? {
                    println!("{path}");
                }
            }
        }
        Commands::Info { input, json } => {
            let mut reader = RpaReader::open(&input)?;
            let header = reader.header()?;
            let report = InfoReport {
                family: header.version.tag(),
                index_offset: header.offset,
                key: header
                    .version
                    .has_key()
                    .then(|| format!("{:08X}", header.key)),
                members: reader.index()?.len(),
                archive_len: reader.len(),
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("family:       {}", report.family);
                println!("index offset: {:#x}", report.index_offset);
                if let Some(key) = &report.key {
                    println!("key:          {key}");
                }
                println!("members:      {}", report.members);
                println!("archive len:  {}", report.archive_len);
            }
        }
        Commands::Classify { input, json } => {
            let targets: Vec<PathBuf> = if input.is_dir() {
                let mut scripts: Vec<PathBuf> = walkdir::WalkDir::new(&input)
                    .follow_links(false)
                    .into_iter()
                    .filter_map(|e| e.ok())
                    .filter(|e| e.file_type().is_file())
                    .map(|e| e.path().to_owned())
                    .filter(|p| p.extension().map(|x| x == "rpyc").unwrap_or(false))
                    .collect();
                scripts.sort();
                scripts
            } else {
                vec![input.clone()]
            };

            if targets.is_empty() {
                return Err(Box::new(ArchiveError::EmptyInput));
            }

            for path in targets {
                let data = std::fs::read(&path)?;
                let report = classify_script(&data);
                if json {
                    println!("{}", serde_json::to_string_pretty(&report)?);
                } else {
                    println!(
                        "{}: {} [{:?}, confidence {:?}]",
                        path.display(),
                        report.label,
                        report.format,
                        report.confidence
                    );
                }
            }
        }
    }
    Ok(())
}
