//! Shellhost: architecture-aware shellcode loader
//!
//! Picks the way to run a payload built for a named architecture on this host and runs
//! it, exiting with the payload's own exit status.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;

use shellhost::disasm::preview::{EntryPreview, PreviewLine};
use shellhost::engine::cancel::CancelToken;
use shellhost::engine::runner::Plan;
use shellhost::image::loader::{load_image, InputFormat, SourceFormat};
use shellhost::platform::catalog::{ArchitectureDescriptor, Bitness, CpuFamily};
use shellhost::platform::host::{HostProfile, OperatingSystem};
use shellhost::strategy::config::LoaderConfig;
use shellhost::strategy::selector::ExecutionStrategy;

/// Instructions shown by `plan` at the entry point
const PREVIEW_INSTRUCTIONS: usize = 8;

#[derive(Parser)]
#[command(name = "shellhost")]
#[command(author, version, about = "Architecture-aware shellcode loader")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(clap::Args)]
struct TargetArgs {
    /// Target architecture (see `targets`)
    #[arg(short, long)]
    arch: String,

    /// Operating system the payload was built for (defaults to the host's)
    #[arg(long, value_parser = parse_os)]
    os: Option<OperatingSystem>,

    /// How to interpret the input file
    #[arg(short, long, default_value = "auto")]
    format: FormatArg,

    /// Fail when a PE container has no `.text` section instead of assuming offset 0
    #[arg(long)]
    strict_entry: bool,

    /// Architecture catalog (JSON) replacing the built-in one
    #[arg(long)]
    catalog: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a shellcode file
    Run {
        /// Raw shellcode or ELF/PE container
        #[arg(required = true)]
        input: PathBuf,

        #[command(flatten)]
        target: TargetArgs,

        /// Give up on the payload after this many seconds
        #[arg(short, long)]
        timeout: Option<u64>,

        /// Report format
        #[arg(short, long, default_value = "text")]
        report: OutputFormat,
    },

    /// Show the strategy that would be used, without executing anything
    Plan {
        /// Shellcode file whose entry point should be resolved and previewed
        input: Option<PathBuf>,

        #[command(flatten)]
        target: TargetArgs,

        /// Report format
        #[arg(short, long, default_value = "text")]
        report: OutputFormat,
    },

    /// List known target architectures
    Targets {
        /// Architecture catalog (JSON) replacing the built-in one
        #[arg(long)]
        catalog: Option<PathBuf>,

        /// Output format
        #[arg(short, long, default_value = "text")]
        report: OutputFormat,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum FormatArg {
    Auto,
    Raw,
    Container,
}

impl From<FormatArg> for InputFormat {
    fn from(arg: FormatArg) -> Self {
        match arg {
            FormatArg::Auto => InputFormat::Auto,
            FormatArg::Raw => InputFormat::Raw,
            FormatArg::Container => InputFormat::Container,
        }
    }
}

fn parse_os(value: &str) -> std::result::Result<OperatingSystem, String> {
    value
        .parse()
        .map_err(|_| format!("unknown OS '{}' (expected windows, linux, macos)", value))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // info+ on stderr; --verbose enables debug; RUST_LOG overrides
    let level = if cli.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_module("shellhost", level)
        .parse_default_env()
        .target(env_logger::Target::Stderr)
        .format_timestamp(None)
        .format_target(false)
        .init();

    match cli.command {
        Commands::Run {
            input,
            target,
            timeout,
            report,
        } => {
            let code = run(&input, &target, timeout.map(Duration::from_secs), report)?;
            std::process::exit(code);
        }
        Commands::Plan {
            input,
            target,
            report,
        } => plan(input.as_deref(), &target, report),
        Commands::Targets { catalog, report } => list_targets(catalog.as_deref(), report),
    }
}

fn build_config(target: &TargetArgs, timeout: Option<Duration>) -> Result<LoaderConfig> {
    let mut config = LoaderConfig::default()
        .with_input_format(target.format.into())
        .with_strict_entry(target.strict_entry)
        .with_timeout(timeout);

    if let Some(path) = &target.catalog {
        config = config
            .with_catalog_file(path)
            .with_context(|| format!("Failed to load catalog {}", path.display()))?;
    }

    Ok(config)
}

/// Execute a payload and return the process exit code to use
fn run(
    input: &Path,
    target: &TargetArgs,
    timeout: Option<Duration>,
    format: OutputFormat,
) -> Result<i32> {
    let started_at = Utc::now();
    let started = Instant::now();

    let config = build_config(target, timeout)?;
    let plan = Plan::detect(&config, &target.arch, target.os)
        .with_context(|| format!("Cannot run {} payloads here", target.arch))?;

    let image = load_image(input, config.input_format, config.strict_entry)
        .with_context(|| format!("Failed to load {}", input.display()))?;
    let image_len = image.len();
    let entry_offset = image.entry_offset();
    let source_format = image.format();

    let token = CancelToken::new();
    let handler_token = token.clone();
    ctrlc::set_handler(move || {
        eprintln!("\nCancelling...");
        handler_token.cancel();
    })
    .context("Failed to set Ctrl+C handler")?;

    let exit_code = plan
        .execute(image, &config, Some(input), token)
        .with_context(|| format!("{} execution of {} failed", plan.strategy, input.display()))?;

    let report = RunReport {
        timestamp: started_at,
        input: input.display().to_string(),
        arch: plan.target.arch.name.clone(),
        target_os: plan.target.os,
        host: plan.host,
        strategy: plan.strategy,
        source_format,
        image_len,
        entry_offset: format!("0x{:x}", entry_offset),
        exit_code: exit_code.0,
        elapsed_ms: started.elapsed().as_millis() as u64,
    };

    match format {
        OutputFormat::Text => eprint!("{}", format_run_text(&report)),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
    }

    Ok(exit_code.as_process_code())
}

/// Report what a run would do
fn plan(input: Option<&Path>, target: &TargetArgs, format: OutputFormat) -> Result<()> {
    let config = build_config(target, None)?;
    let plan = Plan::detect(&config, &target.arch, target.os)
        .with_context(|| format!("Cannot run {} payloads here", target.arch))?;

    let mut report = PlanReport {
        timestamp: Utc::now(),
        host: plan.host,
        running_bits: plan.running_bits,
        arch: plan.target.arch.name.clone(),
        target_os: plan.target.os,
        strategy: plan.strategy,
        image: None,
    };

    if let Some(path) = input {
        let image = load_image(path, config.input_format, config.strict_entry)
            .with_context(|| format!("Failed to load {}", path.display()))?;

        let preview = EntryPreview::for_arch(plan.target.arch)
            .map(|p| p.decode(&image, PREVIEW_INSTRUCTIONS))
            .unwrap_or_default();

        report.image = Some(ImageReport {
            path: path.display().to_string(),
            format: image.format(),
            len: image.len(),
            entry_offset: format!("0x{:x}", image.entry_offset()),
            preview,
        });
    }

    match format {
        OutputFormat::Text => print!("{}", format_plan_text(&report)),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
    }

    Ok(())
}

/// List catalog entries
fn list_targets(catalog: Option<&Path>, format: OutputFormat) -> Result<()> {
    let mut config = LoaderConfig::default();
    if let Some(path) = catalog {
        config = config
            .with_catalog_file(path)
            .with_context(|| format!("Failed to load catalog {}", path.display()))?;
    }

    match format {
        OutputFormat::Text => {
            println!("Known targets");
            println!("=============");
            println!();

            for arch in config.catalog.iter() {
                print!("{}", format_target_text(arch));
            }

            println!();
            println!("Total: {} targets", config.catalog.iter().count());
        }
        OutputFormat::Json => {
            let targets: Vec<&ArchitectureDescriptor> = config.catalog.iter().collect();
            println!("{}", serde_json::to_string_pretty(&targets)?);
        }
    }

    Ok(())
}

// Report structures for output

#[derive(Serialize)]
struct RunReport {
    timestamp: DateTime<Utc>,
    input: String,
    arch: String,
    target_os: OperatingSystem,
    host: HostProfile,
    strategy: ExecutionStrategy,
    source_format: SourceFormat,
    image_len: usize,
    entry_offset: String,
    exit_code: u32,
    elapsed_ms: u64,
}

#[derive(Serialize)]
struct PlanReport {
    timestamp: DateTime<Utc>,
    host: HostProfile,
    running_bits: Bitness,
    arch: String,
    target_os: OperatingSystem,
    strategy: ExecutionStrategy,
    image: Option<ImageReport>,
}

#[derive(Serialize)]
struct ImageReport {
    path: String,
    format: SourceFormat,
    len: usize,
    entry_offset: String,
    preview: Vec<PreviewLine>,
}

fn describe_host(host: &HostProfile) -> String {
    let family = match host.family {
        CpuFamily::Unknown => "unknown CPU".to_string(),
        family => family.to_string(),
    };
    format!("{} {} {}", host.os, family, host.bits)
}

fn describe_format(format: SourceFormat) -> String {
    match format {
        SourceFormat::Raw => "raw".to_string(),
        SourceFormat::Elf { machine } => format!("ELF (machine 0x{:x})", machine),
        SourceFormat::Pe { machine } => format!("PE (machine 0x{:x})", machine),
    }
}

fn format_run_text(report: &RunReport) -> String {
    let mut out = String::new();

    out.push_str("\nShellhost Run Report\n");
    out.push_str("====================\n");
    out.push_str(&format!("Timestamp: {}\n", report.timestamp));
    out.push_str(&format!("Input: {} ({})\n", report.input, describe_format(report.source_format)));
    out.push_str(&format!("Host: {}\n", describe_host(&report.host)));
    out.push_str(&format!("Target: {} {}\n", report.target_os, report.arch));
    out.push_str(&format!("Strategy: {}\n", report.strategy));
    out.push_str(&format!(
        "Image: {} bytes, entry {}\n",
        report.image_len, report.entry_offset
    ));
    out.push_str(&format!("Exit code: {}\n", report.exit_code));
    out.push_str(&format!("Elapsed: {} ms\n", report.elapsed_ms));

    out
}

fn format_plan_text(report: &PlanReport) -> String {
    let mut out = String::new();

    out.push_str("Shellhost Plan\n");
    out.push_str("==============\n");
    out.push_str(&format!("Host: {}\n", describe_host(&report.host)));
    out.push_str(&format!("Loader process: {}\n", report.running_bits));
    out.push_str(&format!("Target: {} {}\n", report.target_os, report.arch));
    out.push_str(&format!("Strategy: {}\n", report.strategy));

    if let Some(image) = &report.image {
        out.push('\n');
        out.push_str(&format!("Input: {} ({})\n", image.path, describe_format(image.format)));
        out.push_str(&format!("Image: {} bytes, entry {}\n", image.len, image.entry_offset));

        if !image.preview.is_empty() {
            out.push_str("\nEntry point:\n");
            for line in &image.preview {
                out.push_str(&format!(
                    "  {:08x}  {:<30} {}\n",
                    line.offset, line.bytes, line.text
                ));
            }
        }
    }

    out
}

fn format_target_text(arch: &ArchitectureDescriptor) -> String {
    let mut out = format!("{}: {} {}", arch.name, arch.family, arch.bits);
    if !arch.aliases.is_empty() {
        out.push_str(&format!(" (aliases: {})", arch.aliases.join(", ")));
    }
    out.push('\n');

    if !arch.emulators.is_empty() {
        out.push_str(&format!("  Emulators: {}\n", arch.emulators.join(", ")));
    }
    for host in &arch.injection_hosts {
        out.push_str(&format!("  Injection host: {}\n", host.display()));
    }

    out
}
