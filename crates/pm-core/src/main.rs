//! Postmortem Scrubber - PII arbitration and redaction for incident records
//!
//! The main entry point for pm-scrub, handling:
//! - Batch runs over precomputed detector output
//! - Policy validation
//! - Effective configuration display

use clap::{Args, Parser, Subcommand};
use pm_core::batch::{BatchRunner, REPORT_SCHEMA_VERSION};
use pm_core::cli::{masked_config, read_batch_input, render_report, write_output, CliError};
use pm_core::config::{load_config, load_policy_from_file, ConfigOptions, ResolvedConfig};
use pm_core::exit_codes::ExitCode;
use pm_core::logging::{fingerprint_for_log, generate_run_id, init_logging, LogConfig, LogFormat};
use pm_redact::{PseudonymRegistry, CANONICALIZATION_VERSION, POLICY_SCHEMA_VERSION};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::filter::LevelFilter;

/// Postmortem Scrubber - arbitrate PII detections and redact incident text
#[derive(Parser)]
#[command(name = "pm-scrub")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    global: GlobalOpts,
}

/// Global options available to all commands
#[derive(Args, Debug)]
struct GlobalOpts {
    /// Override config directory
    #[arg(long, global = true, env = "PM_SCRUB_CONFIG")]
    config: Option<PathBuf>,

    /// Log output format on stderr (human, jsonl)
    #[arg(long, global = true, env = "PM_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Process a batch of incidents and write the report
    Run(RunArgs),

    /// Validate a policy file
    CheckPolicy(CheckPolicyArgs),

    /// Print the effective configuration
    ShowConfig(ShowConfigArgs),

    /// Print version information
    Version,
}

// ============================================================================
// Command argument structs
// ============================================================================

#[derive(Args, Debug)]
struct RunArgs {
    /// Batch input JSON file ("-" for stdin)
    input: PathBuf,

    /// Write the report here instead of stdout
    #[arg(long, short = 'o')]
    output: Option<PathBuf>,

    /// Policy file (overrides the config directory)
    #[arg(long)]
    policy: Option<PathBuf>,

    /// Driver config file (overrides the config directory)
    #[arg(long)]
    config_file: Option<PathBuf>,

    /// Also run the built-in regex detector
    #[arg(long)]
    builtin_detector: bool,

    /// Incidents processed at once
    #[arg(long)]
    max_parallel: Option<usize>,

    /// Default per-detector timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Include canonical original values in the pseudonym mapping
    #[arg(long)]
    include_originals: bool,

    /// Single-line JSON output
    #[arg(long)]
    compact: bool,
}

#[derive(Args, Debug)]
struct CheckPolicyArgs {
    /// Policy file (defaults to the resolved policy)
    policy: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct ShowConfigArgs {
    /// Driver config file (overrides the config directory)
    #[arg(long)]
    config_file: Option<PathBuf>,

    /// Policy file (overrides the config directory)
    #[arg(long)]
    policy: Option<PathBuf>,
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = if e.use_stderr() {
                ExitCode::ArgsError
            } else {
                ExitCode::Clean
            };
            let _ = e.print();
            std::process::exit(code.as_i32());
        }
    };

    let cli_level = if cli.global.quiet {
        Some(LevelFilter::ERROR)
    } else {
        match cli.global.verbose {
            0 => None,
            1 => Some(LevelFilter::DEBUG),
            _ => Some(LevelFilter::TRACE),
        }
    };
    init_logging(&LogConfig::from_env(cli_level, cli.global.log_format));

    let result = match &cli.command {
        Commands::Run(args) => run_batch(&cli.global, args),
        Commands::CheckPolicy(args) => run_check_policy(&cli.global, args),
        Commands::ShowConfig(args) => run_show_config(&cli.global, args),
        Commands::Version => {
            print_version();
            Ok(ExitCode::Clean)
        }
    };

    let exit_code = match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("pm-scrub: {} [{}]", e, e.exit_code());
            e.exit_code()
        }
    };

    std::process::exit(exit_code.as_i32());
}

fn config_options(global: &GlobalOpts, config_file: Option<&PathBuf>, policy: Option<&PathBuf>) -> ConfigOptions {
    ConfigOptions {
        config_dir: global.config.clone(),
        config_path: config_file.cloned(),
        policy_path: policy.cloned(),
    }
}

fn run_batch(global: &GlobalOpts, args: &RunArgs) -> Result<ExitCode, CliError> {
    let resolved = load_config(&config_options(global, args.config_file.as_ref(), args.policy.as_ref()))?;
    let snapshot = resolved.snapshot();
    let ResolvedConfig { mut scrub, policy, .. } = resolved;

    if let Some(n) = args.max_parallel {
        if n == 0 {
            return Err(CliError::Args("--max-parallel must be at least 1".to_string()));
        }
        scrub.batch.max_parallel_incidents = n;
    }
    if let Some(ms) = args.timeout_ms {
        if ms == 0 {
            return Err(CliError::Args("--timeout-ms must be positive".to_string()));
        }
        scrub.detectors.default_timeout_ms = ms;
    }
    if args.builtin_detector {
        scrub.detectors.enable_builtin_patterns = true;
    }
    if args.include_originals {
        scrub.report.include_original_values = true;
    }
    if args.compact {
        scrub.report.pretty = false;
    }

    let input = read_batch_input(&args.input)?;

    let run_id = generate_run_id();
    let key = scrub.pseudonym.run_key()?;
    info!(
        run_id = %run_id,
        key_id = %scrub.pseudonym.key_id,
        key_fingerprint = %fingerprint_for_log(&key.to_base64()),
        ephemeral_key = !scrub.pseudonym.has_secret(),
        "pseudonym key ready"
    );
    let registry = PseudonymRegistry::new(key);

    let pretty = scrub.report.pretty;
    let runner = BatchRunner::new(Arc::new(policy), scrub);
    let mut report = runner.run(&input, &registry, &run_id)?;
    report.config = Some(snapshot);

    write_output(args.output.as_deref(), &render_report(&report, pretty)?)?;
    Ok(report.exit_code())
}

fn run_check_policy(global: &GlobalOpts, args: &CheckPolicyArgs) -> Result<ExitCode, CliError> {
    let (policy, path) = match &args.policy {
        Some(path) => (load_policy_from_file(path)?, Some(path.clone())),
        None => {
            let resolved = load_config(&config_options(global, None, None))?;
            (resolved.policy, resolved.policy_path)
        }
    };

    let mut entity_types: Vec<_> = policy.entity_types().map(|e| e.as_str().to_string()).collect();
    entity_types.sort();
    let response = serde_json::json!({
        "status": "valid",
        "path": path.as_ref().map(|p| p.display().to_string()),
        "using_defaults": path.is_none(),
        "schema_version": policy.config().schema_version,
        "policy_hash": policy.content_hash(),
        "patterns": policy.config().patterns.len(),
        "policies": policy.config().policies.len(),
        "entity_types": entity_types,
        "mandatory_sources": policy.mandatory_sources().collect::<Vec<_>>(),
    });
    let rendered = serde_json::to_string_pretty(&response).map_err(CliError::Serialize)?;
    write_output(None, &rendered)?;
    Ok(ExitCode::Clean)
}

fn run_show_config(global: &GlobalOpts, args: &ShowConfigArgs) -> Result<ExitCode, CliError> {
    let resolved = load_config(&config_options(global, args.config_file.as_ref(), args.policy.as_ref()))?;
    let response = serde_json::json!({
        "config": masked_config(&resolved.scrub),
        "snapshot": resolved.snapshot(),
    });
    let rendered = serde_json::to_string_pretty(&response).map_err(CliError::Serialize)?;
    write_output(None, &rendered)?;
    Ok(ExitCode::Clean)
}

fn print_version() {
    let version_info = serde_json::json!({
        "pm_scrub_version": env!("CARGO_PKG_VERSION"),
        "report_schema_version": REPORT_SCHEMA_VERSION,
        "policy_schema_version": POLICY_SCHEMA_VERSION,
        "canonicalization_version": CANONICALIZATION_VERSION,
    });
    match serde_json::to_string_pretty(&version_info) {
        Ok(s) => println!("{}", s),
        Err(_) => println!("pm-scrub {}", env!("CARGO_PKG_VERSION")),
    }
}
