use clap::{Parser, Subcommand};
use oxidereplay::analyze;
use oxidereplay::config::Config;
use oxidereplay::filter::{self, FilterPredicate};
use oxidereplay::recording::RecordingSet;
use oxidereplay::replay::{self, ReplayMode, ReplayOptions, ReplayReport};
use oxidereplay::script::{self, ScriptOptions};
use std::io::{BufWriter, Write};
use tokio::sync::watch;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env first so clap's env fallbacks see variables
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Attempt to load config before initializing logs to pick up log_level from file
    let cfg_file_res = Config::load_from_file(cli.config.as_deref());
    let cfg_file = match &cfg_file_res {
        Ok(c) => c.clone(),
        Err(_) => Config::default(),
    };

    // Determine log filter precedence: CLI (--log-level / OXIDEREPLAY_LOG_LEVEL)
    // > RUST_LOG (env) > config.toml log_level > default("info")
    let filter_spec = if let Some(ref lvl) = cli.log_level {
        lvl.clone()
    } else if let Ok(env_spec) = std::env::var("RUST_LOG") {
        env_spec
    } else if let Some(ref lvl) = cfg_file.log_level {
        lvl.clone()
    } else {
        "info".to_string()
    };

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter_spec))
        .compact()
        .init();

    if let Err(e) = cfg_file_res.as_ref() {
        tracing::warn!(error = %format!("{e:?}"), "invalid config; using defaults");
    }

    let ok = match cli.command {
        Command::Play(args) => run_play(args, cfg_file, false).await?,
        Command::Validate(args) => run_play(args, cfg_file, true).await?,
        Command::Filter(args) => run_filter(args)?,
        Command::Analyze(args) => run_analyze(args)?,
        Command::ScriptGen(args) => run_script_gen(args)?,
    };

    if !ok {
        std::process::exit(1);
    }
    Ok(())
}

#[derive(Debug, Parser)]
#[command(
    name = "oxidereplay",
    version,
    about = "Replay recorded MongoDB wire traffic against a live server"
)]
struct Cli {
    /// Path to config TOML file
    #[arg(short = 'c', long = "config", env = "OXIDEREPLAY_CONFIG", global = true)]
    config: Option<String>,

    /// Log level or filter spec (e.g., info or info,oxidereplay=debug)
    #[arg(long = "log-level", env = "OXIDEREPLAY_LOG_LEVEL", global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Replay a recording against a target server
    Play(PlayArgs),
    /// Raw-mode replay that reads one response per request and checks it
    Validate(PlayArgs),
    /// Rewrite a recording into a smaller equivalent one
    Filter(FilterArgs),
    /// Print aggregate statistics about a recording
    Analyze(AnalyzeArgs),
    /// Translate recorded commands into an executable mongosh script
    ScriptGen(ScriptGenArgs),
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum ModeArg {
    Raw,
    Command,
}

#[derive(Debug, clap::Args)]
struct PlayArgs {
    /// Directory holding the recording's .bin files
    #[arg(long = "recording-dir", env = "OXIDEREPLAY_RECORDING_DIR")]
    recording_dir: String,

    /// Target server address (host:port)
    #[arg(long = "target", env = "OXIDEREPLAY_TARGET")]
    target: Option<String>,

    /// Replay strategy: captured bytes verbatim, or re-issued commands
    #[arg(long = "mode", value_enum, default_value = "raw")]
    mode: ModeArg,

    /// Speed multiplier for inter-packet gaps; 0 replays fast-forward
    #[arg(long = "speed", default_value_t = 1.0)]
    speed: f64,

    /// Send only requests (responses in the capture are skipped)
    #[arg(long = "requests-only")]
    requests_only: bool,

    /// Send only user operations (context-free command-name test)
    #[arg(long = "user-ops")]
    user_ops: bool,

    /// Send only likely user operations (command + database + collection)
    #[arg(long = "user-ops-smart")]
    user_ops_smart: bool,

    /// Decode and classify but do not connect or send
    #[arg(long = "dry-run")]
    dry_run: bool,

    /// Stop after this many send attempts
    #[arg(long = "limit")]
    limit: Option<u64>,

    /// Command mode: per-operation timeout in milliseconds
    #[arg(long = "op-timeout-ms")]
    op_timeout_ms: Option<u64>,

    /// Username for SCRAM-SHA-256 authentication
    #[arg(long = "username", env = "OXIDEREPLAY_USERNAME")]
    username: Option<String>,

    /// Password for SCRAM-SHA-256 authentication
    #[arg(long = "password", env = "OXIDEREPLAY_PASSWORD")]
    password: Option<String>,

    /// Authentication database
    #[arg(long = "auth-db", env = "OXIDEREPLAY_AUTH_DB")]
    auth_db: Option<String>,

    /// Connect with TLS
    #[arg(long = "tls")]
    tls: bool,

    /// CA bundle for target TLS verification
    #[arg(long = "tls-ca-file", env = "OXIDEREPLAY_TLS_CA_FILE")]
    tls_ca_file: Option<String>,

    /// Skip TLS certificate validation (insecure, development only)
    #[arg(long = "tls-allow-invalid-certs")]
    tls_allow_invalid_certs: bool,
}

async fn run_play(args: PlayArgs, cfg: Config, validate: bool) -> anyhow::Result<bool> {
    let cfg = cfg.with_overrides(
        args.target,
        args.username,
        args.password,
        args.auth_db,
        None,
        args.tls.then_some(true),
        args.tls_ca_file,
        args.tls_allow_invalid_certs.then_some(true),
    );
    cfg.validate()?;

    let opts = ReplayOptions {
        mode: if validate {
            ReplayMode::Raw
        } else {
            match args.mode {
                ModeArg::Raw => ReplayMode::Raw,
                ModeArg::Command => ReplayMode::Command,
            }
        },
        speed: args.speed,
        requests_only: args.requests_only,
        user_ops_only: args.user_ops,
        user_ops_smart: args.user_ops_smart,
        dry_run: args.dry_run,
        limit: args.limit,
        validate_responses: validate,
        op_timeout_ms: args.op_timeout_ms,
    };
    if opts.speed < 0.0 {
        anyhow::bail!("--speed must be >= 0");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received; finishing in-flight send and draining");
            let _ = shutdown_tx.send(true);
        }
    });

    let packets = RecordingSet::open(&args.recording_dir)?;
    tracing::info!(
        recording_dir = %args.recording_dir,
        target = %cfg.target.addr,
        dry_run = opts.dry_run,
        "starting replay"
    );
    let report = replay::run(packets, &opts, &cfg.target, shutdown_rx).await?;
    print_report(&report);
    Ok(report.all_succeeded())
}

fn print_report(report: &ReplayReport) {
    println!(
        "attempted {} | succeeded {} | failed {} | skipped {} | {:.3}s{}",
        report.attempted,
        report.succeeded,
        report.failed,
        report.skipped,
        report.elapsed.as_secs_f64(),
        if report.cancelled { " | CANCELLED" } else { "" },
    );
    for failure in report.failures.iter().take(20) {
        println!(
            "  failed: order={} session={} command={} error={}",
            failure.order,
            failure.session_id,
            failure.command.as_deref().unwrap_or("-"),
            failure.error.as_deref().unwrap_or("-"),
        );
    }
    if report.failures.len() > 20 {
        println!("  ... and {} more failures", report.failures.len() - 20);
    }
}

#[derive(Debug, clap::Args)]
struct FilterArgs {
    /// Directory holding the recording's .bin files
    #[arg(long = "recording-dir", env = "OXIDEREPLAY_RECORDING_DIR")]
    recording_dir: String,

    /// Destination .bin file for surviving packets
    #[arg(long = "output", short = 'o')]
    output: String,

    /// Keep only requests (empty-message session markers survive)
    #[arg(long = "requests-only")]
    requests_only: bool,

    /// Keep only user operations (context-free command-name test)
    #[arg(long = "user-ops")]
    user_ops: bool,

    /// Keep only likely user operations (command + database + collection)
    #[arg(long = "user-ops-smart")]
    user_ops_smart: bool,

    /// Drop operations from the internal command set
    #[arg(long = "exclude-internal")]
    exclude_internal: bool,

    /// Keep only these commands (comma separated)
    #[arg(long = "include-commands", value_delimiter = ',')]
    include_commands: Vec<String>,

    /// Drop these commands (comma separated)
    #[arg(long = "exclude-commands", value_delimiter = ',')]
    exclude_commands: Vec<String>,

    /// Drop packets recorded before this offset (microseconds)
    #[arg(long = "min-offset-us", default_value_t = 0)]
    min_offset_us: u64,

    /// Drop packets recorded after this offset (microseconds)
    #[arg(long = "max-offset-us", default_value_t = 0)]
    max_offset_us: u64,
}

fn run_filter(args: FilterArgs) -> anyhow::Result<bool> {
    let predicate = FilterPredicate {
        requests_only: args.requests_only,
        user_ops_only: args.user_ops,
        user_ops_smart: args.user_ops_smart,
        exclude_internal: args.exclude_internal,
        include_commands: args.include_commands.into_iter().collect(),
        exclude_commands: args.exclude_commands.into_iter().collect(),
        min_offset_us: args.min_offset_us,
        max_offset_us: args.max_offset_us,
    };
    let packets = RecordingSet::open(&args.recording_dir)?;
    let mut out = BufWriter::new(std::fs::File::create(&args.output)?);
    let stats = filter::run(packets, &mut out, &predicate)?;
    println!(
        "read {} | kept {} | dropped {} (response {}, internal {}, command-filter {}, time-range {}, empty-message {})",
        stats.read,
        stats.kept,
        stats.dropped(),
        stats.dropped_response,
        stats.dropped_internal,
        stats.dropped_command_filter,
        stats.dropped_time_range,
        stats.dropped_empty_message,
    );
    Ok(true)
}

#[derive(Debug, clap::Args)]
struct AnalyzeArgs {
    /// Directory holding the recording's .bin files
    #[arg(long = "recording-dir", env = "OXIDEREPLAY_RECORDING_DIR")]
    recording_dir: String,

    /// Emit the report as JSON instead of text
    #[arg(long = "json")]
    json: bool,
}

fn run_analyze(args: AnalyzeArgs) -> anyhow::Result<bool> {
    let packets = RecordingSet::open(&args.recording_dir)?;
    let report = analyze::analyze(packets)?;
    let mut stdout = std::io::stdout().lock();
    if args.json {
        report.render_json(&mut stdout)?;
    } else {
        report.render_text(&mut stdout)?;
    }
    Ok(true)
}

#[derive(Debug, clap::Args)]
struct ScriptGenArgs {
    /// Directory holding the recording's .bin files
    #[arg(long = "recording-dir", env = "OXIDEREPLAY_RECORDING_DIR")]
    recording_dir: String,

    /// Output script path; stdout when omitted
    #[arg(long = "output", short = 'o')]
    output: Option<String>,

    /// Emit only data-path statements (CRUD and reads)
    #[arg(long = "crud-only")]
    crud_only: bool,

    /// Drop responses instead of annotating them
    #[arg(long = "requests-only")]
    requests_only: bool,
}

fn run_script_gen(args: ScriptGenArgs) -> anyhow::Result<bool> {
    let opts = ScriptOptions {
        crud_only: args.crud_only,
        requests_only: args.requests_only,
    };
    let packets = RecordingSet::open(&args.recording_dir)?;
    let mut out: BufWriter<Box<dyn Write>> = match &args.output {
        Some(path) => BufWriter::new(Box::new(std::fs::File::create(path)?)),
        None => BufWriter::new(Box::new(std::io::stdout().lock())),
    };
    let stats = script::generate(packets, &mut out, &opts)?;
    drop(out);
    if let Some(path) = &args.output {
        tracing::info!(path = %path, statements = stats.statements, "script written");
    }
    Ok(true)
}
