// lbridge - run Lua scripts inside a lunabridge session

mod exit_codes;
mod render;

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use lunabridge::{Error, FromValue, Session, SessionConfig, SessionRef, Value};

use exit_codes::{bridge_exit_code, EXIT_IO, EXIT_SUCCESS, EXIT_USAGE};

#[derive(Parser)]
#[command(name = "lbridge")]
#[command(about = "Run Lua scripts against a host bridge session")]
#[command(long_version = long_version())]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a script and print what it returns
    #[command(after_help = "\
Scripts see a `host` table with `host.add(a, b)` and `host.print(...)`, and
their arguments as `...` and in the global `arg` table.

Examples:
  lbridge run report.lua
  lbridge run report.lua --json -- 2024 Q3
  lbridge run untrusted.lua --sandbox --memory-limit 8388608 --time-limit-ms 500")]
    Run {
        /// Path to the Lua script
        script: PathBuf,

        #[command(flatten)]
        session: SessionArgs,

        /// Print results as a JSON document
        #[arg(long)]
        json: bool,

        /// Arguments passed to the script as strings
        #[arg(last = true)]
        args: Vec<String>,
    },

    /// Compile a script without running it
    Check {
        /// Path to the Lua script
        script: PathBuf,

        /// Allow precompiled chunks
        #[arg(long)]
        binary: bool,
    },
}

#[derive(Args)]
struct SessionArgs {
    /// Session config file (TOML)
    #[arg(long, env = "LBRIDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Engine heap cap in bytes
    #[arg(long, value_name = "BYTES")]
    memory_limit: Option<usize>,

    /// Wall-clock cap per call in milliseconds
    #[arg(long, value_name = "MS")]
    time_limit_ms: Option<u64>,

    /// Executed instruction cap per call
    #[arg(long, value_name = "N")]
    instruction_limit: Option<u64>,

    /// Strip os, io, debug, package and loaders from the globals
    #[arg(long)]
    sandbox: bool,
}

fn long_version() -> &'static str {
    concat!(
        env!("CARGO_PKG_VERSION"),
        " (", env!("GIT_COMMIT_HASH"), ")",
        "\nengine:  Lua 5.4",
        "\ntarget:  ", env!("TARGET"),
    )
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run { script, session, json, args } => cmd_run(script, session, json, args),
        Commands::Check { script, binary } => cmd_check(script, binary),
    };

    match result {
        Ok(()) => ExitCode::from(EXIT_SUCCESS),
        Err(CliError { code, message, hint }) => {
            if !message.is_empty() {
                eprintln!("error: {}", message);
            }
            if let Some(hint) = hint {
                eprintln!("hint:  {}", hint);
            }
            ExitCode::from(code)
        }
    }
}

#[derive(Debug)]
pub struct CliError {
    pub code: u8,
    pub message: String,
    pub hint: Option<String>,
}

impl CliError {
    pub fn args(msg: impl Into<String>) -> Self {
        Self { code: EXIT_USAGE, message: msg.into(), hint: None }
    }

    pub fn io(msg: impl Into<String>) -> Self {
        Self { code: EXIT_IO, message: msg.into(), hint: None }
    }

    /// Create error from a bridge error with the matching exit code.
    pub fn bridge(err: Error) -> Self {
        let code = bridge_exit_code(&err);
        let hint = match &err {
            Error::LimitExceeded(_) => Some("raise --time-limit-ms or --instruction-limit".to_string()),
            Error::OutOfMemory(_) => Some("raise --memory-limit".to_string()),
            _ => None,
        };
        let mut message = err.to_string();
        if let Some(traceback) = err.fault().and_then(|fault| fault.traceback.as_deref()) {
            message.push('\n');
            message.push_str(traceback);
        }
        Self { code, message, hint }
    }
}

// ============================================================================
// run
// ============================================================================

fn cmd_run(script: PathBuf, args: SessionArgs, json: bool, script_args: Vec<String>) -> Result<(), CliError> {
    let mut config = session_config(&args)?;
    if config.name.is_none() {
        config.name = Some(script.display().to_string());
    }
    let session = Session::open(config).map_err(CliError::bridge)?;
    install_host(&session).map_err(CliError::bridge)?;
    set_arg_table(&session, &script, &script_args).map_err(CliError::bridge)?;

    let chunk = session.load_file(&script).map_err(|err| match err {
        Error::Io(msg) => CliError::io(msg),
        other => CliError::bridge(other),
    })?;
    let call_args: Vec<Value> = script_args.iter().map(|a| Value::String(a.as_str().into())).collect();
    let results = chunk.call_values(call_args).map_err(CliError::bridge)?;
    log::debug!(
        "{} returned {} value(s), peak {} bytes",
        script.display(),
        results.len(),
        session.memory_peak()
    );

    let stdout = io::stdout();
    let mut out = stdout.lock();
    if json {
        let doc = serde_json::json!({
            "results": results.iter().map(render::to_json).collect::<Vec<_>>(),
            "memory_peak": session.memory_peak(),
        });
        writeln!(out, "{}", doc).map_err(|e| CliError::io(e.to_string()))?;
    } else {
        for value in &results {
            writeln!(out, "{}", render::plain(value)).map_err(|e| CliError::io(e.to_string()))?;
        }
    }
    Ok(())
}

/// Config file first, then flag overrides.
fn session_config(args: &SessionArgs) -> Result<SessionConfig, CliError> {
    let mut config = match &args.config {
        Some(path) => SessionConfig::load(path).map_err(|err| match err {
            Error::Io(msg) => CliError::io(msg),
            other => CliError::args(other.to_string()),
        })?,
        None => SessionConfig::default(),
    };
    if let Some(limit) = args.memory_limit {
        config.memory_limit = Some(limit);
    }
    if let Some(ms) = args.time_limit_ms {
        config.time_limit_ms = Some(ms);
    }
    if let Some(n) = args.instruction_limit {
        config.instruction_limit = Some(n);
    }
    if args.sandbox {
        config.sandbox = true;
    }
    config.validate().map_err(|err| CliError::args(err.to_string()))?;
    Ok(config)
}

/// Host callables scripts can reach through the `host` global.
fn install_host(session: &SessionRef) -> lunabridge::Result<()> {
    let host = session.create_table()?;

    let add = session.create_function(|_, (a, b): (Value, Value)| {
        if let (Some(x), Some(y)) = (a.as_integer(), b.as_integer()) {
            if let Some(sum) = x.checked_add(y) {
                return Ok(Value::Integer(sum));
            }
        }
        Ok(Value::Number(f64::from_value(a)? + f64::from_value(b)?))
    })?;
    host.set("add", add)?;

    let print = session.create_function(|_, values: Vec<Value>| {
        let line = values.iter().map(render::plain).collect::<Vec<_>>().join("\t");
        let stdout = io::stdout();
        let mut out = stdout.lock();
        writeln!(out, "{}", line).map_err(|e| Error::host(format!("host.print: {}", e)))?;
        Ok(())
    })?;
    host.set("print", print)?;

    session.globals()?.set("host", host)
}

fn set_arg_table(session: &SessionRef, script: &Path, args: &[String]) -> lunabridge::Result<()> {
    let table = session.create_table()?;
    table.raw_set(0, script.display().to_string())?;
    for (i, arg) in args.iter().enumerate() {
        table.raw_set(i as i64 + 1, arg.as_str())?;
    }
    session.globals()?.set("arg", table)
}

// ============================================================================
// check
// ============================================================================

fn cmd_check(script: PathBuf, binary: bool) -> Result<(), CliError> {
    let config = SessionConfig {
        name: Some(format!("check:{}", script.display())),
        open_libs: false,
        binary_chunks: binary,
        ..SessionConfig::default()
    };
    let session = Session::open(config).map_err(CliError::bridge)?;
    session.load_file(&script).map_err(|err| match err {
        Error::Io(msg) => CliError::io(msg),
        other => CliError::bridge(other),
    })?;
    println!("ok: {}", script.display());
    Ok(())
}
