//! flowtap - inspect, filter and summarize recorded proxy flows

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, CommandFactory, Parser, Subcommand};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use flowtap::app::Config;
use flowtap::filter::{All, FlowFilter, HasResponse, MethodIs, UrlMatches};
use flowtap::playback::fingerprint;
use flowtap::{session, Flow, FlowMaster, FlowtapError, State};

/// Flow dump toolkit
#[derive(Parser, Debug)]
#[command(name = "flowtap")]
#[command(author, version, about = "Inspect and filter recorded proxy flows", long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "FLOWTAP_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn", env = "FLOWTAP_LOG_LEVEL")]
    log_level: String,

    /// Log file path (enables file logging)
    #[arg(long, env = "FLOWTAP_LOG_FILE")]
    log_file: Option<String>,

    /// Enable JSON structured logging
    #[arg(long, env = "FLOWTAP_LOG_JSON")]
    log_json: bool,

    /// Generate default configuration and exit
    #[arg(long)]
    generate_config: bool,

    /// Validate configuration, load its playback dumps and exit
    #[arg(long)]
    validate_config: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print one line per flow
    List {
        /// Dump file to read
        dump: PathBuf,

        #[command(flatten)]
        filter: FilterArgs,
    },

    /// Append the flows passing the filter to another dump
    Filter {
        /// Dump file to read
        input: PathBuf,

        /// Dump file to append to
        output: PathBuf,

        #[command(flatten)]
        filter: FilterArgs,
    },

    /// Summarize a dump
    Stats {
        /// Dump file to read
        dump: PathBuf,
    },
}

#[derive(Args, Debug, Default)]
struct FilterArgs {
    /// Keep flows whose URL matches this regex
    #[arg(long)]
    url: Option<String>,

    /// Keep flows that have a response
    #[arg(long)]
    with_response: bool,

    /// Keep flows with this request method
    #[arg(long)]
    method: Option<String>,
}

impl FilterArgs {
    /// Combine the flags into one view limit. No flags means no limit.
    fn build(&self) -> Result<Option<Arc<dyn FlowFilter>>> {
        let mut parts: Vec<Box<dyn FlowFilter>> = Vec::new();
        if let Some(pattern) = &self.url {
            let url = UrlMatches::new(pattern)
                .with_context(|| format!("Invalid --url pattern '{}'", pattern))?;
            parts.push(Box::new(url));
        }
        if self.with_response {
            parts.push(Box::new(HasResponse));
        }
        if let Some(method) = &self.method {
            parts.push(Box::new(MethodIs(method.clone())));
        }

        if parts.is_empty() {
            Ok(None)
        } else {
            Ok(Some(Arc::new(All(parts))))
        }
    }
}

fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        match e.downcast_ref::<FlowtapError>() {
            Some(inner) => eprintln!("Error: {}\n  {}", e, inner.user_message()),
            None => eprintln!("Error: {:#}", e),
        }
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    if cli.generate_config {
        return generate_default_config();
    }

    init_logging(&cli)?;

    let config = Config::load(cli.config.as_deref())
        .map_err(FlowtapError::from)
        .context("Failed to load configuration")?;

    if cli.validate_config {
        return validate_config(&config);
    }

    match cli.command {
        Some(Command::List { dump, filter }) => list(&dump, &filter),
        Some(Command::Filter {
            input,
            output,
            filter,
        }) => filter_dump(&input, &output, &filter),
        Some(Command::Stats { dump }) => stats(&dump),
        None => {
            Cli::command().print_help()?;
            Ok(())
        }
    }
}

/// Initialize the logging system
fn init_logging(cli: &Cli) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let subscriber = tracing_subscriber::registry().with(env_filter);

    if let Some(log_path) = &cli.log_file {
        // File-based logging with rotation
        let file_appender = if log_path.contains('/') || log_path.contains('\\') {
            let path = Path::new(log_path);
            let dir = path.parent().unwrap_or(Path::new("."));
            let filename = path
                .file_name()
                .and_then(|s| s.to_str())
                .unwrap_or("flowtap.log");
            RollingFileAppender::new(Rotation::DAILY, dir, filename)
        } else {
            let log_dir = Config::data_dir()
                .map(|d| d.join("logs"))
                .unwrap_or_else(|| PathBuf::from("."));
            std::fs::create_dir_all(&log_dir)
                .with_context(|| format!("Failed to create log directory {:?}", log_dir))?;
            RollingFileAppender::new(Rotation::DAILY, log_dir, log_path)
        };

        if cli.log_json {
            let file_layer = fmt::layer()
                .json()
                .with_writer(file_appender)
                .with_ansi(false);
            subscriber.with(file_layer).init();
        } else {
            let file_layer = fmt::layer().with_writer(file_appender).with_ansi(false);
            subscriber.with(file_layer).init();
        }
    } else if cli.log_json {
        // stdout carries command output
        subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        subscriber
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }

    Ok(())
}

/// Generate default configuration file
fn generate_default_config() -> Result<()> {
    let toml = Config::default()
        .to_toml()
        .context("Failed to serialize configuration")?;
    println!("{}", toml);
    Ok(())
}

fn validate_config(config: &Config) -> Result<()> {
    let master = FlowMaster::from_config(config).context("Configuration is not usable")?;
    println!("Configuration is valid");
    println!("  intercept rules:  {}", master.intercept_manager().rules().count());
    println!("  recorded replies: {}", master.playback_remaining());
    Ok(())
}

fn load_dump(path: &Path) -> Result<Vec<Flow>> {
    session::read_flows(path)
        .map_err(FlowtapError::from)
        .with_context(|| format!("Failed to read {}", path.display()))
}

/// Load a dump into a fresh state with the view limited by `filter`
fn filtered_state(path: &Path, filter: &FilterArgs) -> Result<State> {
    let limit = filter.build()?;
    let mut state = State::new();
    state.load_flows(load_dump(path)?);
    state.set_limit(limit);
    Ok(state)
}

fn list(path: &Path, filter: &FilterArgs) -> Result<()> {
    let state = filtered_state(path, filter)?;
    for flow in state.view() {
        println!("{}", flow.summary());
    }
    tracing::info!(shown = state.view_len(), total = state.len(), "Listed flows");
    Ok(())
}

fn filter_dump(input: &Path, output: &Path, filter: &FilterArgs) -> Result<()> {
    let state = filtered_state(input, filter)?;
    let snapshot = state.view_snapshot();
    let written = session::append_flows(output, &snapshot)
        .map_err(FlowtapError::from)
        .with_context(|| format!("Failed to write {}", output.display()))?;
    println!(
        "Wrote {} of {} flows to {}",
        written,
        state.len(),
        output.display()
    );
    Ok(())
}

fn stats(path: &Path) -> Result<()> {
    let flows = load_dump(path)?;
    let responses = flows.iter().filter(|f| f.response().is_some()).count();
    let errors = flows.iter().filter(|f| f.error().is_some()).count();
    let replayed = flows
        .iter()
        .filter(|f| f.request.is_replay || f.response().is_some_and(|r| r.is_replay))
        .count();
    let fingerprints: HashSet<_> = flows.iter().map(|f| fingerprint(&f.request)).collect();

    println!("flows:        {}", flows.len());
    println!("responses:    {}", responses);
    println!("errors:       {}", errors);
    println!("pending:      {}", flows.len() - responses - errors);
    println!("replayed:     {}", replayed);
    println!("fingerprints: {}", fingerprints.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_subcommands() {
        let cli = Cli::try_parse_from([
            "flowtap",
            "list",
            "flows.dump",
            "--url",
            "example",
            "--with-response",
        ])
        .unwrap();
        match cli.command {
            Some(Command::List { dump, filter }) => {
                assert_eq!(dump, PathBuf::from("flows.dump"));
                assert_eq!(filter.url.as_deref(), Some("example"));
                assert!(filter.with_response);
                assert!(filter.method.is_none());
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_filter_args_build() {
        assert!(FilterArgs::default().build().unwrap().is_none());

        let bad = FilterArgs {
            url: Some("(".to_string()),
            ..Default::default()
        };
        assert!(bad.build().is_err());

        let method = FilterArgs {
            method: Some("POST".to_string()),
            ..Default::default()
        };
        assert!(method.build().unwrap().is_some());
    }
}
