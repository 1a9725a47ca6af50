//! # Upstream Guard CLI
//!
//! Command-line interface for the Upstream Guard resilience layer.
//!
//! This module provides CLI commands for:
//! - Configuration validation and display
//! - Simulating protected calls against a scripted upstream
//! - Inspecting per-caller quota usage in the shared counter store
//! - Shell completion generation

use clap::{CommandFactory, Parser, Subcommand};
use serde::Serialize;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use upstream_guard_core::{
    CacheStatsSnapshot, CallerId, CounterStore, CounterStoreError, GuardConfig, GuardError,
    InMemoryCounterStore, NormalizedParams, Payload, PlanTier, ProtectedCall, ServiceName,
    ServiceStatus, ServiceUsage, Timestamp, UpstreamError, UsageAnalytics,
};

// ============================================================================
// CLI Structure
// ============================================================================

/// Upstream Guard CLI - resilience and caching for third-party APIs
#[derive(Parser)]
#[command(name = "upstream-guard")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Circuit breaking, retry, rate limiting and caching for upstream APIs")]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "UPSTREAM_GUARD_CONFIG")]
    pub config: Option<PathBuf>,

    /// Logging level (ignored when RUST_LOG is set)
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    /// Enable JSON logging
    #[arg(long)]
    pub json_logs: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Validate configuration
    Config {
        /// Configuration file to validate (overrides --config)
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Show resolved configuration
        #[arg(short, long)]
        show: bool,

        /// Output format for configuration
        #[arg(short = 'f', long, default_value = "yaml")]
        format: ConfigFormat,
    },

    /// Run a burst of protected calls against a simulated upstream
    Simulate {
        /// Upstream service name
        #[arg(short, long, default_value = "weather")]
        service: String,

        /// Caller identity
        #[arg(short, long, default_value = "demo-user")]
        user: String,

        /// Plan tier (FREE or PRO; anything else is treated as FREE)
        #[arg(short, long, default_value = "FREE")]
        plan: String,

        /// Number of calls to make
        #[arg(short = 'n', long, default_value = "12")]
        requests: u32,

        /// Number of initial upstream fetches that fail
        #[arg(long, default_value = "0")]
        fail_first: u32,

        /// HTTP status returned by failing fetches
        #[arg(long, default_value = "503")]
        fail_status: u16,

        /// Request parameter as name=value (repeatable)
        #[arg(long = "param", value_name = "NAME=VALUE")]
        params: Vec<String>,

        /// Give every call distinct parameters so none is served from cache
        #[arg(long)]
        unique: bool,

        /// Output format
        #[arg(short = 'f', long, default_value = "text")]
        format: OutputFormat,
    },

    /// Show quota usage and analytics for a caller
    Usage {
        /// Caller identity
        #[arg(short, long)]
        user: String,

        /// Plan tier (FREE or PRO; anything else is treated as FREE)
        #[arg(short, long, default_value = "FREE")]
        plan: String,

        /// Services to report (defaults to weather, news and crypto)
        #[arg(short, long = "service")]
        services: Vec<String>,

        /// Output format
        #[arg(short = 'f', long, default_value = "text")]
        format: OutputFormat,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

/// Output format options
#[derive(Clone, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text
    Text,
    /// JSON output
    Json,
    /// YAML output
    Yaml,
}

/// Configuration format options
#[derive(Clone, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum ConfigFormat {
    /// YAML format
    Yaml,
    /// JSON format
    Json,
    /// TOML format
    Toml,
}

// ============================================================================
// CLI Error Types
// ============================================================================

/// CLI-specific errors
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("Invalid argument: {arg} - {message}")]
    InvalidArgument { arg: String, message: String },

    #[error("Counter store error: {0}")]
    Store(#[from] CounterStoreError),

    #[error("Output error: {message}")]
    Output { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Logging initialization failed: {message}")]
    Logging { message: String },
}

/// Configuration-related errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(#[from] GuardError),

    #[error("Counter store URL configured but this build has no Redis support")]
    RedisUnsupported,
}

impl CliError {
    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Configuration(_) => 1,
            Self::InvalidArgument { .. } => 2,
            Self::Store(_) => 3,
            Self::Output { .. } => 4,
            Self::Io(_) => 5,
            Self::Logging { .. } => 6,
        }
    }
}

fn invalid_argument(arg: &str, message: impl std::fmt::Display) -> CliError {
    CliError::InvalidArgument {
        arg: arg.to_string(),
        message: message.to_string(),
    }
}

// ============================================================================
// Main Entry Point
// ============================================================================

/// Main CLI entry point
pub async fn run_cli() -> Result<(), CliError> {
    let cli = Cli::parse();

    initialize_logging(&cli)?;

    let mut stdout = std::io::stdout();
    run_command(cli, &mut stdout).await
}

/// Execute a parsed command, writing results to `out`.
pub async fn run_command(cli: Cli, out: &mut dyn Write) -> Result<(), CliError> {
    match cli.command {
        Commands::Config { file, show, format } => {
            let path = file.or(cli.config);
            execute_config_command(path.as_deref(), show, format, out)
        }
        Commands::Simulate {
            service,
            user,
            plan,
            requests,
            fail_first,
            fail_status,
            params,
            unique,
            format,
        } => {
            let config = load_configuration(cli.config.as_deref())?;
            let options = SimulationOptions {
                service: ServiceName::new(service).map_err(|e| invalid_argument("service", e))?,
                caller: CallerId::new(user).map_err(|e| invalid_argument("user", e))?,
                plan: PlanTier::parse(&plan),
                requests,
                fail_first,
                fail_status,
                params: parse_params(&params)?,
                unique,
            };
            let store = build_store(&config).await?;
            let report = run_simulation(store, config, options).await?;
            render(&report, &format, out)
        }
        Commands::Usage {
            user,
            plan,
            services,
            format,
        } => {
            let config = load_configuration(cli.config.as_deref())?;
            let caller = CallerId::new(user).map_err(|e| invalid_argument("user", e))?;
            let services = if services.is_empty() {
                ServiceName::well_known()
            } else {
                services
                    .into_iter()
                    .map(|s| ServiceName::new(s).map_err(|e| invalid_argument("service", e)))
                    .collect::<Result<Vec<_>, _>>()?
            };
            if config.counter_store_url.is_none() {
                warn!(
                    "No counter_store_url configured, usage is read from an empty in-process store"
                );
            }
            let store = build_store(&config).await?;
            let report =
                collect_usage(store, config, &caller, PlanTier::parse(&plan), &services).await?;
            render(&report, &format, out)
        }
        Commands::Completions { shell } => {
            info!(shell = ?shell, "Generating shell completions");
            let mut command = Cli::command();
            clap_complete::generate(shell, &mut command, "upstream-guard", out);
            Ok(())
        }
    }
}

/// Initialize logging based on CLI arguments.
///
/// Logs go to stderr so command output on stdout stays machine-readable.
fn initialize_logging(cli: &Cli) -> Result<(), CliError> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .map_err(|e| CliError::Logging {
            message: e.to_string(),
        })?;

    let registry = tracing_subscriber::registry().with(filter);
    let result = if cli.json_logs {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init()
    };

    result.map_err(|e| CliError::Logging {
        message: e.to_string(),
    })
}

// ============================================================================
// Configuration
// ============================================================================

/// Load configuration from the standard locations.
///
/// Sources, later overriding earlier:
/// 1. `/etc/upstream-guard/config.{yaml,toml,json}`
/// 2. `./config/upstream-guard.{yaml,toml,json}`
/// 3. `explicit_path`, which must exist
/// 4. Environment variables prefixed `UG__`, e.g. `UG__RATE_LIMIT__FREE_LIMIT=20`
///
/// Every field has a default, so no file at all yields a valid configuration.
pub fn load_configuration(explicit_path: Option<&Path>) -> Result<GuardConfig, ConfigError> {
    let mut builder = config::Config::builder()
        .add_source(config::File::with_name("/etc/upstream-guard/config").required(false))
        .add_source(config::File::with_name("config/upstream-guard").required(false));

    if let Some(path) = explicit_path {
        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        info!(path = %path.display(), "Loading configuration from explicit path");
        builder = builder.add_source(config::File::from(path).required(true));
    }

    let config: GuardConfig = builder
        .add_source(
            config::Environment::with_prefix("UG")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize()?;

    config.validate()?;
    debug!("Configuration loaded and validated");

    Ok(config)
}

fn execute_config_command(
    path: Option<&Path>,
    show: bool,
    format: ConfigFormat,
    out: &mut dyn Write,
) -> Result<(), CliError> {
    let config = load_configuration(path)?;

    if show {
        let rendered = match format {
            ConfigFormat::Yaml => serde_yaml::to_string(&config).map_err(output_error)?,
            ConfigFormat::Json => serde_json::to_string_pretty(&config).map_err(output_error)?,
            ConfigFormat::Toml => toml::to_string_pretty(&config).map_err(output_error)?,
        };
        writeln!(out, "{}", rendered.trim_end())?;
    } else {
        writeln!(out, "Configuration is valid")?;
    }

    Ok(())
}

/// Counter store selected by configuration.
async fn build_store(config: &GuardConfig) -> Result<Arc<dyn CounterStore>, CliError> {
    match &config.counter_store_url {
        None => {
            debug!("Using in-memory counter store");
            Ok(Arc::new(InMemoryCounterStore::new()))
        }
        #[cfg(feature = "redis")]
        Some(url) => {
            let store = upstream_guard_core::adapters::RedisCounterStore::connect(url).await?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "redis"))]
        Some(_) => Err(ConfigError::RedisUnsupported.into()),
    }
}

/// Parse `name=value` pairs.
pub fn parse_params(raw: &[String]) -> Result<NormalizedParams, CliError> {
    raw.iter()
        .map(|pair| match pair.split_once('=') {
            Some((name, value)) if !name.is_empty() => Ok((name.to_string(), value.to_string())),
            _ => Err(invalid_argument(
                "param",
                format!("'{}' is not of the form name=value", pair),
            )),
        })
        .collect()
}

// ============================================================================
// Simulation
// ============================================================================

/// Inputs for a simulated burst of calls.
#[derive(Debug, Clone)]
pub struct SimulationOptions {
    pub service: ServiceName,
    pub caller: CallerId,
    pub plan: PlanTier,
    pub requests: u32,
    pub fail_first: u32,
    pub fail_status: u16,
    pub params: NormalizedParams,
    pub unique: bool,
}

/// Result of one simulated call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestRecord {
    pub request: u32,
    pub outcome: String,
    pub cached: bool,
    pub used: Option<u64>,
    pub limit: Option<u64>,
    pub retry_after_seconds: Option<u64>,
    pub message: Option<String>,
}

/// Everything a simulation observed.
#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub service: ServiceName,
    pub upstream_fetches: u32,
    pub records: Vec<RequestRecord>,
    pub status: ServiceStatus,
    pub cache: CacheStatsSnapshot,
}

/// Upstream that fails a fixed number of times, then answers.
struct SimulatedUpstream {
    service: ServiceName,
    fail_first: u32,
    fail_status: u16,
    fetches: AtomicU32,
}

impl SimulatedUpstream {
    async fn fetch(&self, params: &NormalizedParams) -> Result<Payload, UpstreamError> {
        let fetch = self.fetches.fetch_add(1, Ordering::SeqCst) + 1;
        if fetch <= self.fail_first {
            return Err(UpstreamError::status(
                self.fail_status,
                format!("simulated failure {} of {}", fetch, self.fail_first),
            ));
        }

        Ok(serde_json::json!({
            "service": self.service.as_str(),
            "params": params,
            "fetch": fetch,
            "fetched_at": Timestamp::now(),
        }))
    }
}

/// Drive `options.requests` protected calls and collect what happened.
pub async fn run_simulation(
    store: Arc<dyn CounterStore>,
    config: GuardConfig,
    options: SimulationOptions,
) -> Result<SimulationReport, CliError> {
    let guard = ProtectedCall::new(store, config).map_err(ConfigError::from)?;
    let upstream = SimulatedUpstream {
        service: options.service.clone(),
        fail_first: options.fail_first,
        fail_status: options.fail_status,
        fetches: AtomicU32::new(0),
    };

    info!(
        service = %options.service,
        caller = %options.caller,
        plan = %options.plan,
        requests = options.requests,
        "Starting simulation"
    );

    let mut records = Vec::with_capacity(options.requests as usize);
    for request in 1..=options.requests {
        let params = if options.unique {
            options.params.clone().with("request", request.to_string())
        } else {
            options.params.clone()
        };

        let result = guard
            .call(&options.service, &params, &options.caller, options.plan, || {
                upstream.fetch(&params)
            })
            .await;

        let record = match result {
            Ok(outcome) => RequestRecord {
                request,
                outcome: if outcome.cached { "cached" } else { "fetched" }.to_string(),
                cached: outcome.cached,
                used: outcome.rate_limit.as_ref().map(|a| a.used),
                limit: outcome.rate_limit.as_ref().map(|a| a.limit),
                retry_after_seconds: None,
                message: None,
            },
            Err(e) => RequestRecord {
                request,
                outcome: kind_label(&e),
                cached: false,
                used: e.rate_limit().map(|(used, _)| used),
                limit: e.rate_limit().map(|(_, limit)| limit),
                retry_after_seconds: e.retry_after_seconds(),
                message: Some(e.to_string()),
            },
        };
        records.push(record);
    }

    Ok(SimulationReport {
        service: options.service.clone(),
        upstream_fetches: upstream.fetches.load(Ordering::SeqCst),
        records,
        status: guard.service_status(&options.service),
        cache: guard.cache().stats(),
    })
}

fn kind_label(error: &upstream_guard_core::ProtectedCallError) -> String {
    serde_json::to_value(error.kind())
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| format!("{:?}", error.kind()))
}

// ============================================================================
// Usage
// ============================================================================

/// Quota usage and analytics for one caller.
#[derive(Debug, Clone, Serialize)]
pub struct UsageReport {
    pub caller: CallerId,
    pub plan: PlanTier,
    pub services: Vec<ServiceUsage>,
    pub analytics: HashMap<String, UsageAnalytics>,
    /// False when counts come from a store private to this process
    pub shared_store: bool,
}

/// Read usage for `caller` across `services`.
pub async fn collect_usage(
    store: Arc<dyn CounterStore>,
    config: GuardConfig,
    caller: &CallerId,
    plan: PlanTier,
    services: &[ServiceName],
) -> Result<UsageReport, CliError> {
    let shared_store = config.counter_store_url.is_some();
    let guard = ProtectedCall::new(store, config).map_err(ConfigError::from)?;
    let limiter = guard.rate_limiter();

    let summary = limiter.usage_summary(caller, plan, services).await;

    let mut analytics = HashMap::new();
    for service in services {
        if let Some(record) = limiter.analytics(service, caller).await? {
            analytics.insert(service.to_string(), record);
        }
    }

    Ok(UsageReport {
        caller: caller.clone(),
        plan,
        services: summary,
        analytics,
        shared_store,
    })
}

// ============================================================================
// Output
// ============================================================================

/// Text rendering for reports.
trait TextReport {
    fn write_text(&self, out: &mut dyn Write) -> std::io::Result<()>;
}

impl TextReport for SimulationReport {
    fn write_text(&self, out: &mut dyn Write) -> std::io::Result<()> {
        for record in &self.records {
            write!(out, "#{:<4} {:<18}", record.request, record.outcome)?;
            if let (Some(used), Some(limit)) = (record.used, record.limit) {
                write!(out, " quota {}/{}", used, limit)?;
            }
            if let Some(seconds) = record.retry_after_seconds {
                write!(out, " retry after {}s", seconds)?;
            }
            if let Some(message) = &record.message {
                write!(out, " ({})", message)?;
            }
            writeln!(out)?;
        }

        writeln!(out)?;
        writeln!(out, "Upstream fetches: {}", self.upstream_fetches)?;
        writeln!(
            out,
            "Circuit {}: {:?} ({} ok, {} failed, {} rejected)",
            self.service,
            self.status.state,
            self.status.metrics.successful_requests,
            self.status.metrics.failed_requests,
            self.status.metrics.rejected_requests
        )?;
        writeln!(
            out,
            "Cache: {} hits, {} misses, hit rate {:.0}%",
            self.cache.hits,
            self.cache.misses,
            self.cache.hit_rate() * 100.0
        )
    }
}

impl TextReport for UsageReport {
    fn write_text(&self, out: &mut dyn Write) -> std::io::Result<()> {
        writeln!(out, "Caller {} on the {} plan", self.caller, self.plan)?;
        for usage in &self.services {
            write!(
                out,
                "  {:<10} {:>4}/{:<4} remaining {:<4} {:?}",
                usage.service, usage.current, usage.limit, usage.remaining, usage.status
            )?;
            if let Some(analytics) = self.analytics.get(&usage.service) {
                write!(out, "  total {}", analytics.total_requests)?;
            }
            writeln!(out)?;
        }
        if !self.shared_store {
            writeln!(
                out,
                "Note: no counter_store_url configured; counts only cover this process"
            )?;
        }
        Ok(())
    }
}

fn output_error(e: impl std::fmt::Display) -> CliError {
    CliError::Output {
        message: e.to_string(),
    }
}

fn render<R: Serialize + TextReport>(
    report: &R,
    format: &OutputFormat,
    out: &mut dyn Write,
) -> Result<(), CliError> {
    match format {
        OutputFormat::Text => report.write_text(out)?,
        OutputFormat::Json => {
            let rendered = serde_json::to_string_pretty(report).map_err(output_error)?;
            writeln!(out, "{}", rendered)?;
        }
        OutputFormat::Yaml => {
            let rendered = serde_yaml::to_string(report).map_err(output_error)?;
            write!(out, "{}", rendered)?;
        }
    }
    Ok(())
}

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
