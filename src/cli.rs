//! Command-line surface and the `listen` entry point.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tracing::{error, info};

use crate::api::ApiClient;
use crate::config::{self, Config};
use crate::error::ListenError;
use crate::forwarder::HttpForwarder;
use crate::logging::{self, OutputFormat};
use crate::session::{SessionManager, Shutdown};
use crate::shutdown::ShutdownCoordinator;
use crate::subscription::{self, Route};

#[derive(Debug, Parser)]
#[command(name = "hookdeck", version, about = "Forward webhook events from the Gateway to local HTTP servers")]
pub struct Cli {
    /// Config file to read instead of the default lookup.
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Only read ./.hookdeck/config.toml.
    #[arg(long, global = true)]
    pub local: bool,

    /// Profile table holding the API key.
    #[arg(long, global = true, value_name = "NAME")]
    pub profile: Option<String>,

    /// API key; overrides the profile and HOOKDECK_API_KEY.
    #[arg(long, global = true, value_name = "KEY")]
    pub api_key: Option<String>,

    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Compact)]
    pub output: OutputFormat,

    /// Log every envelope received and forwarded.
    #[arg(long, short, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Attach to the Gateway and forward events to a local endpoint.
    Listen(ListenArgs),
}

#[derive(Debug, Args)]
pub struct ListenArgs {
    /// Local port (http://localhost:PORT) or full http(s) URL.
    #[arg(value_name = "PORT|URL")]
    pub target: String,

    /// Source names or src_ ids, comma separated.
    #[arg(value_name = "SOURCES")]
    pub sources: String,

    /// Path prefix appended to the local endpoint.
    #[arg(value_name = "PATH")]
    pub path: Option<String>,

    /// Additional source routed elsewhere.
    #[arg(long = "route", value_name = "SOURCE=PORT[/PATH]|SOURCE=URL")]
    pub routes: Vec<String>,

    /// Create sources that do not exist yet.
    #[arg(long)]
    pub create_sources: bool,

    /// Accept invalid TLS certificates from https local endpoints.
    #[arg(long)]
    pub insecure: bool,

    #[arg(long, value_name = "N")]
    pub max_inflight: Option<usize>,

    /// Concurrent forwards per source.
    #[arg(long = "per-source", value_name = "N")]
    pub per_source: Option<usize>,
}

impl ListenArgs {
    pub fn routes(&self) -> Result<Vec<Route>, ListenError> {
        let mut routes = Route::from_positional(&self.target, &self.sources, self.path.as_deref())?;
        for arg in &self.routes {
            routes.push(Route::parse(arg)?);
        }
        Ok(routes)
    }
}

/// Locate, read and validate the configuration for `cli`.
pub fn load_config(cli: &Cli) -> Result<Config, ListenError> {
    let cwd = std::env::current_dir()
        .map_err(|e| ListenError::config(format!("cannot read the current directory: {e}")))?;
    let user_dir = dirs::config_dir();
    let path = config::locate(cli.config.as_deref(), cli.local, &cwd, user_dir.as_deref())?;
    Config::load(path.as_deref())
}

/// Run the parsed command and return the process exit code.
pub async fn run(cli: Cli) -> u8 {
    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            return e.exit_code();
        }
    };
    logging::init(cli.output, &config.log_level, cli.verbose);

    let result = match &cli.command {
        Command::Listen(args) => listen(&cli, config, args).await,
    };
    match result {
        Ok(shutdown) => shutdown.exit_code(),
        Err(e) => {
            error!("{e}");
            e.exit_code()
        }
    }
}

async fn listen(cli: &Cli, mut config: Config, args: &ListenArgs) -> Result<Shutdown, ListenError> {
    if let Some(n) = args.max_inflight {
        config.listen.max_inflight = n;
    }
    if let Some(n) = args.per_source {
        config.listen.per_source_inflight = n;
    }
    config.validate()?;
    let api_key = config.api_key(cli.profile.as_deref(), cli.api_key.as_deref())?;
    let routes = args.routes()?;

    let coordinator = ShutdownCoordinator::new();
    let shutdown = coordinator.token();
    let _signals = coordinator
        .listen_for_signals()
        .map_err(|e| ListenError::Runtime(format!("failed to install signal handlers: {e}")))?;

    let api = ApiClient::new(&config.api_base, &api_key)?;
    let subscriptions = tokio::select! {
        biased;
        () = shutdown.cancelled() => return Ok(Shutdown::Clean),
        resolved = subscription::resolve(&api, &routes, args.create_sources) => resolved?,
    };
    for sub in subscriptions.iter() {
        info!("{} ({}) forwarding to {}", sub.source_name, sub.source_id, sub.local_endpoint);
    }

    let forwarder = HttpForwarder::new(
        config.listen.forward_timeout(),
        config.listen.body_prefix_limit,
        args.insecure,
    )?;
    SessionManager::new(
        &config.ws_url,
        &api_key,
        Arc::new(subscriptions),
        Arc::new(forwarder),
        &config.listen,
        shutdown,
    )
    .run()
    .await
}
