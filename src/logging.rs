//! tracing setup. Logs go to stderr so stdout stays free for command output.
//!
//! Filter precedence: `RUST_LOG`, then `--verbose` (debug for this crate),
//! then `log_level` from the config file.

use tracing_subscriber::EnvFilter;

/// Log line format selected with `--output`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// One JSON object per line.
    Json,
    #[default]
    Compact,
    /// Multi-line, human oriented.
    Pretty,
}

/// Filter directives used when `RUST_LOG` is unset.
pub fn default_directives(config_level: &str, verbose: bool) -> String {
    if verbose {
        format!("{}=debug,{config_level}", env!("CARGO_CRATE_NAME"))
    } else {
        config_level.to_string()
    }
}

pub fn init(format: OutputFormat, config_level: &str, verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(config_level, verbose)));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        OutputFormat::Json => builder.json().init(),
        OutputFormat::Compact => builder.compact().init(),
        OutputFormat::Pretty => builder.pretty().init(),
    }
}
