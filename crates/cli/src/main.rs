// reclink CLI - probabilistic record linkage over CSV sources

mod exit_codes;
mod link;

use std::process::ExitCode;

use clap::Parser;
use env_logger::Env;

use exit_codes::{link_exit_code, EXIT_SUCCESS};
use link::LinkCommands;
use reclink_linkage::LinkError;

#[derive(Parser)]
#[command(name = "reclink")]
#[command(about = "Link records across two datasets with an EM-fitted Fellegi-Sunter model")]
#[command(long_version = long_version())]
#[command(version)]
#[command(subcommand_required = false)]
struct Cli {
    #[command(subcommand)]
    command: Option<LinkCommands>,
}

fn long_version() -> &'static str {
    if cfg!(debug_assertions) {
        concat!(
            env!("CARGO_PKG_VERSION"),
            " (", env!("RECLINK_COMMIT"), ")",
            "\nengine:  reclink-linkage ", env!("CARGO_PKG_VERSION"),
            "\nbuild:   debug",
            "\ntarget:  ", env!("RECLINK_TARGET"),
        )
    } else {
        concat!(
            env!("CARGO_PKG_VERSION"),
            " (", env!("RECLINK_COMMIT"), ")",
            "\nengine:  reclink-linkage ", env!("CARGO_PKG_VERSION"),
            "\nbuild:   release",
            "\ntarget:  ", env!("RECLINK_TARGET"),
        )
    }
}

fn main() -> ExitCode {
    // Logs go to stderr; stdout is reserved for JSON.
    env_logger::Builder::from_env(Env::new().filter_or("RECLINK_LOG", "warn")).init();

    let cli = Cli::parse();

    let result = match cli.command {
        None => {
            eprintln!("Usage: reclink <command> [options]");
            eprintln!("       reclink --help for more information");
            Ok(())
        }
        Some(cmd) => link::cmd_link(cmd),
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
    pub fn new(code: u8, msg: impl Into<String>) -> Self {
        Self { code, message: msg.into(), hint: None }
    }

    /// Add a hint to an existing error.
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

impl From<LinkError> for CliError {
    fn from(err: LinkError) -> Self {
        let hint = match &err {
            LinkError::ConfigurationMismatch { .. } => {
                Some("the model was saved under different fields, metrics or levels; refit without --load-model".to_string())
            }
            LinkError::AmbiguousResolution { .. } => {
                Some("switch resolver.mode to \"one_to_one\" to break exact ties by record id".to_string())
            }
            _ => None,
        };
        Self { code: link_exit_code(&err), message: err.to_string(), hint }
    }
}
