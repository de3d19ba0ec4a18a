//! Command-line interface for coachsh
//!
//! Provides argument parsing using clap derive macros.

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;
use std::time::Duration;

/// Practice clinical consultations with a simulated patient
#[derive(Parser, Debug)]
#[command(
    name = "coachsh",
    version,
    about = "Practice clinical consultations with a simulated patient"
)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Path to configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Verbose logging (-v: debug, -vv: trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Parse a reply timeout. Bare numbers are seconds; otherwise any
/// `humantime` duration (`90s`, `2m`, `1m30s`).
fn parse_timeout(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    humantime::parse_duration(s).map_err(|e| e.to_string())
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run an interactive scenario session
    Play {
        /// Scenario to play
        scenario_id: String,

        /// User (student) id the session is recorded under
        #[arg(long, short = 'u', value_name = "ID", env = "COACHSH_USER")]
        user: String,

        /// Audio input device (e.g., hw:0)
        #[arg(long, value_name = "DEVICE")]
        device: Option<String>,

        /// Give up if the patient has not replied within this long (default: wait)
        #[arg(long, value_name = "DURATION", value_parser = parse_timeout)]
        reply_timeout: Option<Duration>,
    },

    /// List available audio input devices
    Devices,

    /// Show configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: Shell,
    },
}

/// Configuration actions
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Print the effective configuration (file + environment) as TOML
    Show,
    /// Print the configuration file path
    Path,
}
