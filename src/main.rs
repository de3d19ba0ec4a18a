use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use coachsh::app::run_play_command;
use coachsh::audio::capture::list_devices;
use coachsh::cli::{Cli, Commands, ConfigAction};
use coachsh::config::Config;
use coachsh::defaults;
use owo_colors::OwoColorize;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Play {
            scenario_id,
            user,
            device,
            reply_timeout,
        } => {
            let config = load_config(cli.config.as_deref())?;
            if let Err(e) =
                run_play_command(config, scenario_id, user, device, reply_timeout).await
            {
                eprintln!("{}", format!("Error: {}", e).red());
                std::process::exit(1);
            }
        }
        Commands::Devices => {
            list_audio_devices()?;
        }
        Commands::Config { action } => {
            handle_config_command(action, cli.config.as_deref())?;
        }
        Commands::Completions { shell } => {
            clap_complete::generate(
                shell,
                &mut Cli::command(),
                "coachsh",
                &mut std::io::stdout(),
            );
        }
    }

    Ok(())
}

/// Log to stderr. `COACHSH_LOG` wins over `-v`/`-vv`.
fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "coachsh=debug,warn",
        _ => "coachsh=trace,debug",
    };
    let filter = EnvFilter::try_from_env(defaults::LOG_ENV).unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Load configuration from file or use defaults.
///
/// Priority order:
/// 1. Custom config path from CLI (--config)
/// 2. Default config path (~/.config/coachsh/config.toml)
/// 3. Built-in defaults
///
/// Environment variable overrides apply on top of all three.
fn load_config(custom_path: Option<&std::path::Path>) -> Result<Config> {
    let config = if let Some(path) = custom_path {
        Config::load(path).with_context(|| format!("Failed to load config from {}", path.display()))?
    } else {
        Config::load_or_default(&Config::default_path())?
    };

    Ok(config.with_env_overrides())
}

/// List available audio input devices.
fn list_audio_devices() -> Result<()> {
    let devices = list_devices()?;

    if devices.is_empty() {
        eprintln!("No audio input devices found");
        std::process::exit(1);
    }

    println!("Available audio input devices:");
    for (idx, device) in devices.iter().enumerate() {
        println!("  [{}] {}", idx, device);
    }

    Ok(())
}

/// Handle configuration commands.
fn handle_config_command(
    action: ConfigAction,
    custom_path: Option<&std::path::Path>,
) -> Result<()> {
    match action {
        ConfigAction::Path => {
            let path = custom_path
                .map(std::path::PathBuf::from)
                .unwrap_or_else(Config::default_path);
            println!("{}", path.display());
            if !path.exists() {
                eprintln!("{}", "(file does not exist; built-in defaults apply)".dimmed());
            }
        }
        ConfigAction::Show => {
            let mut config = load_config(custom_path)?;
            if config.server.token.is_some() {
                config.server.token = Some("<redacted>".to_string());
            }
            print!("{}", toml::to_string_pretty(&config)?);
            if let Err(e) = config.validate() {
                eprintln!("{}", format!("Warning: {}", e).yellow());
            }
        }
    }
    Ok(())
}
