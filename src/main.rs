use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, WrapErr};
use lightspeed_mqtt::*;
use tokio::time::Duration;
use tracing::{debug, error, info, instrument, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, global = true, env = CONFIG_PATH_ENV, default_value = DEFAULT_CONFIG_FILENAME)]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the MQTT bridge (default)
    Serve,
    /// Check the configuration file and exit
    ValidateConfig,
    /// Show a static color
    Color {
        /// #RRGGBB, R,G,B or "R G B"
        value: String,
        /// Seconds to hold the color (0 = until Ctrl-C)
        #[arg(short, long, default_value_t = 0.0)]
        duration: f64,
    },
    /// Play the alert pattern
    Alert {
        /// Seconds to play (0 = until Ctrl-C)
        #[arg(short, long, default_value_t = 0.0)]
        duration: f64,
    },
    /// Play the warning pattern
    Warning {
        /// Seconds to play (0 = until Ctrl-C)
        #[arg(short, long, default_value_t = 0.0)]
        duration: f64,
    },
    /// Play the info pattern
    Info {
        /// Seconds to play (0 = until Ctrl-C)
        #[arg(short, long, default_value_t = 0.0)]
        duration: f64,
    },
    /// Hand control back to the vendor application at once
    Auto,
}

fn init_tracing(level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("RUST_LOG")
                .unwrap_or_else(|_| EnvFilter::new(format!("lightspeed_mqtt={level},lightspeed={level}"))),
        )
        .compact()
        .init();
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    color_eyre::install()?;

    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Serve);

    if let Commands::ValidateConfig = command {
        init_tracing("warn");
        return Ok(validate_config(&cli.config));
    }

    let profile = load_config(&cli.config)
        .wrap_err_with(|| format!("loading {}", cli.config.display()))?;
    init_tracing(&profile.observability.log_level);
    debug!("Loaded configuration from {}", cli.config.display());

    let device = LightingController::new(
        SimulatedBackend::new(),
        ControllerOptions {
            lock_file: Some(profile.lighting.lock_file.clone()),
            min_write_interval: Duration::from_millis(profile.lighting.min_write_interval_ms),
        },
    );

    match command {
        Commands::Serve | Commands::ValidateConfig => {
            serve(Arc::new(profile), device).await?;
        }
        Commands::Color { value, duration } => {
            let color = parse_color_string(&value)?;
            info!(%color, "Showing static color");
            device.set_static_color(color).await?;
            hold(duration).await;
            device.shutdown().await?;
        }
        Commands::Alert { duration } => play(&profile, &device, OverrideKind::Alert, duration).await?,
        Commands::Warning { duration } => play(&profile, &device, OverrideKind::Warning, duration).await?,
        Commands::Info { duration } => play(&profile, &device, OverrideKind::Info, duration).await?,
        Commands::Auto => {
            device.start().await?;
            device.release().await?;
            info!("Control handed back to the vendor application");
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn validate_config(path: &Path) -> ExitCode {
    match load_config(path) {
        Ok(profile) => {
            println!(
                "Configuration {} is valid (schema {})",
                path.display(),
                profile.schema_revision()
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{}", e);
            eprintln!("Configuration {} is invalid: {e}", path.display());
            ExitCode::FAILURE
        }
    }
}

/// Plays one override pattern directly on the device
#[instrument(skip(profile, device))]
async fn play<D: LightDevice>(
    profile: &Profile,
    device: &D,
    kind: OverrideKind,
    duration: f64,
) -> Result<()> {
    let frames = profile.palettes.get(kind).frames();
    info!("Playing {} pattern ({} frames)", kind, frames.len());
    device.start_pattern(frames).await?;
    hold(duration).await;
    device.stop_pattern().await?;
    device.shutdown().await?;
    Ok(())
}

/// Waits `seconds`, or until Ctrl-C when zero or not a usable duration
async fn hold(seconds: f64) {
    match Duration::try_from_secs_f64(seconds) {
        Ok(wait) if !wait.is_zero() => {
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = tokio::signal::ctrl_c() => info!("Interrupted"),
            }
        }
        _ => {
            info!("Press Ctrl-C to stop");
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Cannot listen for Ctrl-C: {}", e);
            }
        }
    }
}
