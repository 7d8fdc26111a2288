/*!
 # Lightspeed MQTT LED Middleware

 Bridges a keyboard or desk LED behind a vendor lighting application to an
 MQTT broker. The light can be owned by this program ("pilot") or handed back
 to the vendor application ("logi"), and short timed overrides (alert, warning,
 info) can take it over with a looping color pattern.

 ## Features

 * Pilot/logi ownership switch with resynchronisation on hand-over
 * Power, RGB color and brightness commands with caching while overridden
 * Alert, warning and info overrides with replace semantics and expiry timers
 * Retained status, health and availability topics
 * Home Assistant device discovery
 * TOML configuration with `${VAR}` substitution

 ## Example

 ```rust,no_run
 use std::sync::Arc;
 use lightspeed_mqtt::*;

 #[tokio::main]
 async fn main() -> lightspeed_mqtt::Result<()> {
     tracing_subscriber::fmt::init();

     let profile = Arc::new(load_config("config.toml")?);
     let device = LightingController::new(
         SimulatedBackend::new(),
         ControllerOptions {
             lock_file: Some(profile.lighting.lock_file.clone()),
             ..Default::default()
         },
     );

     // Runs until Ctrl-C
     serve(profile, device).await
 }
 ```
*/

use thiserror::Error;

/// Error type shared by the whole crate
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed command payload
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    /// Unknown override kind or duration out of bounds
    #[error("Invalid override: {0}")]
    InvalidOverride(String),

    /// A device capability call failed
    #[error("Device failure: {0}")]
    DeviceFailure(String),

    /// Configuration could not be read or validated
    #[error("Configuration error: {0}")]
    Config(String),

    /// Broker communication error
    #[error("MQTT error: {0}")]
    Mqtt(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Other errors
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

pub type Result<T> = std::result::Result<T, Error>;

pub mod color;
pub mod command;
pub mod config;
pub mod control;
pub mod device;
pub mod discovery;
pub mod dispatcher;
pub mod echo;
pub mod effects;
pub mod message;
pub mod mqtt;
pub mod observability;
pub mod scheduler;
pub mod service;

// Re-export key types
pub use color::{apply_brightness, parse_color_string, Rgb};
pub use config::{load_config, Profile, CONFIG_PATH_ENV, DEFAULT_CONFIG_FILENAME};
pub use control::{ControlState, Mode, OverrideKind};
pub use device::{ControllerOptions, LightDevice, LightingController, SimulatedBackend};
pub use dispatcher::Dispatcher;
pub use effects::{Palette, PatternFrame};
pub use service::serve;
