//! foxbridge_config
//!
//! Layered configuration: defaults, an optional `config/default` file, and
//! environment variables (highest precedence). Values absent from every
//! source fall back to `Settings::default()`.

pub mod settings;

use config::{Config, ConfigError, Environment, File};

use crate::settings::PartialSettings;

pub use settings::{ServerSettings, Settings, TlsSettings};

pub fn load_config() -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(Environment::default().separator("_"));

    let config = builder.build()?;
    let partial: PartialSettings = config.try_deserialize()?;
    Ok(Settings::from_partial(partial))
}
