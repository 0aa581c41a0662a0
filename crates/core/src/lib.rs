pub mod config;
pub mod error;
pub mod event;
pub mod logging;
pub mod text;

pub use config::{Config, ConfigError};
pub use error::EventBusError;
pub use text::{Template, strip_markup};
