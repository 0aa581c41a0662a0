use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("configuration file not found at {}", path.display())]
    FileNotFound { path: PathBuf },

    #[error("invalid TOML at line {line}, column {column}: {message}")]
    InvalidToml {
        line: usize,
        column: usize,
        message: String,
    },

    #[error("missing required fields: {fields:?}")]
    MissingRequiredFields { fields: Vec<String> },

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("I/O error reading configuration: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub xmpp: XmppConfig,
    #[serde(default)]
    pub settings: SettingsConfig,
    #[serde(default)]
    pub messages: MessagesConfig,
    /// Remote identifier -> ordered aliases.
    #[serde(default)]
    pub contacts: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub event_bus: EventBusConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct XmppConfig {
    pub server: String,
    pub port: Option<u16>,
    pub username: String,
    pub password: String,
    #[serde(default = "default_resource")]
    pub resource: String,
    #[serde(default)]
    pub status: String,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SettingsConfig {
    /// Deliver to offline recipients instead of rejecting the send.
    #[serde(default)]
    pub notify_offline: bool,
    /// Remove roster entries that are not in the contact directory.
    #[serde(default)]
    pub manage_buddy_list: bool,
}

/// Templates substituted with a display name (`%s`) and used verbatim.
#[derive(Debug, Clone, Deserialize)]
pub struct MessagesConfig {
    #[serde(default = "default_send_from")]
    pub send_from: String,
    #[serde(default = "default_send_to")]
    pub send_to: String,
    #[serde(default = "default_bot_response")]
    pub bot_response: String,
}

impl Default for MessagesConfig {
    fn default() -> Self {
        Self {
            send_from: default_send_from(),
            send_to: default_send_to(),
            bot_response: default_bot_response(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventBusConfig {
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
        }
    }
}

#[derive(Debug, Default, Clone)]
struct ConfigOverrides {
    server: Option<String>,
    username: Option<String>,
    password: Option<String>,
    log_level: Option<String>,
}

fn default_resource() -> String {
    "xmppchat".to_string()
}

fn default_timeout_seconds() -> u32 {
    30
}

fn default_send_from() -> String {
    "%s hat dir eine Nachricht gesendet: ".to_string()
}

fn default_send_to() -> String {
    "(An %s) ".to_string()
}

fn default_bot_response() -> String {
    "I cannot do anything. I'm a bot, remember? It's not like I could become crazy and kill \
     eyerbody. Not that I wouldn't like to..."
        .to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_channel_capacity() -> usize {
    1024
}

const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Return the resolved platform-appropriate configuration file path.
pub fn config_path() -> PathBuf {
    if let Some(proj_dirs) = directories::ProjectDirs::from("de", "minehattan", "xmppchat") {
        proj_dirs.config_dir().join("config.toml")
    } else {
        PathBuf::from("config.toml")
    }
}

/// Load configuration from the platform config path, merging environment
/// variable overrides.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(config_path())
}

pub fn load_config_from(path: PathBuf) -> Result<Config, ConfigError> {
    load_config_from_with_overrides(path, config_overrides_from_env())
}

pub fn load_config_from_str(toml_str: &str) -> Result<Config, ConfigError> {
    load_config_from_str_with_overrides(toml_str, config_overrides_from_env())
}

fn load_config_from_with_overrides(
    path: PathBuf,
    overrides: ConfigOverrides,
) -> Result<Config, ConfigError> {
    debug!(path = %path.display(), "loading configuration");
    let contents = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ConfigError::FileNotFound { path });
        }
        Err(e) => return Err(ConfigError::Io(e)),
    };

    load_config_from_str_with_overrides(&contents, overrides)
}

fn load_config_from_str_with_overrides(
    toml_str: &str,
    overrides: ConfigOverrides,
) -> Result<Config, ConfigError> {
    let mut config: Config = toml::from_str(toml_str).map_err(|e| {
        let (line, column) = e.span().map_or((0, 0), |span| {
            let before = &toml_str[..span.start];
            let line = before.chars().filter(|&c| c == '\n').count() + 1;
            let column = before
                .rfind('\n')
                .map_or(span.start + 1, |nl| span.start - nl);
            (line, column)
        });
        ConfigError::InvalidToml {
            line,
            column,
            message: e.message().to_string(),
        }
    })?;

    apply_overrides(&mut config, overrides);
    validate(&config)?;

    Ok(config)
}

fn config_overrides_from_env() -> ConfigOverrides {
    ConfigOverrides {
        server: std::env::var("XMPPCHAT_SERVER").ok(),
        username: std::env::var("XMPPCHAT_USERNAME").ok(),
        password: std::env::var("XMPPCHAT_PASSWORD").ok(),
        log_level: std::env::var("XMPPCHAT_LOG_LEVEL").ok(),
    }
}

fn apply_overrides(config: &mut Config, overrides: ConfigOverrides) {
    if overrides.server.is_some() || overrides.username.is_some() || overrides.password.is_some() {
        debug!("applying XMPP account overrides from environment");
    }
    if let Some(server) = overrides.server {
        config.xmpp.server = server;
    }
    if let Some(username) = overrides.username {
        config.xmpp.username = username;
    }
    if let Some(password) = overrides.password {
        config.xmpp.password = password;
    }
    if let Some(level) = overrides.log_level {
        config.logging.level = level;
    }
}

fn validate(config: &Config) -> Result<(), ConfigError> {
    let missing: Vec<String> = [
        ("xmpp.server", &config.xmpp.server),
        ("xmpp.username", &config.xmpp.username),
        ("xmpp.password", &config.xmpp.password),
    ]
    .into_iter()
    .filter(|(_, value)| value.is_empty())
    .map(|(field, _)| field.to_string())
    .collect();

    if !missing.is_empty() {
        return Err(ConfigError::MissingRequiredFields { fields: missing });
    }

    if !VALID_LOG_LEVELS.contains(&config.logging.level.as_str()) {
        return Err(ConfigError::InvalidValue {
            field: "logging.level".to_string(),
            message: format!("must be one of: {}", VALID_LOG_LEVELS.join(", ")),
        });
    }

    if let Some((id, _)) = config
        .contacts
        .iter()
        .find(|(_, aliases)| aliases.is_empty())
    {
        return Err(ConfigError::InvalidValue {
            field: format!("contacts.{id}"),
            message: "at least one alias is required".to_string(),
        });
    }

    Ok(())
}
