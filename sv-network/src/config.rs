use anyhow::{Context as _, Result};
use serde::Deserialize;
use std::fs;

/// Behavior knobs for the network supervisor. Loaded from a TOML file
/// with environment-variable overrides; persistence of anything else
/// (servers, wallets) is the embedding application's business.
#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct NetworkOptions {
    /// Maintain a single connection instead of the usual ten.
    pub oneserver: bool,
    /// Follow the best server automatically when the main one lags.
    pub auto_connect: bool,
    /// Initial main server as "host:port:protocol"; a random SSL server
    /// is elected when unset.
    pub main_server: Option<String>,
    /// SOCKS proxy as "kind:host:port:user:pass".
    pub proxy: Option<String>,
}

impl Default for NetworkOptions {
    fn default() -> Self {
        NetworkOptions {
            oneserver: false,
            auto_connect: true,
            main_server: None,
            proxy: None,
        }
    }
}

fn get_env_var(var: &str) -> Option<String> {
    std::env::var(var).ok()
}

impl NetworkOptions {
    /// Parses the options file and applies environment overrides.
    ///
    /// # Errors
    /// * the file does not exist
    /// * the file is not valid TOML
    pub fn load(file: &str) -> Result<Self> {
        let raw = fs::read_to_string(file).context("Failed to read config file")?;
        let options: NetworkOptions =
            toml::from_str(&raw).context("Failed to parse config file")?;
        Ok(options.with_env_overrides())
    }

    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(value) = get_env_var("SV_ONESERVER") {
            self.oneserver = parse_bool(&value).unwrap_or(self.oneserver);
        }
        if let Some(value) = get_env_var("SV_AUTO_CONNECT") {
            self.auto_connect = parse_bool(&value).unwrap_or(self.auto_connect);
        }
        self.main_server = get_env_var("SV_MAIN_SERVER").or(self.main_server);
        self.proxy = get_env_var("SV_PROXY").or(self.proxy);
        self
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
