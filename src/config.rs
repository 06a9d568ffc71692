use crate::error::{Error, Result};
use serde::Deserialize;
use std::fs;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub log_level: Option<String>,
    #[serde(default)]
    pub target: TargetConfig,
}

impl Config {
    /// Load configuration from a TOML file. If `path_opt` is None or the file
    /// is missing/unreadable, returns defaults. Parsing errors are returned.
    pub fn load_from_file(path_opt: Option<&str>) -> Result<Self> {
        let path = path_opt.unwrap_or("config.toml");
        match fs::read_to_string(path) {
            Ok(contents) => match toml::from_str::<Config>(&contents) {
                Ok(cfg) => Ok(cfg),
                Err(e) => Err(Error::Msg(format!("Failed to parse {}: {}", path, e))),
            },
            Err(_e) => Ok(Self::default()),
        }
    }

    /// Apply CLI/env overrides (highest precedence) to an existing config.
    #[allow(clippy::too_many_arguments)]
    pub fn with_overrides(
        mut self,
        target_addr: Option<String>,
        username: Option<String>,
        password: Option<String>,
        auth_db: Option<String>,
        log_level: Option<String>,
        tls_enabled: Option<bool>,
        tls_ca_file: Option<String>,
        tls_allow_invalid_certs: Option<bool>,
    ) -> Self {
        if let Some(addr) = target_addr {
            self.target.addr = addr;
        }
        if let Some(user) = username {
            self.target.username = Some(user);
        }
        if let Some(pass) = password {
            self.target.password = Some(pass);
        }
        if let Some(db) = auth_db {
            self.target.auth_db = db;
        }
        if let Some(ll) = log_level {
            self.log_level = Some(ll);
        }
        if let Some(v) = tls_enabled {
            self.target.tls_enabled = v;
        }
        if let Some(v) = tls_ca_file {
            self.target.tls_ca_file = Some(v);
        }
        if let Some(v) = tls_allow_invalid_certs {
            self.target.tls_allow_invalid_certs = v;
        }
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.target.addr.is_empty() {
            return Err(Error::Msg("target.addr cannot be empty".to_string()));
        }
        if !self.target.addr.contains(':') {
            return Err(Error::Msg(format!(
                "target.addr '{}' must be in host:port format",
                self.target.addr
            )));
        }
        if self.target.username.is_some() != self.target.password.is_some() {
            return Err(Error::Msg(
                "target.username and target.password must be set together".to_string(),
            ));
        }

        if self.target.tls_enabled {
            if let Some(ref ca_file) = self.target.tls_ca_file {
                if !std::path::Path::new(ca_file).exists() {
                    return Err(Error::Msg(format!(
                        "target.tls_ca_file '{}' does not exist",
                        ca_file
                    )));
                }
            }
            if let Some(ref cert_file) = self.target.tls_client_cert {
                if !std::path::Path::new(cert_file).exists() {
                    return Err(Error::Msg(format!(
                        "target.tls_client_cert '{}' does not exist",
                        cert_file
                    )));
                }
            }
            if let Some(ref key_file) = self.target.tls_client_key {
                if !std::path::Path::new(key_file).exists() {
                    return Err(Error::Msg(format!(
                        "target.tls_client_key '{}' does not exist",
                        key_file
                    )));
                }
            }
        }

        Ok(())
    }
}

/// Connection settings for the replay target server.
#[derive(Debug, Clone, Deserialize)]
pub struct TargetConfig {
    #[serde(default = "default_target_addr")]
    pub addr: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_auth_db")]
    pub auth_db: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub tls_enabled: bool,
    #[serde(default)]
    pub tls_ca_file: Option<String>,
    #[serde(default)]
    pub tls_client_cert: Option<String>,
    #[serde(default)]
    pub tls_client_key: Option<String>,
    #[serde(default)]
    pub tls_allow_invalid_certs: bool,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            addr: default_target_addr(),
            username: None,
            password: None,
            auth_db: default_auth_db(),
            timeout_ms: default_timeout_ms(),
            tls_enabled: false,
            tls_ca_file: None,
            tls_client_cert: None,
            tls_client_key: None,
            tls_allow_invalid_certs: false,
        }
    }
}

fn default_target_addr() -> String {
    "127.0.0.1:27017".to_string()
}
fn default_auth_db() -> String {
    "admin".to_string()
}
fn default_timeout_ms() -> u64 {
    10_000
}
