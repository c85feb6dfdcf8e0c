//! Forwarder configuration file
//!
//! A YAML file lists the SSH servers to connect to and the tunnels to run
//! through them. Problems with the file as a whole (syntax, server list) are
//! fatal; problems with one tunnel only reject that tunnel.

use portferry_proto::{
    Credentials, Direction, Endpoint, EndpointError, ParseDirectionError, ServerDescriptor,
    TunnelSpec, DEFAULT_SSH_PORT,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = "portferry.yml";

/// Errors that make the whole file unusable
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse YAML config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("SSH server #{index} has an empty name")]
    EmptyServerName { index: usize },

    #[error("Duplicate SSH server name: {0}")]
    DuplicateServer(String),

    #[error("SSH server {server} has an empty host")]
    EmptyHost { server: String },

    #[error("Invalid port '{port}' for SSH server {server}")]
    InvalidPort { server: String, port: String },
}

/// Why a single tunnel entry was rejected
#[derive(Debug, Error)]
pub enum TunnelConfigError {
    #[error("server_name is empty")]
    MissingServer,

    #[error(transparent)]
    Direction(#[from] ParseDirectionError),

    #[error("invalid {field}: {source}")]
    Address {
        field: &'static str,
        #[source]
        source: EndpointError,
    },
}

/// Configuration file format
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ForwarderConfig {
    #[serde(default)]
    pub ssh_servers: Vec<ServerEntry>,

    #[serde(default)]
    pub tunnels: Vec<TunnelEntry>,
}

/// An SSH server definition
#[derive(Clone, Serialize, Deserialize)]
pub struct ServerEntry {
    pub name: String,

    #[serde(default)]
    pub host: String,

    /// Integer or string, 22 when absent
    #[serde(default)]
    pub port: Option<PortValue>,

    #[serde(default)]
    pub user: String,

    /// Supports ${ENV_VAR} expansion
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Supports a leading `~`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_file: Option<String>,

    /// Supports ${ENV_VAR} expansion
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_passphrase: Option<String>,
}

// Passwords stay out of logs
impl fmt::Debug for ServerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerEntry")
            .field("name", &self.name)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("key_file", &self.key_file)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortValue {
    Number(i64),
    Text(String),
}

impl fmt::Display for PortValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortValue::Number(n) => write!(f, "{}", n),
            PortValue::Text(s) => write!(f, "{}", s),
        }
    }
}

/// A tunnel definition
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TunnelEntry {
    #[serde(default)]
    pub server_name: String,

    #[serde(default)]
    pub remote_addr: String,

    #[serde(default)]
    pub local_addr: String,

    /// local | L | remote | R
    #[serde(default)]
    pub mode: String,
}

/// A tunnel entry that failed validation
#[derive(Debug)]
pub struct RejectedTunnel {
    /// Position in the `tunnels` list
    pub index: usize,
    pub entry: TunnelEntry,
    pub error: TunnelConfigError,
}

/// Tunnels to run, split into valid specs and rejected entries
#[derive(Debug, Default)]
pub struct TunnelPlan {
    pub tunnels: Vec<TunnelSpec>,
    pub rejected: Vec<RejectedTunnel>,
}

impl TunnelPlan {
    /// Names of the servers that at least one valid tunnel goes through
    pub fn referenced_servers(&self) -> HashSet<&str> {
        self.tunnels
            .iter()
            .map(|t| t.session_name.as_str())
            .collect()
    }
}

impl ForwarderConfig {
    /// Load config from a specific file path
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        Self::parse(&content)
    }

    /// Parse config from YAML string
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: ForwarderConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Whole-file checks; tunnels are checked by [`plan`](Self::plan)
    fn validate(&self) -> Result<(), ConfigError> {
        let mut names = HashSet::new();
        for (index, server) in self.ssh_servers.iter().enumerate() {
            if server.name.trim().is_empty() {
                return Err(ConfigError::EmptyServerName { index });
            }
            if !names.insert(server.name.as_str()) {
                return Err(ConfigError::DuplicateServer(server.name.clone()));
            }
            if server.host.trim().is_empty() {
                return Err(ConfigError::EmptyHost {
                    server: server.name.clone(),
                });
            }
            server.port()?;
        }
        Ok(())
    }

    /// Resolved server descriptors, with secrets and paths expanded
    pub fn servers(&self) -> Result<Vec<ServerDescriptor>, ConfigError> {
        self.ssh_servers.iter().map(ServerEntry::descriptor).collect()
    }

    /// Split the tunnel list into runnable specs and rejected entries
    ///
    /// Unknown server names are not checked here: a tunnel through a server
    /// whose session could not be established is skipped at dispatch.
    pub fn plan(&self) -> TunnelPlan {
        let mut plan = TunnelPlan::default();
        for (index, entry) in self.tunnels.iter().enumerate() {
            match entry.to_spec() {
                Ok(spec) => plan.tunnels.push(spec),
                Err(error) => plan.rejected.push(RejectedTunnel {
                    index,
                    entry: entry.clone(),
                    error,
                }),
            }
        }
        plan
    }

    /// Generate a template config file content
    pub fn template() -> String {
        r#"# portferry configuration
#
# Every tunnel runs through one of the SSH servers below, referenced by name.

ssh_servers:
  - name: gw
    host: gateway.example.com
    port: 22
    user: deploy
    key_file: ~/.ssh/id_ed25519
    # key_passphrase: "${GW_KEY_PASSPHRASE}"
    # password: "${GW_PASSWORD}"

tunnels:
  # Forward: listen locally, connect to remote_addr from the server
  - server_name: gw
    local_addr: 127.0.0.1:9000
    remote_addr: 10.0.0.5:80
    mode: local

  # Reverse: listen on the server, connect to local_addr from here
  # - server_name: gw
  #   remote_addr: 0.0.0.0:2222
  #   local_addr: 127.0.0.1:22
  #   mode: remote
"#
        .to_string()
    }
}

impl ServerEntry {
    pub fn port(&self) -> Result<u16, ConfigError> {
        let invalid = || ConfigError::InvalidPort {
            server: self.name.clone(),
            port: self.port.as_ref().map(|p| p.to_string()).unwrap_or_default(),
        };

        match &self.port {
            None => Ok(DEFAULT_SSH_PORT),
            Some(PortValue::Number(n)) => match u16::try_from(*n) {
                Ok(port) if port != 0 => Ok(port),
                _ => Err(invalid()),
            },
            Some(PortValue::Text(s)) if s.trim().is_empty() => Ok(DEFAULT_SSH_PORT),
            Some(PortValue::Text(s)) => match s.trim().parse::<u16>() {
                Ok(port) if port != 0 => Ok(port),
                _ => Err(invalid()),
            },
        }
    }

    pub fn descriptor(&self) -> Result<ServerDescriptor, ConfigError> {
        let password = self
            .password
            .as_deref()
            .map(expand_env_vars)
            .filter(|p| !p.is_empty());
        let key_file = self
            .key_file
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(expand_home);
        let key_passphrase = self
            .key_passphrase
            .as_deref()
            .map(expand_env_vars)
            .filter(|p| !p.is_empty());

        Ok(ServerDescriptor {
            name: self.name.clone(),
            host: self.host.trim().to_string(),
            port: self.port()?,
            user: self.user.clone(),
            credentials: Credentials {
                password,
                key_file,
                key_passphrase,
            },
        })
    }
}

impl TunnelEntry {
    pub fn to_spec(&self) -> Result<TunnelSpec, TunnelConfigError> {
        let direction: Direction = self.mode.trim().parse()?;

        let server_name = self.server_name.trim();
        if server_name.is_empty() {
            return Err(TunnelConfigError::MissingServer);
        }

        check_address("remote_addr", &self.remote_addr)?;
        check_address("local_addr", &self.local_addr)?;

        Ok(TunnelSpec::new(
            server_name,
            self.remote_addr.trim(),
            self.local_addr.trim(),
            direction,
        ))
    }
}

fn check_address(field: &'static str, address: &str) -> Result<(), TunnelConfigError> {
    address
        .parse::<Endpoint>()
        .map(|_| ())
        .map_err(|source| TunnelConfigError::Address { field, source })
}

/// Expand environment variables in a string
///
/// Supports `${VAR}` syntax. If the variable is not set, it expands to an
/// empty string.
pub fn expand_env_vars(input: &str) -> String {
    let re = match regex_lite::Regex::new(r"\$\{([^}]+)\}") {
        Ok(re) => re,
        Err(_) => return input.to_string(),
    };

    re.replace_all(input, |caps: &regex_lite::Captures<'_>| {
        std::env::var(&caps[1]).unwrap_or_default()
    })
    .into_owned()
}

/// Expand a leading `~` to the home directory
pub fn expand_home(path: &str) -> PathBuf {
    let rest = if path == "~" {
        Some("")
    } else {
        path.strip_prefix("~/")
    };

    match (rest, dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}
