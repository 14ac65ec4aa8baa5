//! Configuration file for the stunprobe binary.

use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use stunprobe_core::DEFAULT_PORT;

/// stunprobe configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Client run mode
    #[serde(default)]
    pub client: ClientConfig,
    /// Server run mode
    #[serde(default)]
    pub server: ServerConfig,
    /// TLS material for the shared-secret service
    #[serde(default)]
    pub tls: TlsConfig,
    /// DNS server discovery
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// STUN server host, or the domain when DNS discovery is on
    #[serde(default = "default_stun_server")]
    pub server: String,
    /// STUN server port
    #[serde(default = "default_stun_port")]
    pub port: u16,
    /// Shared-secret service port on the server host
    #[serde(default = "default_port")]
    pub tls_port: u16,
    /// Local address probes are sent from
    #[serde(default = "default_local_bind")]
    pub local_bind: String,
    /// Sign probes with the shared secret
    #[serde(default)]
    pub sign_requests: bool,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the services bind to
    #[serde(default = "default_service_address")]
    pub address: String,
    /// Port for both the binding responder (UDP) and shared-secret service (TCP)
    #[serde(default = "default_port")]
    pub port: u16,
    /// Alternate responder IP address
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alternate_address: Option<String>,
    /// Alternate responder port
    #[serde(default)]
    pub alternate_port: u16,
    /// STUN server (host:port) used to learn our own public address
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_address_server: Option<String>,
    /// Remote shared-secret server (host:port) that verifies integrity
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_secret_server: Option<String>,
}

/// TLS configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TlsConfig {
    /// Server certificate chain (PEM)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cert: Option<PathBuf>,
    /// Server private key (PEM)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<PathBuf>,
    /// Trusted roots for outgoing TLS (PEM)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca: Option<PathBuf>,
    /// Name the peer certificate must carry; defaults to the host name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
}

/// Discovery configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DiscoveryConfig {
    /// DNS server for SRV lookups; discovery is off when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns_server: Option<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values

fn default_stun_server() -> String {
    "stun.l.google.com".to_string()
}

fn default_stun_port() -> u16 {
    19302
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_local_bind() -> String {
    "0.0.0.0:0".to_string()
}

fn default_service_address() -> String {
    "0.0.0.0".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: default_stun_server(),
            port: default_stun_port(),
            tls_port: default_port(),
            local_bind: default_local_bind(),
            sign_requests: false,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: default_service_address(),
            port: default_port(),
            alternate_address: None,
            alternate_port: 0,
            public_address_server: None,
            remote_secret_server: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, contents)?;
        Ok(())
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("stunprobe/config.toml")
    }

    /// Load config from default path, or create default if it doesn't exist
    ///
    /// # Errors
    ///
    /// Returns an error if reading or creating the config fails.
    pub fn load_or_default() -> anyhow::Result<Self> {
        let path = Self::default_path();

        if path.exists() {
            Self::load(&path)
        } else {
            let config = Self::default();
            config.save(&path)?;
            Ok(config)
        }
    }

    /// Parse the client's local bind address
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be parsed.
    pub fn local_bind(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.client.local_bind.parse()?)
    }

    /// Parse the service bind address
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be parsed.
    pub fn service_addr(&self) -> anyhow::Result<SocketAddr> {
        let ip: IpAddr = self.server.address.parse()?;
        Ok(SocketAddr::new(ip, self.server.port))
    }

    /// Alternate responder endpoint, if one is configured
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be parsed.
    pub fn alternate_endpoint(&self) -> anyhow::Result<Option<SocketAddr>> {
        match &self.server.alternate_address {
            Some(addr) => {
                let ip: IpAddr = addr.parse()?;
                Ok(Some(SocketAddr::new(ip, self.server.alternate_port)))
            }
            None => Ok(None),
        }
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.local_bind()?;
        self.service_addr()?;

        if self.client.server.is_empty() {
            anyhow::bail!("STUN server must not be empty");
        }
        if self.client.port == 0 {
            anyhow::bail!("STUN server port must not be 0");
        }

        if self.alternate_endpoint()?.is_some() && self.server.alternate_port == 0 {
            anyhow::bail!("Alternate address configured without an alternate port");
        }

        if let Some(server) = &self.server.public_address_server {
            validate_host_port(server, "Public address server")?;
        }
        if let Some(server) = &self.server.remote_secret_server {
            validate_host_port(server, "Remote shared secret server")?;
        }

        if self.tls.cert.is_some() != self.tls.key.is_some() {
            anyhow::bail!("TLS certificate and key must be configured together");
        }

        if let Some(dns) = &self.discovery.dns_server {
            dns.parse::<IpAddr>()
                .map_err(|_| anyhow::anyhow!("DNS server '{}' is not an IP address", dns))?;
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        Ok(())
    }
}

/// Split and check a `host:port` string
///
/// # Errors
///
/// Returns an error if the port is missing, zero or not a number, or the
/// host is empty.
pub fn split_host_port(addr: &str) -> anyhow::Result<(String, u16)> {
    let (host, port_str) = addr.rsplit_once(':').ok_or_else(|| {
        anyhow::anyhow!("'{}' missing port (expected format: host:port)", addr)
    })?;

    let port: u16 = port_str
        .parse()
        .map_err(|_| anyhow::anyhow!("'{}' has invalid port: {}", addr, port_str))?;
    if port == 0 {
        anyhow::bail!("'{}' has invalid port: 0", addr);
    }
    if host.is_empty() {
        anyhow::bail!("'{}' has empty hostname", addr);
    }

    Ok((host.to_string(), port))
}

fn validate_host_port(addr: &str, name: &str) -> anyhow::Result<()> {
    split_host_port(addr).map_err(|e| anyhow::anyhow!("{name} {e}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.client.server, "stun.l.google.com");
        assert_eq!(config.client.port, 19302);
        assert_eq!(config.client.tls_port, 3478);
        assert_eq!(config.server.port, 3478);
        assert!(!config.client.sign_requests);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();

        config.server.alternate_address = Some("192.0.2.1".to_string());
        assert!(config.validate().is_err());
        config.server.alternate_port = 3479;
        assert!(config.validate().is_ok());
        assert_eq!(
            config.alternate_endpoint().unwrap(),
            Some("192.0.2.1:3479".parse().unwrap())
        );

        config.tls.cert = Some(PathBuf::from("cert.pem"));
        assert!(config.validate().is_err());
        config.tls.key = Some(PathBuf::from("key.pem"));
        assert!(config.validate().is_ok());

        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());
        config.logging.level = "DEBUG".to_string();
        assert!(config.validate().is_ok());

        config.server.remote_secret_server = Some("secrets.example.org".to_string());
        assert!(config.validate().is_err());
        config.server.remote_secret_server = Some("secrets.example.org:3478".to_string());
        assert!(config.validate().is_ok());

        config.discovery.dns_server = Some("not-an-ip".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_split_host_port() {
        assert_eq!(
            split_host_port("stun.example.org:3478").unwrap(),
            ("stun.example.org".to_string(), 3478)
        );
        assert!(split_host_port("stun.example.org").is_err());
        assert!(split_host_port("stun.example.org:0").is_err());
        assert!(split_host_port(":3478").is_err());
        assert!(split_host_port("host:port").is_err());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [client]
            server = "stun.example.org"

            [server]
            alternate_address = "198.51.100.2"
            alternate_port = 3479
            "#,
        )
        .unwrap();

        assert_eq!(config.client.server, "stun.example.org");
        assert_eq!(config.client.port, 19302);
        assert_eq!(config.server.port, 3478);
        assert_eq!(config.logging.level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config.toml");

        let mut config = Config::default();
        config.client.sign_requests = true;
        config.tls.ca = Some(PathBuf::from("/etc/stunprobe/ca.pem"));
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert!(loaded.client.sign_requests);
        assert_eq!(loaded.tls.ca, config.tls.ca);
        assert_eq!(loaded.server.address, config.server.address);
    }
}
