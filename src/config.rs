//! Configuration types for association services

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use crate::DEFAULT_PORT;

/// Configuration for association services (acceptor and initiator side)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssocConfig {
    /// Local Application Entity Title
    pub local_aet: String,

    /// Bind address for the SCP listener
    #[serde(default = "default_bind_addr")]
    pub bind_addr: IpAddr,

    /// Port for the SCP listener
    #[serde(default = "default_port")]
    pub port: u16,

    /// Respond with the AE title the peer called instead of `local_aet`
    #[serde(default)]
    pub echo_called_aet: bool,

    /// Maximum accepted message size in bytes
    #[serde(default = "default_max_message_size")]
    pub max_message_size: u32,

    /// Timeout for waiting on a new transport connection, in milliseconds.
    /// Absent means the accept loop blocks indefinitely.
    #[serde(default)]
    pub accept_timeout_ms: Option<u64>,

    /// Timeout for waiting on the next application message, in milliseconds.
    /// Absent means the message loop blocks indefinitely.
    #[serde(default)]
    pub receive_timeout_ms: Option<u64>,

    /// Connection timeout for outbound associations, in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Timeout for association negotiation and release, in milliseconds
    #[serde(default = "default_association_timeout")]
    pub association_timeout_ms: u64,

    /// Refuse every incoming association regardless of its content
    #[serde(default)]
    pub forced_refuse: bool,

    /// Maximum number of concurrently served associations
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Name of the negotiation profile to use
    #[serde(default = "default_profile")]
    pub profile: String,

    /// Treat a failed role negotiation as "unspecified" instead of
    /// rejecting the presentation context
    #[serde(default)]
    pub lenient_role_negotiation: bool,
}

/// Configuration for a remote peer node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteNode {
    /// Remote Application Entity Title
    pub ae_title: String,

    /// Remote host address
    pub host: String,

    /// Remote port
    pub port: u16,

    /// Connection timeout in milliseconds (overrides global setting)
    pub connect_timeout_ms: Option<u64>,

    /// Maximum message size for this node (overrides global setting)
    pub max_message_size: Option<u32>,
}

impl Default for AssocConfig {
    fn default() -> Self {
        Self {
            local_aet: "ASSOC_SCP".to_string(),
            bind_addr: default_bind_addr(),
            port: default_port(),
            echo_called_aet: false,
            max_message_size: default_max_message_size(),
            accept_timeout_ms: None,
            receive_timeout_ms: None,
            connect_timeout_ms: default_connect_timeout(),
            association_timeout_ms: default_association_timeout(),
            forced_refuse: false,
            max_workers: default_max_workers(),
            profile: default_profile(),
            lenient_role_negotiation: false,
        }
    }
}

impl AssocConfig {
    /// Get accept timeout as Duration; `None` means block indefinitely
    pub fn accept_timeout(&self) -> Option<Duration> {
        self.accept_timeout_ms.map(Duration::from_millis)
    }

    /// Get receive timeout as Duration; `None` means block indefinitely
    pub fn receive_timeout(&self) -> Option<Duration> {
        self.receive_timeout_ms.map(Duration::from_millis)
    }

    /// Get connection timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Get association negotiation timeout as Duration
    pub fn association_timeout(&self) -> Duration {
        Duration::from_millis(self.association_timeout_ms)
    }

    /// Load a configuration from a TOML string
    pub fn from_toml_str(toml: &str) -> crate::error::Result<Self> {
        let config: AssocConfig = toml::from_str(toml)
            .map_err(|e| crate::error::AssocError::config(format!("TOML parse error: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::error::Result<()> {
        validate_ae_title(&self.local_aet)?;

        if self.port == 0 {
            return Err(crate::error::AssocError::config(
                "Port must be greater than 0",
            ));
        }

        if self.max_message_size < 16384 || self.max_message_size > 131072 {
            return Err(crate::error::AssocError::config(
                "Max message size must be between 16384 and 131072 bytes",
            ));
        }

        if self.max_workers == 0 {
            return Err(crate::error::AssocError::config(
                "Max workers must be greater than 0",
            ));
        }

        if self.profile.trim().is_empty() {
            return Err(crate::error::AssocError::config(
                "Profile name cannot be empty",
            ));
        }

        Ok(())
    }
}

impl RemoteNode {
    /// Create a new remote node configuration
    pub fn new(ae_title: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            ae_title: ae_title.into(),
            host: host.into(),
            port,
            connect_timeout_ms: None,
            max_message_size: None,
        }
    }

    /// Set connection timeout for this node
    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.connect_timeout_ms = Some(timeout_ms);
        self
    }

    /// Set maximum message size for this node
    pub fn with_max_message_size(mut self, size: u32) -> Self {
        self.max_message_size = Some(size);
        self
    }

    /// Validate the remote node configuration
    pub fn validate(&self) -> crate::error::Result<()> {
        validate_ae_title(&self.ae_title)?;

        if self.host.is_empty() {
            return Err(crate::error::AssocError::config(
                "Remote host cannot be empty",
            ));
        }

        if self.port == 0 {
            return Err(crate::error::AssocError::config(
                "Remote port must be greater than 0",
            ));
        }

        Ok(())
    }
}

/// Check the DICOM constraints on an AE title (1-16 printable characters)
pub fn validate_ae_title(aet: &str) -> crate::error::Result<()> {
    if aet.is_empty() || aet.len() > 16 {
        return Err(crate::error::AssocError::InvalidAeTitle(format!(
            "AE title must be 1-16 characters: {:?}",
            aet
        )));
    }
    if aet.chars().any(|c| c.is_control() || c == '\\') {
        return Err(crate::error::AssocError::InvalidAeTitle(format!(
            "AE title contains invalid characters: {:?}",
            aet
        )));
    }
    Ok(())
}

// Default value functions
fn default_bind_addr() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0))
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_max_message_size() -> u32 {
    65536
}

fn default_connect_timeout() -> u64 {
    30_000 // 30 seconds
}

fn default_association_timeout() -> u64 {
    30_000 // 30 seconds
}

fn default_max_workers() -> usize {
    10
}

fn default_profile() -> String {
    "DEFAULT".to_string()
}
