//! Prometheus endpoint settings
//!
//! ```toml
//! [monitoring]
//! enabled = true
//! listen_addr = "0.0.0.0:9090"
//! ```

use std::net::SocketAddr;

use serde::Deserialize;
use serde::Serialize;

use crate::ConfigError;
use crate::Error;
use crate::Result;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MonitoringConfig {
    /// Serve `/metrics`
    #[serde(default)]
    pub enabled: bool,

    /// Address the metrics endpoint binds to
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_addr: default_listen_addr(),
        }
    }
}

impl MonitoringConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        self.listen_addr.parse().map_err(|e| {
            Error::Config(ConfigError::Message(format!(
                "monitoring.listen_addr {:?} is not a socket address: {e}",
                self.listen_addr
            )))
        })
    }

    /// An enabled endpoint needs a parseable, non-privileged address.
    /// Port 0 is accepted and picks an ephemeral port.
    pub fn validate(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        let addr = self.socket_addr()?;
        if (1..1024).contains(&addr.port()) {
            return Err(Error::Config(ConfigError::Message(format!(
                "monitoring.listen_addr port {} is privileged",
                addr.port()
            ))));
        }
        Ok(())
    }
}

fn default_listen_addr() -> String {
    "0.0.0.0:9090".to_string()
}
