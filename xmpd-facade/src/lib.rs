//! Facade layer: client stream framing and listener bootstrap model.

pub mod connection;
pub mod protocol;

use xmpd_common::config::ServerConfig;

/// Facade subsystem bootstrap module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FacadeModule {
    /// Address the client listener binds to.
    pub bind_address: String,
    /// Client-to-server listener port.
    pub client_port: u16,
}

impl FacadeModule {
    /// Builds the facade bootstrap model from process config.
    #[must_use]
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            bind_address: config.bind_address.clone(),
            client_port: config.client_port,
        }
    }

    /// `address:port` string handed to the socket layer.
    #[must_use]
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.bind_address, self.client_port)
    }
}
