//! Server configuration shared by bootstrap code.

use std::path::PathBuf;

use serde::Deserialize;

use crate::error::{XmpdError, XmpdResult};
use crate::ids::WorkerCount;

/// Bootstrap configuration used by `xmpd-server` during process startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Domain served by this process. Used as SASL realm and as the jid domain part.
    pub hostname: String,
    /// Address the client listener binds to.
    pub bind_address: String,
    /// Client-to-server listener port.
    pub client_port: u16,
    /// Number of threads executing blocking handler jobs.
    pub worker_threads: WorkerCount,
    /// Readiness events drained per reactor poll.
    pub max_events: usize,
    /// Upper bound on one reactor wait, in milliseconds.
    pub poll_timeout_ms: u64,
    /// SQLite database file. In-memory storage is used when absent.
    pub database_path: Option<PathBuf>,
    /// Default `tracing` filter directive, overridden by `RUST_LOG`.
    pub log_filter: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_owned(),
            bind_address: "0.0.0.0".to_owned(),
            client_port: 5222,
            worker_threads: WorkerCount::new(5).expect("literal worker count must be non-zero"),
            max_events: 256,
            poll_timeout_ms: 1000,
            database_path: None,
            log_filter: "info".to_owned(),
        }
    }
}

/// On-disk shape of the configuration file. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    hostname: Option<String>,
    bind_address: Option<String>,
    client_port: Option<u16>,
    worker_threads: Option<u16>,
    max_events: Option<usize>,
    poll_timeout_ms: Option<u64>,
    database_path: Option<PathBuf>,
    log_filter: Option<String>,
}

impl ServerConfig {
    /// Parses a TOML document on top of the defaults.
    ///
    /// # Errors
    ///
    /// Returns `XmpdError::InvalidConfig` when the document is not valid TOML, names an unknown
    /// key, or fails [`ServerConfig::validate`].
    pub fn from_toml_str(text: &str) -> XmpdResult<Self> {
        let file: ConfigFile = toml::from_str(text)
            .map_err(|error| XmpdError::InvalidConfig(format!("parse config failed: {error}")))?;
        let mut config = Self::default();
        if let Some(hostname) = file.hostname {
            config.hostname = hostname;
        }
        if let Some(bind_address) = file.bind_address {
            config.bind_address = bind_address;
        }
        if let Some(port) = file.client_port {
            config.client_port = port;
        }
        if let Some(threads) = file.worker_threads {
            config.worker_threads = WorkerCount::new(threads).ok_or_else(|| {
                XmpdError::InvalidConfig("worker_threads must be positive".to_owned())
            })?;
        }
        if let Some(max_events) = file.max_events {
            config.max_events = max_events;
        }
        if let Some(timeout) = file.poll_timeout_ms {
            config.poll_timeout_ms = timeout;
        }
        if file.database_path.is_some() {
            config.database_path = file.database_path;
        }
        if let Some(filter) = file.log_filter {
            config.log_filter = filter;
        }
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a configuration file.
    ///
    /// # Errors
    ///
    /// Returns `XmpdError::Io` when the file cannot be read and the errors of
    /// [`ServerConfig::from_toml_str`] otherwise.
    pub fn from_file(path: &std::path::Path) -> XmpdResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|error| {
            XmpdError::Io(format!("read config {} failed: {error}", path.display()))
        })?;
        Self::from_toml_str(&text)
    }

    /// Checks cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns `XmpdError::InvalidConfig` for an empty hostname or a zero client port.
    pub fn validate(&self) -> XmpdResult<()> {
        if self.hostname.trim().is_empty() {
            return Err(XmpdError::InvalidConfig("hostname must not be empty".to_owned()));
        }
        if self.client_port == 0 {
            return Err(XmpdError::InvalidConfig("client_port must be positive".to_owned()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::ServerConfig;
    use crate::error::XmpdError;
    use googletest::prelude::*;
    use rstest::rstest;
    use std::path::PathBuf;

    #[rstest]
    fn default_config_matches_classic_client_port() {
        let config = ServerConfig::default();
        assert_that!(config.client_port, eq(5222));
        assert_that!(config.hostname.as_str(), eq("localhost"));
        assert_that!(config.worker_threads.get(), eq(5));
        assert_that!(&config.validate(), eq(&Ok(())));
    }

    #[rstest]
    fn toml_overrides_only_named_keys() {
        let config = ServerConfig::from_toml_str(
            r#"
            hostname = "chat.example.org"
            worker_threads = 2
            database_path = "/var/lib/xmpd/xmpd.db"
            "#,
        )
        .expect("config should parse");

        assert_that!(config.hostname.as_str(), eq("chat.example.org"));
        assert_that!(config.worker_threads.get(), eq(2));
        assert_that!(
            &config.database_path,
            eq(&Some(PathBuf::from("/var/lib/xmpd/xmpd.db")))
        );
        assert_that!(config.client_port, eq(5222));
    }

    #[rstest]
    #[case("worker_threads = 0")]
    #[case("hostname = \"  \"")]
    #[case("client_port = 0")]
    #[case("unknown_key = true")]
    #[case("hostname = [")]
    fn toml_rejects_invalid_documents(#[case] text: &str) {
        let result = ServerConfig::from_toml_str(text);
        assert_that!(
            matches!(result, Err(XmpdError::InvalidConfig(_))),
            eq(true)
        );
    }
}
