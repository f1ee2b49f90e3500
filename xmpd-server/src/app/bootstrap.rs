//! Command line, logging and reactor startup.

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use xmpd_common::config::ServerConfig;
use xmpd_common::error::{XmpdError, XmpdResult};
use xmpd_common::ids::WorkerCount;
use xmpd_facade::FacadeModule;
use xmpd_storage::open_storage;

use super::ServerApp;
use crate::network::{ServerReactor, ServerReactorConfig};

/// Minimal XMPP client-to-server daemon.
#[derive(Debug, Parser)]
#[command(name = "xmpd-server", version)]
pub(crate) struct Cli {
    /// TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Domain served by this process.
    #[arg(long)]
    hostname: Option<String>,

    /// Client listener port.
    #[arg(short, long)]
    port: Option<u16>,

    /// Worker threads for blocking jobs.
    #[arg(short, long)]
    workers: Option<u16>,
}

impl Cli {
    /// Loads the configuration file (or defaults) and applies command line overrides.
    ///
    /// # Errors
    ///
    /// Returns `XmpdError::InvalidConfig` when the file is unreadable or invalid, or an override
    /// is out of range.
    pub(crate) fn load_config(&self) -> XmpdResult<ServerConfig> {
        let mut config = match self.config.as_deref() {
            Some(path) => ServerConfig::from_file(path)?,
            None => ServerConfig::default(),
        };
        if let Some(hostname) = &self.hostname {
            config.hostname.clone_from(hostname);
        }
        if let Some(port) = self.port {
            config.client_port = port;
        }
        if let Some(workers) = self.workers {
            config.worker_threads = WorkerCount::new(workers).ok_or_else(|| {
                XmpdError::InvalidConfig("worker count must be non-zero".to_owned())
            })?;
        }
        config.validate()?;
        Ok(config)
    }
}

fn init_logging(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init();
}

fn resolve_listen_address(address: &str) -> XmpdResult<SocketAddr> {
    address
        .to_socket_addrs()
        .map_err(|error| XmpdError::InvalidConfig(format!("resolve {address} failed: {error}")))?
        .next()
        .ok_or_else(|| XmpdError::InvalidConfig(format!("{address} resolves to no address")))
}

/// Runs the server until an unrecoverable reactor error.
///
/// # Errors
///
/// Returns configuration, storage and socket errors met during startup or polling.
pub(crate) fn run_server() -> XmpdResult<()> {
    let config = Cli::parse().load_config()?;
    init_logging(&config.log_filter);

    let storage = open_storage(config.database_path.as_deref(), &config.hostname)?;
    let listen_address =
        resolve_listen_address(&FacadeModule::from_config(&config).listen_address())?;
    let reactor_config = ServerReactorConfig {
        max_events: config.max_events,
        ..ServerReactorConfig::default()
    };
    let mut reactor = ServerReactor::bind(listen_address, reactor_config)?;
    let poll_timeout = Duration::from_millis(config.poll_timeout_ms);
    let mut app = ServerApp::new(config, storage, reactor.wake_signal())?;
    info!(address = %reactor.local_addr()?, "{}", app.startup_summary());

    loop {
        let _ = reactor.poll_once(&mut app, Some(poll_timeout))?;
    }
}

#[cfg(test)]
mod tests {
    use super::{Cli, resolve_listen_address};
    use clap::Parser;
    use googletest::prelude::*;
    use rstest::rstest;
    use xmpd_common::error::XmpdError;

    #[rstest]
    fn overrides_apply_on_top_of_config_file() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("xmpd.toml");
        std::fs::write(&path, "hostname = \"file.example\"\nclient_port = 5333\n")
            .expect("config file is written");

        let cli = Cli::parse_from([
            "xmpd-server",
            "--config",
            path.to_str().expect("utf-8 temp path"),
            "--workers",
            "3",
        ]);
        let config = cli.load_config().expect("config loads");

        assert_that!(config.hostname.as_str(), eq("file.example"));
        assert_that!(config.client_port, eq(5333));
        assert_that!(config.worker_threads.get(), eq(3));
    }

    #[rstest]
    fn zero_workers_are_rejected() {
        let cli = Cli::parse_from(["xmpd-server", "--workers", "0"]);
        assert_that!(
            &cli.load_config().err(),
            eq(&Some(XmpdError::InvalidConfig(
                "worker count must be non-zero".to_owned()
            )))
        );
    }

    #[rstest]
    fn hostname_override_without_file() {
        let cli = Cli::parse_from(["xmpd-server", "--hostname", "chat.example", "-p", "6222"]);
        let config = cli.load_config().expect("config loads");
        assert_that!(config.hostname.as_str(), eq("chat.example"));
        assert_that!(config.client_port, eq(6222));
    }

    #[rstest]
    fn listen_address_resolves_numeric_hosts() {
        let address = resolve_listen_address("127.0.0.1:5222").expect("numeric address resolves");
        assert_that!(address.port(), eq(5222));
    }
}
