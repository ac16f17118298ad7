//! Service graph
//!
//! Builds the orchestration layer once per process and hands shared
//! references to the WebSocket boundary.

use std::sync::Arc;

use tracing::info;

use crate::bridge::{ControlApi, PtyShellOpener, ShellOpener, TerminalBridge};
use crate::config::{HostStore, ServerConfig};
use crate::session::SessionRegistry;
use crate::sftp::{FileBridge, RemoteFsOpener, SftpOpener};
use crate::ssh::{Connector, RusshConnector};
use crate::state::TunnelStore;
use crate::status::StatusPoller;
use crate::tunnel::{TunnelManager, TunnelSettings};

pub struct Services {
    pub registry: Arc<SessionRegistry>,
    pub hosts: Arc<dyn HostStore>,
    pub terminals: Arc<TerminalBridge>,
    pub files: Arc<FileBridge>,
    pub tunnels: Arc<TunnelManager>,
    pub status: Arc<StatusPoller>,
}

impl Services {
    /// Production wiring: russh connections, PTY shells, SFTP.
    pub fn new(
        config: &ServerConfig,
        hosts: Arc<dyn HostStore>,
        tunnel_store: Arc<dyn TunnelStore>,
    ) -> Self {
        Self::with_parts(
            config,
            Arc::new(RusshConnector::new(config.connect_timeout())),
            hosts,
            tunnel_store,
            Arc::new(PtyShellOpener),
            Arc::new(SftpOpener),
        )
    }

    pub fn with_parts(
        config: &ServerConfig,
        connector: Arc<dyn Connector>,
        hosts: Arc<dyn HostStore>,
        tunnel_store: Arc<dyn TunnelStore>,
        shell_opener: Arc<dyn ShellOpener>,
        fs_opener: Arc<dyn RemoteFsOpener>,
    ) -> Self {
        let registry = Arc::new(SessionRegistry::with_grace_period(
            connector.clone(),
            config.session_grace(),
        ));
        let terminals = Arc::new(
            TerminalBridge::new(registry.clone(), shell_opener)
                .with_resize_window(config.resize_debounce()),
        );
        let files = Arc::new(FileBridge::new(registry.clone(), fs_opener));
        let tunnels = Arc::new(TunnelManager::new(
            connector,
            hosts.clone(),
            tunnel_store,
            TunnelSettings::from(config),
        ));
        let status = Arc::new(StatusPoller::new(
            registry.clone(),
            hosts.clone(),
            config.status_ttl(),
            config.status_exec_timeout(),
        ));

        Self {
            registry,
            hosts,
            terminals,
            files,
            tunnels,
            status,
        }
    }

    pub fn control_api(&self) -> ControlApi {
        ControlApi::new(
            self.tunnels.clone(),
            self.files.clone(),
            self.status.clone(),
            self.registry.clone(),
            self.hosts.clone(),
        )
    }

    /// Stop every tunnel, then close every session connection.
    pub async fn shutdown(&self) {
        info!("Shutting down services");
        self.tunnels.shutdown().await;
        self.registry.disconnect_all().await;
    }
}
