//! The client agent role: binds the listen socket, owns the shared
//! registries and the channel allocator, and spawns one session task per
//! accepted connection.

use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use gate_core::{
    AgentConfig, ChannelAllocator, ClassRegistry, DcError, UberdogError, UberdogRegistry,
};

use crate::bus::BusHandle;
use crate::events::EventSender;
use crate::session::{ClientSession, SessionShared};

/// Errors that prevent the role from starting or keep it from running.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("invalid class declarations: {0}")]
    Classes(#[from] DcError),

    #[error("invalid uberdog configuration: {0}")]
    Uberdogs(#[from] UberdogError),

    #[error("failed to bind {bind}: {source}")]
    Bind {
        bind: String,
        #[source]
        source: std::io::Error,
    },
}

/// Front-end gateway role for untrusted clients.
pub struct ClientAgent {
    bind: String,
    shared: Arc<SessionShared>,
    cancel: CancellationToken,
}

impl ClientAgent {
    /// Builds the role: resolves class and uberdog registries from config
    /// and sets up the allocator.
    pub fn new(
        config: &AgentConfig,
        bus: BusHandle,
        events: EventSender,
        cancel: CancellationToken,
    ) -> Result<Self, AgentError> {
        let classes = Arc::new(ClassRegistry::from_config(&config.classes)?);
        let uberdogs = Arc::new(UberdogRegistry::from_config(&classes, &config.uberdogs)?);
        let allocator = Mutex::new(ChannelAllocator::new(
            config.channels.min,
            config.channels.max,
        ));

        let shared = Arc::new(SessionShared {
            version: config.version.clone(),
            dc_hash: classes.hash(),
            classes,
            uberdogs,
            allocator,
            bus,
            events,
        });

        Ok(Self {
            bind: config.bind.clone(),
            shared,
            cancel,
        })
    }

    /// Expected DC hash, as presented to clients.
    pub fn dc_hash(&self) -> u32 {
        self.shared.dc_hash
    }

    /// Accepts connections until the cancellation token fires.
    pub async fn run(&self) -> Result<(), AgentError> {
        let listener = TcpListener::bind(&self.bind)
            .await
            .map_err(|source| AgentError::Bind {
                bind: self.bind.clone(),
                source,
            })?;

        let dc_hash = format!("0x{:x}", self.shared.dc_hash);
        info!(
            bind = %self.bind,
            classes = self.shared.classes.len(),
            uberdogs = self.shared.uberdogs.len(),
            dc_hash = %dc_hash,
            "Client agent listening"
        );

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("Client agent shutdown requested");
                    break;
                }

                result = listener.accept() => match result {
                    Ok((stream, peer)) => {
                        let local = listener
                            .local_addr()
                            .map(|a| a.to_string())
                            .unwrap_or_else(|_| self.bind.clone());
                        let shared = Arc::clone(&self.shared);
                        let cancel = self.cancel.clone();
                        info!(remote = %peer, "Incoming connection");
                        tokio::spawn(async move {
                            ClientSession::run(stream, shared, peer.to_string(), local, cancel)
                                .await;
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                    }
                },
            }
        }

        Ok(())
    }
}
