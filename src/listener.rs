//! Connection listener
//!
//! Owns the listening socket, accepts connections and turns each one into a
//! registered session (or rejects it when the username is taken).

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::config::SessionConfig;
use crate::error::{AppError, RegistrationConflict};
use crate::message::Message;
use crate::registry::Registry;
use crate::session::Session;

/// Outcome of the registration handshake
#[derive(Debug)]
pub enum Admission {
    /// Registered and running
    Accepted(Arc<Session>),
    /// Username taken; the session was told and left to the peer
    Rejected(RegistrationConflict),
}

/// Accept loop plus the registry it feeds
pub struct Listener {
    listener: TcpListener,
    registry: Arc<Registry>,
    config: SessionConfig,
}

impl Listener {
    /// Fails with `AppError::Initialization` if the socket is not bound.
    pub fn new(listener: TcpListener, config: SessionConfig) -> Result<Self, AppError> {
        listener.local_addr().map_err(|e| {
            AppError::Initialization(format!("listening socket is not open: {}", e))
        })?;

        Ok(Self {
            listener,
            registry: Arc::new(Registry::new()),
            config,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }

    /// Accept connections until accepting fails
    ///
    /// An accept failure is fatal: the listener tears down and returns it.
    pub async fn start(self) -> Result<(), AppError> {
        let err = loop {
            if let Err(e) = self.accept_one().await {
                break e;
            }
        };

        error!("{}; closing listener", err);
        self.shutdown();
        Err(err)
    }

    /// Like `start`, but also stops cleanly when `shutdown` resolves
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), AppError>
    where
        F: Future<Output = ()> + Send,
    {
        tokio::pin!(shutdown);

        let result = loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break Ok(());
                }
                accepted = self.accept_one() => {
                    if let Err(e) = accepted {
                        error!("{}; closing listener", e);
                        break Err(e);
                    }
                }
            }
        };

        self.shutdown();
        result
    }

    pub async fn run_until_ctrl_c(self) -> Result<(), AppError> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to install Ctrl-C handler: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Accept one connection and hand it to its own bootstrap task
    async fn accept_one(&self) -> Result<(), AppError> {
        let (stream, peer) = self.listener.accept().await.map_err(AppError::Accept)?;
        info!("New connection from {}", peer);

        let registry = Arc::clone(&self.registry);
        let config = self.config.clone();

        // The username read must not stall the accept loop
        tokio::spawn(async move {
            match Session::accept(stream, &config).await {
                Ok(session) => {
                    admit(&registry, session);
                }
                Err(e) => warn!("Dropping connection from {}: {}", peer, e),
            }
        });

        Ok(())
    }

    fn shutdown(self) {
        self.registry.close();
        drop(self.listener);
        info!("Listener closed");
    }
}

/// Register a freshly handshaken session
///
/// Wires the session's callbacks to the registry, then either registers it
/// (`STATUS_SUCCESS`, join announcement to everyone else, read loop started)
/// or rejects it (`STATUS_FAILURE`, never registered, never started).
pub fn admit(registry: &Arc<Registry>, mut session: Session) -> Admission {
    let hub = Arc::downgrade(registry);
    session.set_on_received(move |message| {
        if let Some(registry) = hub.upgrade() {
            registry.broadcast(&message);
        }
    });

    let hub = Arc::downgrade(registry);
    session.set_on_die(move |dead| {
        if let Some(registry) = hub.upgrade() {
            registry.on_death(dead);
        }
    });

    let session = Arc::new(session);

    if let Err(conflict) = registry.register(Arc::clone(&session), &Message::registration_ok()) {
        info!("Rejecting session {}: {}", session.id(), conflict);
        session.send_message(&Message::invalid_username());
        tokio::spawn(Arc::clone(&session).linger());
        return Admission::Rejected(conflict);
    }

    info!(
        "'{}' joined, {} user(s) online",
        session.username(),
        registry.len()
    );

    let joiner = session.username().to_string();
    registry.broadcast_where(&Message::joined(&joiner), |other| other.username() != joiner);

    tokio::spawn(Arc::clone(&session).run());

    Admission::Accepted(session)
}
