//! TCP server for diagnostics sessions.
//!
//! Accepts connections, runs one supervised session task per connection,
//! and on shutdown signals every live session before waiting for them all.

use crate::config::Config;
use crate::registry::Registry;
use crate::session::{Services, Session, SessionTable};
use chrono::Local;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Sent to connections refused because the session limit is reached
const BUSY_MESSAGE: &[u8] = b"Server busy, try again later\n";

/// Server instance
pub struct Server {
    config: Config,
    services: Arc<Services>,
    sessions: Arc<SessionTable>,
    session_limit: Arc<Semaphore>,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: Config) -> Self {
        let registry = Arc::new(Registry::with_seed(&config.seed_users));
        let services = Arc::new(Services::new(&config, registry));
        let session_limit = Arc::new(Semaphore::new(config.max_sessions));

        Server {
            config,
            services,
            sessions: Arc::new(SessionTable::new()),
            session_limit,
        }
    }

    /// Bind the configured address and serve until Ctrl-C
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.listen).await?;
        info!(address = %self.config.listen, "Server listening");

        self.serve(listener, shutdown_signal()).await;
        Ok(())
    }

    /// Accept connections on `listener` until `shutdown` completes, then
    /// close every live session and wait for the session tasks to end.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                _ = &mut shutdown => break,

                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Session task failed");
                    }
                }

                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => match Arc::clone(&self.session_limit).try_acquire_owned() {
                        Ok(permit) => self.spawn_session(&mut tasks, stream, peer, permit),
                        Err(_) => {
                            warn!(peer = %peer, "Session limit reached, refusing connection");
                            let _ = stream.try_write(BUSY_MESSAGE);
                        }
                    },
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                    }
                },
            }
        }

        drop(listener);
        if !self.sessions.is_empty() {
            let signalled = self.sessions.close_all();
            info!(sessions = signalled, "Shutting down, closing live sessions");
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Session task failed");
            }
        }
        info!(registered_users = self.services.registry.len(), "Server stopped");
    }

    fn spawn_session(
        &self,
        tasks: &mut JoinSet<()>,
        stream: TcpStream,
        peer: SocketAddr,
        permit: OwnedSemaphorePermit,
    ) {
        let (id, close) = self.sessions.insert(peer);
        let sessions = Arc::clone(&self.sessions);
        let services = Arc::clone(&self.services);
        debug!(session = id, peer = %peer, live = self.sessions.len(), "New connection");

        tasks.spawn(async move {
            let session = Session::new(id, stream, close, services);
            if let Err(e) = session.run().await {
                debug!(session = id, error = %e, "Connection error");
            }

            if let Some(handle) = sessions.remove(id) {
                let lasted = Local::now().signed_duration_since(handle.connected_at);
                debug!(
                    session = id,
                    peer = %handle.peer,
                    seconds = lasted.num_seconds(),
                    "Connection closed"
                );
            }
            drop(permit);
        });
    }

    /// Get a reference to the registry for testing
    #[cfg(test)]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.services.registry
    }

    #[cfg(test)]
    pub fn live_sessions(&self) -> usize {
        self.sessions.len()
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl-C, running until killed");
        std::future::pending::<()>().await;
    }
    info!("Received Ctrl-C");
}
