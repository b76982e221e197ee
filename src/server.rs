//! Accept loop and per-connection driver.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_async;

use crate::registry::WorldRegistry;
use crate::router::{outbox_channel, BroadcastRouter, Inbox};
use crate::session::Session;
use crate::storage::{BlobStore, Storage};
use crate::transport::{loopback_pair, Connection, LoopbackTransport, Transport, WebSocketTransport};

/// Pause after a failed accept, e.g. when the process is out of file
/// descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Source of incoming TCP streams.
trait Acceptor: Send + Sync {
    fn accept(&self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send;
}

impl Acceptor for TcpListener {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self).await
    }
}

/// Shared state behind every connection: storage, the open worlds, the
/// broadcast router and the size used for new worlds.
pub struct WorldServer<S> {
    storage: Arc<Storage<S>>,
    worlds: Arc<WorldRegistry>,
    router: Arc<BroadcastRouter>,
    world_size: u32,
}

impl<S> Clone for WorldServer<S> {
    fn clone(&self) -> Self {
        WorldServer {
            storage: Arc::clone(&self.storage),
            worlds: Arc::clone(&self.worlds),
            router: Arc::clone(&self.router),
            world_size: self.world_size,
        }
    }
}

impl<S: BlobStore + 'static> WorldServer<S> {
    pub fn new(storage: Storage<S>, world_size: u32) -> Self {
        WorldServer {
            storage: Arc::new(storage),
            worlds: Arc::new(WorldRegistry::new()),
            router: Arc::new(BroadcastRouter::new()),
            world_size,
        }
    }

    pub fn storage(&self) -> &Storage<S> {
        &self.storage
    }

    pub fn worlds(&self) -> &WorldRegistry {
        &self.worlds
    }

    pub fn router(&self) -> &BroadcastRouter {
        &self.router
    }

    /// A fresh anonymous session and the inbox its routed messages land in.
    pub fn open_session(&self) -> (Session<S>, Inbox) {
        let (outbox, inbox) = outbox_channel();
        let session = Session::new(
            Arc::clone(&self.storage),
            Arc::clone(&self.worlds),
            Arc::clone(&self.router),
            outbox,
            self.world_size,
        );
        (session, inbox)
    }

    /// Accepts WebSocket clients forever. A failed accept is logged and
    /// retried after a short pause.
    pub async fn run(&self, listener: TcpListener) {
        if let Ok(addr) = listener.local_addr() {
            tracing::info!(%addr, "listening");
        }
        self.accept_loop(listener).await
    }

    async fn accept_loop<A: Acceptor>(&self, acceptor: A) {
        loop {
            let (stream, addr) = match acceptor.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };
            tracing::info!(%addr, "new connection");
            let server = self.clone();
            tokio::spawn(async move { server.handle_socket(stream, addr).await });
        }
    }

    async fn handle_socket(self, stream: TcpStream, addr: SocketAddr) {
        let ws_stream = match accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                tracing::warn!(%addr, error = %e, "websocket handshake failed");
                return;
            }
        };
        let (session, inbox) = self.open_session();
        let id = session.id();
        tracing::debug!(%addr, session = %id, "session opened");
        serve_connection(Connection::new(WebSocketTransport::new(ws_stream)), session, inbox).await;
        tracing::info!(%addr, session = %id, "client disconnected");
    }

    /// Starts a session over an in-process link and returns the client end.
    pub fn connect_loopback(&self) -> Connection<LoopbackTransport> {
        let (client, server) = loopback_pair();
        let (session, inbox) = self.open_session();
        tokio::spawn(serve_connection(Connection::new(server), session, inbox));
        Connection::new(client)
    }
}

/// Drives one session until its transport closes. Inbound messages and
/// routed messages are handled by this task alone, one at a time.
pub async fn serve_connection<T, S>(mut connection: Connection<T>, mut session: Session<S>, mut inbox: Inbox)
where
    T: Transport,
    S: BlobStore,
{
    let id = session.id();
    'conn: loop {
        tokio::select! {
            inbound = connection.recv() => {
                let message = match inbound {
                    None => break 'conn,
                    Some(Ok(message)) => message,
                    Some(Err(e)) if e.is_bad_frame() => {
                        tracing::warn!(session = %id, error = %e, "dropping bad frame");
                        continue 'conn;
                    }
                    Some(Err(e)) => {
                        tracing::warn!(session = %id, error = %e, "transport failed");
                        break 'conn;
                    }
                };
                let tag = message.tag();
                match session.handle(message).await {
                    Ok(replies) => {
                        for reply in &replies {
                            if let Err(e) = connection.send(reply).await {
                                tracing::warn!(session = %id, error = %e, "reply not delivered");
                                break 'conn;
                            }
                        }
                    }
                    Err(e) if e.is_dropped_message() => {
                        tracing::warn!(session = %id, ?tag, error = %e, "dropping message");
                    }
                    Err(e) => {
                        tracing::error!(session = %id, ?tag, error = %e, "operation failed");
                    }
                }
            }
            Some(envelope) = inbox.recv() => {
                if !session.observe(&envelope) {
                    continue 'conn;
                }
                if let Err(e) = connection.send(&envelope.message).await {
                    tracing::warn!(session = %id, error = %e, "broadcast not delivered");
                    break 'conn;
                }
            }
        }
    }
    session.close().await;
}
