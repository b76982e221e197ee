use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use tokio::time::timeout;

use voxel_commons::common::protocol::{Direction, Message, Status};
use voxel_commons::transport::{connect_websocket, ClientSocket, Connection, Transport};

const REPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// Request/reply view of a server connection. Broadcasts that arrive while
/// waiting for a reply are queued for [`ServerLink::next_broadcast`].
pub struct ServerLink<T> {
    connection: Connection<T>,
    pending: Vec<Message>,
}

pub async fn connect(server_address: &str) -> anyhow::Result<ServerLink<ClientSocket>> {
    let connection = connect_websocket(server_address)
        .await
        .with_context(|| format!("connecting to {}", server_address))?;
    Ok(ServerLink::new(connection))
}

impl<T: Transport> ServerLink<T> {
    pub fn new(connection: Connection<T>) -> Self {
        ServerLink {
            connection,
            pending: Vec::new(),
        }
    }

    pub async fn send(&mut self, message: &Message) -> anyhow::Result<()> {
        self.connection.send(message).await?;
        Ok(())
    }

    /// Sends `message` and waits for the first inbound message accepted by
    /// `is_reply`.
    pub async fn request<F>(&mut self, message: &Message, is_reply: F) -> anyhow::Result<Message>
    where
        F: Fn(&Message) -> bool,
    {
        self.send(message).await?;
        loop {
            let inbound = timeout(REPLY_TIMEOUT, self.recv_from_server())
                .await
                .map_err(|_| anyhow!("no reply to {:?} within {:?}", message.tag(), REPLY_TIMEOUT))?;
            match inbound? {
                None => bail!("server closed the connection"),
                Some(reply) if is_reply(&reply) => return Ok(reply),
                Some(other) => self.pending.push(other),
            }
        }
    }

    /// Register `username`; returns the new token.
    pub async fn register(&mut self, username: &str) -> anyhow::Result<String> {
        let reply = self
            .request(&Message::Register { username: username.to_string() }, is_login_status)
            .await?;
        match reply {
            Message::LoginStatus { token, status: Status::Success, .. } => Ok(token),
            _ => bail!("registration of {} failed", username),
        }
    }

    /// Log in with `token`; returns the username it belongs to.
    pub async fn login(&mut self, token: &str) -> anyhow::Result<String> {
        let reply = self
            .request(&Message::Login { token: token.to_string() }, is_login_status)
            .await?;
        match reply {
            Message::LoginStatus { username, status: Status::Success, .. } => Ok(username),
            _ => bail!("unknown token"),
        }
    }

    /// Waits until every earlier message has been handled by the server.
    /// Sessions process messages in order, so one answered ListWorlds is
    /// enough.
    pub async fn sync(&mut self) -> anyhow::Result<Vec<String>> {
        match self.request(&Message::ListWorlds, is_world_list).await? {
            Message::WorldList { worlds } => Ok(worlds),
            other => bail!("unexpected reply {:?}", other.tag()),
        }
    }

    /// Next routed message from other players, or `None` once closed.
    pub async fn next_broadcast(&mut self) -> anyhow::Result<Option<Message>> {
        if !self.pending.is_empty() {
            return Ok(Some(self.pending.remove(0)));
        }
        self.recv_from_server().await
    }

    /// Next well-formed message a server may send. Undecodable frames and
    /// client-only messages are logged and skipped.
    async fn recv_from_server(&mut self) -> anyhow::Result<Option<Message>> {
        loop {
            match self.connection.recv().await {
                None => return Ok(None),
                Some(Err(e)) if e.is_bad_frame() => tracing::warn!(error = %e, "skipping bad frame"),
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(message)) if message.direction() == Direction::ClientToServer => {
                    tracing::warn!(tag = ?message.tag(), "skipping client-only message from server");
                }
                Some(Ok(message)) => return Ok(Some(message)),
            }
        }
    }
}

pub fn is_login_status(message: &Message) -> bool {
    matches!(message, Message::LoginStatus { .. })
}

pub fn is_world_list(message: &Message) -> bool {
    matches!(message, Message::WorldList { .. })
}

pub fn is_world_data(message: &Message) -> bool {
    matches!(message, Message::WorldData { .. })
}
