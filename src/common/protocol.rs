use serde::{Deserialize, Serialize};

use super::world::World;

pub type Username = String;
pub type Token = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Success,
    Failure,
}

/// Every message either side may put on the wire.
///
/// The enum is closed: the session matches it exhaustively, so a new variant
/// fails to compile until every handler accounts for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    Register { username: Username },
    Login { token: Token },
    LoginStatus { username: Username, token: Token, status: Status },
    NewWorld,
    JoinWorld { token: Token },
    ListWorlds,
    WorldList { worlds: Vec<Token> },
    WorldData { world: Option<World> },
    UpdateVoxel { index: u32, value: u8 },
    UserMove {
        username: Username,
        pos: [f32; 3],
        azimuth: f32,
        elevation: f32,
        vel: [f32; 3],
    },
    UserJoined { username: Username },
    UserLeft { username: Username },
    LeaveWorld,
}

/// Discriminant of a [`Message`], for logging without cloning payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageTag {
    Register,
    Login,
    LoginStatus,
    NewWorld,
    JoinWorld,
    ListWorlds,
    WorldList,
    WorldData,
    UpdateVoxel,
    UserMove,
    UserJoined,
    UserLeft,
    LeaveWorld,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
    Both,
}

impl Message {
    pub fn tag(&self) -> MessageTag {
        match self {
            Message::Register { .. } => MessageTag::Register,
            Message::Login { .. } => MessageTag::Login,
            Message::LoginStatus { .. } => MessageTag::LoginStatus,
            Message::NewWorld => MessageTag::NewWorld,
            Message::JoinWorld { .. } => MessageTag::JoinWorld,
            Message::ListWorlds => MessageTag::ListWorlds,
            Message::WorldList { .. } => MessageTag::WorldList,
            Message::WorldData { .. } => MessageTag::WorldData,
            Message::UpdateVoxel { .. } => MessageTag::UpdateVoxel,
            Message::UserMove { .. } => MessageTag::UserMove,
            Message::UserJoined { .. } => MessageTag::UserJoined,
            Message::UserLeft { .. } => MessageTag::UserLeft,
            Message::LeaveWorld => MessageTag::LeaveWorld,
        }
    }

    pub fn direction(&self) -> Direction {
        match self.tag() {
            MessageTag::Register
            | MessageTag::Login
            | MessageTag::NewWorld
            | MessageTag::JoinWorld
            | MessageTag::ListWorlds
            | MessageTag::LeaveWorld => Direction::ClientToServer,
            MessageTag::LoginStatus
            | MessageTag::WorldList
            | MessageTag::WorldData
            | MessageTag::UserJoined
            | MessageTag::UserLeft => Direction::ServerToClient,
            MessageTag::UpdateVoxel | MessageTag::UserMove => Direction::Both,
        }
    }

    pub fn login_failed() -> Self {
        Message::LoginStatus {
            username: String::new(),
            token: String::new(),
            status: Status::Failure,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("failed to encode message: {0}")]
    Encode(String),
    #[error("failed to decode message: {0}")]
    Decode(String),
}

/// Encodes a message as a single CBOR item. The variant name travels with
/// the payload, so frames are self-describing.
pub fn encode(message: &Message) -> Result<Vec<u8>, CodecError> {
    let mut buf = Vec::new();
    ciborium::into_writer(message, &mut buf).map_err(|e| CodecError::Encode(e.to_string()))?;
    Ok(buf)
}

pub fn decode(bytes: &[u8]) -> Result<Message, CodecError> {
    ciborium::from_reader(bytes).map_err(|e| CodecError::Decode(e.to_string()))
}
