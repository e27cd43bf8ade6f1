//! Wire types shared between the session hub and anything that talks to it:
//! the message type tag set, the routed `Message` envelope, and the game
//! status / lobby snapshot types it carries.
//!
//! This crate knows nothing about channels, sockets, or the router's maps —
//! it only describes the JSON that goes over the wire.

use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};

/// Opaque player identifier. Real accounts are at most 32 lowercase letters,
/// but nothing in this crate relies on that; it is treated as an opaque key.
pub type PlayerName = String;

/// Opaque, per-process-unique identifier for one live transport.
pub type Addr = String;

/// Monotonically increasing positive integer allocated by the game manager.
pub type GameId = u64;

/// Default bounded capacity for the `mpsc` channels wiring the hub's
/// internal tasks together.
pub const CHANNEL_BUFFER_SIZE: usize = 64;

/// The closed set of message type tags, stable integers starting at 1.
///
/// Tags 16-18 (`SocketAdd`, `SocketClose`, `PlayerRemove`) never cross the
/// wire to a real client; they are synthesized internally by the session and
/// the router. They still need a wire-stable tag because the hub's own test
/// doubles serialize them the same way production transports do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum MessageType {
    CreateGame = 1,
    JoinGame = 2,
    LeaveGame = 3,
    DeleteGame = 4,
    GameChat = 5,
    RefreshGameBoard = 6,
    ChangeGameStatus = 7,
    ChangeGameTiles = 8,
    SnagGameTile = 9,
    SwapGameTile = 10,
    MoveGameTile = 11,
    GameInfos = 12,
    SocketWarning = 13,
    SocketError = 14,
    SocketHTTPPing = 15,
    SocketAdd = 16,
    SocketClose = 17,
    PlayerRemove = 18,
}

/// Lifecycle status of one game, as tracked by the lobby coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GameStatus {
    NotStarted,
    InProgress,
    Finished,
    Deleted,
}

/// A reference to one game, attached to a [`Message`]. `config`/`tiles` are
/// opaque to the hub — they are whatever the game itself chose to put there.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameRef {
    pub id: GameId,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub status: Option<GameStatus>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub config: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub tiles: Option<serde_json::Value>,
}

impl GameRef {
    pub fn of(id: GameId) -> Self {
        GameRef {
            id,
            status: None,
            config: None,
            tiles: None,
        }
    }

    pub fn with_status(id: GameId, status: GameStatus) -> Self {
        GameRef {
            id,
            status: Some(status),
            config: None,
            tiles: None,
        }
    }
}

/// One entry of a `GameInfos` snapshot list: a game's public lobby info.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameInfo {
    pub id: GameId,
    pub status: GameStatus,
    /// Players currently known to be seated at this game, for lobby display.
    #[serde(default)]
    pub players: Vec<PlayerName>,
}

/// The sole routed value. Field names on the wire are stable; `playerName`
/// and `addr` are internal routing fields and are never serialized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: MessageType,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub info: Option<String>,

    /// Who the message concerns. Set by the router on inbound messages;
    /// required on outbound ones. Never serialized.
    #[serde(skip, default)]
    pub player_name: PlayerName,

    /// Originating/targeted transport. Empty means "all sockets for
    /// `player_name`" or "broadcast". Never serialized.
    #[serde(skip, default)]
    pub addr: Addr,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub game: Option<GameRef>,

    /// Snapshot list, present only on `GameInfos` broadcasts.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub games: Option<Vec<GameInfo>>,
}

impl Message {
    /// A bare message with no `game`/`games`/`info` payload, addressed to
    /// nobody in particular yet — callers fill in `player_name`/`addr`.
    pub fn bare(kind: MessageType) -> Self {
        Message {
            kind,
            info: None,
            player_name: PlayerName::new(),
            addr: Addr::new(),
            game: None,
            games: None,
        }
    }

    pub fn with_game(kind: MessageType, game: GameRef) -> Self {
        Message {
            game: Some(game),
            ..Message::bare(kind)
        }
    }

    pub fn with_info(mut self, info: impl Into<String>) -> Self {
        self.info = Some(info.into());
        self
    }

    pub fn for_player(mut self, player_name: impl Into<PlayerName>) -> Self {
        self.player_name = player_name.into();
        self
    }

    pub fn at_addr(mut self, addr: impl Into<Addr>) -> Self {
        self.addr = addr.into();
        self
    }

    pub fn game_id(&self) -> Option<GameId> {
        self.game.as_ref().map(|g| g.id)
    }
}
