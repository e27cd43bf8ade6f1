//! Structured error kinds the teacher's flat `Result<_, String>` can't
//! express: callers branch on these, so they need real variants.

use std::time::Duration;
use thiserror::Error;

/// Failure of an `AddSocket` admission request. Never mutates router state.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AdmitError {
    #[error("player name must not be empty")]
    EmptyPlayerName,
    #[error("global socket quota exceeded")]
    Quota,
    #[error("per-player socket quota exceeded")]
    PlayerQuota,
    #[error("websocket upgrade was not requested")]
    Upgrade,
    #[error("duplicate transport address {0} (this should be impossible)")]
    DuplicateAddr(String),
}

/// Failure loading or validating the hub's configuration. Fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("P_ping ({ping:?}) must be strictly less than P_read ({read:?})")]
    PingNotBelowRead { ping: Duration, read: Duration },
    #[error("{field} must be a strictly positive duration")]
    NonPositiveDuration { field: &'static str },
    #[error("MaxSockets ({max_sockets}) must be >= MaxPlayerSockets ({max_player_sockets})")]
    SocketCapBelowPlayerCap {
        max_sockets: u32,
        max_player_sockets: u32,
    },
    #[error("MaxPlayerSockets must be >= 1")]
    PlayerSocketCapZero,
    #[error("MaxGames must be >= 1")]
    MaxGamesZero,
}
