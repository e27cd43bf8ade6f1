//! The session router (C3): sole writer of the player/transport/game maps,
//! and sole dispatcher of every routed message. A plain `tokio::spawn`'d
//! loop owning un-shared `HashMap`s, in the spirit of the teacher's
//! channel-owned `Room`/`AppState` rather than a lock-everything design.

use crate::config::Config;
use crate::errors::AdmitError;
use crate::session::run_session;
use crate::transport::PendingTransport;
use protocol::{Addr, GameId, GameRef, Message, MessageType, PlayerName};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// An out-of-band control request from the HTTP admission path, per §6.3.
pub enum AdminRequest {
    AddSocket {
        player_name: PlayerName,
        transport: PendingTransport,
        reply: oneshot::Sender<Result<(), AdmitError>>,
    },
    PlayerRemove {
        player_name: PlayerName,
    },
    /// A read-only quota precheck the admission handler runs before it
    /// commits to upgrading the connection; it mutates nothing, so a pass
    /// here is advisory — `AddSocket` after the real upgrade is still the
    /// authoritative, state-mutating check.
    CheckQuota {
        player_name: PlayerName,
        reply: oneshot::Sender<Result<(), AdmitError>>,
    },
}

struct RouterState {
    /// playerName -> addr -> write-channel to that session. I1/I2.
    player_transports: HashMap<PlayerName, HashMap<Addr, mpsc::Sender<Message>>>,
    /// playerName -> gameId -> addr. I3/I4.
    player_games: HashMap<PlayerName, HashMap<GameId, Addr>>,
}

impl RouterState {
    fn new() -> Self {
        RouterState {
            player_transports: HashMap::new(),
            player_games: HashMap::new(),
        }
    }

    fn total_sockets(&self) -> usize {
        self.player_transports.values().map(|m| m.len()).sum()
    }

    fn player_sockets(&self, player_name: &str) -> usize {
        self.player_transports
            .get(player_name)
            .map(|m| m.len())
            .unwrap_or(0)
    }

    fn channel_for(&self, player_name: &str, addr: &str) -> Option<&mpsc::Sender<Message>> {
        self.player_transports.get(player_name)?.get(addr)
    }
}

/// Runs the router to completion. Exits only once the cancellation token
/// fires and every spawned session has drained.
///
/// `from_sessions_tx` is never sent on by the router itself; it exists so a
/// clone can be handed to each newly admitted session (the router is the
/// only place new sessions are spawned from).
pub async fn run_router(
    mut from_lobby: mpsc::Receiver<Message>,
    mut from_admin: mpsc::Receiver<AdminRequest>,
    mut from_sessions: mpsc::Receiver<Message>,
    from_sessions_tx: mpsc::Sender<Message>,
    to_lobby: mpsc::Sender<Message>,
    config: Arc<Config>,
    cancel: CancellationToken,
) {
    let mut state = RouterState::new();
    let mut sessions: JoinSet<()> = JoinSet::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            Some(message) = from_lobby.recv() => {
                handle_from_lobby(&mut state, message, &config);
            }

            Some(request) = from_admin.recv() => {
                handle_admin_request(
                    &mut state,
                    request,
                    &config,
                    &mut sessions,
                    &from_sessions_tx,
                    &to_lobby,
                    &cancel,
                ).await;
            }

            Some(message) = from_sessions.recv() => {
                handle_from_sessions(&mut state, message, &to_lobby, &config).await;
            }

            else => break,
        }
    }

    // Cancellation drain (§5): synthesize PlayerRemove for every player by
    // simply dropping every write-channel we hold, then wait for sessions.
    state.player_transports.clear();
    state.player_games.clear();
    while sessions.join_next().await.is_some() {}
    drop(to_lobby);
}

fn handle_from_lobby(state: &mut RouterState, message: Message, config: &Config) {
    if config.debug {
        tracing::debug!(kind = ?message.kind, "routing from lobby");
    }
    match message.kind {
        MessageType::GameInfos if !message.addr.is_empty() => {
            let player_name = message.player_name.clone();
            let addr = message.addr.clone();
            deliver_to_one(state, &player_name, &addr, message);
        }
        MessageType::GameInfos => {
            broadcast_to_all(state, message);
        }
        MessageType::SocketError if message.game.is_some() => {
            route_ordinary(state, message);
        }
        MessageType::SocketError => {
            let player_name = message.player_name.clone();
            deliver_to_player(state, &player_name, message);
        }
        MessageType::LeaveGame => {
            let player_name = message.player_name.clone();
            if let Some(game_id) = message.game_id() {
                let addr = state
                    .player_games
                    .get(&player_name)
                    .and_then(|games| games.get(&game_id))
                    .cloned();
                if let Some(addr) = addr {
                    deliver_to_one(state, &player_name, &addr, message);
                }
                if let Some(games) = state.player_games.get_mut(&player_name) {
                    games.remove(&game_id);
                    if games.is_empty() {
                        state.player_games.remove(&player_name);
                    }
                }
            }
        }
        _ => route_ordinary(state, message),
    }
}

fn route_ordinary(state: &mut RouterState, message: Message) {
    let Some(game_id) = message.game_id() else {
        tracing::warn!(kind = ?message.kind, "dropping lobby message with no game reference");
        return;
    };
    let player_name = message.player_name.clone();
    let msg_addr = message.addr.clone();

    if message.kind == MessageType::JoinGame {
        pre_route_join(state, &player_name, game_id, &msg_addr);
    }

    let Some(games) = state.player_games.get(&player_name) else {
        tracing::debug!(%player_name, "player not in any game, dropping");
        return;
    };
    let Some(addr) = games.get(&game_id).cloned() else {
        tracing::debug!(%player_name, game_id, "not in that game, dropping");
        return;
    };
    deliver_to_one(state, &player_name, &addr, message);
}

/// JoinGame's pre-routing: evict the old occupant, re-home the transport.
fn pre_route_join(state: &mut RouterState, player_name: &str, game_id: GameId, addr: &str) {
    let current = state
        .player_games
        .get(player_name)
        .and_then(|games| games.get(&game_id))
        .cloned();

    if current.as_deref() == Some(addr) {
        return; // idempotent join
    }

    if let Some(previous_addr) = current {
        let leave = Message {
            game: Some(GameRef::of(game_id)),
            ..Message::bare(MessageType::LeaveGame)
                .for_player(player_name)
                .at_addr(previous_addr.clone())
        };
        deliver_to_one(state, player_name, &previous_addr, leave);
    }

    // If this addr was already observing a different game, vacate it (I4).
    if let Some(games) = state.player_games.get_mut(player_name) {
        games.retain(|_, a| a != addr);
    }

    state
        .player_games
        .entry(player_name.to_string())
        .or_default()
        .insert(game_id, addr.to_string());
}

fn deliver_to_one(state: &mut RouterState, player_name: &str, addr: &str, message: Message) {
    let Some(channel) = state.channel_for(player_name, addr) else {
        tracing::warn!(%player_name, %addr, "map-invariant breach: no channel for addr");
        return;
    };
    if channel.try_send(message).is_err() {
        tracing::warn!(%player_name, %addr, "session channel full or closed, dropping");
    }
}

fn deliver_to_player(state: &mut RouterState, player_name: &str, message: Message) {
    let Some(transports) = state.player_transports.get(player_name) else {
        return;
    };
    for (addr, channel) in transports {
        if channel.try_send(message.clone()).is_err() {
            tracing::warn!(%player_name, %addr, "session channel full or closed, dropping");
        }
    }
}

fn broadcast_to_all(state: &mut RouterState, message: Message) {
    for (player_name, transports) in &state.player_transports {
        for (addr, channel) in transports {
            if channel.try_send(message.clone()).is_err() {
                tracing::warn!(%player_name, %addr, "session channel full or closed, dropping");
            }
        }
    }
}

async fn handle_from_sessions(
    state: &mut RouterState,
    message: Message,
    to_lobby: &mpsc::Sender<Message>,
    config: &Config,
) {
    if config.debug {
        tracing::debug!(kind = ?message.kind, player_name = %message.player_name, "routing from session");
    }

    if !state
        .player_transports
        .get(&message.player_name)
        .is_some_and(|m| m.contains_key(&message.addr))
    {
        tracing::warn!(player_name = %message.player_name, addr = %message.addr, "message from unregistered (player, addr), dropping");
        return;
    }

    if message.game.is_none() && message.kind != MessageType::SocketClose {
        tracing::warn!(kind = ?message.kind, "session message missing game reference, dropping");
        return;
    }

    let exempt = matches!(
        message.kind,
        MessageType::CreateGame
            | MessageType::JoinGame
            | MessageType::SocketClose
            | MessageType::LeaveGame
    );
    if !exempt {
        let in_game = message.game_id().is_some_and(|game_id| {
            state
                .player_games
                .get(&message.player_name)
                .and_then(|games| games.get(&game_id))
                .is_some_and(|addr| addr == &message.addr)
        });
        if !in_game {
            tracing::warn!(
                player_name = %message.player_name, addr = %message.addr,
                "message for a game the transport is not observing, dropping"
            );
            return;
        }
    }

    match message.kind {
        MessageType::SocketClose => {
            remove_transport(state, &message.player_name, &message.addr);
        }
        MessageType::LeaveGame => {
            if let Some(game_id) = message.game_id() {
                if let Some(games) = state.player_games.get_mut(&message.player_name) {
                    games.remove(&game_id);
                    if games.is_empty() {
                        state.player_games.remove(&message.player_name);
                    }
                }
            }
        }
        _ => {
            if to_lobby.send(message).await.is_err() {
                tracing::warn!("lobby channel closed while routing session message");
            }
        }
    }
}

fn remove_transport(state: &mut RouterState, player_name: &str, addr: &str) {
    if let Some(transports) = state.player_transports.get_mut(player_name) {
        transports.remove(addr);
        if transports.is_empty() {
            state.player_transports.remove(player_name);
        }
    }
    if let Some(games) = state.player_games.get_mut(player_name) {
        games.retain(|_, a| a != addr);
        if games.is_empty() {
            state.player_games.remove(player_name);
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_admin_request(
    state: &mut RouterState,
    request: AdminRequest,
    config: &Config,
    sessions: &mut JoinSet<()>,
    from_sessions_tx: &mpsc::Sender<Message>,
    to_lobby: &mpsc::Sender<Message>,
    cancel: &CancellationToken,
) {
    match request {
        AdminRequest::AddSocket {
            player_name,
            transport,
            reply,
        } => match admit(state, &player_name, &transport.addr, config) {
            Ok(()) => {
                let (to_session_tx, to_session_rx) = mpsc::channel(protocol::CHANNEL_BUFFER_SIZE);
                state
                    .player_transports
                    .entry(player_name.clone())
                    .or_default()
                    .insert(transport.addr.clone(), to_session_tx);

                let _ = reply.send(Ok(()));

                // Bootstrap the new transport with the current game list; a
                // request, not a push, so the lobby answers it the same way
                // it answers any other `GameInfos` ask.
                let bootstrap = Message::bare(MessageType::GameInfos)
                    .for_player(player_name.clone())
                    .at_addr(transport.addr.clone());
                if to_lobby.send(bootstrap).await.is_err() {
                    tracing::warn!("lobby channel closed while bootstrapping new transport");
                }

                sessions.spawn(run_session(
                    player_name,
                    transport.addr,
                    transport.reader,
                    transport.writer,
                    to_session_rx,
                    from_sessions_tx.clone(),
                    Arc::new(config.clone()),
                    cancel.clone(),
                ));
            }
            Err(err) => {
                let _ = reply.send(Err(err));
            }
        },
        AdminRequest::PlayerRemove { player_name } => {
            state.player_transports.remove(&player_name);
            state.player_games.remove(&player_name);
        }
        AdminRequest::CheckQuota { player_name, reply } => {
            let _ = reply.send(check_quota(state, &player_name, config));
        }
    }
}

fn check_quota(state: &RouterState, player_name: &str, config: &Config) -> Result<(), AdmitError> {
    if player_name.is_empty() {
        return Err(AdmitError::EmptyPlayerName);
    }
    if state.total_sockets() >= config.max_sockets as usize {
        return Err(AdmitError::Quota);
    }
    if state.player_sockets(player_name) >= config.max_player_sockets as usize {
        return Err(AdmitError::PlayerQuota);
    }
    Ok(())
}

fn admit(
    state: &RouterState,
    player_name: &str,
    addr: &str,
    config: &Config,
) -> Result<(), AdmitError> {
    check_quota(state, player_name, config)?;
    if state
        .player_transports
        .get(player_name)
        .is_some_and(|m| m.contains_key(addr))
    {
        return Err(AdmitError::DuplicateAddr(addr.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::fake_transport;

    fn test_config() -> Arc<Config> {
        Arc::new(Config {
            max_sockets: 2,
            max_player_sockets: 2,
            max_games: 10,
            p_read_secs: 60,
            p_write_secs: 10,
            p_ping_secs: 20,
            p_idle_secs: 3600,
            p_http_secs: 3600,
            debug: false,
        })
    }

    struct Harness {
        to_lobby_rx: mpsc::Receiver<Message>,
        from_lobby_tx: mpsc::Sender<Message>,
        from_admin_tx: mpsc::Sender<AdminRequest>,
        from_sessions_tx: mpsc::Sender<Message>,
        _cancel: CancellationToken,
    }

    fn spawn_router() -> Harness {
        let (from_lobby_tx, from_lobby_rx) = mpsc::channel(32);
        let (from_admin_tx, from_admin_rx) = mpsc::channel(32);
        let (from_sessions_tx, from_sessions_rx) = mpsc::channel(32);
        let (to_lobby_tx, to_lobby_rx) = mpsc::channel(32);
        let cancel = CancellationToken::new();

        tokio::spawn(run_router(
            from_lobby_rx,
            from_admin_rx,
            from_sessions_rx,
            from_sessions_tx.clone(),
            to_lobby_tx,
            test_config(),
            cancel.clone(),
        ));

        Harness {
            to_lobby_rx,
            from_lobby_tx,
            from_admin_tx,
            from_sessions_tx,
            _cancel: cancel,
        }
    }

    async fn add_socket(
        harness: &Harness,
        player_name: &str,
        addr: &str,
    ) -> Result<crate::transport::FakeTransportDriver, AdmitError> {
        let (transport, driver) = fake_transport(addr);
        let (reply_tx, reply_rx) = oneshot::channel();
        harness
            .from_admin_tx
            .send(AdminRequest::AddSocket {
                player_name: player_name.to_string(),
                transport,
                reply: reply_tx,
            })
            .await
            .unwrap();
        reply_rx.await.unwrap().map(|()| driver)
    }

    #[tokio::test]
    async fn third_socket_over_quota_is_rejected() {
        let harness = spawn_router();
        assert!(add_socket(&harness, "alice", "a1").await.is_ok());
        assert!(add_socket(&harness, "alice", "a2").await.is_ok());
        let third = add_socket(&harness, "alice", "a3").await;
        assert_eq!(third.err(), Some(AdmitError::PlayerQuota));
    }

    #[tokio::test]
    async fn join_game_steals_the_game_from_a_second_transport() {
        // JoinGame reaches the router authoritatively via `fromLobby` (the
        // game manager approved it); that's what triggers the eviction
        // logic in §4.3.3, not the client's original request on
        // `fromSessions`.
        let harness = spawn_router();
        let mut a1 = add_socket(&harness, "alice", "a1").await.unwrap();
        let mut a2 = add_socket(&harness, "alice", "a2").await.unwrap();

        harness
            .from_lobby_tx
            .send(
                Message::with_game(MessageType::JoinGame, GameRef::of(1))
                    .for_player("alice")
                    .at_addr("a1"),
            )
            .await
            .unwrap();
        let joined = a1.outbound.recv().await.unwrap();
        assert!(matches!(
            joined,
            crate::transport::RecordedFrame::Message(m) if m.kind == MessageType::JoinGame
        ));

        harness
            .from_lobby_tx
            .send(
                Message::with_game(MessageType::JoinGame, GameRef::of(1))
                    .for_player("alice")
                    .at_addr("a2"),
            )
            .await
            .unwrap();

        let evicted = a1.outbound.recv().await.unwrap();
        assert!(matches!(
            evicted,
            crate::transport::RecordedFrame::Message(m) if m.kind == MessageType::LeaveGame
        ));
        let joined_a2 = a2.outbound.recv().await.unwrap();
        assert!(matches!(
            joined_a2,
            crate::transport::RecordedFrame::Message(m) if m.kind == MessageType::JoinGame
        ));
    }
}
