//! The lobby coordinator (C4): the event loop layered above the router. It
//! caches every game's latest info snapshot, rebroadcasts the sorted list on
//! any change, and is where admin requests (AddSocket/PlayerRemove) are
//! translated onto the router's `fromAdmin` channel.

use crate::router::AdminRequest;
use protocol::{GameId, GameInfo, Message, MessageType};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Runs the lobby to completion. On cancellation, closes `to_games` before
/// `to_router`, per the ordered-shutdown rule in §4.4.
///
/// Admin requests (AddSocket/PlayerRemove) pass through `from_admin` to
/// `to_router_admin` with their reply channels threaded unchanged; the
/// lobby is purely a relay for them, not a participant in their logic.
pub async fn run_lobby(
    mut from_games: mpsc::Receiver<Message>,
    mut from_router: mpsc::Receiver<Message>,
    mut from_admin: mpsc::Receiver<AdminRequest>,
    to_router: mpsc::Sender<Message>,
    to_games: mpsc::Sender<Message>,
    to_router_admin: mpsc::Sender<AdminRequest>,
    cancel: CancellationToken,
) {
    let mut games: HashMap<GameId, GameInfo> = HashMap::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            Some(message) = from_games.recv() => {
                handle_game_output(&mut games, message, &to_router).await;
            }

            Some(message) = from_router.recv() => {
                if message.kind == MessageType::GameInfos {
                    // The bootstrap request the admission path posts right
                    // after AddSocket (§4.3.2): answer it straight from the
                    // cache, targeted at the asking transport, rather than
                    // forwarding it on to a game manager that has no idea
                    // what a bare `GameInfos` ask even means.
                    reply_with_snapshot(&games, &message, &to_router).await;
                } else if to_games.send(message).await.is_err() {
                    tracing::warn!("game manager channel closed while forwarding a router message");
                }
            }

            Some(request) = from_admin.recv() => {
                if to_router_admin.send(request).await.is_err() {
                    tracing::warn!("router admin channel closed");
                }
            }

            else => break,
        }
    }

    drop(to_games);
    drop(to_router);
}

/// Answers a bootstrap `GameInfos` ask with the current sorted snapshot,
/// targeted at the same (playerName, addr) the ask came in on.
async fn reply_with_snapshot(
    games: &HashMap<GameId, GameInfo>,
    request: &Message,
    to_router: &mpsc::Sender<Message>,
) {
    let mut sorted: Vec<GameInfo> = games.values().cloned().collect();
    sorted.sort_by_key(|g| g.id);

    let mut reply = Message::bare(MessageType::GameInfos)
        .for_player(request.player_name.clone())
        .at_addr(request.addr.clone());
    reply.games = Some(sorted);
    if to_router.send(reply).await.is_err() {
        tracing::warn!("router channel closed while answering a GameInfos bootstrap request");
    }
}

async fn handle_game_output(
    games: &mut HashMap<GameId, GameInfo>,
    message: Message,
    to_router: &mpsc::Sender<Message>,
) {
    if message.kind != MessageType::GameInfos {
        if to_router.send(message).await.is_err() {
            tracing::warn!("router channel closed while forwarding game output");
        }
        return;
    }

    let Some(game) = message.game.as_ref() else {
        tracing::error!(
            player_name = %message.player_name,
            "GameInfos with no game payload and no playerName carries no actionable change"
        );
        return;
    };

    match game.status {
        Some(protocol::GameStatus::Deleted) => {
            games.remove(&game.id);
        }
        status => {
            let existing_players = games.get(&game.id).map(|g| g.players.clone()).unwrap_or_default();
            games.insert(
                game.id,
                GameInfo {
                    id: game.id,
                    status: status.unwrap_or(protocol::GameStatus::NotStarted),
                    players: message
                        .games
                        .as_ref()
                        .and_then(|list| list.iter().find(|g| g.id == game.id))
                        .map(|g| g.players.clone())
                        .unwrap_or(existing_players),
                },
            );
        }
    }

    let mut sorted: Vec<GameInfo> = games.values().cloned().collect();
    sorted.sort_by_key(|g| g.id);

    let mut broadcast = Message::bare(MessageType::GameInfos);
    broadcast.games = Some(sorted);
    if to_router.send(broadcast).await.is_err() {
        tracing::warn!("router channel closed while broadcasting game infos");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::GameRef;
    use protocol::GameStatus;

    #[tokio::test]
    async fn game_deletion_removes_it_from_the_broadcast_list() {
        let (from_games_tx, from_games_rx) = mpsc::channel(8);
        let (_from_router_tx, from_router_rx) = mpsc::channel(8);
        let (_from_admin_tx, from_admin_rx) = mpsc::channel::<AdminRequest>(8);
        let (to_router_tx, mut to_router_rx) = mpsc::channel(8);
        let (to_games_tx, _to_games_rx) = mpsc::channel(8);
        let (to_router_admin_tx, _to_router_admin_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();

        tokio::spawn(run_lobby(
            from_games_rx,
            from_router_rx,
            from_admin_rx,
            to_router_tx,
            to_games_tx,
            to_router_admin_tx,
            cancel,
        ));

        from_games_tx
            .send(Message::with_game(
                MessageType::GameInfos,
                GameRef::with_status(7, GameStatus::InProgress),
            ))
            .await
            .unwrap();
        let first = to_router_rx.recv().await.unwrap();
        assert_eq!(first.games.unwrap().len(), 1);

        from_games_tx
            .send(Message::with_game(
                MessageType::GameInfos,
                GameRef::with_status(7, GameStatus::Deleted),
            ))
            .await
            .unwrap();
        let second = to_router_rx.recv().await.unwrap();
        assert!(second.games.unwrap().is_empty());
    }

    #[tokio::test]
    async fn bootstrap_request_is_answered_from_the_cache_not_forwarded_to_games() {
        let (from_games_tx, from_games_rx) = mpsc::channel(8);
        let (from_router_tx, from_router_rx) = mpsc::channel(8);
        let (_from_admin_tx, from_admin_rx) = mpsc::channel::<AdminRequest>(8);
        let (to_router_tx, mut to_router_rx) = mpsc::channel(8);
        let (to_games_tx, mut to_games_rx) = mpsc::channel(8);
        let (to_router_admin_tx, _to_router_admin_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();

        tokio::spawn(run_lobby(
            from_games_rx,
            from_router_rx,
            from_admin_rx,
            to_router_tx,
            to_games_tx,
            to_router_admin_tx,
            cancel,
        ));

        from_games_tx
            .send(Message::with_game(
                MessageType::GameInfos,
                GameRef::with_status(1, GameStatus::InProgress),
            ))
            .await
            .unwrap();
        to_router_rx.recv().await.unwrap();

        from_router_tx
            .send(
                Message::bare(MessageType::GameInfos)
                    .for_player("alice")
                    .at_addr("a1"),
            )
            .await
            .unwrap();

        let reply = to_router_rx.recv().await.unwrap();
        assert_eq!(reply.player_name, "alice");
        assert_eq!(reply.addr, "a1");
        assert_eq!(reply.games.unwrap().len(), 1);
        assert!(to_games_rx.try_recv().is_err());
    }
}
