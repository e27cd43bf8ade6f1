//! The game manager (C5), specified only at its boundary: create, delete,
//! and forward to whichever game a message names. The individual game's own
//! state machine is genuinely out of scope; `EchoGame` is the simplest task
//! that satisfies the trait this module forwards to, not a real game.

use protocol::{GameId, GameRef, GameStatus, Message, MessageType};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Runs the game manager to completion. Exits once `to_games` closes, after
/// every game task it ever spawned has also finished — the top-level
/// shutdown barrier waits on this function, so this function waits on them.
pub async fn run_game_manager(
    mut to_games: mpsc::Receiver<Message>,
    from_games: mpsc::Sender<Message>,
    max_games: u32,
    cancel: CancellationToken,
) {
    let mut games: HashMap<GameId, mpsc::Sender<Message>> = HashMap::new();
    let mut game_tasks: JoinSet<()> = JoinSet::new();
    let mut next_id: GameId = 1;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            message = to_games.recv() => {
                let Some(message) = message else { break };
                match message.kind {
                    MessageType::CreateGame => {
                        if games.len() as u32 >= max_games {
                            let error = Message::bare(MessageType::SocketError)
                                .for_player(message.player_name.clone())
                                .at_addr(message.addr.clone())
                                .with_info("game capacity exceeded");
                            let _ = from_games.send(error).await;
                            continue;
                        }
                        let game_id = next_id;
                        next_id += 1;
                        let (game_tx, game_rx) = mpsc::channel(protocol::CHANNEL_BUFFER_SIZE);
                        games.insert(game_id, game_tx.clone());
                        game_tasks.spawn(run_echo_game(game_id, game_rx, from_games.clone()));
                        let mut first = message;
                        first.game = Some(GameRef::with_status(game_id, GameStatus::NotStarted));
                        let _ = game_tx.send(first).await;
                    }
                    MessageType::DeleteGame => {
                        let Some(game_id) = message.game_id() else { continue };
                        if let Some(channel) = games.remove(&game_id) {
                            let _ = channel.send(message).await;
                        } else {
                            let error = Message::bare(MessageType::SocketError)
                                .for_player(message.player_name.clone())
                                .at_addr(message.addr.clone())
                                .with_info("no such game");
                            let _ = from_games.send(error).await;
                        }
                    }
                    _ => {
                        let Some(game_id) = message.game_id() else { continue };
                        match games.get(&game_id) {
                            Some(channel) => {
                                let _ = channel.send(message).await;
                            }
                            None => {
                                let error = Message::bare(MessageType::SocketError)
                                    .for_player(message.player_name.clone())
                                    .at_addr(message.addr.clone())
                                    .with_info("no such game");
                                let _ = from_games.send(error).await;
                            }
                        }
                    }
                }
            }
        }
    }

    // Drop every game's inbox so each `run_echo_game` sees its channel
    // close and exits on its own, then wait for all of them to actually do
    // so before this function — and so the process — returns.
    games.clear();
    while game_tasks.join_next().await.is_some() {}
}

/// An opaque stand-in for a real tile-game state machine: acknowledges
/// chat/tile-action messages with a harmless `GameInfos` nudge and answers
/// `DeleteGame` by announcing itself gone, then exits.
async fn run_echo_game(
    game_id: GameId,
    mut inbox: mpsc::Receiver<Message>,
    outbox: mpsc::Sender<Message>,
) {
    let mut players: HashMap<protocol::PlayerName, protocol::Addr> = HashMap::new();

    while let Some(message) = inbox.recv().await {
        match message.kind {
            MessageType::DeleteGame => {
                // The game's own exit evicts every transport that was
                // observing it before announcing itself gone, so the
                // router's `playerGames` entries for this game don't
                // outlive the game (spec.md §8 scenario 6).
                for (player_name, addr) in players.drain() {
                    let leave = Message::with_game(MessageType::LeaveGame, GameRef::of(game_id))
                        .for_player(player_name)
                        .at_addr(addr);
                    let _ = outbox.send(leave).await;
                }
                let snapshot = Message::with_game(
                    MessageType::GameInfos,
                    GameRef::with_status(game_id, GameStatus::Deleted),
                );
                let _ = outbox.send(snapshot).await;
                break;
            }
            MessageType::CreateGame | MessageType::JoinGame => {
                players.insert(message.player_name.clone(), message.addr.clone());
                // Confirm the (re-)join to the transport that asked, with
                // the game id it now observes. The router re-homes its
                // `playerGames` entry to this sender when this reaches it
                // back through the lobby's `fromLobby` path.
                let ack = Message::with_game(
                    MessageType::JoinGame,
                    GameRef::with_status(game_id, GameStatus::NotStarted),
                )
                .for_player(message.player_name.clone())
                .at_addr(message.addr.clone());
                let _ = outbox.send(ack).await;
            }
            _ => {
                // Every other game-bound message (chat, tile actions) is
                // acknowledged with a benign echo back to its own sender —
                // real combinatorics are out of scope.
                let ack = Message::with_game(message.kind, GameRef::of(game_id))
                    .for_player(message.player_name.clone())
                    .at_addr(message.addr.clone());
                let _ = outbox.send(ack).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_game_allocates_increasing_ids_and_rejects_over_capacity() {
        let (to_games_tx, to_games_rx) = mpsc::channel(8);
        let (from_games_tx, mut from_games_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        tokio::spawn(run_game_manager(to_games_rx, from_games_tx, 1, cancel));

        to_games_tx
            .send(
                Message::bare(MessageType::CreateGame)
                    .for_player("alice")
                    .at_addr("a1"),
            )
            .await
            .unwrap();
        let first = from_games_rx.recv().await.unwrap();
        assert_eq!(first.kind, MessageType::JoinGame);
        assert_eq!(first.game_id(), Some(1));

        to_games_tx
            .send(
                Message::bare(MessageType::CreateGame)
                    .for_player("bob")
                    .at_addr("b1"),
            )
            .await
            .unwrap();
        let rejected = from_games_rx.recv().await.unwrap();
        assert_eq!(rejected.kind, MessageType::SocketError);
        assert_eq!(rejected.player_name, "bob");
    }

    #[tokio::test]
    async fn delete_game_announces_deleted_status() {
        let (to_games_tx, to_games_rx) = mpsc::channel(8);
        let (from_games_tx, mut from_games_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        tokio::spawn(run_game_manager(to_games_rx, from_games_tx, 10, cancel));

        to_games_tx
            .send(
                Message::bare(MessageType::CreateGame)
                    .for_player("alice")
                    .at_addr("a1"),
            )
            .await
            .unwrap();
        let created = from_games_rx.recv().await.unwrap();
        let game_id = created.game_id().unwrap();

        to_games_tx
            .send(Message::with_game(MessageType::DeleteGame, GameRef::of(game_id)))
            .await
            .unwrap();

        let leave = from_games_rx.recv().await.unwrap();
        assert_eq!(leave.kind, MessageType::LeaveGame);
        assert_eq!(leave.player_name, "alice");
        assert_eq!(leave.addr, "a1");
        assert_eq!(leave.game_id(), Some(game_id));

        let deleted = from_games_rx.recv().await.unwrap();
        assert_eq!(deleted.kind, MessageType::GameInfos);
        assert_eq!(
            deleted.game.as_ref().and_then(|g| g.status),
            Some(GameStatus::Deleted)
        );
    }
}
