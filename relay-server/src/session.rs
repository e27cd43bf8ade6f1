//! The per-transport session: a read loop, a write loop, and the three
//! tickers the write loop multiplexes over. Generalizes the teacher's
//! `receive_logic_server`/`send_logic_server` task pair (one `tokio::spawn`
//! plus an inline loop, instead of two spawns raced with `tokio::select!`,
//! since only the write loop ends up owning the transport's write half).

use crate::config::Config;
use crate::transport::{ReadError, TransportReader, TransportWriter};
use protocol::{Addr, Message, MessageType, PlayerName};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Runs one session to completion: spawns the read loop, runs the write
/// loop inline, and on exit performs the full teardown sequence (write a
/// close frame, release the transport, tell the router, stop the tickers by
/// simply returning). Meant to be handed to `tokio::spawn` by the router.
pub async fn run_session(
    player_name: PlayerName,
    addr: Addr,
    reader: Box<dyn TransportReader>,
    writer: Box<dyn TransportWriter>,
    to_session_rx: mpsc::Receiver<Message>,
    to_router: mpsc::Sender<Message>,
    config: Arc<Config>,
    cancel: CancellationToken,
) {
    let read_active = Arc::new(AtomicBool::new(true));

    let mut read_task = tokio::spawn(read_loop(
        reader,
        player_name.clone(),
        addr.clone(),
        to_router.clone(),
        read_active.clone(),
        config.clone(),
    ));

    let reason = write_loop(
        writer,
        player_name.clone(),
        addr.clone(),
        to_session_rx,
        to_router,
        read_active,
        config,
        cancel,
    )
    .await;

    read_task.abort();
    tracing::info!(%player_name, %addr, reason, "session closed");
}

async fn read_loop(
    mut reader: Box<dyn TransportReader>,
    player_name: PlayerName,
    addr: Addr,
    to_router: mpsc::Sender<Message>,
    read_active: Arc<AtomicBool>,
    config: Arc<Config>,
) -> &'static str {
    let reason = loop {
        match reader.read_message(config.p_read()).await {
            Ok(mut message) => {
                if message.game.is_none() && message.kind != MessageType::SocketClose {
                    tracing::warn!(
                        %player_name, %addr, kind = ?message.kind,
                        "dropping frame: neither a game reference nor SocketClose"
                    );
                    break "protocol violation";
                }
                read_active.store(true, Ordering::SeqCst);
                message.player_name = player_name.clone();
                message.addr = addr.clone();
                if to_router.send(message).await.is_err() {
                    break "router channel closed";
                }
            }
            Err(ReadError::NormalClose) => break "peer closed normally",
            Err(ReadError::UnexpectedClose) => {
                tracing::warn!(%player_name, %addr, "peer vanished");
                break "peer vanished";
            }
            Err(ReadError::Protocol(detail)) => {
                tracing::warn!(%player_name, %addr, %detail, "malformed frame");
                break "protocol violation";
            }
        }
    };

    // The router tears down its own maps on receipt of this; harmless if it
    // arrives after the write loop already sent one of its own.
    let socket_close = Message::bare(MessageType::SocketClose)
        .for_player(player_name)
        .at_addr(addr);
    let _ = to_router.send(socket_close).await;
    reason
}

async fn write_loop(
    mut writer: Box<dyn TransportWriter>,
    player_name: PlayerName,
    addr: Addr,
    mut to_session_rx: mpsc::Receiver<Message>,
    to_router: mpsc::Sender<Message>,
    read_active: Arc<AtomicBool>,
    config: Arc<Config>,
    cancel: CancellationToken,
) -> &'static str {
    let mut ping_ticker = tokio::time::interval(config.p_ping());
    let mut http_ticker = tokio::time::interval(config.p_http());
    let mut idle_ticker = tokio::time::interval(config.p_idle());
    // The first tick of a freshly created interval fires immediately; that
    // would ping/warn/idle-check before any time has actually passed.
    ping_ticker.tick().await;
    http_ticker.tick().await;
    idle_ticker.tick().await;

    let reason: &'static str = loop {
        tokio::select! {
            _ = cancel.cancelled() => break "server shutting down",

            received = to_session_rx.recv() => {
                match received {
                    Some(message) => {
                        let remove_after = message.kind == MessageType::PlayerRemove;
                        if let Err(err) = writer.write_message(&message).await {
                            tracing::warn!(%player_name, %addr, %err, "write failed");
                            break "write error";
                        }
                        if remove_after {
                            break "removed by router";
                        }
                    }
                    None => break "removed by router",
                }
            }

            _ = ping_ticker.tick() => {
                if let Err(err) = writer.write_ping().await {
                    tracing::warn!(%player_name, %addr, %err, "ping failed");
                    break "write error";
                }
            }

            _ = http_ticker.tick() => {
                let keepalive = Message::bare(MessageType::SocketHTTPPing);
                if let Err(err) = writer.write_message(&keepalive).await {
                    tracing::warn!(%player_name, %addr, %err, "http keepalive failed");
                    break "write error";
                }
            }

            _ = idle_ticker.tick() => {
                if !read_active.swap(false, Ordering::SeqCst) {
                    break "closing due to inactivity";
                }
            }
        }
    };

    writer.write_close(reason).await;
    writer.close().await;

    let socket_close = Message::bare(MessageType::SocketClose)
        .for_player(player_name)
        .at_addr(addr);
    let _ = to_router.send(socket_close).await;

    reason
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::fake_transport;

    fn test_config() -> Arc<Config> {
        Arc::new(Config {
            max_sockets: 10,
            max_player_sockets: 4,
            max_games: 10,
            p_read_secs: 60,
            p_write_secs: 10,
            p_ping_secs: 20,
            p_idle_secs: 3600,
            p_http_secs: 3600,
            debug: false,
        })
    }

    #[tokio::test]
    async fn player_remove_drives_the_session_to_write_a_close_frame() {
        let (pending, mut driver) = fake_transport("addr-1");
        let (to_session_tx, to_session_rx) = mpsc::channel(8);
        let (to_router_tx, mut to_router_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(run_session(
            "alice".to_string(),
            "addr-1".to_string(),
            pending.reader,
            pending.writer,
            to_session_rx,
            to_router_tx,
            test_config(),
            cancel,
        ));

        to_session_tx
            .send(Message::bare(MessageType::PlayerRemove))
            .await
            .unwrap();

        // The router is told SocketClose exactly once, by the write loop's
        // own teardown (the read loop is still parked on an empty channel).
        let close_notice = to_router_rx.recv().await.unwrap();
        assert_eq!(close_notice.kind, MessageType::SocketClose);

        handle.await.unwrap();
        assert!(driver.is_closed());

        let mut saw_close_frame = false;
        while let Ok(frame) = driver.outbound.try_recv() {
            if matches!(frame, crate::transport::RecordedFrame::Close(_)) {
                saw_close_frame = true;
            }
        }
        assert!(saw_close_frame);
    }

    #[tokio::test]
    async fn dropping_a_frame_without_a_game_reference_tears_the_session_down() {
        let (pending, driver) = fake_transport("addr-1");
        let (_to_session_tx, to_session_rx) = mpsc::channel(8);
        let (to_router_tx, mut to_router_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();

        tokio::spawn(run_session(
            "alice".to_string(),
            "addr-1".to_string(),
            pending.reader,
            pending.writer,
            to_session_rx,
            to_router_tx,
            test_config(),
            cancel,
        ));

        driver
            .inbound
            .send(Message::bare(MessageType::GameChat))
            .await
            .unwrap();

        let close_notice = to_router_rx.recv().await.unwrap();
        assert_eq!(close_notice.kind, MessageType::SocketClose);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_ticker_closes_a_transport_that_never_sends() {
        let (pending, mut driver) = fake_transport("addr-1");
        let (_to_session_tx, to_session_rx) = mpsc::channel(8);
        let (to_router_tx, mut to_router_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();

        let mut config = (*test_config()).clone();
        config.p_idle_secs = 5;
        let config = Arc::new(config);

        tokio::spawn(run_session(
            "alice".to_string(),
            "addr-1".to_string(),
            pending.reader,
            pending.writer,
            to_session_rx,
            to_router_tx,
            config,
            cancel,
        ));

        // Never feed the driver's inbound channel: `readActive` stays false
        // across two full idle periods, which is what trips the close per
        // the idle-closure law (spec.md §8 scenario 5).
        tokio::time::advance(std::time::Duration::from_secs(11)).await;

        let close_notice = to_router_rx.recv().await.unwrap();
        assert_eq!(close_notice.kind, MessageType::SocketClose);

        let mut saw_reason = None;
        while let Ok(frame) = driver.outbound.try_recv() {
            if let crate::transport::RecordedFrame::Close(reason) = frame {
                saw_reason = Some(reason);
            }
        }
        assert_eq!(saw_reason.as_deref(), Some("closing due to inactivity"));
    }
}
