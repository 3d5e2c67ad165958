use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket, close_code};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::error::TransportError;
use crate::registry::SessionLink;
use crate::router::{ActionRouter, protocol_error};
use crate::session::{Session, SessionState};

/// Consecutive unanswered Pings before the connection is dropped.
const MAX_MISSED_PONGS: u8 = 2;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// How often the writer sends a Ping.
    pub heartbeat_interval: Duration,
    /// Upper bound on a single socket write, and on the drain at close.
    pub write_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(54),
            write_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug)]
enum CloseReason {
    ClientClosed,
    StreamEnded,
    ReadError(axum::Error),
    Cancelled,
    WriterStopped,
}

#[derive(Debug)]
enum WriterExit {
    Cancelled,
    QueueClosed,
    HeartbeatTimeout,
    Failed(TransportError),
}

/// Run one authenticated connection until it closes.
///
/// The token was verified during the upgrade, so `session` arrives in
/// `Connecting`. The socket is split: a spawned writer owns the sink and
/// is the only task that writes to it; this task reads frames one at a
/// time and awaits the router for each before reading the next.
pub async fn serve_session(
    socket: WebSocket,
    mut session: Session,
    router: ActionRouter,
    config: GatewayConfig,
) {
    let registry = router.registry().clone();

    session.transition(SessionState::Authenticated);
    let SessionLink { outbound, cancel } = registry.register(&session).await;
    session.transition(SessionState::Active);

    info!(
        "{} ({}) connected as session {}",
        session.email,
        session.user_id(),
        session.id
    );

    let (sink, mut stream) = socket.split();

    let pong_received = Arc::new(AtomicBool::new(true));
    let mut writer = tokio::spawn(write_loop(
        sink,
        outbound,
        cancel.clone(),
        pong_received.clone(),
        config.clone(),
        session.id,
    ));
    let mut writer_exit = None;

    let reason = loop {
        tokio::select! {
            _ = cancel.cancelled() => break CloseReason::Cancelled,
            exit = &mut writer => {
                writer_exit = Some(exit);
                break CloseReason::WriterStopped;
            }
            msg = stream.next() => match msg {
                None => break CloseReason::StreamEnded,
                Some(Err(e)) => break CloseReason::ReadError(e),
                Some(Ok(Message::Text(text))) => {
                    router.handle_text(&session, text.as_str()).await;
                }
                Some(Ok(Message::Binary(data))) => {
                    debug!("Session {} sent {} binary bytes", session.id, data.len());
                    let reply = protocol_error(&session, "binary frames are not supported");
                    registry.deliver(reply.target, &reply.envelope).await;
                }
                Some(Ok(Message::Pong(_))) => {
                    pong_received.store(true, Ordering::Release);
                }
                Some(Ok(Message::Close(frame))) => {
                    trace!("Session {} close frame: {:?}", session.id, frame);
                    break CloseReason::ClientClosed;
                }
                Some(Ok(Message::Ping(_))) => {}
            }
        }
    };

    session.transition(SessionState::Closing);
    registry.unregister(session.id).await;

    let writer_exit = match writer_exit {
        Some(exit) => exit.ok(),
        None => {
            // The writer drains for at most one write timeout after cancel.
            let abort = writer.abort_handle();
            match tokio::time::timeout(config.write_timeout * 2, writer).await {
                Ok(Ok(exit)) => Some(exit),
                Ok(Err(e)) => {
                    warn!("Session {} writer task failed: {}", session.id, e);
                    None
                }
                Err(_) => {
                    warn!("Session {} writer did not stop in time, aborting", session.id);
                    abort.abort();
                    None
                }
            }
        }
    };

    session.transition(SessionState::Closed);
    info!(
        "{} ({}) session {} closed: {:?}, writer: {:?}",
        session.email,
        session.user_id(),
        session.id,
        reason,
        writer_exit
    );
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<Utf8Bytes>,
    cancel: CancellationToken,
    pong_received: Arc<AtomicBool>,
    config: GatewayConfig,
    session_id: Uuid,
) -> WriterExit {
    let mut heartbeat = tokio::time::interval(config.heartbeat_interval);
    heartbeat.tick().await;
    let mut missed_pongs: u8 = 0;

    let exit = loop {
        tokio::select! {
            _ = cancel.cancelled() => break WriterExit::Cancelled,
            frame = outbound.recv() => {
                let Some(frame) = frame else {
                    break WriterExit::QueueClosed;
                };
                if let Err(e) = write_frame(&mut sink, Message::Text(frame), config.write_timeout).await {
                    break WriterExit::Failed(e);
                }
            }
            _ = heartbeat.tick() => {
                if pong_received.swap(false, Ordering::AcqRel) {
                    missed_pongs = 0;
                } else {
                    missed_pongs += 1;
                    if missed_pongs >= MAX_MISSED_PONGS {
                        warn!(
                            "Session {} missed {} pongs, dropping connection",
                            session_id, missed_pongs
                        );
                        break WriterExit::HeartbeatTimeout;
                    }
                }
                if let Err(e) = write_frame(&mut sink, Message::Ping(Bytes::new()), config.write_timeout).await {
                    break WriterExit::Failed(e);
                }
            }
        }
    };

    if let WriterExit::Failed(e) = &exit {
        warn!("Session {} write failed: {}", session_id, e);
        return exit;
    }

    // Best effort: flush what was already queued, then say goodbye.
    outbound.close();
    let flush = async {
        let mut flushed = 0usize;
        while let Some(frame) = outbound.recv().await {
            write_frame(&mut sink, Message::Text(frame), config.write_timeout).await?;
            flushed += 1;
        }
        let close = Message::Close(Some(CloseFrame {
            code: close_code::NORMAL,
            reason: Utf8Bytes::from_static("session closed"),
        }));
        write_frame(&mut sink, close, config.write_timeout).await?;
        Ok::<_, TransportError>(flushed)
    };

    match tokio::time::timeout(config.write_timeout, flush).await {
        Ok(Ok(flushed)) => trace!("Session {} flushed {} frames before close", session_id, flushed),
        Ok(Err(e)) => debug!("Session {} close handshake failed: {}", session_id, e),
        Err(_) => debug!("Session {} drain timed out", session_id),
    }

    exit
}

async fn write_frame(
    sink: &mut SplitSink<WebSocket, Message>,
    msg: Message,
    timeout: Duration,
) -> Result<(), TransportError> {
    tokio::time::timeout(timeout, sink.send(msg))
        .await
        .map_err(|_| TransportError::WriteTimeout)??;
    Ok(())
}
