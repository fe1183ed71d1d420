//! Streaming answers over a websocket.
//!
//! A reader task owns the socket's receive half. It forwards queries to the
//! connection loop, cancels the running query on `{"type":"stop"}` and
//! cancels the whole connection on close or EOF. Queries on one connection
//! run one at a time; each gets a child token of the connection token.
//!
//! At most [`QUERY_QUEUE_CAPACITY`] queries wait behind the running one;
//! further ones are answered with an `error` frame. A stop that arrives
//! while nothing runs but a query is queued cancels that query as it starts.

use std::sync::{Arc, Mutex};

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use super::protocol::{WsIncomingMessage, WsOutgoingMessage};
use crate::core::errors::{ApiError, RagError};
use crate::rag::StreamEvent;
use crate::state::AppState;

pub const QUERY_QUEUE_CAPACITY: usize = 16;

#[derive(Debug, Default)]
struct QueueState {
    active: Option<CancellationToken>,
    queued: usize,
    pending_stop: bool,
    rejected: usize,
}

/// Shared between the reader task and the connection loop.
#[derive(Clone, Default)]
struct QueryControl {
    state: Arc<Mutex<QueueState>>,
}

impl QueryControl {
    fn with_state<T>(&self, f: impl FnOnce(&mut QueueState) -> T) -> T {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut state)
    }

    /// Called by the reader before a message is handed to the loop.
    fn enqueue(&self) {
        self.with_state(|state| state.queued += 1);
    }

    /// The queue was full; the message is dropped and reported later.
    fn reject(&self) {
        self.with_state(|state| {
            state.queued = state.queued.saturating_sub(1);
            state.rejected += 1;
        });
    }

    /// Cancels the running query, or marks the next queued one as stopped.
    fn stop(&self) {
        self.with_state(|state| match &state.active {
            Some(token) if !token.is_cancelled() => token.cancel(),
            _ if state.queued > 0 => state.pending_stop = true,
            _ => tracing::debug!("stop received with no query running"),
        });
    }

    /// Starts the next queued query under `parent`.
    fn begin(&self, parent: &CancellationToken) -> CancellationToken {
        self.with_state(|state| {
            state.queued = state.queued.saturating_sub(1);
            let token = parent.child_token();
            if std::mem::take(&mut state.pending_stop) {
                token.cancel();
            }
            state.active = Some(token.clone());
            token
        })
    }

    /// Dequeues a message that carries no query. A pending stop stays for
    /// the next query unless nothing else is waiting.
    fn skip(&self) {
        self.with_state(|state| {
            state.queued = state.queued.saturating_sub(1);
            if state.queued == 0 {
                state.pending_stop = false;
            }
        });
    }

    /// Clears the running query and returns how many queries were rejected
    /// since the last call.
    fn finish(&self) -> usize {
        self.with_state(|state| {
            state.active = None;
            std::mem::take(&mut state.rejected)
        })
    }
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    tracing::info!("WebSocket connection accepted");

    let connection = CancellationToken::new();
    let control = QueryControl::default();
    let (tx, mut rx) = tokio::sync::mpsc::channel::<WsIncomingMessage>(QUERY_QUEUE_CAPACITY);

    let reader_connection = connection.clone();
    let reader_control = control.clone();
    let reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => {
                    let incoming =
                        serde_json::from_str::<WsIncomingMessage>(&text).unwrap_or_default();
                    if incoming.is_stop() {
                        reader_control.stop();
                        continue;
                    }
                    reader_control.enqueue();
                    match tx.try_send(incoming) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => {
                            tracing::warn!("WebSocket query queue is full, rejecting query");
                            reader_control.reject();
                        }
                        Err(TrySendError::Closed(_)) => break,
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
        tracing::debug!("WebSocket reader finished");
        reader_connection.cancel();
    });

    loop {
        let incoming = tokio::select! {
            biased;
            _ = connection.cancelled() => break,
            incoming = rx.recv() => match incoming {
                Some(incoming) => incoming,
                None => break,
            },
        };

        let result = match incoming.query.filter(|q| !q.trim().is_empty()) {
            Some(query) => {
                let query_token = control.begin(&connection);
                handle_query(&mut sender, &state, &query, &query_token).await
            }
            None => {
                control.skip();
                tracing::warn!("Received WebSocket message without query");
                send_message(
                    &mut sender,
                    &WsOutgoingMessage::Error {
                        message: "message has no query".to_string(),
                    },
                )
                .await
            }
        };
        let rejected = control.finish();

        if let Err(err) = result {
            tracing::debug!("WebSocket send failed, closing connection: {}", err);
            break;
        }
        if let Err(err) = send_rejections(&mut sender, rejected).await {
            tracing::debug!("WebSocket send failed, closing connection: {}", err);
            break;
        }
    }

    connection.cancel();
    reader.abort();
    tracing::info!("WebSocket connection closed");
}

async fn handle_query(
    sender: &mut SplitSink<WebSocket, Message>,
    state: &Arc<AppState>,
    query: &str,
    token: &CancellationToken,
) -> Result<(), ApiError> {
    let preview: String = query.chars().take(50).collect();
    tracing::info!("Received streaming query: {}", preview);

    let mut stream = match state.pipeline.answer_stream_with(query, token).await {
        Ok(stream) => stream,
        Err(RagError::CancelledByClient) => {
            return send_message(sender, &WsOutgoingMessage::Stopped).await;
        }
        Err(err) => {
            return send_message(
                sender,
                &WsOutgoingMessage::Error {
                    message: err.to_string(),
                },
            )
            .await;
        }
    };

    tracing::debug!(
        request_id = %stream.request_id(),
        rewritten_query = stream.rewritten_query(),
        degraded = ?stream.degraded(),
        "Streaming answer prepared"
    );
    send_message(
        sender,
        &WsOutgoingMessage::Sources {
            data: stream.sources().to_vec(),
        },
    )
    .await?;

    let mut count = 0usize;
    while let Some(event) = stream.next().await {
        match event {
            StreamEvent::Fragment(message) => {
                send_message(sender, &WsOutgoingMessage::Chunk { message }).await?;
                count += 1;
            }
            StreamEvent::Completed => {
                tracing::info!("Sent {} chunks to websocket", count);
                return send_message(sender, &WsOutgoingMessage::Done).await;
            }
            StreamEvent::Failed(message) => {
                return send_message(sender, &WsOutgoingMessage::Error { message }).await;
            }
        }
    }

    tracing::info!("Streaming query stopped after {} chunks", count);
    send_message(sender, &WsOutgoingMessage::Stopped).await
}

async fn send_rejections(
    sender: &mut SplitSink<WebSocket, Message>,
    rejected: usize,
) -> Result<(), ApiError> {
    for _ in 0..rejected {
        let message = format!(
            "too many queued queries (limit {}), query dropped",
            QUERY_QUEUE_CAPACITY
        );
        send_message(sender, &WsOutgoingMessage::Error { message }).await?;
    }
    Ok(())
}

pub async fn send_message(
    sender: &mut SplitSink<WebSocket, Message>,
    payload: &WsOutgoingMessage,
) -> Result<(), ApiError> {
    let text = serde_json::to_string(payload).map_err(ApiError::internal)?;
    sender
        .send(Message::Text(text))
        .await
        .map_err(ApiError::internal)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_between_queries_cancels_the_next_queued_one() {
        let connection = CancellationToken::new();
        let control = QueryControl::default();
        control.enqueue();
        control.enqueue();

        let first = control.begin(&connection);
        assert_eq!(control.finish(), 0);
        control.stop();

        let second = control.begin(&connection);
        assert!(!first.is_cancelled());
        assert!(second.is_cancelled());
    }

    #[test]
    fn stop_cancels_only_the_running_query() {
        let connection = CancellationToken::new();
        let control = QueryControl::default();
        control.enqueue();
        control.enqueue();

        let first = control.begin(&connection);
        control.stop();
        assert!(first.is_cancelled());
        control.finish();

        let second = control.begin(&connection);
        assert!(!second.is_cancelled());
        assert!(!connection.is_cancelled());
    }

    #[test]
    fn a_second_stop_while_queued_reaches_the_next_query() {
        let connection = CancellationToken::new();
        let control = QueryControl::default();
        control.enqueue();
        control.enqueue();

        let first = control.begin(&connection);
        control.stop();
        control.stop();
        control.finish();

        assert!(first.is_cancelled());
        assert!(control.begin(&connection).is_cancelled());
    }

    #[test]
    fn stop_with_nothing_running_or_queued_is_ignored() {
        let connection = CancellationToken::new();
        let control = QueryControl::default();
        control.stop();

        control.enqueue();
        assert!(!control.begin(&connection).is_cancelled());
    }

    #[test]
    fn message_without_query_keeps_the_pending_stop_for_the_next_query() {
        let connection = CancellationToken::new();
        let control = QueryControl::default();
        control.enqueue();
        control.enqueue();
        control.stop();

        control.skip();
        assert!(control.begin(&connection).is_cancelled());
    }

    #[test]
    fn pending_stop_is_dropped_when_the_queue_drains() {
        let connection = CancellationToken::new();
        let control = QueryControl::default();
        control.enqueue();
        control.stop();
        control.skip();

        control.enqueue();
        assert!(!control.begin(&connection).is_cancelled());
    }

    #[test]
    fn rejected_queries_are_reported_once() {
        let control = QueryControl::default();
        control.enqueue();
        control.enqueue();
        control.reject();

        assert_eq!(control.finish(), 1);
        assert_eq!(control.finish(), 0);
        assert_eq!(control.with_state(|state| state.queued), 1);
    }
}
