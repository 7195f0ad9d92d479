// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! SSE plumbing between an upstream backend and the client.
//!
//! Two halves:
//!
//! - [`spawn_sse_reader`] is the producer: it reads an upstream response body
//!   line by line, pushes [`StreamEvent`]s on a bounded channel, and closes
//!   the channel exactly once whatever the termination reason (upstream
//!   `[DONE]`, EOF, read error, or cancellation).
//! - [`relay_events`] is the consumer: it turns the channel back into SSE
//!   events for the client, guaranteeing that exactly one `data: [DONE]`
//!   terminator is visible regardless of what the upstream did.
//!
//! Payloads are opaque; no attempt is made to parse them.

use std::convert::Infallible;
use std::io;

use axum::body::Bytes;
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::response::sse::Event;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;

use crate::backend::{StreamError, StreamEvent};

/// The SSE terminator payload.
pub const DONE_MARKER: &str = "[DONE]";

const DATA_PREFIX: &str = "data: ";

const STREAM_CHANNEL_CAPACITY: usize = 100;

/// Reads SSE lines from an upstream body and forwards them as events on a
/// bounded channel.
///
/// Lines that do not start with `data: ` are ignored, as are blank lines.
/// The spawned task terminates, and the channel closes, on the first of:
/// upstream `data: [DONE]`, EOF, a read error, cancellation, or the receiver
/// going away. Dropping the body stream on exit releases the upstream
/// connection.
pub fn spawn_sse_reader<S>(body: S, cancel: CancellationToken) -> mpsc::Receiver<StreamEvent>
where
    S: Stream<Item = io::Result<Bytes>> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);

    tokio::spawn(async move {
        let reader = StreamReader::new(Box::pin(body));
        let mut lines = FramedRead::new(reader, LinesCodec::new());

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = tx.send(StreamEvent::failed(StreamError::Cancelled)).await;
                    break;
                }
                line = lines.next() => match line {
                    None => {
                        // EOF before [DONE]: clean termination.
                        let _ = tx.send(StreamEvent::finished()).await;
                        break;
                    }
                    Some(Err(err)) => {
                        let _ = tx
                            .send(StreamEvent::failed(StreamError::Read(err.to_string())))
                            .await;
                        break;
                    }
                    Some(Ok(line)) => {
                        let line = line.trim();
                        let Some(data) = line.strip_prefix(DATA_PREFIX) else {
                            continue;
                        };
                        if data == DONE_MARKER {
                            let _ = tx.send(StreamEvent::terminator()).await;
                            break;
                        }
                        if tx.send(StreamEvent::data(data)).await.is_err() {
                            // Receiver gone: the client disconnected.
                            break;
                        }
                    }
                }
            }
        }
    });

    rx
}

/// Turns a stream-event channel into client-facing SSE events.
///
/// Every relayed stream ends with exactly one `[DONE]`: an upstream
/// terminator is passed through once, and if the channel closes without one
/// (EOF or error upstream) the relay appends it itself.
pub fn relay_events(
    events: mpsc::Receiver<StreamEvent>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    relay_frames(events).map(|payload| Ok(Event::default().data(payload)))
}

fn relay_frames(mut events: mpsc::Receiver<StreamEvent>) -> impl Stream<Item = String> {
    async_stream::stream! {
        let mut terminated = false;

        while let Some(event) = events.recv().await {
            if let Some(err) = event.err {
                tracing::warn!(error = %err, "upstream stream failed");
                break;
            }
            if event.done {
                if event.data == DONE_MARKER {
                    terminated = true;
                    yield DONE_MARKER.to_string();
                }
                break;
            }
            if !event.data.is_empty() {
                yield event.data;
            }
        }

        if !terminated {
            yield DONE_MARKER.to_string();
        }
    }
}

/// Sets the SSE response headers expected by streaming clients.
pub fn set_sse_headers(headers: &mut HeaderMap) {
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert(
        HeaderName::from_static("x-accel-buffering"),
        HeaderValue::from_static("no"),
    );
}
