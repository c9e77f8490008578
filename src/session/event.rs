//! Session lifecycle events.
use std::{pin::Pin, task::{Context, Poll}};

use tokio::sync::mpsc::UnboundedReceiver;

use crate::{Error, postgres::{DatabaseError, backend::NotificationResponse}};

/// Asynchronous signals emitted by a session.
#[derive(Debug)]
pub enum SessionEvent {
    /// The backend signalled its first `ReadyForQuery`.
    Connect,
    /// The transport closed; terminal.
    End,
    /// A session-fatal failure outside any connect or query completion.
    Error(Error),
    /// A `NoticeResponse` from the backend.
    Notice(DatabaseError),
    /// A `NotificationResponse` from `NOTIFY`.
    Notification(NotificationResponse),
    /// The query queue emptied after at least one query executed.
    Drain,
}

/// Receiver half of the session's event channel.
///
/// Events are delivered on a later tick than the observation that caused
/// them, so a consumer can never re-enter the session dispatcher.
#[derive(Debug)]
pub struct Events {
    pub(crate) recv: UnboundedReceiver<SessionEvent>,
}

impl Events {
    /// Next event; `None` once the session is gone and the channel drained.
    pub async fn next(&mut self) -> Option<SessionEvent> {
        self.recv.recv().await
    }
}

impl futures_core::Stream for Events {
    type Item = SessionEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.recv.poll_recv(cx)
    }
}
