//! The session state machine, driven as a single task.
//!
//! Callers hand work in through the command mailbox; the driver owns the
//! transport, promotes at most one queued query onto the wire at a time, and
//! routes every backend message inside a query window to that query. All
//! completions travel through channels, so a caller never observes an error
//! synchronously from within an inbound-message handler.
use std::{
    collections::{HashMap, VecDeque},
    io,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use tokio::{
    sync::{
        mpsc::{UnboundedReceiver, UnboundedSender},
        oneshot,
    },
    time::{Instant, Sleep},
};

use super::{Shared, event::SessionEvent};
use crate::{
    Error, Result,
    cancel,
    common::ByteStr,
    error::ErrorKind,
    postgres::{BackendMessage, DatabaseError, ProtocolError, frontend},
    query::{QueryId, QueryObject},
    stream::Stream,
    transport::PgTransport,
};

/// A query waiting in, or promoted out of, the FIFO.
pub(crate) struct QueuedQuery {
    pub id: QueryId,
    /// Read deadline armed when the query was enqueued.
    pub deadline: Option<Instant>,
    /// Once the deadline fired, later backend traffic for this query is
    /// discarded; the window still closes on its `ReadyForQuery`.
    pub timed_out: bool,
    pub handler: Box<dyn QueryObject>,
}

/// Work handed to the driver through the mailbox.
pub(crate) enum Command {
    Query(QueuedQuery),
    End(oneshot::Sender<()>),
    Cancel(QueryId, oneshot::Sender<Result<()>>),
    Snapshot(oneshot::Sender<Snapshot>),
}

/// Read-only view of the driver state.
#[derive(Debug)]
pub struct Snapshot {
    pub queued: usize,
    pub active: Option<QueryId>,
    pub parameters: HashMap<ByteStr, ByteStr>,
}

/// Session top-level states after a successful connect.
///
/// The connect-phase states (connecting, TLS handshake, startup,
/// authenticating) are the control flow of [`Session::connect`][1]; the
/// driver starts at `Ready`.
///
/// [1]: crate::Session::connect
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    /// Idle between query windows.
    Ready,
    /// A query's frames are on the wire and its window is open.
    Executing,
    /// `Terminate` queued; waiting for the flush and close.
    Ending,
    /// The wire is compromised; only `end` can make progress.
    Broken,
    /// Terminal.
    Ended,
}

/// A session-fatal error in a shape that can be delivered to every pending
/// query and the event channel.
enum Fatal {
    Io(Arc<io::Error>),
    Protocol(ProtocolError),
    Database(DatabaseError),
    Closed(&'static str),
}

impl Fatal {
    fn from_error(err: Error) -> Fatal {
        match err.into_kind() {
            ErrorKind::Io(e) => Fatal::Io(Arc::new(e)),
            ErrorKind::Protocol(e) => Fatal::Protocol(e),
            ErrorKind::Database(e) => Fatal::Database(e),
            ErrorKind::Broken(e) => Fatal::Io(e),
            ErrorKind::Closed(reason) => Fatal::Closed(reason),
            _ => Fatal::Closed("connection broken"),
        }
    }

    fn to_error(&self) -> Error {
        match self {
            Fatal::Io(e) => Error::broken(e),
            Fatal::Protocol(e) => e.clone().into(),
            Fatal::Database(e) => e.clone().into(),
            Fatal::Closed(reason) => Error::closed(reason),
        }
    }
}

pub(crate) struct Driver {
    stream: Option<Stream>,
    shared: Arc<Shared>,

    recv: UnboundedReceiver<Command>,
    recv_closed: bool,
    events: UnboundedSender<SessionEvent>,

    state: State,
    /// False once the wire can no longer carry queries.
    queryable: bool,
    /// Set by the first `end` request; rejects later queries.
    ending: bool,
    /// The backend is between query cycles and the next query may be sent.
    ready_for_query: bool,
    has_executed: bool,
    drained: bool,

    queue: VecDeque<QueuedQuery>,
    active: Option<QueuedQuery>,

    /// Backend parameters reported by ParameterStatus.
    parameters: HashMap<ByteStr, ByteStr>,

    end_waiters: Vec<oneshot::Sender<()>>,

    /// Single timer slot, reset to the earliest armed query deadline.
    sleep: Pin<Box<Sleep>>,
}

impl Driver {
    pub(crate) fn new(
        stream: Stream,
        shared: Arc<Shared>,
        parameters: HashMap<ByteStr, ByteStr>,
        recv: UnboundedReceiver<Command>,
        events: UnboundedSender<SessionEvent>,
    ) -> Driver {
        Driver {
            stream: Some(stream),
            shared,
            recv,
            recv_closed: false,
            events,
            state: State::Ready,
            queryable: true,
            ending: false,
            ready_for_query: true,
            has_executed: false,
            drained: false,
            queue: VecDeque::new(),
            active: None,
            parameters,
            end_waiters: Vec::new(),
            sleep: Box::pin(tokio::time::sleep(std::time::Duration::from_secs(1))),
        }
    }

    fn emit(&self, event: SessionEvent) {
        // nobody listening is fine
        let _ = self.events.send(event);
    }

    // ===== mailbox =====

    fn command(&mut self, cmd: Command) {
        match cmd {
            Command::Query(q) => self.enqueue(q),
            Command::End(tx) => self.end_command(tx),
            Command::Cancel(id, tx) => self.cancel_command(id, tx),
            Command::Snapshot(tx) => {
                let _ = tx.send(Snapshot {
                    queued: self.queue.len(),
                    active: self.active.as_ref().map(|q| q.id),
                    parameters: self.parameters.clone(),
                });
            }
        }
    }

    fn enqueue(&mut self, mut q: QueuedQuery) {
        if self.ending {
            return q.handler.on_error(Error::closed("client was closed"));
        }
        if !self.queryable {
            return q.handler.on_error(Error::closed("connection is not queryable"));
        }
        self.queue.push_back(q);
    }

    fn end_command(&mut self, tx: oneshot::Sender<()>) {
        match self.state {
            State::Ended => {
                let _ = tx.send(());
            }
            State::Ending => self.end_waiters.push(tx),
            _ => {
                self.end_waiters.push(tx);
                self.begin_end();
            }
        }
    }

    /// Initiate shutdown: graceful `Terminate` when idle, forced transport
    /// destruction when a query is active or the wire is unhealthy.
    fn begin_end(&mut self) {
        self.ending = true;

        if self.active.is_some() || !self.queryable {
            if let Some(mut q) = self.active.take() {
                if !q.timed_out {
                    q.handler.on_error(Error::closed("Connection terminated"));
                }
            }
            while let Some(mut q) = self.queue.pop_front() {
                q.handler.on_error(Error::closed("Connection terminated"));
            }
            self.queryable = false;
            return self.finish();
        }

        // anything not yet on the wire never ran
        while let Some(mut q) = self.queue.pop_front() {
            q.handler.on_error(Error::closed("client was closed"));
        }
        if let Some(stream) = self.stream.as_mut() {
            stream.send(frontend::Terminate);
        }
        self.state = State::Ending;
    }

    fn cancel_command(&mut self, id: QueryId, tx: oneshot::Sender<Result<()>>) {
        if self.active.as_ref().is_some_and(|q| q.id == id) {
            // a CancelRequest must travel on its own short-lived connection
            let shared = Arc::clone(&self.shared);
            tokio::spawn(async move {
                let result = cancel::cancel_request(
                    &shared.host,
                    shared.port,
                    &shared.keepalive,
                    shared.process_id,
                    shared.secret_key,
                )
                .await;
                let _ = tx.send(result);
            });
            return;
        }

        if let Some(pos) = self.queue.iter().position(|q| q.id == id) {
            let mut q = self.queue.remove(pos).expect("position just found");
            q.handler.on_error(Error::closed("query was canceled"));
        }
        let _ = tx.send(Ok(()));
    }

    /// All session handles dropped: wind the connection down.
    fn handles_dropped(&mut self) {
        if !matches!(self.state, State::Ended | State::Ending) {
            self.begin_end();
        }
    }

    // ===== inbound =====

    fn read_messages(&mut self, cx: &mut Context) {
        loop {
            if matches!(self.state, State::Ended | State::Broken) {
                return;
            }
            let Some(stream) = self.stream.as_mut() else { return };
            match stream.poll_message(cx) {
                Poll::Ready(Ok(msg)) => self.route(msg),
                Poll::Ready(Err(err)) => return self.read_error(err),
                Poll::Pending => return,
            }
        }
    }

    fn read_error(&mut self, err: Error) {
        // the close after our Terminate is the expected outcome
        if self.state == State::Ending {
            return self.finish();
        }

        let eof = matches!(err.kind(), ErrorKind::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof);
        match eof {
            true => self.fatal(Fatal::Closed("Connection terminated unexpectedly"), true),
            false => self.fatal(Fatal::from_error(err), false),
        }
    }

    /// Route one backend message per the session window rules.
    fn route(&mut self, msg: BackendMessage) {
        use BackendMessage::*;
        let msgtype = msg.msgtype();

        macro_rules! forward {
            (|$q:ident| $call:expr) => {
                match self.active.as_mut() {
                    Some($q) if !$q.timed_out => $call,
                    Some(_) => {} // timed out: suppress
                    None => self.violation(msgtype),
                }
            };
        }

        match msg {
            RowDescription(m) => forward!(|q| q.handler.on_row_description(m)),
            DataRow(m) => forward!(|q| q.handler.on_data_row(m)),
            CommandComplete(m) => forward!(|q| q.handler.on_command_complete(m)),
            EmptyQueryResponse(_) => forward!(|q| q.handler.on_empty_query()),
            PortalSuspended(_) => forward!(|q| q.handler.on_portal_suspended()),

            CopyInResponse(m) => {
                let Some(stream) = self.stream.as_mut() else { return };
                match self.active.as_mut() {
                    Some(q) if !q.timed_out => q.handler.on_copy_in_response(stream, m),
                    Some(_) => {}
                    None => self.violation(msgtype),
                }
            }
            CopyData(m) => {
                let Some(stream) = self.stream.as_mut() else { return };
                match self.active.as_mut() {
                    Some(q) if !q.timed_out => q.handler.on_copy_data(stream, m),
                    Some(_) => {}
                    None => self.violation(msgtype),
                }
            }

            // window-internal acknowledgements the session consumes itself
            CopyOutResponse(_) | CopyDone(_) | BindComplete(_) | CloseComplete(_)
            | NoData(_) | ParameterDescription(_) => {
                if self.active.is_none() {
                    self.violation(msgtype);
                }
            }

            ParseComplete(_) => match self.active.as_mut() {
                Some(q) => {
                    if let Some((name, text)) = q.handler.parsed_statement() {
                        if let Some(stream) = self.stream.as_mut() {
                            stream.add_stmt(name, text);
                        }
                    }
                }
                None => self.violation(msgtype),
            },

            ErrorResponse(m) => {
                if let Some(mut q) = self.active.take() {
                    // the backend still emits ReadyForQuery, which closes the
                    // window and pulses the queue
                    self.state = State::Ready;
                    if !q.timed_out {
                        q.handler.on_error(m.to_db_error().into());
                    }
                } else {
                    self.fatal(Fatal::Database(m.to_db_error()), false);
                }
            }

            NoticeResponse(m) => self.emit(SessionEvent::Notice(m.to_db_error())),
            NotificationResponse(m) => self.emit(SessionEvent::Notification(m)),

            ParameterStatus(m) => {
                self.parameters.insert(m.name, m.value);
            }

            // process id and secret key are write-once at startup
            BackendKeyData(_) => log::debug!("BackendKeyData outside startup ignored"),
            NegotiateProtocolVersion(_) => {}
            Authentication(_) => self.violation(msgtype),

            ReadyForQuery(_) => {
                if let Some(mut q) = self.active.take() {
                    if !q.timed_out {
                        q.handler.on_ready_for_query();
                    }
                }
                self.ready_for_query = true;
                if self.state == State::Executing {
                    self.state = State::Ready;
                }
            }
        }
    }

    /// A message that requires an open query window arrived without one.
    fn violation(&mut self, msgtype: u8) {
        self.fatal(
            Fatal::Protocol(ProtocolError::unexpected_phase(msgtype, "idle session")),
            false,
        );
    }

    /// Session-phase failure: the wire is compromised. Fails the active and
    /// every queued query, emits exactly one `error` event.
    fn fatal(&mut self, fatal: Fatal, close: bool) {
        if matches!(self.state, State::Broken | State::Ended) {
            return;
        }
        self.queryable = false;

        if let Some(mut q) = self.active.take() {
            if !q.timed_out {
                q.handler.on_error(fatal.to_error());
            }
        }
        while let Some(mut q) = self.queue.pop_front() {
            q.handler.on_error(fatal.to_error());
        }

        self.emit(SessionEvent::Error(fatal.to_error()));
        self.stream = None;
        self.state = State::Broken;

        if close || self.ending {
            self.finish();
        }
    }

    /// Terminal transition; idempotent.
    fn finish(&mut self) {
        if self.state == State::Ended {
            return;
        }
        self.state = State::Ended;
        self.stream = None;
        for tx in self.end_waiters.drain(..) {
            let _ = tx.send(());
        }
        self.emit(SessionEvent::End);
    }

    // ===== dispatch =====

    /// Promote the next queued query when the connection is idle.
    fn pulse(&mut self) {
        if !self.queryable || !matches!(self.state, State::Ready | State::Executing) {
            return;
        }

        while self.ready_for_query && self.active.is_none() {
            let Some(mut q) = self.queue.pop_front() else {
                if self.has_executed && !self.drained {
                    self.drained = true;
                    self.emit(SessionEvent::Drain);
                }
                return;
            };

            let Some(stream) = self.stream.as_mut() else { return };
            self.ready_for_query = false;

            match q.handler.submit(stream) {
                Ok(()) => {
                    self.drained = false;
                    self.has_executed = true;
                    self.state = State::Executing;
                    self.active = Some(q);
                }
                // the caller observes the error through its handle, never
                // synchronously; the wire was not touched, so keep going
                Err(err) => {
                    q.handler.on_error(err);
                    self.ready_for_query = true;
                }
            }
        }
    }

    // ===== timers =====

    fn earliest_deadline(&self) -> Option<Instant> {
        let mut next: Option<Instant> = None;
        let mut consider = |deadline: Option<Instant>| {
            if let Some(d) = deadline {
                next = Some(next.map_or(d, |n| n.min(d)));
            }
        };
        if let Some(q) = &self.active {
            if !q.timed_out {
                consider(q.deadline);
            }
        }
        for q in &self.queue {
            consider(q.deadline);
        }
        next
    }

    fn poll_deadlines(&mut self, cx: &mut Context) {
        loop {
            let Some(at) = self.earliest_deadline() else { return };
            let now = Instant::now();

            if at <= now {
                self.expire(now);
                continue;
            }

            if self.sleep.deadline() != at {
                self.sleep.as_mut().reset(at);
            }
            match self.sleep.as_mut().poll(cx) {
                Poll::Ready(()) => continue,
                Poll::Pending => return,
            }
        }
    }

    /// Fire every elapsed query deadline.
    fn expire(&mut self, now: Instant) {
        if let Some(q) = self.active.as_mut() {
            if !q.timed_out && q.deadline.is_some_and(|d| d <= now) {
                // the window stays open until its ReadyForQuery; everything
                // else for this query is now suppressed
                q.timed_out = true;
                q.handler.on_error(ErrorKind::QueryTimeout.into());
            }
        }

        let mut i = 0;
        while i < self.queue.len() {
            if self.queue[i].deadline.is_some_and(|d| d <= now) {
                let mut q = self.queue.remove(i).expect("index in bounds");
                q.handler.on_error(ErrorKind::QueryTimeout.into());
            } else {
                i += 1;
            }
        }
    }

    // ===== outbound =====

    fn poll_write(&mut self, cx: &mut Context) {
        let Some(stream) = self.stream.as_mut() else { return };
        if !stream.write_buffered() {
            return;
        }
        match stream.poll_flush(cx) {
            Poll::Ready(Ok(())) | Poll::Pending => {}
            Poll::Ready(Err(err)) => match self.state {
                State::Ending => self.finish(),
                _ => self.fatal(Fatal::Io(Arc::new(err)), false),
            },
        }
    }

    /// Complete a graceful end once the `Terminate` is flushed.
    fn poll_ending(&mut self, cx: &mut Context) {
        if self.state != State::Ending {
            return;
        }
        let Some(stream) = self.stream.as_mut() else {
            return self.finish();
        };
        if stream.write_buffered() {
            return;
        }
        match stream.poll_shutdown(cx) {
            Poll::Ready(_) => self.finish(),
            Poll::Pending => {}
        }
    }
}

impl Future for Driver {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        let this = self.as_mut().get_mut();

        // 1. collect all requests upfront
        while !this.recv_closed {
            match this.recv.poll_recv(cx) {
                Poll::Ready(Some(cmd)) => this.command(cmd),
                Poll::Ready(None) => {
                    this.recv_closed = true;
                    this.handles_dropped();
                }
                Poll::Pending => break,
            }
        }

        // 2. drain and route whatever the backend sent
        this.read_messages(cx);

        // 3. promote the next queued query onto the wire
        this.pulse();

        // 4. query read deadlines
        this.poll_deadlines(cx);

        // 5. push buffered frames out
        this.poll_write(cx);

        // 6. graceful close progression
        this.poll_ending(cx);

        // stay alive while a handle may still send commands
        match this.state == State::Ended && this.recv_closed {
            true => Poll::Ready(()),
            false => Poll::Pending,
        }
    }
}
