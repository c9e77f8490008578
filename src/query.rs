//! Query objects: what the session delegates backend events to.
//!
//! The session itself is pure glue; everything a query means is behind
//! [`QueryObject`]. [`Query`] plus the built-in handler cover the common
//! cases; callers with special needs (e.g. COPY) submit their own object via
//! [`Session::submit`][crate::Session::submit].
use bytes::{Buf, Bytes};
use std::{any::Any, pin::Pin, sync::Arc, task::{Context, Poll}, time::Duration};

use tokio::sync::{mpsc, oneshot};

use crate::{
    Error, Result,
    common::ByteStr,
    error::ErrorKind,
    postgres::{
        Oid, PgFormat, frontend,
        backend::{
            CommandComplete, CopyData, CopyInResponse, DataRow, RowDescription,
        },
    },
    stream::Stream,
    transport::PgTransport,
    types::Types,
};

/// Identifier of a query within its session, used for cancellation and the
/// observation accessors.
pub type QueryId = u64;

/// The polymorphic handler contract.
///
/// While an object is the active query, every backend message between its
/// submission and its closing `ReadyForQuery` is delivered to it. The
/// handlers that may have to answer the backend receive the transport.
pub trait QueryObject: Send {
    /// Write this query's frames into the transport's send buffer.
    ///
    /// Returning an error fails the query without touching the wire; the
    /// session then promotes the next queued query.
    fn submit(&mut self, io: &mut Stream) -> Result<()>;

    fn on_row_description(&mut self, _msg: RowDescription) {}
    fn on_data_row(&mut self, _msg: DataRow) {}
    fn on_command_complete(&mut self, _msg: CommandComplete) {}
    fn on_empty_query(&mut self) {}
    fn on_portal_suspended(&mut self) {}
    fn on_copy_in_response(&mut self, _io: &mut Stream, _msg: CopyInResponse) {}
    fn on_copy_data(&mut self, _io: &mut Stream, _msg: CopyData) {}

    /// Terminal failure: a backend error, a submit error, a timeout, or the
    /// session dying under this query. Delivered at most once.
    fn on_error(&mut self, err: Error);

    /// The `ReadyForQuery` closing this query's window.
    fn on_ready_for_query(&mut self);

    /// Statement name and text this run parsed, recorded by the session in
    /// the prepared-statement map on `ParseComplete`.
    fn parsed_statement(&mut self) -> Option<(ByteStr, ByteStr)> {
        None
    }
}

/// A query configuration: text plus optional prepared name, parameters,
/// binary preference and read timeout.
#[derive(Debug, Clone)]
pub struct Query {
    pub(crate) text: ByteStr,
    pub(crate) name: Option<ByteStr>,
    pub(crate) params: Vec<Option<Bytes>>,
    pub(crate) binary: Option<bool>,
    pub(crate) timeout: Option<Duration>,
}

impl Query {
    pub fn new(text: impl Into<ByteStr>) -> Query {
        Query {
            text: text.into(),
            name: None,
            params: Vec::new(),
            binary: None,
            timeout: None,
        }
    }

    /// Parse under a prepared statement name; repeat queries with the same
    /// name and text skip the Parse round trip.
    pub fn name(mut self, name: impl Into<ByteStr>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Bind a parameter value, already encoded in text format.
    pub fn bind(mut self, value: impl Into<Bytes>) -> Self {
        self.params.push(Some(value.into()));
        self
    }

    /// Bind a NULL parameter.
    pub fn bind_null(mut self) -> Self {
        self.params.push(None);
        self
    }

    /// Request binary result format, overriding the session default.
    pub fn binary(mut self, binary: bool) -> Self {
        self.binary = Some(binary);
        self
    }

    /// Per-query read timeout, overriding the session default.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// One result column of a query.
#[derive(Debug, Clone)]
pub struct Column {
    pub name: ByteStr,
    pub oid: Oid,
    pub format: PgFormat,
}

impl Column {
    /// Decode the field list of a `RowDescription` body.
    fn parse_description(msg: &RowDescription) -> Vec<Column> {
        let mut body = msg.body.clone();
        let mut columns = Vec::with_capacity(msg.field_len as usize);

        for _ in 0..msg.field_len {
            let Some(end) = body.iter().position(|b| *b == 0) else { break };
            let name = body.split_to(end);
            body.advance(1); // nul
            if body.remaining() < 18 {
                break;
            }
            let _table_oid = body.get_u32();
            let _attr_num = body.get_u16();
            let oid = body.get_u32();
            let _type_len = body.get_i16();
            let _type_mod = body.get_i32();
            let format = PgFormat::from_code(body.get_u16());

            let name = ByteStr::from_utf8(name).unwrap_or_default();
            columns.push(Column { name, oid, format });
        }

        columns
    }
}

/// One row of a query result: raw column bytes plus column metadata, with
/// the injected type-parser registry attached when the session has one.
#[derive(Debug, Clone)]
pub struct Row {
    columns: Arc<[Column]>,
    values: Vec<Option<Bytes>>,
    types: Option<Arc<Types>>,
}

impl Row {
    fn decode(msg: &DataRow, columns: &Arc<[Column]>, types: &Option<Arc<Types>>) -> Row {
        let mut body = msg.body.clone();
        let mut values = Vec::with_capacity(msg.column_len as usize);

        for _ in 0..msg.column_len {
            if body.remaining() < 4 {
                break;
            }
            let len = body.get_i32();
            // -1 indicates a NULL column value. No value bytes follow.
            match len {
                -1 => values.push(None),
                len => values.push(Some(body.split_to(len as usize))),
            }
        }

        Row {
            columns: Arc::clone(columns),
            values,
            types: types.clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Raw column bytes; `None` is SQL NULL.
    pub fn get_raw(&self, idx: usize) -> Option<&[u8]> {
        self.values.get(idx)?.as_deref()
    }

    /// Column value as text, when the column is in text format.
    pub fn get_text(&self, idx: usize) -> Option<&str> {
        std::str::from_utf8(self.get_raw(idx)?).ok()
    }

    /// Run the registered type parser for this column, if any.
    pub fn parse(&self, idx: usize) -> Option<Box<dyn Any + Send>> {
        let raw = self.get_raw(idx)?;
        let column = self.columns.get(idx)?;
        let parser = self.types.as_ref()?.get(column.oid)?;
        Some(parser(raw, column.format))
    }
}

/// The collected outcome of a query.
#[derive(Debug, Default)]
pub struct QueryResult {
    pub rows: Vec<Row>,
    pub columns: Option<Arc<[Column]>>,
    /// The command tag, e.g. `SELECT 3`.
    pub tag: Option<ByteStr>,
}

impl QueryResult {
    /// Rows affected, parsed from the trailing integer of the command tag.
    pub fn rows_affected(&self) -> Option<u64> {
        self.tag.as_ref()?.rsplit(' ').next()?.parse().ok()
    }
}

pub(crate) enum Sink {
    Collect(Option<oneshot::Sender<Result<QueryResult>>>),
    Stream(Option<mpsc::UnboundedSender<Result<Row>>>),
}

/// The built-in [`QueryObject`]: simple protocol for plain text, extended
/// protocol (Parse/Bind/Describe/Execute/Sync) when parameters, a prepared
/// name or binary results are requested.
pub(crate) struct QueryRun {
    query: Query,
    binary: bool,
    types: Option<Arc<Types>>,
    columns: Option<Arc<[Column]>>,
    rows: Vec<Row>,
    tag: Option<ByteStr>,
    parsed: Option<(ByteStr, ByteStr)>,
    failed: bool,
    sink: Sink,
}

impl QueryRun {
    pub(crate) fn new(
        query: Query,
        binary_default: bool,
        types: Option<Arc<Types>>,
        sink: Sink,
    ) -> QueryRun {
        let binary = query.binary.unwrap_or(binary_default);
        QueryRun {
            query,
            binary,
            types,
            columns: None,
            rows: Vec::new(),
            tag: None,
            parsed: None,
            failed: false,
            sink,
        }
    }

    fn fail(&mut self, err: Error) {
        self.failed = true;
        match &mut self.sink {
            Sink::Collect(tx) => {
                if let Some(tx) = tx.take() {
                    let _ = tx.send(Err(err));
                }
            }
            Sink::Stream(tx) => {
                if let Some(tx) = tx.take() {
                    let _ = tx.send(Err(err));
                }
            }
        }
    }
}

impl QueryObject for QueryRun {
    fn submit(&mut self, io: &mut Stream) -> Result<()> {
        let extended =
            !self.query.params.is_empty() || self.query.name.is_some() || self.binary;

        if !extended {
            io.send(frontend::Query { sql: &self.query.text });
            return Ok(());
        }

        let stmt_name = self.query.name.as_deref().unwrap_or("");

        let already_parsed = match &self.query.name {
            Some(name) => matches!(io.get_stmt(name), Some(text) if text == self.query.text),
            None => false,
        };

        if !already_parsed {
            io.send(frontend::Parse {
                prepare_name: stmt_name,
                sql: &self.query.text,
                oids: &[],
            });
            if let Some(name) = &self.query.name {
                self.parsed = Some((name.clone(), self.query.text.clone()));
            }
        }

        io.send(frontend::Bind {
            portal_name: "",
            stmt_name,
            param_format: PgFormat::Text,
            params: &self.query.params,
            result_format: match self.binary {
                true => PgFormat::Binary,
                false => PgFormat::Text,
            },
        });
        io.send(frontend::Describe { kind: b'P', name: "" });
        io.send(frontend::Execute { portal_name: "", max_row: 0 });
        io.send(frontend::Sync);

        Ok(())
    }

    fn on_row_description(&mut self, msg: RowDescription) {
        self.columns = Some(Arc::from(Column::parse_description(&msg)));
    }

    fn on_data_row(&mut self, msg: DataRow) {
        let columns = self
            .columns
            .get_or_insert_with(|| Arc::from(Vec::new()));
        let row = Row::decode(&msg, columns, &self.types);
        match &mut self.sink {
            Sink::Collect(_) => self.rows.push(row),
            Sink::Stream(tx) => {
                if let Some(tx) = tx.as_ref() {
                    let _ = tx.send(Ok(row));
                }
            }
        }
    }

    fn on_command_complete(&mut self, msg: CommandComplete) {
        self.tag = ByteStr::from_utf8(msg.tag.clone()).ok();
    }

    fn on_empty_query(&mut self) {
        // substitutes for CommandComplete
    }

    fn on_copy_in_response(&mut self, io: &mut Stream, _msg: CopyInResponse) {
        // the built-in handler cannot feed a COPY stream; abort it so the
        // backend returns to a sane state
        io.send(frontend::CopyFail { message: "COPY requires a dedicated query object" });
        self.fail(Error::closed("COPY is not supported by this query type"));
    }

    fn on_error(&mut self, err: Error) {
        if !self.failed {
            self.fail(err);
        }
    }

    fn on_ready_for_query(&mut self) {
        if self.failed {
            return;
        }
        match &mut self.sink {
            Sink::Collect(tx) => {
                if let Some(tx) = tx.take() {
                    let _ = tx.send(Ok(QueryResult {
                        rows: std::mem::take(&mut self.rows),
                        columns: self.columns.clone(),
                        tag: self.tag.clone(),
                    }));
                }
            }
            // dropping the sender completes the stream
            Sink::Stream(tx) => drop(tx.take()),
        }
    }

    fn parsed_statement(&mut self) -> Option<(ByteStr, ByteStr)> {
        self.parsed.take()
    }
}

/// Completion handle of [`Session::query`][crate::Session::query].
///
/// Resolves when the query completes or fails; at most once.
pub struct QueryHandle {
    pub(crate) id: QueryId,
    pub(crate) recv: oneshot::Receiver<Result<QueryResult>>,
}

impl QueryHandle {
    pub fn id(&self) -> QueryId {
        self.id
    }
}

impl Future for QueryHandle {
    type Output = Result<QueryResult>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.recv).poll(cx).map(|r| match r {
            Ok(result) => result,
            // driver dropped mid-flight
            Err(_) => Err(ErrorKind::Closed("connection terminated").into()),
        })
    }
}

/// Rows of [`Session::query_stream`][crate::Session::query_stream],
/// delivered as they arrive.
pub struct RowStream {
    pub(crate) id: QueryId,
    pub(crate) recv: mpsc::UnboundedReceiver<Result<Row>>,
}

impl RowStream {
    pub fn id(&self) -> QueryId {
        self.id
    }

    pub async fn next(&mut self) -> Option<Result<Row>> {
        self.recv.recv().await
    }
}

impl futures_core::Stream for RowStream {
    type Item = Result<Row>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.recv.poll_recv(cx)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn row_description(fields: &[(&str, Oid)]) -> RowDescription {
        let mut body = Vec::new();
        for (name, oid) in fields {
            body.extend_from_slice(name.as_bytes());
            body.push(0);
            body.extend_from_slice(&0u32.to_be_bytes()); // table oid
            body.extend_from_slice(&0u16.to_be_bytes()); // attr num
            body.extend_from_slice(&oid.to_be_bytes());
            body.extend_from_slice(&(-1i16).to_be_bytes()); // type len
            body.extend_from_slice(&(-1i32).to_be_bytes()); // type mod
            body.extend_from_slice(&0u16.to_be_bytes()); // text format
        }
        RowDescription {
            field_len: fields.len() as u16,
            body: Bytes::from(body),
        }
    }

    fn data_row(values: &[Option<&[u8]>]) -> DataRow {
        let mut body = Vec::new();
        for value in values {
            match value {
                None => body.extend_from_slice(&(-1i32).to_be_bytes()),
                Some(v) => {
                    body.extend_from_slice(&(v.len() as i32).to_be_bytes());
                    body.extend_from_slice(v);
                }
            }
        }
        DataRow {
            column_len: values.len() as u16,
            body: Bytes::from(body),
        }
    }

    #[test]
    fn column_parsing() {
        let rd = row_description(&[("id", 23), ("label", 25)]);
        let columns = Column::parse_description(&rd);
        assert_eq!(columns.len(), 2);
        assert_eq!(columns[0].name, "id");
        assert_eq!(columns[0].oid, 23);
        assert_eq!(columns[1].name, "label");
        assert_eq!(columns[1].format, PgFormat::Text);
    }

    #[test]
    fn row_decoding_with_null() {
        let rd = row_description(&[("a", 25), ("b", 25)]);
        let columns: Arc<[Column]> = Arc::from(Column::parse_description(&rd));
        let row = Row::decode(&data_row(&[Some(b"hello"), None]), &columns, &None);
        assert_eq!(row.get_text(0), Some("hello"));
        assert_eq!(row.get_raw(1), None);
        assert_eq!(row.len(), 2);
    }

    #[test]
    fn type_registry_attached() {
        let mut types = Types::new();
        types.register(23, |raw, _format| {
            let n: i32 = std::str::from_utf8(raw).unwrap().parse().unwrap();
            Box::new(n)
        });

        let rd = row_description(&[("id", 23)]);
        let columns: Arc<[Column]> = Arc::from(Column::parse_description(&rd));
        let row = Row::decode(
            &data_row(&[Some(b"42")]),
            &columns,
            &Some(Arc::new(types)),
        );

        let value = row.parse(0).unwrap();
        assert_eq!(value.downcast_ref::<i32>(), Some(&42));
    }

    #[test]
    fn rows_affected_from_tag() {
        let result = QueryResult {
            rows: Vec::new(),
            columns: None,
            tag: Some(ByteStr::from_static("INSERT 0 3")),
        };
        assert_eq!(result.rows_affected(), Some(3));

        let result = QueryResult {
            tag: Some(ByteStr::from_static("CREATE TABLE")),
            ..QueryResult::default()
        };
        assert_eq!(result.rows_affected(), None);
    }

    #[test]
    fn collect_sink_completes_once() {
        let (tx, mut rx) = oneshot::channel();
        let mut run = QueryRun::new(
            Query::new("select 1"),
            false,
            None,
            Sink::Collect(Some(tx)),
        );

        run.on_row_description(row_description(&[("x", 25)]));
        run.on_data_row(data_row(&[Some(b"1")]));
        run.on_command_complete(CommandComplete { tag: Bytes::from_static(b"SELECT 1") });
        run.on_ready_for_query();

        let result = rx.try_recv().unwrap().unwrap();
        assert_eq!(result.rows.len(), 1);
        assert_eq!(result.tag.as_deref(), Some("SELECT 1"));
    }

    #[test]
    fn error_suppresses_later_completion() {
        let (tx, mut rx) = oneshot::channel();
        let mut run = QueryRun::new(
            Query::new("select 1"),
            false,
            None,
            Sink::Collect(Some(tx)),
        );

        run.on_error(ErrorKind::QueryTimeout.into());
        // a late server completion must not re-resolve the handle
        run.on_command_complete(CommandComplete { tag: Bytes::from_static(b"SELECT 1") });
        run.on_ready_for_query();

        let result = rx.try_recv().unwrap();
        assert!(matches!(result.unwrap_err().kind(), ErrorKind::QueryTimeout));
    }
}
