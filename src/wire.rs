use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::LendTrackAuthSource;
use crate::engine::{Engine, EngineError, Violation};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command, SqlError};

pub struct LendTrackHandler {
    engine: Arc<Engine>,
    query_parser: Arc<LendTrackQueryParser>,
}

impl LendTrackHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(LendTrackQueryParser),
        }
    }

    /// Parse, execute and record metrics for one statement. `format` is the
    /// client's requested result format; `None` means text.
    async fn run(&self, query: &str, format: Option<&Format>) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(query).map_err(|e| {
            metrics::counter!(
                observability::QUERIES_TOTAL,
                "command" => "unparsed",
                "status" => "error"
            )
            .increment(1);
            sql_err(e)
        })?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(cmd, format).await;
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        result
    }

    async fn execute_command(
        &self,
        cmd: Command,
        format: Option<&Format>,
    ) -> PgWireResult<Response> {
        let engine = &self.engine;
        match cmd {
            Command::InsertItem {
                id,
                name,
                description,
                is_lendable,
            } => {
                engine
                    .create_item(id, name, description, is_lendable)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::UpdateItem { id, changes } => {
                engine.update_item(id, changes).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::DeleteItem { id } => {
                engine.delete_item(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectItems { tag } => {
                let items = match tag {
                    Some(name) => engine.list_items_tagged(&name).await,
                    None => engine.list_items().await,
                };
                query_response(TableSchema::Items, format, items.iter(), encode_item)
            }
            Command::InsertUser { id, name } => {
                engine.create_user(id, name).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeleteUser { id } => {
                engine.delete_user(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectUsers => {
                let users = engine.list_users();
                query_response(TableSchema::Users, format, users.iter(), encode_user)
            }
            Command::InsertLend(lend) => {
                engine.create_lend(lend).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::UpdateLend { id, changes } => {
                engine.update_lend(id, changes).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::DeleteLend { id } => {
                engine.delete_lend(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectLends { item_id } => {
                let lends = engine.list_lends(item_id).await.map_err(engine_err)?;
                query_response(TableSchema::Lends, format, lends.iter(), encode_lend)
            }
            Command::InsertNote {
                id,
                subject,
                author_id,
                note_text,
                is_complaint,
            } => {
                engine
                    .add_note(id, subject, author_id, note_text, is_complaint)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeleteNote { id } => {
                engine.delete_note(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectNotes { subject } => {
                let notes = engine.list_notes(subject);
                query_response(TableSchema::Notes, format, notes.iter(), encode_note)
            }
            Command::CheckLend(candidate) => {
                let violations = engine.check_lend(&candidate).await.map_err(engine_err)?;
                query_response(TableSchema::LendCheck, format, violations.iter(), encode_violation)
            }
            Command::InsertTag {
                id,
                name,
                description,
            } => {
                engine
                    .create_tag(id, name, description)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::UpdateTag { id, changes } => {
                engine.update_tag(id, changes).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::DeleteTag { id } => {
                engine.delete_tag(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectTags => {
                let tags = engine.list_tags();
                query_response(TableSchema::Tags, format, tags.iter(), encode_tag)
            }
            Command::TagItem { item_id, tag_id } => {
                engine.tag_item(item_id, tag_id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::UntagItem { item_id, tag_id } => {
                engine.untag_item(item_id, tag_id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectItemTags { item_id, tag_id } => {
                let rows = engine
                    .list_item_tags(item_id, tag_id)
                    .await
                    .map_err(engine_err)?;
                query_response(TableSchema::ItemTags, format, rows.iter(), encode_item_tag)
            }
        }
    }
}

// ── Result schemas and row encoding ──────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TableSchema {
    Items,
    Users,
    Lends,
    Notes,
    LendCheck,
    Tags,
    ItemTags,
}

impl TableSchema {
    fn from_table(table: &str) -> Option<Self> {
        match table {
            "items" => Some(TableSchema::Items),
            "users" => Some(TableSchema::Users),
            "lends" => Some(TableSchema::Lends),
            "notes" => Some(TableSchema::Notes),
            "lend_check" => Some(TableSchema::LendCheck),
            "tags" => Some(TableSchema::Tags),
            "item_tags" => Some(TableSchema::ItemTags),
            _ => None,
        }
    }

    fn fields(self, format: Option<&Format>) -> Vec<FieldInfo> {
        let cols: Vec<(&str, Type)> = match self {
            TableSchema::Items => vec![
                ("id", Type::VARCHAR),
                ("name", Type::VARCHAR),
                ("description", Type::VARCHAR),
                ("is_lendable", Type::BOOL),
                ("lend_count", Type::INT8),
            ],
            TableSchema::Users => vec![("id", Type::VARCHAR), ("name", Type::VARCHAR)],
            TableSchema::Lends => vec![
                ("id", Type::VARCHAR),
                ("item_id", Type::VARCHAR),
                ("user_id", Type::VARCHAR),
                ("due_out", Type::VARCHAR),
                ("due_back", Type::VARCHAR),
                ("out", Type::VARCHAR),
                ("back", Type::VARCHAR),
            ],
            TableSchema::Notes => vec![
                ("id", Type::VARCHAR),
                ("subject", Type::VARCHAR),
                ("subject_id", Type::VARCHAR),
                ("author_id", Type::VARCHAR),
                ("note_text", Type::VARCHAR),
                ("note_date", Type::VARCHAR),
                ("is_complaint", Type::BOOL),
            ],
            TableSchema::LendCheck => vec![("kind", Type::VARCHAR), ("message", Type::VARCHAR)],
            TableSchema::Tags => vec![
                ("id", Type::VARCHAR),
                ("name", Type::VARCHAR),
                ("description", Type::VARCHAR),
            ],
            TableSchema::ItemTags => vec![("item_id", Type::VARCHAR), ("tag_id", Type::VARCHAR)],
        };
        cols.into_iter()
            .enumerate()
            .map(|(i, (name, ty))| {
                let field_format = format.map_or(FieldFormat::Text, |f| f.format_for(i));
                FieldInfo::new(name.into(), None, None, ty, field_format)
            })
            .collect()
    }
}

/// Schema of the rows a statement returns, judged from its text alone so it
/// works before `$n` parameters are bound.
fn statement_schema(sql: &str, format: Option<&Format>) -> Vec<FieldInfo> {
    let lower = sql.trim_start().to_lowercase();
    if !lower.starts_with("select") {
        return vec![];
    }
    lower
        .split_whitespace()
        .skip_while(|w| *w != "from")
        .nth(1)
        .map(|t| t.trim_end_matches(';').trim_matches('"'))
        .and_then(TableSchema::from_table)
        .map(|schema| schema.fields(format))
        .unwrap_or_default()
}

fn query_response<'a, T: 'a>(
    schema: TableSchema,
    format: Option<&Format>,
    rows: impl Iterator<Item = &'a T>,
    encode: fn(&mut DataRowEncoder, &T) -> PgWireResult<()>,
) -> PgWireResult<Response> {
    let schema = Arc::new(schema.fields(format));
    let rows: Vec<PgWireResult<_>> = rows
        .map(|row| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, row)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn fmt_day(d: Option<Day>) -> Option<String> {
    d.map(|d| d.format("%Y-%m-%d").to_string())
}

fn fmt_timestamp(t: Option<Timestamp>) -> Option<String> {
    t.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
}

fn encode_item(encoder: &mut DataRowEncoder, item: &ItemInfo) -> PgWireResult<()> {
    encoder.encode_field(&item.id.to_string())?;
    encoder.encode_field(&item.name)?;
    encoder.encode_field(&item.description)?;
    encoder.encode_field(&item.is_lendable)?;
    encoder.encode_field(&(item.lend_count as i64))
}

fn encode_user(encoder: &mut DataRowEncoder, user: &UserInfo) -> PgWireResult<()> {
    encoder.encode_field(&user.id.to_string())?;
    encoder.encode_field(&user.name)
}

fn encode_lend(encoder: &mut DataRowEncoder, lend: &LendRecord) -> PgWireResult<()> {
    encoder.encode_field(&lend.id.to_string())?;
    encoder.encode_field(&lend.item_id.to_string())?;
    encoder.encode_field(&lend.user_id.to_string())?;
    encoder.encode_field(&fmt_day(lend.due_out))?;
    encoder.encode_field(&fmt_day(lend.due_back))?;
    encoder.encode_field(&fmt_timestamp(lend.out))?;
    encoder.encode_field(&fmt_timestamp(lend.back))
}

fn encode_note(encoder: &mut DataRowEncoder, note: &Note) -> PgWireResult<()> {
    encoder.encode_field(&note.id.to_string())?;
    encoder.encode_field(&note.subject.kind().to_string())?;
    encoder.encode_field(&note.subject.id().to_string())?;
    encoder.encode_field(&note.author_id.to_string())?;
    encoder.encode_field(&note.note_text)?;
    encoder.encode_field(&fmt_timestamp(Some(note.note_date)))?;
    encoder.encode_field(&note.is_complaint)
}

fn encode_tag(encoder: &mut DataRowEncoder, tag: &TagInfo) -> PgWireResult<()> {
    encoder.encode_field(&tag.id.to_string())?;
    encoder.encode_field(&tag.name)?;
    encoder.encode_field(&tag.description)
}

fn encode_item_tag(encoder: &mut DataRowEncoder, row: &ItemTag) -> PgWireResult<()> {
    encoder.encode_field(&row.item_id.to_string())?;
    encoder.encode_field(&row.tag_id.to_string())
}

fn encode_violation(encoder: &mut DataRowEncoder, violation: &Violation) -> PgWireResult<()> {
    encoder.encode_field(&violation.kind().as_str().to_string())?;
    encoder.encode_field(&violation.to_string())
}

#[async_trait]
impl SimpleQueryHandler for LendTrackHandler {
    async fn do_query<C>(
        &self,
        _client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(vec![self.run(query, None).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct LendTrackQueryParser;

#[async_trait]
impl QueryParser for LendTrackQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(statement_schema(stmt, column_format))
    }
}

#[async_trait]
impl ExtendedQueryHandler for LendTrackHandler {
    type Statement = String;
    type QueryParser = LendTrackQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        _client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let sql = bind_params(&portal.statement.statement, &portal.parameters);
        self.run(&sql, Some(&portal.result_column_format)).await
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(
            param_types,
            statement_schema(&target.statement, None),
        ))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(statement_schema(
            &target.statement.statement,
            Some(&target.result_column_format),
        )))
    }
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            i += 1;
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if i > start
                && let Ok(n) = sql[start..i].parse::<usize>()
            {
                max = max.max(n);
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Replace `$1`, `$2`, ... with the bound values (text format) as quoted
/// literals, in one left-to-right pass over the statement. Bound values are
/// never rescanned. Placeholders inside quoted literals and numbers with no
/// bound value are left alone.
fn bind_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.char_indices().peekable();
    let mut in_literal = false;

    while let Some((i, c)) = chars.next() {
        if c == '\'' {
            in_literal = !in_literal;
            out.push(c);
            continue;
        }
        if c != '$' || in_literal {
            out.push(c);
            continue;
        }
        let start = i + 1;
        let mut end = start;
        while let Some(&(j, d)) = chars.peek() {
            if !d.is_ascii_digit() {
                break;
            }
            end = j + 1;
            chars.next();
        }
        let bound = sql[start..end]
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|idx| params.get(idx));
        match bound {
            Some(Some(bytes)) => {
                let text = String::from_utf8_lossy(bytes.as_ref());
                out.push('\'');
                out.push_str(&text.replace('\'', "''"));
                out.push('\'');
            }
            Some(None) => out.push_str("NULL"),
            None => out.push_str(&sql[i..end]),
        }
    }

    out
}

// ── Factory ──────────────────────────────────────────────────────

pub struct LendTrackFactory {
    handler: Arc<LendTrackHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<LendTrackAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl LendTrackFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        let auth_source = LendTrackAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(LendTrackHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for LendTrackFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = Arc::new(LendTrackFactory::new(engine, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Error mapping ────────────────────────────────────────────────

/// SQLSTATE for an engine error: 23P01 when a lend only collides with
/// existing ones, 23514 when it breaks a structural or ordering rule.
fn engine_sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Invalid(errors) if errors.only_conflicts() => "23P01",
        EngineError::Invalid(_) => "23514",
        _ => "P0001",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        engine_sqlstate(&e).into(),
        e.to_string(),
    )))
}

fn sql_err(e: SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}
