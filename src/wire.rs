use std::fmt::Debug;
use std::io;
use std::sync::Arc;

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
use ulid::Ulid;

use crate::auth::OpenLendAuthSource;
use crate::engine::{clamp_limit, Engine, EngineError, ErrorKind};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command, Role};

pub struct OpenLendHandler {
    engine: Arc<Engine>,
    query_parser: Arc<OpenLendQueryParser>,
}

impl OpenLendHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(OpenLendQueryParser),
        }
    }

    /// The session identity: the startup `user` parameter, which must be
    /// the acting user's ULID. Commands on the open user directory work
    /// without one; everything else requires it.
    fn session_user<C: ClientInfo>(client: &C) -> Option<Ulid> {
        client
            .metadata()
            .get("user")
            .and_then(|u| Ulid::from_string(u).ok())
    }

    fn require_session_user<C: ClientInfo>(client: &C) -> PgWireResult<Ulid> {
        Self::session_user(client).ok_or_else(|| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "28000".into(),
                "this command needs a session identity: connect with user=<your ULID>".into(),
            )))
        })
    }

    async fn execute_command<C: ClientInfo>(
        &self,
        client: &C,
        cmd: Command,
    ) -> PgWireResult<Vec<Response>> {
        let label = observability::command_label(&cmd);
        let start = std::time::Instant::now();
        let result = self.dispatch(client, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(start.elapsed().as_secs_f64());
        result
    }

    async fn dispatch<C: ClientInfo>(
        &self,
        client: &C,
        cmd: Command,
    ) -> PgWireResult<Vec<Response>> {
        let engine = &self.engine;
        match cmd {
            // ── users ────────────────────────────────────────
            Command::InsertUser { id, name, email } => {
                engine.create_user(id, name, email).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::UpdateUser { id, name, email } => {
                engine.update_user(id, name, email).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::DeleteUser { id } => {
                engine.delete_user(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::SelectUser { id } => {
                let user = engine.get_user(id).map_err(engine_err)?;
                Ok(vec![user_rows(vec![user])])
            }
            Command::SelectUsers => Ok(vec![user_rows(engine.list_users())]),

            // ── items ────────────────────────────────────────
            Command::InsertItem {
                id,
                name,
                description,
                available,
                request_id,
            } => {
                let owner = Self::require_session_user(client)?;
                engine
                    .create_item(id, owner, name, description, available, request_id)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::UpdateItem {
                id,
                name,
                description,
                available,
            } => {
                let acting = Self::require_session_user(client)?;
                engine
                    .update_item(acting, id, name, description, available)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::SelectItem { id } => {
                // Anonymous viewers get the non-owner projection.
                let acting = Self::session_user(client).unwrap_or_else(Ulid::nil);
                let view = engine.item_view(acting, id).await.map_err(engine_err)?;
                Ok(vec![item_rows(vec![view])])
            }
            Command::SelectOwnItems { offset, limit } => {
                let owner = Self::require_session_user(client)?;
                let views = engine
                    .items_by_owner(owner, offset, clamp_limit(limit))
                    .await
                    .map_err(engine_err)?;
                Ok(vec![item_rows(views)])
            }
            Command::SearchItems {
                query,
                offset,
                limit,
            } => {
                let views = engine.search_items(&query, offset, clamp_limit(limit)).await;
                Ok(vec![item_rows(views)])
            }
            Command::SelectItemsForRequest { request_id } => {
                let items = engine.items_for_request(request_id).await;
                Ok(vec![request_item_rows(items)])
            }

            // ── bookings ─────────────────────────────────────
            Command::InsertBooking {
                id,
                item_id,
                start,
                end,
            } => {
                let booker = Self::require_session_user(client)?;
                engine
                    .create_booking(id, booker, item_id, Window { start, end })
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::UpdateBooking { id, approved } => {
                let acting = Self::require_session_user(client)?;
                engine
                    .decide_booking(acting, id, approved)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::SelectBooking { id } => {
                let acting = Self::require_session_user(client)?;
                let view = engine.get_booking(acting, id).await.map_err(engine_err)?;
                Ok(vec![booking_rows(vec![view])])
            }
            Command::SelectBookings {
                role,
                state,
                offset,
                limit,
            } => {
                let subject = Self::require_session_user(client)?;
                let state = state.as_deref().unwrap_or("ALL");
                let limit = clamp_limit(limit);
                let views = match role {
                    Role::Booker => engine.bookings_for_booker(subject, state, offset, limit).await,
                    Role::Owner => engine.bookings_for_owner(subject, state, offset, limit).await,
                }
                .map_err(engine_err)?;
                Ok(vec![booking_rows(views)])
            }

            // ── comments ─────────────────────────────────────
            Command::InsertComment { id, item_id, text } => {
                let author = Self::require_session_user(client)?;
                engine
                    .add_comment(id, item_id, author, text)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::SelectComments { item_id } => {
                let views = engine.comments_for_item(item_id).await.map_err(engine_err)?;
                Ok(vec![comment_rows(views)])
            }

            // ── requests ─────────────────────────────────────
            Command::InsertRequest { id, description } => {
                let requester = Self::require_session_user(client)?;
                engine
                    .create_request(id, requester, description)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::SelectRequest { id } => {
                let acting = Self::require_session_user(client)?;
                let view = engine.request_view(acting, id).await.map_err(engine_err)?;
                Ok(vec![request_rows(vec![view])])
            }
            Command::SelectOwnRequests { offset, limit } => {
                let acting = Self::require_session_user(client)?;
                let views = engine
                    .requests_by_user(acting, offset, clamp_limit(limit))
                    .await
                    .map_err(engine_err)?;
                Ok(vec![request_rows(views)])
            }
            Command::SelectAllRequests { offset, limit } => {
                let acting = Self::require_session_user(client)?;
                let views = engine
                    .all_requests(acting, offset, clamp_limit(limit))
                    .await
                    .map_err(engine_err)?;
                Ok(vec![request_rows(views)])
            }
        }
    }
}

// ── Row schemas & encoding ───────────────────────────────────────

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int8_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn bool_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::BOOL, FieldFormat::Text)
}

fn users_schema() -> Vec<FieldInfo> {
    vec![text_field("id"), text_field("name"), text_field("email")]
}

fn items_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("owner_id"),
        text_field("name"),
        text_field("description"),
        bool_field("available"),
        text_field("request_id"),
        int8_field("last_start"),
        int8_field("last_end"),
        int8_field("next_start"),
        int8_field("next_end"),
        int8_field("comments"),
    ]
}

fn request_items_schema() -> Vec<FieldInfo> {
    vec![text_field("id"), text_field("owner_id"), text_field("name")]
}

fn bookings_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("item_id"),
        text_field("item_name"),
        text_field("booker_id"),
        int8_field("start"),
        int8_field("end"),
        text_field("status"),
    ]
}

fn comments_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("item_id"),
        text_field("author_id"),
        text_field("author_name"),
        text_field("text"),
        int8_field("created_at"),
    ]
}

fn requests_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("requester_id"),
        text_field("description"),
        int8_field("created_at"),
        int8_field("items"),
    ]
}

fn user_rows(users: Vec<User>) -> Response {
    let schema = Arc::new(users_schema());
    let rows: Vec<PgWireResult<_>> = users
        .into_iter()
        .map(|u| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&u.id.to_string())?;
            encoder.encode_field(&u.name)?;
            encoder.encode_field(&u.email)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn item_rows(items: Vec<ItemView>) -> Response {
    let schema = Arc::new(items_schema());
    let rows: Vec<PgWireResult<_>> = items
        .into_iter()
        .map(|i| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&i.id.to_string())?;
            encoder.encode_field(&i.owner_id.to_string())?;
            encoder.encode_field(&i.name)?;
            encoder.encode_field(&i.description)?;
            encoder.encode_field(&i.available)?;
            encoder.encode_field(&i.request_id.map(|r| r.to_string()))?;
            encoder.encode_field(&i.last_booking.map(|b| b.start))?;
            encoder.encode_field(&i.last_booking.map(|b| b.end))?;
            encoder.encode_field(&i.next_booking.map(|b| b.start))?;
            encoder.encode_field(&i.next_booking.map(|b| b.end))?;
            encoder.encode_field(&(i.comment_count as i64))?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn request_item_rows(items: Vec<RequestItemView>) -> Response {
    let schema = Arc::new(request_items_schema());
    let rows: Vec<PgWireResult<_>> = items
        .into_iter()
        .map(|i| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&i.id.to_string())?;
            encoder.encode_field(&i.owner_id.to_string())?;
            encoder.encode_field(&i.name)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn booking_rows(bookings: Vec<BookingView>) -> Response {
    let schema = Arc::new(bookings_schema());
    let rows: Vec<PgWireResult<_>> = bookings
        .into_iter()
        .map(|b| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&b.id.to_string())?;
            encoder.encode_field(&b.item_id.to_string())?;
            encoder.encode_field(&b.item_name)?;
            encoder.encode_field(&b.booker_id.to_string())?;
            encoder.encode_field(&b.start)?;
            encoder.encode_field(&b.end)?;
            encoder.encode_field(&b.status.as_str())?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn comment_rows(comments: Vec<CommentView>) -> Response {
    let schema = Arc::new(comments_schema());
    let rows: Vec<PgWireResult<_>> = comments
        .into_iter()
        .map(|c| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&c.id.to_string())?;
            encoder.encode_field(&c.item_id.to_string())?;
            encoder.encode_field(&c.author_id.to_string())?;
            encoder.encode_field(&c.author_name)?;
            encoder.encode_field(&c.text)?;
            encoder.encode_field(&c.created_at)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn request_rows(requests: Vec<RequestView>) -> Response {
    let schema = Arc::new(requests_schema());
    let rows: Vec<PgWireResult<_>> = requests
        .into_iter()
        .map(|r| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&r.id.to_string())?;
            encoder.encode_field(&r.requester_id.to_string())?;
            encoder.encode_field(&r.description)?;
            encoder.encode_field(&r.created_at)?;
            encoder.encode_field(&(r.items.len() as i64))?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

/// Schema for a statement, keyed off the table it reads. Used by the
/// extended-protocol describe flow.
fn schema_for_statement(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    if !upper.contains("SELECT") {
        return vec![];
    }
    if upper.contains("FROM USERS") {
        users_schema()
    } else if upper.contains("FROM ITEMS") && upper.contains("REQUEST_ID") {
        request_items_schema()
    } else if upper.contains("FROM ITEMS") {
        items_schema()
    } else if upper.contains("FROM BOOKINGS") {
        bookings_schema()
    } else if upper.contains("FROM COMMENTS") {
        comments_schema()
    } else if upper.contains("FROM REQUESTS") {
        requests_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for OpenLendHandler {
    async fn do_query<C>(
        &self,
        client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        self.execute_command(client, cmd).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct OpenLendQueryParser;

#[async_trait]
impl QueryParser for OpenLendQueryParser {
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
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(schema_for_statement(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for OpenLendHandler {
    type Statement = String;
    type QueryParser = OpenLendQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let sql = substitute_params(portal);
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        let mut responses = self.execute_command(client, cmd).await?;
        Ok(responses.remove(0))
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
            schema_for_statement(&target.statement),
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
        Ok(DescribePortalResponse::new(schema_for_statement(
            &target.statement.statement,
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
            if i > start {
                if let Ok(n) = sql[start..i].parse::<usize>() {
                    if n > max {
                        max = n;
                    }
                }
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    let sql = portal.statement.statement.to_string();
    let params = &portal.parameters;
    let mut result = sql;

    for (i, param) in params.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }

    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct OpenLendFactory {
    handler: Arc<OpenLendHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<OpenLendAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl OpenLendFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        let auth_source = OpenLendAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(OpenLendHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for OpenLendFactory {
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

/// Serve one client connection to completion.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = OpenLendFactory::new(engine, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

fn engine_err(e: EngineError) -> PgWireError {
    let code = match e.kind() {
        ErrorKind::NotFound => "P0002",
        ErrorKind::Validation => "22023",
        ErrorKind::Conflict => "P0001",
        ErrorKind::Fault => "XX000",
    };
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        e.to_string(),
    )))
}

fn sql_err(e: crate::sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}
