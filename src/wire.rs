use std::fmt::Debug;
use std::io;
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

use crate::auth::DirectoryAuthSource;
use crate::engine::{Engine, EngineError, ErrorKind, ReservationFilter, ReservationRequest};
use crate::identity::IdentityProvider;
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command};

pub struct CourtbookHandler {
    engine: Arc<Engine>,
    identity: Arc<dyn IdentityProvider>,
    query_parser: Arc<CourtbookQueryParser>,
}

impl CourtbookHandler {
    pub fn new(engine: Arc<Engine>, identity: Arc<dyn IdentityProvider>) -> Self {
        Self {
            engine,
            identity,
            query_parser: Arc::new(CourtbookQueryParser),
        }
    }

    /// The login user, already verified by the startup handler.
    async fn resolve_actor<C: ClientInfo>(&self, client: &C) -> PgWireResult<Actor> {
        let user = client
            .metadata()
            .get("user")
            .cloned()
            .ok_or_else(|| user_error("28000", "no user on connection".into()))?;
        self.identity
            .profile(&UserId::new(user))
            .await
            .map_err(|e| user_error("28000", e.to_string()))
    }

    async fn run(&self, actor: &Actor, sql: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(actor, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, actor: &Actor, cmd: Command) -> PgWireResult<Response> {
        match cmd {
            Command::InsertReservation {
                facility_id,
                date,
                start,
                end,
                label,
            } => {
                let mut req = ReservationRequest::new(facility_id, date, start, end);
                req.label = label;
                let reservation = self
                    .engine
                    .create_reservation(actor, req)
                    .await
                    .map_err(engine_err)?;
                reservation_rows(vec![reservation])
            }
            Command::DeleteReservation { id } => {
                self.engine
                    .cancel_reservation(actor, id)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::InsertApproval { reservation_id } => {
                self.engine
                    .approve_reservation(actor, reservation_id)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::SelectAvailability { facility_id, date } => {
                let full = self
                    .engine
                    .availability(&facility_id, date)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(availability_schema());
                let date_str = date.to_string();
                let rows: Vec<PgWireResult<_>> = full
                    .into_iter()
                    .map(|span| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&facility_id.as_str())?;
                        encoder.encode_field(&date_str)?;
                        encoder.encode_field(&format_time_of_day(span.start))?;
                        encoder.encode_field(&format_time_of_day(span.end))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectReservations {
                facility_id,
                date,
                include_cancelled,
            } => {
                let filter = ReservationFilter {
                    facility_id,
                    date,
                    include_cancelled,
                };
                reservation_rows(self.engine.list_reservations(actor, &filter).await)
            }
            Command::SelectFacilities { date } => {
                let date = date.unwrap_or_else(|| chrono::Local::now().date_naive());
                let overview = self.engine.facility_overview(date).await;
                let schema = Arc::new(facilities_schema());
                let rows: Vec<PgWireResult<_>> = overview
                    .into_iter()
                    .map(|s| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&s.facility.id.as_str())?;
                        encoder.encode_field(&s.facility.display_label())?;
                        encoder.encode_field(&s.facility.kind)?;
                        encoder.encode_field(&s.facility.status.as_str())?;
                        encoder.encode_field(&(s.facility.max_capacity as i64))?;
                        encoder.encode_field(&(s.occupancy as i64))?;
                        encoder.encode_field(&s.date.to_string())?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectProfile => {
                let schema = Arc::new(profile_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&actor.user_id.as_str())?;
                encoder.encode_field(&actor.name)?;
                encoder.encode_field(&actor.role.as_str())?;
                let rows = vec![Ok(encoder.take_row())];
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
        }
    }
}

fn reservation_rows(reservations: Vec<Reservation>) -> PgWireResult<Response> {
    let schema = Arc::new(reservation_schema());
    let rows: Vec<PgWireResult<_>> = reservations
        .into_iter()
        .map(|r| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&r.id.to_string())?;
            encoder.encode_field(&r.facility_id.as_str())?;
            encoder.encode_field(&r.date.to_string())?;
            encoder.encode_field(&format_time_of_day(r.span.start))?;
            encoder.encode_field(&format_time_of_day(r.span.end))?;
            encoder.encode_field(&r.status.as_str())?;
            encoder.encode_field(&r.owner.as_str())?;
            encoder.encode_field(&r.requester_name)?;
            encoder.encode_field(&r.created_at)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        text_field("facility_id"),
        text_field("date"),
        text_field("start_time"),
        text_field("end_time"),
    ]
}

fn reservation_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("facility_id"),
        text_field("date"),
        text_field("start_time"),
        text_field("end_time"),
        text_field("status"),
        text_field("user_id"),
        text_field("requester_name"),
        int_field("created_at"),
    ]
}

fn facilities_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("name"),
        text_field("type"),
        text_field("status"),
        int_field("max_capacity"),
        int_field("occupancy"),
        text_field("date"),
    ]
}

fn profile_schema() -> Vec<FieldInfo> {
    vec![text_field("user_id"), text_field("name"), text_field("role")]
}

/// Result columns of a statement, judged from its text so that unbound
/// `$n` placeholders don't matter.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    if upper.contains("INSERT") {
        if upper.contains("RESERVATIONS") {
            reservation_schema()
        } else {
            vec![]
        }
    } else if !upper.contains("SELECT") {
        vec![]
    } else if upper.contains("AVAILABILITY") {
        availability_schema()
    } else if upper.contains("RESERVATIONS") {
        reservation_schema()
    } else if upper.contains("FACILITIES") {
        facilities_schema()
    } else if upper.contains("PROFILE") {
        profile_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for CourtbookHandler {
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
        let actor = self.resolve_actor(client).await?;
        Ok(vec![self.run(&actor, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct CourtbookQueryParser;

#[async_trait]
impl QueryParser for CourtbookQueryParser {
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
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for CourtbookHandler {
    type Statement = String;
    type QueryParser = CourtbookQueryParser;

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
        let actor = self.resolve_actor(client).await?;
        let sql = substitute_params(portal);
        self.run(&actor, &sql).await
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
        Ok(DescribeStatementResponse::new(param_types, result_schema(&target.statement)))
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
        Ok(DescribePortalResponse::new(result_schema(&target.statement.statement)))
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

/// Bind text-format parameters into the statement.
fn substitute_params(portal: &Portal<String>) -> String {
    let params: Vec<Option<String>> = portal
        .parameters
        .iter()
        .map(|p| p.as_ref().map(|bytes| String::from_utf8_lossy(bytes).into_owned()))
        .collect();
    bind_params(&portal.statement.statement, &params)
}

/// One left-to-right pass: each `$N` outside a string literal becomes the
/// quoted value of parameter N. Bound values are never rescanned.
fn bind_params(sql: &str, params: &[Option<String>]) -> String {
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
        let digits_start = i + 1;
        let mut digits_end = digits_start;
        while let Some(&(j, d)) = chars.peek() {
            if !d.is_ascii_digit() {
                break;
            }
            digits_end = j + 1;
            chars.next();
        }
        let slot = sql[digits_start..digits_end]
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|idx| params.get(idx));
        match slot {
            Some(Some(value)) => {
                out.push('\'');
                out.push_str(&value.replace('\'', "''"));
                out.push('\'');
            }
            Some(None) => out.push_str("NULL"),
            None => out.push_str(&sql[i..digits_end]),
        }
    }
    out
}

// ── Factory ──────────────────────────────────────────────────────

pub struct CourtbookFactory {
    handler: Arc<CourtbookHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<DirectoryAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl CourtbookFactory {
    pub fn new(engine: Arc<Engine>, identity: Arc<dyn IdentityProvider>) -> Self {
        let auth_source = DirectoryAuthSource::new(identity.clone());
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(CourtbookHandler::new(engine, identity)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for CourtbookFactory {
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

/// Serve one client until it disconnects.
pub async fn process_connection(
    socket: TcpStream,
    factory: Arc<CourtbookFactory>,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

pub fn sqlstate(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::InvalidInterval | ErrorKind::Validation => "22023",
        ErrorKind::FacilityNotFound => "42704",
        ErrorKind::FacilityUnavailable => "55000",
        ErrorKind::NotFound => "P0002",
        ErrorKind::DuplicateRequest => "23505",
        ErrorKind::CapacityExceeded => "23P01",
        ErrorKind::Unauthorized => "42501",
        ErrorKind::TransactionConflict => "40001",
        ErrorKind::Timeout => "55P03",
        ErrorKind::Storage => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    let kind = e.kind();
    user_error(sqlstate(kind), format!("{}: {e}", kind.as_str()))
}

fn sql_err(e: crate::sql::SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}
