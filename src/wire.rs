use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveTime};
use futures::Sink;
use futures::stream;
use pgwire::api::auth::StartupHandler;
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
use tracing::debug;

use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command, SqlError};

pub struct RoomLedgerHandler {
    engine: Arc<Engine>,
    query_parser: Arc<RoomLedgerQueryParser>,
}

impl RoomLedgerHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(RoomLedgerQueryParser),
        }
    }

    async fn run_sql(&self, sql: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(sql).map_err(|e| {
            metrics::counter!(observability::QUERIES_TOTAL, "command" => "invalid", "status" => "error")
                .increment(1);
            sql_err(e)
        })?;
        let label = observability::command_label(&cmd);
        debug!(command = label, "executing");

        let started = Instant::now();
        let result = self.execute_command(cmd).await;
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        result
    }

    async fn execute_command(&self, cmd: Command) -> PgWireResult<Response> {
        let engine = &self.engine;
        match cmd {
            Command::InsertRoom { room } => {
                engine.create_room(room).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::UpdateRoom { patch } => {
                let current = engine.room_info(patch.id).await.map_err(engine_err)?;
                engine
                    .update_room(patch.apply(current))
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeleteRoom { id } => {
                engine.delete_room(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::InsertLesson { lesson } => {
                engine.book_lesson(lesson).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::BatchInsertLessons { lessons } => {
                let ids = engine.book_lessons(lessons).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(ids.len())))
            }
            Command::DeleteLesson { id } => {
                engine.cancel_lesson(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectRooms => {
                let rooms = engine.list_rooms().await;
                Ok(rows_response(rooms_schema(), rooms.iter(), encode_room))
            }
            Command::SelectFreeRooms {
                date,
                start,
                end,
                filter,
            } => {
                let rooms = engine
                    .find_free(date, start, end, &filter)
                    .await
                    .map_err(engine_err)?;
                Ok(rows_response(rooms_schema(), rooms.iter(), encode_room))
            }
            Command::SelectLessons { date, room_id } => {
                let lessons = match (date, room_id) {
                    (Some(date), room_id) => engine.schedule(date, room_id).await.map_err(engine_err)?,
                    (None, Some(room_id)) => {
                        let room = engine.room_info(room_id).await.map_err(engine_err)?;
                        engine
                            .room_lessons(room_id)
                            .await
                            .map_err(engine_err)?
                            .into_iter()
                            .map(|lesson| ScheduledLesson {
                                lesson,
                                room_number: room.number.clone(),
                                building: room.building.clone(),
                            })
                            .collect()
                    }
                    (None, None) => return Err(sql_err(SqlError::MissingFilter("date or room_id"))),
                };
                Ok(rows_response(lessons_schema(), lessons.iter(), encode_lesson))
            }
            Command::SelectConflictCheck {
                room_id,
                date,
                start,
                end,
            } => {
                let conflict = engine
                    .has_conflict(room_id, date, start, end)
                    .await
                    .map_err(engine_err)?;
                let row = (room_id.to_string(), date, start, end, conflict);
                Ok(rows_response(conflict_schema(), std::iter::once(&row), |enc, row| {
                    enc.encode_field(&row.0)?;
                    enc.encode_field(&fmt_date(row.1))?;
                    enc.encode_field(&fmt_time(row.2))?;
                    enc.encode_field(&fmt_time(row.3))?;
                    enc.encode_field(&row.4)
                }))
            }
            Command::SelectRoomAvailability {
                room_id,
                date,
                start,
                end,
            } => {
                let windows = engine
                    .room_availability(room_id, date, start, end)
                    .await
                    .map_err(engine_err)?;
                let rid = room_id.to_string();
                Ok(rows_response(availability_schema(), windows.iter(), |enc, span| {
                    enc.encode_field(&rid)?;
                    enc.encode_field(&fmt_date(date))?;
                    enc.encode_field(&fmt_time(span.start))?;
                    enc.encode_field(&fmt_time(span.end))?;
                    enc.encode_field(&span.minutes())
                }))
            }
            Command::SelectOccupancyReport => {
                let report = engine.occupancy_report().await;
                Ok(rows_response(occupancy_schema(), report.iter(), |enc, row| {
                    enc.encode_field(&row.room_id.to_string())?;
                    enc.encode_field(&row.number)?;
                    enc.encode_field(&row.building)?;
                    enc.encode_field(&row.floor)?;
                    enc.encode_field(&i64::from(row.capacity))?;
                    enc.encode_field(&(row.lesson_count as i64))?;
                    enc.encode_field(&row.occupancy_rate)
                }))
            }
            Command::SelectEquipmentReport => {
                let report = engine.equipment_report().await;
                Ok(rows_response(equipment_schema(), report.iter(), |enc, row| {
                    enc.encode_field(&row.room_id.to_string())?;
                    enc.encode_field(&row.number)?;
                    enc.encode_field(&row.building)?;
                    enc.encode_field(&row.has_projector)?;
                    enc.encode_field(&i64::from(row.computers_count))?;
                    enc.encode_field(&row.has_board)?;
                    enc.encode_field(&row.has_air_conditioner)
                }))
            }
            Command::SelectStats { date } => {
                let date = date.unwrap_or_else(|| chrono::Local::now().date_naive());
                let stats = engine.stats(date).await;
                Ok(rows_response(stats_schema(), std::iter::once(&stats), |enc, s| {
                    enc.encode_field(&fmt_date(date))?;
                    enc.encode_field(&(s.total_rooms as i64))?;
                    enc.encode_field(&(s.total_lessons as i64))?;
                    enc.encode_field(&(s.lessons_on_date as i64))?;
                    enc.encode_field(&(s.busy_rooms as i64))?;
                    enc.encode_field(&(s.free_rooms as i64))
                }))
            }
        }
    }
}

// ── Result sets ──────────────────────────────────────────────────

fn rows_response<'a, T: 'a>(
    schema: Vec<FieldInfo>,
    items: impl Iterator<Item = &'a T>,
    mut encode: impl FnMut(&mut DataRowEncoder, &T) -> PgWireResult<()>,
) -> Response {
    let schema = Arc::new(schema);
    let rows: Vec<PgWireResult<_>> = items
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn encode_room(enc: &mut DataRowEncoder, room: &Room) -> PgWireResult<()> {
    let eq = &room.equipment;
    enc.encode_field(&room.id.to_string())?;
    enc.encode_field(&room.number)?;
    enc.encode_field(&room.building)?;
    enc.encode_field(&room.floor)?;
    enc.encode_field(&i64::from(room.capacity))?;
    enc.encode_field(&room.area)?;
    enc.encode_field(&eq.has_projector)?;
    enc.encode_field(&eq.has_computers)?;
    enc.encode_field(&eq.has_board)?;
    enc.encode_field(&eq.has_air_conditioner)?;
    enc.encode_field(&i64::from(eq.computers_count))
}

fn encode_lesson(enc: &mut DataRowEncoder, s: &ScheduledLesson) -> PgWireResult<()> {
    let l = &s.lesson;
    enc.encode_field(&l.id.to_string())?;
    enc.encode_field(&l.room_id.to_string())?;
    enc.encode_field(&s.room_number)?;
    enc.encode_field(&s.building)?;
    enc.encode_field(&fmt_date(l.date))?;
    enc.encode_field(&fmt_time(l.span.start))?;
    enc.encode_field(&fmt_time(l.span.end))?;
    enc.encode_field(&l.group_name)?;
    enc.encode_field(&l.teacher_name)?;
    enc.encode_field(&l.subject_name)
}

fn fmt_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

fn fmt_time(time: NaiveTime) -> String {
    time.format("%H:%M:%S").to_string()
}

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn rooms_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("number", Type::VARCHAR),
        field("building", Type::VARCHAR),
        field("floor", Type::INT4),
        field("capacity", Type::INT8),
        field("area", Type::FLOAT8),
        field("has_projector", Type::BOOL),
        field("has_computers", Type::BOOL),
        field("has_board", Type::BOOL),
        field("has_air_conditioner", Type::BOOL),
        field("computers_count", Type::INT8),
    ]
}

fn lessons_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("room_id", Type::VARCHAR),
        field("room_number", Type::VARCHAR),
        field("building", Type::VARCHAR),
        field("date", Type::DATE),
        field("start", Type::TIME),
        field("end", Type::TIME),
        field("group_name", Type::VARCHAR),
        field("teacher_name", Type::VARCHAR),
        field("subject_name", Type::VARCHAR),
    ]
}

fn conflict_schema() -> Vec<FieldInfo> {
    vec![
        field("room_id", Type::VARCHAR),
        field("date", Type::DATE),
        field("start", Type::TIME),
        field("end", Type::TIME),
        field("conflict", Type::BOOL),
    ]
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        field("room_id", Type::VARCHAR),
        field("date", Type::DATE),
        field("start", Type::TIME),
        field("end", Type::TIME),
        field("minutes", Type::INT8),
    ]
}

fn occupancy_schema() -> Vec<FieldInfo> {
    vec![
        field("room_id", Type::VARCHAR),
        field("number", Type::VARCHAR),
        field("building", Type::VARCHAR),
        field("floor", Type::INT4),
        field("capacity", Type::INT8),
        field("lesson_count", Type::INT8),
        field("occupancy_rate", Type::FLOAT8),
    ]
}

fn equipment_schema() -> Vec<FieldInfo> {
    vec![
        field("room_id", Type::VARCHAR),
        field("number", Type::VARCHAR),
        field("building", Type::VARCHAR),
        field("has_projector", Type::BOOL),
        field("computers_count", Type::INT8),
        field("has_board", Type::BOOL),
        field("has_air_conditioner", Type::BOOL),
    ]
}

fn stats_schema() -> Vec<FieldInfo> {
    vec![
        field("date", Type::DATE),
        field("total_rooms", Type::INT8),
        field("total_lessons", Type::INT8),
        field("lessons_on_date", Type::INT8),
        field("busy_rooms", Type::INT8),
        field("free_rooms", Type::INT8),
    ]
}

/// Table named after the first FROM in a SELECT, lowercased.
fn select_table(sql: &str) -> Option<String> {
    let lower = sql.to_lowercase();
    if !lower.trim_start().starts_with("select") {
        return None;
    }
    let mut words = lower.split_whitespace();
    words.find(|w| *w == "from")?;
    words
        .next()
        .map(|t| t.trim_matches(|c| c == '"' || c == ';').to_string())
}

/// Result columns a statement will produce, without running it.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    match select_table(sql).as_deref() {
        Some("rooms" | "free_rooms") => rooms_schema(),
        Some("lessons") => lessons_schema(),
        Some("conflict_check") => conflict_schema(),
        Some("room_availability") => availability_schema(),
        Some("occupancy_report") => occupancy_schema(),
        Some("equipment_report") => equipment_schema(),
        Some("stats") => stats_schema(),
        _ => Vec::new(),
    }
}

#[async_trait]
impl SimpleQueryHandler for RoomLedgerHandler {
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
        Ok(vec![self.run_sql(query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct RoomLedgerQueryParser;

#[async_trait]
impl QueryParser for RoomLedgerQueryParser {
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
impl ExtendedQueryHandler for RoomLedgerHandler {
    type Statement = String;
    type QueryParser = RoomLedgerQueryParser;

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
        self.run_sql(&sql).await
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
            result_schema(&target.statement),
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
        Ok(DescribePortalResponse::new(result_schema(
            &target.statement.statement,
        )))
    }
}

/// Highest `$N` placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut max = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        i += 1;
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if let Ok(n) = sql[start..i].parse::<usize>() {
            max = max.max(n);
        }
    }
    max
}

/// Substitute `$1`, `$2`, ... with bound parameter values as quoted text.
/// One left-to-right pass: placeholders inside quoted literals or identifiers,
/// and text that came from a bound value, are never rewritten.
fn bind_params<P: AsRef<[u8]>>(sql: &str, params: &[Option<P>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.char_indices().peekable();
    let mut quote = None;
    while let Some((i, c)) = chars.next() {
        match quote {
            Some(q) => {
                if c == q {
                    quote = None;
                }
                out.push(c);
            }
            None if c == '\'' || c == '"' => {
                quote = Some(c);
                out.push(c);
            }
            None if c == '$' => {
                let mut end = i + 1;
                while let Some(&(j, d)) = chars.peek() {
                    if !d.is_ascii_digit() {
                        break;
                    }
                    end = j + 1;
                    chars.next();
                }
                let param = sql[i + 1..end]
                    .parse::<usize>()
                    .ok()
                    .and_then(|n| n.checked_sub(1))
                    .and_then(|n| params.get(n));
                match param {
                    Some(Some(bytes)) => {
                        out.push('\'');
                        out.push_str(&String::from_utf8_lossy(bytes.as_ref()).replace('\'', "''"));
                        out.push('\'');
                    }
                    Some(None) => out.push_str("NULL"),
                    None => out.push_str(&sql[i..end]),
                }
            }
            None => out.push(c),
        }
    }
    out
}

// ── Factory ──────────────────────────────────────────────────────

pub struct RoomLedgerFactory {
    handler: Arc<RoomLedgerHandler>,
    noop: Arc<NoopHandler>,
}

impl RoomLedgerFactory {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            handler: Arc::new(RoomLedgerHandler::new(engine)),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for RoomLedgerFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.noop.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = Arc::new(RoomLedgerFactory::new(engine));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

/// SQLSTATE for each engine failure.
pub fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::InvalidTimeRange { .. } => "22007",
        EngineError::ConflictDetected(_) => "23P01",
        EngineError::NotFound(_) => "02000",
        EngineError::ReferentialBlock { .. } => "23503",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::InvalidRoom(_) => "22023",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::PersistenceFailure(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(&e).into(),
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
