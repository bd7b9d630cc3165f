use chrono::{NaiveDate, NaiveTime};
use sqlparser::ast::{
    self, BinaryOperator, Expr, FromTable, Ident, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, UnaryOperator, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;
use ulid::Ulid;

use crate::engine::{LessonRequest, RoomFilter};
use crate::limits::MAX_SQL_LEN;
use crate::model::*;

const ROOM_COLUMNS: &[&str] = &[
    "id",
    "number",
    "building",
    "floor",
    "capacity",
    "area",
    "has_projector",
    "has_computers",
    "has_board",
    "has_air_conditioner",
    "computers_count",
];

const LESSON_COLUMNS: &[&str] = &[
    "id",
    "room_id",
    "date",
    "start",
    "end",
    "group_name",
    "teacher_name",
    "subject_name",
];

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertRoom {
        room: Room,
    },
    UpdateRoom {
        patch: RoomPatch,
    },
    DeleteRoom {
        id: Ulid,
    },
    InsertLesson {
        lesson: LessonRequest,
    },
    BatchInsertLessons {
        lessons: Vec<LessonRequest>,
    },
    DeleteLesson {
        id: Ulid,
    },
    SelectRooms,
    /// At least one of the two filters is set.
    SelectLessons {
        date: Option<NaiveDate>,
        room_id: Option<Ulid>,
    },
    SelectConflictCheck {
        room_id: Ulid,
        date: NaiveDate,
        start: NaiveTime,
        end: NaiveTime,
    },
    SelectFreeRooms {
        date: NaiveDate,
        start: NaiveTime,
        end: NaiveTime,
        filter: RoomFilter,
    },
    SelectRoomAvailability {
        room_id: Ulid,
        date: NaiveDate,
        start: NaiveTime,
        end: NaiveTime,
    },
    SelectOccupancyReport,
    SelectEquipmentReport,
    SelectStats {
        date: Option<NaiveDate>,
    },
}

/// Columns given in an `INSERT INTO room_edits`; unset fields keep their value.
#[derive(Debug, Clone, PartialEq)]
pub struct RoomPatch {
    pub id: Ulid,
    pub number: Option<String>,
    pub building: Option<String>,
    pub floor: Option<i32>,
    pub capacity: Option<u32>,
    pub area: Option<f64>,
    pub has_projector: Option<bool>,
    pub has_computers: Option<bool>,
    pub has_board: Option<bool>,
    pub has_air_conditioner: Option<bool>,
    pub computers_count: Option<u32>,
}

impl RoomPatch {
    pub fn apply(&self, mut room: Room) -> Room {
        if let Some(v) = &self.number {
            room.number = v.clone();
        }
        if let Some(v) = &self.building {
            room.building = v.clone();
        }
        if let Some(v) = self.floor {
            room.floor = v;
        }
        if let Some(v) = self.capacity {
            room.capacity = v;
        }
        if let Some(v) = self.area {
            room.area = v;
        }
        let eq = &mut room.equipment;
        if let Some(v) = self.has_projector {
            eq.has_projector = v;
        }
        if let Some(v) = self.has_computers {
            eq.has_computers = v;
        }
        if let Some(v) = self.has_board {
            eq.has_board = v;
        }
        if let Some(v) = self.has_air_conditioner {
            eq.has_air_conditioner = v;
        }
        if let Some(v) = self.computers_count {
            eq.computers_count = v;
        }
        room
    }
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    if sql.len() > MAX_SQL_LEN {
        return Err(SqlError::TooLong);
    }
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let stmt = match stmts.as_slice() {
        [] => return Err(SqlError::Empty),
        [stmt] => stmt,
        _ => return Err(SqlError::Unsupported("multiple statements in one query".into())),
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

// ── INSERT ────────────────────────────────────────────────────

/// One VALUES row, keyed by column name.
struct Row<'a> {
    table: &'static str,
    cells: Vec<(String, &'a Expr)>,
}

impl<'a> Row<'a> {
    fn get(&self, col: &str) -> Option<&'a Expr> {
        self.cells
            .iter()
            .find(|(name, _)| name == col)
            .map(|(_, e)| *e)
            .filter(|e| !is_null(e))
    }

    fn require(&self, col: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(col).ok_or(SqlError::MissingColumn(self.table, col))
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let (table, columns): (&'static str, &[&str]) = match table.as_str() {
        "rooms" => ("rooms", ROOM_COLUMNS),
        "room_edits" => ("room_edits", ROOM_COLUMNS),
        "lessons" => ("lessons", LESSON_COLUMNS),
        _ => return Err(SqlError::UnknownTable(table)),
    };
    let rows = insert_rows(insert, table, columns)?;

    match table {
        "rooms" => {
            let [row] = rows.as_slice() else {
                return Err(SqlError::Unsupported("multi-row INSERT INTO rooms".into()));
            };
            Ok(Command::InsertRoom { room: room_from_row(row)? })
        }
        "room_edits" => {
            let [row] = rows.as_slice() else {
                return Err(SqlError::Unsupported("multi-row INSERT INTO room_edits".into()));
            };
            Ok(Command::UpdateRoom { patch: patch_from_row(row)? })
        }
        _ => {
            let mut lessons = rows
                .iter()
                .enumerate()
                .map(|(i, row)| {
                    lesson_from_row(row).map_err(|e| match rows.len() {
                        1 => e,
                        _ => SqlError::Parse(format!("row {}: {e}", i + 1)),
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            if lessons.len() == 1 {
                let lesson = lessons.remove(0);
                Ok(Command::InsertLesson { lesson })
            } else {
                Ok(Command::BatchInsertLessons { lessons })
            }
        }
    }
}

fn insert_rows<'a>(
    insert: &'a ast::Insert,
    table: &'static str,
    known: &[&str],
) -> Result<Vec<Row<'a>>, SqlError> {
    let names: Vec<String> = if insert.columns.is_empty() {
        known.iter().map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(ident_name).collect()
    };
    if let Some(bad) = names.iter().find(|n| !known.contains(&n.as_str())) {
        return Err(SqlError::UnknownColumn(table, bad.clone()));
    }

    let source = insert.source.as_ref().ok_or(SqlError::Parse("no VALUES".into()))?;
    let SetExpr::Values(values) = source.body.as_ref() else {
        return Err(SqlError::Parse("expected VALUES".into()));
    };
    if values.rows.is_empty() {
        return Err(SqlError::Parse("empty VALUES".into()));
    }

    values
        .rows
        .iter()
        .map(|exprs| {
            let fits = if insert.columns.is_empty() {
                exprs.len() <= names.len()
            } else {
                exprs.len() == names.len()
            };
            if !fits {
                return Err(SqlError::WrongArity(table, names.len(), exprs.len()));
            }
            Ok(Row {
                table,
                cells: names.iter().cloned().zip(exprs.iter()).collect(),
            })
        })
        .collect()
}

fn room_from_row(row: &Row) -> Result<Room, SqlError> {
    let mut room = Room::new(
        parse_ulid(row.require("id")?)?,
        parse_text(row.require("number")?)?,
        parse_text(row.require("building")?)?,
    );
    let patch = patch_from_row(row)?;
    room = patch.apply(room);
    Ok(room)
}

fn patch_from_row(row: &Row) -> Result<RoomPatch, SqlError> {
    Ok(RoomPatch {
        id: parse_ulid(row.require("id")?)?,
        number: row.get("number").map(parse_text).transpose()?,
        building: row.get("building").map(parse_text).transpose()?,
        floor: row.get("floor").map(parse_i32).transpose()?,
        capacity: row.get("capacity").map(parse_u32).transpose()?,
        area: row.get("area").map(parse_f64).transpose()?,
        has_projector: row.get("has_projector").map(parse_bool).transpose()?,
        has_computers: row.get("has_computers").map(parse_bool).transpose()?,
        has_board: row.get("has_board").map(parse_bool).transpose()?,
        has_air_conditioner: row.get("has_air_conditioner").map(parse_bool).transpose()?,
        computers_count: row.get("computers_count").map(parse_u32).transpose()?,
    })
}

fn lesson_from_row(row: &Row) -> Result<LessonRequest, SqlError> {
    let id = match row.get("id") {
        Some(expr) => parse_ulid(expr)?,
        None => Ulid::new(),
    };
    Ok(LessonRequest {
        id,
        room_id: parse_ulid(row.require("room_id")?)?,
        date: parse_date(row.require("date")?)?,
        start: parse_time(row.require("start")?)?,
        end: parse_time(row.require("end")?)?,
        group_name: parse_text(row.require("group_name")?)?,
        teacher_name: parse_text(row.require("teacher_name")?)?,
        subject_name: parse_text(row.require("subject_name")?)?,
    })
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "rooms" => Ok(Command::DeleteRoom { id }),
        "lessons" => Ok(Command::DeleteLesson { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    let filters = Filters::collect(sel, &["id"])?;
    parse_ulid(filters.require("id")?)
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let SetExpr::Select(select) = query.body.as_ref() else {
        return Err(SqlError::Unsupported("non-SELECT query".into()));
    };
    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;

    let allowed: &[&str] = match table.as_str() {
        "rooms" | "occupancy_report" | "equipment_report" => &[],
        "lessons" => &["date", "room_id"],
        "conflict_check" | "room_availability" => &["room_id", "date", "start", "end"],
        "free_rooms" => &[
            "date",
            "start",
            "end",
            "min_capacity",
            "building",
            "has_projector",
            "has_computers",
        ],
        "stats" => &["date"],
        _ => return Err(SqlError::UnknownTable(table)),
    };
    let filters = match &select.selection {
        Some(expr) => Filters::collect(expr, allowed)?,
        None => Filters::default(),
    };

    match table.as_str() {
        "rooms" => Ok(Command::SelectRooms),
        "occupancy_report" => Ok(Command::SelectOccupancyReport),
        "equipment_report" => Ok(Command::SelectEquipmentReport),
        "lessons" => {
            let date = filters.get("date").map(parse_date).transpose()?;
            let room_id = filters.get("room_id").map(parse_ulid).transpose()?;
            if date.is_none() && room_id.is_none() {
                return Err(SqlError::MissingFilter("date or room_id"));
            }
            Ok(Command::SelectLessons { date, room_id })
        }
        "conflict_check" => Ok(Command::SelectConflictCheck {
            room_id: parse_ulid(filters.require("room_id")?)?,
            date: parse_date(filters.require("date")?)?,
            start: parse_time(filters.require("start")?)?,
            end: parse_time(filters.require("end")?)?,
        }),
        "room_availability" => Ok(Command::SelectRoomAvailability {
            room_id: parse_ulid(filters.require("room_id")?)?,
            date: parse_date(filters.require("date")?)?,
            start: parse_time(filters.require("start")?)?,
            end: parse_time(filters.require("end")?)?,
        }),
        "free_rooms" => {
            let filter = RoomFilter {
                min_capacity: filters.get("min_capacity").map(parse_u32).transpose()?.unwrap_or(0),
                building: filters.get("building").map(parse_text).transpose()?.unwrap_or_default(),
                require_projector: filters.get("has_projector").map(parse_bool).transpose()?.unwrap_or(false),
                require_computers: filters.get("has_computers").map(parse_bool).transpose()?.unwrap_or(false),
            };
            Ok(Command::SelectFreeRooms {
                date: parse_date(filters.require("date")?)?,
                start: parse_time(filters.require("start")?)?,
                end: parse_time(filters.require("end")?)?,
                filter,
            })
        }
        _ => Ok(Command::SelectStats {
            date: filters.get("date").map(parse_date).transpose()?,
        }),
    }
}

/// Conjunction of `column <op> value` predicates from a WHERE clause.
#[derive(Default)]
struct Filters<'a> {
    preds: Vec<(String, &'a Expr)>,
}

impl<'a> Filters<'a> {
    fn collect(expr: &'a Expr, allowed: &[&str]) -> Result<Self, SqlError> {
        let mut filters = Self::default();
        filters.walk(expr, allowed)?;
        Ok(filters)
    }

    fn walk(&mut self, expr: &'a Expr, allowed: &[&str]) -> Result<(), SqlError> {
        match expr {
            Expr::Nested(inner) => self.walk(inner, allowed),
            Expr::BinaryOp {
                left,
                op: BinaryOperator::And,
                right,
            } => {
                self.walk(left, allowed)?;
                self.walk(right, allowed)
            }
            Expr::BinaryOp { left, op, right } => {
                let col = expr_column_name(left)
                    .ok_or_else(|| SqlError::Unsupported(format!("predicate {expr}")))?;
                let op_ok = match col.as_str() {
                    "start" => matches!(op, BinaryOperator::GtEq | BinaryOperator::Eq),
                    "end" => matches!(op, BinaryOperator::LtEq | BinaryOperator::Eq),
                    _ => matches!(op, BinaryOperator::Eq),
                };
                if !allowed.contains(&col.as_str()) {
                    return Err(SqlError::UnknownColumn("filter", col));
                }
                if !op_ok {
                    return Err(SqlError::Unsupported(format!("operator {op} on {col}")));
                }
                if self.get(&col).is_some() {
                    return Err(SqlError::Unsupported(format!("repeated predicate on {col}")));
                }
                self.preds.push((col, right.as_ref()));
                Ok(())
            }
            _ => Err(SqlError::Unsupported(format!("predicate {expr}"))),
        }
    }

    fn get(&self, col: &str) -> Option<&'a Expr> {
        self.preds.iter().find(|(name, _)| name == col).map(|(_, e)| *e)
    }

    fn require(&self, col: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(col).ok_or(SqlError::MissingFilter(col))
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn ident_name(ident: &Ident) -> String {
    ident.value.to_lowercase()
}

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident_name(ident)),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    match tables_with_joins.first() {
        Some(first) => table_factor_name(&first.relation),
        None => Err(SqlError::Parse("DELETE without table".into())),
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident_name(ident)),
        Expr::CompoundIdentifier(parts) => parts.last().map(ident_name),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

/// Literal as text: quoted strings and bare numbers.
fn literal_text(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s) | Value::Number(s, _)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected literal, got {value}"))),
        None => match expr {
            Expr::UnaryOp {
                op: UnaryOperator::Minus,
                expr,
            } => Ok(format!("-{}", literal_text(expr)?)),
            _ => Err(SqlError::Parse(format!("expected value, got {expr}"))),
        },
    }
}

fn parse_text(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        _ => literal_text(expr),
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = literal_text(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
}

pub fn parse_date_str(s: &str) -> Result<NaiveDate, SqlError> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").map_err(|_| SqlError::BadDate(s.to_string()))
}

/// `HH:MM` or `HH:MM:SS`.
pub fn parse_time_str(s: &str) -> Result<NaiveTime, SqlError> {
    let s = s.trim();
    NaiveTime::parse_from_str(s, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
        .map_err(|_| SqlError::BadTime(s.to_string()))
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    parse_date_str(&literal_text(expr)?)
}

fn parse_time(expr: &Expr) -> Result<NaiveTime, SqlError> {
    parse_time_str(&literal_text(expr)?)
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    let s = literal_text(expr)?;
    s.trim().parse().map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}")))
}

fn parse_i32(expr: &Expr) -> Result<i32, SqlError> {
    let v = parse_i64(expr)?;
    i32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of i32 range")))
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_f64(expr: &Expr) -> Result<f64, SqlError> {
    let s = literal_text(expr)?;
    s.trim().parse().map_err(|e| SqlError::Parse(format!("bad number {s:?}: {e}")))
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    match extract_value(expr) {
        Some(Value::Boolean(b)) => Ok(*b),
        Some(Value::SingleQuotedString(s)) => match s.to_lowercase().as_str() {
            "true" | "t" | "1" | "yes" | "on" => Ok(true),
            "false" | "f" | "0" | "no" | "off" => Ok(false),
            _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
        },
        Some(Value::Number(n, _)) => Ok(n != "0"),
        Some(value) => Err(SqlError::Parse(format!("expected bool, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("query too long")]
    TooLong,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("{0}: unknown column {1}")]
    UnknownColumn(&'static str, String),
    #[error("{0}: expected {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("{0}: missing column {1}")]
    MissingColumn(&'static str, &'static str),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
    #[error("bad date {0:?}, expected YYYY-MM-DD")]
    BadDate(String),
    #[error("bad time {0:?}, expected HH:MM")]
    BadTime(String),
}
