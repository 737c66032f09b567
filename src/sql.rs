use chrono::{NaiveDate, NaiveTime};
use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    /// `INSERT INTO reservations (facility_id, date, start_time, end_time[, label])`
    InsertReservation {
        facility_id: FacilityId,
        date: NaiveDate,
        start: Ms,
        end: Ms,
        label: Option<String>,
    },
    DeleteReservation {
        id: Ulid,
    },
    /// `INSERT INTO approvals (reservation_id)`
    InsertApproval {
        reservation_id: Ulid,
    },
    SelectAvailability {
        facility_id: FacilityId,
        date: NaiveDate,
    },
    SelectReservations {
        facility_id: Option<FacilityId>,
        date: Option<NaiveDate>,
        include_cancelled: bool,
    },
    SelectFacilities {
        date: Option<NaiveDate>,
    },
    SelectProfile,
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

const RESERVATION_COLUMNS: [&str; 5] = ["facility_id", "date", "start_time", "end_time", "label"];
const APPROVAL_COLUMNS: [&str; 1] = ["reservation_id"];

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;

    match table.as_str() {
        "reservations" => {
            let [facility_id, date, start, end, label] =
                values_by_column(insert, values, "reservations", &RESERVATION_COLUMNS, 4)?;
            let required = |v: Option<Expr>, col: &'static str| v.ok_or(SqlError::MissingColumn(col));
            let label = match label {
                Some(expr) => parse_string_or_null(&expr)?,
                None => None,
            };
            Ok(Command::InsertReservation {
                facility_id: FacilityId::new(parse_string_expr(&required(facility_id, "facility_id")?)?),
                date: parse_date_expr(&required(date, "date")?)?,
                start: parse_time_expr(&required(start, "start_time")?)?,
                end: parse_time_expr(&required(end, "end_time")?)?,
                label,
            })
        }
        "approvals" => {
            let [reservation_id] = values_by_column(insert, values, "approvals", &APPROVAL_COLUMNS, 1)?;
            let reservation_id = reservation_id.ok_or(SqlError::MissingColumn("reservation_id"))?;
            Ok(Command::InsertApproval {
                reservation_id: parse_ulid_expr(&reservation_id)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Line VALUES up with `columns`. Without a column list the values are
/// positional and the first `required` must be present.
fn values_by_column<const N: usize>(
    insert: &ast::Insert,
    values: Vec<Expr>,
    table: &'static str,
    columns: &[&'static str; N],
    required: usize,
) -> Result<[Option<Expr>; N], SqlError> {
    let mut slots: [Option<Expr>; N] = std::array::from_fn(|_| None);
    if insert.columns.is_empty() {
        if values.len() < required || values.len() > N {
            return Err(SqlError::WrongArity(table, required, values.len()));
        }
        for (slot, value) in slots.iter_mut().zip(values) {
            *slot = Some(value);
        }
        return Ok(slots);
    }

    if insert.columns.len() != values.len() {
        return Err(SqlError::WrongArity(table, insert.columns.len(), values.len()));
    }
    for (ident, value) in insert.columns.iter().zip(values) {
        let name = ident.value.to_lowercase();
        let idx = columns
            .iter()
            .position(|c| *c == name)
            .ok_or_else(|| SqlError::UnknownColumn(name.clone()))?;
        if slots[idx].replace(value).is_some() {
            return Err(SqlError::Parse(format!("column {name} given twice")));
        }
    }
    Ok(slots)
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    match table.as_str() {
        "reservations" => Ok(Command::DeleteReservation {
            id: extract_where_id(&delete.selection)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    let mut filters = Filters::default();
    if let Some(selection) = &select.selection {
        extract_filters(selection, &mut filters)?;
    }

    match table.as_str() {
        "availability" => Ok(Command::SelectAvailability {
            facility_id: filters.facility_id.ok_or(SqlError::MissingFilter("facility_id"))?,
            date: filters.date.ok_or(SqlError::MissingFilter("date"))?,
        }),
        "reservations" => Ok(Command::SelectReservations {
            facility_id: filters.facility_id,
            date: filters.date,
            include_cancelled: filters.include_cancelled,
        }),
        "facilities" => Ok(Command::SelectFacilities { date: filters.date }),
        "profile" => Ok(Command::SelectProfile),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

#[derive(Default)]
struct Filters {
    facility_id: Option<FacilityId>,
    date: Option<NaiveDate>,
    include_cancelled: bool,
}

/// Collect `col = value` terms joined by AND. Unknown columns are ignored.
fn extract_filters(expr: &Expr, filters: &mut Filters) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => extract_filters(inner, filters),
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                extract_filters(left, filters)?;
                extract_filters(right, filters)
            }
            ast::BinaryOperator::Eq => {
                match expr_column_name(left).as_deref() {
                    Some("facility_id") => filters.facility_id = Some(FacilityId::new(parse_string_expr(right)?)),
                    Some("date") => filters.date = Some(parse_date_expr(right)?),
                    Some("include_cancelled") => filters.include_cancelled = parse_bool_expr(right)?,
                    _ => {}
                }
                Ok(())
            }
            _ => Err(SqlError::Unsupported(format!("operator {op} in WHERE"))),
        },
        _ => Ok(()),
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
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
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
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

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some("id") => parse_ulid_expr(right),
        _ => Err(SqlError::MissingFilter("id")),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn parse_string_expr(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_string_expr(expr).map(Some),
    }
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string_expr(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
}

fn parse_date_expr(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string_expr(expr)?;
    NaiveDate::parse_from_str(&s, "%Y-%m-%d").map_err(|e| SqlError::Parse(format!("bad date {s:?}: {e}")))
}

/// `HH:MM` or `HH:MM:SS` since local midnight. `24:00` is end of day.
fn parse_time_expr(expr: &Expr) -> Result<Ms, SqlError> {
    let s = parse_string_expr(expr)?;
    parse_time_of_day(&s)
}

pub fn parse_time_of_day(s: &str) -> Result<Ms, SqlError> {
    let s = s.trim();
    if s == "24:00" || s == "24:00:00" {
        return Ok(DAY_MS);
    }
    NaiveTime::parse_from_str(s, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
        .map(time_of_day_ms)
        .map_err(|e| SqlError::Parse(format!("bad time {s:?}: {e}")))
}

fn parse_bool_expr(expr: &Expr) -> Result<bool, SqlError> {
    match extract_value(expr) {
        Some(Value::Boolean(b)) => Ok(*b),
        Some(Value::SingleQuotedString(s)) => match s.to_lowercase().as_str() {
            "true" | "t" | "1" => Ok(true),
            "false" | "f" | "0" => Ok(false),
            _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
        },
        Some(value) => Err(SqlError::Parse(format!("expected bool, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
    MissingColumn(&'static str),
    UnknownColumn(String),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::MissingColumn(col) => write!(f, "missing column: {col}"),
            SqlError::UnknownColumn(col) => write!(f, "unknown column: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
