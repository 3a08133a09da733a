use chrono::NaiveDate;
use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::limits::MAX_SELECTED_SLOTS;
use crate::model::*;
use crate::notify::ChangeFilter;

/// Which reservations a `SELECT … FROM reservations` asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationQuery {
    /// Every active reservation.
    AllActive,
    /// Active reservations of one court on one date.
    CourtDay(CourtDay),
    /// Every reservation of one member, any status.
    User(UserId),
}

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertCourts {
        courts: Vec<(Ulid, String, Discipline)>,
    },
    SelectCourts,
    SelectSlots {
        court_id: Ulid,
        date: NaiveDate,
    },
    SelectReservations {
        query: ReservationQuery,
    },
    /// The logged-in member's board: upcoming and history.
    SelectAgenda,
    /// One booking of 1..=2 consecutive slots on one court and date.
    InsertReservation {
        court_id: Ulid,
        date: NaiveDate,
        slots: Vec<TimeOfDay>,
    },
    CancelReservation {
        id: Ulid,
    },
    Listen {
        channel: String,
        filter: ChangeFilter,
    },
    Unlisten {
        channel: String,
    },
    UnlistenAll,
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim().trim_end_matches(';').trim();
    let upper = trimmed.to_ascii_uppercase();
    if let Some(rest) = upper.strip_prefix("LISTEN ") {
        let channel = trimmed[trimmed.len() - rest.len()..].trim().trim_matches('"').to_string();
        let filter = parse_channel(&channel)?;
        return Ok(Command::Listen { channel, filter });
    }
    if let Some(rest) = upper.strip_prefix("UNLISTEN ") {
        let channel = trimmed[trimmed.len() - rest.len()..].trim().trim_matches('"').to_string();
        if channel == "*" {
            return Ok(Command::UnlistenAll);
        }
        return Ok(Command::Unlisten { channel });
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(first) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match first {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

// ── Channels ──────────────────────────────────────────────────

pub const ALL_RESERVATIONS_CHANNEL: &str = "reservations";

/// `court_<ulid>_<yyyymmdd>` for one court-day, `reservations` for all active rows.
pub fn parse_channel(channel: &str) -> Result<ChangeFilter, SqlError> {
    let lower = channel.to_ascii_lowercase();
    if lower == ALL_RESERVATIONS_CHANNEL {
        return Ok(ChangeFilter::StatusActive);
    }
    let bad = || SqlError::BadChannel(channel.to_string());
    let rest = lower.strip_prefix("court_").ok_or_else(bad)?;
    let (court, date) = rest.split_once('_').ok_or_else(bad)?;
    let court_id = Ulid::from_string(court).map_err(|_| bad())?;
    let date = NaiveDate::parse_from_str(date, "%Y%m%d").map_err(|_| bad())?;
    Ok(ChangeFilter::CourtDay(CourtDay::new(court_id, date)))
}

pub fn channel_name(key: &CourtDay) -> String {
    format!("court_{}_{}", key.court_id, key.date.format("%Y%m%d"))
}

// ── Statements ────────────────────────────────────────────────

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let rows = extract_all_insert_rows(insert)?;

    match table.as_str() {
        "courts" => {
            let mut courts = Vec::with_capacity(rows.len());
            for (i, row) in rows.iter().enumerate() {
                if row.len() != 3 {
                    return Err(SqlError::WrongArity("courts", 3, row.len()));
                }
                let at_row = |e: SqlError| SqlError::Parse(format!("row {i}: {e}"));
                let discipline = parse_string(&row[2])
                    .and_then(|s| s.parse::<Discipline>().map_err(SqlError::Parse))
                    .map_err(at_row)?;
                courts.push((
                    parse_ulid_expr(&row[0]).map_err(at_row)?,
                    parse_string(&row[1]).map_err(at_row)?,
                    discipline,
                ));
            }
            Ok(Command::InsertCourts { courts })
        }
        "reservations" => {
            if rows.len() > MAX_SELECTED_SLOTS {
                return Err(SqlError::Parse(format!(
                    "at most {MAX_SELECTED_SLOTS} slots per booking"
                )));
            }
            let mut target: Option<(Ulid, NaiveDate)> = None;
            let mut slots = Vec::with_capacity(rows.len());
            for row in &rows {
                if row.len() != 3 {
                    return Err(SqlError::WrongArity("reservations", 3, row.len()));
                }
                let court_id = parse_ulid_expr(&row[0])?;
                let date = parse_date_expr(&row[1])?;
                match target {
                    None => target = Some((court_id, date)),
                    Some(t) if t != (court_id, date) => {
                        return Err(SqlError::Parse(
                            "all slots of a booking must share court and date".into(),
                        ));
                    }
                    Some(_) => {}
                }
                slots.push(parse_time_expr(&row[2])?);
            }
            let (court_id, date) = target.ok_or_else(|| SqlError::Parse("empty VALUES".into()))?;
            Ok(Command::InsertReservation { court_id, date, slots })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "reservations" => Ok(Command::CancelReservation { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

#[derive(Default)]
struct Filters {
    court_id: Option<Ulid>,
    date: Option<NaiveDate>,
    user_id: Option<Ulid>,
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;

    let mut filters = Filters::default();
    if let Some(selection) = &select.selection {
        extract_filters(selection, &mut filters)?;
    }

    match table.as_str() {
        "courts" => Ok(Command::SelectCourts),
        "agenda" => Ok(Command::SelectAgenda),
        "slots" => Ok(Command::SelectSlots {
            court_id: filters.court_id.ok_or(SqlError::MissingFilter("court_id"))?,
            date: filters.date.ok_or(SqlError::MissingFilter("date"))?,
        }),
        "reservations" => {
            let query = match filters {
                Filters { user_id: Some(user), court_id: None, date: None } => ReservationQuery::User(user),
                Filters { user_id: None, court_id: Some(c), date: Some(d) } => {
                    ReservationQuery::CourtDay(CourtDay::new(c, d))
                }
                Filters { user_id: None, court_id: None, date: None } => ReservationQuery::AllActive,
                Filters { user_id: Some(_), .. } => {
                    return Err(SqlError::Unsupported(
                        "filter by user_id or by court_id and date, not both".into(),
                    ));
                }
                Filters { court_id: Some(_), .. } => return Err(SqlError::MissingFilter("date")),
                Filters { .. } => return Err(SqlError::MissingFilter("court_id")),
            };
            Ok(Command::SelectReservations { query })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

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
                    Some("court_id") => filters.court_id = Some(parse_ulid_expr(right)?),
                    Some("user_id") => filters.user_id = Some(parse_ulid_expr(right)?),
                    Some("date") => filters.date = Some(parse_date_expr(right)?),
                    Some(other) => return Err(SqlError::Unsupported(format!("filter on {other}"))),
                    None => return Err(SqlError::Unsupported(format!("filter {expr}"))),
                }
                Ok(())
            }
            _ => Err(SqlError::Unsupported(format!("operator {op}"))),
        },
        _ => Err(SqlError::Unsupported(format!("filter {expr}"))),
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

fn extract_all_insert_rows(insert: &ast::Insert) -> Result<Vec<Vec<Expr>>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(values.rows.clone())
        }
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

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
}

fn parse_date_expr(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string(expr)?;
    NaiveDate::parse_from_str(&s, "%Y-%m-%d").map_err(|e| SqlError::Parse(format!("bad date {s:?}: {e}")))
}

fn parse_time_expr(expr: &Expr) -> Result<TimeOfDay, SqlError> {
    let s = parse_string(expr)?;
    s.parse::<TimeOfDay>().map_err(|e| SqlError::Parse(e.to_string()))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("{0}: expected {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
    #[error("unknown channel {0:?} (expected reservations or court_<id>_<yyyymmdd>)")]
    BadChannel(String),
}
