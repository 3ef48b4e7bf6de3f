use sqlparser::ast::{
    self, Expr, FromTable, LimitClause, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::Ms;

/// Whose bookings a listing is about: the requester's own reservations,
/// or the reservations on items the requester owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Booker,
    Owner,
}

/// Parsed command from SQL input. The session user supplies the acting
/// identity; the SQL carries everything else.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertUser {
        id: Ulid,
        name: String,
        email: String,
    },
    UpdateUser {
        id: Ulid,
        name: Option<String>,
        email: Option<String>,
    },
    DeleteUser {
        id: Ulid,
    },
    SelectUser {
        id: Ulid,
    },
    SelectUsers,
    InsertItem {
        id: Ulid,
        name: String,
        description: String,
        available: bool,
        request_id: Option<Ulid>,
    },
    UpdateItem {
        id: Ulid,
        name: Option<String>,
        description: Option<String>,
        available: Option<bool>,
    },
    SelectItem {
        id: Ulid,
    },
    /// The session user's own catalog.
    SelectOwnItems {
        offset: usize,
        limit: Option<usize>,
    },
    /// Free-text search via the virtual `search` filter column.
    SearchItems {
        query: String,
        offset: usize,
        limit: Option<usize>,
    },
    SelectItemsForRequest {
        request_id: Ulid,
    },
    InsertBooking {
        id: Ulid,
        item_id: Ulid,
        start: Ms,
        end: Ms,
    },
    UpdateBooking {
        id: Ulid,
        approved: bool,
    },
    SelectBooking {
        id: Ulid,
    },
    /// State is carried verbatim; the engine owns its validation.
    SelectBookings {
        role: Role,
        state: Option<String>,
        offset: usize,
        limit: Option<usize>,
    },
    InsertComment {
        id: Ulid,
        item_id: Ulid,
        text: String,
    },
    SelectComments {
        item_id: Ulid,
    },
    InsertRequest {
        id: Ulid,
        description: String,
    },
    SelectRequest {
        id: Ulid,
    },
    SelectOwnRequests {
        offset: usize,
        limit: Option<usize>,
    },
    SelectAllRequests {
        offset: usize,
        limit: Option<usize>,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(table, assignments, selection),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;

    match table.as_str() {
        "users" => {
            if values.len() < 3 {
                return Err(SqlError::WrongArity("users", 3, values.len()));
            }
            Ok(Command::InsertUser {
                id: parse_ulid(&values[0])?,
                name: parse_string(&values[1])?,
                email: parse_string(&values[2])?,
            })
        }
        "items" => {
            if values.len() < 4 {
                return Err(SqlError::WrongArity("items", 4, values.len()));
            }
            let request_id = if values.len() >= 5 {
                parse_ulid_or_null(&values[4])?
            } else {
                None
            };
            Ok(Command::InsertItem {
                id: parse_ulid(&values[0])?,
                name: parse_string(&values[1])?,
                description: parse_string(&values[2])?,
                available: parse_bool(&values[3])?,
                request_id,
            })
        }
        "bookings" => {
            if values.len() < 4 {
                return Err(SqlError::WrongArity("bookings", 4, values.len()));
            }
            Ok(Command::InsertBooking {
                id: parse_ulid(&values[0])?,
                item_id: parse_ulid(&values[1])?,
                start: parse_i64(&values[2])?,
                end: parse_i64(&values[3])?,
            })
        }
        "comments" => {
            if values.len() < 3 {
                return Err(SqlError::WrongArity("comments", 3, values.len()));
            }
            Ok(Command::InsertComment {
                id: parse_ulid(&values[0])?,
                item_id: parse_ulid(&values[1])?,
                text: parse_string(&values[2])?,
            })
        }
        "requests" => {
            if values.len() < 2 {
                return Err(SqlError::WrongArity("requests", 2, values.len()));
            }
            Ok(Command::InsertRequest {
                id: parse_ulid(&values[0])?,
                description: parse_string(&values[1])?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(&table.relation)?;
    let id = extract_where_id(selection)?;

    match table.as_str() {
        "users" => {
            let (mut name, mut email) = (None, None);
            for assignment in assignments {
                let value = &assignment.value;
                match assignment_column(assignment)?.as_str() {
                    "name" => name = Some(parse_string(value)?),
                    "email" => email = Some(parse_string(value)?),
                    col => return Err(SqlError::UnknownColumn(col.to_string())),
                }
            }
            Ok(Command::UpdateUser { id, name, email })
        }
        "items" => {
            let (mut name, mut description, mut available) = (None, None, None);
            for assignment in assignments {
                let value = &assignment.value;
                match assignment_column(assignment)?.as_str() {
                    "name" => name = Some(parse_string(value)?),
                    "description" => description = Some(parse_string(value)?),
                    "available" => available = Some(parse_bool(value)?),
                    col => return Err(SqlError::UnknownColumn(col.to_string())),
                }
            }
            Ok(Command::UpdateItem {
                id,
                name,
                description,
                available,
            })
        }
        "bookings" => {
            let mut approved = None;
            for assignment in assignments {
                let value = &assignment.value;
                match assignment_column(assignment)?.as_str() {
                    "approved" => approved = Some(parse_bool(value)?),
                    col => return Err(SqlError::UnknownColumn(col.to_string())),
                }
            }
            Ok(Command::UpdateBooking {
                id,
                approved: approved.ok_or(SqlError::MissingFilter("approved"))?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "users" => Ok(Command::DeleteUser { id }),
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
    let (offset, limit) = extract_page(query)?;

    match table.as_str() {
        "users" => {
            let filters = extract_filters(&select.selection)?;
            match filters.id {
                Some(id) => Ok(Command::SelectUser { id }),
                None => Ok(Command::SelectUsers),
            }
        }
        "items" => {
            let filters = extract_filters(&select.selection)?;
            if let Some(id) = filters.id {
                Ok(Command::SelectItem { id })
            } else if let Some(query) = filters.search {
                Ok(Command::SearchItems {
                    query,
                    offset,
                    limit,
                })
            } else if let Some(request_id) = filters.request_id {
                Ok(Command::SelectItemsForRequest { request_id })
            } else {
                Ok(Command::SelectOwnItems { offset, limit })
            }
        }
        "bookings" => {
            let filters = extract_filters(&select.selection)?;
            if let Some(id) = filters.id {
                return Ok(Command::SelectBooking { id });
            }
            let role = match filters.role.as_deref() {
                None | Some("booker") => Role::Booker,
                Some("owner") => Role::Owner,
                Some(other) => return Err(SqlError::Parse(format!("bad role: {other}"))),
            };
            Ok(Command::SelectBookings {
                role,
                state: filters.state,
                offset,
                limit,
            })
        }
        "comments" => {
            let filters = extract_filters(&select.selection)?;
            Ok(Command::SelectComments {
                item_id: filters.item_id.ok_or(SqlError::MissingFilter("item_id"))?,
            })
        }
        "requests" => {
            let filters = extract_filters(&select.selection)?;
            if let Some(id) = filters.id {
                return Ok(Command::SelectRequest { id });
            }
            match filters.scope.as_deref() {
                None | Some("own") => Ok(Command::SelectOwnRequests { offset, limit }),
                Some("all") => Ok(Command::SelectAllRequests { offset, limit }),
                Some(other) => Err(SqlError::Parse(format!("bad scope: {other}"))),
            }
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Every equality filter the dialect understands, across all tables.
/// `search`, `role`, `state` and `scope` are virtual columns.
#[derive(Default)]
struct Filters {
    id: Option<Ulid>,
    item_id: Option<Ulid>,
    request_id: Option<Ulid>,
    search: Option<String>,
    role: Option<String>,
    state: Option<String>,
    scope: Option<String>,
}

fn extract_filters(selection: &Option<Expr>) -> Result<Filters, SqlError> {
    let mut filters = Filters::default();
    if let Some(expr) = selection {
        collect_filters(expr, &mut filters)?;
    }
    Ok(filters)
}

fn collect_filters(expr: &Expr, filters: &mut Filters) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                collect_filters(left, filters)?;
                collect_filters(right, filters)?;
            }
            ast::BinaryOperator::Eq => {
                let col = expr_column_name(left)
                    .ok_or_else(|| SqlError::Parse(format!("expected column, got {left}")))?;
                match col.as_str() {
                    "id" => filters.id = Some(parse_ulid_expr(right)?),
                    "item_id" => filters.item_id = Some(parse_ulid_expr(right)?),
                    "request_id" => filters.request_id = Some(parse_ulid_expr(right)?),
                    "search" => filters.search = Some(parse_string_expr(right)?),
                    "role" => filters.role = Some(parse_string_expr(right)?),
                    "state" => filters.state = Some(parse_string_expr(right)?),
                    "scope" => filters.scope = Some(parse_string_expr(right)?),
                    other => return Err(SqlError::UnknownColumn(other.to_string())),
                }
            }
            _ => return Err(SqlError::Unsupported(format!("operator {op}"))),
        },
        other => return Err(SqlError::Unsupported(format!("filter {other}"))),
    }
    Ok(())
}

fn extract_page(query: &ast::Query) -> Result<(usize, Option<usize>), SqlError> {
    let (mut offset, mut limit) = (0usize, None);
    match &query.limit_clause {
        None => {}
        Some(LimitClause::LimitOffset {
            limit: limit_expr,
            offset: offset_expr,
            ..
        }) => {
            if let Some(expr) = limit_expr {
                limit = Some(parse_usize_expr(expr)?);
            }
            if let Some(off) = offset_expr {
                offset = parse_usize_expr(&off.value)?;
            }
        }
        Some(other) => {
            return Err(SqlError::Unsupported(format!("limit clause {other}")));
        }
    }
    Ok((offset, limit))
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

fn assignment_column(assignment: &ast::Assignment) -> Result<String, SqlError> {
    match &assignment.target {
        ast::AssignmentTarget::ColumnName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty column name".into()))
        }
        _ => Err(SqlError::Parse("unsupported assignment target".into())),
    }
}

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            if values.rows.len() > 1 {
                return Err(SqlError::Unsupported("multi-row INSERT".into()));
            }
            Ok(values.rows[0].clone())
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
        } => {
            if expr_column_name(left).as_deref() == Some("id") {
                parse_ulid_expr(right)
            } else {
                Err(SqlError::MissingFilter("id"))
            }
        }
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

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) | Value::Number(s, _) => {
                Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
            }
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_string_expr(expr: &Expr) -> Result<String, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) => Ok(s.clone()),
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_usize_expr(expr: &Expr) -> Result<usize, SqlError> {
    let v = parse_i64_expr(expr)?;
    usize::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of range")))
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    parse_ulid_expr(expr)
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    parse_string_expr(expr)
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Null => Ok(None),
            Value::SingleQuotedString(s) | Value::Number(s, _) => Ok(Some(
                Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))?,
            )),
            _ => Err(SqlError::Parse(format!(
                "expected string or NULL, got {value:?}"
            ))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    parse_i64_expr(expr)
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Boolean(b) => Ok(*b),
            Value::SingleQuotedString(s) => match s.to_lowercase().as_str() {
                "true" | "t" | "1" => Ok(true),
                "false" | "f" | "0" => Ok(false),
                _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
            },
            Value::Number(n, _) => Ok(n != "0"),
            _ => Err(SqlError::Parse(format!("expected bool, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(String),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(c) => write!(f, "unknown column: {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
