use chrono::{NaiveDate, NaiveDateTime};
use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::engine::LendCandidate;
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertItem {
        id: Ulid,
        name: String,
        description: String,
        is_lendable: bool,
    },
    UpdateItem {
        id: Ulid,
        changes: ItemChanges,
    },
    DeleteItem {
        id: Ulid,
    },
    /// All items, or only those carrying the named tag.
    SelectItems {
        tag: Option<String>,
    },
    InsertUser {
        id: Ulid,
        name: String,
    },
    DeleteUser {
        id: Ulid,
    },
    SelectUsers,
    InsertLend(LendRecord),
    UpdateLend {
        id: Ulid,
        changes: LendChanges,
    },
    DeleteLend {
        id: Ulid,
    },
    SelectLends {
        item_id: Option<Ulid>,
    },
    InsertNote {
        id: Ulid,
        subject: NoteSubject,
        author_id: Ulid,
        note_text: String,
        is_complaint: bool,
    },
    DeleteNote {
        id: Ulid,
    },
    SelectNotes {
        subject: NoteSubject,
    },
    CheckLend(LendCandidate),
    InsertTag {
        id: Ulid,
        name: String,
        description: String,
    },
    UpdateTag {
        id: Ulid,
        changes: TagChanges,
    },
    DeleteTag {
        id: Ulid,
    },
    SelectTags,
    TagItem {
        item_id: Ulid,
        tag_id: Ulid,
    },
    UntagItem {
        item_id: Ulid,
        tag_id: Ulid,
    },
    SelectItemTags {
        item_id: Option<Ulid>,
        tag_id: Option<Ulid>,
    },
}

const ITEM_COLUMNS: &[&str] = &["id", "name", "description", "is_lendable"];
const USER_COLUMNS: &[&str] = &["id", "name"];
const LEND_COLUMNS: &[&str] = &["id", "item_id", "user_id", "due_out", "due_back", "out", "back"];
const NOTE_COLUMNS: &[&str] = &[
    "id",
    "subject",
    "subject_id",
    "author_id",
    "note_text",
    "is_complaint",
];
const TAG_COLUMNS: &[&str] = &["id", "name", "description"];
const ITEM_TAG_COLUMNS: &[&str] = &["item_id", "tag_id"];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
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

// ── INSERT ────────────────────────────────────────────────────

/// Column/value pairs of a single-row INSERT. Without a column list the
/// values are matched positionally against the table's default columns.
struct Row {
    table: &'static str,
    fields: Vec<(String, Expr)>,
}

impl Row {
    fn get(&self, col: &str) -> Option<&Expr> {
        self.fields.iter().find(|(c, _)| c == col).map(|(_, e)| e)
    }

    fn require(&self, col: &'static str) -> Result<&Expr, SqlError> {
        self.get(col).ok_or(SqlError::MissingColumn(self.table, col))
    }
}

fn insert_row(
    insert: &ast::Insert,
    table: &'static str,
    default_columns: &[&str],
) -> Result<Row, SqlError> {
    let rows = extract_insert_rows(insert)?;
    if rows.len() != 1 {
        return Err(SqlError::Unsupported(format!(
            "multi-row INSERT into {table}"
        )));
    }
    let values = &rows[0];
    let columns: Vec<String> = if insert.columns.is_empty() {
        default_columns.iter().map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    let short_positional = insert.columns.is_empty() && values.len() < columns.len();
    if values.len() != columns.len() && !short_positional {
        return Err(SqlError::WrongArity(table, columns.len(), values.len()));
    }
    let mut fields = Vec::with_capacity(values.len());
    for (col, value) in columns.into_iter().zip(values.iter()) {
        if !default_columns.contains(&col.as_str()) {
            return Err(SqlError::UnknownColumn(table, col));
        }
        fields.push((col, value.clone()));
    }
    Ok(Row { table, fields })
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;

    match table.as_str() {
        "items" => {
            let row = insert_row(insert, "items", ITEM_COLUMNS)?;
            Ok(Command::InsertItem {
                id: parse_ulid(row.require("id")?)?,
                name: parse_string(row.require("name")?)?,
                description: match row.get("description") {
                    Some(e) => parse_string_or_null(e)?.unwrap_or_default(),
                    None => String::new(),
                },
                is_lendable: match row.get("is_lendable") {
                    Some(e) => parse_bool(e)?,
                    None => true,
                },
            })
        }
        "users" => {
            let row = insert_row(insert, "users", USER_COLUMNS)?;
            Ok(Command::InsertUser {
                id: parse_ulid(row.require("id")?)?,
                name: parse_string(row.require("name")?)?,
            })
        }
        "lends" => {
            let row = insert_row(insert, "lends", LEND_COLUMNS)?;
            Ok(Command::InsertLend(LendRecord {
                id: parse_ulid(row.require("id")?)?,
                item_id: parse_ulid(row.require("item_id")?)?,
                user_id: parse_ulid(row.require("user_id")?)?,
                due_out: row.get("due_out").map(parse_date_or_null).transpose()?.flatten(),
                due_back: row.get("due_back").map(parse_date_or_null).transpose()?.flatten(),
                out: row.get("out").map(parse_datetime_or_null).transpose()?.flatten(),
                back: row.get("back").map(parse_datetime_or_null).transpose()?.flatten(),
            }))
        }
        "notes" => {
            let row = insert_row(insert, "notes", NOTE_COLUMNS)?;
            let subject_id = parse_ulid(row.require("subject_id")?)?;
            Ok(Command::InsertNote {
                id: parse_ulid(row.require("id")?)?,
                subject: parse_subject(row.require("subject")?, subject_id)?,
                author_id: parse_ulid(row.require("author_id")?)?,
                note_text: parse_string(row.require("note_text")?)?,
                is_complaint: match row.get("is_complaint") {
                    Some(e) => parse_bool(e)?,
                    None => false,
                },
            })
        }
        "tags" => {
            let row = insert_row(insert, "tags", TAG_COLUMNS)?;
            Ok(Command::InsertTag {
                id: parse_ulid(row.require("id")?)?,
                name: parse_string(row.require("name")?)?,
                description: match row.get("description") {
                    Some(e) => parse_string_or_null(e)?.unwrap_or_default(),
                    None => String::new(),
                },
            })
        }
        "item_tags" => {
            let row = insert_row(insert, "item_tags", ITEM_TAG_COLUMNS)?;
            Ok(Command::TagItem {
                item_id: parse_ulid(row.require("item_id")?)?,
                tag_id: parse_ulid(row.require("tag_id")?)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── UPDATE ────────────────────────────────────────────────────

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(&table.relation)?;
    let id = extract_where_id(selection)?;

    let mut sets = Vec::with_capacity(assignments.len());
    for assignment in assignments {
        let col = match &assignment.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name)
                .ok_or_else(|| SqlError::Parse("empty column name".into()))?,
            AssignmentTarget::Tuple(_) => {
                return Err(SqlError::Unsupported("tuple assignment".into()));
            }
        };
        sets.push((col, &assignment.value));
    }

    match table.as_str() {
        "items" => {
            let mut changes = ItemChanges::default();
            for (col, value) in sets {
                match col.as_str() {
                    "name" => changes.name = Some(parse_string(value)?),
                    "description" => {
                        let description = parse_string_or_null(value)?.unwrap_or_default();
                        changes.description = Some(description);
                    }
                    "is_lendable" => changes.is_lendable = Some(parse_bool(value)?),
                    _ => return Err(SqlError::UnknownColumn("items", col)),
                }
            }
            Ok(Command::UpdateItem { id, changes })
        }
        "tags" => {
            let mut changes = TagChanges::default();
            for (col, value) in sets {
                match col.as_str() {
                    "name" => changes.name = Some(parse_string(value)?),
                    "description" => {
                        let description = parse_string_or_null(value)?.unwrap_or_default();
                        changes.description = Some(description);
                    }
                    _ => return Err(SqlError::UnknownColumn("tags", col)),
                }
            }
            Ok(Command::UpdateTag { id, changes })
        }
        "lends" => {
            let mut changes = LendChanges::default();
            for (col, value) in sets {
                match col.as_str() {
                    "user_id" => changes.user_id = Some(parse_ulid(value)?),
                    "due_out" => changes.due_out = Some(parse_date_or_null(value)?),
                    "due_back" => changes.due_back = Some(parse_date_or_null(value)?),
                    "out" => changes.out = Some(parse_datetime_or_null(value)?),
                    "back" => changes.back = Some(parse_datetime_or_null(value)?),
                    _ => return Err(SqlError::UnknownColumn("lends", col)),
                }
            }
            Ok(Command::UpdateLend { id, changes })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    if table == "item_tags" {
        return parse_untag(&delete.selection);
    }
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "items" => Ok(Command::DeleteItem { id }),
        "users" => Ok(Command::DeleteUser { id }),
        "lends" => Ok(Command::DeleteLend { id }),
        "notes" => Ok(Command::DeleteNote { id }),
        "tags" => Ok(Command::DeleteTag { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// `DELETE FROM item_tags WHERE item_id = .. AND tag_id = ..`
fn parse_untag(selection: &Option<Expr>) -> Result<Command, SqlError> {
    let mut filters = Vec::new();
    if let Some(selection) = selection {
        collect_eq_filters(selection, &mut filters)?;
    }
    reject_filters_except(&filters, "item_tags", ITEM_TAG_COLUMNS)?;
    let filter = |col: &'static str| {
        filters
            .iter()
            .find(|(c, _)| c == col)
            .map(|(_, e)| e)
            .ok_or(SqlError::MissingFilter(col))
    };
    Ok(Command::UntagItem {
        item_id: parse_ulid(filter("item_id")?)?,
        tag_id: parse_ulid(filter("tag_id")?)?,
    })
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    let mut filters = Vec::new();
    if let Some(selection) = &select.selection {
        collect_eq_filters(selection, &mut filters)?;
    }
    let filter = |col: &str| filters.iter().find(|(c, _)| c == col).map(|(_, e)| e);

    match table.as_str() {
        "items" => {
            reject_filters_except(&filters, "items", &["tag"])?;
            Ok(Command::SelectItems {
                tag: filter("tag").map(parse_string).transpose()?,
            })
        }
        "users" => {
            reject_filters_except(&filters, "users", &[])?;
            Ok(Command::SelectUsers)
        }
        "lends" => {
            reject_filters_except(&filters, "lends", &["item_id"])?;
            Ok(Command::SelectLends {
                item_id: filter("item_id").map(parse_ulid).transpose()?,
            })
        }
        "notes" => {
            reject_filters_except(&filters, "notes", &["subject", "subject_id"])?;
            let subject = filter("subject").ok_or(SqlError::MissingFilter("subject"))?;
            let subject_id = filter("subject_id").ok_or(SqlError::MissingFilter("subject_id"))?;
            Ok(Command::SelectNotes {
                subject: parse_subject(subject, parse_ulid(subject_id)?)?,
            })
        }
        "tags" => {
            reject_filters_except(&filters, "tags", &[])?;
            Ok(Command::SelectTags)
        }
        "item_tags" => {
            reject_filters_except(&filters, "item_tags", ITEM_TAG_COLUMNS)?;
            Ok(Command::SelectItemTags {
                item_id: filter("item_id").map(parse_ulid).transpose()?,
                tag_id: filter("tag_id").map(parse_ulid).transpose()?,
            })
        }
        "lend_check" => {
            reject_filters_except(
                &filters,
                "lend_check",
                &["item_id", "due_out", "due_back", "out", "back", "exclude_id"],
            )?;
            let item_id = filter("item_id").ok_or(SqlError::MissingFilter("item_id"))?;
            let mut candidate = LendCandidate::new(parse_ulid(item_id)?);
            let date = |col| filter(col).map(parse_date_or_null).transpose();
            let datetime = |col| filter(col).map(parse_datetime_or_null).transpose();
            candidate.due_out = date("due_out")?.flatten();
            candidate.due_back = date("due_back")?.flatten();
            candidate.out = datetime("out")?.flatten();
            candidate.back = datetime("back")?.flatten();
            candidate.exclude_record_id =
                filter("exclude_id").map(parse_ulid_or_null).transpose()?.flatten();
            Ok(Command::CheckLend(candidate))
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Walk an AND-chain of `column = value` comparisons.
fn collect_eq_filters(expr: &Expr, out: &mut Vec<(String, Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_eq_filters(inner, out),
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_eq_filters(left, out)?;
            collect_eq_filters(right, out)
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            let col = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter: {expr}")))?;
            out.push((col, right.as_ref().clone()));
            Ok(())
        }
        Expr::IsNull(inner) => {
            let col = expr_column_name(inner)
                .ok_or_else(|| SqlError::Unsupported(format!("filter: {expr}")))?;
            out.push((col, Expr::Value(Value::Null.with_empty_span())));
            Ok(())
        }
        _ => Err(SqlError::Unsupported(format!("filter: {expr}"))),
    }
}

fn reject_filters_except(
    filters: &[(String, Expr)],
    table: &'static str,
    allowed: &[&str],
) -> Result<(), SqlError> {
    match filters.iter().find(|(c, _)| !allowed.contains(&c.as_str())) {
        Some((col, _)) => Err(SqlError::UnknownColumn(table, col.clone())),
        None => Ok(()),
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

fn extract_insert_rows(insert: &ast::Insert) -> Result<&[Vec<Expr>], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(&values.rows)
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
                parse_ulid(right)
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

/// The literal behind an expression, looking through parentheses and
/// casts such as `'2021-03-01'::date`.
fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        Expr::Nested(inner) | Expr::Cast { expr: inner, .. } => extract_value(inner),
        _ => None,
    }
}

fn literal(expr: &Expr) -> Result<&Value, SqlError> {
    extract_value(expr).ok_or_else(|| SqlError::Parse(format!("expected value, got {expr}")))
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    match literal(expr)? {
        Value::SingleQuotedString(s) | Value::Number(s, _) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
        }
        value => Err(SqlError::Parse(format!("expected ULID string, got {value}"))),
    }
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    match literal(expr)? {
        Value::Null => Ok(None),
        _ => parse_ulid(expr).map(Some),
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match literal(expr)? {
        Value::SingleQuotedString(s) | Value::DoubleQuotedString(s) => Ok(s.clone()),
        Value::EscapedStringLiteral(s) => Ok(s.clone()),
        value => Err(SqlError::Parse(format!("expected string, got {value}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match literal(expr)? {
        Value::Null => Ok(None),
        _ => parse_string(expr).map(Some),
    }
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    match literal(expr)? {
        Value::Boolean(b) => Ok(*b),
        Value::SingleQuotedString(s) => match s.to_lowercase().as_str() {
            "true" | "t" | "1" | "yes" => Ok(true),
            "false" | "f" | "0" | "no" => Ok(false),
            _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
        },
        Value::Number(n, _) => Ok(n != "0"),
        value => Err(SqlError::Parse(format!("expected bool, got {value}"))),
    }
}

fn parse_date_or_null(expr: &Expr) -> Result<Option<Day>, SqlError> {
    match literal(expr)? {
        Value::Null => Ok(None),
        Value::SingleQuotedString(s) => parse_date(s).map(Some),
        value => Err(SqlError::Parse(format!("expected date, got {value}"))),
    }
}

fn parse_datetime_or_null(expr: &Expr) -> Result<Option<Timestamp>, SqlError> {
    match literal(expr)? {
        Value::Null => Ok(None),
        Value::SingleQuotedString(s) => parse_datetime(s).map(Some),
        value => Err(SqlError::Parse(format!("expected datetime, got {value}"))),
    }
}

pub fn parse_date(s: &str) -> Result<Day, SqlError> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|e| SqlError::Parse(format!("bad date {s:?}: {e}")))
}

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
];

/// Accepts `YYYY-MM-DD HH:MM[:SS[.fff]]` with a space or `T`; a bare date
/// means midnight.
pub fn parse_datetime(s: &str) -> Result<Timestamp, SqlError> {
    let s = s.trim();
    for fmt in DATETIME_FORMATS {
        if let Ok(t) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(t);
        }
    }
    match NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        Ok(d) => Ok(d.and_time(chrono::NaiveTime::MIN)),
        Err(_) => Err(SqlError::Parse(format!("bad datetime {s:?}"))),
    }
}

fn parse_subject(expr: &Expr, subject_id: Ulid) -> Result<NoteSubject, SqlError> {
    let kind = parse_string(expr)?;
    match kind.to_lowercase().as_str() {
        "item" => Ok(NoteSubject::Item(subject_id)),
        "user" => Ok(NoteSubject::User(subject_id)),
        "lend" => Ok(NoteSubject::Lend(subject_id)),
        _ => Err(SqlError::Parse(format!(
            "bad note subject {kind:?} (expected item, user or lend)"
        ))),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(&'static str, String),
    MissingColumn(&'static str, &'static str),
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
            SqlError::UnknownColumn(t, c) => write!(f, "{t}: unknown column {c}"),
            SqlError::MissingColumn(t, c) => write!(f, "{t}: missing column {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
