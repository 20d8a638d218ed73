//! Read surface consumed by the REST/WebSocket collaborators: filtered,
//! ordered, paginated reads over a tenant's event and instruction tables.

use crate::{
    error::ServiceError,
    idl::descriptor::ProgramDescriptor,
    schema::{column_name, ddl, quote_ident, RESERVED_COLUMNS},
    tenant,
};
use chrono::{DateTime, Utc};
use sea_orm::{
    ConnectionTrait, DatabaseConnection, DbBackend, Statement, Value as DbValue,
};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Default)]
pub struct EventFilters {
    pub slot_from: Option<i64>,
    pub slot_to: Option<i64>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    /// Equality on any known column.
    pub equals: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OrderColumn {
    #[default]
    Slot,
    BlockTime,
    TxSignature,
    IndexedAt,
}

impl OrderColumn {
    fn sql(self) -> &'static str {
        match self {
            Self::Slot => "slot",
            Self::BlockTime => "block_time",
            Self::TxSignature => "tx_signature",
            Self::IndexedAt => "indexed_at",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OrderDirection {
    Asc,
    #[default]
    Desc,
}

#[derive(Debug, Clone, Copy)]
pub struct Paging {
    /// Clamped to [1, 1000].
    pub limit: u64,
    pub offset: u64,
}

impl Default for Paging {
    fn default() -> Self {
        Self {
            limit: 100,
            offset: 0,
        }
    }
}

pub async fn list_events(
    db: &DatabaseConnection,
    namespace: &str,
    descriptor: &ProgramDescriptor,
    source: &str,
    filters: &EventFilters,
    order: OrderColumn,
    direction: OrderDirection,
    paging: Paging,
) -> Result<Vec<Value>, ServiceError> {
    let (sql, values) = build_list_query(descriptor, source, filters, order, direction, paging)?;
    fetch_rows(db, namespace, sql, values).await
}

pub async fn get_event_by_tx(
    db: &DatabaseConnection,
    namespace: &str,
    descriptor: &ProgramDescriptor,
    source: &str,
    tx_signature: &str,
) -> Result<Vec<Value>, ServiceError> {
    let table = resolve_table(descriptor, source)?.0;
    let sql = format!(
        "SELECT ROW_TO_JSON(\"t\") AS \"row\" FROM (SELECT * FROM {} WHERE \"tx_signature\" = $1 ORDER BY \"ix_index\" ASC) \"t\"",
        quote_ident(&table)
    );
    fetch_rows(db, namespace, sql, vec![tx_signature.into()]).await
}

pub async fn count_events(
    db: &DatabaseConnection,
    namespace: &str,
    descriptor: &ProgramDescriptor,
    source: &str,
) -> Result<u64, ServiceError> {
    let table = resolve_table(descriptor, source)?.0;
    let sql = format!("SELECT COUNT(*) AS \"count\" FROM {}", quote_ident(&table));
    let count = tenant::with_namespace(db, namespace, move |txn| {
        Box::pin(async move {
            let row = txn
                .query_one(Statement::from_string(DbBackend::Postgres, sql))
                .await?
                .ok_or_else(|| ServiceError::Validation("count query returned no row".into()))?;
            let count: i64 = row.try_get("", "count")?;
            Ok(count)
        })
    })
    .await?;
    Ok(count.max(0) as u64)
}

async fn fetch_rows(
    db: &DatabaseConnection,
    namespace: &str,
    sql: String,
    values: Vec<DbValue>,
) -> Result<Vec<Value>, ServiceError> {
    tenant::with_namespace(db, namespace, move |txn| {
        Box::pin(async move {
            let rows = txn
                .query_all(Statement::from_sql_and_values(
                    DbBackend::Postgres,
                    sql,
                    values,
                ))
                .await?;
            let mut out = Vec::with_capacity(rows.len());
            for row in rows {
                out.push(row.try_get::<Value>("", "row")?);
            }
            Ok(out)
        })
    })
    .await
}

fn resolve_table(
    descriptor: &ProgramDescriptor,
    source: &str,
) -> Result<(String, BTreeSet<String>), ServiceError> {
    let (table, fields): (String, Vec<&str>) = if let Some(event) = descriptor.event(source) {
        (
            ddl::event_table_name(&descriptor.program_name, source),
            event.fields.iter().map(|f| f.name.as_str()).collect(),
        )
    } else if let Some(instruction) = descriptor.instruction(source) {
        (
            ddl::instruction_table_name(&descriptor.program_name, source),
            instruction.args.iter().map(|f| f.name.as_str()).collect(),
        )
    } else {
        return Err(ServiceError::NotFound(format!(
            "event {source:?} is not part of program {:?}",
            descriptor.program_name
        )));
    };
    let mut columns: BTreeSet<String> = fields.into_iter().map(column_name).collect();
    columns.extend(RESERVED_COLUMNS.iter().map(|c| c.to_string()));
    Ok((table, columns))
}

fn build_list_query(
    descriptor: &ProgramDescriptor,
    source: &str,
    filters: &EventFilters,
    order: OrderColumn,
    direction: OrderDirection,
    paging: Paging,
) -> Result<(String, Vec<DbValue>), ServiceError> {
    let (table, columns) = resolve_table(descriptor, source)?;

    let mut predicates: Vec<String> = Vec::new();
    let mut values: Vec<DbValue> = Vec::new();
    let mut bind = |value: DbValue, values: &mut Vec<DbValue>| -> usize {
        values.push(value);
        values.len()
    };

    if let Some(slot_from) = filters.slot_from {
        let index = bind(slot_from.into(), &mut values);
        predicates.push(format!("\"slot\" >= ${index}"));
    }
    if let Some(slot_to) = filters.slot_to {
        let index = bind(slot_to.into(), &mut values);
        predicates.push(format!("\"slot\" <= ${index}"));
    }
    if let Some(from) = filters.from {
        let index = bind(DbValue::ChronoDateTimeUtc(Some(Box::new(from))), &mut values);
        predicates.push(format!("\"block_time\" >= ${index}"));
    }
    if let Some(to) = filters.to {
        let index = bind(DbValue::ChronoDateTimeUtc(Some(Box::new(to))), &mut values);
        predicates.push(format!("\"block_time\" <= ${index}"));
    }
    for (field, value) in &filters.equals {
        let column = column_name(field);
        if !columns.contains(&column) {
            return Err(ServiceError::Validation(format!(
                "unknown filter column {field:?}"
            )));
        }
        let bound: DbValue = match value {
            Value::String(s) => s.clone().into(),
            Value::Bool(b) => (*b).into(),
            Value::Number(n) if n.is_f64() => n.as_f64().into(),
            Value::Number(n) => n.as_i64().unwrap_or_default().into(),
            _ => {
                return Err(ServiceError::Validation(format!(
                    "filter value for {field:?} must be a scalar"
                )))
            }
        };
        let index = bind(bound, &mut values);
        predicates.push(format!("{} = ${index}", quote_ident(&column)));
    }

    let where_clause = if predicates.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", predicates.join(" AND "))
    };
    let direction = match direction {
        OrderDirection::Asc => "ASC",
        OrderDirection::Desc => "DESC",
    };
    let limit_index = bind((paging.limit.clamp(1, 1000) as i64).into(), &mut values);
    let offset_index = bind((paging.offset as i64).into(), &mut values);

    let sql = format!(
        "SELECT ROW_TO_JSON(\"t\") AS \"row\" FROM (SELECT * FROM {table}{where_clause} ORDER BY {order_col} {direction} LIMIT ${limit_index} OFFSET ${offset_index}) \"t\"",
        table = quote_ident(&table),
        order_col = quote_ident(order.sql()),
    );
    Ok((sql, values))
}
