//! Idempotent batched writes into the tenant's tables. One transaction per
//! batch; every insert goes through `ON CONFLICT DO NOTHING` against the
//! table's uniqueness index, and only rows that actually landed are
//! re-broadcast on the fanout bus.

use crate::{
    decode::{DecodedBatch, DecodedEvent, DecodedInstruction},
    error::ServiceError,
    fanout::{FanoutBus, FanoutMessage},
    idl::descriptor::{
        EventDescriptor, FieldDescriptor, InstructionDescriptor, ProgramDescriptor, SqlType,
    },
    metrics,
    schema::{account_column_name, column_name, ddl, quote_ident},
    tenant,
};
use base64::prelude::*;
use chrono::Utc;
use sea_orm::{
    ConnectionTrait, DatabaseConnection, DatabaseTransaction, DbBackend, FromQueryResult,
    Statement, Value as DbValue,
};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct TxLogRow {
    pub tx_signature: String,
    pub slot: u64,
    pub log_messages: Vec<String>,
}

/// Checkpoint fields advanced together with a successful batch.
#[derive(Debug, Clone)]
pub struct CheckpointAdvance {
    pub last_slot: i64,
    pub last_signature: String,
    pub events_delta: i64,
}

#[derive(Debug, Clone, FromQueryResult)]
pub struct CheckpointState {
    pub program_id: String,
    pub last_slot: i64,
    pub last_signature: Option<String>,
    pub events_indexed: i64,
    pub status: String,
    pub error: Option<String>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WriteOutcome {
    pub inserted_events: u64,
    pub inserted_instructions: u64,
    pub inserted_transfers: u64,
    pub inserted_deltas: u64,
    /// Rows skipped by a uniqueness index.
    pub conflicts: u64,
    /// Data keys dropped because the descriptor has no matching column.
    pub dropped_columns: u64,
}

pub struct Writer {
    db: Arc<DatabaseConnection>,
    namespace: String,
    descriptor: Arc<ProgramDescriptor>,
    bus: Arc<FanoutBus>,
    /// Tenants attached to every fanout message for this program.
    subscribers: Vec<Uuid>,
}

impl Writer {
    pub fn new(
        db: Arc<DatabaseConnection>,
        namespace: String,
        descriptor: Arc<ProgramDescriptor>,
        bus: Arc<FanoutBus>,
        subscribers: Vec<Uuid>,
    ) -> Self {
        Self {
            db,
            namespace,
            descriptor,
            bus,
            subscribers,
        }
    }

    pub fn descriptor(&self) -> &Arc<ProgramDescriptor> {
        &self.descriptor
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Writes a decoded batch in a single transaction and publishes each
    /// inserted event/instruction row to the bus after commit. Conflicted
    /// rows are neither written nor re-broadcast.
    pub async fn write_batch(
        &self,
        batch: &DecodedBatch,
        raw_logs: &[TxLogRow],
        advance: Option<CheckpointAdvance>,
    ) -> Result<WriteOutcome, ServiceError> {
        let mut outcome = WriteOutcome::default();

        let mut event_plans = Vec::new();
        for (event, rows) in group_events(&self.descriptor, batch)? {
            let plan = event_insert_plan(&self.descriptor.program_name, event, &rows)?;
            outcome.dropped_columns += plan.dropped_columns;
            event_plans.push(plan);
        }
        let mut instruction_plans = Vec::new();
        for (instruction, rows) in group_instructions(&self.descriptor, batch)? {
            let plan =
                instruction_insert_plan(&self.descriptor.program_name, instruction, &rows)?;
            outcome.dropped_columns += plan.dropped_columns;
            instruction_plans.push(plan);
        }
        let transfer_plan = transfers_insert_plan(batch);
        let delta_plan = deltas_insert_plan(batch);
        let log_plan = tx_logs_insert_plan(raw_logs);
        let checkpoint_stmt = advance
            .as_ref()
            .map(|advance| checkpoint_advance_statement(&self.descriptor.program_id, advance));

        let (inserted_events, inserted_instructions, transfers, deltas) =
            tenant::with_namespace(&self.db, &self.namespace, |txn| {
                Box::pin(async move {
                    let mut inserted_events = HashSet::new();
                    for plan in &event_plans {
                        inserted_events.extend(returned_keys(txn, plan).await?);
                    }
                    let mut inserted_instructions = HashSet::new();
                    for plan in &instruction_plans {
                        inserted_instructions.extend(returned_keys(txn, plan).await?);
                    }
                    let mut transfers = 0u64;
                    if let Some(plan) = &transfer_plan {
                        transfers = execute_plan(txn, plan).await?;
                    }
                    let mut deltas = 0u64;
                    if let Some(plan) = &delta_plan {
                        deltas = execute_plan(txn, plan).await?;
                    }
                    if let Some(plan) = &log_plan {
                        execute_plan(txn, plan).await?;
                    }
                    if let Some(stmt) = &checkpoint_stmt {
                        txn.execute(stmt.clone()).await?;
                    }
                    Ok((inserted_events, inserted_instructions, transfers, deltas))
                })
            })
            .await?;

        outcome.inserted_events = inserted_events.len() as u64;
        outcome.inserted_instructions = inserted_instructions.len() as u64;
        outcome.inserted_transfers = transfers;
        outcome.inserted_deltas = deltas;
        outcome.conflicts = (batch.events.len() as u64 - outcome.inserted_events)
            + (batch.instructions.len() as u64 - outcome.inserted_instructions)
            + (batch.transfers.len() as u64 - transfers)
            + (batch.deltas.len() as u64 - deltas);

        let program = self.descriptor.program_name.as_str();
        metrics::ROWS_WRITTEN_TOTAL
            .with_label_values(&[program, "event"])
            .inc_by(outcome.inserted_events);
        metrics::ROWS_WRITTEN_TOTAL
            .with_label_values(&[program, "instruction"])
            .inc_by(outcome.inserted_instructions);
        metrics::ROWS_WRITTEN_TOTAL
            .with_label_values(&[program, "token_transfer"])
            .inc_by(outcome.inserted_transfers);
        metrics::ROWS_WRITTEN_TOTAL
            .with_label_values(&[program, "balance_delta"])
            .inc_by(outcome.inserted_deltas);
        if outcome.conflicts > 0 {
            metrics::WRITE_CONFLICTS_TOTAL
                .with_label_values(&[program, "all"])
                .inc_by(outcome.conflicts);
        }

        // publish after commit, preserving arrival order
        for event in &batch.events {
            if inserted_events.contains(&event_key(event)) {
                self.bus.publish(self.event_message(event));
            }
        }
        for instruction in &batch.instructions {
            if inserted_instructions.contains(&instruction_key(instruction)) {
                self.bus.publish(self.instruction_message(instruction));
            }
        }

        Ok(outcome)
    }

    pub async fn write_events(
        &self,
        rows: Vec<DecodedEvent>,
    ) -> Result<WriteOutcome, ServiceError> {
        let batch = DecodedBatch {
            events: rows,
            ..Default::default()
        };
        self.write_batch(&batch, &[], None).await
    }

    pub async fn write_instructions(
        &self,
        rows: Vec<DecodedInstruction>,
    ) -> Result<WriteOutcome, ServiceError> {
        let batch = DecodedBatch {
            instructions: rows,
            ..Default::default()
        };
        self.write_batch(&batch, &[], None).await
    }

    pub async fn write_token_transfers(
        &self,
        rows: Vec<crate::decode::TokenTransferRow>,
    ) -> Result<WriteOutcome, ServiceError> {
        let batch = DecodedBatch {
            transfers: rows,
            ..Default::default()
        };
        self.write_batch(&batch, &[], None).await
    }

    pub async fn write_balance_deltas(
        &self,
        rows: Vec<crate::decode::BalanceDeltaRow>,
    ) -> Result<WriteOutcome, ServiceError> {
        let batch = DecodedBatch {
            deltas: rows,
            ..Default::default()
        };
        self.write_batch(&batch, &[], None).await
    }

    /// Advances the checkpoint outside a batch write.
    pub async fn update_checkpoint(
        &self,
        advance: CheckpointAdvance,
    ) -> Result<(), ServiceError> {
        let stmt = checkpoint_advance_statement(&self.descriptor.program_id, &advance);
        tenant::with_namespace(&self.db, &self.namespace, move |txn| {
            Box::pin(async move {
                txn.execute(stmt).await?;
                Ok(())
            })
        })
        .await
    }

    pub async fn get_checkpoint(&self) -> Result<Option<CheckpointState>, ServiceError> {
        let program_id = self.descriptor.program_id.clone();
        tenant::with_namespace(&self.db, &self.namespace, move |txn| {
            Box::pin(async move {
                let state = CheckpointState::find_by_statement(Statement::from_sql_and_values(
                    DbBackend::Postgres,
                    format!(
                        r#"SELECT "program_id", "last_slot", "last_signature", "events_indexed", "status", "error" FROM "{}" WHERE "program_id" = $1"#,
                        ddl::STATE_TABLE
                    ),
                    [program_id.into()],
                ))
                .one(txn)
                .await?;
                Ok(state)
            })
        })
        .await
    }

    /// Writes the checkpoint status; `running` also stamps `started_at`.
    pub async fn set_status(
        &self,
        status: &str,
        error: Option<&str>,
    ) -> Result<(), ServiceError> {
        let stmt = Statement::from_sql_and_values(
            DbBackend::Postgres,
            format!(
                r#"INSERT INTO "{table}" ("program_id", "status", "error", "started_at")
VALUES ($1, $2, $3, CASE WHEN $2 = 'running' THEN NOW() END)
ON CONFLICT ("program_id") DO UPDATE SET
    "status" = EXCLUDED."status",
    "error" = EXCLUDED."error",
    "started_at" = CASE WHEN EXCLUDED."status" = 'running' THEN NOW() ELSE "{table}"."started_at" END"#,
                table = ddl::STATE_TABLE
            ),
            [
                self.descriptor.program_id.clone().into(),
                status.into(),
                DbValue::String(error.map(|e| Box::new(e.to_string()))),
            ],
        );
        tenant::with_namespace(&self.db, &self.namespace, move |txn| {
            Box::pin(async move {
                txn.execute(stmt).await?;
                Ok(())
            })
        })
        .await
    }

    pub async fn touch_poll_time(&self) -> Result<(), ServiceError> {
        let stmt = Statement::from_sql_and_values(
            DbBackend::Postgres,
            format!(
                r#"UPDATE "{}" SET "last_poll_at" = NOW() WHERE "program_id" = $1"#,
                ddl::STATE_TABLE
            ),
            [self.descriptor.program_id.clone().into()],
        );
        tenant::with_namespace(&self.db, &self.namespace, move |txn| {
            Box::pin(async move {
                txn.execute(stmt).await?;
                Ok(())
            })
        })
        .await
    }

    fn event_message(&self, event: &DecodedEvent) -> FanoutMessage {
        FanoutMessage {
            program_id: event.program_id.clone(),
            event_name: event.event_name.clone(),
            slot: event.slot,
            tx_signature: event.tx_signature.clone(),
            data: event.data.clone(),
            subscribers: self.subscribers.clone(),
            timestamp: Utc::now(),
        }
    }

    fn instruction_message(&self, instruction: &DecodedInstruction) -> FanoutMessage {
        let mut data = instruction.args.clone();
        for (name, pubkey) in &instruction.accounts {
            data.entry(account_column_name(name))
                .or_insert_with(|| Value::String(pubkey.clone()));
        }
        FanoutMessage {
            program_id: instruction.program_id.clone(),
            event_name: instruction.instruction_name.clone(),
            slot: instruction.slot,
            tx_signature: instruction.tx_signature.clone(),
            data,
            subscribers: self.subscribers.clone(),
            timestamp: Utc::now(),
        }
    }
}

type RowKey = (String, i32, i32);

fn event_key(event: &DecodedEvent) -> RowKey {
    (
        event.tx_signature.clone(),
        event.ix_index,
        event.inner_ix_index.unwrap_or(-1),
    )
}

fn instruction_key(instruction: &DecodedInstruction) -> RowKey {
    (instruction.tx_signature.clone(), instruction.ix_index, -1)
}

fn group_events<'a>(
    descriptor: &'a ProgramDescriptor,
    batch: &'a DecodedBatch,
) -> Result<Vec<(&'a EventDescriptor, Vec<&'a DecodedEvent>)>, ServiceError> {
    let mut grouped: BTreeMap<&str, Vec<&DecodedEvent>> = BTreeMap::new();
    let mut seen = HashSet::new();
    for event in &batch.events {
        // a duplicate key inside one statement would abort the insert
        if seen.insert(event_key(event)) {
            grouped.entry(&event.event_name).or_default().push(event);
        }
    }
    grouped
        .into_iter()
        .map(|(name, rows)| {
            descriptor
                .event(name)
                .map(|event| (event, rows))
                .ok_or_else(|| {
                    ServiceError::Validation(format!("decoded row for unknown event {name:?}"))
                })
        })
        .collect()
}

fn group_instructions<'a>(
    descriptor: &'a ProgramDescriptor,
    batch: &'a DecodedBatch,
) -> Result<Vec<(&'a InstructionDescriptor, Vec<&'a DecodedInstruction>)>, ServiceError> {
    let mut grouped: BTreeMap<&str, Vec<&DecodedInstruction>> = BTreeMap::new();
    let mut seen = HashSet::new();
    for instruction in &batch.instructions {
        if seen.insert(instruction_key(instruction)) {
            grouped
                .entry(&instruction.instruction_name)
                .or_default()
                .push(instruction);
        }
    }
    grouped
        .into_iter()
        .map(|(name, rows)| {
            descriptor
                .instruction(name)
                .map(|instruction| (instruction, rows))
                .ok_or_else(|| {
                    ServiceError::Validation(format!(
                        "decoded row for unknown instruction {name:?}"
                    ))
                })
        })
        .collect()
}

pub(crate) struct InsertPlan {
    pub sql: String,
    pub values: Vec<DbValue>,
    pub dropped_columns: u64,
}

impl InsertPlan {
    fn statement(&self) -> Statement {
        Statement::from_sql_and_values(DbBackend::Postgres, self.sql.as_str(), self.values.clone())
    }
}

async fn returned_keys(
    txn: &DatabaseTransaction,
    plan: &InsertPlan,
) -> Result<Vec<RowKey>, ServiceError> {
    let rows = txn.query_all(plan.statement()).await?;
    let mut keys = Vec::with_capacity(rows.len());
    for row in rows {
        let tx_signature: String = row.try_get("", "tx_signature")?;
        let ix_index: i32 = row.try_get("", "ix_index")?;
        let inner: Option<i32> = row.try_get("", "inner_ix_index").unwrap_or(None);
        keys.push((tx_signature, ix_index, inner.unwrap_or(-1)));
    }
    Ok(keys)
}

async fn execute_plan(
    txn: &DatabaseTransaction,
    plan: &InsertPlan,
) -> Result<u64, ServiceError> {
    let result = txn.execute(plan.statement()).await?;
    Ok(result.rows_affected())
}

/// Placeholder expression for one bound column; NUMERIC columns travel as
/// text and are cast server-side.
fn placeholder(index: usize, sql_type: SqlType) -> String {
    match sql_type {
        SqlType::Numeric => format!("CAST(${index} AS NUMERIC)"),
        _ => format!("${index}"),
    }
}

/// Converts one JSON field value into the bound parameter for its column.
fn field_value(field: &FieldDescriptor, value: Option<&Value>) -> DbValue {
    let value = value.filter(|v| !v.is_null());
    match field.sql_type() {
        SqlType::Integer => DbValue::Int(value.and_then(Value::as_i64).map(|v| v as i32)),
        SqlType::BigInt => DbValue::BigInt(value.and_then(json_i64)),
        SqlType::Numeric => DbValue::String(value.map(|v| Box::new(json_numeric_string(v)))),
        SqlType::DoublePrecision => DbValue::Double(value.and_then(Value::as_f64)),
        SqlType::Boolean => DbValue::Bool(value.and_then(Value::as_bool)),
        SqlType::Text => {
            DbValue::String(value.and_then(Value::as_str).map(|s| Box::new(s.to_string())))
        }
        SqlType::Bytea => DbValue::Bytes(
            value
                .and_then(Value::as_str)
                .and_then(|s| BASE64_STANDARD.decode(s).ok())
                .map(Box::new),
        ),
        SqlType::Jsonb => DbValue::Json(value.cloned().map(Box::new)),
    }
}

fn json_i64(value: &Value) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_u64().map(|v| v.min(i64::MAX as u64) as i64))
}

fn json_numeric_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub(crate) fn event_insert_plan(
    program_name: &str,
    event: &EventDescriptor,
    rows: &[&DecodedEvent],
) -> Result<InsertPlan, ServiceError> {
    let table = ddl::event_table_name(program_name, &event.name);
    let field_names: HashSet<&str> = event.fields.iter().map(|f| f.name.as_str()).collect();

    let mut columns = vec![
        "\"slot\"".to_string(),
        "\"block_time\"".to_string(),
        "\"tx_signature\"".to_string(),
        "\"ix_index\"".to_string(),
        "\"inner_ix_index\"".to_string(),
    ];
    for field in &event.fields {
        columns.push(quote_ident(&column_name(&field.name)));
    }

    let mut values = Vec::new();
    let mut tuples = Vec::with_capacity(rows.len());
    let mut dropped_columns = 0u64;
    let mut index = 1usize;
    for row in rows {
        dropped_columns += row
            .data
            .keys()
            .filter(|key| !field_names.contains(key.as_str()))
            .count() as u64;

        let mut placeholders = Vec::with_capacity(columns.len());
        let mut push = |value: DbValue, sql_type: SqlType, placeholders: &mut Vec<String>| {
            placeholders.push(placeholder(index, sql_type));
            values.push(value);
            index += 1;
        };
        push(
            DbValue::BigInt(Some(row.slot as i64)),
            SqlType::BigInt,
            &mut placeholders,
        );
        push(
            DbValue::ChronoDateTimeUtc(row.block_time.map(Box::new)),
            SqlType::Text,
            &mut placeholders,
        );
        push(
            row.tx_signature.clone().into(),
            SqlType::Text,
            &mut placeholders,
        );
        push(
            DbValue::Int(Some(row.ix_index)),
            SqlType::Integer,
            &mut placeholders,
        );
        push(
            DbValue::Int(row.inner_ix_index),
            SqlType::Integer,
            &mut placeholders,
        );
        for field in &event.fields {
            push(
                field_value(field, row.data.get(&field.name)),
                field.sql_type(),
                &mut placeholders,
            );
        }
        tuples.push(format!("({})", placeholders.join(", ")));
    }

    let sql = format!(
        "INSERT INTO {} ({}) VALUES {} \
         ON CONFLICT (\"tx_signature\", \"ix_index\", COALESCE(\"inner_ix_index\", -1)) DO NOTHING \
         RETURNING \"tx_signature\", \"ix_index\", \"inner_ix_index\"",
        quote_ident(&table),
        columns.join(", "),
        tuples.join(", ")
    );
    Ok(InsertPlan {
        sql,
        values,
        dropped_columns,
    })
}

pub(crate) fn instruction_insert_plan(
    program_name: &str,
    instruction: &InstructionDescriptor,
    rows: &[&DecodedInstruction],
) -> Result<InsertPlan, ServiceError> {
    let table = ddl::instruction_table_name(program_name, &instruction.name);
    let arg_names: HashSet<&str> = instruction.args.iter().map(|f| f.name.as_str()).collect();

    let mut columns = vec![
        "\"slot\"".to_string(),
        "\"block_time\"".to_string(),
        "\"tx_signature\"".to_string(),
        "\"ix_index\"".to_string(),
    ];
    for arg in &instruction.args {
        columns.push(quote_ident(&column_name(&arg.name)));
    }
    for account in &instruction.accounts {
        columns.push(quote_ident(&account_column_name(account)));
    }

    let mut values = Vec::new();
    let mut tuples = Vec::with_capacity(rows.len());
    let mut dropped_columns = 0u64;
    let mut index = 1usize;
    for row in rows {
        dropped_columns += row
            .args
            .keys()
            .filter(|key| !arg_names.contains(key.as_str()))
            .count() as u64;
        let bound: BTreeMap<&str, &str> = row
            .accounts
            .iter()
            .map(|(name, pubkey)| (name.as_str(), pubkey.as_str()))
            .collect();

        let mut placeholders = Vec::with_capacity(columns.len());
        let mut push = |value: DbValue, sql_type: SqlType, placeholders: &mut Vec<String>| {
            placeholders.push(placeholder(index, sql_type));
            values.push(value);
            index += 1;
        };
        push(
            DbValue::BigInt(Some(row.slot as i64)),
            SqlType::BigInt,
            &mut placeholders,
        );
        push(
            DbValue::ChronoDateTimeUtc(row.block_time.map(Box::new)),
            SqlType::Text,
            &mut placeholders,
        );
        push(
            row.tx_signature.clone().into(),
            SqlType::Text,
            &mut placeholders,
        );
        push(
            DbValue::Int(Some(row.ix_index)),
            SqlType::Integer,
            &mut placeholders,
        );
        for arg in &instruction.args {
            push(
                field_value(arg, row.args.get(&arg.name)),
                arg.sql_type(),
                &mut placeholders,
            );
        }
        for account in &instruction.accounts {
            push(
                DbValue::String(bound.get(account.as_str()).map(|p| Box::new(p.to_string()))),
                SqlType::Text,
                &mut placeholders,
            );
        }
        tuples.push(format!("({})", placeholders.join(", ")));
    }

    let sql = format!(
        "INSERT INTO {} ({}) VALUES {} \
         ON CONFLICT (\"tx_signature\", \"ix_index\") DO NOTHING \
         RETURNING \"tx_signature\", \"ix_index\"",
        quote_ident(&table),
        columns.join(", "),
        tuples.join(", ")
    );
    Ok(InsertPlan {
        sql,
        values,
        dropped_columns,
    })
}

fn transfers_insert_plan(batch: &DecodedBatch) -> Option<InsertPlan> {
    if batch.transfers.is_empty() {
        return None;
    }
    let mut values = Vec::new();
    let mut tuples = Vec::with_capacity(batch.transfers.len());
    let mut index = 1usize;
    for row in &batch.transfers {
        let mut placeholders = Vec::new();
        let mut push = |value: DbValue, sql_type: SqlType, placeholders: &mut Vec<String>| {
            placeholders.push(placeholder(index, sql_type));
            values.push(value);
            index += 1;
        };
        push(row.tx_signature.clone().into(), SqlType::Text, &mut placeholders);
        push(
            DbValue::BigInt(Some(row.slot as i64)),
            SqlType::BigInt,
            &mut placeholders,
        );
        push(
            DbValue::ChronoDateTimeUtc(row.block_time.map(Box::new)),
            SqlType::Text,
            &mut placeholders,
        );
        push(
            row.instruction_type.clone().into(),
            SqlType::Text,
            &mut placeholders,
        );
        push(opt_string(&row.source), SqlType::Text, &mut placeholders);
        push(opt_string(&row.destination), SqlType::Text, &mut placeholders);
        push(opt_string(&row.authority), SqlType::Text, &mut placeholders);
        push(opt_string(&row.mint), SqlType::Text, &mut placeholders);
        push(
            DbValue::String(Some(Box::new(row.amount.clone()))),
            SqlType::Numeric,
            &mut placeholders,
        );
        push(
            DbValue::Int(row.decimals.map(|d| d as i32)),
            SqlType::Integer,
            &mut placeholders,
        );
        push(
            row.token_program.clone().into(),
            SqlType::Text,
            &mut placeholders,
        );
        push(
            DbValue::Int(Some(row.parent_ix_index)),
            SqlType::Integer,
            &mut placeholders,
        );
        push(
            DbValue::Int(row.inner_ix_index),
            SqlType::Integer,
            &mut placeholders,
        );
        tuples.push(format!("({})", placeholders.join(", ")));
    }
    let sql = format!(
        "INSERT INTO \"{}\" (\"tx_signature\", \"slot\", \"block_time\", \"instruction_type\", \
         \"source\", \"destination\", \"authority\", \"mint\", \"amount\", \"decimals\", \
         \"token_program\", \"parent_ix_index\", \"inner_ix_index\") VALUES {} \
         ON CONFLICT (\"tx_signature\", \"parent_ix_index\", COALESCE(\"inner_ix_index\", -1)) DO NOTHING",
        ddl::CPI_TRANSFERS_TABLE,
        tuples.join(", ")
    );
    Some(InsertPlan {
        sql,
        values,
        dropped_columns: 0,
    })
}

fn deltas_insert_plan(batch: &DecodedBatch) -> Option<InsertPlan> {
    if batch.deltas.is_empty() {
        return None;
    }
    let mut values = Vec::new();
    let mut tuples = Vec::with_capacity(batch.deltas.len());
    let mut index = 1usize;
    for row in &batch.deltas {
        let mut placeholders = Vec::new();
        let mut push = |value: DbValue, sql_type: SqlType, placeholders: &mut Vec<String>| {
            placeholders.push(placeholder(index, sql_type));
            values.push(value);
            index += 1;
        };
        push(row.tx_signature.clone().into(), SqlType::Text, &mut placeholders);
        push(
            DbValue::BigInt(Some(row.slot as i64)),
            SqlType::BigInt,
            &mut placeholders,
        );
        push(
            DbValue::ChronoDateTimeUtc(row.block_time.map(Box::new)),
            SqlType::Text,
            &mut placeholders,
        );
        push(
            DbValue::Int(Some(row.account_index)),
            SqlType::Integer,
            &mut placeholders,
        );
        push(
            opt_string(&row.account_address),
            SqlType::Text,
            &mut placeholders,
        );
        push(opt_string(&row.mint), SqlType::Text, &mut placeholders);
        push(opt_string(&row.owner), SqlType::Text, &mut placeholders);
        push(
            DbValue::String(Some(Box::new(row.pre_amount.clone()))),
            SqlType::Numeric,
            &mut placeholders,
        );
        push(
            DbValue::String(Some(Box::new(row.post_amount.clone()))),
            SqlType::Numeric,
            &mut placeholders,
        );
        push(
            DbValue::String(Some(Box::new(row.delta.clone()))),
            SqlType::Numeric,
            &mut placeholders,
        );
        push(
            DbValue::Int(row.decimals.map(|d| d as i32)),
            SqlType::Integer,
            &mut placeholders,
        );
        tuples.push(format!("({})", placeholders.join(", ")));
    }
    let sql = format!(
        "INSERT INTO \"{}\" (\"tx_signature\", \"slot\", \"block_time\", \"account_index\", \
         \"account_address\", \"mint\", \"owner\", \"pre_amount\", \"post_amount\", \"delta\", \
         \"decimals\") VALUES {} \
         ON CONFLICT (\"tx_signature\", \"account_index\") DO NOTHING",
        ddl::BALANCE_CHANGES_TABLE,
        tuples.join(", ")
    );
    Some(InsertPlan {
        sql,
        values,
        dropped_columns: 0,
    })
}

fn tx_logs_insert_plan(rows: &[TxLogRow]) -> Option<InsertPlan> {
    if rows.is_empty() {
        return None;
    }
    let mut values = Vec::new();
    let mut tuples = Vec::with_capacity(rows.len());
    let mut index = 1usize;
    for row in rows {
        tuples.push(format!("(${}, ${}, ${})", index, index + 1, index + 2));
        index += 3;
        values.push(row.tx_signature.clone().into());
        values.push(DbValue::BigInt(Some(row.slot as i64)));
        values.push(DbValue::Array(
            sea_orm::sea_query::ArrayType::String,
            Some(Box::new(
                row.log_messages
                    .iter()
                    .map(|log| DbValue::from(log.clone()))
                    .collect(),
            )),
        ));
    }
    let sql = format!(
        "INSERT INTO \"{}\" (\"tx_signature\", \"slot\", \"log_messages\") VALUES {} \
         ON CONFLICT (\"tx_signature\") DO NOTHING",
        ddl::TX_LOGS_TABLE,
        tuples.join(", ")
    );
    Some(InsertPlan {
        sql,
        values,
        dropped_columns: 0,
    })
}

fn opt_string(value: &Option<String>) -> DbValue {
    DbValue::String(value.clone().map(Box::new))
}

/// Upserts the checkpoint row. `last_slot` is kept monotone with GREATEST
/// and `events_indexed` accumulates, so a concurrent or replayed batch can
/// only move the cursor forward.
fn checkpoint_advance_statement(program_id: &str, advance: &CheckpointAdvance) -> Statement {
    Statement::from_sql_and_values(
        DbBackend::Postgres,
        format!(
            r#"INSERT INTO "{table}" ("program_id", "last_slot", "last_signature", "events_indexed", "status", "last_poll_at")
VALUES ($1, $2, $3, $4, 'running', NOW())
ON CONFLICT ("program_id") DO UPDATE SET
    "last_slot" = GREATEST("{table}"."last_slot", EXCLUDED."last_slot"),
    "last_signature" = EXCLUDED."last_signature",
    "events_indexed" = "{table}"."events_indexed" + EXCLUDED."events_indexed",
    "status" = 'running',
    "last_poll_at" = NOW()"#,
            table = ddl::STATE_TABLE
        ),
        [
            program_id.into(),
            advance.last_slot.into(),
            advance.last_signature.clone().into(),
            advance.events_delta.into(),
        ],
    )
}
