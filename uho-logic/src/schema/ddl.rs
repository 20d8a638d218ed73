use super::{account_column_name, column_name, quote_ident, validate_identifier};
use crate::{
    error::ServiceError,
    idl::descriptor::{EventDescriptor, InstructionDescriptor, ProgramDescriptor},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

pub const STATE_TABLE: &str = "_uho_state";
pub const TX_LOGS_TABLE: &str = "_tx_logs";
pub const CPI_TRANSFERS_TABLE: &str = "_cpi_transfers";
pub const BALANCE_CHANGES_TABLE: &str = "_token_balance_changes";

/// Which declared events and instructions get tables and decoders.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnabledSet {
    pub events: BTreeSet<String>,
    pub instructions: BTreeSet<String>,
}

impl EnabledSet {
    pub fn all(descriptor: &ProgramDescriptor) -> Self {
        Self {
            events: descriptor.events.iter().map(|e| e.name.clone()).collect(),
            instructions: descriptor
                .instructions
                .iter()
                .map(|i| i.name.clone())
                .collect(),
        }
    }

    pub fn event_enabled(&self, name: &str) -> bool {
        self.events.contains(name)
    }

    pub fn instruction_enabled(&self, name: &str) -> bool {
        self.instructions.contains(name)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureFlags {
    pub cpi_transfers: bool,
    pub balance_deltas: bool,
}

pub fn event_table_name(program_name: &str, event_name: &str) -> String {
    format!("{program_name}_{event_name}")
}

pub fn instruction_table_name(program_name: &str, instruction_name: &str) -> String {
    format!("{program_name}_{instruction_name}_ix")
}

/// Compiles the full tenant DDL: checkpoint and raw-log tables always, one
/// table per enabled event/instruction, and the token tables behind their
/// feature flags. Statements are ordered tables-then-indexes per table and
/// are all idempotent.
pub fn ddl_statements(
    descriptor: &ProgramDescriptor,
    enabled: &EnabledSet,
    flags: FeatureFlags,
) -> Result<Vec<String>, ServiceError> {
    let mut statements = Vec::new();
    statements.extend(state_table_ddl());
    statements.extend(tx_logs_ddl());

    for event in &descriptor.events {
        if enabled.event_enabled(&event.name) {
            statements.extend(event_table_ddl(&descriptor.program_name, event)?);
        }
    }
    for instruction in &descriptor.instructions {
        if enabled.instruction_enabled(&instruction.name) {
            statements.extend(instruction_table_ddl(
                &descriptor.program_name,
                instruction,
            )?);
        }
    }
    if flags.cpi_transfers {
        statements.extend(cpi_transfers_ddl());
    }
    if flags.balance_deltas {
        statements.extend(balance_changes_ddl());
    }
    Ok(statements)
}

fn event_table_ddl(
    program_name: &str,
    event: &EventDescriptor,
) -> Result<Vec<String>, ServiceError> {
    let table = event_table_name(program_name, &event.name);
    validate_identifier(&table)?;

    let mut columns = vec![
        "\"id\" BIGSERIAL PRIMARY KEY".to_string(),
        "\"slot\" BIGINT NOT NULL".to_string(),
        "\"block_time\" TIMESTAMPTZ".to_string(),
        "\"tx_signature\" TEXT NOT NULL".to_string(),
        "\"ix_index\" INTEGER NOT NULL".to_string(),
        "\"inner_ix_index\" INTEGER".to_string(),
    ];
    for field in &event.fields {
        let column = column_name(&field.name);
        validate_identifier(&column)?;
        let not_null = if field.nullable { "" } else { " NOT NULL" };
        columns.push(format!(
            "{} {}{not_null}",
            quote_ident(&column),
            field.sql_type().ddl()
        ));
    }
    columns.push("\"indexed_at\" TIMESTAMPTZ NOT NULL DEFAULT NOW()".to_string());

    let quoted = quote_ident(&table);
    Ok(vec![
        format!(
            "CREATE TABLE IF NOT EXISTS {quoted} (\n    {}\n)",
            columns.join(",\n    ")
        ),
        format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS {} ON {quoted} (\"tx_signature\", \"ix_index\", COALESCE(\"inner_ix_index\", -1))",
            quote_ident(&index_name(&table, "tx_ix_unique"))
        ),
        standard_index(&table, "slot"),
        standard_index(&table, "tx_signature"),
        standard_index(&table, "block_time"),
    ])
}

fn instruction_table_ddl(
    program_name: &str,
    instruction: &InstructionDescriptor,
) -> Result<Vec<String>, ServiceError> {
    let table = instruction_table_name(program_name, &instruction.name);
    validate_identifier(&table)?;

    let mut columns = vec![
        "\"id\" BIGSERIAL PRIMARY KEY".to_string(),
        "\"slot\" BIGINT NOT NULL".to_string(),
        "\"block_time\" TIMESTAMPTZ".to_string(),
        "\"tx_signature\" TEXT NOT NULL".to_string(),
        "\"ix_index\" INTEGER NOT NULL".to_string(),
    ];
    for arg in &instruction.args {
        let column = column_name(&arg.name);
        validate_identifier(&column)?;
        let not_null = if arg.nullable { "" } else { " NOT NULL" };
        columns.push(format!(
            "{} {}{not_null}",
            quote_ident(&column),
            arg.sql_type().ddl()
        ));
    }
    for account in &instruction.accounts {
        let column = account_column_name(account);
        validate_identifier(&column)?;
        columns.push(format!("{} TEXT", quote_ident(&column)));
    }
    columns.push("\"indexed_at\" TIMESTAMPTZ NOT NULL DEFAULT NOW()".to_string());

    let quoted = quote_ident(&table);
    Ok(vec![
        format!(
            "CREATE TABLE IF NOT EXISTS {quoted} (\n    {}\n)",
            columns.join(",\n    ")
        ),
        format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS {} ON {quoted} (\"tx_signature\", \"ix_index\")",
            quote_ident(&index_name(&table, "tx_ix_unique"))
        ),
        standard_index(&table, "slot"),
        standard_index(&table, "tx_signature"),
        standard_index(&table, "block_time"),
    ])
}

fn state_table_ddl() -> Vec<String> {
    vec![format!(
        r#"CREATE TABLE IF NOT EXISTS "{STATE_TABLE}" (
    "program_id" TEXT PRIMARY KEY,
    "last_slot" BIGINT NOT NULL DEFAULT 0,
    "last_signature" TEXT,
    "events_indexed" BIGINT NOT NULL DEFAULT 0,
    "status" TEXT NOT NULL DEFAULT 'stopped',
    "started_at" TIMESTAMPTZ,
    "last_poll_at" TIMESTAMPTZ,
    "error" TEXT
)"#
    )]
}

fn tx_logs_ddl() -> Vec<String> {
    vec![format!(
        r#"CREATE TABLE IF NOT EXISTS "{TX_LOGS_TABLE}" (
    "tx_signature" TEXT PRIMARY KEY,
    "slot" BIGINT NOT NULL,
    "log_messages" TEXT[] NOT NULL
)"#
    )]
}

fn cpi_transfers_ddl() -> Vec<String> {
    vec![
        format!(
            r#"CREATE TABLE IF NOT EXISTS "{CPI_TRANSFERS_TABLE}" (
    "id" BIGSERIAL PRIMARY KEY,
    "tx_signature" TEXT NOT NULL,
    "slot" BIGINT NOT NULL,
    "block_time" TIMESTAMPTZ,
    "instruction_type" TEXT NOT NULL,
    "source" TEXT,
    "destination" TEXT,
    "authority" TEXT,
    "mint" TEXT,
    "amount" NUMERIC(20,0) NOT NULL,
    "decimals" INTEGER,
    "token_program" TEXT NOT NULL,
    "parent_ix_index" INTEGER NOT NULL,
    "inner_ix_index" INTEGER,
    "indexed_at" TIMESTAMPTZ NOT NULL DEFAULT NOW()
)"#
        ),
        format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS \"cpi_transfers_tx_ix_unique\" ON \"{CPI_TRANSFERS_TABLE}\" (\"tx_signature\", \"parent_ix_index\", COALESCE(\"inner_ix_index\", -1))"
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS \"cpi_transfers_slot_index\" ON \"{CPI_TRANSFERS_TABLE}\" (\"slot\")"
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS \"cpi_transfers_mint_index\" ON \"{CPI_TRANSFERS_TABLE}\" (\"mint\")"
        ),
    ]
}

fn balance_changes_ddl() -> Vec<String> {
    vec![
        format!(
            r#"CREATE TABLE IF NOT EXISTS "{BALANCE_CHANGES_TABLE}" (
    "id" BIGSERIAL PRIMARY KEY,
    "tx_signature" TEXT NOT NULL,
    "slot" BIGINT NOT NULL,
    "block_time" TIMESTAMPTZ,
    "account_index" INTEGER NOT NULL,
    "account_address" TEXT,
    "mint" TEXT,
    "owner" TEXT,
    "pre_amount" NUMERIC(20,0) NOT NULL,
    "post_amount" NUMERIC(20,0) NOT NULL,
    "delta" NUMERIC(20,0) NOT NULL,
    "decimals" INTEGER,
    "indexed_at" TIMESTAMPTZ NOT NULL DEFAULT NOW()
)"#
        ),
        format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS \"token_balance_changes_tx_account_unique\" ON \"{BALANCE_CHANGES_TABLE}\" (\"tx_signature\", \"account_index\")"
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS \"token_balance_changes_slot_index\" ON \"{BALANCE_CHANGES_TABLE}\" (\"slot\")"
        ),
    ]
}

fn standard_index(table: &str, column: &str) -> String {
    format!(
        "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
        quote_ident(&index_name(table, &format!("{column}_index"))),
        quote_ident(table),
        quote_ident(column)
    )
}

// Postgres truncates identifiers at 63 bytes; keep index names under the
// limit so IF NOT EXISTS matches the name we actually created.
fn index_name(table: &str, suffix: &str) -> String {
    let budget = 63usize.saturating_sub(suffix.len() + 1);
    let table = if table.len() > budget {
        &table[..budget]
    } else {
        table
    };
    format!("{table}_{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idl::descriptor::{FieldDescriptor, WireType};
    use std::collections::BTreeMap;

    fn descriptor() -> ProgramDescriptor {
        ProgramDescriptor {
            program_id: "TokenkegQfeZyiNwAJbNbGKPFXCWuBvf9Ss623VQ5DA".into(),
            program_name: "amm_core".into(),
            events: vec![EventDescriptor {
                name: "swap_event".into(),
                discriminator: [1, 2, 3, 4, 5, 6, 7, 8],
                fields: vec![
                    FieldDescriptor {
                        name: "amount".into(),
                        wire: WireType::U64,
                        nullable: false,
                    },
                    FieldDescriptor {
                        name: "referrer".into(),
                        wire: WireType::Option(Box::new(WireType::Pubkey)),
                        nullable: true,
                    },
                    FieldDescriptor {
                        name: "slot".into(),
                        wire: WireType::U64,
                        nullable: false,
                    },
                ],
            }],
            instructions: vec![InstructionDescriptor {
                name: "swap".into(),
                discriminator: vec![1],
                accounts: vec!["pool".into(), "user".into()],
                args: vec![FieldDescriptor {
                    name: "amount_in".into(),
                    wire: WireType::U64,
                    nullable: false,
                }],
            }],
            accounts: vec![],
            types: BTreeMap::new(),
        }
    }

    #[test]
    fn emits_fixed_tables_and_enabled_event_tables() {
        let descriptor = descriptor();
        let statements = ddl_statements(
            &descriptor,
            &EnabledSet::all(&descriptor),
            FeatureFlags::default(),
        )
        .unwrap();

        assert!(statements
            .iter()
            .all(|s| s.contains("IF NOT EXISTS")));
        assert!(statements[0].contains("\"_uho_state\""));
        assert!(statements[1].contains("\"_tx_logs\""));
        assert!(statements
            .iter()
            .any(|s| s.starts_with("CREATE TABLE IF NOT EXISTS \"amm_core_swap_event\"")));
        assert!(statements
            .iter()
            .any(|s| s.starts_with("CREATE TABLE IF NOT EXISTS \"amm_core_swap_ix\"")));
        // token tables only behind flags
        assert!(!statements.iter().any(|s| s.contains("_cpi_transfers")));
        assert!(!statements
            .iter()
            .any(|s| s.contains("_token_balance_changes")));
    }

    #[test]
    fn event_table_carries_metadata_uniqueness_and_field_columns() {
        let descriptor = descriptor();
        let statements =
            event_table_ddl(&descriptor.program_name, &descriptor.events[0]).unwrap();

        let table = &statements[0];
        assert!(table.contains("\"amount\" BIGINT NOT NULL"));
        // option field loses NOT NULL, keeps inner type
        assert!(table.contains("\"referrer\" TEXT"));
        assert!(!table.contains("\"referrer\" TEXT NOT NULL"));
        // reserved name collision suffixed
        assert!(table.contains("\"slot_field\" BIGINT NOT NULL"));

        let unique = &statements[1];
        assert!(unique.contains(
            "(\"tx_signature\", \"ix_index\", COALESCE(\"inner_ix_index\", -1))"
        ));
        assert!(statements.iter().any(|s| s.contains("(\"slot\")")));
        assert!(statements.iter().any(|s| s.contains("(\"block_time\")")));
        assert!(statements.iter().any(|s| s.contains("(\"tx_signature\")")));
    }

    #[test]
    fn instruction_table_binds_accounts_as_text_columns() {
        let descriptor = descriptor();
        let statements =
            instruction_table_ddl(&descriptor.program_name, &descriptor.instructions[0])
                .unwrap();
        assert!(statements[0].contains("\"acct_pool\" TEXT"));
        assert!(statements[0].contains("\"acct_user\" TEXT"));
        assert!(statements[1].contains("(\"tx_signature\", \"ix_index\")"));
    }

    #[test]
    fn feature_flags_gate_token_tables() {
        let descriptor = descriptor();
        let statements = ddl_statements(
            &descriptor,
            &EnabledSet::default(),
            FeatureFlags {
                cpi_transfers: true,
                balance_deltas: true,
            },
        )
        .unwrap();
        assert!(statements.iter().any(|s| s.contains("\"_cpi_transfers\"")));
        assert!(statements
            .iter()
            .any(|s| s.contains("\"_token_balance_changes\"")));
        // nothing enabled, so no per-event tables
        assert!(!statements.iter().any(|s| s.contains("amm_core_swap_event")));
    }

    #[test]
    fn disabled_names_get_no_tables() {
        let descriptor = descriptor();
        let enabled = EnabledSet {
            events: ["swap_event".to_string()].into(),
            instructions: BTreeSet::new(),
        };
        let statements =
            ddl_statements(&descriptor, &enabled, FeatureFlags::default()).unwrap();
        assert!(statements
            .iter()
            .any(|s| s.contains("\"amm_core_swap_event\"")));
        assert!(!statements.iter().any(|s| s.contains("\"amm_core_swap_ix\"")));
    }

    #[test]
    fn invalid_identifier_is_rejected() {
        let mut descriptor = descriptor();
        descriptor.events[0].fields[0].name = "bad;drop".into();
        let err = ddl_statements(
            &descriptor,
            &EnabledSet::all(&descriptor),
            FeatureFlags::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidIdl(_)));
    }
}
