//! Declarative view compiler. A view selects plain columns and aggregates
//! from a single event or instruction source, optionally grouped and
//! filtered, and is materialized with a per-view refresh interval.

use super::{column_name, ddl, quote_ident, validate_identifier, RESERVED_COLUMNS};
use crate::{error::ServiceError, idl::descriptor::ProgramDescriptor};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ViewDefinition {
    pub name: String,
    /// Event or instruction name of the descriptor this view reads from.
    pub source: String,
    pub select: Vec<SelectExpr>,
    #[serde(default)]
    pub group_by: Vec<String>,
    #[serde(default, rename = "where")]
    pub filters: Vec<ViewFilter>,
    #[serde(default = "default_refresh_secs")]
    pub refresh_secs: u64,
}

impl ViewDefinition {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_secs)
    }
}

fn default_refresh_secs() -> u64 {
    300
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum SelectExpr {
    Column(String),
    Aggregate {
        agg: Aggregate,
        column: String,
        #[serde(default)]
        alias: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregate {
    Count,
    Sum,
    Avg,
    Min,
    Max,
    First,
    Last,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ViewFilter {
    pub column: String,
    #[serde(default)]
    pub op: FilterOp,
    pub value: Value,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterOp {
    #[default]
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl FilterOp {
    fn sql(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "<>",
            Self::Gt => ">",
            Self::Gte => ">=",
            Self::Lt => "<",
            Self::Lte => "<=",
        }
    }
}

/// Compiles a view definition against a descriptor into a
/// `CREATE MATERIALIZED VIEW IF NOT EXISTS` statement.
pub fn compile_view(
    descriptor: &ProgramDescriptor,
    view: &ViewDefinition,
) -> Result<String, ServiceError> {
    validate_identifier(&view.name)
        .map_err(|_| ServiceError::InvalidView(format!("bad view name {:?}", view.name)))?;

    let (source_table, columns) = resolve_source(descriptor, &view.source)?;

    let check_column = |name: &str| -> Result<String, ServiceError> {
        let column = column_name(name);
        if columns.contains(column.as_str()) {
            Ok(column)
        } else {
            Err(ServiceError::InvalidView(format!(
                "unknown column {name:?} on source {:?}",
                view.source
            )))
        }
    };

    if view.select.is_empty() {
        return Err(ServiceError::InvalidView("empty select list".into()));
    }

    let mut select_parts = Vec::with_capacity(view.select.len());
    for expr in &view.select {
        match expr {
            SelectExpr::Column(name) => {
                select_parts.push(quote_ident(&check_column(name)?));
            }
            SelectExpr::Aggregate { agg, column, alias } => {
                let compiled = compile_aggregate(*agg, column, &check_column)?;
                let alias = match alias {
                    Some(alias) => {
                        validate_identifier(alias).map_err(|_| {
                            ServiceError::InvalidView(format!("bad alias {alias:?}"))
                        })?;
                        alias.clone()
                    }
                    None => default_alias(*agg, column),
                };
                select_parts.push(format!("{compiled} AS {}", quote_ident(&alias)));
            }
        }
    }

    let mut sql = format!(
        "CREATE MATERIALIZED VIEW IF NOT EXISTS {} AS SELECT {} FROM {}",
        quote_ident(&view.name),
        select_parts.join(", "),
        quote_ident(&source_table)
    );

    if !view.filters.is_empty() {
        let mut predicates = Vec::with_capacity(view.filters.len());
        for filter in &view.filters {
            predicates.push(format!(
                "{} {} {}",
                quote_ident(&check_column(&filter.column)?),
                filter.op.sql(),
                literal(&filter.value)?
            ));
        }
        sql.push_str(&format!(" WHERE {}", predicates.join(" AND ")));
    }

    if !view.group_by.is_empty() {
        let mut groups = Vec::with_capacity(view.group_by.len());
        for group in &view.group_by {
            groups.push(quote_ident(&check_column(group)?));
        }
        sql.push_str(&format!(" GROUP BY {}", groups.join(", ")));
    }

    Ok(sql)
}

pub fn refresh_statement(view_name: &str) -> Result<String, ServiceError> {
    validate_identifier(view_name)
        .map_err(|_| ServiceError::InvalidView(format!("bad view name {view_name:?}")))?;
    Ok(format!(
        "REFRESH MATERIALIZED VIEW {}",
        quote_ident(view_name)
    ))
}

fn resolve_source(
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
        return Err(ServiceError::InvalidView(format!(
            "source {source:?} is not an event or instruction of the program"
        )));
    };

    let mut columns: BTreeSet<String> = fields.into_iter().map(column_name).collect();
    columns.extend(RESERVED_COLUMNS.iter().map(|c| c.to_string()));
    Ok((table, columns))
}

fn compile_aggregate(
    agg: Aggregate,
    column: &str,
    check_column: &impl Fn(&str) -> Result<String, ServiceError>,
) -> Result<String, ServiceError> {
    if agg == Aggregate::Count && column == "*" {
        return Ok("COUNT(*)".to_string());
    }
    let column = quote_ident(&check_column(column)?);
    Ok(match agg {
        Aggregate::Count => format!("COUNT({column})"),
        Aggregate::Sum => format!("SUM({column})"),
        Aggregate::Avg => format!("AVG({column})"),
        Aggregate::Min => format!("MIN({column})"),
        Aggregate::Max => format!("MAX({column})"),
        Aggregate::First => format!("(ARRAY_AGG({column} ORDER BY \"slot\" ASC))[1]"),
        Aggregate::Last => format!("(ARRAY_AGG({column} ORDER BY \"slot\" DESC))[1]"),
    })
}

fn default_alias(agg: Aggregate, column: &str) -> String {
    let agg = match agg {
        Aggregate::Count => "count",
        Aggregate::Sum => "sum",
        Aggregate::Avg => "avg",
        Aggregate::Min => "min",
        Aggregate::Max => "max",
        Aggregate::First => "first",
        Aggregate::Last => "last",
    };
    if column == "*" {
        agg.to_string()
    } else {
        format!("{column}_{agg}")
    }
}

/// Interpolated values are restricted to numbers, booleans, and strings
/// with single quotes doubled.
fn literal(value: &Value) -> Result<String, ServiceError> {
    match value {
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::String(s) => Ok(format!("'{}'", s.replace('\'', "''"))),
        _ => Err(ServiceError::InvalidView(
            "filter values must be numbers, booleans or strings".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idl::descriptor::{
        EventDescriptor, FieldDescriptor, InstructionDescriptor, WireType,
    };
    use serde_json::json;
    use std::collections::BTreeMap;

    fn descriptor() -> ProgramDescriptor {
        ProgramDescriptor {
            program_id: "TokenkegQfeZyiNwAJbNbGKPFXCWuBvf9Ss623VQ5DA".into(),
            program_name: "amm".into(),
            events: vec![EventDescriptor {
                name: "swap_event".into(),
                discriminator: [0; 8],
                fields: vec![
                    FieldDescriptor {
                        name: "amount".into(),
                        wire: WireType::U64,
                        nullable: false,
                    },
                    FieldDescriptor {
                        name: "trader".into(),
                        wire: WireType::Pubkey,
                        nullable: false,
                    },
                ],
            }],
            instructions: vec![InstructionDescriptor {
                name: "swap".into(),
                discriminator: vec![1],
                accounts: vec![],
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

    fn view(json: Value) -> ViewDefinition {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn compiles_grouped_aggregates() {
        let sql = compile_view(
            &descriptor(),
            &view(json!({
                "name": "volume_by_trader",
                "source": "swap_event",
                "select": [
                    "trader",
                    { "agg": "sum", "column": "amount" },
                    { "agg": "count", "column": "*", "alias": "swaps" }
                ],
                "group_by": ["trader"]
            })),
        )
        .unwrap();

        assert_eq!(
            sql,
            "CREATE MATERIALIZED VIEW IF NOT EXISTS \"volume_by_trader\" AS \
             SELECT \"trader\", SUM(\"amount\") AS \"amount_sum\", COUNT(*) AS \"swaps\" \
             FROM \"amm_swap_event\" GROUP BY \"trader\""
        );
    }

    #[test]
    fn first_and_last_compile_to_ordered_array_agg() {
        let sql = compile_view(
            &descriptor(),
            &view(json!({
                "name": "latest_amount",
                "source": "swap_event",
                "select": [
                    { "agg": "first", "column": "amount" },
                    { "agg": "last", "column": "amount" }
                ]
            })),
        )
        .unwrap();
        assert!(sql.contains("(ARRAY_AGG(\"amount\" ORDER BY \"slot\" ASC))[1]"));
        assert!(sql.contains("(ARRAY_AGG(\"amount\" ORDER BY \"slot\" DESC))[1]"));
    }

    #[test]
    fn filters_quote_string_literals() {
        let sql = compile_view(
            &descriptor(),
            &view(json!({
                "name": "one_trader",
                "source": "swap_event",
                "select": [ { "agg": "count", "column": "*" } ],
                "where": [ { "column": "trader", "value": "o'brien" } ]
            })),
        )
        .unwrap();
        assert!(sql.contains("WHERE \"trader\" = 'o''brien'"));
    }

    #[test]
    fn instruction_sources_resolve_to_ix_tables() {
        let sql = compile_view(
            &descriptor(),
            &view(json!({
                "name": "swap_count",
                "source": "swap",
                "select": [ { "agg": "count", "column": "*" } ]
            })),
        )
        .unwrap();
        assert!(sql.contains("FROM \"amm_swap_ix\""));
    }

    #[test]
    fn metadata_columns_are_selectable() {
        let sql = compile_view(
            &descriptor(),
            &view(json!({
                "name": "by_slot",
                "source": "swap_event",
                "select": [ "slot", { "agg": "count", "column": "*" } ],
                "group_by": ["slot"]
            })),
        )
        .unwrap();
        assert!(sql.contains("GROUP BY \"slot\""));
    }

    #[test]
    fn unknown_source_is_rejected() {
        let err = compile_view(
            &descriptor(),
            &view(json!({
                "name": "v",
                "source": "missing",
                "select": ["amount"]
            })),
        )
        .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidView(_)));
    }

    #[test]
    fn unknown_column_is_rejected() {
        let err = compile_view(
            &descriptor(),
            &view(json!({
                "name": "v",
                "source": "swap_event",
                "select": ["not_a_field"]
            })),
        )
        .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidView(_)));
    }

    #[test]
    fn non_scalar_filter_values_are_rejected() {
        let err = compile_view(
            &descriptor(),
            &view(json!({
                "name": "v",
                "source": "swap_event",
                "select": ["amount"],
                "where": [ { "column": "amount", "value": [1, 2] } ]
            })),
        )
        .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidView(_)));
    }
}
