use lazy_static::lazy_static;
use prometheus::{
    register_int_counter, register_int_counter_vec, IntCounter, IntCounterVec,
};

lazy_static! {
    pub static ref ROWS_WRITTEN_TOTAL: IntCounterVec = register_int_counter_vec!(
        "uho_rows_written_total",
        "number of decoded rows inserted into tenant tables",
        &["program", "kind"],
    )
    .unwrap();
    pub static ref WRITE_CONFLICTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "uho_write_conflicts_total",
        "number of rows skipped by the uniqueness index on insert",
        &["program", "kind"],
    )
    .unwrap();
    pub static ref DECODE_SKIPS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "uho_decode_skips_total",
        "number of payloads skipped due to discriminator mismatch or idl drift",
        &["program"],
    )
    .unwrap();
    pub static ref RPC_RETRIES_TOTAL: IntCounter = register_int_counter!(
        "uho_rpc_retries_total",
        "number of rpc requests retried after a transient failure",
    )
    .unwrap();
    pub static ref WEBHOOK_DELIVERIES_TOTAL: IntCounter = register_int_counter!(
        "uho_webhook_deliveries_total",
        "number of successful webhook deliveries",
    )
    .unwrap();
    pub static ref WEBHOOK_FAILURES_TOTAL: IntCounter = register_int_counter!(
        "uho_webhook_failures_total",
        "number of webhook delivery attempts that failed",
    )
    .unwrap();
    pub static ref FANOUT_DROPPED_TOTAL: IntCounter = register_int_counter!(
        "uho_fanout_dropped_total",
        "number of fanout messages dropped past a consumer backlog",
    )
    .unwrap();
    pub static ref BACKFILL_JOBS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "uho_backfill_jobs_total",
        "number of backfill jobs by terminal status",
        &["status"],
    )
    .unwrap();
}
