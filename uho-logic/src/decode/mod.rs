//! Pure transaction decoders. Each decoder is a stateless function of
//! `(descriptor, parsed transaction)` producing tagged rows; skips are
//! reported as counters, never as errors, so a stale IDL degrades
//! gracefully instead of stalling the pipeline.

pub mod borsh;
pub mod events;
pub mod instructions;
pub mod tokens;

#[cfg(test)]
mod tests;

use crate::{idl::descriptor::ProgramDescriptor, rpc::types::ParsedTransaction};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq)]
pub struct DecodedEvent {
    pub event_name: String,
    pub program_id: String,
    pub slot: u64,
    pub block_time: Option<DateTime<Utc>>,
    pub tx_signature: String,
    /// Index of the outer instruction whose logs carried this event.
    pub ix_index: i32,
    pub inner_ix_index: Option<i32>,
    pub data: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecodedInstruction {
    pub instruction_name: String,
    pub program_id: String,
    pub slot: u64,
    pub block_time: Option<DateTime<Utc>>,
    pub tx_signature: String,
    pub ix_index: i32,
    /// Declared account names bound positionally to transaction pubkeys.
    pub accounts: Vec<(String, String)>,
    pub args: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TokenTransferRow {
    pub tx_signature: String,
    pub slot: u64,
    pub block_time: Option<DateTime<Utc>>,
    /// `transfer`, `transferChecked`, `mintTo` or `burn` (checked variants
    /// are normalized onto the unchecked names).
    pub instruction_type: String,
    pub source: Option<String>,
    pub destination: Option<String>,
    pub authority: Option<String>,
    pub mint: Option<String>,
    /// Raw integer amount as a decimal string.
    pub amount: String,
    pub decimals: Option<u8>,
    pub token_program: String,
    pub parent_ix_index: i32,
    pub inner_ix_index: Option<i32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BalanceDeltaRow {
    pub tx_signature: String,
    pub slot: u64,
    pub block_time: Option<DateTime<Utc>>,
    pub account_index: i32,
    pub account_address: Option<String>,
    pub mint: Option<String>,
    pub owner: Option<String>,
    pub pre_amount: String,
    pub post_amount: String,
    /// `post - pre`, never zero.
    pub delta: String,
    pub decimals: Option<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DecodedRow {
    Event(DecodedEvent),
    Instruction(DecodedInstruction),
    TokenTransfer(TokenTransferRow),
    BalanceDelta(BalanceDeltaRow),
}

#[derive(Debug, Default)]
pub struct DecodeOutput {
    pub rows: Vec<DecodedRow>,
    /// Discriminator mismatches and IDL-drift payloads.
    pub skipped: u64,
}

pub trait TransactionDecoder: Send + Sync {
    fn decode_transaction(
        &self,
        descriptor: &ProgramDescriptor,
        tx: &ParsedTransaction,
    ) -> DecodeOutput;
}

/// Rows of one transaction batch, split by destination table.
#[derive(Debug, Default)]
pub struct DecodedBatch {
    pub events: Vec<DecodedEvent>,
    pub instructions: Vec<DecodedInstruction>,
    pub transfers: Vec<TokenTransferRow>,
    pub deltas: Vec<BalanceDeltaRow>,
    pub skipped: u64,
}

impl DecodedBatch {
    pub fn extend(&mut self, output: DecodeOutput) {
        self.skipped += output.skipped;
        for row in output.rows {
            match row {
                DecodedRow::Event(row) => self.events.push(row),
                DecodedRow::Instruction(row) => self.instructions.push(row),
                DecodedRow::TokenTransfer(row) => self.transfers.push(row),
                DecodedRow::BalanceDelta(row) => self.deltas.push(row),
            }
        }
    }

    pub fn row_count(&self) -> usize {
        self.events.len() + self.instructions.len() + self.transfers.len() + self.deltas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.row_count() == 0
    }
}

/// Runs every decoder over one transaction and merges the outputs.
pub fn decode_transaction(
    decoders: &[Box<dyn TransactionDecoder>],
    descriptor: &ProgramDescriptor,
    tx: &ParsedTransaction,
) -> DecodedBatch {
    let mut batch = DecodedBatch::default();
    for decoder in decoders {
        batch.extend(decoder.decode_transaction(descriptor, tx));
    }
    batch
}
