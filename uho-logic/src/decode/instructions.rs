//! Instruction decoder: matches raw instruction data against the declared
//! discriminators, reads the positional argument layout, and binds account
//! names to the transaction's pubkeys by position.

use super::{
    borsh::{read_value, Cursor},
    DecodeOutput, DecodedInstruction, DecodedRow, TransactionDecoder,
};
use crate::{
    idl::descriptor::ProgramDescriptor,
    rpc::types::{ParsedTransaction, UiInstruction},
};
use serde_json::Map;
use std::collections::BTreeSet;

pub struct InstructionDecoder {
    enabled: BTreeSet<String>,
}

impl InstructionDecoder {
    pub fn new(enabled: BTreeSet<String>) -> Self {
        Self { enabled }
    }

    fn decode_one(
        &self,
        descriptor: &ProgramDescriptor,
        tx: &ParsedTransaction,
        instruction: &UiInstruction,
        ix_index: i32,
        out: &mut DecodeOutput,
    ) {
        let UiInstruction::Raw(raw) = instruction else {
            return;
        };
        if raw.program_id != descriptor.program_id {
            return;
        }
        let Ok(data) = bs58::decode(&raw.data).into_vec() else {
            out.skipped += 1;
            return;
        };
        let Some(declared) = descriptor
            .instructions
            .iter()
            .filter(|d| self.enabled.contains(&d.name))
            .find(|d| data.starts_with(&d.discriminator))
        else {
            out.skipped += 1;
            return;
        };

        let mut cursor = Cursor::new(&data[declared.discriminator.len()..]);
        let mut args = Map::new();
        for arg in &declared.args {
            match read_value(&mut cursor, &arg.wire, &descriptor.types) {
                Ok(value) => {
                    args.insert(arg.name.clone(), value);
                }
                Err(err) => {
                    // shorter-than-declared payload: stale IDL, not an error
                    tracing::trace!(
                        instruction = %declared.name,
                        error = %err,
                        "skipping undecodable instruction payload"
                    );
                    out.skipped += 1;
                    return;
                }
            }
        }

        let accounts = declared
            .accounts
            .iter()
            .cloned()
            .zip(raw.accounts.iter().cloned())
            .collect();

        out.rows.push(DecodedRow::Instruction(DecodedInstruction {
            instruction_name: declared.name.clone(),
            program_id: descriptor.program_id.clone(),
            slot: tx.slot,
            block_time: tx.block_time_utc(),
            tx_signature: tx.signature().to_string(),
            ix_index,
            accounts,
            args,
        }));
    }
}

impl TransactionDecoder for InstructionDecoder {
    fn decode_transaction(
        &self,
        descriptor: &ProgramDescriptor,
        tx: &ParsedTransaction,
    ) -> DecodeOutput {
        let mut out = DecodeOutput::default();
        for (index, instruction) in tx.transaction.message.instructions.iter().enumerate() {
            self.decode_one(descriptor, tx, instruction, index as i32, &mut out);
        }
        for inner in tx.inner_instructions() {
            for instruction in &inner.instructions {
                self.decode_one(descriptor, tx, instruction, inner.index as i32, &mut out);
            }
        }
        out
    }
}
