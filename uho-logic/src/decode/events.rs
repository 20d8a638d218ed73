//! Anchor event decoder. Events are emitted through a self-CPI that logs
//! `Program data: <base64>`; the payload is an 8-byte event discriminator
//! followed by the Borsh serialization of the event struct.

use super::{
    borsh::{read_struct, Cursor},
    DecodeOutput, DecodedEvent, DecodedRow, TransactionDecoder,
};
use crate::{idl::descriptor::ProgramDescriptor, rpc::types::ParsedTransaction};
use base64::prelude::*;
use std::collections::BTreeSet;

pub const PROGRAM_DATA_PREFIX: &str = "Program data: ";

pub struct EventDecoder {
    enabled: BTreeSet<String>,
}

impl EventDecoder {
    pub fn new(enabled: BTreeSet<String>) -> Self {
        Self { enabled }
    }
}

impl TransactionDecoder for EventDecoder {
    fn decode_transaction(
        &self,
        descriptor: &ProgramDescriptor,
        tx: &ParsedTransaction,
    ) -> DecodeOutput {
        let mut out = DecodeOutput::default();
        // Each `invoke [1]` line opens the next top-level instruction; data
        // lines are attributed to the instruction whose frame they appear in.
        let mut outer_ix: i32 = -1;
        // ordinal of the event within the current frame, to keep the
        // (tx, ix, inner) key unique when one instruction logs several events
        let mut frame_ordinal: i32 = 0;

        for log in tx.log_messages() {
            if is_top_level_invoke(log) {
                outer_ix += 1;
                frame_ordinal = 0;
                continue;
            }
            let Some(encoded) = log.strip_prefix(PROGRAM_DATA_PREFIX) else {
                continue;
            };
            let Ok(payload) = BASE64_STANDARD.decode(encoded.trim()) else {
                out.skipped += 1;
                continue;
            };
            if payload.len() < 8 {
                out.skipped += 1;
                continue;
            }
            let discriminator: [u8; 8] = payload[..8].try_into().expect("sliced 8 bytes");
            let Some(event) = descriptor
                .events
                .iter()
                .find(|e| e.discriminator == discriminator && self.enabled.contains(&e.name))
            else {
                out.skipped += 1;
                continue;
            };

            let mut cursor = Cursor::new(&payload[8..]);
            match read_struct(&mut cursor, &event.fields, &descriptor.types) {
                Ok(data) => {
                    let inner_ix_index = (frame_ordinal > 0).then_some(frame_ordinal);
                    frame_ordinal += 1;
                    out.rows.push(DecodedRow::Event(DecodedEvent {
                        event_name: event.name.clone(),
                        program_id: descriptor.program_id.clone(),
                        slot: tx.slot,
                        block_time: tx.block_time_utc(),
                        tx_signature: tx.signature().to_string(),
                        ix_index: outer_ix.max(0),
                        inner_ix_index,
                        data,
                    }))
                }
                Err(err) => {
                    tracing::trace!(event = %event.name, error = %err, "skipping undecodable event payload");
                    out.skipped += 1;
                }
            }
        }
        out
    }
}

fn is_top_level_invoke(log: &str) -> bool {
    log.starts_with("Program ") && log.ends_with(" invoke [1]")
}
