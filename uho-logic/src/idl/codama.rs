//! Codama (kinobi) dialect. Structurally the documents match the Shank
//! shape for everything this indexer consumes; only the `metadata.origin`
//! marker differs, so instruction parsing is shared.

use super::descriptor::InstructionDescriptor;
use crate::error::ServiceError;
use serde_json::Value;

pub(super) fn parse_instructions(
    raw: &Value,
) -> Result<Vec<InstructionDescriptor>, ServiceError> {
    super::shank::parse_instructions(raw)
}
