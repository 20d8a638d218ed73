//! Live ingestion pipeline: the poller drives RPC fetches through the
//! decoders and hands batches to the writer, which persists them
//! idempotently and feeds the fanout bus.

pub mod poller;
pub mod writer;

pub use poller::{Poller, PollerSettings};
pub use writer::{CheckpointAdvance, CheckpointState, TxLogRow, WriteOutcome, Writer};
