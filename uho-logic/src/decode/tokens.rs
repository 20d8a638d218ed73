//! Cross-cutting token-movement decoder: normalized SPL-Token transfer rows
//! from parsed or raw instructions (Token and Token-2022), and balance
//! deltas computed from the transaction's pre/post token balances.

use super::{BalanceDeltaRow, DecodeOutput, DecodedRow, TokenTransferRow, TransactionDecoder};
use crate::{
    idl::descriptor::ProgramDescriptor,
    rpc::types::{ParsedTransaction, TokenBalance, UiInstruction},
};
use serde_json::Value;
use std::collections::BTreeMap;

pub const TOKEN_PROGRAM_ID: &str = "TokenkegQfeZyiNwAJbNbGKPFXCWuBvf9Ss623VQ5DA";
pub const TOKEN_2022_PROGRAM_ID: &str = "TokenzQdBNbLqP5VEhdkAS6EPFLC1PHnBqCXEpPxuEb";

const IX_TRANSFER: u8 = 3;
const IX_MINT_TO: u8 = 7;
const IX_BURN: u8 = 8;
const IX_TRANSFER_CHECKED: u8 = 12;
const IX_MINT_TO_CHECKED: u8 = 14;
const IX_BURN_CHECKED: u8 = 15;

pub struct TokenDecoder {
    pub cpi_transfers: bool,
    pub balance_deltas: bool,
}

impl TransactionDecoder for TokenDecoder {
    fn decode_transaction(
        &self,
        _descriptor: &ProgramDescriptor,
        tx: &ParsedTransaction,
    ) -> DecodeOutput {
        let mut out = DecodeOutput::default();
        if self.cpi_transfers {
            for (index, instruction) in tx.transaction.message.instructions.iter().enumerate() {
                if let Some(row) = decode_transfer(tx, instruction, index as i32, None) {
                    out.rows.push(DecodedRow::TokenTransfer(row));
                }
            }
            for inner in tx.inner_instructions() {
                for (inner_index, instruction) in inner.instructions.iter().enumerate() {
                    if let Some(row) = decode_transfer(
                        tx,
                        instruction,
                        inner.index as i32,
                        Some(inner_index as i32),
                    ) {
                        out.rows.push(DecodedRow::TokenTransfer(row));
                    }
                }
            }
        }
        if self.balance_deltas {
            out.rows.extend(
                balance_deltas(tx)
                    .into_iter()
                    .map(DecodedRow::BalanceDelta),
            );
        }
        out
    }
}

fn is_token_program(program_id: &str) -> bool {
    program_id == TOKEN_PROGRAM_ID || program_id == TOKEN_2022_PROGRAM_ID
}

fn decode_transfer(
    tx: &ParsedTransaction,
    instruction: &UiInstruction,
    parent_ix_index: i32,
    inner_ix_index: Option<i32>,
) -> Option<TokenTransferRow> {
    let (program_id, parts) = match instruction {
        UiInstruction::Parsed(parsed) if is_token_program(&parsed.program_id) => {
            (parsed.program_id.as_str(), from_parsed(&parsed.parsed)?)
        }
        UiInstruction::Raw(raw) if is_token_program(&raw.program_id) => {
            let data = bs58::decode(&raw.data).into_vec().ok()?;
            (raw.program_id.as_str(), from_raw(&data, &raw.accounts)?)
        }
        _ => return None,
    };
    Some(TokenTransferRow {
        tx_signature: tx.signature().to_string(),
        slot: tx.slot,
        block_time: tx.block_time_utc(),
        instruction_type: parts.instruction_type,
        source: parts.source,
        destination: parts.destination,
        authority: parts.authority,
        mint: parts.mint,
        amount: parts.amount,
        decimals: parts.decimals,
        token_program: program_id.to_string(),
        parent_ix_index,
        inner_ix_index,
    })
}

struct TransferParts {
    instruction_type: String,
    source: Option<String>,
    destination: Option<String>,
    authority: Option<String>,
    mint: Option<String>,
    amount: String,
    decimals: Option<u8>,
}

fn from_parsed(parsed: &Value) -> Option<TransferParts> {
    let kind = parsed.get("type")?.as_str()?;
    let info = parsed.get("info")?;
    let string = |key: &str| info.get(key).and_then(Value::as_str).map(str::to_string);
    let authority = string("authority")
        .or_else(|| string("multisigAuthority"))
        .or_else(|| string("mintAuthority"));
    let amount = string("amount")
        .or_else(|| {
            info.pointer("/tokenAmount/amount")
                .and_then(Value::as_str)
                .map(str::to_string)
        })?;
    let decimals = info
        .pointer("/tokenAmount/decimals")
        .and_then(Value::as_u64)
        .map(|d| d as u8);

    let (instruction_type, source, destination, mint) = match kind {
        "transfer" => ("transfer", string("source"), string("destination"), None),
        "transferChecked" => (
            "transferChecked",
            string("source"),
            string("destination"),
            string("mint"),
        ),
        "mintTo" | "mintToChecked" => ("mintTo", None, string("account"), string("mint")),
        "burn" | "burnChecked" => ("burn", string("account"), None, string("mint")),
        _ => return None,
    };
    Some(TransferParts {
        instruction_type: instruction_type.to_string(),
        source,
        destination,
        authority,
        mint,
        amount,
        decimals,
    })
}

fn from_raw(data: &[u8], accounts: &[String]) -> Option<TransferParts> {
    let (&tag, rest) = data.split_first()?;
    let amount = u64::from_le_bytes(rest.get(..8)?.try_into().ok()?);
    let account = |idx: usize| accounts.get(idx).cloned();

    let (instruction_type, source, destination, authority, mint, decimals) = match tag {
        IX_TRANSFER => {
            if accounts.len() < 3 {
                return None;
            }
            ("transfer", account(0), account(1), account(2), None, None)
        }
        IX_TRANSFER_CHECKED => {
            if accounts.len() < 4 {
                return None;
            }
            (
                "transferChecked",
                account(0),
                account(2),
                account(3),
                account(1),
                rest.get(8).copied(),
            )
        }
        IX_MINT_TO | IX_MINT_TO_CHECKED => {
            if accounts.len() < 3 {
                return None;
            }
            (
                "mintTo",
                None,
                account(1),
                account(2),
                account(0),
                (tag == IX_MINT_TO_CHECKED).then(|| rest.get(8).copied()).flatten(),
            )
        }
        IX_BURN | IX_BURN_CHECKED => {
            if accounts.len() < 3 {
                return None;
            }
            (
                "burn",
                account(0),
                None,
                account(2),
                account(1),
                (tag == IX_BURN_CHECKED).then(|| rest.get(8).copied()).flatten(),
            )
        }
        _ => return None,
    };
    Some(TransferParts {
        instruction_type: instruction_type.to_string(),
        source,
        destination,
        authority,
        mint,
        amount: amount.to_string(),
        decimals,
    })
}

/// One row per `(account_index, mint)` whose balance changed; zero deltas
/// are dropped.
fn balance_deltas(tx: &ParsedTransaction) -> Vec<BalanceDeltaRow> {
    let Some(meta) = tx.meta.as_ref() else {
        return Vec::new();
    };
    let index_map = |balances: &Option<Vec<TokenBalance>>| -> BTreeMap<u32, TokenBalance> {
        balances
            .iter()
            .flatten()
            .map(|b| (b.account_index, b.clone()))
            .collect()
    };
    let pre = index_map(&meta.pre_token_balances);
    let post = index_map(&meta.post_token_balances);

    let mut indexes: Vec<u32> = pre.keys().chain(post.keys()).copied().collect();
    indexes.sort_unstable();
    indexes.dedup();

    let mut rows = Vec::new();
    for index in indexes {
        let pre_balance = pre.get(&index);
        let post_balance = post.get(&index);
        let parse = |balance: Option<&TokenBalance>| -> i128 {
            balance
                .and_then(|b| b.ui_token_amount.amount.parse::<i128>().ok())
                .unwrap_or(0)
        };
        let pre_amount = parse(pre_balance);
        let post_amount = parse(post_balance);
        let delta = post_amount - pre_amount;
        if delta == 0 {
            continue;
        }
        // mint/owner from post when present, pre otherwise
        let reference = post_balance.or(pre_balance).expect("index came from union");
        rows.push(BalanceDeltaRow {
            tx_signature: tx.signature().to_string(),
            slot: tx.slot,
            block_time: tx.block_time_utc(),
            account_index: index as i32,
            account_address: tx.account_key(index as usize).map(str::to_string),
            mint: Some(reference.mint.clone()),
            owner: reference.owner.clone(),
            pre_amount: pre_amount.to_string(),
            post_amount: post_amount.to_string(),
            delta: delta.to_string(),
            decimals: reference.ui_token_amount.decimals,
        });
    }
    rows
}
