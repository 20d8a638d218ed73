//! Wire model for the subset of `jsonParsed` transaction responses the
//! decoders consume.

use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureInfo {
    pub signature: String,
    pub slot: u64,
    #[serde(default)]
    pub err: Option<Value>,
    #[serde(default)]
    pub block_time: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedTransaction {
    pub slot: u64,
    #[serde(default)]
    pub block_time: Option<i64>,
    pub transaction: TransactionBody,
    #[serde(default)]
    pub meta: Option<TransactionMeta>,
}

impl ParsedTransaction {
    pub fn signature(&self) -> &str {
        self.transaction
            .signatures
            .first()
            .map(String::as_str)
            .unwrap_or_default()
    }

    pub fn failed(&self) -> bool {
        self.meta.as_ref().is_some_and(|m| m.err.is_some())
    }

    pub fn block_time_utc(&self) -> Option<DateTime<Utc>> {
        self.block_time
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
    }

    pub fn log_messages(&self) -> &[String] {
        self.meta
            .as_ref()
            .and_then(|m| m.log_messages.as_deref())
            .unwrap_or_default()
    }

    pub fn inner_instructions(&self) -> &[InnerInstructions] {
        self.meta
            .as_ref()
            .and_then(|m| m.inner_instructions.as_deref())
            .unwrap_or_default()
    }

    pub fn account_key(&self, index: usize) -> Option<&str> {
        self.transaction
            .message
            .account_keys
            .get(index)
            .map(AccountKey::pubkey)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionBody {
    #[serde(default)]
    pub signatures: Vec<String>,
    pub message: TransactionMessage,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionMessage {
    #[serde(default)]
    pub account_keys: Vec<AccountKey>,
    #[serde(default)]
    pub instructions: Vec<UiInstruction>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum AccountKey {
    Detailed {
        pubkey: String,
        #[serde(default)]
        signer: bool,
        #[serde(default)]
        writable: bool,
    },
    Plain(String),
}

impl AccountKey {
    pub fn pubkey(&self) -> &str {
        match self {
            Self::Detailed { pubkey, .. } => pubkey,
            Self::Plain(pubkey) => pubkey,
        }
    }
}

/// One instruction as the RPC renders it under `jsonParsed`: fully parsed
/// for programs the node understands, partially decoded (base58 data plus
/// account pubkeys) otherwise.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum UiInstruction {
    Raw(RawInstruction),
    Parsed(ParsedInstruction),
    /// Shapes this indexer does not consume (e.g. compiled legacy form).
    Other(Value),
}

impl UiInstruction {
    pub fn program_id(&self) -> Option<&str> {
        match self {
            Self::Raw(raw) => Some(&raw.program_id),
            Self::Parsed(parsed) => Some(&parsed.program_id),
            Self::Other(_) => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawInstruction {
    pub program_id: String,
    pub accounts: Vec<String>,
    /// Base58-encoded instruction data.
    pub data: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedInstruction {
    pub program_id: String,
    #[serde(default)]
    pub program: Option<String>,
    pub parsed: Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InnerInstructions {
    pub index: u32,
    #[serde(default)]
    pub instructions: Vec<UiInstruction>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionMeta {
    #[serde(default)]
    pub err: Option<Value>,
    #[serde(default)]
    pub log_messages: Option<Vec<String>>,
    #[serde(default)]
    pub inner_instructions: Option<Vec<InnerInstructions>>,
    #[serde(default)]
    pub pre_token_balances: Option<Vec<TokenBalance>>,
    #[serde(default)]
    pub post_token_balances: Option<Vec<TokenBalance>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenBalance {
    pub account_index: u32,
    pub mint: String,
    #[serde(default)]
    pub owner: Option<String>,
    pub ui_token_amount: TokenAmount,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenAmount {
    /// Raw integer amount as a decimal string.
    pub amount: String,
    // some providers omit decimals on pre-2022 token accounts
    #[serde(default)]
    pub decimals: Option<u8>,
}
