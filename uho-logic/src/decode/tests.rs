use super::{
    events::EventDecoder,
    instructions::InstructionDecoder,
    tokens::{TokenDecoder, TOKEN_2022_PROGRAM_ID, TOKEN_PROGRAM_ID},
    DecodedRow, TransactionDecoder,
};
use crate::{
    idl::descriptor::{
        EventDescriptor, FieldDescriptor, InstructionDescriptor, ProgramDescriptor, WireType,
    },
    rpc::types::ParsedTransaction,
};
use base64::prelude::*;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};

const PROGRAM_ID: &str = "SwapProg1111111111111111111111111111111111";

fn descriptor() -> ProgramDescriptor {
    ProgramDescriptor {
        program_id: PROGRAM_ID.into(),
        program_name: "p".into(),
        events: vec![EventDescriptor {
            name: "swap_event".into(),
            discriminator: [11, 22, 33, 44, 55, 66, 77, 88],
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
                FieldDescriptor {
                    name: "fee_bps".into(),
                    wire: WireType::U16,
                    nullable: false,
                },
            ],
        }],
        instructions: vec![InstructionDescriptor {
            name: "swap".into(),
            discriminator: vec![200, 1, 2, 3, 4, 5, 6, 7],
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

fn all_events() -> BTreeSet<String> {
    ["swap_event".to_string()].into()
}

fn all_instructions() -> BTreeSet<String> {
    ["swap".to_string()].into()
}

fn tx(value: Value) -> ParsedTransaction {
    serde_json::from_value(value).unwrap()
}

/// `swap_event { amount, trader: zeros, fee_bps }` payload behind the
/// `Program data:` prefix.
fn event_log(amount: u64, fee_bps: u16) -> String {
    let mut payload = vec![11u8, 22, 33, 44, 55, 66, 77, 88];
    payload.extend_from_slice(&amount.to_le_bytes());
    payload.extend_from_slice(&[0u8; 32]);
    payload.extend_from_slice(&fee_bps.to_le_bytes());
    format!("Program data: {}", BASE64_STANDARD.encode(payload))
}

fn base_tx(logs: Vec<String>) -> Value {
    json!({
        "slot": 200,
        "blockTime": 1700000100,
        "transaction": {
            "signatures": ["tx_S"],
            "message": { "accountKeys": [], "instructions": [] }
        },
        "meta": { "err": null, "logMessages": logs }
    })
}

#[test]
fn decodes_event_from_program_data_log_with_outer_ix_attribution() {
    let decoder = EventDecoder::new(all_events());
    let logs = vec![
        format!("Program {PROGRAM_ID} invoke [1]"),
        "Program log: Instruction: Init".to_string(),
        format!("Program {PROGRAM_ID} success"),
        format!("Program {PROGRAM_ID} invoke [1]"),
        event_log(1500, 30),
        format!("Program {PROGRAM_ID} success"),
    ];
    let out = decoder.decode_transaction(&descriptor(), &tx(base_tx(logs)));

    assert_eq!(out.skipped, 0);
    assert_eq!(out.rows.len(), 1);
    let DecodedRow::Event(event) = &out.rows[0] else {
        panic!("expected event row");
    };
    assert_eq!(event.event_name, "swap_event");
    assert_eq!(event.tx_signature, "tx_S");
    assert_eq!(event.slot, 200);
    assert_eq!(event.ix_index, 1);
    assert_eq!(event.inner_ix_index, None);
    assert_eq!(
        Value::Object(event.data.clone()),
        json!({
            "amount": 1500u64,
            "trader": "11111111111111111111111111111111",
            "fee_bps": 30
        })
    );
}

#[test]
fn events_are_emitted_in_log_order() {
    let decoder = EventDecoder::new(all_events());
    let logs = vec![
        format!("Program {PROGRAM_ID} invoke [1]"),
        event_log(1, 0),
        event_log(2, 0),
        event_log(3, 0),
    ];
    let out = decoder.decode_transaction(&descriptor(), &tx(base_tx(logs)));
    let amounts: Vec<u64> = out
        .rows
        .iter()
        .map(|row| match row {
            DecodedRow::Event(e) => e.data["amount"].as_u64().unwrap(),
            _ => panic!("expected event rows"),
        })
        .collect();
    assert_eq!(amounts, vec![1, 2, 3]);
}

#[test]
fn unknown_discriminators_and_short_payloads_count_as_skips() {
    let decoder = EventDecoder::new(all_events());
    let logs = vec![
        format!("Program {PROGRAM_ID} invoke [1]"),
        // foreign discriminator
        format!(
            "Program data: {}",
            BASE64_STANDARD.encode([9u8, 9, 9, 9, 9, 9, 9, 9, 1, 2, 3])
        ),
        // matching discriminator, truncated payload (idl drift)
        format!(
            "Program data: {}",
            BASE64_STANDARD.encode([11u8, 22, 33, 44, 55, 66, 77, 88, 1, 0])
        ),
        // not base64
        "Program data: !!!".to_string(),
    ];
    let out = decoder.decode_transaction(&descriptor(), &tx(base_tx(logs)));
    assert_eq!(out.rows.len(), 0);
    assert_eq!(out.skipped, 3);
}

#[test]
fn empty_transaction_produces_zero_rows_across_all_decoders() {
    let empty = tx(json!({
        "slot": 1,
        "transaction": {
            "signatures": ["sig"],
            "message": { "accountKeys": [], "instructions": [] }
        },
        "meta": { "err": null }
    }));
    let decoders: Vec<Box<dyn TransactionDecoder>> = vec![
        Box::new(EventDecoder::new(all_events())),
        Box::new(InstructionDecoder::new(all_instructions())),
        Box::new(TokenDecoder {
            cpi_transfers: true,
            balance_deltas: true,
        }),
    ];
    let batch = super::decode_transaction(&decoders, &descriptor(), &empty);
    assert!(batch.is_empty());
    assert_eq!(batch.skipped, 0);
}

#[test]
fn decodes_instruction_args_and_binds_accounts_positionally() {
    let mut data = vec![200u8, 1, 2, 3, 4, 5, 6, 7];
    data.extend_from_slice(&42_000u64.to_le_bytes());
    let transaction = tx(json!({
        "slot": 9,
        "blockTime": 1700000000,
        "transaction": {
            "signatures": ["sig_ix"],
            "message": {
                "accountKeys": [{ "pubkey": "Payer", "signer": true, "writable": true }],
                "instructions": [
                    {
                        "programId": PROGRAM_ID,
                        "accounts": ["PoolAddr", "UserAddr", "Extra"],
                        "data": bs58::encode(&data).into_string()
                    },
                    {
                        "programId": "OtherProgram111111111111111111111111111111",
                        "accounts": [],
                        "data": ""
                    }
                ]
            }
        },
        "meta": { "err": null }
    }));

    let decoder = InstructionDecoder::new(all_instructions());
    let out = decoder.decode_transaction(&descriptor(), &transaction);
    assert_eq!(out.skipped, 0);
    assert_eq!(out.rows.len(), 1);
    let DecodedRow::Instruction(ix) = &out.rows[0] else {
        panic!("expected instruction row");
    };
    assert_eq!(ix.instruction_name, "swap");
    assert_eq!(ix.ix_index, 0);
    assert_eq!(ix.args["amount_in"], json!(42_000u64));
    assert_eq!(
        ix.accounts,
        vec![
            ("pool".to_string(), "PoolAddr".to_string()),
            ("user".to_string(), "UserAddr".to_string())
        ]
    );
}

#[test]
fn short_instruction_payload_is_skipped_with_a_counter() {
    // discriminator matches but the u64 arg is truncated
    let data = vec![200u8, 1, 2, 3, 4, 5, 6, 7, 1, 2];
    let transaction = tx(json!({
        "slot": 9,
        "transaction": {
            "signatures": ["sig_ix"],
            "message": {
                "accountKeys": [],
                "instructions": [{
                    "programId": PROGRAM_ID,
                    "accounts": ["A", "B"],
                    "data": bs58::encode(&data).into_string()
                }]
            }
        },
        "meta": { "err": null }
    }));

    let out = InstructionDecoder::new(all_instructions())
        .decode_transaction(&descriptor(), &transaction);
    assert_eq!(out.rows.len(), 0);
    assert_eq!(out.skipped, 1);
}

#[test]
fn inner_instructions_inherit_the_parent_index() {
    let mut data = vec![200u8, 1, 2, 3, 4, 5, 6, 7];
    data.extend_from_slice(&7u64.to_le_bytes());
    let transaction = tx(json!({
        "slot": 9,
        "transaction": {
            "signatures": ["sig_ix"],
            "message": { "accountKeys": [], "instructions": [] }
        },
        "meta": {
            "err": null,
            "innerInstructions": [{
                "index": 3,
                "instructions": [{
                    "programId": PROGRAM_ID,
                    "accounts": ["A", "B"],
                    "data": bs58::encode(&data).into_string()
                }]
            }]
        }
    }));

    let out = InstructionDecoder::new(all_instructions())
        .decode_transaction(&descriptor(), &transaction);
    assert_eq!(out.rows.len(), 1);
    let DecodedRow::Instruction(ix) = &out.rows[0] else {
        panic!("expected instruction row");
    };
    assert_eq!(ix.ix_index, 3);
}

#[test]
fn cpi_transfer_and_balance_deltas_from_one_transaction() {
    // inner transferChecked(amount=5_000_000, decimals=6) moving the full
    // balance of account 3 to account 7
    let transaction = tx(json!({
        "slot": 500,
        "blockTime": 1700000200,
        "transaction": {
            "signatures": ["tx_T"],
            "message": {
                "accountKeys": [
                    "K0", "K1", "K2", "SrcTokenAcct", "K4", "K5", "K6", "DstTokenAcct"
                ],
                "instructions": [{
                    "programId": PROGRAM_ID,
                    "accounts": [],
                    "data": ""
                }]
            }
        },
        "meta": {
            "err": null,
            "innerInstructions": [{
                "index": 0,
                "instructions": [{
                    "programId": TOKEN_PROGRAM_ID,
                    "program": "spl-token",
                    "parsed": {
                        "type": "transferChecked",
                        "info": {
                            "source": "SrcTokenAcct",
                            "destination": "DstTokenAcct",
                            "authority": "Auth",
                            "mint": "MintM",
                            "tokenAmount": {
                                "amount": "5000000",
                                "decimals": 6,
                                "uiAmount": 5.0,
                                "uiAmountString": "5"
                            }
                        }
                    }
                }]
            }],
            "preTokenBalances": [
                { "accountIndex": 3, "mint": "MintM", "owner": "OwnerA",
                  "uiTokenAmount": { "amount": "5000000", "decimals": 6 } },
                { "accountIndex": 5, "mint": "MintX", "owner": "OwnerC",
                  "uiTokenAmount": { "amount": "77", "decimals": 0 } }
            ],
            "postTokenBalances": [
                { "accountIndex": 3, "mint": "MintM", "owner": "OwnerA",
                  "uiTokenAmount": { "amount": "0", "decimals": 6 } },
                { "accountIndex": 7, "mint": "MintM", "owner": "OwnerB",
                  "uiTokenAmount": { "amount": "5000000", "decimals": 6 } },
                { "accountIndex": 5, "mint": "MintX", "owner": "OwnerC",
                  "uiTokenAmount": { "amount": "77", "decimals": 0 } }
            ]
        }
    }));

    let out = TokenDecoder {
        cpi_transfers: true,
        balance_deltas: true,
    }
    .decode_transaction(&descriptor(), &transaction);

    let transfers: Vec<_> = out
        .rows
        .iter()
        .filter_map(|row| match row {
            DecodedRow::TokenTransfer(t) => Some(t),
            _ => None,
        })
        .collect();
    assert_eq!(transfers.len(), 1);
    assert_eq!(transfers[0].instruction_type, "transferChecked");
    assert_eq!(transfers[0].amount, "5000000");
    assert_eq!(transfers[0].decimals, Some(6));
    assert_eq!(transfers[0].mint.as_deref(), Some("MintM"));
    assert_eq!(transfers[0].parent_ix_index, 0);
    assert_eq!(transfers[0].inner_ix_index, Some(0));

    let deltas: Vec<_> = out
        .rows
        .iter()
        .filter_map(|row| match row {
            DecodedRow::BalanceDelta(d) => Some(d),
            _ => None,
        })
        .collect();
    // account 5 is unchanged and emits nothing
    assert_eq!(deltas.len(), 2);
    assert_eq!(deltas[0].account_index, 3);
    assert_eq!(deltas[0].delta, "-5000000");
    assert_eq!(deltas[0].account_address.as_deref(), Some("SrcTokenAcct"));
    assert_eq!(deltas[1].account_index, 7);
    assert_eq!(deltas[1].delta, "5000000");
    assert_eq!(deltas[1].pre_amount, "0");
    assert_eq!(deltas[1].post_amount, "5000000");
    assert_eq!(deltas[1].owner.as_deref(), Some("OwnerB"));
}

#[test]
fn raw_token_instructions_are_decoded_by_discriminant() {
    let mut data = vec![3u8];
    data.extend_from_slice(&123u64.to_le_bytes());
    let transaction = tx(json!({
        "slot": 2,
        "transaction": {
            "signatures": ["tx_raw"],
            "message": {
                "accountKeys": [],
                "instructions": [{
                    "programId": TOKEN_2022_PROGRAM_ID,
                    "accounts": ["Src", "Dst", "Auth"],
                    "data": bs58::encode(&data).into_string()
                }]
            }
        },
        "meta": { "err": null }
    }));

    let out = TokenDecoder {
        cpi_transfers: true,
        balance_deltas: false,
    }
    .decode_transaction(&descriptor(), &transaction);
    assert_eq!(out.rows.len(), 1);
    let DecodedRow::TokenTransfer(t) = &out.rows[0] else {
        panic!("expected transfer row");
    };
    assert_eq!(t.instruction_type, "transfer");
    assert_eq!(t.source.as_deref(), Some("Src"));
    assert_eq!(t.destination.as_deref(), Some("Dst"));
    assert_eq!(t.authority.as_deref(), Some("Auth"));
    assert_eq!(t.amount, "123");
    assert_eq!(t.token_program, TOKEN_2022_PROGRAM_ID);
    assert_eq!(t.inner_ix_index, None);
}

#[test]
fn raw_token_instruction_with_insufficient_accounts_is_ignored() {
    let mut data = vec![3u8];
    data.extend_from_slice(&5u64.to_le_bytes());
    let transaction = tx(json!({
        "slot": 2,
        "transaction": {
            "signatures": ["tx_raw"],
            "message": {
                "accountKeys": [],
                "instructions": [{
                    "programId": TOKEN_PROGRAM_ID,
                    "accounts": ["OnlyOne"],
                    "data": bs58::encode(&data).into_string()
                }]
            }
        },
        "meta": { "err": null }
    }));

    let out = TokenDecoder {
        cpi_transfers: true,
        balance_deltas: false,
    }
    .decode_transaction(&descriptor(), &transaction);
    assert!(out.rows.is_empty());
}

#[test]
fn roundtrip_event_encoding_matches_the_field_map() {
    // encode with the descriptor's layout, decode with the same descriptor
    let amount: u64 = 987_654_321;
    let fee: u16 = 125;
    let out = EventDecoder::new(all_events()).decode_transaction(
        &descriptor(),
        &tx(base_tx(vec![
            format!("Program {PROGRAM_ID} invoke [1]"),
            event_log(amount, fee),
        ])),
    );
    let DecodedRow::Event(event) = &out.rows[0] else {
        panic!("expected event row");
    };
    assert_eq!(event.data["amount"], json!(amount));
    assert_eq!(event.data["fee_bps"], json!(fee));
}
