//! On-chain settlement receipt extraction
//!
//! A completed swap leaves a canonical receipt in a transaction on the host
//! chain: either a multisig output whose key slots smuggle a JSON payload, or
//! an unspendable null-data output carrying the payload directly. The
//! extractor is pure: script-layer recovery of raw bytes first, then a strict
//! JSON 5-tuple parse, with every failure tagged instead of thrown.

use bitcoin::blockdata::script::Instruction;
use bitcoin::hashes::{hash160, Hash};
use bitcoin::opcodes::all::{OP_CHECKMULTISIG, OP_PUSHNUM_1, OP_PUSHNUM_16, OP_RETURN};
use bitcoin::script::{Script, ScriptBuf};
use tokio::sync::RwLock;

use crate::amount::Currency;

/// One transaction output as read from the host chain.
#[derive(Debug, Clone)]
pub struct TxOutput {
    pub value: u64,
    pub script_pub_key: ScriptBuf,
}

/// A transaction with its outputs.
#[derive(Debug, Clone)]
pub struct BlockTx {
    pub txid: String,
    pub outputs: Vec<TxOutput>,
}

/// A block as provided by the host node's block reader.
#[derive(Debug, Clone)]
pub struct Block {
    pub time: i64,
    pub txs: Vec<BlockTx>,
}

/// Extraction result for one transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum CurrencyPair {
    /// No receipt data present.
    Empty,
    /// Receipt data present but malformed.
    Error(String),
    Valid {
        xid: String,
        from: Currency,
        from_amount: u64,
        to: Currency,
        to_amount: u64,
    },
}

/// Inspect a transaction's outputs and recover the trade receipt plus the
/// coordinator's pubkey-hash (hex).
pub fn tx_out_to_currency_pair(outputs: &[TxOutput]) -> (CurrencyPair, String) {
    let mut snode_pubkey = String::new();
    if outputs.is_empty() {
        return (CurrencyPair::Empty, snode_pubkey);
    }

    let mut found_op_data = false;
    let mut json: Vec<u8> = Vec::new();

    for out in outputs {
        if out.script_pub_key.is_empty() {
            continue;
        }

        if let Some(keys) = multisig_keys(&out.script_pub_key) {
            // slot 1 carries the coordinator key, the rest carry payload
            // chunks shaped like uncompressed pubkeys
            if keys.len() < 2 {
                continue;
            }
            snode_pubkey = hex::encode(hash160::Hash::hash(&keys[0]).to_byte_array());
            for chunk in &keys[1..] {
                if chunk.len() != 65 {
                    break;
                }
                json.extend_from_slice(&chunk[1..]);
            }
        } else if out.script_pub_key.is_op_return() {
            if out.value != 0 {
                continue;
            }
            for ins in out.script_pub_key.instructions() {
                match ins {
                    Ok(Instruction::PushBytes(data)) if !data.is_empty() => {
                        json.extend_from_slice(data.as_bytes());
                        found_op_data = true;
                        break;
                    }
                    Ok(_) => continue,
                    Err(_) => break,
                }
            }
        }
    }

    if json.is_empty() {
        return (CurrencyPair::Empty, snode_pubkey);
    }

    // null-data receipts name the coordinator as the second output's payee
    if found_op_data && outputs.len() >= 2 {
        if let Some(hash) = p2pkh_hash(&outputs[1].script_pub_key) {
            snode_pubkey = hex::encode(hash);
        }
    }

    (parse_payload(&json), snode_pubkey)
}

/// JSON trailer lengths are NUL-padded inside fixed 64-byte chunks.
fn trim_padding(payload: &[u8]) -> &[u8] {
    let end = payload.iter().rposition(|b| *b != 0).map(|i| i + 1).unwrap_or(0);
    &payload[..end]
}

/// Strict parse of the `[xid, fromCcy, fromAmt, toCcy, toAmt]` tuple.
fn parse_payload(payload: &[u8]) -> CurrencyPair {
    let value: serde_json::Value = match serde_json::from_slice(trim_padding(payload)) {
        Ok(v) => v,
        Err(_) => return CurrencyPair::Error("unknown chain data, json error".to_string()),
    };
    let Some(tuple) = value.as_array() else {
        return CurrencyPair::Error("unknown chain data, json error".to_string());
    };
    if tuple.len() != 5 {
        return CurrencyPair::Error("unknown chain data, bad records count".to_string());
    }

    let Some(xid) = tuple[0].as_str() else {
        return CurrencyPair::Error("bad id".to_string());
    };
    let Some(from_ccy) = tuple[1].as_str() else {
        return CurrencyPair::Error("bad from currency".to_string());
    };
    let Some(from_amount) = tuple[2].as_u64() else {
        return CurrencyPair::Error("bad from amount".to_string());
    };
    let Some(to_ccy) = tuple[3].as_str() else {
        return CurrencyPair::Error("bad to currency".to_string());
    };
    let Some(to_amount) = tuple[4].as_u64() else {
        return CurrencyPair::Error("bad to amount".to_string());
    };

    CurrencyPair::Valid {
        xid: xid.to_string(),
        from: Currency::new(from_ccy),
        from_amount,
        to: Currency::new(to_ccy),
        to_amount,
    }
}

/// Key slots of a bare multisig script, or `None` for any other shape.
fn multisig_keys(script: &Script) -> Option<Vec<Vec<u8>>> {
    let mut ins = Vec::new();
    for i in script.instructions() {
        ins.push(i.ok()?);
    }
    if ins.len() < 4 {
        return None;
    }

    let small_num = |op: &Instruction| -> bool {
        matches!(
            op,
            Instruction::Op(o)
                if (OP_PUSHNUM_1.to_u8()..=OP_PUSHNUM_16.to_u8()).contains(&o.to_u8())
        )
    };
    if !small_num(&ins[0]) || !small_num(&ins[ins.len() - 2]) {
        return None;
    }
    if !matches!(&ins[ins.len() - 1], Instruction::Op(o) if *o == OP_CHECKMULTISIG) {
        return None;
    }

    let mut keys = Vec::new();
    for item in &ins[1..ins.len() - 2] {
        match item {
            Instruction::PushBytes(data) => keys.push(data.as_bytes().to_vec()),
            _ => return None,
        }
    }
    Some(keys)
}

fn p2pkh_hash(script: &Script) -> Option<[u8; 20]> {
    if !script.is_p2pkh() {
        return None;
    }
    // OP_DUP OP_HASH160 <20> OP_EQUALVERIFY OP_CHECKSIG
    script.as_bytes()[3..23].try_into().ok()
}

/// One row of `gettradingdata` output.
#[derive(Debug, Clone)]
pub enum TradeRow {
    Valid {
        timestamp: i64,
        txid: String,
        snode_pubkey: String,
        xid: String,
        from_currency: String,
        from_amount: u64,
        to_currency: String,
        to_amount: u64,
    },
    Error {
        timestamp: i64,
        txid: String,
        reason: String,
    },
}

/// Horizon for the trading-data walk, newest block backwards.
const TRADING_HISTORY_SECS: i64 = 30 * 24 * 60 * 60;

/// Blocks of the host chain, oldest first, fed by the block reader.
#[derive(Default)]
pub struct BlockStore {
    blocks: RwLock<Vec<Block>>,
}

impl BlockStore {
    pub fn new() -> BlockStore {
        BlockStore::default()
    }

    pub async fn push(&self, block: Block) {
        self.blocks.write().await.push(block);
    }

    /// Walk up to `max_blocks` recent blocks (bounded by the 30-day horizon)
    /// and extract trade receipts.
    pub async fn trading_data(&self, max_blocks: u32, show_errors: bool) -> Vec<TradeRow> {
        let blocks = self.blocks.read().await;
        let Some(tip_time) = blocks.last().map(|b| b.time) else {
            return Vec::new();
        };

        let mut rows = Vec::new();
        let mut remaining = max_blocks;
        for block in blocks.iter().rev() {
            if remaining == 0 || block.time <= tip_time - TRADING_HISTORY_SECS {
                break;
            }
            remaining -= 1;
            for tx in &block.txs {
                let (pair, snode_pubkey) = tx_out_to_currency_pair(&tx.outputs);
                match pair {
                    CurrencyPair::Valid { xid, from, from_amount, to, to_amount } => {
                        rows.push(TradeRow::Valid {
                            timestamp: block.time,
                            txid: tx.txid.clone(),
                            snode_pubkey,
                            xid,
                            from_currency: from.tag,
                            from_amount,
                            to_currency: to.tag,
                            to_amount,
                        });
                    }
                    CurrencyPair::Error(reason) if show_errors => {
                        rows.push(TradeRow::Error {
                            timestamp: block.time,
                            txid: tx.txid.clone(),
                            reason,
                        });
                    }
                    _ => {}
                }
            }
        }
        rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::script::{Builder, PushBytesBuf};

    fn push(builder: Builder, bytes: &[u8]) -> Builder {
        builder.push_slice(PushBytesBuf::try_from(bytes.to_vec()).unwrap())
    }

    /// Pack a payload into 65-byte pubkey-shaped chunks (leading type byte
    /// plus 64 data bytes).
    fn payload_chunks(payload: &[u8]) -> Vec<Vec<u8>> {
        payload
            .chunks(64)
            .map(|c| {
                let mut chunk = vec![0x04u8];
                chunk.extend_from_slice(c);
                chunk.resize(65, 0);
                chunk
            })
            .collect()
    }

    fn multisig_receipt(payload: &[u8]) -> TxOutput {
        let snode_key = [0x02u8; 33];
        let mut b = Builder::new().push_opcode(OP_PUSHNUM_1);
        b = push(b, &snode_key);
        for chunk in payload_chunks(payload) {
            b = push(b, &chunk);
        }
        b = b.push_opcode(bitcoin::opcodes::all::OP_PUSHNUM_3).push_opcode(OP_CHECKMULTISIG);
        TxOutput { value: 5000, script_pub_key: b.into_script() }
    }

    fn op_return_receipt(payload: &[u8]) -> TxOutput {
        let b = push(Builder::new().push_opcode(OP_RETURN), payload);
        TxOutput { value: 0, script_pub_key: b.into_script() }
    }

    fn p2pkh_output() -> TxOutput {
        let hash = bitcoin::PubkeyHash::from_raw_hash(hash160::Hash::hash(&[0x03; 33]));
        TxOutput { value: 1000, script_pub_key: ScriptBuf::new_p2pkh(&hash) }
    }

    const PAYLOAD: &[u8] = br#"["abc123","LTC",2500000000,"BLOCK",100000000000]"#;

    #[test]
    fn multisig_receipt_parses() {
        let (pair, snode) = tx_out_to_currency_pair(&[multisig_receipt(PAYLOAD)]);
        match pair {
            CurrencyPair::Valid { xid, from, from_amount, to, to_amount } => {
                assert_eq!(xid, "abc123");
                assert_eq!(from.tag, "LTC");
                assert_eq!(from_amount, 2_500_000_000);
                assert_eq!(to.tag, "BLOCK");
                assert_eq!(to_amount, 100_000_000_000);
            }
            other => panic!("unexpected result {:?}", other),
        }
        // coordinator key recovered from slot 1
        let expected = hex::encode(hash160::Hash::hash(&[0x02u8; 33]).to_byte_array());
        assert_eq!(snode, expected);
    }

    #[test]
    fn null_data_receipt_parses_with_second_output_payee() {
        let outputs = vec![op_return_receipt(PAYLOAD), p2pkh_output()];
        let (pair, snode) = tx_out_to_currency_pair(&outputs);
        assert!(matches!(pair, CurrencyPair::Valid { .. }));
        let expected = hex::encode(hash160::Hash::hash(&[0x03u8; 33]).to_byte_array());
        assert_eq!(snode, expected);
    }

    #[test]
    fn no_receipt_is_empty() {
        let (pair, _) = tx_out_to_currency_pair(&[p2pkh_output()]);
        assert_eq!(pair, CurrencyPair::Empty);
        let (pair, _) = tx_out_to_currency_pair(&[]);
        assert_eq!(pair, CurrencyPair::Empty);
    }

    #[test]
    fn malformed_payloads_are_tagged_not_thrown() {
        let cases: [(&[u8], &str); 4] = [
            (b"not json at all", "unknown chain data, json error"),
            (br#"["a","LTC",1,"BLOCK"]"#, "unknown chain data, bad records count"),
            (br#"[42,"LTC",1,"BLOCK",2]"#, "bad id"),
            (br#"["a","LTC",-5,"BLOCK",2]"#, "bad from amount"),
        ];
        for (payload, reason) in cases {
            let (pair, _) = tx_out_to_currency_pair(&[op_return_receipt(payload)]);
            assert_eq!(pair, CurrencyPair::Error(reason.to_string()), "payload {:?}", payload);
        }
    }

    #[test]
    fn nonzero_value_op_return_is_skipped() {
        let mut out = op_return_receipt(PAYLOAD);
        out.value = 1;
        let (pair, _) = tx_out_to_currency_pair(&[out]);
        assert_eq!(pair, CurrencyPair::Empty);
    }

    #[tokio::test]
    async fn block_walk_respects_count_and_errors_flag() {
        let store = BlockStore::new();
        store
            .push(Block {
                time: 1_000,
                txs: vec![BlockTx {
                    txid: "t1".into(),
                    outputs: vec![multisig_receipt(PAYLOAD)],
                }],
            })
            .await;
        store
            .push(Block {
                time: 2_000,
                txs: vec![BlockTx {
                    txid: "t2".into(),
                    outputs: vec![op_return_receipt(b"broken")],
                }],
            })
            .await;

        // only the newest block, errors hidden
        assert!(store.trading_data(1, false).await.is_empty());
        // errors shown
        let rows = store.trading_data(1, true).await;
        assert_eq!(rows.len(), 1);
        assert!(matches!(&rows[0], TradeRow::Error { txid, .. } if txid == "t2"));
        // both blocks
        let rows = store.trading_data(10, false).await;
        assert_eq!(rows.len(), 1);
        assert!(matches!(&rows[0], TradeRow::Valid { txid, .. } if txid == "t1"));
    }
}
