#![allow(dead_code)]

use async_trait::async_trait;
use bitcoin::{
    block::{Header as BlockHeader, Version as BlockVersion},
    hash_types::TxMerkleNode,
    hashes::Hash,
    pow::CompactTarget,
    Amount, Block, BlockHash, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid,
    Witness,
};
use chain_watch::{Callback, CallbackResult, CallbackTransport};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};
use uuid::Uuid;

/// Tiny transaction, distinct per `tag`.
pub fn tx(tag: u32) -> Transaction {
    let input = TxIn {
        previous_output: OutPoint {
            txid: Txid::from_byte_array([0u8; 32]),
            vout: u32::MAX,
        },
        script_sig: ScriptBuf::new(),
        sequence: Sequence::MAX,
        witness: Witness::new(),
    };
    Transaction {
        version: bitcoin::transaction::Version::TWO,
        lock_time: bitcoin::absolute::LockTime::from_consensus(tag),
        input: vec![input],
        output: vec![TxOut {
            value: Amount::from_sat(50_000 + u64::from(tag)),
            script_pubkey: ScriptBuf::new(),
        }],
    }
}

/// Block on top of `prev`; `nonce` keeps siblings at the same height distinct.
pub fn block(prev: BlockHash, nonce: u32, txdata: Vec<Transaction>) -> Block {
    let header = BlockHeader {
        version: BlockVersion::from_consensus(2),
        prev_blockhash: prev,
        merkle_root: TxMerkleNode::all_zeros(),
        time: nonce,
        bits: CompactTarget::from_consensus(0x207fffff),
        nonce,
    };
    Block { header, txdata }
}

/// In-order chain the tests feed to a watcher.
pub struct Chain {
    blocks: Vec<(u32, Block)>,
    base: u32,
    nonce: u32,
}

impl Chain {
    /// Next pushed block lands at `base`.
    pub fn starting_at(base: u32) -> Self {
        Self {
            blocks: Vec::new(),
            base,
            nonce: 0,
        }
    }

    /// Append a block carrying `txdata` and return it with its height.
    pub fn push(&mut self, txdata: Vec<Transaction>) -> (Block, u32) {
        let prev = self
            .blocks
            .last()
            .map_or(BlockHash::all_zeros(), |(_, b)| b.block_hash());
        let height = self.blocks.last().map_or(self.base, |(h, _)| h + 1);
        self.nonce += 1;
        let b = block(prev, self.nonce, txdata);
        self.blocks.push((height, b.clone()));
        (b, height)
    }

    /// Retract the tip.
    pub fn pop(&mut self) -> (Block, u32) {
        let (h, b) = self.blocks.pop().expect("chain is empty");
        (b, h)
    }
}

/// Transport that records every payload and can be told to fail.
#[derive(Clone, Default)]
pub struct RecordingTransport {
    pub sent: Arc<Mutex<Vec<(Uuid, CallbackResult)>>>,
    pub fail: Arc<AtomicBool>,
}

impl RecordingTransport {
    pub fn sent(&self) -> Vec<(Uuid, CallbackResult)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl CallbackTransport for RecordingTransport {
    async fn execute(&self, callback: &Callback, result: &CallbackResult) -> anyhow::Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("connection refused");
        }
        self.sent
            .lock()
            .unwrap()
            .push((callback.id, result.clone()));
        Ok(())
    }
}
