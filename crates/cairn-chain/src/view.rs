//! Staged UTXO mutations for a pending block.
//!
//! A [`CoinView`] overlays creations and spends on top of the persisted
//! coin set while a block is being connected (or reversed). Lookups hit the
//! view first and fall through to a [`CoinReader`], which in the database
//! is a snapshot read transaction over the coin table. Nothing touches
//! storage until the view is handed to the database for commit.

use std::collections::hash_map;
use std::collections::HashMap;

use bitcoin::OutPoint;
use bitcoin::Transaction;

use crate::coins::Coin;
use crate::coins::UndoCoins;
use crate::error::ChainError;

/// Read access to the persisted coin set.
///
/// Implementations are expected to be snapshots: repeated reads through one
/// reader observe a single consistent state.
pub trait CoinReader {
    /// Fetches the unspent coin named by `outpoint`, if it exists.
    fn coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>, ChainError>;
}

/// In-memory delta over the UTXO set, plus the undo stack of displaced
/// coins.
#[derive(Debug, Default)]
pub struct CoinView {
    coins: HashMap<OutPoint, Coin>,
    undo: UndoCoins,
}

impl CoinView {
    pub fn new() -> Self {
        CoinView::default()
    }

    /// The staged coin for `outpoint`, spent or not.
    pub fn get(&self, outpoint: &OutPoint) -> Option<&Coin> {
        self.coins.get(outpoint)
    }

    /// Number of staged entries.
    pub fn len(&self) -> usize {
        self.coins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coins.is_empty()
    }

    /// Stages all of `tx`'s outputs as fresh unspent coins created at
    /// `height`. With `overwrite` unset, outpoints already staged are left
    /// alone.
    pub fn add(&mut self, tx: &Transaction, height: u32, overwrite: bool) {
        let txid = tx.compute_txid();
        let coinbase = tx.is_coinbase();
        for (vout, output) in tx.output.iter().enumerate() {
            let outpoint = OutPoint::new(txid, vout as u32);
            if !overwrite && self.coins.contains_key(&outpoint) {
                continue;
            }
            self.coins
                .insert(outpoint, Coin::new(output.clone(), height, coinbase));
        }
    }

    /// Spends every input of `tx`: each prevout coin is fetched (from the
    /// view first, else through `coins`), marked spent and pushed onto the
    /// undo stack. Fails with [`ChainError::MissingCoin`] if any prevout is
    /// absent or already spent; the view keeps whatever was staged before
    /// the failing input and should be discarded by the caller.
    pub fn spend<R: CoinReader>(&mut self, tx: &Transaction, coins: &R) -> Result<(), ChainError> {
        for input in &tx.input {
            let outpoint = input.previous_output;
            let coin = match self.coins.entry(outpoint) {
                hash_map::Entry::Occupied(staged) => staged.into_mut(),
                hash_map::Entry::Vacant(slot) => {
                    let coin = coins
                        .coin(&outpoint)?
                        .ok_or(ChainError::MissingCoin(outpoint))?;
                    slot.insert(coin)
                }
            };
            if coin.spent {
                return Err(ChainError::MissingCoin(outpoint));
            }
            coin.spent = true;
            let mut displaced = coin.clone();
            displaced.spent = false;
            self.undo.push(displaced);
        }
        Ok(())
    }

    /// Hydrates `tx`'s inputs with their prevout coins without spending
    /// them. Returns whether every prevout was found; absent prevouts are
    /// skipped rather than treated as errors.
    pub fn fill<R: CoinReader>(&mut self, tx: &Transaction, coins: &R) -> Result<bool, ChainError> {
        let mut complete = true;
        for input in &tx.input {
            let outpoint = input.previous_output;
            if self.coins.contains_key(&outpoint) {
                continue;
            }
            match coins.coin(&outpoint)? {
                Some(coin) => {
                    self.coins.insert(outpoint, coin);
                }
                None => complete = false,
            }
        }
        Ok(complete)
    }

    /// The coins displaced by the spends staged so far.
    pub fn undo(&self) -> &UndoCoins {
        &self.undo
    }

    /// Iterates over all staged entries, spent and unspent.
    pub fn iter(&self) -> impl Iterator<Item = (&OutPoint, &Coin)> {
        self.coins.iter()
    }

    /// Re-inserts a coin recovered from an undo record, keeping a copy on
    /// the undo stack so callers can observe what the rollback restored.
    pub(crate) fn restore(&mut self, outpoint: OutPoint, coin: Coin) {
        self.undo.push(coin.clone());
        self.coins.insert(outpoint, coin);
    }

    /// Stages all of `tx`'s outputs as spent markers, which delete the
    /// corresponding table rows when the view is committed.
    pub(crate) fn stage_removal(&mut self, tx: &Transaction, height: u32) {
        let txid = tx.compute_txid();
        let coinbase = tx.is_coinbase();
        for (vout, output) in tx.output.iter().enumerate() {
            let mut coin = Coin::new(output.clone(), height, coinbase);
            coin.spent = true;
            self.coins.insert(OutPoint::new(txid, vout as u32), coin);
        }
    }
}

#[cfg(test)]
mod tests {
    use bitcoin::absolute;
    use bitcoin::hashes::Hash;
    use bitcoin::transaction;
    use bitcoin::Amount;
    use bitcoin::ScriptBuf;
    use bitcoin::Sequence;
    use bitcoin::TxIn;
    use bitcoin::TxOut;
    use bitcoin::Txid;
    use bitcoin::Witness;

    use super::*;

    /// Plain map-backed reader standing in for the coin table.
    struct MapCoins(HashMap<OutPoint, Coin>);

    impl CoinReader for MapCoins {
        fn coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>, ChainError> {
            Ok(self.0.get(outpoint).cloned())
        }
    }

    fn outpoint(tag: u8, vout: u32) -> OutPoint {
        OutPoint::new(Txid::from_byte_array([tag; 32]), vout)
    }

    fn coin(value: u64) -> Coin {
        Coin::new(
            TxOut {
                value: Amount::from_sat(value),
                script_pubkey: ScriptBuf::new(),
            },
            1,
            false,
        )
    }

    fn spending(prevouts: &[OutPoint]) -> Transaction {
        Transaction {
            version: transaction::Version::ONE,
            lock_time: absolute::LockTime::ZERO,
            input: prevouts
                .iter()
                .map(|outpoint| TxIn {
                    previous_output: *outpoint,
                    script_sig: ScriptBuf::new(),
                    sequence: Sequence::MAX,
                    witness: Witness::new(),
                })
                .collect(),
            output: vec![TxOut {
                value: Amount::from_sat(1),
                script_pubkey: ScriptBuf::new(),
            }],
        }
    }

    #[test]
    fn spend_pulls_through_reader_and_records_undo() {
        let a = outpoint(1, 0);
        let b = outpoint(2, 3);
        let reader = MapCoins(HashMap::from([(a, coin(10)), (b, coin(20))]));

        let mut view = CoinView::new();
        view.spend(&spending(&[a, b]), &reader).unwrap();

        assert!(view.get(&a).unwrap().spent);
        assert!(view.get(&b).unwrap().spent);
        let undo = view.undo();
        assert_eq!(undo.len(), 2);
        assert_eq!(undo.coins()[0].output.value.to_sat(), 10);
        assert_eq!(undo.coins()[1].output.value.to_sat(), 20);
        assert!(!undo.coins()[0].spent);
    }

    #[test]
    fn spend_missing_prevout_fails() {
        let reader = MapCoins(HashMap::new());
        let mut view = CoinView::new();
        let missing = outpoint(9, 0);

        match view.spend(&spending(&[missing]), &reader) {
            Err(ChainError::MissingCoin(op)) => assert_eq!(op, missing),
            other => panic!("expected MissingCoin, got {other:?}"),
        }
    }

    #[test]
    fn double_spend_fails() {
        let a = outpoint(1, 0);
        let reader = MapCoins(HashMap::from([(a, coin(10))]));

        let mut view = CoinView::new();
        view.spend(&spending(&[a]), &reader).unwrap();
        assert!(matches!(
            view.spend(&spending(&[a]), &reader),
            Err(ChainError::MissingCoin(_))
        ));
    }

    #[test]
    fn spend_prefers_staged_coin() {
        let creator = spending(&[outpoint(7, 7)]);
        let created = OutPoint::new(creator.compute_txid(), 0);

        // The coin exists only in the view, not in the reader.
        let mut view = CoinView::new();
        view.add(&creator, 5, false);
        view.spend(&spending(&[created]), &MapCoins(HashMap::new()))
            .unwrap();

        assert!(view.get(&created).unwrap().spent);
        assert_eq!(view.undo().len(), 1);
    }

    #[test]
    fn fill_reports_completeness_without_spending() {
        let a = outpoint(1, 0);
        let reader = MapCoins(HashMap::from([(a, coin(10))]));

        let mut view = CoinView::new();
        assert!(view.fill(&spending(&[a]), &reader).unwrap());
        assert!(!view.get(&a).unwrap().spent);
        assert!(view.undo().is_empty());

        assert!(!view.fill(&spending(&[outpoint(9, 0)]), &reader).unwrap());
    }

    #[test]
    fn add_respects_overwrite() {
        let tx = spending(&[outpoint(7, 7)]);
        let created = OutPoint::new(tx.compute_txid(), 0);

        let mut view = CoinView::new();
        view.add(&tx, 5, false);
        assert_eq!(view.get(&created).unwrap().height, 5);

        view.add(&tx, 8, false);
        assert_eq!(view.get(&created).unwrap().height, 5);

        view.add(&tx, 8, true);
        assert_eq!(view.get(&created).unwrap().height, 8);
    }
}
