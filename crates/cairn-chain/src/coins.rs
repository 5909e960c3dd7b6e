//! UTXO records and block undo data.
//!
//! A [`Coin`] is one spendable transaction output together with the context
//! needed to validate a spend of it later (creation height, coinbase flag).
//! The chain database treats the serialized form as an opaque value in the
//! `coin` table; the `spent` flag exists only in memory while a coin is
//! staged inside a view.

use bitcoin::consensus::encode;
use bitcoin::consensus::encode::VarInt;
use bitcoin::consensus::Decodable;
use bitcoin::consensus::Encodable;
use bitcoin::io::Read;
use bitcoin::io::Write;
use bitcoin::TxOut;

/// A single unspent transaction output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Coin {
    /// The output itself: value and locking script.
    pub output: TxOut,
    /// Height of the block that created this output.
    pub height: u32,
    /// Whether the creating transaction was a coinbase.
    pub coinbase: bool,
    /// In-memory only, never serialized. A spent coin staged in a view is
    /// deleted from the coin table when the view is committed.
    pub spent: bool,
}

impl Coin {
    /// Builds an unspent coin from a transaction output.
    pub fn new(output: TxOut, height: u32, coinbase: bool) -> Self {
        Coin {
            output,
            height,
            coinbase,
            spent: false,
        }
    }
}

impl Encodable for Coin {
    fn consensus_encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<usize, bitcoin::io::Error> {
        let code = (self.height << 1) | u32::from(self.coinbase);
        let mut len = code.consensus_encode(w)?;
        len += self.output.consensus_encode(w)?;
        Ok(len)
    }
}

impl Decodable for Coin {
    fn consensus_decode<R: Read + ?Sized>(r: &mut R) -> Result<Self, encode::Error> {
        let code = u32::consensus_decode(r)?;
        let output = TxOut::consensus_decode(r)?;
        Ok(Coin {
            output,
            height: code >> 1,
            coinbase: code & 1 == 1,
            spent: false,
        })
    }
}

/// The coins destroyed by connecting one block, in spend order.
///
/// Written next to the block when it is connected and read back to reverse
/// the connection: popping restores coins in the opposite order they were
/// spent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UndoCoins {
    coins: Vec<Coin>,
}

impl UndoCoins {
    pub fn push(&mut self, coin: Coin) {
        self.coins.push(coin);
    }

    pub fn pop(&mut self) -> Option<Coin> {
        self.coins.pop()
    }

    pub fn len(&self) -> usize {
        self.coins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coins.is_empty()
    }

    /// The recorded coins, oldest spend first.
    pub fn coins(&self) -> &[Coin] {
        &self.coins
    }
}

impl Encodable for UndoCoins {
    fn consensus_encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<usize, bitcoin::io::Error> {
        let mut len = VarInt(self.coins.len() as u64).consensus_encode(w)?;
        for coin in &self.coins {
            len += coin.consensus_encode(w)?;
        }
        Ok(len)
    }
}

impl Decodable for UndoCoins {
    fn consensus_decode<R: Read + ?Sized>(r: &mut R) -> Result<Self, encode::Error> {
        let count = VarInt::consensus_decode(r)?.0;
        let mut coins = Vec::with_capacity(count.min(1024) as usize);
        for _ in 0..count {
            coins.push(Coin::consensus_decode(r)?);
        }
        Ok(UndoCoins { coins })
    }
}
