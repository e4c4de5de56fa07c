//! Undo records: the coins a block spent, so it can be disconnected.

use ledgerd_primitives::encoding::{DecodeError, Decoder, Encoder};

use crate::coins::Coin;

const BLOCK_UNDO_VERSION: u8 = 1;

/// Coins spent by one transaction, in input order.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TxUndo {
    pub spent: Vec<Coin>,
}

/// Undo data for every non-coinbase transaction of a block, in block order.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct BlockUndo {
    pub txs: Vec<TxUndo>,
}

impl BlockUndo {
    pub fn spent_count(&self) -> usize {
        self.txs.iter().map(|tx| tx.spent.len()).sum()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_u8(BLOCK_UNDO_VERSION);
        encoder.write_varint(self.txs.len() as u64);
        for tx in &self.txs {
            encoder.write_varint(tx.spent.len() as u64);
            for coin in &tx.spent {
                coin.encode_into(&mut encoder);
            }
        }
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let version = decoder.read_u8()?;
        if version != BLOCK_UNDO_VERSION {
            return Err(DecodeError::InvalidData("unsupported block undo version"));
        }
        let tx_count = read_len(&mut decoder)?;
        let mut txs = Vec::with_capacity(tx_count.min(4096));
        for _ in 0..tx_count {
            let spent_count = read_len(&mut decoder)?;
            let mut spent = Vec::with_capacity(spent_count.min(4096));
            for _ in 0..spent_count {
                spent.push(Coin::decode_from(&mut decoder)?);
            }
            txs.push(TxUndo { spent });
        }
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self { txs })
    }
}

fn read_len(decoder: &mut Decoder) -> Result<usize, DecodeError> {
    let len = decoder.read_varint()?;
    if len > decoder.remaining() as u64 {
        return Err(DecodeError::SizeTooLarge);
    }
    Ok(len as usize)
}
