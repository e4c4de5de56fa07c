//! Core block/transaction types and consensus serialization.

pub mod block;
pub mod encoding;
pub mod hash;
pub mod merkle;
pub mod outpoint;
pub mod transaction;

pub use block::{genesis_block, Block, BlockDecodeError, BlockHeader};
pub use hash::{sha256, sha256d};
pub use merkle::{block_merkle_root, merkle_root};
pub use outpoint::OutPoint;
pub use transaction::{Transaction, TxIn, TxOut};
