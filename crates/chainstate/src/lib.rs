//! Block index, active chain and UTXO set management.

pub mod blockindex;
pub mod blockstore;
pub mod chain;
pub mod coins;
pub mod coinsdb;
pub mod connect;
pub mod undo;
pub mod validation;

pub use blockindex::{BlockIndexEntry, BlockIndexError, BlockIndexTree, EntryId, Validity};
pub use blockstore::BlockStore;
pub use chain::{ActiveChain, ForkError};
pub use coins::{Coin, CoinsCache, CoinsError, CoinsView, EmptyCoinsView};
pub use coinsdb::CoinsStore;
pub use connect::{connect_block, disconnect_block, ConnectContext, DisconnectResult};
pub use undo::{BlockUndo, TxUndo};
pub use validation::{ValidationError, ValidationFlags};
