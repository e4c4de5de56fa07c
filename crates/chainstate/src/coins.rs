//! Unspent output cache layered over a [`CoinsView`].
//!
//! Every entry carries two flags. DIRTY means the entry differs from the
//! layer below and must be written on flush. FRESH means the layer below has
//! no unspent record for the outpoint, so a spent FRESH entry can be dropped
//! instead of written.

use std::collections::HashMap;
use std::mem::size_of;

use ledgerd_consensus::money::money_range;
use ledgerd_consensus::Hash256;
use ledgerd_primitives::encoding::{DecodeError, Decoder, Encoder};
use ledgerd_primitives::outpoint::OutPoint;
use ledgerd_primitives::transaction::{Transaction, TxOut};
use ledgerd_storage::StoreError;

pub const DIRTY: u8 = 1 << 0;
pub const FRESH: u8 = 1 << 1;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Coin {
    pub output: TxOut,
    pub height: u32,
    pub is_coinbase: bool,
}

impl Coin {
    pub fn new(output: TxOut, height: u32, is_coinbase: bool) -> Self {
        Self {
            output,
            height,
            is_coinbase,
        }
    }

    /// Heap bytes owned by the coin.
    pub fn dynamic_memory_usage(&self) -> usize {
        self.output.script_pubkey.capacity()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(16 + self.output.script_pubkey.len());
        self.encode_into(&mut encoder);
        encoder.into_inner()
    }

    pub fn encode_into(&self, encoder: &mut Encoder) {
        let code = u64::from(self.height) * 2 + u64::from(self.is_coinbase);
        encoder.write_varint_msb(code);
        encoder.write_i64_le(self.output.value);
        encoder.write_var_bytes(&self.output.script_pubkey);
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let coin = Self::decode_from(&mut decoder)?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(coin)
    }

    pub fn decode_from(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let code = decoder.read_varint_msb()?;
        let height =
            u32::try_from(code >> 1).map_err(|_| DecodeError::InvalidData("coin height"))?;
        let value = decoder.read_i64_le()?;
        let script_pubkey = decoder.read_var_bytes()?;
        Ok(Self {
            output: TxOut {
                value,
                script_pubkey,
            },
            height,
            is_coinbase: code & 1 == 1,
        })
    }
}

#[derive(Debug)]
pub enum CoinsError {
    /// A new coin would replace an unspent one without overwrite allowed.
    OverwriteUnspent(OutPoint),
    /// A child layer marked an entry FRESH that is unspent in this layer.
    FreshMisapplied(OutPoint),
    Store(StoreError),
    Corrupt(&'static str),
}

impl std::fmt::Display for CoinsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoinsError::OverwriteUnspent(outpoint) => {
                write!(f, "adding coin {outpoint} would overwrite an unspent coin")
            }
            CoinsError::FreshMisapplied(outpoint) => {
                write!(f, "fresh flag misapplied to unspent coin {outpoint}")
            }
            CoinsError::Store(err) => write!(f, "{err}"),
            CoinsError::Corrupt(message) => write!(f, "corrupt coin database: {message}"),
        }
    }
}

impl std::error::Error for CoinsError {}

impl From<StoreError> for CoinsError {
    fn from(err: StoreError) -> Self {
        CoinsError::Store(err)
    }
}

/// A cached coin or spent marker (`coin == None`) with its flags.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CacheEntry {
    pub coin: Option<Coin>,
    pub flags: u8,
}

impl CacheEntry {
    pub fn is_dirty(&self) -> bool {
        self.flags & DIRTY != 0
    }

    pub fn is_fresh(&self) -> bool {
        self.flags & FRESH != 0
    }

    pub fn is_spent(&self) -> bool {
        self.coin.is_none()
    }

    fn usage(&self) -> usize {
        self.coin.as_ref().map(Coin::dynamic_memory_usage).unwrap_or(0)
    }
}

pub type CoinsMap = HashMap<OutPoint, CacheEntry>;

/// A layer that can answer coin lookups and absorb a child layer's changes.
pub trait CoinsView {
    /// Unspent coin for `outpoint`, if any.
    fn fetch_coin(&mut self, outpoint: &OutPoint) -> Result<Option<Coin>, CoinsError>;

    fn have_coin(&mut self, outpoint: &OutPoint) -> Result<bool, CoinsError> {
        Ok(self.fetch_coin(outpoint)?.is_some())
    }

    fn best_block(&mut self) -> Result<Option<Hash256>, CoinsError>;

    /// Applies every DIRTY entry of `entries` and moves the best block tag.
    /// Either all of the batch is applied or none of it.
    fn batch_write(
        &mut self,
        entries: &CoinsMap,
        best_block: Option<Hash256>,
    ) -> Result<(), CoinsError>;

    fn estimate_size(&self) -> usize {
        0
    }
}

impl<V: CoinsView + ?Sized> CoinsView for &mut V {
    fn fetch_coin(&mut self, outpoint: &OutPoint) -> Result<Option<Coin>, CoinsError> {
        (**self).fetch_coin(outpoint)
    }

    fn have_coin(&mut self, outpoint: &OutPoint) -> Result<bool, CoinsError> {
        (**self).have_coin(outpoint)
    }

    fn best_block(&mut self) -> Result<Option<Hash256>, CoinsError> {
        (**self).best_block()
    }

    fn batch_write(
        &mut self,
        entries: &CoinsMap,
        best_block: Option<Hash256>,
    ) -> Result<(), CoinsError> {
        (**self).batch_write(entries, best_block)
    }

    fn estimate_size(&self) -> usize {
        (**self).estimate_size()
    }
}

/// View with no coins. Useful as the bottom of a scratch cache.
#[derive(Clone, Copy, Debug, Default)]
pub struct EmptyCoinsView;

impl CoinsView for EmptyCoinsView {
    fn fetch_coin(&mut self, _outpoint: &OutPoint) -> Result<Option<Coin>, CoinsError> {
        Ok(None)
    }

    fn best_block(&mut self) -> Result<Option<Hash256>, CoinsError> {
        Ok(None)
    }

    fn batch_write(
        &mut self,
        _entries: &CoinsMap,
        _best_block: Option<Hash256>,
    ) -> Result<(), CoinsError> {
        Ok(())
    }
}

pub struct CoinsCache<V> {
    base: V,
    entries: CoinsMap,
    best_block: Option<Hash256>,
    cached_usage: usize,
}

impl<V: CoinsView> CoinsCache<V> {
    pub fn new(base: V) -> Self {
        Self {
            base,
            entries: HashMap::new(),
            best_block: None,
            cached_usage: 0,
        }
    }

    pub fn base(&self) -> &V {
        &self.base
    }

    pub fn base_mut(&mut self) -> &mut V {
        &mut self.base
    }

    pub fn into_base(self) -> V {
        self.base
    }

    fn fetch_entry(&mut self, outpoint: &OutPoint) -> Result<&mut CacheEntry, CoinsError> {
        if !self.entries.contains_key(outpoint) {
            let entry = match self.base.fetch_coin(outpoint)? {
                Some(coin) => CacheEntry {
                    coin: Some(coin),
                    flags: 0,
                },
                // nothing below either, so a later add can be FRESH
                None => CacheEntry {
                    coin: None,
                    flags: FRESH,
                },
            };
            self.cached_usage += entry.usage();
            self.entries.insert(*outpoint, entry);
        }
        self.entries
            .get_mut(outpoint)
            .ok_or(CoinsError::Corrupt("cache entry vanished"))
    }

    pub fn get_coin(&mut self, outpoint: &OutPoint) -> Result<Option<Coin>, CoinsError> {
        Ok(self.fetch_entry(outpoint)?.coin.clone())
    }

    /// Borrowing variant of [`CoinsCache::get_coin`].
    pub fn access_coin(&mut self, outpoint: &OutPoint) -> Result<Option<&Coin>, CoinsError> {
        Ok(self.fetch_entry(outpoint)?.coin.as_ref())
    }

    pub fn have_coin(&mut self, outpoint: &OutPoint) -> Result<bool, CoinsError> {
        Ok(!self.fetch_entry(outpoint)?.is_spent())
    }

    /// Like [`CoinsCache::have_coin`] but never consults the base view.
    pub fn have_coin_in_cache(&self, outpoint: &OutPoint) -> bool {
        self.entries
            .get(outpoint)
            .is_some_and(|entry| !entry.is_spent())
    }

    pub fn entry(&self, outpoint: &OutPoint) -> Option<&CacheEntry> {
        self.entries.get(outpoint)
    }

    /// Adds `coin` at `outpoint`. Unspendable outputs are never stored.
    /// Without `possible_overwrite`, replacing an unspent coin is an error and
    /// leaves the cache unchanged.
    pub fn add_coin(
        &mut self,
        outpoint: OutPoint,
        coin: Coin,
        possible_overwrite: bool,
    ) -> Result<(), CoinsError> {
        if coin.output.is_unspendable() {
            return Ok(());
        }
        let mut fresh = false;
        if let Some(existing) = self.entries.get(&outpoint) {
            if !possible_overwrite {
                if !existing.is_spent() {
                    return Err(CoinsError::OverwriteUnspent(outpoint));
                }
                // a spent entry that is not DIRTY was never written below
                fresh = !existing.is_dirty();
            }
        } else if !possible_overwrite {
            fresh = true;
        }
        let usage = coin.dynamic_memory_usage();
        let entry = self.entries.entry(outpoint).or_insert(CacheEntry {
            coin: None,
            flags: 0,
        });
        self.cached_usage -= entry.usage();
        entry.coin = Some(coin);
        entry.flags |= DIRTY | if fresh { FRESH } else { 0 };
        self.cached_usage += usage;
        Ok(())
    }

    /// Adds every output of `tx`. With `check_overwrite` each output is looked
    /// up first; otherwise only coinbase outputs may overwrite.
    pub fn add_coins(
        &mut self,
        tx: &Transaction,
        txid: Hash256,
        height: u32,
        check_overwrite: bool,
    ) -> Result<(), CoinsError> {
        let is_coinbase = tx.is_coinbase();
        for (index, output) in tx.vout.iter().enumerate() {
            let outpoint = OutPoint::new(txid, index as u32);
            let overwrite = if check_overwrite {
                self.have_coin(&outpoint)?
            } else {
                is_coinbase
            };
            self.add_coin(
                outpoint,
                Coin::new(output.clone(), height, is_coinbase),
                overwrite,
            )?;
        }
        Ok(())
    }

    /// Spends the coin at `outpoint` and returns it, or `None` when there is
    /// no unspent coin to spend.
    pub fn spend_coin(&mut self, outpoint: &OutPoint) -> Result<Option<Coin>, CoinsError> {
        let entry = self.fetch_entry(outpoint)?;
        let Some(coin) = entry.coin.take() else {
            return Ok(None);
        };
        let fresh = entry.is_fresh();
        if fresh {
            self.entries.remove(outpoint);
        } else {
            entry.flags |= DIRTY;
        }
        self.cached_usage -= coin.dynamic_memory_usage();
        Ok(Some(coin))
    }

    /// Drops an entry that holds no unwritten change.
    pub fn uncache(&mut self, outpoint: &OutPoint) {
        if let Some(entry) = self.entries.get(outpoint) {
            if !entry.is_dirty() {
                self.cached_usage -= entry.usage();
                self.entries.remove(outpoint);
            }
        }
    }

    pub fn best_block(&mut self) -> Result<Option<Hash256>, CoinsError> {
        if self.best_block.is_none() {
            self.best_block = self.base.best_block()?;
        }
        Ok(self.best_block)
    }

    pub fn set_best_block(&mut self, hash: Hash256) {
        self.best_block = Some(hash);
    }

    pub fn have_inputs(&mut self, tx: &Transaction) -> Result<bool, CoinsError> {
        if tx.is_coinbase() {
            return Ok(true);
        }
        for input in &tx.vin {
            if !self.have_coin(&input.prevout)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Sum of the values spent by `tx`; `None` if an input is missing or the
    /// sum leaves the money range.
    pub fn value_in(&mut self, tx: &Transaction) -> Result<Option<i64>, CoinsError> {
        if tx.is_coinbase() {
            return Ok(Some(0));
        }
        let mut total = 0i64;
        for input in &tx.vin {
            let Some(coin) = self.access_coin(&input.prevout)? else {
                return Ok(None);
            };
            total = match total.checked_add(coin.output.value) {
                Some(total) if money_range(total) => total,
                _ => return Ok(None),
            };
        }
        Ok(Some(total))
    }

    pub fn cache_size(&self) -> usize {
        self.entries.len()
    }

    pub fn dynamic_memory_usage(&self) -> usize {
        let per_entry = size_of::<OutPoint>() + size_of::<CacheEntry>() + size_of::<u64>();
        self.entries.capacity() * per_entry + self.cached_usage
    }

    /// Pushes every change down to the base view in one batch and empties the
    /// cache. On failure the cache is left exactly as it was.
    pub fn flush(&mut self) -> Result<(), CoinsError> {
        let best_block = self.best_block;
        self.base.batch_write(&self.entries, best_block)?;
        self.entries.clear();
        self.entries.shrink_to_fit();
        self.cached_usage = 0;
        Ok(())
    }

    /// Entries that a flush would hand to the base view.
    pub fn dirty_count(&self) -> usize {
        self.entries.values().filter(|entry| entry.is_dirty()).count()
    }
}

impl<V: CoinsView> CoinsView for CoinsCache<V> {
    fn fetch_coin(&mut self, outpoint: &OutPoint) -> Result<Option<Coin>, CoinsError> {
        self.get_coin(outpoint)
    }

    fn have_coin(&mut self, outpoint: &OutPoint) -> Result<bool, CoinsError> {
        CoinsCache::have_coin(self, outpoint)
    }

    fn best_block(&mut self) -> Result<Option<Hash256>, CoinsError> {
        CoinsCache::best_block(self)
    }

    fn batch_write(
        &mut self,
        entries: &CoinsMap,
        best_block: Option<Hash256>,
    ) -> Result<(), CoinsError> {
        for (outpoint, child) in entries {
            if !child.is_dirty() || !child.is_fresh() {
                continue;
            }
            if let Some(ours) = self.entries.get(outpoint) {
                if !ours.is_spent() {
                    return Err(CoinsError::FreshMisapplied(*outpoint));
                }
            }
        }

        for (outpoint, child) in entries {
            if !child.is_dirty() {
                continue;
            }
            match self.entries.get_mut(outpoint) {
                None => {
                    // a FRESH spent child cancels out against a missing parent
                    if child.is_fresh() && child.is_spent() {
                        continue;
                    }
                    let flags = DIRTY | (child.flags & FRESH);
                    self.cached_usage += child.usage();
                    self.entries.insert(
                        *outpoint,
                        CacheEntry {
                            coin: child.coin.clone(),
                            flags,
                        },
                    );
                }
                Some(ours) if ours.is_fresh() && child.is_spent() => {
                    self.cached_usage -= ours.usage();
                    self.entries.remove(outpoint);
                }
                Some(ours) => {
                    self.cached_usage -= ours.usage();
                    ours.coin = child.coin.clone();
                    ours.flags |= DIRTY;
                    self.cached_usage += child.usage();
                }
            }
        }
        if best_block.is_some() {
            self.best_block = best_block;
        }
        Ok(())
    }

    fn estimate_size(&self) -> usize {
        self.base.estimate_size()
    }
}
