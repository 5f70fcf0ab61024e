//! Packers
//!
//! A packer implements one encoding scheme for file blocks, selected by
//! the entry's packing tag. The read pipeline drives a packer's
//! [`BlockUnpacker`] over an entry: blocks are produced in entry order
//! and each block's ciphertext, fetched by the caller, is turned back
//! into plaintext.

mod plain;
mod sealed;

use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::Lazy;

use crate::errors::{Error, Result};
use crate::service::Context;
use crate::types::{DirBlock, DirEntry, Packing};

pub use plain::PlainPack;
pub use sealed::SealedPack;

/// One encoding scheme for file blocks.
pub trait Packer: Send + Sync {
    /// The packing tag this packer implements.
    fn packing(&self) -> Packing;

    /// Seal one plaintext block, returning the ciphertext to store and
    /// the per-block packdata to record in the entry.
    fn pack_block(&self, ctx: &Context, cleartext: &[u8]) -> Result<(Vec<u8>, Vec<u8>)>;

    /// Begin unpacking an entry. The returned unpacker produces blocks
    /// in the order the entry dictates.
    fn unpack(&self, ctx: &Context, entry: &DirEntry) -> Result<Box<dyn BlockUnpacker>>;
}

/// Streaming decoder for one entry's blocks.
pub trait BlockUnpacker: Send {
    /// The next block in entry order, or `None` when done.
    fn next_block(&mut self) -> Option<DirBlock>;

    /// Verify and decode the ciphertext of the block most recently
    /// produced by [`Self::next_block`].
    fn unpack(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>>;
}

static PACKERS: Lazy<DashMap<Packing, Arc<dyn Packer>>> = Lazy::new(|| {
    let packers: DashMap<Packing, Arc<dyn Packer>> = DashMap::new();
    packers.insert(Packing::Plain, Arc::new(PlainPack) as Arc<dyn Packer>);
    packers.insert(Packing::Sealed, Arc::new(SealedPack) as Arc<dyn Packer>);
    packers
});

/// The packer for a packing tag.
pub fn lookup(packing: Packing) -> Result<Arc<dyn Packer>> {
    PACKERS
        .get(&packing)
        .map(|p| p.value().clone())
        .ok_or_else(|| Error::invalid("pack.lookup", format!("no packer registered for {packing}")))
}

/// Replace the packer for a tag, returning the previous one. Used by
/// tests that substitute instrumented packers.
pub fn register(packer: Arc<dyn Packer>) -> Option<Arc<dyn Packer>> {
    PACKERS.insert(packer.packing(), packer)
}
