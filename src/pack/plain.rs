//! Plain packing: cleartext blocks with integrity checksums

use sha2::{Digest, Sha256};

use crate::errors::{Error, Result};
use crate::pack::{BlockUnpacker, Packer};
use crate::service::Context;
use crate::types::{DirBlock, DirEntry, Packing};

/// Cleartext packing. Blocks are stored as-is; the per-block packdata
/// holds a SHA-256 checksum of the stored bytes, verified on unpack.
pub struct PlainPack;

fn checksum(data: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().to_vec()
}

impl Packer for PlainPack {
    fn packing(&self) -> Packing {
        Packing::Plain
    }

    fn pack_block(&self, _ctx: &Context, cleartext: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
        Ok((cleartext.to_vec(), checksum(cleartext)))
    }

    fn unpack(&self, _ctx: &Context, entry: &DirEntry) -> Result<Box<dyn BlockUnpacker>> {
        if entry.packing != Packing::Plain {
            return Err(Error::invalid("plain.unpack", "entry is not plain-packed")
                .with_path(entry.name.as_str()));
        }
        Ok(Box::new(PlainUnpacker {
            blocks: entry.blocks.clone(),
            next: 0,
            current: None,
        }))
    }
}

struct PlainUnpacker {
    blocks: Vec<DirBlock>,
    next: usize,
    current: Option<DirBlock>,
}

impl BlockUnpacker for PlainUnpacker {
    fn next_block(&mut self) -> Option<DirBlock> {
        let block = self.blocks.get(self.next)?.clone();
        self.next += 1;
        self.current = Some(block.clone());
        Some(block)
    }

    fn unpack(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        const OP: &str = "plain.unpack";
        let block = self
            .current
            .take()
            .ok_or_else(|| Error::internal(OP, "unpack called before next_block"))?;
        if block.packdata.len() != 32 {
            return Err(Error::invalid(OP, "malformed block checksum"));
        }
        if checksum(ciphertext) != block.packdata {
            return Err(Error::io(OP, "block checksum mismatch"));
        }
        Ok(ciphertext.to_vec())
    }
}
