//! Sealed packing: AES-256-GCM per block

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;

use crate::errors::{Error, Result};
use crate::pack::{BlockUnpacker, Packer};
use crate::service::Context;
use crate::types::{DirBlock, DirEntry, Packing};

const NONCE_LEN: usize = 12;

/// End-to-end sealed packing. Each block is encrypted with AES-256-GCM
/// under the caller's secret; the per-block packdata holds the nonce.
/// Authentication failures surface as I/O errors, indistinguishable
/// from a corrupted store.
pub struct SealedPack;

fn cipher_for(op: &'static str, ctx: &Context) -> Result<Aes256Gcm> {
    let secret = ctx
        .secret
        .as_ref()
        .ok_or_else(|| Error::permission(op, "context carries no secret key"))?;
    Ok(Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(secret)))
}

impl Packer for SealedPack {
    fn packing(&self) -> Packing {
        Packing::Sealed
    }

    fn pack_block(&self, ctx: &Context, cleartext: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
        const OP: &str = "sealed.pack";
        let cipher = cipher_for(OP, ctx)?;
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), cleartext)
            .map_err(|_| Error::internal(OP, "block encryption failed"))?;
        Ok((ciphertext, nonce.to_vec()))
    }

    fn unpack(&self, ctx: &Context, entry: &DirEntry) -> Result<Box<dyn BlockUnpacker>> {
        const OP: &str = "sealed.unpack";
        if entry.packing != Packing::Sealed {
            return Err(Error::invalid(OP, "entry is not sealed").with_path(entry.name.as_str()));
        }
        let cipher = cipher_for(OP, ctx)?;
        Ok(Box::new(SealedUnpacker {
            cipher,
            blocks: entry.blocks.clone(),
            next: 0,
            current: None,
        }))
    }
}

struct SealedUnpacker {
    cipher: Aes256Gcm,
    blocks: Vec<DirBlock>,
    next: usize,
    current: Option<DirBlock>,
}

impl BlockUnpacker for SealedUnpacker {
    fn next_block(&mut self) -> Option<DirBlock> {
        let block = self.blocks.get(self.next)?.clone();
        self.next += 1;
        self.current = Some(block.clone());
        Some(block)
    }

    fn unpack(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        const OP: &str = "sealed.unpack";
        let block = self
            .current
            .take()
            .ok_or_else(|| Error::internal(OP, "unpack called before next_block"))?;
        if block.packdata.len() != NONCE_LEN {
            return Err(Error::invalid(OP, "malformed block nonce"));
        }
        self.cipher
            .decrypt(Nonce::from_slice(&block.packdata), ciphertext)
            .map_err(|_| Error::io(OP, "block failed authentication"))
    }
}
