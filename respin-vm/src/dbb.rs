//! Decoded basic blocks, built on demand and memoized by start address.

use hashbrown::HashMap;

use respin_asm::{Decoder, Instr, MAX_INSTR_LEN};

use crate::error::{ErrorKind, ErrorModule, RewriteError, RwResult};

/// A straight-line decoded run.
///
/// Ends either at a terminator or where another decoded block already
/// starts (`terminated == false`: execution falls through into that block).
#[derive(Debug)]
pub struct Dbb {
    /// Source address of the first instruction.
    pub addr: u64,
    /// The decoded instructions.
    pub instrs: Vec<Instr>,
    /// First address past the block.
    pub end: u64,
    /// Whether the last instruction is a terminator.
    pub terminated: bool,
}

/// Decode-on-demand block cache.
///
/// Decoding reads the host process at the requested addresses; the caller
/// vouches that they point into a mapped function.
#[derive(Debug)]
pub struct DbbCache {
    blocks: HashMap<u64, Dbb>,
    instr_cap: usize,
    bb_cap: usize,
    instr_count: usize,
}

impl DbbCache {
    /// Cache with the given pool capacities.
    pub fn new(instr_cap: usize, bb_cap: usize) -> Self {
        Self {
            blocks: HashMap::new(),
            instr_cap,
            bb_cap,
            instr_count: 0,
        }
    }

    /// Update pool capacities (next `reset` keeps them).
    pub fn set_capacity(&mut self, instr_cap: usize, bb_cap: usize) {
        self.instr_cap = instr_cap;
        self.bb_cap = bb_cap;
    }

    /// Forget all decoded blocks; allocations are reused.
    pub fn reset(&mut self) {
        self.blocks.clear();
        self.instr_count = 0;
    }

    /// The block starting exactly at `addr`, decoding it first if needed.
    pub fn get_or_decode(&mut self, addr: u64) -> RwResult<&Dbb> {
        if !self.blocks.contains_key(&addr) {
            let dbb = self.decode_block(addr)?;
            self.blocks.insert(addr, dbb);
        }
        Ok(&self.blocks[&addr])
    }

    fn decode_block(&mut self, addr: u64) -> RwResult<Dbb> {
        if self.blocks.len() >= self.bb_cap {
            return Err(RewriteError::plain(
                ErrorModule::Decoder,
                ErrorKind::BufferOverflow,
                "decoded-block pool exhausted",
            ));
        }

        let mut instrs = Vec::new();
        let mut cur = addr;
        let mut terminated = false;
        loop {
            if self.instr_count >= self.instr_cap {
                return Err(RewriteError::plain(
                    ErrorModule::Decoder,
                    ErrorKind::BufferOverflow,
                    "decoded-instruction pool exhausted",
                ));
            }
            // Safety: the caller asked us to decode a mapped function; one
            // architectural-maximum window per instruction.
            let window =
                unsafe { core::slice::from_raw_parts(cur as *const u8, MAX_INSTR_LEN) };
            let mut dec = Decoder::new(window, cur);
            let instr = dec
                .decode_next()
                .map_err(|e| RewriteError::from_decode(e, addr))?;
            cur += instr.len as u64;
            let term = instr.is_terminator();
            instrs.push(instr);
            self.instr_count += 1;
            if term {
                terminated = true;
                break;
            }
            // fall through into an already-decoded block
            if self.blocks.contains_key(&cur) {
                break;
            }
        }

        tracing::trace!(target: "respin::decode", addr, end = cur, n = instrs.len(), "decoded block");
        Ok(Dbb {
            addr,
            instrs,
            end: cur,
            terminated,
        })
    }

    /// The instruction starting at `addr`, if some decoded block contains
    /// it.
    pub fn instr_at(&self, addr: u64) -> Option<&Instr> {
        let dbb = self
            .blocks
            .values()
            .find(|d| addr >= d.addr && addr < d.end)?;
        dbb.instrs.iter().find(|i| i.addr == addr)
    }

    /// Number of decoded blocks.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Whether nothing has been decoded yet.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use respin_asm::InstrKind;

    // decoding reads process memory, so feed it a static buffer
    static CODE: [u8; 8] = [
        0x48, 0x01, 0xf7, // add %rsi, %rdi
        0x48, 0x89, 0xf8, // mov %rdi, %rax
        0x90, // nop
        0xc3, // ret
    ];

    #[test]
    fn decodes_until_terminator_and_memoizes() {
        let mut cache = DbbCache::new(64, 8);
        let addr = CODE.as_ptr() as u64;
        let (end, n) = {
            let dbb = cache.get_or_decode(addr).unwrap();
            assert!(dbb.terminated);
            assert_eq!(dbb.instrs.last().unwrap().kind, InstrKind::Ret);
            (dbb.end, dbb.instrs.len())
        };
        assert_eq!(end, addr + CODE.len() as u64);
        assert_eq!(n, 4);
        // second call returns the memoized block
        cache.get_or_decode(addr).unwrap();
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn falls_through_into_existing_block() {
        let mut cache = DbbCache::new(64, 8);
        let base = CODE.as_ptr() as u64;
        // decode the tail first: nop; ret
        cache.get_or_decode(base + 6).unwrap();
        // the full block must stop where the tail starts
        let dbb = cache.get_or_decode(base).unwrap();
        assert!(!dbb.terminated);
        assert_eq!(dbb.end, base + 6);
        assert_eq!(dbb.instrs.len(), 2);
    }

    #[test]
    fn block_pool_bound() {
        let mut cache = DbbCache::new(64, 0);
        let err = cache.get_or_decode(CODE.as_ptr() as u64).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BufferOverflow);
        assert_eq!(err.module(), ErrorModule::Decoder);
    }
}
