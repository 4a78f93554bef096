//! The rewriter: owner of every pool and the public request surface.

use itertools::Itertools;
use respin_asm::{Decoder, MAX_INSTR_LEN};

use crate::capture::{CaptureStore, CbbId};
use crate::config::{ParState, RewriterConfig};
use crate::consts::{
    CAPTURE_BB_CAP, CAPTURE_INSTR_CAP, CODE_ARENA_SIZE, DECODE_BB_CAP, DECODE_INSTR_CAP,
};
use crate::dbb::DbbCache;
use crate::emu::state::{EmuState, SavedStates};
use crate::error::{ErrorKind, ErrorModule, RewriteError, RwResult};
use crate::layout;
use crate::state::CaptureState;
use crate::storage::CodeStorage;

/// Trace gates for the verbose knobs.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Verbose {
    pub decode: bool,
    pub emu_state: bool,
    pub emu_steps: bool,
    pub opt: bool,
}

/// A function rewriter.
///
/// One rewriter owns its arenas exclusively: decoded blocks, captured
/// blocks, state snapshots and the W+X code arena. They are allocated
/// lazily, reset (not freed) by every new request, and released when the
/// rewriter is dropped. A rewriter is not meant to be shared across
/// threads.
#[derive(Debug)]
pub struct Rewriter {
    pub(crate) cfg: RewriterConfig,
    pub(crate) entry: Option<u64>,
    pub(crate) dbbs: DbbCache,
    pub(crate) capture: CaptureStore,
    pub(crate) saved: SavedStates,
    pub(crate) storage: Option<CodeStorage>,
    pub(crate) code_cap: usize,
    pub(crate) st: EmuState,
    pub(crate) cur: Option<CbbId>,
    pub(crate) materialized: u16,
    pub(crate) capturing: bool,
    pub(crate) run_id: u32,
    pub(crate) generated: Option<(u64, usize)>,
    pub(crate) verbose: Verbose,
}

impl Default for Rewriter {
    fn default() -> Self {
        Self::new()
    }
}

impl Rewriter {
    /// A rewriter with default capacities.
    pub fn new() -> Self {
        Self {
            cfg: RewriterConfig::default(),
            entry: None,
            dbbs: DbbCache::new(DECODE_INSTR_CAP, DECODE_BB_CAP),
            capture: CaptureStore::new(CAPTURE_INSTR_CAP, CAPTURE_BB_CAP),
            saved: SavedStates::default(),
            storage: None,
            code_cap: CODE_ARENA_SIZE,
            st: EmuState::init(0, 64, &[], 0),
            cur: None,
            materialized: 0,
            capturing: false,
            run_id: 0,
            generated: None,
            verbose: Verbose::default(),
        }
    }

    /// Declare the function to rewrite.
    pub fn set_function(&mut self, entry: u64) {
        self.entry = Some(entry);
    }

    /// The declared entry address.
    pub fn function(&self) -> Option<u64> {
        self.entry
    }

    /// Change the decoder pool capacities.
    pub fn set_decoding_capacity(&mut self, instr_cap: usize, bb_cap: usize) {
        self.dbbs.set_capacity(instr_cap, bb_cap);
    }

    /// Change the capture pool and code arena capacities. A resized arena
    /// takes effect on the next request.
    pub fn set_capture_capacity(&mut self, instr_cap: usize, bb_cap: usize, code_cap: usize) {
        self.capture.set_capacity(instr_cap, bb_cap);
        if code_cap != self.code_cap {
            self.code_cap = code_cap;
            self.storage = None;
        }
    }

    /// Gate decode / state / per-step tracing.
    pub fn verbose(&mut self, decode: bool, emu_state: bool, emu_steps: bool) {
        self.verbose.decode = decode;
        self.verbose.emu_state = emu_state;
        self.verbose.emu_steps = emu_steps;
    }

    /// Gate generator/layout tracing.
    pub fn opt_verbose(&mut self, on: bool) {
        self.verbose.opt = on;
    }

    /// Configuration access.
    pub fn config(&self) -> &RewriterConfig {
        &self.cfg
    }

    /// Mutable configuration access.
    pub fn config_mut(&mut self) -> &mut RewriterConfig {
        &mut self.cfg
    }

    /// Address of the most recently generated function, 0 after a failed or
    /// absent rewrite.
    pub fn generated_code(&self) -> u64 {
        self.generated.map_or(0, |(addr, _)| addr)
    }

    /// Byte length of the most recently generated function, 0 after a
    /// failed or absent rewrite.
    pub fn generated_size(&self) -> usize {
        self.generated.map_or(0, |(_, size)| size)
    }

    /// Specialize the declared function against up to six parameters.
    ///
    /// Returns the generated entry address. On failure, returns 0 — or the
    /// original entry when the `return_original` option is set — and clears
    /// [`Rewriter::generated_code`].
    pub fn rewrite(&mut self, params: &[u64]) -> u64 {
        match self.try_rewrite(params) {
            Ok(addr) => addr,
            Err(e) => {
                tracing::warn!(target: "respin", error = %e, "rewrite failed, keeping the original");
                self.generated = None;
                if self.cfg.return_original {
                    self.entry.unwrap_or(0)
                } else {
                    0
                }
            }
        }
    }

    /// [`Rewriter::rewrite`] with the failure instead of the fallback
    /// address.
    pub fn try_rewrite(&mut self, params: &[u64]) -> RwResult<u64> {
        let entry = self.require_entry()?;
        let params = self.bind_params(params)?;
        self.reset_run()?;
        self.run_capture(entry, &params)?;
        let first = self.capture.ids().next().ok_or_else(|| {
            RewriteError::plain(ErrorModule::Capture, ErrorKind::Unknown, "nothing captured")
        })?;
        let storage = self.storage.as_mut().expect("mapped by reset_run");
        let (addr, size) = layout::generate(&mut self.capture, storage, first, self.verbose.opt)?;
        self.generated = Some((addr, size));
        Ok(addr)
    }

    /// Abstract execution without code generation; returns the final RAX.
    ///
    /// On an abort, the RAX slot of whatever state was reached is returned.
    pub fn emulate(&mut self, params: &[u64]) -> u64 {
        match self.try_emulate(params) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(target: "respin", error = %e, "emulation aborted");
                self.st.regs[0].val
            }
        }
    }

    /// [`Rewriter::emulate`] with errors surfaced.
    pub fn try_emulate(&mut self, params: &[u64]) -> RwResult<u64> {
        let entry = self.require_entry()?;
        let params = self.bind_params(params)?;
        self.reset_run()?;
        self.run_emulate(entry, &params)?;
        Ok(self.st.regs[0].val)
    }

    /// Decode `byte_count` bytes starting at `addr` and render the
    /// instructions one per line.
    pub fn decode_print(&mut self, addr: u64, byte_count: usize) -> RwResult<String> {
        let mut out = Vec::new();
        let mut cur = addr;
        while cur < addr + byte_count as u64 {
            // Safety: inspection of caller-provided code addresses, one
            // architectural-maximum window per instruction.
            let window = unsafe { core::slice::from_raw_parts(cur as *const u8, MAX_INSTR_LEN) };
            let mut dec = Decoder::new(window, cur);
            let instr = dec
                .decode_next()
                .map_err(|e| RewriteError::from_decode(e, addr))?;
            let bytes = window[..instr.len as usize]
                .iter()
                .map(|b| format!("{b:02x}"))
                .join(" ");
            out.push(format!("{cur:#014x}: {bytes:<30} {instr}"));
            if self.verbose.decode {
                tracing::debug!(target: "respin::decode", "{}", out.last().expect("just pushed"));
            }
            cur += instr.len as u64;
        }
        Ok(out.join("\n"))
    }

    fn require_entry(&self) -> RwResult<u64> {
        self.entry.ok_or_else(|| {
            RewriteError::plain(
                ErrorModule::Rewriter,
                ErrorKind::InvalidRequest,
                "no function set",
            )
        })
    }

    /// Pair caller values with the configured parameter states; parameters
    /// without a declared state stay dynamic.
    fn bind_params(&self, params: &[u64]) -> RwResult<Vec<(u64, CaptureState)>> {
        if params.len() > 6 {
            return Err(RewriteError::plain(
                ErrorModule::Rewriter,
                ErrorKind::InvalidRequest,
                "more than six register parameters",
            ));
        }
        Ok(params
            .iter()
            .enumerate()
            .map(|(i, v)| {
                let state = match self.cfg.par_state[i] {
                    Some(ParState::Known) => CaptureState::Static,
                    Some(ParState::KnownViral) => CaptureState::Static2,
                    Some(ParState::Dynamic) | None => CaptureState::Dynamic,
                };
                let name = self.cfg.par_name[i].as_deref().unwrap_or("_");
                tracing::debug!(target: "respin", par = i, name, value = *v, state = ?state, "bound parameter");
                (*v, state)
            })
            .collect())
    }

    /// Reset all pools for a fresh request. Buffers are reused; only a
    /// missing or resized code arena is (re)mapped.
    fn reset_run(&mut self) -> RwResult<()> {
        self.run_id = self.run_id.wrapping_add(1);
        self.dbbs.reset();
        self.capture.reset();
        self.saved.reset();
        self.generated = None;
        self.cur = None;
        self.materialized = 0;
        match &mut self.storage {
            Some(s) => s.reset(),
            None => self.storage = Some(CodeStorage::new(self.code_cap)?),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrite_without_function_is_invalid_request() {
        let mut rw = Rewriter::new();
        let err = rw.try_rewrite(&[]).unwrap_err();
        assert_eq!(err.module(), ErrorModule::Rewriter);
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
        assert_eq!(rw.rewrite(&[]), 0);
        assert_eq!(rw.generated_code(), 0);
        assert_eq!(rw.generated_size(), 0);
    }

    #[test]
    fn too_many_parameters_are_rejected() {
        let mut rw = Rewriter::new();
        rw.set_function(0x1000);
        let err = rw.try_rewrite(&[0; 7]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    }

    #[test]
    fn return_original_option() {
        // ud2 is outside the supported subset, so the rewrite fails and the
        // original entry comes back
        static BAD: [u8; 2] = [0x0f, 0x0b];
        let entry = BAD.as_ptr() as u64;
        let mut rw = Rewriter::new();
        rw.set_function(entry);
        assert_eq!(rw.rewrite(&[]), 0);
        rw.config_mut().return_original = true;
        assert_eq!(rw.rewrite(&[]), entry);
        assert_eq!(rw.generated_code(), 0);
    }

    #[test]
    fn decode_print_renders_lines() {
        static CODE: [u8; 4] = [0x48, 0x01, 0xf7, 0xc3];
        let mut rw = Rewriter::new();
        let text = rw.decode_print(CODE.as_ptr() as u64, CODE.len()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("add %rsi, %rdi"), "{}", lines[0]);
        assert!(lines[0].contains("48 01 f7"), "{}", lines[0]);
        assert!(lines[1].contains("ret"), "{}", lines[1]);
    }
}
