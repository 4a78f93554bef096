//! Block layout: three passes that turn captured blocks into a finished
//! function image.
//!
//! Pass 1 emits every block body at the arena tip in predicted-path order,
//! leaving a fixed-size hole for the terminator. Pass 2 assigns final
//! addresses, compacting bodies downward and choosing the short or near
//! branch form per block. Pass 3 writes the terminators into the finalized
//! positions and returns the tail hole space.

use respin_asm::{encode, encode_jcc, encode_jmp_rel32};

use crate::capture::{CaptureStore, CbbId, CbbTerm};
use crate::consts::{CODE_ALIGN, TERMINATOR_HOLE};
use crate::error::{RewriteError, RwResult};
use crate::storage::CodeStorage;

/// Lay out all blocks reachable from `entry` and return the generated
/// function's address and byte length.
pub(crate) fn generate(
    capture: &mut CaptureStore,
    storage: &mut CodeStorage,
    entry: CbbId,
    verbose: bool,
) -> RwResult<(u64, usize)> {
    let order = pass1_emit_bodies(capture, storage, entry)?;
    let end = pass2_place(capture, storage, &order)?;
    pass3_patch(capture, storage, &order)?;
    storage.truncate_to(end);

    let start = capture.get(entry).addr2;
    let size = (end - start) as usize;
    if verbose {
        for id in &order {
            let c = capture.get(*id);
            tracing::debug!(
                target: "respin::gen",
                src = c.addr,
                addr = c.addr2,
                size = c.size,
                jcc8 = c.gen_jcc8,
                jump = c.gen_jump,
                "laid out block"
            );
        }
    }
    tracing::debug!(target: "respin::gen", start, size, blocks = order.len(), "generated function");
    Ok((start, size))
}

/// Pass 1: bodies at the arena tip, predicted successor adjacent, a
/// terminator hole after each body.
fn pass1_emit_bodies(
    capture: &mut CaptureStore,
    storage: &mut CodeStorage,
    entry: CbbId,
) -> RwResult<Vec<CbbId>> {
    storage.align_to(CODE_ALIGN)?;

    let mut order = Vec::new();
    let mut work = vec![entry];
    while let Some(id) = work.pop() {
        if capture.get(id).addr1 != 0 {
            continue;
        }
        let addr1 = storage.tip();
        let (instr_count, cbb_addr) = {
            let c = capture.get(id);
            (c.instrs.len(), c.addr)
        };
        for index in 0..instr_count {
            let ins = capture.get(id).instrs[index];
            let bytes = encode(&ins).map_err(|e| RewriteError::from_encode(e, cbb_addr, index))?;
            storage.push(bytes.as_slice())?;
        }
        let size = (storage.tip() - addr1) as u32;
        storage.commit_checked(TERMINATOR_HOLE)?;

        {
            let c = capture.get_mut(id);
            c.addr1 = addr1;
            c.size = size;
        }
        order.push(id);

        let c = capture.get(id);
        if let CbbTerm::Jcc(_) = c.term {
            let (taken, fall) = (c.next_branch, c.next_fall);
            let preferred = if c.preferred_taken { taken } else { fall };
            let other = if c.preferred_taken { fall } else { taken };
            // stack order: the preferred side is popped, and laid out, first
            if let Some(o) = other {
                work.push(o);
            }
            if let Some(p) = preferred {
                work.push(p);
            }
        }
    }
    Ok(order)
}

/// Pass 2: final addresses. Compaction moves bodies downward, so a forward
/// copy is safe; branch reach is estimated with the final address where one
/// exists and the pass-1 address otherwise, which can only overestimate.
fn pass2_place(
    capture: &mut CaptureStore,
    storage: &mut CodeStorage,
    order: &[CbbId],
) -> RwResult<u64> {
    let mut cursor = capture.get(order[0]).addr1;
    for (k, id) in order.iter().enumerate() {
        let (addr1, size, term, next_branch, next_fall) = {
            let c = capture.get(*id);
            (c.addr1, c.size as u64, c.term, c.next_branch, c.next_fall)
        };
        let addr2 = cursor;
        capture.get_mut(*id).addr2 = addr2;
        storage.move_down(addr2, addr1, size as usize)?;

        let mut term_len = 0u64;
        if let CbbTerm::Jcc(_) = term {
            let target = next_branch.expect("conditional terminator has a branch successor");
            let t = capture.get(target);
            let target_addr = if t.addr2 != 0 { t.addr2 } else { t.addr1 };
            let end_short = addr2 + size + 2;
            let rel = target_addr.wrapping_sub(end_short) as i64;
            let jcc8 = i8::try_from(rel).is_ok();
            let jcc_len = if jcc8 { 2 } else { 6 };

            let fall = next_fall.expect("conditional terminator has a fall-through");
            let adjacent = order.get(k + 1) == Some(&fall);
            let jump_len = if adjacent { 0 } else { 5 };

            {
                let c = capture.get_mut(*id);
                c.gen_jcc8 = jcc8;
                c.gen_jump = !adjacent;
            }
            term_len = jcc_len + jump_len;
        }
        cursor = addr2 + size + term_len;
    }
    Ok(cursor)
}

/// Pass 3: write the terminators into the finalized positions.
fn pass3_patch(
    capture: &mut CaptureStore,
    storage: &mut CodeStorage,
    order: &[CbbId],
) -> RwResult<()> {
    for id in order {
        let (addr2, size, term, gen_jcc8, gen_jump, next_branch, next_fall) = {
            let c = capture.get(*id);
            (
                c.addr2,
                c.size as u64,
                c.term,
                c.gen_jcc8,
                c.gen_jump,
                c.next_branch,
                c.next_fall,
            )
        };
        let cond = match term {
            CbbTerm::Jcc(c) => c,
            _ => continue,
        };
        let mut pos = addr2 + size;
        let target = capture.get(next_branch.expect("branch successor")).addr2;
        let jcc_len = if gen_jcc8 { 2 } else { 6 };
        let rel = target.wrapping_sub(pos + jcc_len) as i64;
        let rel = i32::try_from(rel).expect("branch reach checked in pass 2");
        let bytes = encode_jcc(cond, rel, gen_jcc8);
        storage.write_at(pos, bytes.as_slice())?;
        pos += jcc_len;

        if gen_jump {
            let fall = capture.get(next_fall.expect("fall-through successor")).addr2;
            let rel = fall.wrapping_sub(pos + 5) as i64;
            let rel = i32::try_from(rel).expect("jump reach");
            storage.write_at(pos, encode_jmp_rel32(rel).as_slice())?;
        }
    }
    Ok(())
}
