//! Branch-splitting bookkeeping: how many blocks and snapshots a split
//! leaves behind.

use crate::{ParState, Rewriter};

// cmp rdi, 10; jg +4; mov rax, rsi; ret; mov rax, rdi; ret
#[rustfmt::skip]
const DIAMOND: [u8; 14] = [
    0x48, 0x83, 0xff, 0x0a,
    0x7f, 0x04,
    0x48, 0x89, 0xf0,
    0xc3,
    0x48, 0x89, 0xf8,
    0xc3,
];

#[test]
fn dynamic_branch_queues_exactly_two_blocks() {
    let mut rw = Rewriter::new();
    rw.set_function(DIAMOND.as_ptr() as u64);
    assert_ne!(rw.rewrite(&[0, 0]), 0);
    // entry block plus one block per branch side
    assert_eq!(rw.capture.len(), 3);
    // the split interned exactly one snapshot beyond the entry state
    assert_eq!(rw.saved.len(), 2);
}

#[test]
fn resolved_branch_has_single_continuation() {
    let mut rw = Rewriter::new();
    rw.set_function(DIAMOND.as_ptr() as u64);
    rw.config_mut().par_state[0] = Some(ParState::Known);
    assert_ne!(rw.rewrite(&[42, 0]), 0);
    assert_eq!(rw.capture.len(), 1);
    assert_eq!(rw.saved.len(), 1);
}

#[test]
fn branches_known_skips_splitting() {
    let mut rw = Rewriter::new();
    rw.set_function(DIAMOND.as_ptr() as u64);
    rw.config_mut().branches_known = true;
    // the flags are unknown, but the option forces a single continuation
    // along the concrete flag values
    assert_ne!(rw.rewrite(&[0, 0]), 0);
    assert_eq!(rw.capture.len(), 1);
}

#[test]
fn revisited_blocks_are_not_reemitted() {
    // a loop with an unknown bound closes onto an existing block instead of
    // growing the pool every lap
    #[rustfmt::skip]
    let target = [
        0x31, 0xc0,                   // xor eax, eax
        0x31, 0xc9,                   // xor ecx, ecx
        0x48, 0x39, 0xf9,             // loop: cmp rcx, rdi
        0x7d, 0x05,                   // jge exit
        0x48, 0xff, 0xc1,             // inc rcx
        0xeb, 0xf6,                   // jmp loop
        0xc3,                         // exit: ret
    ];
    let mut rw = Rewriter::new();
    rw.set_function(target.as_ptr() as u64);
    assert_ne!(rw.rewrite(&[0]), 0);
    // the pool stays small: a peeled lap plus the steady-state lap and the
    // two exits, not one block per iteration
    assert!(rw.capture.len() <= 6, "loop unrolled: {} blocks", rw.capture.len());
}
