//! Call handling: deep inlining, recursion cutoffs, kept calls and the
//! identity helpers.

#![cfg(all(target_arch = "x86_64", target_os = "linux"))]

use std::sync::atomic::{AtomicU64, Ordering};

use respin_asm::{Decoder, Instr, InstrKind, MAX_INSTR_LEN};
use respin_vm::{
    make_dynamic, make_static, CodeStorage, FcFlags, FunctionConfig, ParState, Rewriter,
};

fn decode_range(addr: u64, size: usize) -> Vec<Instr> {
    let bytes = unsafe { std::slice::from_raw_parts(addr as *const u8, size + MAX_INSTR_LEN) };
    let mut d = Decoder::new(bytes, addr);
    let mut out = Vec::new();
    while d.offset() < size {
        out.push(d.decode_next().expect("generated code re-decodes"));
    }
    out
}

unsafe fn call1(addr: u64, a: u64) -> u64 {
    let f: extern "C" fn(u64) -> u64 = std::mem::transmute(addr);
    f(a)
}

unsafe fn call0(addr: u64) -> u64 {
    let f: extern "C" fn() -> u64 = std::mem::transmute(addr);
    f()
}

/// `f(n) = n == 0 ? 0 : n + f(n - 1)`, self-recursive through an absolute
/// register call; the address of `f` is patched into its own body.
fn emit_sum_recursive(arena: &mut CodeStorage) -> u64 {
    let addr = arena.tip();
    #[rustfmt::skip]
    let mut code = vec![
        0x48, 0x85, 0xff,             // test rdi, rdi
        0x75, 0x03,                   // jne rec
        0x31, 0xc0,                   // xor eax, eax
        0xc3,                         // ret
        0x57,                         // rec: push rdi
        0x48, 0xff, 0xcf,             // dec rdi
        0x49, 0xbb,                   // mov r11, f
    ];
    code.extend_from_slice(&addr.to_le_bytes());
    code.extend_from_slice(&[
        0x41, 0xff, 0xd3, // call r11
        0x5f, // pop rdi
        0x48, 0x01, 0xf8, // add rax, rdi
        0xc3, // ret
    ]);
    arena.push(&code).expect("arena space")
}

/// A statically bounded recursion inlines away completely.
#[test]
fn static_recursion_inlines_to_a_constant() {
    let mut arena = CodeStorage::new(4096).unwrap();
    let f = emit_sum_recursive(&mut arena);

    let mut rw = Rewriter::new();
    rw.set_function(f);
    rw.config_mut().par_state[0] = Some(ParState::Known);
    let gen = rw.rewrite(&[5, 0]);
    assert_ne!(gen, 0);

    // 5 + 4 + 3 + 2 + 1
    assert_eq!(unsafe { call0(gen) }, 15);
    let bytes = unsafe { std::slice::from_raw_parts(gen as *const u8, rw.generated_size()) };
    assert_eq!(bytes, &[0xb8, 0x0f, 0x00, 0x00, 0x00, 0xc3]);
}

/// With a recursion bound, inlining stops and the remainder runs through a
/// literal call into the original function.
#[test]
fn recursion_cutoff_leaves_one_literal_call() {
    let mut arena = CodeStorage::new(4096).unwrap();
    let f = emit_sum_recursive(&mut arena);

    let mut rw = Rewriter::new();
    rw.set_function(f);
    rw.config_mut().par_state[0] = Some(ParState::Known);
    let mut fc = FunctionConfig::default();
    fc.max_rec_depth = 2;
    fc.par_count = 1;
    rw.config_mut().set_func(f, fc);

    let gen = rw.rewrite(&[5, 0]);
    assert_ne!(gen, 0);
    assert_eq!(unsafe { call0(gen) }, 15);

    let instrs = decode_range(gen, rw.generated_size());
    assert_eq!(
        instrs.iter().filter(|i| i.kind == InstrKind::Call).count(),
        1,
        "exactly the cutoff call survives: {instrs:#?}"
    );
}

static KEPT_CALLS: AtomicU64 = AtomicU64::new(0);

extern "C" fn observed_triple(x: u64) -> u64 {
    KEPT_CALLS.fetch_add(1, Ordering::SeqCst);
    x * 3
}

fn emit_call_helper(arena: &mut CodeStorage, helper: u64, arg: u32) -> u64 {
    let mut code = vec![0xbf]; // mov edi, arg
    code.extend_from_slice(&arg.to_le_bytes());
    code.extend_from_slice(&[0x49, 0xbb]); // mov r11, helper
    code.extend_from_slice(&helper.to_le_bytes());
    code.extend_from_slice(&[0x41, 0xff, 0xd3, 0xc3]); // call r11; ret
    arena.push(&code).expect("arena space")
}

/// A kept call is not invoked at rewrite time and survives into the
/// residual.
#[test]
fn keep_call_instr_defers_the_call() {
    let helper = observed_triple as extern "C" fn(u64) -> u64 as u64;
    let mut arena = CodeStorage::new(4096).unwrap();
    let target = emit_call_helper(&mut arena, helper, 7);

    let mut rw = Rewriter::new();
    rw.set_function(target);
    let mut fc = FunctionConfig::with_flags(FcFlags::KEEP_CALL_INSTR);
    fc.par_count = 1;
    rw.config_mut().set_func(helper, fc);

    KEPT_CALLS.store(0, Ordering::SeqCst);
    let gen = rw.rewrite(&[]);
    assert_ne!(gen, 0);
    assert_eq!(KEPT_CALLS.load(Ordering::SeqCst), 0, "kept calls must not run early");

    assert_eq!(unsafe { call0(gen) }, 21);
    assert_eq!(KEPT_CALLS.load(Ordering::SeqCst), 1);
}

/// A return-value hint overrides whatever the call produces.
#[test]
fn ret_value_hint_wins_over_the_callee() {
    let helper = observed_triple as extern "C" fn(u64) -> u64 as u64;
    let mut arena = CodeStorage::new(4096).unwrap();
    let target = emit_call_helper(&mut arena, helper, 7);

    let mut rw = Rewriter::new();
    rw.set_function(target);
    let mut fc = FunctionConfig::with_flags(
        FcFlags::KEEP_CALL_INSTR | FcFlags::SET_RET_KNOWN | FcFlags::RET_VALUE_HINT,
    );
    fc.par_count = 1;
    fc.ret_value = 100;
    rw.config_mut().set_func(helper, fc);

    KEPT_CALLS.store(0, Ordering::SeqCst);
    let gen = rw.rewrite(&[]);
    assert_ne!(gen, 0);
    // the call still happens for its side effects, but RAX is pinned
    assert_eq!(unsafe { call0(gen) }, 100);
    assert_eq!(KEPT_CALLS.load(Ordering::SeqCst), 1);
}

/// `make_dynamic` stops folding at its argument.
#[test]
fn make_dynamic_forces_residual_arithmetic() {
    let helper = make_dynamic as extern "C" fn(u64) -> u64 as u64;
    let mut arena = CodeStorage::new(4096).unwrap();
    // mov r11, make_dynamic; call r11; inc rax; ret
    let mut code = vec![0x49, 0xbb];
    code.extend_from_slice(&helper.to_le_bytes());
    code.extend_from_slice(&[0x41, 0xff, 0xd3, 0x48, 0xff, 0xc0, 0xc3]);
    let target = arena.push(&code).unwrap();

    let mut rw = Rewriter::new();
    rw.set_function(target);
    rw.config_mut().par_state[0] = Some(ParState::Known);
    let gen = rw.rewrite(&[41, 0]);
    assert_ne!(gen, 0);
    assert_eq!(unsafe { call0(gen) }, 42);

    // the increment is computed at runtime, not folded
    let instrs = decode_range(gen, rw.generated_size());
    assert!(instrs.iter().any(|i| i.kind == InstrKind::Inc), "{instrs:#?}");
}

/// `make_static` vouches for memory reached through its result; the load
/// folds without any registered range.
#[test]
fn make_static_makes_loads_viral() {
    static DATA: [u8; 1] = [0x2a];
    let helper = make_static as extern "C" fn(u64) -> u64 as u64;
    let mut arena = CodeStorage::new(4096).unwrap();
    // mov r11, make_static; call r11; movzx eax, byte [rax]; ret
    let mut code = vec![0x49, 0xbb];
    code.extend_from_slice(&helper.to_le_bytes());
    code.extend_from_slice(&[0x41, 0xff, 0xd3, 0x0f, 0xb6, 0x00, 0xc3]);
    let target = arena.push(&code).unwrap();

    let mut rw = Rewriter::new();
    rw.set_function(target);
    rw.config_mut().par_state[0] = Some(ParState::Known);
    let gen = rw.rewrite(&[DATA.as_ptr() as u64, 0]);
    assert_ne!(gen, 0);
    assert_eq!(unsafe { call0(gen) }, 0x2a);
    // no range was registered, yet the load folded to a constant
    let bytes = unsafe { std::slice::from_raw_parts(gen as *const u8, rw.generated_size()) };
    assert_eq!(bytes, &[0xb8, 0x2a, 0x00, 0x00, 0x00, 0xc3]);
}

/// `force_unknown` at depth 0 keeps results in the residual even when the
/// inputs are bound.
#[test]
fn force_unknown_disables_folding() {
    // lea rax, (rdi,rsi); ret
    let target = [0x48, 0x8d, 0x04, 0x37, 0xc3];
    let mut rw = Rewriter::new();
    rw.set_function(target.as_ptr() as u64);
    rw.config_mut().par_state[0] = Some(ParState::Known);
    rw.config_mut().par_state[1] = Some(ParState::Known);
    rw.config_mut().force_unknown[0] = true;
    let gen = rw.rewrite(&[19, 23]);
    assert_ne!(gen, 0);

    assert_eq!(unsafe { call1(gen, 0) }, 42);
    let instrs = decode_range(gen, rw.generated_size());
    assert!(
        instrs.iter().any(|i| i.kind == InstrKind::Lea),
        "the addition must stay in the residual: {instrs:#?}"
    );
}
