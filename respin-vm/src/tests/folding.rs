//! Constant-folding and residual-emission properties.

use respin_asm::{Decoder, Instr, InstrKind, MAX_INSTR_LEN};

use crate::Rewriter;

fn decode_generated(rw: &Rewriter) -> Vec<Instr> {
    let (addr, size) = (rw.generated_code(), rw.generated_size());
    assert_ne!(addr, 0);
    let bytes = unsafe { core::slice::from_raw_parts(addr as *const u8, size + MAX_INSTR_LEN) };
    let mut d = Decoder::new(bytes, addr);
    let mut out = Vec::new();
    while d.offset() < size {
        out.push(d.decode_next().expect("generated code re-decodes"));
    }
    out
}

unsafe fn call1(addr: u64, a: u64) -> u64 {
    let f: extern "C" fn(u64) -> u64 = core::mem::transmute(addr);
    f(a)
}

#[test]
fn xor_self_forces_zero_even_over_unknown_input() {
    // mov rax, rdi; xor rax, rax; ret
    let target = [0x48, 0x89, 0xf8, 0x48, 0x31, 0xc0, 0xc3];
    let mut rw = Rewriter::new();
    rw.set_function(target.as_ptr() as u64);
    let gen = rw.rewrite(&[0]);
    assert_ne!(gen, 0);
    assert_eq!(unsafe { call1(gen, 12345) }, 0);

    // the zero is materialized as a fresh xor, not carried through the
    // dynamic input
    let instrs = decode_generated(&rw);
    let xor = instrs
        .iter()
        .find(|i| i.kind == InstrKind::Xor)
        .expect("zero idiom");
    assert_eq!(xor.dst, xor.src);
}

#[test]
fn known_noop_arithmetic_emits_nothing() {
    // add rdi, 0; or rdi, 0; and rdi, -1; shl rdi, 0; mov rax, rdi; ret
    #[rustfmt::skip]
    let target = [
        0x48, 0x83, 0xc7, 0x00,       // add rdi, 0
        0x48, 0x83, 0xcf, 0x00,       // or rdi, 0
        0x48, 0x83, 0xe7, 0xff,       // and rdi, -1
        0x48, 0xc1, 0xe7, 0x00,       // shl rdi, 0
        0x48, 0x89, 0xf8,             // mov rax, rdi
        0xc3,                         // ret
    ];
    let mut rw = Rewriter::new();
    rw.set_function(target.as_ptr() as u64);
    let gen = rw.rewrite(&[0]);
    assert_ne!(gen, 0);
    assert_eq!(unsafe { call1(gen, 7) }, 7);

    let instrs = decode_generated(&rw);
    assert!(
        instrs
            .iter()
            .all(|i| matches!(i.kind, InstrKind::Mov | InstrKind::Ret)),
        "no-op arithmetic leaked into the residual: {instrs:#?}"
    );
}

#[test]
fn fully_dynamic_instruction_reemits_verbatim() {
    // add rdi, rsi; mov rax, rdi; ret, everything unknown
    let target = [0x48, 0x01, 0xf7, 0x48, 0x89, 0xf8, 0xc3];
    let mut rw = Rewriter::new();
    rw.set_function(target.as_ptr() as u64);
    let gen = rw.rewrite(&[0, 0]);
    assert_ne!(gen, 0);

    let instrs = decode_generated(&rw);
    assert_eq!(instrs.len(), 3);
    assert_eq!(instrs[0].kind, InstrKind::Add);
    // byte-for-byte identical to the source instruction
    let bytes = unsafe { core::slice::from_raw_parts(gen as *const u8, 3) };
    assert_eq!(bytes, &target[..3]);
}

#[test]
fn imul_by_known_one_is_elided() {
    // imul rdi, rax with rax = 1: mov eax, 1; imul rdi, rax; mov rax, rdi; ret
    #[rustfmt::skip]
    let target = [
        0xb8, 0x01, 0x00, 0x00, 0x00, // mov eax, 1
        0x48, 0x0f, 0xaf, 0xf8,       // imul rdi, rax
        0x48, 0x89, 0xf8,             // mov rax, rdi
        0xc3,                         // ret
    ];
    let mut rw = Rewriter::new();
    rw.set_function(target.as_ptr() as u64);
    let gen = rw.rewrite(&[0]);
    assert_ne!(gen, 0);
    assert_eq!(unsafe { call1(gen, 9) }, 9);

    let instrs = decode_generated(&rw);
    assert_eq!(
        instrs.iter().filter(|i| i.kind == InstrKind::Imul).count(),
        0,
        "multiply by one survived"
    );
}
