//! Specialize a tiny function against a fixed first argument and compare
//! the residual against the original.
//!
//! ```sh
//! cargo run --example specialize
//! ```

use respin_vm::{ParState, Rewriter, RwResult};

fn main() -> RwResult<()> {
    // f(a, b) = a + b, hand-assembled so the example does not depend on
    // rustc codegen:
    //   lea rax, (rdi,rsi)
    //   ret
    let target: [u8; 5] = [0x48, 0x8d, 0x04, 0x37, 0xc3];

    let mut rw = Rewriter::new();
    rw.set_function(target.as_ptr() as u64);

    println!("original:");
    println!("{}", rw.decode_print(target.as_ptr() as u64, target.len())?);

    // bind a = 100, leave b free
    rw.config_mut().par_state[0] = Some(ParState::Known);
    rw.config_mut().par_name[0] = Some("a".into());
    let spec = rw.try_rewrite(&[100, 0])?;

    println!("\nspecialized for a = 100 ({} bytes):", rw.generated_size());
    println!("{}", rw.decode_print(spec, rw.generated_size())?);

    let f: extern "C" fn(u64, u64) -> u64 = unsafe { std::mem::transmute(spec) };
    for b in [1u64, 2, 3] {
        println!("\nf(100, {b}) = {}", f(0, b));
    }
    Ok(())
}
