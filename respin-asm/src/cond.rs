//! Condition flags and condition codes.

use bitflags::bitflags;

/// One of the five tracked arithmetic flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::EnumIter)]
#[repr(u8)]
pub enum Flag {
    /// Zero flag.
    Zf = 0,
    /// Carry flag.
    Cf = 1,
    /// Sign flag.
    Sf = 2,
    /// Overflow flag.
    Of = 3,
    /// Parity flag.
    Pf = 4,
}

/// Number of tracked flags.
pub const FLAG_COUNT: usize = 5;

impl Flag {
    /// Slot index of the flag in flag arrays.
    pub const fn index(self) -> usize {
        self as usize
    }
}

bitflags! {
    /// A set of arithmetic flags, used to describe what a condition reads
    /// and what an instruction writes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FlagSet: u8 {
        /// Zero flag.
        const ZF = 1 << 0;
        /// Carry flag.
        const CF = 1 << 1;
        /// Sign flag.
        const SF = 1 << 2;
        /// Overflow flag.
        const OF = 1 << 3;
        /// Parity flag.
        const PF = 1 << 4;
    }
}

impl FlagSet {
    /// All five arithmetic flags.
    pub const ARITH: FlagSet = FlagSet::all();

    /// Iterate the member flags.
    pub fn iter_flags(self) -> impl Iterator<Item = Flag> {
        use strum::IntoEnumIterator;
        Flag::iter().filter(move |f| self.contains(FlagSet::from_flag(*f)))
    }

    /// Singleton set for one flag.
    pub const fn from_flag(flag: Flag) -> FlagSet {
        match flag {
            Flag::Zf => FlagSet::ZF,
            Flag::Cf => FlagSet::CF,
            Flag::Sf => FlagSet::SF,
            Flag::Of => FlagSet::OF,
            Flag::Pf => FlagSet::PF,
        }
    }
}

/// x86 condition code, in encoding order: the low nibble of a `Jcc`/`SETcc`/
/// `CMOVcc` opcode selects the member within the 16-wide family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::EnumIter, strum::FromRepr)]
#[repr(u8)]
#[allow(missing_docs)] // the variants are the architecture's names
pub enum Cond {
    O = 0,
    No = 1,
    B = 2,
    Ae = 3,
    E = 4,
    Ne = 5,
    Be = 6,
    A = 7,
    S = 8,
    Ns = 9,
    P = 10,
    Np = 11,
    L = 12,
    Ge = 13,
    Le = 14,
    G = 15,
}

impl Cond {
    /// The flags this condition reads.
    pub const fn flags_read(self) -> FlagSet {
        match self {
            Cond::O | Cond::No => FlagSet::OF,
            Cond::B | Cond::Ae => FlagSet::CF,
            Cond::E | Cond::Ne => FlagSet::ZF,
            Cond::Be | Cond::A => FlagSet::CF.union(FlagSet::ZF),
            Cond::S | Cond::Ns => FlagSet::SF,
            Cond::P | Cond::Np => FlagSet::PF,
            Cond::L | Cond::Ge => FlagSet::SF.union(FlagSet::OF),
            Cond::Le | Cond::G => FlagSet::SF.union(FlagSet::OF).union(FlagSet::ZF),
        }
    }

    /// The opposite condition (flips the low encoding bit).
    pub fn invert(self) -> Cond {
        Cond::from_repr(self as u8 ^ 1).expect("nibble stays in range")
    }

    /// Evaluate the condition over concrete flag values.
    pub fn eval(self, flags: impl Fn(Flag) -> bool) -> bool {
        let zf = flags(Flag::Zf);
        let cf = flags(Flag::Cf);
        let sf = flags(Flag::Sf);
        let of = flags(Flag::Of);
        let pf = flags(Flag::Pf);
        match self {
            Cond::O => of,
            Cond::No => !of,
            Cond::B => cf,
            Cond::Ae => !cf,
            Cond::E => zf,
            Cond::Ne => !zf,
            Cond::Be => cf || zf,
            Cond::A => !cf && !zf,
            Cond::S => sf,
            Cond::Ns => !sf,
            Cond::P => pf,
            Cond::Np => !pf,
            Cond::L => sf != of,
            Cond::Ge => sf == of,
            Cond::Le => zf || sf != of,
            Cond::G => !zf && sf == of,
        }
    }

    /// Lowercase mnemonic suffix ("e", "ne", ...).
    pub const fn suffix(self) -> &'static str {
        match self {
            Cond::O => "o",
            Cond::No => "no",
            Cond::B => "b",
            Cond::Ae => "ae",
            Cond::E => "e",
            Cond::Ne => "ne",
            Cond::Be => "be",
            Cond::A => "a",
            Cond::S => "s",
            Cond::Ns => "ns",
            Cond::P => "p",
            Cond::Np => "np",
            Cond::L => "l",
            Cond::Ge => "ge",
            Cond::Le => "le",
            Cond::G => "g",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn invert_flips_low_bit() {
        for c in Cond::iter() {
            assert_eq!(c.invert() as u8, c as u8 ^ 1);
            assert_eq!(c.invert().invert(), c);
        }
    }

    #[test]
    fn inverted_condition_negates_eval() {
        // every combination of the five flags
        for bits in 0u8..32 {
            let read = |f: Flag| bits & (1 << f.index()) != 0;
            for c in Cond::iter() {
                assert_eq!(c.eval(read), !c.invert().eval(read), "{c:?} bits {bits:05b}");
            }
        }
    }

    #[test]
    fn signed_compare_conditions() {
        // after cmp 3, 5 (3 - 5): SF != OF, ZF clear
        let read = |f: Flag| matches!(f, Flag::Sf | Flag::Cf);
        assert!(Cond::L.eval(read));
        assert!(Cond::Le.eval(read));
        assert!(!Cond::Ge.eval(read));
        assert!(!Cond::G.eval(read));
    }
}
