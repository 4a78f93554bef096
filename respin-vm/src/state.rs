//! Capture states: per-location knowledge about a value at rewrite time.

/// What the rewriter knows about one storage cell (register, flag or stack
/// byte).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CaptureState {
    /// Uninitialized.
    #[default]
    Dead,
    /// Unknown at rewrite time; must exist in the residual code.
    Dynamic,
    /// Value known at rewrite time; may be folded away.
    Static,
    /// Known and viral: values loaded through a `Static2` pointer are
    /// `Static2` themselves.
    Static2,
    /// Value equals the stack anchor plus a known offset. Behaves like a
    /// known value for address arithmetic and sameness checks within one
    /// rewriting run, but can never be materialized as an immediate.
    StackRel,
}

impl CaptureState {
    /// Whether the concrete value attached to this state is meaningful at
    /// rewrite time.
    pub const fn is_known(self) -> bool {
        matches!(
            self,
            CaptureState::Static | CaptureState::Static2 | CaptureState::StackRel
        )
    }

    /// Whether this is one of the plain-known states that may be folded into
    /// an immediate.
    pub const fn is_imm_foldable(self) -> bool {
        matches!(self, CaptureState::Static | CaptureState::Static2)
    }

    /// Combine the states of two operands feeding one result.
    ///
    /// `same_value` reports whether both operands carry the same concrete
    /// value, which is what keeps stack-relative sameness transitive.
    pub fn combine(s1: CaptureState, s2: CaptureState, same_value: bool) -> CaptureState {
        use CaptureState::*;
        match (s1, s2) {
            (Dead, _) | (_, Dead) => Dead,
            (Static2, Static) | (Static, Static2) | (Static2, Static2) => Static2,
            (Static, Static) => Static,
            (StackRel, Static) | (Static, StackRel) | (StackRel, Static2)
            | (Static2, StackRel) => StackRel,
            (StackRel, StackRel) if same_value => StackRel,
            _ => Dynamic,
        }
    }

    /// Flags never hold addresses or viral pointers; demote to the plain
    /// forms.
    pub fn demote_for_flags(self) -> CaptureState {
        match self {
            CaptureState::Static2 | CaptureState::StackRel => CaptureState::Static,
            other => other,
        }
    }
}

/// A tracked value: concrete bits plus what we know about them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CapVal {
    /// Concrete value, meaningful when `state.is_known()`.
    pub val: u64,
    /// Knowledge about the value.
    pub state: CaptureState,
}

impl CapVal {
    /// Uninitialized cell.
    pub const fn dead() -> Self {
        Self {
            val: 0,
            state: CaptureState::Dead,
        }
    }

    /// Unknown value.
    pub const fn dynamic() -> Self {
        Self {
            val: 0,
            state: CaptureState::Dynamic,
        }
    }

    /// Known value.
    pub const fn known(val: u64) -> Self {
        Self {
            val,
            state: CaptureState::Static,
        }
    }

    /// Known viral value.
    pub const fn known_viral(val: u64) -> Self {
        Self {
            val,
            state: CaptureState::Static2,
        }
    }

    /// Stack-anchored value.
    pub const fn stack_rel(val: u64) -> Self {
        Self {
            val,
            state: CaptureState::StackRel,
        }
    }

    /// A value with an explicit state.
    pub const fn with_state(val: u64, state: CaptureState) -> Self {
        Self { val, state }
    }
}

#[cfg(test)]
mod tests {
    use super::CaptureState::*;
    use super::*;

    #[test]
    fn dead_poisons() {
        for s in [Dead, Dynamic, Static, Static2, StackRel] {
            assert_eq!(CaptureState::combine(Dead, s, false), Dead);
            assert_eq!(CaptureState::combine(s, Dead, true), Dead);
        }
    }

    #[test]
    fn static2_is_viral_over_static() {
        assert_eq!(CaptureState::combine(Static2, Static, false), Static2);
        assert_eq!(CaptureState::combine(Static, Static2, false), Static2);
        assert_eq!(CaptureState::combine(Static, Static, false), Static);
    }

    #[test]
    fn stack_relative_address_arithmetic() {
        assert_eq!(CaptureState::combine(StackRel, Static, false), StackRel);
        assert_eq!(CaptureState::combine(Static2, StackRel, false), StackRel);
        assert_eq!(CaptureState::combine(StackRel, StackRel, true), StackRel);
        assert_eq!(CaptureState::combine(StackRel, StackRel, false), Dynamic);
    }

    #[test]
    fn dynamic_wins_over_known() {
        assert_eq!(CaptureState::combine(Dynamic, Static, false), Dynamic);
        assert_eq!(CaptureState::combine(StackRel, Dynamic, true), Dynamic);
        assert_eq!(CaptureState::combine(Dynamic, Dynamic, true), Dynamic);
    }

    #[test]
    fn flag_demotion() {
        assert_eq!(Static2.demote_for_flags(), Static);
        assert_eq!(StackRel.demote_for_flags(), Static);
        assert_eq!(Dynamic.demote_for_flags(), Dynamic);
        assert_eq!(Dead.demote_for_flags(), Dead);
    }
}
