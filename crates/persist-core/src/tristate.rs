//! Three-valued flags for query options that fall back to a session default.

/// An option that is either explicitly on, explicitly off, or inherited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub enum TriState {
    /// Use whatever the enclosing scope (descriptor, session) says.
    #[default]
    Inherit,
    True,
    False,
}

impl TriState {
    /// Resolve against the inherited default.
    pub const fn resolve(self, default: bool) -> bool {
        match self {
            TriState::Inherit => default,
            TriState::True => true,
            TriState::False => false,
        }
    }

    /// `Some(bool)` when explicitly set.
    pub const fn explicit(self) -> Option<bool> {
        match self {
            TriState::Inherit => None,
            TriState::True => Some(true),
            TriState::False => Some(false),
        }
    }

    pub const fn is_inherit(self) -> bool {
        matches!(self, TriState::Inherit)
    }

    /// Layer `self` over `fallback`: an explicit value wins.
    pub const fn or(self, fallback: TriState) -> TriState {
        match self {
            TriState::Inherit => fallback,
            other => other,
        }
    }
}

impl From<bool> for TriState {
    fn from(value: bool) -> Self {
        if value { TriState::True } else { TriState::False }
    }
}

impl From<Option<bool>> for TriState {
    fn from(value: Option<bool>) -> Self {
        value.map_or(TriState::Inherit, TriState::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_values_win() {
        assert!(TriState::True.resolve(false));
        assert!(!TriState::False.resolve(true));
        assert!(TriState::Inherit.resolve(true));
        assert_eq!(TriState::Inherit.or(TriState::False), TriState::False);
        assert_eq!(TriState::True.or(TriState::False), TriState::True);
        assert_eq!(TriState::from(None), TriState::Inherit);
        assert_eq!(TriState::False.explicit(), Some(false));
    }
}
