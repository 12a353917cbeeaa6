use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

/// Permitted corrective actions and verbosity of one applier run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Task(u64);

impl Task {
    pub const NULL: Self = Self(0);
    /// Log corrective actions at `info`.
    pub const VERBOSE_MAJOR: Self = Self(0x1);
    /// Log individual findings at `info`.
    pub const VERBOSE_MINOR: Self = Self(0x2);
    pub const VERBOSE: Self = Self(0x3);
    /// Re-hash every needed blob instead of checking presence.
    pub const CHECK_STORAGE: Self = Self(0x4);
    pub const REMOVE_WRONGS: Self = Self(0x10);
    pub const EMPLACE_MISSINGS: Self = Self(0x20);
    pub const EMPLACE_CHANGES: Self = Self(0x40);
    pub const REMOVE_EXTRA: Self = Self(0x80);
    pub const ALL: Self = Self(!0);

    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    /// All bits of `other` are set.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for Task {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for Task {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// What an applier run found and fixed, as a bit set.
///
/// The low nibble holds readiness failures (the run stopped before writing),
/// the next holds unfixed drift, and the third holds applied fixes. Zero
/// means the target already matched.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Outcome(u64);

impl Outcome {
    pub const OK: Self = Self(0);
    pub const CORRUPTED_CATALOG: Self = Self(0x01);
    pub const AMBIGUOUS_CATALOG: Self = Self(0x02);
    pub const INCOMPLETE_CATALOG: Self = Self(0x04);
    pub const INCOMPLETE_STORAGE: Self = Self(0x08);
    pub const SOME_FAILED: Self = Self(0x0f);
    pub const EXISTS_MISSING: Self = Self(0x10);
    pub const EXISTS_CHANGED: Self = Self(0x20);
    pub const EXISTS_EXTRA: Self = Self(0x40);
    pub const EXISTS_WRONG: Self = Self(0x80);
    pub const SOME_WRONG: Self = Self(0xf0);
    pub const FIXED_MISSING: Self = Self(0x100);
    pub const FIXED_CHANGED: Self = Self(0x200);
    pub const FIXED_EXTRA: Self = Self(0x400);

    const NAMES: [(Self, &'static str); 11] = [
        (Self::CORRUPTED_CATALOG, "corrupted-catalog"),
        (Self::AMBIGUOUS_CATALOG, "ambiguous-catalog"),
        (Self::INCOMPLETE_CATALOG, "incomplete-catalog"),
        (Self::INCOMPLETE_STORAGE, "incomplete-storage"),
        (Self::EXISTS_MISSING, "exists-missing"),
        (Self::EXISTS_CHANGED, "exists-changed"),
        (Self::EXISTS_EXTRA, "exists-extra"),
        (Self::EXISTS_WRONG, "exists-wrong"),
        (Self::FIXED_MISSING, "fixed-missing"),
        (Self::FIXED_CHANGED, "fixed-changed"),
        (Self::FIXED_EXTRA, "fixed-extra"),
    ];

    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub const fn is_ok(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// A readiness failure stopped the run.
    pub const fn failed(self) -> bool {
        self.intersects(Self::SOME_FAILED)
    }

    /// The target matches the ideal tree: nothing failed and no drift is
    /// left unfixed.
    pub const fn is_clean(self) -> bool {
        !self.intersects(Self(Self::SOME_FAILED.0 | Self::SOME_WRONG.0))
    }

    /// Names of the set flags.
    pub fn names(self) -> Vec<&'static str> {
        Self::NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect()
    }
}

impl BitOr for Outcome {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for Outcome {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Outcome {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ok() {
            return write!(f, "ok");
        }
        write!(f, "{}", self.names().join("|"))
    }
}

impl fmt::Debug for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Outcome({:#x}: {self})", self.0)
    }
}
