//! Standard IO slots and the redirect policy.
//!
//! The policy decides, per slot, whether the pipeline's visible end is
//! inherited from the parent, piped to a handler, or discarded:
//!
//! - input pipes unless inherited, even with no handler bound, so the
//!   launcher can close it and the child never blocks on a live stdin;
//! - output and error pipe only when a handler is bound, and are discarded
//!   otherwise so an unread pipe can never fill up and stall the child.

use std::fmt;
use std::process::Stdio;

/// One of the three standard streams at the pipeline's external ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    Stdin,
    Stdout,
    Stderr,
}

impl Slot {
    pub const ALL: [Self; 3] = [Self::Stdin, Self::Stdout, Self::Stderr];

    /// File descriptor number of the stream in the child.
    pub const fn fd(self) -> usize {
        match self {
            Self::Stdin => 0,
            Self::Stdout => 1,
            Self::Stderr => 2,
        }
    }

    /// The parent writes to this slot.
    pub const fn is_writeable(self) -> bool {
        matches!(self, Self::Stdin)
    }

    /// The parent reads from this slot.
    pub const fn is_readable(self) -> bool {
        !self.is_writeable()
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stdin => "stdin",
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Treatment chosen for a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Inherit,
    Pipe,
    Discard,
}

impl Disposition {
    pub fn to_stdio(self) -> Stdio {
        match self {
            Self::Inherit => Stdio::inherit(),
            Self::Pipe => Stdio::piped(),
            Self::Discard => Stdio::null(),
        }
    }
}

/// Decide the disposition of one slot.
pub const fn resolve(slot: Slot, inherit: bool, handler_bound: bool) -> Disposition {
    if inherit {
        return Disposition::Inherit;
    }
    match slot {
        Slot::Stdin => Disposition::Pipe,
        Slot::Stdout | Slot::Stderr => {
            if handler_bound {
                Disposition::Pipe
            } else {
                Disposition::Discard
            }
        }
    }
}

/// Per-slot inherit flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StdioPolicy {
    inherit: [bool; 3],
}

impl StdioPolicy {
    pub fn set_inherit(&mut self, slot: Slot, inherit: bool) {
        self.inherit[slot.fd()] = inherit;
    }

    pub const fn is_inherited(&self, slot: Slot) -> bool {
        self.inherit[slot.fd()]
    }

    pub const fn resolve(&self, slot: Slot, handler_bound: bool) -> Disposition {
        resolve(slot, self.is_inherited(slot), handler_bound)
    }

    /// Stderr treatment for stages other than the last: they follow the
    /// error slot's inherit flag and are discarded otherwise.
    pub const fn intermediate_stderr(&self) -> Disposition {
        if self.is_inherited(Slot::Stderr) {
            Disposition::Inherit
        } else {
            Disposition::Discard
        }
    }
}
