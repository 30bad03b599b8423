//! Classification label to actuator command mapping.
//!
//! The mapping is a closed table: exact string equality, no trimming, no case
//! folding. Anything not in the table maps to no command at all.

use std::fmt;

/// Single-character command understood by the sorting mechanism.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ActuatorCommand {
    /// `R`
    Ripe,
    /// `U`
    Unripe,
    /// `M`
    Mold,
}

impl ActuatorCommand {
    /// Wire character sent on the serial link.
    pub fn as_char(self) -> char {
        match self {
            Self::Ripe => 'R',
            Self::Unripe => 'U',
            Self::Mold => 'M',
        }
    }

    /// Full serial payload: the command character and a newline.
    pub fn wire_bytes(self) -> [u8; 2] {
        [self.as_char() as u8, b'\n']
    }
}

impl fmt::Display for ActuatorCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

/// Label table. Adding a class means adding a row.
pub const LABEL_TABLE: &[(&str, ActuatorCommand)] = &[
    ("ripe", ActuatorCommand::Ripe),
    ("unripe", ActuatorCommand::Unripe),
    ("half_ripe", ActuatorCommand::Unripe),
    ("mold", ActuatorCommand::Mold),
    ("rotten", ActuatorCommand::Mold),
];

/// Map a received label to its command. `None` is the no-op sentinel.
pub fn map_label(label: &str) -> Option<ActuatorCommand> {
    LABEL_TABLE
        .iter()
        .find(|(known, _)| *known == label)
        .map(|(_, command)| *command)
}
