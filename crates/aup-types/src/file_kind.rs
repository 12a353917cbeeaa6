use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Role of a deployable file. Selection filters install only some roles.
///
/// The numeric values are part of the canonical object encoding.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum FileKind {
    #[default]
    Null = 0x00,
    /// Executables and shared libraries needed at run time.
    Runtime = 0x01,
    /// Data files read at run time.
    Resource = 0x02,
    /// Runtime dependency shipped alongside.
    Rdep = 0x03,
    Test = 0x11,
    /// Debug symbols.
    Debug = 0x12,
    /// Build-time dependency.
    Bdep = 0x21,
    Include = 0x22,
    Idl = 0x23,
    Cmm = 0x24,
    /// Source files.
    Src = 0x31,
}

impl FileKind {
    /// Every non-null kind, in encoding order.
    pub const ALL: [FileKind; 10] = [
        Self::Runtime,
        Self::Resource,
        Self::Rdep,
        Self::Test,
        Self::Debug,
        Self::Bdep,
        Self::Include,
        Self::Idl,
        Self::Cmm,
        Self::Src,
    ];

    /// Kinds required to run an installed product.
    pub const MINIMAL: [FileKind; 3] = [Self::Runtime, Self::Resource, Self::Rdep];

    /// The wire value.
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Decode a wire value. Unknown values yield `None`.
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0x00 => Self::Null,
            0x01 => Self::Runtime,
            0x02 => Self::Resource,
            0x03 => Self::Rdep,
            0x11 => Self::Test,
            0x12 => Self::Debug,
            0x21 => Self::Bdep,
            0x22 => Self::Include,
            0x23 => Self::Idl,
            0x24 => Self::Cmm,
            0x31 => Self::Src,
            _ => return None,
        })
    }

    /// Lowercase name used in configuration and logs.
    pub fn name(self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Runtime => "runtime",
            Self::Resource => "resource",
            Self::Rdep => "rdep",
            Self::Test => "test",
            Self::Debug => "debug",
            Self::Bdep => "bdep",
            Self::Include => "include",
            Self::Idl => "idl",
            Self::Cmm => "cmm",
            Self::Src => "src",
        }
    }
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for FileKind {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        std::iter::once(Self::Null)
            .chain(Self::ALL)
            .find(|kind| kind.name() == s)
            .ok_or_else(|| TypeError::UnknownFileKind(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_values_are_stable() {
        assert_eq!(FileKind::Null.as_u8(), 0x00);
        assert_eq!(FileKind::Rdep.as_u8(), 0x03);
        assert_eq!(FileKind::Debug.as_u8(), 0x12);
        assert_eq!(FileKind::Cmm.as_u8(), 0x24);
        assert_eq!(FileKind::Src.as_u8(), 0x31);
    }

    #[test]
    fn from_u8_inverts_as_u8() {
        for kind in FileKind::ALL {
            assert_eq!(FileKind::from_u8(kind.as_u8()), Some(kind));
        }
        assert_eq!(FileKind::from_u8(0x04), None);
        assert_eq!(FileKind::from_u8(0xff), None);
    }

    #[test]
    fn parse_by_name() {
        assert_eq!("runtime".parse::<FileKind>().unwrap(), FileKind::Runtime);
        assert_eq!("src".parse::<FileKind>().unwrap(), FileKind::Src);
        assert!(matches!(
            "binary".parse::<FileKind>(),
            Err(TypeError::UnknownFileKind(_))
        ));
    }

    #[test]
    fn minimal_is_subset_of_all() {
        for kind in FileKind::MINIMAL {
            assert!(FileKind::ALL.contains(&kind));
        }
    }
}
