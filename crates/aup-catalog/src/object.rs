use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use aup_types::{FileKind, Oid};

use crate::codec::{Decoder, Encoder};
use crate::error::{CatalogError, CatalogResult};

/// Discriminant of a catalog object. The value is the encoded type tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum ObjectType {
    File = 1,
    Unit = 2,
    Release = 3,
}

impl ObjectType {
    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Self::File),
            2 => Some(Self::Unit),
            3 => Some(Self::Release),
            _ => None,
        }
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File => write!(f, "file"),
            Self::Unit => write!(f, "unit"),
            Self::Release => write!(f, "release"),
        }
    }
}

impl FromStr for ObjectType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "file" => Ok(Self::File),
            "unit" => Ok(Self::Unit),
            "release" => Ok(Self::Release),
            other => Err(format!("unknown object type: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// File
// ---------------------------------------------------------------------------

/// One file to materialize under the target root.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct File {
    pub dependencies: BTreeSet<Oid>,
    pub kind: FileKind,
    /// Path relative to the target root, `/`-separated.
    pub path: String,
    /// Permission bits applied after writing.
    pub perms: u16,
    /// Byte length of the content blob.
    pub size: u64,
    /// Oid of the content blob in storage.
    pub content: Oid,
}

// ---------------------------------------------------------------------------
// Unit
// ---------------------------------------------------------------------------

/// A named group of files (its dependencies) plus paths under the target
/// root that may exist without being reported as extra.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct Unit {
    pub dependencies: BTreeSet<Oid>,
    pub name: String,
    /// Glob patterns matched against root-relative paths.
    pub extra_allowed: BTreeSet<String>,
}

// ---------------------------------------------------------------------------
// Release
// ---------------------------------------------------------------------------

/// A signed snapshot of a product build. Dependencies are its units.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Release {
    pub dependencies: BTreeSet<Oid>,
    pub src_branch: String,
    pub src_revision: String,
    /// Source timestamp, seconds since the Unix epoch.
    pub src_moment: u64,
    pub platform_os: String,
    pub platform_arch: String,
    pub compiler: String,
    pub compiler_version: String,
    pub compiler_optimization: String,
    pub provider: String,
    pub stability: u32,
    /// Ed25519 public key of the producer.
    pub signer: [u8; 32],
    /// Ed25519 signature over [`Release::signing_digest`].
    pub signature: [u8; 64],
}

impl Default for Release {
    fn default() -> Self {
        Self {
            dependencies: BTreeSet::new(),
            src_branch: String::new(),
            src_revision: String::new(),
            src_moment: 0,
            platform_os: String::new(),
            platform_arch: String::new(),
            compiler: String::new(),
            compiler_version: String::new(),
            compiler_optimization: String::new(),
            provider: String::new(),
            stability: 0,
            signer: [0u8; 32],
            signature: [0u8; 64],
        }
    }
}

// ---------------------------------------------------------------------------
// Object
// ---------------------------------------------------------------------------

/// A catalog object. The variant set is closed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Object {
    File(File),
    Unit(Unit),
    Release(Release),
}

impl Object {
    pub fn object_type(&self) -> ObjectType {
        match self {
            Self::File(_) => ObjectType::File,
            Self::Unit(_) => ObjectType::Unit,
            Self::Release(_) => ObjectType::Release,
        }
    }

    /// Oids this object references.
    pub fn dependencies(&self) -> &BTreeSet<Oid> {
        match self {
            Self::File(f) => &f.dependencies,
            Self::Unit(u) => &u.dependencies,
            Self::Release(r) => &r.dependencies,
        }
    }

    pub fn dependencies_mut(&mut self) -> &mut BTreeSet<Oid> {
        match self {
            Self::File(f) => &mut f.dependencies,
            Self::Unit(u) => &mut u.dependencies,
            Self::Release(r) => &mut r.dependencies,
        }
    }

    pub fn as_file(&self) -> Option<&File> {
        match self {
            Self::File(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_unit(&self) -> Option<&Unit> {
        match self {
            Self::Unit(u) => Some(u),
            _ => None,
        }
    }

    pub fn as_release(&self) -> Option<&Release> {
        match self {
            Self::Release(r) => Some(r),
            _ => None,
        }
    }

    /// Canonical bytes of this object. Its Oid is the digest of these bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        self.encode_into(&mut enc);
        enc.into_inner()
    }

    /// Content identifier: BLAKE3 of [`Object::encode`].
    pub fn identify(&self) -> Oid {
        aup_crypto::identify(&self.encode())
    }

    /// Decode exactly one object; trailing bytes are corruption.
    pub fn decode(bytes: &[u8]) -> CatalogResult<Self> {
        let mut dec = Decoder::new(bytes);
        let object = Self::decode_from(&mut dec)?;
        if !dec.is_empty() {
            return Err(CatalogError::corrupted(format!(
                "{} trailing bytes after object",
                bytes.len() - dec.position()
            )));
        }
        Ok(object)
    }

    pub(crate) fn encode_into(&self, enc: &mut Encoder) {
        enc.u8(self.object_type().tag());
        enc.oid_set(self.dependencies());
        match self {
            Self::File(f) => {
                enc.u8(f.kind.as_u8());
                enc.str(&f.path);
                enc.u16(f.perms);
                enc.varint(f.size);
                enc.oid(&f.content);
            }
            Self::Unit(u) => {
                enc.str(&u.name);
                enc.str_set(&u.extra_allowed);
            }
            Self::Release(r) => {
                enc.str(&r.src_branch);
                enc.str(&r.src_revision);
                enc.varint(r.src_moment);
                enc.str(&r.platform_os);
                enc.str(&r.platform_arch);
                enc.str(&r.compiler);
                enc.str(&r.compiler_version);
                enc.str(&r.compiler_optimization);
                enc.str(&r.provider);
                enc.varint(r.stability as u64);
                enc.raw(&r.signer);
                enc.raw(&r.signature);
            }
        }
    }

    pub(crate) fn decode_from(dec: &mut Decoder<'_>) -> CatalogResult<Self> {
        let tag = dec.u8()?;
        let object_type =
            ObjectType::from_tag(tag).ok_or(CatalogError::UnknownObjectType(tag))?;
        let dependencies = dec.oid_set()?;
        Ok(match object_type {
            ObjectType::File => {
                let kind_byte = dec.u8()?;
                let kind = FileKind::from_u8(kind_byte).ok_or_else(|| {
                    CatalogError::corrupted(format!("unknown file kind {kind_byte:#04x}"))
                })?;
                Self::File(File {
                    dependencies,
                    kind,
                    path: dec.str()?,
                    perms: dec.u16()?,
                    size: dec.varint()?,
                    content: dec.oid()?,
                })
            }
            ObjectType::Unit => Self::Unit(Unit {
                dependencies,
                name: dec.str()?,
                extra_allowed: dec.str_set()?,
            }),
            ObjectType::Release => Self::Release(Release {
                dependencies,
                src_branch: dec.str()?,
                src_revision: dec.str()?,
                src_moment: dec.varint()?,
                platform_os: dec.str()?,
                platform_arch: dec.str()?,
                compiler: dec.str()?,
                compiler_version: dec.str()?,
                compiler_optimization: dec.str()?,
                provider: dec.str()?,
                stability: u32::try_from(dec.varint()?)
                    .map_err(|_| CatalogError::corrupted("stability out of range"))?,
                signer: dec.array::<32>()?,
                signature: dec.array::<64>()?,
            }),
        })
    }
}

impl From<File> for Object {
    fn from(file: File) -> Self {
        Self::File(file)
    }
}

impl From<Unit> for Object {
    fn from(unit: Unit) -> Self {
        Self::Unit(unit)
    }
}

impl From<Release> for Object {
    fn from(release: Release) -> Self {
        Self::Release(release)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_file() -> File {
        File {
            kind: FileKind::Runtime,
            path: "bin/app".into(),
            perms: 0o755,
            size: 5,
            content: aup_crypto::identify(b"hello"),
            ..Default::default()
        }
    }

    #[test]
    fn file_encoding_layout() {
        let bytes = Object::from(sample_file()).encode();
        // tag, empty dependency set, kind, path length
        assert_eq!(&bytes[..4], &[1, 0, 0x01, 7]);
        assert_eq!(&bytes[4..11], b"bin/app");
        assert_eq!(&bytes[11..13], &0o755u16.to_le_bytes());
        assert_eq!(bytes[13], 5);
        assert_eq!(bytes.len(), 14 + 32);
    }

    #[test]
    fn decode_inverts_encode_for_each_variant() {
        let unit = Unit {
            dependencies: [Oid::from_hash([1; 32])].into_iter().collect(),
            name: "core".into(),
            extra_allowed: ["var/*".to_string()].into_iter().collect(),
        };
        let release = Release {
            src_branch: "main".into(),
            src_moment: 1_700_000_000,
            stability: 3,
            signer: [9; 32],
            signature: [8; 64],
            ..Default::default()
        };
        for object in [
            Object::from(sample_file()),
            Object::from(unit),
            Object::from(release),
        ] {
            assert_eq!(Object::decode(&object.encode()).unwrap(), object);
        }
    }

    #[test]
    fn identity_ignores_dependency_insertion_order() {
        let a = Oid::from_hash([1; 32]);
        let b = Oid::from_hash([2; 32]);
        let mut u1 = Unit::default();
        u1.dependencies.insert(a);
        u1.dependencies.insert(b);
        let mut u2 = Unit::default();
        u2.dependencies.insert(b);
        u2.dependencies.insert(a);
        assert_eq!(Object::from(u1).identify(), Object::from(u2).identify());
    }

    #[test]
    fn identity_depends_on_every_field() {
        let base = Object::from(sample_file()).identify();
        let mut other = sample_file();
        other.perms = 0o644;
        assert_ne!(Object::from(other).identify(), base);
    }

    #[test]
    fn unknown_tag_is_reported() {
        assert_eq!(
            Object::decode(&[9, 0]),
            Err(CatalogError::UnknownObjectType(9))
        );
    }

    #[test]
    fn trailing_bytes_are_corruption() {
        let mut bytes = Object::from(Unit::default()).encode();
        bytes.push(0);
        assert!(matches!(
            Object::decode(&bytes),
            Err(CatalogError::Corrupted(_))
        ));
    }

    #[test]
    fn truncation_is_corruption() {
        let bytes = Object::from(sample_file()).encode();
        assert!(matches!(
            Object::decode(&bytes[..bytes.len() - 1]),
            Err(CatalogError::Corrupted(_))
        ));
    }

    #[test]
    fn type_names_parse() {
        assert_eq!("release".parse::<ObjectType>(), Ok(ObjectType::Release));
        assert_eq!(ObjectType::Unit.to_string(), "unit");
        assert!("blob".parse::<ObjectType>().is_err());
    }
}
