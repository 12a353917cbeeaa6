use std::collections::{BTreeMap, BTreeSet};

use aup_types::Oid;
use tracing::{debug, warn};

use crate::codec::{Decoder, Encoder, CATALOG_MAGIC};
use crate::error::{CatalogError, CatalogResult};
use crate::object::{Object, ObjectType};

const DIGEST_LEN: usize = 32;

/// In-memory set of objects keyed by their identity.
///
/// Every entry satisfies `oid == object.identify()`: objects enter only
/// through [`Catalog::put`] or a verified import.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Catalog {
    objects: BTreeMap<Oid, Object>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a serialized catalog into a fresh instance.
    pub fn from_bytes(bytes: &[u8]) -> CatalogResult<Self> {
        let mut catalog = Self::new();
        catalog.deserialize(bytes)?;
        Ok(catalog)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn clear(&mut self) {
        self.objects.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Oid, &Object)> {
        self.objects.iter()
    }

    // -----------------------------------------------------------------------
    // Object access
    // -----------------------------------------------------------------------

    /// Store an object under its identity. Idempotent.
    pub fn put(&mut self, object: Object) -> Oid {
        let oid = object.identify();
        self.objects.entry(oid).or_insert(object);
        oid
    }

    pub fn has(&self, oid: &Oid) -> bool {
        self.objects.contains_key(oid)
    }

    /// Owned copy of an object; mutating it never affects the catalog.
    pub fn get(&self, oid: &Oid) -> Option<Object> {
        self.objects.get(oid).cloned()
    }

    /// Borrowed view of an object.
    pub fn get_ref(&self, oid: &Oid) -> Option<&Object> {
        self.objects.get(oid)
    }

    pub fn del(&mut self, oid: &Oid) -> bool {
        self.objects.remove(oid).is_some()
    }

    /// Oids of all objects, optionally restricted to one type.
    pub fn enumerate(&self, filter: Option<ObjectType>) -> BTreeSet<Oid> {
        self.objects
            .iter()
            .filter(|(_, object)| filter.map_or(true, |t| object.object_type() == t))
            .map(|(oid, _)| *oid)
            .collect()
    }

    /// Remove every object not in `keep`. Returns the number removed.
    pub fn drop_others_than(&mut self, keep: &BTreeSet<Oid>) -> usize {
        let before = self.objects.len();
        self.objects.retain(|oid, _| keep.contains(oid));
        before - self.objects.len()
    }

    /// Merge objects from `other` that pass `filter`. Returns the number of
    /// objects accepted.
    pub fn import<F>(&mut self, other: Catalog, mut filter: F) -> usize
    where
        F: FnMut(&Oid, &Object) -> bool,
    {
        let mut accepted = 0;
        for (oid, object) in other.objects {
            if !filter(&oid, &object) {
                debug!(oid = %oid.short_hex(), "import filter rejected object");
                continue;
            }
            self.objects.entry(oid).or_insert(object);
            accepted += 1;
        }
        accepted
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    /// Encode as `magic ∥ objects (ascending Oid) ∥ BLAKE3(prefix)`.
    ///
    /// Equal object sets always produce identical bytes.
    pub fn serialize(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        enc.u64_le(CATALOG_MAGIC);
        for object in self.objects.values() {
            object.encode_into(&mut enc);
        }
        let mut bytes = enc.into_inner();
        let digest = aup_crypto::identify(&bytes);
        bytes.extend_from_slice(digest.as_bytes());
        bytes
    }

    /// Parse a serialized catalog and add its objects to this one.
    ///
    /// Nothing is inserted unless the digest and every known object decode.
    /// An unknown type tag stops parsing; objects before it are kept.
    /// Returns the number of objects read.
    pub fn deserialize(&mut self, bytes: &[u8]) -> CatalogResult<usize> {
        if bytes.len() < DIGEST_LEN {
            return Err(CatalogError::corrupted("shorter than trailing digest"));
        }
        let (body, trailer) = bytes.split_at(bytes.len() - DIGEST_LEN);
        if aup_crypto::identify(body).as_bytes()[..] != trailer[..] {
            return Err(CatalogError::corrupted("digest mismatch"));
        }

        let mut dec = Decoder::new(body);
        let magic = dec
            .u64_le()
            .map_err(|_| CatalogError::corrupted("missing magic"))?;
        if magic != CATALOG_MAGIC {
            return Err(CatalogError::corrupted(format!("bad magic {magic:#018x}")));
        }

        let mut parsed = Vec::new();
        while !dec.is_empty() {
            let offset = dec.position();
            match Object::decode_from(&mut dec) {
                Ok(object) => parsed.push(object),
                Err(CatalogError::UnknownObjectType(tag)) => {
                    warn!(tag, offset, "unknown object type, ignoring rest of catalog");
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        let count = parsed.len();
        for object in parsed {
            self.put(object);
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{File, Release, Unit};
    use aup_types::FileKind;
    use proptest::prelude::*;

    fn file(path: &str, content: &[u8]) -> Object {
        Object::File(File {
            kind: FileKind::Runtime,
            path: path.into(),
            perms: 0o644,
            size: content.len() as u64,
            content: aup_crypto::identify(content),
            ..Default::default()
        })
    }

    fn sample() -> Catalog {
        let mut c = Catalog::new();
        let f = c.put(file("bin/app", b"hello"));
        let u = c.put(Object::Unit(Unit {
            dependencies: [f].into_iter().collect(),
            name: "core".into(),
            ..Default::default()
        }));
        c.put(Object::Release(Release {
            dependencies: [u].into_iter().collect(),
            src_branch: "main".into(),
            ..Default::default()
        }));
        c
    }

    // -----------------------------------------------------------------------
    // Object access
    // -----------------------------------------------------------------------

    #[test]
    fn put_returns_identity_and_is_idempotent() {
        let mut c = Catalog::new();
        let object = file("a", b"x");
        let oid = c.put(object.clone());
        assert_eq!(oid, object.identify());
        assert_eq!(c.put(object), oid);
        assert_eq!(c.len(), 1);
    }

    #[test]
    fn get_returns_independent_copy() {
        let mut c = Catalog::new();
        let oid = c.put(file("a", b"x"));
        let mut copy = c.get(&oid).unwrap();
        copy.dependencies_mut().insert(Oid::from_hash([1; 32]));
        assert!(c.get(&oid).unwrap().dependencies().is_empty());
    }

    #[test]
    fn enumerate_filters_by_type() {
        let c = sample();
        assert_eq!(c.enumerate(None).len(), 3);
        assert_eq!(c.enumerate(Some(ObjectType::Release)).len(), 1);
        assert_eq!(c.enumerate(Some(ObjectType::File)).len(), 1);
    }

    #[test]
    fn del_and_drop_others_than() {
        let mut c = sample();
        let releases = c.enumerate(Some(ObjectType::Release));
        assert_eq!(c.drop_others_than(&releases), 2);
        assert_eq!(c.enumerate(None), releases);
        let oid = *releases.iter().next().unwrap();
        assert!(c.del(&oid));
        assert!(!c.del(&oid));
        assert!(c.is_empty());
    }

    #[test]
    fn import_applies_filter() {
        let mut c = Catalog::new();
        let accepted = c.import(sample(), |_, o| o.object_type() != ObjectType::Release);
        assert_eq!(accepted, 2);
        assert!(c.enumerate(Some(ObjectType::Release)).is_empty());
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    #[test]
    fn serialize_roundtrip() {
        let c = sample();
        assert_eq!(Catalog::from_bytes(&c.serialize()).unwrap(), c);
    }

    #[test]
    fn empty_catalog_is_magic_plus_digest() {
        let bytes = Catalog::new().serialize();
        assert_eq!(bytes.len(), 8 + 32);
        assert_eq!(&bytes[..8], &CATALOG_MAGIC.to_le_bytes());
        assert!(Catalog::from_bytes(&bytes).unwrap().is_empty());
    }

    #[test]
    fn every_single_bit_flip_is_detected() {
        let bytes = sample().serialize();
        for i in 0..bytes.len() {
            let mut damaged = bytes.clone();
            damaged[i] ^= 1 << (i % 8);
            assert!(
                matches!(Catalog::from_bytes(&damaged), Err(CatalogError::Corrupted(_))),
                "flip at byte {i} went unnoticed"
            );
        }
    }

    #[test]
    fn short_input_is_corrupted() {
        assert!(matches!(
            Catalog::from_bytes(&[0u8; 31]),
            Err(CatalogError::Corrupted(_))
        ));
    }

    #[test]
    fn wrong_magic_is_corrupted() {
        let mut body = 0x1234u64.to_le_bytes().to_vec();
        let digest = aup_crypto::identify(&body);
        body.extend_from_slice(digest.as_bytes());
        assert_eq!(
            Catalog::from_bytes(&body).unwrap_err(),
            CatalogError::Corrupted("bad magic 0x0000000000001234".into())
        );
    }

    #[test]
    fn unknown_tag_keeps_earlier_objects() {
        let c = sample();
        let mut body = c.serialize();
        body.truncate(body.len() - DIGEST_LEN);
        body.extend_from_slice(&[0x7f, 0x00, 0x01]);
        let digest = aup_crypto::identify(&body);
        body.extend_from_slice(digest.as_bytes());

        let mut parsed = Catalog::new();
        assert_eq!(parsed.deserialize(&body).unwrap(), 3);
        assert_eq!(parsed, c);
    }

    #[test]
    fn truncated_object_inserts_nothing() {
        let mut body = sample().serialize();
        body.truncate(body.len() - DIGEST_LEN - 1);
        let digest = aup_crypto::identify(&body);
        body.extend_from_slice(digest.as_bytes());

        let mut parsed = Catalog::new();
        assert!(parsed.deserialize(&body).is_err());
        assert!(parsed.is_empty());
    }

    proptest! {
        #[test]
        fn serialization_ignores_insertion_order(
            entries in prop::collection::vec(("[a-z]{1,8}(/[a-z]{1,8}){0,2}", any::<Vec<u8>>()), 1..12)
        ) {
            let objects: Vec<Object> = entries.iter().map(|(p, c)| file(p, c)).collect();
            let mut forward = Catalog::new();
            for o in &objects {
                forward.put(o.clone());
            }
            let mut backward = Catalog::new();
            for o in objects.iter().rev() {
                backward.put(o.clone());
            }
            prop_assert_eq!(forward.serialize(), backward.serialize());
            prop_assert_eq!(Catalog::from_bytes(&forward.serialize()).unwrap(), forward);
        }
    }
}
