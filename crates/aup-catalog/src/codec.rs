//! Canonical byte encoding shared by object identity and catalog blobs.
//!
//! Integers are LEB128 varints except `u8`, `u16` (little-endian) and the
//! catalog magic. Strings and sets carry a varint length prefix. Sets are
//! written in ascending order and must decode strictly ascending.

use std::collections::BTreeSet;

use aup_types::Oid;

use crate::error::{CatalogError, CatalogResult};

/// Leading marker of a serialized catalog.
pub const CATALOG_MAGIC: u64 = 0xe322_06af_e2bc_ed65;

/// Append-only writer for canonical fields.
#[derive(Default)]
pub(crate) struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    pub(crate) fn u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub(crate) fn u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub(crate) fn u64_le(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub(crate) fn varint(&mut self, value: u64) {
        encode_varint(&mut self.buf, value);
    }

    pub(crate) fn raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub(crate) fn str(&mut self, value: &str) {
        self.varint(value.len() as u64);
        self.raw(value.as_bytes());
    }

    pub(crate) fn oid(&mut self, oid: &Oid) {
        self.raw(oid.as_bytes());
    }

    pub(crate) fn oid_set(&mut self, set: &BTreeSet<Oid>) {
        self.varint(set.len() as u64);
        for oid in set {
            self.oid(oid);
        }
    }

    pub(crate) fn str_set(&mut self, set: &BTreeSet<String>) {
        self.varint(set.len() as u64);
        for s in set {
            self.str(s);
        }
    }
}

/// Cursor over canonical fields. Every read fails with `Corrupted` on
/// truncation.
pub(crate) struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    pub(crate) fn position(&self) -> usize {
        self.pos
    }

    fn take(&mut self, n: usize) -> CatalogResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| {
                CatalogError::corrupted(format!("truncated field at offset {}", self.pos))
            })?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub(crate) fn u8(&mut self) -> CatalogResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn u16(&mut self) -> CatalogResult<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub(crate) fn u64_le(&mut self) -> CatalogResult<u64> {
        Ok(u64::from_le_bytes(self.array::<8>()?))
    }

    pub(crate) fn varint(&mut self) -> CatalogResult<u64> {
        let (value, used) = decode_varint(&self.data[self.pos.min(self.data.len())..])
            .map_err(|reason| CatalogError::corrupted(format!("{reason} at offset {}", self.pos)))?;
        self.pos += used;
        Ok(value)
    }

    pub(crate) fn array<const N: usize>(&mut self) -> CatalogResult<[u8; N]> {
        let mut arr = [0u8; N];
        arr.copy_from_slice(self.take(N)?);
        Ok(arr)
    }

    fn len(&mut self) -> CatalogResult<usize> {
        let len = self.varint()?;
        // A length larger than the remaining input is always truncation.
        if len > (self.data.len() - self.pos.min(self.data.len())) as u64 {
            return Err(CatalogError::corrupted(format!(
                "length {len} exceeds input at offset {}",
                self.pos
            )));
        }
        Ok(len as usize)
    }

    pub(crate) fn str(&mut self) -> CatalogResult<String> {
        let len = self.len()?;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| CatalogError::corrupted("string is not valid UTF-8"))
    }

    pub(crate) fn oid(&mut self) -> CatalogResult<Oid> {
        Ok(Oid::from_hash(self.array::<32>()?))
    }

    pub(crate) fn oid_set(&mut self) -> CatalogResult<BTreeSet<Oid>> {
        let count = self.len()?;
        let mut set = BTreeSet::new();
        let mut last: Option<Oid> = None;
        for _ in 0..count {
            let oid = self.oid()?;
            if last.is_some_and(|prev| prev >= oid) {
                return Err(CatalogError::corrupted("oid set is not strictly ascending"));
            }
            last = Some(oid);
            set.insert(oid);
        }
        Ok(set)
    }

    pub(crate) fn str_set(&mut self) -> CatalogResult<BTreeSet<String>> {
        let count = self.len()?;
        let mut set = BTreeSet::new();
        for _ in 0..count {
            let s = self.str()?;
            if set.last().is_some_and(|prev: &String| *prev >= s) {
                return Err(CatalogError::corrupted("string set is not strictly ascending"));
            }
            set.insert(s);
        }
        Ok(set)
    }
}

/// Encode a u64 as a variable-length integer.
pub(crate) fn encode_varint(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value > 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if value == 0 {
            break;
        }
    }
}

/// Decode a variable-length integer. Returns (value, bytes_consumed).
pub(crate) fn decode_varint(data: &[u8]) -> Result<(u64, usize), &'static str> {
    let mut value: u64 = 0;
    let mut shift = 0;
    for (i, &byte) in data.iter().enumerate() {
        value |= ((byte & 0x7F) as u64) << shift;
        shift += 7;
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
        if shift >= 64 {
            return Err("varint overflow");
        }
    }
    Err("truncated varint")
}
