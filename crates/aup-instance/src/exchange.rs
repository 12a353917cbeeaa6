//! Object exchange with peers: presence checks, reads and admission of
//! inbound catalog objects and blobs.

use std::io::{Read, Seek, SeekFrom};
use std::time::Instant;

use aup_catalog::Object;
use aup_types::Oid;
use tracing::{debug, warn};

use crate::error::{io_err, InstanceResult};
use crate::instance::{Instance, Running};

/// Verdict on an inbound object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PutObjectResult {
    /// Stored; the index was updated.
    Ok,
    /// Bytes do not hash to the claimed Oid, do not decode, or a release
    /// signature is invalid.
    Corrupted,
    /// Nothing wants this object.
    Unwanted,
}

impl Instance {
    pub fn has_catalog_object(&self, oid: &Oid) -> InstanceResult<bool> {
        Ok(self.running()?.catalog.has(oid))
    }

    pub fn has_storage_object(&self, oid: &Oid) -> InstanceResult<bool> {
        Ok(self.running()?.storage.has(oid)?)
    }

    /// Canonical encoding of a catalog object.
    pub fn get_catalog_object(&self, oid: &Oid) -> InstanceResult<Option<Vec<u8>>> {
        Ok(self.running()?.catalog.get_ref(oid).map(Object::encode))
    }

    pub fn get_storage_object(
        &self,
        oid: &Oid,
        offset: u64,
        len: Option<u64>,
    ) -> InstanceResult<Option<Vec<u8>>> {
        Ok(self.running()?.storage.get(oid, offset, len)?)
    }

    /// Admit a catalog object.
    ///
    /// A release is accepted when it is new and correctly signed, and
    /// triggers a full index rebuild. Any other object is accepted only if
    /// an audience is waiting for it, and patches the index in place.
    pub fn put_catalog_object(&mut self, oid: Oid, bytes: &[u8]) -> InstanceResult<PutObjectResult> {
        let running = self.running_mut()?;
        if aup_crypto::identify(bytes) != oid {
            debug!(oid = %oid.short_hex(), "catalog object hash mismatch");
            return Ok(PutObjectResult::Corrupted);
        }
        let object = match Object::decode(bytes) {
            Ok(object) => object,
            Err(e) => {
                debug!(oid = %oid.short_hex(), error = %e, "undecodable catalog object");
                return Ok(PutObjectResult::Corrupted);
            }
        };

        let is_release = match &object {
            Object::Release(release) => {
                if running.index.all_releases.contains(&oid) {
                    return Ok(PutObjectResult::Unwanted);
                }
                if !release.verify_signature() {
                    warn!(
                        oid = %oid.short_hex(),
                        signer = %hex::encode(release.signer),
                        "release signature mismatch"
                    );
                    return Ok(PutObjectResult::Corrupted);
                }
                true
            }
            _ => {
                if !running.index.wants_catalog(&oid) {
                    return Ok(PutObjectResult::Unwanted);
                }
                false
            }
        };

        running.catalog.put(object);
        running.catalog_changed(Instant::now());
        let events = if is_release {
            running.rebuild_index()?
        } else {
            let Running { catalog, storage, index, target, buffer, .. } = running;
            index.catalog_object_arrived(catalog, storage, [&*target, &*buffer], oid)?
        };
        self.publish(events)?;
        Ok(PutObjectResult::Ok)
    }

    /// Admit a blob some audience is waiting for.
    pub fn put_storage_object(&mut self, oid: Oid, bytes: &[u8]) -> InstanceResult<PutObjectResult> {
        let running = self.running_mut()?;
        if !running.index.wants_storage(&oid) {
            return Ok(PutObjectResult::Unwanted);
        }
        if aup_crypto::identify(bytes) != oid {
            debug!(oid = %oid.short_hex(), "blob hash mismatch");
            return Ok(PutObjectResult::Corrupted);
        }
        running.storage.put(oid, bytes)?;
        let events = running.index.storage_object_arrived(oid);
        self.publish(events)?;
        Ok(PutObjectResult::Ok)
    }

    /// Streaming form of [`Instance::put_storage_object`]. The reader is
    /// hashed, rewound and then copied.
    pub fn put_storage_object_from<R: Read + Seek>(
        &mut self,
        oid: Oid,
        mut reader: R,
    ) -> InstanceResult<PutObjectResult> {
        let running = self.running_mut()?;
        if !running.index.wants_storage(&oid) {
            return Ok(PutObjectResult::Unwanted);
        }
        let digest = aup_crypto::identify_reader(&mut reader).map_err(io_err("hash", oid.to_hex()))?;
        if digest != oid {
            debug!(oid = %oid.short_hex(), "blob hash mismatch");
            return Ok(PutObjectResult::Corrupted);
        }
        reader
            .seek(SeekFrom::Start(0))
            .map_err(io_err("rewind", oid.to_hex()))?;
        running.storage.put_reader(oid, reader)?;
        let events = running.index.storage_object_arrived(oid);
        self.publish(events)?;
        Ok(PutObjectResult::Ok)
    }
}
