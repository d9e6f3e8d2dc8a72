//! The metadata store: a durable key/value tree mapping request
//! fingerprints to descriptor lists, with optimistic concurrency.
//!
//! Versions are monotonic counters embedded in each stored value; writes
//! present the version they read and fail with [`MetaError::Conflict`] when
//! it is stale. Callers that care retry the read-modify-write; callers that
//! do not simply drop their update.

use std::path::Path;

use thiserror::Error;

use super::entry::{CachedResponses, decode_responses, encode_responses};

pub type Version = u64;

const VERSION_PREFIX_LEN: usize = 8;

#[derive(Debug, Error)]
pub enum MetaError {
    #[error("entry not found")]
    NotFound,
    #[error("entry was updated concurrently")]
    Conflict,
    #[error("metadata store failure: {0}")]
    Storage(#[from] sled::Error),
    #[error("stored entry is malformed: {0}")]
    Codec(anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct MetaStore {
    db: sled::Db,
}

impl MetaStore {
    pub fn open(path: &Path) -> Result<Self, MetaError> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    pub fn get(&self, key: &[u8]) -> Result<(CachedResponses, Version), MetaError> {
        let value = self.db.get(key)?.ok_or(MetaError::NotFound)?;
        decode_value(&value)
    }

    /// Persists `responses` under `key` if the stored version still equals
    /// `version`. A key that does not exist yet has version 0.
    pub fn save(
        &self,
        key: &[u8],
        responses: &CachedResponses,
        version: Version,
    ) -> Result<(), MetaError> {
        let current = self.db.get(key)?;
        let current_version = match current.as_ref() {
            Some(value) => decode_version(value)?,
            None => 0,
        };
        if current_version != version {
            return Err(MetaError::Conflict);
        }

        let next = encode_value(responses, version + 1)?;
        match self.db.compare_and_swap(key, current, Some(next))? {
            Ok(()) => Ok(()),
            Err(_) => Err(MetaError::Conflict),
        }
    }

    /// Initial insert for a fresh key.
    pub fn insert_new(&self, key: &[u8], responses: &CachedResponses) -> Result<(), MetaError> {
        self.save(key, responses, 0)
    }

    /// Version-checked removal. Deleting an absent key succeeds.
    pub fn delete(&self, key: &[u8], version: Version) -> Result<(), MetaError> {
        let Some(current) = self.db.get(key)? else {
            return Ok(());
        };
        if decode_version(&current)? != version {
            return Err(MetaError::Conflict);
        }
        match self
            .db
            .compare_and_swap(key, Some(current), None::<&[u8]>)?
        {
            Ok(()) => Ok(()),
            Err(_) => Err(MetaError::Conflict),
        }
    }

    /// Streams every entry through `apply`, aborting on the first error.
    pub fn for_each(
        &self,
        mut apply: impl FnMut(&[u8], CachedResponses, Version) -> anyhow::Result<()>,
    ) -> anyhow::Result<()> {
        for item in self.db.iter() {
            let (key, value) = item?;
            let (responses, version) = decode_value(&value)?;
            apply(&key, responses, version)?;
        }
        Ok(())
    }

    /// Entry count and total on-disk size.
    pub fn statistics(&self) -> Result<(u64, u64), MetaError> {
        let entries = self.db.len() as u64;
        let size = self.db.size_on_disk()?;
        Ok((entries, size))
    }

    /// Asks the tree to settle pending state to disk. Returns whether any
    /// space was actually reclaimed.
    pub fn garbage_collect(&self) -> Result<bool, MetaError> {
        let before = self.db.size_on_disk()?;
        self.db.flush()?;
        let after = self.db.size_on_disk()?;
        Ok(after < before)
    }

    pub fn flush(&self) -> Result<(), MetaError> {
        self.db.flush()?;
        Ok(())
    }
}

fn encode_value(responses: &CachedResponses, version: Version) -> Result<Vec<u8>, MetaError> {
    let payload = encode_responses(responses).map_err(MetaError::Codec)?;
    let mut value = Vec::with_capacity(VERSION_PREFIX_LEN + payload.len());
    value.extend_from_slice(&version.to_be_bytes());
    value.extend_from_slice(&payload);
    Ok(value)
}

fn decode_version(value: &[u8]) -> Result<Version, MetaError> {
    let prefix: [u8; VERSION_PREFIX_LEN] = value
        .get(..VERSION_PREFIX_LEN)
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or_else(|| MetaError::Codec(anyhow::anyhow!("value shorter than version prefix")))?;
    Ok(Version::from_be_bytes(prefix))
}

fn decode_value(value: &[u8]) -> Result<(CachedResponses, Version), MetaError> {
    let version = decode_version(value)?;
    let responses =
        decode_responses(&value[VERSION_PREFIX_LEN..]).map_err(MetaError::Codec)?;
    Ok((responses, version))
}
