//! Bundled (build-time-embedded) datafile snapshot lookup.
//!
//! A real build tool would generate a module exporting `get(key)`; since
//! there is no code-generation step in this repo, the "build-generated
//! module" is modeled as an injectable [`BundledLookup`] trait plus a
//! default in-memory registry populated at construction.

use std::collections::HashMap;

use sha2::{Digest, Sha256};

use crate::core::data::Datafile;
use crate::core::error::{FlagsError, Result};

/// Outcome of a bundled lookup, before it is collapsed to `Option`/`Result`
/// at the call sites that need one or the other.
#[derive(Debug, Clone)]
enum LookupOutcome {
    Ok(Datafile),
    MissingFile,
    MissingEntry,
}

/// Source of build-time-embedded datafiles, keyed by SDK key (raw or
/// SHA-256-hex-hashed, for build tools that hash for privacy).
pub trait BundledLookup: Send + Sync {
    /// Look up a snapshot by raw SDK key or its SHA-256 hex digest.
    fn lookup(&self, sdk_key: &str, sdk_key_hash: &str) -> Option<Datafile>;

    /// Whether any snapshot file is registered at all, independent of
    /// whether this particular key has an entry.
    fn has_file(&self) -> bool;
}

/// Default in-memory `BundledLookup`, populated directly rather than
/// generated at build time.
#[derive(Debug, Default)]
pub struct InMemoryBundledRegistry {
    entries: HashMap<String, Datafile>,
}

impl InMemoryBundledRegistry {
    /// An empty registry (no bundled file at all).
    pub fn empty() -> Self {
        Self::default()
    }

    /// A registry with one or more snapshots, keyed by raw SDK key or its
    /// SHA-256 hex digest.
    pub fn with_entries(entries: HashMap<String, Datafile>) -> Self {
        Self { entries }
    }
}

impl BundledLookup for InMemoryBundledRegistry {
    fn lookup(&self, sdk_key: &str, sdk_key_hash: &str) -> Option<Datafile> {
        self.entries
            .get(sdk_key)
            .or_else(|| self.entries.get(sdk_key_hash))
            .cloned()
    }

    fn has_file(&self) -> bool {
        !self.entries.is_empty()
    }
}

/// Memoized SHA-256 hex digest of an SDK key, for privacy-hashing build
/// tools that key the snapshot by hash rather than raw key.
pub fn hash_sdk_key(sdk_key: &str) -> String {
    let digest = Sha256::digest(sdk_key.as_bytes());
    hex_encode(&digest)
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{b:02x}"));
    }
    s
}

/// The Bundled Source: a thin wrapper over a [`BundledLookup`] plus a
/// memoized hash of the SDK key it was constructed for.
pub struct BundledSource {
    lookup: Box<dyn BundledLookup>,
    sdk_key: String,
    sdk_key_hash: String,
}

impl BundledSource {
    /// Build a bundled source for the given SDK key and lookup table.
    pub fn new(sdk_key: impl Into<String>, lookup: Box<dyn BundledLookup>) -> Self {
        let sdk_key = sdk_key.into();
        let sdk_key_hash = hash_sdk_key(&sdk_key);
        Self {
            lookup,
            sdk_key,
            sdk_key_hash,
        }
    }

    fn outcome(&self) -> LookupOutcome {
        if !self.lookup.has_file() {
            return LookupOutcome::MissingFile;
        }
        match self.lookup.lookup(&self.sdk_key, &self.sdk_key_hash) {
            Some(datafile) => LookupOutcome::Ok(datafile),
            None => LookupOutcome::MissingEntry,
        }
    }

    /// `None` for any non-`Ok` outcome; swallows the distinction between a
    /// missing file and a missing entry, for callers on the fallback chain
    /// that only care whether bundled data is usable.
    pub fn try_load(&self) -> Option<Datafile> {
        match self.outcome() {
            LookupOutcome::Ok(datafile) => Some(datafile),
            LookupOutcome::MissingFile | LookupOutcome::MissingEntry => None,
        }
    }

    /// Typed result for `Controller::get_fallback_datafile`, which needs to
    /// distinguish "no file at all" from "file exists, no entry for this
    /// key".
    pub fn get_raw(&self) -> Result<Datafile> {
        match self.outcome() {
            LookupOutcome::Ok(datafile) => Ok(datafile),
            LookupOutcome::MissingFile => Err(FlagsError::FallbackNotFoundError),
            LookupOutcome::MissingEntry => Err(FlagsError::FallbackEntryNotFoundError),
        }
    }
}
