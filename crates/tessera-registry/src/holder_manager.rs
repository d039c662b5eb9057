//! Process-wide cache of loaded holders, keyed by fingerprint.
//!
//! Concurrent requests for the same fingerprint load the library once: the
//! first caller creates while later callers wait on that fingerprint's slot.
//! Requests for different fingerprints do not wait on each other. Locks are
//! always taken map first, then slot, and the map lock is never held while a
//! library loads.

use crate::config::LoaderConfig;
use crate::holder::{OpImplRegistryHolder, OppSoBlob, SoInfo};
use crate::loader::{DynamicLoader, LibloadingLoader};
use crate::Result;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

/// Identifies a loaded shared object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    pub origin: String,
    pub platform: String,
    pub version: String,
}

impl Fingerprint {
    pub fn new(
        origin: impl Into<String>,
        platform: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            origin: origin.into(),
            platform: platform.into(),
            version: version.into(),
        }
    }

    /// Fingerprint by blob name.
    pub fn from_blob(blob: &OppSoBlob, so_info: &SoInfo) -> Self {
        Self::new(blob.name.clone(), so_info.platform(), so_info.opp_version.clone())
    }

    /// Fingerprint by SHA-256 of the blob contents, for blobs whose names
    /// are not unique.
    pub fn from_content(data: &[u8], so_info: &SoInfo) -> Self {
        let digest = Sha256::digest(data);
        let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
        Self::new(hex, so_info.platform(), so_info.opp_version.clone())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}#{}", self.origin, self.platform, self.version)
    }
}

type Slot = Arc<Mutex<Option<Arc<OpImplRegistryHolder>>>>;

/// Cache of holders shared across space registries.
pub struct OpImplRegistryHolderManager {
    holders: Mutex<HashMap<Fingerprint, Slot>>,
    loader: Arc<dyn DynamicLoader>,
    config: LoaderConfig,
    generation: AtomicU64,
}

impl OpImplRegistryHolderManager {
    pub fn new(loader: Arc<dyn DynamicLoader>, config: LoaderConfig) -> Self {
        Self {
            holders: Mutex::new(HashMap::new()),
            loader,
            config,
            generation: AtomicU64::new(0),
        }
    }

    /// The process-wide manager, loading through the platform loader with
    /// configuration from the environment.
    pub fn global() -> &'static OpImplRegistryHolderManager {
        static GLOBAL: OnceLock<OpImplRegistryHolderManager> = OnceLock::new();
        GLOBAL.get_or_init(|| Self::new(Arc::new(LibloadingLoader), LoaderConfig::from_env()))
    }

    pub fn loader(&self) -> &dyn DynamicLoader {
        self.loader.as_ref()
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// The holder for `fingerprint`, calling `create` if none is cached.
    ///
    /// At most one `create` runs per fingerprint at a time. If it fails the
    /// fingerprint is forgotten, so a later call retries.
    pub fn get_or_create<F>(
        &self,
        fingerprint: &Fingerprint,
        create: F,
    ) -> Result<Arc<OpImplRegistryHolder>>
    where
        F: FnOnce() -> Result<OpImplRegistryHolder>,
    {
        let slot = Arc::clone(self.holders.lock().entry(fingerprint.clone()).or_default());

        let mut guard = slot.lock();
        if let Some(holder) = guard.as_ref() {
            tracing::trace!(%fingerprint, "holder cache hit");
            return Ok(Arc::clone(holder));
        }

        tracing::debug!(%fingerprint, "creating holder");
        match create() {
            Ok(holder) => {
                let holder = Arc::new(holder);
                *guard = Some(Arc::clone(&holder));
                Ok(holder)
            }
            Err(e) => {
                tracing::warn!(%fingerprint, error = %e, "failed to create holder");
                drop(guard);
                self.forget_if_empty(fingerprint, &slot);
                Err(e)
            }
        }
    }

    /// The holder for `blob`, loading it if needed.
    pub fn get_or_create_holder(
        &self,
        blob: &OppSoBlob,
        so_info: &SoInfo,
    ) -> Result<Arc<OpImplRegistryHolder>> {
        let fingerprint = Fingerprint::from_blob(blob, so_info);
        self.get_or_create(&fingerprint, || {
            OpImplRegistryHolder::load_so(blob, self.loader.as_ref(), &self.config)
        })
    }

    /// Cache `holder` under `fingerprint` unless one is already present.
    ///
    /// Evicts unreferenced holders first. Returns whether `holder` was added.
    pub fn add_registry(
        &self,
        fingerprint: Fingerprint,
        holder: Arc<OpImplRegistryHolder>,
    ) -> bool {
        self.update_registries();

        let slot = Arc::clone(self.holders.lock().entry(fingerprint).or_default());
        let mut guard = slot.lock();
        if guard.is_some() {
            return false;
        }
        *guard = Some(holder);
        true
    }

    /// The cached holder for `fingerprint`, if loaded.
    pub fn registry(&self, fingerprint: &Fingerprint) -> Option<Arc<OpImplRegistryHolder>> {
        let slot = self.holders.lock().get(fingerprint).cloned()?;
        slot.lock().clone()
    }

    /// Drop holders that nothing outside this cache references, along with
    /// failed or abandoned slots. Slots busy loading, or claimed by a caller
    /// that has not locked them yet, are skipped.
    ///
    /// Returns the number of entries removed.
    pub fn update_registries(&self) -> usize {
        let mut holders = self.holders.lock();
        let before = holders.len();
        holders.retain(|fingerprint, slot| {
            let Some(guard) = slot.try_lock() else {
                return true;
            };
            // A slot clone outside the map belongs to a caller that is about
            // to lock it and hand out its holder.
            let keep = Arc::strong_count(slot) > 1
                || guard.as_ref().is_some_and(|holder| Arc::strong_count(holder) > 1);
            if !keep {
                tracing::debug!(%fingerprint, "evicting holder");
            }
            keep
        });
        let removed = before - holders.len();
        self.generation.fetch_add(1, Ordering::Relaxed);
        removed
    }

    /// Number of times [`update_registries`](Self::update_registries) has run.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.holders.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.holders.lock().is_empty()
    }

    pub fn clear(&self) {
        self.holders.lock().clear();
    }

    fn forget_if_empty(&self, fingerprint: &Fingerprint, slot: &Slot) {
        let mut holders = self.holders.lock();
        let Some(current) = holders.get(fingerprint) else {
            return;
        };
        if !Arc::ptr_eq(current, slot) {
            return;
        }
        // Other references (map + ours aside) or a held lock mean another
        // caller is about to retry in this slot.
        let idle = Arc::strong_count(current) <= 2;
        if idle && current.try_lock().is_some_and(|guard| guard.is_none()) {
            holders.remove(fingerprint);
        }
    }
}

impl fmt::Debug for OpImplRegistryHolderManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpImplRegistryHolderManager")
            .field("holders", &self.len())
            .field("config", &self.config)
            .finish()
    }
}
