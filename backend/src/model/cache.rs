//! Single-slot model cache.
//!
//! At most one model artifact is resident at a time. Asking for a different
//! task evicts the resident model (and reclaims its memory) before the new one
//! is loaded, so steady-state memory stays bounded by one artifact.
//!
//! The slot sits behind a read/write lock. A [`ModelLease`] holds a read lock,
//! so any number of batches can share the resident model, while a task switch
//! takes the write lock and therefore waits for every outstanding lease to be
//! dropped before it evicts anything.
//!
//! Status queries never touch the slot lock: a copy of the resident task is
//! kept under its own mutex, so they stay fast while a switch is queued.

use log::{debug, error, info};
use parking_lot::{MappedRwLockReadGuard, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::Serialize;
use shared::TaskKind;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use super::artifact::{ArtifactSpec, LoadError, ModelBackend, ModelHandle};
use super::registry::ModelRegistry;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Unknown task: {0}")]
    UnknownTask(String),
    #[error("Failed to load model for task '{task}': {source}")]
    Load {
        task: TaskKind,
        #[source]
        source: LoadError,
    },
}

struct ResidentModel {
    task: TaskKind,
    generation: u64,
    handle: Box<dyn ModelHandle>,
}

#[derive(Default)]
enum Slot {
    #[default]
    Empty,
    Resident(ResidentModel),
}

impl Slot {
    fn resident_for(&self, task: TaskKind) -> Option<&ResidentModel> {
        match self {
            Slot::Resident(model) if model.task == task => Some(model),
            _ => None,
        }
    }
}

/// Which task is resident, and which load event produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResidentInfo {
    pub task: TaskKind,
    pub generation: u64,
}

#[derive(Default)]
struct CacheStats {
    loads: AtomicU64,
    failed_loads: AtomicU64,
    evictions: AtomicU64,
    hits: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStatsSnapshot {
    pub loads: u64,
    pub failed_loads: u64,
    pub evictions: u64,
    pub hits: u64,
}

/// Borrowed access to the resident model.
///
/// While a lease is alive the model cannot be evicted. Do not call
/// [`ModelCache::acquire`] for another task on a thread that still holds one.
pub struct ModelLease<'a> {
    model: MappedRwLockReadGuard<'a, ResidentModel>,
}

impl ModelLease<'_> {
    pub fn task(&self) -> TaskKind {
        self.model.task
    }

    pub fn generation(&self) -> u64 {
        self.model.generation
    }
}

impl Deref for ModelLease<'_> {
    type Target = dyn ModelHandle;

    fn deref(&self) -> &Self::Target {
        self.model.handle.as_ref()
    }
}

pub struct ModelCache {
    registry: ModelRegistry,
    backend: Box<dyn ModelBackend>,
    slot: RwLock<Slot>,
    // mirrors `slot`, written only under the slot's write lock
    resident: Mutex<Option<ResidentInfo>>,
    stats: CacheStats,
}

impl ModelCache {
    pub fn new(registry: ModelRegistry, backend: Box<dyn ModelBackend>) -> Self {
        Self {
            registry,
            backend,
            slot: RwLock::new(Slot::Empty),
            resident: Mutex::new(None),
            stats: CacheStats::default(),
        }
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    /// Returns the model for `task`, loading it (and evicting any other
    /// model) if needed. Unknown task names leave the cache untouched.
    pub fn acquire(&self, task: &str) -> Result<ModelLease<'_>, CacheError> {
        let kind = self
            .registry
            .resolve(task)
            .ok_or_else(|| CacheError::UnknownTask(task.trim().to_string()))?;
        self.acquire_kind(kind)
    }

    pub fn acquire_kind(&self, task: TaskKind) -> Result<ModelLease<'_>, CacheError> {
        let spec = self
            .registry
            .spec(task)
            .ok_or_else(|| CacheError::UnknownTask(task.to_string()))?;

        loop {
            if let Ok(model) = RwLockReadGuard::try_map(self.slot.read(), |slot| slot.resident_for(task)) {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                debug!("Model cache hit for task '{}' (generation {})", task, model.generation);
                return Ok(ModelLease { model });
            }

            let mut slot = self.slot.write();
            if slot.resident_for(task).is_none() {
                self.evict(&mut slot);
                self.load_into(&mut slot, task, spec)?;
            } else {
                // another request loaded it while we waited for the lock
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
            }

            let slot = RwLockWriteGuard::downgrade(slot);
            if let Ok(model) = RwLockReadGuard::try_map(slot, |slot| slot.resident_for(task)) {
                return Ok(ModelLease { model });
            }
        }
    }

    /// Loads `task` ahead of the first request for it.
    pub fn preload(&self, task: TaskKind) -> Result<(), CacheError> {
        self.acquire_kind(task).map(drop)
    }

    /// The resident task. Does not wait for in-flight batches or a queued
    /// task switch; once an eviction starts this is `None` until the next
    /// model is ready.
    pub fn resident(&self) -> Option<ResidentInfo> {
        *self.resident.lock()
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            loads: self.stats.loads.load(Ordering::Relaxed),
            failed_loads: self.stats.failed_loads.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
            hits: self.stats.hits.load(Ordering::Relaxed),
        }
    }

    /// Batch-scope cleanup, separate from eviction.
    pub fn clear_transient(&self) {
        self.backend.clear_transient();
    }

    /// Drops the resident model, if any. Called at shutdown.
    pub fn release(&self) {
        let mut slot = self.slot.write();
        self.evict(&mut slot);
    }

    fn evict(&self, slot: &mut Slot) {
        if let Slot::Resident(previous) = std::mem::take(slot) {
            *self.resident.lock() = None;
            info!(
                "Evicting model for task '{}' (generation {})",
                previous.task, previous.generation
            );
            drop(previous);
            self.backend.reclaim();
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn load_into(&self, slot: &mut Slot, task: TaskKind, spec: &ArtifactSpec) -> Result<(), CacheError> {
        let started = Instant::now();
        info!("Loading model for task '{}' from {}", task, spec.path.display());

        match self.backend.load(task, spec) {
            Ok(handle) => {
                let generation = self.stats.loads.fetch_add(1, Ordering::Relaxed) + 1;
                *slot = Slot::Resident(ResidentModel {
                    task,
                    generation,
                    handle,
                });
                *self.resident.lock() = Some(ResidentInfo { task, generation });
                info!(
                    "Model for task '{}' ready in {} ms (generation {})",
                    task,
                    started.elapsed().as_millis(),
                    generation
                );
                Ok(())
            }
            Err(source) => {
                self.stats.failed_loads.fetch_add(1, Ordering::Relaxed);
                error!("Failed to load model for task '{}': {}", task, source);
                self.backend.reclaim();
                Err(CacheError::Load { task, source })
            }
        }
    }
}
