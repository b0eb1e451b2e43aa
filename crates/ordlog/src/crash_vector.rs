use dashmap::DashMap;
use proto_nezha::Digest;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// One immutable crash-vector version.
///
/// `counts[i]` is the number of crashes of replica `i` this replica has seen
/// evidence of. Vectors aggregate by element-wise max; a message tagged with
/// a vector that is lower in the sender's own slot comes from a stale
/// incarnation of that sender.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CrashVector {
    pub counts: Vec<u32>,
    pub version: u32,
    pub hash: Digest,
}

impl CrashVector {
    pub fn new(replica_num: usize) -> Self {
        Self::from_counts(vec![0; replica_num], 1)
    }

    pub fn from_counts(counts: Vec<u32>, version: u32) -> Self {
        let hash = Digest::of_counts(&counts);
        Self {
            counts,
            version,
            hash,
        }
    }

    /// Element-wise max of this vector and `other`, or `None` when `other`
    /// adds nothing new.
    pub fn aggregate(&self, other: &[u32]) -> Option<Vec<u32>> {
        let mut grew = false;
        let merged: Vec<u32> = self
            .counts
            .iter()
            .zip(other.iter())
            .map(|(mine, theirs)| {
                if theirs > mine {
                    grew = true;
                }
                (*mine).max(*theirs)
            })
            .collect();
        grew.then_some(merged)
    }

    /// Whether `other` is stale about `slot`: it reports fewer crashes of
    /// that replica than we already have evidence of.
    pub fn slot_is_stale(&self, other: &[u32], slot: usize) -> bool {
        match (self.counts.get(slot), other.get(slot)) {
            (Some(mine), Some(theirs)) => theirs < mine,
            _ => true,
        }
    }
}

/// Versioned history of crash vectors.
///
/// The newest version tags outbound messages; older versions stay resident
/// so in-flight messages signed under them remain checkable until garbage
/// collection decides nothing can still reference them.
pub struct CrashVectorStore {
    versions: DashMap<u32, Arc<CrashVector>>,
    current: AtomicU32,
    /// Versions at or below this have been reclaimed.
    floor: AtomicU32,
}

impl CrashVectorStore {
    pub fn new(replica_num: usize) -> Self {
        let initial = Arc::new(CrashVector::new(replica_num));
        let store = Self {
            versions: DashMap::new(),
            current: AtomicU32::new(initial.version),
            floor: AtomicU32::new(0),
        };
        store.versions.insert(initial.version, initial);
        store
    }

    /// The vector currently tagging outbound messages.
    pub fn current(&self) -> Arc<CrashVector> {
        let version = self.current.load(Ordering::Acquire);
        self.versions
            .get(&version)
            .map(|v| v.value().clone())
            // The current version is never reclaimed, so the lookup only
            // misses transiently between install and publish; fall back to
            // the newest resident version.
            .unwrap_or_else(|| self.newest_resident())
    }

    fn newest_resident(&self) -> Arc<CrashVector> {
        self.versions
            .iter()
            .max_by_key(|v| v.version)
            .map(|v| v.value().clone())
            .expect("store always holds at least one version")
    }

    pub fn current_version(&self) -> u32 {
        self.current.load(Ordering::Acquire)
    }

    pub fn get(&self, version: u32) -> Option<Arc<CrashVector>> {
        self.versions.get(&version).map(|v| v.value().clone())
    }

    /// Install `counts` as the next version and make it current. The
    /// version counter is reserved with a fetch-add so two installing
    /// threads never reuse a number; `current()` tolerates the brief gap
    /// between reservation and map insertion.
    pub fn install(&self, counts: Vec<u32>) -> Arc<CrashVector> {
        let version = self.current.fetch_add(1, Ordering::AcqRel) + 1;
        let cv = Arc::new(CrashVector::from_counts(counts, version));
        self.versions.insert(version, cv.clone());
        cv
    }

    /// Aggregate `other` into the current vector; install a new version if
    /// it grew. Returns the vector now in use.
    pub fn merge(&self, other: &[u32]) -> Arc<CrashVector> {
        let current = self.current();
        match current.aggregate(other) {
            Some(merged) => self.install(merged),
            None => current,
        }
    }

    /// Bump our own slot, reflecting that this incarnation observed its own
    /// restart or initiated a view change.
    pub fn bump_self(&self, replica_id: u32) -> Arc<CrashVector> {
        let mut counts = self.current().counts.clone();
        counts[replica_id as usize] += 1;
        self.install(counts)
    }

    /// Drop versions at or below `through`. The current version is always
    /// retained.
    pub fn reclaim_through(&self, through: u32) {
        let keep = self.current.load(Ordering::Acquire);
        let through = through.min(keep.saturating_sub(1));
        self.versions.retain(|version, _| *version > through);
        self.floor.store(through, Ordering::Release);
    }

    pub fn floor(&self) -> u32 {
        self.floor.load(Ordering::Acquire)
    }
}
