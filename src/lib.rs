//! FileMap: a persistent, crash-consistent hash map backed by two memory-mapped
//! files, with one cross-process writer and lock-free optimistic readers.
//!
//! A map at base path `P` owns the file pair `P-buckets` / `P-entries`. Both
//! files start with a fixed 256-byte header; the tails are flat slot arrays.
//! Every mutating step is journaled into header shadow slots before it runs,
//! so a writer killed mid-operation leaves behind enough state for the next
//! process that attaches to roll the interrupted step back (or, for a wipe,
//! forward) before proceeding.
//!
//! Byte order is host-native: the file pair is not portable across
//! architectures of different endianness.

use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::hash::Hash;
use std::marker::PhantomData;
use std::mem;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};

use ahash::RandomState;
use memmap2::MmapRaw;
use parking_lot::{Mutex, RwLock};

// ================================================================================================
// CONSTANTS
// ================================================================================================

/// Byte length of the fixed header at the start of each mapped file.
const HEADER_LEN: usize = 256;

/// Bytes per bucket slot (a +1-biased u32 entry index).
const BUCKET_SLOT: usize = 4;

/// `hashCode` value marking an entry slot as free.
const FREE_HASH_CODE: i32 = -1;

/// Slot capacity per generation. Growing the map advances the generation by
/// one; entries placed under older generations are never rehashed and stay
/// reachable through probes against the older moduli.
const PRIMES: &[i32] = &[
    3, 7, 11, 17, 23, 29, 37, 47, 59, 71, 89, 107, 131, 163, 197, 239, 293, 353, 431, 521, 631,
    761, 919, 1103, 1327, 1597, 1931, 2333, 2801, 3371, 4049, 4861, 5839, 7013, 8419, 10103,
    12143, 14591, 17519, 21023, 25229, 30293, 36353, 43627, 52361, 62851, 75431, 90523, 108631,
    130363, 156437, 187751, 225307, 270371, 324449, 389357, 467237, 560689, 672827, 807403,
    968897, 1162687, 1395263, 1674319, 2009191, 2411033, 2893249, 3471899, 4166287, 4999559,
    5999471, 7199369,
];

/// Spin iterations before a contended lock probes its holder, and before a
/// mismatched optimistic read escalates to recovery.
const SPIN_LIMIT: i32 = 100;

/// Capacity used by [`FileMap::open`].
const DEFAULT_CAPACITY: usize = 5;

// Journal bits. A mutating step brackets itself as: write shadow slots, set
// its bit, mutate, clear. Replay inspects the set bits highest-first; undoing
// the highest restores the precondition for undoing the next.
const FLAG_VALUE_UPDATE: i32 = 1 << 0; // in-place value overwrite
const FLAG_FREE_TAKE: i32 = 1 << 1; // slot popped off the free list
const FLAG_COUNT_BUMP: i32 = 1 << 2; // fresh slot taken past `count`
const FLAG_BUCKET_PUBLISH: i32 = 1 << 3; // new entry linked as bucket head
const FLAG_HEAD_UNLINK: i32 = 1 << 4; // bucket head bypassed for removal
const FLAG_CHAIN_UNLINK: i32 = 1 << 5; // predecessor link bypassed for removal
const FLAG_FREE_PUSH: i32 = 1 << 6; // removed slot pushed onto the free list
const FLAG_WIPE: i32 = 1 << 7; // whole-table clear in progress
const FLAG_ALL: i32 = 0xff;

// ================================================================================================
// HEADER LAYOUT
// ================================================================================================

/// Byte offsets of the header slots. Both files share the 256-byte prefix but
/// interpret it differently: the buckets file carries the live coordination
/// state, the entries file carries the recovery journal.
mod header {
    /// `i32` — PID of the process holding the write lock, 0 when free.
    pub const LOCK_PID: usize = 0;
    /// `i64` — publication counter, bumped on write-lock release.
    pub const VERSION: usize = 8;
    /// `i64` — intent counter, bumped on write-lock acquisition.
    pub const NEXT_VERSION: usize = 16;
    /// `i32` — entry slots handed out so far (live + free-listed).
    pub const COUNT: usize = 24;
    /// `i32` — head of the free list, stored +1 biased (0 means empty).
    pub const FREE_LIST: usize = 32;
    /// `i32` — number of slots on the free list.
    pub const FREE_COUNT: usize = 40;
    /// `i32` — index into the prime table sizing both slot arrays.
    pub const GENERATION: usize = 48;

    /// `i32` — journal bitfield (entries file).
    pub const RECOVERY_FLAGS: usize = 0;
    /// `i32` — shadow of `count`, or the slot index a removal is freeing.
    pub const COUNT_COPY: usize = 24;
    /// `i32` — shadow of the free-list head (unbiased).
    pub const FREE_LIST_COPY: usize = 32;
    /// `i32` — shadow of `freeCount`.
    pub const FREE_COUNT_COPY: usize = 40;
    /// `i32` — shadow of an entry index or a bucket's previous head.
    pub const INDEX_COPY: usize = 48;
    /// `i32` — shadow of a bucket index or a predecessor's `next` link.
    pub const BUCKET_OR_LAST_NEXT_COPY: usize = 56;
    /// 8 bytes — pre-image of an entry's `{hashCode, next}` pair, saved when
    /// a step is about to destroy them (removal, or free-slot reuse).
    pub const SCRATCH: usize = super::HEADER_LEN - 8;
}

// ================================================================================================
// ERROR TYPES
// ================================================================================================

/// Errors surfaced by map operations.
///
/// A release-time lock handoff observing a foreign holder is not represented
/// here: it means another process stole the lock while this one was mutating,
/// no further action is safe, and the process aborts.
#[derive(Debug, thiserror::Error)]
pub enum MapError {
    /// The requested key is not present.
    #[error("key not found")]
    NotFound,
    /// An entry with the same key already exists.
    #[error("an entry with the same key already exists")]
    DuplicateKey,
    /// A key was required but missing (only reachable through boxed-key
    /// adapter layers; the typed surface cannot produce it).
    #[error("a key is required")]
    NullKey,
    /// Another live process holds the write lock and spinning gave up.
    #[error("write lock held by live process {holder}")]
    LockHeld {
        /// PID currently occupying the lock slot.
        holder: i32,
    },
    /// The map was mutated while an iterator was walking it.
    #[error("map was modified during iteration")]
    ConcurrentlyModified,
    /// The generation table is exhausted; the map cannot grow further.
    #[error("generation table exhausted; the map cannot grow further")]
    CapacityExceeded,
    /// On-disk state that recovery cannot reconcile.
    #[error("unrecoverable map state: {0}")]
    Corrupt(String),
    /// Underlying file or mapping failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Convenience alias for map results.
pub type Result<T> = std::result::Result<T, MapError>;

// ================================================================================================
// KEY HASHING
// ================================================================================================

/// Hashing and equality seam for map keys.
///
/// Implementations must be deterministic across process restarts: bucket
/// placement is persisted, so a hasher that changes between runs orphans
/// every stored entry.
pub trait KeyHasher<K> {
    /// Hash the key. The map keeps only the low 31 bits.
    fn hash(&self, key: &K) -> u32;
    /// Whether two keys are equal.
    fn equals(&self, a: &K, b: &K) -> bool;
}

/// Default [`KeyHasher`]: an `ahash` state with fixed seeds, folded to 32
/// bits. Fixed seeds keep the hash stable across processes, which the
/// persistent layout requires.
pub struct DefaultKeyHasher {
    state: RandomState,
}

impl Default for DefaultKeyHasher {
    fn default() -> Self {
        Self {
            state: RandomState::with_seeds(
                0x243f_6a88_85a3_08d3,
                0x1319_8a2e_0370_7344,
                0xa409_3822_299f_31d0,
                0x082e_fa98_ec4e_6c89,
            ),
        }
    }
}

impl<K: Hash + PartialEq> KeyHasher<K> for DefaultKeyHasher {
    #[inline(always)]
    fn hash(&self, key: &K) -> u32 {
        let h = self.state.hash_one(key);
        (h ^ (h >> 32)) as u32
    }

    #[inline(always)]
    fn equals(&self, a: &K, b: &K) -> bool {
        a == b
    }
}

// ================================================================================================
// FAULT INJECTION
// ================================================================================================

#[cfg(any(test, feature = "failpoints"))]
mod chaos {
    use std::sync::atomic::{AtomicI32, Ordering};

    /// Armable crash hook. Operations call `hit(n)` at labelled points; when
    /// scenario `n` is armed the hook disarms itself and panics, simulating a
    /// writer dying mid-step with the PID lock and journal flags left behind.
    /// Disarming first lets the post-recovery retry run to completion.
    #[derive(Default)]
    pub(crate) struct CrashPoint {
        armed: AtomicI32,
    }

    impl CrashPoint {
        pub(crate) fn arm(&self, scenario: i32) {
            self.armed.store(scenario, Ordering::Relaxed);
        }

        #[inline]
        pub(crate) fn hit(&self, scenario: i32) {
            if self.armed.load(Ordering::Relaxed) == scenario {
                self.armed.store(0, Ordering::Relaxed);
                panic!("injected crash at scenario {scenario}");
            }
        }
    }
}

#[cfg(not(any(test, feature = "failpoints")))]
mod chaos {
    /// No-op stand-in; every `hit` call compiles away in release builds.
    #[derive(Default)]
    pub(crate) struct CrashPoint;

    impl CrashPoint {
        #[inline(always)]
        pub(crate) fn hit(&self, _scenario: i32) {}
    }
}

use chaos::CrashPoint;

// ================================================================================================
// MAPPED REGION
// ================================================================================================

/// A growable file-backed memory region with a pinned base pointer.
///
/// All slot access goes through these primitives: aligned 32/64-bit atomic
/// load/store/CAS/fetch-add for the header and the integer fields of slots,
/// unaligned reads/writes for `Copy` payloads, and byte-wise copy/zero. The
/// `RwLock` guards only the mapping swap after file growth; data access takes
/// the read side, so in-process readers never observe a remap mid-access.
struct Region {
    file: File,
    map: RwLock<MmapRaw>,
}

impl Region {
    /// Open or create the file and map it. Fresh files are sized to the
    /// header; the tail grows on demand and never shrinks.
    fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        if file.metadata()?.len() < HEADER_LEN as u64 {
            file.set_len(HEADER_LEN as u64)?;
        }
        let map = MmapRaw::map_raw(&file)?;
        Ok(Self {
            file,
            map: RwLock::new(map),
        })
    }

    #[inline]
    fn len(&self) -> usize {
        self.map.read().len()
    }

    /// Extend the file to `new_len` and remap. Growth zero-fills, which the
    /// +1 bucket bias turns into valid "empty" state without a wipe pass.
    fn grow(&self, new_len: usize) -> Result<()> {
        if self.file.metadata()?.len() < new_len as u64 {
            self.file.set_len(new_len as u64)?;
        }
        let mut map = self.map.write();
        if map.len() < new_len {
            *map = MmapRaw::map_raw(&self.file)?;
        }
        Ok(())
    }

    /// Catch the mapping up with growth performed by another process.
    fn ensure_mapped(&self, need: usize) -> Result<()> {
        if self.map.read().len() >= need {
            return Ok(());
        }
        let mut map = self.map.write();
        if map.len() >= need {
            return Ok(());
        }
        if (self.file.metadata()?.len() as usize) < need {
            return Err(MapError::Corrupt(
                "mapped file is shorter than its generation requires".into(),
            ));
        }
        *map = MmapRaw::map_raw(&self.file)?;
        Ok(())
    }

    #[inline]
    fn load_i32(&self, off: usize, order: Ordering) -> i32 {
        let map = self.map.read();
        assert!(off + 4 <= map.len(), "load_i32 at {off} out of bounds");
        unsafe { (*(map.as_mut_ptr().add(off) as *const AtomicI32)).load(order) }
    }

    #[inline]
    fn store_i32(&self, off: usize, value: i32, order: Ordering) {
        let map = self.map.read();
        assert!(off + 4 <= map.len(), "store_i32 at {off} out of bounds");
        unsafe { (*(map.as_mut_ptr().add(off) as *const AtomicI32)).store(value, order) }
    }

    #[inline]
    fn cas_i32(
        &self,
        off: usize,
        current: i32,
        new: i32,
        order: Ordering,
    ) -> std::result::Result<i32, i32> {
        let map = self.map.read();
        assert!(off + 4 <= map.len(), "cas_i32 at {off} out of bounds");
        unsafe {
            (*(map.as_mut_ptr().add(off) as *const AtomicI32))
                .compare_exchange(current, new, order, Ordering::Relaxed)
        }
    }

    #[inline]
    fn load_i64(&self, off: usize, order: Ordering) -> i64 {
        let map = self.map.read();
        assert!(off + 8 <= map.len(), "load_i64 at {off} out of bounds");
        unsafe { (*(map.as_mut_ptr().add(off) as *const AtomicI64)).load(order) }
    }

    #[inline]
    fn store_i64(&self, off: usize, value: i64, order: Ordering) {
        let map = self.map.read();
        assert!(off + 8 <= map.len(), "store_i64 at {off} out of bounds");
        unsafe { (*(map.as_mut_ptr().add(off) as *const AtomicI64)).store(value, order) }
    }

    #[inline]
    fn fetch_add_i64(&self, off: usize, delta: i64, order: Ordering) -> i64 {
        let map = self.map.read();
        assert!(off + 8 <= map.len(), "fetch_add_i64 at {off} out of bounds");
        unsafe { (*(map.as_mut_ptr().add(off) as *const AtomicI64)).fetch_add(delta, order) }
    }

    /// Read a `Copy` payload. Not atomic: optimistic readers validate the
    /// version pair after reading and discard torn results.
    #[inline]
    fn read_val<T: Copy>(&self, off: usize) -> T {
        let map = self.map.read();
        assert!(
            off + mem::size_of::<T>() <= map.len(),
            "read_val at {off} out of bounds"
        );
        unsafe { ptr::read_unaligned(map.as_mut_ptr().add(off) as *const T) }
    }

    #[inline]
    fn write_val<T: Copy>(&self, off: usize, value: T) {
        let map = self.map.read();
        assert!(
            off + mem::size_of::<T>() <= map.len(),
            "write_val at {off} out of bounds"
        );
        unsafe { ptr::write_unaligned(map.as_mut_ptr().add(off) as *mut T, value) }
    }

    /// Byte-wise copy inside the region. Ranges may overlap.
    #[inline]
    fn copy(&self, dst: usize, src: usize, len: usize) {
        let map = self.map.read();
        assert!(
            dst + len <= map.len() && src + len <= map.len(),
            "copy out of bounds"
        );
        unsafe {
            let base = map.as_mut_ptr();
            ptr::copy(base.add(src), base.add(dst), len);
        }
    }

    #[inline]
    fn zero(&self, off: usize, len: usize) {
        let map = self.map.read();
        assert!(off + len <= map.len(), "zero out of bounds");
        unsafe { ptr::write_bytes(map.as_mut_ptr().add(off), 0, len) }
    }
}

// ================================================================================================
// MAIN FILEMAP STRUCTURE
// ================================================================================================

/// Persistent hash map over the file pair `P-buckets` / `P-entries`.
///
/// Keys and values are fixed-width `Copy` records stored raw in the entries
/// file. One process at a time may mutate (guarded by a PID slot in the
/// buckets header); any number of processes may read optimistically through
/// the version pair. A writer killed mid-operation is recovered by the next
/// lock holder from the journal in the entries header.
pub struct FileMap<K, V, H = DefaultKeyHasher> {
    buckets: Region,
    entries: Region,
    hasher: H,
    /// Bytes per entry slot: `{hashCode, next}` plus key plus value, padded
    /// to a multiple of 8 so the integer pair of every slot stays aligned.
    entry_size: usize,
    pid: i32,
    /// Serializes this process's threads ahead of the PID protocol, so a
    /// `lock_pid == self` observation can only mean a crashed operation.
    op_lock: Mutex<()>,
    chaos: CrashPoint,
    _marker: PhantomData<(K, V)>,
}

/// Result of a chain probe: the matching slot, its predecessor in the chain
/// (`-1` when the match is the bucket head), and the bucket the chain roots
/// at.
struct Probe {
    index: i32,
    prev: i32,
    bucket: i32,
}

// ================================================================================================
// CONSTRUCTORS
// ================================================================================================

impl<K, V> FileMap<K, V, DefaultKeyHasher>
where
    K: Copy + Hash + PartialEq,
    V: Copy,
{
    /// Open or create the map at `path` with the default capacity.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::with_capacity(path, DEFAULT_CAPACITY)
    }

    /// Open or create the map, sized for at least `capacity` entries before
    /// the first growth.
    pub fn with_capacity<P: AsRef<Path>>(path: P, capacity: usize) -> Result<Self> {
        Self::with_capacity_and_hasher(path, capacity, DefaultKeyHasher::default())
    }
}

impl<K, V, H> FileMap<K, V, H>
where
    K: Copy,
    V: Copy,
    H: KeyHasher<K>,
{
    /// Open or create the map using the provided hasher.
    ///
    /// The hasher must hash identically in every process that ever opens this
    /// file pair; bucket placement is persistent.
    pub fn with_hasher<P: AsRef<Path>>(path: P, hasher: H) -> Result<Self> {
        Self::with_capacity_and_hasher(path, DEFAULT_CAPACITY, hasher)
    }

    /// Open or create the map with an explicit capacity and hasher.
    ///
    /// Grows both files (and advances the stored generation) under the write
    /// lock when the on-disk state is smaller than `capacity` requires. An
    /// open that finds the files already large enough takes no lock; any
    /// pending journal from a crashed writer is replayed by the first
    /// operation that acquires the lock.
    pub fn with_capacity_and_hasher<P: AsRef<Path>>(
        path: P,
        capacity: usize,
        hasher: H,
    ) -> Result<Self> {
        let base = path.as_ref();
        let target = generation_for(capacity).ok_or(MapError::CapacityExceeded)?;
        let buckets = Region::open(&suffixed(base, "-buckets"))?;
        let entries = Region::open(&suffixed(base, "-entries"))?;
        let map = Self {
            buckets,
            entries,
            hasher,
            entry_size: entry_slot_size(mem::size_of::<K>(), mem::size_of::<V>()),
            pid: std::process::id() as i32,
            op_lock: Mutex::new(()),
            chaos: CrashPoint::default(),
            _marker: PhantomData,
        };

        let gen = map.buckets.load_i32(header::GENERATION, Ordering::Acquire);
        let sized = gen >= 0
            && (gen as usize) < PRIMES.len()
            && gen as usize >= target
            && map.buckets.len() >= HEADER_LEN + PRIMES[gen as usize] as usize * BUCKET_SLOT
            && map.entries.len() >= HEADER_LEN + PRIMES[gen as usize] as usize * map.entry_size;
        if !sized {
            map.write_lock(false, |recover| {
                if recover {
                    map.recover()?;
                }
                let gen = map.generation_checked()?;
                let goal = gen.max(target);
                let slots = PRIMES[goal] as usize;
                map.buckets.grow(HEADER_LEN + slots * BUCKET_SLOT)?;
                map.entries.grow(HEADER_LEN + slots * map.entry_size)?;
                if goal > gen {
                    map.buckets
                        .store_i32(header::GENERATION, goal as i32, Ordering::Release);
                }
                Ok(())
            })?;
        }

        tracing::info!(
            path = %base.display(),
            generation = map.buckets.load_i32(header::GENERATION, Ordering::Acquire),
            count = map.count(),
            "opened persistent map"
        );
        Ok(map)
    }

    // ============================================================================================
    // PUBLIC API METHODS
    // ============================================================================================

    /// Look up a key, returning a copy of its value.
    ///
    /// Runs lock-free under the optimistic read protocol; retries on version
    /// drift and escalates to a recovery pass if a writer appears to have
    /// died mid-operation.
    pub fn get(&self, key: &K) -> Result<Option<V>> {
        let h = self.hash_of(key);
        self.read_lock(|| {
            let gen = self.ensure_current_mapping()?;
            Ok(self.probe_chain(h, key, gen).map(|p| self.entry_value(p.index)))
        })
    }

    /// Look up a key that is expected to exist.
    pub fn fetch(&self, key: &K) -> Result<V> {
        self.get(key)?.ok_or(MapError::NotFound)
    }

    /// Whether the given key is present.
    pub fn contains_key(&self, key: &K) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Insert a key/value pair, overwriting the value if the key exists.
    ///
    /// # Arguments
    ///
    /// * `key` - The key to insert.
    /// * `value` - The value to associate with it.
    pub fn insert(&self, key: K, value: V) -> Result<()> {
        self.upsert(&key, &value, false).map(|_| ())
    }

    /// Insert a key/value pair, failing with [`MapError::DuplicateKey`] if
    /// the key is already present.
    pub fn add(&self, key: K, value: V) -> Result<()> {
        self.upsert(&key, &value, true).map(|_| ())
    }

    /// Remove the entry for `key`.
    ///
    /// # Returns
    ///
    /// * `Ok(true)` if a mapping was removed, `Ok(false)` if the key was
    ///   absent.
    pub fn remove(&self, key: &K) -> Result<bool> {
        let h = self.hash_of(key);
        self.write_lock(false, |recover| {
            if recover {
                self.recover()?;
            }
            let gen = self.ensure_current_mapping()?;
            let probe = match self.probe_chain(h, key, gen) {
                Some(p) => p,
                None => return Ok(false),
            };

            // Unlink phase: bypass the entry in its chain, journaling the
            // link about to change.
            if probe.prev < 0 {
                self.entries
                    .store_i32(header::BUCKET_OR_LAST_NEXT_COPY, probe.bucket, Ordering::Relaxed);
                self.entries.store_i32(
                    header::INDEX_COPY,
                    self.load_bucket(probe.bucket),
                    Ordering::Relaxed,
                );
                self.chaos.hit(71);
                self.set_recovery_flags(FLAG_HEAD_UNLINK);
                self.chaos.hit(72);
                self.store_bucket(probe.bucket, self.entry_next(probe.index));
            } else {
                self.entries
                    .store_i32(header::INDEX_COPY, probe.prev, Ordering::Relaxed);
                self.entries.store_i32(
                    header::BUCKET_OR_LAST_NEXT_COPY,
                    self.entry_next(probe.prev),
                    Ordering::Relaxed,
                );
                self.chaos.hit(71);
                self.set_recovery_flags(FLAG_CHAIN_UNLINK);
                self.chaos.hit(72);
                self.set_entry_next(probe.prev, self.entry_next(probe.index));
            }
            self.chaos.hit(73);

            // Free-list phase: the slot's {hashCode, next} pair is about to
            // be destroyed, so its pre-image goes to the scratch slot. The
            // key and value are deliberately left in place; replay needs
            // them intact to reconstitute the entry.
            let flags = self.recovery_flags();
            self.entries
                .store_i32(header::COUNT_COPY, probe.index, Ordering::Relaxed);
            self.entries
                .store_i32(header::FREE_LIST_COPY, self.free_list(), Ordering::Relaxed);
            self.entries
                .store_i32(header::FREE_COUNT_COPY, self.free_count(), Ordering::Relaxed);
            self.entries.copy(header::SCRATCH, self.entry_off(probe.index), 8);
            self.set_recovery_flags(flags | FLAG_FREE_PUSH);
            self.chaos.hit(74);
            self.set_entry_hash(probe.index, FREE_HASH_CODE);
            self.set_entry_next(probe.index, self.free_list());
            self.set_free_list(probe.index);
            self.set_free_count(self.free_count() + 1);
            self.chaos.hit(75);
            self.set_recovery_flags(0);
            Ok(true)
        })
    }

    /// Remove every entry.
    pub fn clear(&self) -> Result<()> {
        self.write_lock(false, |recover| {
            if recover {
                self.recover()?;
            }
            self.ensure_current_mapping()?;
            self.set_recovery_flags(FLAG_WIPE);
            self.wipe()?;
            self.set_recovery_flags(0);
            Ok(())
        })
    }

    /// Number of live entries.
    pub fn len(&self) -> Result<usize> {
        self.read_lock(|| {
            self.ensure_current_mapping()?;
            Ok((self.count() - self.free_count()).max(0) as usize)
        })
    }

    /// Whether the map holds no live entries.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Slot capacity of the current generation.
    pub fn capacity(&self) -> Result<usize> {
        self.read_lock(|| {
            let gen = self.ensure_current_mapping()?;
            Ok(PRIMES[gen] as usize)
        })
    }

    /// Iterate over the live entries.
    ///
    /// The iterator snapshots the map version at creation and fails fast: if
    /// any writer commits while iteration is in progress, the next item is
    /// `Err(ConcurrentlyModified)` and the iterator ends. Each yielded pair
    /// is validated against the snapshot after its bytes are read, so a torn
    /// pair is never returned as `Ok`.
    pub fn iter(&self) -> Result<Iter<'_, K, V, H>> {
        let (version, count) = self.read_lock(|| {
            self.ensure_current_mapping()?;
            Ok((
                self.buckets.load_i64(header::VERSION, Ordering::Acquire),
                self.count(),
            ))
        })?;
        Ok(Iter {
            map: self,
            version,
            count,
            index: 0,
            done: false,
        })
    }

    // ============================================================================================
    // HEADER ACCESSORS
    // ============================================================================================

    #[inline(always)]
    fn count(&self) -> i32 {
        self.buckets.load_i32(header::COUNT, Ordering::Relaxed)
    }

    #[inline(always)]
    fn set_count(&self, value: i32) {
        self.buckets.store_i32(header::COUNT, value, Ordering::Relaxed);
    }

    #[inline(always)]
    fn free_list(&self) -> i32 {
        // Stored +1 biased so a zeroed header reads as "no free list".
        self.buckets.load_i32(header::FREE_LIST, Ordering::Relaxed) - 1
    }

    #[inline(always)]
    fn set_free_list(&self, value: i32) {
        self.buckets
            .store_i32(header::FREE_LIST, value + 1, Ordering::Relaxed);
    }

    #[inline(always)]
    fn free_count(&self) -> i32 {
        self.buckets.load_i32(header::FREE_COUNT, Ordering::Relaxed)
    }

    #[inline(always)]
    fn set_free_count(&self, value: i32) {
        self.buckets
            .store_i32(header::FREE_COUNT, value, Ordering::Relaxed);
    }

    #[inline(always)]
    fn recovery_flags(&self) -> i32 {
        self.entries.load_i32(header::RECOVERY_FLAGS, Ordering::Acquire)
    }

    #[inline(always)]
    fn set_recovery_flags(&self, value: i32) {
        self.entries
            .store_i32(header::RECOVERY_FLAGS, value, Ordering::Release);
    }

    fn generation_checked(&self) -> Result<usize> {
        let gen = self.buckets.load_i32(header::GENERATION, Ordering::Acquire);
        if gen < 0 || gen as usize >= PRIMES.len() {
            return Err(MapError::Corrupt(format!(
                "generation {gen} outside the prime table"
            )));
        }
        Ok(gen as usize)
    }

    /// Validate the stored generation and catch both mappings up with it.
    /// Returns the generation.
    fn ensure_current_mapping(&self) -> Result<usize> {
        let gen = self.generation_checked()?;
        let slots = PRIMES[gen] as usize;
        self.buckets.ensure_mapped(HEADER_LEN + slots * BUCKET_SLOT)?;
        self.entries
            .ensure_mapped(HEADER_LEN + slots * self.entry_size)?;
        Ok(gen)
    }

    // ============================================================================================
    // BUCKET AND ENTRY ACCESSORS
    // ============================================================================================

    #[inline(always)]
    fn bucket_off(index: i32) -> usize {
        HEADER_LEN + index as usize * BUCKET_SLOT
    }

    /// Logical bucket head (stored +1 biased; a zeroed page reads as -1).
    #[inline(always)]
    fn load_bucket(&self, index: i32) -> i32 {
        self.buckets.load_i32(Self::bucket_off(index), Ordering::Relaxed) - 1
    }

    #[inline(always)]
    fn store_bucket(&self, index: i32, head: i32) {
        self.buckets
            .store_i32(Self::bucket_off(index), head + 1, Ordering::Relaxed);
    }

    #[inline(always)]
    fn entry_off(&self, index: i32) -> usize {
        HEADER_LEN + index as usize * self.entry_size
    }

    #[inline(always)]
    fn entry_hash(&self, index: i32) -> i32 {
        self.entries.load_i32(self.entry_off(index), Ordering::Relaxed)
    }

    #[inline(always)]
    fn set_entry_hash(&self, index: i32, hash: i32) {
        self.entries
            .store_i32(self.entry_off(index), hash, Ordering::Relaxed);
    }

    #[inline(always)]
    fn entry_next(&self, index: i32) -> i32 {
        self.entries
            .load_i32(self.entry_off(index) + 4, Ordering::Relaxed)
    }

    #[inline(always)]
    fn set_entry_next(&self, index: i32, next: i32) {
        self.entries
            .store_i32(self.entry_off(index) + 4, next, Ordering::Relaxed);
    }

    #[inline(always)]
    fn entry_key(&self, index: i32) -> K {
        self.entries.read_val(self.entry_off(index) + 8)
    }

    #[inline(always)]
    fn entry_value(&self, index: i32) -> V {
        self.entries
            .read_val(self.entry_off(index) + 8 + mem::size_of::<K>())
    }

    #[inline(always)]
    fn set_entry_value(&self, index: i32, value: &V) {
        self.entries
            .write_val(self.entry_off(index) + 8 + mem::size_of::<K>(), *value);
    }

    fn write_entry(&self, index: i32, hash: i32, next: i32, key: &K, value: &V) {
        let off = self.entry_off(index);
        self.entries.store_i32(off, hash, Ordering::Relaxed);
        self.entries.store_i32(off + 4, next, Ordering::Relaxed);
        self.entries.write_val(off + 8, *key);
        self.entries.write_val(off + 8 + mem::size_of::<K>(), *value);
    }

    #[inline(always)]
    fn hash_of(&self, key: &K) -> i32 {
        (self.hasher.hash(key) & 0x7fff_ffff) as i32
    }

    // ============================================================================================
    // LOCKING
    // ============================================================================================

    /// Run `body` under the cross-process write lock.
    ///
    /// `body` receives `true` when the lock was stolen from a dead holder, in
    /// which case it must replay the journal before touching anything else.
    /// With `fix_versions` the version pair is repaired (`nextVersion :=
    /// version`) instead of advanced; that is the read-escalation path, which
    /// must not look like a new publication.
    fn write_lock<T>(&self, fix_versions: bool, body: impl FnOnce(bool) -> Result<T>) -> Result<T> {
        let _serial = self.op_lock.lock();
        let recover = self.acquire_write(fix_versions)?;
        let result = body(recover);
        self.release_write(fix_versions);
        result
    }

    fn acquire_write(&self, fix_versions: bool) -> Result<bool> {
        let mut spins = 0;
        loop {
            if self
                .buckets
                .cas_i32(header::LOCK_PID, 0, self.pid, Ordering::Acquire)
                .is_ok()
            {
                if !fix_versions {
                    self.buckets
                        .fetch_add_i64(header::NEXT_VERSION, 1, Ordering::AcqRel);
                }
                return Ok(false);
            }
            if spins < SPIN_LIMIT {
                spins += 1;
                std::hint::spin_loop();
                continue;
            }

            let holder = self.buckets.load_i32(header::LOCK_PID, Ordering::Relaxed);
            if holder == 0 {
                spins = 0;
                continue;
            }
            if holder != self.pid && process_alive(holder) {
                return Err(MapError::LockHeld { holder });
            }
            // Holder is dead, or is this process itself (a crashed operation
            // left the lock behind). Steal it and schedule recovery.
            if self
                .buckets
                .cas_i32(header::LOCK_PID, holder, self.pid, Ordering::Acquire)
                .is_ok()
            {
                tracing::warn!(stolen_from = holder, "took over orphaned write lock");
                if !fix_versions {
                    // The dead writer may have died on either side of its own
                    // increment; normalize to the held-lock invariant.
                    let version = self.buckets.load_i64(header::VERSION, Ordering::Acquire);
                    self.buckets
                        .store_i64(header::NEXT_VERSION, version + 1, Ordering::Release);
                }
                return Ok(true);
            }
            spins = 0;
        }
    }

    fn release_write(&self, fix_versions: bool) {
        if self
            .buckets
            .cas_i32(header::LOCK_PID, self.pid, 0, Ordering::Release)
            .is_err()
        {
            // Another process decided this one was dead and stole the lock
            // while the body was running; both sides may have mutated. No
            // further action is safe.
            let holder = self.buckets.load_i32(header::LOCK_PID, Ordering::Relaxed);
            tracing::error!(
                expected = self.pid,
                found = holder,
                "write lock changed hands while held; aborting"
            );
            std::process::abort();
        }
        if fix_versions {
            let version = self.buckets.load_i64(header::VERSION, Ordering::Acquire);
            self.buckets
                .store_i64(header::NEXT_VERSION, version, Ordering::Release);
        } else {
            self.buckets.fetch_add_i64(header::VERSION, 1, Ordering::Release);
        }
    }

    /// Run `body` under the optimistic read protocol.
    ///
    /// `body` executes between an acquire-load of `version` and one of
    /// `nextVersion`; the result only counts when the two agree. It must
    /// tolerate torn state: bounded walks, clamped indexes, no panics on
    /// garbage. After `SPIN_LIMIT` mismatches the reader assumes an orphaned
    /// writer and escalates to a version-fixing recovery pass.
    fn read_lock<T>(&self, body: impl Fn() -> Result<T>) -> Result<T> {
        loop {
            let mut spins = 0;
            loop {
                let v1 = self.buckets.load_i64(header::VERSION, Ordering::Acquire);
                let out = body();
                let v2 = self.buckets.load_i64(header::NEXT_VERSION, Ordering::Acquire);
                if v1 == v2 {
                    return out;
                }
                spins += 1;
                if spins >= SPIN_LIMIT {
                    break;
                }
                std::hint::spin_loop();
            }
            self.write_lock(true, |_| self.recover())?;
        }
    }

    // ============================================================================================
    // HASH-TABLE INTERNALS
    // ============================================================================================

    /// Walk the chains for `key` across every generation, newest first.
    ///
    /// Entries are never rehashed on growth, so a key inserted under an older
    /// generation still hangs off `hash % primes[g]` for that older `g`. The
    /// walk clamps indexes and bounds its step count so that torn state seen
    /// by lock-free readers cannot fault or loop; a consistent result is
    /// guaranteed only once the caller's version check passes.
    fn probe_chain(&self, h: i32, key: &K, gen: usize) -> Option<Probe> {
        let cap = PRIMES[gen];
        for g in (0..=gen).rev() {
            let bucket = h % PRIMES[g];
            let mut prev = -1i32;
            let mut idx = self.load_bucket(bucket);
            let mut steps = 0;
            while idx >= 0 && idx < cap && steps <= cap {
                if self.entry_hash(idx) == h && self.hasher.equals(&self.entry_key(idx), key) {
                    return Some(Probe {
                        index: idx,
                        prev,
                        bucket,
                    });
                }
                prev = idx;
                idx = self.entry_next(idx);
                steps += 1;
            }
        }
        None
    }

    /// Shared implementation of [`FileMap::insert`] and [`FileMap::add`].
    /// Returns whether a new entry was created.
    fn upsert(&self, key: &K, value: &V, add_only: bool) -> Result<bool> {
        let h = self.hash_of(key);
        self.write_lock(false, |recover| {
            if recover {
                self.recover()?;
            }
            let gen = self.ensure_current_mapping()?;

            // Phase A: the key may already exist in any generation.
            if let Some(probe) = self.probe_chain(h, key, gen) {
                if add_only {
                    return Err(MapError::DuplicateKey);
                }
                // Overwrite in place, snapshotting the old {key, value} into
                // an unused slot first: the head of the free list if there is
                // one, otherwise the first never-used slot.
                let snap = if self.free_count() > 0 {
                    self.free_list()
                } else {
                    if self.count() >= PRIMES[gen] {
                        self.resize()?;
                    }
                    self.count()
                };
                self.entries.copy(
                    self.entry_off(snap) + 8,
                    self.entry_off(probe.index) + 8,
                    self.entry_size - 8,
                );
                self.chaos.hit(11);
                self.entries
                    .store_i32(header::INDEX_COPY, probe.index, Ordering::Relaxed);
                self.set_recovery_flags(FLAG_VALUE_UPDATE);
                self.chaos.hit(12);
                self.set_entry_value(probe.index, value);
                self.chaos.hit(13);
                self.set_recovery_flags(0);
                return Ok(false);
            }

            // Phase B: acquire a slot for the new entry.
            let mut flags;
            let index;
            if self.free_count() > 0 {
                index = self.free_list();
                self.chaos.hit(21);
                // The slot's {hashCode, next} pair is about to be overwritten
                // by the new record; save its pre-image so replay can put the
                // slot back on the free list intact.
                self.entries.copy(header::SCRATCH, self.entry_off(index), 8);
                self.chaos.hit(22);
                self.entries
                    .store_i32(header::FREE_LIST_COPY, self.free_list(), Ordering::Relaxed);
                self.entries
                    .store_i32(header::FREE_COUNT_COPY, self.free_count(), Ordering::Relaxed);
                self.chaos.hit(23);
                flags = FLAG_FREE_TAKE;
                self.set_recovery_flags(flags);
                self.chaos.hit(24);
                self.set_free_list(self.entry_next(index));
                self.chaos.hit(25);
                self.set_free_count(self.free_count() - 1);
                self.chaos.hit(26);
            } else {
                if self.count() >= PRIMES[gen] {
                    self.resize()?;
                }
                index = self.count();
                self.chaos.hit(31);
                self.entries
                    .store_i32(header::COUNT_COPY, index, Ordering::Relaxed);
                self.chaos.hit(32);
                flags = FLAG_COUNT_BUMP;
                self.set_recovery_flags(flags);
                self.chaos.hit(33);
                self.set_count(index + 1);
                self.chaos.hit(34);
                self.chaos.hit(35);
            }

            // The bucket is computed after slot acquisition: a resize just
            // above advanced the generation, and new entries always use the
            // newest modulus.
            let gen = self.generation_checked()?;
            let target = h % PRIMES[gen];
            let head = self.load_bucket(target);
            self.entries
                .store_i32(header::BUCKET_OR_LAST_NEXT_COPY, target, Ordering::Relaxed);
            self.entries.store_i32(header::INDEX_COPY, head, Ordering::Relaxed);
            self.chaos.hit(41);
            flags |= FLAG_BUCKET_PUBLISH;
            self.set_recovery_flags(flags);
            self.chaos.hit(42);
            self.write_entry(index, h, head, key, value);
            self.chaos.hit(43);
            self.store_bucket(target, index);
            self.chaos.hit(44);
            self.set_recovery_flags(0);
            Ok(true)
        })
    }

    /// Advance to the next generation, growing both files. Existing entries
    /// stay where they are; they remain reachable through probes against the
    /// older moduli. A crash between the steps below leaves benignly
    /// oversized files and needs no journal entry.
    fn resize(&self) -> Result<()> {
        let gen = self.generation_checked()?;
        let next = gen + 1;
        if next >= PRIMES.len() {
            return Err(MapError::CapacityExceeded);
        }
        let slots = PRIMES[next] as usize;
        self.buckets.grow(HEADER_LEN + slots * BUCKET_SLOT)?;
        self.chaos.hit(51);
        self.entries.grow(HEADER_LEN + slots * self.entry_size)?;
        self.chaos.hit(52);
        self.buckets
            .store_i32(header::GENERATION, next as i32, Ordering::Release);
        tracing::info!(generation = next, slots, "advanced map generation");
        Ok(())
    }

    /// Reset the table to the empty state: every bucket head cleared, every
    /// handed-out entry slot zeroed, counters reset. Also the replay action
    /// for an interrupted clear, so it must cope with arbitrary partial
    /// progress of itself.
    fn wipe(&self) -> Result<()> {
        let gen = self.generation_checked()?;
        let slots = PRIMES[gen] as usize;
        // Zero bytes are the biased encoding of "empty bucket".
        self.buckets.zero(HEADER_LEN, slots * BUCKET_SLOT);
        self.chaos.hit(6);
        let used = self.count().max(0) as usize;
        self.entries.zero(HEADER_LEN, used * self.entry_size);
        self.set_free_list(-1);
        self.set_count(0);
        self.set_free_count(0);
        Ok(())
    }

    // ============================================================================================
    // RECOVERY
    // ============================================================================================

    /// Replay the journal left by an interrupted writer.
    ///
    /// Bits are processed highest-first; each action restores the pre-image
    /// its step journaled (the wipe bit re-runs the wipe instead, which is
    /// idempotent), then the bit clears. Runs only under the write lock.
    /// Indexes read from shadow slots are validated before use; an unknown
    /// bit or an out-of-range shadow is unreconcilable.
    fn recover(&self) -> Result<()> {
        if self.recovery_flags() == 0 {
            return Ok(());
        }
        tracing::warn!(
            flags = self.recovery_flags(),
            "replaying journal left by an interrupted writer"
        );
        let gen = self.ensure_current_mapping()?;
        let cap = PRIMES[gen];
        loop {
            let flags = self.recovery_flags();
            if flags == 0 {
                return Ok(());
            }
            if flags & !FLAG_ALL != 0 {
                return Err(MapError::Corrupt(format!(
                    "unknown recovery flag bits {flags:#x}"
                )));
            }
            let bit = 1i32 << (31 - flags.leading_zeros());
            match bit {
                FLAG_WIPE => {
                    self.wipe()?;
                }
                FLAG_FREE_PUSH => {
                    // Un-free the removed slot: counters back, then the
                    // slot's {hashCode, next} pre-image from scratch. Its
                    // key and value were never overwritten.
                    let index = self.shadow_slot(header::COUNT_COPY, cap)?;
                    self.set_free_list(
                        self.entries.load_i32(header::FREE_LIST_COPY, Ordering::Relaxed),
                    );
                    self.set_free_count(
                        self.entries.load_i32(header::FREE_COUNT_COPY, Ordering::Relaxed),
                    );
                    self.entries.copy(self.entry_off(index), header::SCRATCH, 8);
                }
                FLAG_CHAIN_UNLINK => {
                    let last = self.shadow_slot(header::INDEX_COPY, cap)?;
                    let next = self
                        .entries
                        .load_i32(header::BUCKET_OR_LAST_NEXT_COPY, Ordering::Relaxed);
                    self.set_entry_next(last, next);
                }
                FLAG_HEAD_UNLINK | FLAG_BUCKET_PUBLISH => {
                    let bucket = self.shadow_slot(header::BUCKET_OR_LAST_NEXT_COPY, cap)?;
                    let head = self.entries.load_i32(header::INDEX_COPY, Ordering::Relaxed);
                    self.store_bucket(bucket, head);
                }
                FLAG_COUNT_BUMP => {
                    let count = self.shadow_slot(header::COUNT_COPY, cap)?;
                    self.set_count(count);
                }
                FLAG_FREE_TAKE => {
                    // Put the reused slot back at the head of the free list,
                    // reconstituting its {hashCode, next} pair from scratch.
                    let index = self.shadow_slot(header::FREE_LIST_COPY, cap)?;
                    self.set_free_list(index);
                    self.set_free_count(
                        self.entries.load_i32(header::FREE_COUNT_COPY, Ordering::Relaxed),
                    );
                    self.entries.copy(self.entry_off(index), header::SCRATCH, 8);
                }
                FLAG_VALUE_UPDATE => {
                    // The snapshot slot is recomputed exactly as the forward
                    // path chose it; that path mutates neither the free list
                    // nor the count, so the choice is stable.
                    let index = self.shadow_slot(header::INDEX_COPY, cap)?;
                    let snap = if self.free_count() > 0 {
                        self.free_list()
                    } else {
                        self.count()
                    };
                    if snap < 0 || snap >= cap {
                        return Err(MapError::Corrupt(format!(
                            "value-update snapshot slot {snap} out of range"
                        )));
                    }
                    self.entries.copy(
                        self.entry_off(index) + 8,
                        self.entry_off(snap) + 8,
                        self.entry_size - 8,
                    );
                }
                _ => unreachable!("flag bits validated above"),
            }
            self.set_recovery_flags(flags & !bit);
        }
    }

    /// Load a journaled slot index, rejecting anything outside the table.
    fn shadow_slot(&self, off: usize, cap: i32) -> Result<i32> {
        let value = self.entries.load_i32(off, Ordering::Relaxed);
        if value < 0 || value >= cap {
            return Err(MapError::Corrupt(format!(
                "journal slot at offset {off} holds out-of-range index {value}"
            )));
        }
        Ok(value)
    }
}

#[cfg(any(test, feature = "failpoints"))]
impl<K, V, H> FileMap<K, V, H> {
    /// Arm a crash point: the next operation on this handle that reaches the
    /// labelled scenario panics mid-step, leaving the lock and journal behind
    /// exactly as a killed process would.
    pub fn arm_crash_point(&self, scenario: i32) {
        self.chaos.arm(scenario);
    }
}

// ================================================================================================
// ITERATOR
// ================================================================================================

/// Lazy iterator over the live entries of a [`FileMap`].
///
/// Yields `Err(ConcurrentlyModified)` once and then ends if any writer
/// commits after the iterator was created.
pub struct Iter<'a, K, V, H> {
    map: &'a FileMap<K, V, H>,
    version: i64,
    count: i32,
    index: i32,
    done: bool,
}

impl<K, V, H> Iterator for Iter<'_, K, V, H>
where
    K: Copy,
    V: Copy,
    H: KeyHasher<K>,
{
    type Item = Result<(K, V)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        while self.index < self.count {
            let index = self.index;
            self.index += 1;
            if self.map.entry_hash(index) < 0 {
                continue;
            }
            let key = self.map.entry_key(index);
            let value = self.map.entry_value(index);
            // Validate after reading so a torn pair is never yielded as Ok.
            let version = self.map.buckets.load_i64(header::VERSION, Ordering::Acquire);
            if version != self.version {
                self.done = true;
                return Some(Err(MapError::ConcurrentlyModified));
            }
            return Some(Ok((key, value)));
        }
        self.done = true;
        None
    }
}

// ================================================================================================
// UTILITY FUNCTIONS
// ================================================================================================

/// Smallest generation whose prime covers `capacity`.
fn generation_for(capacity: usize) -> Option<usize> {
    PRIMES.iter().position(|&p| p as usize >= capacity)
}

/// Entry slot size: the `{hashCode, next}` pair plus raw key and value bytes,
/// padded to a multiple of 8 so every slot's integer pair stays aligned.
const fn entry_slot_size(key_size: usize, value_size: usize) -> usize {
    let raw = 8 + key_size + value_size;
    (raw + 7) & !7
}

/// `base` with `suffix` appended to its file name.
fn suffixed(base: &Path, suffix: &str) -> PathBuf {
    let mut name = base
        .file_name()
        .map_or_else(OsString::new, |n| n.to_os_string());
    name.push(suffix);
    base.with_file_name(name)
}

/// Whether the operating system still knows `pid`. Signal 0 probes liveness
/// without delivering anything; EPERM still means the process exists.
#[cfg(unix)]
fn process_alive(pid: i32) -> bool {
    if unsafe { libc::kill(pid as libc::pid_t, 0) } == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
}

/// Without a liveness probe, foreign holders are assumed alive: the lock is
/// never stolen from another process, only from this one's crashed
/// operations.
#[cfg(not(unix))]
fn process_alive(_pid: i32) -> bool {
    true
}

// ================================================================================================
// TESTS
// ================================================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, HashMap, HashSet};
    use std::panic::{catch_unwind, AssertUnwindSafe};
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::thread;
    use tempfile::TempDir;

    type TestMap = FileMap<i64, i64>;

    /// Serializes panic-hook swaps across concurrently running crash tests.
    static PANIC_HOOK_LOCK: Mutex<()> = Mutex::new(());

    fn open_map(dir: &TempDir, capacity: usize) -> TestMap {
        FileMap::with_capacity(dir.path().join("map"), capacity).unwrap()
    }

    fn contents(map: &TestMap) -> BTreeMap<i64, i64> {
        map.iter()
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap()
            .into_iter()
            .collect()
    }

    /// Run `op`, expecting it to die at an armed crash point. The panic hook
    /// is silenced for the duration so the injected panics don't spam the
    /// test output.
    fn crash<F: FnOnce()>(op: F) {
        let _serial = PANIC_HOOK_LOCK.lock();
        let hook = std::panic::take_hook();
        std::panic::set_hook(Box::new(|_| {}));
        let result = catch_unwind(AssertUnwindSafe(op));
        std::panic::set_hook(hook);
        assert!(result.is_err(), "armed crash point was not reached");
    }

    /// Structural check of the at-rest state: header consistency, chain
    /// coverage, free-list integrity, stored hashes.
    fn check_invariants(map: &TestMap) {
        assert_eq!(map.buckets.load_i32(header::LOCK_PID, Ordering::Relaxed), 0);
        assert_eq!(
            map.buckets.load_i64(header::VERSION, Ordering::Relaxed),
            map.buckets.load_i64(header::NEXT_VERSION, Ordering::Relaxed),
        );
        assert_eq!(map.recovery_flags(), 0);

        let gen = map.generation_checked().unwrap();
        let cap = PRIMES[gen];
        let count = map.count();
        let free_count = map.free_count();
        assert!((0..=cap).contains(&count));
        assert!((0..=count).contains(&free_count));

        // Live slots, by direct scan.
        let mut live = HashSet::new();
        for i in 0..count {
            if map.entry_hash(i) >= 0 {
                live.insert(i);
                assert_eq!(
                    map.entry_hash(i),
                    map.hash_of(&map.entry_key(i)),
                    "stored hash does not match key at slot {i}"
                );
            }
        }
        assert_eq!(live.len() as i32, count - free_count);

        // Every chain, across all bucket indexes, visits every live slot
        // exactly once and nothing else.
        let mut chained = HashSet::new();
        for b in 0..cap {
            let mut idx = map.load_bucket(b);
            let mut steps = 0;
            while idx >= 0 {
                assert!(idx < count, "bucket {b} chain reaches slot {idx} >= count");
                assert!(chained.insert(idx), "slot {idx} linked from two places");
                assert!(live.contains(&idx), "bucket {b} chain reaches a free slot");
                idx = map.entry_next(idx);
                steps += 1;
                assert!(steps <= cap, "cycle in bucket {b}");
            }
        }
        assert_eq!(chained, live);

        // The free list holds exactly freeCount distinct free slots.
        let mut freed = HashSet::new();
        let mut idx = map.free_list();
        while idx >= 0 {
            assert!(idx < count, "free list reaches slot {idx} >= count");
            assert!(freed.insert(idx), "slot {idx} on the free list twice");
            assert_eq!(map.entry_hash(idx), FREE_HASH_CODE);
            assert!(
                freed.len() as i32 <= free_count,
                "free list longer than freeCount"
            );
            idx = map.entry_next(idx);
        }
        assert_eq!(freed.len() as i32, free_count);
        assert_eq!(map.free_list() == -1, free_count == 0);
    }

    /// Two keys whose hashes land in the same bucket of the current
    /// generation; the second insert chains behind the first.
    fn colliding_pair(map: &TestMap) -> (i64, i64) {
        let gen = map.generation_checked().unwrap();
        let modulus = PRIMES[gen];
        let mut first: HashMap<i32, i64> = HashMap::new();
        for k in 0..10_000i64 {
            let bucket = map.hash_of(&k) % modulus;
            if let Some(&other) = first.get(&bucket) {
                return (other, k);
            }
            first.insert(bucket, k);
        }
        unreachable!("no bucket collision in 10k keys");
    }

    // ------------------------------------------------------------------------------------------
    // Plain behavior
    // ------------------------------------------------------------------------------------------

    #[test]
    fn test_fresh_open_matches_empty_layout() {
        let dir = tempfile::tempdir().unwrap();
        let map = open_map(&dir, 5);
        // First prime >= 5 is 7, at generation 1.
        assert_eq!(map.generation_checked().unwrap(), 1);
        assert_eq!(map.capacity().unwrap(), 7);
        assert_eq!(map.count(), 0);
        assert_eq!(map.free_count(), 0);
        assert_eq!(map.free_list(), -1);
        for b in 0..7 {
            assert_eq!(map.load_bucket(b), -1);
        }
        check_invariants(&map);
    }

    #[test]
    fn test_removed_slot_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let map = open_map(&dir, 5);
        map.add(1, 10).unwrap();
        map.add(2, 20).unwrap();
        assert!(map.remove(&1).unwrap());
        map.add(3, 30).unwrap();

        assert_eq!(contents(&map), BTreeMap::from([(2, 20), (3, 30)]));
        assert_eq!(map.count(), 2, "slot freed by 1 must be reused by 3");
        assert_eq!(map.free_count(), 0);
        check_invariants(&map);
    }

    #[test]
    fn test_growth_keeps_every_generation_reachable() {
        let dir = tempfile::tempdir().unwrap();
        let map = open_map(&dir, 5);
        let initial_gen = map.generation_checked().unwrap();
        for k in 0..1000i64 {
            map.insert(k, k * 7).unwrap();
        }
        assert!(map.generation_checked().unwrap() > initial_gen);
        assert_eq!(map.len().unwrap(), 1000);
        for k in 0..1000i64 {
            assert_eq!(map.get(&k).unwrap(), Some(k * 7), "key {k} lost in growth");
        }
        check_invariants(&map);
    }

    #[test]
    fn test_clear_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let map = open_map(&dir, 5);
        for k in 0..20i64 {
            map.insert(k, k).unwrap();
        }
        map.clear().unwrap();
        assert_eq!(map.len().unwrap(), 0);
        check_invariants(&map);
        map.clear().unwrap();
        assert_eq!(map.len().unwrap(), 0);
        check_invariants(&map);
        map.insert(1, 1).unwrap();
        assert_eq!(map.len().unwrap(), 1);
        check_invariants(&map);
    }

    #[test]
    fn test_iterator_fails_fast_on_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let map = open_map(&dir, 5);
        for k in 0..3i64 {
            map.insert(k, k).unwrap();
        }
        let mut iter = map.iter().unwrap();
        map.insert(10, 100).unwrap();
        assert!(matches!(
            iter.find(|item| item.is_err()),
            Some(Err(MapError::ConcurrentlyModified))
        ));
        assert!(iter.next().is_none(), "iterator must end after failing");
    }

    #[test]
    fn test_reads_succeed_while_foreign_live_process_holds_lock() {
        let dir = tempfile::tempdir().unwrap();
        let map = open_map(&dir, 5);
        map.insert(1, 10).unwrap();
        if std::process::id() == 1 {
            return; // cannot fake a foreign live holder from pid 1
        }
        // PID 1 always exists; probing it yields EPERM, not ESRCH.
        map.buckets.store_i32(header::LOCK_PID, 1, Ordering::Relaxed);
        assert_eq!(map.get(&1).unwrap(), Some(10));
        match map.insert(2, 20) {
            Err(MapError::LockHeld { holder: 1 }) => {}
            other => panic!("expected LockHeld, got {other:?}"),
        }
        map.buckets.store_i32(header::LOCK_PID, 0, Ordering::Relaxed);
        check_invariants(&map);
    }

    #[test]
    fn test_concurrent_readers_see_consistent_values() {
        let dir = tempfile::tempdir().unwrap();
        let map = Arc::new(open_map(&dir, 5));
        map.insert(1, 10).unwrap();

        let stop = Arc::new(AtomicBool::new(false));
        let readers: Vec<_> = (0..3)
            .map(|_| {
                let map = Arc::clone(&map);
                let stop = Arc::clone(&stop);
                thread::spawn(move || {
                    while !stop.load(Ordering::Relaxed) {
                        match map.get(&1) {
                            Ok(Some(10)) | Ok(Some(11)) => {}
                            other => panic!("torn or failed read: {other:?}"),
                        }
                    }
                })
            })
            .collect();

        for _ in 0..2000 {
            map.insert(1, 11).unwrap();
            map.insert(1, 10).unwrap();
        }
        stop.store(true, Ordering::Relaxed);
        for reader in readers {
            reader.join().unwrap();
        }
        check_invariants(&map);
    }

    // ------------------------------------------------------------------------------------------
    // Crash matrix
    // ------------------------------------------------------------------------------------------

    #[test]
    fn test_crash_during_value_update_rolls_back() {
        for scenario in [11, 12, 13] {
            // Snapshot slot taken past `count`.
            let dir = tempfile::tempdir().unwrap();
            let map = open_map(&dir, 5);
            map.insert(1, 10).unwrap();
            map.chaos.arm(scenario);
            crash(|| {
                let _ = map.insert(1, 99);
            });
            drop(map);

            let map = open_map(&dir, 5);
            assert_eq!(map.get(&1).unwrap(), Some(10), "scenario {scenario}");
            assert_eq!(map.len().unwrap(), 1);
            check_invariants(&map);
            map.insert(1, 99).unwrap();
            assert_eq!(map.get(&1).unwrap(), Some(99));
            check_invariants(&map);

            // Snapshot slot taken from the free list.
            let dir = tempfile::tempdir().unwrap();
            let map = open_map(&dir, 5);
            map.insert(1, 10).unwrap();
            map.insert(2, 20).unwrap();
            map.remove(&2).unwrap();
            map.chaos.arm(scenario);
            crash(|| {
                let _ = map.insert(1, 99);
            });
            drop(map);

            let map = open_map(&dir, 5);
            assert_eq!(map.get(&1).unwrap(), Some(10), "scenario {scenario}");
            assert_eq!(map.free_count(), 1);
            check_invariants(&map);
        }
    }

    #[test]
    fn test_crash_while_taking_free_slot_rolls_back() {
        for scenario in [21, 22, 23, 24, 25, 26] {
            let dir = tempfile::tempdir().unwrap();
            let map = open_map(&dir, 5);
            map.insert(1, 10).unwrap();
            map.insert(2, 20).unwrap();
            map.remove(&2).unwrap();
            map.chaos.arm(scenario);
            crash(|| {
                let _ = map.insert(3, 30);
            });
            drop(map);

            let map = open_map(&dir, 5);
            assert_eq!(map.get(&3).unwrap(), None, "scenario {scenario}");
            assert_eq!(map.get(&1).unwrap(), Some(10));
            assert_eq!(map.len().unwrap(), 1);
            assert_eq!(map.free_count(), 1, "scenario {scenario}");
            check_invariants(&map);

            map.insert(3, 30).unwrap();
            assert_eq!(map.free_count(), 0, "retry must reuse the freed slot");
            assert_eq!(map.count(), 2);
            check_invariants(&map);
        }
    }

    #[test]
    fn test_crash_while_taking_fresh_slot_rolls_back() {
        for scenario in [31, 32, 33, 34, 35] {
            let dir = tempfile::tempdir().unwrap();
            let map = open_map(&dir, 5);
            map.insert(1, 10).unwrap();
            map.chaos.arm(scenario);
            crash(|| {
                let _ = map.insert(2, 20);
            });
            drop(map);

            let map = open_map(&dir, 5);
            assert_eq!(map.get(&2).unwrap(), None, "scenario {scenario}");
            assert_eq!(map.get(&1).unwrap(), Some(10));
            assert_eq!(map.count(), 1, "scenario {scenario}");
            check_invariants(&map);

            map.insert(2, 20).unwrap();
            assert_eq!(map.get(&2).unwrap(), Some(20));
            check_invariants(&map);
        }
    }

    #[test]
    fn test_crash_while_publishing_bucket_rolls_back() {
        for scenario in [41, 42, 43, 44] {
            for reuse_free_slot in [false, true] {
                let dir = tempfile::tempdir().unwrap();
                let map = open_map(&dir, 5);
                map.insert(1, 10).unwrap();
                if reuse_free_slot {
                    map.insert(2, 20).unwrap();
                    map.remove(&2).unwrap();
                }
                map.chaos.arm(scenario);
                crash(|| {
                    let _ = map.insert(7, 70);
                });
                drop(map);

                let map = open_map(&dir, 5);
                assert_eq!(
                    map.get(&7).unwrap(),
                    None,
                    "scenario {scenario}, reuse {reuse_free_slot}"
                );
                assert_eq!(map.get(&1).unwrap(), Some(10));
                assert_eq!(map.len().unwrap(), 1);
                check_invariants(&map);

                map.insert(7, 70).unwrap();
                assert_eq!(map.get(&7).unwrap(), Some(70));
                check_invariants(&map);
            }
        }
    }

    #[test]
    fn test_crash_during_resize_is_benign() {
        for scenario in [51, 52] {
            let dir = tempfile::tempdir().unwrap();
            let map = open_map(&dir, 3); // generation 0: 3 slots
            map.insert(1, 1).unwrap();
            map.insert(2, 2).unwrap();
            map.insert(3, 3).unwrap();
            map.chaos.arm(scenario);
            crash(|| {
                let _ = map.insert(4, 4);
            });
            drop(map);

            let map = open_map(&dir, 3);
            assert_eq!(map.len().unwrap(), 3, "scenario {scenario}");
            assert_eq!(
                map.generation_checked().unwrap(),
                0,
                "generation must not advance before both files grow"
            );
            check_invariants(&map);

            map.insert(4, 4).unwrap();
            assert_eq!(map.generation_checked().unwrap(), 1);
            for k in 1..=4i64 {
                assert_eq!(map.get(&k).unwrap(), Some(k));
            }
            check_invariants(&map);
        }
    }

    #[test]
    fn test_crash_during_clear_completes_on_recovery() {
        let dir = tempfile::tempdir().unwrap();
        let map = open_map(&dir, 5);
        for k in 0..4i64 {
            map.insert(k, k * 10).unwrap();
        }
        map.chaos.arm(6);
        crash(|| {
            let _ = map.clear();
        });
        drop(map);

        // The wipe bit replays forward: recovery finishes the clear.
        let map = open_map(&dir, 5);
        assert_eq!(map.len().unwrap(), 0);
        assert_eq!(map.count(), 0);
        check_invariants(&map);
        map.insert(1, 1).unwrap();
        assert_eq!(map.get(&1).unwrap(), Some(1));
        check_invariants(&map);
    }

    #[test]
    fn test_crash_during_remove_rolls_back() {
        for scenario in [71, 72, 73, 74, 75] {
            // Removal of a bucket head: the most recently inserted key heads
            // its chain whether or not the two keys share a bucket.
            let dir = tempfile::tempdir().unwrap();
            let map = open_map(&dir, 5);
            map.insert(1, 10).unwrap();
            map.insert(2, 20).unwrap();
            map.chaos.arm(scenario);
            crash(|| {
                let _ = map.remove(&2);
            });
            drop(map);

            let map = open_map(&dir, 5);
            assert_eq!(map.get(&1).unwrap(), Some(10), "scenario {scenario}");
            assert_eq!(map.get(&2).unwrap(), Some(20));
            assert_eq!(map.len().unwrap(), 2);
            check_invariants(&map);
            assert!(map.remove(&2).unwrap());
            assert_eq!(map.get(&2).unwrap(), None);
            check_invariants(&map);

            // Removal behind a predecessor in the same chain.
            let dir = tempfile::tempdir().unwrap();
            let map = open_map(&dir, 5);
            let (first, second) = colliding_pair(&map);
            map.insert(first, 100).unwrap();
            map.insert(second, 200).unwrap(); // chains ahead of `first`
            map.chaos.arm(scenario);
            crash(|| {
                let _ = map.remove(&first);
            });
            drop(map);

            let map = open_map(&dir, 5);
            assert_eq!(map.get(&first).unwrap(), Some(100), "scenario {scenario}");
            assert_eq!(map.get(&second).unwrap(), Some(200));
            check_invariants(&map);
            assert!(map.remove(&first).unwrap());
            assert_eq!(map.get(&second).unwrap(), Some(200));
            check_invariants(&map);
        }
    }

    #[test]
    fn test_second_handle_steals_orphaned_lock_and_recovers() {
        let dir = tempfile::tempdir().unwrap();
        let map = open_map(&dir, 5);
        map.insert(1, 10).unwrap();
        map.chaos.arm(42);
        crash(|| {
            let _ = map.add(2, 20);
        });
        drop(map);

        // The dead handle left the PID lock and journal behind; a write on a
        // fresh handle steals the lock, rolls the bucket publish back, then
        // performs its own insert.
        let map = open_map(&dir, 5);
        assert_ne!(map.recovery_flags(), 0, "journal must survive the crash");
        map.add(2, 20).unwrap();
        assert_eq!(map.get(&1).unwrap(), Some(10));
        assert_eq!(map.get(&2).unwrap(), Some(20));
        check_invariants(&map);
    }

    #[test]
    fn test_update_crash_recovers_through_read_escalation() {
        // Heal purely through the optimistic-read escalation path, with no
        // intervening write.
        let dir = tempfile::tempdir().unwrap();
        let map = open_map(&dir, 5);
        map.insert(1, 10).unwrap();
        map.chaos.arm(12);
        crash(|| {
            let _ = map.insert(1, 99);
        });
        drop(map);

        let map = open_map(&dir, 5);
        assert_eq!(map.get(&1).unwrap(), Some(10));
        check_invariants(&map);
    }
}
