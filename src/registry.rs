use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::log::LogLevel::*;

/// Host-assigned 32-bit region identifier.
pub type RegionHandle = u32;

/// Host-assigned location (thread) identifier.
pub type LocationHandle = u64;

/// Compile-time cap on concurrently tracked worker locations. Threads
/// beyond the cap proceed without shadow bookkeeping (§4.1, §5).
pub const MAX_LOCATIONS: usize = 512;

/// Global, one-per-region statistics and patch-state record.
#[derive(Clone, Debug)]
pub struct RegionRecord {
    pub region_name: String,
    pub call_count: u64,
    pub duration_total: u64,
    pub last_enter_ts: u64,
    pub depth: u32,
    pub enter_callsite: Option<usize>,
    pub exit_callsite: Option<usize>,
    pub mean_duration: u64,
    pub deletable: bool,
    pub inactive: bool,
    pub optimized_out: bool,
}

impl RegionRecord {
    fn new(region_name: String) -> RegionRecord {
        RegionRecord {
            region_name,
            call_count: 0,
            duration_total: 0,
            last_enter_ts: 0,
            depth: 0,
            enter_callsite: None,
            exit_callsite: None,
            mean_duration: 0,
            deletable: false,
            inactive: false,
            optimized_out: false,
        }
    }

    pub fn is_live(&self) -> bool {
        !self.inactive && !self.optimized_out
    }
}

/// Per-thread, one-per-(location, region) statistics record. Owned
/// exclusively by its thread; never touched by another thread while that
/// thread is alive (§3 invariant).
#[derive(Clone, Debug, Default)]
pub struct ShadowRecord {
    pub call_count_local: u64,
    pub duration_local: u64,
    pub last_enter_ts_local: u64,
    pub enter_callsite: Option<usize>,
    pub exit_callsite: Option<usize>,
    pub optimized_out: bool,
}

struct LocationSlot {
    index: usize,
    shadows: HashMap<RegionHandle, ShadowRecord>,
}

struct SlotTable {
    free: Vec<bool>,
    region_order: Vec<RegionHandle>,
}

impl SlotTable {
    fn new() -> SlotTable {
        SlotTable {
            free: vec![true; MAX_LOCATIONS],
            region_order: Vec::new(),
        }
    }

    fn reserve(&mut self) -> Option<usize> {
        let idx = self.free.iter().position(|f| *f)?;
        self.free[idx] = false;
        Some(idx)
    }

    fn release(&mut self, idx: usize) {
        if idx < self.free.len() {
            self.free[idx] = true;
        }
    }
}

thread_local! {
    static CURRENT_LOCATION: RefCell<Option<LocationSlot>> = RefCell::new(None);
    static IS_MAIN_THREAD: RefCell<bool> = RefCell::new(false);
}

/// Maps `region_id -> region record` and tracks which worker slots are in
/// use. Global-table mutation is guarded by a single mutex (§4.1); shadow
/// tables are lock-free for their owning thread.
pub struct Registry {
    regions: Mutex<HashMap<RegionHandle, RegionRecord>>,
    slots: Mutex<SlotTable>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry {
            regions: Mutex::new(HashMap::new()),
            slots: Mutex::new(SlotTable::new()),
        }
    }

    /// Defines a new region. Fails silently (logs at Warn) if the id is
    /// already present -- this crate treats a duplicate define as a
    /// recoverable host mis-sequencing rather than a process abort (see
    /// DESIGN.md for the rationale).
    pub fn define(&self, region_id: RegionHandle, region_name: &str) {
        let mut regions = self.regions.lock().unwrap();
        if regions.contains_key(&region_id) {
            log!(LogWarn, "{}", crate::error::SubstrateError::DuplicateRegion { region_id });
            return;
        }
        regions.insert(region_id, RegionRecord::new(region_name.to_owned()));

        let mut slots = self.slots.lock().unwrap();
        slots.region_order.push(region_id);
    }

    /// Registers the calling thread as a tracked location. A
    /// `host_location_id` of zero marks the main thread -- no shadow
    /// table is allocated for it since the main thread's statistics live
    /// directly on the global record.
    pub fn create_location(&self, host_location_id: LocationHandle) {
        if host_location_id == 0 {
            IS_MAIN_THREAD.with(|m| *m.borrow_mut() = true);
            return;
        }

        let mut slots = self.slots.lock().unwrap();
        let index = match slots.reserve() {
            Some(idx) => idx,
            None => {
                log!(
                    LogWarn,
                    "{} (location {} unmonitored)",
                    crate::error::SubstrateError::LocationSlotsExhausted,
                    host_location_id
                );
                return;
            }
        };
        let mut shadows = HashMap::new();
        for region_id in slots.region_order.clone() {
            shadows.insert(region_id, ShadowRecord::default());
        }
        drop(slots);

        CURRENT_LOCATION.with(|cell| {
            *cell.borrow_mut() = Some(LocationSlot { index, shadows });
        });
    }

    /// Allocates a shadow for `region_id` in every currently live location
    /// slot that was created before the region was defined. Not
    /// explicitly part of the host contract, but keeps long-running
    /// processes consistent when regions are defined late; only the
    /// calling thread's own slot is touched -- others still lazily
    /// resolve from `None` on first enter.
    pub fn ensure_local_shadow(&self, region_id: RegionHandle) {
        CURRENT_LOCATION.with(|cell| {
            if let Some(slot) = cell.borrow_mut().as_mut() {
                slot.shadows.entry(region_id).or_insert_with(ShadowRecord::default);
            }
        });
    }

    pub fn delete_location(&self) {
        let index = CURRENT_LOCATION.with(|cell| cell.borrow_mut().take().map(|s| s.index));
        if let Some(index) = index {
            let mut slots = self.slots.lock().unwrap();
            slots.release(index);
        }
    }

    pub fn is_main_thread(&self) -> bool {
        IS_MAIN_THREAD.with(|m| *m.borrow())
    }

    pub fn has_shadow(&self) -> bool {
        CURRENT_LOCATION.with(|cell| cell.borrow().is_some())
    }

    /// Runs `f` with mutable access to the calling thread's shadow for
    /// `region_id`, if one exists. O(1) hash lookup, no locking.
    pub fn with_local_shadow<F, R>(&self, region_id: RegionHandle, f: F) -> Option<R>
    where
        F: FnOnce(&mut ShadowRecord) -> R,
    {
        CURRENT_LOCATION.with(|cell| {
            cell.borrow_mut()
                .as_mut()
                .and_then(|slot| slot.shadows.get_mut(&region_id))
                .map(f)
        })
    }

    pub fn with_region<F, R>(&self, region_id: RegionHandle, f: F) -> Option<R>
    where
        F: FnOnce(&mut RegionRecord) -> R,
    {
        let mut regions = self.regions.lock().unwrap();
        regions.get_mut(&region_id).map(f)
    }

    pub fn for_each_region<F: FnMut(RegionHandle, &mut RegionRecord)>(&self, mut f: F) {
        let mut regions = self.regions.lock().unwrap();
        for (id, record) in regions.iter_mut() {
            f(*id, record);
        }
    }

    /// Merges every shadow belonging to the calling thread into the
    /// global records (sum counters and durations, reset shadows), then
    /// re-evaluates deletability for every touched region (§4.2
    /// `on_thread_join`). Returns the region ids that received merged
    /// statistics, so the caller can re-evaluate deletability for exactly
    /// those regions without re-entering this mutex.
    pub fn merge_current_shadows(&self) -> Vec<RegionHandle> {
        let merged: Vec<(RegionHandle, ShadowRecord)> = CURRENT_LOCATION.with(|cell| {
            let mut borrow = cell.borrow_mut();
            match borrow.as_mut() {
                Some(slot) => slot
                    .shadows
                    .iter_mut()
                    .map(|(id, shadow)| {
                        let taken = std::mem::take(shadow);
                        (*id, taken)
                    })
                    .collect(),
                None => Vec::new(),
            }
        });

        if merged.is_empty() {
            return Vec::new();
        }

        let mut touched = Vec::with_capacity(merged.len());
        let mut regions = self.regions.lock().unwrap();
        for (region_id, shadow) in merged {
            if let Some(record) = regions.get_mut(&region_id) {
                record.call_count += shadow.call_count_local;
                record.duration_total += shadow.duration_local;
                if shadow.enter_callsite.is_some() {
                    record.enter_callsite = record.enter_callsite.or(shadow.enter_callsite);
                }
                if shadow.exit_callsite.is_some() {
                    record.exit_callsite = record.exit_callsite.or(shadow.exit_callsite);
                }
                if shadow.optimized_out {
                    record.optimized_out = true;
                }
                touched.push(region_id);
            }
        }
        touched
    }

    pub fn region_count(&self) -> usize {
        self.regions.lock().unwrap().len()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn define_creates_a_record() {
        let reg = Registry::new();
        reg.define(1, "hot_region");
        let name = reg.with_region(1, |r| r.region_name.clone());
        assert_eq!(name, Some("hot_region".to_owned()));
    }

    #[test]
    fn duplicate_define_is_ignored() {
        let reg = Registry::new();
        reg.define(1, "first");
        reg.define(1, "second");
        let name = reg.with_region(1, |r| r.region_name.clone());
        assert_eq!(name, Some("first".to_owned()));
        assert_eq!(reg.region_count(), 1);
    }

    #[test]
    fn main_thread_gets_no_shadow_table() {
        let reg = Registry::new();
        reg.create_location(0);
        assert!(reg.is_main_thread());
        assert!(!reg.has_shadow());
    }

    #[test]
    fn worker_thread_gets_a_shadow_per_known_region() {
        let reg = Registry::new();
        reg.define(7, "region7");
        reg.create_location(42);
        assert!(!reg.is_main_thread());
        assert!(reg.has_shadow());
        let exists = reg.with_local_shadow(7, |_| ()).is_some();
        assert!(exists);
    }

    #[test]
    fn merge_sums_into_global_and_resets_shadow() {
        let reg = Registry::new();
        reg.define(3, "region3");
        reg.create_location(9);
        reg.with_local_shadow(3, |s| {
            s.call_count_local = 10;
            s.duration_local = 500;
        });
        reg.merge_current_shadows();
        let (count, dur) = reg.with_region(3, |r| (r.call_count, r.duration_total)).unwrap();
        assert_eq!(count, 10);
        assert_eq!(dur, 500);
        let local = reg.with_local_shadow(3, |s| (s.call_count_local, s.duration_local));
        assert_eq!(local, Some((0, 0)));
    }
}
