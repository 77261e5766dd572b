use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::config::{Config, Policy};
use crate::log::LogLevel::*;
use crate::patch;
use crate::registry::{RegionHandle, Registry};
use crate::sync::ActiveThreads;
use crate::unwind::{self, HookFamily};

#[derive(Clone, Copy)]
enum HookState {
    Unknown,
    Found(&'static HookFamily),
    NotFound,
}

/// Ties the registry, patcher, and synchronization core together behind
/// the event entry points the host binding calls into (§2 control flow).
pub struct Substrate {
    pub registry: Registry,
    pub threads: ActiveThreads,
    pub config: Config,
    hook_state: Mutex<HookState>,
    hook_entry: Mutex<Option<usize>>,
    warned_about_optimization: AtomicBool,
    disabled: AtomicBool,
}

impl Substrate {
    pub fn new(config: Config) -> Substrate {
        Substrate {
            registry: Registry::new(),
            threads: ActiveThreads::new(),
            config,
            hook_state: Mutex::new(HookState::Unknown),
            hook_entry: Mutex::new(None),
            warned_about_optimization: AtomicBool::new(false),
            disabled: AtomicBool::new(false),
        }
    }

    fn ensure_hook_family_detected(&self) {
        let mut state = self.hook_state.lock().unwrap();
        if let HookState::Unknown = *state {
            *state = match unwind::find_active_hook_family() {
                Some(family) => HookState::Found(family),
                None => HookState::NotFound,
            };
            if let HookState::NotFound = *state {
                log!(LogWarn, "no known instrumentation hook family detected; patching disabled for this run");
            }
        }
    }

    fn hook_family(&self) -> Option<&'static HookFamily> {
        match *self.hook_state.lock().unwrap() {
            HookState::Found(family) => Some(family),
            _ => None,
        }
    }

    fn warn_once_about_optimization(&self) {
        if self.warned_about_optimization.swap(true, Ordering::SeqCst) {
            return;
        }
        log!(
            LogWarn,
            "an instrumentation call-site could not be matched to its hook entry point; \
             the region cannot be patched. If this recurs widely, disable sibling-call \
             (tail-call) optimization for the target binary."
        );
        if !self.config.continue_despite_failure {
            self.disabled.store(true, Ordering::SeqCst);
            log!(LogWarn, "continuing without dynamic filtering for the remainder of this run");
        }
    }

    pub fn define_region(&self, region_id: RegionHandle, region_name: &str) {
        self.registry.define(region_id, region_name);
    }

    pub fn create_location(&self, host_location_id: u64) {
        self.registry.create_location(host_location_id);
    }

    pub fn delete_location(&self) {
        self.registry.delete_location();
    }

    /// §4.2 `on_enter_region`.
    pub fn on_enter_region(&self, region_id: RegionHandle, ts: u64, is_compiler_paradigm: bool) {
        if !is_compiler_paradigm || self.disabled.load(Ordering::SeqCst) {
            return;
        }
        self.ensure_hook_family_detected();

        if self.registry.is_main_thread() {
            self.registry.with_region(region_id, |record| {
                if record.optimized_out || record.inactive {
                    return;
                }
                if record.enter_callsite.is_none() {
                    if let Some(family) = self.hook_family() {
                        match unwind::resolve_callsite(family.enter_name) {
                            Some(addr) => record.enter_callsite = Some(addr),
                            None => {
                                record.optimized_out = true;
                                self.warn_once_about_optimization();
                                return;
                            }
                        }
                    }
                }
                record.last_enter_ts = ts;
                record.depth += 1;
            });
        } else {
            self.registry.with_local_shadow(region_id, |shadow| {
                if shadow.optimized_out {
                    return;
                }
                if shadow.enter_callsite.is_none() {
                    if let Some(family) = self.hook_family() {
                        match unwind::resolve_callsite(family.enter_name) {
                            Some(addr) => shadow.enter_callsite = Some(addr),
                            None => {
                                shadow.optimized_out = true;
                                self.warn_once_about_optimization();
                                return;
                            }
                        }
                    }
                }
                shadow.last_enter_ts_local = ts;
            });
        }
    }

    /// §4.2 `on_exit_region`.
    pub fn on_exit_region(&self, region_id: RegionHandle, ts: u64, is_compiler_paradigm: bool) {
        if !is_compiler_paradigm || self.disabled.load(Ordering::SeqCst) {
            return;
        }
        self.ensure_hook_family_detected();

        if self.registry.is_main_thread() {
            let mut needs_relative_check = false;
            self.registry.with_region(region_id, |record| {
                if record.depth > 0 {
                    record.depth -= 1;
                }
                if record.optimized_out || record.inactive {
                    return;
                }
                if record.exit_callsite.is_none() {
                    if let Some(family) = self.hook_family() {
                        match self.resolve_exit_callsite(family) {
                            Ok(addr) => record.exit_callsite = Some(addr),
                            Err(_) => {
                                record.optimized_out = true;
                                self.warn_once_about_optimization();
                                return;
                            }
                        }
                    }
                }
                if record.deletable {
                    return;
                }
                let duration = ts.saturating_sub(record.last_enter_ts);
                record.call_count += 1;
                record.duration_total += duration;
                record.mean_duration = record.duration_total / record.call_count;
                match self.config.policy {
                    Policy::Absolute => {
                        if record.mean_duration < self.config.threshold {
                            record.deletable = true;
                        }
                    }
                    Policy::Relative => needs_relative_check = true,
                }
            });

            if needs_relative_check {
                self.apply_relative_policy(region_id);
            }

            self.threads.if_quiescent(|| patch::apply_all_pending(&self.registry));
        } else {
            self.registry.with_local_shadow(region_id, |shadow| {
                if shadow.optimized_out {
                    return;
                }
                if shadow.exit_callsite.is_none() {
                    if let Some(family) = self.hook_family() {
                        match self.resolve_exit_callsite(family) {
                            Ok(addr) => shadow.exit_callsite = Some(addr),
                            Err(_) => {
                                shadow.optimized_out = true;
                                self.warn_once_about_optimization();
                                return;
                            }
                        }
                    }
                }
                let duration = ts.saturating_sub(shadow.last_enter_ts_local);
                shadow.call_count_local += 1;
                shadow.duration_local += duration;
            });
        }
    }

    fn resolve_exit_callsite(&self, family: &'static HookFamily) -> Result<usize, crate::error::SubstrateError> {
        let candidate = unwind::resolve_callsite(family.exit_name)
            .ok_or(crate::error::SubstrateError::UnrecognizedCallsite { addr: 0 })?;

        let mut entry = self.hook_entry.lock().unwrap();
        let hook_entry = match *entry {
            Some(addr) => addr,
            None => {
                let resolved = unwind::symbol_entry_address(family.exit_name)
                    .or_else(|| unwind::direct_call_target(candidate))
                    .ok_or(crate::error::SubstrateError::UnrecognizedCallsite { addr: candidate })?;
                *entry = Some(resolved);
                resolved
            }
        };
        drop(entry);

        unwind::validate_exit_callsite(candidate, hook_entry)?;
        Ok(candidate)
    }

    fn apply_relative_policy(&self, region_id: RegionHandle) {
        let mean_all = self.recompute_mean_all();
        let threshold = self.config.threshold as i64;
        self.registry.with_region(region_id, |record| {
            if record.inactive || record.deletable || record.optimized_out {
                return;
            }
            if (record.mean_duration as i64) < (mean_all as i64 - threshold) {
                record.deletable = true;
            }
        });
    }

    fn recompute_mean_all(&self) -> u64 {
        let mut total = 0u64;
        let mut count = 0u64;
        self.registry.for_each_region(|_, record| {
            if !record.inactive && record.call_count > 0 {
                total += record.mean_duration;
                count += 1;
            }
        });
        if count == 0 {
            0
        } else {
            total / count
        }
    }

    pub fn on_team_begin(&self) {
        if self.disabled.load(Ordering::SeqCst) {
            return;
        }
        self.threads.team_begin();
    }

    pub fn on_team_end(&self) {
        if self.disabled.load(Ordering::SeqCst) {
            return;
        }
        self.threads.team_end();
    }

    /// §4.2 `on_thread_join`: merges every shadow belonging to the
    /// calling thread into the global records, re-evaluates deletability
    /// for every region, and invokes the patcher if no team remains
    /// active.
    pub fn on_thread_join(&self) {
        if self.disabled.load(Ordering::SeqCst) {
            return;
        }
        let touched = self.registry.merge_current_shadows();
        for region_id in &touched {
            self.registry.with_region(*region_id, |record| {
                if record.call_count > 0 {
                    record.mean_duration = record.duration_total / record.call_count;
                }
            });
        }

        self.reevaluate_all_deletability();
        self.threads.if_quiescent(|| patch::apply_all_pending(&self.registry));
    }

    fn reevaluate_all_deletability(&self) {
        match self.config.policy {
            Policy::Absolute => {
                let threshold = self.config.threshold;
                self.registry.for_each_region(|_, record| {
                    if record.inactive || record.deletable || record.optimized_out || record.call_count == 0 {
                        return;
                    }
                    if record.mean_duration < threshold {
                        record.deletable = true;
                    }
                });
            }
            Policy::Relative => {
                let mean_all = self.recompute_mean_all();
                let threshold = self.config.threshold as i64;
                self.registry.for_each_region(|_, record| {
                    if record.inactive || record.deletable || record.optimized_out || record.call_count == 0 {
                        return;
                    }
                    if (record.mean_duration as i64) < (mean_all as i64 - threshold) {
                        record.deletable = true;
                    }
                });
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::Policy;

    fn config(policy: Policy, threshold: u64) -> Config {
        Config {
            threshold,
            policy,
            continue_despite_failure: true,
            create_report: false,
            create_filter_file: false,
        }
    }

    /// Exercises the deletability rule directly against region-record
    /// mutation, bypassing the unwinder (which requires a live call
    /// stack matching a known hook symbol and cannot be driven from a
    /// unit test). This mirrors scenario 1/2 of the testable properties.
    #[test]
    fn absolute_policy_marks_hot_region_deletable() {
        let sub = Substrate::new(config(Policy::Absolute, 100_000));
        sub.define_region(1, "hot");
        sub.registry.with_region(1, |r| {
            r.call_count = 10_001;
            r.duration_total = 10_001 * 10;
        });
        sub.reevaluate_all_deletability();
        let deletable = sub.registry.with_region(1, |r| r.deletable).unwrap();
        assert!(deletable);
    }

    #[test]
    fn absolute_policy_leaves_cold_region_alone() {
        let sub = Substrate::new(config(Policy::Absolute, 100_000));
        sub.define_region(2, "cold");
        sub.registry.with_region(2, |r| {
            r.call_count = 5;
            r.duration_total = 500_000 * 5;
        });
        sub.reevaluate_all_deletability();
        let deletable = sub.registry.with_region(2, |r| r.deletable).unwrap();
        assert!(!deletable);
    }

    #[test]
    fn relative_policy_flags_only_the_outlier() {
        let sub = Substrate::new(config(Policy::Relative, 500_000));
        for id in 1..=4 {
            sub.define_region(id, "typical");
            sub.registry.with_region(id, |r| {
                r.call_count = 1;
                r.duration_total = 1_000_000;
                r.mean_duration = 1_000_000;
            });
        }
        sub.define_region(5, "outlier");
        sub.registry.with_region(5, |r| {
            r.call_count = 1;
            r.duration_total = 10;
            r.mean_duration = 10;
        });

        sub.reevaluate_all_deletability();

        for id in 1..=4 {
            assert!(!sub.registry.with_region(id, |r| r.deletable).unwrap());
        }
        assert!(sub.registry.with_region(5, |r| r.deletable).unwrap());
    }

    #[test]
    fn depth_guards_patch_while_recursing() {
        let sub = Substrate::new(config(Policy::Absolute, 1));
        sub.define_region(9, "recursive");
        sub.registry.with_region(9, |r| {
            r.depth = 2;
            r.deletable = true;
            r.enter_callsite = Some(0x1000);
            r.exit_callsite = Some(0x1010);
        });
        patch::apply_all_pending(&sub.registry);
        let inactive = sub.registry.with_region(9, |r| r.inactive).unwrap();
        assert!(!inactive, "patch must not apply while depth > 0");
    }

    #[test]
    fn optimized_out_is_absorbing() {
        let sub = Substrate::new(config(Policy::Absolute, 1));
        sub.define_region(3, "weird");
        sub.registry.with_region(3, |r| r.optimized_out = true);
        sub.reevaluate_all_deletability();
        let (deletable, inactive) = sub
            .registry
            .with_region(3, |r| (r.deletable, r.inactive))
            .unwrap();
        assert!(!deletable);
        assert!(!inactive);
    }
}
