use std::collections::HashMap;
use std::ffi::CStr;
use std::os::raw::c_char;
use std::sync::Mutex;

use crate::config::Config;
use crate::log::LogLevel::*;
use crate::report;
use crate::stats::Substrate;

use super::abi::*;

lazy_static! {
    static ref SUBSTRATE: Substrate = {
        let config = Config::from_env().unwrap_or_else(|e| fatal!("{}", e));
        Substrate::new(config)
    };
    static ref ACCESSORS: Mutex<Option<ScorepSubstrateCallbacks>> = Mutex::new(None);
    static ref REGION_PARADIGM: Mutex<HashMap<ScorepRegionHandle, bool>> = Mutex::new(HashMap::new());
    static ref SUBSTRATE_ID: Mutex<usize> = Mutex::new(0);
}

fn is_compiler_region(region: ScorepRegionHandle) -> bool {
    REGION_PARADIGM.lock().unwrap().get(&region).copied().unwrap_or(false)
}

unsafe fn c_str_to_string(ptr: *const c_char) -> String {
    if ptr.is_null() {
        String::new()
    } else {
        CStr::from_ptr(ptr).to_string_lossy().into_owned()
    }
}

extern "C" fn early_init() -> i32 {
    lazy_static::initialize(&SUBSTRATE);
    0
}

extern "C" fn assign_id(substrate_id: usize) {
    *SUBSTRATE_ID.lock().unwrap() = substrate_id;
}

extern "C" fn late_init() {}

extern "C" fn finalize() -> usize {
    *SUBSTRATE_ID.lock().unwrap()
}

extern "C" fn create_location(location: *mut ScorepLocation, _parent: *mut ScorepLocation) {
    let id = unsafe { location_id(location) };
    SUBSTRATE.create_location(id as u64);
}

extern "C" fn delete_location(_location: *mut ScorepLocation) {
    SUBSTRATE.delete_location();
}

extern "C" fn pre_unify() {}

extern "C" fn write_data() {
    if SUBSTRATE.config.create_report {
        let mut out = Vec::new();
        if let Err(e) = report::write_table(&SUBSTRATE.registry, &mut out) {
            log!(LogError, "failed to render report table: {}", e);
        } else {
            log!(LogInfo, "{}", String::from_utf8_lossy(&out));
        }
    }
    if SUBSTRATE.config.create_filter_file {
        let dir = experiment_directory();
        let pid = std::process::id();
        match report::write_filter_file(&SUBSTRATE.registry, &dir, pid) {
            Ok(path) => log!(LogInfo, "wrote filter file {}", path.display()),
            Err(e) => log!(LogError, "failed to write filter file: {}", e),
        }
    }
}

extern "C" fn core_task_create(_location: *mut ScorepLocation, _task: ScorepTaskHandle) {}
extern "C" fn core_task_complete(_location: *mut ScorepLocation, _task: ScorepTaskHandle) {}

extern "C" fn define_handle(handle: ScorepAnyHandle, handle_type: ScorepHandleType) {
    if handle_type != ScorepHandleType::Region {
        return;
    }
    let accessors = ACCESSORS.lock().unwrap();
    let accessors = match accessors.as_ref() {
        Some(a) => a,
        None => return,
    };
    let name = match accessors.region_handle_get_name {
        Some(f) => unsafe { c_str_to_string(f(handle)) },
        None => return,
    };
    let paradigm = match accessors.region_handle_get_paradigm_type {
        Some(f) => unsafe { f(handle) },
        None => ScorepParadigmType::Invalid,
    };
    REGION_PARADIGM
        .lock()
        .unwrap()
        .insert(handle, paradigm == ScorepParadigmType::Compiler);
    SUBSTRATE.define_region(handle, &name);
}

unsafe fn location_id(location: *const ScorepLocation) -> u32 {
    let accessors = ACCESSORS.lock().unwrap();
    match accessors.as_ref().and_then(|a| a.location_get_id) {
        Some(f) => f(location),
        None => 0,
    }
}

fn experiment_directory() -> std::path::PathBuf {
    std::env::var("SCOREP_EXPERIMENT_DIRECTORY")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|_| std::path::PathBuf::from("."))
}

extern "C" fn on_enter_region(
    _location: *mut ScorepLocation,
    timestamp: u64,
    region_handle: ScorepRegionHandle,
    _metric_values: *mut u64,
) {
    SUBSTRATE.on_enter_region(region_handle, timestamp, is_compiler_region(region_handle));
}

extern "C" fn on_exit_region(
    _location: *mut ScorepLocation,
    timestamp: u64,
    region_handle: ScorepRegionHandle,
    _metric_values: *mut u64,
) {
    SUBSTRATE.on_exit_region(region_handle, timestamp, is_compiler_region(region_handle));
}

extern "C" fn on_team_begin(
    _location: *mut ScorepLocation,
    _timestamp: u64,
    _paradigm: ScorepParadigmType,
    _thread_team: ScorepInterimCommunicatorHandle,
) {
    SUBSTRATE.on_team_begin();
}

extern "C" fn on_team_end(
    _location: *mut ScorepLocation,
    _timestamp: u64,
    _paradigm: ScorepParadigmType,
    _thread_team: ScorepInterimCommunicatorHandle,
) {
    SUBSTRATE.on_team_end();
}

extern "C" fn on_thread_join(_location: *mut ScorepLocation, _timestamp: u64, _paradigm: ScorepParadigmType) {
    SUBSTRATE.on_thread_join();
}

/// The enabled-mode table installed via `get_event_functions` (§6). Every
/// slot not explicitly assigned stays `None`; Score-P never calls those
/// events for this substrate.
static mut ENABLED_EVENTS: [ScorepSubstratesCallback; SCOREP_SUBSTRATES_NUM_EVENTS] =
    [None; SCOREP_SUBSTRATES_NUM_EVENTS];
static mut DISABLED_EVENTS: [ScorepSubstratesCallback; SCOREP_SUBSTRATES_NUM_EVENTS] =
    [None; SCOREP_SUBSTRATES_NUM_EVENTS];

/// The host calls every event slot through the same generic
/// `SCOREP_Substrates_Callback` signature and recovers the real one via
/// its own per-event-type knowledge, so storing our typed function
/// pointers through a transmute to the generic shape matches the ABI
/// Score-P itself relies on (§6).
unsafe fn erase<F: Copy>(f: F) -> ScorepSubstratesCallback {
    Some(std::mem::transmute_copy(&f))
}

extern "C" fn get_event_functions(
    mode: ScorepSubstratesMode,
    functions: *mut *mut ScorepSubstratesCallback,
) -> u32 {
    unsafe {
        if mode == ScorepSubstratesMode::RecordingEnabled {
            ENABLED_EVENTS[ScorepSubstratesEventType::EnterRegion as usize] = erase(on_enter_region as EnterRegionCb);
            ENABLED_EVENTS[ScorepSubstratesEventType::ExitRegion as usize] = erase(on_exit_region as ExitRegionCb);
            ENABLED_EVENTS[ScorepSubstratesEventType::ThreadForkJoinTeamBegin as usize] =
                erase(on_team_begin as ThreadForkJoinTeamCb);
            ENABLED_EVENTS[ScorepSubstratesEventType::ThreadForkJoinTeamEnd as usize] =
                erase(on_team_end as ThreadForkJoinTeamCb);
            ENABLED_EVENTS[ScorepSubstratesEventType::ThreadForkJoinJoin as usize] =
                erase(on_thread_join as ThreadForkJoinJoinCb);
            *functions = ENABLED_EVENTS.as_mut_ptr();
        } else {
            *functions = DISABLED_EVENTS.as_mut_ptr();
        }
    }
    SCOREP_SUBSTRATES_NUM_EVENTS as u32
}

extern "C" fn set_callbacks(callbacks: ScorepSubstrateCallbacks, _size: usize) {
    *ACCESSORS.lock().unwrap() = Some(callbacks);
}

pub fn plugin_info() -> ScorepSubstratePluginInfo {
    ScorepSubstratePluginInfo {
        plugin_version: SCOREP_SUBSTRATE_PLUGIN_VERSION,
        early_init: Some(early_init),
        assign_id: Some(assign_id),
        late_init: Some(late_init),
        finalize: Some(finalize),
        create_location: Some(create_location),
        activate_cpu_location: None,
        deactivate_cpu_location: None,
        delete_location: Some(delete_location),
        pre_unify: Some(pre_unify),
        write_data: Some(write_data),
        core_task_create: Some(core_task_create),
        core_task_complete: Some(core_task_complete),
        define_handle: Some(define_handle),
        get_event_functions: Some(get_event_functions),
        set_callbacks: Some(set_callbacks),
        reserved: [0; 2],
    }
}
