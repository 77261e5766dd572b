//! FFI mirror of `SCOREP_SubstratePlugins.h` / `SCOREP_SubstrateEvents.h`
//! (§4.6, §6). Field names and ordering follow the host header exactly;
//! only events this substrate actually wires up get a non-opaque callback
//! type, everything else is a generic `SCOREP_Substrates_Callback`.

use std::os::raw::{c_char, c_void};

pub type ScorepAnyHandle = u32;
pub type ScorepRegionHandle = ScorepAnyHandle;
pub type ScorepInterimCommunicatorHandle = ScorepAnyHandle;
pub type ScorepTaskHandle = *mut c_void;

#[repr(C)]
pub struct ScorepLocation {
    _opaque: [u8; 0],
}

#[repr(u32)]
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ScorepHandleType {
    Any = 0,
    Attribute,
    CallingContext,
    Callpath,
    Group,
    InterimCommunicator,
    InterruptGenerator,
    Location,
    LocationGroup,
    LocationProperty,
    Metric,
    Paradigm,
    Parameter,
    Property,
    Region,
    RmaWindow,
    SamplingSet,
    SamplingSetRecorder,
    SourceCodeLocation,
    SourceFile,
    String,
    SystemTreeNode,
    SystemTreeNodeProperty,
    NumHandles,
}

/// Order matches the `SCOREP_PARADIGMS` x-macro in `SCOREP_PublicTypes.h`.
#[repr(u32)]
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ScorepParadigmType {
    Measurement = 0,
    User,
    Compiler,
    Sampling,
    Memory,
    Mpi,
    Shmem,
    Openmp,
    Pthread,
    Cuda,
    Opencl,
    Openacc,
    Invalid,
}

#[repr(u32)]
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ScorepSubstratesMode {
    RecordingEnabled = 0,
    RecordingDisabled,
    NumModes,
}

/// Only the entries this substrate subscribes to are given a typed
/// signature; the rest of the real enum exists purely to keep the
/// `functions` array index space identical to the host's (§6).
#[repr(u32)]
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ScorepSubstratesEventType {
    EnableRecording = 0,
    DisableRecording,
    OnTracingBufferFlushBegin,
    OnTracingBufferFlushEnd,
    EnterRegion,
    ExitRegion,
    Sample,
    CallingContextEnter,
    CallingContextExit,
    EnterRewindRegion,
    ExitRewindRegion,
    MpiSend,
    MpiRecv,
    MpiCollectiveBegin,
    MpiCollectiveEnd,
    MpiIsendComplete,
    MpiIrecvRequest,
    MpiRequestTested,
    MpiRequestCancelled,
    MpiIsend,
    MpiIrecv,
    RmaWinCreate,
    RmaWinDestroy,
    RmaCollectiveBegin,
    RmaCollectiveEnd,
    RmaTryLock,
    RmaAcquireLock,
    RmaRequestLock,
    RmaReleaseLock,
    RmaSync,
    RmaGroupSync,
    RmaPut,
    RmaGet,
    RmaAtomic,
    RmaWaitChange,
    RmaOpCompleteBlocking,
    RmaOpCompleteNonBlocking,
    RmaOpTest,
    RmaOpCompleteRemote,
    ThreadAcquireLock,
    ThreadReleaseLock,
    TriggerCounterInt64,
    TriggerCounterUint64,
    TriggerCounterDouble,
    TriggerParameterInt64,
    TriggerParameterUint64,
    TriggerParameterString,
    ThreadForkJoinFork,
    ThreadForkJoinJoin,
    ThreadForkJoinTeamBegin,
    ThreadForkJoinTeamEnd,
    ThreadForkJoinTaskCreate,
    ThreadForkJoinTaskSwitch,
    ThreadForkJoinTaskBegin,
    ThreadForkJoinTaskEnd,
    ThreadCreateWaitCreate,
    ThreadCreateWaitWait,
    ThreadCreateWaitBegin,
    ThreadCreateWaitEnd,
    TrackAlloc,
    TrackRealloc,
    TrackFree,
    NumEvents,
}

pub const SCOREP_SUBSTRATES_NUM_EVENTS: usize = ScorepSubstratesEventType::NumEvents as usize;

pub type ScorepSubstratesCallback = Option<unsafe extern "C" fn()>;

pub type EnterRegionCb = unsafe extern "C" fn(
    location: *mut ScorepLocation,
    timestamp: u64,
    region_handle: ScorepRegionHandle,
    metric_values: *mut u64,
);
pub type ExitRegionCb = EnterRegionCb;

pub type ThreadForkJoinTeamCb = unsafe extern "C" fn(
    location: *mut ScorepLocation,
    timestamp: u64,
    paradigm: ScorepParadigmType,
    thread_team: ScorepInterimCommunicatorHandle,
);

pub type ThreadForkJoinJoinCb =
    unsafe extern "C" fn(location: *mut ScorepLocation, timestamp: u64, paradigm: ScorepParadigmType);

/// Trimmed to the accessors this substrate actually calls
/// (`SCOREP_RegionHandle_GetName`, `SCOREP_RegionHandle_GetParadigmType`,
/// `SCOREP_Location_GetId`); the real struct carries many more entries but
/// `set_callbacks` receives it along with its `sizeof`, so a prefix-typed
/// struct is the documented compatible shape for plugins that only need a
/// few fields (§4.6).
#[repr(C)]
#[derive(Copy, Clone)]
pub struct ScorepSubstrateCallbacks {
    pub region_handle_get_id: Option<unsafe extern "C" fn(ScorepRegionHandle) -> u32>,
    pub region_handle_get_name: Option<unsafe extern "C" fn(ScorepRegionHandle) -> *const c_char>,
    pub region_handle_get_canonical_name: Option<unsafe extern "C" fn(ScorepRegionHandle) -> *const c_char>,
    pub region_handle_get_paradigm_type: Option<unsafe extern "C" fn(ScorepRegionHandle) -> ScorepParadigmType>,
    pub location_get_id: Option<unsafe extern "C" fn(*const ScorepLocation) -> u32>,
    pub location_get_global_id: Option<unsafe extern "C" fn(*const ScorepLocation) -> u64>,
}

#[repr(C)]
pub struct ScorepSubstratePluginInfo {
    pub plugin_version: u32,
    pub early_init: Option<unsafe extern "C" fn() -> i32>,
    pub assign_id: Option<unsafe extern "C" fn(usize)>,
    pub late_init: Option<unsafe extern "C" fn()>,
    pub finalize: Option<unsafe extern "C" fn() -> usize>,
    pub create_location: Option<unsafe extern "C" fn(*mut ScorepLocation, *mut ScorepLocation)>,
    pub activate_cpu_location:
        Option<unsafe extern "C" fn(*mut ScorepLocation, *mut ScorepLocation, u32)>,
    pub deactivate_cpu_location: Option<unsafe extern "C" fn(*mut ScorepLocation, *mut ScorepLocation)>,
    pub delete_location: Option<unsafe extern "C" fn(*mut ScorepLocation)>,
    pub pre_unify: Option<unsafe extern "C" fn()>,
    pub write_data: Option<unsafe extern "C" fn()>,
    pub core_task_create: Option<unsafe extern "C" fn(*mut ScorepLocation, ScorepTaskHandle)>,
    pub core_task_complete: Option<unsafe extern "C" fn(*mut ScorepLocation, ScorepTaskHandle)>,
    pub define_handle: Option<unsafe extern "C" fn(ScorepAnyHandle, ScorepHandleType)>,
    pub get_event_functions:
        Option<unsafe extern "C" fn(ScorepSubstratesMode, *mut *mut ScorepSubstratesCallback) -> u32>,
    pub set_callbacks: Option<unsafe extern "C" fn(ScorepSubstrateCallbacks, usize)>,
    pub reserved: [u64; 2],
}

pub const SCOREP_SUBSTRATE_PLUGIN_VERSION: u32 = 1;
