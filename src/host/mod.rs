//! Bridges the statistics engine to the Score-P substrate plugin ABI
//! (§4.6). `abi` mirrors the C structs and enums; `callbacks` implements
//! the `extern "C"` glue and owns the process-wide [`crate::stats::Substrate`]
//! singleton.

pub mod abi;
pub mod callbacks;

use abi::ScorepSubstratePluginInfo;

/// The single symbol the host dynamically loads (`SCOREP_SUBSTRATE_PLUGIN_ENTRY`
/// convention, §4.6): `SCOREP_SubstratePlugin_<name>_get_info`.
#[no_mangle]
pub extern "C" fn SCOREP_SubstratePlugin_dynamic_filtering_plugin_get_info() -> ScorepSubstratePluginInfo {
    callbacks::plugin_info()
}
