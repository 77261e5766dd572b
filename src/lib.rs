//! Score-P substrate plugin that watches per-region timing as the host
//! records enter/exit events and patches out the instrumentation
//! call-sites of regions cheap enough that measuring them isn't worth
//! their own runtime cost (§1, §2).

#[macro_use]
extern crate lazy_static;

#[macro_use]
pub mod log;

pub mod config;
pub mod error;
pub mod host;
pub mod patch;
pub mod registry;
pub mod report;
pub mod stats;
pub mod sync;
pub mod unwind;
