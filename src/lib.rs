#![doc = include_str!("../README.md")]
#![no_std]
#![deny(missing_docs)]
#![cfg_attr(feature = "allocator_api", feature(allocator_api))]

extern crate alloc;

#[cfg(test)]
extern crate std;

use cfg_if::cfg_if;

mod config;
mod error;
mod fragment;
mod heap;
mod mutex;
mod private;
mod report;
mod shared;
pub mod size_class;
mod stats;

pub use config::Config;
pub use error::ArenaError;
pub use fragment::OVERHEAD;
pub use mutex::{Lock, SingleThreadedLock, SpinLock};
pub use private::PrivateArena;
pub use report::{CallSiteUsage, ClassReport, FreeCount, StatusReport};
pub use shared::SharedArena;
pub use stats::{LowMemoryWarning, Stats, UsageMonitor};

cfg_if! {
    if #[cfg(feature = "allocator_api")] {
        pub use core::alloc::{AllocError, Allocator};
        mod allocator;
    } else if #[cfg(feature = "allocator_api2")] {
        pub use allocator_api2::alloc::{AllocError, Allocator};
        mod allocator;
    }
}
