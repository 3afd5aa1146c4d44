//! Chart repository engine.
//!
//! Two task entry points, [`sync::synchronize`] and [`publish::publish`],
//! plus the one-shot [`upload::one_shot_upload`]. Everything the hosting
//! platform owns (content storage, repository versions, publications) is
//! reached through the traits in [`platform`]; [`memory::MemoryPlatform`]
//! implements all of them in process.

pub mod config;
pub mod error;
pub mod io;
pub mod memory;
pub mod paths;
pub mod platform;
pub mod publish;
pub mod reporter;
pub mod sync;
pub mod upload;

pub use config::{DownloadPolicy, FetchConfig, Remote};
pub use error::{Error, Result};
pub use reporter::{NullReporter, Reporter, TracingReporter};

/// User Agent string for remote fetches
pub const USER_AGENT: &str = concat!("chart-core/", env!("CARGO_PKG_VERSION"));
