//! Per-resource emission accounting.
//!
//! Tracks one [`TabSession`] per open browsing context and turns active
//! minutes into emission grams on every tick. The engine holds no locks of its
//! own; the runtime serializes access together with the stats aggregator.

mod engine;
mod error;
mod profile;

pub use engine::{EngineConfig, ResourceId, TabAccountingEngine, TabSession, TabStats};
pub use error::{AccountingError, AccountingResult};
pub use profile::{format_emissions, EmissionProfile, VideoResolution};
