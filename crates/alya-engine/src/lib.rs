//! Engine crate: ties the store (`alya-db`), cache (`alya-cache`), object
//! store (`alya-objectstore`) and processor registry (`alya-registry`)
//! together into the collaborator-facing `JobManager` API (§4.E), the
//! worker loop (§4.F), the one-shot summarizer (§4.H) and the recovery
//! sweeper (§4.I).

pub mod error;
mod instance;
pub mod manager;
pub mod summarizer;
pub mod sweeper;
pub mod worker;

pub use error::{EngineError, EngineResult};
pub use instance::new_instance_id;
pub use manager::JobManager;
pub use worker::Worker;

pub use tokio_util::sync::CancellationToken;
