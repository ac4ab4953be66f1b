pub mod cancellation;
pub mod chunked;
pub mod classify;
pub mod config;
pub mod error;
pub mod executor;
pub mod export;
pub mod progress;
pub mod security;
pub mod session;


pub use cancellation::*;
pub use chunked::*;
pub use classify::*;
pub use config::*;
pub use error::*;
pub use executor::*;
pub use export::*;
pub use progress::*;
pub use security::*;
pub use session::*;

pub use canvas_batch_types::{
    BatchResult, BatchSummary, DeterminateProgress, FailureRecord, ProgressEvent, Reconciliation,
    RequestError, RequestId, SuccessRecord,
};
