mod events;
mod service;
mod tasks;

pub use events::{AutosaveEvent, AutosaveStatus, FailureReason};
pub use service::{AutosaveService, FlushSummary};
