pub mod chapter_order;
pub mod commands;
pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod reconciler;
pub mod store;
pub mod trigger;

pub use commands::ReaderContext;
pub use config::ReaderConfig;
pub use error::{ReaderError, Result};
pub use models::{BookStatus, Chapter, IngestionRequest, OrderedChapter, ReadingProgress};
pub use reconciler::{
    BookAvailabilityReconciler, OpenOutcome, PollPolicy, ReconcileEvent, SessionState,
};
