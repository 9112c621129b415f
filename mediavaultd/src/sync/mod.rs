pub mod backoff;
pub mod dedup;
pub mod limiter;
pub mod reconcile;
pub mod retry;
pub mod router;
pub mod row_store;
pub mod sequencer;
