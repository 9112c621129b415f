mod client;

pub use client::{
    DEFAULT_BASE_URL, DiskClient, DiskError, Resource, ResourceType, TransferLink,
    parse_retry_after,
};
