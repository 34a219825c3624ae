//! # Keyed store module
//!
//! A high-level façade over a remote keyed table store.
//!
//! ## Components
//!
//! - [`StoreClient`]: whole-result operations over the store's limited native
//!   API: point reads/writes, paginated queries, scans, batched reads/writes
//!   with automatic retry of partial failures, and conditional atomic updates.
//! - [`StoreBackend`]: the one-page / one-chunk seam the client drives, with a
//!   real SDK implementation ([`SdkBackend`]) and an in-memory one with fault
//!   injection ([`MemoryBackend`]) for tests.
//! - [`Item`]: an attribute map, convertible to and from serde types.
//! - [`UpdateExpression`] / [`Condition`]: structured partial mutations and
//!   write preconditions.
//!
//! Pagination tokens returned by queries and scans are opaque
//! base64-of-serialized-cursor strings, safe to hand to a stateless protocol
//! layer between calls.

mod backend;
mod client;
mod item;
mod memory;
mod sdk;
pub(crate) mod token;
mod update;

pub use backend::{
    Attributes, BatchGetOutput, Page, PageRequest, StoreBackend, TransactPut, UpdateRequest,
    MAX_BATCH_GET_ITEMS, MAX_BATCH_WRITE_ITEMS,
};
pub use client::{
    QueryOutput, QueryParams, ScanParams, StoreClient, UpdateParams, PUT_ITEMS_MAX_RETRIES,
    TRANSACT_MAX_RETRIES,
};
pub use item::Item;
pub use memory::MemoryBackend;
pub use sdk::SdkBackend;
pub use update::{assignments, Condition, UpdateExpression};
