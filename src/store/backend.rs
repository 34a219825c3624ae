use std::collections::HashMap;

use async_trait::async_trait;
use aws_sdk_dynamodb::types::AttributeValue;

use crate::error::StoreError;
use crate::store::update::{Condition, UpdateExpression};

pub type Attributes = HashMap<String, AttributeValue>;

/// One page or one chunk of the store's native API, nothing more.
///
/// The trait mirrors the remote store's own request ceilings: a `page` call
/// returns at most one underlying page, `batch_get`/`batch_put` accept at most
/// one chunk and may report part of it unprocessed. All chaining, chunking and
/// retrying lives above this seam in [`StoreClient`](crate::store::StoreClient),
/// which keeps that logic testable against the in-memory backend.
#[async_trait]
pub trait StoreBackend: Send + Sync {
    async fn get_item(&self, table: &str, key: Attributes) -> Result<Option<Attributes>, StoreError>;

    async fn put_item(
        &self,
        table: &str,
        item: Attributes,
        condition: Option<Condition>,
    ) -> Result<(), StoreError>;

    /// Returns the previous item, if one existed.
    async fn delete_item(&self, table: &str, key: Attributes)
        -> Result<Option<Attributes>, StoreError>;

    /// Applies the update atomically and returns the post-update item.
    async fn update_item(&self, request: UpdateRequest) -> Result<Attributes, StoreError>;

    /// One underlying query or scan page (`key_condition: None` selects scan).
    async fn page(&self, request: PageRequest) -> Result<Page, StoreError>;

    /// One batch-read chunk (at most [`MAX_BATCH_GET_ITEMS`] keys).
    async fn batch_get(
        &self,
        table: &str,
        keys: Vec<Attributes>,
        consistent: bool,
    ) -> Result<BatchGetOutput, StoreError>;

    /// One batch-write chunk (at most [`MAX_BATCH_WRITE_ITEMS`] puts).
    /// Returns the items the store left unprocessed.
    async fn batch_put(&self, table: &str, items: Vec<Attributes>)
        -> Result<Vec<Attributes>, StoreError>;

    /// Submits a multi-table atomic write under an idempotency token.
    async fn transact_put(&self, puts: Vec<TransactPut>, token: &str) -> Result<(), StoreError>;
}

/// Per-request ceiling of the store's batch-read API.
pub const MAX_BATCH_GET_ITEMS: usize = 100;
/// Per-request ceiling of the store's batch-write API.
pub const MAX_BATCH_WRITE_ITEMS: usize = 25;

#[derive(Debug, Default, Clone)]
pub struct UpdateRequest {
    pub table: String,
    pub key: Attributes,
    pub update: UpdateExpression,
    pub names: HashMap<String, String>,
    pub values: Attributes,
    /// Optional precondition sharing `names`/`values` with the update.
    pub condition: Option<String>,
}

#[derive(Debug, Default, Clone)]
pub struct PageRequest {
    pub table: String,
    pub index: Option<String>,
    /// `None` turns the request into a full-table scan.
    pub key_condition: Option<String>,
    pub filter: Option<String>,
    pub names: HashMap<String, String>,
    pub values: Attributes,
    /// Key order: ascending unless `Some(false)`. Ignored for scans.
    pub scan_forward: Option<bool>,
    pub exclusive_start_key: Option<Attributes>,
    pub limit: Option<usize>,
    /// Count matching items instead of materializing them.
    pub count_only: bool,
}

#[derive(Debug, Default)]
pub struct Page {
    pub items: Vec<Attributes>,
    pub last_evaluated_key: Option<Attributes>,
    pub count: usize,
}

#[derive(Debug, Default)]
pub struct BatchGetOutput {
    pub items: Vec<Attributes>,
    pub unprocessed_keys: Vec<Attributes>,
}

/// One put of a multi-table transactional write.
#[derive(Debug, Clone)]
pub struct TransactPut {
    pub table: String,
    pub item: Attributes,
}
