use std::collections::HashMap;
use std::sync::Arc;

use aws_sdk_dynamodb::types::AttributeValue;
use serde::{de::DeserializeOwned, Serialize};
use tokio::time::sleep;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::StoreError;
use crate::store::backend::{
    Attributes, PageRequest, StoreBackend, TransactPut, UpdateRequest, MAX_BATCH_GET_ITEMS,
    MAX_BATCH_WRITE_ITEMS,
};
use crate::store::item::Item;
use crate::store::sdk::SdkBackend;
use crate::store::token;
use crate::store::update::{Condition, UpdateExpression};
use crate::utils::retry_delay;

/// Total attempts (first pass included) a batched write gets before
/// [`StoreError::MaxRetriesExceeded`].
pub const PUT_ITEMS_MAX_RETRIES: usize = 3;
/// Attempts a transactional write gets while the store reports it in progress.
pub const TRANSACT_MAX_RETRIES: usize = 5;

/// High-level client over a keyed table store.
///
/// The remote store caps batch sizes (100 keys per batch read, 25 items per
/// batch write) and pages large result sets. This client hides those limits
/// behind whole-result operations: it chunks, chains cursors, and retries
/// partial batch failures internally, so calling code never reasons about the
/// store's ceilings.
///
/// Every operation is one or more remote round trips: there is no client-side
/// cache, and chunked operations run their requests sequentially rather than
/// in parallel bursts.
#[derive(Clone)]
pub struct StoreClient {
    backend: Arc<dyn StoreBackend>,
}

/// Parameters for [`StoreClient::query`], [`query_all`](StoreClient::query_all)
/// and [`count`](StoreClient::count).
#[derive(Debug, Default, Clone)]
pub struct QueryParams {
    pub table: String,
    /// Condition on the primary key, e.g. `pk = :pk AND begins_with(sk, :p)`.
    pub key_condition: String,
    pub names: HashMap<String, String>,
    pub values: HashMap<String, AttributeValue>,
    /// Post-fetch predicate on non-key attributes.
    pub filter: Option<String>,
    /// Secondary index to query instead of the table itself.
    pub index: Option<String>,
    /// Key order: ascending unless `Some(false)`.
    pub scan_forward: Option<bool>,
    /// Opaque token from a previous call to resume where it left off.
    pub pagination_token: Option<String>,
    /// Cap on returned items. Underlying pages are chained until the cap is
    /// met or the store runs out of data.
    pub limit: Option<usize>,
}

/// Parameters for [`StoreClient::scan`] and [`scan_all`](StoreClient::scan_all).
#[derive(Debug, Default, Clone)]
pub struct ScanParams {
    pub table: String,
    pub names: HashMap<String, String>,
    pub values: HashMap<String, AttributeValue>,
    pub filter: Option<String>,
    pub index: Option<String>,
    pub pagination_token: Option<String>,
    pub limit: Option<usize>,
}

/// Parameters for [`StoreClient::update`].
#[derive(Debug, Default, Clone)]
pub struct UpdateParams {
    pub table: String,
    pub key: Item,
    pub update: UpdateExpression,
    pub names: HashMap<String, String>,
    pub values: HashMap<String, AttributeValue>,
    /// Optional precondition sharing `names`/`values` with the update.
    pub condition: Option<String>,
}

/// One page of query/scan results.
#[derive(Debug)]
pub struct QueryOutput<T> {
    pub items: Vec<T>,
    /// Present when more data may exist beyond what was returned.
    pub next_pagination_token: Option<String>,
    /// Items counted by the store across the chained pages.
    pub count: usize,
}

impl StoreClient {
    pub fn new(sdk_config: &aws_config::SdkConfig) -> Self {
        Self::with_backend(Arc::new(SdkBackend::new(sdk_config)))
    }

    /// Builds a client from ambient AWS configuration.
    pub async fn from_env() -> Self {
        Self::new(&aws_config::load_from_env().await)
    }

    /// Builds a client over any backend, e.g. a
    /// [`MemoryBackend`](crate::store::MemoryBackend) in tests.
    pub fn with_backend(backend: Arc<dyn StoreBackend>) -> Self {
        Self { backend }
    }

    /// Point lookup. A missing item is `Ok(None)`, not an error.
    pub async fn get_raw(&self, table: &str, key: Item) -> Result<Option<Item>, StoreError> {
        Ok(self
            .backend
            .get_item(table, key.into_attributes())
            .await?
            .map(Item::from))
    }

    /// Typed point lookup.
    pub async fn get<T: DeserializeOwned>(
        &self,
        table: &str,
        key: Item,
    ) -> Result<Option<T>, StoreError> {
        match self.get_raw(table, key).await? {
            Some(item) => Ok(Some(item.into_value()?)),
            None => Ok(None),
        }
    }

    /// Full upsert. Fails with [`StoreError::ConditionFailed`] if the
    /// optional precondition does not hold.
    pub async fn put<T: Serialize>(
        &self,
        table: &str,
        value: &T,
        condition: Option<Condition>,
    ) -> Result<(), StoreError> {
        self.put_raw(table, Item::from_value(value)?, condition).await
    }

    pub async fn put_raw(
        &self,
        table: &str,
        item: Item,
        condition: Option<Condition>,
    ) -> Result<(), StoreError> {
        self.backend
            .put_item(table, item.into_attributes(), condition)
            .await
    }

    /// Idempotent delete. Returns whether an item was actually removed.
    pub async fn delete(&self, table: &str, key: Item) -> Result<bool, StoreError> {
        Ok(self
            .backend
            .delete_item(table, key.into_attributes())
            .await?
            .is_some())
    }

    /// Atomic partial mutation. Returns the post-update item. Fails with
    /// [`StoreError::ConditionFailed`] if the precondition does not hold,
    /// which callers use for optimistic locking and ownership checks.
    pub async fn update(&self, params: UpdateParams) -> Result<Item, StoreError> {
        let attributes = self
            .backend
            .update_item(UpdateRequest {
                table: params.table,
                key: params.key.into_attributes(),
                update: params.update,
                names: params.names,
                values: params.values,
                condition: params.condition,
            })
            .await?;
        Ok(Item::from(attributes))
    }

    /// Key-condition query in key order.
    ///
    /// Chains underlying pages while the store returns a cursor and a positive
    /// `limit` is not yet satisfied; without a `limit`, one underlying page is
    /// fetched and the cursor (if any) is returned as an opaque token.
    pub async fn query<T: DeserializeOwned>(
        &self,
        params: QueryParams,
    ) -> Result<QueryOutput<T>, StoreError> {
        let mut exclusive_start_key = decode_token(params.pagination_token.as_deref())?;
        let mut raw_items: Vec<Attributes> = Vec::new();
        let mut count = 0;
        loop {
            let page = self
                .backend
                .page(PageRequest {
                    table: params.table.clone(),
                    index: params.index.clone(),
                    key_condition: Some(params.key_condition.clone()),
                    filter: params.filter.clone(),
                    names: params.names.clone(),
                    values: params.values.clone(),
                    scan_forward: params.scan_forward,
                    exclusive_start_key: exclusive_start_key.take(),
                    limit: params.limit,
                    count_only: false,
                })
                .await?;
            count += page.count;
            raw_items.extend(page.items);
            exclusive_start_key = page.last_evaluated_key;

            let limit_unmet =
                matches!(params.limit, Some(limit) if limit > 0 && raw_items.len() < limit);
            if exclusive_start_key.is_none() || !limit_unmet {
                break;
            }
            debug!(fetched = raw_items.len(), "chaining next query page");
        }

        Ok(QueryOutput {
            items: typed(raw_items)?,
            next_pagination_token: encode_token(exclusive_start_key.as_ref())?,
            count,
        })
    }

    /// Repeats [`query`](Self::query), feeding the pagination token back,
    /// until the store reports no continuation. Terminates exactly then.
    pub async fn query_all<T: DeserializeOwned>(
        &self,
        params: QueryParams,
    ) -> Result<Vec<T>, StoreError> {
        let mut items = Vec::new();
        let mut pagination_token = None;
        loop {
            let mut output = self
                .query::<T>(QueryParams {
                    pagination_token: pagination_token.take(),
                    limit: None,
                    ..params.clone()
                })
                .await?;
            items.append(&mut output.items);
            pagination_token = output.next_pagination_token;
            if pagination_token.is_none() {
                return Ok(items);
            }
        }
    }

    /// Running total of matching items across all pages. Never materializes
    /// items; `pagination_token` and `limit` in `params` are ignored.
    pub async fn count(&self, params: QueryParams) -> Result<usize, StoreError> {
        let mut exclusive_start_key = None;
        let mut total = 0;
        loop {
            let page = self
                .backend
                .page(PageRequest {
                    table: params.table.clone(),
                    index: params.index.clone(),
                    key_condition: Some(params.key_condition.clone()),
                    filter: params.filter.clone(),
                    names: params.names.clone(),
                    values: params.values.clone(),
                    scan_forward: None,
                    exclusive_start_key: exclusive_start_key.take(),
                    limit: None,
                    count_only: true,
                })
                .await?;
            total += page.count;
            exclusive_start_key = page.last_evaluated_key;
            if exclusive_start_key.is_none() {
                return Ok(total);
            }
        }
    }

    /// One page of a full-table scan, with an opaque resume token.
    pub async fn scan<T: DeserializeOwned>(
        &self,
        params: ScanParams,
    ) -> Result<QueryOutput<T>, StoreError> {
        let exclusive_start_key = decode_token(params.pagination_token.as_deref())?;
        let page = self
            .backend
            .page(PageRequest {
                table: params.table,
                index: params.index,
                key_condition: None,
                filter: params.filter,
                names: params.names,
                values: params.values,
                scan_forward: None,
                exclusive_start_key,
                limit: params.limit,
                count_only: false,
            })
            .await?;
        Ok(QueryOutput {
            next_pagination_token: encode_token(page.last_evaluated_key.as_ref())?,
            count: page.count,
            items: typed(page.items)?,
        })
    }

    /// Whole-table scan, chaining cursors until the store is exhausted.
    /// Result order is unspecified. `pagination_token` and `limit` in
    /// `params` are ignored.
    pub async fn scan_all<T: DeserializeOwned>(
        &self,
        params: ScanParams,
    ) -> Result<Vec<T>, StoreError> {
        let mut raw_items: Vec<Attributes> = Vec::new();
        let mut exclusive_start_key = None;
        loop {
            let page = self
                .backend
                .page(PageRequest {
                    table: params.table.clone(),
                    index: params.index.clone(),
                    key_condition: None,
                    filter: params.filter.clone(),
                    names: params.names.clone(),
                    values: params.values.clone(),
                    scan_forward: None,
                    exclusive_start_key: exclusive_start_key.take(),
                    limit: None,
                    count_only: false,
                })
                .await?;
            raw_items.extend(page.items);
            exclusive_start_key = page.last_evaluated_key;
            if exclusive_start_key.is_none() {
                return typed(raw_items);
            }
        }
    }

    /// Batched multi-item read.
    ///
    /// Splits `keys` into chunks the store accepts, then drains a work stack:
    /// keys the store reports unprocessed (throttling) are re-queued as a new
    /// chunk until none remain. Result order is unspecified; keys with no
    /// matching item are omitted. Only single-attribute keys are supported.
    pub async fn batch_get<T: DeserializeOwned>(
        &self,
        table: &str,
        keys: Vec<Item>,
        consistent: bool,
    ) -> Result<Vec<T>, StoreError> {
        let Some(first_key) = keys.first() else {
            return Ok(Vec::new());
        };
        if first_key.len() != 1 {
            return Err(StoreError::InvalidRequest(
                "batch reads support single-attribute keys only".into(),
            ));
        }

        let all_keys: Vec<Attributes> = keys.into_iter().map(Item::into_attributes).collect();
        let mut pending: Vec<Vec<Attributes>> = all_keys
            .chunks(MAX_BATCH_GET_ITEMS)
            .map(<[Attributes]>::to_vec)
            .collect();

        let mut found = Vec::new();
        while let Some(chunk) = pending.pop() {
            let output = self.backend.batch_get(table, chunk, consistent).await?;
            found.extend(output.items);
            if !output.unprocessed_keys.is_empty() {
                debug!(
                    keys = output.unprocessed_keys.len(),
                    "re-queueing unprocessed batch-read keys"
                );
                pending.push(output.unprocessed_keys);
            }
        }
        typed(found)
    }

    /// Batched multi-item write.
    ///
    /// Splits `items` into chunks the store accepts. Items reported
    /// unprocessed across a full pass are retried together as the next pass,
    /// with backoff between passes. After [`PUT_ITEMS_MAX_RETRIES`] total
    /// attempts the call fails with [`StoreError::MaxRetriesExceeded`]; the
    /// caller must then assume partial success and re-drive.
    pub async fn put_items<T: Serialize>(&self, table: &str, items: &[T]) -> Result<(), StoreError> {
        let mut outstanding = items
            .iter()
            .map(|item| Item::from_value(item).map(Item::into_attributes))
            .collect::<Result<Vec<_>, _>>()?;

        let mut attempt = 0;
        while !outstanding.is_empty() {
            attempt += 1;
            if attempt > PUT_ITEMS_MAX_RETRIES {
                return Err(StoreError::MaxRetriesExceeded {
                    attempts: PUT_ITEMS_MAX_RETRIES,
                });
            }
            if attempt > 1 {
                warn!(
                    attempt,
                    outstanding = outstanding.len(),
                    "retrying unprocessed batch writes"
                );
                sleep(retry_delay(attempt - 1)).await;
            }

            let mut unprocessed = Vec::new();
            for chunk in outstanding.chunks(MAX_BATCH_WRITE_ITEMS) {
                unprocessed.extend(self.backend.batch_put(table, chunk.to_vec()).await?);
            }
            outstanding = unprocessed;
        }
        Ok(())
    }

    /// Multi-table atomic write.
    ///
    /// While the store reports the transaction still in progress under the
    /// same idempotency token, the identical request is replayed with that
    /// token; the token, not retry avoidance, provides exactly-once
    /// semantics. The replay loop is bounded by [`TRANSACT_MAX_RETRIES`];
    /// on exhaustion the in-progress error propagates.
    pub async fn transact_put(
        &self,
        puts: Vec<TransactPut>,
        idempotency_token: Option<String>,
    ) -> Result<(), StoreError> {
        let token = idempotency_token.unwrap_or_else(|| Uuid::new_v4().to_string());
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.backend.transact_put(puts.clone(), &token).await {
                Err(StoreError::TransactionInProgress) if attempt < TRANSACT_MAX_RETRIES => {
                    debug!(attempt, "transaction still applying, replaying under the same token");
                    sleep(retry_delay(attempt)).await;
                }
                result => return result,
            }
        }
    }
}

fn decode_token(token: Option<&str>) -> Result<Option<Attributes>, StoreError> {
    token.map(token::decode).transpose()
}

fn encode_token(cursor: Option<&Attributes>) -> Result<Option<String>, StoreError> {
    cursor.map(token::encode).transpose()
}

fn typed<T: DeserializeOwned>(raw_items: Vec<Attributes>) -> Result<Vec<T>, StoreError> {
    raw_items
        .into_iter()
        .map(|attributes| Item::from(attributes).into_value())
        .collect()
}
