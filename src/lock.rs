//! Distributed advisory lock.
//!
//! A cooperative, time-boxed mutual-exclusion primitive layered on the
//! store's conditional writes. At most one issuer holds a non-expired lease
//! for a given name at any instant, enforced entirely by the store's atomic
//! conditional-write guarantee, never by an in-process mutex, so it is safe
//! across independent processes sharing the same table.
//!
//! Lock items live in a table keyed by `name`, with `issuer` (a fresh random
//! identity per acquisition) and `expires_at` (epoch milliseconds).

use std::future::Future;

use aws_sdk_dynamodb::types::AttributeValue;
use thiserror::Error;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::StoreError;
use crate::store::{Condition, Item, StoreClient, UpdateExpression, UpdateParams};
use crate::utils::now_millis;

/// How long before lease expiry the heartbeat renews it.
const HEARTBEAT_MARGIN: Duration = Duration::from_secs(1);

/// Outcome of a lock attempt. `Taken` is an expected, non-exceptional result.
#[derive(Debug, PartialEq, Eq)]
pub enum LockStatus<T> {
    /// The lock was held for the duration of the work; here is its output.
    Acquired(T),
    /// Another issuer holds a non-expired lease.
    Taken,
}

#[derive(Debug, Error)]
pub enum LockError {
    /// The lease could no longer be extended under our issuer identity:
    /// another party seized it after an unexpected expiry. The protected
    /// work was abandoned.
    #[error("lock lease lost while holding it")]
    Lost,

    /// The process was asked to shut down; the lock was released and the
    /// work abandoned.
    #[error("interrupted while holding lock")]
    Interrupted,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Runs `work` under a named advisory lock.
///
/// Acquisition puts a lock item conditioned on "no item exists OR the
/// existing lease has expired". While `work` runs, a heartbeat extends the
/// lease ahead of expiry; if extension fails because the issuer no longer
/// matches, the work is abandoned with [`LockError::Lost`]. On every exit
/// path (completion, lost lease, interruption) the lease is released
/// best-effort by expiring it; a failed release is logged, not retried, since
/// the lease lapses naturally.
pub async fn with_lock<T, F>(
    store: &StoreClient,
    table: &str,
    name: &str,
    lease: Duration,
    work: F,
) -> Result<LockStatus<T>, LockError>
where
    F: Future<Output = T>,
{
    let issuer = Uuid::new_v4().to_string();
    match take_lock(store, table, name, &issuer, lease).await {
        Ok(()) => info!(name, "lock acquired"),
        Err(StoreError::ConditionFailed) => {
            debug!(name, "lock already taken");
            return Ok(LockStatus::Taken);
        }
        Err(err) => return Err(err.into()),
    }

    tokio::pin!(work);
    let outcome = tokio::select! {
        output = &mut work => Ok(LockStatus::Acquired(output)),
        err = heartbeat(store, table, name, &issuer, lease) => Err(err),
        _ = tokio::signal::ctrl_c() => {
            warn!(name, "interrupt received while holding lock");
            Err(LockError::Interrupted)
        }
    };

    if let Err(err) = release_lock(store, table, name, &issuer).await {
        // The lease will expire on its own; nothing else to do here.
        warn!(name, error = %err, "failed to release lock");
    } else {
        info!(name, "lock released");
    }
    outcome
}

/// Renews the lease until renewal fails. Never returns success.
async fn heartbeat(
    store: &StoreClient,
    table: &str,
    name: &str,
    issuer: &str,
    lease: Duration,
) -> LockError {
    let interval = if lease > HEARTBEAT_MARGIN * 2 {
        lease - HEARTBEAT_MARGIN
    } else {
        lease / 2
    };
    loop {
        sleep(interval).await;
        debug!(name, "extending lock lease");
        match extend_lock(store, table, name, issuer, lease).await {
            Ok(()) => {}
            Err(StoreError::ConditionFailed) => return LockError::Lost,
            Err(err) => return LockError::Store(err),
        }
    }
}

pub(crate) async fn take_lock(
    store: &StoreClient,
    table: &str,
    name: &str,
    issuer: &str,
    lease: Duration,
) -> Result<(), StoreError> {
    let now = now_millis();
    let item = Item::new()
        .set_string("name", name)
        .set_string("issuer", issuer)
        .set_number("expires_at", now + lease.as_millis() as i64);
    let condition = Condition::new("attribute_not_exists(#name) OR #expires_at < :now")
        .name("#name", "name")
        .name("#expires_at", "expires_at")
        .value(":now", AttributeValue::N(now.to_string()));
    store.put_raw(table, item, Some(condition)).await
}

pub(crate) async fn extend_lock(
    store: &StoreClient,
    table: &str,
    name: &str,
    issuer: &str,
    lease: Duration,
) -> Result<(), StoreError> {
    set_expiry(store, table, name, issuer, now_millis() + lease.as_millis() as i64).await
}

pub(crate) async fn release_lock(
    store: &StoreClient,
    table: &str,
    name: &str,
    issuer: &str,
) -> Result<(), StoreError> {
    // Expiring the lease instead of deleting the item keeps release
    // conditional on still owning it.
    set_expiry(store, table, name, issuer, 0).await
}

async fn set_expiry(
    store: &StoreClient,
    table: &str,
    name: &str,
    issuer: &str,
    expires_at: i64,
) -> Result<(), StoreError> {
    store
        .update(UpdateParams {
            table: table.to_owned(),
            key: Item::new().set_string("name", name),
            update: UpdateExpression::set("#expires_at = :expires_at"),
            names: [
                ("#expires_at".to_owned(), "expires_at".to_owned()),
                ("#issuer".to_owned(), "issuer".to_owned()),
            ]
            .into(),
            values: [
                (
                    ":expires_at".to_owned(),
                    AttributeValue::N(expires_at.to_string()),
                ),
                (":issuer".to_owned(), AttributeValue::S(issuer.to_owned())),
            ]
            .into(),
            condition: Some("#issuer = :issuer".to_owned()),
        })
        .await
        .map(|_| ())
}
