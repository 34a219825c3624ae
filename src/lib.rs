//! Keyed storage client for DynamoDB-backed applications.
//!
//! The [`store`] module hides the store's batch-size ceilings and manual
//! pagination behind whole-result operations; the [`lock`] module layers a
//! distributed advisory lock on top of its conditional writes.
//!
//! ```no_run
//! use dynamo_store::store::{Item, StoreClient};
//!
//! # async fn example() -> Result<(), dynamo_store::error::StoreError> {
//! let store = StoreClient::from_env().await;
//! store
//!     .put_raw("sessions", Item::new().set_string("id", "a"), None)
//!     .await?;
//! let session = store
//!     .get_raw("sessions", Item::new().set_string("id", "a"))
//!     .await?;
//! assert!(session.is_some());
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod lock;
pub mod logging;
pub mod store;
mod utils;

pub use error::StoreError;
pub use lock::{with_lock, LockError, LockStatus};
pub use store::{Item, StoreClient};

#[cfg(test)]
mod tests;
