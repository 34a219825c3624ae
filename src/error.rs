use aws_sdk_dynamodb::error::SdkError;
use thiserror::Error;

/// Typed outcomes of store operations.
///
/// `ConditionFailed` is an expected result, not a fault: callers use it to
/// implement optimistic locking and existence guards. Everything the store
/// reports that has no dedicated variant here is propagated unchanged through
/// `Store`; this layer performs no blanket error suppression.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A conditional write's precondition did not hold.
    #[error("condition failed")]
    ConditionFailed,

    /// A caller-supplied pagination token could not be decoded. The caller
    /// must restart pagination from the beginning.
    #[error("invalid pagination token")]
    InvalidPaginationToken,

    /// A batched write still had unprocessed items after the retry ceiling.
    /// Some items may have been written; the caller must assume partial
    /// success and re-drive.
    #[error("batch write incomplete after {attempts} attempts")]
    MaxRetriesExceeded { attempts: usize },

    /// The store reports a transaction with the same idempotency token is
    /// still being applied. Replaying the identical request is safe.
    #[error("transaction still in progress")]
    TransactionInProgress,

    /// Malformed parameters, rejected before (or by) the store.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Item (un)marshalling failed.
    #[error(transparent)]
    Serde(#[from] serde_dynamo::Error),

    /// A continuation cursor could not be serialized into a token.
    #[error("pagination token encoding failed: {0}")]
    TokenEncode(#[source] serde_json::Error),

    #[error(transparent)]
    Build(#[from] aws_sdk_dynamodb::error::BuildError),

    /// Any other store-side failure (throttling, network, validation),
    /// propagated verbatim.
    #[error(transparent)]
    Store(Box<aws_sdk_dynamodb::Error>),
}

impl<E, R> From<SdkError<E, R>> for StoreError
where
    aws_sdk_dynamodb::Error: From<SdkError<E, R>>,
{
    fn from(err: SdkError<E, R>) -> Self {
        match aws_sdk_dynamodb::Error::from(err) {
            aws_sdk_dynamodb::Error::ConditionalCheckFailedException(_) => Self::ConditionFailed,
            aws_sdk_dynamodb::Error::TransactionInProgressException(_) => {
                Self::TransactionInProgress
            }
            other => Self::Store(Box::new(other)),
        }
    }
}
