//! Opaque pagination tokens.
//!
//! The store's continuation cursor (the key of the last evaluated item) is
//! serialized to JSON and base64-encoded so it can round-trip through a
//! stateless protocol layer between calls. Callers must treat tokens as
//! opaque; a token that does not decode fails fast rather than silently
//! restarting the scan.

use std::collections::HashMap;

use aws_sdk_dynamodb::types::AttributeValue;
use base64::{engine::general_purpose::STANDARD, Engine as _};

use crate::error::StoreError;

pub(crate) fn encode(cursor: &HashMap<String, AttributeValue>) -> Result<String, StoreError> {
    let portable: HashMap<String, serde_dynamo::AttributeValue> = cursor
        .iter()
        .map(|(name, value)| (name.clone(), value.clone().into()))
        .collect();
    let json = serde_json::to_vec(&portable).map_err(StoreError::TokenEncode)?;
    Ok(STANDARD.encode(json))
}

pub(crate) fn decode(token: &str) -> Result<HashMap<String, AttributeValue>, StoreError> {
    let json = STANDARD
        .decode(token)
        .map_err(|_| StoreError::InvalidPaginationToken)?;
    let portable: HashMap<String, serde_dynamo::AttributeValue> =
        serde_json::from_slice(&json).map_err(|_| StoreError::InvalidPaginationToken)?;
    Ok(portable
        .into_iter()
        .map(|(name, value)| (name, value.into()))
        .collect())
}
