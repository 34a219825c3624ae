use std::collections::HashMap;

use aws_sdk_dynamodb::types::AttributeValue;
use serde::{de::DeserializeOwned, Serialize};

use crate::error::StoreError;

/// An attribute map addressed to (or read from) a table.
///
/// Items are schemaless: an arbitrary mapping from attribute name to value.
/// The same type doubles as a primary key when it carries exactly the key
/// attribute(s) of a table. For structured records prefer the typed
/// [`Item::from_value`] / [`Item::into_value`] conversions, which marshal
/// through serde; the builder methods cover ad-hoc attributes such as
/// expression values.
#[derive(Default, Debug, Clone, PartialEq)]
pub struct Item {
    pub(crate) attributes: HashMap<String, AttributeValue>,
}

impl Item {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marshals any serializable value into an attribute map.
    pub fn from_value<T: Serialize>(value: &T) -> Result<Self, StoreError> {
        let attributes = serde_dynamo::aws_sdk_dynamodb_1::to_item(value)?;
        Ok(Self { attributes })
    }

    /// Unmarshals the attribute map into a deserializable value.
    pub fn into_value<T: DeserializeOwned>(self) -> Result<T, StoreError> {
        Ok(serde_dynamo::aws_sdk_dynamodb_1::from_item(self.attributes)?)
    }

    pub fn set_string(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes
            .insert(key.into(), AttributeValue::S(value.into()));
        self
    }

    pub fn set_number(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.attributes
            .insert(key.into(), AttributeValue::N(value.to_string()));
        self
    }

    pub fn set_bool(mut self, key: impl Into<String>, value: bool) -> Self {
        self.attributes
            .insert(key.into(), AttributeValue::Bool(value));
        self
    }

    pub fn set_attr(mut self, key: impl Into<String>, value: AttributeValue) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    pub fn get_string(&self, key: &str) -> Option<&String> {
        self.attributes.get(key).and_then(|av| av.as_s().ok())
    }

    pub fn get_number(&self, key: &str) -> Option<f64> {
        self.attributes
            .get(key)
            .and_then(|av| av.as_n().ok())
            .and_then(|n| n.parse().ok())
    }

    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    pub fn into_attributes(self) -> HashMap<String, AttributeValue> {
        self.attributes
    }
}

impl From<HashMap<String, AttributeValue>> for Item {
    fn from(attributes: HashMap<String, AttributeValue>) -> Self {
        Self { attributes }
    }
}
