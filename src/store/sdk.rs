use std::collections::HashMap;

use async_trait::async_trait;
use aws_sdk_dynamodb::types::{
    KeysAndAttributes, Put, PutRequest as AwsPutRequest, ReturnValue, Select, TransactWriteItem,
    WriteRequest,
};
use aws_sdk_dynamodb::Client;

use crate::error::StoreError;
use crate::store::backend::{
    Attributes, BatchGetOutput, Page, PageRequest, StoreBackend, TransactPut, UpdateRequest,
};
use crate::store::update::Condition;

/// The real backend: a thin marshalling layer over the store's native
/// request/response API. No retry or pagination logic lives here.
#[derive(Debug, Clone)]
pub struct SdkBackend {
    client: Client,
}

impl SdkBackend {
    pub fn new(sdk_config: &aws_config::SdkConfig) -> Self {
        Self {
            client: Client::new(sdk_config),
        }
    }
}

fn non_empty<K, V>(map: HashMap<K, V>) -> Option<HashMap<K, V>> {
    if map.is_empty() {
        None
    } else {
        Some(map)
    }
}

#[async_trait]
impl StoreBackend for SdkBackend {
    async fn get_item(
        &self,
        table: &str,
        key: Attributes,
    ) -> Result<Option<Attributes>, StoreError> {
        let output = self
            .client
            .get_item()
            .table_name(table)
            .set_key(Some(key))
            .send()
            .await?;
        Ok(output.item)
    }

    async fn put_item(
        &self,
        table: &str,
        item: Attributes,
        condition: Option<Condition>,
    ) -> Result<(), StoreError> {
        let mut request = self.client.put_item().table_name(table).set_item(Some(item));
        if let Some(condition) = condition {
            request = request
                .condition_expression(condition.expression)
                .set_expression_attribute_names(non_empty(condition.names))
                .set_expression_attribute_values(non_empty(condition.values));
        }
        request.send().await?;
        Ok(())
    }

    async fn delete_item(
        &self,
        table: &str,
        key: Attributes,
    ) -> Result<Option<Attributes>, StoreError> {
        let output = self
            .client
            .delete_item()
            .table_name(table)
            .set_key(Some(key))
            .return_values(ReturnValue::AllOld)
            .send()
            .await?;
        Ok(output.attributes)
    }

    async fn update_item(&self, request: UpdateRequest) -> Result<Attributes, StoreError> {
        let output = self
            .client
            .update_item()
            .table_name(request.table)
            .set_key(Some(request.key))
            .update_expression(request.update.render())
            .set_condition_expression(request.condition)
            .set_expression_attribute_names(non_empty(request.names))
            .set_expression_attribute_values(non_empty(request.values))
            .return_values(ReturnValue::AllNew)
            .send()
            .await?;
        Ok(output.attributes.unwrap_or_default())
    }

    async fn page(&self, request: PageRequest) -> Result<Page, StoreError> {
        match request.key_condition {
            Some(key_condition) => {
                let output = self
                    .client
                    .query()
                    .table_name(request.table)
                    .set_index_name(request.index)
                    .key_condition_expression(key_condition)
                    .set_filter_expression(request.filter)
                    .set_expression_attribute_names(non_empty(request.names))
                    .set_expression_attribute_values(non_empty(request.values))
                    .set_scan_index_forward(request.scan_forward)
                    .set_exclusive_start_key(request.exclusive_start_key)
                    .set_limit(request.limit.map(|limit| limit as i32))
                    .set_select(request.count_only.then_some(Select::Count))
                    .send()
                    .await?;
                Ok(Page {
                    items: output.items.unwrap_or_default(),
                    last_evaluated_key: output.last_evaluated_key,
                    count: output.count as usize,
                })
            }
            None => {
                let output = self
                    .client
                    .scan()
                    .table_name(request.table)
                    .set_index_name(request.index)
                    .set_filter_expression(request.filter)
                    .set_expression_attribute_names(non_empty(request.names))
                    .set_expression_attribute_values(non_empty(request.values))
                    .set_exclusive_start_key(request.exclusive_start_key)
                    .set_limit(request.limit.map(|limit| limit as i32))
                    .set_select(request.count_only.then_some(Select::Count))
                    .send()
                    .await?;
                Ok(Page {
                    items: output.items.unwrap_or_default(),
                    last_evaluated_key: output.last_evaluated_key,
                    count: output.count as usize,
                })
            }
        }
    }

    async fn batch_get(
        &self,
        table: &str,
        keys: Vec<Attributes>,
        consistent: bool,
    ) -> Result<BatchGetOutput, StoreError> {
        let request = KeysAndAttributes::builder()
            .set_keys(Some(keys))
            .consistent_read(consistent)
            .build()?;
        let output = self
            .client
            .batch_get_item()
            .request_items(table, request)
            .send()
            .await?;

        let items = output
            .responses
            .unwrap_or_default()
            .remove(table)
            .unwrap_or_default();
        let unprocessed_keys = output
            .unprocessed_keys
            .unwrap_or_default()
            .remove(table)
            .map(|keys_and_attributes| keys_and_attributes.keys)
            .unwrap_or_default();
        Ok(BatchGetOutput {
            items,
            unprocessed_keys,
        })
    }

    async fn batch_put(
        &self,
        table: &str,
        items: Vec<Attributes>,
    ) -> Result<Vec<Attributes>, StoreError> {
        let writes = items
            .into_iter()
            .map(|item| {
                Ok(WriteRequest::builder()
                    .put_request(AwsPutRequest::builder().set_item(Some(item)).build()?)
                    .build())
            })
            .collect::<Result<Vec<_>, StoreError>>()?;

        let output = self
            .client
            .batch_write_item()
            .request_items(table, writes)
            .send()
            .await?;

        let unprocessed = output
            .unprocessed_items
            .unwrap_or_default()
            .remove(table)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|write| write.put_request.map(|put| put.item))
            .collect();
        Ok(unprocessed)
    }

    async fn transact_put(&self, puts: Vec<TransactPut>, token: &str) -> Result<(), StoreError> {
        let items = puts
            .into_iter()
            .map(|put| {
                Ok(TransactWriteItem::builder()
                    .put(
                        Put::builder()
                            .table_name(put.table)
                            .set_item(Some(put.item))
                            .build()?,
                    )
                    .build())
            })
            .collect::<Result<Vec<_>, StoreError>>()?;

        self.client
            .transact_write_items()
            .client_request_token(token)
            .set_transact_items(Some(items))
            .send()
            .await?;
        Ok(())
    }
}
