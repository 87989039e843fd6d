//! DynamoDB-backed cache.
//!
//! Items are keyed by the single partition attribute `p`; the encoded
//! response lives in the binary attribute `v`. Expiry, when wanted, is a
//! table-level TTL concern, so the per-call ttl is not applied here.

use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_dynamodb::primitives::Blob;
use aws_sdk_dynamodb::types::AttributeValue;
use aws_sdk_dynamodb::Client;

use crate::cache::Cache;
use crate::error::CacheError;

/// Name of the partition key attribute.
const PARTITION_ATTR: &str = "p";

/// Name of the value attribute.
const VALUE_ATTR: &str = "v";

#[derive(Clone)]
pub struct DynamoDbCache {
    client: Client,
    table_name: String,
}

impl DynamoDbCache {
    pub fn new(client: Client, table_name: impl Into<String>) -> Self {
        Self {
            client,
            table_name: table_name.into(),
        }
    }
}

#[async_trait]
impl Cache for DynamoDbCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let output = self
            .client
            .get_item()
            .table_name(&self.table_name)
            .key(PARTITION_ATTR, AttributeValue::S(key.to_string()))
            .send()
            .await
            .map_err(|e| CacheError::Backend(e.to_string()))?;

        let Some(item) = output.item() else {
            return Ok(None);
        };
        match item.get(VALUE_ATTR) {
            Some(AttributeValue::B(blob)) => Ok(Some(blob.clone().into_inner())),
            Some(_) => Err(CacheError::Codec(format!(
                "attribute {:?} is not binary",
                VALUE_ATTR
            ))),
            None => Ok(None),
        }
    }

    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        _ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        self.client
            .put_item()
            .table_name(&self.table_name)
            .item(PARTITION_ATTR, AttributeValue::S(key.to_string()))
            .item(VALUE_ATTR, AttributeValue::B(Blob::new(value)))
            .send()
            .await
            .map_err(|e| CacheError::Backend(e.to_string()))?;
        Ok(())
    }
}
