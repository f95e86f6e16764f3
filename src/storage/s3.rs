//! S3 object-store storage backend.
//!
//! One object per key; everything except the bytes lives in object
//! metadata (`bytebin-*` keys) so a record can be listed without
//! fetching its body.
//!
//! Credentials are resolved via the standard AWS credential chain
//! (`AWS_REGION`, `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY`, profile,
//! IAM role). `AWS_S3_ENDPOINT_URL` overrides the endpoint for
//! S3-compatible stores.

use aws_sdk_s3::Client;
use std::collections::HashMap;
use tracing::{debug, warn};

use super::backend::{BoxFuture, StorageBackend};
use crate::content::Content;

/// Storage backend that persists content to an S3 bucket.
pub struct S3Backend {
    backend_id: String,
    bucket: String,
    client: Client,
}

impl S3Backend {
    pub async fn new(backend_id: impl Into<String>, bucket: impl Into<String>) -> anyhow::Result<Self> {
        let mut config_loader = aws_config::defaults(aws_config::BehaviorVersion::latest());

        if let Ok(endpoint) = std::env::var("AWS_S3_ENDPOINT_URL") {
            if !endpoint.is_empty() {
                config_loader = config_loader.endpoint_url(endpoint);
            }
        }

        let sdk_config = config_loader.load().await;
        Ok(Self {
            backend_id: backend_id.into(),
            bucket: bucket.into(),
            client: Client::new(&sdk_config),
        })
    }

    /// Map an AWS SDK error to an anyhow error with context.
    fn map_sdk_error(context: &str, err: impl std::fmt::Display) -> anyhow::Error {
        anyhow::anyhow!("s3 {context}: {err}")
    }

    fn write_metadata(content: &Content) -> HashMap<String, String> {
        let mut meta = HashMap::new();
        meta.insert("bytebin-version".to_string(), "1".to_string());
        meta.insert("bytebin-contenttype".to_string(), content.content_type.clone());
        meta.insert(
            "bytebin-expiry".to_string(),
            content.expiry.unwrap_or(-1).to_string(),
        );
        meta.insert(
            "bytebin-lastmodified".to_string(),
            content.last_modified.to_string(),
        );
        meta.insert(
            "bytebin-modifiable".to_string(),
            content.modifiable.to_string(),
        );
        if content.modifiable {
            if let Some(auth_key) = &content.auth_key {
                meta.insert("bytebin-authkey".to_string(), auth_key.clone());
            }
        }
        meta.insert("bytebin-encoding".to_string(), content.encoding.clone());
        meta
    }

    fn read_metadata(
        &self,
        key: &str,
        meta: &HashMap<String, String>,
        bytes: bytes::Bytes,
    ) -> anyhow::Result<Content> {
        let content_type = meta
            .get("bytebin-contenttype")
            .cloned()
            .unwrap_or_else(|| "text/plain".to_string());

        let expiry = match meta
            .get("bytebin-expiry")
            .map(|v| v.parse::<i64>())
            .transpose()?
        {
            Some(-1) | None => None,
            Some(millis) => Some(millis),
        };

        let last_modified = meta
            .get("bytebin-lastmodified")
            .map(|v| v.parse::<i64>())
            .transpose()?
            .unwrap_or_default();

        let modifiable = meta
            .get("bytebin-modifiable")
            .is_some_and(|v| v == "true");
        let auth_key = if modifiable {
            meta.get("bytebin-authkey").cloned()
        } else {
            None
        };

        let encoding = meta
            .get("bytebin-encoding")
            .cloned()
            .unwrap_or_default();

        let mut content = Content::new(
            key.to_string(),
            content_type,
            expiry,
            last_modified,
            auth_key,
            encoding,
            bytes,
        );
        content.modifiable = modifiable;
        content.backend_id = Some(self.backend_id.clone());
        Ok(content)
    }
}

impl StorageBackend for S3Backend {
    fn backend_id(&self) -> &str {
        &self.backend_id
    }

    fn load(&self, key: &str) -> BoxFuture<'_, anyhow::Result<Option<Content>>> {
        let key = key.to_string();
        Box::pin(async move {
            debug!("s3 get_object: bucket={} key={}", self.bucket, key);

            let resp = match self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(&key)
                .send()
                .await
            {
                Ok(resp) => resp,
                Err(err) => {
                    let service_err = err.into_service_error();
                    if service_err.is_no_such_key() {
                        return Ok(None);
                    }
                    return Err(Self::map_sdk_error("get_object", service_err));
                }
            };

            let meta = resp.metadata().cloned().unwrap_or_default();
            let bytes = resp
                .body
                .collect()
                .await
                .map_err(|e| Self::map_sdk_error("get_object body", e))?
                .into_bytes();

            self.read_metadata(&key, &meta, bytes).map(Some)
        })
    }

    fn save(&self, content: Content) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            debug!("s3 put_object: bucket={} key={}", self.bucket, content.key);

            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(&content.key)
                .set_metadata(Some(Self::write_metadata(&content)))
                .body(aws_sdk_s3::primitives::ByteStream::from(
                    content.content.clone(),
                ))
                .send()
                .await
                .map_err(|e| Self::map_sdk_error("put_object", e))?;

            Ok(())
        })
    }

    fn delete(&self, key: &str) -> BoxFuture<'_, anyhow::Result<()>> {
        let key = key.to_string();
        Box::pin(async move {
            self.client
                .delete_object()
                .bucket(&self.bucket)
                .key(&key)
                .send()
                .await
                .map_err(|e| Self::map_sdk_error("delete_object", e))?;
            Ok(())
        })
    }

    fn list(&self) -> BoxFuture<'_, anyhow::Result<Vec<Content>>> {
        Box::pin(async move {
            let keys = self.list_keys().await?;
            let mut records = Vec::with_capacity(keys.len());

            for key in keys {
                let head = match self
                    .client
                    .head_object()
                    .bucket(&self.bucket)
                    .key(&key)
                    .send()
                    .await
                {
                    Ok(head) => head,
                    Err(err) => {
                        warn!("exception occurred loading meta for '{key}': {err}");
                        continue;
                    }
                };

                let meta = head.metadata().cloned().unwrap_or_default();
                match self.read_metadata(&key, &meta, bytes::Bytes::new()) {
                    Ok(mut content) => {
                        content.content_length = head.content_length().unwrap_or(0) as u64;
                        records.push(content);
                    }
                    Err(err) => {
                        warn!("exception occurred loading meta for '{key}': {err:#}");
                    }
                }
            }

            Ok(records)
        })
    }

    fn list_keys(&self) -> BoxFuture<'_, anyhow::Result<Vec<String>>> {
        Box::pin(async move {
            let mut keys = Vec::new();
            let mut pages = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .into_paginator()
                .send();

            while let Some(page) = pages.next().await {
                let page = page.map_err(|e| Self::map_sdk_error("list_objects_v2", e))?;
                for object in page.contents() {
                    if let Some(key) = object.key() {
                        keys.push(key.to_string());
                    }
                }
            }

            Ok(keys)
        })
    }
}
