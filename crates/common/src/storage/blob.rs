use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_config::{meta::region::RegionProviderChain, BehaviorVersion, Region};
use aws_credential_types::Credentials;
use aws_sdk_s3::{
    config::Builder as S3ConfigBuilder,
    primitives::ByteStream,
    types::{Delete, ObjectIdentifier},
    Client,
};

use crate::config::BlobConfig;
use crate::storage::ObjectStore;

/// S3-compatible blob store client (MinIO in the reference deployment).
#[derive(Clone)]
pub struct BlobStore {
    client: Client,
    bucket: String,
}

impl BlobStore {
    pub async fn connect(cfg: &BlobConfig) -> Result<Self> {
        let region = Region::new(cfg.region.clone());
        let region_provider = RegionProviderChain::first_try(region.clone()).or_default_provider();
        let base = aws_config::defaults(BehaviorVersion::latest())
            .region(region_provider)
            .load()
            .await;

        let scheme = if cfg.use_ssl { "https" } else { "http" };
        let endpoint = if cfg.endpoint.starts_with("http") {
            cfg.endpoint.clone()
        } else {
            format!("{scheme}://{}", cfg.endpoint)
        };

        let conf = S3ConfigBuilder::from(&base)
            .region(region)
            .endpoint_url(endpoint)
            .force_path_style(true)
            .credentials_provider(Credentials::new(
                cfg.access_key.clone(),
                cfg.secret_key.clone(),
                None,
                None,
                "static",
            ))
            .build();

        Ok(Self {
            client: Client::from_conf(conf),
            bucket: cfg.bucket.clone(),
        })
    }

    /// Create the bucket if it does not exist; already-owned errors are
    /// indistinguishable from success for our purposes.
    pub async fn ensure_bucket(&self) {
        let _ = self
            .client
            .create_bucket()
            .bucket(&self.bucket)
            .send()
            .await;
    }
}

#[async_trait]
impl ObjectStore for BlobStore {
    async fn put_object(&self, key: &str, data: Vec<u8>, content_type: &str) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .body(ByteStream::from(data))
            .send()
            .await
            .with_context(|| format!("put object {key}"))?;
        Ok(())
    }

    async fn get_object(&self, key: &str) -> Result<Vec<u8>> {
        let out = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .with_context(|| format!("get object {key}"))?;
        let data = out
            .body
            .collect()
            .await
            .with_context(|| format!("read object {key}"))?;
        Ok(data.into_bytes().to_vec())
    }

    async fn delete_objects(&self, keys: &[String]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let objects = keys
            .iter()
            .map(|k| ObjectIdentifier::builder().key(k).build())
            .collect::<Result<Vec<_>, _>>()
            .context("build delete object list")?;
        let delete = Delete::builder()
            .set_objects(Some(objects))
            .build()
            .context("build delete request")?;
        self.client
            .delete_objects()
            .bucket(&self.bucket)
            .delete(delete)
            .send()
            .await
            .context("delete objects")?;
        Ok(())
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .into_paginator()
            .send();
        while let Some(page) = pages.next().await {
            let page = page.with_context(|| format!("list objects {prefix}"))?;
            for obj in page.contents() {
                if let Some(key) = obj.key() {
                    keys.push(key.to_string());
                }
            }
        }
        Ok(keys)
    }

    async fn ping(&self) -> Result<()> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .context("blob store unreachable")?;
        Ok(())
    }
}
