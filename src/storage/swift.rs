use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use hmac::{Hmac, Mac};
use log::{debug, info};
use reqwest::StatusCode;
use serde_json::json;
use sha2::Sha256;
use tokio::sync::RwLock;

use super::{BlobStorage, StorageError};
use crate::config::DriveConfig;

type HmacSha256 = Hmac<Sha256>;

/// OpenStack Swift backend. Authenticates against Keystone v3 with an
/// application credential; the token is cached and refreshed on 401.
/// Signed URLs use Swift temp-url signatures with the container temp-url key.
pub struct SwiftStorage {
    client: reqwest::Client,
    auth_url: String,
    storage_url: String,
    container: String,
    credential_id: String,
    credential_secret: String,
    token: RwLock<Option<String>>,
}

impl SwiftStorage {
    pub fn new(config: &DriveConfig) -> anyhow::Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(120))
                .build()?,
            auth_url: config.auth_url.trim_end_matches('/').to_string(),
            storage_url: config.server.trim_end_matches('/').to_string(),
            container: config.bucket.clone(),
            credential_id: config.access_key.clone(),
            credential_secret: config.secret_key.clone(),
            token: RwLock::new(None),
        })
    }

    async fn authenticate(&self) -> Result<String, StorageError> {
        let body = json!({
            "auth": {
                "identity": {
                    "methods": ["application_credential"],
                    "application_credential": {
                        "id": self.credential_id,
                        "secret": self.credential_secret,
                    }
                }
            }
        });
        let resp = self
            .client
            .post(format!("{}/v3/auth/tokens", self.auth_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| StorageError::Auth(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(StorageError::Auth(format!(
                "keystone returned {}",
                resp.status()
            )));
        }
        let token = resp
            .headers()
            .get("X-Subject-Token")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| StorageError::Auth("keystone response missing token".into()))?;
        info!("Authenticated to Swift via application credential");
        *self.token.write().await = Some(token.clone());
        Ok(token)
    }

    async fn token(&self) -> Result<String, StorageError> {
        if let Some(token) = self.token.read().await.clone() {
            return Ok(token);
        }
        self.authenticate().await
    }

    fn object_url(&self, key: &str) -> String {
        format!("{}/{}/{}", self.storage_url, self.container, key)
    }

    fn object_path(&self, key: &str) -> String {
        let tail = self
            .storage_url
            .splitn(4, '/')
            .nth(3)
            .map(|p| format!("/{}", p))
            .unwrap_or_default();
        format!("{}/{}/{}", tail, self.container, key)
    }

    /// One retry after re-auth when the cached token has expired.
    async fn request_with_auth<F>(&self, build: F) -> Result<reqwest::Response, StorageError>
    where
        F: Fn(&reqwest::Client, &str) -> reqwest::RequestBuilder,
    {
        let token = self.token().await?;
        let resp = build(&self.client, &token)
            .send()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        if resp.status() != StatusCode::UNAUTHORIZED {
            return Ok(resp);
        }
        debug!("Swift token expired; re-authenticating");
        let token = self.authenticate().await?;
        build(&self.client, &token)
            .send()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))
    }
}

#[async_trait]
impl BlobStorage for SwiftStorage {
    async fn put(
        &self,
        key: &str,
        data: Bytes,
        content_type: &str,
    ) -> Result<String, StorageError> {
        let url = self.object_url(key);
        let content_type = content_type.to_string();
        let resp = self
            .request_with_auth(move |client, token| {
                client
                    .put(&url)
                    .header("X-Auth-Token", token)
                    .header("Content-Type", &content_type)
                    .body(data.clone())
            })
            .await?;
        if !resp.status().is_success() {
            return Err(StorageError::Backend(format!(
                "swift PUT {} returned {}",
                key,
                resp.status()
            )));
        }
        Ok(resp
            .headers()
            .get("Etag")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string())
    }

    async fn put_file(
        &self,
        key: &str,
        path: &Path,
        content_type: &str,
    ) -> Result<(String, i64), StorageError> {
        let size = tokio::fs::metadata(path).await?.len() as i64;
        let data = Bytes::from(tokio::fs::read(path).await?);
        let etag = self.put(key, data, content_type).await?;
        Ok((etag, size))
    }

    async fn get(&self, key: &str) -> Result<Bytes, StorageError> {
        let url = self.object_url(key);
        let resp = self
            .request_with_auth(move |client, token| client.get(&url).header("X-Auth-Token", token))
            .await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Err(StorageError::NotFound(key.to_string())),
            status if status.is_success() => resp
                .bytes()
                .await
                .map_err(|e| StorageError::Backend(e.to_string())),
            status => Err(StorageError::Backend(format!(
                "swift GET {} returned {}",
                key, status
            ))),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let url = self.object_url(key);
        let resp = self
            .request_with_auth(move |client, token| {
                client.delete(&url).header("X-Auth-Token", token)
            })
            .await?;
        if resp.status().is_success() || resp.status() == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(StorageError::Backend(format!(
                "swift DELETE {} returned {}",
                key,
                resp.status()
            )))
        }
    }

    async fn signed_url(&self, key: &str, ttl: Duration) -> Result<String, StorageError> {
        let expires = Utc::now().timestamp() + ttl.as_secs() as i64;
        let path = self.object_path(key);
        let to_sign = format!("GET\n{}\n{}", expires, path);
        let mut mac = HmacSha256::new_from_slice(self.credential_secret.as_bytes())
            .expect("HMAC accepts keys of any length");
        mac.update(to_sign.as_bytes());
        let sig = hex::encode(mac.finalize().into_bytes());
        Ok(format!(
            "{}?temp_url_sig={}&temp_url_expires={}",
            self.object_url(key),
            sig,
            expires
        ))
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let url = self.object_url(key);
        let resp = self
            .request_with_auth(move |client, token| client.head(&url).header("X-Auth-Token", token))
            .await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            status => Err(StorageError::Backend(format!(
                "swift HEAD {} returned {}",
                key, status
            ))),
        }
    }
}
