//! Twilio Sync Maps 存储
//!
//! 每个 (call, kind) 一张 Map（UniqueName = `{callSid}_{kind}`），由 prepare_map 创建；
//! 实体 id 作为 Item Key，值作为 Item Data。每个方法只发一个 HTTP 请求。
//! HTTP 404 → NotFound，409 → AlreadyExists，429 → RateLimited。

use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde_json::Value;

use crate::sync::store::{ReplicaKey, ReplicaKind, SyncError, SyncStore};

pub const TWILIO_SYNC_BASE_URL: &str = "https://sync.twilio.com/v1";

#[derive(Debug, Clone)]
pub struct TwilioCredentials {
    pub account_sid: String,
    pub auth_token: String,
    pub service_sid: String,
}

impl TwilioCredentials {
    /// 从 TWILIO_ACCOUNT_SID / TWILIO_AUTH_TOKEN / TWILIO_SYNC_SVC_SID 读取
    pub fn from_env() -> Option<Self> {
        Some(Self {
            account_sid: std::env::var("TWILIO_ACCOUNT_SID").ok()?,
            auth_token: std::env::var("TWILIO_AUTH_TOKEN").ok()?,
            service_sid: std::env::var("TWILIO_SYNC_SVC_SID").ok()?,
        })
    }
}

pub struct TwilioSyncStore {
    client: Client,
    credentials: TwilioCredentials,
    base_url: String,
    /// 已确认存在的 Map
    maps: Mutex<HashSet<String>>,
}

impl TwilioSyncStore {
    pub fn new(credentials: TwilioCredentials) -> Self {
        Self::with_base_url(credentials, TWILIO_SYNC_BASE_URL)
    }

    pub fn with_base_url(credentials: TwilioCredentials, base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            credentials,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            maps: Mutex::new(HashSet::new()),
        }
    }

    fn maps_url(&self) -> String {
        format!("{}/Services/{}/Maps", self.base_url, self.credentials.service_sid)
    }

    fn items_url(&self, map: &str) -> String {
        format!("{}/{}/Items", self.maps_url(), map)
    }

    fn item_url(&self, map: &str, item: &str) -> String {
        format!("{}/{}", self.items_url(map), item)
    }

    fn map_known(&self, map: &str) -> bool {
        self.maps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(map)
    }

    fn remember_map(&self, map: &str) {
        self.maps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(map.to_string());
    }

    async fn ensure_map(&self, map: &str) -> Result<(), SyncError> {
        if self.map_known(map) {
            return Ok(());
        }
        let resp = self
            .client
            .post(self.maps_url())
            .basic_auth(&self.credentials.account_sid, Some(&self.credentials.auth_token))
            .form(&[("UniqueName", map)])
            .send()
            .await
            .map_err(|e| SyncError::Request(e.to_string()))?;
        match check(resp, map).await {
            Ok(()) | Err(SyncError::AlreadyExists(_)) => {}
            Err(e) => return Err(e),
        }
        tracing::debug!(map, "sync map ready");
        self.remember_map(map);
        Ok(())
    }

    async fn post_item(&self, url: String, form: &[(&str, &str)], what: &str) -> Result<Response, SyncError> {
        self.client
            .post(url)
            .basic_auth(&self.credentials.account_sid, Some(&self.credentials.auth_token))
            .form(form)
            .send()
            .await
            .map_err(|e| SyncError::Request(format!("{what}: {e}")))
    }
}

fn encode(value: &Value) -> Result<String, SyncError> {
    serde_json::to_string(value).map_err(|e| SyncError::Request(e.to_string()))
}

async fn check(resp: Response, what: &str) -> Result<(), SyncError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(());
    }
    let body = resp.text().await.unwrap_or_default();
    Err(match status {
        StatusCode::NOT_FOUND => SyncError::NotFound(what.to_string()),
        StatusCode::CONFLICT => SyncError::AlreadyExists(what.to_string()),
        StatusCode::TOO_MANY_REQUESTS => SyncError::RateLimited(what.to_string()),
        _ => SyncError::Request(format!("{what}: HTTP {status}: {body}")),
    })
}

#[async_trait]
impl SyncStore for TwilioSyncStore {
    async fn prepare_map(&self, call_id: &str, kind: ReplicaKind) -> Result<(), SyncError> {
        self.ensure_map(&kind.map_name(call_id)).await
    }

    async fn create(&self, key: &ReplicaKey, value: &Value) -> Result<(), SyncError> {
        let map = key.map_name();
        let data = encode(value)?;
        let resp = self
            .post_item(
                self.items_url(&map),
                &[("Key", key.id.as_str()), ("Data", data.as_str())],
                "create item",
            )
            .await?;
        check(resp, &key.to_string()).await
    }

    async fn update(&self, key: &ReplicaKey, value: &Value) -> Result<(), SyncError> {
        let map = key.map_name();
        let data = encode(value)?;
        let resp = self
            .post_item(
                self.item_url(&map, &key.id),
                &[("Data", data.as_str())],
                "update item",
            )
            .await?;
        check(resp, &key.to_string()).await
    }

    async fn remove(&self, key: &ReplicaKey) -> Result<(), SyncError> {
        let map = key.map_name();
        let resp = self
            .client
            .delete(self.item_url(&map, &key.id))
            .basic_auth(&self.credentials.account_sid, Some(&self.credentials.auth_token))
            .send()
            .await
            .map_err(|e| SyncError::Request(e.to_string()))?;
        check(resp, &key.to_string()).await
    }
}
