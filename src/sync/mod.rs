//! 复制层：把会话状态镜像到外部同步存储（限流 / 防抖 / 合并 / 按键有序）

pub mod debounce;
pub mod limiter;
pub mod queue;
pub mod store;
pub mod twilio;

use std::sync::Arc;

pub use debounce::Debouncer;
pub use limiter::{BurstLimiter, WritePriority};
pub use queue::{ReplicationStats, Replicator, ReplicatorSettings};
pub use store::{
    InMemorySyncStore, ReplicaKey, ReplicaKind, SyncError, SyncOp, SyncOpKind, SyncStore,
};
pub use twilio::{TwilioCredentials, TwilioSyncStore};

use crate::config::SyncSection;

/// 按配置创建同步存储；backend = none 或凭据不全时返回 None（不复制）
pub fn store_from_config(cfg: &SyncSection) -> Option<Arc<dyn SyncStore>> {
    match cfg.backend.as_str() {
        "memory" => Some(Arc::new(InMemorySyncStore::new())),
        "twilio" => {
            let from_env = TwilioCredentials::from_env();
            let credentials = match (&cfg.account_sid, &cfg.auth_token, &cfg.service_sid) {
                (Some(account_sid), Some(auth_token), Some(service_sid)) => TwilioCredentials {
                    account_sid: account_sid.clone(),
                    auth_token: auth_token.clone(),
                    service_sid: service_sid.clone(),
                },
                _ => match from_env {
                    Some(c) => c,
                    None => {
                        tracing::warn!("sync backend twilio selected but credentials missing, replication disabled");
                        return None;
                    }
                },
            };
            Some(Arc::new(TwilioSyncStore::new(credentials)))
        }
        "none" | "" => None,
        other => {
            tracing::warn!(backend = other, "unknown sync backend, replication disabled");
            None
        }
    }
}
