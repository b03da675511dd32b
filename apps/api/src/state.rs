use std::sync::Arc;

use redis::Client as RedisClient;
use sqlx::PgPool;

use crate::assistant::attachment::RemoteAttachments;
use crate::auth::{Caller, JwtVerifier};
use crate::config::Config;
use crate::llm_client::LlmClient;
use crate::operations::AiServices;
use crate::store::{PgConfigs, PgLedger, PgScopedData, RedisBalanceNotifier};

/// Shared application state injected into all route handlers via Axum extractors.
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    /// Realtime balance broadcasts go out over Redis pub/sub.
    pub redis: RedisClient,
    pub llm: LlmClient,
    pub jwt: JwtVerifier,
    /// Fetches attachments over HTTP(S) and from object storage.
    pub attachments: Arc<RemoteAttachments>,
    pub config: Config,
}

impl AppState {
    /// Collaborators for one caller. Reads and the authorization lookups run
    /// under the caller's claims; writes use the service pool, so handlers
    /// authorize the request ids before handing these out to any operation.
    pub fn ai_services(&self, caller: &Caller) -> AiServices {
        AiServices {
            providers: Arc::new(self.llm.clone()),
            configs: Arc::new(PgConfigs::new(self.db.clone())),
            data: Arc::new(PgScopedData::new(self.db.clone(), caller.claims.clone())),
            ledger: Arc::new(PgLedger::new(self.db.clone())),
            notifier: Arc::new(RedisBalanceNotifier::new(
                self.redis.clone(),
                self.config.broadcast_timeout,
            )),
        }
    }
}
