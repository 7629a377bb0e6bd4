//! CredentialAuthority: agent-secret verification, pairing-code issuance and
//! consumption, and the access/refresh token lifecycle.

use std::sync::Arc;

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::config::RelayConfig;
use crate::crypto;
use crate::error::RelayError;
use crate::store::{Store, now_unix};

/// Claims carried by the access JWT. `sub` is the `device_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessClaims {
    pub sub: String,
    pub agent_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    pub iss: String,
    pub iat: u64,
    pub exp: u64,
}

pub struct IssuedTokens {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: u64,
}

pub struct PairStartResult {
    pub code: String,
    pub expires_at: i64,
    pub agent_id: String,
}

pub struct PairCompleteResult {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: u64,
    pub agent_id: String,
    pub agent_display_name: String,
    pub device_id: String,
}

pub struct CredentialAuthority<S: Store> {
    store: Arc<S>,
    config: Arc<RelayConfig>,
}

impl<S: Store> CredentialAuthority<S> {
    pub fn new(store: Arc<S>, config: Arc<RelayConfig>) -> Self {
        Self { store, config }
    }

    /// Verify an agent's bearer secret, either against its stored per-agent
    /// digest or, if enabled and the per-agent check fails, the legacy
    /// global fallback secret.
    pub async fn verify_agent_secret(&self, agent_id: &str, secret: &str) -> Result<(), RelayError> {
        let expected = crypto::hash_agent_secret(agent_id, secret);
        if let Some(agent) = self.store.find_agent_by_id(agent_id).await? {
            if crypto::constant_time_eq(agent.secret_hash.as_bytes(), expected.as_bytes()) {
                return Ok(());
            }
        }
        self.check_legacy_global_secret(secret)
            .map_err(|_| RelayError::InvalidCredentials)
    }

    /// Accept a bare secret against the legacy global fallback, if configured.
    /// Used to rescue an `AgentSecretMismatch` from `upsert_agent` at
    /// pair-start time, and as the last resort in `verify_agent_secret`.
    fn check_legacy_global_secret(&self, secret: &str) -> Result<(), RelayError> {
        if self.config.pairing.allow_legacy_global_agent_secret
            && let Some(ref legacy) = self.config.pairing.legacy_global_agent_secret
            && crypto::constant_time_eq(legacy.as_bytes(), secret.as_bytes())
        {
            return Ok(());
        }
        Err(RelayError::AgentSecretMismatch)
    }

    /// Rate-check, upsert agent, issue a fresh pairing code, replacing
    /// any previous live code for this agent.
    pub async fn pair_start(
        &self,
        agent_id: &str,
        display_name: &str,
        tenant_id: Option<&str>,
        secret: &str,
        client_ip: &str,
    ) -> Result<PairStartResult, RelayError> {
        if !self
            .store
            .rate_check(
                &format!("{client_ip}:pairing"),
                self.config.pairing.rate_per_hour,
                self.config.pairing.rate_window_sec as i64,
            )
            .await?
        {
            return Err(RelayError::RateLimited);
        }

        let secret_hash = crypto::hash_agent_secret(agent_id, secret);
        match self
            .store
            .upsert_agent(agent_id, display_name, &secret_hash, tenant_id)
            .await
        {
            Ok(_) => {}
            Err(RelayError::AgentSecretMismatch) => {
                self.check_legacy_global_secret(secret)?;
            }
            Err(e) => return Err(e),
        }

        let expires_at = now_unix() + self.config.pairing.ttl_sec as i64;
        let code = self.issue_pairing_code_with_retry(agent_id, expires_at).await?;

        Ok(PairStartResult {
            code,
            expires_at,
            agent_id: agent_id.to_string(),
        })
    }

    /// Generate a pairing code and attempt to store it, retrying on
    /// collision with a still-live code up to 3 times before surfacing
    /// `INTERNAL`.
    async fn issue_pairing_code_with_retry(
        &self,
        agent_id: &str,
        expires_at: i64,
    ) -> Result<String, RelayError> {
        let mut last_err = None;
        for _ in 0..3 {
            let code = crypto::generate_pairing_code();
            match self.store.issue_pairing(agent_id, &code, expires_at).await {
                Ok(()) => return Ok(code),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or(RelayError::Internal("pairing code generation exhausted".into())))
    }

    /// Resolve a pairing code into a linked device plus issued token pair.
    pub async fn pair_complete(
        &self,
        code: &str,
        device_label: &str,
        account: Option<&crate::store::AccountRow>,
        client_ip: &str,
    ) -> Result<PairCompleteResult, RelayError> {
        if !self
            .store
            .rate_check(
                &format!("{client_ip}:pairing"),
                self.config.pairing.rate_per_hour,
                self.config.pairing.rate_window_sec as i64,
            )
            .await?
        {
            return Err(RelayError::RateLimited);
        }

        let snapshot = self
            .store
            .consume_pairing(code, now_unix(), self.config.pairing.max_attempts)
            .await?;

        if let Some(account) = account {
            self.enforce_freemium_limit(account, &snapshot.agent_id).await?;
        }

        let device_id = uuid::Uuid::new_v4().to_string();
        self.store
            .create_device(
                &device_id,
                &snapshot.agent_id,
                device_label,
                snapshot.tenant_id.as_deref(),
                now_unix(),
            )
            .await?;

        let tokens = self
            .issue_tokens(&device_id, &snapshot.agent_id, snapshot.tenant_id.as_deref())
            .await?;

        if let Some(account) = account {
            self.store.link_account_agent(&account.id, &snapshot.agent_id).await?;
        }

        Ok(PairCompleteResult {
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            expires_in: tokens.expires_in,
            agent_id: snapshot.agent_id,
            agent_display_name: snapshot.display_name,
            device_id,
        })
    }

    /// Freemium enforcement: refuse when linking would exceed the
    /// allowance *and* the agent is not already linked to this account.
    async fn enforce_freemium_limit(
        &self,
        account: &crate::store::AccountRow,
        agent_id: &str,
    ) -> Result<(), RelayError> {
        if account_is_unlimited(account) {
            return Ok(());
        }
        if self.store.account_has_agent(&account.id, agent_id).await? {
            return Ok(());
        }
        let linked = self.store.count_account_agents(&account.id).await?;
        if linked >= self.config.freemium.free_agent_limit {
            return Err(RelayError::FreePlanLimit);
        }
        Ok(())
    }

    /// Issue a fresh access+refresh token pair and persist the refresh
    /// token's digest.
    async fn issue_tokens(
        &self,
        device_id: &str,
        agent_id: &str,
        tenant_id: Option<&str>,
    ) -> Result<IssuedTokens, RelayError> {
        let access_token = self.encode_access_token(device_id, agent_id, tenant_id)?;
        let refresh_token = crypto::generate_id(32);
        let refresh_hash = crypto::sha256_hex(&refresh_token);
        let refresh_expires = now_unix() + self.config.jwt.refresh_ttl_sec as i64;

        self.store
            .store_refresh_token(&refresh_hash, device_id, agent_id, refresh_expires)
            .await?;

        Ok(IssuedTokens {
            access_token,
            refresh_token,
            expires_in: self.config.jwt.access_ttl_sec,
        })
    }

    /// Atomically rotate the presented refresh token for a fresh pair. A previously-rotated token is never accepted
    /// again, because `rotate_refresh_token` deletes the old digest in the
    /// same batch that inserts the new one.
    pub async fn refresh(&self, refresh_token: &str) -> Result<IssuedTokens, RelayError> {
        let old_hash = crypto::sha256_hex(refresh_token);
        let Some((device_id, agent_id, expires_at)) = self.store.find_refresh_token(&old_hash).await?
        else {
            return Err(RelayError::Unauthorized);
        };
        if expires_at < now_unix() {
            return Err(RelayError::Unauthorized);
        }

        let agent = self.store.find_agent_by_id(&agent_id).await?;
        let tenant_id = agent.and_then(|a| a.tenant_id);

        let new_access = self.encode_access_token(&device_id, &agent_id, tenant_id.as_deref())?;
        let new_refresh = crypto::generate_id(32);
        let new_hash = crypto::sha256_hex(&new_refresh);
        let new_expires = now_unix() + self.config.jwt.refresh_ttl_sec as i64;

        self.store
            .rotate_refresh_token(&old_hash, &new_hash, &device_id, &agent_id, new_expires)
            .await?;

        Ok(IssuedTokens {
            access_token: new_access,
            refresh_token: new_refresh,
            expires_in: self.config.jwt.access_ttl_sec,
        })
    }

    fn encode_access_token(
        &self,
        device_id: &str,
        agent_id: &str,
        tenant_id: Option<&str>,
    ) -> Result<String, RelayError> {
        let now = now_unix() as u64;
        let claims = AccessClaims {
            sub: device_id.to_string(),
            agent_id: agent_id.to_string(),
            tenant_id: tenant_id.map(str::to_string),
            iss: self.config.jwt.issuer.clone(),
            iat: now,
            exp: now + self.config.jwt.access_ttl_sec,
        };
        jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(self.config.jwt.secret.as_bytes()),
        )
        .map_err(|e| RelayError::Internal(format!("jwt encode failed: {e}")))
    }

    /// Verify an access JWT: signature, `exp`, and `iss` must all hold.
    pub fn verify_access_token(&self, token: &str) -> Result<AccessClaims, RelayError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[&self.config.jwt.issuer]);
        validation.validate_exp = true;

        let data = jsonwebtoken::decode::<AccessClaims>(
            token,
            &DecodingKey::from_secret(self.config.jwt.secret.as_bytes()),
            &validation,
        )
        .map_err(|e| match e.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => RelayError::TokenExpired,
            _ => RelayError::TokenInvalid,
        })?;
        Ok(data.claims)
    }
}

/// Pro accounts bypass the freemium agent cap while their subscription is in
/// an active-ish state; anything else (including a cancelled pro account)
/// falls back to the free allowance.
pub fn account_is_unlimited(account: &crate::store::AccountRow) -> bool {
    account.plan == "pro"
        && matches!(
            account.subscription_status.as_deref(),
            Some("active") | Some("trialing") | Some("past_due")
        )
}
