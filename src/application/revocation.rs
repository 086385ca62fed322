//! TTL-bounded blacklist of revoked credentials.
//!
//! Entries are JSON [`BlacklistEntry`] values stored under
//! `<prefix><token>` with a native store expiry, so the blacklist never
//! outgrows the lifetime of the credentials it covers.
//!
//! Tokens are secrets: every log line and audit event carries
//! [`mask_token`] output only.

use crate::application::metrics::{RevocationStatistics, StatsCounters};
use crate::application::ports::{AtomicStore, AuditEvent, AuditSink, Clock, KeyTtl};
use crate::domain::error::{ResilienceError, StoreError};
use crate::domain::revocation::{mask_token, BlacklistEntry, RevocationFailureMode, RevocationInfo};
use chrono::{DateTime, Utc};
use futures::stream::{self, Stream, StreamExt};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const AUDIT_CATEGORY: &str = "revocation";
const SCAN_PAGE_SIZE: usize = 100;
const BATCH_CONCURRENCY: usize = 16;

/// Blacklist of revoked tokens backed by the Shared Atomic Store.
pub struct RevocationStore<S: AtomicStore> {
    store: Arc<S>,
    key_prefix: String,
    failure_mode: RevocationFailureMode,
    clock: Arc<dyn Clock>,
    counters: StatsCounters,
    audit: Arc<dyn AuditSink>,
}

impl<S: AtomicStore> Clone for RevocationStore<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            key_prefix: self.key_prefix.clone(),
            failure_mode: self.failure_mode,
            clock: Arc::clone(&self.clock),
            counters: self.counters.clone(),
            audit: Arc::clone(&self.audit),
        }
    }
}

impl<S: AtomicStore> std::fmt::Debug for RevocationStore<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RevocationStore")
            .field("key_prefix", &self.key_prefix)
            .field("failure_mode", &self.failure_mode)
            .finish_non_exhaustive()
    }
}

impl<S: AtomicStore> RevocationStore<S> {
    /// Create a revocation store.
    ///
    /// `failure_mode` has no default: the deployment decides whether a store
    /// outage lets revoked tokens through or locks everyone out.
    pub fn new(
        store: Arc<S>,
        key_prefix: impl Into<String>,
        failure_mode: RevocationFailureMode,
        clock: Arc<dyn Clock>,
        counters: StatsCounters,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            store,
            key_prefix: key_prefix.into(),
            failure_mode,
            clock,
            counters,
            audit,
        }
    }

    /// Answer given by lookups when the store fails.
    pub fn failure_mode(&self) -> RevocationFailureMode {
        self.failure_mode
    }

    /// Revoke `token` for `ttl_seconds`.
    ///
    /// Idempotent: adding the same token again overwrites the entry and
    /// restarts its TTL.
    ///
    /// # Errors
    /// * [`ResilienceError::Validation`] on an empty token or reason, or a zero TTL
    /// * [`ResilienceError::StoreUnavailable`] if the write fails
    pub async fn add(
        &self,
        token: &str,
        reason: &str,
        ttl_seconds: u64,
    ) -> Result<(), ResilienceError> {
        if token.trim().is_empty() {
            return Err(ResilienceError::validation("token must not be empty"));
        }
        if reason.trim().is_empty() {
            return Err(ResilienceError::validation("reason must not be empty"));
        }
        if ttl_seconds == 0 {
            return Err(ResilienceError::validation("ttl_seconds must be positive"));
        }

        let entry = BlacklistEntry::new(reason, self.now(), ttl_seconds);
        let value = serde_json::to_string(&entry)
            .map_err(|e| StoreError::Protocol(format!("failed to encode blacklist entry: {}", e)))?;

        self.store
            .set(&self.key(token), &value, Some(Duration::from_secs(ttl_seconds)))
            .await?;

        let masked = mask_token(token);
        info!(token = %masked, reason, ttl_seconds, "Token revoked");
        self.audit.emit(AuditEvent::new(
            AUDIT_CATEGORY,
            "add",
            format!("token {} revoked for {}s: {}", masked, ttl_seconds, reason),
        ));
        self.counters.record_revocation_added();
        Ok(())
    }

    /// Check whether `token` is revoked.
    ///
    /// A blank token is never revoked. When the store cannot answer, the
    /// configured [`RevocationFailureMode`] decides.
    pub async fn is_revoked(&self, token: &str) -> bool {
        if token.trim().is_empty() {
            return false;
        }

        match self.store.get(&self.key(token)).await {
            Ok(None) => {
                self.counters.record_revocation_lookup(false);
                false
            }
            Ok(Some(raw)) => {
                // Presence means revoked unless the entry itself says it lapsed
                let revoked = match serde_json::from_str::<BlacklistEntry>(&raw) {
                    Ok(entry) => !entry.is_expired_at(self.now()),
                    Err(_) => true,
                };
                self.counters.record_revocation_lookup(revoked);
                revoked
            }
            Err(e) => {
                let revoked = self.failure_mode.revoked_on_error();
                warn!(
                    token = %mask_token(token),
                    error = %e,
                    failure_mode = ?self.failure_mode,
                    revoked,
                    "Revocation lookup failed"
                );
                self.counters.record_revocation_lookup_error();
                revoked
            }
        }
    }

    /// Entry details and remaining TTL for `token`.
    ///
    /// # Errors
    /// Returns [`ResilienceError::StoreUnavailable`] if the store fails or the
    /// entry cannot be decoded.
    pub async fn info(&self, token: &str) -> Result<Option<RevocationInfo>, ResilienceError> {
        if token.trim().is_empty() {
            return Ok(None);
        }

        let key = self.key(token);
        let Some(raw) = self.store.get(&key).await? else {
            return Ok(None);
        };
        let entry = serde_json::from_str::<BlacklistEntry>(&raw).map_err(|e| {
            StoreError::Protocol(format!(
                "undecodable blacklist entry for {}: {}",
                mask_token(token),
                e
            ))
        })?;
        if entry.is_expired_at(self.now()) {
            return Ok(None);
        }

        let remaining_ttl = match self.store.ttl(&key).await? {
            KeyTtl::Expires(remaining) => Some(remaining),
            KeyTtl::Persistent | KeyTtl::Missing => None,
        };
        Ok(Some(RevocationInfo {
            entry,
            remaining_ttl,
        }))
    }

    /// Lift the revocation of `token`. Returns whether an entry existed.
    ///
    /// # Errors
    /// Returns [`ResilienceError::StoreUnavailable`] if the delete fails.
    pub async fn remove(&self, token: &str) -> Result<bool, ResilienceError> {
        if token.trim().is_empty() {
            return Ok(false);
        }

        let removed = self.store.delete(&self.key(token)).await?;
        if removed {
            let masked = mask_token(token);
            info!(token = %masked, "Token revocation lifted");
            self.audit.emit(AuditEvent::new(
                AUDIT_CATEGORY,
                "remove",
                format!("token {} removed from blacklist", masked),
            ));
            self.counters.record_revocation_removed();
        }
        Ok(removed)
    }

    /// Lazily enumerate every revoked token.
    ///
    /// Each call starts a fresh scan. Tokens are yielded once per listing even
    /// if the store reports a key on several pages. A store failure ends the
    /// listing early with a warning.
    pub fn list_all(&self) -> impl Stream<Item = String> + Send + 'static {
        let state = ListState {
            store: Arc::clone(&self.store),
            prefix: self.key_prefix.clone(),
            cursor: 0,
            started: false,
            buffer: VecDeque::new(),
            seen: HashSet::new(),
        };

        stream::unfold(state, |mut state| async move {
            loop {
                if let Some(token) = state.buffer.pop_front() {
                    return Some((token, state));
                }
                if state.started && state.cursor == 0 {
                    return None;
                }

                match state
                    .store
                    .scan(&state.prefix, state.cursor, SCAN_PAGE_SIZE)
                    .await
                {
                    Ok((next, keys)) => {
                        state.started = true;
                        state.cursor = next;
                        for key in keys {
                            if let Some(token) = key.strip_prefix(state.prefix.as_str()) {
                                if state.seen.insert(token.to_string()) {
                                    state.buffer.push_back(token.to_string());
                                }
                            }
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "Blacklist listing aborted");
                        return None;
                    }
                }
            }
        })
    }

    /// Delete entries that are logically expired but carry no native TTL,
    /// and entries that cannot be decoded. Returns how many were deleted.
    ///
    /// Entries with a native TTL are left to the store.
    ///
    /// # Errors
    /// Returns [`ResilienceError::StoreUnavailable`] if the store fails.
    pub async fn sweep_expired(&self) -> Result<usize, ResilienceError> {
        let now = self.now();
        let mut swept = 0;
        let mut cursor = 0;

        loop {
            let (next, keys) = self
                .store
                .scan(&self.key_prefix, cursor, SCAN_PAGE_SIZE)
                .await?;

            for key in keys {
                if self.should_sweep(&key, now).await? && self.store.delete(&key).await? {
                    swept += 1;
                    self.counters.record_revocation_removed();
                }
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        if swept > 0 {
            info!(swept, "Swept stale blacklist entries");
            self.audit.emit(AuditEvent::new(
                AUDIT_CATEGORY,
                "sweep",
                format!("removed {} stale blacklist entries", swept),
            ));
        } else {
            debug!("No stale blacklist entries");
        }
        Ok(swept)
    }

    /// Revoke many tokens with one reason and TTL.
    ///
    /// Returns how many were added. Individual failures are logged and
    /// skipped.
    pub async fn batch_add<I, T>(&self, tokens: I, reason: &str, ttl_seconds: u64) -> usize
    where
        I: IntoIterator<Item = T>,
        T: AsRef<str>,
    {
        let tokens: Vec<String> = tokens
            .into_iter()
            .map(|token| token.as_ref().to_string())
            .collect();

        stream::iter(tokens)
            .map(|token| async move {
                match self.add(&token, reason, ttl_seconds).await {
                    Ok(()) => true,
                    Err(e) => {
                        debug!(token = %mask_token(&token), error = %e, "Skipping token in batch");
                        false
                    }
                }
            })
            .buffer_unordered(BATCH_CONCURRENCY)
            .fold(0, |count, added| {
                futures::future::ready(if added { count + 1 } else { count })
            })
            .await
    }

    /// Snapshot of the revocation counters.
    pub fn statistics(&self) -> RevocationStatistics {
        self.counters.revocation()
    }

    async fn should_sweep(&self, key: &str, now: DateTime<Utc>) -> Result<bool, ResilienceError> {
        let Some(raw) = self.store.get(key).await? else {
            return Ok(false);
        };
        match serde_json::from_str::<BlacklistEntry>(&raw) {
            Err(_) => Ok(true),
            Ok(entry) if entry.is_expired_at(now) => {
                Ok(self.store.ttl(key).await? == KeyTtl::Persistent)
            }
            Ok(_) => Ok(false),
        }
    }

    fn key(&self, token: &str) -> String {
        format!("{}{}", self.key_prefix, token)
    }

    fn now(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from(self.clock.now())
    }
}

struct ListState<S> {
    store: Arc<S>,
    prefix: String,
    cursor: u64,
    started: bool,
    buffer: VecDeque<String>,
    seen: HashSet<String>,
}
