use std::time::Duration;

use folio_core::SyncConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseKind {
    /// 1000: the peer is done with us.
    Clean,
    /// 1008, 4401, 4403: the token was rejected or expired.
    Auth,
    Other,
}

impl CloseKind {
    pub fn classify(code: Option<u16>) -> Self {
        match code {
            Some(1000) => CloseKind::Clean,
            Some(1008 | 4401 | 4403) => CloseKind::Auth,
            _ => CloseKind::Other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Stop,
    Retry(Duration),
    GiveUp,
}

/// Separate attempt counters for auth and transport closes.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    max_auth_retries: u32,
    max_retries: u32,
    auth_base: Duration,
    auth_step: Duration,
    backoff_step: Duration,
    backoff_cap: Duration,
    auth_attempts: u32,
    attempts: u32,
}

impl ReconnectPolicy {
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            max_auth_retries: config.max_auth_retries,
            max_retries: config.max_retries,
            auth_base: config.auth_retry_base,
            auth_step: config.auth_retry_step,
            backoff_step: config.backoff_step,
            backoff_cap: config.backoff_cap,
            auth_attempts: 0,
            attempts: 0,
        }
    }

    pub fn on_close(&mut self, kind: CloseKind) -> RetryDecision {
        match kind {
            CloseKind::Clean => RetryDecision::Stop,
            CloseKind::Auth => {
                self.auth_attempts += 1;
                if self.auth_attempts > self.max_auth_retries {
                    return RetryDecision::GiveUp;
                }
                RetryDecision::Retry(self.auth_base + self.auth_step * self.auth_attempts)
            }
            CloseKind::Other => {
                self.attempts += 1;
                if self.attempts > self.max_retries {
                    return RetryDecision::GiveUp;
                }
                RetryDecision::Retry((self.backoff_step * self.attempts).min(self.backoff_cap))
            }
        }
    }

    /// A session that delivered traffic starts the budget over.
    pub fn reset(&mut self) {
        self.auth_attempts = 0;
        self.attempts = 0;
    }
}
