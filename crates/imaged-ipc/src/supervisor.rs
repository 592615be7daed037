//! Worker lifecycle: spawn, handshake, health check, respawn
//!
//! ```text
//! Uninitialized ──ensure_ready──▶ Ready ──worker died / protocol violation──▶ Degraded
//!                                   ▲                                            │
//!                                   └──────────────ensure_ready──────────────────┘
//! any state ──shutdown──▶ ShutDown
//! ```
//!
//! A session is only ever replaced wholesale: a respawned worker gets a new
//! RSA key pair and a new session key.

use std::sync::Arc;
use std::time::Duration;

use imaged_core::config::{ImagedConfig, RetryConfig};
use imaged_core::{Command, ImagedError, ImagedResult, Reply, Response};
use tokio::sync::Mutex;

use crate::channel::SecureChannel;
use crate::launcher::{Launcher, WorkerHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Uninitialized,
    Ready,
    Degraded,
    ShutDown,
}

/// Bounded exponential backoff between spawn attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff: Duration::from_millis(config.backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }

    /// Delay after the given failed attempt (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.backoff.saturating_mul(factor).min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub handshake_timeout: Duration,
    pub command_timeout: Duration,
    pub retry: RetryPolicy,
}

impl SupervisorOptions {
    pub fn from_config(config: &ImagedConfig) -> Self {
        Self {
            handshake_timeout: config.worker.handshake_timeout(),
            command_timeout: config.worker.command_timeout(),
            retry: RetryPolicy::from_config(&config.retry),
        }
    }
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self::from_config(&ImagedConfig::default())
    }
}

struct Session {
    channel: Arc<SecureChannel>,
    handle: WorkerHandle,
}

struct Inner {
    state: SupervisorState,
    session: Option<Session>,
}

pub struct Supervisor<L> {
    launcher: L,
    options: SupervisorOptions,
    inner: Mutex<Inner>,
}

impl<L: Launcher> Supervisor<L> {
    pub fn new(launcher: L, options: SupervisorOptions) -> Self {
        Self {
            launcher,
            options,
            inner: Mutex::new(Inner {
                state: SupervisorState::Uninitialized,
                session: None,
            }),
        }
    }

    pub async fn state(&self) -> SupervisorState {
        self.inner.lock().await.state
    }

    /// Return a live channel, starting or restarting the worker if needed.
    pub async fn ensure_ready(&self) -> ImagedResult<Arc<SecureChannel>> {
        let mut inner = self.inner.lock().await;
        if inner.state == SupervisorState::ShutDown {
            return Err(ImagedError::NotReady("supervisor is shut down".into()));
        }

        if let Some(session) = inner.session.as_mut() {
            if !session.handle.has_exited() {
                return Ok(session.channel.clone());
            }
            tracing::warn!("worker exited; restarting");
            if let Some(mut dead) = inner.session.take() {
                dead.handle.terminate().await;
            }
            inner.state = SupervisorState::Degraded;
        }

        let retry = &self.options.retry;
        let mut last_err = ImagedError::NotReady("no spawn attempted".into());
        for attempt in 1..=retry.max_attempts {
            match self.start_session().await {
                Ok(session) => {
                    let channel = session.channel.clone();
                    inner.session = Some(session);
                    inner.state = SupervisorState::Ready;
                    tracing::info!(attempt, "worker ready");
                    return Ok(channel);
                }
                Err(e) => {
                    tracing::warn!(attempt, max = retry.max_attempts, "worker start failed: {e}");
                    last_err = e;
                    if attempt < retry.max_attempts {
                        tokio::time::sleep(retry.delay_for(attempt)).await;
                    }
                }
            }
        }

        tracing::error!("worker unavailable after {} attempts", retry.max_attempts);
        Err(last_err)
    }

    async fn start_session(&self) -> ImagedResult<Session> {
        let mut link = self.launcher.launch().await?;
        match SecureChannel::establish(
            link.reader,
            link.writer,
            self.options.handshake_timeout,
            self.options.command_timeout,
        )
        .await
        {
            Ok(channel) => Ok(Session {
                channel: Arc::new(channel),
                handle: link.handle,
            }),
            Err(e) => {
                link.handle.terminate().await;
                Err(e)
            }
        }
    }

    /// Exchange one command, restarting the worker once if the session
    /// turns out to be dead.
    pub async fn exchange(&self, command: &Command) -> ImagedResult<Reply> {
        let channel = self.ensure_ready().await?;
        match channel.exchange(command).await {
            Err(e) if e.requires_resupervision() => {
                self.mark_degraded(&channel, &e).await;
                let channel = self.ensure_ready().await?;
                channel.exchange(command).await
            }
            other => other,
        }
    }

    /// Exchange, reporting any failure as a `success: false` response.
    pub async fn send(&self, command: &Command) -> Response {
        match self.exchange(command).await {
            Ok(reply) => reply.into_response(),
            Err(e) => Response::failure(e.to_string()),
        }
    }

    async fn mark_degraded(&self, failed: &Arc<SecureChannel>, err: &ImagedError) {
        let mut inner = self.inner.lock().await;
        let is_current = inner
            .session
            .as_ref()
            .is_some_and(|s| Arc::ptr_eq(&s.channel, failed));
        if !is_current {
            // Another caller already replaced this session
            return;
        }
        tracing::warn!("worker session lost: {err}");
        if let Some(mut session) = inner.session.take() {
            session.handle.terminate().await;
        }
        inner.state = SupervisorState::Degraded;
    }

    /// Stop the worker. Safe to call more than once.
    pub async fn shutdown(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state == SupervisorState::ShutDown {
            return;
        }
        if let Some(mut session) = inner.session.take() {
            tracing::info!(pid = session.handle.id(), "stopping worker");
            session.handle.terminate().await;
        }
        inner.state = SupervisorState::ShutDown;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            backoff: Duration::from_millis(250),
            max_backoff: Duration::from_millis(1000),
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(250));
        assert_eq!(policy.delay_for(2), Duration::from_millis(500));
        assert_eq!(policy.delay_for(3), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(40), Duration::from_millis(1000));
    }

    #[test]
    fn test_zero_attempts_still_tries_once() {
        let policy = RetryPolicy::from_config(&RetryConfig {
            max_attempts: 0,
            backoff_ms: 1,
            max_backoff_ms: 1,
        });
        assert_eq!(policy.max_attempts, 1);
    }
}
