use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::commands::helper::CommandRunner;
use crate::config::{HelperConfig, ORIGIN_PLACEHOLDER};

/// Acquisition sequence for one `obtain` call.
///
/// TokenFetch ──fail──▶ Reauthenticate ──ok──▶ TokenFetchAfterLogin
/// Login gets a single attempt; a failure there, or of the post-login
/// fetch, fails the whole chain. Retry/backoff is deliberately absent —
/// forwarding retries live in the request forwarder, not here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AcquireState {
    TokenFetch,
    Reauthenticate,
    TokenFetchAfterLogin,
}

/// Obtains access tokens for an origin via the external credential helper.
pub struct CredentialProvider {
    runner: Arc<dyn CommandRunner>,
    helper: HelperConfig,
}

impl CredentialProvider {
    pub fn new(runner: Arc<dyn CommandRunner>, helper: HelperConfig) -> Self {
        Self { runner, helper }
    }

    /// Fetch a token for `origin`, falling back to an interactive login and
    /// a second fetch when the first fetch fails.
    pub async fn obtain(&self, origin: &str) -> Result<String> {
        let mut state = AcquireState::TokenFetch;
        loop {
            match state {
                AcquireState::TokenFetch => match self.fetch_token(origin).await {
                    Ok(token) => return Ok(token),
                    Err(err) => {
                        warn!(
                            origin = %origin,
                            error = %err,
                            "token fetch failed, attempting login"
                        );
                        state = AcquireState::Reauthenticate;
                    }
                },
                AcquireState::Reauthenticate => {
                    self.login(origin)
                        .await
                        .with_context(|| format!("login failed for {origin}"))?;
                    state = AcquireState::TokenFetchAfterLogin;
                }
                AcquireState::TokenFetchAfterLogin => {
                    return self
                        .fetch_token(origin)
                        .await
                        .with_context(|| format!("token fetch after login failed for {origin}"));
                }
            }
        }
    }

    async fn fetch_token(&self, origin: &str) -> Result<String> {
        let args = render_args(&self.helper.token_args, origin);
        let stdout = self.runner.run(&self.helper.program, &args).await?;
        let token = stdout.trim();
        if token.is_empty() {
            anyhow::bail!("credential helper returned an empty token for {origin}");
        }
        debug!(origin = %origin, "token fetched from credential helper");
        Ok(token.to_string())
    }

    async fn login(&self, origin: &str) -> Result<()> {
        let args = render_args(&self.helper.login_args, origin);
        self.runner.run(&self.helper.program, &args).await?;
        debug!(origin = %origin, "credential helper login completed");
        Ok(())
    }
}

fn render_args(template: &[String], origin: &str) -> Vec<String> {
    template
        .iter()
        .map(|arg| arg.replace(ORIGIN_PLACEHOLDER, origin))
        .collect()
}
