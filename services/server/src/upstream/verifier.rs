//! Registration credential checks.

use std::collections::HashSet;

use async_trait::async_trait;
use outpost_id::EndpointId;

/// Validates the credential an upstream presents in its handshake.
///
/// Returning `Err(reason)` rejects the connection; the reason is sent back
/// to the upstream.
#[async_trait]
pub trait CredentialVerifier: Send + Sync {
    async fn verify(&self, credential: &str, endpoints: &[EndpointId]) -> Result<(), String>;
}

/// Accepts every credential. For development and tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

#[async_trait]
impl CredentialVerifier for AllowAll {
    async fn verify(&self, _credential: &str, _endpoints: &[EndpointId]) -> Result<(), String> {
        Ok(())
    }
}

/// Accepts credentials from a fixed token set.
#[derive(Debug, Clone)]
pub struct StaticTokens {
    tokens: HashSet<String>,
}

impl StaticTokens {
    pub fn new(tokens: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            tokens: tokens.into_iter().map(Into::into).collect(),
        }
    }

    /// Parse a comma separated token list, ignoring blanks.
    pub fn from_csv(csv: &str) -> Self {
        Self::new(csv.split(',').map(str::trim).filter(|t| !t.is_empty()))
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait]
impl CredentialVerifier for StaticTokens {
    async fn verify(&self, credential: &str, _endpoints: &[EndpointId]) -> Result<(), String> {
        // Compare against every token so timing does not reveal which one
        // shares a prefix with the credential.
        let matched = self
            .tokens
            .iter()
            .fold(false, |acc, token| acc | constant_time_eq(token.as_bytes(), credential.as_bytes()));
        if matched {
            Ok(())
        } else {
            Err("invalid credential".to_string())
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
