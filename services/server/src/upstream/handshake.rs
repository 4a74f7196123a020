//! Server side of the upstream registration handshake.
//!
//! Protocol:
//! 1. Upstream sends `RegisterRequest` (credential + endpoint names)
//! 2. Server validates and asks the credential verifier
//! 3. Server sends `RegisterResponse`: accepted with a connection id, or
//!    rejected with a reason
//!
//! On rejection nothing is registered and the caller drops the transport.

use std::collections::HashSet;
use std::time::Duration;

use outpost_id::{ConnectionId, EndpointId};
use outpost_wire::{read_message, write_message, RegisterRequest, RegisterResponse};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};

use super::verifier::CredentialVerifier;
use crate::ServerError;

/// Upper bound on endpoints one connection may register.
pub const MAX_ENDPOINTS_PER_CONNECTION: usize = 64;

/// A handshake the server accepted.
#[derive(Debug, Clone)]
pub struct Registration {
    pub connection_id: ConnectionId,
    pub endpoints: Vec<EndpointId>,
    pub agent: Option<String>,
}

/// Run the handshake on a fresh transport within `timeout`.
pub async fn accept_registration<S>(
    io: &mut S,
    verifier: &dyn CredentialVerifier,
    timeout: Duration,
) -> Result<Registration, ServerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request: RegisterRequest = match tokio::time::timeout(timeout, read_message(io)).await {
        Ok(Ok(request)) => request,
        Ok(Err(e)) => {
            debug!(error = %e, "Unreadable registration request");
            let _ = reply(io, RegisterResponse::reject("malformed registration request"), timeout)
                .await;
            return Err(ServerError::HandshakeRejected(format!("malformed request: {e}")));
        }
        Err(_) => {
            return Err(ServerError::HandshakeRejected(
                "handshake timed out".to_string(),
            ))
        }
    };

    let endpoints = match validate_endpoints(request.endpoints) {
        Ok(endpoints) => endpoints,
        Err(reason) => {
            let _ = reply(io, RegisterResponse::reject(reason.clone()), timeout).await;
            return Err(ServerError::HandshakeRejected(reason));
        }
    };

    if let Err(reason) = verifier.verify(&request.credential, &endpoints).await {
        let _ = reply(io, RegisterResponse::reject(reason.clone()), timeout).await;
        return Err(ServerError::HandshakeRejected(reason));
    }

    let connection_id = ConnectionId::new();
    reply(io, RegisterResponse::accept(connection_id), timeout).await?;

    info!(
        connection_id = %connection_id,
        endpoint_count = endpoints.len(),
        agent = request.agent.as_deref().unwrap_or("unknown"),
        "Upstream registered"
    );

    Ok(Registration {
        connection_id,
        endpoints,
        agent: request.agent,
    })
}

/// Deduplicate, preserving the order the upstream gave.
fn validate_endpoints(endpoints: Vec<EndpointId>) -> Result<Vec<EndpointId>, String> {
    if endpoints.is_empty() {
        return Err("no endpoints requested".to_string());
    }
    let mut seen = HashSet::new();
    let unique: Vec<EndpointId> = endpoints
        .into_iter()
        .filter(|e| seen.insert(e.clone()))
        .collect();
    if unique.len() > MAX_ENDPOINTS_PER_CONNECTION {
        return Err(format!(
            "too many endpoints: {} > {}",
            unique.len(),
            MAX_ENDPOINTS_PER_CONNECTION
        ));
    }
    Ok(unique)
}

async fn reply<S>(io: &mut S, response: RegisterResponse, timeout: Duration) -> Result<(), ServerError>
where
    S: AsyncWrite + Unpin,
{
    match tokio::time::timeout(timeout, write_message(io, &response)).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(ServerError::HandshakeRejected(
            "timed out sending handshake reply".to_string(),
        )),
    }
}
