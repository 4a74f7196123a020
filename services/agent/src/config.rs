//! Agent configuration.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use outpost_id::EndpointId;

use crate::AgentError;

/// An endpoint this agent serves and the local address behind it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointTarget {
    pub endpoint_id: EndpointId,
    /// `host:port` dialed for every stream on the endpoint.
    pub target: String,
}

impl FromStr for EndpointTarget {
    type Err = AgentError;

    /// Parses `name=host:port`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((name, target)) = s.split_once('=') else {
            return Err(AgentError::Config(format!(
                "endpoint {s:?} must look like name=host:port"
            )));
        };
        let endpoint_id = EndpointId::parse(name.trim())
            .map_err(|e| AgentError::Config(format!("endpoint name {name:?}: {e}")))?;
        let target = target.trim();
        if target.rsplit_once(':').is_none_or(|(host, port)| host.is_empty() || port.parse::<u16>().is_err()) {
            return Err(AgentError::Config(format!(
                "target {target:?} must look like host:port"
            )));
        }
        Ok(Self {
            endpoint_id,
            target: target.to_string(),
        })
    }
}

impl fmt::Display for EndpointTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.endpoint_id, self.target)
    }
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Server upstream address, `host:port`.
    pub server_addr: String,
    pub credential: String,
    pub endpoints: Vec<EndpointTarget>,
    /// Reported to the server in the handshake.
    pub name: Option<String>,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    /// Upper bound of the reconnect backoff.
    pub reconnect_max: Duration,
    /// Mux keepalive. `None` disables it.
    pub keepalive: Option<Duration>,
    pub keepalive_timeout: Duration,
}

impl AgentConfig {
    pub fn new(server_addr: impl Into<String>, credential: impl Into<String>) -> Self {
        Self {
            server_addr: server_addr.into(),
            credential: credential.into(),
            endpoints: Vec::new(),
            name: None,
            connect_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(5),
            reconnect_max: Duration::from_secs(30),
            keepalive: Some(Duration::from_secs(15)),
            keepalive_timeout: Duration::from_secs(45),
        }
    }

    pub fn with_endpoint(mut self, endpoint: EndpointTarget) -> Self {
        self.endpoints.push(endpoint);
        self
    }

    pub fn target_for(&self, endpoint_id: &EndpointId) -> Option<&str> {
        self.endpoints
            .iter()
            .find(|e| &e.endpoint_id == endpoint_id)
            .map(|e| e.target.as_str())
    }

    pub fn validate(&self) -> Result<(), AgentError> {
        if self.endpoints.is_empty() {
            return Err(AgentError::Config("at least one endpoint is required".to_string()));
        }
        if self.server_addr.trim().is_empty() {
            return Err(AgentError::Config("server address is required".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("web=127.0.0.1:8080", "web", "127.0.0.1:8080")]
    #[case(" db = localhost:5432 ", "db", "localhost:5432")]
    #[case("v6=[::1]:9000", "v6", "[::1]:9000")]
    fn test_parse_target(#[case] input: &str, #[case] name: &str, #[case] target: &str) {
        let parsed: EndpointTarget = input.parse().unwrap();
        assert_eq!(parsed.endpoint_id.as_str(), name);
        assert_eq!(parsed.target, target);
    }

    #[rstest]
    #[case("no-equals")]
    #[case("=127.0.0.1:80")]
    #[case("web=localhost")]
    #[case("web=:80")]
    #[case("bad name=127.0.0.1:80")]
    fn test_parse_target_rejects(#[case] input: &str) {
        assert!(input.parse::<EndpointTarget>().is_err());
    }

    #[test]
    fn test_validate_requires_endpoints() {
        assert!(AgentConfig::new("127.0.0.1:7000", "t").validate().is_err());
    }
}
