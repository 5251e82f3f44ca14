//! HTTP transport for the relay's SDP exchange.

use log::{debug, warn};
use relaycore::net::{HttpClient, HttpRequest};
use relaycore::signaling::{
    SdpAnswer, SdpExchangeRequest, SignalingError, endpoint_url, parse_exchange_response,
};
use relaycore::types::PeerRole;
use std::sync::Arc;

/// Exchanges local offers for remote answers against the relay API.
///
/// Every call is a single POST with no retry; retry policy belongs to the caller.
#[derive(Clone)]
pub struct SignalingTransport {
    http: Arc<dyn HttpClient>,
    base_url: String,
}

impl std::fmt::Debug for SignalingTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingTransport")
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl SignalingTransport {
    pub fn new(http: Arc<dyn HttpClient>, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn endpoint(&self, role: PeerRole) -> String {
        endpoint_url(&self.base_url, role)
    }

    /// POSTs `{sdp, streamurl}` to `endpoint` and returns the relay's answer.
    pub async fn exchange(
        &self,
        endpoint: &str,
        local_description: &str,
        stream_url: &str,
    ) -> Result<SdpAnswer, SignalingError> {
        let body = SdpExchangeRequest::new(local_description, stream_url)?.to_json()?;
        let request = HttpRequest::post(endpoint).with_json_body(body);

        debug!("SDP exchange -> {} ({})", endpoint, stream_url);
        let response = self.http.execute(request).await.map_err(|e| {
            warn!("SDP exchange with {} failed: {:#}", endpoint, e);
            SignalingError::network(e.to_string())
        })?;

        let answer = parse_exchange_response(response.status_code, &response.body)?;
        debug!(
            "SDP exchange <- {} (session {})",
            endpoint,
            answer.session_id.as_deref().unwrap_or("-")
        );
        Ok(answer)
    }

    /// [`exchange`](Self::exchange) against the role's endpoint.
    pub async fn exchange_for(
        &self,
        role: PeerRole,
        local_description: &str,
        stream_url: &str,
    ) -> Result<SdpAnswer, SignalingError> {
        self.exchange(&self.endpoint(role), local_description, stream_url)
            .await
    }
}
