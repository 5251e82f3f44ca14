//! SRS-style HTTP signaling protocol.
//!
//! One exchange is a single `POST` of the local offer to
//! `{base}/rtc/v1/publish/` or `{base}/rtc/v1/play/`:
//!
//! ```text
//! -> {"sdp": "<offer>", "streamurl": "webrtc://<host>/live/call_<a>_<b>"}
//! <- {"code": 0, "sdp": "<answer>", "sessionid": "<token>"}
//! ```
//!
//! `code == 0` is success. This module only builds and interprets the
//! payloads; performing the request is left to an [`HttpClient`](crate::net::HttpClient).

use crate::types::PeerRole;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Relay application segment used when none is configured.
pub const DEFAULT_APP: &str = "live";

/// Application-level success code.
pub const CODE_OK: i64 = 0;

/// Why an exchange failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingErrorKind {
    /// Transport failure: connect/read/write error, timeout, or a non-2xx
    /// status without an application error code.
    Network,
    /// The relay answered with a non-zero application code.
    ProtocolCode(i64),
    /// Body missing, not JSON, or missing the remote description.
    MalformedResponse,
    /// Rejected before any I/O.
    InvalidRequest,
}

impl fmt::Display for SignalingErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network => write!(f, "network"),
            Self::ProtocolCode(code) => write!(f, "protocol code {code}"),
            Self::MalformedResponse => write!(f, "malformed response"),
            Self::InvalidRequest => write!(f, "invalid request"),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("signaling failed ({kind}): {detail}")]
pub struct SignalingError {
    pub kind: SignalingErrorKind,
    pub detail: String,
}

impl SignalingError {
    pub fn new(kind: SignalingErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    pub fn network(detail: impl Into<String>) -> Self {
        Self::new(SignalingErrorKind::Network, detail)
    }

    pub fn malformed(detail: impl Into<String>) -> Self {
        Self::new(SignalingErrorKind::MalformedResponse, detail)
    }

    pub fn invalid_request(detail: impl Into<String>) -> Self {
        Self::new(SignalingErrorKind::InvalidRequest, detail)
    }
}

/// Request body of one exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SdpExchangeRequest {
    pub sdp: String,
    pub streamurl: String,
}

impl SdpExchangeRequest {
    /// Validates inputs and builds the request.
    pub fn new(
        local_description: impl Into<String>,
        stream_url: impl Into<String>,
    ) -> Result<Self, SignalingError> {
        let sdp = local_description.into();
        let streamurl = stream_url.into();
        validate_local_description(&sdp)?;
        if streamurl.trim().is_empty() {
            return Err(SignalingError::invalid_request("empty stream url"));
        }
        Ok(Self { sdp, streamurl })
    }

    pub fn to_json(&self) -> Result<Vec<u8>, SignalingError> {
        serde_json::to_vec(self)
            .map_err(|e| SignalingError::invalid_request(format!("serialize request: {e}")))
    }
}

/// Response body of one exchange. Extra fields sent by the relay
/// (`server`, `service`, `pid`, ...) are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SdpExchangeResponse {
    pub code: i64,
    #[serde(default)]
    pub sdp: Option<String>,
    #[serde(default)]
    pub sessionid: Option<String>,
}

/// Successful outcome of an exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpAnswer {
    pub sdp: String,
    pub session_id: Option<String>,
}

/// Checks that a local description is non-empty and looks like SDP.
pub fn validate_local_description(sdp: &str) -> Result<(), SignalingError> {
    let first_line = sdp.lines().map(str::trim).find(|l| !l.is_empty());
    match first_line {
        None => Err(SignalingError::invalid_request("empty local description")),
        Some(line) if !line.starts_with("v=") => Err(SignalingError::invalid_request(
            "local description does not start with a version line",
        )),
        Some(_) => Ok(()),
    }
}

/// Interprets a relay response.
///
/// A parsed non-zero `code` wins over the HTTP status, so a 4xx/5xx carrying
/// `{"code": 400}` is reported as [`SignalingErrorKind::ProtocolCode`].
pub fn parse_exchange_response(status: u16, body: &[u8]) -> Result<SdpAnswer, SignalingError> {
    let parsed = serde_json::from_slice::<SdpExchangeResponse>(body);

    if let Ok(resp) = &parsed
        && resp.code != CODE_OK
    {
        return Err(SignalingError::new(
            SignalingErrorKind::ProtocolCode(resp.code),
            format!("relay returned code {} (http {})", resp.code, status),
        ));
    }

    if !(200..300).contains(&status) {
        return Err(SignalingError::network(format!("http status {status}")));
    }

    let resp = parsed.map_err(|e| SignalingError::malformed(format!("invalid body: {e}")))?;
    match resp.sdp {
        Some(sdp) if !sdp.trim().is_empty() => Ok(SdpAnswer {
            sdp,
            session_id: resp.sessionid.filter(|s| !s.is_empty()),
        }),
        _ => Err(SignalingError::malformed("response has no remote description")),
    }
}

/// Builds the full endpoint URL for a role.
pub fn endpoint_url(base_url: &str, role: PeerRole) -> String {
    format!("{}{}", base_url.trim_end_matches('/'), role.api_path())
}

/// Extracts `host` from `scheme://host[:port][/path]`.
pub fn host_from_base_url(base_url: &str) -> &str {
    let without_scheme = base_url
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(base_url);
    let authority = without_scheme.split('/').next().unwrap_or(without_scheme);
    // Bracketed IPv6 keeps its brackets; only a trailing :port is dropped.
    if authority.starts_with('[') {
        return match authority.find(']') {
            Some(end) => &authority[..=end],
            None => authority,
        };
    }
    authority.split(':').next().unwrap_or(authority)
}

/// Stream name for media published by `publisher` towards `viewer`.
pub fn stream_name(publisher: &str, viewer: &str) -> String {
    format!("call_{publisher}_{viewer}")
}

/// Stream URL a peer session negotiates.
///
/// Publishing names our own stream (`call_<me>_<them>`); playing names the
/// remote party's stream, so the ids are reversed.
pub fn stream_url(host: &str, app: &str, role: PeerRole, local_id: &str, remote_id: &str) -> String {
    let name = match role {
        PeerRole::Publish => stream_name(local_id, remote_id),
        PeerRole::Play => stream_name(remote_id, local_id),
    };
    format!("webrtc://{host}/{app}/{name}")
}
