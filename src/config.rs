use relay_call_ureq_http_client::{HttpTimeouts, UreqHttpClient};
use relaycore::signaling::{DEFAULT_APP, host_from_base_url};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Settings for a call session runtime. Durations are expressed in
/// milliseconds when (de)serialized.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// Relay HTTP API base, e.g. `http://10.0.0.5:1985`.
    pub base_url: String,
    /// Host used inside `webrtc://` stream urls. Derived from `base_url` when unset.
    pub stream_host: Option<String>,
    /// Relay application segment.
    pub app: String,
    #[serde(rename = "connect_timeout_ms", with = "duration_ms")]
    pub connect_timeout: Duration,
    #[serde(rename = "read_timeout_ms", with = "duration_ms")]
    pub read_timeout: Duration,
    #[serde(rename = "write_timeout_ms", with = "duration_ms")]
    pub write_timeout: Duration,
    /// Pause between a successful publish and the play negotiation, giving
    /// the relay time to register our stream.
    #[serde(rename = "play_delay_ms", with = "duration_ms")]
    pub play_delay: Duration,
    /// How long the UI should keep an ended call on screen.
    #[serde(rename = "dismiss_delay_ms", with = "duration_ms")]
    pub dismiss_delay: Duration,
    /// STUN/TURN urls handed to the media backend.
    pub ice_servers: Vec<String>,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:1985".to_string(),
            stream_host: None,
            app: DEFAULT_APP.to_string(),
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            play_delay: Duration::from_secs(1),
            dismiss_delay: Duration::from_millis(1500),
            ice_servers: Vec::new(),
        }
    }
}

impl CallConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Default::default()
        }
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn stream_host(&self) -> String {
        match &self.stream_host {
            Some(host) if !host.is_empty() => host.clone(),
            _ => host_from_base_url(&self.base_url).to_string(),
        }
    }

    pub fn http_timeouts(&self) -> HttpTimeouts {
        HttpTimeouts {
            connect: self.connect_timeout,
            read: self.read_timeout,
            write: self.write_timeout,
        }
    }

    /// Blocking `ureq` client with this config's timeouts.
    pub fn http_client(&self) -> UreqHttpClient {
        UreqHttpClient::with_timeouts(self.http_timeouts())
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
