use std::{fmt, str::FromStr, time::Duration};

use serde::{Deserialize, Deserializer, Serialize};
use typed_builder::TypedBuilder;

/// How long a replay may sit on an idle connection before it is aborted.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Scheme used to reach the replay target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Protocol {
    Http,
    Https,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = String;

    /// Accepts `http`, `https`, and the `http:` / `https:` spellings.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let scheme = s.trim().trim_end_matches(':');
        if scheme.eq_ignore_ascii_case("http") {
            Ok(Protocol::Http)
        } else if scheme.eq_ignore_ascii_case("https") {
            Ok(Protocol::Https)
        } else {
            Err(format!("unsupported protocol {s:?}, expected http or https"))
        }
    }
}

impl TryFrom<String> for Protocol {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Protocol> for String {
    fn from(value: Protocol) -> Self {
        value.as_str().to_string()
    }
}

/// Overrides applied to every request a [`ReplayClient`](crate::ReplayClient) sends.
///
/// Build it in code with [`ReplayOptions::builder`] or load it from a config
/// file (camelCase keys, every field optional):
///
/// ```
/// let opts: reprise::ReplayOptions = serde_json::from_str(
///     r#"{ "overrideHost": "localhost", "overridePort": "8080", "insecure": true }"#,
/// ).unwrap();
/// assert_eq!(opts.override_port, Some(8080));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, TypedBuilder)]
#[serde(default, rename_all = "camelCase")]
pub struct ReplayOptions {
    /// Replaces the host the captured request was sent to.
    #[builder(default, setter(into, strip_option))]
    pub override_host: Option<String>,
    /// Replaces the port. Config files may give it as a number or a string.
    #[builder(default, setter(strip_option))]
    #[serde(deserialize_with = "deserialize_port")]
    pub override_port: Option<u16>,
    /// Forces the scheme regardless of what was captured.
    #[builder(default, setter(strip_option))]
    #[serde(alias = "protocol")]
    pub protocol_override: Option<Protocol>,
    /// Skip TLS certificate verification.
    #[builder(default)]
    pub insecure: bool,
    /// Sent as `authorization: Bearer <token>`, replacing any captured value.
    #[builder(default, setter(into, strip_option))]
    #[serde(alias = "overrideAuth")]
    pub override_auth_token: Option<String>,
    /// Log outgoing request lines and bodies on the `reprise::wire` target.
    #[builder(default)]
    pub verbose: bool,
    /// Log request and response header sets on the `reprise::wire` target.
    #[builder(default)]
    pub output_headers: bool,
    #[builder(default = DEFAULT_IDLE_TIMEOUT)]
    #[serde(rename = "idleTimeoutSecs", deserialize_with = "deserialize_secs")]
    pub idle_timeout: Duration,
}

impl Default for ReplayOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

fn deserialize_port<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u16>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Port {
        Number(u16),
        Text(String),
    }

    match Option::<Port>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Port::Number(port)) => Ok(Some(port)),
        Some(Port::Text(text)) if text.trim().is_empty() => Ok(None),
        Some(Port::Text(text)) => text
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| serde::de::Error::custom(format!("invalid port {text:?}"))),
    }
}

fn deserialize_secs<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    let secs = f64::deserialize(deserializer)?;
    Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
}
