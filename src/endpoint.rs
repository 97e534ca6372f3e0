//! Broker endpoint clean-up, applied to user input before it becomes a
//! [`BrokerConfig`](crate::config::BrokerConfig) URL.

use tracing::debug;
use url::Url;

const HIVEMQ_CLOUD_SUFFIX: &str = ".hivemq.cloud";
const HIVEMQ_WSS_PORT: u16 = 8884;

/// Turns loose user input into a WebSocket broker URL.
///
/// - surrounding whitespace is trimmed, empty input stays empty
/// - `http://` and `https://` become `wss://`
/// - input without a `ws://`/`wss://` scheme gets `wss://` prepended
/// - HiveMQ Cloud hosts get port 8884 and a path ending in `/mqtt` unless given
///
/// Input that still does not parse as a URL is returned after the scheme fix.
pub fn normalize_wss_url(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return String::new();
    }

    let mut candidate = match strip_scheme(trimmed, &["https://", "http://"]) {
        Some(rest) => format!("wss://{rest}"),
        None => trimmed.to_string(),
    };
    if strip_scheme(&candidate, &["ws://", "wss://"]).is_none() {
        candidate = format!("wss://{}", candidate.trim_start_matches('/'));
    }

    let mut url = match Url::parse(&candidate) {
        Ok(url) => url,
        Err(e) => {
            debug!("Leaving broker URL '{}' as is: {}", candidate, e);
            return candidate;
        }
    };

    let is_hivemq = url
        .host_str()
        .is_some_and(|host| host.to_ascii_lowercase().ends_with(HIVEMQ_CLOUD_SUFFIX));
    if is_hivemq {
        if url.port().is_none() {
            // only fails for URLs that cannot carry a port
            let _ = url.set_port(Some(HIVEMQ_WSS_PORT));
        }
        let path = url.path().to_string();
        let lower = path.to_ascii_lowercase();
        if !(lower.ends_with("/mqtt") || lower.ends_with("/mqtt/")) {
            let base = if path.ends_with('/') { path } else { format!("{path}/") };
            url.set_path(&format!("{base}mqtt"));
        }
    }
    url.to_string()
}

/// Remainder of `input` after the first matching scheme, compared case-insensitively.
fn strip_scheme<'a>(input: &'a str, schemes: &[&str]) -> Option<&'a str> {
    schemes.iter().find_map(|scheme| {
        let head = input.get(..scheme.len())?;
        head.eq_ignore_ascii_case(scheme)
            .then(|| &input[scheme.len()..])
    })
}
