use std::time::Duration;

use rand::Rng;
use rumqttc::QoS;

/// Transport tuning shared by every link a session opens.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionOptions {
    pub client_id: String,
    pub keep_alive: Duration,
    /// Wait between failed connection attempts.
    pub reconnect_period: Duration,
    pub connect_timeout: Duration,
    pub clean_session: bool,
    /// Capacity of the request queue towards the broker.
    pub request_capacity: usize,
    pub default_qos: QoS,
}

impl Default for SessionOptions {
    fn default() -> Self {
        SessionOptions {
            client_id: random_client_id(),
            keep_alive: Duration::from_secs(30),
            reconnect_period: Duration::from_secs(3),
            connect_timeout: Duration::from_secs(5),
            clean_session: true,
            request_capacity: 64,
            default_qos: QoS::AtLeastOnce,
        }
    }
}

/// `devicedash-` followed by eight random hex digits.
pub fn random_client_id() -> String {
    let suffix: u32 = rand::thread_rng().gen();
    format!("devicedash-{suffix:08x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_ids_are_prefixed_and_vary() {
        let a = random_client_id();
        let b = random_client_id();
        assert!(a.starts_with("devicedash-"));
        assert_eq!(a.len(), "devicedash-".len() + 8);
        assert_ne!(a, b);
    }
}
