//! Optional Prometheus metrics exporter, gated behind the `prometheus`
//! feature. Every call site invokes [`Metrics`] unconditionally; the
//! counters themselves only exist, and only do anything, when the feature
//! is compiled in.

#[cfg(feature = "prometheus")]
mod registered {
    use std::sync::LazyLock;

    use prometheus::{Encoder, IntCounter, TextEncoder, register_int_counter};

    macro_rules! counter {
        ($name:expr, $help:expr) => {
            register_int_counter!($name, $help).expect("duplicate prometheus metric registration")
        };
    }

    pub struct Counters {
        pub sessions_created: IntCounter,
        pub peers_joined: IntCounter,
        pub peers_left: IntCounter,
        pub messages_routed: IntCounter,
        pub messages_rate_limited: IntCounter,
    }

    pub static COUNTERS: LazyLock<Counters> = LazyLock::new(|| Counters {
        sessions_created: counter!("sendie_sessions_created_total", "sessions created"),
        peers_joined: counter!("sendie_peers_joined_total", "peers that joined a session"),
        peers_left: counter!("sendie_peers_left_total", "peers that left a session"),
        messages_routed: counter!("sendie_messages_routed_total", "signaling messages routed between peers"),
        messages_rate_limited: counter!("sendie_messages_rate_limited_total", "inbound hub calls rejected by the rate limiter"),
    });

    /// Renders the process' registered counters in the Prometheus text
    /// exposition format, for the `/metrics` route.
    pub fn render() -> anyhow::Result<Vec<u8>> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&prometheus::gather(), &mut buf)?;
        Ok(buf)
    }
}

/// No-op counters so call sites need no `#[cfg]` of their own.
pub struct Metrics;

impl Metrics {
    pub fn session_created() {
        #[cfg(feature = "prometheus")]
        registered::COUNTERS.sessions_created.inc();
    }

    pub fn peer_joined() {
        #[cfg(feature = "prometheus")]
        registered::COUNTERS.peers_joined.inc();
    }

    pub fn peer_left() {
        #[cfg(feature = "prometheus")]
        registered::COUNTERS.peers_left.inc();
    }

    pub fn message_routed() {
        #[cfg(feature = "prometheus")]
        registered::COUNTERS.messages_routed.inc();
    }

    pub fn message_rate_limited() {
        #[cfg(feature = "prometheus")]
        registered::COUNTERS.messages_rate_limited.inc();
    }
}

#[cfg(feature = "prometheus")]
pub fn render() -> anyhow::Result<Vec<u8>> {
    registered::render()
}

#[cfg(not(feature = "prometheus"))]
pub fn render() -> anyhow::Result<Vec<u8>> {
    Ok(Vec::new())
}
