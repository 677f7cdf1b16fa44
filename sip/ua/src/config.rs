use crate::error::Error;
use crate::timer::consts;
use crate::transport::TransportType;
use std::collections::HashSet;
use std::net::IpAddr;
use std::time::Duration;

/// A single listening transport of the stack
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub transport_type: TransportType,
    pub host: String,
    pub port: u16,
    /// Only meaningful for WS/WSS
    pub ws_path: Option<String>,
    pub keep_alive: bool,
    pub keep_alive_period: Duration,
}

impl TransportConfig {
    pub fn new(transport_type: TransportType, host: impl Into<String>, port: u16) -> Self {
        Self {
            transport_type,
            host: host.into(),
            port,
            ws_path: None,
            keep_alive: false,
            keep_alive_period: Duration::from_secs(30),
        }
    }
}

/// A remote destination with selection metadata, see
/// [`EndpointSet`](crate::select::EndpointSet)
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub name: String,
    pub host: IpAddr,
    pub port: u16,
    pub transport_type: TransportType,
    /// Lower value is preferred
    pub priority: u16,
    /// Relative share inside a priority group
    pub weight: u16,
}

/// Overrides for the RFC 3261 base timers.
///
/// Values are clamped at validation, they may never go below the RFC
/// minima.
#[derive(Debug, Clone, Copy)]
pub struct TimerDefaults {
    pub t1: Duration,
    pub timer_b: Duration,
    pub timer_d: Duration,
}

impl Default for TimerDefaults {
    fn default() -> Self {
        Self {
            t1: consts::T1,
            timer_b: consts::T1 * 64,
            timer_d: consts::TIMER_D,
        }
    }
}

/// Static configuration of a [`Stack`](crate::Stack)
#[derive(Debug, Clone)]
pub struct Config {
    /// Value of the `User-Agent` header on outbound requests
    pub user_agent: String,

    /// Hard cap of concurrently live dialogs, incoming dialogs beyond it
    /// are rejected with 503
    pub max_dialogs: usize,

    pub transports: Vec<TransportConfig>,

    /// Primary plus ordered fallback destinations for outbound dialogs
    pub endpoints: Vec<EndpointConfig>,

    pub timers: TimerDefaults,

    /// Lifetime of REFER subscriptions
    pub refer_subscribe_expiry: Duration,

    /// Number of registry shards, must be a power of two
    pub registry_shards: usize,

    /// Deterministic Call-IDs and tags for reproducible tests
    pub test_mode: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            user_agent: concat!("softsip/", env!("CARGO_PKG_VERSION")).into(),
            max_dialogs: 16_384,
            transports: Vec::new(),
            endpoints: Vec::new(),
            timers: TimerDefaults::default(),
            refer_subscribe_expiry: Duration::from_secs(60),
            registry_shards: crate::registry::DEFAULT_SHARD_COUNT,
            test_mode: false,
        }
    }
}

impl Config {
    /// Check the configuration and clamp timer overrides to the RFC
    /// minima. Called once when the stack is constructed.
    pub(crate) fn validate(&mut self) -> Result<(), Error> {
        if self.max_dialogs == 0 {
            return Err(Error::Configuration("max_dialogs must be non-zero".into()));
        }

        if !self.registry_shards.is_power_of_two() {
            return Err(Error::Configuration(format!(
                "registry_shards must be a power of two, got {}",
                self.registry_shards
            )));
        }

        let mut names = HashSet::new();

        for endpoint in &self.endpoints {
            if endpoint.name.is_empty() {
                return Err(Error::Configuration("endpoint with empty name".into()));
            }

            if !names.insert(endpoint.name.as_str()) {
                return Err(Error::Configuration(format!(
                    "duplicate endpoint name {:?}",
                    endpoint.name
                )));
            }

            if endpoint.port == 0 {
                return Err(Error::Configuration(format!(
                    "endpoint {:?} has port 0",
                    endpoint.name
                )));
            }
        }

        for transport in &self.transports {
            if transport.ws_path.is_some()
                && !matches!(
                    transport.transport_type,
                    TransportType::Ws | TransportType::Wss
                )
            {
                return Err(Error::Configuration(format!(
                    "ws_path set on non-websocket transport {}",
                    transport.transport_type
                )));
            }
        }

        if self.refer_subscribe_expiry < Duration::from_secs(1) {
            return Err(Error::Configuration(
                "refer_subscribe_expiry below one second".into(),
            ));
        }

        self.timers.t1 = self.timers.t1.max(consts::T1);
        self.timers.timer_b = self.timers.timer_b.max(self.timers.t1 * 64);
        self.timers.timer_d = self.timers.timer_d.max(consts::TIMER_D);

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_is_valid() {
        let mut config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.timers.t1, consts::T1);
    }

    #[test]
    fn shard_count_must_be_power_of_two() {
        let mut config = Config {
            registry_shards: 24,
            ..Default::default()
        };

        assert!(matches!(
            config.validate(),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn duplicate_endpoint_names_rejected() {
        let endpoint = EndpointConfig {
            name: "primary".into(),
            host: "127.0.0.1".parse().unwrap(),
            port: 5060,
            transport_type: TransportType::Udp,
            priority: 1,
            weight: 10,
        };

        let mut config = Config {
            endpoints: vec![endpoint.clone(), endpoint],
            ..Default::default()
        };

        assert!(config.validate().is_err());
    }

    #[test]
    fn timer_overrides_clamped_to_rfc_minima() {
        let mut config = Config {
            timers: TimerDefaults {
                t1: Duration::from_millis(100),
                timer_b: Duration::from_secs(1),
                timer_d: Duration::from_secs(5),
            },
            ..Default::default()
        };

        config.validate().unwrap();

        assert_eq!(config.timers.t1, consts::T1);
        assert_eq!(config.timers.timer_b, consts::T1 * 64);
        assert_eq!(config.timers.timer_d, consts::TIMER_D);
    }
}
