use std::{fs::read_to_string, net::SocketAddr, str::FromStr, time::Duration};

use anyhow::Result;
use clap::Parser;
use engine::EngineOptions;
use serde::{Deserialize, Serialize};

/// One reachable remote LTP engine.
///
/// LTP itself routes by engine id only; this table binds those ids to UDP
/// addresses.
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Peer {
    ///
    /// remote engine id
    ///
    /// The session originator engine id the remote node uses in its
    /// segments, and the id under which outbound segments are routed to
    /// it.
    ///
    pub engine_id: u64,
    ///
    /// remote address
    ///
    /// The UDP address and port the remote engine listens on.
    ///
    pub address: SocketAddr,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Network {
    ///
    /// server listen address
    ///
    /// The address and port the UDP server is bound to. The binding
    /// address supports ipv4 and ipv6.
    ///
    #[serde(default = "Network::listen")]
    pub listen: SocketAddr,
    ///
    /// Maximum Transmission Unit (MTU) size for network packets.
    ///
    #[serde(default = "Network::mtu")]
    pub mtu: usize,
    ///
    /// known remote engines
    ///
    /// Inbound segments from unknown engines are still processed, but
    /// outbound segments can only be routed to engines listed here.
    ///
    #[serde(default)]
    pub peers: Vec<Peer>,
}

impl Network {
    fn listen() -> SocketAddr {
        "0.0.0.0:1113".parse().unwrap()
    }

    fn mtu() -> usize {
        1500
    }
}

impl Default for Network {
    fn default() -> Self {
        Self {
            listen: Self::listen(),
            mtu: Self::mtu(),
            peers: Default::default(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct EngineSection {
    ///
    /// local engine id
    ///
    /// The session originator engine id this node uses for every session
    /// it initiates. Must be unique within the network of peers.
    ///
    #[serde(default = "EngineSection::engine_id")]
    pub engine_id: u64,
    ///
    /// engine index
    ///
    /// Encoded into the top bits of every random session number so a
    /// receiver can recover which engine of a node produced it. Must be
    /// in the range 1 to 7.
    ///
    #[serde(default = "EngineSection::engine_index")]
    pub engine_index: u8,
    ///
    /// client service data MTU
    ///
    /// The largest client service data payload placed in one data
    /// segment. Must leave room for the segment header within the
    /// network MTU.
    ///
    #[serde(default = "EngineSection::mtu_client_service_data")]
    pub mtu_client_service_data: u64,
    ///
    /// Maximum number of reception claims per report segment; larger
    /// reports are split.
    ///
    #[serde(default = "EngineSection::max_reception_claims")]
    pub max_reception_claims: u64,
    ///
    /// one way light time in milliseconds
    ///
    /// Propagation delay towards the peers; retransmission timers run for
    /// two round trips of light time plus margin.
    ///
    #[serde(default = "EngineSection::one_way_light_time_ms")]
    pub one_way_light_time_ms: u64,
    ///
    /// one way margin time in milliseconds
    ///
    /// Slack added on top of the light time for processing and queueing
    /// delays.
    ///
    #[serde(default = "EngineSection::one_way_margin_time_ms")]
    pub one_way_margin_time_ms: u64,
    ///
    /// Capacity hint in bytes for each reception session's reassembly
    /// buffer.
    ///
    #[serde(default = "EngineSection::estimated_bytes_to_receive_per_session")]
    pub estimated_bytes_to_receive_per_session: u64,
    ///
    /// Hard cap on buffered red bytes per reception session; sessions
    /// exceeding it are cancelled.
    ///
    #[serde(default = "EngineSection::max_red_rx_bytes_per_session")]
    pub max_red_rx_bytes_per_session: u64,
    ///
    /// Mark every Nth red data segment as a discretionary checkpoint to
    /// accelerate loss detection; 0 disables them.
    ///
    #[serde(default)]
    pub checkpoint_every_nth_data_packet: u64,
    ///
    /// Retransmissions allowed per serial number before a session is
    /// cancelled.
    ///
    #[serde(default = "EngineSection::max_retries_per_serial_number")]
    pub max_retries_per_serial_number: u32,
    ///
    /// Use 32-bit random session and serial numbers, for peers that
    /// cannot handle 64-bit ones.
    ///
    #[serde(default)]
    pub force_32_bit_random_numbers: bool,
    ///
    /// Outbound rate cap in bits per second; 0 disables rate limiting.
    ///
    #[serde(default)]
    pub max_send_rate_bits_per_sec: u64,
    ///
    /// Upper bound on simultaneously active reception sessions.
    ///
    #[serde(default = "EngineSection::max_simultaneous_sessions")]
    pub max_simultaneous_sessions: u64,
    ///
    /// Closed session numbers remembered per remote engine, to refuse
    /// late retransmissions resurrecting a finished session; 0 disables
    /// the history.
    ///
    #[serde(default = "EngineSection::session_recreation_preventer_history_size")]
    pub session_recreation_preventer_history_size: u64,
}

impl EngineSection {
    fn engine_id() -> u64 {
        1
    }

    fn engine_index() -> u8 {
        1
    }

    fn mtu_client_service_data() -> u64 {
        1360
    }

    fn max_reception_claims() -> u64 {
        600
    }

    fn one_way_light_time_ms() -> u64 {
        1000
    }

    fn one_way_margin_time_ms() -> u64 {
        200
    }

    fn estimated_bytes_to_receive_per_session() -> u64 {
        4096
    }

    fn max_red_rx_bytes_per_session() -> u64 {
        100 * 1024 * 1024
    }

    fn max_retries_per_serial_number() -> u32 {
        5
    }

    fn max_simultaneous_sessions() -> u64 {
        5000
    }

    fn session_recreation_preventer_history_size() -> u64 {
        1000
    }

    pub fn as_options(&self) -> EngineOptions {
        EngineOptions {
            this_engine_id: self.engine_id,
            engine_index: self.engine_index,
            mtu_client_service_data: self.mtu_client_service_data,
            max_reception_claims: self.max_reception_claims,
            one_way_light_time: Duration::from_millis(self.one_way_light_time_ms),
            one_way_margin_time: Duration::from_millis(self.one_way_margin_time_ms),
            estimated_bytes_to_receive_per_session: self.estimated_bytes_to_receive_per_session,
            max_red_rx_bytes_per_session: self.max_red_rx_bytes_per_session,
            checkpoint_every_nth_data_packet: self.checkpoint_every_nth_data_packet,
            max_retries_per_serial_number: self.max_retries_per_serial_number,
            force_32_bit_random_numbers: self.force_32_bit_random_numbers,
            max_send_rate_bits_per_sec: self.max_send_rate_bits_per_sec,
            max_simultaneous_sessions: self.max_simultaneous_sessions,
            session_recreation_preventer_history_size: self
                .session_recreation_preventer_history_size,
        }
    }
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            engine_id: Self::engine_id(),
            engine_index: Self::engine_index(),
            mtu_client_service_data: Self::mtu_client_service_data(),
            max_reception_claims: Self::max_reception_claims(),
            one_way_light_time_ms: Self::one_way_light_time_ms(),
            one_way_margin_time_ms: Self::one_way_margin_time_ms(),
            estimated_bytes_to_receive_per_session:
                Self::estimated_bytes_to_receive_per_session(),
            max_red_rx_bytes_per_session: Self::max_red_rx_bytes_per_session(),
            checkpoint_every_nth_data_packet: 0,
            max_retries_per_serial_number: Self::max_retries_per_serial_number(),
            force_32_bit_random_numbers: false,
            max_send_rate_bits_per_sec: 0,
            max_simultaneous_sessions: Self::max_simultaneous_sessions(),
            session_recreation_preventer_history_size:
                Self::session_recreation_preventer_history_size(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(match value {
            "trace" => Self::Trace,
            "debug" => Self::Debug,
            "info" => Self::Info,
            "warn" => Self::Warn,
            "error" => Self::Error,
            _ => return Err(format!("unknown log level: {value}")),
        })
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl LogLevel {
    pub fn as_level(&self) -> log::Level {
        match *self {
            Self::Error => log::Level::Error,
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
        }
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Log {
    ///
    /// log level
    ///
    /// An enum representing the available verbosity levels of the logger.
    ///
    #[serde(default)]
    pub level: LogLevel,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub network: Network,
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub log: Log,
}

#[derive(Parser, Debug)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
    author = env!("CARGO_PKG_AUTHORS"),
)]
struct Cli {
    ///
    /// Specify the configuration file path
    ///
    /// Example: ltp-server --config /etc/ltp-rs/config.json
    ///
    #[arg(long, short)]
    config: Option<String>,
}

impl Config {
    ///
    /// Load configure from config file and command line parameters.
    ///
    /// Load command line parameters, if the configuration file path is
    /// specified, the configuration is read from the configuration file,
    /// otherwise the default configuration is used.
    ///
    pub fn load() -> Result<Self> {
        Ok(match Cli::parse().config {
            Some(path) => serde_json5::from_str(&read_to_string(path)?)?,
            None => Self::default(),
        })
    }
}
