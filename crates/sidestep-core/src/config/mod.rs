//! Configuration
//!
//! A versioned JSON document: system-wide queue settings plus an
//! ordered array of *sets*, the unit of policy. Each set couples a
//! target predicate with fragmentation, faking, TCP and DNS
//! sub-configurations. Older documents pass through the migration
//! chain in [`migration`] and the current version is written back.

mod migration;

pub use migration::CURRENT_CONFIG_VERSION;

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level configuration document
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Document schema version
    pub version: u32,
    /// Kernel queue binding
    pub queue: QueueConfig,
    /// Process-wide settings
    pub system: SystemConfig,
    /// Policy sets, tried in order; first enabled match wins
    pub sets: Vec<SetConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: CURRENT_CONFIG_VERSION,
            queue: QueueConfig::default(),
            system: SystemConfig::default(),
            sets: vec![SetConfig::default()],
        }
    }
}

impl Config {
    /// Load a configuration file, migrating older versions in place.
    /// Returns the config and whether a migration ran (callers persist
    /// the upgraded document).
    pub fn load<P: AsRef<Path>>(path: P) -> Result<(Self, bool)> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|_| Error::ConfigNotFound {
            path: path.display().to_string(),
        })?;
        let mut doc: serde_json::Value = serde_json::from_str(&content)?;
        let migrated = migration::upgrade(&mut doc)?;

        let mut config: Config = serde_json::from_value(doc)?;
        config.version = CURRENT_CONFIG_VERSION;
        config.validate()?;
        Ok((config, migrated))
    }

    /// Serialize to pretty JSON
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Persist to a file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    /// The set discovery installs its winner into
    pub fn main_set(&self) -> Option<&SetConfig> {
        self.sets.first()
    }

    /// Mutable access to the main set
    pub fn main_set_mut(&mut self) -> Option<&mut SetConfig> {
        self.sets.first_mut()
    }

    /// Reject configurations the engine cannot run with. Called before
    /// any in-memory replacement, so a running pool never observes an
    /// invalid document.
    pub fn validate(&self) -> Result<()> {
        if self.queue.queue_num == 0 {
            return Err(Error::config_value("queue.queue_num", "must be non-zero"));
        }
        if self.queue.threads == 0 {
            return Err(Error::config_value("queue.threads", "must be at least 1"));
        }
        if self.system.conn_bytes_limit < 64 {
            return Err(Error::config_value(
                "system.conn_bytes_limit",
                "too small to hold a ClientHello prefix",
            ));
        }
        for set in &self.sets {
            set.validate()?;
        }
        Ok(())
    }
}

/// Kernel queue binding parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// NFQUEUE number
    pub queue_num: u16,
    /// Mark written on every injected packet; the firewall excludes
    /// marked packets from the queue
    pub mark: u32,
    /// Worker threads (one queue binding each)
    pub threads: usize,
    /// Process IPv4 traffic
    pub ipv4: bool,
    /// Process IPv6 traffic
    pub ipv6: bool,
    /// Request GSO-aware queueing
    pub use_gso: bool,
    /// Request conntrack metadata
    pub use_conntrack: bool,
    /// Interface allow-list; empty means all interfaces
    pub interfaces: Vec<String>,
    /// Destination ports redirected to the queue, as a comma list of
    /// ports and ranges
    pub ports: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            queue_num: 537,
            mark: 1 << 15,
            threads: 4,
            ipv4: true,
            ipv6: false,
            use_gso: false,
            use_conntrack: false,
            interfaces: Vec::new(),
            ports: "443".to_string(),
        }
    }
}

/// Process-wide settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    /// Per-flow reassembly buffer bound in bytes
    pub conn_bytes_limit: usize,
    /// Logging directives
    pub logging: LoggingConfig,
    /// Discovery and check-request parameters
    pub checker: CheckerConfig,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            conn_bytes_limit: 8192,
            logging: LoggingConfig::default(),
            checker: CheckerConfig::default(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level filter (`error`..`trace`)
    pub level: String,
    /// Emit JSON-formatted records
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Discovery and check-request parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckerConfig {
    /// Known-good reference URL for the baseline probe
    pub reference_url: String,
    /// Reference domain for DPI comparison probes
    pub reference_domain: String,
    /// Plain resolvers tried when the system resolver is poisoned
    pub reference_dns: Vec<String>,
    /// Per-request timeout in seconds
    pub timeout_secs: u64,
    /// Wait after a configuration push before the next probe, so the
    /// new configuration is in effect
    pub config_propagate_ms: u64,
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            reference_url: "https://www.gstatic.com/generate_204".to_string(),
            reference_domain: "www.wikipedia.org".to_string(),
            reference_dns: vec!["1.1.1.1".to_string(), "8.8.8.8".to_string(), "9.9.9.9".to_string()],
            timeout_secs: 15,
            config_propagate_ms: 300,
        }
    }
}

/// One policy set
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SetConfig {
    /// Stable identifier
    pub id: String,
    /// Human name
    pub name: String,
    /// Disabled sets are skipped by the matcher
    pub enabled: bool,
    /// Target predicate
    pub targets: TargetConfig,
    /// Real-packet rewriting
    pub fragmentation: FragmentConfig,
    /// Fake-SNI pre-emission
    pub faking: FakingConfig,
    /// Desync, SYN-fake and incoming injection
    pub tcp: TcpConfig,
    /// DNS bypass
    pub dns: DnsConfig,
}

impl Default for SetConfig {
    fn default() -> Self {
        Self {
            id: "main".to_string(),
            name: "Main".to_string(),
            enabled: true,
            targets: TargetConfig::default(),
            fragmentation: FragmentConfig::default(),
            faking: FakingConfig::default(),
            tcp: TcpConfig::default(),
            dns: DnsConfig::default(),
        }
    }
}

impl SetConfig {
    fn validate(&self) -> Result<()> {
        if self.faking.enabled && self.faking.ttl == 0 {
            return Err(Error::config_value("faking.ttl", "must be 1-255"));
        }
        if self.faking.payload == FakePayloadKind::Custom {
            hex::decode(&self.faking.custom_payload)
                .map_err(|e| Error::config_value("faking.custom_payload", e.to_string()))?;
        }
        if self.faking.mutation.mode != MutationMode::Off
            && !(16..=4096).contains(&self.faking.mutation.padding_size)
        {
            return Err(Error::config_value(
                "faking.mutation.padding_size",
                "must be within 16-4096",
            ));
        }
        Ok(())
    }
}

/// Target predicate of a set
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TargetConfig {
    /// Explicit SNI domains, exact or `*.` suffix entries
    pub sni_domains: Vec<String>,
    /// Geosite categories resolved by the external file reader
    pub geosite_categories: Vec<String>,
}

/// Real-packet rewriting strategy tags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyTag {
    /// Split once at the transport layer
    Tcp,
    /// IPv4 fragmentation at the network layer
    Ip,
    /// Multi-point split with shuffle, overlap and timed sends
    Combo,
    /// SNI-boundary splits sent out of order
    Disorder,
    /// Garbage-SNI segment overlapped by the real one
    Overlap,
    /// Split at the extension preceding the SNI
    ExtSplit,
    /// Poisoning byte written into the payload before splitting
    Oob,
}

/// Segment reordering mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ShuffleMode {
    /// Reverse the build order
    Reverse,
    /// Fisher-Yates shuffle
    #[default]
    Full,
}

/// Fragmentation sub-configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FragmentConfig {
    /// Active strategy
    pub strategy: StrategyTag,
    /// Split position as a byte offset into the payload
    pub split_pos: usize,
    /// Split relative to the SNI instead of `split_pos`
    pub middle_sni: bool,
    /// Transmit the higher-sequence segment first
    pub reverse_order: bool,
    /// Poisoning character for `oob`
    pub oob_char: u8,
    /// Payload offset the poisoning byte is written at
    pub oob_position: usize,
    /// Sequence-overlap pattern prepended before the intended payload
    pub seq_overlap_pattern: String,
    /// `disorder` tunables
    pub disorder: DisorderConfig,
    /// `combo` tunables
    pub combo: ComboConfig,
}

impl Default for FragmentConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyTag::Tcp,
            split_pos: 1,
            middle_sni: true,
            reverse_order: true,
            oob_char: b'x',
            oob_position: 1,
            seq_overlap_pattern: String::new(),
            disorder: DisorderConfig::default(),
            combo: ComboConfig::default(),
        }
    }
}

/// `disorder` strategy tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisorderConfig {
    /// Segment ordering
    pub shuffle_mode: ShuffleMode,
    /// Lower jitter bound between sends, microseconds
    pub min_jitter_us: u64,
    /// Upper jitter bound between sends, microseconds
    pub max_jitter_us: u64,
    /// Which built segment receives the sequence overlap; empirically
    /// index 1 under reverse/full shuffling, 0 otherwise
    pub seqovl_segment: Option<usize>,
}

impl Default for DisorderConfig {
    fn default() -> Self {
        Self {
            shuffle_mode: ShuffleMode::Full,
            min_jitter_us: 1000,
            max_jitter_us: 3000,
            seqovl_segment: None,
        }
    }
}

/// `combo` strategy tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ComboConfig {
    /// Segment ordering
    pub shuffle_mode: ShuffleMode,
    /// Delay after the first send, milliseconds
    pub first_delay_ms: u64,
    /// Upper bound of the uniform inter-send jitter, microseconds
    pub jitter_max_us: u64,
}

impl Default for ComboConfig {
    fn default() -> Self {
        Self {
            shuffle_mode: ShuffleMode::Full,
            first_delay_ms: 100,
            jitter_max_us: 2000,
        }
    }
}

/// What the fake packets carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FakePayloadKind {
    /// A canned plausible ClientHello
    #[default]
    Default,
    /// Random bytes
    Random,
    /// A user-provided hex blob
    Custom,
}

/// How fake packets are kept away from the real server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FakingStrategy {
    /// Expire before the server via a short TTL
    Ttl,
    /// Sequence moved into already-acknowledged space
    #[default]
    PastSeq,
    /// Sequence moved into future unacknowledged space
    RandSeq,
    /// One checksum byte flipped after finalization
    TcpCheck,
    /// TCP MD5 option appended
    Md5Sum,
}

/// Fake-SNI pre-emission sub-configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FakingConfig {
    /// Emit fakes before the real packets
    pub enabled: bool,
    /// TTL for the `ttl` strategy
    pub ttl: u8,
    /// Payload kind
    pub payload: FakePayloadKind,
    /// Hex blob for [`FakePayloadKind::Custom`]
    pub custom_payload: String,
    /// How many fakes to emit per matched packet
    pub seq_len: u8,
    /// Active faking strategy
    pub strategy: FakingStrategy,
    /// Sequence displacement for `pastseq`/`randseq`
    pub seq_offset: u32,
    /// ClientHello mutation
    pub mutation: MutationConfig,
}

impl Default for FakingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: 8,
            payload: FakePayloadKind::Default,
            custom_payload: String::new(),
            seq_len: 1,
            strategy: FakingStrategy::PastSeq,
            seq_offset: 10_000,
            mutation: MutationConfig::default(),
        }
    }
}

/// ClientHello mutation modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MutationMode {
    /// Leave the hello untouched
    #[default]
    Off,
    /// Duplicate the SNI extension with decoy hosts
    Duplicate,
    /// Insert GREASE extensions
    Grease,
    /// Append a padding extension
    Padding,
    /// Permute extensions, SNI kept first
    Reorder,
    /// All of the above plus a fake ALPN
    Full,
}

/// ClientHello mutation sub-configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MutationConfig {
    /// Active mode
    pub mode: MutationMode,
    /// Decoy hosts for duplicated SNI extensions
    pub decoy_snis: Vec<String>,
    /// How many GREASE extensions to insert
    pub grease_count: usize,
    /// Padding extension body size
    pub padding_size: usize,
}

impl Default for MutationConfig {
    fn default() -> Self {
        Self {
            mode: MutationMode::Off,
            decoy_snis: vec!["www.wikipedia.org".to_string()],
            grease_count: 2,
            padding_size: 256,
        }
    }
}

/// TCP desync mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DesyncMode {
    /// No desync packets
    #[default]
    Off,
    /// Low-TTL RST copies before the real emission
    Rst,
    /// RST copies followed by a low-TTL FIN-ACK
    Combo,
}

/// Incoming-injection mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IncomingMode {
    /// No inbound forgeries
    #[default]
    Off,
    /// Low-TTL bad-checksum copies of the matched packet
    Fake,
    /// Forged server RSTs
    Rst,
}

/// TCP sub-configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpConfig {
    /// Desync mode
    pub desync: DesyncMode,
    /// TTL of desync packets
    pub desync_ttl: u8,
    /// How many desync packets to emit
    pub desync_count: usize,
    /// Fake payload bytes carried by a copied SYN; 0 keeps the pure
    /// SYN copy
    pub syn_fake_len: usize,
    /// Whether the SYN fake is emitted at all
    pub syn_fake: bool,
    /// Delay between split-segment sends, milliseconds
    pub seg2_delay_ms: u64,
    /// Strip SACK options from the matched segment before splitting
    pub strip_sack: bool,
    /// Inbound forgery parameters
    pub incoming: IncomingConfig,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            desync: DesyncMode::Off,
            desync_ttl: 3,
            desync_count: 2,
            syn_fake_len: 0,
            syn_fake: false,
            seg2_delay_ms: 0,
            strip_sack: false,
            incoming: IncomingConfig::default(),
        }
    }
}

/// Inbound forgery parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IncomingConfig {
    /// Active mode
    pub mode: IncomingMode,
    /// Copies to emit
    pub count: usize,
    /// TTL of the forged packets
    pub ttl: u8,
}

impl Default for IncomingConfig {
    fn default() -> Self {
        Self {
            mode: IncomingMode::Off,
            count: 3,
            ttl: 3,
        }
    }
}

/// DNS bypass sub-configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DnsConfig {
    /// Route queries to the target resolver
    pub enabled: bool,
    /// Resolver address
    pub target_dns: String,
    /// Fragment outgoing queries
    pub fragment_query: bool,
}

/// Validate a comma list of ports and ranges (`443`, `80,443`,
/// `8000-9000`) and return the normalized form; invalid entries are
/// dropped.
pub fn validate_ports(spec: &str) -> String {
    let mut valid = Vec::new();
    for entry in spec.split(',') {
        let entry = entry.trim().replace(':', "-");
        if entry.is_empty() {
            continue;
        }
        if let Some((lo, hi)) = entry.split_once('-') {
            match (lo.trim().parse::<u16>(), hi.trim().parse::<u16>()) {
                (Ok(lo), Ok(hi)) if lo > 0 && lo < hi => valid.push(format!("{lo}-{hi}")),
                _ => tracing::warn!(entry, "invalid port range"),
            }
        } else {
            match entry.parse::<u16>() {
                Ok(port) if port > 0 => valid.push(port.to_string()),
                _ => tracing::warn!(entry, "invalid port"),
            }
        }
    }
    valid.join(",")
}
