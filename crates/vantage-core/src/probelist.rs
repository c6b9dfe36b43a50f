//! # Probelist
//!
//! A probelist is one immutable generation of /24 blocks to probe, each with
//! a shuffled candidate host list, an average expected response rate and a
//! set of metric tags, plus the mutable per-/24 probing state that lives and
//! dies with the generation.
//!
//! ## File format
//!
//! A JSON object keyed by `"a.b.c.d/24"`. Each value carries `version`
//! (identical across keys), `host_cnt`, `avg_resp_rate`, `meta` (tag strings
//! prefixed `L:` for leaf or `N:` for non-leaf) and `hosts` (objects with at
//! least `host_ip`; other fields are ignored). Files may be gzip, bzip2 or
//! zstd compressed, decided by suffix.
//!
//! Probelists routinely cover millions of /24s, so the loader never
//! materializes the whole document: top-level entries are carved out one at
//! a time with a string-aware brace matcher and parsed independently.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::net::Ipv4Addr;
use std::path::Path;

use rand::Rng;
use serde::Deserialize;
use thiserror::Error;
use tracing::info;

use crate::belief::{self, BeliefState};
use crate::probe::{ProbeType, SLASH24_HOSTMASK, SLASH24_NETMASK};

#[derive(Debug, Error)]
pub enum ProbelistError {
    #[error("could not open probelist {path}: {source}")]
    Open {
        path: String,
        source: std::io::Error,
    },
    #[error("i/o error reading probelist: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed /24 key '{0}'")]
    BadKey(String),
    #[error("invalid record for {net}: {source}")]
    BadRecord {
        net: String,
        source: serde_json::Error,
    },
    #[error("record for {net}: host_cnt {expected} does not match {actual} hosts")]
    HostCountMismatch {
        net: String,
        expected: u64,
        actual: usize,
    },
    #[error("record for {net} has no hosts")]
    NoHosts { net: String },
    #[error("record for {net}: host '{host}' is invalid or outside the /24")]
    BadHost { net: String, host: String },
    #[error("record for {net}: malformed meta tag '{tag}'")]
    BadMeta { net: String, tag: String },
    #[error("probelist is not a JSON object")]
    NotAnObject,
}

/// A metric tag attached to a /24 (geographic or ASN grouping).
///
/// Leaf tags additionally get per-block time-series keys; non-leaf tags only
/// feed the per-tag aggregate counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricTag {
    pub name: String,
    pub leaf: bool,
}

impl MetricTag {
    fn parse(raw: &str) -> Option<MetricTag> {
        let (prefix, name) = raw.split_once(':')?;
        let leaf = match prefix {
            "L" => true,
            "N" => false,
            _ => return None,
        };
        if name.is_empty() {
            return None;
        }
        Some(MetricTag {
            name: name.to_string(),
            leaf,
        })
    }
}

/// One /24 block: immutable for the lifetime of its probelist generation.
#[derive(Debug, Clone)]
pub struct Slash24 {
    /// Network address of the /24 (host byte order, low octet zero).
    pub network_ip: u32,
    /// Candidate host octets, shuffled at load time.
    pub hosts: Vec<u8>,
    /// Average expected response rate across the block's hosts, A(E(b)).
    pub aeb: f64,
    /// Metric tags this block contributes to.
    pub tags: Vec<MetricTag>,
}

/// Time-series key handles for one metric tag of one /24.
#[derive(Debug, Clone, Copy)]
pub struct Slash24Metrics {
    /// Per-block belief key (leaf tags only).
    pub belief: Option<usize>,
    /// Per-block state key (leaf tags only).
    pub state: Option<usize>,
    /// Per-tag aggregate state-count keys, indexed by belief state.
    pub overall: [usize; BeliefState::COUNT],
}

/// Mutable probing state of one /24.
#[derive(Debug, Clone)]
pub struct Slash24State {
    pub current_belief: f64,
    pub current_state: BeliefState,
    /// Index of the next host to probe within the shuffled host list.
    pub current_host: usize,
    pub last_probe_type: ProbeType,
    pub adaptive_budget: u8,
    pub recovery_budget: u8,
    /// Rounds since the block last classified UP, saturating.
    pub rounds_since_up: u8,
    /// One entry per metric tag of the block.
    pub metrics: Vec<Slash24Metrics>,
}

impl Slash24State {
    pub fn new(aeb: f64, metrics: Vec<Slash24Metrics>) -> Self {
        let current_belief = belief::INITIAL_BELIEF;
        Slash24State {
            current_belief,
            current_state: belief::classify(current_belief),
            current_host: 0,
            last_probe_type: ProbeType::Unprobed,
            adaptive_budget: belief::ADAPTIVE_PROBE_BUDGET,
            recovery_budget: belief::recovery_probe_budget(aeb),
            rounds_since_up: 0,
            metrics,
        }
    }
}

// ─── Probelist ──────────────────────────────────────────────────────────────

/// One generation of the probelist with its per-/24 state.
pub struct Probelist {
    version: String,
    /// Shuffled probing order.
    slash24s: Vec<u32>,
    s24s: HashMap<u32, Slash24>,
    states: HashMap<u32, Slash24State>,
    cursor: usize,
}

impl Probelist {
    /// Load a probelist file, decompressing by suffix.
    pub fn from_path(path: &Path) -> Result<Self, ProbelistError> {
        info!(path = %path.display(), "loading probelist");
        let reader = open_reader(path)?;
        Self::from_reader(reader)
    }

    /// Parse a probelist from an uncompressed reader.
    pub fn from_reader(reader: impl Read) -> Result<Self, ProbelistError> {
        let mut pl = Probelist {
            version: String::new(),
            slash24s: Vec::new(),
            s24s: HashMap::new(),
            states: HashMap::new(),
            cursor: 0,
        };
        let mut rng = rand::rng();
        stream_entries(reader, |key, json| pl.add_record(key, json, &mut rng))?;
        fisher_yates(&mut pl.slash24s, &mut rng);
        Ok(pl)
    }

    fn add_record(
        &mut self,
        key: &str,
        json: &str,
        rng: &mut impl Rng,
    ) -> Result<(), ProbelistError> {
        let network_ip = parse_slash24_key(key)?;
        let record: Slash24Record =
            serde_json::from_str(json).map_err(|source| ProbelistError::BadRecord {
                net: key.to_string(),
                source,
            })?;

        if record.hosts.is_empty() {
            return Err(ProbelistError::NoHosts {
                net: key.to_string(),
            });
        }
        if record.hosts.len() as u64 != record.host_cnt {
            return Err(ProbelistError::HostCountMismatch {
                net: key.to_string(),
                expected: record.host_cnt,
                actual: record.hosts.len(),
            });
        }

        let mut tags = Vec::with_capacity(record.meta.len());
        for raw in &record.meta {
            let tag = MetricTag::parse(raw).ok_or_else(|| ProbelistError::BadMeta {
                net: key.to_string(),
                tag: raw.clone(),
            })?;
            tags.push(tag);
        }

        let mut hosts = Vec::with_capacity(record.hosts.len());
        for host in &record.hosts {
            let ip: Ipv4Addr = host.host_ip.parse().map_err(|_| ProbelistError::BadHost {
                net: key.to_string(),
                host: host.host_ip.clone(),
            })?;
            let ip = u32::from(ip);
            if ip & SLASH24_NETMASK != network_ip {
                return Err(ProbelistError::BadHost {
                    net: key.to_string(),
                    host: host.host_ip.clone(),
                });
            }
            hosts.push((ip & SLASH24_HOSTMASK) as u8);
        }
        fisher_yates(&mut hosts, rng);

        if self.version.is_empty() {
            // all records carry the same generation version
            self.version = record.version;
        }

        if self
            .s24s
            .insert(
                network_ip,
                Slash24 {
                    network_ip,
                    hosts,
                    aeb: record.avg_resp_rate,
                    tags,
                },
            )
            .is_none()
        {
            self.slash24s.push(network_ip);
        }
        Ok(())
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn len(&self) -> usize {
        self.slash24s.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slash24s.is_empty()
    }

    /// Restart iteration at the head of the (shuffled) /24 order.
    pub fn reset_iter(&mut self) {
        self.cursor = 0;
    }

    pub fn has_more(&self) -> bool {
        self.cursor < self.slash24s.len()
    }

    /// Advance the iterator and return the next /24's network address.
    pub fn next_slash24(&mut self) -> Option<u32> {
        let net = *self.slash24s.get(self.cursor)?;
        self.cursor += 1;
        Some(net)
    }

    /// All /24 network addresses in probing order.
    pub fn nets(&self) -> impl Iterator<Item = u32> + '_ {
        self.slash24s.iter().copied()
    }

    pub fn slash24(&self, network_ip: u32) -> Option<&Slash24> {
        self.s24s.get(&network_ip)
    }

    pub fn state(&self, network_ip: u32) -> Option<&Slash24State> {
        self.states.get(&network_ip)
    }

    pub fn state_mut(&mut self, network_ip: u32) -> Option<&mut Slash24State> {
        self.states.get_mut(&network_ip)
    }

    pub fn set_state(&mut self, network_ip: u32, state: Slash24State) {
        self.states.insert(network_ip, state);
    }

    /// Full address of the block's current candidate host, advancing the
    /// per-block host cursor.
    pub fn next_host(&mut self, network_ip: u32) -> Option<u32> {
        let s24 = self.s24s.get(&network_ip)?;
        let state = self.states.get_mut(&network_ip)?;
        let octet = *s24.hosts.get(state.current_host % s24.hosts.len())?;
        state.current_host = (state.current_host + 1) % s24.hosts.len();
        Some(s24.network_ip | octet as u32)
    }
}

// ─── Loading ────────────────────────────────────────────────────────────────

fn open_reader(path: &Path) -> Result<Box<dyn Read>, ProbelistError> {
    let file = File::open(path).map_err(|source| ProbelistError::Open {
        path: path.display().to_string(),
        source,
    })?;
    let buffered = BufReader::new(file);
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default();
    Ok(match ext {
        "gz" => Box::new(flate2::read::GzDecoder::new(buffered)),
        "bz2" => Box::new(bzip2::read::BzDecoder::new(buffered)),
        "zst" | "zstd" => Box::new(zstd::stream::read::Decoder::new(buffered)?),
        _ => Box::new(buffered),
    })
}

fn parse_slash24_key(key: &str) -> Result<u32, ProbelistError> {
    let bad = || ProbelistError::BadKey(key.to_string());
    let (addr, prefix_len) = key.split_once('/').ok_or_else(bad)?;
    if prefix_len != "24" {
        return Err(bad());
    }
    let ip: Ipv4Addr = addr.parse().map_err(|_| bad())?;
    Ok(u32::from(ip) & SLASH24_NETMASK)
}

#[derive(Deserialize)]
struct Slash24Record {
    version: String,
    host_cnt: u64,
    avg_resp_rate: f64,
    meta: Vec<String>,
    hosts: Vec<HostRecord>,
}

#[derive(Deserialize)]
struct HostRecord {
    host_ip: String,
}

/// Stream the top-level `"key": {…}` entries of a JSON object to `handle`,
/// without buffering more than one entry at a time.
///
/// The scanner tracks string/escape state, so braces inside strings cannot
/// desynchronize it.
fn stream_entries<R: Read>(
    mut reader: R,
    mut handle: impl FnMut(&str, &str) -> Result<(), ProbelistError>,
) -> Result<(), ProbelistError> {
    #[derive(PartialEq)]
    enum Scan {
        BeforeObject,
        BetweenEntries,
        InKey,
        AfterKey,
        InValue,
    }

    let mut state = Scan::BeforeObject;
    let mut key = String::new();
    let mut value = String::new();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    let mut buf = [0u8; 8192];

    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        for &b in &buf[..n] {
            let c = b as char;
            match state {
                Scan::BeforeObject => {
                    if c == '{' {
                        state = Scan::BetweenEntries;
                    } else if !c.is_ascii_whitespace() {
                        return Err(ProbelistError::NotAnObject);
                    }
                }
                Scan::BetweenEntries => {
                    if c == '"' {
                        key.clear();
                        state = Scan::InKey;
                    }
                    // commas, whitespace and the final '}' need no action
                }
                Scan::InKey => {
                    if escaped {
                        escaped = false;
                        key.push(c);
                    } else if c == '\\' {
                        escaped = true;
                    } else if c == '"' {
                        state = Scan::AfterKey;
                    } else {
                        key.push(c);
                    }
                }
                Scan::AfterKey => {
                    if c == '{' {
                        value.clear();
                        value.push('{');
                        depth = 1;
                        in_string = false;
                        escaped = false;
                        state = Scan::InValue;
                    }
                    // skip the ':' and whitespace
                }
                Scan::InValue => {
                    value.push(c);
                    if escaped {
                        escaped = false;
                    } else if in_string {
                        match c {
                            '\\' => escaped = true,
                            '"' => in_string = false,
                            _ => {}
                        }
                    } else {
                        match c {
                            '"' => in_string = true,
                            '{' => depth += 1,
                            '}' => {
                                depth -= 1;
                                if depth == 0 {
                                    handle(&key, &value)?;
                                    state = Scan::BetweenEntries;
                                }
                            }
                            _ => {}
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

fn fisher_yates<T>(items: &mut [T], rng: &mut impl Rng) {
    for i in (1..items.len()).rev() {
        let j = rng.random_range(0..=i);
        items.swap(i, j);
    }
}
