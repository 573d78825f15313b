//! Command-line arguments.

use crate::config::ReqConfig;
use crate::time::{parse_duration, parse_timestamp};
use clap::Parser;
use nostr_client::{AuthPolicy, DeliveryMode, FilterError, FilterOverrides};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug, Clone, Default)]
#[command(
    name = "nostr-req",
    about = "Query Nostr relays. Filters come from flags, optionally merged into JSON filters read from stdin, one per line. Without relays the filter is printed.",
    version
)]
pub struct Args {
    /// Relay addresses (wss:// is assumed when no scheme is given)
    pub relays: Vec<String>,

    /// Only accept events from these authors (hex pubkey)
    #[arg(short = 'a', long = "author", value_name = "PUBKEY")]
    pub authors: Vec<String>,

    /// Only accept events with these ids
    #[arg(short = 'i', long = "id", value_name = "ID")]
    pub ids: Vec<String>,

    /// Only accept events with these kinds
    #[arg(short = 'k', long = "kind", value_name = "KIND")]
    pub kinds: Vec<u16>,

    /// Tag filter as key=value, key is a single character
    #[arg(short = 't', long = "tag", value_name = "KEY=VALUE")]
    pub tags: Vec<String>,

    /// Shortcut for --tag e=<value>
    #[arg(short = 'e', value_name = "ID")]
    pub e: Vec<String>,

    /// Shortcut for --tag p=<value>
    #[arg(short = 'p', value_name = "PUBKEY")]
    pub p: Vec<String>,

    /// Shortcut for --tag d=<value>
    #[arg(short = 'd', value_name = "IDENTIFIER")]
    pub d: Vec<String>,

    /// Only events newer than this (unix seconds, date, or e.g. "2 days ago")
    #[arg(short = 's', long, value_parser = parse_timestamp)]
    pub since: Option<u64>,

    /// Only events older than this (unix seconds, date, or e.g. "1h")
    #[arg(short = 'u', long, value_parser = parse_timestamp)]
    pub until: Option<u64>,

    /// Maximum number of events relays should return (0 asks for none)
    #[arg(short = 'l', long)]
    pub limit: Option<u64>,

    /// NIP-50 search query
    #[arg(long)]
    pub search: Option<String>,

    /// Keep the subscription open for live events after EOSE
    #[arg(long, conflicts_with = "paginate")]
    pub stream: bool,

    /// Page backwards through stored events with decreasing `until`
    #[arg(long)]
    pub paginate: bool,

    /// Pause between pagination rounds (e.g. 2s, 500ms)
    #[arg(long, value_parser = parse_duration, requires = "paginate")]
    pub paginate_interval: Option<Duration>,

    /// Stop paginating after this many events in total
    #[arg(long, requires = "paginate")]
    pub paginate_global_limit: Option<u64>,

    /// Print the filter alone instead of a REQ envelope
    #[arg(long)]
    pub bare: bool,

    /// Authenticate (NIP-42) when a relay requires it
    #[arg(long)]
    pub auth: bool,

    /// Authenticate before sending any request, when the relay offers a challenge
    #[arg(long = "force-pre-auth", visible_alias = "fpa")]
    pub force_pre_auth: bool,

    /// Secret key for authentication, hex or nsec
    #[arg(long, env = "NOSTR_SECRET_KEY", hide_env_values = true)]
    pub sec: Option<String>,

    /// Read the secret key from the terminal
    #[arg(long, conflicts_with = "connect")]
    pub prompt_sec: bool,

    /// Sign through a NIP-46 remote signer (bunker://...)
    #[arg(long, value_name = "BUNKER_URL")]
    pub connect: Option<String>,

    /// Client secret key used towards the remote signer (random by default)
    #[arg(long, requires = "connect")]
    pub connect_as: Option<String>,

    /// Config file (default: <config dir>/nostr-req/config.toml)
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Only log warnings and errors
    #[arg(short = 'q', long, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Log debug output
    #[arg(short = 'v', long)]
    pub verbose: bool,
}

impl Args {
    /// Filter attributes from the flags. A malformed `--tag` is reported here, before
    /// any input is read.
    pub fn filter_overrides(&self) -> Result<FilterOverrides, FilterError> {
        let mut overrides = FilterOverrides {
            ids: self.ids.clone(),
            authors: self.authors.clone(),
            kinds: self.kinds.clone(),
            tags: Vec::new(),
            since: self.since,
            until: self.until,
            limit: self.limit,
            search: self.search.clone(),
        };
        overrides.add_tags(&self.tags, &self.e, &self.p, &self.d)?;
        Ok(overrides)
    }

    pub fn auth_policy(&self) -> AuthPolicy {
        AuthPolicy::from_flags(self.auth, self.force_pre_auth)
    }

    pub fn delivery_mode(&self, config: &ReqConfig) -> DeliveryMode {
        if self.paginate {
            DeliveryMode::Paginate(config.pagination_config(
                self.paginate_interval.unwrap_or(Duration::ZERO),
                self.paginate_global_limit,
            ))
        } else if self.stream {
            DeliveryMode::Stream
        } else {
            DeliveryMode::Eose
        }
    }

    /// Default `tracing` directive; `RUST_LOG` overrides it.
    pub fn log_directive(&self) -> &'static str {
        if self.quiet {
            "warn"
        } else if self.verbose {
            "debug"
        } else {
            "info"
        }
    }
}
