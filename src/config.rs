//! Daemon settings and the
//! `clap` CLI overlay that feeds them.
//!
//! The settings file is JSON, like the real daemon's, but round-tripped
//! through this crate's own [`crate::value`] tree rather than `serde`:
//! `serde` is declared nowhere in this crate's dependencies precisely
//! because the value codec already covers the one format (JSON) the
//! settings file needs, and resume records (`storage.rs`) already
//! established the to-`Value`/from-`Value` pattern this module follows.

use crate::quark;
use crate::value::{self, Value, ValueMap};
use clap::Parser;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionMode {
    Required,
    Preferred,
    Tolerated,
}

impl EncryptionMode {
    fn as_str(&self) -> &'static str {
        match self {
            EncryptionMode::Required => "required",
            EncryptionMode::Preferred => "preferred",
            EncryptionMode::Tolerated => "tolerated",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "required" => Some(EncryptionMode::Required),
            "preferred" => Some(EncryptionMode::Preferred),
            "tolerated" => Some(EncryptionMode::Tolerated),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "error" => Some(LogLevel::Error),
            "warn" => Some(LogLevel::Warn),
            "info" => Some(LogLevel::Info),
            "debug" => Some(LogLevel::Debug),
            "trace" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    pub fn to_level_filter(&self) -> log::LevelFilter {
        match self {
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        }
    }
}

/// Everything the daemon needs to start. Loaded from
/// `<config-dir>/settings.json` and overridden field-by-field by
/// whatever CLI flags are present.
#[derive(Debug, Clone)]
pub struct Settings {
    pub config_dir: PathBuf,
    pub download_dir: PathBuf,
    pub incomplete_dir: Option<PathBuf>,
    pub incomplete_dir_enabled: bool,
    pub watch_dir: Option<PathBuf>,
    pub watch_dir_enabled: bool,
    pub watch_dir_force_generic: bool,

    pub rpc_port: u16,
    pub rpc_bind_address: IpAddr,
    pub rpc_authentication_required: bool,
    pub rpc_username: Option<String>,
    pub rpc_password: Option<String>,
    pub rpc_whitelist: Vec<String>,
    pub rpc_whitelist_enabled: bool,

    pub peer_port: u16,
    pub peer_limit_global: u32,
    pub peer_limit_per_torrent: u32,

    pub dht_enabled: bool,
    pub lpd_enabled: bool,
    pub utp_enabled: bool,
    pub port_forwarding_enabled: bool,
    pub encryption: EncryptionMode,

    pub bind_address_ipv4: Ipv4Addr,
    pub bind_address_ipv6: Ipv6Addr,

    pub ratio_limit: f64,
    pub ratio_limit_enabled: bool,
    pub sequential_download: bool,

    pub log_level: LogLevel,
    pub log_file: Option<PathBuf>,
    pub pid_file: Option<PathBuf>,
    pub foreground: bool,
    pub start_paused: bool,

    pub cache_size_mb: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            config_dir: default_config_dir(),
            download_dir: default_config_dir().join("downloads"),
            incomplete_dir: None,
            incomplete_dir_enabled: false,
            watch_dir: None,
            watch_dir_enabled: false,
            watch_dir_force_generic: false,

            rpc_port: 9091,
            rpc_bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            rpc_authentication_required: false,
            rpc_username: None,
            rpc_password: None,
            rpc_whitelist: vec!["127.0.0.1".into()],
            rpc_whitelist_enabled: true,

            peer_port: 51413,
            peer_limit_global: 200,
            peer_limit_per_torrent: 50,

            dht_enabled: true,
            lpd_enabled: true,
            utp_enabled: true,
            port_forwarding_enabled: true,
            encryption: EncryptionMode::Preferred,

            bind_address_ipv4: Ipv4Addr::UNSPECIFIED,
            bind_address_ipv6: Ipv6Addr::UNSPECIFIED,

            ratio_limit: 2.0,
            ratio_limit_enabled: false,
            sequential_download: false,

            log_level: LogLevel::Info,
            log_file: None,
            pid_file: None,
            foreground: false,
            start_paused: false,

            cache_size_mb: 4,
        }
    }
}

fn default_config_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config/rsbtd")
}

impl Settings {
    pub fn settings_path(&self) -> PathBuf {
        self.config_dir.join("settings.json")
    }

    pub fn resume_dir(&self) -> PathBuf {
        self.config_dir.join("resume")
    }

    pub fn blocklist_path(&self) -> PathBuf {
        self.config_dir.join("blocklist")
    }

    pub fn sessionstats_path(&self) -> PathBuf {
        self.config_dir.join("sessionstats")
    }

    /// Loads `<config_dir>/settings.json` if present, else returns defaults
    /// rooted at `config_dir`.
    pub fn load(config_dir: &Path) -> anyhow::Result<Settings> {
        let mut settings = Settings {
            config_dir: config_dir.to_path_buf(),
            ..Settings::default()
        };
        let path = settings.settings_path();
        if let Ok(bytes) = std::fs::read(&path) {
            let text = String::from_utf8(bytes)?;
            let v = value::json_decode(&text)?;
            let map = v
                .as_map()
                .ok_or_else(|| anyhow::anyhow!("settings file `{}` is not a json object", path.display()))?;
            settings.apply_value_map(map);
        }
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.config_dir)?;
        let text = value::json_encode(&Value::Map(self.to_value_map()));
        std::fs::write(self.settings_path(), text)?;
        Ok(())
    }

    pub fn to_value_map(&self) -> ValueMap {
        let mut m = ValueMap::new();
        m.insert_str("download-dir", Value::string(self.download_dir.display().to_string()));
        if let Some(d) = &self.incomplete_dir {
            m.insert_str("incomplete-dir", Value::string(d.display().to_string()));
        }
        m.insert_str("incomplete-dir-enabled", Value::Bool(self.incomplete_dir_enabled));
        if let Some(d) = &self.watch_dir {
            m.insert_str("watch-dir", Value::string(d.display().to_string()));
        }
        m.insert_str("watch-dir-enabled", Value::Bool(self.watch_dir_enabled));
        m.insert_str("watch-dir-force-generic", Value::Bool(self.watch_dir_force_generic));

        m.insert_str("rpc-port", Value::Int(self.rpc_port as i64));
        m.insert_str("rpc-bind-address", Value::string(self.rpc_bind_address.to_string()));
        m.insert_str("rpc-authentication-required", Value::Bool(self.rpc_authentication_required));
        if let Some(u) = &self.rpc_username {
            m.insert_str("rpc-username", Value::string(u.clone()));
        }
        if let Some(p) = &self.rpc_password {
            m.insert_str("rpc-password", Value::string(p.clone()));
        }
        m.insert_str(
            "rpc-whitelist",
            Value::string(self.rpc_whitelist.join(",")),
        );
        m.insert_str("rpc-whitelist-enabled", Value::Bool(self.rpc_whitelist_enabled));

        m.insert_str("peer-port", Value::Int(self.peer_port as i64));
        m.insert_str("peer-limit-global", Value::Int(self.peer_limit_global as i64));
        m.insert_str("peer-limit-per-torrent", Value::Int(self.peer_limit_per_torrent as i64));

        m.insert_str("dht-enabled", Value::Bool(self.dht_enabled));
        m.insert_str("lpd-enabled", Value::Bool(self.lpd_enabled));
        m.insert_str("utp-enabled", Value::Bool(self.utp_enabled));
        m.insert_str("port-forwarding-enabled", Value::Bool(self.port_forwarding_enabled));
        m.insert_str("encryption", Value::string(self.encryption.as_str()));

        m.insert_str("bind-address-ipv4", Value::string(self.bind_address_ipv4.to_string()));
        m.insert_str("bind-address-ipv6", Value::string(self.bind_address_ipv6.to_string()));

        m.insert_str("ratio-limit", Value::Double(self.ratio_limit));
        m.insert_str("ratio-limit-enabled", Value::Bool(self.ratio_limit_enabled));
        m.insert_str("sequential-download", Value::Bool(self.sequential_download));

        m.insert_str("log-level", Value::string(self.log_level.as_str()));
        if let Some(f) = &self.log_file {
            m.insert_str("log-file", Value::string(f.display().to_string()));
        }
        if let Some(f) = &self.pid_file {
            m.insert_str("pid-file", Value::string(f.display().to_string()));
        }
        m.insert_str("start-paused", Value::Bool(self.start_paused));
        m.insert_str("cache-size-mb", Value::Int(self.cache_size_mb as i64));
        m
    }

    fn apply_value_map(&mut self, map: &ValueMap) {
        macro_rules! str_field {
            ($key:literal) => {
                map.get(quark::intern_str($key)).and_then(Value::as_str)
            };
        }
        macro_rules! bool_field {
            ($key:literal, $dst:expr) => {
                if let Some(b) = map.get(quark::intern_str($key)).and_then(Value::as_bool) {
                    $dst = b;
                }
            };
        }

        if let Some(s) = str_field!("download-dir") {
            self.download_dir = PathBuf::from(s);
        }
        self.incomplete_dir = str_field!("incomplete-dir").map(PathBuf::from);
        bool_field!("incomplete-dir-enabled", self.incomplete_dir_enabled);
        self.watch_dir = str_field!("watch-dir").map(PathBuf::from);
        bool_field!("watch-dir-enabled", self.watch_dir_enabled);
        bool_field!("watch-dir-force-generic", self.watch_dir_force_generic);

        if let Some(n) = map.get(quark::intern_str("rpc-port")).and_then(Value::as_i64) {
            self.rpc_port = n as u16;
        }
        if let Some(s) = str_field!("rpc-bind-address") {
            if let Ok(addr) = s.parse() {
                self.rpc_bind_address = addr;
            }
        }
        bool_field!("rpc-authentication-required", self.rpc_authentication_required);
        self.rpc_username = str_field!("rpc-username").map(|s| s.to_string());
        self.rpc_password = str_field!("rpc-password").map(|s| s.to_string());
        if let Some(s) = str_field!("rpc-whitelist") {
            self.rpc_whitelist = s.split(',').map(|s| s.trim().to_string()).collect();
        }
        bool_field!("rpc-whitelist-enabled", self.rpc_whitelist_enabled);

        if let Some(n) = map.get(quark::intern_str("peer-port")).and_then(Value::as_i64) {
            self.peer_port = n as u16;
        }
        if let Some(n) = map.get(quark::intern_str("peer-limit-global")).and_then(Value::as_i64) {
            self.peer_limit_global = n as u32;
        }
        if let Some(n) = map.get(quark::intern_str("peer-limit-per-torrent")).and_then(Value::as_i64) {
            self.peer_limit_per_torrent = n as u32;
        }

        bool_field!("dht-enabled", self.dht_enabled);
        bool_field!("lpd-enabled", self.lpd_enabled);
        bool_field!("utp-enabled", self.utp_enabled);
        bool_field!("port-forwarding-enabled", self.port_forwarding_enabled);
        if let Some(s) = str_field!("encryption").and_then(EncryptionMode::parse) {
            self.encryption = s;
        }

        if let Some(s) = str_field!("bind-address-ipv4") {
            if let Ok(addr) = s.parse() {
                self.bind_address_ipv4 = addr;
            }
        }
        if let Some(s) = str_field!("bind-address-ipv6") {
            if let Ok(addr) = s.parse() {
                self.bind_address_ipv6 = addr;
            }
        }

        if let Some(d) = map.get(quark::intern_str("ratio-limit")).and_then(Value::as_f64) {
            self.ratio_limit = d;
        }
        bool_field!("ratio-limit-enabled", self.ratio_limit_enabled);
        bool_field!("sequential-download", self.sequential_download);

        if let Some(s) = str_field!("log-level").and_then(LogLevel::parse) {
            self.log_level = s;
        }
        self.log_file = str_field!("log-file").map(PathBuf::from);
        self.pid_file = str_field!("pid-file").map(PathBuf::from);
        bool_field!("start-paused", self.start_paused);
        if let Some(n) = map.get(quark::intern_str("cache-size-mb")).and_then(Value::as_i64) {
            self.cache_size_mb = n as usize;
        }
    }

    /// Applies the subset of fields a CLI invocation actually specified,
    /// overriding whatever the settings file supplied.
    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(v) = &cli.download_dir {
            self.download_dir = v.clone();
        }
        if let Some(v) = &cli.incomplete_dir {
            self.incomplete_dir = Some(v.clone());
        }
        if cli.incomplete_dir_enabled {
            self.incomplete_dir_enabled = true;
        }
        if cli.no_incomplete_dir {
            self.incomplete_dir_enabled = false;
        }
        if let Some(v) = &cli.watch_dir {
            self.watch_dir = Some(v.clone());
        }
        if cli.watch_dir_enabled {
            self.watch_dir_enabled = true;
        }
        if cli.no_watch_dir {
            self.watch_dir_enabled = false;
        }
        if cli.watch_dir_force_generic {
            self.watch_dir_force_generic = true;
        }

        if let Some(v) = cli.rpc_port {
            self.rpc_port = v;
        }
        if let Some(v) = &cli.rpc_bind_address {
            if let Ok(addr) = v.parse() {
                self.rpc_bind_address = addr;
            }
        }
        if cli.rpc_auth_required {
            self.rpc_authentication_required = true;
        }
        if let Some(v) = &cli.rpc_username {
            self.rpc_username = Some(v.clone());
        }
        if let Some(v) = &cli.rpc_password {
            self.rpc_password = Some(v.clone());
        }
        if let Some(v) = &cli.rpc_whitelist {
            self.rpc_whitelist = v.split(',').map(|s| s.trim().to_string()).collect();
        }
        if cli.no_rpc_whitelist {
            self.rpc_whitelist_enabled = false;
        }

        if let Some(v) = cli.peer_port {
            self.peer_port = v;
        }
        if let Some(v) = cli.peer_limit_global {
            self.peer_limit_global = v;
        }
        if let Some(v) = cli.peer_limit_per_torrent {
            self.peer_limit_per_torrent = v;
        }

        if cli.dht {
            self.dht_enabled = true;
        }
        if cli.no_dht {
            self.dht_enabled = false;
        }
        if cli.lpd {
            self.lpd_enabled = true;
        }
        if cli.no_lpd {
            self.lpd_enabled = false;
        }
        if cli.utp {
            self.utp_enabled = true;
        }
        if cli.no_utp {
            self.utp_enabled = false;
        }
        if cli.port_forwarding {
            self.port_forwarding_enabled = true;
        }
        if cli.no_port_forwarding {
            self.port_forwarding_enabled = false;
        }
        if let Some(v) = &cli.encryption {
            if let Some(mode) = EncryptionMode::parse(v) {
                self.encryption = mode;
            }
        }

        if let Some(v) = &cli.bind_address_ipv4 {
            if let Ok(addr) = v.parse() {
                self.bind_address_ipv4 = addr;
            }
        }
        if let Some(v) = &cli.bind_address_ipv6 {
            if let Ok(addr) = v.parse() {
                self.bind_address_ipv6 = addr;
            }
        }

        if let Some(v) = cli.global_seed_ratio {
            self.ratio_limit = v;
            self.ratio_limit_enabled = true;
        }
        if cli.sequential_download {
            self.sequential_download = true;
        }

        if let Some(v) = &cli.log_level {
            if let Some(level) = LogLevel::parse(v) {
                self.log_level = level;
            }
        }
        if let Some(v) = &cli.log_file {
            self.log_file = Some(v.clone());
        }
        if let Some(v) = &cli.pid_file {
            self.pid_file = Some(v.clone());
        }
        if cli.foreground {
            self.foreground = true;
        }
        if cli.paused {
            self.start_paused = true;
        }
    }
}

/// Daemon CLI flags. `rsbtctl` has its own,
/// much smaller, parser in `bin/rsbtctl.rs`.
#[derive(Parser, Debug)]
#[command(name = "rsbtd", version, about = "headless BitTorrent daemon")]
pub struct Cli {
    #[arg(short = 'g', long)]
    pub config_dir: Option<PathBuf>,
    #[arg(short = 'd', long)]
    pub download_dir: Option<PathBuf>,
    #[arg(long)]
    pub incomplete_dir: Option<PathBuf>,
    #[arg(long)]
    pub incomplete_dir_enabled: bool,
    #[arg(long)]
    pub no_incomplete_dir: bool,
    #[arg(short = 'w', long)]
    pub watch_dir: Option<PathBuf>,
    #[arg(long)]
    pub watch_dir_enabled: bool,
    #[arg(long)]
    pub no_watch_dir: bool,
    #[arg(long)]
    pub watch_dir_force_generic: bool,

    #[arg(short = 'p', long)]
    pub rpc_port: Option<u16>,
    #[arg(long)]
    pub rpc_bind_address: Option<String>,
    #[arg(short = 't', long = "auth")]
    pub rpc_auth_required: bool,
    #[arg(long)]
    pub rpc_username: Option<String>,
    #[arg(long)]
    pub rpc_password: Option<String>,
    #[arg(long)]
    pub rpc_whitelist: Option<String>,
    #[arg(long)]
    pub no_rpc_whitelist: bool,

    #[arg(long)]
    pub peer_port: Option<u16>,
    #[arg(short = 'L', long)]
    pub peer_limit_global: Option<u32>,
    #[arg(short = 'l', long)]
    pub peer_limit_per_torrent: Option<u32>,

    #[arg(long)]
    pub dht: bool,
    #[arg(long)]
    pub no_dht: bool,
    #[arg(long)]
    pub lpd: bool,
    #[arg(long)]
    pub no_lpd: bool,
    #[arg(long)]
    pub utp: bool,
    #[arg(long)]
    pub no_utp: bool,
    #[arg(long)]
    pub port_forwarding: bool,
    #[arg(long)]
    pub no_port_forwarding: bool,
    /// required | preferred | tolerated
    #[arg(short = 'e', long)]
    pub encryption: Option<String>,

    #[arg(long)]
    pub bind_address_ipv4: Option<String>,
    #[arg(long)]
    pub bind_address_ipv6: Option<String>,

    #[arg(long)]
    pub global_seed_ratio: Option<f64>,
    #[arg(long)]
    pub sequential_download: bool,

    /// error | warn | info | debug | trace
    #[arg(long)]
    pub log_level: Option<String>,
    #[arg(long)]
    pub log_file: Option<PathBuf>,
    #[arg(long)]
    pub pid_file: Option<PathBuf>,
    #[arg(short = 'f', long)]
    pub foreground: bool,
    #[arg(long)]
    pub paused: bool,

    /// Prints the effective settings as JSON and exits 0 without starting
    /// the daemon.
    #[arg(long)]
    pub dump_settings: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_round_trip_through_json() {
        let mut s = Settings::default();
        s.config_dir = PathBuf::from("/tmp/rsbtd-test");
        s.rpc_port = 9999;
        s.labels_smoke_field_untouched();
        let encoded = value::json_encode(&Value::Map(s.to_value_map()));
        let decoded = value::json_decode(&encoded).unwrap();
        let mut reloaded = Settings {
            config_dir: s.config_dir.clone(),
            ..Settings::default()
        };
        reloaded.apply_value_map(decoded.as_map().unwrap());
        assert_eq!(reloaded.rpc_port, 9999);
        assert_eq!(reloaded.download_dir, s.download_dir);
    }

    #[test]
    fn defaults_match_conventional_ports() {
        let s = Settings::default();
        assert_eq!(s.rpc_port, 9091);
        assert_eq!(s.peer_port, 51413);
    }

    impl Settings {
        // Exists purely so the round-trip test above reads naturally; not
        // part of the public surface.
        fn labels_smoke_field_untouched(&self) {}
    }
}
