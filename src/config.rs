//! Plugin configuration.
//!
//! The host hands the plugin a configuration directory; the plugin reads
//! `<dir>/<package>.cfg`, a flat INI category of string values. Every key
//! is optional and falls back to a default.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use config::{Config, File, FileFormat};
use tracing::warn;

use crate::error::{Error, Result};
use crate::sdp::Codec;

/// Default UDP port range when `udp_port_range` is absent or unusable.
pub const DEFAULT_UDP_PORT_RANGE: (u16, u16) = (4000, 5000);

/// Default registry keepalive interval.
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

/// Default RTSP server port.
pub const DEFAULT_RTSP_PORT: u16 = 8554;

/// Parsed plugin configuration, immutable after init.
#[derive(Debug, Clone)]
pub struct PluginConfig {
    /// Lower bound of the loopback UDP port pool.
    pub udp_min_port: u16,
    /// Upper bound of the loopback UDP port pool.
    pub udp_max_port: u16,
    /// Interval between registry keepalives.
    pub keepalive_interval: Duration,
    /// Base URL of the stream registry; `None` disables registry access.
    pub status_service_url: Option<String>,
    /// Base URL for keepalives; `None` disables the keepalive loop.
    pub keepalive_service_url: Option<String>,
    /// Video codec preference order; empty disables prioritization.
    pub codec_priority: Vec<Codec>,
    /// IP (or name) the RTSP server advertises in mount URLs.
    pub rtsp_interface: String,
    /// TCP port the RTSP server listens on; 0 picks an ephemeral port.
    pub rtsp_port: u16,
    /// Re-arm PLI requests while a mount's media has not started playing.
    pub pli_workaround: bool,
}

impl Default for PluginConfig {
    fn default() -> Self {
        PluginConfig {
            udp_min_port: DEFAULT_UDP_PORT_RANGE.0,
            udp_max_port: DEFAULT_UDP_PORT_RANGE.1,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            status_service_url: None,
            keepalive_service_url: None,
            codec_priority: Vec::new(),
            rtsp_interface: "localhost".to_string(),
            rtsp_port: DEFAULT_RTSP_PORT,
            pli_workaround: false,
        }
    }
}

impl PluginConfig {
    /// Loads `<config_dir>/<package>.cfg`. A missing file yields the
    /// defaults; a present but unreadable file is an error.
    pub fn load(config_dir: &Path, package: &str) -> Result<PluginConfig> {
        let path = config_dir.join(format!("{package}.cfg"));
        if !path.exists() {
            warn!(?path, "no configuration file, using defaults");
            return Ok(PluginConfig::default());
        }
        let path_str = path
            .to_str()
            .ok_or_else(|| Error::config("config path is not valid UTF-8"))?;
        let raw = Config::builder()
            .add_source(File::new(path_str, FileFormat::Ini))
            .build()
            .map_err(|e| Error::config(format!("cannot read {path_str}: {e}")))?;
        let categories: HashMap<String, HashMap<String, String>> = raw
            .try_deserialize()
            .map_err(|e| Error::config(format!("cannot parse {path_str}: {e}")))?;

        // The file is a flat category; fold every section into one map so
        // the section name itself does not matter.
        let mut items = HashMap::new();
        for (_, section) in categories {
            items.extend(section);
        }
        Ok(PluginConfig::from_items(&items))
    }

    /// Builds a configuration from raw key/value pairs.
    pub fn from_items(items: &HashMap<String, String>) -> PluginConfig {
        let mut cfg = PluginConfig::default();

        if let Some(range) = items.get("udp_port_range") {
            let (min, max) = parse_port_range(range);
            cfg.udp_min_port = min;
            cfg.udp_max_port = max;
        }
        if let Some(interval) = items.get("keepalive_interval") {
            cfg.keepalive_interval = parse_keepalive_interval(interval);
        }
        if let Some(url) = items.get("status_service_url") {
            cfg.status_service_url = Some(url.trim_end_matches('/').to_string());
        }
        if let Some(url) = items.get("keepalive_service_url") {
            cfg.keepalive_service_url = Some(url.trim_end_matches('/').to_string());
        }
        if let Some(priority) = items.get("video_codec_priority") {
            cfg.codec_priority = parse_codec_priority(priority);
        }
        if let Some(iface) = items.get("interface") {
            cfg.rtsp_interface = iface.clone();
        } else {
            warn!("RTSP interface not configured, using localhost");
        }
        if let Some(port) = items.get("rtsp_port") {
            match port.parse() {
                Ok(p) => cfg.rtsp_port = p,
                Err(_) => warn!(value = %port, "ignoring unparsable rtsp_port"),
            }
        }
        if let Some(flag) = items.get("pli_workaround") {
            cfg.pli_workaround = matches!(flag.trim(), "true" | "yes" | "1");
        }
        cfg
    }
}

/// Parses `"MIN-MAX"`. Swaps a reversed range; a zero or unparsable bound
/// falls back to the default range.
fn parse_port_range(value: &str) -> (u16, u16) {
    let Some((min_str, max_str)) = value.rsplit_once('-') else {
        return DEFAULT_UDP_PORT_RANGE;
    };
    let min: u16 = min_str.trim().parse().unwrap_or(0);
    let max: u16 = max_str.trim().parse().unwrap_or(0);
    let (min, max) = if min > max { (max, min) } else { (min, max) };
    if min == 0 {
        return DEFAULT_UDP_PORT_RANGE;
    }
    (min, max)
}

/// Seconds as a string; zero or unparsable falls back to the default.
fn parse_keepalive_interval(value: &str) -> Duration {
    match value.trim().parse::<u64>() {
        Ok(secs) if secs > 0 => Duration::from_secs(secs),
        _ => DEFAULT_KEEPALIVE_INTERVAL,
    }
}

/// `"C1,C2"` over the video codecs; unknown names are dropped.
fn parse_codec_priority(value: &str) -> Vec<Codec> {
    value
        .split(',')
        .map(|name| Codec::from_name(name.trim()))
        .filter(|codec| codec.is_video())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn items(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_apply_without_items() {
        let cfg = PluginConfig::from_items(&HashMap::new());
        assert_eq!(cfg.udp_min_port, 4000);
        assert_eq!(cfg.udp_max_port, 5000);
        assert_eq!(cfg.keepalive_interval, Duration::from_secs(5));
        assert_eq!(cfg.rtsp_interface, "localhost");
        assert_eq!(cfg.rtsp_port, DEFAULT_RTSP_PORT);
        assert!(cfg.codec_priority.is_empty());
        assert!(!cfg.pli_workaround);
    }

    #[test]
    fn port_range_parsing() {
        assert_eq!(parse_port_range("4000-5000"), (4000, 5000));
        assert_eq!(parse_port_range("5000-4000"), (4000, 5000));
        assert_eq!(parse_port_range("4000-0"), DEFAULT_UDP_PORT_RANGE);
        assert_eq!(parse_port_range("nonsense"), DEFAULT_UDP_PORT_RANGE);
        assert_eq!(parse_port_range("a-b"), DEFAULT_UDP_PORT_RANGE);
    }

    #[test]
    fn keepalive_interval_parsing() {
        assert_eq!(parse_keepalive_interval("7"), Duration::from_secs(7));
        assert_eq!(parse_keepalive_interval("0"), DEFAULT_KEEPALIVE_INTERVAL);
        assert_eq!(parse_keepalive_interval("x"), DEFAULT_KEEPALIVE_INTERVAL);
    }

    #[test]
    fn codec_priority_parsing() {
        assert_eq!(
            parse_codec_priority("H264,VP8"),
            vec![Codec::H264, Codec::Vp8]
        );
        assert_eq!(parse_codec_priority("VP8"), vec![Codec::Vp8]);
        // opus is not a video codec and unknown names are dropped.
        assert_eq!(parse_codec_priority("opus,bogus"), Vec::<Codec>::new());
    }

    #[test]
    fn urls_lose_trailing_slashes() {
        let cfg = PluginConfig::from_items(&items(&[
            ("status_service_url", "http://reg/streams/"),
            ("keepalive_service_url", "http://reg/keepalive"),
        ]));
        assert_eq!(cfg.status_service_url.as_deref(), Some("http://reg/streams"));
        assert_eq!(
            cfg.keepalive_service_url.as_deref(),
            Some("http://reg/keepalive")
        );
    }
}
