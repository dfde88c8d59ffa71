//! Configuration for a proxy instance.
//!
//! One TOML file per daemon, one `[[proxy]]` table per listening proxy.
//! Each proxy has two codec stanzas: `local` describes the leg facing the
//! accepted client, `remote` the leg facing the connect address. A codec
//! stanza enables the dedup stage, picks its cache backend, and toggles
//! compression, byte counting and the HTTP accounting heuristic.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WanProxyConfig {
    #[serde(rename = "proxy")]
    pub proxies: Vec<ProxyStanza>,
}

/// One listening proxy instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyStanza {
    /// Instance name, used in logs.
    pub name: String,
    /// Listen address, `host:port`.
    pub listen: String,
    /// Address to connect each accepted client to, `host:port`.
    pub connect: String,
    /// Which side of the paired proxies this instance plays.
    pub role: Role,
    /// Enable the SSH-style transport pair on the peer-facing leg: the
    /// connect side on a client instance, the accept side on a server
    /// instance. The other leg stays plaintext.
    pub secure: bool,
    /// Codec on the accepted-client leg.
    pub local: CodecStanza,
    /// Codec on the connect leg.
    pub remote: CodecStanza,
}

impl Default for ProxyStanza {
    fn default() -> Self {
        Self {
            name: "proxy".to_string(),
            listen: "[::]:3300".to_string(),
            connect: String::new(),
            role: Role::Client,
            secure: false,
            local: CodecStanza::default(),
            remote: CodecStanza::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    #[default]
    None,
    Xcodec,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheKind {
    #[default]
    Memory,
    Coss,
}

/// Codec configuration for one leg of a proxy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecStanza {
    pub codec: CodecKind,
    pub cache: CacheKind,
    /// Directory holding the `UUID` file and the `.wpc` cache file.
    /// Only meaningful with the coss backend.
    pub cache_path: PathBuf,
    /// Nominal cache size in megabytes. 0 = backend default.
    pub size_mb: u64,
    /// Zlib compression level, 0-9. Absent = no compression stage.
    pub compressor: Option<u32>,
    /// Insert byte-counting filters around the codec stage.
    pub byte_counts: bool,
    /// Enable the HTTP Content-Length accounting heuristic on the
    /// response path. Only useful when the proxied traffic is HTTP.
    pub detect_http: bool,
}

impl Default for CodecStanza {
    fn default() -> Self {
        Self {
            codec: CodecKind::None,
            cache: CacheKind::Memory,
            cache_path: PathBuf::from("/var/cache/wanproxy"),
            size_mb: 0,
            compressor: None,
            byte_counts: false,
            detect_http: false,
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {}: {1}", .0.display())]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {}: {1}", .0.display())]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("proxy {0:?}: {1}")]
    Invalid(String, &'static str),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl WanProxyConfig {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let config: WanProxyConfig =
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for proxy in &self.proxies {
            if proxy.connect.is_empty() {
                return Err(ConfigError::Invalid(proxy.name.clone(), "missing connect address"));
            }
            for stanza in [&proxy.local, &proxy.remote] {
                if let Some(level) = stanza.compressor {
                    if level > 9 {
                        return Err(ConfigError::Invalid(
                            proxy.name.clone(),
                            "compression level must be 0-9",
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_paired_client_config() {
        let text = r#"
            [[proxy]]
            name = "edge"
            listen = "127.0.0.1:3300"
            connect = "peer.example:3301"
            role = "client"
            secure = true

            [proxy.remote]
            codec = "xcodec"
            cache = "coss"
            cache_path = "/tmp/wp-cache"
            size_mb = 64
            compressor = 6
            byte_counts = true
        "#;
        let config: WanProxyConfig = toml::from_str(text).unwrap();
        config.validate().unwrap();

        let proxy = &config.proxies[0];
        assert_eq!(proxy.role, Role::Client);
        assert!(proxy.secure);
        assert_eq!(proxy.local.codec, CodecKind::None);
        assert_eq!(proxy.remote.codec, CodecKind::Xcodec);
        assert_eq!(proxy.remote.cache, CacheKind::Coss);
        assert_eq!(proxy.remote.compressor, Some(6));
        assert!(proxy.remote.byte_counts);
        assert!(!proxy.remote.detect_http);
    }

    #[test]
    fn rejects_bad_compression_level() {
        let text = r#"
            [[proxy]]
            name = "edge"
            listen = "127.0.0.1:3300"
            connect = "peer.example:3301"
            role = "client"

            [proxy.remote]
            codec = "xcodec"
            compressor = 12
        "#;
        let config: WanProxyConfig = toml::from_str(text).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_missing_connect() {
        let config = WanProxyConfig {
            proxies: vec![ProxyStanza::default()],
        };
        assert!(config.validate().is_err());
    }
}
