//! Load config from file and environment.

use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};

use p2pfs_core::{DEFAULT_CHUNK_SIZE, DEFAULT_LISTEN_ADDR, DEFAULT_RECEIVE_DIR};

/// Node configuration. File: ~/.config/p2pfs/config.toml or /etc/p2pfs/config.toml.
/// Env overrides: P2PFS_LISTEN, P2PFS_ROOT, P2PFS_RECEIVE_DIR, P2PFS_CHUNK_SIZE, P2PFS_IDENTITY.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Listen address for `server` (default /ip4/127.0.0.1/tcp/8080).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Directory served to requesters (default: working directory).
    #[serde(default = "default_root")]
    pub root: PathBuf,
    /// Where fetched files are written (default received_files).
    #[serde(default = "default_receive_dir")]
    pub receive_dir: PathBuf,
    /// Bytes per chunk when serving a file (default 1024).
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Hex secret key file; a fresh identity is generated per run when unset.
    #[serde(default)]
    pub identity_file: Option<PathBuf>,
    /// Seconds to wait for open streams on shutdown (default 5).
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

fn default_listen() -> String {
    DEFAULT_LISTEN_ADDR.to_string()
}
fn default_root() -> PathBuf {
    PathBuf::from(".")
}
fn default_receive_dir() -> PathBuf {
    PathBuf::from(DEFAULT_RECEIVE_DIR)
}
fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}
fn default_shutdown_grace() -> u64 {
    5
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            root: default_root(),
            receive_dir: default_receive_dir(),
            chunk_size: default_chunk_size(),
            identity_file: None,
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.chunk_size > 0, "chunk_size must be positive");
        self.listen
            .parse::<p2pfs_core::ListenAddress>()
            .with_context(|| format!("invalid listen address {:?}", self.listen))?;
        Ok(())
    }
}

/// Load config: default, then config file, then env vars. An explicit `path`
/// must exist and parse; the default locations are skipped when absent.
pub fn load(path: Option<&Path>) -> anyhow::Result<Config> {
    let mut c = match path {
        Some(p) => read_file(p)?,
        None => match config_paths().into_iter().find(|p| p.exists()) {
            Some(p) => read_file(&p)?,
            None => Config::default(),
        },
    };
    apply_env(&mut c, |key| std::env::var(key).ok())?;
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/p2pfs/config.toml"));
    }
    out.push(PathBuf::from("/etc/p2pfs/config.toml"));
    out
}

fn read_file(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    toml::from_str(&s).with_context(|| format!("parsing config {}", path.display()))
}

fn apply_env<F>(c: &mut Config, var: F) -> anyhow::Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(s) = var("P2PFS_LISTEN") {
        c.listen = s;
    }
    if let Some(s) = var("P2PFS_ROOT") {
        c.root = PathBuf::from(s);
    }
    if let Some(s) = var("P2PFS_RECEIVE_DIR") {
        c.receive_dir = PathBuf::from(s);
    }
    if let Some(s) = var("P2PFS_CHUNK_SIZE") {
        c.chunk_size = s
            .parse()
            .with_context(|| format!("P2PFS_CHUNK_SIZE={:?}", s))?;
    }
    if let Some(s) = var("P2PFS_IDENTITY") {
        c.identity_file = Some(PathBuf::from(s));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn empty_file_gives_defaults() {
        let c: Config = toml::from_str("").unwrap();
        assert_eq!(c.listen, DEFAULT_LISTEN_ADDR);
        assert_eq!(c.chunk_size, 1024);
        assert_eq!(c.receive_dir, PathBuf::from("received_files"));
        assert_eq!(c.shutdown_grace_secs, 5);
        assert!(c.identity_file.is_none());
        c.validate().unwrap();
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml::from_str::<Config>("proxy_port = 3128").is_err());
    }

    #[test]
    fn file_values_are_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "listen = \"/ip4/0.0.0.0/tcp/9000\"\nroot = \"/srv/share\"\nchunk_size = 4096\n",
        )
        .unwrap();
        let c = read_file(&path).unwrap();
        assert_eq!(c.listen, "/ip4/0.0.0.0/tcp/9000");
        assert_eq!(c.root, PathBuf::from("/srv/share"));
        assert_eq!(c.chunk_size, 4096);
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load(Some(&dir.path().join("absent.toml"))).is_err());
    }

    #[test]
    fn env_overrides_file() {
        let vars: HashMap<&str, &str> = [
            ("P2PFS_LISTEN", "/ip4/127.0.0.1/tcp/7000"),
            ("P2PFS_CHUNK_SIZE", "512"),
            ("P2PFS_IDENTITY", "/tmp/id.key"),
        ]
        .into_iter()
        .collect();
        let mut c = Config::default();
        apply_env(&mut c, |k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(c.listen, "/ip4/127.0.0.1/tcp/7000");
        assert_eq!(c.chunk_size, 512);
        assert_eq!(c.identity_file, Some(PathBuf::from("/tmp/id.key")));
        assert_eq!(c.root, PathBuf::from("."));
    }

    #[test]
    fn bad_env_chunk_size_is_an_error() {
        let mut c = Config::default();
        let result = apply_env(&mut c, |k| (k == "P2PFS_CHUNK_SIZE").then(|| "lots".to_string()));
        assert!(result.is_err());
    }

    #[test]
    fn validate_catches_bad_values() {
        let c = Config {
            chunk_size: 0,
            ..Config::default()
        };
        assert!(c.validate().is_err());
        let c = Config {
            listen: "127.0.0.1:8080".into(),
            ..Config::default()
        };
        assert!(c.validate().is_err());
    }
}
