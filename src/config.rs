use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Daemon settings. An optional TOML file supplies these; command-line
/// flags override whatever the file (or its absence) left in place.
#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default = "default_addr")]
    pub addr: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_tunnel_idle_timeout")]
    pub tunnel_idle_timeout_secs: u64,
    #[serde(default = "default_write_timeout")]
    pub write_timeout_secs: u64,
    #[serde(default = "default_ssh_dial_timeout")]
    pub ssh_dial_timeout_secs: u64,
    #[serde(default)]
    pub known_hosts_file: Option<PathBuf>,
    #[serde(default)]
    pub debug: bool,
}

fn default_addr() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    7070
}

fn default_tunnel_idle_timeout() -> u64 {
    30 * 60
}

fn default_write_timeout() -> u64 {
    30
}

fn default_ssh_dial_timeout() -> u64 {
    30
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addr: default_addr(),
            port: default_port(),
            tunnel_idle_timeout_secs: default_tunnel_idle_timeout(),
            write_timeout_secs: default_write_timeout(),
            ssh_dial_timeout_secs: default_ssh_dial_timeout(),
            known_hosts_file: None,
            debug: false,
        }
    }
}

impl Config {
    pub fn try_load(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
        toml::from_str(&content).map_err(|e| format!("failed to parse {}: {}", path.display(), e))
    }

    /// The known-hosts file to verify server keys against, defaulting to
    /// `$HOME/.ssh/known_hosts`.
    pub fn known_hosts(&self) -> PathBuf {
        if let Some(path) = &self.known_hosts_file {
            return path.clone();
        }
        let home = std::env::var("HOME").unwrap_or_default();
        PathBuf::from(home).join(".ssh").join("known_hosts")
    }
}

/// Skeleton property list for running the daemon as a macOS LaunchAgent.
pub fn launchd_plist(program: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
	<key>Label</key>
	<string>io.culvert.daemon</string>
	<key>ProgramArguments</key>
	<array>
		<string>{program}</string>
	</array>
	<key>RunAtLoad</key>
	<true/>
	<key>KeepAlive</key>
	<true/>
	<key>EnvironmentVariables</key>
	<dict>
		<key>SSH_AUTH_SOCK</key>
		<string>${{SSH_AUTH_SOCK}}</string>
	</dict>
</dict>
</plist>
"#
    )
}
