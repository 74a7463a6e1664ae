use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use sysinfo::System;
use thiserror::Error;

use crate::addr;
use crate::registry::TunnelRegistry;
use crate::resp::Reply;
use crate::server::ServerError;
use crate::stats::MetricSink;

/// Version and VCS information baked into the binary at build time.
#[derive(Debug, Clone)]
pub struct BuildInfo {
    pub version: &'static str,
    pub git_hash: &'static str,
}

impl BuildInfo {
    pub fn current() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION"),
            git_hash: option_env!("CULVERT_GIT_HASH").unwrap_or("unknown"),
        }
    }
}

/// The capabilities commands may use, instead of a back-reference to the
/// whole server.
pub struct CommandContext {
    pub registry: Arc<TunnelRegistry>,
    pub build: BuildInfo,
    pub stats: Option<Arc<dyn MetricSink>>,
    pub releases: Arc<dyn ReleaseSource>,
    pub command_names: Vec<String>,
}

#[async_trait]
pub trait Command: Send + Sync {
    async fn execute(
        &self,
        name: &str,
        argv: &[String],
        ctx: &CommandContext,
    ) -> Result<Reply, ServerError>;
}

/// The fixed table of supported commands, keyed by lowercased name.
pub fn command_table() -> HashMap<&'static str, Box<dyn Command>> {
    let mut table: HashMap<&'static str, Box<dyn Command>> = HashMap::new();
    table.insert("checkupdates", Box::new(CheckUpdatesCmd));
    table.insert("command", Box::new(CommandCmd));
    table.insert("gettunneladdr", Box::new(GetTunnelAddrCmd));
    table.insert("info", Box::new(InfoCmd));
    table.insert("killtunnel", Box::new(KillTunnelCmd));
    table.insert("ping", Box::new(PingCmd));
    table
}

/// Sorted command names, as the COMMAND reply lists them.
pub fn command_names(table: &HashMap<&'static str, Box<dyn Command>>) -> Vec<String> {
    let mut names: Vec<String> = table.keys().map(|name| name.to_string()).collect();
    names.sort();
    names
}

fn wrong_arity(name: &str) -> Reply {
    Reply::Error(format!("ERR wrong number of arguments for {name}"))
}

struct PingCmd;

#[async_trait]
impl Command for PingCmd {
    async fn execute(
        &self,
        name: &str,
        argv: &[String],
        _ctx: &CommandContext,
    ) -> Result<Reply, ServerError> {
        // only the argument-less PING form is supported
        if argv.len() != 1 {
            return Ok(wrong_arity(name));
        }
        Ok(Reply::Pong)
    }
}

struct CommandCmd;

#[async_trait]
impl Command for CommandCmd {
    async fn execute(
        &self,
        name: &str,
        argv: &[String],
        ctx: &CommandContext,
    ) -> Result<Reply, ServerError> {
        if argv.len() != 1 {
            return Ok(wrong_arity(name));
        }
        Ok(Reply::StringArray(ctx.command_names.clone()))
    }
}

/// GETTUNNELADDR [user@]ssh.server.host[:port] remote.server.host:port
struct GetTunnelAddrCmd;

#[async_trait]
impl Command for GetTunnelAddrCmd {
    async fn execute(
        &self,
        name: &str,
        argv: &[String],
        ctx: &CommandContext,
    ) -> Result<Reply, ServerError> {
        if argv.len() != 3 {
            return Ok(wrong_arity(name));
        }

        let (user, ssh) = match addr::parse_ssh_user_addr(&argv[1]) {
            Ok(parsed) => parsed,
            Err(e) => return Ok(Reply::Error(format!("ERR invalid SSH server address: {e}"))),
        };
        // remote address, port required
        let remote = match addr::parse_addr(&argv[2], 0) {
            Ok(remote) => remote,
            Err(e) => {
                return Ok(Reply::Error(format!(
                    "ERR invalid remote server address: {e}"
                )))
            }
        };

        match ctx.registry.tunnel_addr(&user, ssh, remote).await {
            Ok(local) => Ok(Reply::Bulk(local.to_string())),
            Err(e) => Ok(Reply::Error(format!("ERR failed to start tunnel: {e}"))),
        }
    }
}

/// KILLTUNNEL [user@]ssh.server.host[:port] remote.server.host:port
struct KillTunnelCmd;

#[async_trait]
impl Command for KillTunnelCmd {
    async fn execute(
        &self,
        name: &str,
        argv: &[String],
        ctx: &CommandContext,
    ) -> Result<Reply, ServerError> {
        if argv.len() != 3 {
            return Ok(wrong_arity(name));
        }

        let (user, ssh) = match addr::parse_ssh_user_addr(&argv[1]) {
            Ok(parsed) => parsed,
            Err(e) => return Ok(Reply::Error(format!("ERR invalid SSH server address: {e}"))),
        };
        let remote = match addr::parse_addr(&argv[2], 0) {
            Ok(remote) => remote,
            Err(e) => {
                return Ok(Reply::Error(format!(
                    "ERR invalid remote server address: {e}"
                )))
            }
        };

        ctx.registry.kill_tunnel(&user, ssh, remote).await;
        Ok(Reply::Ok)
    }
}

/// INFO [section]
struct InfoCmd;

#[async_trait]
impl Command for InfoCmd {
    async fn execute(
        &self,
        name: &str,
        argv: &[String],
        ctx: &CommandContext,
    ) -> Result<Reply, ServerError> {
        if argv.len() > 2 {
            return Ok(wrong_arity(name));
        }
        let section = argv.get(1).map(|s| s.to_lowercase());
        Ok(Reply::Bulk(info_body(ctx, section.as_deref())))
    }
}

const INFO_SECTIONS: [&str; 4] = ["server", "memory", "cpu", "stats"];

fn info_body(ctx: &CommandContext, section: Option<&str>) -> String {
    let selected: Vec<&str> = match section {
        None => INFO_SECTIONS.to_vec(),
        Some(name) => INFO_SECTIONS.iter().copied().filter(|s| *s == name).collect(),
    };

    let mut sections = Vec::with_capacity(selected.len());
    for name in selected {
        let lines = match name {
            "server" => server_section(ctx),
            "memory" => memory_section(),
            "cpu" => cpu_section(),
            "stats" => stats_section(ctx),
            _ => unreachable!(),
        };
        let mut body = format!("# {}\r\n", capitalize(name));
        for (key, value) in lines {
            body.push_str(&key);
            body.push(':');
            body.push_str(&value);
            body.push_str("\r\n");
        }
        sections.push(body);
    }
    sections.join("\r\n")
}

fn capitalize(s: &str) -> String {
    if s == "cpu" {
        return "CPU".to_string();
    }
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

fn server_section(ctx: &CommandContext) -> Vec<(String, String)> {
    vec![
        ("version".into(), ctx.build.version.to_string()),
        ("git_hash".into(), ctx.build.git_hash.to_string()),
        ("os".into(), std::env::consts::OS.to_string()),
        ("arch".into(), std::env::consts::ARCH.to_string()),
        ("process_id".into(), std::process::id().to_string()),
    ]
}

fn memory_section() -> Vec<(String, String)> {
    let mut sys = System::new();
    sys.refresh_processes();

    let mut lines = Vec::new();
    if let Ok(pid) = sysinfo::get_current_pid() {
        if let Some(process) = sys.process(pid) {
            lines.push(("used_memory_resident".into(), process.memory().to_string()));
            lines.push(("used_memory_virtual".into(), process.virtual_memory().to_string()));
        }
    }
    lines
}

fn cpu_section() -> Vec<(String, String)> {
    let mut sys = System::new();
    sys.refresh_cpu();
    vec![
        ("logical_cpus".into(), sys.cpus().len().to_string()),
        (
            "physical_cpus".into(),
            sys.physical_core_count().unwrap_or(0).to_string(),
        ),
    ]
}

fn stats_section(ctx: &CommandContext) -> Vec<(String, String)> {
    match &ctx.stats {
        Some(stats) => stats
            .snapshot()
            .into_iter()
            .map(|(key, value)| (key, value.to_string()))
            .collect(),
        None => Vec::new(),
    }
}

#[derive(Error, Debug)]
pub enum UpdateError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("invalid release payload: {0}")]
    Payload(String),
}

/// Source of the latest published release tag.
#[async_trait]
pub trait ReleaseSource: Send + Sync {
    async fn latest_tag(&self) -> Result<Option<String>, UpdateError>;
}

const RELEASE_ENDPOINT: &str = "https://api.github.com/repos/culvert-app/culvert/releases/latest";
const RELEASE_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Fetches the release tag from the GitHub API. The blocking HTTP call
/// runs on the blocking pool under an outer timeout.
pub struct GithubReleases;

#[async_trait]
impl ReleaseSource for GithubReleases {
    async fn latest_tag(&self) -> Result<Option<String>, UpdateError> {
        tokio::time::timeout(
            RELEASE_FETCH_TIMEOUT,
            tokio::task::spawn_blocking(fetch_release_tag),
        )
        .await
        .map_err(|_| UpdateError::Request("release check timed out".into()))?
        .map_err(|e| UpdateError::Request(format!("release task failed: {e}")))?
    }
}

#[derive(Deserialize)]
struct Release {
    tag_name: Option<String>,
}

fn fetch_release_tag() -> Result<Option<String>, UpdateError> {
    let mut response = ureq::get(RELEASE_ENDPOINT)
        .call()
        .map_err(|e| UpdateError::Request(e.to_string()))?;
    let body = response
        .body_mut()
        .read_to_string()
        .map_err(|e| UpdateError::Request(e.to_string()))?;
    let release: Release =
        serde_json::from_str(&body).map_err(|e| UpdateError::Payload(e.to_string()))?;
    Ok(release.tag_name.filter(|tag| !tag.is_empty()))
}

/// CHECKUPDATES
struct CheckUpdatesCmd;

#[async_trait]
impl Command for CheckUpdatesCmd {
    async fn execute(
        &self,
        name: &str,
        argv: &[String],
        ctx: &CommandContext,
    ) -> Result<Reply, ServerError> {
        if argv.len() != 1 {
            return Ok(wrong_arity(name));
        }

        match ctx.releases.latest_tag().await {
            // a release is "new" as soon as its tag differs from ours;
            // a missing or empty tag counts as the same release
            Ok(tag) => {
                let changed = tag.is_some_and(|tag| tag != ctx.build.version);
                Ok(Reply::Bool(changed))
            }
            Err(e) => Ok(Reply::Error(format!("ERR failed to check updates: {e}"))),
        }
    }
}
