use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use directories::ProjectDirs;
use serde::Deserialize;

use crate::portbridge::agent::DEFAULT_AGENT_PORT;

pub const CONFIG_ENV: &str = "PORTBRIDGE_CONFIG";

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: PathBuf,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigPathSource {
    Flag,
    Env,
    Cwd,
    Default,
}

impl std::fmt::Display for ConfigPathSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigPathSource::Flag => write!(f, "flag"),
            ConfigPathSource::Env => write!(f, "env"),
            ConfigPathSource::Cwd => write!(f, "cwd"),
            ConfigPathSource::Default => write!(f, "default"),
        }
    }
}

pub fn resolve_config_path(
    explicit_flag_path: Option<PathBuf>,
) -> anyhow::Result<ResolvedConfigPath> {
    if let Some(p) = explicit_flag_path {
        return Ok(ResolvedConfigPath {
            path: normalize_explicit_path(&p)?,
            source: ConfigPathSource::Flag,
        });
    }

    // clap also maps PORTBRIDGE_CONFIG into the flag; this covers callers that skip clap.
    if let Some(p) = std::env::var_os(CONFIG_ENV) {
        if !p.is_empty() {
            return Ok(ResolvedConfigPath {
                path: normalize_explicit_path(Path::new(&p))?,
                source: ConfigPathSource::Env,
            });
        }
    }

    if let Some(p) = discover_config_path(Path::new(".")) {
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Cwd,
        });
    }

    Ok(ResolvedConfigPath {
        path: default_config_path()?,
        source: ConfigPathSource::Default,
    })
}

fn normalize_explicit_path(p: &Path) -> anyhow::Result<PathBuf> {
    if p.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    if let Ok(m) = fs::metadata(p) {
        if m.is_dir() {
            return Ok(discover_config_path(p).unwrap_or_else(|| p.join("portbridge.toml")));
        }
        return Ok(p.to_path_buf());
    }

    // Non-existent path: default to .toml if no extension.
    let mut out = p.to_path_buf();
    if out.extension().is_none() {
        out.set_extension("toml");
    }
    Ok(out)
}

fn discover_config_path(dir: &Path) -> Option<PathBuf> {
    ["portbridge.toml", "portbridge.yaml", "portbridge.yml"]
        .into_iter()
        .map(|c| dir.join(c))
        .find(|p| fs::metadata(p).is_ok_and(|m| m.is_file()))
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    let proj = ProjectDirs::from("dev", "portbridge", "portbridge")
        .context("config: resolve user config dir")?;
    Ok(proj.config_dir().join("portbridge.toml"))
}

/// Writes a runnable template to `path` if nothing exists there yet. Returns true
/// when the file was created.
pub fn ensure_config_file(path: &Path) -> anyhow::Result<bool> {
    if path.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    match fs::metadata(path) {
        Ok(m) if m.is_file() => return Ok(false),
        Ok(_) => anyhow::bail!(
            "config: {} exists but is not a regular file",
            path.display()
        ),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err).with_context(|| format!("config: stat {}", path.display())),
    }

    let tmpl = default_config_template_for_path(path)?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("config: mkdir {}", parent.display()))?;
        }
    }

    // Create once (O_EXCL equivalent).
    let mut f = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .with_context(|| format!("config: create {}", path.display()))?;
    use std::io::Write;
    f.write_all(tmpl.as_bytes())
        .with_context(|| format!("config: write {}", path.display()))?;
    Ok(true)
}

fn extension_of(path: &Path) -> String {
    path.extension()
        .and_then(|s| s.to_str())
        .unwrap_or("")
        .to_ascii_lowercase()
}

fn default_config_template_for_path(path: &Path) -> anyhow::Result<&'static str> {
    match extension_of(path).as_str() {
        "toml" => Ok(DEFAULT_CONFIG_TEMPLATE_TOML),
        "yaml" | "yml" => Ok(DEFAULT_CONFIG_TEMPLATE_YAML),
        _ => anyhow::bail!(
            "config: unsupported config extension {:?} (expected .toml or .yaml/.yml)",
            path.extension()
        ),
    }
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let data = fs::read(path).with_context(|| format!("config: read {}", path.display()))?;
    let s = String::from_utf8_lossy(&data);

    let fc: FileConfig = match extension_of(path).as_str() {
        "toml" => toml::from_str(&s)
            .with_context(|| format!("config: parse toml {}", path.display()))?,
        "yaml" | "yml" => serde_yaml::from_str(&s)
            .with_context(|| format!("config: parse yaml {}", path.display()))?,
        ext => anyhow::bail!("config: unsupported config extension {ext:?}"),
    };

    Config::from_file_config(fc).with_context(|| format!("config: {}", path.display()))
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Empty disables the admin API.
    pub admin_addr: String,
    pub agent: AgentConfig,
    pub workspace: WorkspaceConfig,
    pub auth: AuthConfig,
    pub reconnect: ReconnectConfig,
    pub provider: ProviderConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub host: String,
    pub port: u16,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct WorkspaceConfig {
    pub instance_id: String,
    pub host: String,
}

#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    pub token: String,
    pub token_file: String,
}

#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_attempts: u32,
}

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub open_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

impl Config {
    /// Applies command-line overrides on top of the file values.
    pub fn apply_overrides(&mut self, instance_id: Option<String>, agent_port: Option<u16>) {
        if let Some(id) = instance_id.map(|s| s.trim().to_string()) {
            if !id.is_empty() {
                self.workspace.instance_id = id;
            }
        }
        if let Some(port) = agent_port.filter(|p| *p != 0) {
            self.agent.port = port;
        }
    }

    /// Checks what can only be known after overrides.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.workspace.instance_id.is_empty() {
            anyhow::bail!(
                "config: workspace.instance_id is required (set it in the config file, --instance-id or PORTBRIDGE_INSTANCE_ID)"
            );
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    admin_addr: Option<String>,
    agent: Option<FileAgent>,
    workspace: Option<FileWorkspace>,
    auth: Option<FileAuth>,
    reconnect: Option<FileReconnect>,
    provider: Option<FileProvider>,
    logging: Option<FileLogging>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileAgent {
    host: Option<String>,
    port: Option<u16>,
    connect_timeout_ms: Option<u64>,
    request_timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileWorkspace {
    #[serde(default)]
    instance_id: String,
    #[serde(default)]
    host: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileAuth {
    #[serde(default)]
    token: String,
    #[serde(default)]
    token_file: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileReconnect {
    initial_delay_ms: Option<u64>,
    multiplier: Option<f64>,
    max_attempts: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileProvider {
    open_timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

fn trimmed_or(v: Option<String>, default: &str) -> String {
    v.map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn millis_or(v: Option<u64>, default: u64) -> Duration {
    Duration::from_millis(v.filter(|ms| *ms > 0).unwrap_or(default))
}

impl Config {
    fn from_file_config(fc: FileConfig) -> anyhow::Result<Config> {
        let agent = fc.agent.unwrap_or_default();
        let workspace = fc.workspace.unwrap_or_default();
        let auth = fc.auth.unwrap_or_default();
        let reconnect = fc.reconnect.unwrap_or_default();
        let provider = fc.provider.unwrap_or_default();
        let logging = fc.logging.unwrap_or_default();

        let cfg = Config {
            admin_addr: fc
                .admin_addr
                .map(|s| s.trim().to_string())
                .unwrap_or_else(|| "127.0.0.1:63101".into()),
            agent: AgentConfig {
                host: trimmed_or(agent.host, "localhost"),
                port: agent.port.unwrap_or(DEFAULT_AGENT_PORT),
                connect_timeout: millis_or(agent.connect_timeout_ms, 5000),
                request_timeout: millis_or(agent.request_timeout_ms, 10_000),
            },
            workspace: WorkspaceConfig {
                instance_id: workspace.instance_id.trim().to_string(),
                host: workspace.host.trim().to_string(),
            },
            auth: AuthConfig {
                token: auth.token.trim().to_string(),
                token_file: auth.token_file.trim().to_string(),
            },
            reconnect: ReconnectConfig {
                initial_delay: millis_or(reconnect.initial_delay_ms, 1000),
                multiplier: reconnect.multiplier.unwrap_or(1.5),
                max_attempts: reconnect.max_attempts.unwrap_or(5),
            },
            provider: ProviderConfig {
                open_timeout: millis_or(provider.open_timeout_ms, 10_000),
            },
            logging: LoggingConfig {
                level: trimmed_or(logging.level, "info").to_ascii_lowercase(),
                format: trimmed_or(logging.format, "text").to_ascii_lowercase(),
                output: trimmed_or(logging.output, "stderr"),
                add_source: logging.add_source,
            },
        };

        if cfg.agent.port == 0 {
            anyhow::bail!("agent.port must be non-zero");
        }
        if !cfg.reconnect.multiplier.is_finite() || cfg.reconnect.multiplier < 1.0 {
            anyhow::bail!(
                "reconnect.multiplier must be >= 1 (got {})",
                cfg.reconnect.multiplier
            );
        }
        if cfg.reconnect.max_attempts == 0 {
            anyhow::bail!("reconnect.max_attempts must be >= 1");
        }
        if !matches!(cfg.logging.format.as_str(), "text" | "json") {
            anyhow::bail!(
                "logging.format must be \"text\" or \"json\" (got {:?})",
                cfg.logging.format
            );
        }

        Ok(cfg)
    }
}

const DEFAULT_CONFIG_TEMPLATE_TOML: &str = r#"# portbridge config (auto-generated)
#
# Keeps the workspace's view of forwarded ports in sync with the local agent.

admin_addr = "127.0.0.1:63101"

[agent]
host = "localhost"
port = 63100
connect_timeout_ms = 5000
request_timeout_ms = 10000

[workspace]
# Required; may also come from --instance-id / PORTBRIDGE_INSTANCE_ID.
instance_id = ""
host = ""

[auth]
token = ""
# token_file = "/run/secrets/portbridge-token"

[reconnect]
initial_delay_ms = 1000
multiplier = 1.5
max_attempts = 5

[provider]
open_timeout_ms = 10000

[logging]
level = "info"
format = "text"   # text | json
output = "stderr" # stderr | stdout | discard | /path/to/file
add_source = false
"#;

const DEFAULT_CONFIG_TEMPLATE_YAML: &str = r#"# portbridge config (auto-generated)
#
# Keeps the workspace's view of forwarded ports in sync with the local agent.

admin_addr: "127.0.0.1:63101"

agent:
  host: "localhost"
  port: 63100
  connect_timeout_ms: 5000
  request_timeout_ms: 10000

workspace:
  # Required; may also come from --instance-id / PORTBRIDGE_INSTANCE_ID.
  instance_id: ""
  host: ""

auth:
  token: ""

reconnect:
  initial_delay_ms: 1000
  multiplier: 1.5
  max_attempts: 5

provider:
  open_timeout_ms: 10000

logging:
  level: "info"
  format: "text" # text | json
  output: "stderr"
  add_source: false
"#;

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        p.push(format!(
            "portbridge_cfg_test_{name}_{}_{}",
            std::process::id(),
            now
        ));
        std::fs::create_dir_all(&p).expect("mkdir");
        p
    }

    #[test]
    fn empty_file_uses_defaults() {
        let dir = temp_dir("defaults");
        let path = dir.join("portbridge.toml");
        std::fs::write(&path, "").expect("write");

        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.admin_addr, "127.0.0.1:63101");
        assert_eq!(cfg.agent.host, "localhost");
        assert_eq!(cfg.agent.port, 63100);
        assert_eq!(cfg.agent.connect_timeout, Duration::from_secs(5));
        assert_eq!(cfg.reconnect.initial_delay, Duration::from_secs(1));
        assert_eq!(cfg.reconnect.multiplier, 1.5);
        assert_eq!(cfg.reconnect.max_attempts, 5);
        assert_eq!(cfg.provider.open_timeout, Duration::from_secs(10));
        assert_eq!(cfg.logging.format, "text");
        assert!(cfg.validate().is_err(), "instance id is required");
    }

    #[test]
    fn templates_parse() {
        let dir = temp_dir("templates");
        for name in ["portbridge.toml", "portbridge.yaml"] {
            let path = dir.join(name);
            assert!(ensure_config_file(&path).unwrap());
            assert!(!ensure_config_file(&path).unwrap(), "second call is a no-op");

            let cfg = load_config(&path).unwrap();
            assert_eq!(cfg.agent.port, 63100);
            assert_eq!(cfg.provider.open_timeout, Duration::from_secs(10));
        }
    }

    #[test]
    fn yaml_and_overrides() {
        let dir = temp_dir("yaml");
        let path = dir.join("portbridge.yml");
        let yaml = r#"
admin_addr: ":7001"
agent:
  port: 7000
workspace:
  instance_id: "from-file"
  host: "ws.example.dev"
reconnect:
  multiplier: 2
  max_attempts: 3
"#;
        std::fs::write(&path, yaml).expect("write");

        let mut cfg = load_config(&path).unwrap();
        assert_eq!(cfg.admin_addr, ":7001");
        assert_eq!(cfg.workspace.host, "ws.example.dev");
        assert_eq!(cfg.reconnect.multiplier, 2.0);
        assert_eq!(cfg.reconnect.max_attempts, 3);

        cfg.apply_overrides(Some(" from-flag ".into()), Some(63200));
        assert_eq!(cfg.workspace.instance_id, "from-flag");
        assert_eq!(cfg.agent.port, 63200);
        cfg.validate().unwrap();

        cfg.apply_overrides(Some("".into()), None);
        assert_eq!(cfg.workspace.instance_id, "from-flag");
    }

    #[test]
    fn reject_unknown_fields() {
        let dir = temp_dir("unknown");
        let path = dir.join("portbridge.toml");
        std::fs::write(&path, "[agent]\nhostname = \"x\"\n").expect("write");
        let err = format!("{:#}", load_config(&path).unwrap_err());
        assert!(err.contains("hostname"), "{err}");
    }

    #[test]
    fn reject_bad_backoff() {
        let dir = temp_dir("backoff");
        let path = dir.join("portbridge.toml");

        std::fs::write(&path, "[reconnect]\nmultiplier = 0.5\n").expect("write");
        let err = format!("{:#}", load_config(&path).unwrap_err());
        assert!(err.contains("multiplier"), "{err}");

        std::fs::write(&path, "[reconnect]\nmax_attempts = 0\n").expect("write");
        let err = format!("{:#}", load_config(&path).unwrap_err());
        assert!(err.contains("max_attempts"), "{err}");
    }

    #[test]
    fn explicit_directory_discovers_config() {
        let dir = temp_dir("discover");
        let yaml = dir.join("portbridge.yaml");
        std::fs::write(&yaml, "").expect("write");

        let resolved = resolve_config_path(Some(dir.clone())).unwrap();
        assert_eq!(resolved.source, ConfigPathSource::Flag);
        assert_eq!(resolved.path, yaml);

        let missing = resolve_config_path(Some(dir.join("custom"))).unwrap();
        assert_eq!(missing.path, dir.join("custom.toml"));
    }
}
