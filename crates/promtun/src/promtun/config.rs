use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use regex::bytes::{Captures, Regex};
use serde::Deserialize;

use crate::promtun::tunnel::{TunnelSettings, backoff::BackoffConfig, handshake::TOKEN_LEN};

pub const DEFAULT_RESOLVER_URL: &str = "https://gw.coroot.com/promtun/resolve";

/// Values taken from CLI flags or their environment variables.
#[derive(Debug, Clone, Default)]
pub struct StartupArgs {
    pub resolver_url: Option<String>,
    pub project_token: Option<String>,
    pub config_path: Option<PathBuf>,
    pub destination: Option<String>,
    pub settings: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub resolver_url: String,
    /// Hostname of the resolver URL, used as the TLS server name for gateways.
    pub server_name: String,
    pub project_token: String,
    /// Env-expanded contents of the config file, sent to the gateway as is.
    pub payload: Vec<u8>,
    pub destination: Option<String>,
    pub admin_addr: String,
    pub logging: LoggingConfig,
    pub tunnel: TunnelSettings,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "json".into(),
            output: "stderr".into(),
            add_source: false,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    resolver_url: Option<String>,
    destination: Option<String>,
    #[serde(default)]
    admin_addr: String,
    #[serde(default)]
    tls_skip_verify: bool,
    #[serde(default)]
    gateway_messages: bool,
    timeouts: Option<FileTimeouts>,
    backoff: Option<FileBackoff>,
    logging: Option<FileLogging>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileTimeouts {
    connect: Option<String>,
    stream: Option<String>,
    keepalive: Option<String>,
    refresh: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileBackoff {
    factor: Option<f64>,
    min: Option<String>,
    max: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

pub fn load(args: StartupArgs) -> anyhow::Result<Config> {
    let fc = match &args.settings {
        Some(p) => load_settings(p)?,
        None => FileConfig::default(),
    };
    Config::build(args, fc, |k| std::env::var(k).ok())
}

fn load_settings(path: &Path) -> anyhow::Result<FileConfig> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let s = String::from_utf8_lossy(&data);

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    let fc = match ext.as_str() {
        "toml" => toml::from_str(&s).with_context(|| format!("parse toml {}", path.display()))?,
        "yaml" | "yml" => {
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml {}", path.display()))?
        }
        _ => anyhow::bail!(
            "config: unsupported settings extension {:?} (expected .toml or .yaml/.yml)",
            ext
        ),
    };
    Ok(fc)
}

impl Config {
    fn build(
        args: StartupArgs,
        fc: FileConfig,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> anyhow::Result<Config> {
        let project_token = args
            .project_token
            .filter(|t| !t.is_empty())
            .context("config: project token is required")?;
        if project_token.len() != TOKEN_LEN {
            anyhow::bail!(
                "config: invalid project token, expected {TOKEN_LEN} bytes, got {}",
                project_token.len()
            );
        }

        let destination = non_empty(args.destination)
            .or_else(|| non_empty(fc.destination))
            .or_else(|| non_empty(lookup("PROMETHEUS_ADDRESS")));
        let config_path = args.config_path.filter(|p| !p.as_os_str().is_empty());
        if destination.is_none() && config_path.is_none() {
            anyhow::bail!("config: either a destination address or a config path is required");
        }

        let payload = match &config_path {
            Some(p) => {
                let raw = fs::read(p).with_context(|| format!("read {}", p.display()))?;
                expand_env_with(&raw, &lookup)?
            }
            None => Vec::new(),
        };

        let resolver_url = non_empty(args.resolver_url)
            .or_else(|| non_empty(fc.resolver_url))
            .unwrap_or_else(|| DEFAULT_RESOLVER_URL.to_string());
        let url = reqwest::Url::parse(&resolver_url)
            .with_context(|| format!("config: invalid resolver url {resolver_url:?}"))?;
        let server_name = url
            .host_str()
            .filter(|h| !h.is_empty())
            .with_context(|| format!("config: resolver url {resolver_url:?} has no host"))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();

        let timeouts = fc.timeouts.unwrap_or_default();
        let backoff = fc.backoff.unwrap_or_default();
        let defaults = TunnelSettings::default();

        let tunnel = TunnelSettings {
            timeout: duration("timeouts.connect", timeouts.connect, defaults.timeout)?,
            stream_timeout: duration("timeouts.stream", timeouts.stream, defaults.stream_timeout)?,
            keepalive_interval: duration(
                "timeouts.keepalive",
                timeouts.keepalive,
                defaults.keepalive_interval,
            )?,
            refresh_interval: duration(
                "timeouts.refresh",
                timeouts.refresh,
                defaults.refresh_interval,
            )?,
            backoff: BackoffConfig {
                factor: backoff.factor.unwrap_or(defaults.backoff.factor),
                min: duration("backoff.min", backoff.min, defaults.backoff.min)?,
                max: duration("backoff.max", backoff.max, defaults.backoff.max)?,
            },
            tls_skip_verify: fc.tls_skip_verify,
            gateway_messages: fc.gateway_messages,
            version: defaults.version,
        };

        if !(tunnel.backoff.factor.is_finite() && tunnel.backoff.factor >= 1.0) {
            anyhow::bail!(
                "config: backoff.factor must be >= 1, got {}",
                tunnel.backoff.factor
            );
        }
        if tunnel.backoff.min > tunnel.backoff.max {
            anyhow::bail!("config: backoff.min must not exceed backoff.max");
        }

        let mut logging = LoggingConfig::default();
        if let Some(l) = fc.logging {
            if let Some(v) = non_empty(l.level) {
                logging.level = v;
            }
            if let Some(v) = non_empty(l.format) {
                logging.format = v;
            }
            if let Some(v) = non_empty(l.output) {
                logging.output = v;
            }
            logging.add_source = l.add_source;
        }

        Ok(Config {
            resolver_url,
            server_name,
            project_token,
            payload,
            destination,
            admin_addr: fc.admin_addr.trim().to_string(),
            logging,
            tunnel,
        })
    }
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn duration(key: &str, raw: Option<String>, default: Duration) -> anyhow::Result<Duration> {
    let Some(raw) = non_empty(raw) else {
        return Ok(default);
    };
    let d = humantime::parse_duration(&raw)
        .with_context(|| format!("config: invalid duration for {key}: {raw:?}"))?;
    if d.is_zero() {
        anyhow::bail!("config: {key} must be greater than zero");
    }
    Ok(d)
}

/// Replaces `$VAR` and `${VAR}` with values from `lookup`. Unknown variables
/// expand to the empty string. Bytes outside references are kept as is, UTF-8
/// or not.
pub fn expand_env_with(
    s: &[u8],
    lookup: impl Fn(&str) -> Option<String>,
) -> anyhow::Result<Vec<u8>> {
    let re = Regex::new(r"\$\{([^}]*)\}|\$([A-Za-z0-9_]+)")?;
    let out = re.replace_all(s, |caps: &Captures| {
        let name = caps
            .get(1)
            .or_else(|| caps.get(2))
            .map_or(Default::default(), |m| String::from_utf8_lossy(m.as_bytes()));
        lookup(&name).unwrap_or_default().into_bytes()
    });
    Ok(out.into_owned())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    const TOKEN: &str = "b8ea8af6-ffee-44b3-aa9a-1fc02233cfb7";

    fn temp_dir(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        p.push(format!(
            "promtun_cfg_test_{name}_{}_{}",
            std::process::id(),
            now
        ));
        std::fs::create_dir_all(&p).expect("mkdir");
        p
    }

    fn args() -> StartupArgs {
        StartupArgs {
            project_token: Some(TOKEN.into()),
            destination: Some("127.0.0.1:9090".into()),
            ..StartupArgs::default()
        }
    }

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn defaults() {
        let cfg = Config::build(args(), FileConfig::default(), no_env).expect("build");
        assert_eq!(cfg.resolver_url, DEFAULT_RESOLVER_URL);
        assert_eq!(cfg.server_name, "gw.coroot.com");
        assert_eq!(cfg.destination.as_deref(), Some("127.0.0.1:9090"));
        assert!(cfg.payload.is_empty());
        assert!(cfg.admin_addr.is_empty());
        assert_eq!(cfg.tunnel.timeout, Duration::from_secs(10));
        assert_eq!(cfg.tunnel.stream_timeout, Duration::from_secs(300));
        assert_eq!(cfg.tunnel.refresh_interval, Duration::from_secs(600));
        assert_eq!(cfg.tunnel.backoff, BackoffConfig::default());
        assert_eq!(cfg.logging.format, "json");
    }

    #[test]
    fn token_is_required_and_must_be_36_bytes() {
        let mut a = args();
        a.project_token = None;
        let err = Config::build(a, FileConfig::default(), no_env).unwrap_err();
        assert!(err.to_string().contains("project token is required"));

        let mut a = args();
        a.project_token = Some("short".into());
        let err = Config::build(a, FileConfig::default(), no_env).unwrap_err();
        assert!(err.to_string().contains("expected 36 bytes, got 5"), "{err}");
    }

    #[test]
    fn prometheus_address_is_the_last_destination_fallback() {
        let env: HashMap<&str, &str> = [("PROMETHEUS_ADDRESS", "127.0.0.1:9091")].into();
        let lookup = |k: &str| env.get(k).map(|v| v.to_string());

        let mut a = args();
        a.destination = None;
        let cfg = Config::build(a, FileConfig::default(), lookup).expect("build");
        assert_eq!(cfg.destination.as_deref(), Some("127.0.0.1:9091"));

        let fc = FileConfig {
            destination: Some("127.0.0.1:9092".into()),
            ..FileConfig::default()
        };
        let mut a = args();
        a.destination = None;
        let cfg = Config::build(a, fc, lookup).expect("build");
        assert_eq!(cfg.destination.as_deref(), Some("127.0.0.1:9092"));

        let cfg = Config::build(args(), FileConfig::default(), lookup).expect("build");
        assert_eq!(cfg.destination.as_deref(), Some("127.0.0.1:9090"));
    }

    #[test]
    fn destination_or_config_path_is_required() {
        let mut a = args();
        a.destination = None;
        let err = Config::build(a, FileConfig::default(), no_env).unwrap_err();
        assert!(err.to_string().contains("destination address or a config path"));
    }

    #[test]
    fn config_payload_is_env_expanded() {
        let dir = temp_dir("payload");
        let path = dir.join("prometheus.yml");
        std::fs::write(&path, "remote_write:\n  - url: ${REMOTE_URL}/api\n    token: $TOKEN_X\n")
            .expect("write");

        let env: HashMap<&str, &str> = [("REMOTE_URL", "http://vm:8428")].into();
        let mut a = args();
        a.destination = None;
        a.config_path = Some(path);
        let cfg = Config::build(a, FileConfig::default(), |k| env.get(k).map(|v| v.to_string()))
            .expect("build");

        assert_eq!(
            String::from_utf8(cfg.payload).unwrap(),
            "remote_write:\n  - url: http://vm:8428/api\n    token: \n"
        );
        assert!(cfg.destination.is_none());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn config_payload_keeps_non_utf8_bytes() {
        let dir = temp_dir("payload_bytes");
        let path = dir.join("payload.bin");
        std::fs::write(&path, [97, 255, 254, 98]).expect("write");

        let mut a = args();
        a.config_path = Some(path);
        let cfg = Config::build(a, FileConfig::default(), no_env).expect("build");
        assert_eq!(cfg.payload, vec![97, 255, 254, 98]);
    }

    #[test]
    fn unreadable_config_path_is_fatal() {
        let mut a = args();
        a.config_path = Some(PathBuf::from("/nonexistent/promtun/prometheus.yml"));
        assert!(Config::build(a, FileConfig::default(), no_env).is_err());
    }

    #[test]
    fn resolver_url_must_have_a_host() {
        let mut a = args();
        a.resolver_url = Some("not a url".into());
        assert!(Config::build(a, FileConfig::default(), no_env).is_err());

        let mut a = args();
        a.resolver_url = Some("unix:/run/resolver.sock".into());
        let err = Config::build(a, FileConfig::default(), no_env).unwrap_err();
        assert!(err.to_string().contains("has no host"), "{err}");

        let mut a = args();
        a.resolver_url = Some("http://127.0.0.1:8080/promtun/resolve".into());
        let cfg = Config::build(a, FileConfig::default(), no_env).expect("build");
        assert_eq!(cfg.server_name, "127.0.0.1");
    }

    #[test]
    fn settings_file_toml() {
        let dir = temp_dir("toml");
        let path = dir.join("promtun.toml");
        let toml = r#"
resolver_url = "https://gw.example.com/promtun/resolve"
destination = "127.0.0.1:4040"
admin_addr = ":9100"
gateway_messages = true

[timeouts]
connect = "3s"
stream = "1m"

[backoff]
factor = 1.5
min = "1s"
max = "30s"

[logging]
level = "debug"
format = "text"
"#;
        std::fs::write(&path, toml).expect("write");

        let mut a = args();
        a.destination = None;
        let fc = load_settings(&path).expect("load_settings");
        let cfg = Config::build(a, fc, no_env).expect("build");

        assert_eq!(cfg.server_name, "gw.example.com");
        assert_eq!(cfg.destination.as_deref(), Some("127.0.0.1:4040"));
        assert_eq!(cfg.admin_addr, ":9100");
        assert!(cfg.tunnel.gateway_messages);
        assert_eq!(cfg.tunnel.timeout, Duration::from_secs(3));
        assert_eq!(cfg.tunnel.stream_timeout, Duration::from_secs(60));
        assert_eq!(cfg.tunnel.keepalive_interval, Duration::from_secs(1));
        assert_eq!(cfg.tunnel.backoff.factor, 1.5);
        assert_eq!(cfg.tunnel.backoff.max, Duration::from_secs(30));
        assert_eq!(cfg.logging.level, "debug");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn settings_file_yaml_and_cli_precedence() {
        let dir = temp_dir("yaml");
        let path = dir.join("promtun.yaml");
        let yaml = "destination: 127.0.0.1:4040\ntimeouts:\n  refresh: 30s\n";
        std::fs::write(&path, yaml).expect("write");

        let fc = load_settings(&path).expect("load_settings");
        let cfg = Config::build(args(), fc, no_env).expect("build");
        assert_eq!(cfg.destination.as_deref(), Some("127.0.0.1:9090"));
        assert_eq!(cfg.tunnel.refresh_interval, Duration::from_secs(30));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn reject_unknown_settings_fields() {
        let dir = temp_dir("unknown");
        let path = dir.join("promtun.toml");
        std::fs::write(&path, "listen_addr = \":8080\"\n").expect("write");

        let err = load_settings(&path).unwrap_err();
        let msg = format!("{err:#}").to_ascii_lowercase();
        assert!(msg.contains("listen_addr"), "got: {msg}");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn reject_invalid_backoff_and_durations() {
        let bad = [
            "[backoff]\nfactor = 0.5\n",
            "[backoff]\nmin = \"2m\"\nmax = \"1m\"\n",
            "[timeouts]\nconnect = \"0s\"\n",
            "[timeouts]\nstream = \"soon\"\n",
        ];
        for toml in bad {
            let fc: FileConfig = toml::from_str(toml).expect("parse");
            assert!(Config::build(args(), fc, no_env).is_err(), "accepted: {toml}");
        }
    }

    #[test]
    fn expand_env_forms() {
        let env: HashMap<&str, &str> = [("A", "1"), ("B_2", "two")].into();
        let lookup = |k: &str| env.get(k).map(|v| v.to_string());

        assert_eq!(expand_env_with(b"$A-${B_2}", lookup).unwrap(), b"1-two");
        assert_eq!(expand_env_with(b"x${MISSING}y$NOPE", lookup).unwrap(), b"xy");
        assert_eq!(expand_env_with(b"price: 5$", lookup).unwrap(), b"price: 5$");
        assert_eq!(expand_env_with(b"no vars", lookup).unwrap(), b"no vars");
        assert_eq!(
            expand_env_with(b"\xff$A\xfe", lookup).unwrap(),
            b"\xff1\xfe"
        );
    }
}
