use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;
use url::Url;

use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Server,
    Client,
    Master,
}

impl FromStr for Mode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "server" => Ok(Mode::Server),
            "client" => Ok(Mode::Client),
            "master" => Ok(Mode::Master),
            other => Err(ConfigError::InvalidUrl(format!(
                "unknown scheme {other:?}, expected server|client|master"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsMode {
    Plain,
    SelfSigned,
    FileBacked,
}

impl TlsMode {
    pub fn code(self) -> &'static str {
        match self {
            TlsMode::Plain => "0",
            TlsMode::SelfSigned => "1",
            TlsMode::FileBacked => "2",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "0" => Some(TlsMode::Plain),
            "1" => Some(TlsMode::SelfSigned),
            "2" => Some(TlsMode::FileBacked),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl LogLevel {
    /// `fatal` has no `tracing::Level` equivalent; it maps to `ERROR`,
    /// matching the teacher's own `EnvFilter` construction (there is no
    /// level stricter than error in `tracing`).
    pub fn as_filter_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error | LogLevel::Fatal => "error",
        }
    }
}

impl FromStr for LogLevel {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            "fatal" => Ok(LogLevel::Fatal),
            other => Err(ConfigError::InvalidUrl(format!("unknown log level {other:?}"))),
        }
    }
}

/// Immutable once constructed. One instance per tunnel process.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub mode: Mode,
    /// host:port of the control channel, not yet resolved.
    pub tunnel_address: String,
    /// host:port; server listens there, client dials there. Empty for master.
    pub target_address: String,
    pub tls_mode: TlsMode,
    pub tls_cert_path: Option<String>,
    pub tls_key_path: Option<String>,
    pub log_level: LogLevel,

    pub pool_min: usize,
    pub pool_max: usize,
    pub semaphore_limit: usize,
    pub udp_buf: usize,
    pub udp_read_timeout: Duration,
    pub udp_dial_timeout: Duration,
    pub tcp_dial_timeout: Duration,
    pub tcp_read_timeout: Duration,
    pub pool_interval_min: Duration,
    pub pool_interval_max: Duration,
    pub report_interval: Duration,
    pub service_cooldown: Duration,
    pub shutdown_timeout: Duration,
    pub cert_reload_interval: Duration,
}

impl Default for Defaults {
    fn default() -> Self {
        Defaults {
            pool_min: 4,
            pool_max: 64,
            semaphore_limit: 1024,
            udp_buf: 2048,
            udp_read_timeout: Duration::from_secs(10),
            udp_dial_timeout: Duration::from_secs(5),
            tcp_dial_timeout: Duration::from_secs(5),
            tcp_read_timeout: Duration::from_secs(0),
            pool_interval_min: Duration::from_millis(100),
            pool_interval_max: Duration::from_secs(5),
            report_interval: Duration::from_secs(5),
            service_cooldown: Duration::from_secs(3),
            shutdown_timeout: Duration::from_secs(5),
            cert_reload_interval: Duration::from_secs(3600),
        }
    }
}

pub(crate) struct Defaults {
    pub pool_min: usize,
    pub pool_max: usize,
    pub semaphore_limit: usize,
    pub udp_buf: usize,
    pub udp_read_timeout: Duration,
    pub udp_dial_timeout: Duration,
    pub tcp_dial_timeout: Duration,
    pub tcp_read_timeout: Duration,
    pub pool_interval_min: Duration,
    pub pool_interval_max: Duration,
    pub report_interval: Duration,
    pub service_cooldown: Duration,
    pub shutdown_timeout: Duration,
    pub cert_reload_interval: Duration,
}

impl TunnelConfig {
    /// Parses `scheme://[user:pass@]host:port/[targetHost]:port?k=v&...`.
    ///
    /// Only the tunnel address is resolved eagerly, and only far enough to
    /// validate the URL shape; actual DNS resolution happens on first use
    /// (`resolve_tunnel_address`/`resolve_target_tcp`/`resolve_target_udp`)
    /// so that transient target-side DNS failures aren't fatal at startup.
    pub fn from_url(raw: &str) -> Result<Self, ConfigError> {
        let url = Url::parse(raw).map_err(|e| ConfigError::InvalidUrl(e.to_string()))?;
        let mode: Mode = url.scheme().parse()?;

        let host = url
            .host_str()
            .ok_or_else(|| ConfigError::InvalidUrl("missing host".into()))?;
        let port = url
            .port()
            .ok_or_else(|| ConfigError::InvalidUrl("missing port".into()))?;
        let tunnel_address = format!("{host}:{port}");

        let target_address = url
            .path()
            .trim_start_matches('/')
            .to_string();

        let query: std::collections::HashMap<String, String> =
            url.query_pairs().into_owned().collect();

        let log_level = match query.get("log") {
            Some(v) => v.parse()?,
            None => LogLevel::Info,
        };

        let tls_mode = match query.get("tls") {
            Some(v) => TlsMode::from_code(v)
                .ok_or_else(|| ConfigError::InvalidUrl(format!("invalid tls mode {v:?}")))?,
            None => TlsMode::Plain,
        };

        let tls_cert_path = query.get("crt").cloned();
        let tls_key_path = query.get("key").cloned();

        if tls_mode == TlsMode::FileBacked && (tls_cert_path.is_none() || tls_key_path.is_none()) {
            return Err(ConfigError::MissingTlsMaterial);
        }

        let d = Defaults::default();
        Ok(TunnelConfig {
            mode,
            tunnel_address,
            target_address,
            tls_mode,
            tls_cert_path,
            tls_key_path,
            log_level,
            pool_min: env_usize("MIN_POOL_CAPACITY", d.pool_min),
            pool_max: env_usize("MAX_POOL_CAPACITY", d.pool_max),
            semaphore_limit: env_usize("SEMAPHORE_LIMIT", d.semaphore_limit),
            udp_buf: env_usize("UDP_DATA_BUF_SIZE", d.udp_buf),
            udp_read_timeout: env_duration_secs("UDP_READ_TIMEOUT", d.udp_read_timeout),
            udp_dial_timeout: env_duration_secs("UDP_DIAL_TIMEOUT", d.udp_dial_timeout),
            tcp_dial_timeout: env_duration_secs("TCP_DIAL_TIMEOUT", d.tcp_dial_timeout),
            tcp_read_timeout: env_duration_secs("TCP_READ_TIMEOUT", d.tcp_read_timeout),
            pool_interval_min: env_duration_millis("MIN_POOL_INTERVAL", d.pool_interval_min),
            pool_interval_max: env_duration_millis("MAX_POOL_INTERVAL", d.pool_interval_max),
            report_interval: env_duration_secs("REPORT_INTERVAL", d.report_interval),
            service_cooldown: env_duration_secs("SERVICE_COOLDOWN", d.service_cooldown),
            shutdown_timeout: env_duration_secs("SHUTDOWN_TIMEOUT", d.shutdown_timeout),
            cert_reload_interval: env_duration_secs("RELOAD_INTERVAL", d.cert_reload_interval),
        })
    }

    /// Resolves the tunnel (control-channel) address. The only resolution
    /// error that is fatal at config time (§4.1).
    pub async fn resolve_tunnel_address(&self) -> Result<SocketAddr, ConfigError> {
        tokio::net::lookup_host(&self.tunnel_address)
            .await
            .ok()
            .and_then(|mut it| it.next())
            .ok_or_else(|| ConfigError::UnresolvableTunnelAddress(self.tunnel_address.clone()))
    }

    /// Resolves the target address as TCP. Failures are NOT fatal at config
    /// time; callers retry on use (§4.1).
    pub async fn resolve_target_tcp(&self) -> std::io::Result<SocketAddr> {
        tokio::net::lookup_host(&self.target_address)
            .await?
            .next()
            .ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::AddrNotAvailable, "no address resolved")
            })
    }

    /// Same resolution as `resolve_target_tcp`, kept distinct because the
    /// spec draws UDP and TCP target resolution as separate concerns (§4.1)
    /// even though, for our address family, they resolve identically.
    pub async fn resolve_target_udp(&self) -> std::io::Result<SocketAddr> {
        self.resolve_target_tcp().await
    }
}

fn env_usize(name: &str, default: usize) -> usize {
    match env::var(name) {
        Ok(v) => match v.parse::<i64>() {
            Ok(n) if n > 0 => n as usize,
            _ => {
                warn!(env = name, value = %v, "ignoring negative or unparseable override, using default");
                default
            }
        },
        Err(_) => default,
    }
}

fn env_duration_secs(name: &str, default: Duration) -> Duration {
    match env::var(name) {
        Ok(v) => match v.parse::<i64>() {
            Ok(n) if n > 0 => Duration::from_secs(n as u64),
            _ => {
                warn!(env = name, value = %v, "ignoring negative or unparseable override, using default");
                default
            }
        },
        Err(_) => default,
    }
}

fn env_duration_millis(name: &str, default: Duration) -> Duration {
    match env::var(name) {
        Ok(v) => match v.parse::<i64>() {
            Ok(n) if n > 0 => Duration::from_millis(n as u64),
            _ => {
                warn!(env = name, value = %v, "ignoring negative or unparseable override, using default");
                default
            }
        },
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_server_url() {
        let cfg = TunnelConfig::from_url("server://127.0.0.1:10101/127.0.0.1:18080?tls=0").unwrap();
        assert_eq!(cfg.mode, Mode::Server);
        assert_eq!(cfg.tunnel_address, "127.0.0.1:10101");
        assert_eq!(cfg.target_address, "127.0.0.1:18080");
        assert_eq!(cfg.tls_mode, TlsMode::Plain);
        assert_eq!(cfg.log_level, LogLevel::Info);
    }

    #[test]
    fn parses_client_url_with_log() {
        let cfg = TunnelConfig::from_url("client://127.0.0.1:10101/127.0.0.1:28080?log=debug").unwrap();
        assert_eq!(cfg.mode, Mode::Client);
        assert_eq!(cfg.log_level, LogLevel::Debug);
    }

    #[test]
    fn rejects_missing_port() {
        assert!(TunnelConfig::from_url("server://127.0.0.1/127.0.0.1:18080").is_err());
    }

    #[test]
    fn tls_file_backed_requires_cert_and_key() {
        let err = TunnelConfig::from_url("server://127.0.0.1:10101/127.0.0.1:18080?tls=2").unwrap_err();
        assert!(matches!(err, ConfigError::MissingTlsMaterial));
    }

    #[test]
    fn negative_env_override_falls_back_to_default() {
        std::env::set_var("MIN_POOL_CAPACITY", "-5");
        let cfg = TunnelConfig::from_url("server://127.0.0.1:10102/127.0.0.1:18081").unwrap();
        assert_eq!(cfg.pool_min, Defaults::default().pool_min);
        std::env::remove_var("MIN_POOL_CAPACITY");
    }
}
