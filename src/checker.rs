use hickory_resolver::config::ResolverConfig;
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::TokioResolver;
use serde_json::json;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::config::Config;
use crate::models::{CheckKind, CheckResult};
use crate::report::Reporter;
use crate::store::StatusCache;

pub const DEFAULT_PORT: u16 = 25565;

/// Substrings marking a failure as permanent: the address is malformed or
/// the network will never route to it. Anything else is retried next cycle.
pub const FATAL_SERVER_ERRORS: [&str; 5] = [
    "no such host",
    "no route",
    "unknown port",
    "too many colons in address",
    "invalid argument",
];

pub fn is_fatal(message: &str) -> bool {
    FATAL_SERVER_ERRORS.iter().any(|pattern| message.contains(pattern))
}

/// Runs one check for one address and records the outcome in the status cache.
///
/// Implementations must return without waiting for the check to finish.
pub trait Dispatcher: Send + Sync {
    fn dispatch(&self, address: String, kind: CheckKind);
}

/// Splits `host`, `host:port` or `[v6]:port` into its parts.
pub fn parse_address(address: &str) -> Result<(String, u16), String> {
    let address = address.trim();
    if address.is_empty() {
        return Err("address \"\": missing host (invalid argument)".into());
    }

    let (host, port) = if let Some(rest) = address.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| format!("address {}: missing ']' (invalid argument)", address))?;
        match tail {
            "" => (host, None),
            _ => match tail.strip_prefix(':') {
                Some(port) => (host, Some(port)),
                None => return Err(format!("address {}: unexpected text after ']' (invalid argument)", address)),
            },
        }
    } else {
        match address.matches(':').count() {
            0 => (address, None),
            1 => {
                let (host, port) = address.split_once(':').unwrap_or((address, ""));
                (host, Some(port))
            }
            _ => return Err(format!("address {}: too many colons in address", address)),
        }
    };

    if host.is_empty() {
        return Err(format!("address {}: missing host (invalid argument)", address));
    }

    let port = match port {
        Some(raw) => raw
            .parse::<u16>()
            .ok()
            .filter(|port| *port != 0)
            .ok_or_else(|| format!("address {}: unknown port", address))?,
        None => DEFAULT_PORT,
    };

    Ok((host.to_string(), port))
}

struct Checker {
    cache: StatusCache,
    reporter: Arc<dyn Reporter>,
    resolver: TokioResolver,
    timeout: Duration,
    max_retries: u32,
}

/// Default dispatcher: TCP reachability for ping checks and a UDP query
/// handshake for query checks. At most `max_concurrency` checks touch the
/// network at once; the rest wait for a permit on their own task.
pub struct NetworkDispatcher {
    checker: Arc<Checker>,
    limiter: Arc<Semaphore>,
}

impl NetworkDispatcher {
    pub fn new(config: &Config, cache: StatusCache, reporter: Arc<dyn Reporter>) -> Self {
        let resolver = TokioResolver::builder_with_config(
            ResolverConfig::cloudflare(),
            TokioConnectionProvider::default(),
        )
        .build();

        Self {
            checker: Arc::new(Checker {
                cache,
                reporter,
                resolver,
                timeout: config.check_timeout(),
                max_retries: config.max_retries,
            }),
            limiter: Arc::new(Semaphore::new(config.max_concurrency)),
        }
    }

    pub fn available_permits(&self) -> usize {
        self.limiter.available_permits()
    }
}

impl Dispatcher for NetworkDispatcher {
    fn dispatch(&self, address: String, kind: CheckKind) {
        let checker = Arc::clone(&self.checker);
        let limiter = Arc::clone(&self.limiter);
        tokio::spawn(async move {
            let Ok(_permit) = limiter.acquire_owned().await else {
                return;
            };
            checker.run(address, kind).await;
        });
    }
}

impl Checker {
    async fn run(&self, address: String, kind: CheckKind) {
        let result = match self.check_with_retry(&address, kind).await {
            Ok(payload) => CheckResult::success(&address, kind, payload),
            Err(message) => {
                let fatal = is_fatal(&message);
                if fatal {
                    warn!("{} check for {} failed permanently: {}", kind, address, message);
                } else {
                    debug!("{} check for {} failed: {}", kind, address, message);
                }
                CheckResult::failure(&address, kind, message, fatal)
            }
        };

        if let Err(e) = self.cache.put_result(&result).await {
            self.reporter
                .report(&format!("storing {} result for {}", kind, address), &e);
        }
    }

    async fn check_with_retry(&self, address: &str, kind: CheckKind) -> Result<serde_json::Value, String> {
        let mut last = self.perform_check(address, kind).await;
        for _ in 0..self.max_retries {
            match &last {
                Err(message) if !is_fatal(message) => {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    last = self.perform_check(address, kind).await;
                }
                _ => break,
            }
        }
        last
    }

    async fn perform_check(&self, address: &str, kind: CheckKind) -> Result<serde_json::Value, String> {
        let (host, port) = parse_address(address)?;
        let ip = self.resolve(&host).await?;
        let target = SocketAddr::new(ip, port);

        let latency = match kind {
            CheckKind::Ping => self.check_tcp(target).await?,
            CheckKind::Query => self.check_udp(target).await?,
        };

        Ok(json!({
            "host": host,
            "port": port,
            "ip": ip.to_string(),
            "online": true,
            "latency_ms": latency,
        }))
    }

    async fn check_tcp(&self, target: SocketAddr) -> Result<f64, String> {
        let start = Instant::now();
        match tokio::time::timeout(self.timeout, TcpStream::connect(target)).await {
            Ok(Ok(_)) => Ok(start.elapsed().as_secs_f64() * 1000.0),
            Ok(Err(e)) => Err(describe_io_error("dial", target, &e)),
            Err(_) => Err(format!("dial {}: i/o timeout", target)),
        }
    }

    /// Sends a query handshake and waits for any reply.
    async fn check_udp(&self, target: SocketAddr) -> Result<f64, String> {
        const HANDSHAKE: [u8; 7] = [0xFE, 0xFD, 0x09, 0x00, 0x00, 0x00, 0x01];

        let local: SocketAddr = match target {
            SocketAddr::V4(_) => ([0, 0, 0, 0], 0).into(),
            SocketAddr::V6(_) => (std::net::Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(local)
            .await
            .map_err(|e| format!("local socket error: {}", e))?;
        socket
            .connect(target)
            .await
            .map_err(|e| describe_io_error("dial", target, &e))?;

        let start = Instant::now();
        socket
            .send(&HANDSHAKE)
            .await
            .map_err(|e| describe_io_error("write", target, &e))?;

        let mut buf = [0u8; 64];
        match tokio::time::timeout(self.timeout, socket.recv(&mut buf)).await {
            Ok(Ok(_)) => Ok(start.elapsed().as_secs_f64() * 1000.0),
            Ok(Err(e)) => Err(describe_io_error("read", target, &e)),
            Err(_) => Err(format!("read {}: i/o timeout", target)),
        }
    }

    async fn resolve(&self, host: &str) -> Result<IpAddr, String> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(ip);
        }
        match self.resolver.lookup_ip(host).await {
            Ok(lookup) => lookup
                .iter()
                .next()
                .ok_or_else(|| format!("lookup {}: no such host", host)),
            Err(e) if e.is_no_records_found() => Err(format!("lookup {}: no such host", host)),
            Err(e) => Err(format!("lookup {}: {}", host, e)),
        }
    }
}

fn describe_io_error(op: &str, target: SocketAddr, e: &io::Error) -> String {
    let reason = match e.kind() {
        io::ErrorKind::ConnectionRefused => "connection refused".to_string(),
        io::ErrorKind::HostUnreachable | io::ErrorKind::NetworkUnreachable => "no route to host".to_string(),
        io::ErrorKind::InvalidInput => "invalid argument".to_string(),
        _ => e.to_string(),
    };
    format!("{} {}: {}", op, target, reason)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CheckStatus;
    use crate::report::testing::RecordingReporter;
    use crate::store::MemoryStore;
    use tokio::net::TcpListener;

    fn dispatcher(cache: StatusCache, reporter: Arc<RecordingReporter>) -> NetworkDispatcher {
        let config = Config {
            check_timeout_ms: 500,
            max_retries: 0,
            max_concurrency: 4,
            ..Config::default()
        };
        NetworkDispatcher::new(&config, cache, reporter)
    }

    async fn wait_for(cache: &StatusCache, kind: CheckKind, address: &str) -> CheckResult {
        for _ in 0..200 {
            if let Some(result) = cache.get_result(kind, address).await.unwrap() {
                return result;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no {} result for {}", kind, address);
    }

    #[test]
    fn classifies_permanent_failures() {
        assert!(is_fatal("lookup nowhere.invalid: no such host"));
        assert!(is_fatal("dial 10.0.0.1:25565: no route to host"));
        assert!(is_fatal("address a:b:c: too many colons in address"));
        assert!(!is_fatal("dial 127.0.0.1:25565: connection refused"));
        assert!(!is_fatal("dial 127.0.0.1:25565: i/o timeout"));
    }

    #[test]
    fn parses_addresses() {
        assert_eq!(parse_address("play.example.com").unwrap(), ("play.example.com".into(), 25565));
        assert_eq!(parse_address("play.example.com:25570").unwrap(), ("play.example.com".into(), 25570));
        assert_eq!(parse_address("[::1]:25570").unwrap(), ("::1".into(), 25570));
        assert_eq!(parse_address("[::1]").unwrap(), ("::1".into(), 25565));
    }

    #[test]
    fn malformed_addresses_fail_fatally() {
        for bad in ["a:b:c", "host:notaport", "host:70000", ":25565", "", "[::1"] {
            let err = parse_address(bad).unwrap_err();
            assert!(is_fatal(&err), "{:?} gave non-fatal error {:?}", bad, err);
        }
    }

    #[tokio::test]
    async fn ping_records_success_for_listening_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            while let Ok((_socket, _)) = listener.accept().await {}
        });

        let cache = StatusCache::new(Arc::new(MemoryStore::new()));
        let reporter = Arc::new(RecordingReporter::default());
        dispatcher(cache.clone(), reporter.clone()).dispatch(address.clone(), CheckKind::Ping);

        let result = wait_for(&cache, CheckKind::Ping, &address).await;
        assert_eq!(result.status, CheckStatus::Success);
        assert_eq!(result.payload["online"], true);
        assert_eq!(result.payload["ip"], "127.0.0.1");
        assert!(result.payload["latency_ms"].is_number());
        assert_eq!(reporter.count(), 0);
    }

    #[tokio::test]
    async fn checks_beyond_the_limit_wait_for_a_permit() {
        // Never answers, so the query check holds its permit until timeout.
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let silent_address = silent.local_addr().unwrap().to_string();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let live_address = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            while let Ok((_socket, _)) = listener.accept().await {}
        });

        let config = Config {
            check_timeout_ms: 400,
            max_retries: 0,
            max_concurrency: 1,
            ..Config::default()
        };
        let cache = StatusCache::new(Arc::new(MemoryStore::new()));
        let dispatcher = NetworkDispatcher::new(&config, cache.clone(), Arc::new(RecordingReporter::default()));

        let start = Instant::now();
        dispatcher.dispatch(silent_address.clone(), CheckKind::Query);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(dispatcher.available_permits(), 0);

        let before_second = Instant::now();
        dispatcher.dispatch(live_address.clone(), CheckKind::Ping);
        assert!(before_second.elapsed() < Duration::from_millis(20));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(cache.get_result(CheckKind::Ping, &live_address).await.unwrap().is_none());

        let held = wait_for(&cache, CheckKind::Query, &silent_address).await;
        let queued = wait_for(&cache, CheckKind::Ping, &live_address).await;
        assert_eq!(held.status, CheckStatus::Failure);
        assert_eq!(queued.status, CheckStatus::Success);
        assert!(queued.timestamp >= held.timestamp);
        assert!(start.elapsed() >= Duration::from_millis(400));
        drop(silent);
    }

    #[tokio::test]
    async fn ping_records_transient_failure_for_closed_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let cache = StatusCache::new(Arc::new(MemoryStore::new()));
        dispatcher(cache.clone(), Arc::new(RecordingReporter::default())).dispatch(address.clone(), CheckKind::Ping);

        let result = wait_for(&cache, CheckKind::Ping, &address).await;
        assert_eq!(result.status, CheckStatus::Failure);
        assert!(!result.fatal);
    }

    #[tokio::test]
    async fn query_records_success_when_server_answers() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let address = server.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            while let Ok((_, peer)) = server.recv_from(&mut buf).await {
                let _ = server.send_to(&[0x09, 0, 0, 0, 1, b'1', 0], peer).await;
            }
        });

        let cache = StatusCache::new(Arc::new(MemoryStore::new()));
        dispatcher(cache.clone(), Arc::new(RecordingReporter::default())).dispatch(address.clone(), CheckKind::Query);

        let result = wait_for(&cache, CheckKind::Query, &address).await;
        assert_eq!(result.status, CheckStatus::Success);
    }

    #[tokio::test]
    async fn malformed_address_is_stored_as_fatal() {
        let cache = StatusCache::new(Arc::new(MemoryStore::new()));
        dispatcher(cache.clone(), Arc::new(RecordingReporter::default())).dispatch("a:b:c".into(), CheckKind::Ping);

        let result = wait_for(&cache, CheckKind::Ping, "a:b:c").await;
        assert_eq!(result.status, CheckStatus::Failure);
        assert!(result.fatal);
    }

    #[tokio::test]
    async fn unwritable_cache_is_reported() {
        let store = Arc::new(MemoryStore::new());
        store.set_offline(true);
        let cache = StatusCache::new(store);
        let reporter = Arc::new(RecordingReporter::default());
        let dispatcher = dispatcher(cache, reporter.clone());

        dispatcher.dispatch("a:b:c".into(), CheckKind::Ping);
        for _ in 0..200 {
            if reporter.count() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(reporter.count(), 1);
    }
}
