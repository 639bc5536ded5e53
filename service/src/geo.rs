//! IP address to country resolution with caching.
//!
//! Lookups run on their own task so a slow geolocation service never delays
//! a poll. The tracker fires requests with `GeoHandle::request` and later
//! drains `GeoResolution` messages; nothing waits on the network inline.

use crate::config::GeoSettings;
use crate::stop_requested;
use async_trait::async_trait;
use log::{debug, info, warn};
use serde::Deserialize;
use shared::PlayerId;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv6Addr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub const LOCAL_NETWORK: &str = "Local network";
pub const UNKNOWN_LOCATION: &str = "Unknown location";

/// Answer from a geolocation backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GeoAnswer {
    Country(String),
    /// The service knows the address and has no country for it.
    NoCountry,
    /// Rate limited, unreachable or malformed reply. Worth asking again later.
    Unavailable(String),
}

#[async_trait]
pub trait GeoLookup: Send + Sync {
    async fn lookup(&self, ip: IpAddr) -> GeoAnswer;
}

/// Backend for ip-api style endpoints (`GET {endpoint}/{ip}`).
pub struct IpApiLookup {
    client: reqwest::Client,
    endpoint: String,
}

#[derive(Debug, Deserialize)]
struct IpApiResponse {
    status: String,
    #[serde(default)]
    country: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl IpApiLookup {
    pub fn new(settings: &GeoSettings) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(settings.request_timeout_ms))
            .build()?;
        Ok(Self {
            client,
            endpoint: settings.endpoint.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl GeoLookup for IpApiLookup {
    async fn lookup(&self, ip: IpAddr) -> GeoAnswer {
        let url = format!("{}/{}", self.endpoint, ip);
        let response = match self.client.get(&url).send().await {
            Ok(response) => response,
            Err(e) if e.is_timeout() => return GeoAnswer::Unavailable("timeout".to_string()),
            Err(e) => return GeoAnswer::Unavailable(e.to_string()),
        };

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return GeoAnswer::Unavailable("rate limited".to_string());
        }
        if !status.is_success() {
            return GeoAnswer::Unavailable(format!("HTTP {}", status.as_u16()));
        }

        match response.json::<IpApiResponse>().await {
            Ok(body) => interpret_ip_api(body),
            Err(e) => GeoAnswer::Unavailable(format!("malformed reply: {}", e)),
        }
    }
}

fn interpret_ip_api(body: IpApiResponse) -> GeoAnswer {
    match body.status.as_str() {
        "success" => match body.country.filter(|c| !c.trim().is_empty()) {
            Some(country) => GeoAnswer::Country(country),
            None => GeoAnswer::NoCountry,
        },
        "fail" => {
            debug!(
                "Geolocation refused: {}",
                body.message.as_deref().unwrap_or("no reason given")
            );
            GeoAnswer::NoCountry
        }
        other => GeoAnswer::Unavailable(format!("unexpected status '{}'", other)),
    }
}

/// True for addresses that never leave the local network.
pub fn is_local_address(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback() || v6.is_unspecified() || is_unique_local(&v6) || is_unicast_link_local(&v6)
        }
    }
}

fn is_unique_local(ip: &Ipv6Addr) -> bool {
    (ip.segments()[0] & 0xfe00) == 0xfc00
}

fn is_unicast_link_local(ip: &Ipv6Addr) -> bool {
    (ip.segments()[0] & 0xffc0) == 0xfe80
}

/// A finished lookup for a player. `country` is `None` when the service was
/// unavailable; the tracker asks again on a later poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeoResolution {
    pub player_id: PlayerId,
    pub ip: String,
    pub country: Option<String>,
}

enum GeoRequest {
    Resolve { player_id: PlayerId, ip: String },
    Lookup { ip: String, reply: oneshot::Sender<String> },
}

/// Caching front of a `GeoLookup` backend with a minimum gap between
/// outbound requests.
pub struct GeoCacheResolver {
    backend: Arc<dyn GeoLookup>,
    cache: HashMap<String, String>,
    min_gap: Duration,
    last_request: Option<Instant>,
}

impl GeoCacheResolver {
    pub fn new(backend: Arc<dyn GeoLookup>, min_gap: Duration) -> Self {
        Self {
            backend,
            cache: HashMap::new(),
            min_gap,
            last_request: None,
        }
    }

    /// Country label for `ip`, or `None` when the backend was unavailable.
    ///
    /// Local and unparsable addresses are answered without a request.
    /// Definitive answers are cached; transient failures are not.
    pub async fn resolve(&mut self, ip: &str) -> Option<String> {
        let ip = ip.trim();
        let Ok(addr) = ip.parse::<IpAddr>() else {
            return Some(UNKNOWN_LOCATION.to_string());
        };
        if is_local_address(addr) {
            return Some(LOCAL_NETWORK.to_string());
        }
        if let Some(country) = self.cache.get(ip) {
            return Some(country.clone());
        }

        self.respect_gap().await;
        match self.backend.lookup(addr).await {
            GeoAnswer::Country(country) => {
                debug!("Resolved {} to {}", ip, country);
                self.cache.insert(ip.to_string(), country.clone());
                Some(country)
            }
            GeoAnswer::NoCountry => {
                self.cache.insert(ip.to_string(), UNKNOWN_LOCATION.to_string());
                Some(UNKNOWN_LOCATION.to_string())
            }
            GeoAnswer::Unavailable(reason) => {
                warn!("Geolocation for {} unavailable: {}", ip, reason);
                None
            }
        }
    }

    /// Like `resolve`, with transient failures reported as unknown.
    pub async fn lookup_country(&mut self, ip: &str) -> String {
        self.resolve(ip)
            .await
            .unwrap_or_else(|| UNKNOWN_LOCATION.to_string())
    }

    pub fn cached(&self) -> usize {
        self.cache.len()
    }

    async fn respect_gap(&mut self) {
        if let Some(last) = self.last_request {
            tokio::time::sleep_until(last + self.min_gap).await;
        }
        self.last_request = Some(Instant::now());
    }

    /// Moves the resolver onto its own task.
    pub fn spawn(
        self,
        results: mpsc::Sender<GeoResolution>,
        shutdown: watch::Receiver<bool>,
    ) -> (GeoHandle, JoinHandle<()>) {
        let (requests_tx, requests_rx) = mpsc::channel(128);
        let task = tokio::spawn(self.run(requests_rx, results, shutdown));
        (GeoHandle { requests: requests_tx }, task)
    }

    async fn run(
        mut self,
        mut requests: mpsc::Receiver<GeoRequest>,
        results: mpsc::Sender<GeoResolution>,
        shutdown: watch::Receiver<bool>,
    ) {
        info!("Geolocation resolver started");
        let stop = stop_requested(shutdown);
        tokio::pin!(stop);

        loop {
            tokio::select! {
                request = requests.recv() => match request {
                    Some(GeoRequest::Resolve { player_id, ip }) => {
                        let country = self.resolve(&ip).await;
                        let resolution = GeoResolution { player_id, ip, country };
                        if results.send(resolution).await.is_err() {
                            break;
                        }
                    }
                    Some(GeoRequest::Lookup { ip, reply }) => {
                        let _ = reply.send(self.lookup_country(&ip).await);
                    }
                    None => break,
                },
                _ = &mut stop => break,
            }
        }
        info!("Geolocation resolver stopped ({} addresses cached)", self.cached());
    }
}

#[derive(Debug, Clone)]
pub struct GeoHandle {
    requests: mpsc::Sender<GeoRequest>,
}

impl GeoHandle {
    /// Queues a lookup whose result arrives as a `GeoResolution`. Returns
    /// false when the queue is full or the resolver has stopped.
    pub fn request(&self, player_id: &str, ip: &str) -> bool {
        self.requests
            .try_send(GeoRequest::Resolve {
                player_id: player_id.to_string(),
                ip: ip.to_string(),
            })
            .is_ok()
    }

    pub async fn lookup_country(&self, ip: &str) -> String {
        let (reply, response) = oneshot::channel();
        let request = GeoRequest::Lookup {
            ip: ip.to_string(),
            reply,
        };
        if self.requests.send(request).await.is_err() {
            return UNKNOWN_LOCATION.to_string();
        }
        response
            .await
            .unwrap_or_else(|_| UNKNOWN_LOCATION.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Scripted backend that records which addresses were asked for.
    struct ScriptedLookup {
        answers: Mutex<Vec<GeoAnswer>>,
        asked: Mutex<Vec<(IpAddr, Instant)>>,
    }

    impl ScriptedLookup {
        fn new(answers: Vec<GeoAnswer>) -> Arc<Self> {
            Arc::new(Self {
                answers: Mutex::new(answers),
                asked: Mutex::new(Vec::new()),
            })
        }

        fn asked(&self) -> usize {
            self.asked.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl GeoLookup for ScriptedLookup {
        async fn lookup(&self, ip: IpAddr) -> GeoAnswer {
            self.asked.lock().unwrap().push((ip, Instant::now()));
            let mut answers = self.answers.lock().unwrap();
            if answers.is_empty() {
                GeoAnswer::Unavailable("script exhausted".to_string())
            } else {
                answers.remove(0)
            }
        }
    }

    #[test]
    fn test_local_addresses() {
        for ip in ["10.1.2.3", "192.168.0.10", "172.16.5.5", "127.0.0.1", "169.254.1.1", "::1", "fd00::1", "fe80::1"] {
            assert!(is_local_address(ip.parse().unwrap()), "{} should be local", ip);
        }
        for ip in ["8.8.8.8", "2a00:1450:4001::1"] {
            assert!(!is_local_address(ip.parse().unwrap()), "{} should be public", ip);
        }
    }

    #[test]
    fn test_ip_api_replies() {
        let ok: IpApiResponse =
            serde_json::from_str(r#"{"status":"success","country":"Germany","query":"1.2.3.4"}"#)
                .unwrap();
        assert_eq!(interpret_ip_api(ok), GeoAnswer::Country("Germany".into()));

        let fail: IpApiResponse =
            serde_json::from_str(r#"{"status":"fail","message":"reserved range"}"#).unwrap();
        assert_eq!(interpret_ip_api(fail), GeoAnswer::NoCountry);
    }

    #[tokio::test]
    async fn test_local_and_invalid_need_no_request() {
        let backend = ScriptedLookup::new(vec![]);
        let mut resolver = GeoCacheResolver::new(backend.clone(), Duration::ZERO);

        assert_eq!(resolver.lookup_country("192.168.1.20").await, LOCAL_NETWORK);
        assert_eq!(resolver.lookup_country("").await, UNKNOWN_LOCATION);
        assert_eq!(resolver.lookup_country("not-an-ip").await, UNKNOWN_LOCATION);
        assert_eq!(backend.asked(), 0);
    }

    #[tokio::test]
    async fn test_definitive_answers_are_cached() {
        let backend = ScriptedLookup::new(vec![
            GeoAnswer::Country("Canada".into()),
            GeoAnswer::NoCountry,
        ]);
        let mut resolver = GeoCacheResolver::new(backend.clone(), Duration::ZERO);

        assert_eq!(resolver.lookup_country("24.48.0.1").await, "Canada");
        assert_eq!(resolver.lookup_country("24.48.0.1").await, "Canada");
        assert_eq!(resolver.lookup_country("100.64.0.1").await, UNKNOWN_LOCATION);
        assert_eq!(resolver.lookup_country("100.64.0.1").await, UNKNOWN_LOCATION);
        assert_eq!(backend.asked(), 2);
        assert_eq!(resolver.cached(), 2);
    }

    #[tokio::test]
    async fn test_transient_failures_are_not_cached() {
        let backend = ScriptedLookup::new(vec![
            GeoAnswer::Unavailable("rate limited".into()),
            GeoAnswer::Country("Japan".into()),
        ]);
        let mut resolver = GeoCacheResolver::new(backend.clone(), Duration::ZERO);

        assert_eq!(resolver.resolve("1.1.1.1").await, None);
        assert_eq!(resolver.resolve("1.1.1.1").await, Some("Japan".to_string()));
        assert_eq!(backend.asked(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_requests_are_spaced_out() {
        let backend = ScriptedLookup::new(vec![
            GeoAnswer::Country("A".into()),
            GeoAnswer::Country("B".into()),
            GeoAnswer::Country("C".into()),
        ]);
        let mut resolver = GeoCacheResolver::new(backend.clone(), Duration::from_secs(1));

        resolver.resolve("1.0.0.1").await;
        resolver.resolve("1.0.0.2").await;
        resolver.resolve("1.0.0.3").await;

        let asked = backend.asked.lock().unwrap();
        for pair in asked.windows(2) {
            assert!(pair[1].1 - pair[0].1 >= Duration::from_secs(1));
        }
    }

    #[tokio::test]
    async fn test_spawned_resolver_reports_results() {
        let backend = ScriptedLookup::new(vec![GeoAnswer::Country("Brazil".into())]);
        let resolver = GeoCacheResolver::new(backend, Duration::ZERO);
        let (results_tx, mut results_rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (handle, task) = resolver.spawn(results_tx, shutdown_rx);

        assert!(handle.request("42", "200.1.2.3"));
        let resolution = results_rx.recv().await.unwrap();
        assert_eq!(
            resolution,
            GeoResolution {
                player_id: "42".into(),
                ip: "200.1.2.3".into(),
                country: Some("Brazil".into()),
            }
        );
        assert_eq!(handle.lookup_country("200.1.2.3").await, "Brazil");

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
        assert_eq!(handle.lookup_country("8.8.4.4").await, UNKNOWN_LOCATION);
    }
}
