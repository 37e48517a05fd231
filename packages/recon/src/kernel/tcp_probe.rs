//! TCP connect probes used outside of tests.
//!
//! Scanning connects to every (address, port) pair with a per-attempt
//! timeout and reports the ports that accept. Discovery treats a host as
//! live when any liveness port either accepts or actively refuses, since a
//! refusal still proves something answered. Both stop between attempts
//! once their token is cancelled.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use ipnetwork::IpNetwork;
use std::io::ErrorKind;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::traits::{BaseDiscoveryProbe, BaseScanProbe, ProbeError, ScanOptions};
use crate::domains::discovery::models::{DiscoveredHost, DiscoveryMethod};
use crate::domains::scans::models::PortScanResult;
use crate::domains::scans::ScanTarget;

/// Upper bound on addresses expanded from one network.
const MAX_EXPANDED_HOSTS: usize = 65_536;

#[derive(Debug, Clone)]
pub struct TcpProbeConfig {
    pub connect_timeout: Duration,
    /// Concurrent connection attempts per probe invocation.
    pub concurrency: usize,
    /// Ports tried when sweeping for live hosts.
    pub liveness_ports: Vec<u16>,
}

impl Default for TcpProbeConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(1000),
            concurrency: 256,
            liveness_ports: vec![22, 80, 135, 443, 445, 3389, 8080],
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TcpConnectProbe {
    config: TcpProbeConfig,
}

impl TcpConnectProbe {
    pub fn new(config: TcpProbeConfig) -> Self {
        Self { config }
    }
}

/// Usable host addresses of `network`; IPv4 network and broadcast
/// addresses are skipped for prefixes shorter than /31.
fn expand_network(network: IpNetwork) -> Vec<IpAddr> {
    let skip_edges = matches!(network, IpNetwork::V4(v4) if v4.prefix() < 31);
    network
        .iter()
        .filter(|ip| !skip_edges || (*ip != network.network() && *ip != network.broadcast()))
        .take(MAX_EXPANDED_HOSTS)
        .collect()
}

async fn resolve(target: &str) -> Result<Vec<(IpAddr, Option<String>)>, ProbeError> {
    let target = ScanTarget::parse(target).map_err(|e| ProbeError::failed(e.to_string()))?;
    match target {
        ScanTarget::Address(ip) => Ok(vec![(ip, None)]),
        ScanTarget::Network(network) => Ok(expand_network(network)
            .into_iter()
            .map(|ip| (ip, None))
            .collect()),
        ScanTarget::Hostname(name) => {
            let first = tokio::net::lookup_host((name.as_str(), 0))
                .await
                .map_err(|e| ProbeError::failed(format!("could not resolve {}: {}", name, e)))?
                .next();
            match first {
                Some(addr) => Ok(vec![(addr.ip(), Some(name))]),
                None => Err(ProbeError::failed(format!("{} has no addresses", name))),
            }
        }
    }
}

#[async_trait]
impl BaseScanProbe for TcpConnectProbe {
    async fn execute(
        &self,
        cancel: CancellationToken,
        targets: &[String],
        options: &ScanOptions,
    ) -> Result<Vec<PortScanResult>, ProbeError> {
        if options.scan_type != "connect" {
            debug!(scan_type = %options.scan_type, "running as a TCP connect scan");
        }

        let mut endpoints = Vec::new();
        for target in targets {
            if cancel.is_cancelled() {
                return Err(ProbeError::Cancelled { partial: 0 });
            }
            endpoints.extend(resolve(target).await?);
        }

        let connect_timeout = self.config.connect_timeout;
        let mut attempts: Vec<(IpAddr, Option<String>, u16)> =
            Vec::with_capacity(endpoints.len() * options.ports.len());
        for (ip, hostname) in endpoints {
            for port in &options.ports {
                attempts.push((ip, hostname.clone(), *port));
            }
        }
        let mut attempts = stream::iter(attempts)
            .map(move |(ip, hostname, port)| async move {
                let open = matches!(
                    timeout(connect_timeout, TcpStream::connect((ip, port))).await,
                    Ok(Ok(_))
                );
                (ip, hostname, port, open)
            })
            .buffer_unordered(self.config.concurrency.max(1));

        let mut results = Vec::new();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(ProbeError::Cancelled { partial: results.len() });
                }
                next = attempts.next() => match next {
                    Some((ip, hostname, port, true)) => {
                        let mut result = PortScanResult::builder().ip(ip).port(port).build();
                        result.hostname = hostname;
                        results.push(result);
                    }
                    Some(_) => {}
                    None => break,
                },
            }
        }

        results.sort_by(|a, b| (a.ip, a.port).cmp(&(b.ip, b.port)));
        Ok(results)
    }
}

#[async_trait]
impl BaseDiscoveryProbe for TcpConnectProbe {
    async fn discover(
        &self,
        cancel: CancellationToken,
        network: IpNetwork,
        method: DiscoveryMethod,
    ) -> Result<Vec<DiscoveredHost>, ProbeError> {
        if method != DiscoveryMethod::Tcp {
            debug!(%method, "no raw socket access, sweeping with TCP connects");
        }

        let connect_timeout = self.config.connect_timeout;
        let ports: Arc<[u16]> = self.config.liveness_ports.clone().into();
        let mut sweeps = stream::iter(expand_network(network))
            .map(move |ip| {
                let ports = ports.clone();
                async move {
                    for port in ports.iter() {
                        let started = Instant::now();
                        let answered = match timeout(connect_timeout, TcpStream::connect((ip, *port))).await {
                            Ok(Ok(_)) => true,
                            Ok(Err(e)) => e.kind() == ErrorKind::ConnectionRefused,
                            Err(_) => false,
                        };
                        if answered {
                            let elapsed = started.elapsed().as_millis().min(i32::MAX as u128) as i32;
                            return Some(
                                DiscoveredHost::builder()
                                    .ip(ip)
                                    .response_time_ms(elapsed)
                                    .build(),
                            );
                        }
                    }
                    None
                }
            })
            .buffer_unordered(self.config.concurrency.max(1));

        let mut live = Vec::new();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(ProbeError::Cancelled { partial: live.len() });
                }
                next = sweeps.next() => match next {
                    Some(Some(host)) => live.push(host),
                    Some(None) => {}
                    None => break,
                },
            }
        }

        live.sort_by_key(|h| h.ip);
        Ok(live)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn probe() -> TcpConnectProbe {
        TcpConnectProbe::new(TcpProbeConfig {
            connect_timeout: Duration::from_millis(500),
            concurrency: 8,
            liveness_ports: Vec::new(),
        })
    }

    fn options(ports: Vec<u16>) -> ScanOptions {
        ScanOptions {
            ports,
            scan_type: "connect".to_string(),
            profile_id: None,
        }
    }

    #[test]
    fn expansion_skips_network_and_broadcast() {
        let hosts = expand_network("10.1.2.0/30".parse().unwrap());
        assert_eq!(
            hosts,
            vec!["10.1.2.1".parse::<IpAddr>().unwrap(), "10.1.2.2".parse().unwrap()]
        );

        let single = expand_network("10.1.2.9/32".parse().unwrap());
        assert_eq!(single, vec!["10.1.2.9".parse::<IpAddr>().unwrap()]);
    }

    #[tokio::test]
    async fn reports_only_accepting_ports() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open = listener.local_addr().unwrap().port();
        let closed = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };

        let results = probe()
            .execute(
                CancellationToken::new(),
                &["127.0.0.1".to_string()],
                &options(vec![open, closed]),
            )
            .await
            .unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].port, open);
        assert_eq!(results[0].state, "open");
    }

    #[tokio::test]
    async fn hostname_targets_keep_their_name() {
        let resolved = resolve("localhost").await.unwrap();
        assert_eq!(resolved.len(), 1);
        assert!(resolved[0].0.is_loopback());
        assert_eq!(resolved[0].1.as_deref(), Some("localhost"));
    }

    #[tokio::test]
    async fn scans_every_port_of_every_expanded_address() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open = listener.local_addr().unwrap().port();

        let results = probe()
            .execute(
                CancellationToken::new(),
                &["127.0.0.1/32".to_string(), "127.0.0.1".to_string()],
                &options(vec![open]),
            )
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.port == open && r.hostname.is_none()));
    }

    #[tokio::test]
    async fn cancelled_token_stops_scan() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = probe()
            .execute(cancel, &["127.0.0.1".to_string()], &options(vec![1]))
            .await
            .unwrap_err();
        assert_eq!(err, ProbeError::Cancelled { partial: 0 });
    }

    #[tokio::test]
    async fn invalid_target_fails_probe() {
        let err = probe()
            .execute(CancellationToken::new(), &["not a host!".to_string()], &options(vec![80]))
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::Failed { .. }));
    }

    #[tokio::test]
    async fn discovery_finds_listening_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let probe = TcpConnectProbe::new(TcpProbeConfig {
            liveness_ports: vec![port],
            ..probe().config
        });

        let hosts = probe
            .discover(
                CancellationToken::new(),
                "127.0.0.1/32".parse().unwrap(),
                DiscoveryMethod::Tcp,
            )
            .await
            .unwrap();

        assert_eq!(hosts.len(), 1);
        assert_eq!(hosts[0].ip, "127.0.0.1".parse::<IpAddr>().unwrap());
    }
}
