//! Multi-homed address selection (SPEC_FULL §4.7). Enumerates local
//! interfaces the way the teacher's `discovery::registry::ConsulRegistry::get_local_ip`
//! does (`pnet_datalink::interfaces()` + `ipnetwork::IpNetwork::V4`,
//! skip loopback/link-local), but rather than returning the first match it
//! scores every candidate against the configured coordinators and picks the
//! best one, per this spec's reachability + same-subnet rule.

use ipnetwork::Ipv4Network;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::TcpStream;

#[derive(Debug, Clone)]
pub struct Candidate {
    pub address: Ipv4Addr,
    pub reachable: bool,
    pub same_subnet_as_coordinator: bool,
}

impl Candidate {
    fn score(&self) -> u8 {
        (self.reachable as u8) * 2 + (self.same_subnet_as_coordinator as u8)
    }
}

/// Local non-loopback, non-link-local IPv4 interfaces, mirroring the
/// teacher's fallback scan in `get_local_ip` but collecting all of them
/// instead of returning the first.
pub fn local_ipv4_candidates() -> Vec<Ipv4Addr> {
    let mut found = Vec::new();
    for iface in pnet_datalink::interfaces() {
        for ip in iface.ips {
            if let ipnetwork::IpNetwork::V4(ipv4) = ip {
                let addr = ipv4.ip();
                if !addr.is_loopback() && !addr.is_link_local() && !found.contains(&addr) {
                    found.push(addr);
                }
            }
        }
    }
    found
}

/// Attempts a TCP handshake to `coordinator`, binding the outbound socket to
/// `candidate` first so reachability is measured from that specific
/// interface. Returns `false` on any connect error or timeout.
async fn probe_reachable(candidate: Ipv4Addr, coordinator: SocketAddr, timeout: Duration) -> bool {
    let bind_addr = SocketAddr::new(IpAddr::V4(candidate), 0);
    let attempt = async {
        let socket = match coordinator {
            SocketAddr::V4(_) => tokio::net::TcpSocket::new_v4(),
            SocketAddr::V6(_) => tokio::net::TcpSocket::new_v6(),
        };
        let Ok(socket) = socket else { return false };
        if socket.bind(bind_addr).is_err() {
            return false;
        }
        matches!(
            tokio::time::timeout(timeout, socket.connect(coordinator)).await,
            Ok(Ok(_))
        )
    };
    attempt.await
}

fn same_subnet(candidate: Ipv4Addr, coordinator: Ipv4Addr) -> bool {
    Ipv4Network::new(candidate, 24)
        .map(|net| net.contains(coordinator))
        .unwrap_or(false)
}

/// Picks the best-scoring local interface for the self-NodeInfo address, by
/// probing each candidate against `coordinators` (pre-resolved
/// `host:port` socket addresses). Ties are broken by first-seen order.
pub async fn select_address(
    coordinators: &[SocketAddr],
    probe_timeout: Duration,
) -> Option<Candidate> {
    let candidates = local_ipv4_candidates();
    if candidates.is_empty() {
        return None;
    }

    let mut best: Option<Candidate> = None;
    for candidate in candidates {
        let mut reachable = false;
        let mut same = false;
        for coordinator in coordinators {
            if probe_reachable(candidate, *coordinator, probe_timeout).await {
                reachable = true;
            }
            if let IpAddr::V4(coord_ip) = coordinator.ip() {
                if same_subnet(candidate, coord_ip) {
                    same = true;
                }
            }
        }
        let scored = Candidate {
            address: candidate,
            reachable,
            same_subnet_as_coordinator: same,
        };
        if best.as_ref().map(|b| scored.score() > b.score()).unwrap_or(true) {
            best = Some(scored);
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reachable_same_subnet_outscores_unreachable() {
        let a = Candidate {
            address: "10.0.0.5".parse().unwrap(),
            reachable: true,
            same_subnet_as_coordinator: true,
        };
        let b = Candidate {
            address: "192.168.1.5".parse().unwrap(),
            reachable: false,
            same_subnet_as_coordinator: false,
        };
        assert!(a.score() > b.score());
    }

    #[test]
    fn reachable_outscores_same_subnet_alone() {
        let reachable_only = Candidate {
            address: "10.0.0.5".parse().unwrap(),
            reachable: true,
            same_subnet_as_coordinator: false,
        };
        let subnet_only = Candidate {
            address: "10.0.0.6".parse().unwrap(),
            reachable: false,
            same_subnet_as_coordinator: true,
        };
        assert!(reachable_only.score() > subnet_only.score());
    }

    #[test]
    fn subnet_check_matches_24_boundary() {
        let coordinator: Ipv4Addr = "10.0.0.1".parse().unwrap();
        assert!(same_subnet("10.0.0.200".parse().unwrap(), coordinator));
        assert!(!same_subnet("10.0.1.200".parse().unwrap(), coordinator));
    }
}
