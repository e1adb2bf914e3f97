/// Network eligibility checks for the poll cycle.
///
/// Both checks are policy gates, not errors: a failed probe means the cycle
/// is skipped and retried on the next tick.
use std::net::IpAddr;
use std::time::Duration;
use sysinfo::Networks;
use tokio::net::TcpStream;
use tokio::time::timeout;

pub const PROBE_TIMEOUT_SECS: u64 = 5;

/// Probes internet reachability with a bounded TCP connect to the API host.
/// Cheap, and gated on exactly the host the cycle is about to talk to.
pub async fn internet_reachable(base_url: &str) -> bool {
    let Some((host, port)) = probe_target(base_url) else {
        return false;
    };
    matches!(
        timeout(
            Duration::from_secs(PROBE_TIMEOUT_SECS),
            TcpStream::connect((host.as_str(), port)),
        )
        .await,
        Ok(Ok(_))
    )
}

/// True when some active interface currently holds a private-network
/// address. Backs the "restrict to local network" policy.
pub fn on_local_network() -> bool {
    let networks = Networks::new_with_refreshed_list();
    networks
        .iter()
        .any(|(_, data)| data.ip_networks().iter().any(|net| is_private_addr(net.addr)))
}

fn probe_target(base_url: &str) -> Option<(String, u16)> {
    let url = url::Url::parse(base_url).ok()?;
    let host = url.host_str()?.to_string();
    let port = url.port_or_known_default().unwrap_or(443);
    Some((host, port))
}

/// RFC 1918 IPv4 ranges and IPv6 unique-local addresses count as private;
/// loopback and link-local do not.
fn is_private_addr(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => v4.is_private(),
        IpAddr::V6(v6) => (v6.segments()[0] & 0xfe00) == 0xfc00,
    }
}
