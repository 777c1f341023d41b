//! Local port allocation and TCP readiness probing.
//!
//! Ports are found by binding a throwaway listener on `0.0.0.0:<port>` and
//! releasing it straight away. The port is free at the moment of the check
//! only; whoever binds it next (usually the tunnel process) may still lose a
//! race with an unrelated program. No retry happens here.

use crate::errors::{BfhError, Result};
use crate::types::PortRange;
use std::collections::BTreeSet;
use std::net::TcpListener;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tracing::{debug, trace, warn};

/// Whether `port` can currently be bound on all interfaces.
pub fn is_port_available(port: u16) -> bool {
    TcpListener::bind(("0.0.0.0", port)).is_ok()
}

/// Find `count` bindable ports in `range`, lowest first.
///
/// Stateless; use [`PortAllocator`] when several callers in one invocation
/// must not receive the same port.
pub fn find_open_ports(count: usize, range: PortRange) -> Result<Vec<u16>> {
    scan(count, range, |_| false)
}

fn scan(count: usize, range: PortRange, skip: impl Fn(u16) -> bool) -> Result<Vec<u16>> {
    let mut found = Vec::with_capacity(count);
    if count == 0 {
        return Ok(found);
    }
    for port in range.iter() {
        if skip(port) {
            continue;
        }
        if is_port_available(port) {
            trace!(port, "Port is free");
            found.push(port);
            if found.len() == count {
                return Ok(found);
            }
        }
    }
    warn!(
        requested = count,
        found = found.len(),
        range = %range,
        "Not enough free ports"
    );
    Err(BfhError::ResourceExhausted {
        requested: count,
        found: found.len(),
        start: range.start(),
        end: range.end(),
    })
}

/// Per-invocation allocator that never hands out the same port twice.
#[derive(Debug)]
pub struct PortAllocator {
    range: PortRange,
    issued: Mutex<BTreeSet<u16>>,
}

impl PortAllocator {
    pub fn new(range: PortRange) -> Self {
        Self {
            range,
            issued: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn range(&self) -> PortRange {
        self.range
    }

    /// Allocate `count` ports not previously issued by this allocator.
    pub fn allocate(&self, count: usize) -> Result<Vec<u16>> {
        let mut issued = self
            .issued
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let ports = scan(count, self.range, |p| issued.contains(&p))?;
        issued.extend(ports.iter().copied());
        debug!(?ports, "Allocated local ports");
        Ok(ports)
    }

    /// Every port issued so far, ascending.
    pub fn issued(&self) -> Vec<u16> {
        self.issued
            .lock()
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new(PortRange::default())
    }
}

// ── Readiness ───────────────────────────────────────────────────────────

/// Fixed-interval polling with a bounded deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessPolicy {
    /// Pause between connection attempts.
    pub interval: Duration,
    /// Give up once this much time has passed.
    pub timeout: Duration,
    /// Per-attempt connect timeout.
    pub connect_timeout: Duration,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(3),
        }
    }
}

/// Try a single TCP connection.
pub async fn check_connection(host: &str, port: u16, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, TcpStream::connect((host, port))).await,
        Ok(Ok(_))
    )
}

/// Poll `host:port` until it accepts a connection or the policy times out.
pub async fn wait_for_port(host: &str, port: u16, policy: &ReadinessPolicy) -> Result<()> {
    let started = Instant::now();
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        if check_connection(host, port, policy.connect_timeout).await {
            debug!(host, port, attempts, "Endpoint is accepting connections");
            return Ok(());
        }
        if started.elapsed() >= policy.timeout {
            warn!(host, port, attempts, "Endpoint never became ready");
            return Err(BfhError::EndpointUnready {
                host: host.to_string(),
                port,
                after: policy.timeout,
            });
        }
        tokio::time::sleep(policy.interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn occupied_port() -> (TcpListener, u16) {
        let listener = TcpListener::bind(("0.0.0.0", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    fn closed_port() -> u16 {
        let (listener, port) = occupied_port();
        drop(listener);
        port
    }

    #[test]
    fn test_zero_count_is_empty() {
        assert!(find_open_ports(0, PortRange::default()).unwrap().is_empty());
    }

    #[test]
    fn test_exhausted_when_only_port_is_taken() {
        let (_listener, port) = occupied_port();
        let range = PortRange::new(port, port).unwrap();
        let err = find_open_ports(1, range).unwrap_err();
        match err {
            BfhError::ResourceExhausted {
                requested, found, ..
            } => {
                assert_eq!(requested, 1);
                assert_eq!(found, 0);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!is_port_available(port));
    }

    #[test]
    fn test_allocator_never_reissues() {
        let allocator = PortAllocator::new(PortRange::new(41000, 41200).unwrap());
        let first = allocator.allocate(2).unwrap();
        let second = allocator.allocate(2).unwrap();
        assert!(first.iter().all(|p| !second.contains(p)));
        assert_eq!(allocator.issued().len(), 4);
    }

    #[test]
    fn test_allocator_exhausts_after_issuing_whole_range() {
        let port = closed_port();
        let allocator = PortAllocator::new(PortRange::new(port, port).unwrap());
        // Another process may grab the port in between; only assert when the
        // first allocation succeeded.
        if allocator.allocate(1).is_ok() {
            assert!(matches!(
                allocator.allocate(1),
                Err(BfhError::ResourceExhausted { .. })
            ));
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn prop_ports_unique_ascending_in_range(count in 1usize..8) {
            let range = PortRange::new(42000, 42999).unwrap();
            let ports = find_open_ports(count, range).unwrap();
            prop_assert_eq!(ports.len(), count);
            prop_assert!(ports.windows(2).all(|w| w[0] < w[1]));
            prop_assert!(ports.iter().all(|p| range.contains(*p)));
        }
    }

    #[tokio::test]
    async fn test_check_connection_open_and_closed() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(check_connection("127.0.0.1", port, Duration::from_secs(1)).await);
        drop(listener);
        assert!(!check_connection("127.0.0.1", closed_port(), Duration::from_millis(200)).await);
    }

    #[tokio::test]
    async fn test_wait_for_port_succeeds_once_listener_appears() {
        let port = closed_port();
        let server = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            let listener = tokio::net::TcpListener::bind(("127.0.0.1", port)).await.unwrap();
            let _ = listener.accept().await;
        });

        let policy = ReadinessPolicy {
            interval: Duration::from_millis(50),
            timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_millis(200),
        };
        wait_for_port("127.0.0.1", port, &policy).await.unwrap();
        server.abort();
    }

    #[tokio::test]
    async fn test_wait_for_port_times_out() {
        let port = closed_port();
        let policy = ReadinessPolicy {
            interval: Duration::from_millis(20),
            timeout: Duration::from_millis(100),
            connect_timeout: Duration::from_millis(50),
        };
        let err = wait_for_port("127.0.0.1", port, &policy).await.unwrap_err();
        assert!(matches!(err, BfhError::EndpointUnready { port: p, .. } if p == port));
    }
}
