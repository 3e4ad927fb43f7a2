//! Client connectors: where to reach a server and how to try.
//!
//! A connector is a value (a list of candidate addresses), not a live
//! connection. Invoking it races every candidate and keeps the first stream
//! to come up, with a fixed per-attempt timeout.

use std::time::Duration;

use tokio::sync::mpsc;

use tablebus_core::{NetworkProvider, Providers, TaskProvider, TimeProvider};

/// Timeout for each individual connection attempt.
const CONNECT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(1);

/// One candidate server endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAddress {
    /// Host name or IP address.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl ServerAddress {
    /// Create a candidate endpoint. Surrounding whitespace in the host is
    /// trimmed.
    pub fn new(host: impl AsRef<str>, port: u16) -> Self {
        Self {
            host: host.as_ref().trim().to_string(),
            port,
        }
    }
}

impl std::fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Expand a team number into the conventional five candidate addresses.
///
/// The fixed-subnet address embeds the team number split into hundreds and
/// remainder; the name-based candidates embed it directly.
pub fn team_addresses(team: u16, port: u16) -> Vec<ServerAddress> {
    vec![
        ServerAddress::new(format!("10.{}.{}.2", team / 100, team % 100), port),
        ServerAddress::new("172.22.11.2", port),
        ServerAddress::new(format!("roboRIO-{team}-FRC.local"), port),
        ServerAddress::new(format!("roboRIO-{team}-FRC.lan"), port),
        ServerAddress::new(format!("roboRIO-{team}-FRC.frc-field.local"), port),
    ]
}

/// Race connection attempts to every target; first success wins.
///
/// Each attempt is bounded by [`CONNECT_ATTEMPT_TIMEOUT`]. Returns the
/// winning stream and the address it connected to, or `None` when every
/// attempt failed or timed out. Losing streams are dropped.
pub(crate) async fn connect_any<P: Providers>(
    providers: &P,
    targets: &[ServerAddress],
) -> Option<(<P::Network as NetworkProvider>::TcpStream, ServerAddress)> {
    let (tx, mut rx) = mpsc::unbounded_channel();

    for target in targets {
        let tx = tx.clone();
        let network = providers.network().clone();
        let time = providers.time().clone();
        let target = target.clone();
        providers.task().spawn_task("connect_attempt", async move {
            let addr = target.to_string();
            let result = time
                .timeout(CONNECT_ATTEMPT_TIMEOUT, network.connect(&addr))
                .await;
            match result {
                Ok(Ok(stream)) => {
                    let _ = tx.send(Some((stream, target)));
                }
                Ok(Err(e)) => {
                    tracing::debug!(addr = %addr, error = %e, "connection attempt failed");
                    let _ = tx.send(None);
                }
                Err(_) => {
                    tracing::debug!(addr = %addr, "connection attempt timed out");
                    let _ = tx.send(None);
                }
            }
        });
    }
    drop(tx);

    for _ in 0..targets.len() {
        match rx.recv().await {
            Some(Some(win)) => return Some(win),
            Some(None) => continue,
            None => break,
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_team_number_expands_to_five_candidates() {
        let addrs = team_addresses(4, 1735);
        let rendered: Vec<String> = addrs.iter().map(|a| a.to_string()).collect();
        assert_eq!(
            rendered,
            vec![
                "10.0.4.2:1735",
                "172.22.11.2:1735",
                "roboRIO-4-FRC.local:1735",
                "roboRIO-4-FRC.lan:1735",
                "roboRIO-4-FRC.frc-field.local:1735",
            ]
        );
    }

    #[test]
    fn test_team_number_splits_hundreds_into_subnet() {
        let addrs = team_addresses(4917, 1735);
        assert_eq!(addrs[0].to_string(), "10.49.17.2:1735");
    }

    #[test]
    fn test_server_address_trims_host() {
        let addr = ServerAddress::new("  example.local ", 1234);
        assert_eq!(addr.host, "example.local");
        assert_eq!(addr.to_string(), "example.local:1234");
    }
}
