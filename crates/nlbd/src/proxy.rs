//! L4 data path.
//!
//! ```text
//! accept ─▶ read prefix ─▶ classify ─▶ blue/green hint ─▶ route ─▶ rate limit
//!        ─▶ connect upstream ─▶ replay prefix ─▶ splice ─▶ release
//! ```
//!
//! The prefix read is bounded by the inspector's scan limit and by the
//! classification timeout. Bytes consumed while classifying are written to
//! the upstream before the bidirectional copy starts. Rate limiting is
//! checked against the routed instance's bucket (`<protocol>:<instance>`)
//! first and the protocol-wide bucket otherwise.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use nlb_api::ApiState;
use nlb_core::Protocol;
use nlb_inspector::{InspectError, ProtocolInspector};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct ProxySettings {
    pub max_inspect_bytes: usize,
    pub classification_timeout: Duration,
    pub connect_timeout: Duration,
    /// Protocol for connections that cannot be classified.
    pub catch_all: Option<Protocol>,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            max_inspect_bytes: ProtocolInspector::max_required_bytes(),
            classification_timeout: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(5),
            catch_all: None,
        }
    }
}

enum Verdict {
    Classified(Protocol),
    Unknown,
    TimedOut,
    /// The client went away before sending anything.
    Closed,
}

pub struct Proxy {
    inspector: ProtocolInspector,
    state: ApiState,
    settings: ProxySettings,
}

impl Proxy {
    pub fn new(state: ApiState, settings: ProxySettings) -> Self {
        Self {
            inspector: ProtocolInspector::new(settings.max_inspect_bytes),
            state,
            settings,
        }
    }

    /// Accept connections until `shutdown` flips. In-flight connections
    /// keep running on their own tasks.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) {
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "listener accepting connections");
        }
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        self.state.metrics.record_accepted();
                        let proxy = Arc::clone(&self);
                        tokio::spawn(async move {
                            if let Err(e) = proxy.handle(stream, peer).await {
                                warn!(%peer, error = %format!("{e:#}"), "connection failed");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                },
                _ = shutdown.changed() => {
                    info!("listener shutting down");
                    break;
                }
            }
        }
    }

    async fn handle(&self, mut client: TcpStream, peer: SocketAddr) -> anyhow::Result<()> {
        let metrics = &self.state.metrics;
        let (verdict, prefix) = self.read_prefix(&mut client).await?;

        let protocol = match verdict {
            Verdict::Classified(protocol) => protocol,
            Verdict::Closed => return Ok(()),
            Verdict::Unknown => {
                metrics.record_unknown_protocol();
                match self.settings.catch_all {
                    Some(protocol) => protocol,
                    None => {
                        debug!(%peer, bytes = prefix.len(), "unknown protocol, closing");
                        return Ok(());
                    }
                }
            }
            Verdict::TimedOut => {
                metrics.record_classification_timeout();
                match self.settings.catch_all {
                    Some(protocol) => protocol,
                    None => {
                        debug!(%peer, bytes = prefix.len(), "classification timed out, closing");
                        return Ok(());
                    }
                }
            }
        };

        // Peer IP as the affinity key keeps a client on one color.
        let version = self.state.rollout.version_for(protocol, &peer.ip());
        let conn = match self
            .state
            .router
            .route_connection_to_version(protocol, version.as_deref())
        {
            Ok(conn) => conn,
            Err(e) => {
                metrics.record_routing_error(protocol);
                warn!(%peer, protocol = %protocol, error = %e, "dropping connection");
                return Ok(());
            }
        };

        // Dropping `conn` on denial releases the slot taken while routing.
        let limited = self
            .state
            .limiter
            .check_target(protocol.as_str(), conn.instance_id(), 1.0);
        if let Err(e) = limited {
            metrics.record_rate_limit(protocol, false);
            debug!(%peer, protocol = %protocol, error = %e, "connection rate limited");
            return Ok(());
        }
        metrics.record_rate_limit(protocol, true);
        metrics.record_routed(protocol);

        let address = conn.address();
        let mut upstream = tokio::time::timeout(
            self.settings.connect_timeout,
            TcpStream::connect(&address),
        )
        .await
        .with_context(|| format!("connect to {address} timed out"))?
        .with_context(|| format!("connect to {address}"))?;
        debug!(
            %peer,
            protocol = %protocol,
            instance_id = %conn.instance_id(),
            %address,
            "proxying"
        );

        upstream
            .write_all(&prefix)
            .await
            .context("replay classified prefix")?;
        match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
            Ok((to_upstream, to_client)) => {
                metrics.record_bytes(protocol, prefix.len() as u64 + to_upstream, to_client);
            }
            Err(e) => {
                metrics.record_bytes(protocol, prefix.len() as u64, 0);
                debug!(%peer, protocol = %protocol, error = %e, "connection reset");
            }
        }
        conn.release();
        Ok(())
    }

    /// Read until the inspector reaches a verdict, the scan limit is hit,
    /// the client closes, or the classification deadline passes.
    async fn read_prefix(&self, client: &mut TcpStream) -> anyhow::Result<(Verdict, Vec<u8>)> {
        let deadline = Instant::now() + self.settings.classification_timeout;
        let mut buf = vec![0u8; self.inspector.scan_limit()];
        let mut filled = 0;

        let verdict = loop {
            let n = match tokio::time::timeout_at(deadline, client.read(&mut buf[filled..])).await {
                Ok(read) => read.context("read connection prefix")?,
                Err(_) => break Verdict::TimedOut,
            };
            if n == 0 {
                break if filled == 0 {
                    Verdict::Closed
                } else {
                    Verdict::Unknown
                };
            }
            filled += n;
            match self.inspector.classify(&buf[..filled]) {
                Ok(c) => break Verdict::Classified(c.protocol),
                Err(InspectError::Incomplete { .. }) => continue,
                Err(InspectError::Unknown) => break Verdict::Unknown,
            }
        };
        buf.truncate(filled);
        Ok((verdict, buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nlb_router::{Registration, Router};

    async fn echo_backend() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = stream.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr
    }

    async fn start_proxy(
        state: ApiState,
        settings: ProxySettings,
    ) -> (SocketAddr, watch::Sender<bool>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = watch::channel(false);
        let proxy = Arc::new(Proxy::new(state, settings));
        tokio::spawn(proxy.serve(listener, rx));
        (addr, tx)
    }

    /// Read until the proxy closes the connection.
    async fn read_to_close(stream: &mut TcpStream) -> Vec<u8> {
        let mut out = Vec::new();
        let _ = stream.read_to_end(&mut out).await;
        out
    }

    const PING: &[u8] = b"*1\r\n$4\r\nPING\r\n";

    #[tokio::test]
    async fn classifies_routes_and_replays_prefix() {
        let backend = echo_backend().await;
        let state = ApiState::new(Router::new());
        state
            .router
            .register_module(Registration::new("r1", Protocol::Redis, &backend.to_string()))
            .unwrap();
        let (addr, _shutdown) = start_proxy(state.clone(), ProxySettings::default()).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(PING).await.unwrap();
        let mut echoed = vec![0u8; PING.len()];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(echoed, PING);

        let counters = state.metrics.counters(Protocol::Redis);
        assert_eq!(counters.routed, 1);
        assert_eq!(counters.rate_limit_allowed, 1);
        assert_eq!(state.metrics.report().connections_accepted, 1);
    }

    #[tokio::test]
    async fn no_backend_closes_and_counts() {
        let state = ApiState::new(Router::new());
        let (addr, _shutdown) = start_proxy(state.clone(), ProxySettings::default()).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(PING).await.unwrap();
        assert!(read_to_close(&mut client).await.is_empty());
        assert_eq!(state.metrics.counters(Protocol::Redis).routing_errors, 1);
    }

    #[tokio::test]
    async fn unknown_protocol_is_dropped_without_catch_all() {
        let state = ApiState::new(Router::new());
        let (addr, _shutdown) = start_proxy(state.clone(), ProxySettings::default()).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"hello there, this is not a known protocol\n")
            .await
            .unwrap();
        assert!(read_to_close(&mut client).await.is_empty());
        assert_eq!(state.metrics.report().classification_unknown, 1);
    }

    #[tokio::test]
    async fn silent_client_goes_to_catch_all_after_timeout() {
        let backend = echo_backend().await;
        let state = ApiState::new(Router::new());
        state
            .router
            .register_module(Registration::new("my1", Protocol::MySql, &backend.to_string()))
            .unwrap();
        let settings = ProxySettings {
            classification_timeout: Duration::from_millis(50),
            catch_all: Some(Protocol::MySql),
            ..Default::default()
        };
        let (addr, _shutdown) = start_proxy(state.clone(), settings).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        client.write_all(b"hi").await.unwrap();
        let mut echoed = [0u8; 2];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"hi");
        assert_eq!(state.metrics.report().classification_timeouts, 1);
        assert_eq!(state.metrics.counters(Protocol::MySql).routed, 1);
    }

    #[tokio::test]
    async fn rate_limited_connection_is_refused() {
        let backend = echo_backend().await;
        let state = ApiState::new(Router::new());
        state
            .router
            .register_module(Registration::new("r1", Protocol::Redis, &backend.to_string()))
            .unwrap();
        state.limiter.add_bucket("redis", 1.0, 0.0).unwrap();
        let (addr, _shutdown) = start_proxy(state.clone(), ProxySettings::default()).await;

        let mut first = TcpStream::connect(addr).await.unwrap();
        first.write_all(PING).await.unwrap();
        let mut echoed = vec![0u8; PING.len()];
        first.read_exact(&mut echoed).await.unwrap();

        let mut second = TcpStream::connect(addr).await.unwrap();
        second.write_all(PING).await.unwrap();
        assert!(read_to_close(&mut second).await.is_empty());

        let counters = state.metrics.counters(Protocol::Redis);
        assert_eq!((counters.rate_limit_allowed, counters.rate_limit_denied), (1, 1));
    }

    #[tokio::test]
    async fn per_instance_bucket_limits_only_that_instance() {
        let backend = echo_backend().await;
        let state = ApiState::new(Router::new());
        state
            .router
            .register_module(Registration::new("r1", Protocol::Redis, &backend.to_string()))
            .unwrap();
        state
            .limiter
            .add_bucket(&nlb_ratelimit::target_key("redis", "r1"), 1.0, 0.0)
            .unwrap();
        let (addr, _shutdown) = start_proxy(state.clone(), ProxySettings::default()).await;

        let mut first = TcpStream::connect(addr).await.unwrap();
        first.write_all(PING).await.unwrap();
        let mut echoed = vec![0u8; PING.len()];
        first.read_exact(&mut echoed).await.unwrap();

        let mut second = TcpStream::connect(addr).await.unwrap();
        second.write_all(PING).await.unwrap();
        assert!(read_to_close(&mut second).await.is_empty());

        let counters = state.metrics.counters(Protocol::Redis);
        assert_eq!((counters.rate_limit_allowed, counters.rate_limit_denied), (1, 1));
        assert_eq!(counters.routed, 1);
        let stats = state.limiter.stats("redis:r1").unwrap();
        assert_eq!(stats.denied, 1);
        // The refused connection gave its routing slot back.
        let modules = state.router.list_modules(Some(Protocol::Redis));
        assert_eq!(modules[0].current_connections, 1);
    }

    #[tokio::test]
    async fn green_split_prefers_green_instances() {
        let blue = echo_backend().await;
        let green = echo_backend().await;
        let state = ApiState::new(Router::new());
        for (id, addr, version) in [("b1", blue, "v1"), ("g1", green, "v2")] {
            state
                .router
                .register_module(
                    Registration::new(id, Protocol::Redis, &addr.to_string()).with_version(version),
                )
                .unwrap();
        }
        state
            .rollout
            .initialize_deployment(Protocol::Redis, "v1", "v2")
            .unwrap();
        state
            .rollout
            .instant_switch(Protocol::Redis, nlb_core::Color::Green)
            .unwrap();
        let (addr, _shutdown) = start_proxy(state.clone(), ProxySettings::default()).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(PING).await.unwrap();
        let mut echoed = vec![0u8; PING.len()];
        client.read_exact(&mut echoed).await.unwrap();

        let modules = state.router.list_modules(Some(Protocol::Redis));
        let g1 = modules.iter().find(|m| m.instance_id == "g1").unwrap();
        assert_eq!(g1.total_connections, 1);
    }
}
