//! HTTP client construction and outbound proxy rotation

use crate::proxy::models::{Protocol, Proxy};
use crate::Result;
use rand::seq::SliceRandom;
use reqwest::{Client, Proxy as ReqwestProxy};
use std::time::Duration;
use tracing::{debug, warn};

/// Largest number of rotation proxies kept in a pool
pub const MAX_ROTATION_POOL: usize = 256;

/// Desktop user agents rotated across outbound requests
const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.1 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64; rv:121.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/119.0.0.0 Safari/537.36",
];

/// Pick a user agent at random
pub fn random_user_agent() -> &'static str {
    USER_AGENTS
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or(USER_AGENTS[0])
}

/// Build a client with a per-request timeout, optionally forwarding through a proxy
pub fn build_client(timeout: Duration, via: Option<(&Proxy, Protocol)>) -> Result<Client> {
    let mut builder = Client::builder().timeout(timeout);

    builder = match via {
        // Route both http and https targets through the candidate
        Some((proxy, protocol)) => builder.proxy(ReqwestProxy::all(proxy.url(protocol))?),
        // Ignore HTTP_PROXY and friends
        None => builder.no_proxy(),
    };

    Ok(builder.build()?)
}

/// Set of clients a crawl can route its requests through.
///
/// Holds a direct client plus one client per rotation proxy. With an empty
/// pool every pick is the direct client.
pub struct ClientPool {
    direct: Client,
    rotated: Vec<(Proxy, Client)>,
}

impl ClientPool {
    /// Pool that always connects directly
    pub fn direct(timeout: Duration) -> Result<Self> {
        Ok(Self {
            direct: build_client(timeout, None)?,
            rotated: Vec::new(),
        })
    }

    /// Pool routing through a random sample of previously validated HTTP proxies
    pub fn rotating(timeout: Duration, pool: &[Proxy]) -> Result<Self> {
        let direct = build_client(timeout, None)?;

        let sample: Vec<&Proxy> = pool
            .choose_multiple(&mut rand::thread_rng(), MAX_ROTATION_POOL)
            .collect();

        let mut rotated = Vec::with_capacity(sample.len());
        for proxy in sample {
            match build_client(timeout, Some((proxy, Protocol::Http))) {
                Ok(client) => rotated.push((proxy.clone(), client)),
                Err(e) => warn!("Skipping rotation proxy {}: {}", proxy, e),
            }
        }

        debug!("Rotation pool ready with {} proxies", rotated.len());
        Ok(Self { direct, rotated })
    }

    pub fn is_rotating(&self) -> bool {
        !self.rotated.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rotated.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rotated.is_empty()
    }

    /// Client for the next request, with the proxy it routes through if any
    pub fn pick(&self) -> (Option<&Proxy>, &Client) {
        match self.rotated.choose(&mut rand::thread_rng()) {
            Some((proxy, client)) => (Some(proxy), client),
            None => (None, &self.direct),
        }
    }
}
