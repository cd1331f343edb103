use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Round-robin pool of outbound proxy addresses with passive health
/// marking. An exhausted or empty pool yields `None`, which callers treat
/// as "connect directly".
pub struct ProxyManager {
    endpoints: Vec<ProxyEndpoint>,
    cursor: AtomicUsize,
}

struct ProxyEndpoint {
    url: String,
    healthy: AtomicBool,
}

impl ProxyManager {
    pub fn new(urls: Vec<String>) -> Self {
        Self {
            endpoints: urls
                .into_iter()
                .map(|url| ProxyEndpoint {
                    url,
                    healthy: AtomicBool::new(true),
                })
                .collect(),
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn pick(&self) -> Option<String> {
        if self.endpoints.is_empty() {
            return None;
        }
        for _ in 0..self.endpoints.len() {
            let index = self.cursor.fetch_add(1, Ordering::Relaxed) % self.endpoints.len();
            let endpoint = &self.endpoints[index];
            if endpoint.healthy.load(Ordering::Relaxed) {
                return Some(endpoint.url.clone());
            }
        }
        None
    }

    pub fn report_failure(&self, url: &str) {
        if let Some(endpoint) = self.endpoints.iter().find(|e| e.url == url) {
            endpoint.healthy.store(false, Ordering::Relaxed);
        }
    }

    pub fn report_success(&self, url: &str) {
        if let Some(endpoint) = self.endpoints.iter().find(|e| e.url == url) {
            endpoint.healthy.store(true, Ordering::Relaxed);
        }
    }
}
