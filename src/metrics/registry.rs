//! Process-wide metrics registry
//!
//! The registry is created on first use. Creation binds the metrics listener
//! and starts serving it on a dedicated thread for the rest of the process.

use std::collections::BTreeSet;
use std::net::{SocketAddr, TcpListener};
use std::sync::OnceLock;
use std::thread;

use parking_lot::Mutex;
use prometheus::core::Collector;
use prometheus::{Encoder, Registry, TextEncoder};
use tracing::{error, info};

use super::server;
use crate::config::DEFAULT_METRICS_BIND;
use crate::error::{Error, Result};

static INSTANCE: OnceLock<MetricsRegistry> = OnceLock::new();

/// Registry of metric collectors plus the endpoint exposing them
pub struct MetricsRegistry {
    registry: Registry,
    local_addr: SocketAddr,
    registered: Mutex<BTreeSet<String>>,
}

impl MetricsRegistry {
    /// Get the registry, binding to `BACKUP_METRICBIND` (default `:8080`) on first use
    pub fn instance() -> &'static MetricsRegistry {
        INSTANCE.get_or_init(|| {
            let bind = std::env::var("BACKUP_METRICBIND")
                .unwrap_or_else(|_| DEFAULT_METRICS_BIND.to_string());
            Self::start(&bind)
        })
    }

    /// Get the registry, binding to `bind` if this call creates it
    ///
    /// Concurrent first callers block until creation finishes and all receive
    /// the same instance; `bind` of the losing callers is ignored.
    pub fn init(bind: &str) -> &'static MetricsRegistry {
        INSTANCE.get_or_init(|| Self::start(bind))
    }

    fn start(bind: &str) -> Self {
        let addr = parse_bind_address(bind).unwrap_or_else(|e| fatal(&e.to_string()));

        let listener = TcpListener::bind(addr)
            .and_then(|listener| {
                listener.set_nonblocking(true)?;
                Ok(listener)
            })
            .unwrap_or_else(|e| fatal(&format!("Failed to bind metrics endpoint {}: {}", addr, e)));

        let local_addr = listener
            .local_addr()
            .unwrap_or_else(|e| fatal(&format!("Failed to read metrics endpoint address: {}", e)));

        // The default registry carries the process collector on Linux
        let registry = prometheus::default_registry().clone();

        info!(address = %local_addr, "Starting prometheus endpoint");

        let serving = registry.clone();
        thread::Builder::new()
            .name("metrics-endpoint".to_string())
            .spawn(move || {
                if let Err(e) = server::run(listener, serving) {
                    fatal(&format!("Metrics endpoint stopped: {}", e));
                }
            })
            .unwrap_or_else(|e| fatal(&format!("Failed to start metrics endpoint: {}", e)));

        Self {
            registry,
            local_addr,
            registered: Mutex::new(BTreeSet::new()),
        }
    }

    /// Register a collector, terminating the process if it is already registered
    pub fn register(&self, collector: Box<dyn Collector>) {
        if let Err(e) = self.try_register(collector) {
            fatal(&format!("Failed to register metrics collector: {}", e));
        }
    }

    /// Register a collector, reporting duplicates as an error
    pub fn try_register(&self, collector: Box<dyn Collector>) -> Result<()> {
        let names: Vec<String> = collector
            .desc()
            .iter()
            .map(|desc| desc.fq_name.clone())
            .collect();

        let mut registered = self.registered.lock();
        self.registry.register(collector)?;
        registered.extend(names);
        Ok(())
    }

    /// Names of the collectors registered through this registry
    pub fn registered(&self) -> Vec<String> {
        self.registered.lock().iter().cloned().collect()
    }

    /// Address the endpoint is listening on
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Render every registered metric in the text exposition format
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| Error::config(e.to_string()))
    }
}

/// Parse a listener address; a bare `:port` binds all interfaces
pub fn parse_bind_address(bind: &str) -> Result<SocketAddr> {
    let bind = bind.trim();
    let full = if bind.starts_with(':') {
        format!("0.0.0.0{}", bind)
    } else {
        bind.to_string()
    };

    full.parse()
        .map_err(|e| Error::config(format!("Invalid metrics bind address '{}': {}", bind, e)))
}

fn fatal(message: &str) -> ! {
    error!("{}", message);
    std::process::exit(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_port_binds_all_interfaces() {
        let addr = parse_bind_address(":8080").unwrap();
        assert_eq!(addr, "0.0.0.0:8080".parse().unwrap());
    }

    #[test]
    fn full_address_is_kept() {
        let addr = parse_bind_address("127.0.0.1:9100").unwrap();
        assert_eq!(addr.port(), 9100);
        assert!(addr.ip().is_loopback());
    }

    #[test]
    fn invalid_address_is_rejected() {
        assert!(parse_bind_address("localhost").is_err());
    }
}
