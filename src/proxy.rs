//! Proxy Core: the accept loop and the housekeeping task that together own
//! every piece of state shared across Connection Pairs.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use openssl::ssl::{SslAcceptor, SslConnector, SslMethod, SslVerifyMode};

use crate::cache::ResponseCache;
use crate::config::{ConfigFile, DebugFlags, ProxyConfig};
use crate::error::ProxyError;
use crate::filters::{build_in_filters, build_out_filters, YamlOverlaySettings};
use crate::pair::ConnectionPair;
use crate::transport::{accept_stream, bind_listener};

/// Everything a freshly accepted pair needs that outlives any single
/// connection. Built once at startup and cloned (cheaply, via `Arc`) into
/// every spawned pair task.
pub struct ProxyShared {
    pub cache: Arc<ResponseCache>,
    pub active_pairs: Arc<AtomicUsize>,
    pub debug: Arc<RwLock<DebugFlags>>,
}

/// Runs the proxy until the process is killed. Returns only on listener
/// bind failure (§6: the one error that is fatal at startup).
pub async fn run(
    config_path: impl Into<std::path::PathBuf>,
    acceptor: Option<SslAcceptor>,
) -> Result<(), ProxyError> {
    let config_path = config_path.into();
    let initial = ConfigFile::load(&config_path)
        .map_err(|e| ProxyError::ListenBindFailed(e.to_string()))?;

    let config = Arc::new(initial.config);
    let shared = ProxyShared {
        cache: Arc::new(ResponseCache::new(config.cacheexpire)),
        active_pairs: Arc::new(AtomicUsize::new(0)),
        debug: Arc::new(RwLock::new(initial.debug)),
    };

    let listener = bind_listener(config.listen).await?;
    tracing::info!(addr = %config.listen, "listening");

    let acceptor = acceptor.map(Arc::new);
    let upstream_connector = if config.upstream_ssl {
        Some(Arc::new(build_upstream_connector(&config)?))
    } else {
        None
    };

    tokio::spawn(housekeeping(
        shared.cache.clone(),
        shared.active_pairs.clone(),
        shared.debug.clone(),
        config_path,
    ));

    loop {
        let (socket, client_addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                continue;
            }
        };

        let acceptor = acceptor.clone();
        let cache = shared.cache.clone();
        let active_pairs = shared.active_pairs.clone();
        let config = config.clone();
        let upstream_connector = upstream_connector.clone();

        tokio::spawn(async move {
            let client = match accept_stream(socket, acceptor.as_deref()).await {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(addr = %client_addr, error = %e, "tls accept failed");
                    return;
                }
            };

            let yaml_settings = config.yaml_dir.as_ref().filter(|_| config.yaml_attributes).map(|dir| YamlOverlaySettings {
                yaml_dir: dir.clone(),
                overlay_prefix: config.overlay_prefix.clone(),
            });
            let filters_in = build_in_filters(&config.infilter_dir);
            let filters_out = build_out_filters(&config.outfilter_dir, yaml_settings.as_ref());

            let pair = ConnectionPair::new(
                client_addr,
                client,
                filters_in,
                filters_out,
                cache,
                (*config).clone(),
                upstream_connector,
                active_pairs,
            );
            pair.run().await;
        });
    }
}

/// Builds the upstream-dialing TLS context once at startup, matching the
/// CA bundle configured in `ldap_ca`.
fn build_upstream_connector(config: &ProxyConfig) -> Result<SslConnector, ProxyError> {
    let ca = config
        .ldap_ca
        .as_ref()
        .ok_or_else(|| ProxyError::UpstreamDialFailed("upstream_ssl requires ldap_ca".to_string()))?;

    let mut builder = SslConnector::builder(SslMethod::tls())
        .map_err(|e| ProxyError::UpstreamDialFailed(e.to_string()))?;
    builder
        .set_ca_file(ca)
        .map_err(|e| ProxyError::UpstreamDialFailed(e.to_string()))?;
    builder.set_verify(SslVerifyMode::PEER);
    Ok(builder.build())
}

/// Every 15s: re-read the config file and hot-swap only `debug` — §4.5 is
/// explicit that `listen`/`ssl`/`upstream_ldap` and every other `config`
/// field require a restart. If no pairs are active, also purge the cache.
async fn housekeeping(
    cache: Arc<ResponseCache>,
    active_pairs: Arc<AtomicUsize>,
    debug: Arc<RwLock<DebugFlags>>,
    config_path: std::path::PathBuf,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(15));
    loop {
        ticker.tick().await;

        match ConfigFile::load(&config_path) {
            Ok(reloaded) => {
                *debug.write().expect("debug lock poisoned") = reloaded.debug;
            }
            Err(e) => {
                tracing::warn!(error = %e, "config reload failed, keeping last-good config");
            }
        }

        if active_pairs.load(Ordering::SeqCst) == 0 {
            cache.purge().await;
        }
    }
}
