//! Connection Pair: the per-client task owning exactly one client socket
//! and at most one upstream socket, plus the pending-message-ID map that
//! correlates in-flight search responses back to a cache fingerprint.
//!
//! Per the runtime-model decision (one task per pair instead of a literal
//! single readiness loop), a pair's entire lifetime runs inside one
//! `tokio::spawn`ed future. `AwaitingClient` is "task running, `server` is
//! `None`"; `Connected` is "both sockets live"; `Closing` is "the future
//! returns", at which point `Drop` releases both boxed streams and
//! `PairGuard` decrements the shared active-pair counter.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ldap3_proto::proto::{LdapMsg, LdapOp};
use openssl::ssl::SslConnector;
use tokio::io::AsyncRead;

use crate::cache::{CachedResponse, CacheEntry, Fingerprint, ResponseCache};
use crate::codec::{read_message, write_message};
use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::filters::{apply_in_filters, apply_out_filters, InFilter, OutFilter};
use crate::transport::{dial_upstream, Stream};

/// Reads the next message off `stream`, treating silence longer than
/// `timeout` the same as a closed connection (spec.md §5: the source has
/// no read deadlines at all; this is the supplemental fix).
async fn read_with_timeout<R: AsyncRead + Unpin>(
    stream: &mut R,
    timeout: Duration,
) -> Result<LdapMsg, ProxyError> {
    match tokio::time::timeout(timeout, read_message(stream)).await {
        Ok(Ok(msg)) => Ok(msg),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(ProxyError::IdleTimeout),
    }
}

/// The StartTLS extended operation OID. Always rejected (§4.5).
const STARTTLS_OID: &str = "1.3.6.1.4.1.1466.20037";

/// Decrements the shared active-pair counter when a pair's task ends,
/// regardless of which branch it ended on.
pub struct PairGuard(Arc<AtomicUsize>);

impl PairGuard {
    pub fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for PairGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct ConnectionPair {
    client_addr: SocketAddr,
    client: Box<dyn Stream>,
    server: Option<Box<dyn Stream>>,
    pending_by_msgid: HashMap<i32, Fingerprint>,
    filters_in: Vec<Box<dyn InFilter>>,
    filters_out: Vec<Box<dyn OutFilter>>,
    cache: Arc<ResponseCache>,
    config: ProxyConfig,
    upstream_connector: Option<Arc<SslConnector>>,
    _guard: PairGuard,
}

impl ConnectionPair {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client_addr: SocketAddr,
        client: Box<dyn Stream>,
        filters_in: Vec<Box<dyn InFilter>>,
        filters_out: Vec<Box<dyn OutFilter>>,
        cache: Arc<ResponseCache>,
        config: ProxyConfig,
        upstream_connector: Option<Arc<SslConnector>>,
        active_pairs: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            client_addr,
            client,
            server: None,
            pending_by_msgid: HashMap::new(),
            filters_in,
            filters_out,
            cache,
            config,
            upstream_connector,
            _guard: PairGuard::new(active_pairs),
        }
    }

    /// Drives the pair until client EOF, `unbindRequest`, or a fatal error.
    /// Invariant 1 (never a server socket without a client socket) holds
    /// trivially: `server` is only ever populated from inside this loop,
    /// which already owns `client`.
    pub async fn run(mut self) {
        let idle_timeout = Duration::from_secs(self.config.idle_timeout_secs);
        loop {
            let msg = match read_with_timeout(&mut self.client, idle_timeout).await {
                Ok(msg) => msg,
                Err(e) => {
                    tracing::debug!(addr = %self.client_addr, error = %e, "client closed");
                    return;
                }
            };

            if matches!(msg.op, LdapOp::UnbindRequest) {
                tracing::trace!(addr = %self.client_addr, "unbind");
                return;
            }

            if let Err(e) = self.handle_message(msg).await {
                tracing::warn!(addr = %self.client_addr, error = %e, "pair closing on error");
                return;
            }
        }
    }

    async fn handle_message(&mut self, mut msg: LdapMsg) -> Result<(), ProxyError> {
        apply_in_filters(&mut self.filters_in, &mut msg, self.config.filtervalidate)?;

        if let LdapOp::ExtendedRequest(ref ler) = msg.op {
            if ler.name == STARTTLS_OID {
                tracing::event!(
                    tracing::Level::ERROR,
                    addr = %self.client_addr,
                    "StartTLS requested, rejecting and closing pair"
                );
                return Err(ProxyError::UnsupportedExtended(STARTTLS_OID.to_string()));
            }
        }

        let is_search = matches!(msg.op, LdapOp::SearchRequest(_));
        let is_bind = matches!(msg.op, LdapOp::BindRequest(_));

        if is_search && !is_bind && self.config.usecache {
            return self.handle_search_cached(msg).await;
        }

        self.forward_one(msg).await
    }

    async fn ensure_upstream(&mut self) -> Result<(), ProxyError> {
        if self.server.is_some() {
            return Ok(());
        }
        let connector = self.upstream_connector.as_deref();
        let stream = dial_upstream(self.config.upstream_ldap, connector).await?;
        self.server = Some(stream);
        Ok(())
    }

    /// Request path + response path of §4.4 for a non-bind `searchRequest`.
    async fn handle_search_cached(&mut self, msg: LdapMsg) -> Result<(), ProxyError> {
        let LdapOp::SearchRequest(ref sr) = msg.op else {
            unreachable!("caller only dispatches SearchRequest here");
        };
        let fingerprint = Fingerprint::of(sr);
        let msgid = msg.msgid;

        if let Some(entry) = self.cache.get(fingerprint).await {
            if entry.completed {
                self.replay(msgid, &entry).await?;
                return Ok(());
            }
            // In-flight, not yet completed: still forward (coalescing is a
            // non-goal), and register the pending mapping so the response
            // path can append our copy too.
            self.pending_by_msgid.insert(msgid, fingerprint);
            self.ensure_upstream().await?;
            return self.forward_and_track(msg, fingerprint).await;
        }

        self.cache
            .set(fingerprint, CacheEntry::new(sr.clone()))
            .await;
        self.pending_by_msgid.insert(msgid, fingerprint);
        self.ensure_upstream().await?;
        self.forward_and_track(msg, fingerprint).await
    }

    /// Replays a completed cache entry to the client with `messageID`
    /// rewritten to the requester's own ID (§8 scenario 3 / invariant 4).
    async fn replay(&mut self, msgid: i32, entry: &CacheEntry) -> Result<(), ProxyError> {
        for response in &entry.responses {
            let (op, ctrl) = match response.clone() {
                CachedResponse::Entry(e, ctrl) => (LdapOp::SearchResultEntry(e), ctrl),
                CachedResponse::Reference(uris, ctrl) => (LdapOp::SearchResultReference(uris), ctrl),
            };
            let out = LdapMsg { msgid, op, ctrl };
            write_message(&mut self.client, out).await?;
        }
        if let Some((result, ctrl)) = entry.result.clone() {
            let out = LdapMsg {
                msgid,
                op: LdapOp::SearchResultDone(result),
                ctrl,
            };
            write_message(&mut self.client, out).await?;
        }
        Ok(())
    }

    /// Forwards a search request upstream, then relays every response back
    /// to the client, tracking cacheable partials via `pending_by_msgid`.
    async fn forward_and_track(
        &mut self,
        msg: LdapMsg,
        fingerprint: Fingerprint,
    ) -> Result<(), ProxyError> {
        let idle_timeout = Duration::from_secs(self.config.idle_timeout_secs);
        let server = self.server.as_mut().expect("ensure_upstream ran");
        write_message(server, msg).await?;

        loop {
            let mut resp = read_with_timeout(server, idle_timeout).await?;
            apply_out_filter_to_response(&mut self.filters_out, &mut resp, self.config.filtervalidate)?;

            let done = matches!(resp.op, LdapOp::SearchResultDone(_));

            if self.pending_by_msgid.contains_key(&resp.msgid) {
                match &resp.op {
                    LdapOp::SearchResultEntry(entry) => {
                        self.cache
                            .append(
                                fingerprint,
                                CachedResponse::Entry(entry.clone(), resp.ctrl.clone()),
                            )
                            .await;
                    }
                    LdapOp::SearchResultReference(uris) => {
                        self.cache
                            .append(
                                fingerprint,
                                CachedResponse::Reference(uris.clone(), resp.ctrl.clone()),
                            )
                            .await;
                    }
                    LdapOp::SearchResultDone(result) => {
                        self.cache
                            .complete(fingerprint, result.clone(), resp.ctrl.clone())
                            .await;
                        self.pending_by_msgid.remove(&resp.msgid);
                    }
                    _ => {}
                }
            }

            write_message(&mut self.client, resp).await?;
            if done {
                return Ok(());
            }
        }
    }

    /// Bind and every other non-cached operation: forward the one request
    /// and relay the single response RFC 4511 defines for it. Only search
    /// produces more than one response PDU, and search never reaches this
    /// path. Bind never touches the cache (invariant 3). `abandonRequest`
    /// has no response at all, so it is fire-and-forget.
    async fn forward_one(&mut self, msg: LdapMsg) -> Result<(), ProxyError> {
        self.ensure_upstream().await?;
        let has_response = !matches!(msg.op, LdapOp::AbandonRequest(_));
        let idle_timeout = Duration::from_secs(self.config.idle_timeout_secs);
        let server = self.server.as_mut().expect("ensure_upstream ran");
        write_message(server, msg).await?;

        if !has_response {
            return Ok(());
        }

        let mut resp = read_with_timeout(server, idle_timeout).await?;
        apply_out_filter_to_response(&mut self.filters_out, &mut resp, self.config.filtervalidate)?;
        write_message(&mut self.client, resp).await?;
        Ok(())
    }
}

/// Out-filters only apply to `searchResEntry` (§4.2); every other response
/// passes through unfiltered.
fn apply_out_filter_to_response(
    filters: &mut [Box<dyn OutFilter>],
    resp: &mut LdapMsg,
    validate: bool,
) -> Result<(), ProxyError> {
    if let LdapOp::SearchResultEntry(ref mut entry) = resp.op {
        apply_out_filters(filters, entry, resp.msgid, validate)?;
    }
    Ok(())
}
