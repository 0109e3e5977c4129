//! The transport pool: one shared physical connection per
//! (host, port, signing requirement, local bind), created on miss and
//! evicted on fatal errors.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use crate::context::CifsContext;
use crate::error::Error;
use crate::transport::{Transport, TransportState};

/// Pools [`Transport`]s for reuse across sessions and shares.
///
/// Lookup, insertion and eviction of the pooled set are atomic with
/// respect to each other: the list lock is held across the scan and the
/// acquire, so no caller can observe a transport mid-teardown as reusable.
/// Per-transport state consulted during the scan is atomic, keeping the
/// pool from taking any transport-internal lock while holding its own.
#[derive(Debug, Default)]
pub struct TransportPool {
    connections: Mutex<Vec<Arc<Transport>>>,
    non_pooled: Mutex<Vec<Arc<Transport>>>,
    fail_counts: Mutex<HashMap<String, u32>>,
}

impl TransportPool {
    pub fn new() -> TransportPool {
        TransportPool::default()
    }

    /// Returns an acquired, connected transport for the given endpoint.
    ///
    /// Unless `exclusive` is set, an existing Connected/Connecting
    /// transport matching (host, port, local bind) is reused when its
    /// signing guarantee satisfies `force_signing`. On miss the pool
    /// resolves the host, tries each address ordered by past failure
    /// count, and registers the new transport before connecting so
    /// concurrent callers can share it while the handshake is in flight.
    pub fn get_transport(
        &self,
        ctx: &CifsContext,
        host: &str,
        port: u16,
        exclusive: bool,
        force_signing: bool,
    ) -> crate::Result<Arc<Transport>> {
        let port = if port == 0 { ctx.config().port } else { port };

        self.cleanup();
        log::trace!("Exclusive {exclusive} enforced signing {force_signing}");

        if !exclusive && ctx.config().session_limit != 1 {
            if let Some(existing) = self.find_connection(ctx, host, port, force_signing) {
                log::trace!("Reusing transport connection to {host}:{port}");
                return Ok(existing);
            }
        }

        let mut addrs = ctx.name_resolver().resolve(host)?;
        if addrs.is_empty() {
            return Err(Error::UnknownHost(host.to_string()));
        }
        // Try the addresses that have failed us least, first.
        {
            let counts = self.fail_counts.lock().unwrap_or_else(|e| e.into_inner());
            addrs.sort_by_key(|addr| counts.get(&addr.to_string()).copied().unwrap_or(0));
        }

        let mut last_error = None;
        for addr in addrs {
            log::debug!("Trying address {addr}");
            let transport = Arc::new(Transport::new(
                ctx,
                host,
                SocketAddr::new(addr, port),
                port,
                force_signing,
            ));
            {
                let list = if exclusive {
                    &self.non_pooled
                } else {
                    &self.connections
                };
                list.lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push(transport.clone());
            }

            match transport.ensure_connected() {
                Ok(()) => {
                    log::debug!("New transport connection to {host}:{port} via {addr}");
                    return Ok(transport);
                }
                Err(e) => {
                    self.remove_transport(&transport);
                    transport.release();
                    *self
                        .fail_counts
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .entry(addr.to_string())
                        .or_insert(0) += 1;
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| Error::UnknownHost(host.to_string())))
    }

    fn find_connection(
        &self,
        ctx: &CifsContext,
        host: &str,
        port: u16,
        force_signing: bool,
    ) -> Option<Arc<Transport>> {
        let session_limit = ctx.config().session_limit;
        let connections = self.connections.lock().unwrap_or_else(|e| e.into_inner());

        for transport in connections.iter() {
            if !transport.matches(host, port, ctx.config().local_addr) {
                continue;
            }
            if !matches!(
                transport.state(),
                TransportState::Connected | TransportState::Connecting
            ) {
                continue;
            }
            if force_signing && !transport.signing_enforced() {
                // Signing is required but this connection cannot guarantee it.
                log::trace!("Cannot reuse, signing enforced but not enabled on {host}:{port}");
                continue;
            }
            if !force_signing
                && !ctx.config().signing_enforced
                && transport.signing_enforced()
                && !transport.signing_required_by_server()
            {
                // Do not adopt a client-forced signing connection for
                // purposes that never asked for it.
                log::trace!("Cannot reuse, signing enforced on connection to {host}:{port}");
                continue;
            }
            if session_limit != 0 && transport.session_count() >= session_limit as usize {
                continue;
            }
            return Some(transport.acquire());
        }
        None
    }

    /// Drops dead pool entries: transports nobody holds that have already
    /// disconnected or failed. Live and in-flight connections stay.
    fn cleanup(&self) {
        let keep = |t: &Arc<Transport>| {
            t.in_use()
                || matches!(
                    t.state(),
                    TransportState::Connected | TransportState::Connecting
                )
        };
        self.connections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(keep);
        self.non_pooled
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(keep);
    }

    /// Whether the (non-exclusive) transport is currently pooled.
    pub fn contains(&self, transport: &Arc<Transport>) -> bool {
        self.connections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .any(|t| Arc::ptr_eq(t, transport))
    }

    /// Evicts the transport unconditionally. Used after fatal errors; the
    /// next `get_transport` for the endpoint creates a fresh connection.
    pub fn remove_transport(&self, transport: &Arc<Transport>) {
        log::debug!("Removing transport connection to {}", transport.host());
        self.connections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|t| !Arc::ptr_eq(t, transport));
        self.non_pooled
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|t| !Arc::ptr_eq(t, transport));
    }

    /// Disconnects every pooled transport. Returns whether any of them was
    /// still in use. Idempotent.
    pub fn close(&self) -> bool {
        log::debug!("Closing pool");
        let mut drained: Vec<Arc<Transport>> = {
            let mut connections = self.connections.lock().unwrap_or_else(|e| e.into_inner());
            connections.drain(..).collect()
        };
        {
            let mut non_pooled = self.non_pooled.lock().unwrap_or_else(|e| e.into_inner());
            drained.extend(non_pooled.drain(..));
        }

        let mut in_use = false;
        for transport in drained {
            if transport.in_use() {
                log::warn!(
                    "Transport to {} still in use on pool close",
                    transport.host()
                );
                in_use = true;
            }
            transport.disconnect();
        }
        in_use
    }
}
