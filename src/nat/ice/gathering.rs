// src/nat/ice/gathering.rs
//! Candidate gathering (RFC 5245 Section 4.1.1)
//!
//! One UDP socket is bound per (stream, component, interface address) and
//! yields a host candidate. Unless the agent is local-only, every host
//! socket then asks each STUN server of its address family for a server
//! reflexive mapping, and an optional gateway prober adds port mappings.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::nat::error::{IceError, IceResult};
use crate::nat::gateway::GatewayProber;
use crate::nat::stun::{InboundPacket, Message, SocketId, StunSocket};
use super::agent::IceSocket;
use super::candidate::{Candidate, LocalCandidate, TransportAddress};
use super::config::IceConfig;
use super::priority::interface_local_preference;
use super::utils;

/// Who a socket belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketOwner {
    /// Stream index
    pub stream: usize,
    /// Component id
    pub component: u16,
    /// Index of the socket's host candidate in the stream's local candidates
    pub host: usize,
}

/// Everything gathering produced
pub struct GatheringOutcome {
    /// Local candidates per stream
    pub streams: Vec<Vec<LocalCandidate>>,
    /// Socket table indexed by [`SocketId`]
    pub sockets: Vec<Arc<StunSocket>>,
    /// Owner of each socket, indexed like `sockets`
    pub owners: Vec<SocketOwner>,
    /// Reflexive lookups attempted
    pub probes_total: usize,
    /// Reflexive lookups that failed
    pub probes_failed: usize,
}

/// Gathers local candidates for all streams of an agent
pub struct CandidateGatherer<'a> {
    config: &'a IceConfig,
    prober: Option<Arc<dyn GatewayProber>>,
    sink: mpsc::UnboundedSender<InboundPacket>,
}

impl<'a> CandidateGatherer<'a> {
    /// Gatherer for `config`; socket traffic goes to `sink`
    pub fn new(
        config: &'a IceConfig,
        prober: Option<Arc<dyn GatewayProber>>,
        sink: mpsc::UnboundedSender<InboundPacket>,
    ) -> Self {
        Self { config, prober, sink }
    }

    /// Addresses to bind, best first
    ///
    /// Configured addresses are used as given; otherwise every interface
    /// address that may carry a candidate.
    pub fn host_addresses(&self) -> IceResult<Vec<IpAddr>> {
        if !self.config.host_addresses.is_empty() {
            return Ok(self.config.host_addresses.clone());
        }

        let mut addresses: Vec<IpAddr> = if_addrs::get_if_addrs()?
            .into_iter()
            .map(|iface| iface.ip())
            .filter(utils::is_ice_candidate_address)
            .collect();
        addresses.sort_by_key(|ip| (ip.is_ipv6(), utils::is_private(ip)));
        addresses.dedup();
        Ok(addresses)
    }

    /// Bind a socket per component and collect host and reflexive candidates
    pub async fn gather(&self, streams: &[IceSocket]) -> IceResult<GatheringOutcome> {
        let addresses = self.host_addresses()?;
        if addresses.is_empty() {
            return Err(IceError::Configuration("no usable interface addresses".to_string()));
        }
        info!("Gathering candidates for {} streams on {} addresses", streams.len(), addresses.len());

        let mut outcome = GatheringOutcome {
            streams: Vec::with_capacity(streams.len()),
            sockets: Vec::new(),
            owners: Vec::new(),
            probes_total: 0,
            probes_failed: 0,
        };

        let transaction_config = self.config.transaction_config();
        for (stream, wanted) in streams.iter().enumerate() {
            let mut locals = Vec::new();
            for component in 1..=wanted.components {
                for (index, ip) in addresses.iter().enumerate() {
                    let id: SocketId = outcome.sockets.len();
                    let socket = match StunSocket::bind(
                        id,
                        SocketAddr::new(*ip, 0),
                        transaction_config.clone(),
                        self.sink.clone(),
                    )
                    .await
                    {
                        Ok(socket) => socket,
                        Err(e) => {
                            warn!("Skipping {} for {} component {}: {}", ip, wanted.name, component, e);
                            continue;
                        }
                    };

                    let host = Candidate::new_host(
                        TransportAddress::udp(socket.local_addr()),
                        component,
                        interface_local_preference(index),
                    );
                    debug!("Host candidate {} for {}", host, wanted.name);
                    outcome.owners.push(SocketOwner { stream, component, host: locals.len() });
                    outcome.sockets.push(socket.clone());
                    locals.push(LocalCandidate::new(host, socket));
                }
            }
            outcome.streams.push(locals);
        }

        if !self.config.local_only {
            self.gather_reflexive(&mut outcome).await;
        }

        if outcome.probes_failed > 0 {
            let partial = IceError::GatheringPartial {
                failed: outcome.probes_failed,
                total: outcome.probes_total,
            };
            warn!("{}", partial);
        }

        for (stream, locals) in outcome.streams.iter().enumerate() {
            info!("Stream {} ({}) gathered {} candidates", stream, streams[stream].name, locals.len());
        }
        Ok(outcome)
    }

    async fn resolve_servers(&self, outcome: &mut GatheringOutcome) -> Vec<SocketAddr> {
        let mut servers = Vec::new();
        for server in &self.config.stun_servers {
            match tokio::net::lookup_host(server.as_str()).await {
                Ok(resolved) => servers.extend(resolved),
                Err(e) => {
                    warn!("Cannot resolve STUN server {}: {}", server, e);
                    outcome.probes_total += 1;
                    outcome.probes_failed += 1;
                }
            }
        }
        servers.sort();
        servers.dedup();
        servers
    }

    async fn gather_reflexive(&self, outcome: &mut GatheringOutcome) {
        let servers = self.resolve_servers(outcome).await;

        // (stream, index of host candidate, server or None for the gateway)
        let mut jobs = Vec::new();
        for (stream, locals) in outcome.streams.iter().enumerate() {
            for (index, local) in locals.iter().enumerate() {
                for server in servers.iter().filter(|s| s.is_ipv4() == local.candidate.address.addr.is_ipv4()) {
                    jobs.push((stream, index, Some(*server)));
                }
                if self.prober.is_some() {
                    jobs.push((stream, index, None));
                }
            }
        }
        outcome.probes_total += jobs.len();

        let limit = self.config.gather_timeout();
        let probes = jobs.iter().map(|&(stream, index, server)| {
            let local = outcome.streams[stream][index].clone();
            let prober = self.prober.clone();
            async move {
                match server {
                    Some(server) => probe_stun(&local, server, limit).await,
                    None => match prober {
                        Some(prober) => probe_gateway(prober.as_ref(), &local, limit).await,
                        None => Ok(None),
                    },
                }
            }
        });
        let results = join_all(probes).await;

        for (&(stream, index, server), result) in jobs.iter().zip(results) {
            let mapped = match result {
                Ok(Some(mapped)) => mapped,
                Ok(None) => continue,
                Err(e) => {
                    debug!("Reflexive probe failed: {}", e);
                    outcome.probes_failed += 1;
                    continue;
                }
            };

            let base = outcome.streams[stream][index].clone();
            let locals = &mut outcome.streams[stream];
            if mapped == base.candidate.addr()
                || locals.iter().any(|l| l.candidate.addr() == mapped && l.candidate.component_id == base.candidate.component_id)
            {
                continue;
            }

            let source = server.unwrap_or(mapped);
            let srflx = Candidate::new_server_reflexive(
                mapped,
                &base.candidate,
                &source,
                super::priority::local_preference_of(base.candidate.priority),
            );
            info!("Server reflexive candidate {} (base {})", srflx, base.candidate.address);
            locals.push(LocalCandidate::new(srflx, base.socket.clone()));
        }
    }
}

async fn probe_stun(local: &LocalCandidate, server: SocketAddr, limit: Duration) -> IceResult<Option<SocketAddr>> {
    let request = Message::binding_request();
    let reply = timeout(limit, local.socket.engine().send_request(server, &request, None))
        .await
        .map_err(|_| IceError::Timeout(limit))??;
    Ok(reply.mapped_address())
}

async fn probe_gateway(
    prober: &dyn GatewayProber,
    local: &LocalCandidate,
    limit: Duration,
) -> IceResult<Option<SocketAddr>> {
    let mapped = timeout(limit, prober.probe(local.candidate.addr()))
        .await
        .map_err(|_| IceError::Timeout(limit))??;
    if let Some(mapped) = mapped {
        debug!("{} prober mapped {} -> {}", prober.name(), local.candidate.address, mapped);
    }
    Ok(mapped)
}
