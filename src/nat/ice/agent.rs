// src/nat/ice/agent.rs
//! ICE agent
//!
//! An [`IceAgent`] owns the sockets gathered for its streams and runs three
//! kinds of background work:
//!
//! * a dispatcher answering inbound checks and queueing application data,
//! * a scheduler sending one check every Ta across the running check lists,
//! * a keepalive loop refreshing selected pairs with binding indications.
//!
//! All mutable state sits behind one [`parking_lot::Mutex`] that is never
//! held across an await point; network I/O happens outside of it.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};
use uuid::Uuid;

use crate::nat::error::{IceError, IceResult, StunError};
use crate::nat::gateway::GatewayProber;
use crate::nat::stun::{InboundPacket, Message, MessageType, PacketKind, SocketId, StunSocket, TransactionId};
use super::candidate::{Candidate, CandidateType, TransportAddress};
use super::channel::{Channel, ComponentQueue};
use super::check_list::{CheckList, CheckListState, ComponentState, PairId};
use super::config::IceConfig;
use super::connectivity::{
    self, evaluate_response, resolve_role_conflict, validate_request, CheckOutcome, CheckRequest,
    ConflictResolution, RequestVerdict, ROLE_CONFLICT,
};
use super::events::{EventBus, IceEvent, Subscription};
use super::gathering::{CandidateGatherer, SocketOwner};
use super::nomination::Nominator;
use super::priority::{calculate_prflx_priority, local_preference_of};
use super::sdp::{MediaDescription, SessionDescription};
use super::utils;

/// Agent role (RFC 5245 Section 5.1.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceRole {
    /// Drives nomination and holds the higher tie-breaker in a conflict
    Controlling,
    /// Follows the nominations of the peer
    Controlled,
}

impl IceRole {
    /// The opposite role
    pub fn reverse(self) -> Self {
        match self {
            Self::Controlling => Self::Controlled,
            Self::Controlled => Self::Controlling,
        }
    }

    /// Whether this is [`IceRole::Controlling`]
    pub fn is_controlling(self) -> bool {
        self == Self::Controlling
    }
}

impl fmt::Display for IceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Controlling => "controlling",
            Self::Controlled => "controlled",
        })
    }
}

/// Overall agent status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IceStatus {
    /// Created, checks not started
    NotStarted,
    /// Checks running
    InProgress,
    /// Every component has a selected pair
    Success,
    /// Some component failed or the agent was closed early
    Failed,
}

impl IceStatus {
    /// Success or Failed
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }
}

/// A stream to gather for: a name and its component count
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceSocket {
    /// Stream name, used as the `m=` media token
    pub name: String,
    /// Components in the stream, 1..=256
    pub components: u16,
}

impl IceSocket {
    /// Stream with `components` components
    pub fn new(name: impl Into<String>, components: u16) -> Self {
        Self { name: name.into(), components }
    }
}

/// Selected pair of one component
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedPair {
    /// Stream index
    pub stream: usize,
    /// Component id, starting at 1
    pub component: u16,
    /// Local candidate of the pair
    pub local: Candidate,
    /// Remote candidate of the pair
    pub remote: Candidate,
    /// Pair priority from this agent's point of view
    pub priority: u64,
    /// Round trip of the last successful check
    pub rtt: Option<Duration>,
}

/// Agent-wide counters
#[derive(Debug, Default)]
pub struct AgentStats {
    checks_sent: AtomicU64,
    triggered_checks: AtomicU64,
    use_candidate_checks: AtomicU64,
    checks_succeeded: AtomicU64,
    checks_failed: AtomicU64,
    requests_received: AtomicU64,
    requests_rejected: AtomicU64,
    role_conflicts: AtomicU64,
    role_switches: AtomicU64,
    datagrams_received: AtomicU64,
    keepalives_sent: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Point-in-time copy of [`AgentStats`] plus socket transaction totals
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AgentStatsSnapshot {
    /// Checks handed to the transaction engine
    pub checks_sent: u64,
    /// Of those, checks taken from the triggered queue
    pub triggered_checks: u64,
    /// Checks that carried USE-CANDIDATE
    pub use_candidate_checks: u64,
    /// Checks answered with a success response
    pub checks_succeeded: u64,
    /// Checks that timed out or were answered with an error
    pub checks_failed: u64,
    /// Inbound binding requests
    pub requests_received: u64,
    /// Inbound requests answered with an error
    pub requests_rejected: u64,
    /// Role conflicts detected
    pub role_conflicts: u64,
    /// Role changes caused by conflicts
    pub role_switches: u64,
    /// Application datagrams queued on a channel
    pub datagrams_received: u64,
    /// Application datagrams evicted from full queues
    pub datagrams_dropped: u64,
    /// Binding indications sent on selected pairs
    pub keepalives_sent: u64,
    /// STUN retransmissions across all sockets
    pub retransmissions: u64,
    /// STUN transactions that got no response
    pub transaction_timeouts: u64,
    /// Responses that arrived after their transaction finished
    pub late_responses: u64,
}

#[derive(Debug, Clone)]
struct RemoteParams {
    ufrag: String,
    pwd: String,
    lite: bool,
}

struct StreamState {
    name: String,
    components: u16,
    locals: Vec<Candidate>,
    /// Socket each local candidate sends from, parallel to `locals`
    local_sockets: Vec<SocketId>,
    remotes: Vec<Candidate>,
    check_list: CheckList,
}

impl StreamState {
    fn selected_pair(&self, stream: usize, component: u16) -> Option<SelectedPair> {
        let id = self.check_list.selected(component)?;
        let pair = self.check_list.pair(id);
        Some(SelectedPair {
            stream,
            component,
            local: self.locals[pair.local].clone(),
            remote: self.remotes[pair.remote].clone(),
            priority: pair.priority,
            rtt: pair.rtt,
        })
    }

    fn nomination_event(&self, stream: usize, id: PairId) -> IceEvent {
        let pair = self.check_list.pair(id);
        IceEvent::NominationComplete {
            stream,
            component: pair.component_id,
            local: self.locals[pair.local].addr(),
            remote: self.remotes[pair.remote].addr(),
        }
    }
}

struct InFlightCheck {
    stream: usize,
    pair: PairId,
    generation: u64,
    use_candidate: bool,
    priority: u32,
}

/// A check ready to go on the wire
struct OutgoingCheck {
    tid: TransactionId,
    socket: SocketId,
    dest: SocketAddr,
    data: Bytes,
    remote_pwd: String,
    triggered: bool,
    use_candidate: bool,
}

/// Most authenticated checks remembered while the remote description is missing
const MAX_EARLY_CHECKS: usize = 64;

/// An authenticated check answered before the remote description was set
struct EarlyCheck {
    owner: SocketOwner,
    from: SocketAddr,
    priority: u32,
    use_candidate: bool,
}

struct AgentState {
    role: IceRole,
    tie_breaker: u64,
    /// Bumped on every role switch; results of older checks are ignored
    generation: u64,
    local_ufrag: String,
    local_pwd: String,
    lite: bool,
    remote: Option<RemoteParams>,
    status: IceStatus,
    started: bool,
    closed: bool,
    streams: Vec<StreamState>,
    in_flight: HashMap<TransactionId, InFlightCheck>,
    early_checks: Vec<EarlyCheck>,
}

impl AgentState {
    fn switch_role(&mut self, stats: &AgentStats, events: &mut Vec<IceEvent>) {
        self.role = self.role.reverse();
        self.generation += 1;
        bump(&stats.role_switches);
        info!("Role conflict: switching to {} (tie-breaker {:#x})", self.role, self.tie_breaker);

        let controlling = self.role.is_controlling();
        for stream in &mut self.streams {
            let interrupted = stream.check_list.apply_role_change(&stream.locals, &stream.remotes, controlling);
            if !interrupted.is_empty() {
                debug!("Requeued {} in-flight checks on {}", interrupted.len(), stream.name);
            }
        }
        events.push(IceEvent::RoleChanged { role: self.role });
    }

    /// Pick the next check, round robin over the check lists
    fn next_check(&mut self, cursor: &mut usize, nominator: &Nominator) -> Option<OutgoingCheck> {
        if self.closed || self.status.is_terminal() {
            return None;
        }
        let remote = self.remote.clone()?;
        let count = self.streams.len();

        for offset in 0..count {
            let index = (*cursor + offset) % count;
            let stream = &mut self.streams[index];
            let Some(scheduled) = stream.check_list.next_check() else { continue };
            *cursor = index + 1;

            let pair = stream.check_list.pair(scheduled.pair);
            let local = &stream.locals[pair.local];
            let socket = stream.local_sockets[pair.local];
            let dest = stream.remotes[pair.remote].addr();
            let priority = calculate_prflx_priority(local_preference_of(local.priority), pair.component_id);
            let use_candidate = self.role.is_controlling() && nominator.use_candidate(scheduled.nominate);

            let tid = loop {
                let tid = TransactionId::new();
                if !self.in_flight.contains_key(&tid) {
                    break tid;
                }
            };
            let request = CheckRequest {
                local_ufrag: &self.local_ufrag,
                remote_ufrag: &remote.ufrag,
                remote_pwd: &remote.pwd,
                priority,
                role: self.role,
                tie_breaker: self.tie_breaker,
                use_candidate,
            };
            let data = match request.encode(tid) {
                Ok(data) => data,
                Err(e) => {
                    warn!("Cannot encode check for pair {}: {}", pair.foundation, e);
                    stream.check_list.mark_failed(scheduled.pair);
                    continue;
                }
            };

            trace!(
                "Check {} -> {} on {} ({}{})",
                local.address,
                dest,
                stream.name,
                if scheduled.triggered { "triggered" } else { "ordinary" },
                if use_candidate { ", USE-CANDIDATE" } else { "" }
            );
            stream.check_list.pair_mut(scheduled.pair).last_transaction = Some(tid);
            self.in_flight.insert(tid, InFlightCheck {
                stream: index,
                pair: scheduled.pair,
                generation: self.generation,
                use_candidate,
                priority,
            });
            return Some(OutgoingCheck {
                tid,
                socket,
                dest,
                data,
                remote_pwd: remote.pwd,
                triggered: scheduled.triggered,
                use_candidate,
            });
        }
        None
    }

    fn on_check_result(
        &mut self,
        tid: TransactionId,
        outcome: CheckOutcome,
        nominator: &Nominator,
        stats: &AgentStats,
        events: &mut Vec<IceEvent>,
    ) {
        let Some(check) = self.in_flight.remove(&tid) else { return };
        if check.generation != self.generation || self.closed {
            trace!("Ignoring result of check from an earlier role");
            return;
        }
        let controlling = self.role.is_controlling();

        match outcome {
            CheckOutcome::Success { mapped, rtt } => {
                bump(&stats.checks_succeeded);
                let stream = &mut self.streams[check.stream];
                let pair = stream.check_list.pair(check.pair).clone();

                // A mapped address we do not know is a new peer reflexive candidate
                let known = stream
                    .locals
                    .iter()
                    .any(|c| c.addr() == mapped && c.component_id == pair.component_id);
                if !known {
                    let prflx = Candidate::new_peer_reflexive(mapped, &stream.locals[pair.local], check.priority);
                    info!("Peer reflexive candidate {} on {}", prflx, stream.name);
                    let socket = stream.local_sockets[pair.local];
                    stream.locals.push(prflx);
                    stream.local_sockets.push(socket);
                    let index = stream.locals.len() - 1;
                    stream.check_list.replace_local(check.pair, index, &stream.locals, &stream.remotes);
                }

                stream.check_list.mark_succeeded(check.pair, Some(rtt));
                debug!("Check succeeded on {} pair {} in {:?}", stream.name, pair.foundation, rtt);

                let selected = if controlling {
                    nominator.on_controlling_success(&mut stream.check_list, check.pair, check.use_candidate)
                } else {
                    nominator.on_controlled_success(&mut stream.check_list, check.pair)
                };
                if let Some(id) = selected {
                    events.push(stream.nomination_event(check.stream, id));
                }

                for other in &mut self.streams {
                    other.check_list.unfreeze_foundation(&pair.foundation);
                }
            }
            CheckOutcome::RoleConflict => {
                bump(&stats.role_conflicts);
                self.switch_role(stats, events);
            }
            CheckOutcome::Failed(IceError::AgentClosed) | CheckOutcome::Failed(IceError::Stun(StunError::Cancelled)) => {}
            CheckOutcome::Failed(e) => {
                bump(&stats.checks_failed);
                let stream = &mut self.streams[check.stream];
                let foundation = &stream.check_list.pair(check.pair).foundation;
                debug!(
                    "{}",
                    IceError::PairFailed { pair: foundation.clone(), reason: e.to_string() }
                );
                stream.check_list.mark_failed(check.pair);
                if controlling {
                    nominator.on_controlling_failure(&mut stream.check_list, check.pair);
                }
            }
        }
    }

    /// Pair bookkeeping for an authenticated inbound check
    fn on_valid_request(
        &mut self,
        owner: SocketOwner,
        from: SocketAddr,
        priority: u32,
        use_candidate: bool,
        nominator: &Nominator,
        events: &mut Vec<IceEvent>,
    ) {
        if self.remote.is_none() {
            self.remember_early_check(owner, from, priority, use_candidate);
            return;
        }
        let controlling = self.role.is_controlling();
        let lite = self.lite;
        let stream = &mut self.streams[owner.stream];

        let remote = match stream
            .remotes
            .iter()
            .position(|c| c.addr() == from && c.component_id == owner.component)
        {
            Some(index) => index,
            None => {
                let prflx = Candidate::new_remote_peer_reflexive(TransportAddress::udp(from), owner.component, priority);
                info!("Remote peer reflexive candidate {} on {}", prflx, stream.name);
                stream.remotes.push(prflx);
                stream.remotes.len() - 1
            }
        };

        let pair = match stream.check_list.find(owner.host, remote) {
            Some(id) => Some(id),
            None => stream
                .check_list
                .add_pair(owner.host, remote, &stream.locals, &stream.remotes, controlling),
        };
        let Some(pair) = pair else { return };

        let selected = if lite {
            nominator.on_lite_request(&mut stream.check_list, pair, use_candidate)
        } else if !controlling && use_candidate {
            nominator.on_use_candidate(&mut stream.check_list, pair)
        } else {
            stream.check_list.trigger(pair, false);
            None
        };
        if let Some(id) = selected {
            events.push(stream.nomination_event(owner.stream, id));
        }
    }

    /// Learn the sender of a check that came before the remote description
    /// and keep the check for replay once the check lists exist
    fn remember_early_check(&mut self, owner: SocketOwner, from: SocketAddr, priority: u32, use_candidate: bool) {
        let stream = &mut self.streams[owner.stream];
        if !stream.remotes.iter().any(|c| c.addr() == from && c.component_id == owner.component) {
            let prflx = Candidate::new_remote_peer_reflexive(TransportAddress::udp(from), owner.component, priority);
            info!("Remote peer reflexive candidate {} on {} (no remote description yet)", prflx, stream.name);
            stream.remotes.push(prflx);
        }

        let early_len = self.early_checks.len();
        match self.early_checks.iter_mut().find(|c| c.owner == owner && c.from == from) {
            Some(known) => known.use_candidate |= use_candidate,
            None if early_len < MAX_EARLY_CHECKS => self.early_checks.push(EarlyCheck {
                owner,
                from,
                priority,
                use_candidate,
            }),
            None => trace!("Too many early checks, not remembering {}", from),
        }
    }

    /// Recompute list states and the overall status
    fn evaluate(&mut self, events: &mut Vec<IceEvent>) {
        if !self.started || self.closed || self.status.is_terminal() {
            return;
        }

        let mut any_failed = false;
        let mut all_completed = true;
        for (index, stream) in self.streams.iter_mut().enumerate() {
            match stream.check_list.update_state() {
                CheckListState::Failed => {
                    for component in stream.check_list.component_ids() {
                        if stream.check_list.component_state(component) == Some(ComponentState::Failed) {
                            warn!("{}", IceError::ComponentFailed { stream: index, component });
                        }
                    }
                    any_failed = true;
                }
                CheckListState::Running => all_completed = false,
                CheckListState::Completed => {}
            }
        }

        let status = if any_failed {
            IceStatus::Failed
        } else if all_completed {
            IceStatus::Success
        } else {
            IceStatus::InProgress
        };
        self.set_status(status, events);
    }

    fn set_status(&mut self, status: IceStatus, events: &mut Vec<IceEvent>) {
        if status != self.status {
            info!("ICE status {:?} -> {:?}", self.status, status);
            events.push(IceEvent::StateChanged { old: self.status, new: status });
            self.status = status;
        }
    }
}

pub(crate) struct AgentInner {
    peer_id: Uuid,
    config: IceConfig,
    nominator: Nominator,
    sockets: Vec<Arc<StunSocket>>,
    owners: Vec<SocketOwner>,
    /// Receive queues per stream, indexed by component - 1
    queues: Vec<Vec<Arc<ComponentQueue>>>,
    state: Mutex<AgentState>,
    events: EventBus,
    stats: AgentStats,
    check_permits: Arc<Semaphore>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl AgentInner {
    fn emit_all(&self, events: Vec<IceEvent>) {
        for event in events {
            self.events.emit(event);
        }
    }

    fn handle_packet(&self, packet: InboundPacket) {
        match packet.kind {
            PacketKind::Data(data) => self.handle_data(packet.socket, packet.from, data),
            PacketKind::Stun { message, raw } => match message.message_type {
                MessageType::BindingRequest => self.handle_request(packet.socket, packet.from, message, raw),
                MessageType::BindingIndication => trace!("Binding indication from {}", packet.from),
                _ => trace!("Dropping unmatched STUN response from {}", packet.from),
            },
        }
    }

    fn handle_data(&self, socket: SocketId, from: SocketAddr, data: Bytes) {
        let Some(owner) = self.owners.get(socket) else { return };
        let Some(queue) = self.queues[owner.stream].get(owner.component as usize - 1) else { return };
        bump(&self.stats.datagrams_received);
        queue.push(from, data);
        self.events.emit(IceEvent::BytesAvailable {
            stream: owner.stream,
            component: owner.component,
            from,
        });
    }

    fn handle_request(&self, socket: SocketId, from: SocketAddr, message: Message, raw: Bytes) {
        let Some(&owner) = self.owners.get(socket) else { return };
        bump(&self.stats.requests_received);

        let mut events = Vec::new();
        let response = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            let remote_ufrag = state.remote.as_ref().map(|r| r.ufrag.clone());
            match validate_request(&message, &raw, &state.local_ufrag, &state.local_pwd, remote_ufrag.as_deref()) {
                RequestVerdict::Reject { code, reason } => {
                    bump(&self.stats.requests_rejected);
                    debug!("Rejecting check from {} with {}", from, code);
                    connectivity::error_response(&message, code, reason, None)
                }
                RequestVerdict::Accept { priority, use_candidate, remote_role } => {
                    match resolve_role_conflict(state.role, state.tie_breaker, remote_role) {
                        ConflictResolution::RejectWithConflict => {
                            bump(&self.stats.role_conflicts);
                            debug!("Role conflict with {}, keeping {}", from, state.role);
                            connectivity::error_response(&message, ROLE_CONFLICT, "Role Conflict", Some(state.local_pwd.as_str()))
                        }
                        resolution => {
                            if resolution == ConflictResolution::SwitchRole {
                                bump(&self.stats.role_conflicts);
                                state.switch_role(&self.stats, &mut events);
                            }
                            state.on_valid_request(owner, from, priority, use_candidate, &self.nominator, &mut events);
                            state.evaluate(&mut events);
                            connectivity::success_response(
                                &message,
                                from,
                                self.config.software.as_deref(),
                                &state.local_pwd,
                            )
                        }
                    }
                }
            }
        };

        match response {
            Ok(bytes) => {
                if let Err(e) = self.sockets[socket].send_to(&bytes, from) {
                    debug!("Failed to answer {}: {}", from, e);
                }
            }
            Err(e) => warn!("Cannot encode response for {}: {}", from, e),
        }
        self.emit_all(events);
    }

    fn status(&self) -> IceStatus {
        self.state.lock().status
    }

    /// Local socket and remote address of every selected pair
    fn selected_routes(&self) -> Vec<(Arc<StunSocket>, SocketAddr)> {
        let state = self.state.lock();
        let mut routes = Vec::new();
        for stream in &state.streams {
            for (_, id) in stream.check_list.selected_pairs() {
                let pair = stream.check_list.pair(id);
                let socket = self.sockets[stream.local_sockets[pair.local]].clone();
                routes.push((socket, stream.remotes[pair.remote].addr()));
            }
        }
        routes
    }
}

impl Drop for AgentInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[instrument(skip_all, level = "debug")]
async fn dispatch(agent: Weak<AgentInner>, mut inbound: mpsc::UnboundedReceiver<InboundPacket>, shutdown: CancellationToken) {
    loop {
        let packet = tokio::select! {
            _ = shutdown.cancelled() => break,
            packet = inbound.recv() => match packet {
                Some(packet) => packet,
                None => break,
            },
        };
        let Some(agent) = agent.upgrade() else { break };
        agent.handle_packet(packet);
    }
    trace!("Dispatcher stopped");
}

#[instrument(skip(agent, shutdown), level = "debug")]
async fn schedule(agent: Weak<AgentInner>, ta: Duration, shutdown: CancellationToken) {
    let mut ticker = interval(ta);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut cursor = 0;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let Some(agent) = agent.upgrade() else { break };
        if agent.status().is_terminal() {
            break;
        }
        let Ok(permit) = agent.check_permits.clone().try_acquire_owned() else {
            continue;
        };
        let mut events = Vec::new();
        let next = {
            let mut state = agent.state.lock();
            let next = state.next_check(&mut cursor, &agent.nominator);
            match &next {
                Some(check) => {
                    bump(&agent.stats.checks_sent);
                    if check.triggered {
                        bump(&agent.stats.triggered_checks);
                    }
                    if check.use_candidate {
                        bump(&agent.stats.use_candidate_checks);
                    }
                }
                // Pairs that could not be checked may have been failed
                None => state.evaluate(&mut events),
            }
            next
        };
        agent.emit_all(events);
        if let Some(check) = next {
            tokio::spawn(run_check(agent, check, permit));
        }
    }
    debug!("Check scheduler stopped");
}

#[instrument(skip_all, fields(dest = %check.dest), level = "trace")]
async fn run_check(agent: Arc<AgentInner>, check: OutgoingCheck, _permit: OwnedSemaphorePermit) {
    let socket = agent.sockets[check.socket].clone();
    let result = match socket
        .engine()
        .start_raw(check.dest, check.tid, check.data, Some(check.remote_pwd.as_bytes()))
    {
        Ok(transaction) => transaction.await,
        Err(e) => Err(e),
    };
    let outcome = evaluate_response(result, check.dest);

    let mut events = Vec::new();
    {
        let mut state = agent.state.lock();
        state.on_check_result(check.tid, outcome, &agent.nominator, &agent.stats, &mut events);
        state.evaluate(&mut events);
    }
    agent.emit_all(events);
}

#[instrument(skip(agent, shutdown), level = "debug")]
async fn keepalive(agent: Weak<AgentInner>, period: Duration, shutdown: CancellationToken) {
    let mut ticker = interval_at(Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let Some(agent) = agent.upgrade() else { break };
        if agent.status() != IceStatus::Success {
            continue;
        }
        for (socket, remote) in agent.selected_routes() {
            match connectivity::keepalive_indication() {
                Ok(indication) => {
                    if socket.send_to(&indication, remote).is_ok() {
                        bump(&agent.stats.keepalives_sent);
                    }
                }
                Err(e) => warn!("Cannot encode keepalive: {}", e),
            }
        }
    }
}

/// Builder for [`IceAgent`]
pub struct IceAgentBuilder {
    role: IceRole,
    config: IceConfig,
    credentials: Option<(String, String)>,
    lite: bool,
    sockets: Vec<IceSocket>,
    prober: Option<Arc<dyn GatewayProber>>,
}

impl IceAgentBuilder {
    /// Replace the default configuration
    pub fn config(mut self, config: IceConfig) -> Self {
        self.config = config;
        self
    }

    /// Use fixed credentials instead of random ones
    pub fn credentials(mut self, ufrag: impl Into<String>, pwd: impl Into<String>) -> Self {
        self.credentials = Some((ufrag.into(), pwd.into()));
        self
    }

    /// Lite agents only answer checks and are always controlled
    pub fn lite(mut self, lite: bool) -> Self {
        self.lite = lite;
        self
    }

    /// Add one stream
    pub fn socket(mut self, socket: IceSocket) -> Self {
        self.sockets.push(socket);
        self
    }

    /// Add several streams
    pub fn sockets(mut self, sockets: impl IntoIterator<Item = IceSocket>) -> Self {
        self.sockets.extend(sockets);
        self
    }

    /// Ask `prober` for a mapped address for every host candidate
    pub fn gateway_prober(mut self, prober: Arc<dyn GatewayProber>) -> Self {
        self.prober = Some(prober);
        self
    }

    /// Gather candidates and start answering checks
    pub async fn build(self) -> IceResult<IceAgent> {
        self.config.validate()?;
        if self.sockets.is_empty() {
            return Err(IceError::Configuration("at least one stream is required".to_string()));
        }
        if let Some(bad) = self.sockets.iter().find(|s| !(1..=256).contains(&s.components)) {
            return Err(IceError::Configuration(format!(
                "stream {} has {} components, expected 1..=256",
                bad.name, bad.components
            )));
        }

        let (ufrag, pwd) = match self.credentials {
            Some((ufrag, pwd)) => {
                if !utils::is_valid_ice_string(&ufrag, 4) || !utils::is_valid_ice_string(&pwd, 22) {
                    return Err(IceError::Configuration("invalid ICE credentials".to_string()));
                }
                (ufrag, pwd)
            }
            None => utils::generate_credentials(),
        };
        let role = if self.lite { IceRole::Controlled } else { self.role };

        let (sink, inbound) = mpsc::unbounded_channel();
        let gathered = CandidateGatherer::new(&self.config, self.prober.clone(), sink)
            .gather(&self.sockets)
            .await?;

        let streams: Vec<StreamState> = self
            .sockets
            .iter()
            .zip(gathered.streams)
            .enumerate()
            .map(|(index, (wanted, locals))| StreamState {
                name: wanted.name.clone(),
                components: wanted.components,
                local_sockets: locals.iter().map(|l| l.socket.id()).collect(),
                locals: locals.into_iter().map(|l| l.candidate).collect(),
                remotes: Vec::new(),
                check_list: CheckList::new(index, wanted.components, self.config.max_pairs),
            })
            .collect();
        let queues: Vec<Vec<Arc<ComponentQueue>>> = self
            .sockets
            .iter()
            .map(|s| {
                (0..s.components)
                    .map(|_| Arc::new(ComponentQueue::new(self.config.queue_capacity)))
                    .collect()
            })
            .collect();

        let peer_id = Uuid::new_v4();
        let tie_breaker = utils::generate_tie_breaker();
        info!(
            "ICE agent {} created as {} ({} streams, tie-breaker {:#x}{})",
            peer_id,
            role,
            streams.len(),
            tie_breaker,
            if self.lite { ", lite" } else { "" }
        );

        let shutdown = CancellationToken::new();
        let inner = Arc::new(AgentInner {
            peer_id,
            nominator: Nominator::new(self.config.nomination),
            check_permits: Arc::new(Semaphore::new(self.config.max_concurrent_checks)),
            config: self.config,
            sockets: gathered.sockets,
            owners: gathered.owners,
            queues,
            state: Mutex::new(AgentState {
                role,
                tie_breaker,
                generation: 0,
                local_ufrag: ufrag,
                local_pwd: pwd,
                lite: self.lite,
                remote: None,
                status: IceStatus::NotStarted,
                started: false,
                closed: false,
                streams,
                in_flight: HashMap::new(),
                early_checks: Vec::new(),
            }),
            events: EventBus::new(),
            stats: AgentStats::default(),
            shutdown: shutdown.clone(),
            tasks: Mutex::new(Vec::new()),
        });

        let task = tokio::spawn(dispatch(Arc::downgrade(&inner), inbound, shutdown));
        inner.tasks.lock().push(task);

        Ok(IceAgent { inner })
    }
}

/// ICE agent handle; clones share the agent
#[derive(Clone)]
pub struct IceAgent {
    inner: Arc<AgentInner>,
}

impl IceAgent {
    /// Start configuring an agent that takes `role`
    pub fn builder(role: IceRole) -> IceAgentBuilder {
        IceAgentBuilder {
            role,
            config: IceConfig::default(),
            credentials: None,
            lite: false,
            sockets: Vec::new(),
            prober: None,
        }
    }

    /// Build an agent in one call
    pub async fn create_peer(
        role: IceRole,
        credentials: Option<(String, String)>,
        lite: bool,
        sockets: Vec<IceSocket>,
        config: IceConfig,
    ) -> IceResult<Self> {
        let mut builder = Self::builder(role).config(config).lite(lite).sockets(sockets);
        if let Some((ufrag, pwd)) = credentials {
            builder = builder.credentials(ufrag, pwd);
        }
        builder.build().await
    }

    /// Random identity of this agent, used in logs
    pub fn peer_id(&self) -> Uuid {
        self.inner.peer_id
    }

    /// Current role; a conflict may change it
    pub fn role(&self) -> IceRole {
        self.inner.state.lock().role
    }

    /// Tie-breaker sent in ICE-CONTROLLING / ICE-CONTROLLED
    pub fn tie_breaker(&self) -> u64 {
        self.inner.state.lock().tie_breaker
    }

    /// Current status
    pub fn status(&self) -> IceStatus {
        self.inner.status()
    }

    /// Whether this agent runs ice-lite
    pub fn is_lite(&self) -> bool {
        self.inner.state.lock().lite
    }

    /// Whether the installed remote description announced ice-lite
    pub fn remote_is_lite(&self) -> Option<bool> {
        self.inner.state.lock().remote.as_ref().map(|r| r.lite)
    }

    /// Configuration the agent was built with
    pub fn config(&self) -> &IceConfig {
        &self.inner.config
    }

    /// (ufrag, pwd)
    pub fn local_credentials(&self) -> (String, String) {
        let state = self.inner.state.lock();
        (state.local_ufrag.clone(), state.local_pwd.clone())
    }

    /// Local candidates of `stream`, peer reflexive ones included
    pub fn local_candidates(&self, stream: usize) -> Vec<Candidate> {
        self.inner
            .state
            .lock()
            .streams
            .get(stream)
            .map(|s| s.locals.clone())
            .unwrap_or_default()
    }

    /// Remote candidates of `stream`, learned peer reflexive ones included
    pub fn remote_candidates(&self, stream: usize) -> Vec<Candidate> {
        self.inner
            .state
            .lock()
            .streams
            .get(stream)
            .map(|s| s.remotes.clone())
            .unwrap_or_default()
    }

    /// Credentials and gathered candidates, ready to hand to the peer
    pub fn local_description(&self) -> SessionDescription {
        let state = self.inner.state.lock();
        SessionDescription {
            ufrag: state.local_ufrag.clone(),
            pwd: state.local_pwd.clone(),
            lite: state.lite,
            media: state
                .streams
                .iter()
                .map(|s| MediaDescription {
                    name: s.name.clone(),
                    components: s.components,
                    candidates: s
                        .locals
                        .iter()
                        .filter(|c| c.typ != CandidateType::PeerReflexive)
                        .cloned()
                        .collect(),
                })
                .collect(),
        }
    }

    /// Install the peer's description and form the check lists
    pub fn set_remote(&self, remote: &SessionDescription) -> IceResult<()> {
        self.set_remote_candidates(
            &remote.ufrag,
            &remote.pwd,
            remote.lite,
            remote.media.iter().map(|m| m.candidates.clone()).collect(),
        )
    }

    /// Install remote credentials and candidates, one list per stream
    pub fn set_remote_candidates(
        &self,
        ufrag: &str,
        pwd: &str,
        lite: bool,
        candidates: Vec<Vec<Candidate>>,
    ) -> IceResult<()> {
        let mut events = Vec::new();
        {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(IceError::AgentClosed);
            }
            if state.remote.is_some() {
                return Err(IceError::InvalidState("remote description already set".to_string()));
            }
            if candidates.len() != state.streams.len() {
                return Err(IceError::Sdp(format!(
                    "remote has {} streams, local has {}",
                    candidates.len(),
                    state.streams.len()
                )));
            }
            if ufrag.is_empty() || pwd.is_empty() {
                return Err(IceError::Sdp("missing remote credentials".to_string()));
            }

            // A full agent facing a lite one must control
            if lite && !state.lite && state.role == IceRole::Controlled {
                info!("Remote is lite, taking the controlling role");
                state.role = IceRole::Controlling;
                events.push(IceEvent::RoleChanged { role: IceRole::Controlling });
            }

            state.remote = Some(RemoteParams { ufrag: ufrag.to_string(), pwd: pwd.to_string(), lite });
            let controlling = state.role.is_controlling();
            for (stream, remotes) in state.streams.iter_mut().zip(candidates) {
                // Peer reflexive candidates learned before this call stay unless signalled
                let learned = std::mem::take(&mut stream.remotes);
                stream.remotes = remotes;
                for candidate in learned {
                    let signalled = stream
                        .remotes
                        .iter()
                        .any(|c| c.addr() == candidate.addr() && c.component_id == candidate.component_id);
                    if !signalled {
                        stream.remotes.push(candidate);
                    }
                }
                stream.check_list.form(&stream.locals, &stream.remotes, controlling);
            }

            let early = std::mem::take(&mut state.early_checks);
            if !early.is_empty() {
                debug!("Replaying {} checks received before the remote description", early.len());
            }
            for check in early {
                state.on_valid_request(
                    check.owner,
                    check.from,
                    check.priority,
                    check.use_candidate,
                    &self.inner.nominator,
                    &mut events,
                );
            }
            state.evaluate(&mut events);
        }
        self.inner.emit_all(events);
        Ok(())
    }

    /// Start connectivity checks
    pub fn start(&self) -> IceResult<()> {
        let mut events = Vec::new();
        let lite = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(IceError::AgentClosed);
            }
            if state.remote.is_none() {
                return Err(IceError::InvalidState("remote description not set".to_string()));
            }
            if state.started {
                return Ok(());
            }
            state.started = true;
            state.set_status(IceStatus::InProgress, &mut events);
            state.evaluate(&mut events);
            state.lite
        };
        self.inner.emit_all(events);

        let mut tasks = self.inner.tasks.lock();
        let weak = Arc::downgrade(&self.inner);
        if !lite {
            tasks.push(tokio::spawn(schedule(weak.clone(), self.inner.config.ta(), self.inner.shutdown.clone())));
        }
        if let Some(period) = self.inner.config.keepalive_interval() {
            tasks.push(tokio::spawn(keepalive(weak, period, self.inner.shutdown.clone())));
        }
        info!("ICE agent {} started", self.inner.peer_id);
        Ok(())
    }

    /// Stop all background work and release the sockets
    pub fn close(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.in_flight.clear();
        }
        self.inner.shutdown.cancel();
        for socket in &self.inner.sockets {
            socket.close();
        }
        for queue in self.inner.queues.iter().flatten() {
            queue.close();
        }
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        self.inner.events.close();
        info!("ICE agent {} closed", self.inner.peer_id);
    }

    /// Whether [`IceAgent::close`] ran
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Wait until the agent reaches Success or Failed, or is closed
    pub async fn wait_for_completion(&self) -> IceStatus {
        let mut changes = self
            .inner
            .events
            .subscribe_filtered(|e| matches!(e, IceEvent::StateChanged { .. }));
        loop {
            let status = self.status();
            if status.is_terminal() || self.is_closed() {
                return status;
            }
            if changes.recv().await.is_none() {
                return self.status();
            }
        }
    }

    /// Selected pairs of every component that has one
    pub fn selected_pairs(&self) -> Vec<SelectedPair> {
        let state = self.inner.state.lock();
        let mut selected = Vec::new();
        for (index, stream) in state.streams.iter().enumerate() {
            for component in 1..=stream.components {
                selected.extend(stream.selected_pair(index, component));
            }
        }
        selected
    }

    /// Selected pair of one component
    pub fn nominated(&self, stream: usize, component: u16) -> Option<SelectedPair> {
        let state = self.inner.state.lock();
        state.streams.get(stream)?.selected_pair(stream, component)
    }

    /// Datagram channel bound to one component
    pub fn channel(&self, stream: usize, component: u16) -> IceResult<Channel> {
        let components = self
            .inner
            .queues
            .get(stream)
            .ok_or_else(|| IceError::InvalidState(format!("no stream {}", stream)))?
            .len();
        if component == 0 || component as usize > components {
            return Err(IceError::InvalidState(format!("stream {} has no component {}", stream, component)));
        }
        Ok(Channel::new(self.clone(), stream, component))
    }

    /// One channel per component of `stream`
    pub fn channels(&self, stream: usize) -> IceResult<Vec<Channel>> {
        let components = self
            .inner
            .queues
            .get(stream)
            .ok_or_else(|| IceError::InvalidState(format!("no stream {}", stream)))?
            .len() as u16;
        (1..=components).map(|c| self.channel(stream, c)).collect()
    }

    /// Event bus of this agent
    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Receive every event of this agent
    pub fn subscribe(&self) -> Subscription {
        self.inner.events.subscribe()
    }

    /// Counters of this agent and its sockets
    pub fn stats(&self) -> AgentStatsSnapshot {
        let s = &self.inner.stats;
        let mut snapshot = AgentStatsSnapshot {
            checks_sent: s.checks_sent.load(Ordering::Relaxed),
            triggered_checks: s.triggered_checks.load(Ordering::Relaxed),
            use_candidate_checks: s.use_candidate_checks.load(Ordering::Relaxed),
            checks_succeeded: s.checks_succeeded.load(Ordering::Relaxed),
            checks_failed: s.checks_failed.load(Ordering::Relaxed),
            requests_received: s.requests_received.load(Ordering::Relaxed),
            requests_rejected: s.requests_rejected.load(Ordering::Relaxed),
            role_conflicts: s.role_conflicts.load(Ordering::Relaxed),
            role_switches: s.role_switches.load(Ordering::Relaxed),
            datagrams_received: s.datagrams_received.load(Ordering::Relaxed),
            keepalives_sent: s.keepalives_sent.load(Ordering::Relaxed),
            ..Default::default()
        };
        snapshot.datagrams_dropped = self.inner.queues.iter().flatten().map(|q| q.dropped()).sum();
        for socket in &self.inner.sockets {
            let tx = socket.engine().stats();
            snapshot.retransmissions += tx.retransmissions.load(Ordering::Relaxed);
            snapshot.transaction_timeouts += tx.timeouts.load(Ordering::Relaxed);
            snapshot.late_responses += tx.late_responses.load(Ordering::Relaxed);
        }
        snapshot
    }

    pub(crate) fn queue(&self, stream: usize, component: u16) -> Option<Arc<ComponentQueue>> {
        self.inner
            .queues
            .get(stream)?
            .get((component as usize).checked_sub(1)?)
            .cloned()
    }

    pub(crate) fn selected_route(&self, stream: usize, component: u16) -> Option<(Arc<StunSocket>, SocketAddr)> {
        let state = self.inner.state.lock();
        let s = state.streams.get(stream)?;
        let pair = s.check_list.pair(s.check_list.selected(component)?);
        let socket = self.inner.sockets[s.local_sockets[pair.local]].clone();
        Some((socket, s.remotes[pair.remote].addr()))
    }

    /// First socket of the component with the family of `peer`
    pub(crate) fn component_socket(&self, stream: usize, component: u16, peer: SocketAddr) -> Option<Arc<StunSocket>> {
        self.inner
            .sockets
            .iter()
            .zip(&self.inner.owners)
            .find(|(socket, owner)| {
                owner.stream == stream
                    && owner.component == component
                    && socket.local_addr().is_ipv4() == peer.is_ipv4()
            })
            .map(|(socket, _)| socket.clone())
    }
}

impl fmt::Debug for IceAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IceAgent")
            .field("peer_id", &self.inner.peer_id)
            .field("role", &self.role())
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback() -> IceConfig {
        IceConfig {
            host_addresses: vec!["127.0.0.1".parse().unwrap()],
            ..IceConfig::local_only()
        }
    }

    async fn agent(role: IceRole) -> IceAgent {
        IceAgent::builder(role)
            .config(loopback())
            .socket(IceSocket::new("data", 1))
            .build()
            .await
            .unwrap()
    }

    #[test]
    fn test_role_reverse() {
        assert_eq!(IceRole::Controlling.reverse(), IceRole::Controlled);
        assert_eq!(IceRole::Controlled.reverse().to_string(), "controlling");
        assert!(IceStatus::Failed.is_terminal());
        assert!(!IceStatus::InProgress.is_terminal());
    }

    #[tokio::test]
    async fn test_build_gathers_and_describes() {
        let a = agent(IceRole::Controlling).await;
        assert_eq!(a.status(), IceStatus::NotStarted);
        assert_eq!(a.local_candidates(0).len(), 1);

        let desc = a.local_description();
        let (ufrag, pwd) = a.local_credentials();
        assert_eq!(desc.ufrag, ufrag);
        assert_eq!(desc.pwd, pwd);
        assert_eq!(desc.media[0].candidates, a.local_candidates(0));
        a.close();
        assert!(a.is_closed());
    }

    #[tokio::test]
    async fn test_lite_agent_is_controlled() {
        let a = IceAgent::builder(IceRole::Controlling)
            .lite(true)
            .config(loopback())
            .socket(IceSocket::new("data", 1))
            .build()
            .await
            .unwrap();
        assert_eq!(a.role(), IceRole::Controlled);
        assert!(a.local_description().lite);
    }

    #[tokio::test]
    async fn test_invalid_builds() {
        assert!(IceAgent::builder(IceRole::Controlling).config(loopback()).build().await.is_err());
        assert!(IceAgent::builder(IceRole::Controlling)
            .config(loopback())
            .credentials("a", "b")
            .socket(IceSocket::new("data", 1))
            .build()
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_start_requires_remote() {
        let a = agent(IceRole::Controlling).await;
        assert!(matches!(a.start(), Err(IceError::InvalidState(_))));

        let b = agent(IceRole::Controlled).await;
        let mismatched = SessionDescription { media: Vec::new(), ..b.local_description() };
        assert!(a.set_remote(&mismatched).is_err());

        a.set_remote(&b.local_description()).unwrap();
        assert!(matches!(a.set_remote(&b.local_description()), Err(IceError::InvalidState(_))));
        a.start().unwrap();
        assert_eq!(a.status(), IceStatus::InProgress);
    }

    #[tokio::test]
    async fn test_full_agent_controls_lite_peer() {
        let a = agent(IceRole::Controlled).await;
        let mut remote = agent(IceRole::Controlled).await.local_description();
        remote.lite = true;
        a.set_remote(&remote).unwrap();
        assert_eq!(a.role(), IceRole::Controlling);
    }

    #[tokio::test]
    async fn test_unencodable_checks_fail_every_stream() {
        let streams = [IceSocket::new("video", 1), IceSocket::new("audio", 1)];
        let a = IceAgent::builder(IceRole::Controlling)
            .config(loopback())
            .sockets(streams.clone())
            .build()
            .await
            .unwrap();
        let b = IceAgent::builder(IceRole::Controlled)
            .config(loopback())
            .sockets(streams)
            .build()
            .await
            .unwrap();

        // USERNAME beyond the 16-bit attribute length cannot be encoded
        let (_, pwd) = b.local_credentials();
        let candidates = (0..2).map(|s| b.local_candidates(s)).collect();
        a.set_remote_candidates(&"u".repeat(70_000), &pwd, false, candidates).unwrap();
        a.start().unwrap();

        let status = tokio::time::timeout(Duration::from_secs(5), a.wait_for_completion())
            .await
            .expect("agent stalled on unencodable checks");
        assert_eq!(status, IceStatus::Failed);
        assert_eq!(a.stats().checks_sent, 0);
        a.close();
        b.close();
    }

    #[tokio::test]
    async fn test_channels() {
        let a = agent(IceRole::Controlling).await;
        assert_eq!(a.channels(0).unwrap().len(), 1);
        assert!(a.channel(0, 2).is_err());
        assert!(a.channels(3).is_err());

        let channel = a.channel(0, 1).unwrap();
        assert!(channel.read().is_none());
        assert!(matches!(channel.write(b"x"), Err(IceError::InvalidState(_))));
    }
}
