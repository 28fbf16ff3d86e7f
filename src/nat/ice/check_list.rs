// src/nat/ice/check_list.rs
//! Check list management (RFC 5245 Section 5.7)
//!
//! A check list owns the candidate pairs of one stream. Pairs live in an
//! append-only arena and are addressed by [`PairId`]; they reference local and
//! remote candidates by their index in the stream's candidate arenas, so a
//! pair never holds a copy of a candidate that could go stale.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use crate::nat::stun::TransactionId;
use super::candidate::{Candidate, CandidateType};
use super::priority::calculate_pair_priority;

/// Index of a pair inside its check list
pub type PairId = usize;

/// Maximum pairs per stream (RFC 5245 Section 5.7.3)
pub const MAX_PAIRS_PER_STREAM: usize = 100;

/// Candidate pair state (RFC 5245 Section 5.7.4)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CandidatePairState {
    /// Not checked until its foundation is unfrozen
    Frozen,
    /// Ready to be checked
    Waiting,
    /// Check outstanding
    InProgress,
    /// Check answered with a matching success response
    Succeeded,
    /// Check failed or timed out
    Failed,
}

/// Check list state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckListState {
    /// Checks in progress
    Running,
    /// Every component has a selected pair
    Completed,
    /// Some component has no pair left
    Failed,
}

/// Per-component progress inside a check list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentState {
    /// No pair selected yet
    Running,
    /// Pair selected
    Completed,
    /// Every pair failed
    Failed,
}

/// A local/remote candidate pair
#[derive(Debug, Clone)]
pub struct CandidatePair {
    /// Index into the stream's local candidates
    pub local: usize,
    /// Index into the stream's remote candidates
    pub remote: usize,
    /// Component both candidates belong to
    pub component_id: u16,
    /// `local.foundation:remote.foundation`
    pub foundation: String,
    /// Pair priority from this agent's point of view
    pub priority: u64,
    /// Check state
    pub state: CandidatePairState,
    /// Set only on the pair selected for its component
    pub nominated: bool,
    /// USE-CANDIDATE seen on an inbound check before this pair succeeded
    pub nominate_on_success: bool,
    /// Foundations used for the uniqueness key; they survive a prflx swap
    key: (String, String, u16),
    /// Transaction of the most recent check
    pub last_transaction: Option<TransactionId>,
    /// Checks sent on this pair
    pub checks_sent: u32,
    /// Round trip of the last successful check
    pub rtt: Option<Duration>,
}

impl CandidatePair {
    fn new(local: usize, remote: usize, lc: &Candidate, rc: &Candidate, controlling: bool) -> Self {
        Self {
            local,
            remote,
            component_id: lc.component_id,
            foundation: format!("{}:{}", lc.foundation, rc.foundation),
            priority: pair_priority(lc, rc, controlling),
            state: CandidatePairState::Frozen,
            nominated: false,
            nominate_on_success: false,
            key: (lc.foundation.clone(), rc.foundation.clone(), lc.component_id),
            last_transaction: None,
            checks_sent: 0,
            rtt: None,
        }
    }

    /// Whether the pair is in the valid list
    pub fn is_succeeded(&self) -> bool {
        self.state == CandidatePairState::Succeeded
    }
}

/// Pair priority from this agent's point of view
pub fn pair_priority(local: &Candidate, remote: &Candidate, controlling: bool) -> u64 {
    if controlling {
        calculate_pair_priority(local.priority, remote.priority)
    } else {
        calculate_pair_priority(remote.priority, local.priority)
    }
}

/// A check the scheduler should send next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledCheck {
    /// Pair to check
    pub pair: PairId,
    /// Carry USE-CANDIDATE
    pub nominate: bool,
    /// Taken from the triggered queue
    pub triggered: bool,
}

/// Counters kept per check list
#[derive(Debug, Default, Clone)]
pub struct CheckListStats {
    /// Pairs kept after pruning
    pub total_pairs: usize,
    /// Pairs pruned as redundant or over the cap
    pub pruned_pairs: usize,
    /// Checks handed out by `next_check`
    pub checks_scheduled: u64,
    /// Of those, triggered checks
    pub triggered_checks: u64,
    /// Pairs that succeeded
    pub succeeded: usize,
    /// Pairs that failed
    pub failed: usize,
}

/// Check list for one stream
#[derive(Debug)]
pub struct CheckList {
    stream: usize,
    pairs: Vec<CandidatePair>,
    /// Pair ids ordered by descending priority
    order: Vec<PairId>,
    triggered: VecDeque<(PairId, bool)>,
    components: BTreeMap<u16, ComponentState>,
    selected: BTreeMap<u16, PairId>,
    /// Components whose nomination check is outstanding
    nominating: BTreeMap<u16, PairId>,
    state: CheckListState,
    max_pairs: usize,
    stats: CheckListStats,
}

impl CheckList {
    /// Empty list for `stream` with `components` components
    pub fn new(stream: usize, components: u16, max_pairs: usize) -> Self {
        Self {
            stream,
            pairs: Vec::new(),
            order: Vec::new(),
            triggered: VecDeque::new(),
            components: (1..=components).map(|c| (c, ComponentState::Running)).collect(),
            selected: BTreeMap::new(),
            nominating: BTreeMap::new(),
            state: CheckListState::Running,
            max_pairs: max_pairs.max(1),
            stats: CheckListStats::default(),
        }
    }

    /// Form the initial check list (RFC 5245 Section 5.7)
    ///
    /// Pairs every local with every compatible remote candidate of the same
    /// component, sorts, replaces server reflexive locals by their base,
    /// removes duplicates, caps the list and sets the initial states.
    pub fn form(&mut self, locals: &[Candidate], remotes: &[Candidate], controlling: bool) {
        info!(
            "Forming check list for stream {}: {} local x {} remote candidates",
            self.stream,
            locals.len(),
            remotes.len()
        );

        let mut formed = Vec::new();
        for (li, local) in locals.iter().enumerate() {
            for (ri, remote) in remotes.iter().enumerate() {
                if local.component_id != remote.component_id
                    || !self.components.contains_key(&local.component_id)
                    || !local.address.can_pair_with(&remote.address)
                {
                    continue;
                }
                formed.push(CandidatePair::new(li, ri, local, remote, controlling));
            }
        }
        formed.sort_by(|a, b| b.priority.cmp(&a.priority));
        let created = formed.len();

        // A server reflexive local sends from its base; checks go out the
        // base socket, so the pair is the base pair at the srflx rank.
        let mut seen = HashSet::new();
        for mut pair in formed {
            if locals[pair.local].typ == CandidateType::ServerReflexive {
                let srflx = &locals[pair.local];
                match locals.iter().position(|c| c.typ == CandidateType::Host && c.address == srflx.base) {
                    Some(base) => {
                        pair.local = base;
                        pair.key.0 = locals[base].foundation.clone();
                        pair.foundation = format!("{}:{}", locals[base].foundation, remotes[pair.remote].foundation);
                    }
                    None => {
                        self.stats.pruned_pairs += 1;
                        continue;
                    }
                }
            }
            if !seen.insert(pair.key.clone()) {
                trace!("Pruning redundant pair {}", pair.foundation);
                self.stats.pruned_pairs += 1;
                continue;
            }
            if self.pairs.len() >= self.max_pairs {
                self.stats.pruned_pairs += 1;
                continue;
            }
            let id = self.pairs.len();
            self.pairs.push(pair);
            self.order.push(id);
        }

        // Highest-priority pair of every foundation starts Waiting
        let mut waiting = HashSet::new();
        for &id in &self.order {
            let pair = &mut self.pairs[id];
            if waiting.insert(pair.foundation.clone()) {
                pair.state = CandidatePairState::Waiting;
            }
        }

        self.stats.total_pairs = self.pairs.len();
        info!(
            "Check list formed for stream {}: {} pairs ({} created, {} pruned), {} foundations",
            self.stream,
            self.pairs.len(),
            created,
            self.stats.pruned_pairs,
            waiting.len()
        );
    }

    /// Add a pair discovered after formation; returns the existing id when
    /// an equivalent pair is already listed
    pub fn add_pair(
        &mut self,
        local: usize,
        remote: usize,
        locals: &[Candidate],
        remotes: &[Candidate],
        controlling: bool,
    ) -> Option<PairId> {
        if let Some(id) = self.find(local, remote) {
            return Some(id);
        }
        let pair = CandidatePair::new(local, remote, &locals[local], &remotes[remote], controlling);
        if let Some(id) = self.pairs.iter().position(|p| p.key == pair.key) {
            return Some(id);
        }
        if self.pairs.len() >= self.max_pairs {
            warn!("Check list for stream {} is full, not adding {}", self.stream, pair.foundation);
            return None;
        }

        let id = self.pairs.len();
        debug!("Adding pair {} to stream {} (priority {})", pair.foundation, self.stream, pair.priority);
        let pos = self.order.partition_point(|&o| self.pairs[o].priority >= pair.priority);
        self.pairs.push(pair);
        self.order.insert(pos, id);
        self.stats.total_pairs = self.pairs.len();
        Some(id)
    }

    /// Pair for the given local/remote candidate indices
    pub fn find(&self, local: usize, remote: usize) -> Option<PairId> {
        self.pairs.iter().position(|p| p.local == local && p.remote == remote)
    }

    /// Next check to send: triggered queue, then highest Waiting pair, then
    /// the highest Frozen pair is unfrozen. The returned pair is In-Progress.
    pub fn next_check(&mut self) -> Option<ScheduledCheck> {
        if self.state != CheckListState::Running {
            return None;
        }

        while let Some((id, nominate)) = self.triggered.pop_front() {
            let state = self.pairs[id].state;
            let runnable = match state {
                CandidatePairState::InProgress => false,
                CandidatePairState::Succeeded => nominate,
                _ => !self.is_component_done(self.pairs[id].component_id),
            };
            if runnable {
                self.stats.triggered_checks += 1;
                return Some(self.begin(id, nominate, true));
            }
            trace!("Skipping triggered check on pair {} ({:?})", id, state);
        }

        let waiting = self.order.iter().copied().find(|&id| {
            let pair = &self.pairs[id];
            pair.state == CandidatePairState::Waiting && !self.is_component_done(pair.component_id)
        });
        if let Some(id) = waiting {
            return Some(self.begin(id, false, false));
        }

        let frozen = self.order.iter().copied().find(|&id| {
            let pair = &self.pairs[id];
            pair.state == CandidatePairState::Frozen && !self.is_component_done(pair.component_id)
        });
        frozen.map(|id| {
            debug!("Unfreezing pair {} in stream {}", self.pairs[id].foundation, self.stream);
            self.begin(id, false, false)
        })
    }

    fn begin(&mut self, id: PairId, nominate: bool, triggered: bool) -> ScheduledCheck {
        let pair = &mut self.pairs[id];
        if pair.state != CandidatePairState::Succeeded {
            pair.state = CandidatePairState::InProgress;
        }
        pair.checks_sent += 1;
        self.stats.checks_scheduled += 1;
        ScheduledCheck { pair: id, nominate, triggered }
    }

    /// Queue a triggered check; `nominate` asks for USE-CANDIDATE
    pub fn trigger(&mut self, id: PairId, nominate: bool) {
        let Some(pair) = self.pairs.get_mut(id) else { return };
        match pair.state {
            CandidatePairState::Frozen | CandidatePairState::Failed => {
                pair.state = CandidatePairState::Waiting;
            }
            CandidatePairState::Succeeded if !nominate => return,
            _ => {}
        }
        if !self.triggered.iter().any(|&(t, n)| t == id && n == nominate) {
            self.triggered.push_back((id, nominate));
        }
    }

    /// Move every Frozen pair of `foundation` to Waiting
    pub fn unfreeze_foundation(&mut self, foundation: &str) -> usize {
        let mut count = 0;
        for pair in &mut self.pairs {
            if pair.state == CandidatePairState::Frozen && pair.foundation == foundation {
                pair.state = CandidatePairState::Waiting;
                count += 1;
            }
        }
        count
    }

    /// Record a successful check and its round trip
    pub fn mark_succeeded(&mut self, id: PairId, rtt: Option<Duration>) {
        let pair = &mut self.pairs[id];
        if pair.state != CandidatePairState::Succeeded {
            self.stats.succeeded += 1;
        }
        pair.state = CandidatePairState::Succeeded;
        pair.rtt = rtt.or(pair.rtt);
    }

    /// Record a failed check
    pub fn mark_failed(&mut self, id: PairId) {
        let pair = &mut self.pairs[id];
        if pair.state == CandidatePairState::Succeeded {
            // A failed nomination re-check leaves the pair valid
            return;
        }
        pair.state = CandidatePairState::Failed;
        self.stats.failed += 1;
    }

    /// Return an interrupted pair to Waiting
    pub fn reset_to_waiting(&mut self, id: PairId) {
        let pair = &mut self.pairs[id];
        if pair.state == CandidatePairState::InProgress {
            pair.state = CandidatePairState::Waiting;
        }
    }

    /// Swap the local candidate of a pair for the peer reflexive one
    /// discovered by its check; priority and uniqueness key are kept
    pub fn replace_local(&mut self, id: PairId, local: usize, locals: &[Candidate], remotes: &[Candidate]) {
        let pair = &mut self.pairs[id];
        pair.local = local;
        pair.foundation = format!("{}:{}", locals[local].foundation, remotes[pair.remote].foundation);
    }

    /// Recompute priorities after a role change and requeue in-flight checks
    ///
    /// Returns the pairs that were In-Progress.
    pub fn apply_role_change(&mut self, locals: &[Candidate], remotes: &[Candidate], controlling: bool) -> Vec<PairId> {
        let mut interrupted = Vec::new();
        for (id, pair) in self.pairs.iter_mut().enumerate() {
            pair.priority = pair_priority(&locals[pair.local], &remotes[pair.remote], controlling);
            if pair.state == CandidatePairState::InProgress {
                pair.state = CandidatePairState::Waiting;
                interrupted.push(id);
            }
        }
        let pairs = &self.pairs;
        self.order.sort_by(|&a, &b| pairs[b].priority.cmp(&pairs[a].priority));
        self.nominating.clear();
        self.triggered.retain(|&(_, nominate)| !nominate);
        for &id in &interrupted {
            self.triggered.push_back((id, false));
        }
        interrupted
    }

    /// Select `id` for its component; the first selection is final
    pub fn select(&mut self, id: PairId) -> bool {
        let component = self.pairs[id].component_id;
        if self.selected.contains_key(&component) || !self.pairs[id].is_succeeded() {
            return false;
        }
        self.pairs[id].nominated = true;
        self.selected.insert(component, id);
        self.nominating.remove(&component);
        self.components.insert(component, ComponentState::Completed);
        info!(
            "Stream {} component {} selected pair {} (priority {})",
            self.stream, component, self.pairs[id].foundation, self.pairs[id].priority
        );
        true
    }

    /// Select `id` unless a higher-priority pair is already selected for its
    /// component (RFC 5245 Section 8.1.1.2); true when the selection changed
    pub fn select_preferred(&mut self, id: PairId) -> bool {
        if !self.pairs[id].is_succeeded() {
            return false;
        }
        let component = self.pairs[id].component_id;
        let Some(&current) = self.selected.get(&component) else {
            return self.select(id);
        };
        if current == id || self.pairs[id].priority <= self.pairs[current].priority {
            return false;
        }
        self.pairs[current].nominated = false;
        self.pairs[id].nominated = true;
        self.selected.insert(component, id);
        info!(
            "Stream {} component {} moved to higher nominated pair {} (priority {})",
            self.stream, component, self.pairs[id].foundation, self.pairs[id].priority
        );
        true
    }

    /// Selected pair of `component`
    pub fn selected(&self, component: u16) -> Option<PairId> {
        self.selected.get(&component).copied()
    }

    /// Every (component, selected pair)
    pub fn selected_pairs(&self) -> impl Iterator<Item = (u16, PairId)> + '_ {
        self.selected.iter().map(|(&c, &id)| (c, id))
    }

    /// Highest-priority valid pair of `component`
    pub fn best_valid(&self, component: u16) -> Option<PairId> {
        self.order
            .iter()
            .copied()
            .find(|&id| self.pairs[id].component_id == component && self.pairs[id].is_succeeded())
    }

    /// Pair whose nomination check is outstanding for `component`
    pub fn nominating(&self, component: u16) -> Option<PairId> {
        self.nominating.get(&component).copied()
    }

    /// Remember the outstanding nomination check of `component`
    pub fn set_nominating(&mut self, component: u16, id: PairId) {
        self.nominating.insert(component, id);
    }

    /// Forget the outstanding nomination check of `component`
    pub fn clear_nominating(&mut self, component: u16) {
        self.nominating.remove(&component);
    }

    fn is_component_done(&self, component: u16) -> bool {
        !matches!(self.components.get(&component), Some(ComponentState::Running))
    }

    /// Re-evaluate component and list states
    ///
    /// A component fails once every one of its pairs has failed with nothing
    /// queued; the list completes when every component has a selected pair
    /// and fails as soon as one component fails.
    pub fn update_state(&mut self) -> CheckListState {
        if self.state != CheckListState::Running {
            return self.state;
        }

        let components: Vec<u16> = self.components.keys().copied().collect();
        for component in components {
            if self.components[&component] != ComponentState::Running {
                continue;
            }
            let mut pairs = self.pairs.iter().filter(|p| p.component_id == component).peekable();
            let exhausted = pairs.peek().is_none()
                || pairs.all(|p| p.state == CandidatePairState::Failed);
            let queued = self.triggered.iter().any(|&(id, _)| self.pairs[id].component_id == component);
            if exhausted && !queued {
                warn!("Stream {} component {} failed: all pairs exhausted", self.stream, component);
                self.components.insert(component, ComponentState::Failed);
            }
        }

        if self.components.values().any(|s| *s == ComponentState::Failed) {
            self.state = CheckListState::Failed;
        } else if self.components.values().all(|s| *s == ComponentState::Completed) {
            self.state = CheckListState::Completed;
        }
        self.state
    }

    /// Current list state
    pub fn state(&self) -> CheckListState {
        self.state
    }

    /// Progress of one component
    pub fn component_state(&self, component: u16) -> Option<ComponentState> {
        self.components.get(&component).copied()
    }

    /// Component ids of the stream
    pub fn component_ids(&self) -> impl Iterator<Item = u16> + '_ {
        self.components.keys().copied()
    }

    /// Pair by id
    pub fn pair(&self, id: PairId) -> &CandidatePair {
        &self.pairs[id]
    }

    /// Mutable pair by id
    pub fn pair_mut(&mut self, id: PairId) -> &mut CandidatePair {
        &mut self.pairs[id]
    }

    /// Pairs in priority order
    pub fn pairs(&self) -> impl Iterator<Item = (PairId, &CandidatePair)> + '_ {
        self.order.iter().map(move |&id| (id, &self.pairs[id]))
    }

    /// Number of pairs
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    /// Whether the list holds no pairs
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Counters of this list
    pub fn stats(&self) -> &CheckListStats {
        &self.stats
    }
}
