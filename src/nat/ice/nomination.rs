// src/nat/ice/nomination.rs
//! ICE nomination procedures (RFC 5245 Section 8.1.1)

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::check_list::{CheckList, PairId};

/// Nomination strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NominationMode {
    /// Check first, then repeat the check on the best valid pair with USE-CANDIDATE
    #[default]
    Regular,

    /// Every check carries USE-CANDIDATE; the first success is selected
    Aggressive,
}

/// Nomination controller
///
/// Applies the nomination rules to a check list. Every method returns the
/// pair that became selected, if any, so the caller can publish it.
#[derive(Debug, Clone, Copy)]
pub struct Nominator {
    mode: NominationMode,
}

impl Nominator {
    /// Controller for `mode`
    pub fn new(mode: NominationMode) -> Self {
        Self { mode }
    }

    /// Nomination mode in use
    pub fn mode(&self) -> NominationMode {
        self.mode
    }

    /// Whether a controlling check should carry USE-CANDIDATE
    pub fn use_candidate(&self, requested: bool) -> bool {
        requested || self.mode == NominationMode::Aggressive
    }

    /// Controlling side: a check on `pair` succeeded
    pub fn on_controlling_success(&self, list: &mut CheckList, pair: PairId, carried_use_candidate: bool) -> Option<PairId> {
        if carried_use_candidate {
            // Aggressive checks nominate every pair; keep the best one
            let selected = match self.mode {
                NominationMode::Regular => list.select(pair),
                NominationMode::Aggressive => list.select_preferred(pair),
            };
            return selected.then_some(pair);
        }
        if self.mode == NominationMode::Regular {
            let component = list.pair(pair).component_id;
            self.nominate_best(list, component);
        }
        None
    }

    /// Controlling side: a check on `pair` failed
    ///
    /// A failed nomination check releases the component so the next best
    /// valid pair can be nominated.
    pub fn on_controlling_failure(&self, list: &mut CheckList, pair: PairId) {
        let component = list.pair(pair).component_id;
        if list.nominating(component) == Some(pair) {
            debug!("Nomination check on pair {} failed", list.pair(pair).foundation);
            list.clear_nominating(component);
            if self.mode == NominationMode::Regular {
                self.nominate_best(list, component);
            }
        }
    }

    /// Queue a USE-CANDIDATE check on the best valid pair of `component`
    /// unless one is outstanding or a pair is already selected
    pub fn nominate_best(&self, list: &mut CheckList, component: u16) -> Option<PairId> {
        if list.selected(component).is_some() || list.nominating(component).is_some() {
            return None;
        }
        let best = list.best_valid(component)?;
        debug!(
            "Nominating pair {} for component {} (priority {})",
            list.pair(best).foundation,
            component,
            list.pair(best).priority
        );
        list.set_nominating(component, best);
        list.trigger(best, true);
        Some(best)
    }

    /// Controlled side: an inbound check on `pair` carried USE-CANDIDATE
    ///
    /// Of several nominated pairs the highest-priority one stays selected.
    pub fn on_use_candidate(&self, list: &mut CheckList, pair: PairId) -> Option<PairId> {
        if list.pair(pair).is_succeeded() {
            return list.select_preferred(pair).then_some(pair);
        }
        list.pair_mut(pair).nominate_on_success = true;
        list.trigger(pair, false);
        None
    }

    /// Controlled side: our own check on `pair` succeeded
    pub fn on_controlled_success(&self, list: &mut CheckList, pair: PairId) -> Option<PairId> {
        if list.pair(pair).nominate_on_success {
            return list.select_preferred(pair).then_some(pair);
        }
        None
    }

    /// Lite agent: an inbound check validates `pair` on its own
    pub fn on_lite_request(&self, list: &mut CheckList, pair: PairId, use_candidate: bool) -> Option<PairId> {
        list.mark_succeeded(pair, None);
        if use_candidate {
            return list.select_preferred(pair).then_some(pair);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nat::ice::candidate::{Candidate, TransportAddress};
    use crate::nat::ice::check_list::{CandidatePairState, MAX_PAIRS_PER_STREAM};

    fn list_with_two_pairs() -> CheckList {
        let locals = vec![
            Candidate::new_host(TransportAddress::udp("10.0.0.1:5000".parse().unwrap()), 1, 65535),
            Candidate::new_host(TransportAddress::udp("10.0.0.2:5000".parse().unwrap()), 1, 60000),
        ];
        let remotes = vec![Candidate::new_host(TransportAddress::udp("10.0.1.1:6000".parse().unwrap()), 1, 65535)];
        let mut list = CheckList::new(0, 1, MAX_PAIRS_PER_STREAM);
        list.form(&locals, &remotes, true);
        list
    }

    #[test]
    fn test_regular_nominates_best_valid_pair() {
        let nominator = Nominator::new(NominationMode::Regular);
        let mut list = list_with_two_pairs();

        // Lower priority pair succeeds first
        let (low, _) = list.pairs().last().map(|(id, p)| (id, p.clone())).unwrap();
        list.mark_succeeded(low, None);
        assert_eq!(nominator.on_controlling_success(&mut list, low, false), None);
        assert_eq!(list.nominating(1), Some(low));

        let check = list.next_check().unwrap();
        assert_eq!(check.pair, low);
        assert!(check.nominate);
        assert_eq!(nominator.on_controlling_success(&mut list, low, true), Some(low));
        assert!(list.pair(low).nominated);
        assert_eq!(list.selected(1), Some(low));
    }

    #[test]
    fn test_aggressive_selects_first_success() {
        let nominator = Nominator::new(NominationMode::Aggressive);
        assert!(nominator.use_candidate(false));
        let mut list = list_with_two_pairs();

        let check = list.next_check().unwrap();
        list.mark_succeeded(check.pair, None);
        assert_eq!(nominator.on_controlling_success(&mut list, check.pair, true), Some(check.pair));

        let (other, _) = list.pairs().find(|(id, _)| *id != check.pair).map(|(id, p)| (id, p.clone())).unwrap();
        list.mark_succeeded(other, None);
        assert_eq!(nominator.on_controlling_success(&mut list, other, true), None);
        assert_eq!(list.pairs().filter(|(_, p)| p.nominated).count(), 1);
    }

    #[test]
    fn test_failed_nomination_falls_back() {
        let nominator = Nominator::new(NominationMode::Regular);
        let mut list = list_with_two_pairs();
        let ids: Vec<PairId> = list.pairs().map(|(id, _)| id).collect();

        list.mark_succeeded(ids[1], None);
        nominator.nominate_best(&mut list, 1);
        assert_eq!(list.nominating(1), Some(ids[1]));

        list.mark_succeeded(ids[0], None);
        nominator.on_controlling_failure(&mut list, ids[1]);
        assert_eq!(list.nominating(1), Some(ids[0]));
    }

    #[test]
    fn test_controlled_use_candidate_before_success() {
        let nominator = Nominator::new(NominationMode::Regular);
        let mut list = list_with_two_pairs();
        let id = list.pairs().next().map(|(id, _)| id).unwrap();

        assert_eq!(nominator.on_use_candidate(&mut list, id), None);
        assert!(list.pair(id).nominate_on_success);

        let check = list.next_check().unwrap();
        assert_eq!(check.pair, id);
        assert!(check.triggered);
        list.mark_succeeded(id, None);
        assert_eq!(nominator.on_controlled_success(&mut list, id), Some(id));
    }

    #[test]
    fn test_controlled_keeps_highest_nominated_pair() {
        let nominator = Nominator::new(NominationMode::Regular);
        let mut list = list_with_two_pairs();
        let ids: Vec<PairId> = list.pairs().map(|(id, _)| id).collect();
        let (high, low) = (ids[0], ids[1]);
        list.mark_succeeded(high, None);
        list.mark_succeeded(low, None);

        assert_eq!(nominator.on_use_candidate(&mut list, low), Some(low));
        assert_eq!(nominator.on_use_candidate(&mut list, high), Some(high));
        assert_eq!(list.selected(1), Some(high));

        // A later nomination of the weaker pair changes nothing
        assert_eq!(nominator.on_use_candidate(&mut list, low), None);
        assert_eq!(list.selected(1), Some(high));
    }

    #[test]
    fn test_aggressive_upgrades_to_better_success() {
        let nominator = Nominator::new(NominationMode::Aggressive);
        let mut list = list_with_two_pairs();
        let ids: Vec<PairId> = list.pairs().map(|(id, _)| id).collect();
        let (high, low) = (ids[0], ids[1]);

        list.mark_succeeded(low, None);
        assert_eq!(nominator.on_controlling_success(&mut list, low, true), Some(low));
        list.mark_succeeded(high, None);
        assert_eq!(nominator.on_controlling_success(&mut list, high, true), Some(high));
        assert_eq!(list.selected(1), Some(high));
        assert_eq!(list.pairs().filter(|(_, p)| p.nominated).count(), 1);
    }

    #[test]
    fn test_regular_selection_is_final() {
        let nominator = Nominator::new(NominationMode::Regular);
        let mut list = list_with_two_pairs();
        let ids: Vec<PairId> = list.pairs().map(|(id, _)| id).collect();
        let (high, low) = (ids[0], ids[1]);

        list.mark_succeeded(low, None);
        assert_eq!(nominator.on_controlling_success(&mut list, low, true), Some(low));
        list.mark_succeeded(high, None);
        assert_eq!(nominator.on_controlling_success(&mut list, high, true), None);
        assert_eq!(list.selected(1), Some(low));
    }

    #[test]
    fn test_lite_request_selects() {
        let nominator = Nominator::new(NominationMode::Regular);
        let mut list = list_with_two_pairs();
        let id = list.pairs().next().map(|(id, _)| id).unwrap();

        assert_eq!(nominator.on_lite_request(&mut list, id, false), None);
        assert_eq!(list.pair(id).state, CandidatePairState::Succeeded);
        assert_eq!(nominator.on_lite_request(&mut list, id, true), Some(id));
    }

    #[test]
    fn test_mode_serde() {
        assert_eq!(serde_json::to_string(&NominationMode::Aggressive).unwrap(), "\"aggressive\"");
        let mode: NominationMode = serde_json::from_str("\"regular\"").unwrap();
        assert_eq!(mode, NominationMode::Regular);
    }
}
