//! Quorum certificates.
//!
//! A certificate holds at most one vote per sender and counts, for each
//! distinct value, how many senders voted for it. It separates "which values
//! are present" from "which value is correct": once a value has `weak`
//! votes at least one correct replica vouches for it, and later votes for
//! other values are refused. The certificate is complete once one value
//! reaches the threshold.

use super::seq_log::LogSlot;
use shared_types::ReplicaId;
use std::collections::BTreeMap;
use std::time::Instant;

/// A message counted by a [`Certificate`].
pub trait Vote: Clone {
    /// Replica that cast this vote.
    fn voter(&self) -> ReplicaId;

    /// True if both votes are for the same value.
    fn same_value(&self, other: &Self) -> bool;
}

#[derive(Debug, Clone)]
struct Tally<T> {
    value: T,
    count: usize,
}

/// Set of matching votes from distinct senders.
#[derive(Debug, Clone)]
pub struct Certificate<T: Vote> {
    threshold: usize,
    weak: usize,
    me: ReplicaId,
    votes: BTreeMap<ReplicaId, T>,
    tallies: Vec<Tally<T>>,
    correct: Option<usize>,
    complete: Option<usize>,
    sent_at: Option<Instant>,
}

impl<T: Vote> Certificate<T> {
    /// Certificate completing at `threshold` matching votes, treating a value
    /// with `weak` votes as known correct. `me` is the local replica.
    pub fn new(threshold: usize, weak: usize, me: ReplicaId) -> Self {
        Self {
            threshold,
            weak: weak.max(1),
            me,
            votes: BTreeMap::new(),
            tallies: Vec::new(),
            correct: None,
            complete: None,
            sent_at: None,
        }
    }

    /// Add a vote received from another replica.
    ///
    /// Rejected if the sender already voted or if a correct value is known
    /// and the vote disagrees with it.
    pub fn add(&mut self, vote: T) -> bool {
        let voter = vote.voter();
        if self.votes.contains_key(&voter) {
            return false;
        }
        if let Some(correct) = self.correct {
            if !self.tallies[correct].value.same_value(&vote) {
                return false;
            }
        }
        self.count(&vote);
        self.votes.insert(voter, vote);
        true
    }

    /// Add the local replica's own vote and remember when it was sent.
    ///
    /// The local value is trusted: it becomes the correct value unless one
    /// is already known, and later votes must match it.
    pub fn add_mine(&mut self, vote: T, now: Instant) -> bool {
        assert_eq!(vote.voter(), self.me, "add_mine called with a foreign vote");
        if self.votes.contains_key(&self.me) {
            return false;
        }
        if let Some(correct) = self.correct {
            if !self.tallies[correct].value.same_value(&vote) {
                return false;
            }
        }
        self.insert_mine(vote);
        self.sent_at = Some(now);
        true
    }

    fn insert_mine(&mut self, vote: T) {
        let index = self.count(&vote);
        if self.correct.is_none() {
            self.correct = Some(index);
        }
        self.votes.insert(self.me, vote);
    }

    fn count(&mut self, vote: &T) -> usize {
        let index = match self.tallies.iter().position(|t| t.value.same_value(vote)) {
            Some(index) => index,
            None => {
                self.tallies.push(Tally {
                    value: vote.clone(),
                    count: 0,
                });
                self.tallies.len() - 1
            }
        };
        let tally = &mut self.tallies[index];
        tally.count += 1;
        if tally.count >= self.weak && self.correct.is_none() {
            self.correct = Some(index);
        }
        if tally.count >= self.threshold && self.complete.is_none() {
            self.complete = Some(index);
        }
        index
    }

    /// True once one value reached the threshold.
    pub fn is_complete(&self) -> bool {
        self.complete.is_some()
    }

    /// Force completion on the local vote's value.
    ///
    /// Used when the local replica learns the value is stable by other means,
    /// e.g. after fetching the corresponding state.
    pub fn make_complete(&mut self) {
        if self.complete.is_some() {
            return;
        }
        if let Some(mine) = self.votes.get(&self.me) {
            let index = self.tallies.iter().position(|t| t.value.same_value(mine));
            if let Some(index) = index {
                self.correct = Some(index);
                self.complete = Some(index);
            }
        }
    }

    /// The value that completed the certificate.
    pub fn value(&self) -> Option<&T> {
        self.complete.map(|i| &self.tallies[i].value)
    }

    /// The value vouched for by at least `weak` senders.
    pub fn correct_value(&self) -> Option<&T> {
        self.correct.map(|i| &self.tallies[i].value)
    }

    /// Votes for the correct value, 0 if none is known.
    pub fn num_correct(&self) -> usize {
        self.correct.map(|i| self.tallies[i].count).unwrap_or(0)
    }

    /// The local replica's vote.
    pub fn mine(&self) -> Option<&T> {
        self.votes.get(&self.me)
    }

    /// When the local vote was last sent.
    pub fn mine_sent_at(&self) -> Option<Instant> {
        self.sent_at
    }

    /// Record a retransmission of the local vote.
    pub fn touch_mine(&mut self, now: Instant) {
        if self.votes.contains_key(&self.me) {
            self.sent_at = Some(now);
        }
    }

    /// Vote cast by `voter`.
    pub fn get(&self, voter: ReplicaId) -> Option<&T> {
        self.votes.get(&voter)
    }

    /// All votes in voter order.
    pub fn votes(&self) -> impl Iterator<Item = &T> {
        self.votes.values()
    }

    /// Number of votes held.
    pub fn len(&self) -> usize {
        self.votes.len()
    }

    /// True if no vote is held.
    pub fn is_empty(&self) -> bool {
        self.votes.is_empty()
    }

    /// Drop every vote except the local one.
    ///
    /// Called when session keys rotate so that peers re-send under fresh
    /// keys. A complete certificate is left alone.
    pub fn mark_stale(&mut self) {
        if self.is_complete() {
            return;
        }
        let mine = self.votes.remove(&self.me);
        let sent_at = self.sent_at;
        self.clear();
        if let Some(mine) = mine {
            self.insert_mine(mine);
            self.sent_at = sent_at;
        }
    }

    /// Empty the certificate.
    pub fn clear(&mut self) {
        self.votes.clear();
        self.tallies.clear();
        self.correct = None;
        self.complete = None;
        self.sent_at = None;
    }
}

impl<T: Vote> LogSlot for Certificate<T> {
    fn clear(&mut self) {
        Certificate::clear(self);
    }
}
