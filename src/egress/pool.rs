//! Candidate pool and per-candidate health state
//!
//! The pool is the single piece of shared mutable state in the egress path.
//! Dials snapshot the current candidate under a read lock, perform their I/O
//! unlocked, then record the outcome under a brief write lock. Transfer
//! callbacks from live streams and probe results mutate the same state.
//!
//! `current_rank` is the candidate new dials try first. A successful dial
//! moves it to the candidate that worked; health transitions re-point it at
//! the highest-priority healthy candidate (rank 0 when none is healthy); a
//! probe recovery moves it back up when the recovered candidate outranks the
//! one in use.

use super::candidate::Candidate;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::{Duration, Instant};

/// Consecutive dial failures before a candidate is considered down
pub const FAIL_THRESHOLD: u32 = 3;

/// Mutable health state for one candidate
#[derive(Debug)]
pub struct CandidateHealth {
    pub candidate: Candidate,
    pub healthy: bool,
    pub fail_count: u32,
    pub last_check: Option<DateTime<Utc>>,
}

impl CandidateHealth {
    fn new(candidate: Candidate) -> Self {
        CandidateHealth {
            candidate,
            healthy: true,
            fail_count: 0,
            last_check: None,
        }
    }
}

/// What a probe promotion did to the selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromoteOutcome {
    /// Candidate restored and selection moved back up to it
    FailedBack,
    /// Candidate restored without changing the selection
    Recovered,
    /// Candidate was already healthy
    Unchanged,
}

/// Per-candidate state exposed for diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct CandidateStatus {
    pub url: String,
    pub healthy: bool,
    pub fail_count: u32,
    pub last_check: Option<DateTime<Utc>>,
    pub is_current: bool,
    pub is_direct: bool,
}

/// Pool-wide state exposed for diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub candidates: Vec<CandidateStatus>,
    pub current_rank: usize,
    pub consecutive_transfer_fails: u64,
    pub last_transfer_ok_secs_ago: u64,
}

/// Ordered candidate pool with health tracking
pub struct Pool {
    candidates: Vec<CandidateHealth>,
    current_rank: usize,
    consecutive_transfer_fails: u64,
    last_transfer_ok: Instant,
}

impl Pool {
    /// Build a pool from a non-empty, rank-ordered candidate list
    pub fn new(candidates: Vec<Candidate>) -> Self {
        debug_assert!(!candidates.is_empty());
        Pool {
            candidates: candidates.into_iter().map(CandidateHealth::new).collect(),
            current_rank: 0,
            consecutive_transfer_fails: 0,
            last_transfer_ok: Instant::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn current_rank(&self) -> usize {
        self.current_rank
    }

    pub fn get(&self, rank: usize) -> &CandidateHealth {
        &self.candidates[rank]
    }

    /// The candidate new dials should try first
    pub fn pick_primary(&self) -> &CandidateHealth {
        &self.candidates[self.current_rank]
    }

    /// Healthy candidates in ascending rank order (the failover walk)
    pub fn healthy_in_rank_order(&self) -> impl Iterator<Item = &CandidateHealth> {
        self.candidates.iter().filter(|c| c.healthy)
    }

    /// Ranks of candidates that are down and eligible for probing
    pub fn probe_targets(&self) -> Vec<usize> {
        self.candidates
            .iter()
            .filter(|c| !c.healthy && !c.candidate.is_direct())
            .map(|c| c.candidate.rank)
            .collect()
    }

    /// True while user traffic has recently flowed; probes are redundant then
    pub fn recently_active(&self, idle_threshold: Duration) -> bool {
        self.last_transfer_ok.elapsed() < idle_threshold
    }

    /// Record a successful connect through `rank` and make it the selection
    pub fn mark_dial_ok(&mut self, rank: usize) {
        let entry = &mut self.candidates[rank];
        entry.healthy = true;
        entry.fail_count = 0;
        entry.last_check = Some(Utc::now());
        self.last_transfer_ok = Instant::now();
        self.consecutive_transfer_fails = 0;
        self.current_rank = rank;
    }

    /// Record a failed connect attempt through `rank`
    pub fn mark_dial_err(&mut self, rank: usize) {
        let entry = &mut self.candidates[rank];
        entry.fail_count += 1;
        entry.last_check = Some(Utc::now());
        if entry.fail_count >= FAIL_THRESHOLD {
            entry.healthy = false;
        }
        self.reselect_if_current_down();
    }

    /// A live stream moved n>0 bytes; the current path demonstrably works
    pub fn on_transfer_ok(&mut self) {
        self.last_transfer_ok = Instant::now();
        self.consecutive_transfer_fails = 0;
        let entry = &mut self.candidates[self.current_rank];
        entry.healthy = true;
        entry.fail_count = 0;
        entry.last_check = Some(Utc::now());
    }

    /// A live stream hit a read/write error; one is enough to depose
    pub fn on_transfer_err(&mut self) {
        self.consecutive_transfer_fails += 1;
        let entry = &mut self.candidates[self.current_rank];
        entry.healthy = false;
        entry.fail_count += 1;
        entry.last_check = Some(Utc::now());
        self.reselect_if_current_down();
    }

    /// Probe confirmed `rank` is reachable again
    pub fn promote_from_probe(&mut self, rank: usize) -> PromoteOutcome {
        let was_healthy = self.candidates[rank].healthy;
        let entry = &mut self.candidates[rank];
        entry.healthy = true;
        entry.fail_count = 0;
        entry.last_check = Some(Utc::now());

        if was_healthy {
            return PromoteOutcome::Unchanged;
        }
        if rank < self.current_rank || !self.candidates[self.current_rank].healthy {
            self.current_rank = rank;
            PromoteOutcome::FailedBack
        } else {
            PromoteOutcome::Recovered
        }
    }

    /// Probe found `rank` still unreachable
    pub fn demote_from_probe(&mut self, rank: usize) {
        let entry = &mut self.candidates[rank];
        entry.healthy = false;
        entry.fail_count += 1;
        entry.last_check = Some(Utc::now());
        self.reselect_if_current_down();
    }

    /// Re-point the selection at the best healthy candidate once the current
    /// one is down; rank 0 when nothing is healthy.
    fn reselect_if_current_down(&mut self) {
        if self.candidates[self.current_rank].healthy {
            return;
        }
        self.current_rank = self
            .candidates
            .iter()
            .position(|c| c.healthy)
            .unwrap_or(0);
    }

    /// Diagnostics snapshot
    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            candidates: self
                .candidates
                .iter()
                .map(|c| CandidateStatus {
                    url: c.candidate.url.clone(),
                    healthy: c.healthy,
                    fail_count: c.fail_count,
                    last_check: c.last_check,
                    is_current: c.candidate.rank == self.current_rank,
                    is_direct: c.candidate.is_direct(),
                })
                .collect(),
            current_rank: self.current_rank,
            consecutive_transfer_fails: self.consecutive_transfer_fails,
            last_transfer_ok_secs_ago: self.last_transfer_ok.elapsed().as_secs(),
        }
    }
}
