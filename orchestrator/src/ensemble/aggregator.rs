//! Consensus aggregation for multi-model runs
//!
//! Collects per-model reports for each puzzle and finalizes the puzzle's
//! consensus exactly once, when every model in the run has reported.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};

use chrono::Utc;
use tracing::{debug, warn};

use crate::cost::PricingTable;
use crate::state::{
    ConsensusRecord, ModelId, ModelVerdict, PuzzleId, RunId, TaskKey, TaskOutcome,
};

use super::voting::majority_vote;

/// Tie-break rank: highest cost prior first, then earliest in the model list
type TieRank = (i64, Reverse<usize>);

/// Per-run consensus state
#[derive(Debug, Clone)]
pub struct ConsensusAggregator {
    run_id: RunId,
    models: Vec<ModelId>,
    tie_ranks: HashMap<ModelId, TieRank>,
    records: BTreeMap<PuzzleId, ConsensusRecord>,
}

impl ConsensusAggregator {
    pub fn new(run_id: RunId, models: Vec<ModelId>, pricing: &PricingTable) -> Self {
        let tie_ranks = models
            .iter()
            .enumerate()
            .map(|(i, m)| (m.clone(), (pricing.get(m).task_high_nanos, Reverse(i))))
            .collect();
        Self {
            run_id,
            models,
            tie_ranks,
            records: BTreeMap::new(),
        }
    }

    /// Record a model's terminal outcome for a puzzle.
    ///
    /// Returns the finalized record when this report completes the set.
    pub fn report(&mut self, key: &TaskKey, outcome: &TaskOutcome) -> Option<ConsensusRecord> {
        if !self.tie_ranks.contains_key(&key.model_id) {
            warn!(run_id = %self.run_id, task = %key, "Report from model outside the run");
            return None;
        }

        let record = self
            .records
            .entry(key.puzzle_id.clone())
            .or_insert_with(|| {
                ConsensusRecord::new(
                    self.run_id.clone(),
                    key.puzzle_id.clone(),
                    self.models.clone(),
                )
            });

        if record.finalized || record.has_report_from(&key.model_id) {
            debug!(task = %key, "Duplicate consensus report ignored");
            return None;
        }

        record.reports.push(ModelVerdict {
            model_id: key.model_id.clone(),
            verdict: outcome.verdict.clone(),
            correct: outcome.correct,
        });

        if !record.all_reported() {
            return None;
        }

        Self::finalize(record, &self.tie_ranks);
        Some(record.clone())
    }

    /// Finalize every open record with the reports received so far.
    ///
    /// Used when a run is cancelled; models that never reported are left out.
    pub fn finalize_open(&mut self) -> Vec<ConsensusRecord> {
        let mut finalized = Vec::new();
        for record in self.records.values_mut().filter(|r| !r.finalized) {
            Self::finalize(record, &self.tie_ranks);
            finalized.push(record.clone());
        }
        finalized
    }

    fn finalize(record: &mut ConsensusRecord, tie_ranks: &HashMap<ModelId, TieRank>) {
        let rank = |m: &ModelId| tie_ranks.get(m).copied().unwrap_or((i64::MIN, Reverse(usize::MAX)));
        match majority_vote(&record.reports, rank) {
            Some(vote) => {
                record.verdict = Some(vote.verdict);
                record.agreement = vote.agreement;
                record.correct = vote.correct;
                record.tie_broken = vote.tie_broken;
            }
            None => {
                record.verdict = None;
                record.agreement = 0.0;
                record.correct = false;
            }
        }
        record.finalized = true;
        record.finalized_at = Some(Utc::now());
    }

    pub fn get(&self, puzzle_id: &str) -> Option<&ConsensusRecord> {
        self.records.get(puzzle_id)
    }

    /// All records, ordered by puzzle id
    pub fn records(&self) -> Vec<ConsensusRecord> {
        self.records.values().cloned().collect()
    }

    pub fn finalized_count(&self) -> usize {
        self.records.values().filter(|r| r.finalized).count()
    }
}
