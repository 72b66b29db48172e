//! Majority voting over model verdicts
//!
//! Failed tasks abstain. Ties between equally supported verdicts go to the
//! verdict backed by the highest-ranked model.

use std::cmp::Ordering;

use tracing::debug;

use crate::state::{ModelId, ModelVerdict};

/// Outcome of a voting round
#[derive(Debug, Clone, PartialEq)]
pub struct VoteOutcome {
    pub verdict: String,
    /// Supporters / reporters with a verdict
    pub agreement: f64,
    pub supporters: Vec<ModelId>,
    /// More than one verdict had the top count
    pub tie_broken: bool,
    /// The winning verdict matched the expected answer
    pub correct: bool,
}

/// Simple majority vote.
///
/// `rank` orders models for tie-breaks; the greater rank wins. Returns `None`
/// when no report carries a verdict.
pub fn majority_vote<R, F>(reports: &[ModelVerdict], rank: F) -> Option<VoteOutcome>
where
    R: Ord,
    F: Fn(&ModelId) -> R,
{
    // Groups in order of first appearance
    let mut groups: Vec<(&str, Vec<&ModelVerdict>)> = Vec::new();
    for report in reports {
        let Some(verdict) = report.verdict.as_deref() else {
            continue;
        };
        match groups.iter_mut().find(|(v, _)| *v == verdict) {
            Some((_, members)) => members.push(report),
            None => groups.push((verdict, vec![report])),
        }
    }

    let voters: usize = groups.iter().map(|(_, m)| m.len()).sum();
    let top = groups.iter().map(|(_, m)| m.len()).max()?;
    let candidates: Vec<&(&str, Vec<&ModelVerdict>)> =
        groups.iter().filter(|(_, m)| m.len() == top).collect();
    let tie_broken = candidates.len() > 1;

    let best_rank = |members: &Vec<&ModelVerdict>| members.iter().map(|r| rank(&r.model_id)).max();
    let (verdict, members) = candidates
        .into_iter()
        .max_by(|a, b| {
            best_rank(&a.1)
                .cmp(&best_rank(&b.1))
                // Equal ranks keep the earliest group
                .then(Ordering::Greater)
        })?;

    if tie_broken {
        debug!(verdict, supporters = members.len(), "Consensus tie broken");
    }

    Some(VoteOutcome {
        verdict: verdict.to_string(),
        agreement: members.len() as f64 / voters as f64,
        supporters: members.iter().map(|r| r.model_id.clone()).collect(),
        tie_broken,
        correct: members.iter().any(|r| r.correct),
    })
}
