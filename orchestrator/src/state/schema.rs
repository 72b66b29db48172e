//! Column family definitions for the RocksDB run archive
//!
//! Each column family holds one record kind of a finished run.

/// Column family for run headers
pub const CF_RUNS: &str = "runs";

/// Column family for task records
pub const CF_TASKS: &str = "tasks";

/// Column family for consensus records
pub const CF_CONSENSUS: &str = "consensus";

/// Column family for cost ledgers
pub const CF_LEDGERS: &str = "ledgers";

/// All column family names
pub const ALL_CFS: &[&str] = &[CF_RUNS, CF_TASKS, CF_CONSENSUS, CF_LEDGERS];

/// Key prefixes for compound keys
pub mod keys {
    /// Create a run key
    pub fn run(run_id: &str) -> String {
        format!("run:{}", run_id)
    }

    /// Prefix shared by all tasks of a run
    pub fn task_prefix(run_id: &str) -> String {
        format!("task:{}:", run_id)
    }

    /// Create a task key (run + puzzle + model)
    pub fn task(run_id: &str, puzzle_id: &str, model_id: &str) -> String {
        format!("task:{}:{}:{}", run_id, puzzle_id, model_id)
    }

    /// Prefix shared by all consensus records of a run
    pub fn consensus_prefix(run_id: &str) -> String {
        format!("consensus:{}:", run_id)
    }

    /// Create a consensus key (run + puzzle)
    pub fn consensus(run_id: &str, puzzle_id: &str) -> String {
        format!("consensus:{}:{}", run_id, puzzle_id)
    }

    /// Create a ledger key
    pub fn ledger(run_id: &str) -> String {
        format!("ledger:{}", run_id)
    }

    /// Extract the run id from a run key
    pub fn parse_run_id(key: &str) -> Option<&str> {
        key.strip_prefix("run:").filter(|id| !id.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_formats() {
        assert_eq!(keys::run("r1"), "run:r1");
        assert_eq!(keys::task("r1", "p1", "m1"), "task:r1:p1:m1");
        assert!(keys::task("r1", "p1", "m1").starts_with(&keys::task_prefix("r1")));
        assert_eq!(keys::consensus("r1", "p1"), "consensus:r1:p1");
        assert_eq!(keys::consensus_prefix("r1"), "consensus:r1:");
        assert!(keys::consensus("r1", "p1").starts_with(&keys::consensus_prefix("r1")));
        assert_eq!(keys::ledger("r1"), "ledger:r1");
    }

    #[test]
    fn test_parse_run_id() {
        assert_eq!(keys::parse_run_id("run:abc"), Some("abc"));
        assert_eq!(keys::parse_run_id("run:"), None);
        assert_eq!(keys::parse_run_id("task:abc"), None);
    }

    #[test]
    fn test_all_cfs() {
        assert_eq!(ALL_CFS.len(), 4);
        assert!(ALL_CFS.contains(&CF_LEDGERS));
    }
}
