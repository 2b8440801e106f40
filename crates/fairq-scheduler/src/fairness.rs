//! Fair-share ordering of the pending queue
//!
//! A user's penalty is the sum of `e^-i` over the history positions `i`
//! (0 = most recent) that belong to the user. The decay is by rank, not by
//! wall-clock time.

use fairq_core::Job;
use std::collections::HashMap;

/// Penalty of a single user against a most-recent-first history
pub fn penalty<'a, I>(user: &str, history: I) -> f64
where
    I: IntoIterator<Item = &'a Job>,
{
    history
        .into_iter()
        .enumerate()
        .filter(|(_, job)| job.executor() == user)
        .map(|(i, _)| (-(i as f64)).exp())
        .sum()
}

/// Penalties of every user present in the history, in one pass
pub fn penalties<'a, I>(history: I) -> HashMap<String, f64>
where
    I: IntoIterator<Item = &'a Job>,
{
    let mut scores: HashMap<String, f64> = HashMap::new();
    for (i, job) in history.into_iter().enumerate() {
        *scores.entry(job.executor().to_string()).or_default() += (-(i as f64)).exp();
    }
    scores
}

/// Sort pending jobs by (penalty, submission time); stable for equal keys
pub fn sort_pending(pending: &mut [Job], scores: &HashMap<String, f64>) {
    let score = |job: &Job| scores.get(job.executor()).copied().unwrap_or(0.0);
    pending.sort_by(|a, b| {
        score(a)
            .total_cmp(&score(b))
            .then_with(|| a.created_at.cmp(&b.created_at))
    });
}

/// Penalty rounded for display
pub fn rounded(penalty: f64) -> f64 {
    (penalty * 10_000.0).round() / 10_000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use fairq_core::JobConfig;

    fn job(executor: &str, offset_secs: i64) -> Job {
        let mut job = Job::new(JobConfig::new(format!("job-{}", offset_secs), executor));
        job.created_at = Utc::now() + Duration::seconds(offset_secs);
        job
    }

    fn history(executors: &[&str]) -> Vec<Job> {
        executors.iter().map(|e| job(e, 0)).collect()
    }

    #[test]
    fn test_penalty_empty_history() {
        assert_eq!(penalty("ilja", &Vec::<Job>::new()), 0.0);
        assert!(penalties(&Vec::<Job>::new()).is_empty());
    }

    #[test]
    fn test_penalty_decays_by_rank() {
        let h = history(&["ilja", "markus", "ilja"]);
        let expected = 1.0 + (-2.0f64).exp();
        assert!((penalty("ilja", &h) - expected).abs() < 1e-12);
        assert!((penalty("markus", &h) - (-1.0f64).exp()).abs() < 1e-12);
        assert_eq!(penalty("anna", &h), 0.0);
    }

    #[test]
    fn test_more_recent_user_has_higher_penalty() {
        let h = history(&["ilja", "markus", "anna", "markus"]);
        assert!(penalty("ilja", &h) >= penalty("anna", &h));
        assert!(penalty("markus", &h) >= penalty("anna", &h));
    }

    #[test]
    fn test_penalties_match_single_lookups() {
        let h = history(&["ilja", "markus", "ilja", "anna", "ilja"]);
        let scores = penalties(&h);
        for user in ["ilja", "markus", "anna"] {
            assert!((scores[user] - penalty(user, &h)).abs() < 1e-12);
        }
    }

    #[test]
    fn test_sort_by_penalty_then_age() {
        let h = history(&["ilja"]);
        let mut pending = vec![job("ilja", 1), job("markus", 2), job("anna", 3)];
        sort_pending(&mut pending, &penalties(&h));

        let order: Vec<_> = pending.iter().map(|j| j.executor().to_string()).collect();
        assert_eq!(order, vec!["markus", "anna", "ilja"]);
    }

    #[test]
    fn test_equal_penalty_keeps_submission_order() {
        let mut pending = vec![job("ilja", 1), job("ilja", 2), job("markus", 3)];
        let ids: Vec<_> = pending.iter().map(|j| j.id).collect();
        sort_pending(&mut pending, &HashMap::new());
        assert_eq!(pending.iter().map(|j| j.id).collect::<Vec<_>>(), ids);
    }

    #[test]
    fn test_rounded() {
        assert_eq!(rounded((-1.0f64).exp()), 0.3679);
        assert_eq!(rounded(0.0), 0.0);
    }
}
