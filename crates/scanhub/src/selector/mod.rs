use std::collections::{HashMap, VecDeque};

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SelectError {
    #[error("no probes configured")]
    NoProbes,
    #[error("unknown probe '{0}'")]
    ProbeNotFound(String),
}

/// Picks the probe for the next dispatch. Deterministic over its inputs:
/// least-loaded first, ties broken by name, with one twist — a probe that took
/// every one of the last `max_consecutive` dispatches is skipped so a quiet
/// fleet member still gets work. A single-probe deployment keeps its probe.
pub fn select_probe(
    probes: &[String],
    active: &HashMap<String, i64>,
    history: &VecDeque<String>,
    max_consecutive: usize,
    requested: Option<&str>,
) -> Result<String, SelectError> {
    if let Some(name) = requested {
        return if probes.iter().any(|p| p == name) {
            Ok(name.to_string())
        } else {
            Err(SelectError::ProbeNotFound(name.to_string()))
        };
    }
    if probes.is_empty() {
        return Err(SelectError::NoProbes);
    }

    let load = |name: &String| active.get(name).copied().unwrap_or(0);
    let min_load = probes.iter().map(load).min().unwrap_or(0);
    let mut candidates: Vec<&String> = probes.iter().filter(|p| load(p) == min_load).collect();

    if let Some(streaky) = streak(history, max_consecutive) {
        let trimmed: Vec<&String> = candidates
            .iter()
            .copied()
            .filter(|p| p.as_str() != streaky)
            .collect();
        if !trimmed.is_empty() {
            candidates = trimmed;
        }
    }

    candidates.sort();
    candidates
        .first()
        .map(|p| (*p).to_string())
        .ok_or(SelectError::NoProbes)
}

/// The probe that took the last `max_consecutive` dispatches, if any.
fn streak(history: &VecDeque<String>, max_consecutive: usize) -> Option<&str> {
    if max_consecutive == 0 || history.len() < max_consecutive {
        return None;
    }
    let mut recent = history.iter().rev().take(max_consecutive);
    let first = recent.next()?;
    recent.all(|p| p == first).then(|| first.as_str())
}
