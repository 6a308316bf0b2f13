//! Optional retrieval refinements: query expansion, candidate merging and
//! path priors.
//!
//! Both refinements are off by default. With them off the flow ranks
//! purely by index similarity.

use std::collections::HashMap;

use crate::store::{rank_hits, IndexHit};

/// Extra phrasings retrieved alongside the user's question when expansion
/// is enabled. Onboarding questions ("what does this repo do?") rarely
/// share vocabulary with the code that answers them.
const EXPANSIONS: &[&str] = &[
    "Find the purpose, overview, or description of the project.",
    "Find how to install, set up, and run this project.",
    "Find how to test, lint, format, and the development workflow.",
];

/// Standalone probes that surface entry points and package structure.
const PROBES: &[&str] = &[
    "Project purpose module docstring overview package description",
    "Entry points main app cli command line",
];

/// The question followed by its expansions, in a fixed order.
pub fn expand_query(question: &str) -> Vec<String> {
    let mut queries = Vec::with_capacity(1 + EXPANSIONS.len() + PROBES.len());
    queries.push(question.to_string());
    for suffix in EXPANSIONS {
        queries.push(format!("{}\n{}", question, suffix));
    }
    queries.extend(PROBES.iter().map(|p| p.to_string()));
    queries
}

/// Merge candidate lists, keeping the best score per
/// `(file_path, sequence_index)`, ranked with [`rank_hits`].
pub fn merge_candidates(lists: Vec<Vec<IndexHit>>) -> Vec<IndexHit> {
    let mut best: HashMap<(String, u32), IndexHit> = HashMap::new();
    for hit in lists.into_iter().flatten() {
        let key = (hit.metadata.file_path.clone(), hit.metadata.sequence_index);
        match best.get(&key) {
            Some(existing) if existing.score >= hit.score => {}
            _ => {
                best.insert(key, hit);
            }
        }
    }
    let mut merged: Vec<IndexHit> = best.into_values().collect();
    rank_hits(&mut merged);
    merged
}

/// Additive score adjustment for a file path.
///
/// Favours READMEs, docs, `src/` and package manifests; penalises CI and
/// devcontainer configuration and test trees.
pub fn path_prior(path: &str) -> f32 {
    let p = path.to_lowercase();
    let file_name = p.rsplit('/').next().unwrap_or(&p);
    let mut boost = 0.0f32;

    if p.starts_with("src/") || p.contains("/src/") {
        boost += 0.20;
    }
    if matches!(file_name, "__init__.py" | "lib.rs" | "main.rs" | "index.ts" | "index.js") {
        boost += 0.10;
    }
    if p.starts_with("app/") || p.starts_with("backend/") {
        boost += 0.05;
    }
    if file_name.starts_with("readme") {
        boost += 0.25;
    }
    if p.starts_with("docs/") || p.starts_with("doc/") {
        boost += 0.12;
    }
    if matches!(
        file_name,
        "pyproject.toml" | "setup.cfg" | "setup.py" | "cargo.toml" | "package.json" | "go.mod"
    ) {
        boost += 0.10;
    }

    const NOISY: &[&str] = &[".devcontainer/", ".github/", ".circleci/", ".gitlab/"];
    if NOISY.iter().any(|prefix| p.starts_with(prefix)) {
        boost -= 0.10;
    }
    if p.starts_with("tests/") || p.starts_with("test/") || p.contains("/tests/") {
        boost -= 0.05;
    }

    boost
}

/// Apply [`path_prior`] to every hit and re-rank.
pub fn apply_path_priors(hits: &mut [IndexHit]) {
    for hit in hits.iter_mut() {
        hit.score += path_prior(&hit.metadata.file_path);
    }
    rank_hits(hits);
}
