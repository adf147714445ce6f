//! Query-vs-gallery classification.
//!
//! Two thresholds decide the outcome: an absolute distance cutoff T and a
//! margin M between the best and second-best identity. Classification is a
//! pure function of the query, its detection confidence and a gallery
//! snapshot; only reading the snapshot can fail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use crate::common::config::MatchingConfig;
use crate::common::{KioskError, Result};
use crate::core::types::{euclidean_distance, l2_normalize, Detection, Embedding, IdentityId, ProviderTag};
use crate::storage::ProfileStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Classification {
    Matched,
    NewFace,
    MultipleMatches,
    Unknown,
}

impl Classification {
    pub const ALL: [Classification; 4] = [
        Classification::Matched,
        Classification::NewFace,
        Classification::MultipleMatches,
        Classification::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Matched => "MATCHED",
            Classification::NewFace => "NEW_FACE",
            Classification::MultipleMatches => "MULTIPLE_MATCHES",
            Classification::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Classification {
    type Err = KioskError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_uppercase().replace('-', "_");
        Classification::ALL
            .into_iter()
            .find(|c| c.as_str() == normalized)
            .ok_or_else(|| KioskError::Other(anyhow::anyhow!("Unknown classification: {}", s)))
    }
}

/// One enrolled embedding as the matcher sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct GalleryEntry {
    pub identity: IdentityId,
    pub embedding: Embedding,
}

/// Point-in-time view of every active embedding for a single provider.
/// Iterating it twice yields the same entries.
#[derive(Debug, Clone)]
pub struct GallerySnapshot {
    provider: ProviderTag,
    entries: Vec<GalleryEntry>,
    taken_at: DateTime<Utc>,
}

impl GallerySnapshot {
    pub fn new(provider: ProviderTag, entries: Vec<GalleryEntry>) -> Self {
        Self { provider, entries, taken_at: Utc::now() }
    }

    pub fn provider(&self) -> &ProviderTag {
        &self.provider
    }

    pub fn taken_at(&self) -> DateTime<Utc> {
        self.taken_at
    }

    pub fn iter(&self) -> impl Iterator<Item = &GalleryEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub identity: IdentityId,
    pub distance: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub classification: Classification,
    /// Set only for `Matched`.
    pub identity: Option<IdentityId>,
    /// `clamp(1 - d/T)` of the best candidate, for `Matched` and `MultipleMatches`.
    pub confidence: Option<f32>,
    pub query_confidence: f32,
    pub provider: ProviderTag,
    /// Nearest identities, closest first.
    pub candidates: Vec<Candidate>,
}

impl MatchResult {
    pub fn best_distance(&self) -> Option<f32> {
        self.candidates.first().map(|c| c.distance)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatchPolicy {
    pub distance_threshold: f32,
    pub margin: f32,
    pub acceptance_floor: f32,
    pub normalize: bool,
    pub reported_candidates: usize,
}

impl From<&MatchingConfig> for MatchPolicy {
    fn from(config: &MatchingConfig) -> Self {
        Self {
            distance_threshold: config.distance_threshold,
            margin: config.margin,
            acceptance_floor: config.acceptance_floor,
            normalize: config.normalize_embeddings,
            reported_candidates: config.reported_candidates,
        }
    }
}

impl Default for MatchPolicy {
    fn default() -> Self {
        Self::from(&MatchingConfig::default())
    }
}

/// Float slack when comparing the best-to-runner-up gap with the margin, so
/// a gap equal to the margin in decimal terms counts as reaching it.
const MARGIN_TOLERANCE: f32 = 1e-5;

#[derive(Debug, Clone, Default)]
pub struct MatchingEngine {
    policy: MatchPolicy,
}

impl MatchingEngine {
    pub fn new(policy: MatchPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &MatchPolicy {
        &self.policy
    }

    /// Distance from the query to every identity in the gallery, keeping each
    /// identity's closest embedding. Sorted ascending, ties by identity.
    ///
    /// A gallery taken for another provider contributes nothing, and entries
    /// whose length differs from the query are skipped.
    pub fn rank(&self, provider: &ProviderTag, query: &[f32], gallery: &GallerySnapshot) -> Vec<Candidate> {
        if gallery.provider() != provider {
            tracing::warn!("Refusing to compare a {} query against a {} gallery", provider, gallery.provider());
            return Vec::new();
        }

        let query = self.prepare(query);
        let mut best: HashMap<&IdentityId, f32> = HashMap::new();

        for entry in gallery.iter() {
            if entry.embedding.len() != query.len() {
                tracing::debug!("Skipping {}-dimensional gallery entry for {}", entry.embedding.len(), entry.identity);
                continue;
            }
            let distance = euclidean_distance(&query, &self.prepare(&entry.embedding));
            best.entry(&entry.identity)
                .and_modify(|d| *d = d.min(distance))
                .or_insert(distance);
        }

        let mut ranked: Vec<Candidate> = best
            .into_iter()
            .map(|(identity, distance)| Candidate { identity: identity.clone(), distance })
            .collect();
        ranked.sort_by(|a, b| {
            a.distance.total_cmp(&b.distance).then_with(|| a.identity.cmp(&b.identity))
        });
        ranked
    }

    /// Classifies a query. Deterministic for a given snapshot.
    pub fn classify(
        &self,
        provider: &ProviderTag,
        query: &[f32],
        query_confidence: f32,
        gallery: &GallerySnapshot,
    ) -> MatchResult {
        let ranked = self.rank(provider, query, gallery);
        let threshold = self.policy.distance_threshold;

        let within: Vec<&Candidate> = ranked.iter().take_while(|c| c.distance <= threshold).collect();

        let (classification, identity, confidence) = match within.as_slice() {
            [] if query_confidence < self.policy.acceptance_floor => (Classification::Unknown, None, None),
            [] => (Classification::NewFace, None, None),
            [best, rest @ ..] => {
                let confidence = Some(self.distance_confidence(best.distance));
                // a runner-up beyond T never competes with the best candidate
                let gap = match rest.first() {
                    Some(second) => second.distance - best.distance,
                    None => f32::INFINITY,
                };
                if gap + MARGIN_TOLERANCE >= self.policy.margin {
                    (Classification::Matched, Some(best.identity.clone()), confidence)
                } else {
                    (Classification::MultipleMatches, None, confidence)
                }
            }
        };

        MatchResult {
            classification,
            identity,
            confidence,
            query_confidence,
            provider: provider.clone(),
            candidates: ranked.into_iter().take(self.policy.reported_candidates).collect(),
        }
    }

    pub fn classify_detection(&self, detection: &Detection, gallery: &GallerySnapshot) -> MatchResult {
        self.classify(&detection.provider, &detection.embedding, detection.confidence, gallery)
    }

    /// Takes a fresh gallery snapshot for the detection's provider and
    /// classifies against it.
    pub async fn match_detection(&self, store: &dyn ProfileStore, detection: &Detection) -> Result<MatchResult> {
        let gallery = store.list_active(&detection.provider).await?;
        let result = self.classify_detection(detection, &gallery);

        tracing::info!(
            "Match against {} gallery entries: {} {} (best distance {:?})",
            gallery.len(),
            result.classification,
            result.identity.as_ref().map(|i| i.as_str()).unwrap_or("-"),
            result.best_distance()
        );
        Ok(result)
    }

    fn distance_confidence(&self, distance: f32) -> f32 {
        (1.0 - distance / self.policy.distance_threshold).clamp(0.0, 1.0)
    }

    fn prepare(&self, v: &[f32]) -> Embedding {
        if self.policy.normalize {
            l2_normalize(v)
        } else {
            v.to_vec()
        }
    }
}
