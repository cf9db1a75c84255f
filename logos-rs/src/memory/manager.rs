use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use super::{
    ArtifactSignal, MemoryAction, MemoryArtifact, MemoryRules, MemoryTier, SweepReport,
    TierAction, TierMarker, TierTransition,
};
use crate::errors::MemoryError;
use crate::utils::truncate_with_ellipsis;

/// Process-wide holder of memory artifacts and their tier markers.
///
/// Per-artifact access is serialized by the map's shard locks. At most one
/// decay sweep runs at a time; a second caller gets
/// [`MemoryError::SweepInProgress`].
pub struct MemoryTierManager {
    artifacts: DashMap<String, MemoryArtifact>,
    run_short_term: DashMap<Uuid, VecDeque<String>>,
    rules: RwLock<MemoryRules>,
    audit: Mutex<Vec<TierTransition>>,
    sweeping: AtomicBool,
}

struct SweepGuard<'a>(&'a AtomicBool);

impl Drop for SweepGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Default for MemoryTierManager {
    fn default() -> Self {
        Self::new(MemoryRules::default())
    }
}

impl MemoryTierManager {
    pub fn new(rules: MemoryRules) -> Self {
        Self {
            artifacts: DashMap::new(),
            run_short_term: DashMap::new(),
            rules: RwLock::new(rules),
            audit: Mutex::new(Vec::new()),
            sweeping: AtomicBool::new(false),
        }
    }

    pub fn rules(&self) -> MemoryRules {
        self.rules.read().clone()
    }

    /// Swap in reloaded rules. Existing markers keep their current values.
    pub fn set_rules(&self, rules: MemoryRules) {
        *self.rules.write() = rules;
        info!("memory rules reloaded");
    }

    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }

    pub fn get(&self, artifact_id: &str) -> Option<MemoryArtifact> {
        self.artifacts.get(artifact_id).map(|a| a.value().clone())
    }

    pub fn transitions(&self) -> Vec<TierTransition> {
        self.audit.lock().clone()
    }

    /// A pending review holds the artifact at mid-term whatever its score;
    /// only a confirmation lifts it to long-term.
    fn classify(&self, signal: &ArtifactSignal, rules: &MemoryRules) -> MemoryTier {
        let score = signal.importance.max(signal.confidence);
        if signal.user_confirmed {
            MemoryTier::LongTerm
        } else if signal.pending_review {
            MemoryTier::MidTerm
        } else if score >= rules.long_term.tag_threshold {
            MemoryTier::LongTerm
        } else if signal.retain || signal.pinned {
            MemoryTier::MidTerm
        } else {
            MemoryTier::ShortTerm
        }
    }

    fn ttl_for(tier: MemoryTier, rules: &MemoryRules) -> Option<i64> {
        match tier {
            MemoryTier::ShortTerm => Some(rules.short_term.default_ttl_secs),
            MemoryTier::MidTerm => Some(rules.mid_term.default_ttl_secs),
            MemoryTier::LongTerm => None,
        }
    }

    fn record(&self, transitions: Vec<TierTransition>) {
        if transitions.is_empty() {
            return;
        }
        for t in &transitions {
            debug!(
                artifact_id = %t.artifact_id,
                from = ?t.from,
                to = ?t.to,
                reason = %t.reason,
                "tier transition"
            );
        }
        self.audit.lock().extend(transitions);
    }

    /// Tag an artifact, or reinforce it if it is already held.
    ///
    /// Tagging never lowers an artifact's tier. A short-term artifact created
    /// for `run_id` counts against that run's short-term cap; the oldest
    /// short-term artifacts of the run are dropped when the cap is exceeded.
    pub fn tag(
        &self,
        signal: ArtifactSignal,
        run_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> (TierMarker, MemoryAction) {
        let rules = self.rules();
        let target = self.classify(&signal, &rules);
        let mut transitions = Vec::new();

        let (marker, action, created) = match self.artifacts.entry(signal.artifact_id.clone()) {
            Entry::Occupied(mut occupied) => {
                let artifact = occupied.get_mut();
                let marker = &mut artifact.marker;
                let before = marker.tier;

                marker.apply_decay(now, rules.mid_term.half_life_secs);
                marker.strength += rules.mid_term.reinforcement;
                marker.importance = marker.importance.max(signal.importance);
                marker.last_used = now;
                marker.decayed_at = now;
                marker.pinned |= signal.pinned;
                if signal.user_confirmed {
                    marker.awaiting_review = false;
                } else {
                    marker.awaiting_review |= signal.pending_review;
                }

                let action = if target > before {
                    marker.tier = target;
                    if target == MemoryTier::LongTerm {
                        marker.promoted_at = Some(now);
                    }
                    transitions.push(TierTransition {
                        artifact_id: signal.artifact_id.clone(),
                        from: Some(before),
                        to: Some(target),
                        reason: "re-tagged".to_string(),
                        at: now,
                    });
                    TierAction::Promoted
                } else {
                    TierAction::Reinforced
                };
                marker.refresh_ttl(Self::ttl_for(marker.tier, &rules), now);
                if !signal.payload.is_null() {
                    artifact.payload = signal.payload;
                }
                (artifact.marker.clone(), action, false)
            }
            Entry::Vacant(vacant) => {
                let mut marker = TierMarker {
                    artifact_id: signal.artifact_id.clone(),
                    tier: target,
                    strength: rules.mid_term.initial_strength,
                    importance: signal.importance,
                    last_used: now,
                    decayed_at: now,
                    ttl_secs: None,
                    expires_at: None,
                    pinned: signal.pinned,
                    awaiting_review: signal.pending_review && !signal.user_confirmed,
                    origin_run: run_id,
                    promoted_at: (target == MemoryTier::LongTerm).then_some(now),
                };
                marker.refresh_ttl(Self::ttl_for(target, &rules), now);
                transitions.push(TierTransition {
                    artifact_id: signal.artifact_id.clone(),
                    from: None,
                    to: Some(target),
                    reason: "tagged".to_string(),
                    at: now,
                });
                vacant.insert(MemoryArtifact {
                    marker: marker.clone(),
                    payload: signal.payload,
                });
                (marker, TierAction::Tagged, true)
            }
        };
        self.record(transitions);

        if created && marker.tier == MemoryTier::ShortTerm {
            if let Some(run_id) = run_id {
                self.enforce_run_cap(run_id, &marker.artifact_id, rules.short_term.max_items_per_run, now);
            }
        }

        let action = MemoryAction {
            artifact_id: marker.artifact_id.clone(),
            action,
            tier: Some(marker.tier),
        };
        (marker, action)
    }

    fn enforce_run_cap(&self, run_id: Uuid, artifact_id: &str, cap: usize, now: DateTime<Utc>) {
        let overflow: Vec<String> = {
            let mut ids = self.run_short_term.entry(run_id).or_default();
            ids.push_back(artifact_id.to_string());
            let mut dropped = Vec::new();
            while ids.len() > cap {
                if let Some(oldest) = ids.pop_front() {
                    dropped.push(oldest);
                }
            }
            dropped
        };

        let mut transitions = Vec::new();
        for id in overflow {
            let removed = self
                .artifacts
                .remove_if(&id, |_, a| a.marker.tier == MemoryTier::ShortTerm && !a.marker.pinned);
            if removed.is_some() {
                transitions.push(TierTransition {
                    artifact_id: id,
                    from: Some(MemoryTier::ShortTerm),
                    to: None,
                    reason: "short-term cap".to_string(),
                    at: now,
                });
            }
        }
        self.record(transitions);
    }

    /// Raise strength and refresh `last_used` and the TTL.
    pub fn reinforce(
        &self,
        artifact_id: &str,
        now: DateTime<Utc>,
    ) -> Result<TierMarker, MemoryError> {
        let rules = self.rules();
        let mut artifact = self
            .artifacts
            .get_mut(artifact_id)
            .ok_or_else(|| MemoryError::NotFound(artifact_id.to_string()))?;
        let marker = &mut artifact.marker;
        marker.apply_decay(now, rules.mid_term.half_life_secs);
        marker.strength += rules.mid_term.reinforcement;
        marker.last_used = now;
        marker.decayed_at = now;
        let ttl = Self::ttl_for(marker.tier, &rules);
        marker.refresh_ttl(ttl, now);
        Ok(marker.clone())
    }

    /// Decay mid-term strength, then evict or demote what fell out.
    ///
    /// - pinned artifacts are skipped entirely
    /// - mid-term artifacts below the eviction floor are removed
    /// - mid-term artifacts past their TTL are demoted to short-term
    /// - short-term artifacts past their TTL are removed
    /// - long-term artifacts are untouched (see [`Self::stale_long_term`])
    pub fn decay_sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, MemoryError> {
        if self
            .sweeping
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(MemoryError::SweepInProgress);
        }
        let _guard = SweepGuard(&self.sweeping);

        let rules = self.rules();
        let mut report = SweepReport {
            swept_at: now,
            decayed: 0,
            demoted: Vec::new(),
            evicted: Vec::new(),
        };
        let mut transitions = Vec::new();

        self.artifacts.retain(|id, artifact| {
            let marker = &mut artifact.marker;
            if marker.pinned {
                return true;
            }
            match marker.tier {
                MemoryTier::LongTerm => true,
                MemoryTier::ShortTerm => {
                    if marker.is_expired(now) {
                        report.evicted.push(id.clone());
                        transitions.push(TierTransition {
                            artifact_id: id.clone(),
                            from: Some(MemoryTier::ShortTerm),
                            to: None,
                            reason: "ttl expired".to_string(),
                            at: now,
                        });
                        false
                    } else {
                        true
                    }
                }
                MemoryTier::MidTerm => {
                    marker.apply_decay(now, rules.mid_term.half_life_secs);
                    report.decayed += 1;
                    if marker.strength < rules.mid_term.eviction_floor {
                        report.evicted.push(id.clone());
                        transitions.push(TierTransition {
                            artifact_id: id.clone(),
                            from: Some(MemoryTier::MidTerm),
                            to: None,
                            reason: "strength below eviction floor".to_string(),
                            at: now,
                        });
                        false
                    } else if marker.is_expired(now) {
                        marker.tier = MemoryTier::ShortTerm;
                        marker.refresh_ttl(Some(rules.short_term.default_ttl_secs), now);
                        report.demoted.push(id.clone());
                        transitions.push(TierTransition {
                            artifact_id: id.clone(),
                            from: Some(MemoryTier::MidTerm),
                            to: Some(MemoryTier::ShortTerm),
                            reason: "ttl expired".to_string(),
                            at: now,
                        });
                        true
                    } else {
                        true
                    }
                }
            }
        });

        self.run_short_term.retain(|_, ids| {
            ids.retain(|id| self.artifacts.contains_key(id));
            !ids.is_empty()
        });
        self.record(transitions);

        report.demoted.sort();
        report.evicted.sort();
        info!(
            decayed = report.decayed,
            demoted = report.demoted.len(),
            evicted = report.evicted.len(),
            "memory decay sweep"
        );
        Ok(report)
    }

    /// Promote mid-term artifacts whose strength or importance crossed the
    /// promotion thresholds. Artifacts awaiting review are skipped. Returns
    /// the promoted artifacts.
    pub fn promote_eligible(&self, now: DateTime<Utc>) -> Vec<MemoryArtifact> {
        let rules = self.rules();
        let mut promoted = Vec::new();
        let mut transitions = Vec::new();

        for mut entry in self.artifacts.iter_mut() {
            let artifact = entry.value_mut();
            if artifact.marker.tier != MemoryTier::MidTerm || artifact.marker.awaiting_review {
                continue;
            }
            artifact
                .marker
                .apply_decay(now, rules.mid_term.half_life_secs);
            let marker = &artifact.marker;
            let eligible = marker.strength >= rules.mid_term.promotion_strength
                || marker.importance >= rules.mid_term.promotion_importance;
            if !eligible {
                continue;
            }
            artifact.marker.tier = MemoryTier::LongTerm;
            artifact.marker.promoted_at = Some(now);
            artifact.marker.refresh_ttl(None, now);
            transitions.push(TierTransition {
                artifact_id: artifact.marker.artifact_id.clone(),
                from: Some(MemoryTier::MidTerm),
                to: Some(MemoryTier::LongTerm),
                reason: "promotion threshold crossed".to_string(),
                at: now,
            });
            promoted.push(artifact.clone());
        }
        self.record(transitions);

        promoted.sort_by(|a, b| a.marker.artifact_id.cmp(&b.marker.artifact_id));
        promoted
    }

    /// Explicit confirmation: promote to long-term regardless of thresholds.
    pub fn confirm(
        &self,
        artifact_id: &str,
        now: DateTime<Utc>,
    ) -> Result<TierMarker, MemoryError> {
        let marker = {
            let mut artifact = self
                .artifacts
                .get_mut(artifact_id)
                .ok_or_else(|| MemoryError::NotFound(artifact_id.to_string()))?;
            let from = artifact.marker.tier;
            if from == MemoryTier::LongTerm {
                return Ok(artifact.marker.clone());
            }
            artifact.marker.tier = MemoryTier::LongTerm;
            artifact.marker.awaiting_review = false;
            artifact.marker.promoted_at = Some(now);
            artifact.marker.last_used = now;
            artifact.marker.refresh_ttl(None, now);
            (from, artifact.marker.clone())
        };
        self.record(vec![TierTransition {
            artifact_id: artifact_id.to_string(),
            from: Some(marker.0),
            to: Some(MemoryTier::LongTerm),
            reason: "confirmed".to_string(),
            at: now,
        }]);
        Ok(marker.1)
    }

    /// Explicitly move a long-term artifact back to mid-term.
    pub fn demote(
        &self,
        artifact_id: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<TierMarker, MemoryError> {
        let rules = self.rules();
        let marker = {
            let mut artifact = self
                .artifacts
                .get_mut(artifact_id)
                .ok_or_else(|| MemoryError::NotFound(artifact_id.to_string()))?;
            if artifact.marker.tier != MemoryTier::LongTerm {
                return Err(MemoryError::InvalidTransition {
                    id: artifact_id.to_string(),
                    from: artifact.marker.tier,
                    to: MemoryTier::MidTerm,
                });
            }
            let marker = &mut artifact.marker;
            marker.tier = MemoryTier::MidTerm;
            marker.strength = rules.mid_term.initial_strength;
            marker.decayed_at = now;
            marker.promoted_at = None;
            marker.refresh_ttl(Some(rules.mid_term.default_ttl_secs), now);
            marker.clone()
        };
        self.record(vec![TierTransition {
            artifact_id: artifact_id.to_string(),
            from: Some(MemoryTier::LongTerm),
            to: Some(MemoryTier::MidTerm),
            reason: reason.to_string(),
            at: now,
        }]);
        Ok(marker)
    }

    pub fn pin(&self, artifact_id: &str) -> Result<TierMarker, MemoryError> {
        let mut artifact = self
            .artifacts
            .get_mut(artifact_id)
            .ok_or_else(|| MemoryError::NotFound(artifact_id.to_string()))?;
        artifact.marker.pinned = true;
        Ok(artifact.marker.clone())
    }

    /// Unpin; decay resumes from `now`.
    pub fn unpin(
        &self,
        artifact_id: &str,
        now: DateTime<Utc>,
    ) -> Result<TierMarker, MemoryError> {
        let mut artifact = self
            .artifacts
            .get_mut(artifact_id)
            .ok_or_else(|| MemoryError::NotFound(artifact_id.to_string()))?;
        artifact.marker.pinned = false;
        artifact.marker.decayed_at = now;
        Ok(artifact.marker.clone())
    }

    /// Long-term artifacts not used within `long_term.stale_after_secs`.
    pub fn stale_long_term(&self, now: DateTime<Utc>) -> Vec<String> {
        let stale_after = Duration::seconds(self.rules.read().long_term.stale_after_secs);
        let mut stale: Vec<String> = self
            .artifacts
            .iter()
            .filter(|a| {
                a.marker.tier == MemoryTier::LongTerm && a.marker.last_used + stale_after < now
            })
            .map(|a| a.key().clone())
            .collect();
        stale.sort();
        stale
    }

    /// Drop the short- and mid-term artifacts created by `run_id`.
    ///
    /// Long-term artifacts stand. Returns the discarded ids.
    pub fn discard_run(&self, run_id: Uuid, now: DateTime<Utc>) -> Vec<String> {
        let mut discarded = Vec::new();
        let mut transitions = Vec::new();
        self.artifacts.retain(|id, artifact| {
            let marker = &artifact.marker;
            if marker.origin_run == Some(run_id) && marker.tier != MemoryTier::LongTerm {
                discarded.push(id.clone());
                transitions.push(TierTransition {
                    artifact_id: id.clone(),
                    from: Some(marker.tier),
                    to: None,
                    reason: "run aborted".to_string(),
                    at: now,
                });
                false
            } else {
                true
            }
        });
        self.run_short_term.remove(&run_id);
        self.record(transitions);
        discarded.sort();
        discarded
    }

    /// Payload of a long-term artifact with its strings shortened to
    /// `long_term.summary_max_chars`. `None` for other tiers.
    ///
    /// When the payload carries a `properties` object (a stored graph
    /// write), only the property values are shortened; ids and type keys
    /// are left intact.
    pub fn long_term_payload(&self, artifact_id: &str) -> Option<Value> {
        let max_chars = self.rules.read().long_term.summary_max_chars;
        let artifact = self.artifacts.get(artifact_id)?;
        if artifact.marker.tier != MemoryTier::LongTerm {
            return None;
        }
        let mut payload = artifact.payload.clone();
        if let Some(properties) = payload.get_mut("properties").filter(|p| p.is_object()) {
            *properties = summarize(properties, max_chars);
            return Some(payload);
        }
        Some(summarize(&payload, max_chars))
    }
}

fn summarize(value: &Value, max_chars: usize) -> Value {
    match value {
        Value::String(s) => Value::String(truncate_with_ellipsis(s, max_chars)),
        Value::Array(items) => Value::Array(items.iter().map(|v| summarize(v, max_chars)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), summarize(v, max_chars)))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rules() -> MemoryRules {
        let mut rules = MemoryRules::default();
        rules.short_term.default_ttl_secs = 60;
        rules.short_term.max_items_per_run = 3;
        rules.mid_term.default_ttl_secs = 3600;
        rules.mid_term.half_life_secs = 100.0;
        rules.mid_term.eviction_floor = 0.3;
        rules.mid_term.promotion_strength = 2.0;
        rules.long_term.summary_max_chars = 8;
        rules.long_term.stale_after_secs = 1000;
        rules
    }

    fn mid(id: &str) -> ArtifactSignal {
        ArtifactSignal {
            retain: true,
            ..ArtifactSignal::new(id)
        }
    }

    #[test]
    fn tag_classifies_by_signal() {
        let m = MemoryTierManager::new(rules());
        let now = Utc::now();

        let (short, _) = m.tag(ArtifactSignal::new("s"), None, now);
        let (middle, _) = m.tag(mid("m"), None, now);
        let (long, action) = m.tag(
            ArtifactSignal {
                confidence: 0.95,
                ..ArtifactSignal::new("l")
            },
            None,
            now,
        );
        let (confirmed, _) = m.tag(
            ArtifactSignal {
                user_confirmed: true,
                ..ArtifactSignal::new("c")
            },
            None,
            now,
        );

        assert_eq!(short.tier, MemoryTier::ShortTerm);
        assert_eq!(middle.tier, MemoryTier::MidTerm);
        assert_eq!(long.tier, MemoryTier::LongTerm);
        assert_eq!(action.action, TierAction::Tagged);
        assert_eq!(confirmed.tier, MemoryTier::LongTerm);
    }

    #[test]
    fn pending_review_outranks_a_high_score() {
        let m = MemoryTierManager::new(rules());
        let now = Utc::now();
        let held = ArtifactSignal {
            importance: 0.99,
            confidence: 1.0,
            pending_review: true,
            ..ArtifactSignal::new("tie")
        };

        let (marker, _) = m.tag(held.clone(), None, now);
        assert_eq!(marker.tier, MemoryTier::MidTerm);
        assert!(marker.awaiting_review);

        // Reinforcement alone never promotes it.
        for _ in 0..5 {
            m.reinforce("tie", now).unwrap();
        }
        assert!(m.promote_eligible(now).is_empty());

        let (marker, _) = m.tag(
            ArtifactSignal {
                user_confirmed: true,
                ..held
            },
            None,
            now,
        );
        assert_eq!(marker.tier, MemoryTier::LongTerm);
        assert!(!marker.awaiting_review);
    }

    #[test]
    fn retagging_reinforces_and_never_lowers_tier() {
        let m = MemoryTierManager::new(rules());
        let now = Utc::now();
        m.tag(mid("a"), None, now);

        let (marker, action) = m.tag(ArtifactSignal::new("a"), None, now);
        assert_eq!(marker.tier, MemoryTier::MidTerm);
        assert_eq!(action.action, TierAction::Reinforced);
        assert!((marker.strength - 1.5).abs() < 1e-9);
    }

    #[test]
    fn decay_evicts_below_floor_but_spares_pinned() {
        let m = MemoryTierManager::new(rules());
        let now = Utc::now();
        m.tag(mid("weak"), None, now);
        m.tag(mid("pinned"), None, now);
        m.pin("pinned").unwrap();

        // Two half-lives: 1.0 -> 0.25, under the 0.3 floor.
        let report = m.decay_sweep(now + Duration::seconds(200)).unwrap();

        assert_eq!(report.evicted, vec!["weak".to_string()]);
        assert!(m.get("weak").is_none());
        let pinned = m.get("pinned").unwrap();
        assert_eq!(pinned.marker.strength, 1.0);
    }

    #[test]
    fn expired_mid_term_is_demoted_then_evicted() {
        let mut r = rules();
        r.mid_term.half_life_secs = 1.0e9;
        r.mid_term.default_ttl_secs = 10;
        let m = MemoryTierManager::new(r);
        let now = Utc::now();
        m.tag(mid("a"), None, now);

        let first = m.decay_sweep(now + Duration::seconds(11)).unwrap();
        assert_eq!(first.demoted, vec!["a".to_string()]);
        assert_eq!(m.get("a").unwrap().marker.tier, MemoryTier::ShortTerm);

        let second = m.decay_sweep(now + Duration::seconds(11 + 61)).unwrap();
        assert_eq!(second.evicted, vec!["a".to_string()]);
    }

    #[test]
    fn concurrent_sweep_is_refused() {
        let m = MemoryTierManager::new(rules());
        m.sweeping.store(true, Ordering::Release);
        assert_eq!(
            m.decay_sweep(Utc::now()).unwrap_err(),
            MemoryError::SweepInProgress
        );
        m.sweeping.store(false, Ordering::Release);
        assert!(m.decay_sweep(Utc::now()).is_ok());
    }

    #[test]
    fn reinforcement_leads_to_promotion() {
        let m = MemoryTierManager::new(rules());
        let now = Utc::now();
        m.tag(mid("a"), None, now);
        m.reinforce("a", now).unwrap();
        assert!(m.promote_eligible(now).is_empty());

        m.reinforce("a", now).unwrap();
        let promoted = m.promote_eligible(now);
        assert_eq!(promoted.len(), 1);
        assert_eq!(promoted[0].marker.tier, MemoryTier::LongTerm);

        let audit = m.transitions();
        let last = audit.last().unwrap();
        assert_eq!(last.from, Some(MemoryTier::MidTerm));
        assert_eq!(last.to, Some(MemoryTier::LongTerm));
    }

    #[test]
    fn promotion_is_one_way_until_explicit_demotion() {
        let m = MemoryTierManager::new(rules());
        let now = Utc::now();
        m.tag(mid("a"), None, now);
        m.confirm("a", now).unwrap();

        // Long-term items are not decayed or evicted by sweeps.
        m.decay_sweep(now + Duration::days(365)).unwrap();
        assert_eq!(m.get("a").unwrap().marker.tier, MemoryTier::LongTerm);

        let demoted = m.demote("a", "reviewer reverted", now).unwrap();
        assert_eq!(demoted.tier, MemoryTier::MidTerm);
        assert!(matches!(
            m.demote("a", "again", now),
            Err(MemoryError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn run_cap_drops_oldest_short_term() {
        let m = MemoryTierManager::new(rules());
        let run = Uuid::new_v4();
        let now = Utc::now();
        for i in 0..5 {
            m.tag(ArtifactSignal::new(format!("s{i}")), Some(run), now);
        }
        assert!(m.get("s0").is_none());
        assert!(m.get("s1").is_none());
        assert!(m.get("s4").is_some());
        assert_eq!(m.len(), 3);
    }

    #[test]
    fn discard_run_keeps_long_term() {
        let m = MemoryTierManager::new(rules());
        let run = Uuid::new_v4();
        let now = Utc::now();
        m.tag(mid("mid"), Some(run), now);
        m.tag(ArtifactSignal::new("short"), Some(run), now);
        m.tag(
            ArtifactSignal {
                user_confirmed: true,
                ..ArtifactSignal::new("long")
            },
            Some(run),
            now,
        );
        m.tag(mid("other-run"), Some(Uuid::new_v4()), now);

        let discarded = m.discard_run(run, now);
        assert_eq!(discarded, vec!["mid".to_string(), "short".to_string()]);
        assert!(m.get("long").is_some());
        assert!(m.get("other-run").is_some());
    }

    #[test]
    fn stale_long_term_is_reported() {
        let m = MemoryTierManager::new(rules());
        let now = Utc::now();
        m.tag(
            ArtifactSignal {
                user_confirmed: true,
                ..ArtifactSignal::new("old")
            },
            None,
            now,
        );
        assert!(m.stale_long_term(now + Duration::seconds(999)).is_empty());
        assert_eq!(m.stale_long_term(now + Duration::seconds(1001)), vec!["old".to_string()]);
    }

    #[test]
    fn long_term_payload_is_summarized() {
        let m = MemoryTierManager::new(rules());
        let now = Utc::now();
        m.tag(
            ArtifactSignal {
                user_confirmed: true,
                payload: json!({"summary": "a very long interaction summary", "n": 3}),
                ..ArtifactSignal::new("l")
            },
            None,
            now,
        );
        m.tag(mid("m"), None, now);

        let payload = m.long_term_payload("l").unwrap();
        assert_eq!(payload["summary"], "a ver...");
        assert_eq!(payload["n"], 3);
        assert!(m.long_term_payload("m").is_none());
    }

    #[test]
    fn summarizing_a_stored_write_keeps_its_identity() {
        let m = MemoryTierManager::new(rules());
        let write = json!({
            "op": "node",
            "type_key": "Organization",
            "id": "organization_5f1c2e",
            "properties": {"name": "Acme Pty Ltd", "employees": 40},
            "tier": "long_term"
        });
        m.tag(
            ArtifactSignal {
                user_confirmed: true,
                payload: write,
                ..ArtifactSignal::new("entity:organization_5f1c2e")
            },
            None,
            Utc::now(),
        );

        let payload = m.long_term_payload("entity:organization_5f1c2e").unwrap();
        assert_eq!(payload["id"], "organization_5f1c2e");
        assert_eq!(payload["type_key"], "Organization");
        assert_eq!(payload["op"], "node");
        assert_eq!(payload["properties"]["name"], "Acme ...");
        assert_eq!(payload["properties"]["employees"], 40);
    }
}
