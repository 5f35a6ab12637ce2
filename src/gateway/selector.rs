//! Usage: Candidate assembly (filters, level tiers) and round-robin rotation state.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::domain::providers::{GeminiProvider, Provider};
use crate::infra::blacklist::BlacklistStore;
use crate::shared::mutex_ext::MutexExt;

#[derive(Debug)]
pub(crate) struct Tier<T> {
    pub level: i64,
    pub providers: Vec<T>,
}

#[derive(Debug, Default)]
pub(crate) struct Selection<T> {
    pub tiers: Vec<Tier<T>>,
    pub skipped: usize,
}

impl<T> Selection<T> {
    pub(crate) fn is_empty(&self) -> bool {
        self.tiers.iter().all(|t| t.providers.is_empty())
    }

    pub(crate) fn candidate_count(&self) -> usize {
        self.tiers.iter().map(|t| t.providers.len()).sum()
    }

    pub(crate) fn find_by_name(&self, name: &str) -> Option<&T>
    where
        T: Named,
    {
        self.tiers
            .iter()
            .flat_map(|t| t.providers.iter())
            .find(|p| p.name() == name)
    }
}

pub(crate) trait Named {
    fn name(&self) -> &str;
}

impl Named for Provider {
    fn name(&self) -> &str {
        &self.name
    }
}

impl Named for GeminiProvider {
    fn name(&self) -> &str {
        &self.name
    }
}

/// Filters, in order: enabled + credentials present, config validation, model
/// support, not blacklisted. The skipped count feeds the 404 diagnostic.
/// Within a tier the user-authored config order is preserved.
pub(crate) fn select_candidates(
    providers: Vec<Provider>,
    requested_model: &str,
    blacklist: &BlacklistStore,
    platform: &str,
) -> Selection<Provider> {
    let mut skipped = 0usize;
    let mut active: Vec<Provider> = Vec::with_capacity(providers.len());

    for provider in providers {
        if !provider.enabled || provider.api_url.is_empty() || provider.api_key.is_empty() {
            continue;
        }

        let errors = provider.validate();
        if !errors.is_empty() {
            tracing::warn!(
                platform,
                provider = %provider.name,
                "provider failed config validation, skipped: {errors:?}"
            );
            skipped += 1;
            continue;
        }

        if !requested_model.is_empty() && !provider.is_model_supported(requested_model) {
            skipped += 1;
            continue;
        }

        if let Some(until) = blacklist.is_blacklisted(platform, &provider.name) {
            tracing::info!(
                platform,
                provider = %provider.name,
                until,
                "provider blacklisted, skipped"
            );
            skipped += 1;
            continue;
        }

        active.push(provider);
    }

    Selection {
        tiers: group_by_level(active, |p| p.level),
        skipped,
    }
}

pub(crate) fn select_gemini_candidates(
    providers: Vec<GeminiProvider>,
    blacklist: &BlacklistStore,
) -> Selection<GeminiProvider> {
    let mut skipped = 0usize;
    let mut active: Vec<GeminiProvider> = Vec::with_capacity(providers.len());

    for provider in providers {
        if !provider.enabled || provider.base_url.is_empty() {
            continue;
        }
        if let Some(until) = blacklist.is_blacklisted("gemini", &provider.name) {
            tracing::info!(provider = %provider.name, until, "gemini provider blacklisted, skipped");
            skipped += 1;
            continue;
        }
        active.push(provider);
    }

    Selection {
        tiers: group_by_level(active, |p| p.level),
        skipped,
    }
}

fn group_by_level<T>(items: Vec<T>, level_of: impl Fn(&T) -> i64) -> Vec<Tier<T>> {
    let mut groups: BTreeMap<i64, Vec<T>> = BTreeMap::new();
    for item in items {
        let level = level_of(&item).max(1);
        groups.entry(level).or_default().push(item);
    }
    groups
        .into_iter()
        .map(|(level, providers)| Tier { level, providers })
        .collect()
}

/// Round-robin rotation state, keyed by `platform:level`. Consulted only in
/// failover mode with the round-robin toggle on.
#[derive(Debug, Default)]
pub(crate) struct RoundRobinState {
    last_start: Mutex<HashMap<String, String>>,
}

impl RoundRobinState {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Rotate a tier so the provider after the previous round's starting
    /// provider goes first (wrapping). If the previous starter is gone
    /// (disabled or blacklisted since), the order is left unchanged.
    pub(crate) fn rotate<T: Named>(&self, platform: &str, level: i64, providers: Vec<T>) -> Vec<T> {
        if providers.len() <= 1 {
            return providers;
        }

        let key = format!("{platform}:{level}");
        let mut last_start = self.last_start.lock_or_recover();

        let previous = last_start.get(&key).cloned();
        last_start.insert(key.clone(), providers[0].name().to_string());

        let Some(previous) = previous else {
            return providers;
        };
        let Some(last_idx) = providers.iter().position(|p| p.name() == previous) else {
            return providers;
        };

        let mut rotated = providers;
        let rotate_by = (last_idx + 1) % rotated.len();
        rotated.rotate_left(rotate_by);
        last_start.insert(key, rotated[0].name().to_string());
        rotated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::notice::Notifier;
    use crate::infra::settings::SettingsStore;
    use std::sync::Arc;
    use std::time::Duration;

    fn blacklist() -> BlacklistStore {
        let dir = std::env::temp_dir().join(format!(
            "aio-relay-selector-{}-{}",
            std::process::id(),
            crate::shared::time::now_unix_millis()
        ));
        std::fs::create_dir_all(&dir).expect("mkdir");
        BlacklistStore::new(
            SettingsStore::new(&dir),
            Arc::new(Notifier::new(Duration::ZERO)),
        )
    }

    fn provider(name: &str, level: i64) -> Provider {
        Provider {
            name: name.to_string(),
            api_url: "https://a.example/api".to_string(),
            api_key: "k".to_string(),
            enabled: true,
            level,
            ..Default::default()
        }
    }

    #[test]
    fn disabled_or_credentialless_providers_never_count_as_skipped() {
        let bl = blacklist();
        let mut a = provider("A", 1);
        a.enabled = false;
        let mut b = provider("B", 1);
        b.api_key = String::new();

        let selection = select_candidates(vec![a, b, provider("C", 1)], "", &bl, "claude");
        assert_eq!(selection.candidate_count(), 1);
        assert_eq!(selection.skipped, 0);
    }

    #[test]
    fn model_filter_respects_universal_providers() {
        let bl = blacklist();
        let universal = provider("U", 1);
        let mut whitelisted = provider("W", 1);
        whitelisted.supported_models = vec!["m1".to_string()];
        let mut mapped = provider("M", 1);
        mapped
            .model_mapping
            .insert("m2".to_string(), "upstream-m2".to_string());

        let selection = select_candidates(
            vec![universal.clone(), whitelisted.clone(), mapped.clone()],
            "m2",
            &bl,
            "claude",
        );
        let names: Vec<&str> = selection.tiers[0].providers.iter().map(|p| p.name()).collect();
        assert_eq!(names, vec!["U", "M"]);
        assert_eq!(selection.skipped, 1);

        let selection = select_candidates(vec![universal, whitelisted, mapped], "", &bl, "claude");
        assert_eq!(selection.candidate_count(), 3);
    }

    #[test]
    fn blacklisted_providers_are_excluded() {
        let bl = blacklist();
        for _ in 0..3 {
            bl.record_failure("claude", "A", 1);
        }
        assert!(bl.is_blacklisted("claude", "A").is_some());

        let selection = select_candidates(
            vec![provider("A", 1), provider("B", 1)],
            "",
            &bl,
            "claude",
        );
        let names: Vec<&str> = selection.tiers[0].providers.iter().map(|p| p.name()).collect();
        assert_eq!(names, vec!["B"]);
        assert_eq!(selection.skipped, 1);

        // Same name under another platform is unaffected.
        let selection = select_candidates(vec![provider("A", 1)], "", &bl, "codex");
        assert_eq!(selection.candidate_count(), 1);
    }

    #[test]
    fn tiers_sort_ascending_and_zero_level_normalizes_to_one() {
        let bl = blacklist();
        let selection = select_candidates(
            vec![
                provider("C2", 2),
                provider("A0", 0),
                provider("B1", 1),
                provider("D2", 2),
            ],
            "",
            &bl,
            "claude",
        );

        let levels: Vec<i64> = selection.tiers.iter().map(|t| t.level).collect();
        assert_eq!(levels, vec![1, 2]);
        let tier1: Vec<&str> = selection.tiers[0].providers.iter().map(|p| p.name()).collect();
        assert_eq!(tier1, vec!["A0", "B1"]);
        let tier2: Vec<&str> = selection.tiers[1].providers.iter().map(|p| p.name()).collect();
        assert_eq!(tier2, vec!["C2", "D2"]);
    }

    #[test]
    fn round_robin_visits_each_provider_first_exactly_once_per_cycle() {
        let rr = RoundRobinState::new();
        let names = ["A", "B", "C"];
        let tier = || names.iter().map(|n| provider(n, 1)).collect::<Vec<_>>();

        let mut first_seen: Vec<String> = Vec::new();
        for _ in 0..names.len() {
            let rotated = rr.rotate("claude", 1, tier());
            first_seen.push(rotated[0].name.clone());
        }

        let mut sorted = first_seen.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), names.len(), "each provider led exactly once: {first_seen:?}");
    }

    #[test]
    fn round_robin_with_missing_previous_start_keeps_order() {
        let rr = RoundRobinState::new();
        let _ = rr.rotate(
            "claude",
            1,
            vec![provider("A", 1), provider("B", 1), provider("C", 1)],
        );
        // "A" recorded as start; it disappears (blacklisted), order is unchanged.
        let rotated = rr.rotate("claude", 1, vec![provider("B", 1), provider("C", 1)]);
        let names: Vec<&str> = rotated.iter().map(|p| p.name()).collect();
        assert_eq!(names, vec!["B", "C"]);
    }

    #[test]
    fn round_robin_is_scoped_per_platform_and_level() {
        let rr = RoundRobinState::new();
        let tier = || vec![provider("A", 1), provider("B", 1)];

        let _ = rr.rotate("claude", 1, tier());
        let rotated = rr.rotate("claude", 1, tier());
        assert_eq!(rotated[0].name, "B");

        // Fresh key: no history, unchanged.
        let rotated = rr.rotate("codex", 1, tier());
        assert_eq!(rotated[0].name, "A");
        let rotated = rr.rotate("claude", 2, tier());
        assert_eq!(rotated[0].name, "A");
    }

    #[test]
    fn single_provider_tiers_skip_rotation() {
        let rr = RoundRobinState::new();
        let rotated = rr.rotate("claude", 1, vec![provider("A", 1)]);
        assert_eq!(rotated[0].name, "A");
        let rotated = rr.rotate("claude", 1, vec![provider("A", 1)]);
        assert_eq!(rotated[0].name, "A");
    }
}
