use crate::models::identifier::{normalize, size_hint_bytes};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Coarse hardware capability used for compatibility and recommendations
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HardwareTier {
    Low,
    Mid,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpeedClass {
    Fastest,
    Fast,
    Moderate,
    Slow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccuracyClass {
    Basic,
    Good,
    High,
    Best,
}

/// The device the catalog is evaluated for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceProfile {
    pub tier: HardwareTier,
}

impl Default for DeviceProfile {
    fn default() -> Self {
        Self::new(HardwareTier::Mid)
    }
}

impl DeviceProfile {
    #[must_use]
    pub const fn new(tier: HardwareTier) -> Self {
        Self { tier }
    }

    /// Model recommended for this device
    #[must_use]
    pub const fn recommended_id(&self) -> &'static str {
        match self.tier {
            HardwareTier::Low => "openai_whisper-base",
            HardwareTier::Mid => "openai_whisper-small",
            HardwareTier::High => "openai_whisper-large-v3_turbo",
        }
    }
}

/// One selectable model as presented to the user
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelCatalogEntry {
    pub id: String,
    pub display_name: String,
    pub size_bytes: u64,
    pub description: String,
    pub min_tier: HardwareTier,
    pub speed: SpeedClass,
    pub accuracy: AccuracyClass,
    pub recommended: bool,
    pub supported: bool,
    pub english_only: bool,
}

/// Metadata for a model this app knows about without asking the provider
#[derive(Debug, Clone, PartialEq, Eq)]
struct KnownModel {
    id: &'static str,
    display_name: &'static str,
    size_mb: u64,
    description: &'static str,
    min_tier: HardwareTier,
    speed: SpeedClass,
    accuracy: AccuracyClass,
    english_only: bool,
}

/// Built-in catalog, also the fallback when the provider is unreachable
const KNOWN_MODELS: &[KnownModel] = &[
    KnownModel {
        id: "openai_whisper-tiny",
        display_name: "Whisper Tiny",
        size_mb: 76,
        description: "Fastest, lowest accuracy",
        min_tier: HardwareTier::Low,
        speed: SpeedClass::Fastest,
        accuracy: AccuracyClass::Basic,
        english_only: false,
    },
    KnownModel {
        id: "openai_whisper-tiny.en",
        display_name: "Whisper Tiny (English)",
        size_mb: 76,
        description: "Fastest, English only",
        min_tier: HardwareTier::Low,
        speed: SpeedClass::Fastest,
        accuracy: AccuracyClass::Basic,
        english_only: true,
    },
    KnownModel {
        id: "openai_whisper-base",
        display_name: "Whisper Base",
        size_mb: 146,
        description: "Balanced for most use cases",
        min_tier: HardwareTier::Low,
        speed: SpeedClass::Fast,
        accuracy: AccuracyClass::Good,
        english_only: false,
    },
    KnownModel {
        id: "openai_whisper-base.en",
        display_name: "Whisper Base (English)",
        size_mb: 146,
        description: "Balanced, English only",
        min_tier: HardwareTier::Low,
        speed: SpeedClass::Fast,
        accuracy: AccuracyClass::Good,
        english_only: true,
    },
    KnownModel {
        id: "openai_whisper-small",
        display_name: "Whisper Small",
        size_mb: 483,
        description: "Better accuracy, slower",
        min_tier: HardwareTier::Mid,
        speed: SpeedClass::Moderate,
        accuracy: AccuracyClass::High,
        english_only: false,
    },
    KnownModel {
        id: "openai_whisper-small.en",
        display_name: "Whisper Small (English)",
        size_mb: 483,
        description: "Better accuracy, English only",
        min_tier: HardwareTier::Mid,
        speed: SpeedClass::Moderate,
        accuracy: AccuracyClass::High,
        english_only: true,
    },
    KnownModel {
        id: "distil-whisper_distil-large-v3",
        display_name: "Distil Whisper Large v3",
        size_mb: 1510,
        description: "Near large-v3 accuracy at twice the speed",
        min_tier: HardwareTier::High,
        speed: SpeedClass::Moderate,
        accuracy: AccuracyClass::High,
        english_only: true,
    },
    KnownModel {
        id: "openai_whisper-large-v3_turbo",
        display_name: "Whisper Large v3 Turbo",
        size_mb: 1620,
        description: "Best accuracy for its speed",
        min_tier: HardwareTier::High,
        speed: SpeedClass::Moderate,
        accuracy: AccuracyClass::Best,
        english_only: false,
    },
    KnownModel {
        id: "openai_whisper-large-v3",
        display_name: "Whisper Large v3",
        size_mb: 3090,
        description: "Best accuracy, very slow",
        min_tier: HardwareTier::High,
        speed: SpeedClass::Slow,
        accuracy: AccuracyClass::Best,
        english_only: false,
    },
];

impl KnownModel {
    fn find(id: &str) -> Option<&'static Self> {
        let id = normalize(id);
        KNOWN_MODELS.iter().find(|m| m.id == id)
    }
}

impl ModelCatalogEntry {
    fn from_known(model: &KnownModel, device: DeviceProfile) -> Self {
        Self {
            id: model.id.to_string(),
            display_name: model.display_name.to_string(),
            size_bytes: model.size_mb * 1_000_000,
            description: model.description.to_string(),
            min_tier: model.min_tier,
            speed: model.speed,
            accuracy: model.accuracy,
            recommended: device.recommended_id() == model.id,
            supported: device.tier >= model.min_tier,
            english_only: model.english_only,
        }
    }

    /// Entry for a variant only the provider knows; metadata is inferred from the name
    fn from_remote(raw_id: &str, device: DeviceProfile) -> Self {
        let id = normalize(raw_id);
        let lower = id.to_lowercase();
        let (min_tier, speed, accuracy) = if lower.contains("large") {
            (HardwareTier::High, SpeedClass::Slow, AccuracyClass::Best)
        } else if lower.contains("small") || lower.contains("medium") {
            (HardwareTier::Mid, SpeedClass::Moderate, AccuracyClass::High)
        } else {
            (HardwareTier::Low, SpeedClass::Fast, AccuracyClass::Good)
        };

        Self {
            display_name: display_name_for(&id),
            size_bytes: size_hint_bytes(raw_id).unwrap_or(0),
            description: format!("Published variant {raw_id}"),
            min_tier,
            speed,
            accuracy,
            recommended: device.recommended_id() == id,
            supported: device.tier >= min_tier,
            english_only: lower.ends_with(".en"),
            id,
        }
    }
}

/// Build catalog entries for the variants a provider lists.
///
/// Aliases collapse into one entry per canonical id, first occurrence wins.
#[must_use]
pub fn catalog_from_variants(variants: &[String], device: DeviceProfile) -> Vec<ModelCatalogEntry> {
    let mut entries: Vec<ModelCatalogEntry> = Vec::new();

    for variant in variants {
        let id = normalize(variant);
        if id.is_empty() || entries.iter().any(|e| e.id == id) {
            continue;
        }
        let entry = match KnownModel::find(&id) {
            Some(known) => ModelCatalogEntry::from_known(known, device),
            None => ModelCatalogEntry::from_remote(variant, device),
        };
        entries.push(entry);
    }

    entries
}

/// The built-in catalog; never empty
#[must_use]
pub fn fallback_catalog(device: DeviceProfile) -> Vec<ModelCatalogEntry> {
    KNOWN_MODELS
        .iter()
        .map(|model| ModelCatalogEntry::from_known(model, device))
        .collect()
}

/// Catalog presentation order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CatalogSort {
    Size,
    #[default]
    Recommended,
}

impl CatalogSort {
    pub fn apply(self, entries: &mut [ModelCatalogEntry]) {
        match self {
            Self::Size => sort_by_size(entries),
            Self::Recommended => sort_by_recommendation(entries),
        }
    }
}

/// Ascending size, then case-insensitive name, then id
pub fn sort_by_size(entries: &mut [ModelCatalogEntry]) {
    entries.sort_by(size_order);
}

/// Recommended first, then supported, then the size order
pub fn sort_by_recommendation(entries: &mut [ModelCatalogEntry]) {
    entries.sort_by(|a, b| {
        b.recommended
            .cmp(&a.recommended)
            .then_with(|| b.supported.cmp(&a.supported))
            .then_with(|| size_order(a, b))
    });
}

fn size_order(a: &ModelCatalogEntry, b: &ModelCatalogEntry) -> Ordering {
    a.size_bytes
        .cmp(&b.size_bytes)
        .then_with(|| {
            a.display_name
                .to_lowercase()
                .cmp(&b.display_name.to_lowercase())
        })
        .then_with(|| a.id.cmp(&b.id))
}

fn display_name_for(id: &str) -> String {
    let short = id
        .strip_prefix("openai_whisper-")
        .or_else(|| id.strip_prefix("distil-whisper_"))
        .unwrap_or(id);
    format!("Whisper {short}")
}

/// Find closest catalog id using Levenshtein distance
#[must_use]
pub fn suggest<'a>(name: &str, entries: &'a [ModelCatalogEntry]) -> Option<&'a str> {
    let name = normalize(name);
    if name.is_empty() {
        return None;
    }

    entries
        .iter()
        .map(|e| (e.id.as_str(), levenshtein_distance(&name, &e.id)))
        .min_by_key(|(_, dist)| *dist)
        .filter(|(_, dist)| *dist <= 3) // Only suggest if within 3 edits
        .map(|(id, _)| id)
}

/// Calculate Levenshtein distance between two strings
#[allow(clippy::needless_range_loop)]
fn levenshtein_distance(s1: &str, s2: &str) -> usize {
    let len1 = s1.chars().count();
    let len2 = s2.chars().count();

    if len1 == 0 {
        return len2;
    }
    if len2 == 0 {
        return len1;
    }

    let mut matrix = vec![vec![0; len2 + 1]; len1 + 1];

    for i in 0..=len1 {
        matrix[i][0] = i;
    }
    for j in 0..=len2 {
        matrix[0][j] = j;
    }

    let s1_chars: Vec<char> = s1.chars().collect();
    let s2_chars: Vec<char> = s2.chars().collect();

    for (i, c1) in s1_chars.iter().enumerate() {
        for (j, c2) in s2_chars.iter().enumerate() {
            let cost = usize::from(c1 != c2);
            matrix[i + 1][j + 1] = (matrix[i][j + 1] + 1)
                .min(matrix[i + 1][j] + 1)
                .min(matrix[i][j] + cost);
        }
    }

    matrix[len1][len2]
}

#[cfg(test)]
mod tests {
    use super::*;

    const MID: DeviceProfile = DeviceProfile::new(HardwareTier::Mid);

    fn entry(id: &str, name: &str, size_bytes: u64) -> ModelCatalogEntry {
        ModelCatalogEntry {
            id: id.to_string(),
            display_name: name.to_string(),
            size_bytes,
            description: String::new(),
            min_tier: HardwareTier::Low,
            speed: SpeedClass::Fast,
            accuracy: AccuracyClass::Good,
            recommended: false,
            supported: true,
            english_only: false,
        }
    }

    fn ids(entries: &[ModelCatalogEntry]) -> Vec<&str> {
        entries.iter().map(|e| e.id.as_str()).collect()
    }

    #[test]
    fn test_fallback_catalog_not_empty() {
        let catalog = fallback_catalog(MID);
        assert_eq!(catalog.len(), KNOWN_MODELS.len());
        assert_eq!(catalog.iter().filter(|e| e.recommended).count(), 1);
    }

    #[test]
    fn test_device_recommendation_and_support() {
        let catalog = fallback_catalog(MID);
        let small = catalog.iter().find(|e| e.id == "openai_whisper-small").unwrap();
        assert!(small.recommended);
        assert!(small.supported);

        let large = catalog.iter().find(|e| e.id == "openai_whisper-large-v3").unwrap();
        assert!(!large.recommended);
        assert!(!large.supported);
    }

    #[test]
    fn test_catalog_from_variants_collapses_aliases() {
        let variants = vec![
            "openai_whisper-large-v3_turbo_954MB".to_string(),
            "openai_whisper-large-v3_turbo".to_string(),
            "openai_whisper-base".to_string(),
        ];
        let catalog = catalog_from_variants(&variants, MID);

        assert_eq!(
            ids(&catalog),
            vec!["openai_whisper-large-v3_turbo", "openai_whisper-base"]
        );
        assert_eq!(catalog[0].display_name, "Whisper Large v3 Turbo");
    }

    #[test]
    fn test_unknown_variant_metadata_inferred() {
        let variants = vec!["openai_whisper-medium_1GB".to_string()];
        let catalog = catalog_from_variants(&variants, MID);

        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog[0].id, "openai_whisper-medium");
        assert_eq!(catalog[0].display_name, "Whisper medium");
        assert_eq!(catalog[0].size_bytes, 1_000_000_000);
        assert_eq!(catalog[0].min_tier, HardwareTier::Mid);
        assert!(catalog[0].supported);
    }

    #[test]
    fn test_sort_by_size_tie_breaks() {
        let mut entries = vec![
            entry("c", "beta", 200),
            entry("b", "Alpha", 200),
            entry("a", "alpha", 200),
            entry("z", "Zulu", 100),
        ];
        sort_by_size(&mut entries);
        assert_eq!(ids(&entries), vec!["z", "a", "b", "c"]);
    }

    #[test]
    fn test_sort_by_recommendation() {
        let mut recommended = entry("big", "Big", 3_000);
        recommended.recommended = true;
        let mut unsupported = entry("tiny-unsupported", "Tiny", 1);
        unsupported.supported = false;

        let mut entries = vec![
            unsupported,
            entry("mid", "Mid", 500),
            recommended,
            entry("small", "Small", 100),
        ];
        sort_by_recommendation(&mut entries);
        assert_eq!(ids(&entries), vec!["big", "small", "mid", "tiny-unsupported"]);
    }

    #[test]
    fn test_catalog_sort_apply() {
        let mut entries = fallback_catalog(MID);
        CatalogSort::Size.apply(&mut entries);
        assert!(entries.windows(2).all(|w| w[0].size_bytes <= w[1].size_bytes));

        CatalogSort::Recommended.apply(&mut entries);
        assert_eq!(entries[0].id, "openai_whisper-small");
    }

    #[test]
    fn test_suggest() {
        let catalog = fallback_catalog(MID);
        assert_eq!(suggest("openai_whisper-bse", &catalog), Some("openai_whisper-base"));
        assert_eq!(suggest("openai_whisper-smal", &catalog), Some("openai_whisper-small"));
        assert_eq!(suggest("something-else-entirely", &catalog), None);
        assert_eq!(suggest("", &catalog), None);
    }

    #[test]
    fn test_levenshtein_distance() {
        assert_eq!(levenshtein_distance("", ""), 0);
        assert_eq!(levenshtein_distance("base", "base"), 0);
        assert_eq!(levenshtein_distance("base", "basee"), 1);
        assert_eq!(levenshtein_distance("kitten", "sitting"), 3);
    }
}
