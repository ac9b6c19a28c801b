//! Two-tier deduplication of the current cycle's listings against the
//! existing catalog.
//!
//! Tier one matches `(source_id, external_id)` exactly. Tier two buckets by
//! lowercased (brand, model, year) and matches on relative price tolerance
//! plus trigram description similarity. Everything here is pure planning;
//! the repository applies the resulting [`MergePlan`] transactionally.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::listing::NormalizedListing;
use crate::domain::vehicle::{NewVehicle, SourceRef, Vehicle, VehicleContent, VehicleUpdate};
use crate::models::config::DedupConfig;
use crate::processing::embedding::content_hash;

#[derive(Debug, Default, Clone, Serialize)]
pub struct DedupStats {
    pub merged: usize,
    pub created: usize,
    /// Fuzzy matches with more than one candidate above threshold; resolved
    /// deterministically but logged for audit.
    pub conflicts: usize,
}

#[derive(Debug)]
pub struct MergePlan {
    pub creates: Vec<NewVehicle>,
    pub updates: Vec<VehicleUpdate>,
    pub stats: DedupStats,
}

struct Entry {
    existing_id: Option<i32>,
    original_hash: Option<String>,
    content: VehicleContent,
    images: Vec<String>,
    sources: Vec<SourceRef>,
    last_scraped: DateTime<Utc>,
    touched: bool,
}

impl Entry {
    fn min_priority(&self, cfg: &DedupConfig) -> usize {
        self.sources
            .iter()
            .map(|s| source_priority(&s.source_id, cfg))
            .min()
            .unwrap_or(usize::MAX)
    }
}

fn source_priority(source_id: &str, cfg: &DedupConfig) -> usize {
    cfg.source_priority
        .iter()
        .position(|s| s == source_id)
        .unwrap_or(cfg.source_priority.len())
}

fn bucket_key(brand: &str, model: &str, year: i32) -> (String, String, i32) {
    (brand.to_lowercase(), model.to_lowercase(), year)
}

/// Relative price difference within tolerance. Zero-priced entries never
/// fuzzy-match.
fn price_close(a: f64, b: f64, tolerance: f64) -> bool {
    let max = a.max(b);
    if max <= 0.0 {
        return false;
    }
    ((a - b).abs() / max) <= tolerance
}

fn normalized_chars(text: &str) -> Vec<char> {
    let mut out = Vec::new();
    let mut last_space = true;
    for c in text.to_lowercase().chars() {
        if c.is_alphanumeric() {
            out.push(c);
            last_space = false;
        } else if !last_space {
            out.push(' ');
            last_space = true;
        }
    }
    while out.last() == Some(&' ') {
        out.pop();
    }
    out
}

fn trigrams(chars: &[char]) -> HashSet<String> {
    chars.windows(3).map(|w| w.iter().collect()).collect()
}

/// Jaccard similarity over character trigrams of the normalized texts.
pub fn trigram_similarity(a: &str, b: &str) -> f64 {
    let a = normalized_chars(a);
    let b = normalized_chars(b);
    if a.len() < 3 || b.len() < 3 {
        return if a == b && !a.is_empty() { 1.0 } else { 0.0 };
    }
    let ta = trigrams(&a);
    let tb = trigrams(&b);
    let intersection = ta.intersection(&tb).count();
    let union = ta.len() + tb.len() - intersection;
    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}

fn listing_content(listing: &NormalizedListing) -> VehicleContent {
    VehicleContent {
        brand: listing.brand.clone(),
        model: listing.model.clone(),
        year: listing.year,
        price_usd: listing.price_usd,
        mileage: listing.mileage,
        transmission: listing.transmission,
        fuel_type: listing.fuel_type,
        color: listing.color.clone(),
        location: listing.location.clone(),
        description: listing.description.clone(),
        contact: listing.contact.clone(),
        url: listing.url.clone(),
    }
}

fn listing_source_ref(listing: &NormalizedListing) -> SourceRef {
    SourceRef {
        source_id: listing.source_id.clone(),
        external_id: listing.external_id.clone(),
        url: listing.url.clone(),
        scraped_at: listing.scraped_at,
    }
}

fn merge_optional<T: Clone>(current: &Option<T>, incoming: &Option<T>, incoming_newer: bool) -> Option<T> {
    match (current, incoming) {
        (Some(c), Some(i)) => Some(if incoming_newer { i.clone() } else { c.clone() }),
        (Some(c), None) => Some(c.clone()),
        (None, Some(i)) => Some(i.clone()),
        (None, None) => None,
    }
}

fn merge_listing_into(entry: &mut Entry, listing: &NormalizedListing) {
    let incoming_newer = listing.scraped_at >= entry.last_scraped;
    let incoming = listing_content(listing);

    // Required fields: keep the most recently scraped values.
    if incoming_newer {
        entry.content.brand = incoming.brand;
        entry.content.model = incoming.model;
        entry.content.year = incoming.year;
        entry.content.price_usd = incoming.price_usd;
        entry.content.url = incoming.url;
        if !incoming.description.is_empty() {
            entry.content.description = incoming.description;
        }
    } else if entry.content.description.is_empty() {
        entry.content.description = incoming.description;
    }

    // Optional fields: prefer non-null, then most recent.
    entry.content.mileage = merge_optional(&entry.content.mileage, &incoming.mileage, incoming_newer);
    entry.content.transmission =
        merge_optional(&entry.content.transmission, &incoming.transmission, incoming_newer);
    entry.content.fuel_type =
        merge_optional(&entry.content.fuel_type, &incoming.fuel_type, incoming_newer);
    entry.content.color = merge_optional(&entry.content.color, &incoming.color, incoming_newer);
    entry.content.location =
        merge_optional(&entry.content.location, &incoming.location, incoming_newer);
    entry.content.contact =
        merge_optional(&entry.content.contact, &incoming.contact, incoming_newer);

    for image in &listing.images {
        if !entry.images.contains(image) {
            entry.images.push(image.clone());
        }
    }

    let incoming_ref = listing_source_ref(listing);
    match entry
        .sources
        .iter_mut()
        .find(|s| s.source_id == incoming_ref.source_id && s.external_id == incoming_ref.external_id)
    {
        Some(existing_ref) => {
            if incoming_ref.scraped_at >= existing_ref.scraped_at {
                *existing_ref = incoming_ref;
            }
        }
        None => entry.sources.push(incoming_ref),
    }

    if listing.scraped_at > entry.last_scraped {
        entry.last_scraped = listing.scraped_at;
    }
    entry.touched = true;
}

/// Collapse within-cycle duplicates of the same `(source_id, external_id)`,
/// keeping the most recently scraped record and unioning images.
fn collapse_cycle(listings: Vec<NormalizedListing>) -> Vec<NormalizedListing> {
    let mut by_ref: HashMap<(String, String), NormalizedListing> = HashMap::new();
    for listing in listings {
        let key = (listing.source_id.clone(), listing.external_id.clone());
        match by_ref.get_mut(&key) {
            Some(kept) => {
                let (newer, older) = if listing.scraped_at >= kept.scraped_at {
                    (listing, kept.clone())
                } else {
                    (kept.clone(), listing)
                };
                let mut merged = newer;
                for image in older.images {
                    if !merged.images.contains(&image) {
                        merged.images.push(image);
                    }
                }
                *kept = merged;
            }
            None => {
                by_ref.insert(key, listing);
            }
        }
    }
    by_ref.into_values().collect()
}

/// Plan the merge of one cycle's normalized listings into the catalog.
///
/// Deterministic by construction: listings are processed in (source
/// priority, source, external id) order and fuzzy candidates are compared
/// in source-priority order with recency tie-breaks, so the same inputs
/// always yield the same plan.
pub fn plan_cycle(
    listings: Vec<NormalizedListing>,
    existing: &[Vehicle],
    cfg: &DedupConfig,
) -> MergePlan {
    let mut stats = DedupStats::default();

    let mut entries: Vec<Entry> = existing
        .iter()
        .map(|v| Entry {
            existing_id: Some(v.id),
            original_hash: Some(v.content_hash.clone()),
            content: v.content.clone(),
            images: v.images.clone(),
            sources: v.sources.clone(),
            last_scraped: v.last_seen_at,
            touched: false,
        })
        .collect();

    let mut ref_index: HashMap<(String, String), usize> = HashMap::new();
    let mut bucket_index: HashMap<(String, String, i32), Vec<usize>> = HashMap::new();
    for (idx, entry) in entries.iter().enumerate() {
        for source in &entry.sources {
            ref_index.insert((source.source_id.clone(), source.external_id.clone()), idx);
        }
        bucket_index
            .entry(bucket_key(&entry.content.brand, &entry.content.model, entry.content.year))
            .or_default()
            .push(idx);
    }

    let mut listings = collapse_cycle(listings);
    listings.sort_by(|a, b| {
        source_priority(&a.source_id, cfg)
            .cmp(&source_priority(&b.source_id, cfg))
            .then_with(|| a.source_id.cmp(&b.source_id))
            .then_with(|| a.external_id.cmp(&b.external_id))
    });

    for listing in &listings {
        let ref_key = (listing.source_id.clone(), listing.external_id.clone());

        // Exact tier: the same listing seen in an earlier cycle.
        if let Some(&idx) = ref_index.get(&ref_key) {
            merge_listing_into(&mut entries[idx], listing);
            stats.merged += 1;
            continue;
        }

        // Fuzzy tier: same (brand, model, year) bucket, close price,
        // similar description.
        let bucket = bucket_key(&listing.brand, &listing.model, listing.year);
        let mut candidates: Vec<usize> = bucket_index
            .get(&bucket)
            .map(|indices| {
                indices
                    .iter()
                    .copied()
                    .filter(|&idx| {
                        let entry = &entries[idx];
                        price_close(entry.content.price_usd, listing.price_usd, cfg.price_tolerance)
                            && trigram_similarity(&entry.content.description, &listing.description)
                                >= cfg.text_similarity_threshold
                    })
                    .collect()
            })
            .unwrap_or_default();

        candidates.sort_by(|&a, &b| {
            entries[a]
                .min_priority(cfg)
                .cmp(&entries[b].min_priority(cfg))
                .then_with(|| entries[b].last_scraped.cmp(&entries[a].last_scraped))
                .then_with(|| entries[a].existing_id.cmp(&entries[b].existing_id))
        });

        if let Some(&winner) = candidates.first() {
            if candidates.len() > 1 {
                stats.conflicts += 1;
                log::warn!(
                    "ambiguous fuzzy match for {}/{}: {} candidates above threshold, keeping first by source priority",
                    listing.source_id,
                    listing.external_id,
                    candidates.len()
                );
            }
            merge_listing_into(&mut entries[winner], listing);
            ref_index.insert(ref_key, winner);
            stats.merged += 1;
            continue;
        }

        // First sighting of a new real-world vehicle.
        let idx = entries.len();
        entries.push(Entry {
            existing_id: None,
            original_hash: None,
            content: listing_content(listing),
            images: listing.images.clone(),
            sources: vec![listing_source_ref(listing)],
            last_scraped: listing.scraped_at,
            touched: true,
        });
        ref_index.insert(ref_key, idx);
        bucket_index.entry(bucket).or_default().push(idx);
        stats.created += 1;
    }

    let mut creates = Vec::new();
    let mut updates = Vec::new();
    for entry in entries {
        if !entry.touched {
            continue;
        }
        let hash = content_hash(&entry.content);
        match entry.existing_id {
            Some(id) => updates.push(VehicleUpdate {
                id,
                embedding_stale: entry.original_hash.as_deref() != Some(hash.as_str()),
                content: entry.content,
                images: entry.images,
                sources: entry.sources,
                content_hash: hash,
                last_seen_at: entry.last_scraped,
            }),
            None => creates.push(NewVehicle {
                content: entry.content,
                images: entry.images,
                sources: entry.sources,
                content_hash: hash,
                last_seen_at: entry.last_scraped,
            }),
        }
    }

    MergePlan {
        creates,
        updates,
        stats,
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::*;
    use crate::domain::listing::Transmission;

    fn listing(source: &str, external: &str, price: f64, description: &str) -> NormalizedListing {
        NormalizedListing {
            source_id: source.to_string(),
            external_id: external.to_string(),
            brand: "Toyota".to_string(),
            model: "4Runner".to_string(),
            year: 2019,
            price_usd: price,
            mileage: None,
            transmission: None,
            fuel_type: None,
            color: None,
            location: None,
            description: description.to_string(),
            images: vec![format!("https://img/{source}/{external}.jpg")],
            contact: None,
            url: format!("https://{source}.example/{external}"),
            scraped_at: Utc::now(),
        }
    }

    fn cfg() -> DedupConfig {
        DedupConfig::default()
    }

    const DESC: &str = "Toyota 4Runner 2019 SR5 4x4 automática poco uso único dueño";

    #[test]
    fn same_vehicle_from_two_sources_becomes_one_entity() {
        // Scenario: prices differ by ~3%, descriptions near-identical.
        let listings = vec![
            listing("tucarro", "MLV1", 32_500.0, DESC),
            listing("autocosmos", "9001", 31_525.0, DESC),
        ];

        let plan = plan_cycle(listings, &[], &cfg());

        assert_eq!(plan.creates.len(), 1);
        assert_eq!(plan.updates.len(), 0);
        assert_eq!(plan.stats.created, 1);
        assert_eq!(plan.stats.merged, 1);
        let sources = &plan.creates[0].sources;
        assert_eq!(sources.len(), 2);
        assert!(sources.iter().any(|s| s.source_id == "tucarro"));
        assert!(sources.iter().any(|s| s.source_id == "autocosmos"));
        // Images from both sightings survive the merge.
        assert_eq!(plan.creates[0].images.len(), 2);
    }

    #[test]
    fn price_outside_tolerance_stays_separate() {
        let listings = vec![
            listing("tucarro", "MLV1", 32_500.0, DESC),
            listing("autocosmos", "9001", 25_000.0, DESC),
        ];

        let plan = plan_cycle(listings, &[], &cfg());

        assert_eq!(plan.creates.len(), 2);
    }

    #[test]
    fn dissimilar_descriptions_stay_separate() {
        let listings = vec![
            listing("tucarro", "MLV1", 32_500.0, DESC),
            listing(
                "autocosmos",
                "9001",
                32_000.0,
                "se vende camioneta chocada para repuestos motor bueno",
            ),
        ];

        let plan = plan_cycle(listings, &[], &cfg());

        assert_eq!(plan.creates.len(), 2);
    }

    #[test]
    fn exact_tier_merges_across_cycles_without_hash_churn() {
        let first = plan_cycle(vec![listing("tucarro", "MLV1", 32_500.0, DESC)], &[], &cfg());
        let created = &first.creates[0];
        let vehicle = Vehicle {
            id: 7,
            content: created.content.clone(),
            images: created.images.clone(),
            sources: created.sources.clone(),
            embedding: Some(vec![0.0; 4]),
            content_hash: created.content_hash.clone(),
            last_seen_at: created.last_seen_at,
            missed_cycles: 0,
            is_active: true,
        };

        let mut again = listing("tucarro", "MLV1", 32_500.0, DESC);
        again.scraped_at = vehicle.last_seen_at + Duration::hours(12);
        let plan = plan_cycle(vec![again], &[vehicle], &cfg());

        assert!(plan.creates.is_empty());
        assert_eq!(plan.updates.len(), 1);
        assert_eq!(plan.updates[0].id, 7);
        // Unchanged content keeps the hash, so no re-embedding is required.
        assert!(!plan.updates[0].embedding_stale);
    }

    #[test]
    fn exact_tier_matches_deactivated_vehicles() {
        let first = plan_cycle(vec![listing("tucarro", "MLV1", 32_500.0, DESC)], &[], &cfg());
        let created = &first.creates[0];
        let retired = Vehicle {
            id: 3,
            content: created.content.clone(),
            images: created.images.clone(),
            sources: created.sources.clone(),
            embedding: None,
            content_hash: created.content_hash.clone(),
            last_seen_at: created.last_seen_at,
            missed_cycles: 3,
            is_active: false,
        };

        let mut reappeared = listing("tucarro", "MLV1", 32_500.0, DESC);
        reappeared.scraped_at = retired.last_seen_at + Duration::days(10);
        let plan = plan_cycle(vec![reappeared], &[retired], &cfg());

        // The retired row is updated, not duplicated.
        assert!(plan.creates.is_empty());
        assert_eq!(plan.updates.len(), 1);
        assert_eq!(plan.updates[0].id, 3);
    }

    #[test]
    fn changed_price_marks_embedding_stale() {
        let first = plan_cycle(vec![listing("tucarro", "MLV1", 32_500.0, DESC)], &[], &cfg());
        let created = &first.creates[0];
        let vehicle = Vehicle {
            id: 7,
            content: created.content.clone(),
            images: created.images.clone(),
            sources: created.sources.clone(),
            embedding: Some(vec![0.0; 4]),
            content_hash: created.content_hash.clone(),
            last_seen_at: created.last_seen_at,
            missed_cycles: 0,
            is_active: true,
        };

        let mut cheaper = listing("tucarro", "MLV1", 31_000.0, DESC);
        cheaper.scraped_at = vehicle.last_seen_at + Duration::hours(12);
        let plan = plan_cycle(vec![cheaper], &[vehicle], &cfg());

        assert!(plan.updates[0].embedding_stale);
        assert_eq!(plan.updates[0].content.price_usd, 31_000.0);
    }

    #[test]
    fn merge_prefers_non_null_fields() {
        let mut with_transmission = listing("tucarro", "MLV1", 32_500.0, DESC);
        with_transmission.transmission = Some(Transmission::Automatic);
        let mut newer_without = listing("autocosmos", "9001", 32_500.0, DESC);
        newer_without.scraped_at = with_transmission.scraped_at + Duration::hours(1);

        let plan = plan_cycle(vec![with_transmission, newer_without], &[], &cfg());

        assert_eq!(plan.creates.len(), 1);
        assert_eq!(
            plan.creates[0].content.transmission,
            Some(Transmission::Automatic)
        );
    }

    #[test]
    fn ambiguous_candidates_resolve_by_source_priority() {
        // Two existing vehicles whose prices differ too much to match each
        // other, with a probe priced within tolerance of both. The one whose
        // best source ranks higher in priority must win.
        let base = plan_cycle(
            vec![
                listing("autocosmos", "A1", 33_900.0, DESC),
                listing("mercadolibre", "MLV5", 31_000.0, DESC),
            ],
            &[],
            &cfg(),
        );
        assert_eq!(base.creates.len(), 2);
        let existing: Vec<Vehicle> = base
            .creates
            .iter()
            .enumerate()
            .map(|(i, c)| Vehicle {
                id: i as i32 + 1,
                content: c.content.clone(),
                images: c.images.clone(),
                sources: c.sources.clone(),
                embedding: None,
                content_hash: c.content_hash.clone(),
                last_seen_at: c.last_seen_at,
                missed_cycles: 0,
                is_active: true,
            })
            .collect();

        let probe = listing("tucarro", "MLV9", 32_400.0, DESC);
        let plan = plan_cycle(vec![probe], &existing, &cfg());

        assert_eq!(plan.stats.conflicts, 1);
        assert_eq!(plan.updates.len(), 1);
        // mercadolibre outranks autocosmos in the default priority order.
        let winner = &plan.updates[0];
        assert!(winner.sources.iter().any(|s| s.source_id == "mercadolibre"));
    }

    #[test]
    fn within_cycle_duplicate_of_same_ref_collapses() {
        let a = listing("tucarro", "MLV1", 32_500.0, DESC);
        let mut b = listing("tucarro", "MLV1", 32_000.0, DESC);
        b.scraped_at = a.scraped_at + Duration::minutes(5);
        b.images = vec!["https://img/other.jpg".to_string()];

        let plan = plan_cycle(vec![a, b], &[], &cfg());

        assert_eq!(plan.creates.len(), 1);
        assert_eq!(plan.creates[0].content.price_usd, 32_000.0);
        assert_eq!(plan.creates[0].images.len(), 2);
        assert_eq!(plan.creates[0].sources.len(), 1);
    }
}
