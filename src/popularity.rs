//! Regional popularity ranking used for cold-start users and the blend.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::debug;

use crate::data::{InteractionEvent, Item, ItemKey, ItemType};

#[derive(Debug, Clone, PartialEq)]
pub struct PopularItem {
    pub key: ItemKey,
    pub author_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    /// Sum of action weights received in the lookback window.
    pub weight: f32,
    /// `weight` divided by the regional maximum, 0 when nothing was engaged.
    pub score: f32,
}

/// Every item of one region ranked per item type by engagement.
///
/// Order is total: weight descending, then newest first, then item id, so
/// identical input always yields the identical ranking.
#[derive(Debug, Clone, Default)]
pub struct PopularityIndex {
    ranked: HashMap<ItemType, Vec<PopularItem>>,
    positions: HashMap<ItemKey, (ItemType, usize)>,
}

impl PopularityIndex {
    pub fn build(region: &str, items: &[Item], events: &[InteractionEvent]) -> Self {
        let mut weights: HashMap<ItemKey, f32> = HashMap::new();
        for event in events {
            *weights.entry(event.item_key()).or_insert(0.0) += event.action_weight;
        }

        let max_weight = items
            .iter()
            .filter(|item| item.region == region)
            .filter_map(|item| weights.get(&item.key()))
            .copied()
            .fold(0.0_f32, f32::max);

        let mut ranked: HashMap<ItemType, Vec<PopularItem>> = HashMap::new();
        for item in items.iter().filter(|item| item.region == region) {
            let weight = weights.get(&item.key()).copied().unwrap_or(0.0);
            let score = if max_weight > 0.0 {
                weight / max_weight
            } else {
                0.0
            };
            ranked.entry(item.item_type).or_default().push(PopularItem {
                key: item.key(),
                author_id: item.author_id,
                created_at: item.created_at,
                weight,
                score,
            });
        }

        let mut positions = HashMap::new();
        for (item_type, list) in ranked.iter_mut() {
            list.sort_by(|a, b| {
                b.weight
                    .total_cmp(&a.weight)
                    .then_with(|| b.created_at.cmp(&a.created_at))
                    .then_with(|| a.key.item_id.cmp(&b.key.item_id))
            });
            for (pos, entry) in list.iter().enumerate() {
                positions.insert(entry.key, (*item_type, pos));
            }
        }

        debug!(region, items = positions.len(), max_weight, "Built popularity index");

        Self {
            ranked,
            positions,
        }
    }

    /// Items of `item_type`, most popular first.
    pub fn ranked(&self, item_type: ItemType) -> &[PopularItem] {
        self.ranked
            .get(&item_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn get(&self, key: &ItemKey) -> Option<&PopularItem> {
        let (item_type, pos) = self.positions.get(key)?;
        self.ranked.get(item_type)?.get(*pos)
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}
