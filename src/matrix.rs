//! Sparse user×item confidence matrix for one region.

use std::collections::{BTreeMap, HashMap};
use tracing::debug;

use crate::data::{InteractionEvent, ItemKey};
use crate::errors::RecError;

#[derive(Debug, Clone)]
pub struct InteractionMatrix {
    region: String,
    user_ids: Vec<i64>,
    item_keys: Vec<ItemKey>,
    /// (user_index, item_index, confidence), sorted by user then item.
    entries: Vec<(usize, usize, f32)>,
}

impl InteractionMatrix {
    /// Aggregate raw events into confidences, dropping users and items with
    /// fewer than `min_interactions` events.
    pub fn build(
        region: &str,
        events: &[InteractionEvent],
        min_interactions: usize,
    ) -> Result<Self, RecError> {
        let mut user_counts: HashMap<i64, usize> = HashMap::new();
        let mut item_counts: HashMap<ItemKey, usize> = HashMap::new();
        for event in events {
            *user_counts.entry(event.user_id).or_insert(0) += 1;
            *item_counts.entry(event.item_key()).or_insert(0) += 1;
        }

        let mut cells: BTreeMap<(i64, ItemKey), f32> = BTreeMap::new();
        for event in events {
            let key = event.item_key();
            if user_counts[&event.user_id] < min_interactions
                || item_counts[&key] < min_interactions
            {
                continue;
            }
            *cells.entry((event.user_id, key)).or_insert(0.0) += event.action_weight;
        }

        if cells.is_empty() {
            return Err(RecError::InsufficientData {
                region: region.to_string(),
            });
        }

        let mut user_ids: Vec<i64> = cells.keys().map(|(u, _)| *u).collect();
        user_ids.dedup();
        let mut item_keys: Vec<ItemKey> = cells.keys().map(|(_, i)| *i).collect();
        item_keys.sort_unstable();
        item_keys.dedup();

        let user_index: HashMap<i64, usize> =
            user_ids.iter().enumerate().map(|(i, u)| (*u, i)).collect();
        let item_index: HashMap<ItemKey, usize> =
            item_keys.iter().enumerate().map(|(i, k)| (*k, i)).collect();

        let entries = cells
            .into_iter()
            .map(|((user, item), confidence)| (user_index[&user], item_index[&item], confidence))
            .collect::<Vec<_>>();

        debug!(
            region,
            users = user_ids.len(),
            items = item_keys.len(),
            nnz = entries.len(),
            "Built interaction matrix"
        );

        Ok(Self {
            region: region.to_string(),
            user_ids,
            item_keys,
            entries,
        })
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn n_users(&self) -> usize {
        self.user_ids.len()
    }

    pub fn n_items(&self) -> usize {
        self.item_keys.len()
    }

    pub fn user_ids(&self) -> &[i64] {
        &self.user_ids
    }

    pub fn item_keys(&self) -> &[ItemKey] {
        &self.item_keys
    }

    pub fn entries(&self) -> &[(usize, usize, f32)] {
        &self.entries
    }
}
