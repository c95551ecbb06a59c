//! Folds a polled batch into the highest score per player.

use std::collections::{BTreeMap, btree_map::Entry};

use crate::record::{ParseFailure, SourceRecord};

/// Result of reducing one batch. Malformed records are reported in
/// `rejected` and never contribute to `scores`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reduction {
    pub scores: BTreeMap<String, i64>,
    pub rejected: Vec<ParseFailure>,
}

impl Reduction {
    pub fn is_empty(&self) -> bool {
        self.scores.is_empty() && self.rejected.is_empty()
    }
}

pub fn reduce<'a, I>(batch: I) -> Reduction
where
    I: IntoIterator<Item = &'a SourceRecord>,
{
    let mut reduction = Reduction::default();
    for record in batch {
        match record.parse() {
            Ok(update) => match reduction.scores.entry(update.player_id) {
                Entry::Occupied(mut entry) => {
                    if update.score > *entry.get() {
                        entry.insert(update.score);
                    }
                }
                Entry::Vacant(entry) => {
                    entry.insert(update.score);
                }
            },
            Err(error) => reduction
                .rejected
                .push(ParseFailure::from_record(record, error)),
        }
    }
    reduction
}
