use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fs,
    path::Path,
};

use anyhow::Context;
use itertools::Itertools;
use rand::{seq::index::sample, Rng};

/// Dense label ids, assigned in the order label names are first observed.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct LabelIndex {
    names: Vec<String>,
    ids: HashMap<String, usize>,
}

impl LabelIndex {
    pub fn from_labels<'a, I>(labels: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut index = LabelIndex::default();
        for label in labels {
            if !index.ids.contains_key(label) {
                index.ids.insert(label.to_string(), index.names.len());
                index.names.push(label.to_string());
            }
        }
        index
    }

    pub fn id(&self, name: &str) -> Option<usize> {
        self.ids.get(name).copied()
    }

    pub fn name(&self, id: usize) -> Option<&str> {
        self.names.get(id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let map = self
            .names
            .iter()
            .enumerate()
            .map(|(i, n)| (n.as_str(), i))
            .collect::<BTreeMap<_, _>>();
        fs::write(path, serde_json::to_vec(&map)?)
            .context(format!("could not write label mapping {:?}", path))?;
        info!("wrote {} labels to {:?}", self.len(), path);
        Ok(())
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct Split {
    pub train: Vec<usize>,
    pub validation: Vec<usize>,
}

/// Validation share of a label group of `group_size` items.
pub fn validation_size(group_size: usize, test_size: f64) -> usize {
    if group_size <= 1 {
        return 0;
    }
    let k = (test_size * group_size as f64).floor() as usize;
    k.clamp(1, group_size)
}

/// Splits item indices per label so every label keeps roughly `test_size` of
/// its items for validation. Singleton labels stay entirely in train.
pub fn stratified_split<R: Rng + ?Sized>(labels: &[usize], test_size: f64, rng: &mut R) -> Split {
    let groups = labels
        .iter()
        .enumerate()
        .map(|(item, label)| (*label, item))
        .into_group_map();

    let mut split = Split::default();
    // sorted label order keeps a seeded split reproducible
    for label in groups.keys().copied().sorted() {
        let group = &groups[&label];
        let k = validation_size(group.len(), test_size);
        let picked = sample(rng, group.len(), k).into_iter().collect::<HashSet<_>>();
        for (pos, item) in group.iter().enumerate() {
            if picked.contains(&pos) {
                split.validation.push(*item);
            } else {
                split.train.push(*item);
            }
        }
    }
    split.train.sort_unstable();
    split.validation.sort_unstable();
    split
}
