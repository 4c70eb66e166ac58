use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    path::Path,
};

use log::{debug, warn};
use serde::Deserialize;

use crate::error::{Result, RetrainErr};

/// The value a search result stores for one choice.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum ChoiceValue {
    /// One flag per candidate.
    Mask(Vec<bool>),
    Index(usize),
    Indices(Vec<usize>),
}

impl ChoiceValue {
    /// Resolves the value to the sorted, deduplicated candidate indices it selects.
    fn selected(&self, key: &str, candidates: usize) -> Result<Vec<usize>> {
        let selected: BTreeSet<usize> = match self {
            ChoiceValue::Mask(mask) => {
                if mask.len() != candidates {
                    return Err(RetrainErr::invalid_choice(
                        key,
                        format!("mask has {} entries for {candidates} candidates", mask.len()),
                    ));
                }

                mask.iter()
                    .enumerate()
                    .filter_map(|(i, &on)| on.then_some(i))
                    .collect()
            }
            ChoiceValue::Index(i) => BTreeSet::from([*i]),
            ChoiceValue::Indices(indices) => indices.iter().copied().collect(),
        };

        if let Some(&i) = selected.iter().find(|&&i| i >= candidates) {
            return Err(RetrainErr::invalid_choice(
                key,
                format!("index {i} is out of range for {candidates} candidates"),
            ));
        }

        Ok(selected.into_iter().collect())
    }
}

/// A fixed architecture, the result of a previous search.
///
/// Maps every choice of a model family to the candidates it keeps. Models consume the choices
/// while they're being built, `finish` then reports the ones nothing asked for.
#[derive(Debug, Clone, Default)]
pub struct FixedArchitecture {
    choices: BTreeMap<String, ChoiceValue>,
    used: BTreeSet<String>,
}

impl FixedArchitecture {
    /// Loads a fixed architecture from a JSON file.
    ///
    /// # Arguments
    /// * `path` - The search result's path.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| RetrainErr::io(path, e))?;
        let arch = Self::from_json(&content)?;
        debug!("loaded {} fixed choices from {}", arch.choices.len(), path.display());
        Ok(arch)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let choices = serde_json::from_str(content)?;
        Ok(Self {
            choices,
            used: BTreeSet::new(),
        })
    }

    /// Builds a fixed architecture straight from its choices.
    pub fn from_choices<I, K>(choices: I) -> Self
    where
        I: IntoIterator<Item = (K, ChoiceValue)>,
        K: Into<String>,
    {
        Self {
            choices: choices.into_iter().map(|(k, v)| (k.into(), v)).collect(),
            used: BTreeSet::new(),
        }
    }

    fn value(&mut self, key: &str) -> Result<&ChoiceValue> {
        let value = self
            .choices
            .get(key)
            .ok_or_else(|| RetrainErr::MissingChoice { key: key.to_string() })?;

        self.used.insert(key.to_string());
        Ok(value)
    }

    /// Resolves a choice that has to keep exactly one of `candidates`.
    ///
    /// # Returns
    /// The index of the kept candidate.
    pub fn choose_one(&mut self, key: &str, candidates: usize) -> Result<usize> {
        match self.value(key)?.selected(key, candidates)?.as_slice() {
            [i] => Ok(*i),
            other => Err(RetrainErr::invalid_choice(
                key,
                format!("exactly one candidate must be chosen, got {}", other.len()),
            )),
        }
    }

    /// Resolves a choice that keeps any subset of `candidates`.
    ///
    /// # Returns
    /// The sorted indices of the kept candidates, possibly none.
    pub fn choose_many(&mut self, key: &str, candidates: usize) -> Result<Vec<usize>> {
        self.value(key)?.selected(key, candidates)
    }

    /// Warns about every choice no model asked for.
    ///
    /// # Returns
    /// The unused keys.
    pub fn finish(self) -> Vec<String> {
        let unused: Vec<String> = self
            .choices
            .into_keys()
            .filter(|k| !self.used.contains(k))
            .collect();

        for key in &unused {
            warn!("fixed architecture choice {key} is not used by the model");
        }

        unused
    }
}
