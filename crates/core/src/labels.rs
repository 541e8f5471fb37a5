use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::fingerprint::{Fingerprint, FingerprintWriter};

/// Ordered label set. Iteration is sorted by key, which keeps the label
/// fingerprint independent of insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Labels(pub BTreeMap<String, String>);

impl Labels {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.0.insert(key.into(), value.into())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    /// Copy every label from `other` that is not already set here.
    pub fn merge_missing(&mut self, other: &Labels) {
        for (k, v) in other.iter() {
            self.0.entry(k.clone()).or_insert_with(|| v.clone());
        }
    }

    /// Write the labels (sorted, key then value) into an existing writer.
    pub fn write_to(&self, w: &mut FingerprintWriter) {
        w.write_u64(self.0.len() as u64);
        for (k, v) in &self.0 {
            w.write_str(k).write_str(v);
        }
    }

    pub fn fingerprint(&self) -> Fingerprint {
        let mut w = FingerprintWriter::new();
        for (k, v) in &self.0 {
            w.write_str(k).write_str(v);
        }
        w.finish()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Labels {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}
