//! Result objects returned by workers and the master-side scope holding them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Fixed-binning one-dimensional histogram.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Histogram1D {
    pub low: f64,
    pub high: f64,
    pub bins: Vec<f64>,
    pub entries: u64,
}

impl Histogram1D {
    pub fn new(nbins: usize, low: f64, high: f64) -> Self {
        Self {
            low,
            high,
            bins: vec![0.0; nbins],
            entries: 0,
        }
    }

    /// Values outside `[low, high)` are counted as entries but not binned.
    pub fn fill(&mut self, x: f64) {
        self.entries += 1;
        if self.bins.is_empty() || x < self.low || x >= self.high {
            return;
        }
        let width = (self.high - self.low) / self.bins.len() as f64;
        let bin = ((x - self.low) / width) as usize;
        if let Some(slot) = self.bins.get_mut(bin) {
            *slot += 1.0;
        }
    }

    pub fn compatible(&self, other: &Self) -> bool {
        self.bins.len() == other.bins.len() && self.low == other.low && self.high == other.high
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ObjectPayload {
    Histogram(Histogram1D),
    Counter(i64),
    /// Opaque; a newer blob replaces an older one.
    Blob(Vec<u8>),
}

/// A named result object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultObject {
    pub name: String,
    pub payload: ObjectPayload,
}

impl ResultObject {
    pub fn new(name: impl Into<String>, payload: ObjectPayload) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }

    pub fn is_mergeable(&self) -> bool {
        !matches!(self.payload, ObjectPayload::Blob(_))
    }

    /// Merge `other` into `self` in place. Returns false when the two payloads
    /// cannot be combined, leaving `self` untouched.
    pub fn merge(&mut self, other: &ResultObject) -> bool {
        match (&mut self.payload, &other.payload) {
            (ObjectPayload::Histogram(mine), ObjectPayload::Histogram(theirs)) => {
                if !mine.compatible(theirs) {
                    return false;
                }
                for (a, b) in mine.bins.iter_mut().zip(&theirs.bins) {
                    *a += b;
                }
                mine.entries += theirs.entries;
                true
            }
            (ObjectPayload::Counter(mine), ObjectPayload::Counter(theirs)) => {
                *mine += theirs;
                true
            }
            _ => false,
        }
    }
}

/// Outcome of storing an object into the scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    Merged,
    Inserted,
    Replaced,
}

/// Named result objects collected by the master.
#[derive(Debug, Default)]
pub struct ObjectScope {
    objects: BTreeMap<String, ResultObject>,
}

impl ObjectScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge into a same-named mergeable object, else store (replacing any
    /// incompatible predecessor).
    pub fn store(&mut self, object: ResultObject) -> StoreOutcome {
        if let Some(existing) = self.objects.get_mut(&object.name) {
            if existing.is_mergeable() && existing.merge(&object) {
                return StoreOutcome::Merged;
            }
            *existing = object;
            return StoreOutcome::Replaced;
        }
        self.objects.insert(object.name.clone(), object);
        StoreOutcome::Inserted
    }

    pub fn get(&self, name: &str) -> Option<&ResultObject> {
        self.objects.get(name)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.objects.keys().map(String::as_str)
    }

    pub fn clear(&mut self) {
        self.objects.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn histogram(name: &str, values: &[f64]) -> ResultObject {
        let mut h = Histogram1D::new(10, 0.0, 10.0);
        for v in values {
            h.fill(*v);
        }
        ResultObject::new(name, ObjectPayload::Histogram(h))
    }

    #[test]
    fn test_partial_histograms_merge_in_place() {
        let mut scope = ObjectScope::new();
        assert_eq!(scope.store(histogram("h", &[1.5, 2.5])), StoreOutcome::Inserted);
        assert_eq!(scope.store(histogram("h", &[1.2, 9.9, 42.0])), StoreOutcome::Merged);

        let ObjectPayload::Histogram(h) = &scope.get("h").unwrap().payload else {
            panic!("expected histogram");
        };
        assert_eq!(h.entries, 5);
        assert_eq!(h.bins[1], 2.0);
        assert_eq!(h.bins[9], 1.0);
        assert_eq!(h.bins.iter().sum::<f64>(), 4.0);
    }

    #[test]
    fn test_incompatible_binning_replaces() {
        let mut scope = ObjectScope::new();
        scope.store(histogram("h", &[1.0]));
        let other = ResultObject::new("h", ObjectPayload::Histogram(Histogram1D::new(5, 0.0, 10.0)));
        assert_eq!(scope.store(other.clone()), StoreOutcome::Replaced);
        assert_eq!(scope.get("h"), Some(&other));
    }

    #[test]
    fn test_counters_add_and_blobs_replace() {
        let mut scope = ObjectScope::new();
        scope.store(ResultObject::new("n", ObjectPayload::Counter(3)));
        scope.store(ResultObject::new("n", ObjectPayload::Counter(4)));
        assert_eq!(scope.get("n").unwrap().payload, ObjectPayload::Counter(7));

        scope.store(ResultObject::new("b", ObjectPayload::Blob(vec![1])));
        assert_eq!(
            scope.store(ResultObject::new("b", ObjectPayload::Blob(vec![2]))),
            StoreOutcome::Replaced
        );
        assert_eq!(scope.get("b").unwrap().payload, ObjectPayload::Blob(vec![2]));
        assert_eq!(scope.names().collect::<Vec<_>>(), vec!["b", "n"]);
    }
}
