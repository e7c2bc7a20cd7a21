//! Splitting a flat list of fetched records back into per-key results.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::{
    data::{KeySet, ValueSet},
    error::CardinalityMismatch,
    registry::KeyedRecord,
};

/// How many records a tag resolves to for each key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cardinality {
    /// At most one record per key; extra matches are ignored.
    One,
    /// Every matching record.
    Many,
}

/// The resolved value of one lookup. The shape is fixed by the
/// [`Cardinality`] of the tag it was loaded through.
///
/// Records are shared: every lookup of the same batch key in one controller
/// receives clones of the same `Arc`s.
#[derive(Debug, PartialEq, Eq)]
pub enum Loaded<Record> {
    One(Option<Arc<Record>>),
    Many(Vec<Arc<Record>>),
}

impl<Record> Clone for Loaded<Record> {
    fn clone(&self) -> Self {
        match self {
            Loaded::One(record) => Loaded::One(record.clone()),
            Loaded::Many(records) => Loaded::Many(records.clone()),
        }
    }
}

impl<Record> Loaded<Record> {
    /// The value for a key that matched no records: `None` or an empty list.
    pub fn empty(cardinality: Cardinality) -> Self {
        match cardinality {
            Cardinality::One => Loaded::One(None),
            Cardinality::Many => Loaded::Many(Vec::new()),
        }
    }

    fn from_records(cardinality: Cardinality, records: Vec<Arc<Record>>) -> Self {
        match cardinality {
            Cardinality::One => Loaded::One(records.into_iter().next()),
            Cardinality::Many => Loaded::Many(records),
        }
    }

    pub fn cardinality(&self) -> Cardinality {
        match self {
            Loaded::One(..) => Cardinality::One,
            Loaded::Many(..) => Cardinality::Many,
        }
    }

    /// Number of records in this result.
    pub fn len(&self) -> usize {
        match self {
            Loaded::One(record) => record.iter().count(),
            Loaded::Many(records) => records.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Unwrap a single-cardinality result.
    pub fn into_one(self) -> Result<Option<Arc<Record>>, CardinalityMismatch> {
        match self {
            Loaded::One(record) => Ok(record),
            Loaded::Many(..) => Err(CardinalityMismatch {
                expected: Cardinality::One,
                actual: Cardinality::Many,
            }),
        }
    }

    /// Unwrap a list-cardinality result.
    pub fn into_many(self) -> Result<Vec<Arc<Record>>, CardinalityMismatch> {
        match self {
            Loaded::Many(records) => Ok(records),
            Loaded::One(..) => Err(CardinalityMismatch {
                expected: Cardinality::Many,
                actual: Cardinality::One,
            }),
        }
    }
}

/// Correlate `records` with the `keys` they were fetched for.
///
/// Every key in `keys` appears in the returned map, including keys that
/// matched nothing (those map to [`Loaded::empty`]). Each record is assigned
/// to the key named by its `attribute`; records without that attribute, and
/// records whose key was never requested, are dropped. For
/// [`Cardinality::Many`] a key's records keep the order the fetcher returned
/// them in; for [`Cardinality::One`] the first of them wins.
///
/// ```
/// use tagloader::{demultiplex, Cardinality, KeyedRecord};
///
/// struct Achievement {
///     owner_id: String,
///     text: &'static str,
/// }
///
/// impl KeyedRecord<String> for Achievement {
///     fn correlation_key(&self, attribute: &str) -> Option<String> {
///         match attribute {
///             "owner_id" => Some(self.owner_id.clone()),
///             _ => None,
///         }
///     }
/// }
///
/// let keys = vec![String::from("edu-1"), String::from("edu-2")];
/// let records = vec![
///     Achievement { owner_id: "edu-2".into(), text: "dean's list" },
///     Achievement { owner_id: "edu-2".into(), text: "valedictorian" },
/// ];
///
/// let mut results = demultiplex(&keys, Cardinality::Many, "owner_id", records);
///
/// assert!(results.remove("edu-1").unwrap().is_empty());
///
/// let texts: Vec<_> = results
///     .remove("edu-2")
///     .unwrap()
///     .into_many()
///     .unwrap()
///     .iter()
///     .map(|record| record.text)
///     .collect();
/// assert_eq!(texts, ["dean's list", "valedictorian"]);
/// ```
pub fn demultiplex<Key, Record>(
    keys: &[Key],
    cardinality: Cardinality,
    attribute: &str,
    records: impl IntoIterator<Item = Record>,
) -> HashMap<Key, Loaded<Record>>
where
    Key: Clone + Eq + Hash + Debug,
    Record: KeyedRecord<Key>,
{
    let keys: KeySet<Key> = keys.iter().cloned().collect();
    let values = demultiplex_set(&keys, cardinality, attribute, records);

    keys.into_keys()
        .into_iter()
        .zip(values.into_values())
        .collect()
}

/// Token-addressed form of [`demultiplex`], used by the batch coordinator.
pub(crate) fn demultiplex_set<Key, Record>(
    keys: &KeySet<Key>,
    cardinality: Cardinality,
    attribute: &str,
    records: impl IntoIterator<Item = Record>,
) -> ValueSet<Loaded<Record>>
where
    Key: Clone + Eq + Hash + Debug,
    Record: KeyedRecord<Key>,
{
    let mut slots: Vec<Vec<Arc<Record>>> = vec![Vec::new(); keys.len()];
    let mut malformed = 0usize;
    let mut unrequested = 0usize;

    for record in records {
        let key = match record.correlation_key(attribute) {
            Some(key) => key,
            None => {
                malformed += 1;
                continue;
            }
        };

        match keys.position(&key) {
            Some(position) => slots[position].push(Arc::new(record)),
            None => unrequested += 1,
        }
    }

    if malformed > 0 {
        warn!(
            attribute,
            malformed, "ignoring fetched records without the correlation attribute"
        );
    }

    if unrequested > 0 {
        debug!(
            attribute,
            unrequested, "ignoring fetched records for keys that were not requested"
        );
    }

    slots
        .into_iter()
        .map(|records| Loaded::from_records(cardinality, records))
        .collect()
}
