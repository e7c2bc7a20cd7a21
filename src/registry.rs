//! The table of tags a controller knows how to load, and how to fetch them.

use std::collections::hash_map::{Entry, HashMap, Keys};
use std::fmt::{self, Debug, Formatter};
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};

use crate::{demux::Cardinality, error::UnknownTag};

/// A record that can be correlated back to the key it was fetched for.
///
/// `attribute` is the correlation attribute configured for the tag being
/// resolved (see [`TagEntry::correlate_by`]). Return `None` if this record
/// has no such attribute; the record then matches no key.
pub trait KeyedRecord<Key> {
    fn correlation_key(&self, attribute: &str) -> Option<Key>;
}

/// The future returned by a tag's fetch function.
pub type FetchFuture<'f, Record, Error> = BoxFuture<'f, Result<Vec<Record>, Error>>;

type FetchFn<'f, Key, Record, Error> =
    dyn Fn(Vec<Key>) -> FetchFuture<'f, Record, Error> + Send + Sync + 'f;

/// Everything a controller needs to resolve one tag: its cardinality, the
/// attribute that correlates its records with keys, and the bulk fetch.
pub struct TagEntry<'f, Key, Record, Error> {
    cardinality: Cardinality,
    attribute: Arc<str>,
    fetch: Arc<FetchFn<'f, Key, Record, Error>>,
}

impl<'f, Key, Record, Error> Clone for TagEntry<'f, Key, Record, Error> {
    fn clone(&self) -> Self {
        Self {
            cardinality: self.cardinality,
            attribute: self.attribute.clone(),
            fetch: self.fetch.clone(),
        }
    }
}

impl<'f, Key, Record, Error> Debug for TagEntry<'f, Key, Record, Error> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("TagEntry")
            .field("cardinality", &self.cardinality)
            .field("attribute", &self.attribute)
            .field("fetch", &"<closure>")
            .finish()
    }
}

impl<'f, Key, Record, Error> TagEntry<'f, Key, Record, Error> {
    /// Correlate this tag's records by `attribute` instead of the registry's
    /// default attribute.
    pub fn correlate_by(&mut self, attribute: impl Into<Arc<str>>) -> &mut Self {
        self.attribute = attribute.into();
        self
    }

    #[inline]
    pub fn cardinality(&self) -> Cardinality {
        self.cardinality
    }

    #[inline]
    pub fn attribute(&self) -> &str {
        &self.attribute
    }

    /// Start a bulk fetch for `keys`.
    pub fn fetch(&self, keys: Vec<Key>) -> FetchFuture<'f, Record, Error> {
        (self.fetch)(keys)
    }
}

/// A fixed mapping from tags to [`TagEntry`]s, supplied to a controller when
/// it is created.
///
/// ```
/// use tagloader::{Cardinality, TagRegistry};
///
/// #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// enum Tag {
///     PersonalInfo,
///     Hobbies,
/// }
///
/// #[derive(Debug)]
/// struct Row {
///     resume_id: String,
///     owner_id: String,
/// }
///
/// async fn personal_infos(resume_ids: Vec<String>) -> Result<Vec<Row>, String> {
///     Ok(Vec::new())
/// }
///
/// async fn hobbies(owner_ids: Vec<String>) -> Result<Vec<Row>, String> {
///     Ok(Vec::new())
/// }
///
/// let mut registry = TagRegistry::new("resume_id");
/// registry.register(Tag::PersonalInfo, Cardinality::One, personal_infos);
/// registry
///     .register(Tag::Hobbies, Cardinality::Many, hobbies)
///     .correlate_by("owner_id");
///
/// assert_eq!(registry.entry(&Tag::PersonalInfo).unwrap().attribute(), "resume_id");
/// assert_eq!(registry.entry(&Tag::Hobbies).unwrap().attribute(), "owner_id");
/// ```
pub struct TagRegistry<'f, Tag, Key, Record, Error> {
    default_attribute: Arc<str>,
    entries: HashMap<Tag, TagEntry<'f, Key, Record, Error>>,
}

impl<'f, Tag: Debug, Key, Record, Error> Debug for TagRegistry<'f, Tag, Key, Record, Error> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("TagRegistry")
            .field("default_attribute", &self.default_attribute)
            .field("entries", &self.entries)
            .finish()
    }
}

impl<'f, Tag, Key, Record, Error> TagRegistry<'f, Tag, Key, Record, Error>
where
    Tag: Clone + Eq + Hash + Debug,
{
    /// Create an empty registry. Tags registered without an explicit
    /// attribute correlate their records by `default_attribute`.
    pub fn new(default_attribute: impl Into<Arc<str>>) -> Self {
        Self {
            default_attribute: default_attribute.into(),
            entries: HashMap::new(),
        }
    }

    /// Register `fetch` as the bulk fetch for `tag`, replacing any previous
    /// entry. `fetch` receives the unique keys requested for the tag during
    /// one batching window, and may return the matching records in any
    /// order.
    pub fn register<F, Fut>(
        &mut self,
        tag: Tag,
        cardinality: Cardinality,
        fetch: F,
    ) -> &mut TagEntry<'f, Key, Record, Error>
    where
        F: Fn(Vec<Key>) -> Fut + Send + Sync + 'f,
        Fut: Future<Output = Result<Vec<Record>, Error>> + Send + 'f,
    {
        let entry = TagEntry {
            cardinality,
            attribute: self.default_attribute.clone(),
            fetch: Arc::new(move |keys: Vec<Key>| -> FetchFuture<'f, Record, Error> {
                fetch(keys).boxed()
            }),
        };

        match self.entries.entry(tag) {
            Entry::Occupied(mut occupied) => {
                occupied.insert(entry);
                occupied.into_mut()
            }
            Entry::Vacant(vacant) => vacant.insert(entry),
        }
    }

    pub fn entry(&self, tag: &Tag) -> Result<&TagEntry<'f, Key, Record, Error>, UnknownTag<Tag>> {
        self.entries
            .get(tag)
            .ok_or_else(|| UnknownTag(tag.clone()))
    }

    /// Fetch `keys` for `tag` directly, bypassing any batching.
    pub fn fetch(
        &self,
        tag: &Tag,
        keys: Vec<Key>,
    ) -> Result<FetchFuture<'f, Record, Error>, UnknownTag<Tag>> {
        self.entry(tag).map(|entry| entry.fetch(keys))
    }

    pub fn contains(&self, tag: &Tag) -> bool {
        self.entries.contains_key(tag)
    }

    /// The registered tags, in no particular order.
    pub fn tags(&self) -> Keys<'_, Tag, TagEntry<'f, Key, Record, Error>> {
        self.entries.keys()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
