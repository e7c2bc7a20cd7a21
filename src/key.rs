use std::fmt::Display;

/// A `(tag, key)` pair: the handle a caller uses to ask for a value, and the
/// unit of deduplication within one [`BatchController`].
///
/// [`BatchController`]: crate::BatchController
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BatchKey<Tag, Key> {
    pub tag: Tag,
    pub key: Key,
}

impl<Tag, Key> BatchKey<Tag, Key> {
    pub fn new(tag: Tag, key: Key) -> Self {
        Self { tag, key }
    }

    pub fn into_parts(self) -> (Tag, Key) {
        (self.tag, self.key)
    }
}

impl<Tag> BatchKey<Tag, String> {
    /// Canonicalize a domain identifier (a UUID, an integer id, ...) into its
    /// string form, so that the same entity always produces the same key no
    /// matter how the caller happened to hold its id.
    pub fn from_id(tag: Tag, id: impl Display) -> Self {
        Self::new(tag, id.to_string())
    }
}

impl<Tag, Key> From<(Tag, Key)> for BatchKey<Tag, Key> {
    fn from((tag, key): (Tag, Key)) -> Self {
        Self::new(tag, key)
    }
}
