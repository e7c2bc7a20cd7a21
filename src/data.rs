//! Data structures for passing keys into a fetch and values back out of it.

use std::collections::HashMap;
use std::hash::Hash;
use std::iter::FromIterator;
use std::num::NonZeroUsize;

/// A handle to one key in a [`KeySet`], and to the value for that key in the
/// [`ValueSet`] built from it. Tokens are positional: the first unique key
/// added to a set gets the first token, and so on.
#[repr(transparent)]
#[derive(Debug, PartialEq, Eq, Hash)]
pub(crate) struct Token(NonZeroUsize);

impl Token {
    fn from_index(index: usize) -> Self {
        Token(NonZeroUsize::new(index + 1).expect("Overflow when creating token"))
    }

    pub(crate) fn duplicate(&self) -> Self {
        Token(self.0)
    }

    #[inline]
    pub(crate) fn index(&self) -> usize {
        self.0.get() - 1
    }
}

/// The set of unique keys collected for one tag during a batching window.
/// Keys keep their first-seen order, which is also the order they are handed
/// to the fetcher.
#[derive(Debug)]
pub(crate) struct KeySet<Key> {
    // Positions are never removed. KeySets live for a single batch, so there
    // is no reason to compact them.
    keys: Vec<Key>,
    tokens: HashMap<Key, Token>,
}

impl<Key> KeySet<Key> {
    pub(crate) fn new() -> Self {
        Self {
            keys: Vec::new(),
            tokens: HashMap::new(),
        }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.keys.len()
    }

    /// The unique keys, in first-seen order.
    #[inline]
    pub(crate) fn keys(&self) -> &[Key] {
        &self.keys
    }

    pub(crate) fn into_keys(self) -> Vec<Key> {
        self.keys
    }
}

impl<Key: Clone + Eq + Hash> KeySet<Key> {
    /// Add a key to this KeySet, and return the token associated with it.
    /// Adding a key that is already present returns a duplicate of the
    /// existing token.
    pub(crate) fn add_key(&mut self, key: Key) -> Token {
        if let Some(token) = self.tokens.get(&key) {
            return token.duplicate();
        }

        let token = Token::from_index(self.keys.len());
        self.keys.push(key.clone());
        self.tokens.insert(key, token.duplicate());
        token
    }

    /// Get the position of a key in this set, if it was requested.
    pub(crate) fn position(&self, key: &Key) -> Option<usize> {
        self.tokens.get(key).map(Token::index)
    }
}

impl<Key: Clone + Eq + Hash> FromIterator<Key> for KeySet<Key> {
    fn from_iter<I: IntoIterator<Item = Key>>(iter: I) -> Self {
        let mut set = KeySet::new();
        iter.into_iter().for_each(|key| {
            set.add_key(key);
        });
        set
    }
}

/// The result of a fetch, with one value per key of the [`KeySet`] it was
/// built for, addressed by the same tokens.
#[derive(Debug)]
pub(crate) struct ValueSet<Value> {
    values: Vec<Value>,
}

impl<Value> ValueSet<Value> {
    /// Look up the value for a token. Values are never taken out of the set;
    /// every future holding the token can read it, and later loads of the
    /// same key can too.
    pub(crate) fn get(&self, token: &Token) -> Option<&Value> {
        self.values.get(token.index())
    }

    pub(crate) fn into_values(self) -> Vec<Value> {
        self.values
    }
}

impl<Value> FromIterator<Value> for ValueSet<Value> {
    fn from_iter<I: IntoIterator<Item = Value>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}
