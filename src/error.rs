use std::fmt::Debug;

use thiserror::Error;

use crate::demux::Cardinality;

/// A lookup was submitted for a tag that has no entry in the
/// [`TagRegistry`](crate::TagRegistry). This is reported as soon as the lookup
/// is submitted, never deferred to dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("no fetcher is registered for tag {0:?}")]
pub struct UnknownTag<Tag: Debug>(pub Tag);

/// A [`Loaded`](crate::Loaded) value was unwrapped as the wrong shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("expected a {expected:?} result, but the tag resolves to {actual:?}")]
pub struct CardinalityMismatch {
    pub expected: Cardinality,
    pub actual: Cardinality,
}
