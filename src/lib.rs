//! Tagloader is a request-scoped batch loader in the style of Facebook's
//! [dataloader](https://github.com/graphql/dataloader), built for the common
//! case of a graph API resolving its associations one field at a time. Each
//! lookup names *what* it wants with a tag (say, "educations of a resume")
//! and *whose* it wants with a key (the resume's id). Lookups made during
//! one batching window are grouped by tag, each tag is fetched with a single
//! bulk query, and the records are handed back to each caller, correlated
//! with the key it asked for.
//!
//! ## Overview
//!
//! Suppose a resume has one personal-info record and many educations, and
//! your store can fetch either for a whole list of resume ids at once:
//!
//! ```
//! #[derive(Debug)]
//! struct Row {
//!     id: u32,
//!     resume_id: String,
//! }
//!
//! #[derive(Debug, Clone)]
//! struct DbError;
//!
//! // SELECT * FROM personal_info WHERE resume_id IN (...)
//! async fn personal_infos(resume_ids: Vec<String>) -> Result<Vec<Row>, DbError> {
//!     todo!()
//! }
//! ```
//!
//! A field resolver only ever knows about one resume, though. Tagloader lets
//! it ask for just that resume's data while still producing one query per
//! tag for the whole request.
//!
//! First, tell tagloader how to match fetched records to keys by
//! implementing [`KeyedRecord`]. The attribute name comes from the tag
//! being resolved, so one record type can be correlated differently by
//! different tags:
//!
//! ```
//! use tagloader::KeyedRecord;
//! # struct Row { id: u32, resume_id: String }
//!
//! impl KeyedRecord<String> for Row {
//!     fn correlation_key(&self, attribute: &str) -> Option<String> {
//!         match attribute {
//!             "resume_id" => Some(self.resume_id.clone()),
//!             _ => None,
//!         }
//!     }
//! }
//! ```
//!
//! Next, register every tag in a [`TagRegistry`], along with its
//! [`Cardinality`] and its bulk fetch. Then create a [`BatchController`]
//! from the registry and a batching window; see the [`window`] module.
//!
//! ```
//! use std::num::NonZeroUsize;
//!
//! use futures::{executor::block_on, future::join};
//! use tagloader::{window, BatchController, BatchRules, Cardinality, KeyedRecord, TagRegistry};
//!
//! #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
//! enum Tag {
//!     PersonalInfo,
//!     Educations,
//! }
//! # #[derive(Debug)]
//! # struct Row { id: u32, resume_id: String }
//! # impl KeyedRecord<String> for Row {
//! #     fn correlation_key(&self, attribute: &str) -> Option<String> {
//! #         match attribute {
//! #             "resume_id" => Some(self.resume_id.clone()),
//! #             _ => None,
//! #         }
//! #     }
//! # }
//! # #[derive(Debug, Clone)]
//! # struct DbError;
//! # async fn personal_infos(resume_ids: Vec<String>) -> Result<Vec<Row>, DbError> {
//! #     Ok(resume_ids.into_iter().map(|resume_id| Row { id: 1, resume_id }).collect())
//! # }
//! # async fn educations(_resume_ids: Vec<String>) -> Result<Vec<Row>, DbError> {
//! #     Ok(Vec::new())
//! # }
//!
//! let mut registry = TagRegistry::new("resume_id");
//! registry.register(Tag::PersonalInfo, Cardinality::One, personal_infos);
//! registry.register(Tag::Educations, Cardinality::Many, educations);
//!
//! let controller = BatchController::new(BatchRules {
//!     registry,
//!     window: window::immediate,
//!     max_keys: NonZeroUsize::new(100),
//! });
//!
//! let info = controller.load(Tag::PersonalInfo, "r1".to_string()).unwrap();
//! let educations = controller.load(Tag::Educations, "r1".to_string()).unwrap();
//!
//! let (info, educations) = block_on(join(info, educations));
//!
//! let info = info.unwrap().into_one().unwrap().unwrap();
//! assert_eq!(info.resume_id, "r1");
//! assert!(educations.unwrap().into_many().unwrap().is_empty());
//! ```
//!
//! A [`BatchController`] is meant to live exactly as long as one logical
//! request. It memoizes every `(tag, key)` pair loaded through it, so asking
//! twice for the same thing, even after the first lookup has finished,
//! never reaches the store twice. Dropping it discards everything.
//!
//! ## Design notes
//!
//! ### Tags and the registry
//!
//! The set of tags is closed and known up front: each one maps to a
//! [`TagEntry`] holding its cardinality, its correlation attribute, and its
//! fetch function. Submitting a lookup for an unregistered tag fails right
//! away with [`UnknownTag`], rather than when the batch is dispatched.
//!
//! ### Fetchers don't need to line up with their keys
//!
//! A fetch function receives the unique keys for its tag and returns
//! records in whatever order the store produces them. Keys may match no
//! record or several; records that match no requested key are ignored, as
//! are records missing the correlation attribute. Every key still resolves:
//! to `None` or an empty list if nothing matched. See [`demultiplex`].
//!
//! ### Failures stay within their tag
//!
//! Each tag is fetched independently. If one tag's fetch fails, every lookup
//! of that tag resolves to the fetch's error; lookups of other tags in the
//! same batch are unaffected. Nothing is retried.
//!
//! ### Poll-driven design
//!
//! As in Rust's polling async design, all of the work is driven through
//! polling [`BatchFuture`]. Nothing is spawned on a runtime; the window and
//! the fetches are driven by whichever of the batch's futures was polled
//! most recently, and the others are only woken when a result they might be
//! waiting for is available (or when the driving future is dropped).
//!
//! The surrounding code can also close a window early with
//! [`BatchController::flush`], for instance after a resolver has issued all
//! the lookups for one level of a query.

mod batch;
mod data;
mod demux;
mod error;
mod key;
mod registry;
mod wakerset;
pub mod window;

pub use batch::{BatchController, BatchFuture, BatchRules};
pub use demux::{demultiplex, Cardinality, Loaded};
pub use error::{CardinalityMismatch, UnknownTag};
pub use key::BatchKey;
pub use registry::{FetchFuture, KeyedRecord, TagEntry, TagRegistry};
