//! Reference declarations and dependency restore.
//!
//! Scripts declare external packages inline (see [`directives`]); the
//! [`resolver`] turns a declared request list into a linkable
//! [`ReferenceSet`], caching by request hash and surviving partial
//! resolution failures with the resolved subset still bound.

pub mod directives;
pub mod resolver;

pub use directives::{DirectiveParser, PackageRequest, requests_hash};
pub use resolver::{DependencyResolver, ReferenceSet, RestoreOutcome};
