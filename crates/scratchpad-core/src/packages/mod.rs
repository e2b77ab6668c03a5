//! Package references, the local package cache and restore.

pub mod cache;
pub mod directive;
pub mod resolver;
pub mod source;

pub use cache::PackageCache;
pub use directive::{PackageReference, extract_references, parse_reference, reference_directives};
pub use resolver::PackageResolver;
pub use source::{CommandPackageSource, LocalFeedSource, NoPackageSource, PackageSource};
