//! Core feedline primitives shared across crates.
//!
//! Includes the feedtype algebra, product classes and their patterns,
//! timestamps, product metadata and signatures.

pub mod class;
pub mod feedtype;
pub mod product;
pub mod signature;
pub mod time;

pub use class::{ClassError, Pattern, ProductClass, ProductSpec};
pub use feedtype::{Feedtype, FeedtypeDb, FeedtypeEntry, FeedtypeError};
pub use product::{Product, ProductInfo};
pub use signature::Signature;
pub use time::Timestamp;
