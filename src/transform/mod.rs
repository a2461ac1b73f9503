//! Screen geometry of items that take part in open/close transform animations.
//!
//! Visible items register their current position and size under a stable key;
//! the animation reads the record back to find where a morph starts or ends.

pub mod anchors;

pub use anchors::{AnchorGeometry, AnchorRecord, AnchorRegistry, AnchorUpdate, InBoundsPredicate};
