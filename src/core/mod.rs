//! Core types for the player.
//!
//! Time representation, rational time bases and media kinds shared by every
//! other module.

pub mod media;
pub mod time;

pub use media::MediaKind;
pub use time::{now, Rational, Seconds};
