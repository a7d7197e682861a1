//! Test Database Module
//!
//! Lets every feature of the synchronizer run without a wireless card.
//!
//! # Features
//!
//! - **Mock Card**: An in-memory card implementing [`crate::device::CardApi`],
//!   with firmware, CID and upload flag of your choosing
//! - **Failure Injection**: Files that vanish, lose the connection halfway,
//!   arrive with the wrong size, or cancel the cycle
//! - **Data Generators**: Valid JPEGs with EXIF dates and embedded
//!   thumbnails, and seeded filler for videos
//!
//! The CLI's `simulate` command runs a full sync against a [`MockCard`].

pub mod generator;
pub mod mock_card;

pub use generator::{generate_for_name, generate_jpeg, generate_mov, JpegSpec};
pub use mock_card::{FailureMode, MockCard, MockCardBuilder, MockCardStats};
