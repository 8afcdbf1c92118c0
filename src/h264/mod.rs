pub mod depacketizer;
pub mod nal;

pub use depacketizer::{AccessUnit, Depacketizer};
