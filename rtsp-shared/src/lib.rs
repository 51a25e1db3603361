#![warn(rust_2018_idioms)]

pub mod error;
pub mod marshal;
pub mod replay_detector;
pub mod time;
pub mod util;

pub use error::{Error, Result};
pub use marshal::{Marshal, MarshalSize, Unmarshal};
