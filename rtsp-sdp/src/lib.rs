#![warn(rust_2018_idioms)]

pub mod description;
pub mod media;

pub use description::{Origin, SessionDescription};
pub use media::{Direction, Format, MediaDescription, MediaType, TransportProfile};
