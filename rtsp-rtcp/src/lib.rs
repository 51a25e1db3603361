#![warn(rust_2018_idioms)]

pub mod header;
pub mod packet;
pub mod receiver_report;
pub mod reception_report;
pub mod sender_report;

pub use header::{Header, PacketType};
pub use packet::RtcpPacket;
pub use receiver_report::ReceiverReport;
pub use reception_report::ReceptionReport;
pub use sender_report::SenderReport;
