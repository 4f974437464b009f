pub mod address;
pub mod wire;
pub mod work_item;

pub use address::PeerAddress;
pub use work_item::{WorkItem, WorkStatus};
