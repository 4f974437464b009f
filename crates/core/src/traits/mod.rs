pub mod transport;
pub mod workload;

pub use transport::Transport;
pub use workload::Workload;
