pub mod dispatch;
pub mod gossip;
pub mod peer;
pub mod tasks;

pub use dispatch::{Dispatcher, HandlerFuture, MessageHandler};
pub use gossip::{GossipState, Membership, NEW_PEER_DAMAGE, TOTAL_HEALTH};
pub use peer::{IdleProducer, Peer, PeerBuilder, Producer};
pub use tasks::{Ability, TaskEngine};
