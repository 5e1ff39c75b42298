//! MQTT 3.1.1 client protocol engine.
//!
//! Encodes and decodes MQTT control packets, reassembles them from an
//! arbitrarily chunked byte stream and runs a client session on top:
//! handshake, pending-frame queue, broadcast of inbound frames, keep-alive
//! and reconnection.
//!
//! ## Components
//!
//! - [`codec`]: [`Frame`] <-> bytes
//! - [`StreamFramer`]: byte stream -> complete packet buffers
//! - [`SessionManager`]: one broker connection and its lifecycle
//! - [`Subscription`]: a SUBSCRIBE request, its SUBACK and matching messages
//!
//! ## Example
//!
//! ```no_run
//! use umqtt::{ConnectionConfig, Frame, Publish, QoS, SessionManager, Subscription};
//!
//! #[tokio::main]
//! async fn main() -> umqtt::Result<()> {
//!     let config = ConnectionConfig::new("127.0.0.1", "client-1").with_keep_alive(30);
//!     let session = SessionManager::new(config)?;
//!     session.connect().await?;
//!
//!     let mut subscription = Subscription::to(&session, "sensors/+/temp", QoS::AtMostOnce)?;
//!     subscription.listen(
//!         || println!("subscribed"),
//!         |msg| println!("{}: {}", msg.topic, msg.payload),
//!         |err| eprintln!("stream ended: {}", err),
//!     )?;
//!
//!     session.send(Frame::Publish(Publish::new("sensors/1/temp", "21.5")))?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     session.disconnect();
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod config;
mod error;
pub mod frame;
pub mod framer;
mod session;
mod subscription;
pub mod topic;
pub mod transport;
mod types;

pub use config::{ConnectionConfig, ReconnectPolicy};
pub use error::{Error, Result};
pub use frame::{
    Connack, Connect, Frame, Publish, Suback, Subscribe, SubscribeFilter, SubscribeReturnCode, Unsubscribe, Will,
};
pub use framer::StreamFramer;
pub use session::{Frames, Publishes, SessionManager};
pub use subscription::{Message, Subscription};
pub use transport::{AsyncStream, BoxedStream, Connector, TcpConnector};
pub use types::{PacketType, QoS};
