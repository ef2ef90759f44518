//! Distributed memcached client.
//!
//! Keys are spread over a weighted set of memcached servers with a consistent
//! hash ring. Servers that stop answering are taken out of rotation and
//! retried after a configurable interval, so a failed server turns its keys
//! into cache misses instead of errors. Values go through a [`Serializer`]
//! (JSON by default) and are zstd-compressed above a size threshold.
//!
//! Every operation is a single future; drive it with `smol` or any executor.
//!
//! ```rust,no_run
//! use mcring::{CasResult, Client, ClientConfig};
//! # use smol::block_on;
//! #
//! # block_on(async {
//! let client = Client::new(&ClientConfig::from_yaml_str(
//!     "servers: ['127.0.0.1:11211', ['127.0.0.1:11212', 2]]",
//! )?)?;
//!
//! client.set("counter", &10u64, 0).await?;
//! assert_eq!(client.incr("counter", 5).await?, Some(15));
//!
//! let current = client.gets::<u64>("counter").await?.unwrap();
//! let result = client.cas("counter", &0u64, 0, current.cas_token).await?;
//! assert_eq!(result, CasResult::Stored);
//! # Ok::<(), mcring::Error>(())
//! # }).unwrap()
//! ```

mod client;
mod config;
mod connection;
mod error;
mod protocol;
mod ring;
mod value;

pub use client::{CasResult, Client, ClientStats, Versioned};
pub use config::{ClientConfig, ServerAddr, ServerSpec};
pub use connection::{Socket, SocketTransport, Transport};
pub use error::{Error, Result, ServerErrorKind};
pub use protocol::{MAX_DATA_BLOCK, MAX_KEY_LENGTH, check_key};
pub use ring::{MAX_WEIGHT, POINTS_PER_WEIGHT, Server, ServerPool, hash_key};
pub use value::{FLAG_COMPRESSED, FLAG_SERIALIZED, JsonSerializer, Serializer, ValueCodec};
