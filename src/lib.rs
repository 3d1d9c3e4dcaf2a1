//! # mixproxy - Mixed-Protocol Forward Proxy
//!
//! mixproxy accepts inbound TCP connections on a single endpoint and
//! detects, from the first byte on the wire, whether the client speaks
//! SOCKS5, SOCKS4/4a or HTTP (including CONNECT). It then runs the
//! protocol handshake and relays bytes between the client and the
//! upstream: a dialed TCP connection, a UDP relay socket (SOCKS5 UDP
//! ASSOCIATE), or a passively bound listener (SOCKS4 BIND).
//!
//! ## Features
//!
//! - **Single-Port Multiplexing**: SOCKS5, SOCKS4/4a and HTTP share one listener
//! - **SOCKS5 UDP ASSOCIATE**: full relay with client/target latching
//! - **SOCKS4 BIND**: passive mode with the compliant double reply
//! - **Embeddable**: user handlers intercept resolved requests and may
//!   supply their own upstream transport via a custom dialer
//!
//! ## Usage
//!
//! ```rust,ignore
//! use mixproxy::Proxy;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     Proxy::builder()
//!         .bind_address("127.0.0.1:1080")
//!         .build()
//!         .listen_and_serve()
//!         .await
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! Client -> Accept -> Peek(1 byte) -> {SOCKS5 | SOCKS4 | HTTP} -> Tunnel -> Target
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod addr;
pub mod config;
pub mod error;
pub mod http;
pub mod mixed;
pub mod request;
pub mod socks4;
pub mod socks5;
pub mod tunnel;

// Re-export commonly used items
pub use addr::TargetAddr;
pub use config::{load_config, Config};
pub use error::{ProxyError, ReplyCode, Socks4Reply};
pub use mixed::{Proxy, ProxyBuilder, DEFAULT_BIND_ADDRESS};
pub use request::{DefaultDialer, Dialer, ProxyRequest, ProxyStream, UserHandler};
pub use tunnel::BytesPool;

/// Version of the mixproxy library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Name of the application
pub const NAME: &str = env!("CARGO_PKG_NAME");
