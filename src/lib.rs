//! Multi-user TCP Chat Server Library
//!
//! Clients connect over TCP, send a username as their first line, and then
//! exchange chat lines that are broadcast to every connected user.
//!
//! # Features
//! - Username registration (one live session per username)
//! - Broadcast fan-out with recipient filtering
//! - Join and departure announcements
//! - Per-connection write queue with a write timeout
//!
//! # Architecture
//! - `Listener` accepts connections and bootstraps each one on its own task
//! - Each `Session` runs a read task and a writer task
//! - `Registry` is a sharded concurrent map of live sessions; sessions reach
//!   it through callbacks, never the other way round
//!
//! # Example
//! ```ignore
//! use tokio::net::TcpListener;
//! use chat_hub::{Listener, SessionConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let socket = TcpListener::bind("127.0.0.1:8080").await.unwrap();
//!     let listener = Listener::new(socket, SessionConfig::default()).unwrap();
//!     listener.run_until_ctrl_c().await.unwrap();
//! }
//! ```

pub mod config;
pub mod error;
pub mod listener;
pub mod message;
pub mod registry;
pub mod session;
pub mod types;

// Re-export main types for convenience
pub use config::{Config, SessionConfig};
pub use error::{AppError, RegistrationConflict, SendError};
pub use listener::{admit, Admission, Listener};
pub use message::{Message, MessageIntent, SYSTEM_SENDER};
pub use registry::Registry;
pub use session::Session;
pub use types::SessionId;
