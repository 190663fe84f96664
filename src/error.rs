//! Error types for the chat server
//!
//! Defines application-level errors, outbound enqueue errors and the
//! registration conflict outcome. Uses thiserror for ergonomic definitions.

use thiserror::Error;

/// Application-level errors
///
/// `Initialization` and `Accept` are fatal to the call that produced them.
/// `Io` is scoped to a single session and only ever ends that session.
#[derive(Debug, Error)]
pub enum AppError {
    /// Listening socket or connection unusable at construction time
    #[error("Initialization error: {0}")]
    Initialization(String),

    /// Accept on the listening socket failed (fatal for the listener)
    #[error("Accept failed: {0}")]
    Accept(#[source] std::io::Error),

    /// Read or write on a single connection failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Message send errors
///
/// Occurs when a message cannot be queued for a session's writer.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SendError {
    /// The session has already been closed
    #[error("Session disconnected")]
    Disconnected,

    /// The session's outbound queue is full (slow consumer)
    #[error("Outbound queue full")]
    QueueFull,

    /// The writer task has gone away
    #[error("Channel closed")]
    ChannelClosed,
}

/// Username already held by a registered session
///
/// Not a fault: the listener answers it with a `STATUS_FAILURE` reply.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("Username '{0}' is already taken")]
pub struct RegistrationConflict(pub String);
