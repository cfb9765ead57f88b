//! Inter-process communication: message codec, sessions and ports, and
//! host-implemented services

pub mod hle;
pub mod message;
pub mod service;
pub mod session;

pub use hle::pump_services;
pub use message::{MessageError, Request, RequestBuilder, Response, MESSAGE_SIZE};
pub use service::{ServiceCtx, ServiceHandler};
pub use session::{KPort, KSession};
