//! HTTP handlers for quota-service.

pub mod extract;
pub mod quota;
pub mod verify;
pub mod webhook;
