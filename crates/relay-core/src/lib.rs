//! Shared types for the design relay: identifiers, wire messages, errors,
//! and the analysis collaborator seam.

pub mod analysis;
pub mod errors;
pub mod ids;
pub mod messages;

pub use errors::RelayError;
pub use ids::{ClientId, RequestId};
