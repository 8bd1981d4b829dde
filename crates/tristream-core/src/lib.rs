//! # Tristream Core
//!
//! Core types and the error taxonomy shared by every Tristream crate.
//!
//! - **Error handling**: [`Error`] and the [`Result`] alias
//! - **Identifiers**: [`StreamId`] (fixed at three streams) and [`SequenceId`]
//! - **Tokens and tensors**: [`Token`], [`TokenId`], [`DType`]
//! - **Request/Response types**: [`InferenceRequest`], [`InferenceResponse`]

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![deny(unsafe_code)]

pub mod error;
pub mod request;
pub mod response;
pub mod types;

pub use error::{Error, Result};
pub use request::*;
pub use response::*;
pub use types::*;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::request::*;
    pub use crate::response::*;
    pub use crate::types::*;
}
