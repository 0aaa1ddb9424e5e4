//! # Cistern credential types
//!
//! Value types for authentication material used by the pooling layer:
//! [`SecretString`] (a wipeable, redacting password container) and
//! [`Credential`] (a username/password pair whose identity is the
//! username alone).

pub mod credential;
pub mod secret;

pub use credential::Credential;
pub use secret::SecretString;
