#![deny(rustdoc::broken_intra_doc_links)]
#![doc = include_str!("../README.md")]
#[cfg(all(all(feature = "tokio", feature = "async-io"), not(doc)))]
compile_error!("You can't enable both async-io & tokio features at once");
#[cfg(all(not(feature = "tokio"), not(feature = "async-io"), not(doc)))]
compile_error!("Either the `async-io` or the `tokio` feature has to be enabled");

/// Alias for a [`Result`] with the error type `waypost::PortalError`.
pub type Result<T> = std::result::Result<T, PortalError>;

mod app_id;
mod error;
mod handle_token;
mod registry;
mod window_identifier;

pub use self::{
    app_id::AppID,
    error::PortalError,
    handle_token::HandleToken,
    window_identifier::WindowIdentifierType,
};

/// The bus-facing portal objects and the builder wiring them up.
pub mod backend;
/// Typed access to the compositor's capture service.
pub mod compositor;
/// The consent dialog contract filled in by the embedding backend.
pub mod consent;
/// Wire types shared with portal frontends.
pub mod desktop;

pub use async_trait;
pub use enumflags2;
pub use zbus::{self, zvariant};
