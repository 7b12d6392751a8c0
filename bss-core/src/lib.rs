//! Core library for the APS scheduling bridge: record model, error taxonomy,
//! configuration.
//!
//! - [`types`]: users, proposals, ESAFs, timestamps, identifiers
//! - [`error`]: [`FetchError`], [`PublishError`], [`ConfigError`]
//! - [`config`]: `~/.apsbss/config.yaml` load / save / validate
//! - [`text`]: display helpers

pub mod config;
pub mod error;
pub mod text;
pub mod types;

pub use config::{Config, IdleStatus, Settings};
pub use error::{ConfigError, FetchError, FetchErrorKind, PublishError, TimestampError};
pub use types::{
    BeamlineName, Esaf, EsafId, Proposal, ProposalId, RawText, Run, SectorId, Station,
    Timestamp, User, UserList, MAX_USERS,
};
