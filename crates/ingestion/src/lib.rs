//! Weather data acquisition library.
//!
//! Turns a request for `(model, run, forecast hour, variable, region)` into
//! raw GRIB2 payloads in the local cache, and decoded fields into the
//! composite variables the tile pipeline publishes.
//!
//! # Architecture
//!
//! - [`classify`]: decides whether an upstream failure means "not published
//!   yet" or a hard error, by walking the full error source chain.
//! - [`models`]: the closed set of supported models and their capabilities.
//! - [`registry`]: variable ids, aliases, selection and derivation recipes.
//! - [`derive`]: combine functions for composite variables.
//! - [`decoder`]: boundary to the external GRIB2 decoder.
//! - [`providers`]: upstream data providers (HTTP `.idx` byte-range fetch).
//! - [`acquisition`]: the multi-provider fetch engine.

pub mod acquisition;
pub mod classify;
pub mod decoder;
pub mod derive;
pub mod error;
pub mod models;
pub mod providers;
pub mod registry;

// Re-exports
pub use acquisition::{AcquisitionEngine, FetchPolicy, FetchRequest, FetchResult};
pub use classify::{NotReadyClassifier, Readiness};
pub use decoder::{decode_with_relaxation, DecodeError, DecodedField, FieldDecoder, GribDecoder};
pub use derive::derive_composite;
pub use error::{IngestionError, Result};
pub use models::{Model, PrecipType};
pub use providers::{HttpProvider, Provider, ProviderPayload, ProviderRequest, SearchTerm, UpstreamError};
pub use registry::{DeriveKind, FieldSelection, Hints, Plan, ResolvedVariable, Selectors, VariableRegistry, VariableSpec};
