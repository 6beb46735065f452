//! # robotline-core
//!
//! Core library for robotline - a console for remote robot instances.
//!
//! This library provides:
//! - Domain types for instances, timeline entries, and plans
//! - Normalization of raw backend rows
//! - The instance session coordinator (optimistic sends, live feed merging,
//!   thinking indicators, instance start-up polling)
//! - Backend collaborator traits with in-memory and REST implementations
//! - Configuration management
//! - Logging infrastructure
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use robotline_core::backend::{Collaborators, RestBackend};
//! use robotline_core::session::{SessionContext, SessionCoordinator};
//! use robotline_core::Config;
//!
//! // Load configuration
//! let config = Config::load().expect("failed to load config");
//!
//! // Connect to the hosted backend
//! let backend = RestBackend::new(&config.backend).expect("backend not configured");
//! let session = SessionCoordinator::new(
//!     config.session.clone(),
//!     Collaborators::from_backend(Arc::new(backend)),
//!     SessionContext::new("site-1", config.session.activity.clone()),
//! );
//! ```

// Re-export commonly used items at the crate root
pub use config::Config;
pub use error::{Error, Result};
pub use session::{SendOutcome, SessionCoordinator, SessionSignal, SessionSnapshot};
pub use types::*;

// Public modules
pub mod backend;
pub mod config;
pub mod error;
pub mod format;
pub mod logging;
pub mod normalize;
pub mod session;
pub mod types;
