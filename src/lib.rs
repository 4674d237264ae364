//! datapick - declarative data extraction engine
//!
//! This crate reads a YAML description of a value graph and lazily
//! evaluates only what is requested: dotted paths resolve through the
//! graph, properties memoize their results, external sources (files,
//! includes, HTTP) fetch on demand behind a single-flight guard, and
//! nested results flatten recursively and concurrently into plain
//! structures.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use datapick::{Engine, EngineError, EvalOptions};
//!
//! # async fn demo() -> Result<(), EngineError> {
//! let engine = Engine::load(
//!     "emma:\n  name: goldman\nshadow: !property 0.emma\n",
//! )?;
//!
//! // Walk the graph; the property realizes on access.
//! let name = engine.eval_path("0.shadow.name", EvalOptions::default()).await?;
//!
//! // Realize every nested lazy value at once.
//! let shadow = engine.eval_path("0.shadow", EvalOptions::flat()).await?;
//! # Ok(())
//! # }
//! ```

// Core error handling
pub mod error;

// Value model and evaluable nodes
pub mod node;
pub mod value;

// Resolver/evaluator
pub mod engine;

// Document loading
pub mod loader;

// Leaf transformations and external fetchers
pub mod filters;
pub mod sources;

pub use engine::{Engine, EvalOptions};
pub use error::EngineError;
pub use node::{Call, EvalNode, FilterChain, NativeFn, Node, Property, Source};
pub use sources::{Fetch, FileFetcher, HttpFetcher, IncludeFetcher};
pub use value::{Map, Value};
