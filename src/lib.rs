#![crate_name = "dagway"]

//! dagway is a browser-friendly HTTP gateway over a content-addressed
//! merkle-DAG object store.
//!
//! Paths of the form `/ipfs/<cid>[/...]` name immutable content: the first
//! segment is a content identifier and the rest is a walk through named
//! links. Paths under `/ipns/<name>[/...]` go through a mutable naming
//! layer first, so the same path may resolve differently over time.
//!
//! A resolved path is served as whatever it turns out to be: a file
//! (range-aware, with content type negotiation), a directory (redirect to
//! or render of its `index.html`, otherwise a generated HTML listing), a
//! raw block (`?format=raw`) or a linear archive of the whole DAG
//! (`?format=car`).
//!
//! ## Writable mode
//!
//! With the `--writable` flag, `POST` imports a request body and returns
//! its new identifier, while `PUT` and `DELETE` treat the path as an
//! existing root plus an interior path, splice or unlink the entry in a
//! per-request overlay, and return the resulting new root in the
//! `IPFS-Hash` header. Nothing is modified in place; old roots keep
//! resolving.
//!
//! ## Running the daemon
//!
//! The daemon listens on all addresses on port 8080 by default and serves
//! a process-local in-memory store, which makes a writable instance usable
//! out of the box. See `cargo run -- --help` for the options.

/// Command line flags and runtime configuration.
pub mod arg;

/// Content identifiers.
pub mod cid;

/// Logical gateway paths and their canonical form.
pub mod path;

/// The backend seam: store traits, node types, request context.
pub mod backend;

/// In-memory merkle-DAG store behind the backend seam.
pub mod memdag;

/// Request router, path canonicalizer and representation negotiator.
pub mod request;

/// Response model and the wire adapter.
pub mod response;

/// UnixFS file responder.
pub mod file;

/// Directory responder and HTML listing.
pub mod listing;

/// Raw block and archive responders.
pub mod block;

/// Writable overlay: POST, PUT and DELETE.
pub mod writable;

/// Latency metric with idempotent registration.
pub mod metrics;
