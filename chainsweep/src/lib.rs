//! Certificate-chain handshake test harness.
//!
//! Cross-signed CA rotations can produce serving bundles whose validity
//! depends on the order the CA certs appear in. This crate sweeps every
//! ordering of a small CA set: for each ordering it writes a serving-bundle
//! file, starts a TLS test server presenting it, runs a verifying client
//! against the server, and records whether the handshake was accepted.
//!
//! The sweep covers two scenarios per run: bundles without the client's
//! trusted root, and bundles that include it. Rejections are findings, not
//! errors; the report distinguishes them from harness malfunctions.

/// Serving-bundle construction and CA permutations.
pub mod bundle;
/// Command line interface and the sweep driver.
pub mod cli;
/// Error taxonomy for the sweep.
pub mod error;
/// `tracing` logger setup.
pub mod logger;
/// Sweep outcomes and the final report.
pub mod report;
/// Per-case process choreography: server up, client handshake, server down.
pub mod runner;
/// Cross-signed rotation PKI fixture generation.
pub mod testca;
/// PEM loading and rustls config construction.
pub mod tls;
