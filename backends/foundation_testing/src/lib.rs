//! Reusable test infrastructure for Foundation crates.
//!
//! This crate provides:
//! - **HTTP test server**: a loopback HTTP/1.1 peer with scripted responses
//!
//! # Examples
//!
//! ```rust
//! use foundation_testing::http::{HttpResponse, TestHttpServer};
//!
//! let server = TestHttpServer::with_response(|_req| HttpResponse::chunked(["hel", "lo"]));
//! assert!(server.url("/").starts_with("http://127.0.0.1:"));
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)] // Common for testing crates

pub mod http;

pub use http::{HttpRequest, HttpResponse, TestHttpServer};
