//! HTTP test server utilities.
//!
//! WHY: Provides real HTTP test server built on stdlib TCP.
//! Avoids external dependencies by using hand-crafted HTTP/1.1 responses.
//!
//! WHAT: `TestHttpServer` for integration testing HTTP transports.
//!
//! HOW: Uses stdlib's `TcpListener` with manually crafted HTTP responses.

mod server;

pub use server::{HttpRequest, HttpResponse, ResponseBody, TestHttpServer};
