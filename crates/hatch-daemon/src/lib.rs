//! HTTP daemon for the sandbox lifecycle manager: the sandbox API surface,
//! the peer route-sync wire (`/hello`, `PUT /routes`) and process plumbing
//! (telemetry, rate limiting, request ids).

pub mod middleware;
pub mod server;
pub mod telemetry;
