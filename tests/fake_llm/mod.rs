//! Fake LLM HTTP server for integration testing
//!
//! An in-process HTTP/1.1 server that plays back a scripted sequence of
//! responses, one per request, recording everything it receives. It
//! speaks just enough HTTP to satisfy reqwest:
//!
//! TCP accept -> request line -> headers -> content-length body -> reply
//!
//! ## Module layout
//!
//! - `script` -- scripted replies and their builder
//! - `server` -- TCP listener, request recording, playback

pub mod script;
mod server;

pub use script::ScriptBuilder;
pub use server::FakeLlmServer;
