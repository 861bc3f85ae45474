//! Key-balancing relay for the Gemini API.
//!
//! Accepts chat-completion, embedding, token-counting and model-listing
//! requests in two dialects (Gemini-native and OpenAI-compatible) and forwards
//! them to a single upstream provider, rotating credentials across a managed
//! key pool while enforcing global and per-key rate limits.
//!
//! ```text
//! Request -> Endpoint -> Orchestrator -> Upstream
//!               |             |
//!               v             v
//!          AppContext    payload shaping,
//!          (key pool,    response transform,
//!           limiters,    settlement
//!           client)
//! ```

pub mod config;
pub mod logger;
pub mod relay;
pub mod server;
