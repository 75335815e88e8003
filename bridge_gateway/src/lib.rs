//! REST Gateway (C8), Response Cache (C9), Admission/Rate Limiter (C10),
//! and MCP Orchestrator (C11) — spec.md §4.8-4.11. Wires the lower
//! components (`bridge_registry`, `bridge_resilience`, `bridge_pool`,
//! `bridge_translate`) into one stateless HTTP-facing process.

pub mod admission;
pub mod breakers;
pub mod cache;
pub mod dispatch;
pub mod health;
pub mod probe;
pub mod rest;
pub mod router;
pub mod state;

pub use dispatch::dispatch;
pub use state::GatewayState;
