//! termbridge brokers one remote interactive shell between an AI agent and
//! browser-based viewers.
//!
//! The agent drives commands over MCP tool calls; every attached viewer sees
//! the raw terminal byte stream over WebSocket; the agent gets a filtered,
//! token-efficient summary of each command's output. One SSH session, one
//! command in flight at a time.

pub mod buffer;
pub mod bus;
pub mod config;
pub mod error;
pub mod filter;
pub mod gateway;
pub mod link;
pub mod orchestrator;
pub mod prompt;
pub mod registry;
pub mod server;
pub mod session;
