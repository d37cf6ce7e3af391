//! Crewline — multi-role Feishu bot bridge.
//!
//! A single process fronting a team of role bots in a Feishu group chat.
//! Each role is backed by a long-lived agent session on a remote gateway;
//! a designated coordinator role drives multi-role task execution through
//! a bounded delegation loop.
//!
//! ```text
//! Feishu webhook -> router -> RoleEngine (direct chat, exclusive per role+chat)
//!                          -> Orchestrator (task mode, parallel per task)
//!                                 |
//!                            RoleEngine::execute_task
//!                                 |
//!                            GatewayClient::run_session (one WS per call)
//! ```

pub mod config;
pub mod feishu;
pub mod gateway;
pub mod orchestrator;
pub mod roles;
pub mod router;
pub mod server;
pub mod tasks;
