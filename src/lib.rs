//! Conversation Identity and Responsibility Routing Core
//!
//! Backend service for a multi-tenant CRM chat product. It resolves inbound
//! contacts to canonical leads, keeps one conversation per contact per
//! company, routes responsibility between human attendants and the automated
//! agent, dispatches outbound messages through the delivery provider and
//! records an immutable audit trail of every routing decision.
//!
//! # Modules
//!
//! - `audit`: Append-only audit trail with paged queries.
//! - `circuit_breaker`: Circuit breaker guarding the delivery provider.
//! - `config`: Configuration management.
//! - `conversation`: Conversation and message store.
//! - `db`: Database connection and pool management.
//! - `dispatch`: Outbound delivery gateway and reconciliation sweep.
//! - `errors`: Error handling types.
//! - `handlers`: HTTP request handlers and shared state.
//! - `identity`: Contact identifier normalization and lead resolution.
//! - `intake`: Inbound event webhook.
//! - `models`: Core data models and wire types.
//! - `realtime`: WebSocket fan-out of conversation events.
//! - `responsibility`: Human/agent routing and the responsibles projection.

pub mod audit;
pub mod circuit_breaker;
pub mod config;
pub mod conversation;
pub mod db;
pub mod dispatch;
pub mod errors;
pub mod handlers;
pub mod identity;
pub mod intake;
pub mod models;
pub mod realtime;
pub mod responsibility;
