//! TopPet Server - Realtime contest broadcast hub.
//!
//! This crate pushes live contest activity to viewers:
//! - Accepting viewer WebSocket connections and contest subscriptions
//! - Receiving signed events from the contest, vote and chat services
//! - Fanning events out to every viewer of the affected contest
//!
//! # Architecture
//!
//! A single coordinator task owns the room index (see [`hub`]). Each
//! connection runs a [`connection::Session`] with its own bounded outbound
//! queue; a viewer that cannot keep up is evicted rather than slowing the
//! room down. Nothing is persisted.

pub mod actions;
pub mod auth;
pub mod chat;
pub mod config;
pub mod connection;
pub mod error;
pub mod hub;
pub mod protocol;
pub mod rate_limit;
pub mod routes;
pub mod types;
