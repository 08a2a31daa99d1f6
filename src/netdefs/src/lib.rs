//! Shared definitions for the netcore networking engine.  This crate holds
//! the constants and plain data structures that the engine and the protocol,
//! network, and data-link layer crates all need to agree on: status codes,
//! socket and link flag words, the generic network address and its total
//! ordering, and packet size accounting.  It deliberately has no dependencies
//! so that layer crates can pull it in without dragging the engine along.

pub mod constants;
pub mod data;
