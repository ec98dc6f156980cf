//! `rudp` — reliable, ordered delivery over UDP.
//!
//! # Architecture
//!
//! ```text
//!  ┌────────────┐  accept()   ┌──────────────────────────────┐
//!  │  Listener  │────────────▶│          Connection          │
//!  │ (demux by  │ datagrams   │ send · resend · receive ·    │
//!  │  peer addr)│────────────▶│ heartbeat loops              │
//!  └─────┬──────┘             └──────┬──────────────┬────────┘
//!        │                           │ segments     │ stores
//!        │                    ┌──────▼─────┐  ┌─────▼───────────┐
//!        │                    │   packet   │  │ SequencedStore  │
//!        │                    └──────┬─────┘  └─────────────────┘
//!  ┌─────▼───────────────────────────▼─────┐
//!  │   socket (DatagramSink / Inbound)     │
//!  └───────────────────────────────────────┘
//! ```
//!
//! Each module has a single responsibility:
//! - [`packet`]     — 12-byte header wire format and segment kinds
//! - [`store`]      — sequence-indexed, age-stamped segment store
//! - [`state`]      — connection FSM types
//! - [`timer`]      — timing knobs and the runtime send pacer
//! - [`socket`]     — datagram I/O seam
//! - [`connection`] — the per-connection reliable-delivery engine
//! - [`listener`]   — server-side demultiplexer and accept queue
//! - [`simulator`]  — fault-injecting sink for loss testing

pub mod connection;
pub mod listener;
pub mod packet;
pub mod simulator;
pub mod socket;
pub mod state;
pub mod store;
pub mod timer;

pub use connection::{ConnError, Connection};
pub use listener::Listener;
pub use state::{ConnectionState, Role};
pub use timer::TimerConfig;
