// Hardware-address normalization
pub mod identity;

// Wall-clock abstraction
pub mod clock;

// Configuration loading
pub mod config;

// Per-entity presence fusion
pub mod presence;

// Heartbeat timeout timers and reconciliation
pub mod scheduler;

// Household aggregation and controller mirror
pub mod household;

// Subject mapping and payload decoding
pub mod router;

// NATS heartbeat subscriptions
pub mod transport;

// Outbound mode controller
pub mod controller;

// Persistent key-value state
pub mod store;

// Operator HTTP API
pub mod api;
