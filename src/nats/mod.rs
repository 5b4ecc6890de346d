//! NATS connectivity shared by the queue, the worker and the broadcast relay

pub mod client;

pub use client::NatsClient;
