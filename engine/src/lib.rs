//! # Poll/Cache Orchestration Engine
//!
//! This library implements the polling and caching core of the live
//! server-browser backend. It continuously queries a dynamic set of remote
//! game servers for liveness and status, maintains several derived
//! time-windowed caches, and hands updated records to a publish sink owned
//! by the transport layer.
//!
//! ## Core Responsibilities
//!
//! ### Bounded Polling
//! Every poll cycle issues one query per tracked target with a fixed
//! parallelism ceiling. A single-flight guard drops overlapping cycle
//! starts instead of queueing them, and per-target failures never abort
//! the cycle.
//!
//! ### Target Health Tracking
//! Each target moves through a small lifecycle: discovered, online,
//! degraded after transient failures, offline after three consecutive
//! failures, and eventually evicted when its title is no longer tracked
//! or it has been unreachable for a day.
//!
//! ### Derived Caches
//! Successful polls feed a hysteresis-based tag cache (so noisy rule data
//! cannot flap published labels), a geolocation cache, per-server daily
//! peak history, and global per-title aggregates. All derived documents
//! persist as JSON with atomic replace semantics.
//!
//! ## Architecture Design
//!
//! The engine follows a single-writer model: worker tasks perform pure
//! network I/O and report results over a channel back to the cycle's
//! aggregator, which is the only code mutating the registry and the
//! derived caches. The remote protocols (server query, directory HTTP
//! API, anonymous directory fallback, IP geolocation) and the subscriber
//! transport are collaborator seams expressed as traits; reqwest-backed
//! implementations are provided for the HTTP collaborators.
//!
//! ## Module Organization
//!
//! - [`registry`] — target registry and per-target health state machine
//! - [`poller`] — bounded poll scheduler and cycle aggregator
//! - [`query`] — server query protocol seam (info / players / rules)
//! - [`rules`] — rule payload normalization and tag extraction
//! - [`tags`] — tag stabilization cache with divergence hysteresis
//! - [`discovery`] — tiered target acquisition with fallback
//! - [`stats`] — per-server history and global aggregate documents
//! - [`geo`] — IP geolocation seam and cache
//! - [`storage`] — atomic JSON document store
//! - [`publish`] — change publisher seam and broadcast implementation
//! - [`config`] — engine configuration and credentials loading
//! - [`runner`] — supervised periodic run loop tying it all together

pub mod config;
pub mod discovery;
pub mod geo;
pub mod poller;
pub mod publish;
pub mod query;
pub mod registry;
pub mod runner;
pub mod rules;
pub mod stats;
pub mod storage;
pub mod tags;
