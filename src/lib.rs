//! Subproxy - A virtual-hosting reverse proxy with runtime-managed routes
//!
//! This library provides a reverse proxy that:
//! - Extracts a subdomain label from the Host header of each request
//! - Resolves the label to a backend URL through a persistent mapping store
//! - Streams the request and response between client and backend
//! - Serves a control plane on the bare root domain for managing mappings
//! - Gates registered backends through an IP / CIDR / hostname allow-list

pub mod admin;
pub mod admission;
pub mod config;
pub mod error;
pub mod pool;
pub mod proxy;
pub mod router;
pub mod store;
