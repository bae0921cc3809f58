//! Concurrent CDN edge endpoint scanner.
//!
//! A [`registry::ScanRegistry`] starts scans from a [`types::ScanRequest`]. Each scan
//! draws candidates from one [`source`], tests them with a bounded worker pool in
//! [`controller`] using the [`probe`] procedure over a [`transport::Transport`], and keeps
//! the accepted endpoints as share links built from the base [`config`].

pub mod bypass;
pub mod config;
pub mod controller;
pub mod error;
pub mod export;
pub mod ports;
pub mod probe;
pub mod ranges;
pub mod registry;
pub mod relax;
pub mod server;
pub mod settings;
pub mod source;
pub mod transport;
pub mod types;
