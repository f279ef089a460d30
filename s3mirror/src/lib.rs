//! Mirrors a remote object-store bucket into a local directory tree.
//!
//! Two update paths keep the mirror current: full list-and-compare
//! synchronization ([`sync`]) on start-up and optionally on a timer, and
//! push notifications received over HTTP(S) ([`ingress`]). Both reduce to
//! [`action::FileAction`] values executed through the per-path serialized
//! operation queue ([`queue`]) against the local tree ([`fs_ops`]).
#![deny(unsafe_code)]
#![deny(clippy::undocumented_unsafe_blocks)]

pub mod action;
pub mod config;
pub mod daemon;
pub mod fs_ops;
pub mod ingress;
pub mod ordering;
pub mod queue;
pub mod subscription;
pub mod sync;
pub mod transform;
