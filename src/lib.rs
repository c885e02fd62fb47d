//! Sidecar adapter bridging a postfix MTA to the userli user-management API.
//!
//! The adapter terminates two postfix wire protocols and translates them
//! into authenticated REST calls against userli:
//!
//! - **Socketmap** (netstring-framed key/value lookups) for the alias,
//!   domain, mailbox, and senders maps.
//! - **SMTP access policy delegation** for per-sender send-rate limiting,
//!   enforced locally with an in-memory sliding window.
//!
//! The TCP core is shared: both protocol handlers run on the same
//! accept-and-dispatch server with a bounded connection pool, per-operation
//! deadlines, and graceful drain on shutdown. Lookups fail closed to a
//! temporary error so the MTA retries; policy decisions fail open so a
//! fault here never loses mail.

pub mod config;
pub mod error;
pub mod metrics;
pub mod netstring;
pub mod policy;
pub mod ratelimit;
pub mod sanitize;
pub mod server;
pub mod socketmap;
pub mod userli;
