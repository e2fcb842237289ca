//! Email connection state: token encryption, provider clients, health
//! classification and the subscription/watch maintenance jobs.

pub mod cipher;
pub mod gmail;
pub mod graph;
pub mod oauth;
pub mod renewal;
pub mod status;
pub mod tokens;
pub mod watch;
