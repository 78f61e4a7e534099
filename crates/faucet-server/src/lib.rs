//! Faucet server - dispenses a native chain asset and an ERC-20 token
//!
//! An HTTP service that pays out fixed amounts to caller-supplied
//! addresses, gated by hCaptcha verification and per-client rate
//! limiting. Outgoing transactions are sequenced by a single in-process
//! nonce counter that is resynced from the node when a sequencing
//! conflict is reported.

pub mod captcha;
pub mod config;
pub mod error;
pub mod eth;
pub mod http;
pub mod limiter;

pub use config::FaucetConfig;
pub use error::{FaucetError, FaucetResult};
