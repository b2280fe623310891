//! Default transport implementations (§6). Gated behind Cargo features so a
//! caller pulling in only the engine can skip the TLS/socket dependency
//! stack entirely — mirrors the teacher's own `ws`/`openssl`/`rustls`
//! feature split in `ethers-connections`/`ethers-providers`.

#[cfg(feature = "ws")]
pub mod ws;
