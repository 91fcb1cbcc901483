//! # syncrelay-auth
//!
//! Bearer-token authentication for SyncRelay. Tokens are HS256 JWTs issued
//! by the account service; the relay only needs to validate them and read
//! the user ID.
//!
//! ## Modules
//!
//! - `jwt`: claims, token creation, and validation

pub mod jwt;

pub use jwt::{Claims, JwtDecoder, JwtEncoder, TokenType};
