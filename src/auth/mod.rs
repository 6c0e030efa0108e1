//! Authentication for the HTTP API
//!
//! Bearer JWTs identify the caller (`sub` is the user id). What the caller may
//! do inside a family is decided by the membership guard, not by the token.

pub mod jwt;

pub use jwt::{extract_token_from_header, Claims, JwtValidator, TokenInput, TokenValidationResult};
