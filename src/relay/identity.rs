// src/relay/identity.rs
//! Per-user token resolution
//!
//! Token validation lives in the host application; the relay only consumes
//! the result. An unknown token is not an error: the request is forwarded
//! untouched and never emulated.

use crate::emulation::store::UserId;
use std::collections::HashMap;

pub trait IdentityResolver: Send + Sync {
    fn resolve(&self, token: &str) -> Option<UserId>;
}

/// Fixed token table, typically from configuration
#[derive(Debug, Clone, Default)]
pub struct StaticTokenResolver {
    tokens: HashMap<String, UserId>,
}

impl StaticTokenResolver {
    pub fn new(tokens: HashMap<String, i64>) -> Self {
        Self {
            tokens: tokens.into_iter().map(|(k, v)| (k, UserId(v))).collect(),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>, user: UserId) -> Self {
        self.tokens.insert(token.into(), user);
        self
    }
}

impl IdentityResolver for StaticTokenResolver {
    fn resolve(&self, token: &str) -> Option<UserId> {
        self.tokens.get(token).copied()
    }
}
