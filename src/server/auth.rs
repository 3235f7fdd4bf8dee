//! Bearer-token authentication: one operator token plus repo-scoped CD
//! tokens.

use std::collections::HashMap;

use actix_web::HttpRequest;
use serde::Deserialize;

use super::error::ApiError;
use crate::deployment::notification::TokenScope;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CdTokenConfig {
    pub token: String,
    pub scope: TokenScope,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AuthConfig {
    /// Token operators authenticate with.
    pub operator_token: String,
    /// Repo-scoped CD tokens: each bound to exactly one image kind.
    pub cd_tokens: Vec<CdTokenConfig>,
    /// Wildcard CD token kept for backward compatibility.
    pub legacy_cd_token: Option<String>,
}

/// Resolved token table used by the handlers.
pub struct AuthTokens {
    operator: String,
    cd: HashMap<String, TokenScope>,
}

impl AuthTokens {
    pub fn new(config: AuthConfig) -> Self {
        let mut cd: HashMap<String, TokenScope> = config
            .cd_tokens
            .into_iter()
            .map(|t| (t.token, t.scope))
            .collect();
        if let Some(legacy) = config.legacy_cd_token {
            cd.insert(legacy, TokenScope::Legacy);
        }
        Self {
            operator: config.operator_token,
            cd,
        }
    }

    /// Operator endpoints: the operator bearer token is required.
    pub fn require_operator(&self, req: &HttpRequest) -> Result<(), ApiError> {
        let token = bearer(req)?;
        if token == self.operator {
            Ok(())
        } else {
            Err(ApiError::Forbidden("invalid operator token".to_string()))
        }
    }

    /// CD endpoints: resolves the bearer token to its image-kind scope.
    /// The operator token is accepted with legacy (wildcard) scope.
    pub fn require_cd_scope(&self, req: &HttpRequest) -> Result<TokenScope, ApiError> {
        let token = bearer(req)?;
        if let Some(scope) = self.cd.get(token) {
            return Ok(*scope);
        }
        if token == self.operator {
            return Ok(TokenScope::Legacy);
        }
        Err(ApiError::Forbidden("invalid deployment token".to_string()))
    }
}

fn bearer(req: &HttpRequest) -> Result<&str, ApiError> {
    req.headers()
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or_else(|| ApiError::Forbidden("missing bearer token".to_string()))
}
