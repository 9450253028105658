//! 调用方身份：由上游认证网关转发，本服务只负责解析与校验。

use axum::body::Body as AxumBody;
use axum::extract::Extension;
use axum::http::{HeaderMap, Request};
use axum::{middleware, response::Response};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::ANONYMOUS_NICKNAME;
use crate::error::ApiError;

pub const IDENTITY_SECRET_HEADER: &str = "x-identity-secret";
pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_NICKNAME_HEADER: &str = "x-user-nickname";
pub const USER_ROLE_HEADER: &str = "x-user-role";

#[derive(Debug)]
pub struct IdentityConfig {
    pub shared_secret: Option<String>,
    pub allow_anonymous: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    User,
    Anonymous,
}

impl Role {
    fn parse(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("admin") {
            Role::Admin
        } else {
            Role::User
        }
    }
}

/// Authenticated (or anonymous) caller. Only used to pick isolation roots.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    pub user_id: u64,
    pub nickname: String,
    pub role: Role,
}

impl Identity {
    pub fn new(user_id: u64, nickname: impl Into<String>, role: Role) -> Self {
        Self {
            user_id,
            nickname: nickname.into(),
            role,
        }
    }

    pub fn anonymous() -> Self {
        Self::new(0, ANONYMOUS_NICKNAME, Role::Anonymous)
    }

    pub fn is_anonymous(&self) -> bool {
        self.user_id == 0
    }
}

/// 身份中间件：解析转发头并写入请求扩展。
pub async fn identity_middleware(
    Extension(config): Extension<Arc<IdentityConfig>>,
    mut req: Request<AxumBody>,
    next: middleware::Next,
) -> Result<Response, ApiError> {
    if !req.uri().path().starts_with("/api/storage") {
        return Ok(next.run(req).await);
    }

    let identity = identity_from_headers(req.headers(), &config)?;
    if identity.is_anonymous() && !config.allow_anonymous {
        return Err(ApiError::Unauthorized);
    }
    debug!(user_id = identity.user_id, role = ?identity.role, "identity resolved");
    req.extensions_mut().insert(identity);
    Ok(next.run(req).await)
}

/// 仅当共享密钥匹配时信任身份头，否则视为匿名。
pub fn identity_from_headers(
    headers: &HeaderMap,
    config: &IdentityConfig,
) -> Result<Identity, ApiError> {
    let Some(secret) = config.shared_secret.as_deref() else {
        return Ok(Identity::anonymous());
    };
    let presented = headers
        .get(IDENTITY_SECRET_HEADER)
        .and_then(|value| value.to_str().ok());
    match presented {
        Some(value) if value == secret => {}
        Some(_) => {
            warn!("identity secret mismatch, treating caller as anonymous");
            return Ok(Identity::anonymous());
        }
        None => return Ok(Identity::anonymous()),
    }

    let Some(user_id) = header_str(headers, USER_ID_HEADER) else {
        return Ok(Identity::anonymous());
    };
    let user_id = user_id
        .parse::<u64>()
        .map_err(|_| ApiError::BadRequest("invalid user id".into()))?;
    if user_id == 0 {
        return Ok(Identity::anonymous());
    }
    let nickname = header_str(headers, USER_NICKNAME_HEADER)
        .ok_or_else(|| ApiError::BadRequest("user nickname is required".into()))?;
    let role = header_str(headers, USER_ROLE_HEADER)
        .map(Role::parse)
        .unwrap_or(Role::User);

    Ok(Identity::new(user_id, nickname, role))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}
