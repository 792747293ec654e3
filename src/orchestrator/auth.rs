//! Caller identity for the control-plane API.
//!
//! Authentication happens upstream. The auth proxy forwards the verified
//! identity in headers:
//! - `x-user-email` is required and becomes the owner identity
//! - `x-user-name` is optional profile data
//!
//! Requests without an identity are rejected with 401 before reaching a
//! handler.

use axum::extract::Request;
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::Response;

use crate::session::Owner;

pub const USER_EMAIL_HEADER: &str = "x-user-email";
pub const USER_NAME_HEADER: &str = "x-user-name";

/// Identity of the caller, inserted into request extensions by
/// [`caller_identity_middleware`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub email: String,
    pub name: Option<String>,
}

impl Caller {
    fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let email = header_value(headers, USER_EMAIL_HEADER)?;
        let name = header_value(headers, USER_NAME_HEADER);
        Some(Self { email, name })
    }

    /// Owner record stamped onto sessions and jobs the caller creates.
    pub fn owner(&self) -> Owner {
        let owner = Owner::new(self.email.clone());
        match &self.name {
            Some(name) => owner.with_profile("name", serde_json::Value::String(name.clone())),
            None => owner,
        }
    }
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Axum middleware that requires a caller identity.
///
/// Wire up with `axum::middleware::from_fn(caller_identity_middleware)`.
pub async fn caller_identity_middleware(
    mut request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let caller = Caller::from_headers(request.headers()).ok_or(StatusCode::UNAUTHORIZED)?;
    request.extensions_mut().insert(caller);
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn test_caller_from_headers() {
        let caller = Caller::from_headers(&headers(&[
            (USER_EMAIL_HEADER, " a@x.com "),
            (USER_NAME_HEADER, "Ada"),
        ]))
        .unwrap();
        assert_eq!(caller.email, "a@x.com");
        assert_eq!(caller.name.as_deref(), Some("Ada"));

        let owner = caller.owner();
        assert_eq!(owner.identity(), Some("a@x.com"));
        assert_eq!(owner.profile["name"], "Ada");
    }

    #[test]
    fn test_blank_email_is_no_caller() {
        assert!(Caller::from_headers(&headers(&[(USER_EMAIL_HEADER, "   ")])).is_none());
        assert!(Caller::from_headers(&headers(&[(USER_NAME_HEADER, "Ada")])).is_none());
    }
}
