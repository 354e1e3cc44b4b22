use axum::{extract::FromRequestParts, http::request::Parts};
use tracing::{instrument, trace};

use super::{ADMIN_ROLE, ROLE_HEADER, USER_HEADER};
use crate::{
    errors::{Error, Result},
    types::UserId,
};

/// The authenticated caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CurrentUser {
    pub id: UserId,
    pub is_admin: bool,
}

/// A caller with the admin role; anyone else gets 403
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdminUser(pub CurrentUser);

fn header<'a>(parts: &'a Parts, name: &str) -> Option<&'a str> {
    parts.headers.get(name).and_then(|h| h.to_str().ok()).map(str::trim).filter(|v| !v.is_empty())
}

impl<S: Send + Sync> FromRequestParts<S> for CurrentUser {
    type Rejection = Error;

    #[instrument(skip_all)]
    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self> {
        let Some(raw) = header(parts, USER_HEADER) else {
            trace!("No identity header on request");
            return Err(Error::Unauthenticated { message: None });
        };
        let id = raw.parse::<UserId>().map_err(|_| Error::Unauthenticated {
            message: Some(format!("Invalid {USER_HEADER} header")),
        })?;

        let is_admin = header(parts, ROLE_HEADER)
            .map(|roles| roles.split(',').any(|r| r.trim().eq_ignore_ascii_case(ADMIN_ROLE)))
            .unwrap_or(false);

        Ok(CurrentUser { id, is_admin })
    }
}

impl<S: Send + Sync> FromRequestParts<S> for AdminUser {
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self> {
        let user = CurrentUser::from_request_parts(parts, state).await?;
        if !user.is_admin {
            return Err(Error::Forbidden {
                message: "Admin role required".to_string(),
            });
        }
        Ok(AdminUser(user))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    async fn extract(headers: &[(&str, &str)]) -> Result<CurrentUser> {
        let mut builder = Request::builder();
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let (mut parts, _) = builder.body(()).unwrap().into_parts();
        CurrentUser::from_request_parts(&mut parts, &()).await
    }

    #[tokio::test]
    async fn test_identity_comes_from_headers() {
        let id = UserId::new_v4();
        let user = extract(&[(USER_HEADER, &id.to_string())]).await.unwrap();
        assert_eq!(user, CurrentUser { id, is_admin: false });

        let admin = extract(&[(USER_HEADER, &id.to_string()), (ROLE_HEADER, "billing, Admin")]).await.unwrap();
        assert!(admin.is_admin);
    }

    #[tokio::test]
    async fn test_missing_or_garbled_identity_is_unauthenticated() {
        assert!(matches!(extract(&[]).await, Err(Error::Unauthenticated { .. })));
        assert!(matches!(extract(&[(USER_HEADER, "bob")]).await, Err(Error::Unauthenticated { .. })));
    }
}
