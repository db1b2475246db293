//! Extracts the opaque user-ID claim set by the upstream identity
//! middleware and evaluates the `AllowedUser`/`Admin` policies against it.
//! The claim's own mechanics (OAuth, session cookies, ...) are an external
//! collaborator's concern; this module only reads the header the upstream
//! middleware is expected to set.

use axum::extract::FromRequestParts;
use axum::http::StatusCode;
use axum::http::request::Parts;
use sendie_core::AllowList;

/// Header carrying the authenticated principal's opaque user-ID, set by the
/// upstream identity middleware. Absent means anonymous.
const USER_ID_HEADER: &str = "x-sendie-user-id";

#[derive(Debug, Clone, Default)]
pub struct Principal {
    pub user_id: Option<String>,
}

impl Principal {
    pub fn is_allowed(&self, allow_list: &AllowList) -> bool {
        self.user_id.as_deref().is_some_and(|id| allow_list.is_allowed(id))
    }

    pub fn is_admin(&self, allow_list: &AllowList) -> bool {
        self.user_id.as_deref().is_some_and(|id| allow_list.is_admin(id))
    }
}

impl<S> FromRequestParts<S> for Principal
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, &'static str);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user_id = parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.is_empty())
            .map(str::to_string);

        Ok(Self { user_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn allow_list() -> AllowList {
        AllowList::load(vec!["admin-1".into()], vec!["user-1".into()], Path::new(&std::env::temp_dir().join("sendie-auth-test"))).unwrap()
    }

    #[test]
    fn anonymous_principal_is_neither_allowed_nor_admin() {
        let principal = Principal { user_id: None };
        let list = allow_list();
        assert!(!principal.is_allowed(&list));
        assert!(!principal.is_admin(&list));
    }

    #[test]
    fn allow_listed_user_is_allowed_but_not_admin() {
        let principal = Principal { user_id: Some("user-1".into()) };
        let list = allow_list();
        assert!(principal.is_allowed(&list));
        assert!(!principal.is_admin(&list));
    }

    #[test]
    fn admin_is_both_allowed_and_admin() {
        let principal = Principal { user_id: Some("admin-1".into()) };
        let list = allow_list();
        assert!(principal.is_allowed(&list));
        assert!(principal.is_admin(&list));
    }
}
