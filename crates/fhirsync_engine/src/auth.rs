//! Credentials and the explicit security context of one message.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use std::fmt;

/// Username and password for a remote system.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Username.
    pub username: String,
    password: String,
}

impl Credentials {
    /// Creates credentials.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Builds the basic authorization for these credentials.
    pub fn authorization(&self) -> Authorization {
        Authorization::basic(&self.username, &self.password)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// An `Authorization` header value.
#[derive(Clone, PartialEq, Eq)]
pub struct Authorization(String);

impl Authorization {
    /// Basic authorization.
    pub fn basic(username: &str, password: &str) -> Self {
        let token = STANDARD.encode(format!("{username}:{password}"));
        Self(format!("Basic {token}"))
    }

    /// Bearer authorization.
    pub fn bearer(token: &str) -> Self {
        Self(format!("Bearer {token}"))
    }

    /// Returns the header value.
    pub fn header_value(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Authorization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = self.0.split(' ').next().unwrap_or_default();
        write!(f, "Authorization({scheme} ***)")
    }
}

/// Principal a message is processed as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Principal {
    /// The engine itself, acting on behalf of no user.
    System,
    /// A named user.
    User(String),
}

/// Who is acting and how writes to the registry are authorized.
///
/// Passed explicitly through every call that needs it. Listeners create one
/// per message and drop it when processing ends.
#[derive(Debug, Clone)]
pub struct SecurityContext {
    principal: Principal,
    authorization: Option<Authorization>,
}

impl SecurityContext {
    /// The system principal without credentials.
    pub fn system() -> Self {
        Self {
            principal: Principal::System,
            authorization: None,
        }
    }

    /// A named user.
    pub fn user(name: impl Into<String>) -> Self {
        Self {
            principal: Principal::User(name.into()),
            authorization: None,
        }
    }

    /// Attaches an authorization.
    pub fn with_authorization(mut self, authorization: Authorization) -> Self {
        self.authorization = Some(authorization);
        self
    }

    /// Returns the principal.
    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    /// Returns the authorization, if any.
    pub fn authorization(&self) -> Option<&Authorization> {
        self.authorization.as_ref()
    }

    /// Returns true for the system principal.
    pub fn is_system(&self) -> bool {
        self.principal == Principal::System
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_authorization_header() {
        let auth = Authorization::basic("admin", "district");
        assert_eq!(auth.header_value(), "Basic YWRtaW46ZGlzdHJpY3Q=");
    }

    #[test]
    fn secrets_are_not_printed() {
        let creds = Credentials::new("admin", "district");
        let printed = format!("{creds:?} {:?}", creds.authorization());
        assert!(!printed.contains("district"));
        assert!(!printed.contains("YWRtaW46"));
        assert!(printed.contains("admin"));
    }

    #[test]
    fn system_context() {
        let ctx = SecurityContext::system().with_authorization(Authorization::bearer("t"));
        assert!(ctx.is_system());
        assert_eq!(ctx.authorization().unwrap().header_value(), "Bearer t");
    }
}
