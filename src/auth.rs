use lambda_http::request::RequestContext;
use lambda_http::Error;
use lambda_http::Request;
use lambda_http::RequestExt;
use serde::Serialize;
use std::io::{Error as IoError, ErrorKind};

/// Where the caller identity came from.
#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum CallerSource {
    /// Custom Lambda authorizer, simple responses.
    Authorizer,
    /// HTTP API JWT authorizer in front of a Cognito user pool.
    Cognito,
}

/// Normalized caller identity.
#[derive(Debug, Clone, Serialize)]
pub struct Caller {
    pub account_id: String,
    pub source: CallerSource,
    pub email: Option<String>,
}

fn caller_from_authorizer(req: &Request) -> Option<Caller> {
    let ctx = match req.request_context_ref()? {
        RequestContext::ApiGatewayV2(c) => c,
        _ => return None,
    };
    let authz = ctx.authorizer.as_ref()?;

    // simple responses: context values arrive as JSON in `fields`
    if authz.fields.is_empty() {
        return None;
    }
    let fields = &authz.fields;
    let sub = fields.get("sub")?.as_str()?.to_string();
    if sub.is_empty() {
        return None;
    }
    let email = fields
        .get("email")
        .and_then(|v| v.as_str())
        .map(str::to_string);

    Some(Caller {
        account_id: sub,
        source: CallerSource::Authorizer,
        email,
    })
}

fn cognito_caller(req: &Request) -> Option<Caller> {
    let ctx_v2 = match req.request_context_ref()? {
        RequestContext::ApiGatewayV2(ctx) => ctx,
        _ => {
            tracing::debug!("Not an APIGWv2 request");
            return None;
        }
    };
    let authz = ctx_v2.authorizer.as_ref()?;
    let jwt = authz.jwt.as_ref()?;
    let claims = &jwt.claims;

    let sub = claims.get("sub").map(|v| v.as_str())?;
    let email = claims.get("email").map(|v| v.to_owned());

    // Optional hardening: pin the issuer when COGNITO_ISS is set
    if let Ok(expected) = std::env::var("COGNITO_ISS") {
        if !expected.is_empty() {
            let iss = claims.get("iss").map(|v| v.as_str());
            if iss != Some(expected.as_str()) {
                tracing::error!(expected = %expected, got = ?iss, "Cognito issuer mismatch");
                return None;
            }
        }
    }

    Some(Caller {
        account_id: sub.to_string(),
        source: CallerSource::Cognito,
        email,
    })
}

/// Caller identity, if any. Preference order: Lambda authorizer -> Cognito JWT.
pub fn caller_id(req: &Request) -> Option<Caller> {
    caller_from_authorizer(req).or_else(|| cognito_caller(req))
}

pub fn err_unauthorized(msg: &str) -> Error {
    IoError::new(ErrorKind::PermissionDenied, msg.to_owned()).into()
}

#[macro_export]
macro_rules! require_auth_or_return {
    ($req:expr, $status:expr, $err:expr, $msg:expr) => {
        match $crate::auth::require_auth(&$req) {
            Ok(c) => c,
            Err(_) => {
                return $crate::util::json_err($status, $err, $msg);
            }
        }
    };
}

pub fn require_auth(req: &Request) -> Result<Caller, Error> {
    caller_id(req).ok_or_else(|| err_unauthorized("Unauthorized"))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    use lambda_http::aws_lambda_events::event::apigw::{
        ApiGatewayRequestAuthorizer, ApiGatewayRequestAuthorizerJwtDescription,
        ApiGatewayV2httpRequestContext,
    };
    use lambda_http::Body;
    use serial_test::serial;
    use std::collections::HashMap;
    use std::env;

    // tiny RAII guard to restore env at the end of each test
    struct EnvGuard {
        k: String,
        v: Option<String>,
    }
    impl EnvGuard {
        fn set(k: &str, v: &str) -> Self {
            let old = std::env::var(k).ok();
            env::set_var(k, v);
            Self {
                k: k.to_string(),
                v: old,
            }
        }
    }
    impl Drop for EnvGuard {
        fn drop(&mut self) {
            match &self.v {
                Some(val) => env::set_var(&self.k, val),
                None => env::remove_var(&self.k),
            }
        }
    }

    pub(crate) fn cognito_context(
        sub: &str,
        email: Option<&str>,
        iss: Option<&str>,
    ) -> RequestContext {
        let mut claims: HashMap<String, String> = HashMap::new();
        claims.insert("sub".to_string(), sub.to_string());
        if let Some(email) = email {
            claims.insert("email".to_string(), email.to_string());
        }
        if let Some(iss) = iss {
            claims.insert("iss".to_string(), iss.to_string());
        }

        let jwt = ApiGatewayRequestAuthorizerJwtDescription {
            claims,
            scopes: None,
        };
        let authorizer = ApiGatewayRequestAuthorizer {
            jwt: Some(jwt),
            ..Default::default()
        };
        RequestContext::ApiGatewayV2(ApiGatewayV2httpRequestContext {
            authorizer: Some(authorizer),
            ..Default::default()
        })
    }

    fn build_cognito_request(sub: &str, email: Option<&str>, iss: Option<&str>) -> Request {
        Request::new(Body::Empty).with_request_context(cognito_context(sub, email, iss))
    }

    fn build_authorizer_request(fields: &[(&str, &str)]) -> Request {
        let mut authorizer = ApiGatewayRequestAuthorizer::default();
        for (k, v) in fields {
            authorizer
                .fields
                .insert(k.to_string(), serde_json::Value::String(v.to_string()));
        }
        let ctx = ApiGatewayV2httpRequestContext {
            authorizer: Some(authorizer),
            ..Default::default()
        };
        Request::new(Body::Empty).with_request_context(RequestContext::ApiGatewayV2(ctx))
    }

    #[test]
    #[serial(env)]
    fn test_cognito_caller_success() {
        let req = build_cognito_request("user123", Some("user@example.com"), None);
        let caller = cognito_caller(&req).unwrap();
        assert_eq!(caller.account_id, "user123");
        assert_eq!(caller.source, CallerSource::Cognito);
        assert_eq!(caller.email.as_deref(), Some("user@example.com"));
    }

    #[test]
    #[serial(env)]
    fn test_cognito_caller_with_issuer() {
        let _g = EnvGuard::set("COGNITO_ISS", "expected_issuer");
        let req = build_cognito_request("user456", Some("foo@bar.com"), Some("expected_issuer"));
        let caller = cognito_caller(&req).unwrap();
        assert_eq!(caller.account_id, "user456");
    }

    #[test]
    #[serial(env)]
    fn test_cognito_caller_wrong_issuer() {
        let _g = EnvGuard::set("COGNITO_ISS", "expected_issuer");
        let req = build_cognito_request("user789", Some("baz@qux.com"), Some("wrong_issuer"));
        assert!(cognito_caller(&req).is_none());
    }

    #[test]
    fn test_authorizer_fields_take_priority() {
        let req = build_authorizer_request(&[("sub", "acct-1"), ("email", "a@b.com")]);
        let caller = caller_id(&req).unwrap();
        assert_eq!(caller.account_id, "acct-1");
        assert_eq!(caller.source, CallerSource::Authorizer);
        assert_eq!(caller.email.as_deref(), Some("a@b.com"));
    }

    #[test]
    fn test_authorizer_without_sub_is_anonymous() {
        let req = build_authorizer_request(&[("email", "a@b.com")]);
        assert!(caller_id(&req).is_none());
    }

    #[test]
    fn test_caller_id_none() {
        let req = Request::default();
        assert!(caller_id(&req).is_none());
    }

    #[test]
    fn test_require_auth_failure() {
        let req = Request::default();
        let err = require_auth(&req).unwrap_err();
        assert!(format!("{}", err).contains("Unauthorized"));
    }
}
