use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use lambda_http::{Body, Error, Request, Response};
use std::borrow::Cow;
use std::collections::HashMap;
use url::Url;

pub fn valid_target(u: &str) -> bool {
    if let Ok(parsed) = Url::parse(u) {
        match parsed.scheme() {
            "http" | "https" => {}
            _ => return false,
        }
        return parsed.host().is_some();
    }
    false
}

pub fn b64u(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

pub fn b64u_to_bytes(s: &str) -> Option<Vec<u8>> {
    URL_SAFE_NO_PAD.decode(s).ok()
}

/// Shortened token value for log lines; never log a live token in full.
pub fn token_prefix(token: &str) -> &str {
    let end = token
        .char_indices()
        .nth(8)
        .map(|(i, _)| i)
        .unwrap_or(token.len());
    &token[..end]
}

pub fn body_bytes(req: &Request) -> Vec<u8> {
    match req.body() {
        Body::Text(s) => s.as_bytes().to_vec(),
        Body::Binary(b) => b.clone(),
        _ => Vec::new(),
    }
}

pub fn query_params(req: &Request) -> HashMap<String, String> {
    let qp = req.uri().query().unwrap_or("");
    url::form_urlencoded::parse(qp.as_bytes())
        .into_owned()
        .collect()
}

pub fn resp_json(status: u16, v: serde_json::Value) -> Result<Response<Body>, Error> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("Cache-Control", "no-store")
        .body(Body::Text(v.to_string()))
        .map_err(|e| Error::from(format!("resp: {e}")))
}

pub fn json_err(
    status: u16,
    code: &'static str,
    message: impl Into<Cow<'static, str>>,
) -> Result<Response<Body>, Error> {
    resp_json(
        status,
        serde_json::json!({
            "error": code,
            "message": message.into(),
        }),
    )
}
