use lambda_http::request::RequestContext;
use lambda_http::{Body, Error, Request, RequestExt, Response};
use serde_json::json;
use std::sync::Arc;

use crate::access_log::AccessLog;
use crate::api;
use crate::auth::caller_id;
use crate::clock::{Clock, SystemClock};
use crate::config::GateConfig;
use crate::engine::ValidationEngine;
use crate::error::{GateError, LINK_NOT_FOUND};
use crate::issuer::TokenIssuer;
use crate::model::{LinkMetadata, RequestMeta, ValidateReq};
use crate::store::{AccessLogSink, DynamoStore, LinkStore, TokenStore};
use crate::util::{body_bytes, json_err, resp_json};

#[derive(Clone)]
pub struct Ctx {
    pub links: Arc<dyn LinkStore>,
    pub issuer: Arc<TokenIssuer>,
    pub engine: Arc<ValidationEngine>,
    pub access_log: AccessLog,
    pub clock: Arc<dyn Clock>,
    pub cfg: Arc<GateConfig>,
}

impl Ctx {
    pub async fn new() -> Result<Self, Error> {
        let cfg = GateConfig::from_env()?;
        let store = Arc::new(DynamoStore::connect(&cfg).await);
        Ok(Self::from_parts(
            store.clone(),
            store.clone(),
            store,
            Arc::new(SystemClock),
            cfg,
        ))
    }

    pub fn from_parts(
        links: Arc<dyn LinkStore>,
        tokens: Arc<dyn TokenStore>,
        logs: Arc<dyn AccessLogSink>,
        clock: Arc<dyn Clock>,
        cfg: GateConfig,
    ) -> Self {
        let cfg = Arc::new(cfg);
        let access_log = AccessLog::new(logs);
        let issuer = TokenIssuer::new(tokens.clone(), clock.clone(), cfg.clone());
        let engine = ValidationEngine::new(
            links.clone(),
            tokens,
            access_log.clone(),
            clock.clone(),
            cfg.clone(),
        );
        Self {
            links,
            issuer: Arc::new(issuer),
            engine: Arc::new(engine),
            access_log,
            clock,
            cfg,
        }
    }
}

pub async fn router(req: Request, ctx: &Ctx) -> Result<Response<Body>, Error> {
    let method = req.method().as_str().to_string();
    let path = req.uri().path().to_string();
    let segs: Vec<&str> = path.trim_matches('/').split('/').collect();

    match (method.as_str(), segs.as_slice()) {
        ("POST", ["v1", "validate"]) => validate(req, ctx).await,
        ("GET", ["v1", "gate", id]) => gate_metadata(id, ctx).await,
        ("GET", ["v1", "me"]) => me(req),
        ("GET", ["v1", "logs"]) => api::account_logs(req, ctx).await,
        ("POST", ["v1", "links"]) => api::create_link(req, ctx).await,
        ("GET", ["v1", "links"]) => api::list_links(req, ctx).await,
        ("GET", ["v1", "links", id]) => api::get_link(req, id, ctx).await,
        ("PUT", ["v1", "links", id]) => api::update_link(req, id, ctx).await,
        ("DELETE", ["v1", "links", id]) => api::delete_link(req, id, ctx).await,
        ("POST", ["v1", "links", id, "token"]) => api::issue_token(req, id, ctx).await,
        ("GET", ["v1", "links", id, "logs"]) => api::link_logs(req, id, ctx).await,
        _ => json_err(404, "not_found", "Not Found"),
    }
}

/// Facts about the requester that end up in the token row and the access log.
pub(crate) fn request_meta(req: &Request) -> RequestMeta {
    let header = |k: &str| {
        req.headers()
            .get(k)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };
    let source_ip = match req.request_context_ref() {
        Some(RequestContext::ApiGatewayV2(c)) => c.http.source_ip.clone(),
        _ => None,
    };
    let forwarded = header("x-forwarded-for")
        .and_then(|v| v.split(',').next().map(|s| s.trim().to_string()))
        .filter(|s| !s.is_empty());

    RequestMeta {
        referrer: header("referer"),
        user_agent: header("user-agent"),
        ip_address: source_ip.or(forwarded),
    }
}

async fn validate(req: Request, ctx: &Ctx) -> Result<Response<Body>, Error> {
    let body: ValidateReq = match serde_json::from_slice(&body_bytes(&req)) {
        Ok(b) => b,
        Err(_) => return json_err(400, "bad_request", "token and link_id are required"),
    };
    let meta = request_meta(&req);

    match ctx.engine.validate(&body, &meta).await {
        Ok(decision) => resp_json(decision.http_status(), decision.to_json()),
        Err(GateError::InvalidInput(msg)) => json_err(400, "bad_request", msg),
        Err(_) => json_err(500, "internal", "Validation failed"),
    }
}

async fn gate_metadata(link_id: &str, ctx: &Ctx) -> Result<Response<Body>, Error> {
    match ctx.links.get(link_id).await {
        Ok(Some(link)) if link.is_active => {
            resp_json(200, serde_json::to_value(LinkMetadata::from(&link))?)
        }
        Ok(_) => json_err(404, "not_found", LINK_NOT_FOUND),
        Err(e) => {
            tracing::error!(link_id, error = %e, "link metadata lookup failed");
            json_err(500, "internal", "Failed to fetch link")
        }
    }
}

fn me(req: Request) -> Result<Response<Body>, Error> {
    match caller_id(&req) {
        Some(c) => resp_json(
            200,
            json!({
                "account_id": c.account_id,
                "email": c.email,
                "source": c.source,
            }),
        ),
        None => json_err(401, "unauthorized", "Not signed in"),
    }
}
