// =============================================
// Owner routes: links, tokens, access logs
// =============================================
// Owner-only routes answer 404 for links the caller does not own, so link
// ids cannot be probed for existence.

use lambda_http::{Body, Error, Request, Response};
use serde_json::json;

use crate::access_log::AccessLog;
use crate::auth::Caller;
use crate::clock::Clock;
use crate::error::{GateError, LINK_NOT_FOUND};
use crate::handler::Ctx;
use crate::id::new_link_id;
use crate::model::{CreateLinkReq, IssueTokenReq, Link, UpdateLinkReq};
use crate::require_auth_or_return;
use crate::util::{body_bytes, json_err, query_params, resp_json, valid_target};

const CREATE_ATTEMPTS: u32 = 3;

fn store_failure(e: GateError) -> Result<Response<Body>, Error> {
    tracing::error!(error = %e, kind = e.kind(), "store call failed");
    json_err(500, "internal", "Storage unavailable")
}

fn limit_param(req: &Request) -> Option<usize> {
    query_params(req).get("limit").and_then(|s| s.parse().ok())
}

/// The caller's link, active or not. `None` when missing or owned by someone else.
async fn owned_link(ctx: &Ctx, link_id: &str, caller: &Caller) -> Result<Option<Link>, GateError> {
    Ok(ctx
        .links
        .get(link_id)
        .await?
        .filter(|l| l.owner_id == caller.account_id))
}

pub(crate) async fn create_link(req: Request, ctx: &Ctx) -> Result<Response<Body>, Error> {
    let caller = require_auth_or_return!(req, 401, "unauthorized", "Requires authentication");

    let payload: CreateLinkReq = match serde_json::from_slice(&body_bytes(&req)) {
        Ok(p) => p,
        Err(_) => return json_err(400, "bad_request", "destination_url is required"),
    };
    if !valid_target(&payload.destination_url) {
        return json_err(400, "invalid_destination", "destination_url must be http(s)");
    }

    let mut link = Link {
        link_id: String::new(),
        destination_url: payload.destination_url,
        owner_id: caller.account_id,
        title: payload.title,
        source_label: payload.source_label,
        is_active: true,
        access_count: 0,
        created_at: ctx.clock.now(),
    };

    for attempt in 1..=CREATE_ATTEMPTS {
        link.link_id = new_link_id();
        match ctx.links.insert(&link).await {
            Ok(true) => {
                tracing::info!(link_id = %link.link_id, owner = %link.owner_id, "link created");
                return resp_json(201, serde_json::to_value(&link)?);
            }
            Ok(false) => tracing::warn!(attempt, "link id collision"),
            Err(e) => return store_failure(e),
        }
    }
    json_err(500, "internal", "exhausted attempts")
}

pub(crate) async fn list_links(req: Request, ctx: &Ctx) -> Result<Response<Body>, Error> {
    let caller = require_auth_or_return!(req, 401, "unauthorized", "Requires authentication");
    let limit = AccessLog::clamp_limit(limit_param(&req));

    let links = match ctx.links.list_by_owner(&caller.account_id, limit).await {
        Ok(l) => l,
        Err(e) => return store_failure(e),
    };
    let stats = match ctx.links.stats(&caller.account_id).await {
        Ok(s) => s,
        Err(e) => return store_failure(e),
    };
    resp_json(
        200,
        json!({
            "items": links,
            "count": links.len(),
            "stats": stats,
        }),
    )
}

pub(crate) async fn get_link(
    req: Request,
    link_id: &str,
    ctx: &Ctx,
) -> Result<Response<Body>, Error> {
    let caller = require_auth_or_return!(req, 404, "not_found", LINK_NOT_FOUND);

    match owned_link(ctx, link_id, &caller).await {
        Ok(Some(link)) => resp_json(200, serde_json::to_value(&link)?),
        Ok(None) => json_err(404, "not_found", LINK_NOT_FOUND),
        Err(e) => store_failure(e),
    }
}

pub(crate) async fn update_link(
    req: Request,
    link_id: &str,
    ctx: &Ctx,
) -> Result<Response<Body>, Error> {
    let caller = require_auth_or_return!(req, 404, "not_found", LINK_NOT_FOUND);

    let changes: UpdateLinkReq = match serde_json::from_slice(&body_bytes(&req)) {
        Ok(c) => c,
        Err(_) => return json_err(400, "bad_request", "bad json"),
    };
    if changes.is_empty() {
        return json_err(400, "no_updates", "nothing to update");
    }
    if let Some(d) = &changes.destination_url {
        if !valid_target(d) {
            return json_err(400, "invalid_destination", "destination_url must be http(s)");
        }
    }

    match ctx.links.update(link_id, &caller.account_id, &changes).await {
        Ok(true) => {}
        Ok(false) => return json_err(404, "not_found", LINK_NOT_FOUND),
        Err(e) => return store_failure(e),
    }
    match ctx.links.get(link_id).await {
        Ok(Some(link)) => resp_json(200, serde_json::to_value(&link)?),
        Ok(None) => json_err(404, "not_found", LINK_NOT_FOUND),
        Err(e) => store_failure(e),
    }
}

pub(crate) async fn delete_link(
    req: Request,
    link_id: &str,
    ctx: &Ctx,
) -> Result<Response<Body>, Error> {
    let caller = require_auth_or_return!(req, 404, "not_found", LINK_NOT_FOUND);

    match ctx.links.deactivate(link_id, &caller.account_id).await {
        Ok(true) => {
            tracing::info!(link_id, "link deactivated");
            Response::builder()
                .status(204)
                .body(Body::Empty)
                .map_err(|e| Error::from(format!("resp: {e}")))
        }
        Ok(false) => json_err(404, "not_found", LINK_NOT_FOUND),
        Err(e) => store_failure(e),
    }
}

pub(crate) async fn issue_token(
    req: Request,
    link_id: &str,
    ctx: &Ctx,
) -> Result<Response<Body>, Error> {
    let caller = require_auth_or_return!(req, 404, "not_found", LINK_NOT_FOUND);

    match owned_link(ctx, link_id, &caller).await {
        Ok(Some(link)) if link.is_active => {}
        Ok(_) => return json_err(404, "not_found", LINK_NOT_FOUND),
        Err(e) => return store_failure(e),
    }

    let bytes = body_bytes(&req);
    let payload: IssueTokenReq = if bytes.is_empty() {
        IssueTokenReq::default()
    } else {
        match serde_json::from_slice(&bytes) {
            Ok(p) => p,
            Err(_) => return json_err(400, "bad_request", "bad json"),
        }
    };

    match ctx.issuer.issue(link_id, payload.ttl_minutes).await {
        Ok(issued) => resp_json(201, serde_json::to_value(&issued)?),
        Err(GateError::InvalidInput(msg)) => json_err(400, "bad_request", msg),
        Err(e) => store_failure(e),
    }
}

pub(crate) async fn link_logs(
    req: Request,
    link_id: &str,
    ctx: &Ctx,
) -> Result<Response<Body>, Error> {
    let caller = require_auth_or_return!(req, 404, "not_found", LINK_NOT_FOUND);

    match ctx.links.is_owner(link_id, &caller.account_id).await {
        Ok(true) => {}
        Ok(false) => return json_err(404, "not_found", LINK_NOT_FOUND),
        Err(e) => return store_failure(e),
    }

    match ctx.access_log.for_link(link_id, limit_param(&req)).await {
        Ok(items) => resp_json(200, json!({ "items": items, "count": items.len() })),
        Err(e) => store_failure(e),
    }
}

pub(crate) async fn account_logs(req: Request, ctx: &Ctx) -> Result<Response<Body>, Error> {
    let caller = require_auth_or_return!(req, 401, "unauthorized", "Requires authentication");

    match ctx
        .access_log
        .for_account(&caller.account_id, limit_param(&req))
        .await
    {
        Ok(items) => resp_json(200, json!({ "items": items, "count": items.len() })),
        Err(e) => store_failure(e),
    }
}

#[cfg(test)]
mod tests {
    use crate::clock::Clock;
    use crate::handler::tests::{app, as_user, call, request, TestApp};
    use serde_json::{json, Value};

    async fn create(app: &TestApp, owner: &str, dest: &str) -> Value {
        let (status, body) = call(
            app,
            as_user(
                request(
                    "POST",
                    "/v1/links",
                    Some(json!({"destination_url": dest, "source_label": "ouo"})),
                ),
                owner,
            ),
        )
        .await;
        assert_eq!(status, 201, "{body}");
        body
    }

    #[tokio::test]
    async fn create_requires_auth_and_valid_destination() {
        let app = app();
        let (status, _) = call(
            &app,
            request(
                "POST",
                "/v1/links",
                Some(json!({"destination_url": "https://example.com"})),
            ),
        )
        .await;
        assert_eq!(status, 401);

        let (status, body) = call(
            &app,
            as_user(
                request(
                    "POST",
                    "/v1/links",
                    Some(json!({"destination_url": "javascript:alert(1)"})),
                ),
                "alice",
            ),
        )
        .await;
        assert_eq!(status, 400);
        assert_eq!(body["error"], "invalid_destination");

        let link = create(&app, "alice", "https://example.com/a").await;
        assert_eq!(link["owner_id"], "alice");
        assert_eq!(link["is_active"], true);
        assert_eq!(link["access_count"], 0);
        assert_eq!(link["source_label"], "ouo");
    }

    #[tokio::test]
    async fn list_shows_only_own_active_links_with_stats() {
        let app = app();
        create(&app, "alice", "https://example.com/a").await;
        let b = create(&app, "alice", "https://example.com/b").await;
        create(&app, "bob", "https://example.com/c").await;

        let id = b["link_id"].as_str().unwrap();
        let (status, _) = call(
            &app,
            as_user(request("DELETE", &format!("/v1/links/{id}"), None), "alice"),
        )
        .await;
        assert_eq!(status, 204);

        let (status, body) = call(&app, as_user(request("GET", "/v1/links", None), "alice")).await;
        assert_eq!(status, 200);
        assert_eq!(body["count"], 1);
        assert_eq!(body["items"][0]["destination_url"], "https://example.com/a");
        assert_eq!(body["stats"]["total_links"], 1);
        assert_eq!(body["stats"]["total_accesses"], 0);
    }

    #[tokio::test]
    async fn non_owner_gets_404_everywhere() {
        let app = app();
        let link = create(&app, "alice", "https://example.com/a").await;
        let id = link["link_id"].as_str().unwrap();

        for (method, uri, body) in [
            ("GET", format!("/v1/links/{id}"), None),
            ("PUT", format!("/v1/links/{id}"), Some(json!({"title": "x"}))),
            ("DELETE", format!("/v1/links/{id}"), None),
            ("POST", format!("/v1/links/{id}/token"), None),
            ("GET", format!("/v1/links/{id}/logs"), None),
        ] {
            let (status, _) = call(&app, as_user(request(method, &uri, body), "bob")).await;
            assert_eq!(status, 404, "{method} {uri}");
        }
    }

    #[tokio::test]
    async fn stats_count_all_active_links_beyond_the_page() {
        let app = app();
        for dest in ["a", "b", "c"] {
            create(&app, "alice", &format!("https://example.com/{dest}")).await;
        }

        let (status, body) = call(
            &app,
            as_user(request("GET", "/v1/links?limit=1", None), "alice"),
        )
        .await;
        assert_eq!(status, 200);
        assert_eq!(body["count"], 1);
        assert_eq!(body["stats"]["total_links"], 3);
    }

    #[tokio::test]
    async fn owner_reads_single_link_including_inactive() {
        let app = app();
        let link = create(&app, "alice", "https://example.com/a").await;
        let id = link["link_id"].as_str().unwrap();
        let uri = format!("/v1/links/{id}");

        let (status, body) = call(&app, as_user(request("GET", &uri, None), "alice")).await;
        assert_eq!(status, 200);
        assert_eq!(body["link_id"], link["link_id"]);
        assert_eq!(body["destination_url"], "https://example.com/a");

        call(&app, as_user(request("DELETE", &uri, None), "alice")).await;
        let (status, body) = call(&app, as_user(request("GET", &uri, None), "alice")).await;
        assert_eq!(status, 200);
        assert_eq!(body["is_active"], false);

        let (status, _) = call(&app, request("GET", &uri, None)).await;
        assert_eq!(status, 404);
    }

    #[tokio::test]
    async fn owner_updates_link() {
        let app = app();
        let link = create(&app, "alice", "https://example.com/a").await;
        let id = link["link_id"].as_str().unwrap();

        let (status, body) = call(
            &app,
            as_user(
                request(
                    "PUT",
                    &format!("/v1/links/{id}"),
                    Some(json!({"destination_url": "https://example.com/new", "title": "New"})),
                ),
                "alice",
            ),
        )
        .await;
        assert_eq!(status, 200);
        assert_eq!(body["destination_url"], "https://example.com/new");
        assert_eq!(body["title"], "New");

        let (status, body) = call(
            &app,
            as_user(request("PUT", &format!("/v1/links/{id}"), Some(json!({}))), "alice"),
        )
        .await;
        assert_eq!(status, 400);
        assert_eq!(body["error"], "no_updates");
    }

    #[tokio::test]
    async fn token_ttl_is_clamped_and_inactive_links_get_none() {
        let app = app();
        let link = create(&app, "alice", "https://example.com/a").await;
        let id = link["link_id"].as_str().unwrap();

        let (status, issued) = call(
            &app,
            as_user(
                request(
                    "POST",
                    &format!("/v1/links/{id}/token"),
                    Some(json!({"ttl_minutes": 5})),
                ),
                "alice",
            ),
        )
        .await;
        assert_eq!(status, 201);
        let expires: chrono::DateTime<chrono::Utc> =
            serde_json::from_value(issued["expires_at"].clone()).unwrap();
        assert_eq!(expires, app.clock.now() + chrono::Duration::minutes(5));

        call(
            &app,
            as_user(request("DELETE", &format!("/v1/links/{id}"), None), "alice"),
        )
        .await;
        let (status, _) = call(
            &app,
            as_user(request("POST", &format!("/v1/links/{id}/token"), None), "alice"),
        )
        .await;
        assert_eq!(status, 404);
    }

    #[tokio::test]
    async fn account_logs_span_owned_links() {
        let app = app();
        let a = create(&app, "alice", "https://example.com/a").await;
        let c = create(&app, "bob", "https://example.com/c").await;

        for link in [&a, &c] {
            let body = json!({
                "token": "never-issued",
                "link_id": link["link_id"],
                "report": {"checks": {}, "suspicion_score": 0},
            });
            let (status, _) = call(&app, request("POST", "/v1/validate", Some(body))).await;
            assert_eq!(status, 403);
        }

        let (status, body) = call(
            &app,
            as_user(request("GET", "/v1/logs?limit=0", None), "alice"),
        )
        .await;
        assert_eq!(status, 200);
        assert_eq!(body["count"], 1);
        assert_eq!(body["items"][0]["link_id"], a["link_id"]);
        assert_eq!(body["items"][0]["reason"], "Invalid or expired token");
    }
}
