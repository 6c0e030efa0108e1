//! HTTP API for the family points ledger
//!
//! All routes except `/health` need `Authorization: Bearer <jwt>`; the token
//! subject is the acting user. Responses use the envelope from
//! [`crate::services::response`].
//!
//! ## Families
//! - `POST /families` - Create a family (caller becomes parent)
//! - `GET /families/{id}` - Family with its policy
//! - `PUT /families/{id}/policy` - Replace policy flags
//! - `GET|POST /families/{id}/members` - List / add members
//! - `GET /families/{id}/children|rules|rewards` - Family listings
//!
//! ## Children
//! - `POST /children` - Add a child
//! - `GET|DELETE /children/{id}` - Child with balance / remove child
//! - `GET /children/{id}/ledger` - Ledger entries and reconciliation
//! - `GET /children/{id}/behaviors?state=pending&limit=50`
//! - `GET /children/{id}/redemptions?limit=50`
//!
//! ## Rules and rewards
//! - `POST /rules`, `PUT /rules/{id}`
//! - `POST /rewards`, `PUT /rewards/{id}`, `POST /rewards/{id}/redeem`
//!
//! ## Behaviors and redemptions
//! - `POST /behaviors` - Record a behavior
//! - `GET|PUT /behaviors/{id}` - Fetch / verify or reject
//! - `GET|PUT /redemptions/{id}` - Fetch / approve, complete or reject
//!
//! ## Example Usage
//!
//! ```bash
//! TOKEN=$(family-points token --user mom)
//! curl -X POST -H "Authorization: Bearer $TOKEN" \
//!      -d '{"child_id": "kid", "rule_id": "clean-room"}' \
//!      http://localhost:8095/behaviors
//! ```
//!
//! Write requests get their idempotency key (body `id`, else the
//! `Idempotency-Key` header, else a fresh UUID) before the first attempt, and
//! transient storage failures are retried with that same key.

use std::convert::Infallible;
use std::fmt::Display;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Body;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{header, Method, Request, Response};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::{extract_token_from_header, JwtValidator};
use crate::db::children::CreateChildInput;
use crate::db::families::{AddMemberInput, CreateFamilyInput, FamilyPolicy};
use crate::db::rewards::{CreateRewardInput, UpdateRewardInput};
use crate::db::rules::{CreateRuleInput, UpdateRuleInput};
use crate::db::{RedemptionStatus, VerificationState};
use crate::error::LedgerError;
use crate::services::response::{self, error_response, from_create_result, from_result};
use crate::services::{with_retry, RecordBehaviorInput, RedeemInput, RetryPolicy, Services};

const DEFAULT_LIMIT: i64 = 50;
const MAX_LIMIT: i64 = 500;

type HttpResponse = Response<Full<Bytes>>;

/// Body of a verification or redemption decision.
///
/// Accepts `approve: bool`, or a `status` / `verification_status` string.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DecisionRequest {
    #[serde(default)]
    pub approve: Option<bool>,
    #[serde(default, alias = "verification_status")]
    pub status: Option<String>,
}

impl DecisionRequest {
    /// Normalize to verify (true) / reject (false) for a behavior event
    pub fn behavior_verdict(&self) -> Result<bool, LedgerError> {
        if let Some(approve) = self.approve {
            return Ok(approve);
        }
        match self.status.as_deref().map(str::to_ascii_lowercase).as_deref() {
            Some("verified") | Some("approved") => Ok(true),
            Some("rejected") => Ok(false),
            Some(other) => Err(LedgerError::InvalidInput(format!(
                "unsupported verification status '{}'",
                other
            ))),
            None => Err(LedgerError::InvalidInput(
                "decision needs `approve` or `status`".into(),
            )),
        }
    }

    /// Normalize to a target redemption status
    pub fn redemption_target(&self) -> Result<RedemptionStatus, LedgerError> {
        if let Some(approve) = self.approve {
            return Ok(if approve {
                RedemptionStatus::Approved
            } else {
                RedemptionStatus::Rejected
            });
        }
        match self.status.as_deref().map(str::to_ascii_lowercase).as_deref() {
            Some("verified") | Some("approved") => Ok(RedemptionStatus::Approved),
            Some(other) => other.parse(),
            None => Err(LedgerError::InvalidInput(
                "decision needs `approve` or `status`".into(),
            )),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RedeemRequest {
    #[serde(default)]
    id: Option<String>,
    child_id: String,
}

/// HTTP server state
pub struct HttpServer {
    services: Arc<Services>,
    jwt: JwtValidator,
    retry: RetryPolicy,
    bind_addr: SocketAddr,
}

impl HttpServer {
    /// Create a new HTTP server
    pub fn new(services: Arc<Services>, jwt: JwtValidator, retry: RetryPolicy, bind_addr: SocketAddr) -> Self {
        Self {
            services,
            jwt,
            retry,
            bind_addr,
        }
    }

    /// Run the HTTP server
    pub async fn run(self: Arc<Self>) -> Result<(), LedgerError> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "HTTP server listening");

        loop {
            let (stream, remote_addr) = listener.accept().await?;
            let io = TokioIo::new(stream);
            let server = self.clone();

            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let server = server.clone();
                    async move { Ok::<_, Infallible>(server.handle_request(req).await) }
                });

                if let Err(err) = http1::Builder::new()
                    .serve_connection(io, service)
                    .await
                {
                    warn!(addr = %remote_addr, error = %err, "Connection error");
                }
            });
        }
    }

    /// Route a request to its handler
    pub async fn handle_request<B>(&self, req: Request<B>) -> HttpResponse
    where
        B: Body,
        B::Error: Display,
    {
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        debug!(method = %method, path = %path, "Incoming request");

        if method == Method::GET && path == "/health" {
            return self.handle_health().await;
        }

        let user_id = match self.authenticate(&req) {
            Ok(user_id) => user_id,
            Err(e) => return error_response(e),
        };

        let segments: Vec<String> = path
            .trim_matches('/')
            .split('/')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        let segments: Vec<&str> = segments.iter().map(String::as_str).collect();
        let query_string = req.uri().query().map(str::to_string);
        let query = Query::parse(query_string.as_deref());

        let s = &self.services;
        match (&method, segments.as_slice()) {
            // Families
            (&Method::POST, ["families"]) => match read_json::<_, CreateFamilyInput>(req).await {
                Ok(mut input) => {
                    input.id.get_or_insert_with(|| Uuid::new_v4().to_string());
                    let svc = s.families.clone();
                    from_create_result(self.retrying("create_family", move || {
                        svc.create_family(input.clone(), &user_id)
                    }).await)
                }
                Err(e) => error_response(e),
            },
            (&Method::GET, ["families", id]) => {
                let (svc, id) = (s.families.clone(), id.to_string());
                from_result(blocking(move || svc.get_family(&id, &user_id)).await)
            }
            (&Method::PUT, ["families", id, "policy"]) => match read_json::<_, FamilyPolicy>(req).await {
                Ok(policy) => {
                    let (svc, id) = (s.families.clone(), id.to_string());
                    from_result(self.retrying("update_policy", move || {
                        svc.update_policy(&id, &user_id, policy)
                    }).await)
                }
                Err(e) => error_response(e),
            },
            (&Method::GET, ["families", id, "members"]) => {
                let (svc, id) = (s.families.clone(), id.to_string());
                from_result(blocking(move || svc.list_members(&id, &user_id)).await)
            }
            (&Method::POST, ["families", id, "members"]) => match read_json::<_, AddMemberInput>(req).await {
                Ok(input) => {
                    let (svc, id) = (s.families.clone(), id.to_string());
                    from_create_result(self.retrying("add_member", move || {
                        svc.add_member(&id, &user_id, input.clone())
                    }).await)
                }
                Err(e) => error_response(e),
            },
            (&Method::GET, ["families", id, "children"]) => {
                let (svc, id) = (s.families.clone(), id.to_string());
                from_result(blocking(move || svc.list_children(&id, &user_id)).await)
            }
            (&Method::GET, ["families", id, "rules"]) => {
                let (svc, id, active_only) = (s.families.clone(), id.to_string(), query.flag("active"));
                from_result(blocking(move || svc.list_rules(&id, &user_id, active_only)).await)
            }
            (&Method::GET, ["families", id, "rewards"]) => {
                let (svc, id, active_only) = (s.families.clone(), id.to_string(), query.flag("active"));
                from_result(blocking(move || svc.list_rewards(&id, &user_id, active_only)).await)
            }

            // Children
            (&Method::POST, ["children"]) => match read_json::<_, CreateChildInput>(req).await {
                Ok(mut input) => {
                    input.id.get_or_insert_with(|| Uuid::new_v4().to_string());
                    let svc = s.families.clone();
                    from_create_result(self.retrying("add_child", move || {
                        svc.add_child(input.clone(), &user_id)
                    }).await)
                }
                Err(e) => error_response(e),
            },
            (&Method::GET, ["children", id]) => {
                let (svc, id) = (s.families.clone(), id.to_string());
                from_result(blocking(move || svc.get_child(&id, &user_id)).await)
            }
            (&Method::DELETE, ["children", id]) => {
                let (svc, id) = (s.families.clone(), id.to_string());
                let result = self.retrying("remove_child", move || svc.remove_child(&id, &user_id)).await;
                from_result(result.map(|()| serde_json::json!({ "deleted": true })))
            }
            (&Method::GET, ["children", id, "ledger"]) => {
                let (svc, id, limit) = (s.families.clone(), id.to_string(), query.limit());
                from_result(blocking(move || svc.ledger(&id, &user_id, limit)).await)
            }
            (&Method::GET, ["children", id, "behaviors"]) => {
                let state = match query.get("state").map(str::parse::<VerificationState>).transpose() {
                    Ok(state) => state,
                    Err(e) => return error_response(e),
                };
                let (svc, id, limit) = (s.behaviors.clone(), id.to_string(), query.limit());
                from_result(blocking(move || svc.list_for_child(&id, &user_id, state, limit)).await)
            }
            (&Method::GET, ["children", id, "redemptions"]) => {
                let (svc, id, limit) = (s.redemptions.clone(), id.to_string(), query.limit());
                from_result(blocking(move || svc.list_for_child(&id, &user_id, limit)).await)
            }

            // Rules
            (&Method::POST, ["rules"]) => match read_json::<_, CreateRuleInput>(req).await {
                Ok(mut input) => {
                    input.id.get_or_insert_with(|| Uuid::new_v4().to_string());
                    let svc = s.families.clone();
                    from_create_result(self.retrying("create_rule", move || {
                        svc.create_rule(input.clone(), &user_id)
                    }).await)
                }
                Err(e) => error_response(e),
            },
            (&Method::PUT, ["rules", id]) => match read_json::<_, UpdateRuleInput>(req).await {
                Ok(input) => {
                    let (svc, id) = (s.families.clone(), id.to_string());
                    from_result(self.retrying("update_rule", move || {
                        svc.update_rule(&id, &user_id, input.clone())
                    }).await)
                }
                Err(e) => error_response(e),
            },

            // Rewards
            (&Method::POST, ["rewards"]) => match read_json::<_, CreateRewardInput>(req).await {
                Ok(mut input) => {
                    input.id.get_or_insert_with(|| Uuid::new_v4().to_string());
                    let svc = s.families.clone();
                    from_create_result(self.retrying("create_reward", move || {
                        svc.create_reward(input.clone(), &user_id)
                    }).await)
                }
                Err(e) => error_response(e),
            },
            (&Method::PUT, ["rewards", id]) => match read_json::<_, UpdateRewardInput>(req).await {
                Ok(input) => {
                    let (svc, id) = (s.families.clone(), id.to_string());
                    from_result(self.retrying("update_reward", move || {
                        svc.update_reward(&id, &user_id, input.clone())
                    }).await)
                }
                Err(e) => error_response(e),
            },
            (&Method::POST, ["rewards", reward_id, "redeem"]) => {
                let key = idempotency_key(&req);
                match read_json::<_, RedeemRequest>(req).await {
                    Ok(body) => {
                        let input = RedeemInput {
                            id: Some(body.id.or(key).unwrap_or_else(|| Uuid::new_v4().to_string())),
                            child_id: body.child_id,
                            reward_id: reward_id.to_string(),
                        };
                        let svc = s.redemptions.clone();
                        let result = self
                            .retrying("redeem", move || svc.redeem(input.clone(), &user_id))
                            .await;
                        match result {
                            Ok(outcome) if outcome.changed => response::created(&outcome),
                            other => from_result(other),
                        }
                    }
                    Err(e) => error_response(e),
                }
            }

            // Behaviors
            (&Method::POST, ["behaviors"]) => {
                let key = idempotency_key(&req);
                match read_json::<_, RecordBehaviorInput>(req).await {
                    Ok(mut input) => {
                        input.id = Some(input.id.or(key).unwrap_or_else(|| Uuid::new_v4().to_string()));
                        let svc = s.behaviors.clone();
                        let result = self
                            .retrying("record_behavior", move || svc.record(input.clone(), &user_id))
                            .await;
                        match result {
                            Ok(recorded) if !recorded.replayed => response::created(&recorded),
                            other => from_result(other),
                        }
                    }
                    Err(e) => error_response(e),
                }
            }
            (&Method::GET, ["behaviors", id]) => {
                let (svc, id) = (s.behaviors.clone(), id.to_string());
                from_result(blocking(move || svc.get(&id, &user_id)).await)
            }
            (&Method::PUT, ["behaviors", id]) => {
                let verdict = match read_json::<_, DecisionRequest>(req).await {
                    Ok(body) => body.behavior_verdict(),
                    Err(e) => Err(e),
                };
                match verdict {
                    Ok(approve) => {
                        let (svc, id) = (s.approval.clone(), id.to_string());
                        from_result(self.retrying("decide_behavior", move || {
                            svc.decide(&id, &user_id, approve)
                        }).await)
                    }
                    Err(e) => error_response(e),
                }
            }

            // Redemptions
            (&Method::GET, ["redemptions", id]) => {
                let (svc, id) = (s.redemptions.clone(), id.to_string());
                from_result(blocking(move || svc.get(&id, &user_id)).await)
            }
            (&Method::PUT, ["redemptions", id]) => {
                let target = match read_json::<_, DecisionRequest>(req).await {
                    Ok(body) => body.redemption_target(),
                    Err(e) => Err(e),
                };
                match target {
                    Ok(status) => {
                        let (svc, id) = (s.redemptions.clone(), id.to_string());
                        from_result(self.retrying("decide_redemption", move || {
                            svc.decide(&id, &user_id, status)
                        }).await)
                    }
                    Err(e) => error_response(e),
                }
            }

            (_, ["families", ..])
            | (_, ["children", ..])
            | (_, ["rules", ..])
            | (_, ["rewards", ..])
            | (_, ["behaviors", ..])
            | (_, ["redemptions", ..]) => response::method_not_allowed(),

            _ => response::route_not_found(),
        }
    }

    /// Health check endpoint
    async fn handle_health(&self) -> HttpResponse {
        let db = self.services.db.clone();
        match blocking(move || db.stats()).await {
            Ok(stats) => response::ok(&serde_json::json!({
                "status": "ok",
                "version": env!("CARGO_PKG_VERSION"),
                "stats": stats,
                "subscribers": self.services.events.subscriber_count(),
            })),
            Err(e) => error_response(e),
        }
    }

    /// Resolve the bearer token to a user id
    fn authenticate<B>(&self, req: &Request<B>) -> Result<String, LedgerError> {
        let header = req
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());

        let token = extract_token_from_header(header)
            .ok_or_else(|| LedgerError::Auth("No token provided".into()))?;

        self.jwt.verify_token(token).into_user_id()
    }

    /// Run a write on the blocking pool, retrying transient storage failures
    async fn retrying<T, F>(&self, operation: &str, f: F) -> Result<T, LedgerError>
    where
        F: Fn() -> Result<T, LedgerError> + Send + Sync + 'static,
        T: Send + 'static,
    {
        let f = Arc::new(f);
        with_retry(self.retry, operation, || {
            let f = f.clone();
            blocking(move || (*f)())
        })
        .await
    }
}

/// Run a synchronous service call on the blocking pool
async fn blocking<T, F>(f: F) -> Result<T, LedgerError>
where
    F: FnOnce() -> Result<T, LedgerError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| LedgerError::Internal(format!("Blocking task failed: {}", e)))?
}

/// Read and parse a JSON body
async fn read_json<B, T>(req: Request<B>) -> Result<T, LedgerError>
where
    B: Body,
    B::Error: Display,
    T: DeserializeOwned,
{
    let body = req
        .into_body()
        .collect()
        .await
        .map_err(|e| LedgerError::InvalidInput(format!("Failed to read body: {}", e)))?
        .to_bytes();

    Ok(serde_json::from_slice(&body)?)
}

fn idempotency_key<B>(req: &Request<B>) -> Option<String> {
    req.headers()
        .get("idempotency-key")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Minimal query string access
struct Query<'a> {
    pairs: Vec<(&'a str, &'a str)>,
}

impl<'a> Query<'a> {
    fn parse(query: Option<&'a str>) -> Self {
        let pairs = query
            .unwrap_or("")
            .split('&')
            .filter(|p| !p.is_empty())
            .map(|p| p.split_once('=').unwrap_or((p, "")))
            .collect();
        Self { pairs }
    }

    fn get(&self, key: &str) -> Option<&'a str> {
        self.pairs.iter().find(|(k, _)| *k == key).map(|(_, v)| *v)
    }

    fn flag(&self, key: &str) -> bool {
        matches!(self.get(key), Some("true") | Some("1") | Some(""))
    }

    fn limit(&self) -> i64 {
        self.get("limit")
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(DEFAULT_LIMIT)
            .clamp(1, MAX_LIMIT)
    }
}
