//! Browser-facing listener: login, callback, logout
//!
//! The browser is bound to its server-side session with a cookie managed by
//! `tower-sessions`; the cookie session only holds the `SessionKey` under
//! which `oidc-session` keeps the auth state and tokens.

use std::collections::HashMap;
use std::sync::Arc;

use axum::Router;
use axum::extract::{Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use oidc_auth::claims::unix_now;
use oidc_auth::{
    ClientSettings, ProviderEndpoints, SessionIdentity, TokenClient, UnverifiedClaims,
    build_authorization_url,
};
use oidc_session::{RefreshPolicy, SessionKey, SessionState, SessionStore, StateGuard, check_nonce};
use serde::Serialize;
use tower_sessions::cookie::SameSite;
use tower_sessions::{MemoryStore, Session, SessionManagerLayer};
use tracing::{info, instrument, warn};

use crate::error::ApiError;
use crate::metrics;

/// Cookie-session field holding the `SessionKey`.
const SESSION_KEY_FIELD: &str = "sid";

/// Shared state for the client listener.
#[derive(Clone)]
pub struct ClientState {
    pub endpoints: Arc<ProviderEndpoints>,
    pub settings: Arc<ClientSettings>,
    pub store: Arc<SessionStore>,
    pub guard: Arc<StateGuard>,
    pub refresh: Arc<RefreshPolicy>,
    pub tokens: TokenClient,
}

/// Build the client router with the cookie session layer.
///
/// `SameSite=Lax` so the cookie accompanies the top-level redirect back
/// from the identity provider.
pub fn build_router(state: ClientState, secure_cookies: bool) -> Router {
    let sessions = SessionManagerLayer::new(MemoryStore::default())
        .with_secure(secure_cookies)
        .with_same_site(SameSite::Lax);

    Router::new()
        .route("/", get(index_handler))
        .route("/callback", get(callback_handler))
        .route("/logout", get(logout_handler))
        .layer(sessions)
        .layer(axum::middleware::from_fn(metrics::track_client))
        .with_state(state)
}

fn redirect(location: &str) -> Response {
    (StatusCode::FOUND, [(header::LOCATION, location)]).into_response()
}

async fn current_key(session: &Session) -> Result<Option<SessionKey>, ApiError> {
    Ok(session
        .get::<String>(SESSION_KEY_FIELD)
        .await?
        .map(SessionKey::from))
}

async fn bind_new_key(session: &Session) -> Result<SessionKey, ApiError> {
    let key = SessionKey::generate();
    session
        .insert(SESSION_KEY_FIELD, key.as_str().to_owned())
        .await?;
    Ok(key)
}

/// Redirect the browser to the authorization endpoint with a fresh
/// state, nonce and PKCE challenge.
async fn start_login(state: &ClientState, session: &Session) -> Result<Response, ApiError> {
    let key = match current_key(session).await? {
        Some(key) => key,
        None => bind_new_key(session).await?,
    };
    let context = state.guard.begin(&key).await;
    let url = build_authorization_url(&state.endpoints, &state.settings, &context)?;
    info!(session = %key, "redirecting to identity provider");
    Ok(redirect(&url))
}

#[derive(Serialize)]
struct TokenView {
    expires_at: Option<i64>,
    expires_in: Option<i64>,
    has_refresh_token: bool,
    has_id_token: bool,
}

#[derive(Serialize)]
struct IndexView {
    identity: SessionIdentity,
    token: TokenView,
}

/// Authenticated view, or the start of a login when there is none.
async fn index_handler(
    State(state): State<ClientState>,
    session: Session,
) -> Result<Response, ApiError> {
    let Some(key) = current_key(&session).await? else {
        return start_login(&state, &session).await;
    };

    let tokens = match state.refresh.ensure_fresh(&key).await {
        Ok(tokens) => tokens,
        Err(oidc_session::Error::Unauthenticated(reason)) => {
            info!(session = %key, %reason, "no usable session, starting login");
            return start_login(&state, &session).await;
        }
        Err(e) => return Err(e.into()),
    };

    let identity = state.store.identity(&key).await.unwrap_or_default();
    let expires_at = UnverifiedClaims::decode(&tokens.access_token)
        .ok()
        .and_then(|claims| claims.expires_at());
    let view = IndexView {
        identity,
        token: TokenView {
            expires_at,
            expires_in: expires_at.map(|exp| exp - unix_now()),
            has_refresh_token: tokens.refresh_token.is_some(),
            has_id_token: tokens.id_token.is_some(),
        },
    };
    Ok(axum::Json(view).into_response())
}

/// Complete the authorization code flow.
#[instrument(skip_all)]
async fn callback_handler(
    State(state): State<ClientState>,
    session: Session,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, ApiError> {
    match complete_login(&state, &session, &params).await {
        Ok(()) => {
            metrics::record_login("success");
            Ok(redirect("/"))
        }
        Err(e) => {
            metrics::record_login(e.error_type());
            Err(e)
        }
    }
}

async fn complete_login(
    state: &ClientState,
    session: &Session,
    params: &HashMap<String, String>,
) -> Result<(), ApiError> {
    if let Some(error) = params.get("error") {
        let description = params
            .get("error_description")
            .map(|d| format!(": {d}"))
            .unwrap_or_default();
        warn!(%error, "identity provider returned an error");
        return Err(oidc_auth::Error::Input(format!(
            "authorization failed: {error}{description}"
        ))
        .into());
    }

    let (Some(code), Some(returned_state)) = (params.get("code"), params.get("state")) else {
        return Err(
            oidc_auth::Error::Input("callback requires code and state parameters".into()).into(),
        );
    };

    let Some(key) = current_key(session).await? else {
        warn!("callback without a session cookie");
        return Err(oidc_session::Error::StateMismatch(
            "no pending authorization request".into(),
        )
        .into());
    };

    let context = state.guard.validate(&key, returned_state).await?;
    let tokens = state
        .tokens
        .exchange_code(code, &context.code_verifier, &state.settings.redirect_uri)
        .await?;
    check_nonce(&context, &tokens)?;

    let identity = match tokens.id_token.as_deref() {
        Some(id_token) => SessionIdentity::from_id_token(id_token)?,
        None => SessionIdentity::default(),
    };

    // New cookie id and a new server-side key once the user is logged in.
    state.store.clear(&key).await;
    session.cycle_id().await?;
    let key = bind_new_key(session).await?;
    info!(
        session = %key,
        sub = identity.sub.as_deref().unwrap_or("-"),
        "login complete"
    );
    state.store.put(&key, tokens, identity).await;
    Ok(())
}

/// Drop the local session and, when possible, end the provider session too.
async fn logout_handler(
    State(state): State<ClientState>,
    session: Session,
) -> Result<Response, ApiError> {
    let previous = match current_key(&session).await? {
        Some(key) => state.store.clear(&key).await,
        None => SessionState::Anonymous,
    };
    session.flush().await?;

    let id_token = match previous {
        SessionState::Authenticated { tokens, .. } => tokens.id_token,
        _ => None,
    };
    let Some(id_token) = id_token else {
        return Ok(redirect("/"));
    };

    info!("logged out, ending provider session");
    Ok(redirect(&end_session_url(
        &state.endpoints,
        &state.settings,
        &id_token,
    )?))
}

/// Provider logout URL returning the browser to the application root.
fn end_session_url(
    endpoints: &ProviderEndpoints,
    settings: &ClientSettings,
    id_token: &str,
) -> Result<String, ApiError> {
    let invalid = |e: url::ParseError| oidc_auth::Error::Input(format!("invalid URL: {e}"));
    let post_logout = url::Url::parse(&settings.redirect_uri)
        .and_then(|u| u.join("/"))
        .map_err(invalid)?;
    let url = url::Url::parse_with_params(
        &endpoints.end_session,
        &[
            ("id_token_hint", id_token),
            ("post_logout_redirect_uri", post_logout.as_str()),
            ("client_id", settings.client_id.as_str()),
        ],
    )
    .map_err(invalid)?;
    Ok(url.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::extract::Form;
    use axum::http::Request;
    use base64::Engine;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use std::sync::Mutex;
    use tokio::net::TcpListener;
    use tower::ServiceExt;

    const REDIRECT_URI: &str = "http://app.test/callback";

    fn jwt(payload: serde_json::Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256","typ":"JWT"}"#);
        let body = URL_SAFE_NO_PAD.encode(payload.to_string());
        format!("{header}.{body}.sig")
    }

    /// Nonce the mock provider embeds in the next ID token.
    type IssuedNonce = Arc<Mutex<Option<String>>>;

    /// Mock token endpoint. `good-code` is redeemable once and answers with
    /// an ID token carrying the nonce placed in `IssuedNonce`.
    async fn start_provider() -> (String, IssuedNonce) {
        let nonce: IssuedNonce = Arc::new(Mutex::new(None));
        let redeemed = Arc::new(Mutex::new(false));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = axum::Router::new()
            .route(
                "/realms/demo/protocol/openid-connect/token",
                axum::routing::post(
                    move |State((nonce, redeemed)): State<(IssuedNonce, Arc<Mutex<bool>>)>,
                          Form(form): Form<HashMap<String, String>>| async move {
                        let mut redeemed = redeemed.lock().unwrap();
                        let valid = form.get("grant_type").map(String::as_str)
                            == Some("authorization_code")
                            && form.get("code").map(String::as_str) == Some("good-code")
                            && form.get("redirect_uri").map(String::as_str) == Some(REDIRECT_URI)
                            && form.get("code_verifier").is_some_and(|v| v.len() >= 43);
                        if !valid || *redeemed {
                            return (
                                StatusCode::BAD_REQUEST,
                                r#"{"error":"invalid_grant"}"#.to_string(),
                            );
                        }
                        *redeemed = true;
                        let access = jwt(serde_json::json!({"sub": "u-1", "exp": unix_now() + 3600}));
                        let id = jwt(serde_json::json!({
                            "sub": "u-1",
                            "preferred_username": "alice",
                            "email": "alice@example.com",
                            "nonce": nonce.lock().unwrap().clone(),
                        }));
                        (
                            StatusCode::OK,
                            serde_json::json!({
                                "access_token": access,
                                "refresh_token": "rt-1",
                                "id_token": id,
                                "expires_in": 3600,
                            })
                            .to_string(),
                        )
                    },
                ),
            )
            .with_state((nonce.clone(), redeemed));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), nonce)
    }

    fn test_state(base_url: &str) -> ClientState {
        let endpoints = ProviderEndpoints::keycloak(base_url, "demo");
        let settings = ClientSettings::public("test-client", REDIRECT_URI);
        let store = Arc::new(SessionStore::new());
        let tokens = TokenClient::new(reqwest::Client::new(), &endpoints.token, "test-client");
        ClientState {
            guard: Arc::new(StateGuard::new(store.clone())),
            refresh: Arc::new(RefreshPolicy::new(store.clone(), tokens.clone())),
            endpoints: Arc::new(endpoints),
            settings: Arc::new(settings),
            store,
            tokens,
        }
    }

    async fn get(app: &Router, uri: &str, cookie: Option<&str>) -> Response {
        let mut request = Request::builder().uri(uri);
        if let Some(cookie) = cookie {
            request = request.header(header::COOKIE, cookie);
        }
        app.clone()
            .oneshot(request.body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    fn location(response: &Response) -> String {
        response
            .headers()
            .get(header::LOCATION)
            .expect("redirect must carry Location")
            .to_str()
            .unwrap()
            .to_string()
    }

    /// `name=value` part of the Set-Cookie header, ready to send back.
    fn cookie(response: &Response) -> String {
        let set_cookie = response
            .headers()
            .get(header::SET_COOKIE)
            .expect("response must set the session cookie")
            .to_str()
            .unwrap();
        set_cookie.split(';').next().unwrap().to_string()
    }

    fn query_param(url: &str, name: &str) -> String {
        url::Url::parse(url)
            .unwrap()
            .query_pairs()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
            .unwrap_or_else(|| panic!("{name} missing from {url}"))
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    /// Drive `/` then `/callback` and return the post-login cookie.
    async fn login(app: &Router, nonce: &IssuedNonce) -> String {
        let start = get(app, "/", None).await;
        assert_eq!(start.status(), StatusCode::FOUND);
        let cookie = cookie(&start);
        let auth_url = location(&start);
        *nonce.lock().unwrap() = Some(query_param(&auth_url, "nonce"));
        let state = query_param(&auth_url, "state");

        let callback = get(
            app,
            &format!("/callback?code=good-code&state={state}"),
            Some(&cookie),
        )
        .await;
        assert_eq!(callback.status(), StatusCode::FOUND);
        assert_eq!(location(&callback), "/");
        self::cookie(&callback)
    }

    #[tokio::test]
    async fn anonymous_index_redirects_to_authorization_endpoint() {
        let state = test_state("http://idp.test");
        let app = build_router(state, false);

        let response = get(&app, "/", None).await;
        assert_eq!(response.status(), StatusCode::FOUND);
        let url = location(&response);
        assert!(url.starts_with("http://idp.test/realms/demo/protocol/openid-connect/auth?"));
        assert_eq!(query_param(&url, "response_type"), "code");
        assert_eq!(query_param(&url, "code_challenge_method"), "S256");
        assert_eq!(query_param(&url, "redirect_uri"), REDIRECT_URI);

        let set_cookie = response
            .headers()
            .get(header::SET_COOKIE)
            .unwrap()
            .to_str()
            .unwrap();
        assert!(set_cookie.contains("SameSite=Lax"), "got: {set_cookie}");
        assert!(set_cookie.contains("HttpOnly"), "got: {set_cookie}");
    }

    #[tokio::test]
    async fn full_login_flow_shows_identity() {
        let (base_url, nonce) = start_provider().await;
        let state = test_state(&base_url);
        let store = state.store.clone();
        let app = build_router(state, false);

        let cookie = login(&app, &nonce).await;
        assert_eq!(store.len().await, 1, "pre-login session entry must be dropped");

        let response = get(&app, "/", Some(&cookie)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["identity"]["sub"], "u-1");
        assert_eq!(json["identity"]["preferred_username"], "alice");
        assert_eq!(json["token"]["has_refresh_token"], true);
        assert_eq!(json["token"]["has_id_token"], true);
        assert!(json["token"]["expires_in"].as_i64().unwrap() > 3500);
        assert!(
            !json.to_string().contains("rt-1"),
            "token values must not be rendered"
        );
    }

    #[tokio::test]
    async fn replayed_callback_is_rejected() {
        let (base_url, nonce) = start_provider().await;
        let app = build_router(test_state(&base_url), false);

        let start = get(&app, "/", None).await;
        let cookie = cookie(&start);
        let auth_url = location(&start);
        *nonce.lock().unwrap() = Some(query_param(&auth_url, "nonce"));
        let uri = format!(
            "/callback?code=good-code&state={}",
            query_param(&auth_url, "state")
        );

        assert_eq!(get(&app, &uri, Some(&cookie)).await.status(), StatusCode::FOUND);

        let replay = get(&app, &uri, Some(&cookie)).await;
        assert_eq!(replay.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(replay).await["error"]["type"], "state_mismatch");
    }

    #[tokio::test]
    async fn callback_without_pending_request_is_400() {
        let app = build_router(test_state("http://idp.test"), false);

        let response = get(&app, "/callback?code=abc123&state=forged", None).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert_eq!(json["error"]["type"], "state_mismatch");
    }

    #[tokio::test]
    async fn callback_with_wrong_state_is_400() {
        let app = build_router(test_state("http://idp.test"), false);
        let start = get(&app, "/", None).await;
        let cookie = cookie(&start);

        let response = get(&app, "/callback?code=abc123&state=forged", Some(&cookie)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"]["type"], "state_mismatch");
    }

    #[tokio::test]
    async fn provider_error_parameter_is_input_error() {
        let app = build_router(test_state("http://idp.test"), false);

        let response = get(
            &app,
            "/callback?error=access_denied&error_description=user+cancelled",
            None,
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert_eq!(json["error"]["type"], "invalid_request");
        let message = json["error"]["message"].as_str().unwrap();
        assert!(message.contains("access_denied"), "got: {message}");
        assert!(message.contains("user cancelled"), "got: {message}");
    }

    #[tokio::test]
    async fn callback_missing_code_is_input_error() {
        let app = build_router(test_state("http://idp.test"), false);
        let response = get(&app, "/callback?state=abc", None).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"]["type"], "invalid_request");
    }

    #[tokio::test]
    async fn mismatched_nonce_is_rejected() {
        let (base_url, nonce) = start_provider().await;
        let app = build_router(test_state(&base_url), false);

        let start = get(&app, "/", None).await;
        let cookie = cookie(&start);
        let auth_url = location(&start);
        *nonce.lock().unwrap() = Some("some-other-nonce".into());

        let response = get(
            &app,
            &format!(
                "/callback?code=good-code&state={}",
                query_param(&auth_url, "state")
            ),
            Some(&cookie),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"]["type"], "state_mismatch");
    }

    #[tokio::test]
    async fn logout_redirects_to_end_session_with_id_token_hint() {
        let (base_url, nonce) = start_provider().await;
        let state = test_state(&base_url);
        let store = state.store.clone();
        let app = build_router(state, false);
        let cookie = login(&app, &nonce).await;

        let response = get(&app, "/logout", Some(&cookie)).await;
        assert_eq!(response.status(), StatusCode::FOUND);
        let url = location(&response);
        assert!(url.starts_with(&format!(
            "{base_url}/realms/demo/protocol/openid-connect/logout?"
        )));
        assert_eq!(query_param(&url, "post_logout_redirect_uri"), "http://app.test/");
        assert_eq!(query_param(&url, "client_id"), "test-client");
        assert!(!query_param(&url, "id_token_hint").is_empty());
        assert!(store.is_empty().await);

        // The old cookie no longer names a session.
        let after = get(&app, "/", Some(&cookie)).await;
        assert_eq!(after.status(), StatusCode::FOUND);
        assert!(location(&after).contains("/protocol/openid-connect/auth?"));
    }

    #[tokio::test]
    async fn logout_without_session_redirects_home() {
        let app = build_router(test_state("http://idp.test"), false);
        let response = get(&app, "/logout", None).await;
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(location(&response), "/");
    }
}
