use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::header::{
    CONNECTION, CONTENT_LENGTH, COOKIE, HOST, LOCATION, TRANSFER_ENCODING,
};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use tracing::{debug, warn};

use super::WebState;
use crate::core::{ImageKind, ImageLookupError, SessionState};

const MAX_RESTARTS: u32 = 5;
/// The authenticated identity forwarded to the container.
const IDENTITY_HEADER: &str = "x-orca-user-identity-token";

/// The gateway's single handler: host label -> image, cookie -> user, elect a
/// container, forward the request.
pub(crate) async fn handle(State(state): State<Arc<WebState>>, req: Request<Body>) -> Response {
    if state.shutdown.is_shutting_down() {
        return (StatusCode::SERVICE_UNAVAILABLE, "Server is shutting down").into_response();
    }

    let Some(host) = request_host(&req) else {
        return (StatusCode::BAD_REQUEST, "Missing Host header").into_response();
    };
    let name = image_name_from_host(&host);
    debug!("got request for {host} -> image {name:?}");

    let Some(token) = cookie_value(req.headers(), &state.identity_cookie) else {
        return login_redirect(&state, &host, &req);
    };
    let user = match state.users.user_by_web_token(&token).await {
        Ok(user) => user,
        Err(err) => {
            debug!("token rejected: {err}");
            return login_redirect(&state, &host, &req);
        }
    };

    let image = match state.images.get_image(ImageKind::Web, &name, &user) {
        Ok(image) => image,
        Err(ImageLookupError::NotFound) => {
            return (StatusCode::NOT_FOUND, "Image not found").into_response()
        }
        Err(ImageLookupError::NotAvailable) => {
            return (StatusCode::FORBIDDEN, "Image not available to you").into_response()
        }
    };

    let mut session = None;
    for attempt in 1..=MAX_RESTARTS {
        let cu = image.container_user_for(&user);
        cu.activity();
        let (container, status) = cu.get_container().await;
        match container {
            Some(container) if status.state == SessionState::Working => {
                session = Some((cu, container));
                break;
            }
            _ => warn!(
                "failed to get working container for {user}: {status}; retrying {attempt}/{MAX_RESTARTS}"
            ),
        }
    }
    let Some((cu, container)) = session else {
        return (StatusCode::INTERNAL_SERVER_ERROR, "Failed to start the container")
            .into_response();
    };
    let Some(base_url) = container.url.clone() else {
        cu.notify_connection_closed().await;
        return (StatusCode::INTERNAL_SERVER_ERROR, "Container has no address").into_response();
    };

    let response = forward(&state, req, &base_url, &token).await;
    cu.notify_connection_closed().await;
    response
}

async fn forward(state: &WebState, req: Request<Body>, base_url: &str, token: &str) -> Response {
    let (parts, body) = req.into_parts();

    let mut url = single_joining_slash(base_url, parts.uri.path());
    if let Some(query) = parts.uri.query() {
        url.push('?');
        url.push_str(query);
    }

    let mut headers = parts.headers.clone();
    strip_cookie(&mut headers, &state.identity_cookie);
    headers.remove(HOST);
    headers.remove(CONNECTION);
    headers.remove(CONTENT_LENGTH);
    headers.remove(TRANSFER_ENCODING);
    if let Ok(value) = HeaderValue::from_str(token) {
        headers.insert(IDENTITY_HEADER, value);
    }

    let upstream = state
        .http
        .request(parts.method, &url)
        .headers(headers)
        .body(reqwest::Body::wrap_stream(body.into_data_stream()))
        .send()
        .await;
    let upstream = match upstream {
        Ok(upstream) => upstream,
        Err(err) => {
            warn!("proxying to {url} failed: {err}");
            return (StatusCode::BAD_GATEWAY, "Container is not reachable").into_response();
        }
    };

    let mut builder = Response::builder().status(upstream.status());
    for (key, value) in upstream.headers() {
        if key == &CONNECTION || key == &TRANSFER_ENCODING {
            continue;
        }
        builder = builder.header(key, value);
    }
    builder
        .body(Body::from_stream(upstream.bytes_stream()))
        .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
}

fn request_host(req: &Request<Body>) -> Option<String> {
    req.headers()
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().host().map(str::to_string))
}

/// The leftmost dot-separated host label, lowercased, names the image.
fn image_name_from_host(host: &str) -> String {
    host.split(':')
        .next()
        .unwrap_or(host)
        .split('.')
        .next()
        .unwrap_or(host)
        .to_lowercase()
}

fn login_redirect(state: &WebState, host: &str, req: &Request<Body>) -> Response {
    let original = format!(
        "http://{host}{}",
        req.uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
    );
    let encoded: String = url::form_urlencoded::byte_serialize(original.as_bytes()).collect();
    let target = state.login_url_format.replace("{}", &encoded);
    debug!("redirecting to login at {target}");
    match HeaderValue::from_str(&target) {
        Ok(location) => (StatusCode::FOUND, [(LOCATION, location)]).into_response(),
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Bad login URL").into_response(),
    }
}

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .find_map(|pair| {
            let (key, value) = pair.trim().split_once('=')?;
            (key == name).then(|| value.to_string())
        })
}

/// Drops the identity cookie, keeping every other cookie intact.
fn strip_cookie(headers: &mut HeaderMap, name: &str) {
    let kept: Vec<String> = headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| {
            let trimmed = pair.trim();
            let (key, _) = trimmed.split_once('=')?;
            (key != name).then(|| trimmed.to_string())
        })
        .collect();
    headers.remove(COOKIE);
    if !kept.is_empty() {
        if let Ok(value) = HeaderValue::from_str(&kept.join("; ")) {
            headers.insert(COOKIE, value);
        }
    }
}

/// Joins two URL fragments with exactly one separator between them.
pub(crate) fn single_joining_slash(a: &str, b: &str) -> String {
    match (a.ends_with('/'), b.starts_with('/')) {
        (true, true) => format!("{a}{}", &b[1..]),
        (false, false) => format!("{a}/{b}"),
        _ => format!("{a}{b}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{test_state_with, ImageRegistry, UserRegistry};
    use crate::runtime::testing::{labeled_image, MockRuntime};
    use axum::routing::{get, post};
    use axum::{Form, Router};
    use std::collections::HashMap;
    use tower::ServiceExt;

    #[test]
    fn joins_with_exactly_one_slash() {
        assert_eq!(single_joining_slash("http://x:80/", "/a"), "http://x:80/a");
        assert_eq!(single_joining_slash("http://x:80", "/a"), "http://x:80/a");
        assert_eq!(single_joining_slash("http://x:80/", "a"), "http://x:80/a");
        assert_eq!(single_joining_slash("http://x:80", "a"), "http://x:80/a");
    }

    #[test]
    fn host_label_becomes_image_name() {
        assert_eq!(image_name_from_host("Maze.ctf.example.com"), "maze");
        assert_eq!(image_name_from_host("app.example.com:8080"), "app");
        assert_eq!(image_name_from_host("localhost:8080"), "localhost");
    }

    #[test]
    fn cookie_helpers_find_and_strip() {
        let mut headers = HeaderMap::new();
        headers.insert(
            COOKIE,
            HeaderValue::from_static("theme=dark; orca-identity=tok123; lang=en"),
        );
        assert_eq!(
            cookie_value(&headers, "orca-identity").as_deref(),
            Some("tok123")
        );
        strip_cookie(&mut headers, "orca-identity");
        assert_eq!(
            headers.get(COOKIE).unwrap().to_str().unwrap(),
            "theme=dark; lang=en"
        );

        strip_cookie(&mut headers, "theme");
        strip_cookie(&mut headers, "lang");
        assert!(headers.get(COOKIE).is_none());
    }

    async fn spawn_backend() -> (u16, Arc<std::sync::Mutex<Vec<String>>>) {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let log = seen.clone();
        let app = Router::new().fallback(get(
            move |req: Request<Body>| {
                let log = log.clone();
                async move {
                    let identity = req
                        .headers()
                        .get(IDENTITY_HEADER)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("-")
                        .to_string();
                    let cookies = req
                        .headers()
                        .get(COOKIE)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("-")
                        .to_string();
                    log.lock().unwrap().push(format!(
                        "{} identity={identity} cookies={cookies}",
                        req.uri()
                    ));
                    "backend says hi"
                }
            },
        ));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (port, seen)
    }

    async fn spawn_validator() -> String {
        async fn check(Form(form): Form<HashMap<String, String>>) -> (StatusCode, String) {
            match form.get("token").map(String::as_str) {
                Some("tok123") => (StatusCode::OK, "alice".to_string()),
                _ => (StatusCode::FORBIDDEN, String::new()),
            }
        }
        let app = Router::new().route("/check", post(check));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/check")
    }

    async fn gateway(backend_port: u16, validator_url: String) -> (MockRuntime, Arc<WebState>) {
        let mock = MockRuntime::default();
        mock.set_inspect_ip("127.0.0.1");
        mock.set_images(vec![labeled_image(
            "sha256:app",
            &["app:latest"],
            &[
                ("orca.kind", "web"),
                ("orca.name", "app"),
                ("orca.port", &backend_port.to_string()),
            ],
        )]);
        let state = test_state_with(Arc::new(mock.clone()));
        let images = Arc::new(ImageRegistry::new(state.clone()));
        images.reconcile().await.unwrap();
        let web = Arc::new(WebState {
            images,
            users: Arc::new(UserRegistry::new(validator_url)),
            shutdown: state.shutdown.clone(),
            http: reqwest::Client::builder()
                .redirect(reqwest::redirect::Policy::none())
                .build()
                .unwrap(),
            identity_cookie: "orca-identity".to_string(),
            login_url_format: "http://login.example.com/?next={}".to_string(),
        });
        (mock, web)
    }

    #[tokio::test]
    async fn authenticated_request_is_proxied_with_identity_header() {
        let (port, seen) = spawn_backend().await;
        let validator = spawn_validator().await;
        let (_mock, web) = gateway(port, validator).await;
        let app = super::super::router(web);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/scoreboard?round=2")
                    .header(HOST, "app.ctf.example.com")
                    .header(COOKIE, "theme=dark; orca-identity=tok123")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"backend says hi");

        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 1);
        // Path and query survived; the identity went into the header; the
        // auth cookie was stripped while other cookies passed through.
        assert!(seen[0].contains("/scoreboard?round=2"));
        assert!(seen[0].contains("identity=tok123"));
        assert!(seen[0].contains("cookies=theme=dark"));
        assert!(!seen[0].contains("orca-identity"));
    }

    #[tokio::test]
    async fn missing_cookie_redirects_to_login() {
        let (port, _) = spawn_backend().await;
        let validator = spawn_validator().await;
        let (_mock, web) = gateway(port, validator).await;
        let app = super::super::router(web);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/top")
                    .header(HOST, "app.ctf.example.com")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FOUND);
        let location = response.headers().get(LOCATION).unwrap().to_str().unwrap();
        assert!(location.starts_with("http://login.example.com/?next="));
        assert!(location.contains("app.ctf.example.com"));
    }

    #[tokio::test]
    async fn unknown_host_label_is_not_found() {
        let (port, _) = spawn_backend().await;
        let validator = spawn_validator().await;
        let (_mock, web) = gateway(port, validator).await;
        let app = super::super::router(web);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/")
                    .header(HOST, "nope.ctf.example.com")
                    .header(COOKIE, "orca-identity=tok123")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn requested_shutdown_refuses_new_requests() {
        let (port, _) = spawn_backend().await;
        let validator = spawn_validator().await;
        let (_mock, web) = gateway(port, validator).await;
        web.shutdown.request();
        let app = super::super::router(web);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/")
                    .header(HOST, "app.ctf.example.com")
                    .header(COOKIE, "orca-identity=tok123")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn reconnects_reuse_the_same_container() {
        let (port, seen) = spawn_backend().await;
        let validator = spawn_validator().await;
        let (mock, web) = gateway(port, validator).await;

        for _ in 0..2 {
            let app = super::super::router(web.clone());
            let response = app
                .oneshot(
                    Request::builder()
                        .uri("/")
                        .header(HOST, "app.ctf.example.com")
                        .header(COOKIE, "orca-identity=tok123")
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
        assert_eq!(mock.create_calls(), 1);
        assert_eq!(seen.lock().unwrap().len(), 2);
    }
}
