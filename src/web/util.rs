//! HTTP helpers shared by the listening servers
//!
//! Mime lookup by extension and canned error responses. Responses keep the
//! request's HTTP version and keep-alive intent.

use axum::http::{header, HeaderValue, Request, Response, StatusCode, Version};

/// Value of the `Server` header on every response we build
pub const SERVER_NAME: &str = concat!("rtc-native/", env!("CARGO_PKG_VERSION"));

/// Mime type for a path, by extension (case-insensitive)
pub fn mime_type(path: &str) -> &'static str {
    let ext = match path.rfind('.') {
        Some(pos) => &path[pos..],
        None => return "application/text",
    };

    const TABLE: &[(&str, &str)] = &[
        (".htm", "text/html"),
        (".html", "text/html"),
        (".php", "text/html"),
        (".css", "text/css"),
        (".txt", "text/plain"),
        (".js", "application/javascript"),
        (".json", "application/json"),
        (".xml", "application/xml"),
        (".swf", "application/x-shockwave-flash"),
        (".flv", "video/x-flv"),
        (".png", "image/png"),
        (".jpe", "image/jpeg"),
        (".jpeg", "image/jpeg"),
        (".jpg", "image/jpeg"),
        (".gif", "image/gif"),
        (".bmp", "image/bmp"),
        (".ico", "image/vnd.microsoft.icon"),
        (".tiff", "image/tiff"),
        (".tif", "image/tiff"),
        (".svg", "image/svg+xml"),
        (".svgz", "image/svg+xml"),
    ];

    TABLE
        .iter()
        .find(|(candidate, _)| candidate.eq_ignore_ascii_case(ext))
        .map(|(_, mime)| *mime)
        .unwrap_or("application/text")
}

/// Whether the client asked to keep the connection open
pub fn keep_alive<B>(req: &Request<B>) -> bool {
    let connection = req
        .headers()
        .get(header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase());

    let has_token = |token: &str| {
        connection
            .as_deref()
            .map(|v| v.split(',').any(|t| t.trim() == token))
            .unwrap_or(false)
    };

    match req.version() {
        Version::HTTP_09 | Version::HTTP_10 => has_token("keep-alive"),
        _ => !has_token("close"),
    }
}

/// 400 with the reason as body
pub fn bad_request<B>(req: &Request<B>, why: &str) -> Response<String> {
    respond(req, StatusCode::BAD_REQUEST, why.to_string())
}

/// 404 naming the missing target
pub fn not_found<B>(req: &Request<B>, target: &str) -> Response<String> {
    respond(
        req,
        StatusCode::NOT_FOUND,
        format!("The resource '{}' was not found.", target),
    )
}

/// 500 describing what failed
pub fn server_error<B>(req: &Request<B>, what: &str) -> Response<String> {
    respond(
        req,
        StatusCode::INTERNAL_SERVER_ERROR,
        format!("An error occurred: '{}'", what),
    )
}

/// Short text response carrying the server, type, length and connection headers
pub fn respond<B>(req: &Request<B>, status: StatusCode, body: String) -> Response<String> {
    let keep_alive = keep_alive(req);
    let version = req.version();
    let length = body.len();

    let mut res = Response::new(body);
    *res.status_mut() = status;
    *res.version_mut() = version;

    let headers = res.headers_mut();
    headers.insert(header::SERVER, HeaderValue::from_static(SERVER_NAME));
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/html"));
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));

    let legacy = matches!(version, Version::HTTP_09 | Version::HTTP_10);
    if keep_alive && legacy {
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    } else if !keep_alive && !legacy {
        headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
    }

    res
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(version: Version, connection: Option<&str>) -> Request<()> {
        let mut builder = Request::builder().uri("/index.html").version(version);
        if let Some(value) = connection {
            builder = builder.header(header::CONNECTION, value);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn mime_lookup() {
        assert_eq!(mime_type("/data/config.json"), "application/json");
        assert_eq!(mime_type("logo.png"), "image/png");
        assert_eq!(mime_type("archive.tar.unknown"), "application/text");
        assert_eq!(mime_type("README"), "application/text");
        assert_eq!(mime_type("/index.html"), "text/html");
        assert_eq!(mime_type("/icon.svgz"), "image/svg+xml");
    }

    #[test]
    fn mime_lookup_ignores_case() {
        assert_eq!(mime_type("PHOTO.JPG"), "image/jpeg");
        assert_eq!(mime_type("data.Json"), "application/json");
        assert_eq!(mime_type("Index.HTM"), "text/html");
    }

    #[test]
    fn keep_alive_follows_version_defaults() {
        assert!(keep_alive(&request(Version::HTTP_11, None)));
        assert!(!keep_alive(&request(Version::HTTP_11, Some("close"))));
        assert!(!keep_alive(&request(Version::HTTP_10, None)));
        assert!(keep_alive(&request(Version::HTTP_10, Some("Keep-Alive"))));
    }

    #[test]
    fn bad_request_carries_reason() {
        let req = request(Version::HTTP_11, None);
        let res = bad_request(&req, "Illegal request-target");
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert_eq!(res.body(), "Illegal request-target");
        assert_eq!(res.headers()[header::SERVER], SERVER_NAME);
        assert_eq!(res.headers()[header::CONTENT_TYPE], "text/html");
        assert_eq!(res.headers()[header::CONTENT_LENGTH], "22");
        assert!(res.headers().get(header::CONNECTION).is_none());
    }

    #[test]
    fn not_found_names_target() {
        let req = request(Version::HTTP_10, Some("keep-alive"));
        let res = not_found(&req, "/missing.js");
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
        assert_eq!(res.body(), "The resource '/missing.js' was not found.");
        assert_eq!(res.version(), Version::HTTP_10);
        assert_eq!(res.headers()[header::CONNECTION], "keep-alive");
    }

    #[test]
    fn server_error_describes_failure() {
        let req = request(Version::HTTP_11, Some("close"));
        let res = server_error(&req, "permission denied");
        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(res.body(), "An error occurred: 'permission denied'");
        assert_eq!(res.headers()[header::CONNECTION], "close");
    }
}
