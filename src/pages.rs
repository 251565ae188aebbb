//! Developer-facing HTML error pages rendered by the proxy.

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};

const PAGE_SHELL: &str = r#"<html>
  <head>
    <style>
      * { font-family: Helvetica Neue, Arial, Verdana, sans-serif; }
      body { margin: 0; }
      .header { width: 100%; height: 70px; background-color: #D8E5F2; }
      h1 { font-size: 30px; line-height: 70px; width: 880px; margin: 0 auto; padding-left: 20px; }
      .content { width: 880px; margin: 0 auto; padding-left: 20px; }
      .message { margin: 40px 0 60px 0; }
      pre { white-space: pre-wrap; }
    </style>
  </head>
  <body>
    <div class="header"><h1>__TITLE__</h1></div>
    <div class="content"><div class="message"><pre>__MESSAGE__</pre></div></div>
  </body>
</html>
"#;

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

pub fn render_page(title: &str, message: &str) -> String {
    PAGE_SHELL
        .replace("__TITLE__", &escape_html(title))
        .replace("__MESSAGE__", &escape_html(message))
}

fn html_response(status: StatusCode, body: String) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "text/html; charset=utf-8")
        .body(Full::new(Bytes::from(body)).map_err(|never| match never {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

/// Compile output captured from a failed build.
pub fn build_error(app_name: &str, message: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
    html_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        render_page(&format!("Failed to build {app_name}"), message),
    )
}

/// Panic output captured from the child's stderr.
pub fn app_error(app_name: &str, message: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
    html_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        render_page(&format!("{app_name} raised an error"), message),
    )
}

/// The child exited without any captured error.
pub fn quit_error(app_name: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
    html_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        render_page(app_name, "App quit unexpectedly."),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_page_escapes_markup() {
        let page = render_page("demo", "<script>alert(1)</script> & more");
        assert!(page.contains("&lt;script&gt;"));
        assert!(page.contains("&amp; more"));
        assert!(!page.contains("<script>alert"));
    }

    #[test]
    fn build_error_is_html_500() {
        let resp = build_error("demo", "syntax error");
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            resp.headers().get(hyper::header::CONTENT_TYPE).unwrap(),
            "text/html; charset=utf-8"
        );
    }

    #[test]
    fn quit_error_names_the_app() {
        let resp = quit_error("demo");
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
