//! HTML bodies for proxy-generated error responses.

use super::error::ProxyError;
use std::error::Error as _;

const CERT_TITLE: &str = "The connection is not private.";
const CERT_EXPLAIN: &str = "The certificate of the site you are visiting was not issued by a \
known authority. This usually happens with self-signed certificates.<br/>If you know and trust \
the site, restart the proxy with <strong>--ignore-unauthorized</strong> to continue.";

/// Render the page for a failed exchange with `url`.
pub fn render(err: &ProxyError, url: &str) -> String {
    if err.is_trust_error() {
        render_cert_error(err)
    } else {
        render_generic(err, url)
    }
}

fn render_cert_error(err: &ProxyError) -> String {
    format!(
        "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n<title>{title}</title>\n</head>\n\
<body>\n<h1>{title}</h1>\n<p>{explain}</p>\n<pre>{detail}</pre>\n</body>\n</html>\n",
        title = CERT_TITLE,
        explain = CERT_EXPLAIN,
        detail = escape_html(&err.to_string()),
    )
}

fn render_generic(err: &ProxyError, url: &str) -> String {
    let mut chain = String::new();
    let mut source = err.source();
    while let Some(cause) = source {
        chain.push_str("<li>");
        chain.push_str(&escape_html(&cause.to_string()));
        chain.push_str("</li>\n");
        source = cause.source();
    }

    format!(
        "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n<title>Proxy Error</title>\n</head>\n\
<body>\n<h1>Proxy Error</h1>\n<p>Failed to fetch <code>{url}</code></p>\n<pre>{message}</pre>\n\
<ul>\n{chain}</ul>\n</body>\n</html>\n",
        url = escape_html(url),
        message = escape_html(&err.to_string()),
        chain = chain,
    )
}

/// Escape text for inclusion in HTML.
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generic_page_escapes_url() {
        let err = ProxyError::UpstreamConnect {
            addr: "example.test:80".to_string(),
            message: "connection refused".to_string(),
        };
        let page = render(&err, "http://example.test/?q=<script>");

        assert!(page.contains("Proxy Error"));
        assert!(page.contains("&lt;script&gt;"));
        assert!(page.contains("connection refused"));
        assert!(!page.contains("<script>"));
    }

    #[test]
    fn test_trust_error_uses_cert_page() {
        let err = ProxyError::Trust {
            host: "self-signed.test".to_string(),
            message: "invalid peer certificate: UnknownIssuer".to_string(),
        };
        let page = render(&err, "https://self-signed.test/");

        assert!(page.contains(CERT_TITLE));
        assert!(page.contains("--ignore-unauthorized"));
    }

    #[test]
    fn test_generic_page_lists_sources() {
        let err = ProxyError::Bind {
            addr: "127.0.0.1:0".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::AddrInUse, "address in use"),
        };
        let page = render(&err, "http://example.test/");
        assert!(page.contains("<li>address in use</li>"));
    }
}
