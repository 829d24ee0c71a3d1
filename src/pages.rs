//! HTML pages served by the proxy itself: unknown-host 404, upstream-down
//! 502 (with auto-refresh so the page recovers once the dev server is back),
//! and the tunnel-side 502 body.

fn escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

const STYLE: &str = "font-family: -apple-system, 'Segoe UI', sans-serif; \
                     max-width: 32rem; margin: 6rem auto; padding: 0 1rem; \
                     color: #333; line-height: 1.5;";

pub fn not_found(host: &str) -> String {
    let host = escape(host);
    format!(
        r#"<!doctype html>
<html>
<head><meta charset="utf-8"><title>Unknown host</title></head>
<body style="{STYLE}">
<h1>Unknown host</h1>
<p><code>{host}</code> is not configured with dotlocal.</p>
<p>Add it with <code>dotlocal add &lt;name&gt; --port &lt;port&gt;</code> and reload.</p>
</body>
</html>
"#
    )
}

pub fn upstream_down(host: &str, port: u16) -> String {
    let host = escape(host);
    format!(
        r#"<!doctype html>
<html>
<head>
<meta charset="utf-8">
<meta http-equiv="refresh" content="2">
<title>Waiting for {host}</title>
</head>
<body style="{STYLE}">
<h1>Waiting for {host}&hellip;</h1>
<p>Nothing is listening on <code>localhost:{port}</code> yet.</p>
<p>This page refreshes automatically once your server is up.</p>
</body>
</html>
"#
    )
}

pub fn tunnel_unreachable(port: u16) -> String {
    format!(
        r#"<!doctype html>
<html>
<head><meta charset="utf-8"><title>Local server unreachable</title></head>
<body style="{STYLE}">
<h1>Local server unreachable</h1>
<p>The tunnel is connected, but nothing answered on <code>localhost:{port}</code>.</p>
</body>
</html>
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_down_names_host_and_refreshes() {
        let page = upstream_down("myapp.local", 3000);
        assert!(page.contains("Waiting for myapp.local"));
        assert!(page.contains(r#"http-equiv="refresh""#));
        assert!(page.contains("localhost:3000"));
    }

    #[test]
    fn not_found_escapes_host() {
        let page = not_found("<script>alert(1)</script>");
        assert!(!page.contains("<script>"));
        assert!(page.contains("&lt;script&gt;"));
    }
}
