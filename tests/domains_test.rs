use pagewatch::domains::{expectation_script, html_visible_text, load_domains_file, DEFAULT_FORBIDDEN_TEXT};

fn write_config(dir: &tempfile::TempDir, body: &str) -> std::path::PathBuf {
    let path = dir.path().join("domains.json");
    std::fs::write(&path, body).unwrap();
    path
}

#[test]
fn test_load_domains_file_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        &dir,
        r#"{"domains": [{"name": "shop.example.com", "url": "https://shop.example.com"}]}"#,
    );
    let domains = load_domains_file(&path).unwrap();
    assert_eq!(domains.len(), 1);
    let d = &domains[0];
    assert_eq!(d.name, "shop.example.com");
    assert_eq!(d.interval_seconds, 300);
    assert_eq!(d.down_after_failures, 2);
    assert_eq!(d.up_after_successes, 2);
    assert!(!d.browser_check);
    assert!(!d.is_disabled(0.0));
    assert_eq!(d.subject_id(), "domain:shop.example.com");
}

#[test]
fn test_load_domains_file_full_entry() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        &dir,
        r##"{"domains": [{
            "name": "app.example.com",
            "url": "https://app.example.com/login",
            "interval_seconds": 120,
            "browser_check": true,
            "expected_title_contains": "Example App",
            "required_selector": "#login-form",
            "notify_on_recovery": true,
            "dispatch_on_failure": true
        }]}"##,
    );
    let d = &load_domains_file(&path).unwrap()[0];
    assert!(d.browser_check);
    assert_eq!(d.expected_title_contains.as_deref(), Some("Example App"));
    assert_eq!(d.required_selector.as_deref(), Some("#login-form"));
    assert!(d.notify_on_recovery);
    assert!(d.dispatch_on_failure);
}

#[test]
fn test_load_domains_rejects_empty_fields() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(&dir, r#"{"domains": [{"name": "", "url": "https://x"}]}"#);
    assert!(load_domains_file(&path).is_err());
}

#[test]
fn test_disabled_until_window() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        &dir,
        r#"{"domains": [{"name": "a", "url": "https://a", "disabled_until_ts": 1000.0}]}"#,
    );
    let d = &load_domains_file(&path).unwrap()[0];
    assert!(d.is_disabled(500.0));
    assert!(!d.is_disabled(1500.0));
}

#[test]
fn test_html_visible_text_strips_markup() {
    let html = r#"
        <html><head><title>Shop</title>
        <style>body { color: red; }</style>
        <script>var maintenance = "not real";</script>
        </head>
        <body><h1>Welcome</h1><p>Buy   things <b>now</b></p></body></html>
    "#;
    let text = html_visible_text(html);
    assert!(text.contains("welcome"));
    assert!(text.contains("buy things now"));
    // Script/style bodies must not leak into the visible text.
    assert!(!text.contains("color: red"));
    assert!(!text.contains("not real"));
}

#[test]
fn test_default_forbidden_text_covers_maintenance_pages() {
    let body = html_visible_text("<html><body><h1>502 Bad Gateway</h1></body></html>");
    assert!(DEFAULT_FORBIDDEN_TEXT.iter().any(|kw| body.contains(kw)));

    let healthy = html_visible_text("<html><body>Dashboard loaded</body></html>");
    assert!(!DEFAULT_FORBIDDEN_TEXT.iter().any(|kw| healthy.contains(kw)));
}

#[test]
fn test_expectation_script_contains_checks() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        &dir,
        r##"{"domains": [{
            "name": "app",
            "url": "https://app",
            "browser_check": true,
            "expected_title_contains": "My \"App\"",
            "required_selector": "#root"
        }]}"##,
    );
    let d = &load_domains_file(&path).unwrap()[0];
    let script = expectation_script(d);
    assert!(script.contains("module.exports.run"));
    assert!(script.contains("waitUntil: 'domcontentloaded'"));
    // Title needle is JSON-escaped and lowercased.
    assert!(script.contains("my \\\"app\\\""));
    assert!(script.contains("waitForSelector(\"#root\")"));
}

#[test]
fn test_expectation_script_minimal_when_unconfigured() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        &dir,
        r#"{"domains": [{"name": "a", "url": "https://a", "browser_check": true}]}"#,
    );
    let d = &load_domains_file(&path).unwrap()[0];
    let script = expectation_script(d);
    assert!(!script.contains("title"));
    assert!(!script.contains("waitForSelector"));
}
