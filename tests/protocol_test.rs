use pagewatch::runner::protocol::{extract_result, is_browser_infra_error, RESULT_PREFIX};
use pagewatch::store::RunStatus;

#[test]
fn test_extract_result_parses_last_line() {
    let output = format!(
        "booting browser\n{}{{\"status\":\"fail\",\"error_kind\":\"AssertionError\"}}\nnoise\n{}{{\"status\":\"pass\",\"elapsed_ms\":812.5}}\n",
        RESULT_PREFIX, RESULT_PREFIX
    );
    let result = extract_result(&output).expect("result line");
    assert_eq!(result.status, "pass");
    assert_eq!(result.elapsed_ms, Some(812.5));
}

#[test]
fn test_extract_result_ignores_garbage() {
    assert!(extract_result("").is_none());
    assert!(extract_result("just logs\nno result here").is_none());
    assert!(extract_result(&format!("{}not-json", RESULT_PREFIX)).is_none());
    assert!(extract_result(&format!("{}{{broken json", RESULT_PREFIX)).is_none());
}

#[test]
fn test_extract_result_tolerates_surrounding_whitespace() {
    let output = format!("  {}{{\"status\":\"pass\"}}  \n", RESULT_PREFIX);
    let result = extract_result(&output).expect("result line");
    assert_eq!(result.status, "pass");
}

#[test]
fn test_full_result_payload_roundtrip() {
    let line = format!(
        "{}{{\"status\":\"fail\",\"elapsed_ms\":1500.0,\"error_kind\":\"TimeoutError\",\
         \"error_message\":\"waiting for selector #login\",\"final_url\":\"https://x.test/a\",\
         \"title\":\"Login\",\"artifacts\":{{\"failure_screenshot\":\"failure.png\"}},\
         \"browser_infra_error\":false}}",
        RESULT_PREFIX
    );
    let result = extract_result(&line).unwrap();
    assert_eq!(result.error_kind.as_deref(), Some("TimeoutError"));
    assert_eq!(result.final_url.as_deref(), Some("https://x.test/a"));
    assert_eq!(
        result.artifacts.get("failure_screenshot").and_then(|v| v.as_str()),
        Some("failure.png")
    );
    assert_eq!(result.effective_status(), RunStatus::Fail);
}

#[test]
fn test_infra_sentinel_matching() {
    assert!(is_browser_infra_error("Error: Page.goto: Target closed"));
    assert!(is_browser_infra_error("Error: Page.wait_for_selector: Target crashed"));
    assert!(is_browser_infra_error("page crashed while navigating"));
    assert!(is_browser_infra_error("Protocol error: Session closed."));
    assert!(is_browser_infra_error(
        "Navigation failed because browser has disconnected!"
    ));
    assert!(!is_browser_infra_error("assertion failed: expected #login"));
    assert!(!is_browser_infra_error("HTTP 503 from upstream"));
}

#[test]
fn test_declared_fail_with_sentinel_message_is_infra() {
    let line = format!(
        "{}{{\"status\":\"fail\",\"error_message\":\"Page.click: Target closed\",\"browser_infra_error\":false}}",
        RESULT_PREFIX
    );
    let result = extract_result(&line).unwrap();
    // Controller-side matcher promotes the fail to infra_degraded.
    assert_eq!(result.effective_status(), RunStatus::InfraDegraded);
}

#[test]
fn test_child_infra_flag_is_honored() {
    let line = format!(
        "{}{{\"status\":\"infra_degraded\",\"error_message\":\"chromium never started\",\"browser_infra_error\":true}}",
        RESULT_PREFIX
    );
    let result = extract_result(&line).unwrap();
    assert_eq!(result.effective_status(), RunStatus::InfraDegraded);
}

#[test]
fn test_pass_is_never_reclassified() {
    let line = format!(
        "{}{{\"status\":\"pass\",\"error_message\":\"target closed during teardown\",\"browser_infra_error\":true}}",
        RESULT_PREFIX
    );
    let result = extract_result(&line).unwrap();
    assert_eq!(result.effective_status(), RunStatus::Pass);
}

#[test]
fn test_unknown_declared_status_becomes_fail() {
    let line = format!("{}{{\"status\":\"exploded\"}}", RESULT_PREFIX);
    let result = extract_result(&line).unwrap();
    assert_eq!(result.effective_status(), RunStatus::Fail);
}
