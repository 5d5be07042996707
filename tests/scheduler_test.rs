use pagewatch::config::{BACKOFF_FACTOR, BACKOFF_FACTOR_MAX, BACKOFF_FAIL_STREAK};
use pagewatch::scheduler::backoff_factor;

#[test]
fn test_no_backoff_below_threshold() {
    assert_eq!(backoff_factor(0), 1.0);
    assert_eq!(backoff_factor(5), 1.0);
    assert_eq!(backoff_factor(BACKOFF_FAIL_STREAK - 1), 1.0);
}

#[test]
fn test_backoff_kicks_in_at_threshold() {
    assert_eq!(backoff_factor(BACKOFF_FAIL_STREAK), BACKOFF_FACTOR);
    assert_eq!(backoff_factor(15), BACKOFF_FACTOR);
}

#[test]
fn test_backoff_is_capped() {
    assert_eq!(backoff_factor(20), BACKOFF_FACTOR_MAX);
    assert_eq!(backoff_factor(1000), BACKOFF_FACTOR_MAX);
}

#[test]
fn test_auth_token_hashing() {
    use pagewatch::auth::hash_token;
    // Stable, whitespace-insensitive at the edges, and never empty-colliding.
    assert_eq!(hash_token("abc"), hash_token(" abc "));
    assert_ne!(hash_token("abc"), hash_token("abd"));
    assert_eq!(hash_token("abc").len(), 64);
}

#[test]
fn test_generated_tokens_are_unique() {
    use pagewatch::auth::generate_token;
    let a = generate_token();
    let b = generate_token();
    assert_ne!(a, b);
    assert!(a.starts_with("pw_"));
}
