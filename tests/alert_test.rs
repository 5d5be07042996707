use pagewatch::alert::split_message;
use pagewatch::config::ALERT_CHUNK_MAX_CHARS;

#[test]
fn test_short_message_is_one_chunk() {
    let parts = split_message("all good", 4096);
    assert_eq!(parts, vec!["all good".to_string()]);
}

#[test]
fn test_empty_message_yields_single_empty_chunk() {
    assert_eq!(split_message("", 4096), vec![String::new()]);
    assert_eq!(split_message("   \n  ", 4096), vec![String::new()]);
}

#[test]
fn test_chunks_respect_max_len() {
    let text = "x".repeat(10_000);
    let parts = split_message(&text, ALERT_CHUNK_MAX_CHARS);
    assert!(parts.len() >= 3);
    for part in &parts {
        assert!(part.chars().count() <= ALERT_CHUNK_MAX_CHARS);
    }
    // No content lost on an unbreakable blob.
    let total: usize = parts.iter().map(|p| p.chars().count()).sum();
    assert_eq!(total, 10_000);
}

#[test]
fn test_split_prefers_line_boundaries() {
    // 60 lines of 99 chars each; with max 1000 every cut must land on a
    // line boundary rather than mid-line.
    let line = "y".repeat(98);
    let text = (0..60).map(|_| line.clone()).collect::<Vec<_>>().join("\n");
    let parts = split_message(&text, 1000);
    assert!(parts.len() > 1);
    for part in &parts {
        for l in part.lines() {
            assert_eq!(l.chars().count(), 98, "line was split mid-way");
        }
    }
}

#[test]
fn test_split_handles_multibyte_text() {
    let text = "état ✅ überwachung\n".repeat(400);
    let parts = split_message(&text, 100);
    for part in &parts {
        assert!(part.chars().count() <= 100);
    }
    assert!(parts.len() > 1);
}

#[test]
fn test_no_empty_chunks_in_output() {
    let text = "a\n\n\nb\n".repeat(2000);
    for part in split_message(&text, 500) {
        assert!(!part.is_empty());
    }
}
