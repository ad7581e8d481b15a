//! Unit tests for judge score classification and verdict parsing.

use evalbridge::judge::classify;
use evalbridge::judge::openai::parse_verdict;
use evalbridge::models::evaluation::DEFAULT_PASS_THRESHOLD;

#[test]
fn score_at_threshold_passes() {
    assert!(classify(0.70, DEFAULT_PASS_THRESHOLD));
}

#[test]
fn score_just_below_threshold_fails() {
    assert!(!classify(0.69, DEFAULT_PASS_THRESHOLD));
}

#[test]
fn custom_threshold_is_respected() {
    assert!(!classify(0.85, 0.9));
    assert!(classify(0.95, 0.9));
}

#[test]
fn verdict_keeps_strengths_and_weaknesses() {
    let verdict = parse_verdict(
        r#"{"overall_score":0.4,"strengths":["polite"],"weaknesses":["wrong city","too long"]}"#,
    )
    .expect("parses");
    assert_eq!(verdict.strengths.len(), 1);
    assert_eq!(verdict.weaknesses.len(), 2);
    assert!(!classify(verdict.overall_score, DEFAULT_PASS_THRESHOLD));
}

#[test]
fn negative_score_clamps_to_zero() {
    let verdict = parse_verdict(r#"{"overall_score": -2}"#).expect("parses");
    assert!(verdict.overall_score.abs() < f64::EPSILON);
}
