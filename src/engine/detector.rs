//! Error detector: classifies a failed fetch into one [`ErrorPattern`].
//!
//! Pure functions, no store or DB access, so detection is deterministic for a
//! given `(failure, url, page_content)`.

use chrono::Utc;

use super::actions;
use super::types::{ActionParams, ActionType, DetectedError, ErrorPattern, FetchFailure, PlanSource, RecoveryPlan};

/// Page excerpts stored on a [`DetectedError`] are capped at this many chars.
pub const EXCERPT_CHARS: usize = 500;

/// Candidates within this distance of the best confidence are ranked by precedence.
const CONFIDENCE_EPSILON: f64 = 0.05;

const UNKNOWN_CONFIDENCE: f64 = 0.1;

#[derive(Debug, Clone, Copy)]
struct Candidate {
    pattern: ErrorPattern,
    confidence: f64,
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

fn status_rule(status: u16) -> Option<Candidate> {
    let (pattern, confidence) = match status {
        429 => (ErrorPattern::RateLimited, 0.95),
        403 => (ErrorPattern::Blocked, 0.85),
        401 => (ErrorPattern::AuthRequired, 0.9),
        404 | 410 => (ErrorPattern::NotFound, 0.9),
        500..=599 => (ErrorPattern::ServerError, 0.8),
        _ => return None,
    };
    Some(Candidate { pattern, confidence })
}

/// Keyword table over lowercased error text.
const ERROR_KEYWORDS: &[(ErrorPattern, f64, &[&str])] = &[
    (ErrorPattern::Captcha, 0.9, &["captcha", "challenge-platform"]),
    (ErrorPattern::RateLimited, 0.85, &["rate limit", "ratelimit", "too many requests"]),
    (ErrorPattern::Blocked, 0.8, &["access denied", "forbidden", "blocked", "bot detected"]),
    (ErrorPattern::AuthRequired, 0.8, &["unauthorized", "login required", "authentication required"]),
    (
        ErrorPattern::Timeout,
        0.85,
        &["dial timeout", "context deadline exceeded", "timed out", "timeout"],
    ),
    (
        ErrorPattern::ConnectionError,
        0.85,
        &[
            "connection refused",
            "connection reset",
            "no such host",
            "network is unreachable",
            "unexpected eof",
            "tls handshake",
        ],
    ),
    (
        ErrorPattern::LayoutChanged,
        0.7,
        &["selector", "element not found", "no node found", "waiting for selector"],
    ),
    (ErrorPattern::NotFound, 0.6, &["not found"]),
];

/// Keyword table over lowercased page content.
const PAGE_KEYWORDS: &[(ErrorPattern, f64, &[&str])] = &[
    (ErrorPattern::Captcha, 0.95, &["g-recaptcha", "h-captcha", "cf-turnstile", "hcaptcha.com"]),
    (ErrorPattern::Captcha, 0.8, &["captcha"]),
    (ErrorPattern::RateLimited, 0.8, &["rate limit", "too many requests", "slow down"]),
    (
        ErrorPattern::Blocked,
        0.8,
        &["access denied", "you have been blocked", "request blocked", "unusual traffic"],
    ),
];

fn keyword_rules(text: &str, table: &[(ErrorPattern, f64, &[&str])], out: &mut Vec<Candidate>) {
    let lower = text.to_lowercase();
    for (pattern, confidence, needles) in table {
        if needles.iter().any(|n| lower.contains(n)) {
            out.push(Candidate { pattern: *pattern, confidence: *confidence });
        }
    }
}

/// Login-form markup: a password input inside a form.
fn looks_like_login_wall(page: &str) -> bool {
    let lower = page.to_lowercase();
    lower.contains("<form")
        && (lower.contains("type=\"password\"") || lower.contains("type='password'") || lower.contains("type=password"))
}

/// Highest confidence wins; near-ties go to the operationally more severe pattern.
fn pick(candidates: &[Candidate]) -> Candidate {
    let best = candidates.iter().map(|c| c.confidence).fold(f64::MIN, f64::max);
    candidates
        .iter()
        .filter(|c| best - c.confidence <= CONFIDENCE_EPSILON)
        .max_by(|a, b| {
            a.pattern
                .precedence()
                .cmp(&b.pattern.precedence())
                .then(a.confidence.total_cmp(&b.confidence))
        })
        .copied()
        .unwrap_or(Candidate { pattern: ErrorPattern::Unknown, confidence: UNKNOWN_CONFIDENCE })
}

// ---------------------------------------------------------------------------
// Detection
// ---------------------------------------------------------------------------

/// Classify a failure into exactly one pattern.
pub fn detect(failure: &FetchFailure, url: &str, page_content: Option<&str>) -> DetectedError {
    let mut candidates = Vec::new();

    if let Some(status) = failure.status_code {
        candidates.extend(status_rule(status));
    }
    if let Some(ref message) = failure.message {
        keyword_rules(message, ERROR_KEYWORDS, &mut candidates);
    }
    if let Some(page) = page_content {
        keyword_rules(page, PAGE_KEYWORDS, &mut candidates);
        if looks_like_login_wall(page) {
            candidates.push(Candidate { pattern: ErrorPattern::AuthRequired, confidence: 0.75 });
        }
    }

    let chosen = pick(&candidates);

    DetectedError {
        pattern: chosen.pattern,
        confidence: chosen.confidence.clamp(0.0, 1.0),
        raw_error: raw_error(failure),
        domain: extract_domain(url),
        url: url.to_string(),
        status_code: failure.status_code,
        page_content_excerpt: page_content.map(|p| truncate(p, EXCERPT_CHARS)),
        headers: failure.headers.clone(),
        detected_at: Utc::now(),
    }
}

fn raw_error(failure: &FetchFailure) -> String {
    match (&failure.message, failure.status_code) {
        (Some(msg), _) => msg.clone(),
        (None, Some(code)) => format!("HTTP {code}"),
        (None, None) => String::new(),
    }
}

/// Lowercased host of `url`, or the raw input when it does not parse.
pub fn extract_domain(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(parsed) => parsed.host_str().unwrap_or_default().to_lowercase(),
        Err(_) => url
            .split("://")
            .last()
            .unwrap_or(url)
            .split(['/', ':', '?'])
            .next()
            .unwrap_or_default()
            .to_lowercase(),
    }
}

/// Truncate on a char boundary.
pub fn truncate(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

/// Cheapest sensible action for a pattern when no rule or AI decision exists.
pub fn recommended_action(pattern: ErrorPattern) -> ActionType {
    match pattern {
        ErrorPattern::Captcha => ActionType::SendToDlq,
        ErrorPattern::AuthRequired => ActionType::SendToDlq,
        ErrorPattern::NotFound => ActionType::SendToDlq,
        ErrorPattern::LayoutChanged => ActionType::SendToDlq,
        ErrorPattern::RateLimited => ActionType::AddDelay,
        ErrorPattern::ServerError => ActionType::AddDelay,
        ErrorPattern::Blocked => ActionType::SwitchProxy,
        ErrorPattern::ConnectionError => ActionType::SwitchProxy,
        ErrorPattern::Timeout => ActionType::Retry,
        ErrorPattern::Unknown => ActionType::Retry,
    }
}

/// Plan built from [`recommended_action`] with default parameters.
pub fn default_plan(detected: &DetectedError) -> RecoveryPlan {
    let action = recommended_action(detected.pattern);
    let reason = format!("default action for {}", detected.pattern);
    actions::build_plan_for(action, &ActionParams::new(), reason.clone(), PlanSource::Default)
        .unwrap_or_else(|_| RecoveryPlan::retry(std::time::Duration::from_secs(5), reason))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detect_status(code: u16) -> DetectedError {
        detect(&FetchFailure::status(code), "https://www.shop.com/p/1", None)
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(detect_status(429).pattern, ErrorPattern::RateLimited);
        assert_eq!(detect_status(403).pattern, ErrorPattern::Blocked);
        assert_eq!(detect_status(401).pattern, ErrorPattern::AuthRequired);
        assert_eq!(detect_status(404).pattern, ErrorPattern::NotFound);
        assert_eq!(detect_status(503).pattern, ErrorPattern::ServerError);
        assert_eq!(detect_status(503).raw_error, "HTTP 503");
    }

    #[test]
    fn test_error_text() {
        let d = detect(&FetchFailure::message("dial tcp: i/o timeout (dial timeout)"), "https://a.com", None);
        assert_eq!(d.pattern, ErrorPattern::Timeout);
        let d = detect(&FetchFailure::message("context deadline exceeded"), "https://a.com", None);
        assert_eq!(d.pattern, ErrorPattern::Timeout);
        let d = detect(&FetchFailure::message("read: connection reset by peer"), "https://a.com", None);
        assert_eq!(d.pattern, ErrorPattern::ConnectionError);
        let d = detect(&FetchFailure::message("waiting for selector `.price` failed"), "https://a.com", None);
        assert_eq!(d.pattern, ErrorPattern::LayoutChanged);
    }

    #[test]
    fn test_captcha_beats_blocked_status() {
        let page = r#"<div class="g-recaptcha" data-sitekey="x"></div>"#;
        let d = detect(&FetchFailure::status(403), "https://shop.com", Some(page));
        assert_eq!(d.pattern, ErrorPattern::Captcha);
        assert!(d.confidence >= 0.9);
    }

    #[test]
    fn test_precedence_breaks_near_ties() {
        // blocked (0.85 via 403) vs rate_limited (0.85 via text): blocked ranks higher.
        let mut failure = FetchFailure::status(403);
        failure.message = Some("too many requests".into());
        let d = detect(&failure, "https://shop.com", None);
        assert_eq!(d.pattern, ErrorPattern::Blocked);
    }

    #[test]
    fn test_login_wall() {
        let page = r#"<form action="/login"><input type="password" name="pw"></form>"#;
        let d = detect(&FetchFailure::status(200), "https://shop.com/account", Some(page));
        assert_eq!(d.pattern, ErrorPattern::AuthRequired);
    }

    #[test]
    fn test_unknown_has_low_nonzero_confidence() {
        let d = detect(&FetchFailure::message("something odd"), "https://shop.com", None);
        assert_eq!(d.pattern, ErrorPattern::Unknown);
        assert!(d.confidence > 0.0 && d.confidence < 0.5);
    }

    #[test]
    fn test_domain_and_excerpt() {
        let page = "x".repeat(2_000);
        let d = detect(&FetchFailure::status(500), "https://WWW.Shop.com:8443/a?b=c", Some(&page));
        assert_eq!(d.domain, "www.shop.com");
        assert_eq!(d.page_content_excerpt.unwrap().chars().count(), EXCERPT_CHARS);
        assert_eq!(extract_domain("shop.com/path"), "shop.com");
    }

    #[test]
    fn test_recommended_actions() {
        assert_eq!(recommended_action(ErrorPattern::Captcha), ActionType::SendToDlq);
        assert_eq!(recommended_action(ErrorPattern::RateLimited), ActionType::AddDelay);
        assert_eq!(recommended_action(ErrorPattern::Blocked), ActionType::SwitchProxy);
    }

    #[test]
    fn test_default_plan_uses_recommended_action() {
        let plan = default_plan(&detect_status(429));
        assert_eq!(plan.action, ActionType::AddDelay);
        assert_eq!(plan.source, PlanSource::Default);
        assert!(plan.should_retry);

        let plan = default_plan(&detect(&FetchFailure::message("captcha required"), "https://a.com", None));
        assert_eq!(plan.action, ActionType::SendToDlq);
        assert!(!plan.should_retry);
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("hi", 10), "hi");
    }
}
