use crate::types::TokenId;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

/// Parsed rate-limit facts for a single response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RateLimitInfo {
    pub remaining: Option<u64>,
    pub resume_at: Option<DateTime<Utc>>,
}

/// Backoff state keyed by token, never by repo — different tokens never
/// inherit each other's cooldown (spec.md §4.2, invariant 4 in §8).
#[derive(Default)]
pub struct RateLimitCooldowns {
    resume_at: DashMap<TokenId, DateTime<Utc>>,
}

impl RateLimitCooldowns {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, token: &TokenId, resume_at: DateTime<Utc>) {
        self.resume_at
            .entry(token.clone())
            .and_modify(|existing| {
                if resume_at > *existing {
                    *existing = resume_at;
                }
            })
            .or_insert(resume_at);
    }

    /// How long the caller must wait before issuing a request with `token`,
    /// zero if no cooldown is in effect.
    pub fn wait_duration(&self, token: &TokenId, now: DateTime<Utc>) -> chrono::Duration {
        match self.resume_at.get(token) {
            Some(until) if *until > now => *until - now,
            _ => chrono::Duration::zero(),
        }
    }

    pub fn clear_expired(&self, now: DateTime<Utc>) {
        self.resume_at.retain(|_, until| *until > now);
    }
}

/// Parse the `x-ratelimit-reset` header (epoch seconds) into a resume
/// instant, or fall back to scanning a secondary-limit message body for an
/// embedded timestamp/seconds count.
pub fn parse_rate_limit_reset(
    header_value: Option<&str>,
    body: &str,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    if let Some(raw) = header_value {
        if let Ok(epoch) = raw.trim().parse::<i64>() {
            if let Some(dt) = DateTime::<Utc>::from_timestamp(epoch, 0) {
                return Some(dt);
            }
        }
    }
    parse_secondary_limit_message(body, now)
}

/// Secondary rate-limit bodies read like "You have exceeded a secondary
/// rate limit. Please retry your request again after 45 seconds." or
/// embed an absolute epoch timestamp. Best-effort extraction; returns
/// `None` rather than guessing when neither pattern matches.
fn parse_secondary_limit_message(body: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let lower = body.to_lowercase();
    if !lower.contains("secondary rate limit") && !lower.contains("exceeded a rate limit") {
        return None;
    }
    let re = regex::Regex::new(r"after (\d+) second").ok()?;
    if let Some(caps) = re.captures(&lower) {
        let secs: i64 = caps.get(1)?.as_str().parse().ok()?;
        return Some(now + chrono::Duration::seconds(secs));
    }
    let re_ts = regex::Regex::new(r#"retry-after["':\s]+(\d{10,13})"#).ok()?;
    if let Some(caps) = re_ts.captures(&lower) {
        let raw: i64 = caps.get(1)?.as_str().parse().ok()?;
        let epoch = if raw > 10_000_000_000 { raw / 1000 } else { raw };
        return DateTime::<Utc>::from_timestamp(epoch, 0);
    }
    None
}
