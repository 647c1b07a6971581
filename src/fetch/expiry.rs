use chrono::{DateTime, Utc};
use reqwest::Url;

/// The Unix-epoch `Expires` query parameter of a signed URL, if any.
pub fn expiry_marker(url: &str) -> Option<DateTime<Utc>> {
    let parsed = Url::parse(url).ok()?;
    let (_, value) = parsed.query_pairs().find(|(key, _)| key.eq_ignore_ascii_case("expires"))?;
    let secs = value.parse::<i64>().ok()?;
    DateTime::from_timestamp(secs, 0)
}

/// The expiry time if the URL carries a marker that is already in the past.
pub fn expired_at(url: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    expiry_marker(url).filter(|expires| *expires <= now)
}
