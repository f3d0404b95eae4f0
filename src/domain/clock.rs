use chrono::{NaiveDate, Utc};

#[must_use]
pub fn now_unix_ms() -> u64 {
    let now = Utc::now();
    now.timestamp_millis().max(0) as u64
}

#[must_use]
pub fn today_utc() -> NaiveDate {
    Utc::now().date_naive()
}
