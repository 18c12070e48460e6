//! Cache key conventions: `<entity>:<scope>:<id>` for single records and
//! `<entity>:<scope>:month:<YYYY-MM>` for per-month lists.

use chrono::NaiveDate;

use crate::period::YearMonth;

pub fn daily(user: &str, date: NaiveDate) -> String {
    format!("daily:{}:{}", user, date.format("%Y-%m-%d"))
}

pub fn daily_month(user: &str, month: YearMonth) -> String {
    format!("daily:{}:month:{}", user, month)
}

pub fn profile(user: &str) -> String {
    format!("profile:{}", user)
}
