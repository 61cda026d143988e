//! Core domain model and report rows for the vacancy harvester.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "hhv-core";

/// Rendered in place of a salary when neither bound is known.
pub const SALARY_UNDISCLOSED: &str = "undisclosed";
/// Rendered in place of a single missing bound.
pub const BOUND_UNSPECIFIED: &str = "unspecified";

/// An employer as stored in the `employers` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organization {
    pub id: String,
    pub name: String,
    pub url: Option<String>,
    pub description: Option<String>,
    pub open_listings: i32,
}

/// Disclosed salary range. Never constructed with both bounds missing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Salary {
    pub from: Option<i64>,
    pub to: Option<i64>,
    pub currency: Option<String>,
}

impl Salary {
    /// Returns `None` when both bounds are absent; the currency alone carries no salary.
    pub fn new(from: Option<i64>, to: Option<i64>, currency: Option<String>) -> Option<Self> {
        if from.is_none() && to.is_none() {
            return None;
        }
        Some(Self { from, to, currency })
    }
}

/// A vacancy as stored in the `vacancies` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listing {
    pub id: String,
    pub organization_id: String,
    pub title: String,
    pub salary: Option<Salary>,
    pub url: Option<String>,
    pub requirement: Option<String>,
    pub responsibility: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
}

impl Listing {
    pub fn salary_from(&self) -> Option<i64> {
        self.salary.as_ref().and_then(|s| s.from)
    }

    pub fn salary_to(&self) -> Option<i64> {
        self.salary.as_ref().and_then(|s| s.to)
    }

    pub fn currency(&self) -> Option<&str> {
        self.salary.as_ref().and_then(|s| s.currency.as_deref())
    }

    pub fn salary_display(&self) -> String {
        render_salary(self.salary_from(), self.salary_to(), self.currency())
    }
}

/// Human-readable salary column used by every listing report.
pub fn render_salary(from: Option<i64>, to: Option<i64>, currency: Option<&str>) -> String {
    if from.is_none() && to.is_none() {
        return SALARY_UNDISCLOSED.to_string();
    }
    let from = from.map_or_else(|| BOUND_UNSPECIFIED.to_string(), |v| v.to_string());
    let to = to.map_or_else(|| BOUND_UNSPECIFIED.to_string(), |v| v.to_string());
    format!("{from}-{to} {}", currency.unwrap_or_default())
        .trim_end()
        .to_string()
}

/// Parses the API's `published_at` stamps (`2024-01-15T10:30:00+0300`) and RFC 3339.
pub fn parse_published_at(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%z") {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

/// One line of the "companies and listing counts" report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompanyListingCount {
    pub company: String,
    pub listings: i64,
}

/// One listing as shown by the listing reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingReport {
    pub company: String,
    pub title: String,
    pub salary: String,
    pub url: Option<String>,
}

/// A listing report with its salary midpoint attached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedListing {
    pub listing: ListingReport,
    pub midpoint: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn salary_without_bounds_is_not_constructed() {
        assert!(Salary::new(None, None, Some("RUR".into())).is_none());
        assert!(Salary::new(Some(0), None, None).is_some());
    }

    #[test]
    fn undisclosed_salary_is_distinct_from_zero() {
        assert_eq!(render_salary(None, None, None), SALARY_UNDISCLOSED);
        assert_eq!(render_salary(Some(0), Some(0), Some("RUR")), "0-0 RUR");
    }

    #[test]
    fn missing_bound_renders_placeholder() {
        assert_eq!(
            render_salary(Some(100000), None, Some("RUR")),
            "100000-unspecified RUR"
        );
        assert_eq!(render_salary(None, Some(5000), None), "unspecified-5000");
    }

    #[test]
    fn listing_salary_display_uses_salary_object() {
        let listing = Listing {
            id: "1".into(),
            organization_id: "10".into(),
            title: "Rust Developer".into(),
            salary: Salary::new(Some(120), Some(180), Some("USD".into())),
            url: None,
            requirement: None,
            responsibility: None,
            published_at: None,
        };
        assert_eq!(listing.salary_display(), "120-180 USD");
        assert_eq!(listing.salary_from(), Some(120));
        assert_eq!(listing.currency(), Some("USD"));
    }

    #[test]
    fn published_at_accepts_api_and_rfc3339_formats() {
        let expected = Utc.with_ymd_and_hms(2024, 1, 15, 7, 30, 0).single().unwrap();
        assert_eq!(parse_published_at("2024-01-15T10:30:00+0300"), Some(expected));
        assert_eq!(parse_published_at("2024-01-15T10:30:00+03:00"), Some(expected));
        assert_eq!(parse_published_at("yesterday"), None);
    }

    #[test]
    fn report_rows_serialize_with_field_names() {
        let row = CompanyListingCount {
            company: "Acme".into(),
            listings: 3,
        };
        let json = serde_json::to_value(&row).unwrap();
        assert_eq!(json["company"], "Acme");
        assert_eq!(json["listings"], 3);
    }
}
