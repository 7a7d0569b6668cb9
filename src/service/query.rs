//! Query parameter parsing
//!
//! Turns the untyped request parameter map into a [`QuerySpec`] once, at the
//! boundary. Nothing below this module sees raw strings.

use crate::chunkstore::{
    Filter, FindQuery, SortDirection, SortSpec, Value, FILENAME_FIELD, ID_FIELD, UPLOAD_DATE_FIELD,
};
use crate::error::ArchiveError;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use std::collections::HashMap;

pub const TICKET_NUMBER_PARAM: &str = "ticketNumber";
pub const START_DATE_PARAM: &str = "startDate";
pub const END_DATE_PARAM: &str = "endDate";
pub const LIMIT_PARAM: &str = "limit";
pub const SKIP_PARAM: &str = "skip";
pub const SORT_FIELDS_PARAM: &str = "sortFields";
pub const SORT_DIR_PARAM: &str = "sortDir";
pub const FILENAME_PARAM: &str = "filename";

/// Metadata field holding the optional ticket reference
pub const TICKET_FIELD: &str = "metadata.ticketNumber";
const DATE_FORMAT: &str = "%m-%d-%Y";

/// A parsed list request
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QuerySpec {
    pub ticket_number: Option<String>,
    /// Inclusive lower bound on upload time
    pub start_date: Option<DateTime<Utc>>,
    /// Inclusive upper bound on upload time
    pub end_date: Option<DateTime<Utc>>,
    pub filename: Option<String>,
    /// 0 means unbounded
    pub limit: u64,
    pub skip: u64,
    pub sort: Option<SortSpec>,
}

impl QuerySpec {
    /// AND of every supplied term, [`Filter::Empty`] when none were given.
    pub fn filter(&self) -> Filter {
        let mut terms = Vec::new();
        if let Some(ticket) = &self.ticket_number {
            terms.push(Filter::eq(TICKET_FIELD, Value::Text(ticket.clone())));
        }
        if let Some(start) = self.start_date {
            terms.push(Filter::gte(UPLOAD_DATE_FIELD, Value::Timestamp(start)));
        }
        if let Some(end) = self.end_date {
            terms.push(Filter::lte(UPLOAD_DATE_FIELD, Value::Timestamp(end)));
        }
        if let Some(filename) = &self.filename {
            terms.push(Filter::eq(FILENAME_FIELD, Value::Text(filename.clone())));
        }
        Filter::and(terms)
    }

    pub fn to_find_query(&self) -> FindQuery {
        FindQuery {
            filter: self.filter(),
            skip: self.skip,
            limit: self.limit,
            sort: self.sort.clone(),
        }
    }
}

pub struct QueryBuilder;

impl QueryBuilder {
    pub fn build(params: &HashMap<String, String>) -> Result<QuerySpec, ArchiveError> {
        // blank means absent; exact-match values keep their surrounding whitespace
        let param = |name: &str| {
            params
                .get(name)
                .map(String::as_str)
                .filter(|v| !v.trim().is_empty())
        };

        let start_date = param(START_DATE_PARAM)
            .map(|raw| {
                parse_date(raw.trim())
                    .map(|day| day.and_time(NaiveTime::MIN).and_utc())
                    .ok_or_else(|| ArchiveError::validation("Cannot parse startDate"))
            })
            .transpose()?;

        let end_date = param(END_DATE_PARAM)
            .map(|raw| {
                parse_date(raw.trim())
                    .and_then(|day| day.and_hms_milli_opt(23, 59, 59, 999))
                    .map(|ts| ts.and_utc())
                    .ok_or_else(|| ArchiveError::validation("Cannot parse endDate"))
            })
            .transpose()?;

        let limit = param(LIMIT_PARAM)
            .map(|raw| parse_whole_number(raw.trim(), LIMIT_PARAM))
            .transpose()?
            .unwrap_or(0);
        let skip = param(SKIP_PARAM)
            .map(|raw| parse_whole_number(raw.trim(), SKIP_PARAM))
            .transpose()?
            .unwrap_or(0);

        let sort = match (param(SORT_FIELDS_PARAM), param(SORT_DIR_PARAM).and_then(|raw| parse_direction(raw.trim()))) {
            (Some(raw_fields), Some(direction)) => {
                let fields: Vec<String> = raw_fields
                    .split(',')
                    .map(str::trim)
                    .filter(|f| !f.is_empty())
                    .map(|f| {
                        if f.eq_ignore_ascii_case("id") {
                            ID_FIELD.to_string()
                        } else {
                            f.to_string()
                        }
                    })
                    .collect();
                (!fields.is_empty()).then_some(SortSpec { fields, direction })
            }
            _ => None,
        };

        Ok(QuerySpec {
            ticket_number: param(TICKET_NUMBER_PARAM).map(str::to_string),
            start_date,
            end_date,
            filename: param(FILENAME_PARAM).map(str::to_string),
            limit,
            skip,
            sort,
        })
    }
}

/// Strict `MM-DD-YYYY`; impossible dates such as month 13 are rejected.
fn parse_date(raw: &str) -> Option<NaiveDate> {
    if raw.len() != 10 {
        return None;
    }
    NaiveDate::parse_from_str(raw, DATE_FORMAT).ok()
}

fn parse_whole_number(raw: &str, name: &str) -> Result<u64, ArchiveError> {
    raw.parse::<u64>()
        .map_err(|_| ArchiveError::validation(format!("{} param must be a whole number", name)))
}

fn parse_direction(raw: &str) -> Option<SortDirection> {
    if raw.eq_ignore_ascii_case("ASC") {
        Some(SortDirection::Ascending)
    } else if raw.eq_ignore_ascii_case("DESC") {
        Some(SortDirection::Descending)
    } else {
        None
    }
}
