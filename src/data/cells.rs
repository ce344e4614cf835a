use chrono::{DateTime, NaiveDate, NaiveDateTime};

// Tokens that mean "no value" in the source export.
const MISSING_TOKENS: [&str; 8] = ["", "nan", "na", "n/a", "null", "none", "nat", "-"];

const DATE_FORMATS: [&str; 4] = ["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y", "%d.%m.%Y"];

const DATETIME_FORMATS: [&str; 3] = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"];

/// Tally of non-empty cells that could not be interpreted.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CellFailures {
    pub numbers: usize,
    pub dates: usize,
}

impl CellFailures {
    pub fn total(&self) -> usize {
        self.numbers + self.dates
    }
}

fn is_missing(cell: &str) -> bool {
    let cell = cell.trim();
    MISSING_TOKENS.iter().any(|token| cell.eq_ignore_ascii_case(token))
}

pub fn text(cell: Option<String>) -> Option<String> {
    cell.and_then(|value| {
        if is_missing(&value) {
            None
        } else {
            Some(value.trim().to_string())
        }
    })
}

pub fn number(cell: Option<&str>, failures: &mut CellFailures) -> Option<f64> {
    let cell = cell?;
    if is_missing(cell) {
        return None;
    }
    match cell.trim().parse::<f64>() {
        Ok(value) if value.is_nan() => None,
        Ok(value) => Some(value),
        Err(_) => {
            failures.numbers += 1;
            None
        }
    }
}

pub fn date(cell: Option<&str>, failures: &mut CellFailures) -> Option<NaiveDate> {
    let cell = cell?;
    if is_missing(cell) {
        return None;
    }
    let parsed = parse_date(cell.trim());
    if parsed.is_none() {
        failures.dates += 1;
    }
    parsed
}

fn parse_date(cell: &str) -> Option<NaiveDate> {
    DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(cell, format).ok())
        .or_else(|| {
            DATETIME_FORMATS
                .iter()
                .find_map(|format| NaiveDateTime::parse_from_str(cell, format).ok())
                .map(|datetime| datetime.date())
        })
        .or_else(|| {
            DateTime::parse_from_rfc3339(cell)
                .ok()
                .map(|datetime| datetime.date_naive())
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_tokens_are_absent_without_failure() {
        let mut failures = CellFailures::default();
        assert_eq!(number(Some("NaN"), &mut failures), None);
        assert_eq!(number(Some("  "), &mut failures), None);
        assert_eq!(date(Some("NaT"), &mut failures), None);
        assert_eq!(text(Some("n/a".to_string())), None);
        assert_eq!(failures.total(), 0);
    }

    #[test]
    fn test_unparseable_cells_are_counted() {
        let mut failures = CellFailures::default();
        assert_eq!(number(Some("12 tons"), &mut failures), None);
        assert_eq!(date(Some("sometime in May"), &mut failures), None);
        assert_eq!(failures, CellFailures { numbers: 1, dates: 1 });
    }

    #[test]
    fn test_date_formats() {
        let mut failures = CellFailures::default();
        let expected = NaiveDate::from_ymd_opt(2024, 3, 7);
        for cell in [
            "2024-03-07",
            "2024/03/07",
            "03/07/2024",
            "07.03.2024",
            "2024-03-07 14:30:00",
            "2024-03-07T14:30:00",
            "2024-03-07T14:30:00+02:00",
        ] {
            assert_eq!(date(Some(cell), &mut failures), expected, "{cell}");
        }
        assert_eq!(failures.total(), 0);
    }

    #[test]
    fn test_infinite_numbers_are_kept() {
        let mut failures = CellFailures::default();
        assert_eq!(number(Some("inf"), &mut failures), Some(f64::INFINITY));
        assert_eq!(number(Some(" 1500.5 "), &mut failures), Some(1500.5));
    }
}
