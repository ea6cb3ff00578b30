use chrono::{DateTime, Utc};
use croner::Cron;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CronError {
    #[error("invalid cron expression '{expression}': {reason}")]
    InvalidExpression { expression: String, reason: String },
}

/// Computes trigger instants from five or six field cron expressions.
///
/// Evaluation always happens in UTC so every replica agrees on the next
/// trigger regardless of its local time zone.
#[derive(Debug, Clone, Copy, Default)]
pub struct CronCalculator;

impl CronCalculator {
    pub fn new() -> Self {
        Self
    }

    /// First trigger strictly after `from`.
    pub fn compute_next_run(
        &self,
        expression: &str,
        from: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, CronError> {
        let cron = parse(expression)?;
        cron.find_next_occurrence(&from, false)
            .map_err(|err| invalid(expression, err))
    }

    pub fn is_valid(&self, expression: &str) -> bool {
        parse(expression).is_ok()
    }
}

pub fn compute_next_run(expression: &str, from: DateTime<Utc>) -> Result<DateTime<Utc>, CronError> {
    CronCalculator.compute_next_run(expression, from)
}

pub fn is_valid_cron_expression(expression: &str) -> bool {
    CronCalculator.is_valid(expression)
}

fn parse(expression: &str) -> Result<Cron, CronError> {
    let trimmed = expression.trim();
    if trimmed.is_empty() {
        return Err(CronError::InvalidExpression {
            expression: expression.to_string(),
            reason: "expression is empty".into(),
        });
    }
    Cron::new(trimmed)
        .with_seconds_optional()
        .parse()
        .map_err(|err| invalid(expression, err))
}

fn invalid(expression: &str, err: impl std::fmt::Display) -> CronError {
    CronError::InvalidExpression {
        expression: expression.to_string(),
        reason: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use rstest::rstest;

    use super::*;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[rstest]
    #[case("0 2 * * *", utc(2024, 1, 1, 10, 0, 0), utc(2024, 1, 2, 2, 0, 0))]
    #[case("*/15 * * * *", utc(2024, 1, 1, 10, 7, 0), utc(2024, 1, 1, 10, 15, 0))]
    #[case("0 0 1 * *", utc(2024, 1, 15, 0, 0, 0), utc(2024, 2, 1, 0, 0, 0))]
    #[case("30 9 * * 1", utc(2024, 1, 1, 9, 30, 0), utc(2024, 1, 8, 9, 30, 0))]
    #[case("*/10 * * * * *", utc(2024, 1, 1, 0, 0, 5), utc(2024, 1, 1, 0, 0, 10))]
    fn next_run_matches_expected(
        #[case] expression: &str,
        #[case] from: DateTime<Utc>,
        #[case] expected: DateTime<Utc>,
    ) {
        let next = compute_next_run(expression, from).unwrap();
        assert_eq!(next, expected);
    }

    #[rstest]
    #[case("* * * * *")]
    #[case("0 2 * * *")]
    #[case("0 0 1 1 *")]
    #[case("0 */5 * * * *")]
    fn next_run_is_strictly_later_and_repeatable(#[case] expression: &str) {
        let calculator = CronCalculator::new();
        let from = utc(2024, 2, 29, 0, 0, 0);

        let first = calculator.compute_next_run(expression, from).unwrap();
        let second = calculator.compute_next_run(expression, from).unwrap();

        assert!(first > from);
        assert_eq!(first, second);
    }

    #[test]
    fn trigger_instant_itself_is_excluded() {
        let at_trigger = utc(2024, 1, 2, 2, 0, 0);
        let next = compute_next_run("0 2 * * *", at_trigger).unwrap();
        assert_eq!(next, utc(2024, 1, 3, 2, 0, 0));
    }

    #[rstest]
    #[case("invalid")]
    #[case("")]
    #[case("61 * * * *")]
    #[case("* * * *")]
    fn invalid_expressions_are_rejected(#[case] expression: &str) {
        assert!(!is_valid_cron_expression(expression));
        let err = compute_next_run(expression, Utc::now()).unwrap_err();
        assert!(matches!(err, CronError::InvalidExpression { .. }));
    }
}
