//! Cron-strategy to next-run-time, per spec's fixed mapping:
//! daily → `0 0 * * *`, weekly → `0 0 * * 0`, monthly → `0 0 1 * *`, custom →
//! the user's own 5-field expression. `type=sync` configs don't run on a
//! schedule at all — their `next-run-time` is a year-9999 sentinel instead.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;
use notesync_types::{BackupConfig, BackupType, CronStrategy, sync_next_run_sentinel};

use crate::error::{NoteSyncError, Result};

/// Computes the next run time for `config`, anchored at `after` (normally
/// the run's start time).
pub fn next_run_time(config: &BackupConfig, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
    if config.backup_type == BackupType::Sync {
        return Ok(sync_next_run_sentinel());
    }

    let expr = match config.cron_strategy {
        CronStrategy::Custom => config
            .cron_expression
            .clone()
            .ok_or_else(|| NoteSyncError::InvalidInput("custom cron strategy requires cron_expression".to_string()))?,
        other => other
            .fixed_expression()
            .expect("non-custom cron strategies always carry a fixed expression")
            .to_string(),
    };

    next_occurrence(&expr, after)
}

/// Parses a 5-field unix-style cron expression (minute, hour, day-of-month,
/// month, day-of-week) and returns the next occurrence strictly after
/// `after`. The `cron` crate expects a leading seconds field, so one fixed
/// at `0` is prepended.
fn next_occurrence(unix_expr: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let with_seconds = format!("0 {}", unix_expr.trim());
    let schedule = Schedule::from_str(&with_seconds)
        .map_err(|e| NoteSyncError::InvalidInput(format!("invalid cron expression {unix_expr:?}: {e}")))?;
    schedule
        .after(&after)
        .next()
        .ok_or_else(|| NoteSyncError::InvalidInput(format!("cron expression {unix_expr:?} has no future occurrence")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use notesync_types::{BackupConfig, RetentionDays};

    fn config(backup_type: BackupType, strategy: CronStrategy, expression: Option<String>) -> BackupConfig {
        BackupConfig {
            id: 1,
            owner: 1,
            vault_id: 1,
            backup_type,
            storage_ids: vec![1],
            cron_strategy: strategy,
            cron_expression: expression,
            retention_days: RetentionDays(0),
            is_enabled: true,
            last_run_time: None,
            next_run_time: Utc::now(),
            last_status: None,
            last_message: String::new(),
        }
    }

    #[test]
    fn sync_type_gets_sentinel_regardless_of_strategy() {
        let cfg = config(BackupType::Sync, CronStrategy::Daily, None);
        let next = next_run_time(&cfg, Utc::now()).unwrap();
        assert_eq!(next, sync_next_run_sentinel());
    }

    #[test]
    fn daily_runs_at_midnight() {
        let cfg = config(BackupType::Full, CronStrategy::Daily, None);
        let after = Utc.with_ymd_and_hms(2024, 3, 10, 15, 0, 0).unwrap();
        let next = next_run_time(&cfg, after).unwrap();
        assert_eq!(next.format("%H:%M:%S").to_string(), "00:00:00");
        assert!(next > after);
    }

    #[test]
    fn weekly_runs_on_sunday() {
        let cfg = config(BackupType::Incremental, CronStrategy::Weekly, None);
        let after = Utc.with_ymd_and_hms(2024, 3, 10, 0, 0, 0).unwrap();
        let next = next_run_time(&cfg, after).unwrap();
        use chrono::Datelike;
        assert_eq!(next.weekday(), chrono::Weekday::Sun);
    }

    #[test]
    fn monthly_runs_on_the_first() {
        let cfg = config(BackupType::Full, CronStrategy::Monthly, None);
        let after = Utc.with_ymd_and_hms(2024, 3, 10, 0, 0, 0).unwrap();
        let next = next_run_time(&cfg, after).unwrap();
        use chrono::Datelike;
        assert_eq!(next.day(), 1);
    }

    #[test]
    fn custom_expression_is_used_verbatim() {
        let cfg = config(BackupType::Full, CronStrategy::Custom, Some("30 4 * * *".to_string()));
        let after = Utc.with_ymd_and_hms(2024, 3, 10, 0, 0, 0).unwrap();
        let next = next_run_time(&cfg, after).unwrap();
        assert_eq!(next.format("%H:%M").to_string(), "04:30");
    }

    #[test]
    fn custom_without_expression_is_invalid_input() {
        let cfg = config(BackupType::Full, CronStrategy::Custom, None);
        assert!(next_run_time(&cfg, Utc::now()).is_err());
    }
}
