// Migrator output classification.
//
// The migrator only reports its state as human-readable text. Two lines of that text are the
// wire contract with this installer and are matched exactly:
//
//   plan mode:  "Found <N> new migration"   (followed by "s to be applied:" etc.)
//   apply mode: "Migrated up successfully."
//
// Anything else is not interpreted. Changing either pattern breaks compatibility with the
// migrator; the tests below pin both.

use regex::Regex;
use serde::Serialize;
use std::sync::OnceLock;

/// Regular expression recognised in plan-mode output.
pub const PLAN_PATTERN: &str = r"Found ([0-9]+) new migration";

/// Literal marker recognised in apply-mode output.
pub const APPLY_SUCCESS_MARKER: &str = "Migrated up successfully.";

fn plan_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(PLAN_PATTERN).expect("static plan pattern is valid"))
}

/// A fact extracted from one migrator report. Recomputed on every probe, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum MigrationFact {
    /// Plan mode reported this many outstanding migrations.
    PendingCount { count: u32 },
    /// Apply mode finished; `success` is whether the success marker was present.
    Applied { success: bool },
    /// Plan output did not contain the expected phrase.
    Unrecognized,
}

/// Classify plan-mode output. Only the first occurrence counts; a count too large for `u32`
/// saturates.
pub fn classify_plan(output: &str) -> MigrationFact {
    plan_regex()
        .captures(output)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().parse::<u32>().unwrap_or(u32::MAX))
        .map(|count| MigrationFact::PendingCount { count })
        .unwrap_or(MigrationFact::Unrecognized)
}

/// Classify apply-mode output. Partial success and no-op runs are failures.
pub fn classify_apply(output: &str) -> MigrationFact {
    MigrationFact::Applied {
        success: output.contains(APPLY_SUCCESS_MARKER),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_pattern_is_pinned() {
        assert_eq!(PLAN_PATTERN, r"Found ([0-9]+) new migration");
        assert_eq!(APPLY_SUCCESS_MARKER, "Migrated up successfully.");
    }

    #[test]
    fn plan_output_with_count() {
        assert_eq!(
            classify_plan("Found 3 new migrations to apply"),
            MigrationFact::PendingCount { count: 3 }
        );
    }

    #[test]
    fn plan_output_singular_and_multiline() {
        let output = "Yii Migration Tool (based on Yii v2)\n\nFound 1 new migration to be applied:\n\tm150101_000000_init\n";
        assert_eq!(classify_plan(output), MigrationFact::PendingCount { count: 1 });
    }

    #[test]
    fn plan_output_zero() {
        assert_eq!(
            classify_plan("Found 0 new migrations"),
            MigrationFact::PendingCount { count: 0 }
        );
    }

    #[test]
    fn plan_output_without_phrase_is_unrecognized() {
        assert_eq!(
            classify_plan("No new migrations found. Your system is up-to-date."),
            MigrationFact::Unrecognized
        );
        assert_eq!(classify_plan(""), MigrationFact::Unrecognized);
    }

    #[test]
    fn plan_pattern_is_case_sensitive() {
        assert_eq!(
            classify_plan("found 4 new migrations"),
            MigrationFact::Unrecognized
        );
    }

    #[test]
    fn plan_count_overflow_saturates() {
        assert_eq!(
            classify_plan("Found 4294967296 new migrations to be applied:"),
            MigrationFact::PendingCount { count: u32::MAX }
        );
        assert_eq!(
            classify_plan("Found 007 new migrations"),
            MigrationFact::PendingCount { count: 7 }
        );
    }

    #[test]
    fn apply_requires_exact_marker() {
        assert_eq!(
            classify_apply("*** applied m1\n\n2 migrations were applied.\n\nMigrated up successfully.\n"),
            MigrationFact::Applied { success: true }
        );
        assert_eq!(
            classify_apply("*** failed to apply m2 (time: 0.012s)\n\n1 from 2 migrations were applied.\n\nMigration failed. The rest of the migrations are canceled.\n"),
            MigrationFact::Applied { success: false }
        );
        assert_eq!(
            classify_apply("No new migrations found. Your system is up-to-date."),
            MigrationFact::Applied { success: false }
        );
        assert_eq!(
            classify_apply("Migrated up successfully"),
            MigrationFact::Applied { success: false }
        );
    }
}
