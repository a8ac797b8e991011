//! DDL text generation and the compatibility rewrite pass (spec §4.4).

use crate::config::DumpOptions;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueStatus {
    Fixed,
    FixManually,
    NeedsCompatibilityOption,
}

#[derive(Debug, Clone)]
pub struct Issue {
    pub description: String,
    pub status: IssueStatus,
}

/// A schema/table/view's DDL, drop-guarded and ready to write verbatim to
/// its canonical per-object file.
pub struct DdlText {
    pub buffer: String,
    pub issues: Vec<Issue>,
}

/// Wrap a `CREATE ...` statement with a drop-if-exists guard, matching the
/// shape the server itself reproduces via `SHOW CREATE`.
pub fn frame_create(object_kind: &str, qualified_name: &str, create_stmt: &str) -> String {
    format!(
        "DROP {} IF EXISTS {};\n{};\n",
        object_kind,
        qualified_name,
        create_stmt.trim_end_matches(';')
    )
}

pub fn dump_table_ddl(schema: &str, table: &str, create_stmt: &str, options: &DumpOptions) -> DdlText {
    let qualified = format!("`{}`.`{}`", schema, table);
    let mut buffer = frame_create("TABLE", &qualified, create_stmt);
    let issues = apply_compatibility(&mut buffer, options);
    DdlText { buffer, issues }
}

pub fn dump_view_ddl(schema: &str, view: &str, create_stmt: &str, options: &DumpOptions) -> DdlText {
    let qualified = format!("`{}`.`{}`", schema, view);
    let mut buffer = frame_create("VIEW", &qualified, create_stmt);
    let issues = apply_compatibility(&mut buffer, options);
    DdlText { buffer, issues }
}

pub fn dump_schema_ddl(schema: &str, create_stmt: &str, options: &DumpOptions) -> DdlText {
    let qualified = format!("`{}`", schema);
    let mut buffer = frame_create("DATABASE", &qualified, create_stmt);
    let issues = apply_compatibility(&mut buffer, options);
    DdlText { buffer, issues }
}

/// Scan cached DDL text for compatibility issues without rewriting it, for
/// the VALIDATED-state pass that must run before DUMPING (spec §4.8 step 5,
/// §7 "CompatibilityError: fail before DUMPING"). Operates on a throwaway
/// clone since only the issues matter here, not the rewritten text.
pub fn check_compatibility(ddl: &str, options: &DumpOptions) -> Vec<Issue> {
    let mut buffer = ddl.to_string();
    apply_compatibility(&mut buffer, options)
}

/// Apply configured rewrites (spec §4.4): strip `DEFINER=...` clauses. Each
/// rewrite performed is recorded as an `Issue`; when
/// `options.compatibility_target` is unset, a rewrite that would otherwise
/// be needed is instead reported as `NeedsCompatibilityOption` and the
/// buffer is left untouched, so callers can surface it as an error before
/// data dumping begins.
fn apply_compatibility(buffer: &mut String, options: &DumpOptions) -> Vec<Issue> {
    let mut issues = Vec::new();

    if buffer.contains("DEFINER=") {
        if options.compatibility_target.is_some() {
            let re = regex::Regex::new(r"DEFINER=`[^`]*`@`[^`]*`\s*").unwrap();
            *buffer = re.replace_all(buffer, "").into_owned();
            issues.push(Issue {
                description: "removed DEFINER clause".into(),
                status: IssueStatus::Fixed,
            });
        } else {
            issues.push(Issue {
                description: "fix this with 'strip_definers'".into(),
                status: IssueStatus::NeedsCompatibilityOption,
            });
        }
    }

    issues
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn frames_drop_if_exists_before_create() {
        let out = frame_create("TABLE", "`s`.`t`", "CREATE TABLE `t` (id INT)");
        assert!(out.starts_with("DROP TABLE IF EXISTS `s`.`t`;\n"));
        assert!(out.contains("CREATE TABLE `t` (id INT);"));
    }

    #[test]
    fn definer_without_target_is_reported_not_fixed() {
        let options = DumpOptions::default();
        let result = dump_view_ddl(
            "s",
            "v",
            "CREATE DEFINER=`root`@`localhost` VIEW `v` AS SELECT 1",
            &options,
        );
        assert!(result.buffer.contains("DEFINER="));
        assert_eq!(result.issues.len(), 1);
        assert_eq!(result.issues[0].status, IssueStatus::NeedsCompatibilityOption);
    }

    #[test]
    fn definer_with_target_is_stripped_and_fixed() {
        let mut options = DumpOptions::default();
        options.compatibility_target = Some("8.0.34".into());
        let result = dump_view_ddl(
            "s",
            "v",
            "CREATE DEFINER=`root`@`localhost` VIEW `v` AS SELECT 1",
            &options,
        );
        assert!(!result.buffer.contains("DEFINER="));
        assert_eq!(result.issues[0].status, IssueStatus::Fixed);
    }
}
