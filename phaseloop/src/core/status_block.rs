//! Status block wire format exchanged with the provider every turn.
//!
//! The block sits between two literal marker lines and holds `KEY: value`
//! lines. Keys are case-insensitive and split on the first colon. Enumerated
//! fields must match their vocabulary exactly; counters that fail to parse
//! degrade to zero.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Execution status the provider declares for the turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    InProgress,
    Complete,
    Blocked,
}

/// Test outcome the provider observed during the turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TestsStatus {
    Passing,
    Failing,
    NotRun,
}

/// Kind of work the turn spent its effort on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkType {
    Implementation,
    Testing,
    Documentation,
    Refactoring,
}

impl ExecutionStatus {
    const ALL: [Self; 3] = [Self::InProgress, Self::Complete, Self::Blocked];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::InProgress => "IN_PROGRESS",
            Self::Complete => "COMPLETE",
            Self::Blocked => "BLOCKED",
        }
    }
}

impl TestsStatus {
    const ALL: [Self; 3] = [Self::Passing, Self::Failing, Self::NotRun];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Passing => "PASSING",
            Self::Failing => "FAILING",
            Self::NotRun => "NOT_RUN",
        }
    }
}

impl WorkType {
    const ALL: [Self; 4] = [
        Self::Implementation,
        Self::Testing,
        Self::Documentation,
        Self::Refactoring,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Implementation => "IMPLEMENTATION",
            Self::Testing => "TESTING",
            Self::Documentation => "DOCUMENTATION",
            Self::Refactoring => "REFACTORING",
        }
    }
}

/// Extra detail the provider supplies when it reports `BLOCKED`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockedDetails {
    pub reason: Option<String>,
    pub resources: Vec<String>,
    pub resolution: Option<String>,
}

/// One turn's parsed status report.
///
/// `blocked` is `Some` exactly when `status` is [`ExecutionStatus::Blocked`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusBlock {
    pub status: ExecutionStatus,
    pub tasks_completed: u32,
    pub files_modified: u32,
    pub tests_status: TestsStatus,
    pub work_type: WorkType,
    pub exit_signal: bool,
    pub recommendation: String,
    pub blocked: Option<BlockedDetails>,
}

impl StatusBlock {
    /// True when the turn neither completed a task nor touched a file.
    pub fn made_no_progress(&self) -> bool {
        self.tasks_completed == 0 && self.files_modified == 0
    }

    /// One-line summary for logs and iteration metadata.
    pub fn summary(&self) -> String {
        format!(
            "{} tasks={} files={} tests={} work={} exit={}",
            self.status.as_str(),
            self.tasks_completed,
            self.files_modified,
            self.tests_status.as_str(),
            self.work_type.as_str(),
            self.exit_signal
        )
    }
}

const REQUIRED_FIELDS: [&str; 7] = [
    "status",
    "tasks_completed_this_loop",
    "files_modified",
    "tests_status",
    "work_type",
    "exit_signal",
    "recommendation",
];

/// Encoder/decoder bound to one pair of marker lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusCodec {
    start: String,
    end: String,
}

impl StatusCodec {
    /// Build a codec for `---<NAME>_STATUS---` / `---END_<NAME>_STATUS---`.
    pub fn new(marker_name: &str) -> Self {
        let name = marker_name.trim().to_ascii_uppercase();
        Self {
            start: format!("---{name}_STATUS---"),
            end: format!("---END_{name}_STATUS---"),
        }
    }

    pub fn start_marker(&self) -> &str {
        &self.start
    }

    pub fn end_marker(&self) -> &str {
        &self.end
    }

    /// Return the text between the first start marker and the end marker after it.
    pub fn extract<'a>(&self, text: &'a str) -> Result<&'a str, ProtocolError> {
        let start = text
            .find(&self.start)
            .ok_or_else(|| ProtocolError::MissingStartMarker {
                marker: self.start.clone(),
            })?;
        let body_start = start + self.start.len();
        let body_len =
            text[body_start..]
                .find(&self.end)
                .ok_or_else(|| ProtocolError::MissingEndMarker {
                    marker: self.end.clone(),
                })?;
        Ok(&text[body_start..body_start + body_len])
    }

    /// Extract and parse the status block from raw provider output.
    pub fn parse(&self, text: &str) -> Result<StatusBlock, ProtocolError> {
        parse_fields(self.extract(text)?)
    }

    /// Encode `block` in the wire format, markers included.
    pub fn render(&self, block: &StatusBlock) -> String {
        let mut out = String::new();
        out.push_str(&self.start);
        out.push('\n');
        push_field(&mut out, "STATUS", block.status.as_str());
        push_field(
            &mut out,
            "TASKS_COMPLETED_THIS_LOOP",
            &block.tasks_completed.to_string(),
        );
        push_field(&mut out, "FILES_MODIFIED", &block.files_modified.to_string());
        push_field(&mut out, "TESTS_STATUS", block.tests_status.as_str());
        push_field(&mut out, "WORK_TYPE", block.work_type.as_str());
        push_field(
            &mut out,
            "EXIT_SIGNAL",
            if block.exit_signal { "true" } else { "false" },
        );
        push_field(&mut out, "RECOMMENDATION", &block.recommendation);
        if let Some(blocked) = &block.blocked {
            if let Some(reason) = &blocked.reason {
                push_field(&mut out, "BLOCKED_REASON", reason);
            }
            if !blocked.resources.is_empty() {
                push_field(&mut out, "BLOCKED_RESOURCES", &blocked.resources.join(", "));
            }
            if let Some(resolution) = &blocked.resolution {
                push_field(&mut out, "BLOCKED_RESOLUTION", resolution);
            }
        }
        out.push_str(&self.end);
        out.push('\n');
        out
    }
}

fn push_field(out: &mut String, key: &str, value: &str) {
    out.push_str(key);
    out.push_str(": ");
    out.push_str(value);
    out.push('\n');
}

fn parse_fields(body: &str) -> Result<StatusBlock, ProtocolError> {
    let mut fields: BTreeMap<String, String> = BTreeMap::new();
    for line in body.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim().to_ascii_lowercase();
        if key.is_empty() {
            continue;
        }
        fields.insert(key, value.trim().to_string());
    }

    let missing: Vec<String> = REQUIRED_FIELDS
        .iter()
        .filter(|key| !fields.contains_key(**key))
        .map(|key| key.to_string())
        .collect();
    if !missing.is_empty() {
        return Err(ProtocolError::MissingFields { fields: missing });
    }

    let field = |key: &str| fields.get(key).map(String::as_str).unwrap_or_default();

    let status = parse_enum("status", field("status"), &ExecutionStatus::ALL, |v| {
        v.as_str()
    })?;
    let tests_status = parse_enum("tests_status", field("tests_status"), &TestsStatus::ALL, |v| {
        v.as_str()
    })?;
    let work_type = parse_enum("work_type", field("work_type"), &WorkType::ALL, |v| {
        v.as_str()
    })?;

    let blocked = (status == ExecutionStatus::Blocked).then(|| BlockedDetails {
        reason: non_empty(field("blocked_reason")),
        resources: field("blocked_resources")
            .split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(str::to_string)
            .collect(),
        resolution: non_empty(field("blocked_resolution")),
    });

    Ok(StatusBlock {
        status,
        tasks_completed: parse_count(field("tasks_completed_this_loop")),
        files_modified: parse_count(field("files_modified")),
        tests_status,
        work_type,
        exit_signal: parse_flag(field("exit_signal")),
        recommendation: field("recommendation").to_string(),
        blocked,
    })
}

fn parse_enum<T: Copy>(
    field: &'static str,
    raw: &str,
    variants: &[T],
    label: impl Fn(T) -> &'static str,
) -> Result<T, ProtocolError> {
    variants
        .iter()
        .copied()
        .find(|variant| label(*variant) == raw)
        .ok_or_else(|| ProtocolError::InvalidValue {
            field,
            value: raw.to_string(),
            expected: variants
                .iter()
                .map(|variant| label(*variant))
                .collect::<Vec<_>>()
                .join("|"),
        })
}

/// Counters tolerate formatting noise: anything unparseable counts as zero.
fn parse_count(raw: &str) -> u32 {
    raw.parse().unwrap_or(0)
}

fn parse_flag(raw: &str) -> bool {
    matches!(raw.to_ascii_lowercase().as_str(), "true" | "1" | "yes")
}

fn non_empty(raw: &str) -> Option<String> {
    (!raw.is_empty()).then(|| raw.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> StatusCodec {
        StatusCodec::new("PHASELOOP")
    }

    fn wrap(body: &str) -> String {
        format!(
            "Some narration first.\n---PHASELOOP_STATUS---\n{body}\n---END_PHASELOOP_STATUS---\ntrailing"
        )
    }

    const VALID_BODY: &str = "STATUS: IN_PROGRESS
TASKS_COMPLETED_THIS_LOOP: 2
FILES_MODIFIED: 5
TESTS_STATUS: PASSING
WORK_TYPE: IMPLEMENTATION
EXIT_SIGNAL: false
RECOMMENDATION: Continue with the parser task";

    #[test]
    fn parses_a_complete_block() {
        let block = codec().parse(&wrap(VALID_BODY)).expect("parse");
        assert_eq!(block.status, ExecutionStatus::InProgress);
        assert_eq!(block.tasks_completed, 2);
        assert_eq!(block.files_modified, 5);
        assert_eq!(block.tests_status, TestsStatus::Passing);
        assert_eq!(block.work_type, WorkType::Implementation);
        assert!(!block.exit_signal);
        assert_eq!(block.recommendation, "Continue with the parser task");
        assert_eq!(block.blocked, None);
    }

    #[test]
    fn keys_are_case_insensitive_and_split_on_first_colon() {
        let body = VALID_BODY.replace(
            "RECOMMENDATION: Continue with the parser task",
            "recommendation: see src/lib.rs:42: fix it",
        );
        let body = body.replace("STATUS: IN_PROGRESS", "Status: IN_PROGRESS");
        let block = codec().parse(&wrap(&body)).expect("parse");
        assert_eq!(block.recommendation, "see src/lib.rs:42: fix it");
        assert_eq!(block.status, ExecutionStatus::InProgress);
    }

    #[test]
    fn missing_start_marker_is_an_error() {
        let err = codec().parse(VALID_BODY).unwrap_err();
        assert!(matches!(err, ProtocolError::MissingStartMarker { .. }));
    }

    #[test]
    fn missing_end_marker_is_an_error() {
        let text = format!("---PHASELOOP_STATUS---\n{VALID_BODY}\n");
        let err = codec().parse(&text).unwrap_err();
        assert!(matches!(err, ProtocolError::MissingEndMarker { .. }));
    }

    #[test]
    fn other_marker_names_are_not_recognised() {
        let text = wrap(VALID_BODY).replace("PHASELOOP", "OTHER");
        let err = codec().parse(&text).unwrap_err();
        assert!(matches!(err, ProtocolError::MissingStartMarker { .. }));
    }

    #[test]
    fn missing_fields_are_all_named() {
        let body = "STATUS: COMPLETE\nTASKS_COMPLETED_THIS_LOOP: 1\nFILES_MODIFIED: 1";
        let err = codec().parse(&wrap(body)).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::MissingFields {
                fields: vec![
                    "tests_status".to_string(),
                    "work_type".to_string(),
                    "exit_signal".to_string(),
                    "recommendation".to_string(),
                ]
            }
        );
    }

    #[test]
    fn invalid_enum_values_are_rejected() {
        for (from, to, field) in [
            ("STATUS: IN_PROGRESS", "STATUS: WORKING", "status"),
            ("TESTS_STATUS: PASSING", "TESTS_STATUS: GREEN", "tests_status"),
            ("WORK_TYPE: IMPLEMENTATION", "WORK_TYPE: CODING", "work_type"),
        ] {
            let body = VALID_BODY.replace(from, to);
            match codec().parse(&wrap(&body)) {
                Err(ProtocolError::InvalidValue { field: got, .. }) => assert_eq!(got, field),
                other => panic!("expected invalid {field}, got {other:?}"),
            }
        }
    }

    #[test]
    fn malformed_counters_default_to_zero() {
        let body = VALID_BODY
            .replace("TASKS_COMPLETED_THIS_LOOP: 2", "TASKS_COMPLETED_THIS_LOOP: two")
            .replace("FILES_MODIFIED: 5", "FILES_MODIFIED: 5 files");
        let block = codec().parse(&wrap(&body)).expect("parse");
        assert_eq!(block.tasks_completed, 0);
        assert_eq!(block.files_modified, 0);
    }

    #[test]
    fn exit_signal_accepts_true_one_and_yes() {
        for (raw, expected) in [
            ("true", true),
            ("TRUE", true),
            ("1", true),
            ("Yes", true),
            ("false", false),
            ("no", false),
            ("maybe", false),
        ] {
            let body = VALID_BODY.replace("EXIT_SIGNAL: false", &format!("EXIT_SIGNAL: {raw}"));
            let block = codec().parse(&wrap(&body)).expect("parse");
            assert_eq!(block.exit_signal, expected, "raw={raw}");
        }
    }

    #[test]
    fn blocked_details_are_parsed_only_when_blocked() {
        let body = VALID_BODY.replace("STATUS: IN_PROGRESS", "STATUS: BLOCKED")
            + "\nBLOCKED_REASON: missing credentials\nBLOCKED_RESOURCES: API key, staging db ,\nBLOCKED_RESOLUTION: export API_KEY";
        let block = codec().parse(&wrap(&body)).expect("parse");
        assert_eq!(
            block.blocked,
            Some(BlockedDetails {
                reason: Some("missing credentials".to_string()),
                resources: vec!["API key".to_string(), "staging db".to_string()],
                resolution: Some("export API_KEY".to_string()),
            })
        );

        let not_blocked = VALID_BODY.to_string() + "\nBLOCKED_REASON: stale field";
        let block = codec().parse(&wrap(&not_blocked)).expect("parse");
        assert_eq!(block.blocked, None);
    }

    #[test]
    fn rendered_blocks_parse_back_to_the_same_value() {
        let blocks = [
            StatusBlock {
                status: ExecutionStatus::Complete,
                tasks_completed: 3,
                files_modified: 7,
                tests_status: TestsStatus::NotRun,
                work_type: WorkType::Refactoring,
                exit_signal: true,
                recommendation: "Move to review".to_string(),
                blocked: None,
            },
            StatusBlock {
                status: ExecutionStatus::Blocked,
                tasks_completed: 0,
                files_modified: 0,
                tests_status: TestsStatus::Failing,
                work_type: WorkType::Testing,
                exit_signal: false,
                recommendation: "Need database access".to_string(),
                blocked: Some(BlockedDetails {
                    reason: Some("postgres unreachable".to_string()),
                    resources: vec!["DATABASE_URL".to_string()],
                    resolution: None,
                }),
            },
        ];
        for block in blocks {
            let rendered = codec().render(&block);
            assert_eq!(codec().parse(&rendered).expect("parse"), block);
        }
    }

    #[test]
    fn marker_name_is_normalised_to_upper_case() {
        let codec = StatusCodec::new("phaseloop");
        assert_eq!(codec.start_marker(), "---PHASELOOP_STATUS---");
        assert_eq!(codec.end_marker(), "---END_PHASELOOP_STATUS---");
    }
}
