#![allow(dead_code)]

use uuid::Uuid;

use loupe::diff::{parse_patch, FilePatch};
use loupe::types::{ChangeType, ReviewRequest};

/// The single-file sample from the code-host API shape.
pub const SAMPLE_PATCH: &str = "@@ -1,3 +1,6 @@\n def test():\n-    return False\n+    # Updated\n+    result = calculate()\n+    return result";

pub fn sample_request() -> ReviewRequest {
    ReviewRequest {
        installation_id: 12345,
        repo_id: Uuid::new_v4(),
        github_repo_id: 987654321,
        github_repo_name: "octo/widgets".to_string(),
        pr_number: 123,
        head_sha: "a".repeat(40),
        base_sha: "b".repeat(40),
    }
}

pub fn sample_file_patch() -> FilePatch {
    FilePatch {
        file_path: "src/test.py".to_string(),
        change_type: ChangeType::Modified,
        previous_path: None,
        additions: 3,
        deletions: 1,
        changes: 4,
        hunks: parse_patch("src/test.py", SAMPLE_PATCH).unwrap(),
        is_binary: false,
    }
}

pub fn binary_file_patch(path: &str) -> FilePatch {
    FilePatch {
        file_path: path.to_string(),
        change_type: ChangeType::Modified,
        previous_path: None,
        additions: 0,
        deletions: 0,
        changes: 0,
        hunks: vec![],
        is_binary: true,
    }
}

/// A well-formed LLM finding as raw JSON, with overridable id.
pub fn raw_finding(id: &str, file_path: &str) -> serde_json::Value {
    serde_json::json!({
        "finding_id": id,
        "severity": "high",
        "category": "bug",
        "title": "Result silently replaces the error branch",
        "message": "The rewritten body drops the False return without handling the caller's expectation.",
        "suggested_fix": "Keep an explicit failure path or document the new contract at the call sites.",
        "file_path": file_path,
        "confidence": 0.85
    })
}
