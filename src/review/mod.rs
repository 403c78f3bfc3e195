mod anchor;
mod generate;
mod prompt;
mod schema;

pub use anchor::{
    anchor_findings, degraded, AnchorOutcome, AnchoredFinding, AnchoringMethod, AnchoringStats,
};
pub use generate::{GenerationResult, ReviewGenerator};
pub use prompt::{build_prompt, system_prompt};
pub use schema::{
    extract_json, normalize, validate, Evidence, Finding, ReviewOutput, HIGH_CONFIDENCE_THRESHOLD,
    MAX_FINDINGS_SCHEMA,
};
