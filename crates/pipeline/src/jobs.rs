//! Job-type resolution: from `(JobType, JobParams)` to an ordered step list.
//!
//! Resolution is a pure function of its inputs; no ambient state is consulted.
//! Parameters are validated here, once, at submission time, into per-job
//! structs; step execution never looks back into the raw parameter map.
//!
//! The built-in job types are deliberately plain pipeline shapes over POSIX
//! tools. What a deployment actually runs in each slot is its own business;
//! the orchestrator only cares about ordering, isolation and artifacts.

use conveyor_core::{Error, JobParams, JobType, Result};

use crate::step::{DeclaredOutput, OutputLocation, StepDef};

/// Parameter names may appear in artifact names and shell environments, so
/// they are held to a conservative character set.
fn validate_token(job_type: JobType, key: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::validation(
            job_type.to_string(),
            format!("parameter '{key}' must not be empty"),
        ));
    }
    if value.len() > 64 {
        return Err(Error::validation(
            job_type.to_string(),
            format!("parameter '{key}' exceeds 64 characters"),
        ));
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(Error::validation(
            job_type.to_string(),
            format!("parameter '{key}' may only contain [A-Za-z0-9_-]"),
        ));
    }
    Ok(())
}

/// `convert`: ingest one text payload, transform it, package the result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvertParams {
    pub text: String,
    pub name: String,
}

impl ConvertParams {
    pub fn from_params(params: &JobParams) -> Result<Self> {
        let text = params.require(JobType::Convert, "text")?.to_string();
        if text.is_empty() {
            return Err(Error::validation("convert", "parameter 'text' must not be empty"));
        }
        if text.len() > 1024 * 1024 {
            return Err(Error::validation("convert", "parameter 'text' exceeds 1 MiB"));
        }
        let name = params.get("name").unwrap_or("converted").to_string();
        validate_token(JobType::Convert, "name", &name)?;
        Ok(Self { text, name })
    }
}

/// `report`: scan the workspace, render a markdown report, summarize it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportParams {
    pub title: String,
}

impl ReportParams {
    pub fn from_params(params: &JobParams) -> Result<Self> {
        let title = params.require(JobType::Report, "title")?.to_string();
        validate_token(JobType::Report, "title", &title)?;
        Ok(Self { title })
    }
}

/// `bundle`: stage a labelled payload and produce a verified tar archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleParams {
    pub label: String,
}

impl BundleParams {
    pub fn from_params(params: &JobParams) -> Result<Self> {
        let label = params.require(JobType::Bundle, "label")?.to_string();
        validate_token(JobType::Bundle, "label", &label)?;
        Ok(Self { label })
    }
}

/// Validate parameters for a job type without building the pipeline.
/// The manager calls this before admission.
pub fn validate_params(job_type: JobType, params: &JobParams) -> Result<()> {
    match job_type {
        JobType::Convert => ConvertParams::from_params(params).map(|_| ()),
        JobType::Report => ReportParams::from_params(params).map(|_| ()),
        JobType::Bundle => BundleParams::from_params(params).map(|_| ()),
    }
}

/// Resolve the fixed, ordered step list for a job.
pub fn resolve_pipeline(job_type: JobType, params: &JobParams) -> Result<Vec<StepDef>> {
    match job_type {
        JobType::Convert => Ok(convert_pipeline(&ConvertParams::from_params(params)?)),
        JobType::Report => Ok(report_pipeline(&ReportParams::from_params(params)?)),
        JobType::Bundle => Ok(bundle_pipeline(&BundleParams::from_params(params)?)),
    }
}

fn convert_pipeline(params: &ConvertParams) -> Vec<StepDef> {
    let packaged = format!("output/{}.txt", params.name);
    vec![
        StepDef::shell("ingest", r#"printf '%s' "$CONVEYOR_TEXT" > input/source.txt"#)
            .with_env("CONVEYOR_TEXT", &params.text),
        StepDef::shell(
            "transform",
            "tr 'a-z' 'A-Z' < input/source.txt > temp/transformed.txt",
        ),
        StepDef::shell("package", format!("cp temp/transformed.txt {packaged}"))
            .with_output(DeclaredOutput::required(
                format!("{}.txt", params.name),
                OutputLocation::Workspace(packaged.into()),
            )),
    ]
}

fn report_pipeline(params: &ReportParams) -> Vec<StepDef> {
    vec![
        StepDef::shell("scan", "find . -type d | sort > temp/scan.txt"),
        StepDef::shell(
            "render",
            r#"{ printf '# %s\n\n' "$CONVEYOR_TITLE"; cat temp/scan.txt; } > output/report.md"#,
        )
        .with_env("CONVEYOR_TITLE", &params.title)
        .with_output(DeclaredOutput::required(
            "report.md",
            OutputLocation::Workspace("output/report.md".into()),
        )),
        // Summary is best-effort: a missing wc must not sink the report itself
        StepDef::shell("summarize", "wc -l < output/report.md > output/summary.txt")
            .best_effort()
            .with_output(DeclaredOutput::optional(
                "summary.txt",
                OutputLocation::Workspace("output/summary.txt".into()),
            )),
    ]
}

fn bundle_pipeline(params: &BundleParams) -> Vec<StepDef> {
    vec![
        StepDef::shell(
            "stage",
            r#"mkdir -p temp/stage && printf '%s\n' "$CONVEYOR_LABEL" > temp/stage/label.txt"#,
        )
        .with_env("CONVEYOR_LABEL", &params.label),
        StepDef::shell("archive", "tar -C temp -czf output/bundle.tgz stage")
            .with_output(DeclaredOutput::required(
                "bundle.tgz",
                OutputLocation::Workspace("output/bundle.tgz".into()),
            )),
        StepDef::shell("verify", "tar -tzf output/bundle.tgz > temp/verify.txt"),
    ]
}
