//! Line-in-file module - Manage lines in text files
//!
//! Ensures a particular line is in a file, or replaces the lines matching a
//! regular expression. The file is read through the connection, edited in
//! memory and written back only when the edit changed something.

use async_trait::async_trait;
use regex::Regex;
use std::path::Path;

use super::{
    get_state, Module, ModuleContext, ModuleError, ModuleParams, ModuleResult, ParamExt, Plan,
    Step,
};
use crate::connection::Connection;

/// Where to insert a new line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertPosition {
    /// After the last line matching the regex
    AfterMatch,
    /// Before the first line matching the regex
    BeforeMatch,
    /// At the beginning of file
    BeginningOfFile,
    /// At the end of file (default)
    EndOfFile,
}

/// Module for line-in-file operations
pub struct LineinfileModule;

fn compile(params: &ModuleParams, key: &str) -> ModuleResult<Option<Regex>> {
    params
        .get_string(key)?
        .map(|pattern| {
            Regex::new(&pattern)
                .map_err(|e| ModuleError::InvalidParameter(format!("Invalid {} regex: {}", key, e)))
        })
        .transpose()
}

fn find_insert_position(
    lines: &[String],
    insertafter: Option<&str>,
    insertbefore: Option<&str>,
) -> ModuleResult<(InsertPosition, Option<usize>)> {
    let (pattern, after) = match (insertafter, insertbefore) {
        (Some(p), _) => (p, true),
        (None, Some(p)) => (p, false),
        (None, None) => return Ok((InsertPosition::EndOfFile, None)),
    };

    match pattern.to_uppercase().as_str() {
        "EOF" => Ok((InsertPosition::EndOfFile, None)),
        "BOF" => Ok((InsertPosition::BeginningOfFile, None)),
        _ => {
            let re = Regex::new(pattern)
                .map_err(|e| ModuleError::InvalidParameter(format!("Invalid insert regex: {}", e)))?;
            if after {
                Ok((InsertPosition::AfterMatch, lines.iter().rposition(|l| re.is_match(l))))
            } else {
                Ok((InsertPosition::BeforeMatch, lines.iter().position(|l| re.is_match(l))))
            }
        }
    }
}

/// Make sure `line` is present, returning whether `lines` changed.
pub fn ensure_line_present(
    lines: &mut Vec<String>,
    line: &str,
    regexp: Option<&Regex>,
    insertafter: Option<&str>,
    insertbefore: Option<&str>,
) -> ModuleResult<bool> {
    if let Some(re) = regexp {
        let matching: Vec<usize> = lines
            .iter()
            .enumerate()
            .filter(|(_, l)| re.is_match(l))
            .map(|(i, _)| i)
            .collect();

        if let Some(&last) = matching.last() {
            if lines[last] == line {
                return Ok(false);
            }
            lines[last] = line.to_string();
            return Ok(true);
        }
    }

    if lines.iter().any(|l| l == line) {
        return Ok(false);
    }

    let (position, match_idx) = find_insert_position(lines, insertafter, insertbefore)?;
    match (position, match_idx) {
        (InsertPosition::BeginningOfFile, _) => lines.insert(0, line.to_string()),
        (InsertPosition::AfterMatch, Some(idx)) => lines.insert(idx + 1, line.to_string()),
        (InsertPosition::BeforeMatch, Some(idx)) => lines.insert(idx, line.to_string()),
        _ => lines.push(line.to_string()),
    }
    Ok(true)
}

/// Remove `line` (or every line matching `regexp`), returning whether
/// `lines` changed.
pub fn ensure_line_absent(lines: &mut Vec<String>, line: Option<&str>, regexp: Option<&Regex>) -> bool {
    let original_len = lines.len();
    lines.retain(|l| match (regexp, line) {
        (Some(re), _) => !re.is_match(l),
        (None, Some(line)) => l != line,
        (None, None) => true,
    });
    lines.len() != original_len
}

#[async_trait]
impl Module for LineinfileModule {
    fn name(&self) -> &'static str {
        "lineinfile"
    }

    fn description(&self) -> &'static str {
        "Ensure a line is present in or absent from a text file"
    }

    fn required_params(&self) -> &[&'static str] {
        &["path"]
    }

    fn validate_params(&self, params: &ModuleParams) -> ModuleResult<()> {
        params.get_string_required("path")?;
        let state = get_state(params, &["present", "absent"], "present")?;
        compile(params, "regexp")?;
        let line = params.get_string("line")?;
        if state == "present" && line.is_none() {
            return Err(ModuleError::MissingParameter(
                "line is required for state=present".to_string(),
            ));
        }
        if state == "absent" && line.is_none() && !params.contains_key("regexp") {
            return Err(ModuleError::MissingParameter(
                "line or regexp is required for state=absent".to_string(),
            ));
        }
        params.get_bool("create")?;
        params.get_mode("mode")?;
        Ok(())
    }

    async fn plan(
        &self,
        connection: &dyn Connection,
        params: &ModuleParams,
        context: &ModuleContext,
    ) -> ModuleResult<Plan> {
        let path_str = params.get_string_required("path")?;
        let path = Path::new(&path_str);
        let state = get_state(params, &["present", "absent"], "present")?;
        let line = params.get_string("line")?;
        let regexp = compile(params, "regexp")?;
        let create = params.get_bool_or("create", false)?;
        let mode = params.get_mode("mode")?;

        let read = context.read_options();
        let stat = connection.stat(path, Some(read.clone())).await?;
        let content = match &stat {
            Some(stat) if stat.is_dir => {
                return Err(ModuleError::ExecutionFailed(format!("{} is a directory", path_str)))
            }
            Some(_) => {
                let bytes = connection.download_content(path, Some(read)).await?;
                String::from_utf8(bytes).map_err(|_| {
                    ModuleError::ExecutionFailed(format!("{} is not valid UTF-8 text", path_str))
                })?
            }
            None if state == "absent" => {
                return Ok(Plan::unchanged(format!("{} does not exist", path_str)))
            }
            None if !create => {
                return Err(ModuleError::ExecutionFailed(format!(
                    "{} does not exist and create=false",
                    path_str
                )))
            }
            None => String::new(),
        };

        let mut lines: Vec<String> = content.lines().map(str::to_string).collect();
        let changed = if state == "present" {
            let line = line.ok_or_else(|| ModuleError::MissingParameter("line".to_string()))?;
            ensure_line_present(
                &mut lines,
                &line,
                regexp.as_ref(),
                params.get_string("insertafter")?.as_deref(),
                params.get_string("insertbefore")?.as_deref(),
            )?
        } else {
            ensure_line_absent(&mut lines, line.as_deref(), regexp.as_ref())
        };

        if !changed {
            return Ok(Plan::unchanged(format!("{} already has the desired lines", path_str)));
        }

        let mut new_content = lines.join("\n");
        if !lines.is_empty() {
            new_content.push('\n');
        }
        let mode = mode.or(stat.map(|s| s.mode));
        let msg = if state == "present" { "line added" } else { "line removed" };
        Ok(Plan::change(
            format!("{} ({})", msg, path_str),
            vec![Step::write(path, new_content.into_bytes(), mode)],
        ))
    }
}
