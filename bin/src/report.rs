/*
 * Copyright 2024 Oxide Computer Company
 */

use std::collections::BTreeMap;

use serde::Serialize;

use crate::console::Block;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Success,
    Failed,
    /// Neither a debug nor a failure block was found.
    Missing,
}

/**
 * A printed record from the script output, e.g., the fields of
 * "#<CompanyUser id: 7, name: ...>" as pretty-printed one per line.
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Record {
    pub name: String,
    pub fields: BTreeMap<String, String>,
}

/**
 * A summary of the outcome block, suitable for machine consumption.
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Report {
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record: Option<Record>,
    /// Everything the script printed, cleaned up, in order.
    pub lines: Vec<String>,
    /// The raw block, reported only for failures.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

const STDOUT_LINES: &str = "script_output.stdout_lines";

/**
 * Collect the entries of the "script_output.stdout_lines" list in a debug
 * block, stripped of the JSON quoting and trailing commas.
 */
fn stdout_lines(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .skip_while(|l| !l.contains(STDOUT_LINES))
        .skip(1)
        .take_while(|l| !l.starts_with(']'))
        .map(|l| l.trim_matches(|c: char| c == '"' || c == ',' || c == ' '))
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

impl Report {
    pub fn missing() -> Report {
        Report {
            status: Status::Missing,
            error: None,
            record: None,
            lines: Vec::new(),
            output: None,
        }
    }

    pub fn from_block(block: &Block) -> Report {
        let text = block.text();

        if !block.is_debug() || text.contains("FAILED!") {
            return Report {
                status: Status::Failed,
                error: None,
                record: None,
                lines: Vec::new(),
                output: Some(text.to_string()),
            };
        }

        let lines = stdout_lines(text);

        let mut error = None;
        let mut name = None;
        let mut fields = BTreeMap::new();
        for l in lines.iter() {
            if l.starts_with("ERROR:") {
                error = Some(l.to_string());
            } else if l.starts_with('|') {
                continue;
            } else if let Some(rest) = l.strip_prefix("[#<") {
                /*
                 * The start of a record, e.g., "[#<CompanyUser:0x0000 ...".
                 * Only the type name matters.
                 */
                let n = rest
                    .split(|c: char| c == ':' || c.is_whitespace())
                    .next()
                    .unwrap_or(rest);
                name = Some(n.to_string());
            } else if let Some((k, v)) = l.split_once(':') {
                fields.insert(k.trim().to_string(), v.trim().to_string());
            }
        }

        Report {
            status: Status::Success,
            error,
            record: name.map(|name| Record { name, fields }),
            lines,
            output: None,
        }
    }
}
