use clap::ValueEnum;
use colored::Colorize;
use serde_json::json;

use crate::engine::Summary;
use crate::error::Result;
use crate::importers::ImporterInfo;
use crate::model::{singular, Verb};
use crate::store::mapping::Mapping;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Format {
    Json,
    Pretty,
    Minimal,
}

/// One line per non-zero counter, e.g. `Summary: created 2 organizations.`
pub fn summary_lines(summary: &Summary) -> Vec<String> {
    let lines: Vec<String> = summary
        .iter()
        .filter(|(verb, _, count)| *verb != Verb::Found && *count > 0)
        .map(|(verb, mapping, count)| {
            let noun = if count == 1 {
                singular(mapping.as_str())
            } else {
                mapping.as_str().to_string()
            };
            format!("{verb} {count} {}", noun.replace('_', " "))
        })
        .collect();
    if lines.is_empty() {
        vec!["No action taken.".to_string()]
    } else {
        lines
    }
}

pub fn print_summary(summary: &Summary, format: Format) -> Result<()> {
    match format {
        Format::Json => println!("{}", serde_json::to_string(summary)?),
        Format::Pretty => {
            for line in summary_lines(summary) {
                println!("{} {line}", "Summary:".bold());
            }
        }
        Format::Minimal => {
            for line in summary_lines(summary) {
                println!("{line}");
            }
        }
    }
    Ok(())
}

pub fn print_mapping(mapping: &Mapping, format: Format) -> Result<()> {
    let mut entries: Vec<_> = mapping.iter().collect();
    entries.sort();
    match format {
        Format::Json => {
            let rows: Vec<_> = entries
                .iter()
                .map(|(key, value)| json!({ "key": key, "value": value }))
                .collect();
            println!(
                "{}",
                json!({ "mapping": mapping.name(), "entries": rows })
            );
        }
        Format::Pretty => {
            println!(
                "{} ({} entries)",
                mapping.name().as_str().bold(),
                entries.len()
            );
            for (key, value) in entries {
                println!("  {key} -> {value}");
            }
        }
        Format::Minimal => {
            for (key, value) in entries {
                println!("{key}\t{value}");
            }
        }
    }
    Ok(())
}

pub fn print_importers(importers: &[ImporterInfo], format: Format) -> Result<()> {
    match format {
        Format::Json => {
            let rows: Vec<_> = importers
                .iter()
                .map(|info| {
                    json!({
                        "name": info.name,
                        "description": info.description,
                        "columns": info.columns,
                        "mappings": info.mappings,
                    })
                })
                .collect();
            println!("{}", serde_json::to_string(&rows)?);
        }
        Format::Pretty => {
            for info in importers {
                println!("{} - {}", info.name.bold(), info.description);
                println!("  columns: {}", info.columns.join(", "));
                let mappings: Vec<&str> = info.mappings.iter().map(|m| m.as_str()).collect();
                println!("  mappings: {}", mappings.join(", "));
            }
        }
        Format::Minimal => {
            for info in importers {
                println!("{}", info.name);
            }
        }
    }
    Ok(())
}
