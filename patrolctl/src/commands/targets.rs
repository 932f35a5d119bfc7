use patrol_core::load_targets;
use serde::Serialize;

use crate::{Cli, OutputFormat, Result, TargetsCommands};

#[derive(Debug, Serialize)]
struct TargetRow {
    name: String,
    base_url: String,
    steps: usize,
    login: bool,
}

pub fn execute(cli: &Cli, command: &TargetsCommands) -> Result<()> {
    match command {
        TargetsCommands::Validate => {
            let targets = load_targets(&cli.targets)?;
            println!("{} targets valid", targets.len());
            Ok(())
        }
        TargetsCommands::List => {
            let rows: Vec<TargetRow> = load_targets(&cli.targets)?
                .into_iter()
                .map(|target| TargetRow {
                    name: target.name.clone(),
                    base_url: target.base_url.to_string(),
                    steps: target.steps.len(),
                    login: target.login.is_some(),
                })
                .collect();
            match cli.format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
                OutputFormat::Text => {
                    for row in rows {
                        let login = if row.login { " +login" } else { "" };
                        println!(
                            "{:<24} {:<40} {} steps{login}",
                            row.name, row.base_url, row.steps
                        );
                    }
                }
            }
            Ok(())
        }
    }
}
