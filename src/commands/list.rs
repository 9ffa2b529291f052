//! `zr list`: print the catalogue's tasks and workflows.

use serde::Serialize;

use crate::cli::{Cli, ListOpts};
use crate::error::ZrError;

use super::support;

#[derive(Debug, Serialize)]
struct ListedTask<'a> {
    name: &'a str,
    cmd: &'a str,
    description: Option<&'a str>,
    deps: &'a [String],
}

#[derive(Debug, Serialize)]
struct ListedWorkflow<'a> {
    name: &'a str,
    stages: &'a [Vec<String>],
}

#[derive(Debug, Serialize)]
struct Listing<'a> {
    tasks: Vec<ListedTask<'a>>,
    workflows: Vec<ListedWorkflow<'a>>,
}

/// Entry point for `zr list`: prints the catalogue's tasks and workflows.
#[allow(clippy::print_stdout)]
pub fn run(cli: &Cli, opts: &ListOpts) -> Result<i32, ZrError> {
    let table = support::load_catalog(&support::catalog_path(cli.file.as_deref()))?;

    let mut task_names: Vec<&str> = table.task_names().collect();
    task_names.sort_unstable();
    let mut workflow_names: Vec<&str> = table.workflow_names().collect();
    workflow_names.sort_unstable();

    if opts.json {
        let tasks = task_names
            .iter()
            .filter_map(|&name| {
                table.get(name).map(|t| ListedTask {
                    name,
                    cmd: &t.cmd,
                    description: t.description.as_deref(),
                    deps: &t.deps,
                })
            })
            .collect();
        let workflows = workflow_names
            .iter()
            .filter_map(|&name| table.workflow(name).map(|w| ListedWorkflow { name, stages: &w.stages }))
            .collect();
        let listing = Listing { tasks, workflows };
        let json = serde_json::to_string_pretty(&listing)
            .map_err(|e| ZrError::Internal(format!("serializing listing: {e}")))?;
        println!("{json}");
        return Ok(0);
    }

    if opts.tree {
        print_tree(&table, &workflow_names, &task_names);
    } else {
        print_flat(&table, &task_names, &workflow_names);
    }
    Ok(0)
}

#[allow(clippy::print_stdout)]
fn print_flat(table: &crate::catalog::TaskTable, task_names: &[&str], workflow_names: &[&str]) {
    println!("Tasks:");
    for name in task_names {
        let Some(task) = table.get(name) else { continue };
        match &task.description {
            Some(desc) => println!("  {name}  {desc}"),
            None => println!("  {name}  {}", task.cmd),
        }
    }
    if !workflow_names.is_empty() {
        println!();
        println!("Workflows:");
        for name in workflow_names {
            let Some(workflow) = table.workflow(name) else { continue };
            println!("  {name}  ({} stages)", workflow.stages.len());
        }
    }
}

#[allow(clippy::print_stdout)]
fn print_tree(table: &crate::catalog::TaskTable, workflow_names: &[&str], task_names: &[&str]) {
    let mut in_a_workflow = std::collections::HashSet::new();
    for name in workflow_names {
        let Some(workflow) = table.workflow(name) else { continue };
        println!("{name}");
        for (i, stage) in workflow.stages.iter().enumerate() {
            println!("  stage {i}:");
            for task_name in stage {
                in_a_workflow.insert(task_name.clone());
                println!("    {task_name}");
            }
        }
    }
    let orphans: Vec<&&str> = task_names.iter().filter(|n| !in_a_workflow.contains(**n)).collect();
    if !orphans.is_empty() {
        if !workflow_names.is_empty() {
            println!();
        }
        println!("(tasks not referenced by any workflow)");
        for name in orphans {
            println!("  {name}");
        }
    }
}
