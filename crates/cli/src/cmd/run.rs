use std::process::ExitCode;

use anyhow::Result;
use argp::FromArgs;
use indent_core::{config::Config, models::RunResult};
use indent_github::orchestrator::{Orchestrator, RunOutcome, RunReport, WorkflowState};

use crate::{cmd::check::print_pull_requests, util};

#[derive(FromArgs, PartialEq, Eq, Debug)]
/// Dispatch the workflow and wait for it to finish.
#[argp(subcommand, name = "run")]
pub struct Args {
    #[argp(switch)]
    /// skip the workflow existence check
    skip_check: bool,
    #[argp(option, long = "ref")]
    /// branch, tag or SHA to run on (default: the configured ref or the default branch)
    git_ref: Option<String>,
}

fn print_result(result: &RunResult) {
    println!("Workflow completed with conclusion: {}", result.conclusion);
    if let Some(url) = &result.html_url {
        println!("URL: {url}");
    }
    for job in &result.jobs {
        let conclusion = job.conclusion.map_or(job.status.as_str(), |c| c.as_str());
        println!("Job {} ({conclusion})", job.name);
        for step in &job.steps {
            let conclusion = step.conclusion.map_or(step.status.as_str(), |c| c.as_str());
            println!("  {:>2}. {} ({conclusion})", step.number, step.name);
        }
    }
}

fn print_report(report: &RunReport) {
    print_result(&report.result);
    println!();
    println!("{}", "=".repeat(60));
    println!("WORKFLOW LOGS:");
    println!("{}", "=".repeat(60));
    match &report.logs {
        Some(logs) if !logs.is_empty() => print!("{}", logs.text()),
        _ => println!("(no logs available)"),
    }
}

pub async fn run(args: Args, config: Config) -> Result<ExitCode> {
    let github = util::connect(&config).await?;
    let workflow = util::workflow_ref(&github, &config).await?;
    let git_ref = util::git_ref(&config, &workflow, args.git_ref);
    let orchestrator = Orchestrator::new(github, config.poll.clone());
    let cancel = util::cancel_on_shutdown();
    let inputs = &config.workflow.inputs;

    let report = if args.skip_check {
        orchestrator.execute(&workflow, &git_ref, inputs, &cancel).await?
    } else {
        match orchestrator.run(&workflow, &git_ref, inputs, None, &cancel).await? {
            RunOutcome::Completed(report) => report,
            RunOutcome::AwaitingMerge(state) => {
                match state {
                    WorkflowState::PullRequestOpen(pr) => {
                        println!("Workflow file not found, but a PR exists to create it:");
                        print_pull_requests(&[pr]);
                    }
                    WorkflowState::PullRequestCreated(pr) => {
                        println!("Created PR #{} ({})", pr.number, pr.url);
                    }
                    WorkflowState::Present | WorkflowState::Missing => {}
                }
                println!("Please merge the PR before running workflows.");
                return Ok(ExitCode::FAILURE);
            }
        }
    };
    print_report(&report);
    Ok(if report.result.succeeded() { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}
