use std::process::ExitCode;

use anyhow::Result;
use argp::FromArgs;
use indent_core::{config::Config, models::PrSummary};
use indent_github::{
    clock::CancelSignal,
    orchestrator::{Orchestrator, WorkflowStatus},
};
use time::OffsetDateTime;

use crate::util;

#[derive(FromArgs, PartialEq, Eq, Debug)]
/// Check whether the workflow exists in the repository.
#[argp(subcommand, name = "check")]
pub struct Args {
    #[argp(switch)]
    /// open a pull request adding the workflow if it is missing
    create_pr: bool,
}

pub fn print_pull_requests(pulls: &[PrSummary]) {
    for pr in pulls {
        println!("   - PR #{}: {}", pr.number, pr.title);
        println!("     URL: {}", pr.url);
        println!("     Author: {}", pr.author.as_deref().unwrap_or("[unknown]"));
        if let Some(created_at) = pr.created_at {
            println!("     Created: {}", created_at);
        }
    }
}

pub async fn run(args: Args, config: Config) -> Result<ExitCode> {
    let github = util::connect(&config).await?;
    let workflow = util::workflow_ref(&github, &config).await?;
    let git_ref = util::git_ref(&config, &workflow, None);
    let orchestrator = Orchestrator::new(github, config.poll.clone());
    let cancel = CancelSignal::never();

    println!("Checking {} on {} in {}...", workflow.path, git_ref, workflow.repo);
    match orchestrator.workflow_status(&workflow, &git_ref, &cancel).await? {
        WorkflowStatus::Present => {
            println!("✓ Workflow file exists in the repository");
            return Ok(ExitCode::SUCCESS);
        }
        WorkflowStatus::PendingPullRequests(pulls) => {
            println!("Workflow file not found, but PR(s) exist to create it:");
            print_pull_requests(&pulls);
            println!("Please merge one of these PRs before running workflows.");
            return Ok(ExitCode::FAILURE);
        }
        WorkflowStatus::Missing => {
            println!("Workflow file not found and no PRs exist to create it.");
        }
    }
    if !args.create_pr {
        println!("Run with --create-pr to create a PR for the workflow file.");
        return Ok(ExitCode::FAILURE);
    }

    let request = util::publish_request(&config, &workflow, &git_ref, OffsetDateTime::now_utc())?;
    let pr = orchestrator.publish_workflow(&workflow, &request).await?;
    println!("✓ Created PR #{}", pr.number);
    println!("  URL: {}", pr.url);
    println!("Please review and merge this PR before running workflows.");
    Ok(ExitCode::FAILURE)
}
