//! `run` subcommand for `aws`

use crate::{
    aws::{cloudformation, ecs, sdk_config, Environment, Error},
    stack::Config,
};
use std::path::PathBuf;
use tracing::info;

/// Runs the batch task once against a deployed stack
pub async fn run(config: &PathBuf, wait: bool) -> Result<(), Error> {
    let config = Config::load(config)?;
    let name = config.name.as_str();
    info!(stack = name, "loaded configuration");

    // Resolve the cluster, task definition, and network from stack outputs
    let environment = Environment::from_env();
    let sdk = sdk_config(&environment).await;
    let client = cloudformation::create_client(&sdk);
    let state = cloudformation::describe_stack(&client, name)
        .await?
        .ok_or_else(|| Error::StackNotFound(name.to_string()))?;
    let target = ecs::RunTarget::from_outputs(&state.outputs)?;

    let ecs_client = ecs::create_client(&sdk);
    let task = ecs::run_task(&ecs_client, &target, None).await?;
    if wait {
        let state = ecs::wait_for_task(&ecs_client, &target.cluster, &task).await?;
        info!(
            stack = name,
            task = state.arn.as_str(),
            containers = state.containers.len(),
            "task succeeded"
        );
    }
    Ok(())
}
