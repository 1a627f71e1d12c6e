//! `destroy` subcommand for `aws`

use crate::{
    aws::{
        cloudformation::{self, Goal},
        deployer_directory, sdk_config, Environment, Error, CREATED_FILE_NAME,
        DESTROYED_FILE_NAME, TRIGGERED_FILE_NAME,
    },
    stack::Config,
};
use std::{
    fs::{self, File},
    path::PathBuf,
};
use tracing::{info, warn};

/// Deletes the stack named by a configuration file or directly by name
///
/// Resources declared with a `retain` removal policy (the file system, when configured)
/// outlive the stack and must be removed by hand.
pub async fn destroy(config: Option<&PathBuf>, name: Option<&str>) -> Result<(), Error> {
    let name = match (config, name) {
        (Some(config), _) => Config::load(config)?.name,
        (None, Some(name)) => name.to_string(),
        (None, None) => return Err(Error::MissingTarget),
    };
    let name = name.as_str();

    let directory = deployer_directory(Some(name));
    if directory.join(DESTROYED_FILE_NAME).exists() {
        info!(stack = name, "deployment already destroyed");
        return Ok(());
    }
    if !directory.join(CREATED_FILE_NAME).exists() {
        warn!(stack = name, "no record of deployment, deleting stack anyway");
    }

    let environment = Environment::from_env();
    let sdk = sdk_config(&environment).await;
    let client = cloudformation::create_client(&sdk);
    match cloudformation::describe_stack(&client, name).await? {
        Some(_) => {
            cloudformation::delete_stack(&client, name).await?;
            cloudformation::wait_for_stack(&client, name, Goal::Delete).await?;
            info!(stack = name, "deleted stack");
        }
        None => info!(stack = name, "stack does not exist"),
    }

    // Mark the deployment destroyed so a later deploy can trigger the task again
    if directory.exists() {
        File::create(directory.join(DESTROYED_FILE_NAME))?;
        let triggered = directory.join(TRIGGERED_FILE_NAME);
        if triggered.exists() {
            fs::remove_file(triggered)?;
        }
    }
    info!(stack = name, "destroyed deployment");
    Ok(())
}
