//! ECS cluster and the two-container Fargate task definition
//!
//! The loader copies the dataset onto the shared volume and must exit successfully
//! before the worker (which turns the input CSV into the result CSV) is started.

use crate::stack::{
    config::Config,
    identity::Identity,
    storage::Storage,
    template::{get_att, reference, sub, DeletionPolicy, Resource, Template},
    Error,
};
use serde_json::{json, Value};

pub const CLUSTER_ID: &str = "Cluster";
pub const LOG_GROUP_ID: &str = "TaskLogGroup";
pub const TASK_DEFINITION_ID: &str = "TaskDefinition";

/// Start condition gating the worker on the loader
pub const SUCCESS_CONDITION: &str = "SUCCESS";

pub struct Compute {
    pub cluster: String,
    pub task_definition: String,
    /// Name of the container the worker waits on
    pub loader: String,
}

fn log_configuration(config: &Config) -> Value {
    json!({
        "LogDriver": "awslogs",
        "Options": {
            "awslogs-group": reference(LOG_GROUP_ID),
            "awslogs-region": reference("AWS::Region"),
            "awslogs-stream-prefix": config.log_stream_prefix(),
        },
    })
}

fn mount_point(config: &Config, path: &str) -> Value {
    json!([{
        "ContainerPath": path,
        "SourceVolume": config.task.volume,
        "ReadOnly": false,
    }])
}

/// Worker image reference in the deployment account's registry
pub fn worker_image(config: &Config) -> Value {
    let worker = &config.task.worker;
    sub(&format!(
        "${{AWS::AccountId}}.dkr.ecr.${{AWS::Region}}.${{AWS::URLSuffix}}/{}:{}",
        worker.repository, worker.tag
    ))
}

/// Location the loader writes the dataset to (inside the loader's mount)
pub fn loader_destination(config: &Config) -> String {
    format!(
        "{}/{}",
        config.task.loader.mount_path.trim_end_matches('/'),
        config.task.worker.input
    )
}

/// Command-line contract of the worker: `<input csv> <output csv>`
pub fn worker_command(config: &Config) -> Vec<String> {
    let worker = &config.task.worker;
    let root = worker.mount_path.trim_end_matches('/');
    vec![
        format!("{root}/{}", worker.input),
        format!("{root}/{}", worker.output),
    ]
}

pub fn build(
    template: &mut Template,
    config: &Config,
    storage: &Storage,
    identity: &Identity,
) -> Result<Compute, Error> {
    let task = &config.task;
    let policy: DeletionPolicy = config.storage.removal_policy.into();

    template.add(
        CLUSTER_ID,
        Resource::new(
            "AWS::ECS::Cluster",
            json!({ "ClusterName": config.physical_name("ecs") }),
        ),
    )?;
    template.add(
        LOG_GROUP_ID,
        Resource::new(
            "AWS::Logs::LogGroup",
            json!({
                "LogGroupName": format!("/ecs/{}", config.name),
                "RetentionInDays": task.log_retention_days,
            }),
        )
        .removal(policy),
    )?;

    let loader = config.physical_name("loader");
    let worker = config.physical_name("worker");
    let dataset = format!("s3://{}/{}", config.dataset.bucket, config.dataset.key);
    let containers = json!([
        {
            "Name": loader,
            "Image": task.loader.image,
            "Essential": false,
            "Cpu": task.loader.cpu,
            "Memory": task.loader.memory,
            "Command": ["s3", "cp", dataset, loader_destination(config)],
            "MountPoints": mount_point(config, &task.loader.mount_path),
            "LogConfiguration": log_configuration(config),
        },
        {
            "Name": worker,
            "Image": worker_image(config),
            "Essential": true,
            "Cpu": task.worker.cpu,
            "Memory": task.worker.memory,
            "Command": worker_command(config),
            "MountPoints": mount_point(config, &task.worker.mount_path),
            "DependsOn": [{ "ContainerName": loader, "Condition": SUCCESS_CONDITION }],
            "LogConfiguration": log_configuration(config),
        },
    ]);

    template.add(
        TASK_DEFINITION_ID,
        Resource::new(
            "AWS::ECS::TaskDefinition",
            json!({
                "Family": config.physical_name("task"),
                "Cpu": task.cpu.to_string(),
                "Memory": task.memory.to_string(),
                "NetworkMode": "awsvpc",
                "RequiresCompatibilities": ["FARGATE"],
                "RuntimePlatform": { "OperatingSystemFamily": "LINUX" },
                "ExecutionRoleArn": get_att(&identity.execution_role, "Arn"),
                "TaskRoleArn": get_att(&identity.task_role, "Arn"),
                "Volumes": [{
                    "Name": task.volume,
                    "EFSVolumeConfiguration": {
                        "FilesystemId": reference(&storage.file_system),
                        "RootDirectory": "/",
                        "TransitEncryption": "ENABLED",
                    },
                }],
                "ContainerDefinitions": containers,
            }),
        ),
    )?;

    Ok(Compute {
        cluster: CLUSTER_ID.to_string(),
        task_definition: TASK_DEFINITION_ID.to_string(),
        loader,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::{identity, network, security, storage};

    fn declare(config: &Config) -> (Template, Compute) {
        let mut template = Template::new("test");
        let network = network::build(&mut template, config).unwrap();
        let groups = security::build(&mut template, config, &network).unwrap();
        let storage = storage::build(&mut template, config, &network, &groups).unwrap();
        let identity = identity::build(&mut template, config).unwrap();
        let compute = build(&mut template, config, &storage, &identity).unwrap();
        (template, compute)
    }

    #[test]
    fn test_container_contract() {
        let mut config = Config::default();
        config.dataset.bucket = "inputs".to_string();
        config.dataset.key = "data.csv".to_string();
        let (template, compute) = declare(&config);
        let definition = template.resource(&compute.task_definition).unwrap();
        assert_eq!(definition.properties["Cpu"], "512");
        assert_eq!(definition.properties["Memory"], "1024");

        let containers = definition.properties["ContainerDefinitions"]
            .as_array()
            .unwrap();
        let loader = &containers[0];
        assert_eq!(loader["Name"], compute.loader.as_str());
        assert_eq!(loader["Essential"], false);
        assert_eq!(
            loader["Command"],
            json!(["s3", "cp", "s3://inputs/data.csv", "/data/input.csv"])
        );

        let worker = &containers[1];
        assert_eq!(worker["Essential"], true);
        assert_eq!(
            worker["Command"],
            json!(["/apppath/input.csv", "/apppath/result.csv"])
        );
        assert_eq!(worker["DependsOn"][0]["ContainerName"], compute.loader.as_str());
        assert_eq!(worker["DependsOn"][0]["Condition"], SUCCESS_CONDITION);
        assert_eq!(
            worker["Image"]["Fn::Sub"],
            "${AWS::AccountId}.dkr.ecr.${AWS::Region}.${AWS::URLSuffix}/csv-processor:latest"
        );
    }

    #[test]
    fn test_volume_shared_at_different_paths() {
        let (template, compute) = declare(&Config::default());
        let definition = template.resource(&compute.task_definition).unwrap();
        let volume = &definition.properties["Volumes"][0];
        assert_eq!(volume["Name"], "data");
        assert_eq!(volume["EFSVolumeConfiguration"]["TransitEncryption"], "ENABLED");
        assert_eq!(volume["EFSVolumeConfiguration"]["FilesystemId"]["Ref"], "FileSystem");

        let containers = definition.properties["ContainerDefinitions"]
            .as_array()
            .unwrap();
        assert_eq!(containers[0]["MountPoints"][0]["ContainerPath"], "/data");
        assert_eq!(containers[1]["MountPoints"][0]["ContainerPath"], "/apppath");
        for container in containers {
            assert_eq!(container["MountPoints"][0]["SourceVolume"], "data");
        }
    }

    #[test]
    fn test_log_group() {
        let (template, _) = declare(&Config::default());
        let group = template.resource(LOG_GROUP_ID).unwrap();
        assert_eq!(group.properties["RetentionInDays"], 1);
        assert_eq!(group.properties["LogGroupName"], "/ecs/batchstack");
    }

    #[test]
    fn test_trailing_slash_mount_paths() {
        let mut config = Config::default();
        config.task.worker.mount_path = "/apppath/".to_string();
        assert_eq!(
            worker_command(&config),
            vec!["/apppath/input.csv", "/apppath/result.csv"]
        );
    }
}
