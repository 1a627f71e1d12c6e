//! IAM roles for task execution, the task itself, and the verification host

use crate::stack::{
    config::Config,
    template::{reference, sub, Resource, Template},
    Error,
};
use serde_json::{json, Value};

pub const EXECUTION_ROLE_ID: &str = "TaskExecutionRole";
pub const TASK_ROLE_ID: &str = "TaskRole";
pub const INSTANCE_ROLE_ID: &str = "InstanceRole";
pub const INSTANCE_PROFILE_ID: &str = "InstanceProfile";

/// Principal allowed to assume roles used by ECS tasks
pub const ECS_TASKS_PRINCIPAL: &str = "ecs-tasks.amazonaws.com";

/// Principal allowed to assume roles used by EC2 instances
pub const EC2_PRINCIPAL: &str = "ec2.amazonaws.com";

/// Pulling images and writing logs
const EXECUTION_POLICIES: [&str; 1] = ["service-role/AmazonECSTaskExecutionRolePolicy"];

/// Mounting the file system and opening session-manager channels
const RUNTIME_POLICIES: [&str; 2] = [
    "AmazonElasticFileSystemClientReadWriteAccess",
    "AmazonSSMManagedInstanceCore",
];

pub struct Identity {
    pub execution_role: String,
    pub task_role: String,
    pub instance_profile: String,
}

/// Trust policy restricting assumption to a single service principal
pub fn trust_policy(principal: &str) -> Value {
    json!({
        "Version": "2012-10-17",
        "Statement": [{
            "Effect": "Allow",
            "Principal": { "Service": principal },
            "Action": "sts:AssumeRole",
        }],
    })
}

fn managed_policy_arns(names: &[&str]) -> Value {
    names
        .iter()
        .map(|name| sub(&format!("arn:${{AWS::Partition}}:iam::aws:policy/{name}")))
        .collect()
}

/// Inline grant to read the single dataset object
fn dataset_policy(config: &Config) -> Value {
    json!([{
        "PolicyName": "dataset-read",
        "PolicyDocument": {
            "Version": "2012-10-17",
            "Statement": [{
                "Effect": "Allow",
                "Action": ["s3:GetObject"],
                "Resource": sub(&format!(
                    "arn:${{AWS::Partition}}:s3:::{}/{}",
                    config.dataset.bucket, config.dataset.key
                )),
            }],
        },
    }])
}

fn role(name: String, principal: &str, managed: &[&str], inline: Option<Value>) -> Resource {
    let mut properties = json!({
        "RoleName": name,
        "AssumeRolePolicyDocument": trust_policy(principal),
        "ManagedPolicyArns": managed_policy_arns(managed),
    });
    if let Some(inline) = inline {
        properties["Policies"] = inline;
    }
    Resource::new("AWS::IAM::Role", properties)
}

pub fn build(template: &mut Template, config: &Config) -> Result<Identity, Error> {
    template.add(
        EXECUTION_ROLE_ID,
        role(
            config.physical_name("task-execution-role"),
            ECS_TASKS_PRINCIPAL,
            &EXECUTION_POLICIES,
            None,
        ),
    )?;
    template.add(
        TASK_ROLE_ID,
        role(
            config.physical_name("task-role"),
            ECS_TASKS_PRINCIPAL,
            &RUNTIME_POLICIES,
            Some(dataset_policy(config)),
        ),
    )?;
    template.add(
        INSTANCE_ROLE_ID,
        role(
            config.physical_name("instance-role"),
            EC2_PRINCIPAL,
            &RUNTIME_POLICIES,
            Some(dataset_policy(config)),
        ),
    )?;
    template.add(
        INSTANCE_PROFILE_ID,
        Resource::new(
            "AWS::IAM::InstanceProfile",
            json!({ "Roles": [reference(INSTANCE_ROLE_ID)] }),
        ),
    )?;

    Ok(Identity {
        execution_role: EXECUTION_ROLE_ID.to_string(),
        task_role: TASK_ROLE_ID.to_string(),
        instance_profile: INSTANCE_PROFILE_ID.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn principal(resource: &Resource) -> &Value {
        &resource.properties["AssumeRolePolicyDocument"]["Statement"][0]["Principal"]["Service"]
    }

    #[test]
    fn test_trust_relationships() {
        let config = Config::default();
        let mut template = Template::new("test");
        let identity = build(&mut template, &config).unwrap();

        let execution = template.resource(&identity.execution_role).unwrap();
        assert_eq!(principal(execution), ECS_TASKS_PRINCIPAL);
        assert_eq!(
            execution.properties["ManagedPolicyArns"][0]["Fn::Sub"],
            "arn:${AWS::Partition}:iam::aws:policy/service-role/AmazonECSTaskExecutionRolePolicy"
        );
        assert!(execution.property("Policies").is_none());

        let task = template.resource(&identity.task_role).unwrap();
        assert_eq!(principal(task), ECS_TASKS_PRINCIPAL);
        assert_eq!(task.properties["RoleName"], "batchstack-task-role");

        let instance = template.resource(INSTANCE_ROLE_ID).unwrap();
        assert_eq!(principal(instance), EC2_PRINCIPAL);
    }

    #[test]
    fn test_dataset_grant() {
        let mut config = Config::default();
        config.dataset.bucket = "inputs".to_string();
        config.dataset.key = "daily/data.csv".to_string();
        let mut template = Template::new("test");
        let identity = build(&mut template, &config).unwrap();
        let task = template.resource(&identity.task_role).unwrap();
        let statement = &task.properties["Policies"][0]["PolicyDocument"]["Statement"][0];
        assert_eq!(statement["Action"][0], "s3:GetObject");
        assert_eq!(
            statement["Resource"]["Fn::Sub"],
            "arn:${AWS::Partition}:s3:::inputs/daily/data.csv"
        );
    }
}
