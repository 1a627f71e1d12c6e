//! Encrypted EFS file system shared by the task and the verification host

use crate::stack::{
    config::Config,
    network::Network,
    security::SecurityGroups,
    template::{get_att, reference, DeletionPolicy, Resource, Template},
    Error,
};
use serde_json::{json, Value};

pub const FILE_SYSTEM_ID: &str = "FileSystem";

/// Actions a client needs to mount and write the file system
pub const MOUNT_ACTIONS: [&str; 3] = [
    "elasticfilesystem:ClientMount",
    "elasticfilesystem:ClientRootAccess",
    "elasticfilesystem:ClientWrite",
];

/// Condition key restricting access to mount-target connections
pub const MOUNT_TARGET_CONDITION: &str = "elasticfilesystem:AccessedViaMountTarget";

pub struct Storage {
    pub file_system: String,
    pub mount_targets: Vec<String>,
}

/// Resource policy allowing mounts through a mount target.
///
/// Without an explicit `ClientMount` grant, mounts fail with no actionable error.
pub fn mount_policy() -> Value {
    json!({
        "Version": "2012-10-17",
        "Statement": [{
            "Effect": "Allow",
            "Principal": { "AWS": "*" },
            "Action": MOUNT_ACTIONS,
            "Condition": {
                "Bool": { MOUNT_TARGET_CONDITION: "true" }
            },
        }],
    })
}

pub fn build(
    template: &mut Template,
    config: &Config,
    network: &Network,
    groups: &SecurityGroups,
) -> Result<Storage, Error> {
    let storage = &config.storage;
    let policy: DeletionPolicy = storage.removal_policy.into();
    template.add(
        FILE_SYSTEM_ID,
        Resource::new(
            "AWS::EFS::FileSystem",
            json!({
                "Encrypted": storage.encrypted,
                "PerformanceMode": storage.performance_mode.as_str(),
                "FileSystemPolicy": mount_policy(),
                "FileSystemTags": [{ "Key": "Name", "Value": config.physical_name("efs") }],
            }),
        )
        .removal(policy),
    )?;

    // One mount target per private subnet
    let mut mount_targets = Vec::with_capacity(network.private_subnets.len());
    for (i, subnet) in network.private_subnets.iter().enumerate() {
        let id = format!("FileSystemMountTarget{}", i + 1);
        template.add(
            &id,
            Resource::new(
                "AWS::EFS::MountTarget",
                json!({
                    "FileSystemId": reference(FILE_SYSTEM_ID),
                    "SubnetId": reference(subnet),
                    "SecurityGroups": [get_att(&groups.storage, "GroupId")],
                }),
            ),
        )?;
        mount_targets.push(id);
    }

    Ok(Storage {
        file_system: FILE_SYSTEM_ID.to_string(),
        mount_targets,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::{config::RemovalPolicy, network, security};

    fn declare(config: &Config) -> (Template, Storage) {
        let mut template = Template::new("test");
        let network = network::build(&mut template, config).unwrap();
        let groups = security::build(&mut template, config, &network).unwrap();
        let storage = build(&mut template, config, &network, &groups).unwrap();
        (template, storage)
    }

    #[test]
    fn test_file_system_policy() {
        let (template, storage) = declare(&Config::default());
        let fs = template.resource(&storage.file_system).unwrap();
        assert_eq!(fs.properties["Encrypted"], true);
        assert_eq!(fs.properties["PerformanceMode"], "generalPurpose");
        let statement = &fs.properties["FileSystemPolicy"]["Statement"][0];
        assert_eq!(statement["Effect"], "Allow");
        assert_eq!(statement["Action"][0], "elasticfilesystem:ClientMount");
        assert_eq!(
            statement["Condition"]["Bool"][MOUNT_TARGET_CONDITION],
            "true"
        );
        assert_eq!(fs.deletion_policy, Some(DeletionPolicy::Delete));
    }

    #[test]
    fn test_mount_targets_in_private_subnets() {
        let (template, storage) = declare(&Config::default());
        assert_eq!(storage.mount_targets.len(), 2);
        let target = template.resource(&storage.mount_targets[1]).unwrap();
        assert_eq!(target.properties["SubnetId"]["Ref"], "PrivateSubnet2");
        assert_eq!(
            target.properties["SecurityGroups"][0]["Fn::GetAtt"][0],
            security::STORAGE_SECURITY_GROUP_ID
        );
    }

    #[test]
    fn test_retain_policy() {
        let mut config = Config::default();
        config.storage.removal_policy = RemovalPolicy::Retain;
        let (template, storage) = declare(&config);
        let fs = template.resource(&storage.file_system).unwrap();
        assert_eq!(fs.deletion_policy, Some(DeletionPolicy::Retain));
        assert_eq!(fs.update_replace_policy, Some(DeletionPolicy::Retain));
    }
}
