//! Verification host used to inspect results on the shared volume by hand

use crate::stack::{
    config::Config,
    identity::Identity,
    network::Network,
    security::SecurityGroups,
    storage::Storage,
    template::{base64, get_att, name_tag, reference, sub, Parameter, Resource, Template},
    Error,
};
use serde_json::json;

pub const HOST_ID: &str = "VerificationHost";
pub const AMI_PARAMETER_ID: &str = "LatestAmiId";

/// Attempts made by the bootstrap script to mount the file system
const MOUNT_ATTEMPTS: usize = 10;

/// Seconds between mount attempts
const MOUNT_RETRY_INTERVAL: u64 = 5;

/// Bootstrap script installing the EFS client and mounting the file system.
///
/// `file_system` is the logical ID substituted by `Fn::Sub` at deploy time.
pub fn bootstrap_script(file_system: &str, mount_path: &str) -> String {
    format!(
        r#"#!/bin/bash
set -euxo pipefail
dnf install -y amazon-efs-utils
mkdir -p {mount_path}
for attempt in $(seq 1 {MOUNT_ATTEMPTS}); do
  if mount -t efs -o tls ${{{file_system}}}:/ {mount_path}; then
    break
  fi
  sleep {MOUNT_RETRY_INTERVAL}
done
mountpoint -q {mount_path}
echo "${{{file_system}}}:/ {mount_path} efs _netdev,tls 0 0" >> /etc/fstab
"#
    )
}

/// Declares the host (if enabled), returning its logical ID
pub fn build(
    template: &mut Template,
    config: &Config,
    network: &Network,
    groups: &SecurityGroups,
    storage: &Storage,
    identity: &Identity,
) -> Result<Option<String>, Error> {
    let host = &config.verification_host;
    if !host.enabled {
        return Ok(None);
    }
    let subnet = network
        .private_subnets
        .first()
        .ok_or(Error::InvalidAzCount(0))?;

    template.add_parameter(
        AMI_PARAMETER_ID,
        Parameter {
            kind: "AWS::SSM::Parameter::Value<AWS::EC2::Image::Id>".to_string(),
            default: Some(host.ami_parameter.clone()),
            description: Some("AMI of the verification host".to_string()),
        },
    )?;

    // The mount in user data needs a mount target in the host's subnet
    template.add(
        HOST_ID,
        Resource::new(
            "AWS::EC2::Instance",
            json!({
                "InstanceType": host.instance_type,
                "ImageId": reference(AMI_PARAMETER_ID),
                "SubnetId": reference(subnet),
                "SecurityGroupIds": [get_att(&groups.task, "GroupId")],
                "IamInstanceProfile": reference(&identity.instance_profile),
                "UserData": base64(sub(&bootstrap_script(&storage.file_system, &host.mount_path))),
                "Tags": name_tag(&config.physical_name("verification")),
            }),
        )
        .depends_on(storage.mount_targets.iter().cloned()),
    )?;
    Ok(Some(HOST_ID.to_string()))
}
