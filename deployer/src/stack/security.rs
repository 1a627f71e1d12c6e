//! Security groups for the task and the file system's mount targets

use crate::stack::{
    config::Config,
    network::Network,
    template::{get_att, name_tag, reference, Resource, Template},
    Error,
};
use serde_json::json;

/// NFS port used by EFS mount targets
pub const NFS_PORT: u16 = 2049;

pub const TASK_SECURITY_GROUP_ID: &str = "TaskSecurityGroup";
pub const STORAGE_SECURITY_GROUP_ID: &str = "EfsSecurityGroup";

pub struct SecurityGroups {
    /// Shared by the Fargate task and the verification host
    pub task: String,
    /// Attached to every mount target
    pub storage: String,
}

pub fn build(
    template: &mut Template,
    config: &Config,
    network: &Network,
) -> Result<SecurityGroups, Error> {
    let task_name = config.physical_name("task-sg");
    template.add(
        TASK_SECURITY_GROUP_ID,
        Resource::new(
            "AWS::EC2::SecurityGroup",
            json!({
                "GroupName": task_name,
                "GroupDescription": format!("{} task and verification host", config.name),
                "VpcId": reference(&network.vpc),
                "Tags": name_tag(&task_name),
            }),
        ),
    )?;

    // The only way in is NFS from holders of the task group (never a CIDR)
    let storage_name = config.physical_name("efs-sg");
    template.add(
        STORAGE_SECURITY_GROUP_ID,
        Resource::new(
            "AWS::EC2::SecurityGroup",
            json!({
                "GroupName": storage_name,
                "GroupDescription": format!("{} file system mount targets", config.name),
                "VpcId": reference(&network.vpc),
                "SecurityGroupIngress": [{
                    "IpProtocol": "tcp",
                    "FromPort": NFS_PORT,
                    "ToPort": NFS_PORT,
                    "SourceSecurityGroupId": get_att(TASK_SECURITY_GROUP_ID, "GroupId"),
                    "Description": "Allow NFS from ECS tasks",
                }],
                "Tags": name_tag(&storage_name),
            }),
        ),
    )?;

    Ok(SecurityGroups {
        task: TASK_SECURITY_GROUP_ID.to_string(),
        storage: STORAGE_SECURITY_GROUP_ID.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::network;

    #[test]
    fn test_storage_ingress_from_task_group() {
        let config = Config::default();
        let mut template = Template::new("test");
        let network = network::build(&mut template, &config).unwrap();
        let groups = build(&mut template, &config, &network).unwrap();

        let storage = template.resource(&groups.storage).unwrap();
        let ingress = storage.properties["SecurityGroupIngress"].as_array().unwrap();
        assert_eq!(ingress.len(), 1);
        assert_eq!(ingress[0]["FromPort"], 2049);
        assert_eq!(ingress[0]["ToPort"], 2049);
        assert_eq!(
            ingress[0]["SourceSecurityGroupId"]["Fn::GetAtt"][0],
            groups.task.as_str()
        );
        assert!(ingress[0].get("CidrIp").is_none());

        let task = template.resource(&groups.task).unwrap();
        assert!(task.property("SecurityGroupIngress").is_none());
        assert_eq!(task.properties["GroupName"], "batchstack-task-sg");
    }
}
