//! Properties every synthesized stack must hold

use batchstack_deployer::stack::{
    self,
    cidr::Cidr,
    compute::{SUCCESS_CONDITION, TASK_DEFINITION_ID},
    config::RemovalPolicy,
    network::VPC_ID,
    security::{NFS_PORT, STORAGE_SECURITY_GROUP_ID, TASK_SECURITY_GROUP_ID},
    storage::FILE_SYSTEM_ID,
    Config, Template, Violation,
};
use serde_json::Value;

fn synthesize(config: &Config) -> Template {
    stack::synthesize(config).expect("synthesis failed")
}

fn subnet_blocks(template: &Template) -> Vec<Cidr> {
    template
        .resources_of("AWS::EC2::Subnet")
        .map(|(_, r)| r.properties["CidrBlock"].as_str().unwrap().parse().unwrap())
        .collect()
}

#[test]
fn test_storage_only_reachable_from_task_group() {
    let template = synthesize(&Config::default());
    let group = template.resource(STORAGE_SECURITY_GROUP_ID).unwrap();
    let rules = group.properties["SecurityGroupIngress"].as_array().unwrap();
    assert_eq!(rules.len(), 1);
    let rule = &rules[0];
    assert_eq!(rule["IpProtocol"], "tcp");
    assert_eq!(rule["FromPort"], NFS_PORT);
    assert_eq!(rule["ToPort"], NFS_PORT);
    assert_eq!(
        rule["SourceSecurityGroupId"]["Fn::GetAtt"][0],
        TASK_SECURITY_GROUP_ID
    );
    assert!(rule.get("CidrIp").is_none());

    // No other ingress resources widen access
    assert_eq!(
        template
            .resources_of("AWS::EC2::SecurityGroupIngress")
            .count(),
        0
    );
}

#[test]
fn test_worker_waits_for_loader_success() {
    let template = synthesize(&Config::default());
    let definition = template.resource(TASK_DEFINITION_ID).unwrap();
    let containers = definition.properties["ContainerDefinitions"]
        .as_array()
        .unwrap();
    let essential: Vec<&Value> = containers
        .iter()
        .filter(|c| c["Essential"] == true)
        .collect();
    assert_eq!(essential.len(), 1);
    let dependency = &essential[0]["DependsOn"][0];
    assert_eq!(dependency["Condition"], SUCCESS_CONDITION);
    let loader = containers
        .iter()
        .find(|c| c["Essential"] == false)
        .unwrap();
    assert_eq!(dependency["ContainerName"], loader["Name"]);
}

#[test]
fn test_removing_mount_grant_is_detected() {
    let mut template = synthesize(&Config::default());
    assert!(stack::audit(&template).is_empty());
    template
        .resources
        .get_mut(FILE_SYSTEM_ID)
        .unwrap()
        .properties
        .as_object_mut()
        .unwrap()
        .remove("FileSystemPolicy");
    assert_eq!(
        stack::audit(&template),
        vec![Violation::MissingMountPolicy(FILE_SYSTEM_ID.to_string())]
    );
}

#[test]
fn test_network_uses_declared_block() {
    for azs in 1..=3 {
        let mut config = Config::default();
        config.network.cidr = "10.40.0.0/16".parse().unwrap();
        config.network.max_azs = azs;
        let template = synthesize(&config);
        let vpc = template.resource(VPC_ID).unwrap();
        assert_eq!(vpc.properties["CidrBlock"], config.network.cidr.to_string());

        // One public and one private subnet per zone
        let public: Vec<bool> = template
            .resources_of("AWS::EC2::Subnet")
            .map(|(_, r)| r.properties["MapPublicIpOnLaunch"].as_bool().unwrap())
            .collect();
        assert_eq!(public.iter().filter(|p| **p).count(), azs);
        assert_eq!(public.iter().filter(|p| !**p).count(), azs);
    }
}

#[test]
fn test_subnets_carved_per_zone() {
    for azs in 1..=3 {
        let mut config = Config::default();
        config.network.max_azs = azs;
        let template = synthesize(&config);
        let blocks = subnet_blocks(&template);
        assert_eq!(blocks.len(), 2 * azs);
        for (i, block) in blocks.iter().enumerate() {
            assert!(config.network.cidr.contains(block));
            for other in &blocks[i + 1..] {
                assert!(!block.overlaps(other), "{block} overlaps {other}");
            }
        }
    }
}

#[test]
fn test_volume_backed_by_file_system() {
    let mut config = Config::default();
    config.task.volume = "shared".to_string();
    let template = synthesize(&config);
    let definition = template.resource(TASK_DEFINITION_ID).unwrap();
    let volume = &definition.properties["Volumes"][0];
    assert_eq!(volume["Name"], "shared");
    assert_eq!(
        volume["EFSVolumeConfiguration"]["FilesystemId"]["Ref"],
        FILE_SYSTEM_ID
    );
    for container in definition.properties["ContainerDefinitions"]
        .as_array()
        .unwrap()
    {
        assert_eq!(container["MountPoints"][0]["SourceVolume"], "shared");
    }
}

#[test]
fn test_retain_policy_applied() {
    let mut config = Config::default();
    config.storage.removal_policy = RemovalPolicy::Retain;
    let template = synthesize(&config);
    let file_system = template.resource(FILE_SYSTEM_ID).unwrap();
    let rendered = serde_json::to_value(file_system).unwrap();
    assert_eq!(rendered["DeletionPolicy"], "Retain");
    assert_eq!(rendered["UpdateReplacePolicy"], "Retain");
}

#[test]
fn test_synthesis_is_deterministic() {
    let mut config = Config::default();
    config.name = "nightly".to_string();
    config.network.max_azs = 3;
    let first = synthesize(&config).to_json().unwrap();
    let second = synthesize(&config).to_json().unwrap();
    assert_eq!(first, second);

    // The rendered template parses back to the same model
    let parsed = Template::parse(&first).unwrap();
    assert_eq!(parsed, synthesize(&config));
}
