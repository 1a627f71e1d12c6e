//! Structural checks over a synthesized (or hand-edited) template
//!
//! Synthesis refuses to emit a template with violations, and `verify` runs the same
//! checks against a template on disk.

use crate::stack::{
    cidr::Cidr,
    compute::SUCCESS_CONDITION,
    security::NFS_PORT,
    storage::{MOUNT_ACTIONS, MOUNT_TARGET_CONDITION},
    template::{referenced_id, Template},
};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// A structural problem found in a template
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    #[error("{from} references undeclared {target}")]
    DanglingReference { from: String, target: String },
    #[error("storage security group {group} has {rules} ingress rules (expected exactly 1)")]
    StorageIngressCount { group: String, rules: usize },
    #[error("storage security group {group} admits a CIDR block or prefix list")]
    StorageIngressOpen { group: String },
    #[error("storage security group {group} ingress is not sourced from another security group")]
    StorageIngressSource { group: String },
    #[error("storage security group {group} ingress is not tcp/2049")]
    StorageIngressPort { group: String },
    #[error("file system {0} is not encrypted")]
    UnencryptedFileSystem(String),
    #[error("file system {0} lacks a policy allowing mounts through mount targets")]
    MissingMountPolicy(String),
    #[error("container {container} in {task} mounts undeclared volume {volume}")]
    UnknownVolume {
        task: String,
        container: String,
        volume: String,
    },
    #[error("volume {volume} in {task} does not reference a declared file system")]
    VolumeWithoutFileSystem { task: String, volume: String },
    #[error("container {container} in {task} does not wait for {dependency} to succeed")]
    MissingStartCondition {
        task: String,
        container: String,
        dependency: String,
    },
    #[error("containers in {task} reserve {cpu} CPU / {memory} MiB, exceeding {task_cpu} / {task_memory}")]
    ContainersExceedTask {
        task: String,
        cpu: u64,
        memory: u64,
        task_cpu: u32,
        task_memory: u32,
    },
    #[error("subnet {subnet} ({cidr}) lies outside VPC {vpc}")]
    SubnetOutsideVpc {
        subnet: String,
        cidr: String,
        vpc: String,
    },
    #[error("subnets {first} and {second} overlap")]
    SubnetOverlap { first: String, second: String },
}

/// Runs every check, returning violations in a stable order
pub fn audit(template: &Template) -> Vec<Violation> {
    let mut violations = Vec::new();
    check_references(template, &mut violations);
    check_storage_ingress(template, &mut violations);
    check_file_systems(template, &mut violations);
    check_task_definitions(template, &mut violations);
    check_subnets(template, &mut violations);
    violations
}

/// Reads a number written either as a JSON number or a numeric string
fn as_u32(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Names referenced by `${...}` placeholders of an `Fn::Sub` string
fn sub_references(template: &str) -> Vec<&str> {
    let mut names = Vec::new();
    let mut rest = template;
    while let Some(start) = rest.find("${") {
        rest = &rest[start + 2..];
        let Some(end) = rest.find('}') else {
            break;
        };
        let inner = &rest[..end];
        if !inner.starts_with('!') {
            if let Some(name) = inner.split('.').next() {
                names.push(name.trim());
            }
        }
        rest = &rest[end + 1..];
    }
    names
}

fn collect_references<'a>(value: &'a Value, out: &mut Vec<&'a str>) {
    match value {
        Value::Object(map) => {
            if let Some(id) = referenced_id(value) {
                out.push(id);
            }
            if let Some(sub) = map.get("Fn::Sub") {
                match sub {
                    Value::String(s) => out.extend(sub_references(s)),
                    Value::Array(parts) => {
                        let variables: BTreeSet<&str> = parts
                            .get(1)
                            .and_then(Value::as_object)
                            .map(|vars| vars.keys().map(String::as_str).collect())
                            .unwrap_or_default();
                        if let Some(s) = parts.first().and_then(Value::as_str) {
                            out.extend(
                                sub_references(s)
                                    .into_iter()
                                    .filter(|name| !variables.contains(name)),
                            );
                        }
                    }
                    _ => {}
                }
            }
            for child in map.values() {
                collect_references(child, out);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_references(item, out);
            }
        }
        _ => {}
    }
}

fn check_references(template: &Template, violations: &mut Vec<Violation>) {
    let declared = |id: &str| -> bool {
        id.starts_with("AWS::")
            || template.resources.contains_key(id)
            || template.parameters.contains_key(id)
    };
    let sources = template
        .resources
        .iter()
        .map(|(id, r)| (id.clone(), &r.properties))
        .chain(
            template
                .outputs
                .iter()
                .map(|(id, o)| (format!("Outputs.{id}"), &o.value)),
        );
    for (from, value) in sources {
        let mut targets = Vec::new();
        collect_references(value, &mut targets);
        let missing: BTreeSet<&str> = targets.into_iter().filter(|id| !declared(*id)).collect();
        for target in missing {
            violations.push(Violation::DanglingReference {
                from: from.clone(),
                target: target.to_string(),
            });
        }
    }
    for (id, resource) in &template.resources {
        for dependency in &resource.depends_on {
            if !template.resources.contains_key(dependency) {
                violations.push(Violation::DanglingReference {
                    from: id.clone(),
                    target: dependency.clone(),
                });
            }
        }
    }
}

fn check_storage_ingress(template: &Template, violations: &mut Vec<Violation>) {
    // Security groups guarding any mount target
    let groups: BTreeSet<&str> = template
        .resources_of("AWS::EFS::MountTarget")
        .filter_map(|(_, r)| r.property("SecurityGroups").and_then(Value::as_array))
        .flatten()
        .filter_map(referenced_id)
        .filter(|id| {
            template
                .resource(id)
                .is_some_and(|r| r.kind == "AWS::EC2::SecurityGroup")
        })
        .collect();

    for group in groups {
        let mut rules: Vec<&Value> = template
            .resource(group)
            .and_then(|r| r.property("SecurityGroupIngress"))
            .and_then(Value::as_array)
            .map(|rules| rules.iter().collect())
            .unwrap_or_default();
        rules.extend(
            template
                .resources_of("AWS::EC2::SecurityGroupIngress")
                .filter(|(_, r)| r.property("GroupId").and_then(referenced_id) == Some(group))
                .map(|(_, r)| &r.properties),
        );
        if rules.len() != 1 {
            violations.push(Violation::StorageIngressCount {
                group: group.to_string(),
                rules: rules.len(),
            });
        }
        for rule in rules {
            if ["CidrIp", "CidrIpv6", "SourcePrefixListId"]
                .iter()
                .any(|key| rule.get(key).is_some())
            {
                violations.push(Violation::StorageIngressOpen {
                    group: group.to_string(),
                });
            }
            match rule.get("SourceSecurityGroupId").and_then(referenced_id) {
                Some(source) if source != group => {}
                _ => violations.push(Violation::StorageIngressSource {
                    group: group.to_string(),
                }),
            }
            let protocol = rule.get("IpProtocol").and_then(Value::as_str);
            let from = rule.get("FromPort").and_then(as_u32);
            let to = rule.get("ToPort").and_then(as_u32);
            let port = Some(u32::from(NFS_PORT));
            if !matches!(protocol, Some("tcp") | Some("6")) || from != port || to != port {
                violations.push(Violation::StorageIngressPort {
                    group: group.to_string(),
                });
            }
        }
    }
}

fn grants_mount(statement: &Value) -> bool {
    if statement.get("Effect").and_then(Value::as_str) != Some("Allow") {
        return false;
    }
    let actions: Vec<&str> = match statement.get("Action") {
        Some(Value::String(action)) => vec![action.as_str()],
        Some(Value::Array(actions)) => actions.iter().filter_map(Value::as_str).collect(),
        _ => return false,
    };
    let granted = |action: &str| -> bool {
        actions
            .iter()
            .any(|a| *a == action || *a == "elasticfilesystem:*" || *a == "*")
    };
    if !MOUNT_ACTIONS.iter().all(|action| granted(*action)) {
        return false;
    }
    match statement
        .get("Condition")
        .and_then(|c| c.get("Bool"))
        .and_then(|b| b.get(MOUNT_TARGET_CONDITION))
    {
        Some(Value::String(flag)) => flag == "true",
        Some(Value::Bool(flag)) => *flag,
        _ => false,
    }
}

fn check_file_systems(template: &Template, violations: &mut Vec<Violation>) {
    for (id, fs) in template.resources_of("AWS::EFS::FileSystem") {
        if fs.property("Encrypted").and_then(Value::as_bool) != Some(true) {
            violations.push(Violation::UnencryptedFileSystem(id.clone()));
        }
        let statements = fs
            .property("FileSystemPolicy")
            .and_then(|p| p.get("Statement"));
        let granted = match statements {
            Some(Value::Array(statements)) => statements.iter().any(grants_mount),
            Some(statement @ Value::Object(_)) => grants_mount(statement),
            _ => false,
        };
        if !granted {
            violations.push(Violation::MissingMountPolicy(id.clone()));
        }
    }
}

fn name_of(container: &Value) -> String {
    container
        .get("Name")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn check_task_definitions(template: &Template, violations: &mut Vec<Violation>) {
    for (task, definition) in template.resources_of("AWS::ECS::TaskDefinition") {
        // Volumes must be backed by a declared file system
        let mut volumes = BTreeSet::new();
        for volume in definition
            .property("Volumes")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            let Some(name) = volume.get("Name").and_then(Value::as_str) else {
                continue;
            };
            volumes.insert(name);
            let Some(efs) = volume.get("EFSVolumeConfiguration") else {
                continue;
            };
            let backed = efs
                .get("FilesystemId")
                .and_then(referenced_id)
                .and_then(|id| template.resource(id))
                .is_some_and(|r| r.kind == "AWS::EFS::FileSystem");
            if !backed {
                violations.push(Violation::VolumeWithoutFileSystem {
                    task: task.clone(),
                    volume: name.to_string(),
                });
            }
        }

        let containers: Vec<&Value> = definition
            .property("ContainerDefinitions")
            .and_then(Value::as_array)
            .map(|c| c.iter().collect())
            .unwrap_or_default();

        // Mount points must name a task volume
        for container in &containers {
            for mount in container
                .get("MountPoints")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
            {
                let volume = mount
                    .get("SourceVolume")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                if !volumes.contains(volume) {
                    violations.push(Violation::UnknownVolume {
                        task: task.clone(),
                        container: name_of(container),
                        volume: volume.to_string(),
                    });
                }
            }
        }

        // Essential containers start only after every non-essential one succeeded
        let (essential, auxiliary): (Vec<&Value>, Vec<&Value>) = containers
            .iter()
            .copied()
            .partition(|c| c.get("Essential").and_then(Value::as_bool).unwrap_or(true));
        for container in &essential {
            let conditions: BTreeMap<&str, &str> = container
                .get("DependsOn")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .filter_map(|d| {
                    Some((
                        d.get("ContainerName")?.as_str()?,
                        d.get("Condition")?.as_str()?,
                    ))
                })
                .collect();
            for dependency in &auxiliary {
                let dependency = name_of(dependency);
                if conditions.get(dependency.as_str()) != Some(&SUCCESS_CONDITION) {
                    violations.push(Violation::MissingStartCondition {
                        task: task.clone(),
                        container: name_of(container),
                        dependency,
                    });
                }
            }
        }

        // Container reservations fit in the task reservation
        let task_cpu = definition.property("Cpu").and_then(as_u32);
        let task_memory = definition.property("Memory").and_then(as_u32);
        if let (Some(task_cpu), Some(task_memory)) = (task_cpu, task_memory) {
            let sum = |key: &str| -> u64 {
                containers
                    .iter()
                    .filter_map(|c| c.get(key).and_then(as_u32))
                    .map(u64::from)
                    .sum()
            };
            let (cpu, memory) = (sum("Cpu"), sum("Memory"));
            if cpu > u64::from(task_cpu) || memory > u64::from(task_memory) {
                violations.push(Violation::ContainersExceedTask {
                    task: task.clone(),
                    cpu,
                    memory,
                    task_cpu,
                    task_memory,
                });
            }
        }
    }
}

fn check_subnets(template: &Template, violations: &mut Vec<Violation>) {
    for (vpc_id, vpc) in template.resources_of("AWS::EC2::VPC") {
        let Some(vpc_cidr) = vpc
            .property("CidrBlock")
            .and_then(Value::as_str)
            .and_then(|c| c.parse::<Cidr>().ok())
        else {
            continue;
        };
        let subnets: Vec<(&String, &str, Option<Cidr>)> = template
            .resources_of("AWS::EC2::Subnet")
            .filter(|(_, s)| s.property("VpcId").and_then(referenced_id) == Some(vpc_id.as_str()))
            .filter_map(|(id, s)| {
                let cidr = s.property("CidrBlock")?.as_str()?;
                Some((id, cidr, cidr.parse::<Cidr>().ok()))
            })
            .collect();
        for (id, raw, cidr) in &subnets {
            if !cidr.is_some_and(|c| vpc_cidr.contains(&c)) {
                violations.push(Violation::SubnetOutsideVpc {
                    subnet: (*id).clone(),
                    cidr: raw.to_string(),
                    vpc: vpc_id.clone(),
                });
            }
        }
        for (i, (first, _, a)) in subnets.iter().enumerate() {
            for (second, _, b) in &subnets[i + 1..] {
                if let (Some(a), Some(b)) = (a, b) {
                    if a.overlaps(b) {
                        violations.push(Violation::SubnetOverlap {
                            first: (*first).clone(),
                            second: (*second).clone(),
                        });
                    }
                }
            }
        }
    }
}
