//! Stack configuration (loaded from YAML)
//!
//! An empty document yields the reference topology: a two-AZ `10.30.0.0/16` network, an
//! encrypted EFS volume destroyed with the stack, and a 0.5 vCPU / 1 GiB Fargate task.

use crate::stack::{cidr::Cidr, template::DeletionPolicy, Error};
use serde::{Deserialize, Serialize};
use std::{fs::File, path::Path};

/// Retention periods (in days) accepted by CloudWatch Logs
pub const LOG_RETENTION_DAYS: [u32; 22] = [
    1, 3, 5, 7, 14, 30, 60, 90, 120, 150, 180, 365, 400, 545, 731, 1096, 1827, 2192, 2557, 2922,
    3288, 3653,
];

/// Maximum length of the stack name (it prefixes every physical name)
pub const MAX_NAME_LENGTH: usize = 32;

/// Maximum number of availability zones a network may span
pub const MAX_AZS: usize = 6;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub name: String,
    pub network: NetworkConfig,
    pub storage: StorageConfig,
    pub task: TaskConfig,
    pub dataset: DatasetConfig,
    pub verification_host: HostConfig,
    pub run_task_on_deploy: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: "batchstack".to_string(),
            network: NetworkConfig::default(),
            storage: StorageConfig::default(),
            task: TaskConfig::default(),
            dataset: DatasetConfig::default(),
            verification_host: HostConfig::default(),
            run_task_on_deploy: false,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct NetworkConfig {
    pub cidr: Cidr,
    pub max_azs: usize,
    pub subnet_mask: u8,
    /// Defaults to one per availability zone
    pub nat_gateways: Option<usize>,
    /// Explicit zone names (otherwise the region's first `max_azs` zones are used)
    pub availability_zones: Vec<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            cidr: Cidr::new([10, 30, 0, 0].into(), 16).expect("valid default CIDR"),
            max_azs: 2,
            subnet_mask: 24,
            nat_gateways: None,
            availability_zones: Vec::new(),
        }
    }
}

impl NetworkConfig {
    pub fn nat_gateway_count(&self) -> usize {
        self.nat_gateways.unwrap_or(self.max_azs)
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum PerformanceMode {
    #[default]
    #[serde(rename = "generalPurpose")]
    GeneralPurpose,
    #[serde(rename = "maxIO")]
    MaxIo,
}

impl PerformanceMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PerformanceMode::GeneralPurpose => "generalPurpose",
            PerformanceMode::MaxIo => "maxIO",
        }
    }
}

/// Whether stateful resources are deleted or kept when the stack is torn down
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RemovalPolicy {
    #[default]
    Destroy,
    Retain,
}

impl From<RemovalPolicy> for DeletionPolicy {
    fn from(policy: RemovalPolicy) -> Self {
        match policy {
            RemovalPolicy::Destroy => DeletionPolicy::Delete,
            RemovalPolicy::Retain => DeletionPolicy::Retain,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    pub encrypted: bool,
    pub performance_mode: PerformanceMode,
    pub removal_policy: RemovalPolicy,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            encrypted: true,
            performance_mode: PerformanceMode::GeneralPurpose,
            removal_policy: RemovalPolicy::Destroy,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct TaskConfig {
    /// CPU units reserved for the whole task (1024 = 1 vCPU)
    pub cpu: u32,
    /// Memory reserved for the whole task (MiB)
    pub memory: u32,
    /// Name of the task volume backed by the file system
    pub volume: String,
    pub log_retention_days: u32,
    /// Defaults to the stack name
    pub log_stream_prefix: Option<String>,
    pub loader: LoaderConfig,
    pub worker: WorkerConfig,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            cpu: 512,
            memory: 1024,
            volume: "data".to_string(),
            log_retention_days: 1,
            log_stream_prefix: None,
            loader: LoaderConfig::default(),
            worker: WorkerConfig::default(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct LoaderConfig {
    pub image: String,
    pub cpu: u32,
    pub memory: u32,
    pub mount_path: String,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            image: "public.ecr.aws/aws-cli/aws-cli:latest".to_string(),
            cpu: 128,
            memory: 256,
            mount_path: "/data".to_string(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerConfig {
    /// ECR repository holding the worker image (resolved in the deployment account)
    pub repository: String,
    pub tag: String,
    pub cpu: u32,
    pub memory: u32,
    pub mount_path: String,
    /// File name of the input CSV on the shared volume
    pub input: String,
    /// File name of the result CSV on the shared volume
    pub output: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            repository: "csv-processor".to_string(),
            tag: "latest".to_string(),
            cpu: 384,
            memory: 768,
            mount_path: "/apppath".to_string(),
            input: "input.csv".to_string(),
            output: "result.csv".to_string(),
        }
    }
}

/// The single CSV object copied onto the shared volume before processing
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct DatasetConfig {
    pub bucket: String,
    pub key: String,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            bucket: "batchstack-datasets".to_string(),
            key: "input.csv".to_string(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct HostConfig {
    pub enabled: bool,
    pub instance_type: String,
    pub mount_path: String,
    /// SSM parameter resolving to the host's AMI
    pub ami_parameter: String,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            instance_type: "t3.micro".to_string(),
            mount_path: "/mnt/efs".to_string(),
            ami_parameter: "/aws/service/ami-amazon-linux-latest/al2023-ami-kernel-default-x86_64"
                .to_string(),
        }
    }
}

/// Returns true if (cpu, memory) is a task size Fargate accepts
pub fn valid_fargate_size(cpu: u32, memory: u32) -> bool {
    match cpu {
        256 => matches!(memory, 512 | 1024 | 2048),
        512 => (1024..=4096).contains(&memory) && memory % 1024 == 0,
        1024 => (2048..=8192).contains(&memory) && memory % 1024 == 0,
        2048 => (4096..=16384).contains(&memory) && memory % 1024 == 0,
        4096 => (8192..=30720).contains(&memory) && memory % 1024 == 0,
        8192 => (16384..=61440).contains(&memory) && memory % 4096 == 0,
        16384 => (32768..=122880).contains(&memory) && memory % 8192 == 0,
        _ => false,
    }
}

fn valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    name.len() <= MAX_NAME_LENGTH
        && first.is_ascii_lowercase()
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

impl Config {
    /// Loads and validates a configuration file
    pub fn load(path: &Path) -> Result<Self, Error> {
        let file = File::open(path)?;
        let config: Config = serde_yaml::from_reader(file)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if !valid_name(&self.name) {
            return Err(Error::InvalidName(self.name.clone()));
        }

        // Storage
        if !self.storage.encrypted {
            return Err(Error::UnencryptedStorage);
        }

        // Network
        let network = &self.network;
        if network.max_azs == 0 || network.max_azs > MAX_AZS {
            return Err(Error::InvalidAzCount(network.max_azs));
        }
        let nat_gateways = network.nat_gateway_count();
        if nat_gateways == 0 || nat_gateways > network.max_azs {
            return Err(Error::InvalidNatGatewayCount {
                nat_gateways,
                azs: network.max_azs,
            });
        }
        if !network.availability_zones.is_empty()
            && network.availability_zones.len() < network.max_azs
        {
            return Err(Error::NotEnoughAvailabilityZones {
                listed: network.availability_zones.len(),
                required: network.max_azs,
            });
        }
        network
            .cidr
            .subnets(network.subnet_mask, network.max_azs * 2)?;

        // Task sizing
        let task = &self.task;
        if !valid_fargate_size(task.cpu, task.memory) {
            return Err(Error::InvalidTaskSize {
                cpu: task.cpu,
                memory: task.memory,
            });
        }
        let cpu = u64::from(task.loader.cpu) + u64::from(task.worker.cpu);
        let memory = u64::from(task.loader.memory) + u64::from(task.worker.memory);
        if cpu > u64::from(task.cpu) || memory > u64::from(task.memory) {
            return Err(Error::ContainersExceedTask {
                cpu,
                memory,
                task_cpu: task.cpu,
                task_memory: task.memory,
            });
        }
        if !LOG_RETENTION_DAYS.contains(&task.log_retention_days) {
            return Err(Error::InvalidLogRetention(task.log_retention_days));
        }
        if task.volume.is_empty() {
            return Err(Error::InvalidVolumeName(task.volume.clone()));
        }
        for path in [
            &task.loader.mount_path,
            &task.worker.mount_path,
            &self.verification_host.mount_path,
        ] {
            if !path.starts_with('/') {
                return Err(Error::RelativeMountPath(path.clone()));
            }
        }
        for file in [&task.worker.input, &task.worker.output] {
            if file.is_empty() || file.contains('/') {
                return Err(Error::InvalidDataFile(file.clone()));
            }
        }

        // Dataset
        if self.dataset.bucket.is_empty() || self.dataset.key.is_empty() {
            return Err(Error::MissingDataset);
        }

        // Values interpolated into `Fn::Sub` strings must not open a placeholder
        for value in [
            &self.dataset.bucket,
            &self.dataset.key,
            &task.worker.repository,
            &task.worker.tag,
        ] {
            if value.contains("${") {
                return Err(Error::SubstitutionInValue(value.clone()));
            }
        }
        Ok(())
    }

    /// Physical name of a stack component (`<name>-<suffix>`)
    pub fn physical_name(&self, suffix: &str) -> String {
        format!("{}-{}", self.name, suffix)
    }

    pub fn log_stream_prefix(&self) -> &str {
        self.task
            .log_stream_prefix
            .as_deref()
            .unwrap_or(self.name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_is_default() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config, Config::default());
        config.validate().unwrap();
        assert_eq!(config.network.cidr.to_string(), "10.30.0.0/16");
        assert_eq!(config.network.nat_gateway_count(), 2);
        assert_eq!(config.log_stream_prefix(), "batchstack");
    }

    #[test]
    fn test_partial_document() {
        let yaml = r#"
name: nightly
network:
  cidr: 10.40.0.0/16
  nat_gateways: 1
storage:
  removal_policy: retain
  performance_mode: maxIO
task:
  worker:
    repository: my-processor
    tag: v3
dataset:
  bucket: my-bucket
  key: incoming/data.csv
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.name, "nightly");
        assert_eq!(config.network.max_azs, 2);
        assert_eq!(config.network.nat_gateway_count(), 1);
        assert_eq!(config.storage.removal_policy, RemovalPolicy::Retain);
        assert_eq!(config.storage.performance_mode, PerformanceMode::MaxIo);
        assert_eq!(config.task.worker.repository, "my-processor");
        assert_eq!(config.task.worker.mount_path, "/apppath");
        assert_eq!(config.physical_name("efs"), "nightly-efs");
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(serde_yaml::from_str::<Config>("nme: typo").is_err());
    }

    #[test]
    fn test_invalid_names() {
        let long = "a".repeat(MAX_NAME_LENGTH + 1);
        for name in ["", "Upper", "1abc", "has_underscore", long.as_str()] {
            let config = Config {
                name: name.to_string(),
                ..Config::default()
            };
            assert!(matches!(config.validate(), Err(Error::InvalidName(_))), "{name}");
        }
    }

    #[test]
    fn test_fargate_sizes() {
        assert!(valid_fargate_size(256, 512));
        assert!(valid_fargate_size(512, 1024));
        assert!(valid_fargate_size(4096, 30720));
        assert!(valid_fargate_size(8192, 20480));
        assert!(!valid_fargate_size(256, 4096));
        assert!(!valid_fargate_size(512, 1536));
        assert!(!valid_fargate_size(8192, 18432));
        assert!(!valid_fargate_size(300, 1024));
    }

    #[test]
    fn test_containers_exceed_task() {
        let mut config = Config::default();
        config.task.worker.cpu = 512;
        assert!(matches!(
            config.validate(),
            Err(Error::ContainersExceedTask { cpu: 640, .. })
        ));

        let mut config = Config::default();
        config.task.loader.memory = 512;
        assert!(matches!(
            config.validate(),
            Err(Error::ContainersExceedTask { memory: 1280, .. })
        ));
    }

    #[test]
    fn test_oversized_container_rejected() {
        let config: Config =
            serde_yaml::from_str("task:\n  loader:\n    cpu: 4294967295\n").unwrap();
        assert!(matches!(
            config.validate(),
            Err(Error::ContainersExceedTask { cpu: 4_294_967_679, task_cpu: 512, .. })
        ));

        let mut config = Config::default();
        config.task.worker.memory = u32::MAX;
        assert!(matches!(
            config.validate(),
            Err(Error::ContainersExceedTask { memory: 4_294_967_551, .. })
        ));
    }

    #[test]
    fn test_unencrypted_storage_rejected() {
        let config: Config = serde_yaml::from_str("storage:\n  encrypted: false\n").unwrap();
        assert!(matches!(config.validate(), Err(Error::UnencryptedStorage)));
    }

    #[test]
    fn test_substitution_in_value_rejected() {
        let mut config = Config::default();
        config.dataset.key = "runs/${AWS::StackName}.csv".to_string();
        assert!(matches!(
            config.validate(),
            Err(Error::SubstitutionInValue(value)) if value == "runs/${AWS::StackName}.csv"
        ));

        let mut config = Config::default();
        config.task.worker.tag = "${Tag}".to_string();
        assert!(matches!(config.validate(), Err(Error::SubstitutionInValue(_))));

        // A lone dollar sign is literal
        let mut config = Config::default();
        config.dataset.key = "prices$2024.csv".to_string();
        config.validate().unwrap();
    }

    #[test]
    fn test_network_limits() {
        let mut config = Config::default();
        config.network.max_azs = 0;
        assert!(matches!(config.validate(), Err(Error::InvalidAzCount(0))));

        let mut config = Config::default();
        config.network.nat_gateways = Some(3);
        assert!(matches!(
            config.validate(),
            Err(Error::InvalidNatGatewayCount { nat_gateways: 3, azs: 2 })
        ));

        let mut config = Config::default();
        config.network.cidr = "10.30.0.0/23".parse().unwrap();
        assert!(matches!(config.validate(), Err(Error::CidrExhausted { .. })));

        let mut config = Config::default();
        config.network.availability_zones = vec!["us-east-1a".to_string()];
        assert!(matches!(
            config.validate(),
            Err(Error::NotEnoughAvailabilityZones { listed: 1, required: 2 })
        ));
    }

    #[test]
    fn test_misc_validation() {
        let mut config = Config::default();
        config.task.log_retention_days = 2;
        assert!(matches!(config.validate(), Err(Error::InvalidLogRetention(2))));

        let mut config = Config::default();
        config.task.worker.mount_path = "apppath".to_string();
        assert!(matches!(config.validate(), Err(Error::RelativeMountPath(_))));

        let mut config = Config::default();
        config.task.worker.output = "out/result.csv".to_string();
        assert!(matches!(config.validate(), Err(Error::InvalidDataFile(_))));

        let mut config = Config::default();
        config.dataset.bucket = String::new();
        assert!(matches!(config.validate(), Err(Error::MissingDataset)));
    }
}
