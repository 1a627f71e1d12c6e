//! Synthesize, audit, and deploy a Fargate batch stack backed by a shared EFS volume.
//!
//! # Overview
//!
//! The stack runs a containerized batch job: a loader container copies a CSV object from
//! S3 onto an encrypted EFS volume, then a worker container reads that file and writes a
//! result CSV next to it. A small EC2 host mounts the same volume so results can be
//! inspected by hand.
//!
//! [stack] turns a YAML [stack::Config] into a CloudFormation [stack::Template] and audits
//! it. With the `aws` feature (on by default), [aws] submits that template, runs the task,
//! and tears the stack down.
//!
//! # Example Configuration
//!
//! ```yaml
//! name: batchstack
//! network:
//!   cidr: 10.30.0.0/16
//!   max_azs: 2
//! storage:
//!   removal_policy: destroy
//! task:
//!   cpu: 512
//!   memory: 1024
//!   worker:
//!     repository: csv-processor
//!     tag: latest
//! dataset:
//!   bucket: my-datasets
//!   key: input.csv
//! verification_host:
//!   enabled: true
//! run_task_on_deploy: false
//! ```

pub mod stack;

cfg_if::cfg_if! {
    if #[cfg(feature = "aws")] {
        pub mod aws;
    }
}
