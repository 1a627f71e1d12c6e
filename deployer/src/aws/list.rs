//! `list` subcommand for `aws`

use crate::aws::{
    deployer_directory, Error, Metadata, CREATED_FILE_NAME, DESTROYED_FILE_NAME,
    METADATA_FILE_NAME,
};
use std::{
    fs::{self, File},
    path::Path,
};
use tracing::info;

/// Reads active deployments (created but not destroyed) under a state directory
pub fn active_deployments(directory: &Path) -> Result<Vec<Metadata>, Error> {
    if !directory.exists() {
        return Ok(Vec::new());
    }
    let mut active = Vec::new();
    for entry in fs::read_dir(directory)? {
        let path = entry?.path();
        if !path.is_dir() {
            continue;
        }

        // Skip incomplete or destroyed deployments
        if !path.join(CREATED_FILE_NAME).exists() || path.join(DESTROYED_FILE_NAME).exists() {
            continue;
        }

        // Fall back to the directory name if metadata is missing
        let metadata_path = path.join(METADATA_FILE_NAME);
        if metadata_path.exists() {
            let file = File::open(&metadata_path)?;
            active.push(serde_yaml::from_reader::<_, Metadata>(file)?);
        } else {
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            active.push(Metadata {
                name: name.to_string(),
                created_at: 0,
                stack_id: String::new(),
                region: None,
                resources: 0,
            });
        }
    }

    // Newest first
    active.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.name.cmp(&b.name)));
    Ok(active)
}

/// Lists all active deployments
pub fn list() -> Result<(), Error> {
    let active = active_deployments(&deployer_directory(None))?;
    if active.is_empty() {
        info!("no active deployments");
        return Ok(());
    }
    for d in &active {
        info!(
            name = d.name.as_str(),
            created_at = d.created_at,
            stack_id = d.stack_id.as_str(),
            region = d.region.as_deref().unwrap_or("unknown"),
            resources = d.resources,
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deployment(base: &Path, name: &str, created_at: Option<u64>, destroyed: bool) {
        let dir = base.join(name);
        fs::create_dir_all(&dir).unwrap();
        File::create(dir.join(CREATED_FILE_NAME)).unwrap();
        if destroyed {
            File::create(dir.join(DESTROYED_FILE_NAME)).unwrap();
        }
        if let Some(created_at) = created_at {
            let metadata = Metadata {
                name: name.to_string(),
                created_at,
                stack_id: format!("arn:aws:cloudformation:us-east-1:123456789012:stack/{name}/x"),
                region: Some("us-east-1".to_string()),
                resources: 40,
            };
            serde_yaml::to_writer(File::create(dir.join(METADATA_FILE_NAME)).unwrap(), &metadata)
                .unwrap();
        }
    }

    #[test]
    fn test_active_deployments() {
        let base = std::env::temp_dir().join(format!("batchstack_list_{}", std::process::id()));
        assert!(active_deployments(&base).unwrap().is_empty());

        deployment(&base, "older", Some(100), false);
        deployment(&base, "newer", Some(200), false);
        deployment(&base, "gone", Some(300), true);
        deployment(&base, "bare", None, false);
        fs::create_dir_all(base.join("incomplete")).unwrap();

        let names: Vec<String> = active_deployments(&base)
            .unwrap()
            .into_iter()
            .map(|m| m.name)
            .collect();
        assert_eq!(names, vec!["newer", "older", "bare"]);

        fs::remove_dir_all(&base).unwrap();
    }
}
