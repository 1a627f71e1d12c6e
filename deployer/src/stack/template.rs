//! CloudFormation template model and intrinsic function helpers
//!
//! Every keyed collection is a `BTreeMap` (and property objects are built in a fixed
//! order) so that synthesizing the same configuration twice yields byte-identical output.

use crate::stack::Error;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::{collections::BTreeMap, fmt, str::FromStr};
use tracing::debug;

/// Template format version accepted by CloudFormation
pub const FORMAT_VERSION: &str = "2010-09-09";

/// What happens to a resource when it is removed from the stack (or replaced)
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeletionPolicy {
    Delete,
    Retain,
    Snapshot,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct Resource {
    #[serde(rename = "Type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub properties: Value,
    #[serde(
        default,
        skip_serializing_if = "Vec::is_empty",
        deserialize_with = "one_or_many"
    )]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_policy: Option<DeletionPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_replace_policy: Option<DeletionPolicy>,
}

impl Resource {
    pub fn new(kind: &str, properties: Value) -> Self {
        Self {
            kind: kind.to_string(),
            properties,
            depends_on: Vec::new(),
            deletion_policy: None,
            update_replace_policy: None,
        }
    }

    /// Adds explicit ordering edges (beyond those implied by references)
    pub fn depends_on<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(ids.into_iter().map(Into::into));
        self
    }

    /// Applies the same policy to deletion and replacement
    pub fn removal(mut self, policy: DeletionPolicy) -> Self {
        self.deletion_policy = Some(policy);
        self.update_replace_policy = Some(policy);
        self
    }

    /// Returns a property by name (if properties are an object)
    pub fn property(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }
}

/// `DependsOn` may be written as a single string or a list
fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }
    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(id) => vec![id],
        OneOrMany::Many(ids) => ids,
    })
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct Parameter {
    #[serde(rename = "Type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct Output {
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct Template {
    #[serde(rename = "AWSTemplateFormatVersion")]
    pub format_version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, Parameter>,
    pub resources: BTreeMap<String, Resource>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, Output>,
}

impl Template {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            format_version: FORMAT_VERSION.to_string(),
            description: description.into(),
            parameters: BTreeMap::new(),
            resources: BTreeMap::new(),
            outputs: BTreeMap::new(),
        }
    }

    /// Declares a resource under a logical ID that must not already be taken
    pub fn add(&mut self, id: &str, resource: Resource) -> Result<(), Error> {
        if self.resources.contains_key(id) || self.parameters.contains_key(id) {
            return Err(Error::DuplicateLogicalId(id.to_string()));
        }
        debug!(id, kind = resource.kind.as_str(), "declared resource");
        self.resources.insert(id.to_string(), resource);
        Ok(())
    }

    pub fn add_parameter(&mut self, id: &str, parameter: Parameter) -> Result<(), Error> {
        if self.resources.contains_key(id) || self.parameters.contains_key(id) {
            return Err(Error::DuplicateLogicalId(id.to_string()));
        }
        self.parameters.insert(id.to_string(), parameter);
        Ok(())
    }

    pub fn add_output(&mut self, id: &str, value: Value, description: &str) {
        self.outputs.insert(
            id.to_string(),
            Output {
                value,
                description: Some(description.to_string()),
            },
        );
    }

    pub fn resource(&self, id: &str) -> Option<&Resource> {
        self.resources.get(id)
    }

    /// Iterates resources of a given type (in logical ID order)
    pub fn resources_of<'a>(
        &'a self,
        kind: &'a str,
    ) -> impl Iterator<Item = (&'a String, &'a Resource)> + 'a {
        self.resources.iter().filter(move |(_, r)| r.kind == kind)
    }

    pub fn to_json(&self) -> Result<String, Error> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Compact JSON (used for submission, where the body size is capped)
    pub fn to_json_compact(&self) -> Result<String, Error> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn to_yaml(&self) -> Result<String, Error> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn render(&self, format: Format) -> Result<String, Error> {
        match format {
            Format::Json => self.to_json(),
            Format::Yaml => self.to_yaml(),
        }
    }

    /// Parses a template from JSON, falling back to YAML
    pub fn parse(body: &str) -> Result<Self, Error> {
        match serde_json::from_str(body) {
            Ok(template) => Ok(template),
            Err(_) => Ok(serde_yaml::from_str(body)?),
        }
    }
}

/// Serialization format of a rendered template
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Format {
    #[default]
    Json,
    Yaml,
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Format::Json => write!(f, "json"),
            Format::Yaml => write!(f, "yaml"),
        }
    }
}

impl FromStr for Format {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" => Ok(Format::Json),
            "yaml" | "yml" => Ok(Format::Yaml),
            other => Err(Error::InvalidFormat(other.to_string())),
        }
    }
}

/// `{"Ref": id}`
pub fn reference(id: &str) -> Value {
    json!({ "Ref": id })
}

/// `{"Fn::GetAtt": [id, attribute]}`
pub fn get_att(id: &str, attribute: &str) -> Value {
    json!({ "Fn::GetAtt": [id, attribute] })
}

/// `{"Fn::Sub": template}`
pub fn sub(template: &str) -> Value {
    json!({ "Fn::Sub": template })
}

pub fn join(delimiter: &str, values: Vec<Value>) -> Value {
    json!({ "Fn::Join": [delimiter, values] })
}

/// Selects the `index`th availability zone of the deployment region
pub fn select_az(index: usize) -> Value {
    json!({ "Fn::Select": [index, { "Fn::GetAZs": "" }] })
}

pub fn base64(value: Value) -> Value {
    json!({ "Fn::Base64": value })
}

/// A single-entry tag list naming the resource
pub fn name_tag(name: &str) -> Value {
    json!([{ "Key": "Name", "Value": name }])
}

/// Extracts the logical ID a value points at, if it is a `Ref` or `Fn::GetAtt`
pub fn referenced_id(value: &Value) -> Option<&str> {
    if let Some(id) = value.get("Ref").and_then(Value::as_str) {
        return Some(id);
    }
    match value.get("Fn::GetAtt") {
        Some(Value::Array(parts)) => parts.first().and_then(Value::as_str),
        Some(Value::String(dotted)) => dotted.split('.').next(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_logical_id() {
        let mut template = Template::new("test");
        template
            .add("Bucket", Resource::new("AWS::S3::Bucket", json!({})))
            .unwrap();
        let result = template.add("Bucket", Resource::new("AWS::S3::Bucket", json!({})));
        assert!(matches!(result, Err(Error::DuplicateLogicalId(id)) if id == "Bucket"));
    }

    #[test]
    fn test_serialized_shape() {
        let mut template = Template::new("test");
        template
            .add(
                "Fs",
                Resource::new("AWS::EFS::FileSystem", json!({ "Encrypted": true }))
                    .removal(DeletionPolicy::Retain),
            )
            .unwrap();
        template.add_output("FileSystemId", reference("Fs"), "file system");
        let value: Value = serde_json::from_str(&template.to_json().unwrap()).unwrap();
        assert_eq!(value["AWSTemplateFormatVersion"], FORMAT_VERSION);
        assert_eq!(value["Resources"]["Fs"]["Type"], "AWS::EFS::FileSystem");
        assert_eq!(value["Resources"]["Fs"]["DeletionPolicy"], "Retain");
        assert_eq!(value["Resources"]["Fs"]["UpdateReplacePolicy"], "Retain");
        assert!(value["Resources"]["Fs"].get("DependsOn").is_none());
        assert!(value.get("Parameters").is_none());
        assert_eq!(value["Outputs"]["FileSystemId"]["Value"]["Ref"], "Fs");
    }

    #[test]
    fn test_parse_json_and_yaml() {
        let mut template = Template::new("test");
        template
            .add(
                "Host",
                Resource::new("AWS::EC2::Instance", json!({})).depends_on(["A", "B"]),
            )
            .unwrap();
        assert_eq!(Template::parse(&template.to_json().unwrap()).unwrap(), template);
        assert_eq!(Template::parse(&template.to_yaml().unwrap()).unwrap(), template);
    }

    #[test]
    fn test_depends_on_single_string() {
        let body = r#"{
            "AWSTemplateFormatVersion": "2010-09-09",
            "Resources": { "A": { "Type": "AWS::SNS::Topic", "DependsOn": "B" } }
        }"#;
        let template = Template::parse(body).unwrap();
        assert_eq!(template.resources["A"].depends_on, vec!["B".to_string()]);
    }

    #[test]
    fn test_referenced_id() {
        assert_eq!(referenced_id(&reference("Vpc")), Some("Vpc"));
        assert_eq!(referenced_id(&get_att("Sg", "GroupId")), Some("Sg"));
        assert_eq!(referenced_id(&json!({ "Fn::GetAtt": "Sg.GroupId" })), Some("Sg"));
        assert_eq!(referenced_id(&json!("sg-123")), None);
    }

    #[test]
    fn test_format_parse() {
        assert_eq!("json".parse::<Format>().unwrap(), Format::Json);
        assert_eq!("yml".parse::<Format>().unwrap(), Format::Yaml);
        assert!("toml".parse::<Format>().is_err());
    }
}
