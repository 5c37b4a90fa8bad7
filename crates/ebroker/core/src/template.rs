//! Node templates offered to the resource manager.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::codes::ProvCode;
use crate::error::BrokerError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Template {
    pub template_id: String,
    pub max_number: u32,
    /// Resource attributes as `name -> [type, value]`, e.g. `"ncpus": ["Numeric", "4"]`.
    #[serde(default)]
    pub attributes: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub preemptible: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_array: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u32>,
    /// `key=value` pairs separated by `;`, passed to the node at boot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_data: Option<String>,
}

impl Template {
    pub fn user_data_pairs(&self) -> Vec<(String, String)> {
        let Some(raw) = self.user_data.as_deref() else {
            return Vec::new();
        };
        raw.split(';')
            .filter_map(|pair| pair.split_once('='))
            .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
            .filter(|(k, _)| !k.is_empty())
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateCatalog {
    pub templates: Vec<Template>,
}

impl TemplateCatalog {
    pub fn new(templates: Vec<Template>) -> Result<Self, BrokerError> {
        let catalog = TemplateCatalog { templates };
        catalog.validate()?;
        Ok(catalog)
    }

    /// Read `{"templates": [...]}` from `path`.
    pub fn load(path: &Path) -> Result<Self, BrokerError> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(BrokerError::refused(ProvCode::NotExistFile, path.display().to_string()));
            }
            Err(e) => return Err(BrokerError::io(path, e)),
        };
        let catalog: TemplateCatalog =
            serde_json::from_str(&contents).map_err(|e| BrokerError::json(path, e))?;
        catalog.validate()?;
        Ok(catalog)
    }

    fn validate(&self) -> Result<(), BrokerError> {
        let mut seen = HashSet::new();
        for template in &self.templates {
            if template.template_id.trim().is_empty() {
                return Err(BrokerError::refused(ProvCode::BadTemplate, "with an empty templateId"));
            }
            if !seen.insert(template.template_id.as_str()) {
                return Err(BrokerError::refused(
                    ProvCode::BadTemplate,
                    format!("{} (listed twice)", template.template_id),
                ));
            }
            if template.max_number == 0 {
                return Err(BrokerError::refused(
                    ProvCode::BadTemplate,
                    format!("{} (maxNumber is 0)", template.template_id),
                ));
            }
        }
        Ok(())
    }

    pub fn find(&self, template_id: &str) -> Option<&Template> {
        self.templates.iter().find(|t| t.template_id == template_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const CATALOG: &str = r#"{
        "templates": [
            {
                "templateId": "execute",
                "maxNumber": 10,
                "attributes": {"ncpus": ["Numeric", "4"], "type": ["String", "X86_64"]},
                "machineType": "Standard_F4s_v2",
                "nodeArray": "execute",
                "userData": "role=worker; queue = batch;;bogus"
            },
            {"templateId": "spot", "maxNumber": 4, "preemptible": true}
        ]
    }"#;

    #[test]
    fn loads_catalog_from_disk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("templates.json");
        fs::write(&path, CATALOG).unwrap();
        let catalog = TemplateCatalog::load(&path).unwrap();
        let execute = catalog.find("execute").unwrap();
        assert_eq!(execute.max_number, 10);
        assert_eq!(execute.attributes["ncpus"], vec!["Numeric", "4"]);
        assert_eq!(
            execute.user_data_pairs(),
            vec![("role".to_string(), "worker".to_string()), ("queue".to_string(), "batch".to_string())]
        );
        assert!(catalog.find("spot").unwrap().preemptible);
        assert!(catalog.find("missing").is_none());
    }

    #[test]
    fn missing_file_and_bad_json_map_to_codes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("templates.json");
        assert_eq!(TemplateCatalog::load(&path).unwrap_err().code(), ProvCode::NotExistFile);
        fs::write(&path, "{\"templates\": [").unwrap();
        assert_eq!(TemplateCatalog::load(&path).unwrap_err().code(), ProvCode::BadJsonFile);
    }

    #[test]
    fn duplicate_ids_are_a_bad_template() {
        let t = Template {
            template_id: "dup".into(),
            max_number: 1,
            attributes: BTreeMap::new(),
            preemptible: false,
            machine_type: None,
            node_array: None,
            priority: None,
            user_data: None,
        };
        let err = TemplateCatalog::new(vec![t.clone(), t]).unwrap_err();
        assert_eq!(err.code(), ProvCode::BadTemplate);
    }
}
