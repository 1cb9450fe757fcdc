use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// one row of the GSEA core-gene table, held by the client as its pathway selection
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PathwaySelection {
    #[serde(rename = "ID", default)]
    pub id: String,
    #[serde(rename = "Description", default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(
        rename = "NES",
        default,
        deserialize_with = "lenient_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub nes: Option<f64>,
    #[serde(
        rename = "p.adjust",
        alias = "adjusted_p_value",
        default,
        deserialize_with = "lenient_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub adjusted_p_value: Option<f64>,
    #[serde(default)]
    pub core_genes: Vec<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl PathwaySelection {
    pub fn new(id: &str, description: Option<&str>, core_genes: &[&str]) -> Self {
        Self {
            id: id.to_string(),
            description: description.map(str::to_string),
            core_genes: core_genes.iter().map(|g| g.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn label(&self) -> &str {
        match self.description.as_deref() {
            Some(description) if !description.is_empty() => description,
            _ => &self.id,
        }
    }

    /// the backend needs at least an id or a description to locate the pathway
    pub fn is_addressable(&self) -> bool {
        !self.id.trim().is_empty()
            || self
                .description
                .as_deref()
                .map_or(false, |d| !d.trim().is_empty())
    }

    pub fn mark_genes(&self) -> String {
        self.core_genes.join(",")
    }
}

// R writes NA as a string or null; both mean "no value"
fn lenient_number<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    // testing a row as written by the analysis scripts
    #[test]
    fn test_decode_core_gene_row() {
        let rows: Vec<PathwaySelection> = serde_json::from_str(
            r#"[
                {"ID": "hsa04110", "Description": "Cell cycle", "NES": 2.13, "p.adjust": 0.0004,
                 "setSize": 120, "core_genes": ["TP53", "MDM2", "CDK1"]},
                {"ID": "hsa04115", "Description": "", "NES": "NA", "p.adjust": null, "core_genes": []}
            ]"#,
        )
        .unwrap();
        assert_eq!(2, rows.len());
        assert_eq!("Cell cycle", rows[0].label());
        assert_eq!(Some(2.13), rows[0].nes);
        assert_eq!(Some(0.0004), rows[0].adjusted_p_value);
        assert_eq!("TP53,MDM2,CDK1", rows[0].mark_genes());
        assert_eq!(Some(&Value::from(120)), rows[0].extra.get("setSize"));
        assert_eq!("hsa04115", rows[1].label());
        assert_eq!(None, rows[1].nes);
        assert_eq!(None, rows[1].adjusted_p_value);
    }

    #[test]
    fn test_addressable() {
        assert!(PathwaySelection::new("hsa04110", None, &[]).is_addressable());
        assert!(PathwaySelection::new("", Some("Cell cycle"), &[]).is_addressable());
        assert!(!PathwaySelection::new(" ", Some(""), &[]).is_addressable());
    }
}
