use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which backend owns a record. Every entity ID is prefixed with the
/// owning provider's name (`native_`, `hubspot_`, `pipedrive_`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Native,
    Hubspot,
    Pipedrive,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Native => "native",
            ProviderKind::Hubspot => "hubspot",
            ProviderKind::Pipedrive => "pipedrive",
        }
    }

    pub fn id_prefix(&self) -> &'static str {
        match self {
            ProviderKind::Native => "native_",
            ProviderKind::Hubspot => "hubspot_",
            ProviderKind::Pipedrive => "pipedrive_",
        }
    }

    /// Builds the namespaced ID stored and exposed by this crate from a
    /// backend-native key.
    pub fn prefixed_id(&self, raw: &str) -> String {
        format!("{}{}", self.id_prefix(), raw)
    }

    /// Strips this provider's namespace prefix. IDs without the prefix are
    /// passed through unchanged so a stray raw vendor key still routes.
    pub fn strip_prefix<'a>(&self, id: &'a str) -> &'a str {
        id.strip_prefix(self.id_prefix()).unwrap_or(id)
    }

    pub fn all() -> [ProviderKind; 3] {
        [
            ProviderKind::Native,
            ProviderKind::Hubspot,
            ProviderKind::Pipedrive,
        ]
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = crate::error::CrmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "native" => Ok(ProviderKind::Native),
            "hubspot" => Ok(ProviderKind::Hubspot),
            "pipedrive" => Ok(ProviderKind::Pipedrive),
            other => Err(crate::error::CrmError::UnknownProvider(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Address {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub street: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub postal_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Customer {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    pub name: String,
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub company: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<Address>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub custom_fields: HashMap<String, String>,
    pub source: ProviderKind,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sync_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DealStage {
    New,
    Qualified,
    Proposal,
    Negotiation,
    ClosedWon,
    ClosedLost,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerDeal {
    pub id: String,
    pub customer_id: String,
    pub title: String,
    pub value: f64,
    pub stage: DealStage,
    pub probability: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_close_date: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    pub source: ProviderKind,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContactKind {
    Email,
    Phone,
    Meeting,
    Note,
}

/// A single interaction-history entry. Append-only; there is no update.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerContact {
    pub id: String,
    pub customer_id: String,
    #[serde(rename = "type")]
    pub kind: ContactKind,
    pub subject: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncFrequency {
    Realtime,
    Hourly,
    Daily,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrmConfig {
    pub provider: ProviderKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    pub sync_enabled: bool,
    pub sync_frequency: SyncFrequency,
    pub auto_create_projects: bool,
    pub auto_sync_quotes: bool,
}

impl Default for CrmConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::Native,
            api_key: None,
            domain: None,
            sync_enabled: false,
            sync_frequency: SyncFrequency::Daily,
            auto_create_projects: false,
            auto_sync_quotes: false,
        }
    }
}

/// Partial configuration update merged over the current config.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigPatch {
    pub provider: Option<ProviderKind>,
    pub api_key: Option<String>,
    pub domain: Option<String>,
    pub sync_enabled: Option<bool>,
    pub sync_frequency: Option<SyncFrequency>,
    pub auto_create_projects: Option<bool>,
    pub auto_sync_quotes: Option<bool>,
}

impl CrmConfig {
    pub fn merged(&self, patch: ConfigPatch) -> CrmConfig {
        CrmConfig {
            provider: patch.provider.unwrap_or(self.provider),
            api_key: patch.api_key.or_else(|| self.api_key.clone()),
            domain: patch.domain.or_else(|| self.domain.clone()),
            sync_enabled: patch.sync_enabled.unwrap_or(self.sync_enabled),
            sync_frequency: patch.sync_frequency.unwrap_or(self.sync_frequency),
            auto_create_projects: patch
                .auto_create_projects
                .unwrap_or(self.auto_create_projects),
            auto_sync_quotes: patch.auto_sync_quotes.unwrap_or(self.auto_sync_quotes),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    pub success: bool,
    pub records_processed: usize,
    pub records_created: usize,
    pub records_updated: usize,
    pub records_failed: usize,
    pub errors: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub is_active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sync: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_result: Option<SyncResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_sync: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewCustomer {
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub address: Option<Address>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub custom_fields: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerUpdate {
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub company: Option<String>,
    pub address: Option<Address>,
    pub tags: Option<Vec<String>>,
    pub custom_fields: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewDeal {
    pub customer_id: String,
    pub title: String,
    pub value: f64,
    pub stage: DealStage,
    pub probability: u8,
    #[serde(default)]
    pub expected_close_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DealUpdate {
    pub title: Option<String>,
    pub value: Option<f64>,
    pub stage: Option<DealStage>,
    pub probability: Option<u8>,
    pub expected_close_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewContact {
    pub customer_id: String,
    #[serde(rename = "type")]
    pub kind: ContactKind,
    pub subject: String,
    pub content: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_kind_prefix_round_trip() {
        for kind in ProviderKind::all() {
            let id = kind.prefixed_id("42");
            assert!(id.starts_with(kind.id_prefix()));
            assert_eq!(kind.strip_prefix(&id), "42");
        }
    }

    #[test]
    fn strip_prefix_passes_through_raw_ids() {
        assert_eq!(ProviderKind::Hubspot.strip_prefix("12345"), "12345");
    }

    #[test]
    fn provider_kind_parses_known_names() {
        assert_eq!("pipedrive".parse::<ProviderKind>().unwrap(), ProviderKind::Pipedrive);
        assert!("salesforce".parse::<ProviderKind>().is_err());
    }

    #[test]
    fn config_serializes_camel_case() {
        let config = CrmConfig {
            api_key: Some("k".into()),
            ..CrmConfig::default()
        };
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["provider"], "native");
        assert_eq!(json["apiKey"], "k");
        assert_eq!(json["syncEnabled"], false);
        assert_eq!(json["syncFrequency"], "daily");
    }

    #[test]
    fn merged_patch_overrides_only_given_fields() {
        let base = CrmConfig {
            api_key: Some("old".into()),
            ..CrmConfig::default()
        };
        let merged = base.merged(ConfigPatch {
            provider: Some(ProviderKind::Hubspot),
            sync_enabled: Some(true),
            ..ConfigPatch::default()
        });
        assert_eq!(merged.provider, ProviderKind::Hubspot);
        assert!(merged.sync_enabled);
        assert_eq!(merged.api_key.as_deref(), Some("old"));
    }

    #[test]
    fn deal_stage_serializes_snake_case() {
        let json = serde_json::to_value(DealStage::ClosedWon).unwrap();
        assert_eq!(json, "closed_won");
    }

    #[test]
    fn contact_type_field_name_is_type() {
        let contact = CustomerContact {
            id: "native_1_a".into(),
            customer_id: "native_1_b".into(),
            kind: ContactKind::Note,
            subject: "s".into(),
            content: "c".into(),
            timestamp: Utc::now(),
            external_id: None,
        };
        let json = serde_json::to_value(&contact).unwrap();
        assert_eq!(json["type"], "note");
        assert_eq!(json["customerId"], "native_1_b");
    }
}
