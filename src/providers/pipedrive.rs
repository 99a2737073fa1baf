use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use parking_lot::Mutex;
use reqwest::{Client, StatusCode};
use serde::Deserialize;

use super::{CrmProvider, SyncTracker};
use crate::error::CrmError;
use crate::types::{
    CrmConfig, Customer, CustomerContact, CustomerDeal, CustomerUpdate, DealStage, DealUpdate,
    NewContact, NewCustomer, NewDeal, ProviderKind, SyncResult, SyncStatus,
};

/// Maps a canonical stage to Pipedrive's numeric pipeline stage IDs. The
/// table assumes the default six-stage pipeline; custom pipelines would
/// need this to be configurable.
pub fn map_stage_to_stage_id(stage: DealStage) -> i64 {
    match stage {
        DealStage::New => 1,
        DealStage::Qualified => 2,
        DealStage::Proposal => 3,
        DealStage::Negotiation => 4,
        DealStage::ClosedWon => 5,
        DealStage::ClosedLost => 6,
    }
}

/// Inverse of [`map_stage_to_stage_id`]. Unknown IDs collapse to `New`,
/// which is lossy.
pub fn map_stage_id_to_stage(stage_id: i64) -> DealStage {
    match stage_id {
        1 => DealStage::New,
        2 => DealStage::Qualified,
        3 => DealStage::Proposal,
        4 => DealStage::Negotiation,
        5 => DealStage::ClosedWon,
        6 => DealStage::ClosedLost,
        _ => DealStage::New,
    }
}

// Pipedrive timestamps come back as "2024-03-01 12:30:00" in UTC.
fn parse_time(raw: Option<&str>) -> DateTime<Utc> {
    raw.and_then(|s| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").ok())
        .map(|naive| naive.and_utc())
        .unwrap_or_else(Utc::now)
}

fn parse_date(raw: Option<&str>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    success: bool,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct ContactField {
    value: String,
    #[serde(default)]
    primary: bool,
}

// Pipedrive returns person references either as a bare ID or as an
// expanded object depending on the endpoint.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PersonRef {
    Id(i64),
    Object { value: i64 },
}

impl PersonRef {
    fn value(&self) -> i64 {
        match self {
            PersonRef::Id(id) => *id,
            PersonRef::Object { value } => *value,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Person {
    id: i64,
    name: Option<String>,
    #[serde(default)]
    email: Vec<ContactField>,
    #[serde(default)]
    phone: Vec<ContactField>,
    org_name: Option<String>,
    add_time: Option<String>,
    update_time: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Deal {
    id: i64,
    title: Option<String>,
    value: Option<f64>,
    stage_id: Option<i64>,
    probability: Option<f64>,
    person_id: Option<PersonRef>,
    expected_close_date: Option<String>,
    add_time: Option<String>,
    update_time: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Note {
    id: i64,
}

#[derive(Default)]
struct AuthState {
    api_key: Option<String>,
    base_url: Option<String>,
}

/// Pipedrive backend over the v1 REST API, authenticated with a
/// query-string API token. Requires both an API key and the account's
/// domain.
pub struct PipedriveProvider {
    http: Client,
    state: Mutex<AuthState>,
    tracker: Mutex<SyncTracker>,
}

impl Default for PipedriveProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl PipedriveProvider {
    pub fn new() -> Self {
        Self {
            http: Client::new(),
            state: Mutex::new(AuthState::default()),
            tracker: Mutex::new(SyncTracker::default()),
        }
    }

    fn credentials(&self) -> Result<(String, String), CrmError> {
        let state = self.state.lock();
        match (&state.api_key, &state.base_url) {
            (Some(key), Some(base)) => Ok((key.clone(), base.clone())),
            _ => Err(CrmError::NotAuthenticated(ProviderKind::Pipedrive)),
        }
    }

    fn transport(err: reqwest::Error) -> CrmError {
        CrmError::Transport {
            provider: ProviderKind::Pipedrive,
            source: err,
        }
    }

    async fn api_error(response: reqwest::Response) -> CrmError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        CrmError::Api {
            provider: ProviderKind::Pipedrive,
            status: status.as_u16(),
            message: body,
        }
    }

    fn primary_value(fields: &[ContactField]) -> Option<String> {
        fields
            .iter()
            .find(|f| f.primary)
            .or_else(|| fields.first())
            .map(|f| f.value.clone())
            .filter(|v| !v.is_empty())
    }

    fn map_person(person: Person) -> Customer {
        Customer {
            id: ProviderKind::Pipedrive.prefixed_id(&person.id.to_string()),
            external_id: Some(person.id.to_string()),
            name: person.name.unwrap_or_default(),
            email: Self::primary_value(&person.email).unwrap_or_default(),
            phone: Self::primary_value(&person.phone),
            company: person.org_name.filter(|o| !o.is_empty()),
            address: None,
            tags: Vec::new(),
            custom_fields: Default::default(),
            source: ProviderKind::Pipedrive,
            created_at: parse_time(person.add_time.as_deref()),
            updated_at: parse_time(person.update_time.as_deref()),
            last_sync_at: None,
        }
    }

    fn map_deal(deal: Deal, fallback_customer_id: Option<&str>) -> CustomerDeal {
        let customer_id = deal
            .person_id
            .as_ref()
            .map(|p| ProviderKind::Pipedrive.prefixed_id(&p.value().to_string()))
            .or_else(|| fallback_customer_id.map(str::to_string))
            .unwrap_or_default();

        CustomerDeal {
            id: ProviderKind::Pipedrive.prefixed_id(&deal.id.to_string()),
            customer_id,
            title: deal.title.unwrap_or_default(),
            value: deal.value.unwrap_or(0.0),
            stage: deal
                .stage_id
                .map(map_stage_id_to_stage)
                .unwrap_or(DealStage::New),
            probability: deal
                .probability
                .map(|p| p.clamp(0.0, 100.0) as u8)
                .unwrap_or(0),
            expected_close_date: parse_date(deal.expected_close_date.as_deref()),
            external_id: Some(deal.id.to_string()),
            source: ProviderKind::Pipedrive,
            created_at: parse_time(deal.add_time.as_deref()),
            updated_at: parse_time(deal.update_time.as_deref()),
        }
    }

    async fn fetch_persons(
        &self,
        key: &str,
        base: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Customer>, CrmError> {
        let response = self
            .http
            .get(format!(
                "{}/persons?limit={}&start={}&api_token={}",
                base, limit, offset, key
            ))
            .send()
            .await
            .map_err(Self::transport)?;

        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }

        let envelope: Envelope<Vec<Person>> =
            response.json().await.map_err(Self::transport)?;
        Ok(envelope
            .data
            .unwrap_or_default()
            .into_iter()
            .map(Self::map_person)
            .collect())
    }

    async fn add_note(&self, raw_person_id: &str, content: &str) -> Result<i64, CrmError> {
        let (key, base) = self.credentials()?;

        let response = self
            .http
            .post(format!("{}/notes?api_token={}", base, key))
            .json(&serde_json::json!({
                "content": content,
                "person_id": raw_person_id.parse::<i64>().unwrap_or_default(),
            }))
            .send()
            .await
            .map_err(Self::transport)?;

        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }

        let envelope: Envelope<Note> = response.json().await.map_err(Self::transport)?;
        Ok(envelope.data.map(|n| n.id).unwrap_or_default())
    }
}

#[async_trait::async_trait]
impl CrmProvider for PipedriveProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Pipedrive
    }

    async fn authenticate(&self, config: &CrmConfig) -> Result<bool, CrmError> {
        let key = match config.api_key.as_deref() {
            Some(key) if !key.is_empty() => key.to_string(),
            _ => {
                return Err(CrmError::MissingCredential {
                    provider: ProviderKind::Pipedrive,
                    field: "apiKey",
                })
            }
        };
        let domain = match config.domain.as_deref() {
            Some(domain) if !domain.is_empty() => domain.to_string(),
            _ => {
                return Err(CrmError::MissingCredential {
                    provider: ProviderKind::Pipedrive,
                    field: "domain",
                })
            }
        };

        let base = format!("https://{}.pipedrive.com/api/v1", domain);
        let probe = self
            .http
            .get(format!("{}/users/me?api_token={}", base, key))
            .send()
            .await;

        match probe {
            Ok(response) if response.status().is_success() => {
                let mut state = self.state.lock();
                state.api_key = Some(key);
                state.base_url = Some(base);
                Ok(true)
            }
            Ok(response) => {
                log::warn!("pipedrive auth probe rejected ({})", response.status());
                Ok(false)
            }
            Err(err) => {
                log::warn!("pipedrive auth probe failed: {}", err);
                Ok(false)
            }
        }
    }

    fn is_authenticated(&self) -> bool {
        let state = self.state.lock();
        state.api_key.is_some() && state.base_url.is_some()
    }

    async fn get_customers(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Customer>, CrmError> {
        let (key, base) = self.credentials()?;
        self.fetch_persons(&key, &base, limit, offset).await
    }

    async fn get_customer(&self, id: &str) -> Result<Option<Customer>, CrmError> {
        let (key, base) = self.credentials()?;
        let raw = ProviderKind::Pipedrive.strip_prefix(id);

        let response = self
            .http
            .get(format!("{}/persons/{}?api_token={}", base, raw, key))
            .send()
            .await
            .map_err(Self::transport)?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }

        let envelope: Envelope<Person> = response.json().await.map_err(Self::transport)?;
        if !envelope.success {
            return Ok(None);
        }
        Ok(envelope.data.map(Self::map_person))
    }

    async fn create_customer(&self, data: NewCustomer) -> Result<Customer, CrmError> {
        let (key, base) = self.credentials()?;

        let response = self
            .http
            .post(format!("{}/persons?api_token={}", base, key))
            .json(&serde_json::json!({
                "name": data.name,
                "email": data.email,
                "phone": data.phone,
            }))
            .send()
            .await
            .map_err(Self::transport)?;

        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }

        let envelope: Envelope<Person> = response.json().await.map_err(Self::transport)?;
        let person = envelope.data.ok_or_else(|| CrmError::Api {
            provider: ProviderKind::Pipedrive,
            status: 200,
            message: "create person returned no data".into(),
        })?;

        let mut customer = Self::map_person(person);
        customer.company = data.company.or(customer.company);
        customer.address = data.address;
        customer.tags = data.tags;
        customer.custom_fields = data.custom_fields;
        Ok(customer)
    }

    async fn update_customer(
        &self,
        id: &str,
        updates: CustomerUpdate,
    ) -> Result<Customer, CrmError> {
        let (key, base) = self.credentials()?;
        let raw = ProviderKind::Pipedrive.strip_prefix(id);

        let mut body = serde_json::Map::new();
        if let Some(name) = updates.name {
            body.insert("name".into(), name.into());
        }
        if let Some(email) = updates.email {
            body.insert("email".into(), email.into());
        }
        if let Some(phone) = updates.phone {
            body.insert("phone".into(), phone.into());
        }

        let response = self
            .http
            .put(format!("{}/persons/{}?api_token={}", base, raw, key))
            .json(&serde_json::Value::Object(body))
            .send()
            .await
            .map_err(Self::transport)?;

        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }

        let envelope: Envelope<Person> = response.json().await.map_err(Self::transport)?;
        let person = envelope.data.ok_or_else(|| CrmError::NotFound {
            entity: "customer",
            id: id.to_string(),
        })?;
        Ok(Self::map_person(person))
    }

    async fn delete_customer(&self, id: &str) -> Result<bool, CrmError> {
        let (key, base) = self.credentials()?;
        let raw = ProviderKind::Pipedrive.strip_prefix(id);

        let response = self
            .http
            .delete(format!("{}/persons/{}?api_token={}", base, raw, key))
            .send()
            .await
            .map_err(Self::transport)?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }
        Ok(true)
    }

    async fn get_customer_deals(
        &self,
        customer_id: &str,
    ) -> Result<Vec<CustomerDeal>, CrmError> {
        let (key, base) = self.credentials()?;
        let raw = ProviderKind::Pipedrive.strip_prefix(customer_id);

        let response = self
            .http
            .get(format!("{}/persons/{}/deals?api_token={}", base, raw, key))
            .send()
            .await
            .map_err(Self::transport)?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }

        let envelope: Envelope<Vec<Deal>> =
            response.json().await.map_err(Self::transport)?;
        Ok(envelope
            .data
            .unwrap_or_default()
            .into_iter()
            .map(|deal| Self::map_deal(deal, Some(customer_id)))
            .collect())
    }

    async fn create_deal(&self, data: NewDeal) -> Result<CustomerDeal, CrmError> {
        let (key, base) = self.credentials()?;
        let raw_person = ProviderKind::Pipedrive.strip_prefix(&data.customer_id);

        let mut body = serde_json::Map::new();
        body.insert("title".into(), data.title.clone().into());
        body.insert("value".into(), data.value.into());
        body.insert("stage_id".into(), map_stage_to_stage_id(data.stage).into());
        body.insert(
            "person_id".into(),
            raw_person.parse::<i64>().unwrap_or_default().into(),
        );
        body.insert("probability".into(), (data.probability as i64).into());
        if let Some(date) = data.expected_close_date {
            body.insert(
                "expected_close_date".into(),
                date.format("%Y-%m-%d").to_string().into(),
            );
        }

        let response = self
            .http
            .post(format!("{}/deals?api_token={}", base, key))
            .json(&serde_json::Value::Object(body))
            .send()
            .await
            .map_err(Self::transport)?;

        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }

        let envelope: Envelope<Deal> = response.json().await.map_err(Self::transport)?;
        let deal = envelope.data.ok_or_else(|| CrmError::Api {
            provider: ProviderKind::Pipedrive,
            status: 200,
            message: "create deal returned no data".into(),
        })?;
        Ok(Self::map_deal(deal, Some(&data.customer_id)))
    }

    async fn update_deal(
        &self,
        id: &str,
        updates: DealUpdate,
    ) -> Result<CustomerDeal, CrmError> {
        let (key, base) = self.credentials()?;
        let raw = ProviderKind::Pipedrive.strip_prefix(id);

        let mut body = serde_json::Map::new();
        if let Some(title) = updates.title {
            body.insert("title".into(), title.into());
        }
        if let Some(value) = updates.value {
            body.insert("value".into(), value.into());
        }
        if let Some(stage) = updates.stage {
            body.insert("stage_id".into(), map_stage_to_stage_id(stage).into());
        }
        if let Some(probability) = updates.probability {
            body.insert("probability".into(), (probability as i64).into());
        }
        if let Some(date) = updates.expected_close_date {
            body.insert(
                "expected_close_date".into(),
                date.format("%Y-%m-%d").to_string().into(),
            );
        }

        let response = self
            .http
            .put(format!("{}/deals/{}?api_token={}", base, raw, key))
            .json(&serde_json::Value::Object(body))
            .send()
            .await
            .map_err(Self::transport)?;

        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }

        let envelope: Envelope<Deal> = response.json().await.map_err(Self::transport)?;
        let deal = envelope.data.ok_or_else(|| CrmError::NotFound {
            entity: "deal",
            id: id.to_string(),
        })?;
        Ok(Self::map_deal(deal, None))
    }

    async fn get_customer_contacts(
        &self,
        _customer_id: &str,
    ) -> Result<Vec<CustomerContact>, CrmError> {
        // Activity timeline is not integrated; contact history lives on the
        // native provider.
        Ok(Vec::new())
    }

    async fn add_contact(&self, data: NewContact) -> Result<CustomerContact, CrmError> {
        let raw_person = ProviderKind::Pipedrive
            .strip_prefix(&data.customer_id)
            .to_string();
        let note_id = self
            .add_note(&raw_person, &format!("{}\n\n{}", data.subject, data.content))
            .await?;

        Ok(CustomerContact {
            id: ProviderKind::Pipedrive.prefixed_id(&note_id.to_string()),
            customer_id: data.customer_id,
            kind: data.kind,
            subject: data.subject,
            content: data.content,
            timestamp: Utc::now(),
            external_id: Some(note_id.to_string()),
        })
    }

    async fn sync(&self) -> Result<SyncResult, CrmError> {
        let (key, base) = self.credentials()?;
        self.tracker.lock().active = true;

        let timestamp = Utc::now();
        let result = match self.fetch_persons(&key, &base, 100, 0).await {
            Ok(customers) => SyncResult {
                success: true,
                records_processed: customers.len(),
                records_created: 0,
                records_updated: customers.len(),
                records_failed: 0,
                errors: Vec::new(),
                timestamp,
            },
            Err(err) => SyncResult {
                success: false,
                records_processed: 0,
                records_created: 0,
                records_updated: 0,
                records_failed: 0,
                errors: vec![err.to_string()],
                timestamp,
            },
        };

        self.tracker.lock().record(result.clone());
        Ok(result)
    }

    fn last_sync_status(&self) -> SyncStatus {
        self.tracker.lock().status()
    }

    async fn link_project_to_customer(
        &self,
        project_id: &str,
        customer_id: &str,
    ) -> Result<(), CrmError> {
        let raw = ProviderKind::Pipedrive.strip_prefix(customer_id).to_string();
        self.add_note(&raw, &format!("Linked project {}", project_id))
            .await?;
        Ok(())
    }

    async fn link_quote_to_customer(
        &self,
        quote_id: &str,
        customer_id: &str,
    ) -> Result<(), CrmError> {
        let raw = ProviderKind::Pipedrive.strip_prefix(customer_id).to_string();
        self.add_note(&raw, &format!("Linked quote {}", quote_id))
            .await?;
        Ok(())
    }

    async fn notify_quote_status_change(
        &self,
        quote_id: &str,
        status: &str,
        customer_id: &str,
    ) -> Result<(), CrmError> {
        let raw = ProviderKind::Pipedrive.strip_prefix(customer_id).to_string();
        self.add_note(
            &raw,
            &format!("Quote {} status changed to {}", quote_id, status),
        )
        .await?;
        Ok(())
    }
}
