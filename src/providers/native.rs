use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use super::{CrmProvider, SyncTracker};
use crate::error::CrmError;
use crate::store::KeyValueStore;
use crate::types::{
    CrmConfig, Customer, CustomerContact, CustomerDeal, CustomerUpdate, DealUpdate, NewContact,
    NewCustomer, NewDeal, ProviderKind, SyncResult, SyncStatus,
};

const CUSTOMERS_KEY: &str = "customers";
const DEALS_KEY: &str = "deals";
const CONTACTS_KEY: &str = "contacts";
const PROJECT_LINKS_KEY: &str = "projectLinks";
const QUOTE_LINKS_KEY: &str = "quoteLinks";

/// Built-in CRM backend over the durable key-value store. No external
/// authentication; all operations are local read-modify-write cycles.
pub struct NativeProvider {
    store: Arc<dyn KeyValueStore>,
    // Serializes every read-modify-write cycle. Nothing awaits while this
    // is held.
    write_guard: Mutex<()>,
    tracker: Mutex<SyncTracker>,
}

impl NativeProvider {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            write_guard: Mutex::new(()),
            tracker: Mutex::new(SyncTracker::default()),
        }
    }

    fn generate_id() -> String {
        let millis = Utc::now().timestamp_millis();
        let suffix = Uuid::new_v4().simple().to_string();
        format!("native_{}_{}", millis, &suffix[..8])
    }

    fn load_list<T: DeserializeOwned>(&self, key: &str) -> Result<Vec<T>, CrmError> {
        match self.store.get(key)? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(Vec::new()),
        }
    }

    fn save_list<T: Serialize>(&self, key: &str, items: &[T]) -> Result<(), CrmError> {
        let raw = serde_json::to_string(items)?;
        self.store.set(key, &raw)
    }

    fn load_links(&self, key: &str) -> Result<HashMap<String, String>, CrmError> {
        match self.store.get(key)? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(HashMap::new()),
        }
    }

    fn save_links(&self, key: &str, links: &HashMap<String, String>) -> Result<(), CrmError> {
        let raw = serde_json::to_string(links)?;
        self.store.set(key, &raw)
    }

    fn require_customer(&self, customers: &[Customer], id: &str) -> Result<(), CrmError> {
        if customers.iter().any(|c| c.id == id) {
            Ok(())
        } else {
            Err(CrmError::NotFound {
                entity: "customer",
                id: id.to_string(),
            })
        }
    }

    fn validate_deal(value: f64, probability: u8) -> Result<(), CrmError> {
        if value < 0.0 {
            return Err(CrmError::Validation(format!(
                "deal value must be non-negative, got {}",
                value
            )));
        }
        if probability > 100 {
            return Err(CrmError::Validation(format!(
                "deal probability must be 0-100, got {}",
                probability
            )));
        }
        Ok(())
    }

    fn append_note(
        &self,
        customer_id: &str,
        subject: &str,
        content: &str,
    ) -> Result<CustomerContact, CrmError> {
        let _guard = self.write_guard.lock();
        let customers: Vec<Customer> = self.load_list(CUSTOMERS_KEY)?;
        self.require_customer(&customers, customer_id)?;

        let contact = CustomerContact {
            id: Self::generate_id(),
            customer_id: customer_id.to_string(),
            kind: crate::types::ContactKind::Note,
            subject: subject.to_string(),
            content: content.to_string(),
            timestamp: Utc::now(),
            external_id: None,
        };

        let mut contacts: Vec<CustomerContact> = self.load_list(CONTACTS_KEY)?;
        contacts.push(contact.clone());
        self.save_list(CONTACTS_KEY, &contacts)?;
        Ok(contact)
    }

    fn record_link(&self, key: &str, from_id: &str, customer_id: &str) -> Result<(), CrmError> {
        let _guard = self.write_guard.lock();
        let customers: Vec<Customer> = self.load_list(CUSTOMERS_KEY)?;
        self.require_customer(&customers, customer_id)?;

        let mut links = self.load_links(key)?;
        links.insert(from_id.to_string(), customer_id.to_string());
        self.save_links(key, &links)
    }
}

#[async_trait]
impl CrmProvider for NativeProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Native
    }

    async fn authenticate(&self, _config: &CrmConfig) -> Result<bool, CrmError> {
        Ok(true)
    }

    fn is_authenticated(&self) -> bool {
        true
    }

    async fn get_customers(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Customer>, CrmError> {
        let customers: Vec<Customer> = self.load_list(CUSTOMERS_KEY)?;
        Ok(customers.into_iter().skip(offset).take(limit).collect())
    }

    async fn get_customer(&self, id: &str) -> Result<Option<Customer>, CrmError> {
        let customers: Vec<Customer> = self.load_list(CUSTOMERS_KEY)?;
        Ok(customers.into_iter().find(|c| c.id == id))
    }

    async fn create_customer(&self, data: NewCustomer) -> Result<Customer, CrmError> {
        let now = Utc::now();
        let customer = Customer {
            id: Self::generate_id(),
            external_id: None,
            name: data.name,
            email: data.email,
            phone: data.phone,
            company: data.company,
            address: data.address,
            tags: data.tags,
            custom_fields: data.custom_fields,
            source: ProviderKind::Native,
            created_at: now,
            updated_at: now,
            last_sync_at: None,
        };

        let _guard = self.write_guard.lock();
        let mut customers: Vec<Customer> = self.load_list(CUSTOMERS_KEY)?;
        customers.push(customer.clone());
        self.save_list(CUSTOMERS_KEY, &customers)?;
        Ok(customer)
    }

    async fn update_customer(
        &self,
        id: &str,
        updates: CustomerUpdate,
    ) -> Result<Customer, CrmError> {
        let _guard = self.write_guard.lock();
        let mut customers: Vec<Customer> = self.load_list(CUSTOMERS_KEY)?;

        let customer = customers
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| CrmError::NotFound {
                entity: "customer",
                id: id.to_string(),
            })?;

        if let Some(name) = updates.name {
            customer.name = name;
        }
        if let Some(email) = updates.email {
            customer.email = email;
        }
        if let Some(phone) = updates.phone {
            customer.phone = Some(phone);
        }
        if let Some(company) = updates.company {
            customer.company = Some(company);
        }
        if let Some(address) = updates.address {
            customer.address = Some(address);
        }
        if let Some(tags) = updates.tags {
            customer.tags = tags;
        }
        if let Some(fields) = updates.custom_fields {
            customer.custom_fields = fields;
        }
        customer.updated_at = Utc::now();

        let updated = customer.clone();
        self.save_list(CUSTOMERS_KEY, &customers)?;
        Ok(updated)
    }

    async fn delete_customer(&self, id: &str) -> Result<bool, CrmError> {
        let _guard = self.write_guard.lock();
        let mut customers: Vec<Customer> = self.load_list(CUSTOMERS_KEY)?;
        let before = customers.len();
        customers.retain(|c| c.id != id);
        if customers.len() == before {
            return Ok(false);
        }
        self.save_list(CUSTOMERS_KEY, &customers)?;

        // Cascade: deals, contact history, and any link-table entries
        // pointing at the deleted customer.
        let mut deals: Vec<CustomerDeal> = self.load_list(DEALS_KEY)?;
        deals.retain(|d| d.customer_id != id);
        self.save_list(DEALS_KEY, &deals)?;

        let mut contacts: Vec<CustomerContact> = self.load_list(CONTACTS_KEY)?;
        contacts.retain(|c| c.customer_id != id);
        self.save_list(CONTACTS_KEY, &contacts)?;

        for key in [PROJECT_LINKS_KEY, QUOTE_LINKS_KEY] {
            let mut links = self.load_links(key)?;
            links.retain(|_, customer| customer != id);
            self.save_links(key, &links)?;
        }

        Ok(true)
    }

    async fn get_customer_deals(
        &self,
        customer_id: &str,
    ) -> Result<Vec<CustomerDeal>, CrmError> {
        let deals: Vec<CustomerDeal> = self.load_list(DEALS_KEY)?;
        Ok(deals
            .into_iter()
            .filter(|d| d.customer_id == customer_id)
            .collect())
    }

    async fn create_deal(&self, data: NewDeal) -> Result<CustomerDeal, CrmError> {
        if !data.customer_id.starts_with(ProviderKind::Native.id_prefix()) {
            return Err(CrmError::ProviderMismatch(data.customer_id));
        }
        Self::validate_deal(data.value, data.probability)?;

        let _guard = self.write_guard.lock();
        let customers: Vec<Customer> = self.load_list(CUSTOMERS_KEY)?;
        self.require_customer(&customers, &data.customer_id)?;

        let now = Utc::now();
        let deal = CustomerDeal {
            id: Self::generate_id(),
            customer_id: data.customer_id,
            title: data.title,
            value: data.value,
            stage: data.stage,
            probability: data.probability,
            expected_close_date: data.expected_close_date,
            external_id: None,
            source: ProviderKind::Native,
            created_at: now,
            updated_at: now,
        };

        let mut deals: Vec<CustomerDeal> = self.load_list(DEALS_KEY)?;
        deals.push(deal.clone());
        self.save_list(DEALS_KEY, &deals)?;
        Ok(deal)
    }

    async fn update_deal(
        &self,
        id: &str,
        updates: DealUpdate,
    ) -> Result<CustomerDeal, CrmError> {
        if let Some(value) = updates.value {
            Self::validate_deal(value, 0)?;
        }
        if let Some(probability) = updates.probability {
            Self::validate_deal(0.0, probability)?;
        }

        let _guard = self.write_guard.lock();
        let mut deals: Vec<CustomerDeal> = self.load_list(DEALS_KEY)?;

        let deal = deals
            .iter_mut()
            .find(|d| d.id == id)
            .ok_or_else(|| CrmError::NotFound {
                entity: "deal",
                id: id.to_string(),
            })?;

        if let Some(title) = updates.title {
            deal.title = title;
        }
        if let Some(value) = updates.value {
            deal.value = value;
        }
        if let Some(stage) = updates.stage {
            deal.stage = stage;
        }
        if let Some(probability) = updates.probability {
            deal.probability = probability;
        }
        if let Some(date) = updates.expected_close_date {
            deal.expected_close_date = Some(date);
        }
        deal.updated_at = Utc::now();

        let updated = deal.clone();
        self.save_list(DEALS_KEY, &deals)?;
        Ok(updated)
    }

    async fn get_customer_contacts(
        &self,
        customer_id: &str,
    ) -> Result<Vec<CustomerContact>, CrmError> {
        let contacts: Vec<CustomerContact> = self.load_list(CONTACTS_KEY)?;
        Ok(contacts
            .into_iter()
            .filter(|c| c.customer_id == customer_id)
            .collect())
    }

    async fn add_contact(&self, data: NewContact) -> Result<CustomerContact, CrmError> {
        let _guard = self.write_guard.lock();
        let customers: Vec<Customer> = self.load_list(CUSTOMERS_KEY)?;
        self.require_customer(&customers, &data.customer_id)?;

        let contact = CustomerContact {
            id: Self::generate_id(),
            customer_id: data.customer_id,
            kind: data.kind,
            subject: data.subject,
            content: data.content,
            timestamp: Utc::now(),
            external_id: None,
        };

        let mut contacts: Vec<CustomerContact> = self.load_list(CONTACTS_KEY)?;
        contacts.push(contact.clone());
        self.save_list(CONTACTS_KEY, &contacts)?;
        Ok(contact)
    }

    /// Local validation pass: flags customers missing required fields and
    /// stamps `lastSyncAt` on the valid ones. Invalid records are reported
    /// in `errors`, never thrown, so one bad record does not abort the rest.
    async fn sync(&self) -> Result<SyncResult, CrmError> {
        self.tracker.lock().active = true;

        let outcome: Result<SyncResult, CrmError> = (|| {
            let now = Utc::now();
            let mut errors = Vec::new();
            let mut failed = 0usize;

            let _guard = self.write_guard.lock();
            let mut customers: Vec<Customer> = self.load_list(CUSTOMERS_KEY)?;

            for customer in customers.iter_mut() {
                let mut valid = true;
                if customer.name.trim().is_empty() {
                    errors.push(format!("customer {} missing required field: name", customer.id));
                    valid = false;
                }
                if customer.email.trim().is_empty() {
                    errors.push(format!(
                        "customer {} missing required field: email",
                        customer.id
                    ));
                    valid = false;
                }
                if valid {
                    customer.last_sync_at = Some(now);
                } else {
                    failed += 1;
                }
            }

            let processed = customers.len();
            self.save_list(CUSTOMERS_KEY, &customers)?;

            Ok(SyncResult {
                success: failed == 0,
                records_processed: processed,
                records_created: 0,
                records_updated: processed - failed,
                records_failed: failed,
                errors,
                timestamp: now,
            })
        })();

        match outcome {
            Ok(result) => {
                self.tracker.lock().record(result.clone());
                Ok(result)
            }
            Err(err) => {
                self.tracker.lock().active = false;
                Err(err)
            }
        }
    }

    fn last_sync_status(&self) -> SyncStatus {
        self.tracker.lock().status()
    }

    async fn link_project_to_customer(
        &self,
        project_id: &str,
        customer_id: &str,
    ) -> Result<(), CrmError> {
        self.record_link(PROJECT_LINKS_KEY, project_id, customer_id)
    }

    async fn link_quote_to_customer(
        &self,
        quote_id: &str,
        customer_id: &str,
    ) -> Result<(), CrmError> {
        self.record_link(QUOTE_LINKS_KEY, quote_id, customer_id)
    }

    async fn notify_quote_status_change(
        &self,
        quote_id: &str,
        status: &str,
        customer_id: &str,
    ) -> Result<(), CrmError> {
        self.append_note(
            customer_id,
            "Quote status update",
            &format!("Quote {} status changed to {}", quote_id, status),
        )?;
        Ok(())
    }
}
