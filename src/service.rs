use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use parking_lot::Mutex;

use crate::error::CrmError;
use crate::events::{CrmEvent, EventBus, EventKind};
use crate::providers::{
    detect_provider_from_id, CrmProvider, HubSpotProvider, NativeProvider, PipedriveProvider,
};
use crate::store::KeyValueStore;
use crate::types::{
    ConfigPatch, CrmConfig, Customer, CustomerContact, CustomerDeal, CustomerUpdate, DealUpdate,
    NewContact, NewCustomer, NewDeal, ProviderKind, SyncFrequency, SyncResult, SyncStatus,
};

const CONFIG_KEY: &str = "customerServiceConfig";
const DEFAULT_PAGE_SIZE: usize = 100;

/// Which backends a customer listing should query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFilter {
    All,
    Provider(ProviderKind),
}

#[derive(Debug, Clone, Default)]
pub struct CustomerFilters {
    /// Case-insensitive substring match on name, email, or company.
    pub search: Option<String>,
    /// Customers matching any of these tags pass the filter.
    pub tags: Vec<String>,
    pub source: Option<SourceFilter>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortField {
    Name,
    Company,
    CreatedAt,
    UpdatedAt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, Copy)]
pub struct SortSpec {
    pub field: SortField,
    pub direction: SortDirection,
}

#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub filters: CustomerFilters,
    pub sort: Option<SortSpec>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// Facade unifying the native record store and the external CRM vendors.
/// Routes every operation to the owning provider by ID namespace, falls
/// back to the active provider, and emits an event after each successful
/// mutation.
pub struct CustomerService {
    providers: HashMap<ProviderKind, Arc<dyn CrmProvider>>,
    config: Mutex<CrmConfig>,
    store: Arc<dyn KeyValueStore>,
    events: EventBus,
}

impl CustomerService {
    /// Loads the persisted configuration (defaulting to the native
    /// provider with sync disabled), builds the provider registry, and
    /// best-effort re-authenticates a persisted vendor provider.
    pub async fn new(store: Arc<dyn KeyValueStore>) -> Result<Self, CrmError> {
        let config = match store.get(CONFIG_KEY)? {
            Some(raw) => serde_json::from_str(&raw).unwrap_or_else(|err| {
                log::warn!("discarding unreadable persisted config: {}", err);
                CrmConfig::default()
            }),
            None => CrmConfig::default(),
        };

        let mut providers: HashMap<ProviderKind, Arc<dyn CrmProvider>> = HashMap::new();
        providers.insert(
            ProviderKind::Native,
            Arc::new(NativeProvider::new(Arc::clone(&store))),
        );
        providers.insert(ProviderKind::Hubspot, Arc::new(HubSpotProvider::new()));
        providers.insert(ProviderKind::Pipedrive, Arc::new(PipedriveProvider::new()));

        let service = Self {
            providers,
            config: Mutex::new(config.clone()),
            store,
            events: EventBus::new(),
        };

        if config.provider != ProviderKind::Native && config.api_key.is_some() {
            match service.provider(config.provider).authenticate(&config).await {
                Ok(true) => log::info!("restored {} session", config.provider),
                Ok(false) => log::warn!("stored {} credentials were rejected", config.provider),
                Err(err) => log::warn!("could not restore {} session: {}", config.provider, err),
            }
        }

        Ok(service)
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn get_config(&self) -> CrmConfig {
        self.config.lock().clone()
    }

    pub fn active_provider(&self) -> ProviderKind {
        self.config.lock().provider
    }

    fn provider(&self, kind: ProviderKind) -> Arc<dyn CrmProvider> {
        // The registry is populated for every ProviderKind at construction.
        Arc::clone(&self.providers[&kind])
    }

    fn active(&self) -> Arc<dyn CrmProvider> {
        self.provider(self.active_provider())
    }

    /// Resolves the owning provider from the ID's namespace prefix,
    /// falling back to the active provider for unrecognized prefixes.
    fn route(&self, id: &str) -> Arc<dyn CrmProvider> {
        match detect_provider_from_id(id) {
            Some(kind) => self.provider(kind),
            None => self.active(),
        }
    }

    fn emit(
        &self,
        kind: EventKind,
        entity_id: &str,
        payload: serde_json::Value,
        source: ProviderKind,
    ) {
        self.events.emit(&CrmEvent {
            kind,
            entity_id: entity_id.to_string(),
            payload,
            timestamp: Utc::now(),
            source,
        });
    }

    /// Applies a partial configuration update atomically. When the target
    /// provider or its credentials change, the new provider must
    /// authenticate with the merged configuration before anything is
    /// swapped; any failure leaves the prior configuration active.
    pub async fn set_config(&self, patch: ConfigPatch) -> Result<CrmConfig, CrmError> {
        let current = self.get_config();
        let merged = current.merged(patch);

        let provider_changed = merged.provider != current.provider;
        let credentials_changed =
            merged.api_key != current.api_key || merged.domain != current.domain;

        if provider_changed || credentials_changed {
            let target = self.provider(merged.provider);
            if !target.authenticate(&merged).await? {
                return Err(CrmError::AuthenticationFailed(merged.provider));
            }
        }

        *self.config.lock() = merged.clone();
        self.store
            .set(CONFIG_KEY, &serde_json::to_string(&merged)?)?;

        self.emit(
            EventKind::SyncCompleted,
            merged.provider.as_str(),
            serde_json::json!({ "configUpdated": true }),
            merged.provider,
        );
        Ok(merged)
    }

    // ─── Customers ───────────────────────────────────────────────────────

    /// Lists customers. `source: All` fans out to every registered
    /// provider concurrently, skipping unauthenticated vendors; a named
    /// non-active source queries only that provider. Filtering and sorting
    /// run client-side regardless of source. Provider failures degrade to
    /// an empty contribution and a log line.
    pub async fn get_customers(&self, options: ListOptions) -> Vec<Customer> {
        let limit = options.limit.unwrap_or(DEFAULT_PAGE_SIZE);
        let offset = options.offset.unwrap_or(0);
        let active = self.active_provider();

        let targets: Vec<ProviderKind> = match options.filters.source {
            Some(SourceFilter::All) => ProviderKind::all()
                .into_iter()
                .filter(|kind| {
                    *kind == ProviderKind::Native || self.provider(*kind).is_authenticated()
                })
                .collect(),
            Some(SourceFilter::Provider(kind)) if kind != active => {
                if kind != ProviderKind::Native && !self.provider(kind).is_authenticated() {
                    log::debug!("skipping unauthenticated source {}", kind);
                    Vec::new()
                } else {
                    vec![kind]
                }
            }
            _ => vec![active],
        };

        let fetches = targets.into_iter().map(|kind| {
            let provider = self.provider(kind);
            async move { (kind, provider.get_customers(limit, offset).await) }
        });

        let mut customers = Vec::new();
        for (kind, result) in join_all(fetches).await {
            match result {
                Ok(batch) => customers.extend(batch),
                Err(err) => log::warn!("listing {} customers failed: {}", kind, err),
            }
        }

        apply_filters(&mut customers, &options.filters);
        if let Some(sort) = options.sort {
            apply_sort(&mut customers, sort);
        }
        customers
    }

    pub async fn get_customer(&self, id: &str) -> Option<Customer> {
        match self.route(id).get_customer(id).await {
            Ok(customer) => customer,
            Err(err) => {
                log::warn!("fetching customer {} failed: {}", id, err);
                None
            }
        }
    }

    pub async fn create_customer(&self, data: NewCustomer) -> Result<Customer, CrmError> {
        let customer = self.active().create_customer(data).await?;
        self.emit(
            EventKind::CustomerCreated,
            &customer.id,
            serde_json::to_value(&customer)?,
            customer.source,
        );
        Ok(customer)
    }

    pub async fn update_customer(
        &self,
        id: &str,
        updates: CustomerUpdate,
    ) -> Result<Customer, CrmError> {
        let customer = self.route(id).update_customer(id, updates).await?;
        self.emit(
            EventKind::CustomerUpdated,
            &customer.id,
            serde_json::to_value(&customer)?,
            customer.source,
        );
        Ok(customer)
    }

    pub async fn delete_customer(&self, id: &str) -> Result<bool, CrmError> {
        let provider = self.route(id);
        let deleted = provider.delete_customer(id).await?;
        if deleted {
            self.emit(
                EventKind::CustomerDeleted,
                id,
                serde_json::json!({ "id": id }),
                provider.kind(),
            );
        }
        Ok(deleted)
    }

    // ─── Deals ───────────────────────────────────────────────────────────

    pub async fn get_customer_deals(&self, customer_id: &str) -> Vec<CustomerDeal> {
        match self.route(customer_id).get_customer_deals(customer_id).await {
            Ok(deals) => deals,
            Err(err) => {
                log::warn!("listing deals for {} failed: {}", customer_id, err);
                Vec::new()
            }
        }
    }

    /// Routed by the owning customer's namespace so a deal can never land
    /// on a provider that does not own its customer.
    pub async fn create_deal(&self, data: NewDeal) -> Result<CustomerDeal, CrmError> {
        let deal = self.route(&data.customer_id).create_deal(data).await?;
        self.emit(
            EventKind::DealCreated,
            &deal.id,
            serde_json::to_value(&deal)?,
            deal.source,
        );
        Ok(deal)
    }

    pub async fn update_deal(
        &self,
        id: &str,
        updates: DealUpdate,
    ) -> Result<CustomerDeal, CrmError> {
        let deal = self.route(id).update_deal(id, updates).await?;
        self.emit(
            EventKind::DealUpdated,
            &deal.id,
            serde_json::to_value(&deal)?,
            deal.source,
        );
        Ok(deal)
    }

    // ─── Contacts ────────────────────────────────────────────────────────

    pub async fn get_customer_contacts(&self, customer_id: &str) -> Vec<CustomerContact> {
        match self
            .route(customer_id)
            .get_customer_contacts(customer_id)
            .await
        {
            Ok(contacts) => contacts,
            Err(err) => {
                log::warn!("listing contacts for {} failed: {}", customer_id, err);
                Vec::new()
            }
        }
    }

    pub async fn add_contact(&self, data: NewContact) -> Result<CustomerContact, CrmError> {
        let provider = self.route(&data.customer_id);
        let contact = provider.add_contact(data).await?;
        self.emit(
            EventKind::ContactAdded,
            &contact.id,
            serde_json::to_value(&contact)?,
            provider.kind(),
        );
        Ok(contact)
    }

    // ─── Host application hooks ──────────────────────────────────────────

    pub async fn link_project_to_customer(
        &self,
        project_id: &str,
        customer_id: &str,
    ) -> Result<(), CrmError> {
        self.route(customer_id)
            .link_project_to_customer(project_id, customer_id)
            .await
    }

    pub async fn link_quote_to_customer(
        &self,
        quote_id: &str,
        customer_id: &str,
    ) -> Result<(), CrmError> {
        self.route(customer_id)
            .link_quote_to_customer(quote_id, customer_id)
            .await
    }

    pub async fn notify_quote_status_change(
        &self,
        quote_id: &str,
        status: &str,
        customer_id: &str,
    ) -> Result<(), CrmError> {
        self.route(customer_id)
            .notify_quote_status_change(quote_id, status, customer_id)
            .await
    }

    // ─── Sync ────────────────────────────────────────────────────────────

    /// Runs one provider's sync: the named provider, or the active one.
    /// Cross-provider aggregation is deliberately left to the caller.
    pub async fn sync(&self, provider: Option<ProviderKind>) -> Result<SyncResult, CrmError> {
        let kind = provider.unwrap_or_else(|| self.active_provider());
        let result = self.provider(kind).sync().await?;
        self.emit(
            EventKind::SyncCompleted,
            kind.as_str(),
            serde_json::to_value(&result)?,
            kind,
        );
        Ok(result)
    }

    pub fn sync_status(&self, provider: Option<ProviderKind>) -> SyncStatus {
        let kind = provider.unwrap_or_else(|| self.active_provider());
        let mut status = self.provider(kind).last_sync_status();

        let config = self.get_config();
        if config.sync_enabled {
            status.next_sync = match (config.sync_frequency, status.last_sync) {
                (SyncFrequency::Hourly, Some(last)) => Some(last + Duration::hours(1)),
                (SyncFrequency::Daily, Some(last)) => Some(last + Duration::days(1)),
                _ => None,
            };
        }
        status
    }
}

fn apply_filters(customers: &mut Vec<Customer>, filters: &CustomerFilters) {
    if let Some(search) = filters.search.as_deref() {
        let needle = search.to_lowercase();
        customers.retain(|c| {
            c.name.to_lowercase().contains(&needle)
                || c.email.to_lowercase().contains(&needle)
                || c.company
                    .as_deref()
                    .map(|company| company.to_lowercase().contains(&needle))
                    .unwrap_or(false)
        });
    }

    if !filters.tags.is_empty() {
        customers.retain(|c| c.tags.iter().any(|tag| filters.tags.contains(tag)));
    }

    if let Some(after) = filters.created_after {
        customers.retain(|c| c.created_at >= after);
    }
    if let Some(before) = filters.created_before {
        customers.retain(|c| c.created_at <= before);
    }
}

fn apply_sort(customers: &mut [Customer], sort: SortSpec) {
    customers.sort_by(|a, b| {
        let ordering = match sort.field {
            SortField::Name => a.name.to_lowercase().cmp(&b.name.to_lowercase()),
            SortField::Company => a
                .company
                .as_deref()
                .unwrap_or("")
                .to_lowercase()
                .cmp(&b.company.as_deref().unwrap_or("").to_lowercase()),
            SortField::CreatedAt => a.created_at.cmp(&b.created_at),
            SortField::UpdatedAt => a.updated_at.cmp(&b.updated_at),
        };
        match sort.direction {
            SortDirection::Ascending => ordering,
            SortDirection::Descending => ordering.reverse(),
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Address;
    use std::collections::HashMap as StdHashMap;

    fn customer(name: &str, email: &str, company: Option<&str>, tags: &[&str]) -> Customer {
        let now = Utc::now();
        Customer {
            id: format!("native_1_{}", name.to_lowercase()),
            external_id: None,
            name: name.into(),
            email: email.into(),
            phone: None,
            company: company.map(str::to_string),
            address: None::<Address>,
            tags: tags.iter().map(|t| t.to_string()).collect(),
            custom_fields: StdHashMap::new(),
            source: ProviderKind::Native,
            created_at: now,
            updated_at: now,
            last_sync_at: None,
        }
    }

    #[test]
    fn search_filter_matches_name_email_and_company() {
        let mut customers = vec![
            customer("Acme Fleet", "ops@acme.com", Some("Acme"), &[]),
            customer("Bolt Cabs", "hello@bolt.example", None, &[]),
            customer("Grid Co", "grid@example.com", Some("ACME Holdings"), &[]),
        ];
        apply_filters(
            &mut customers,
            &CustomerFilters {
                search: Some("acme".into()),
                ..CustomerFilters::default()
            },
        );
        assert_eq!(customers.len(), 2);
    }

    #[test]
    fn tag_filter_matches_any_shared_tag() {
        let mut customers = vec![
            customer("A", "a@x.com", None, &["fleet", "vip"]),
            customer("B", "b@x.com", None, &["residential"]),
            customer("C", "c@x.com", None, &[]),
        ];
        apply_filters(
            &mut customers,
            &CustomerFilters {
                tags: vec!["vip".into(), "commercial".into()],
                ..CustomerFilters::default()
            },
        );
        assert_eq!(customers.len(), 1);
        assert_eq!(customers[0].name, "A");
    }

    #[test]
    fn sort_by_name_descending() {
        let mut customers = vec![
            customer("alpha", "a@x.com", None, &[]),
            customer("Charlie", "c@x.com", None, &[]),
            customer("bravo", "b@x.com", None, &[]),
        ];
        apply_sort(
            &mut customers,
            SortSpec {
                field: SortField::Name,
                direction: SortDirection::Descending,
            },
        );
        let names: Vec<&str> = customers.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["Charlie", "bravo", "alpha"]);
    }

    #[test]
    fn created_at_bounds_filter() {
        let mut early = customer("Early", "e@x.com", None, &[]);
        early.created_at = Utc::now() - Duration::days(10);
        let late = customer("Late", "l@x.com", None, &[]);

        let mut customers = vec![early, late];
        apply_filters(
            &mut customers,
            &CustomerFilters {
                created_after: Some(Utc::now() - Duration::days(1)),
                ..CustomerFilters::default()
            },
        );
        assert_eq!(customers.len(), 1);
        assert_eq!(customers[0].name, "Late");
    }
}
