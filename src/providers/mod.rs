pub mod hubspot;
pub mod native;
pub mod pipedrive;

use async_trait::async_trait;

use crate::error::CrmError;
use crate::types::{
    CrmConfig, Customer, CustomerContact, CustomerDeal, CustomerUpdate, DealUpdate, NewContact,
    NewCustomer, NewDeal, ProviderKind, SyncResult, SyncStatus,
};

pub use hubspot::HubSpotProvider;
pub use native::NativeProvider;
pub use pipedrive::PipedriveProvider;

/// Detects the owning provider from an entity ID's namespace prefix.
/// Unrecognized prefixes return `None`; callers fall back to the active
/// provider rather than failing.
pub fn detect_provider_from_id(id: &str) -> Option<ProviderKind> {
    ProviderKind::all()
        .into_iter()
        .find(|kind| id.starts_with(kind.id_prefix()))
}

/// Capability contract every CRM backend implements. The customer service
/// treats all backends uniformly through this trait; adding a vendor means
/// adding one implementation and one registry entry.
#[async_trait]
pub trait CrmProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Validates credentials against the backend and stores them on
    /// success. Missing required fields raise `MissingCredential`; a vendor
    /// rejection or network failure during the probe yields `Ok(false)`.
    async fn authenticate(&self, config: &CrmConfig) -> Result<bool, CrmError>;

    /// Pure status check; no I/O.
    fn is_authenticated(&self) -> bool;

    async fn get_customers(&self, limit: usize, offset: usize)
        -> Result<Vec<Customer>, CrmError>;
    async fn get_customer(&self, id: &str) -> Result<Option<Customer>, CrmError>;
    async fn create_customer(&self, data: NewCustomer) -> Result<Customer, CrmError>;
    async fn update_customer(
        &self,
        id: &str,
        updates: CustomerUpdate,
    ) -> Result<Customer, CrmError>;
    async fn delete_customer(&self, id: &str) -> Result<bool, CrmError>;

    async fn get_customer_deals(&self, customer_id: &str)
        -> Result<Vec<CustomerDeal>, CrmError>;
    async fn create_deal(&self, data: NewDeal) -> Result<CustomerDeal, CrmError>;
    async fn update_deal(&self, id: &str, updates: DealUpdate)
        -> Result<CustomerDeal, CrmError>;

    async fn get_customer_contacts(
        &self,
        customer_id: &str,
    ) -> Result<Vec<CustomerContact>, CrmError>;
    async fn add_contact(&self, data: NewContact) -> Result<CustomerContact, CrmError>;

    async fn sync(&self) -> Result<SyncResult, CrmError>;
    fn last_sync_status(&self) -> SyncStatus;

    async fn link_project_to_customer(
        &self,
        project_id: &str,
        customer_id: &str,
    ) -> Result<(), CrmError>;
    async fn link_quote_to_customer(
        &self,
        quote_id: &str,
        customer_id: &str,
    ) -> Result<(), CrmError>;
    async fn notify_quote_status_change(
        &self,
        quote_id: &str,
        status: &str,
        customer_id: &str,
    ) -> Result<(), CrmError>;
}

/// Per-provider sync bookkeeping kept behind a mutex inside each
/// implementation.
#[derive(Default)]
pub(crate) struct SyncTracker {
    pub active: bool,
    pub last_sync: Option<chrono::DateTime<chrono::Utc>>,
    pub last_result: Option<SyncResult>,
}

impl SyncTracker {
    pub fn status(&self) -> SyncStatus {
        SyncStatus {
            is_active: self.active,
            last_sync: self.last_sync,
            last_result: self.last_result.clone(),
            next_sync: None,
        }
    }

    pub fn record(&mut self, result: SyncResult) {
        self.active = false;
        self.last_sync = Some(result.timestamp);
        self.last_result = Some(result);
    }
}
