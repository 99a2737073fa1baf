//! Multi-provider customer/CRM integration layer: a facade over the
//! built-in record store and the HubSpot/Pipedrive vendors, with
//! ID-namespace routing, aggregated listing, sync, and event
//! notifications.

mod error;
mod events;
mod providers;
mod service;
mod store;
mod types;

pub use error::CrmError;
pub use events::{CrmEvent, EventBus, EventKind, ListenerHandle};
pub use providers::hubspot::{map_dealstage_to_stage, map_stage_to_dealstage};
pub use providers::pipedrive::{map_stage_id_to_stage, map_stage_to_stage_id};
pub use providers::{
    detect_provider_from_id, CrmProvider, HubSpotProvider, NativeProvider, PipedriveProvider,
};
pub use service::{
    CustomerFilters, CustomerService, ListOptions, SortDirection, SortField, SortSpec,
    SourceFilter,
};
pub use store::{KeyValueStore, MemoryStore, SqliteStore};
pub use types::{
    Address, ConfigPatch, ContactKind, CrmConfig, Customer, CustomerContact, CustomerDeal,
    CustomerUpdate, DealStage, DealUpdate, NewContact, NewCustomer, NewDeal, ProviderKind,
    SyncFrequency, SyncResult, SyncStatus,
};
