//! End-to-end tests for the customer service over an in-memory store.
//! Vendor providers stay unauthenticated here, so every path exercised is
//! offline: routing, config atomicity, aggregation skipping, events, and
//! the native backend.

use std::sync::Arc;

use parking_lot::Mutex;
use voltcrm::{
    ConfigPatch, ContactKind, CrmError, CustomerFilters, CustomerService, CustomerUpdate,
    DealStage, EventKind, ListOptions, MemoryStore, NewContact, NewCustomer, NewDeal,
    ProviderKind, SortDirection, SortField, SortSpec, SourceFilter,
};

async fn service() -> CustomerService {
    CustomerService::new(Arc::new(MemoryStore::default()))
        .await
        .unwrap()
}

fn new_customer(name: &str, email: &str) -> NewCustomer {
    NewCustomer {
        name: name.into(),
        email: email.into(),
        ..NewCustomer::default()
    }
}

#[tokio::test]
async fn native_customer_has_namespaced_id_and_equal_timestamps() {
    let service = service().await;
    let customer = service
        .create_customer(new_customer("Acme", "a@x.com"))
        .await
        .unwrap();

    assert!(customer.id.starts_with("native_"));
    let parts: Vec<&str> = customer.id.splitn(3, '_').collect();
    assert_eq!(parts.len(), 3);
    assert!(!parts[1].is_empty() && parts[1].chars().all(|c| c.is_ascii_digit()));
    assert!(
        !parts[2].is_empty()
            && parts[2]
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
    );
    assert_eq!(customer.source, ProviderKind::Native);
    assert_eq!(customer.created_at, customer.updated_at);

    let result = service.sync(None).await.unwrap();
    assert!(result.success);
    assert_eq!(result.records_failed, 0);
    assert_eq!(result.records_processed, 1);
}

#[tokio::test]
async fn routing_honors_id_prefix_over_active_provider() {
    let service = service().await;
    assert_eq!(service.active_provider(), ProviderKind::Native);

    // A hubspot-prefixed ID must reach the HubSpot provider, which is
    // unauthenticated here. The native provider would have answered
    // NotFound instead.
    let err = service
        .update_customer("hubspot_123", CustomerUpdate::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CrmError::NotAuthenticated(ProviderKind::Hubspot)
    ));

    let err = service
        .update_customer("pipedrive_9", CustomerUpdate::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CrmError::NotAuthenticated(ProviderKind::Pipedrive)
    ));
}

#[tokio::test]
async fn unrecognized_prefix_falls_back_to_active_provider() {
    let service = service().await;

    // Falls through to native, which treats it as a missing record.
    let err = service
        .update_customer("salesforce_1", CustomerUpdate::default())
        .await
        .unwrap_err();
    assert!(matches!(err, CrmError::NotFound { .. }));

    assert!(service.get_customer("salesforce_1").await.is_none());
}

#[tokio::test]
async fn set_config_rejects_bad_provider_switch_atomically() {
    let service = service().await;

    let err = service
        .set_config(ConfigPatch {
            provider: Some(ProviderKind::Hubspot),
            ..ConfigPatch::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, CrmError::MissingCredential { .. }));

    // The failed update must not leak any partial state.
    assert_eq!(service.get_config().provider, ProviderKind::Native);
    assert_eq!(service.active_provider(), ProviderKind::Native);
}

#[tokio::test]
async fn set_config_persists_and_emits_completion_event() {
    let store = Arc::new(MemoryStore::default());
    let service = CustomerService::new(Arc::clone(&store) as Arc<dyn voltcrm::KeyValueStore>)
        .await
        .unwrap();

    let config_updates: Arc<Mutex<Vec<serde_json::Value>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&config_updates);
    service.events().add_listener(EventKind::SyncCompleted, move |event| {
        sink.lock().push(event.payload.clone());
    });

    let updated = service
        .set_config(ConfigPatch {
            sync_enabled: Some(true),
            ..ConfigPatch::default()
        })
        .await
        .unwrap();
    assert!(updated.sync_enabled);

    let payloads = config_updates.lock();
    assert_eq!(payloads.len(), 1);
    assert_eq!(payloads[0]["configUpdated"], true);
    drop(payloads);

    // A second service over the same store sees the persisted config.
    let reloaded = CustomerService::new(store).await.unwrap();
    assert!(reloaded.get_config().sync_enabled);
}

#[tokio::test]
async fn aggregated_listing_skips_unauthenticated_vendors() {
    let service = service().await;
    service
        .create_customer(new_customer("Acme", "a@x.com"))
        .await
        .unwrap();
    service
        .create_customer(new_customer("Bolt", "b@x.com"))
        .await
        .unwrap();

    let customers = service
        .get_customers(ListOptions {
            filters: CustomerFilters {
                source: Some(SourceFilter::All),
                ..CustomerFilters::default()
            },
            ..ListOptions::default()
        })
        .await;

    assert_eq!(customers.len(), 2);
    assert!(customers.iter().all(|c| c.source == ProviderKind::Native));
}

#[tokio::test]
async fn named_unauthenticated_source_yields_empty_list() {
    let service = service().await;
    service
        .create_customer(new_customer("Acme", "a@x.com"))
        .await
        .unwrap();

    let customers = service
        .get_customers(ListOptions {
            filters: CustomerFilters {
                source: Some(SourceFilter::Provider(ProviderKind::Hubspot)),
                ..CustomerFilters::default()
            },
            ..ListOptions::default()
        })
        .await;
    assert!(customers.is_empty());
}

#[tokio::test]
async fn listing_applies_search_and_sort() {
    let service = service().await;
    service
        .create_customer(new_customer("Watt Fleet", "fleet@watt.com"))
        .await
        .unwrap();
    service
        .create_customer(new_customer("Amp Depot", "depot@amp.com"))
        .await
        .unwrap();
    service
        .create_customer(new_customer("Watt Residential", "home@watt.com"))
        .await
        .unwrap();

    let customers = service
        .get_customers(ListOptions {
            filters: CustomerFilters {
                search: Some("watt".into()),
                ..CustomerFilters::default()
            },
            sort: Some(SortSpec {
                field: SortField::Name,
                direction: SortDirection::Ascending,
            }),
            ..ListOptions::default()
        })
        .await;

    let names: Vec<&str> = customers.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, ["Watt Fleet", "Watt Residential"]);
}

#[tokio::test]
async fn create_then_update_emits_ordered_events() {
    let service = service().await;

    let log: Arc<Mutex<Vec<(EventKind, String)>>> = Arc::new(Mutex::new(Vec::new()));
    for kind in [EventKind::CustomerCreated, EventKind::CustomerUpdated] {
        let sink = Arc::clone(&log);
        service.events().add_listener(kind, move |event| {
            sink.lock().push((event.kind, event.entity_id.clone()));
        });
    }

    let customer = service
        .create_customer(new_customer("Acme", "a@x.com"))
        .await
        .unwrap();
    service
        .update_customer(
            &customer.id,
            CustomerUpdate {
                company: Some("Acme Charging".into()),
                ..CustomerUpdate::default()
            },
        )
        .await
        .unwrap();

    let events = log.lock();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0], (EventKind::CustomerCreated, customer.id.clone()));
    assert_eq!(events[1], (EventKind::CustomerUpdated, customer.id.clone()));
}

#[tokio::test]
async fn failed_mutation_suppresses_event() {
    let service = service().await;

    let count = Arc::new(Mutex::new(0u32));
    let sink = Arc::clone(&count);
    service
        .events()
        .add_listener(EventKind::CustomerUpdated, move |_| *sink.lock() += 1);

    let result = service
        .update_customer("native_1_missing", CustomerUpdate::default())
        .await;
    assert!(result.is_err());
    assert_eq!(*count.lock(), 0);
}

#[tokio::test]
async fn delete_cascades_and_emits_once() {
    let service = service().await;
    let customer = service
        .create_customer(new_customer("Acme", "a@x.com"))
        .await
        .unwrap();

    service
        .create_deal(NewDeal {
            customer_id: customer.id.clone(),
            title: "Depot install".into(),
            value: 18000.0,
            stage: DealStage::Negotiation,
            probability: 80,
            expected_close_date: None,
        })
        .await
        .unwrap();
    service
        .add_contact(NewContact {
            customer_id: customer.id.clone(),
            kind: ContactKind::Meeting,
            subject: "Site survey".into(),
            content: "Walked the depot".into(),
        })
        .await
        .unwrap();

    let deleted = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&deleted);
    service.events().add_listener(EventKind::CustomerDeleted, move |event| {
        sink.lock().push(event.entity_id.clone());
    });

    assert!(service.delete_customer(&customer.id).await.unwrap());
    assert!(service.get_customer(&customer.id).await.is_none());
    assert!(service.get_customer_deals(&customer.id).await.is_empty());
    assert!(service.get_customer_contacts(&customer.id).await.is_empty());
    assert_eq!(deleted.lock().as_slice(), [customer.id.clone()]);

    // Deleting again reports false and stays silent.
    assert!(!service.delete_customer(&customer.id).await.unwrap());
    assert_eq!(deleted.lock().len(), 1);
}

#[tokio::test]
async fn deal_and_contact_events_carry_payloads() {
    let service = service().await;
    let customer = service
        .create_customer(new_customer("Acme", "a@x.com"))
        .await
        .unwrap();

    let payloads = Arc::new(Mutex::new(Vec::new()));
    for kind in [EventKind::DealCreated, EventKind::DealUpdated, EventKind::ContactAdded] {
        let sink = Arc::clone(&payloads);
        service.events().add_listener(kind, move |event| {
            sink.lock().push(event.payload.clone());
        });
    }

    let deal = service
        .create_deal(NewDeal {
            customer_id: customer.id.clone(),
            title: "Fleet chargers".into(),
            value: 52000.0,
            stage: DealStage::Proposal,
            probability: 55,
            expected_close_date: None,
        })
        .await
        .unwrap();
    service
        .update_deal(
            &deal.id,
            voltcrm::DealUpdate {
                stage: Some(DealStage::ClosedWon),
                ..voltcrm::DealUpdate::default()
            },
        )
        .await
        .unwrap();
    service
        .add_contact(NewContact {
            customer_id: customer.id.clone(),
            kind: ContactKind::Email,
            subject: "Contract".into(),
            content: "Signed copy attached".into(),
        })
        .await
        .unwrap();

    let payloads = payloads.lock();
    assert_eq!(payloads.len(), 3);
    assert_eq!(payloads[0]["customerId"], customer.id);
    assert_eq!(payloads[0]["stage"], "proposal");
    assert_eq!(payloads[1]["stage"], "closed_won");
    assert_eq!(payloads[2]["type"], "email");
}

#[tokio::test]
async fn sync_emits_completion_with_result_payload() {
    let service = service().await;
    service
        .create_customer(new_customer("Acme", "a@x.com"))
        .await
        .unwrap();

    let payloads = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&payloads);
    service.events().add_listener(EventKind::SyncCompleted, move |event| {
        sink.lock().push((event.entity_id.clone(), event.payload.clone()));
    });

    let result = service.sync(Some(ProviderKind::Native)).await.unwrap();
    assert!(result.success);

    let payloads = payloads.lock();
    assert_eq!(payloads.len(), 1);
    assert_eq!(payloads[0].0, "native");
    assert_eq!(payloads[0].1["recordsProcessed"], 1);

    let status = service.sync_status(Some(ProviderKind::Native));
    assert!(!status.is_active);
    assert!(status.last_sync.is_some());
}

#[tokio::test]
async fn sync_status_projects_next_sync_from_frequency() {
    let service = service().await;
    service
        .set_config(ConfigPatch {
            sync_enabled: Some(true),
            sync_frequency: Some(voltcrm::SyncFrequency::Hourly),
            ..ConfigPatch::default()
        })
        .await
        .unwrap();

    service.sync(None).await.unwrap();
    let status = service.sync_status(None);
    let last = status.last_sync.unwrap();
    assert_eq!(status.next_sync.unwrap(), last + chrono::Duration::hours(1));
}

#[tokio::test]
async fn quote_hooks_record_history_on_native_customers() {
    let service = service().await;
    let customer = service
        .create_customer(new_customer("Acme", "a@x.com"))
        .await
        .unwrap();

    service
        .link_quote_to_customer("quote-12", &customer.id)
        .await
        .unwrap();
    service
        .notify_quote_status_change("quote-12", "accepted", &customer.id)
        .await
        .unwrap();

    let contacts = service.get_customer_contacts(&customer.id).await;
    assert_eq!(contacts.len(), 1);
    assert_eq!(contacts[0].kind, ContactKind::Note);
    assert!(contacts[0].content.contains("accepted"));
}

#[tokio::test]
async fn separate_services_do_not_share_events() {
    let a = service().await;
    let b = service().await;

    let count = Arc::new(Mutex::new(0u32));
    let sink = Arc::clone(&count);
    a.events()
        .add_listener(EventKind::CustomerCreated, move |_| *sink.lock() += 1);

    b.create_customer(new_customer("Bolt", "b@x.com"))
        .await
        .unwrap();
    assert_eq!(*count.lock(), 0);
}
