//! Integration tests for the resource manager wired to the event bus

use dxp_events::{BusConfig, Event, EventFacade, EventType};
use dxp_resources::{ResourceFilter, ResourceManager};
use serde_json::json;

#[tokio::test]
async fn test_bus_events_become_resources() {
    let events = EventFacade::new(BusConfig::default());
    let resources = ResourceManager::start_default();
    events.subscribe("*", resources.clone()).await.unwrap();

    events
        .emit_event(
            Event::new(EventType::ExportStarted, "exp-42")
                .with_data(json!({"databaseName": "epicms", "progress": 0})),
        )
        .await;
    events
        .emit_event(
            Event::new(EventType::ExportInProgress, "exp-42").with_data(json!({"progress": 55})),
        )
        .await;

    let resource = resources.read_resource("export://exp-42").await.unwrap();
    assert_eq!(resource.state["databaseName"], "epicms");
    assert_eq!(resource.state["progress"], 55);
    assert!(!resource.metadata.is_terminal);

    events
        .emit_event(Event::new(EventType::ExportSucceeded, "exp-42"))
        .await;
    let terminal = resources
        .list_resources(&ResourceFilter::new().terminal(true))
        .await;
    assert_eq!(terminal.len(), 1);

    resources.stop().await;
    events.reset().await;
}
